//! Patch unrolling for convolution-as-matrix-multiply.

use crate::tensor::FloatElement;

/// Spatial geometry of a 2-D sliding window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Window {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    pub kernel_h: usize,
    pub kernel_w: usize,
    pub pad_h: usize,
    pub pad_w: usize,
    pub stride_h: usize,
    pub stride_w: usize,
}

impl Window {
    pub fn out_height(&self) -> usize {
        (self.height + 2 * self.pad_h - self.kernel_h) / self.stride_h + 1
    }

    pub fn out_width(&self) -> usize {
        (self.width + 2 * self.pad_w - self.kernel_w) / self.stride_w + 1
    }

    /// Rows of the column buffer.
    pub fn col_rows(&self) -> usize {
        self.channels * self.kernel_h * self.kernel_w
    }

    pub fn col_len(&self) -> usize {
        self.col_rows() * self.out_height() * self.out_width()
    }

    /// Source pixel for column row `c` at output position `(h, w)`, if inside the image.
    fn source(&self, c: usize, h: usize, w: usize) -> Option<usize> {
        let w_offset = c % self.kernel_w;
        let h_offset = (c / self.kernel_w) % self.kernel_h;
        let c_im = c / self.kernel_h / self.kernel_w;
        let h_pad = (h * self.stride_h + h_offset).checked_sub(self.pad_h)?;
        let w_pad = (w * self.stride_w + w_offset).checked_sub(self.pad_w)?;
        if h_pad < self.height && w_pad < self.width {
            Some((c_im * self.height + h_pad) * self.width + w_pad)
        } else {
            None
        }
    }
}

/// Unrolls one image (`channels x height x width`) into `col_rows x (out_h * out_w)`.
pub(crate) fn im2col<T: FloatElement>(win: &Window, image: &[T], col: &mut [T]) {
    let (out_h, out_w) = (win.out_height(), win.out_width());
    for c in 0..win.col_rows() {
        for h in 0..out_h {
            for w in 0..out_w {
                col[(c * out_h + h) * out_w + w] = match win.source(c, h, w) {
                    Some(idx) => image[idx],
                    None => T::zero(),
                };
            }
        }
    }
}

/// Folds a column buffer back into an image, summing overlapping patches. `image` is
/// overwritten.
pub(crate) fn col2im<T: FloatElement>(win: &Window, col: &[T], image: &mut [T]) {
    image.fill(T::zero());
    let (out_h, out_w) = (win.out_height(), win.out_width());
    for c in 0..win.col_rows() {
        for h in 0..out_h {
            for w in 0..out_w {
                if let Some(idx) = win.source(c, h, w) {
                    image[idx] += col[(c * out_h + h) * out_w + w];
                }
            }
        }
    }
}
