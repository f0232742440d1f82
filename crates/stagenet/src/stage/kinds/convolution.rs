//! 2-D convolution lowered to im2col + GEMM, with the batch processed in parallel.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::description::StageSpec;
use crate::error::{ensure_graph, ensure_shape, NetError, NetResult};
use crate::filler::FillerSpec;
use crate::stage::im2col::{col2im, im2col, Window};
use crate::stage::math::gemm;
use crate::stage::{Arity, Propagation, SetupContext, Stage};
use crate::tensor::{FloatElement, Shape, Tensor};

pub const KIND: &str = "Convolution";

fn default_true() -> bool {
    true
}

fn default_one() -> usize {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvolutionConfig {
    pub num_output: usize,
    #[serde(default = "default_true")]
    pub bias_term: bool,
    /// Square kernel; overridden per axis by `kernel_h` / `kernel_w`.
    #[serde(default)]
    pub kernel_size: Option<usize>,
    #[serde(default)]
    pub kernel_h: Option<usize>,
    #[serde(default)]
    pub kernel_w: Option<usize>,
    #[serde(default)]
    pub pad: usize,
    #[serde(default)]
    pub pad_h: Option<usize>,
    #[serde(default)]
    pub pad_w: Option<usize>,
    #[serde(default = "default_one")]
    pub stride: usize,
    #[serde(default)]
    pub stride_h: Option<usize>,
    #[serde(default)]
    pub stride_w: Option<usize>,
    #[serde(default = "default_one")]
    pub group: usize,
    #[serde(default)]
    pub weight_filler: FillerSpec,
    #[serde(default)]
    pub bias_filler: FillerSpec,
}

pub fn build<T: FloatElement>(spec: &StageSpec) -> NetResult<Box<dyn Stage<T>>> {
    let config: ConvolutionConfig = spec.decode_config()?;
    let name = spec.name.as_str();
    let kernel_h = config.kernel_h.or(config.kernel_size);
    let kernel_w = config.kernel_w.or(config.kernel_size);
    let (Some(kernel_h), Some(kernel_w)) = (kernel_h, kernel_w) else {
        return Err(NetError::graph(
            name,
            "kernel_size or kernel_h and kernel_w are required",
        ));
    };
    ensure_graph!(kernel_h > 0 && kernel_w > 0, name, "kernel dimensions must be positive");
    let stride_h = config.stride_h.unwrap_or(config.stride);
    let stride_w = config.stride_w.unwrap_or(config.stride);
    ensure_graph!(stride_h > 0 && stride_w > 0, name, "stride must be positive");
    ensure_graph!(config.num_output > 0, name, "num_output must be positive");
    ensure_graph!(config.group > 0, name, "group must be positive");
    ensure_graph!(
        config.num_output % config.group == 0,
        name,
        "num_output {} is not divisible by group {}",
        config.num_output,
        config.group
    );
    let window = Window {
        channels: 0,
        height: 0,
        width: 0,
        kernel_h,
        kernel_w,
        pad_h: config.pad_h.unwrap_or(config.pad),
        pad_w: config.pad_w.unwrap_or(config.pad),
        stride_h,
        stride_w,
    };
    Ok(Box::new(Convolution {
        name: spec.name.clone(),
        config,
        window,
        params: Vec::new(),
        num: 0,
    }))
}

pub struct Convolution<T: FloatElement> {
    name: String,
    config: ConvolutionConfig,
    window: Window,
    params: Vec<Tensor<T>>,
    num: usize,
}

/// Per-group strides into the weight, column and output buffers.
#[derive(Clone, Copy)]
struct GroupLayout {
    groups: usize,
    out_per_group: usize,
    kdim: usize,
    spatial: usize,
}

impl GroupLayout {
    fn weight_offset(&self) -> usize {
        self.out_per_group * self.kdim
    }

    fn col_offset(&self) -> usize {
        self.kdim * self.spatial
    }

    fn out_offset(&self) -> usize {
        self.out_per_group * self.spatial
    }
}

impl<T: FloatElement> Convolution<T> {
    fn layout(&self) -> GroupLayout {
        let groups = self.config.group;
        let win = &self.window;
        GroupLayout {
            groups,
            out_per_group: self.config.num_output / groups,
            kdim: win.col_rows() / groups,
            spatial: win.out_height() * win.out_width(),
        }
    }

    fn image_len(&self) -> usize {
        self.window.channels * self.window.height * self.window.width
    }

    fn output_len(&self) -> usize {
        self.config.num_output * self.layout().spatial
    }
}

impl<T: FloatElement> Stage<T> for Convolution<T> {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn input_arity(&self) -> Arity {
        Arity::at_least(1)
    }

    fn output_arity(&self) -> Arity {
        Arity::at_least(1)
    }

    fn setup(&mut self, inputs: &[Shape], ctx: &mut SetupContext<'_, T>) -> NetResult<()> {
        let input = &inputs[0];
        ensure_shape!(
            input.rank() == 4,
            "{}: convolution input must be num x channels x height x width, got {:?}",
            self.name,
            input
        );
        let channels = input.dims()[1];
        ensure_shape!(channels > 0, "{}: convolution input has no channels", self.name);
        ensure_shape!(
            channels % self.config.group == 0,
            "{}: {} channels are not divisible by group {}",
            self.name,
            channels,
            self.config.group
        );
        let weight_dims = [
            self.config.num_output,
            channels / self.config.group,
            self.window.kernel_h,
            self.window.kernel_w,
        ];
        self.params = vec![ctx.param(&weight_dims, &self.config.weight_filler)?];
        if self.config.bias_term {
            let bias = ctx.param(&[self.config.num_output], &self.config.bias_filler)?;
            self.params.push(bias);
        }
        self.window.channels = channels;
        Ok(())
    }

    fn configure(&mut self, inputs: &[Shape], num_outputs: usize) -> NetResult<Vec<Shape>> {
        ensure_shape!(
            num_outputs == inputs.len(),
            "{}: convolution needs one output per input ({} inputs, {} outputs)",
            self.name,
            inputs.len(),
            num_outputs
        );
        let first = &inputs[0];
        ensure_shape!(
            first.rank() == 4 && first.dims()[1] == self.window.channels,
            "{}: input {:?} does not match the {} channels the weights were built for",
            self.name,
            first,
            self.window.channels
        );
        for other in &inputs[1..] {
            ensure_shape!(
                other == first,
                "{}: all inputs must share one shape, got {:?} and {:?}",
                self.name,
                first,
                other
            );
        }
        let dims = first.dims();
        ensure_shape!(
            dims[2] > 0 && dims[3] > 0,
            "{}: convolution input {:?} has an empty image plane",
            self.name,
            first
        );
        self.num = dims[0];
        self.window.height = dims[2];
        self.window.width = dims[3];
        ensure_shape!(
            dims[2] + 2 * self.window.pad_h >= self.window.kernel_h
                && dims[3] + 2 * self.window.pad_w >= self.window.kernel_w,
            "{}: kernel {}x{} does not fit the padded {}x{} input",
            self.name,
            self.window.kernel_h,
            self.window.kernel_w,
            dims[2],
            dims[3]
        );
        let (out_h, out_w) = (self.window.out_height(), self.window.out_width());
        ensure_shape!(
            out_h > 0 && out_w > 0,
            "{}: {}x{} input produces an empty output",
            self.name,
            dims[2],
            dims[3]
        );
        let out = Shape::new([self.num, self.config.num_output, out_h, out_w])?;
        Ok(vec![out; num_outputs])
    }

    fn forward_host(&mut self, inputs: &[&Tensor<T>], outputs: &[&Tensor<T>]) -> NetResult<()> {
        let win = self.window;
        let layout = self.layout();
        let (image_len, output_len) = (self.image_len(), self.output_len());
        let weight = self.params[0].values()?;
        let bias = match self.params.get(1) {
            Some(b) => Some(b.values()?),
            None => None,
        };
        let w: &[T] = &weight;
        let b: Option<&[T]> = bias.as_deref();
        for (input, output) in inputs.iter().zip(outputs) {
            let x = input.values()?;
            let mut y = output.values_mut()?;
            let x: &[T] = &x;
            y.par_chunks_mut(output_len)
                .zip(x.par_chunks(image_len))
                .for_each(|(y_n, x_n)| {
                    let mut col = vec![T::zero(); win.col_len()];
                    im2col(&win, x_n, &mut col);
                    for g in 0..layout.groups {
                        gemm(
                            false,
                            false,
                            layout.out_per_group,
                            layout.spatial,
                            layout.kdim,
                            T::one(),
                            &w[g * layout.weight_offset()..],
                            &col[g * layout.col_offset()..],
                            T::zero(),
                            &mut y_n[g * layout.out_offset()..],
                        );
                    }
                    if let Some(b) = b {
                        for (plane, &bv) in y_n.chunks_exact_mut(layout.spatial).zip(b) {
                            for v in plane {
                                *v += bv;
                            }
                        }
                    }
                });
        }
        Ok(())
    }

    fn backward_host(
        &mut self,
        outputs: &[&Tensor<T>],
        propagate: &Propagation<'_>,
        inputs: &[&Tensor<T>],
    ) -> NetResult<()> {
        let win = self.window;
        let layout = self.layout();
        let (image_len, output_len) = (self.image_len(), self.output_len());
        for (i, (output, input)) in outputs.iter().zip(inputs).enumerate() {
            let dy = output.grads()?;
            let dy: &[T] = &dy;

            if self.params.len() > 1 && propagate.param(1) {
                let mut db = self.params[1].grads_mut()?;
                for dy_n in dy.chunks_exact(output_len) {
                    for (acc, plane) in db.iter_mut().zip(dy_n.chunks_exact(layout.spatial)) {
                        *acc += plane.iter().fold(T::zero(), |s, &v| s + v);
                    }
                }
            }

            if propagate.param(0) {
                let x = input.values()?;
                let x: &[T] = &x;
                let weight_len = self.params[0].count();
                let partial = dy
                    .par_chunks(output_len)
                    .zip(x.par_chunks(image_len))
                    .map(|(dy_n, x_n)| {
                        let mut col = vec![T::zero(); win.col_len()];
                        im2col(&win, x_n, &mut col);
                        let mut dw = vec![T::zero(); weight_len];
                        for g in 0..layout.groups {
                            gemm(
                                false,
                                true,
                                layout.out_per_group,
                                layout.kdim,
                                layout.spatial,
                                T::one(),
                                &dy_n[g * layout.out_offset()..],
                                &col[g * layout.col_offset()..],
                                T::one(),
                                &mut dw[g * layout.weight_offset()..],
                            );
                        }
                        dw
                    })
                    .reduce(
                        || vec![T::zero(); weight_len],
                        |mut a, b| {
                            for (a, b) in a.iter_mut().zip(b) {
                                *a += b;
                            }
                            a
                        },
                    );
                let mut dw = self.params[0].grads_mut()?;
                for (acc, g) in dw.iter_mut().zip(partial) {
                    *acc += g;
                }
            }

            if propagate.input(i) {
                let weight = self.params[0].values()?;
                let w: &[T] = &weight;
                let mut dx = input.grads_mut()?;
                dx.par_chunks_mut(image_len)
                    .zip(dy.par_chunks(output_len))
                    .for_each(|(dx_n, dy_n)| {
                        let mut col = vec![T::zero(); win.col_len()];
                        for g in 0..layout.groups {
                            gemm(
                                true,
                                false,
                                layout.kdim,
                                layout.spatial,
                                layout.out_per_group,
                                T::one(),
                                &w[g * layout.weight_offset()..],
                                &dy_n[g * layout.out_offset()..],
                                T::zero(),
                                &mut col[g * layout.col_offset()..],
                            );
                        }
                        col2im(&win, &col, dx_n);
                    });
            }
        }
        Ok(())
    }

    fn params(&self) -> &[Tensor<T>] {
        &self.params
    }

    fn params_mut(&mut self) -> &mut [Tensor<T>] {
        &mut self.params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExecutionContext;
    use serde_json::json;

    #[test]
    fn single_channel_box_filter() {
        let spec = StageSpec::new("conv", KIND).with_config(json!({
            "num_output": 1,
            "kernel_size": 2,
            "bias_term": false,
            "weight_filler": {"type": "constant", "value": 1.0}
        }));
        let mut stage = build::<f64>(&spec).unwrap();
        let exec = ExecutionContext::<f64>::default();
        let mut ctx = SetupContext::new(&exec, 0);
        let in_shape = Shape::new([2, 1, 3, 3]).unwrap();
        stage.setup(&[in_shape.clone()], &mut ctx).unwrap();
        let out_shapes = stage.configure(&[in_shape.clone()], 1).unwrap();
        assert_eq!(out_shapes[0].dims(), &[2, 1, 2, 2]);

        let x = Tensor::<f64>::new(None);
        x.reshape_to(&in_shape).unwrap();
        let values: Vec<f64> = (0..18).map(|v| (v % 9 + 1) as f64).collect();
        x.set_values(&values).unwrap();
        let y = Tensor::<f64>::new(None);
        y.reshape_to(&out_shapes[0]).unwrap();
        stage.forward_host(&[&x], &[&y]).unwrap();
        assert_eq!(&y.values().unwrap()[..4], &[12.0, 16.0, 24.0, 28.0]);
        assert_eq!(&y.values().unwrap()[4..], &[12.0, 16.0, 24.0, 28.0]);

        y.grads_mut().unwrap().fill(1.0);
        let propagate = Propagation::new(&[true], &[true]);
        stage.backward_host(&[&y], &propagate, &[&x]).unwrap();
        // each weight tap sees the sum of the pixels it covered, over both images
        let dw = stage.params()[0].grads().unwrap().to_vec();
        assert_eq!(dw, vec![24.0, 32.0, 48.0, 56.0]);
        assert_eq!(
            &x.grads().unwrap()[..9],
            &[1.0, 2.0, 1.0, 2.0, 4.0, 2.0, 1.0, 2.0, 1.0]
        );
    }

    #[test]
    fn empty_images_are_rejected_before_running() {
        let spec = StageSpec::new("conv", KIND).with_config(json!({
            "num_output": 2,
            "kernel_size": 3
        }));
        let exec = ExecutionContext::<f32>::default();

        let mut stage = build::<f32>(&spec).unwrap();
        let no_channels = Shape::new([1, 0, 4, 4]).unwrap();
        let mut ctx = SetupContext::new(&exec, 0);
        assert!(matches!(
            stage.setup(&[no_channels], &mut ctx),
            Err(NetError::Shape(_))
        ));

        let mut stage = build::<f32>(&spec).unwrap();
        let mut ctx = SetupContext::new(&exec, 0);
        stage.setup(&[Shape::new([1, 1, 4, 4]).unwrap()], &mut ctx).unwrap();
        for dims in [[1, 1, 0, 4], [1, 1, 4, 0], [1, 1, 2, 4]] {
            let shape = Shape::new(dims).unwrap();
            assert!(
                matches!(stage.configure(&[shape], 1), Err(NetError::Shape(_))),
                "{dims:?}"
            );
        }
        let out = stage.configure(&[Shape::new([0, 1, 3, 3]).unwrap()], 1).unwrap();
        assert_eq!(out[0].dims(), &[0, 2, 1, 1]);
    }
}
