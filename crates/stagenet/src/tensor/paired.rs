use std::cell::{Ref, RefCell, RefMut};
use std::fmt;
use std::rc::Rc;

use crate::device::{DeviceAllocation, DeviceRef};
use crate::error::{ensure_shape, NetError, NetResult};
use crate::tensor::{BufferHead, Element, Shape, SyncedBuffer};

/// Reference-counted buffer handle. Two tensors holding the same handle alias storage.
pub(crate) type SharedBuffer<T> = Rc<RefCell<SyncedBuffer<T>>>;

/// Resizable n-d array with paired value and gradient storage.
///
/// Every accessor takes `&self`: graphs hand stages plain shared references to their input
/// and output tensors, and the same tensor may appear on both sides of an in-place stage.
/// Buffer views are `Ref`/`RefMut` guards and must be dropped before the same buffer is
/// requested mutably again.
pub struct Tensor<T: Element> {
    shape: RefCell<Shape>,
    values: SharedBuffer<T>,
    grads: SharedBuffer<T>,
}

impl<T: Element> Tensor<T> {
    /// Creates an empty (rank-1, zero-length) tensor without any storage.
    pub fn new(device: Option<DeviceRef<T>>) -> Self {
        Tensor {
            shape: RefCell::new(Shape::empty()),
            values: Rc::new(RefCell::new(SyncedBuffer::new(device.clone()))),
            grads: Rc::new(RefCell::new(SyncedBuffer::new(device))),
        }
    }

    pub fn with_shape(dims: &[usize], device: Option<DeviceRef<T>>) -> NetResult<Self> {
        let tensor = Tensor::new(device);
        tensor.reshape(dims)?;
        Ok(tensor)
    }

    pub fn shape(&self) -> Shape {
        self.shape.borrow().clone()
    }

    pub fn rank(&self) -> usize {
        self.shape.borrow().rank()
    }

    pub fn count(&self) -> usize {
        self.shape.borrow().num_elements()
    }

    pub fn count_range(&self, start: usize, end: usize) -> NetResult<usize> {
        self.shape.borrow().count_range(start, end)
    }

    pub fn count_from(&self, start: usize) -> NetResult<usize> {
        self.shape.borrow().count_from(start)
    }

    pub fn canonical_axis(&self, axis: i64) -> NetResult<usize> {
        self.shape.borrow().canonical_axis(axis)
    }

    pub fn dim(&self, axis: i64) -> NetResult<usize> {
        self.shape.borrow().dim(axis)
    }

    /// Elements the backing storage can hold without reallocating.
    pub fn capacity(&self) -> usize {
        self.values
            .try_borrow()
            .map(|b| b.capacity())
            .unwrap_or_else(|_| self.count())
    }

    pub fn has_device(&self) -> bool {
        self.values.try_borrow().is_ok_and(|b| b.has_device())
    }

    pub fn device(&self) -> Option<DeviceRef<T>> {
        self.values
            .try_borrow()
            .ok()
            .and_then(|b| b.device().cloned())
    }

    pub fn values_head(&self) -> BufferHead {
        self.values
            .try_borrow()
            .map_or(BufferHead::Host, |b| b.head())
    }

    pub fn grads_head(&self) -> BufferHead {
        self.grads.try_borrow().map_or(BufferHead::Host, |b| b.head())
    }

    /// Changes the logical shape. Storage grows when needed and never shrinks, so
    /// reshaping back to an earlier shape keeps previously written values.
    pub fn reshape(&self, dims: &[usize]) -> NetResult<()> {
        self.reshape_to(&Shape::new(dims)?)
    }

    /// Reshape from signed dimensions, rejecting negative sizes.
    pub fn reshape_signed(&self, dims: &[i64]) -> NetResult<()> {
        self.reshape_to(&Shape::from_signed(dims)?)
    }

    pub fn reshape_to(&self, shape: &Shape) -> NetResult<()> {
        let count = shape.num_elements();
        borrow_mut(&self.values)?.ensure(count)?;
        borrow_mut(&self.grads)?.ensure(count)?;
        *self.shape.borrow_mut() = shape.clone();
        Ok(())
    }

    pub fn reshape_like(&self, other: &Tensor<T>) -> NetResult<()> {
        self.reshape_to(&other.shape())
    }

    /// Host view of the values, synchronized from the device if stale.
    pub fn values(&self) -> NetResult<Ref<'_, [T]>> {
        read_host(&self.values, self.count())
    }

    /// Mutable host view of the values; the device copy becomes stale.
    pub fn values_mut(&self) -> NetResult<RefMut<'_, [T]>> {
        write_host(&self.values, self.count())
    }

    pub fn grads(&self) -> NetResult<Ref<'_, [T]>> {
        read_host(&self.grads, self.count())
    }

    pub fn grads_mut(&self) -> NetResult<RefMut<'_, [T]>> {
        write_host(&self.grads, self.count())
    }

    pub fn device_values(&self) -> NetResult<Ref<'_, DeviceAllocation>> {
        read_device(&self.values)
    }

    pub fn device_values_mut(&self) -> NetResult<RefMut<'_, DeviceAllocation>> {
        write_device(&self.values)
    }

    pub fn device_grads(&self) -> NetResult<Ref<'_, DeviceAllocation>> {
        read_device(&self.grads)
    }

    pub fn device_grads_mut(&self) -> NetResult<RefMut<'_, DeviceAllocation>> {
        write_device(&self.grads)
    }

    /// Makes this tensor's values alias `other`'s value storage.
    pub fn share_values(&mut self, other: &Tensor<T>) -> NetResult<()> {
        ensure_shape!(
            self.count() == other.count(),
            "cannot share values between tensors of {} and {} elements",
            self.count(),
            other.count()
        );
        self.adopt_values_handle(other.values_handle())
    }

    /// Makes this tensor's gradients alias `other`'s gradient storage.
    pub fn share_grads(&mut self, other: &Tensor<T>) -> NetResult<()> {
        ensure_shape!(
            self.count() == other.count(),
            "cannot share gradients between tensors of {} and {} elements",
            self.count(),
            other.count()
        );
        self.grads = Rc::clone(&other.grads);
        Ok(())
    }

    pub fn shares_values_with(&self, other: &Tensor<T>) -> bool {
        Rc::ptr_eq(&self.values, &other.values)
    }

    pub fn shares_grads_with(&self, other: &Tensor<T>) -> bool {
        Rc::ptr_eq(&self.grads, &other.grads)
    }

    pub(crate) fn values_handle(&self) -> SharedBuffer<T> {
        Rc::clone(&self.values)
    }

    pub(crate) fn adopt_values_handle(&mut self, handle: SharedBuffer<T>) -> NetResult<()> {
        let theirs = borrow(&handle)?.capacity();
        ensure_shape!(
            theirs >= self.count(),
            "cannot share values: {} elements requested but the source holds {}",
            self.count(),
            theirs
        );
        self.values = handle;
        Ok(())
    }

    /// Copies `data` into the values. The length must equal `count()`.
    pub fn set_values(&self, data: &[T]) -> NetResult<()> {
        ensure_shape!(
            data.len() == self.count(),
            "expected {} values, got {}",
            self.count(),
            data.len()
        );
        self.values_mut()?.copy_from_slice(data);
        Ok(())
    }

    /// Injects caller memory as the host values without copying.
    pub fn adopt_values(&self, data: Vec<T>) -> NetResult<()> {
        ensure_shape!(
            data.len() == self.count(),
            "adopted buffer holds {} elements, tensor expects {}",
            data.len(),
            self.count()
        );
        borrow_mut(&self.values)?.adopt_host(data);
        Ok(())
    }

    /// Returns memory previously injected with [`adopt_values`](Self::adopt_values).
    pub fn release_adopted(&self) -> Option<Vec<T>> {
        self.values
            .try_borrow_mut()
            .ok()
            .and_then(|mut b| b.release_adopted())
    }

    /// Copies values (or gradients) from `other`, reshaping first when `reshape` is set.
    pub fn copy_from(&self, other: &Tensor<T>, copy_grads: bool, reshape: bool) -> NetResult<()> {
        if self.count() != other.count() || self.shape() != other.shape() {
            ensure_shape!(
                reshape,
                "copy_from requires matching shapes: {:?} vs {:?}",
                self.shape(),
                other.shape()
            );
            self.reshape_like(other)?;
        }
        let (src, dst) = if copy_grads {
            (&other.grads, &self.grads)
        } else {
            (&other.values, &self.values)
        };
        if Rc::ptr_eq(src, dst) {
            return Ok(());
        }
        let count = self.count();
        let from = read_host(src, count)?;
        let mut to = write_host(dst, count)?;
        to.copy_from_slice(&from);
        Ok(())
    }

    /// Sets every gradient to zero on the authoritative side.
    pub fn zero_grads(&self) -> NetResult<()> {
        let count = self.count();
        if count == 0 {
            return Ok(());
        }
        fill_authoritative(&self.grads, count, T::zero())
    }

    /// `values -= grads`, on whichever side currently owns the values.
    pub fn apply_gradient_step(&self) -> NetResult<()> {
        require_float::<T>("apply_gradient_step")?;
        let count = self.count();
        if count == 0 {
            return Ok(());
        }
        match self.values_head() {
            BufferHead::Uninitialized => Err(NetError::unsupported(
                "gradient step on values that were never written",
            )),
            BufferHead::Host => {
                let grads = read_host(&self.grads, count)?;
                let mut values = write_host(&self.values, count)?;
                for (v, g) in values.iter_mut().zip(grads.iter()) {
                    *v -= *g;
                }
                Ok(())
            }
            BufferHead::Device | BufferHead::Synced => {
                let device = device_of(&self.values)?;
                let grads = read_device(&self.grads)?;
                let mut values = write_device(&self.values)?;
                device.axpy(count, T::zero() - T::one(), &grads, &mut values)
            }
        }
    }

    pub fn sum_abs_values(&self) -> NetResult<T> {
        sum_abs(&self.values, self.count())
    }

    pub fn sum_abs_grads(&self) -> NetResult<T> {
        sum_abs(&self.grads, self.count())
    }

    pub fn sum_squares_values(&self) -> NetResult<T> {
        sum_squares(&self.values, self.count())
    }

    pub fn sum_squares_grads(&self) -> NetResult<T> {
        sum_squares(&self.grads, self.count())
    }

    pub fn scale_values(&self, alpha: T) -> NetResult<()> {
        scale(&self.values, self.count(), alpha)
    }

    pub fn scale_grads(&self, alpha: T) -> NetResult<()> {
        scale(&self.grads, self.count(), alpha)
    }
}

impl<T: Element> fmt::Debug for Tensor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("dtype", &T::DTYPE)
            .field("shape", &*self.shape.borrow())
            .field("values", &self.values_head())
            .field("grads", &self.grads_head())
            .finish()
    }
}

fn borrow<T: Element>(buf: &SharedBuffer<T>) -> NetResult<Ref<'_, SyncedBuffer<T>>> {
    buf.try_borrow()
        .map_err(|_| NetError::unsupported("tensor buffer is being written elsewhere"))
}

fn borrow_mut<T: Element>(buf: &SharedBuffer<T>) -> NetResult<RefMut<'_, SyncedBuffer<T>>> {
    buf.try_borrow_mut()
        .map_err(|_| NetError::unsupported("tensor buffer is already borrowed"))
}

fn read_host<T: Element>(buf: &SharedBuffer<T>, count: usize) -> NetResult<Ref<'_, [T]>> {
    let current = count == 0 || borrow(buf)?.host_is_current();
    if !current {
        borrow_mut(buf)?.sync_to_host()?;
    }
    Ref::filter_map(borrow(buf)?, |b| b.host_view().get(..count))
        .map_err(|_| NetError::allocation(format!("host storage holds fewer than {count} elements")))
}

fn write_host<T: Element>(buf: &SharedBuffer<T>, count: usize) -> NetResult<RefMut<'_, [T]>> {
    let mut guard = borrow_mut(buf)?;
    if count > 0 {
        guard.write_host()?;
    }
    RefMut::filter_map(guard, |b| b.host_view_mut().get_mut(..count))
        .map_err(|_| NetError::allocation(format!("host storage holds fewer than {count} elements")))
}

fn read_device<T: Element>(buf: &SharedBuffer<T>) -> NetResult<Ref<'_, DeviceAllocation>> {
    let current = borrow(buf)?.device_is_current();
    if !current {
        borrow_mut(buf)?.sync_to_device()?;
    }
    Ref::filter_map(borrow(buf)?, |b| b.device_view())
        .map_err(|_| NetError::allocation("device storage missing after sync"))
}

fn write_device<T: Element>(buf: &SharedBuffer<T>) -> NetResult<RefMut<'_, DeviceAllocation>> {
    let mut guard = borrow_mut(buf)?;
    guard.write_device()?;
    RefMut::filter_map(guard, |b| b.device_view_mut())
        .map_err(|_| NetError::allocation("device storage missing after sync"))
}

fn device_of<T: Element>(buf: &SharedBuffer<T>) -> NetResult<DeviceRef<T>> {
    borrow(buf)?
        .device()
        .cloned()
        .ok_or_else(|| NetError::no_device("buffer is device-resident but has no device"))
}

fn require_float<T: Element>(op: &str) -> NetResult<()> {
    if T::DTYPE.is_float() {
        Ok(())
    } else {
        Err(NetError::unsupported(format!(
            "{op} is not defined for {:?} tensors",
            T::DTYPE
        )))
    }
}

fn head_of<T: Element>(buf: &SharedBuffer<T>) -> NetResult<BufferHead> {
    Ok(borrow(buf)?.head())
}

fn sum_abs<T: Element>(buf: &SharedBuffer<T>, count: usize) -> NetResult<T> {
    require_float::<T>("sum_abs")?;
    match head_of(buf)? {
        _ if count == 0 => Ok(T::zero()),
        BufferHead::Uninitialized => Ok(T::zero()),
        BufferHead::Host => Ok(read_host(buf, count)?
            .iter()
            .fold(T::zero(), |acc, &v| acc + v.abs_value())),
        BufferHead::Device | BufferHead::Synced => {
            let device = device_of(buf)?;
            let data = read_device(buf)?;
            device.asum(count, &data)
        }
    }
}

fn sum_squares<T: Element>(buf: &SharedBuffer<T>, count: usize) -> NetResult<T> {
    require_float::<T>("sum_squares")?;
    match head_of(buf)? {
        _ if count == 0 => Ok(T::zero()),
        BufferHead::Uninitialized => Ok(T::zero()),
        BufferHead::Host => Ok(read_host(buf, count)?
            .iter()
            .fold(T::zero(), |acc, &v| acc + v * v)),
        BufferHead::Device | BufferHead::Synced => {
            let device = device_of(buf)?;
            let data = read_device(buf)?;
            device.dot(count, &data, &data)
        }
    }
}

fn scale<T: Element>(buf: &SharedBuffer<T>, count: usize, alpha: T) -> NetResult<()> {
    require_float::<T>("scale")?;
    match head_of(buf)? {
        _ if count == 0 => Ok(()),
        BufferHead::Uninitialized => Ok(()),
        BufferHead::Host => {
            for v in write_host(buf, count)?.iter_mut() {
                *v *= alpha;
            }
            Ok(())
        }
        BufferHead::Device | BufferHead::Synced => {
            let device = device_of(buf)?;
            let mut data = write_device(buf)?;
            device.scal(count, alpha, &mut data)
        }
    }
}

fn fill_authoritative<T: Element>(buf: &SharedBuffer<T>, count: usize, value: T) -> NetResult<()> {
    match head_of(buf)? {
        BufferHead::Device | BufferHead::Synced => {
            let device = device_of(buf)?;
            let mut data = write_device(buf)?;
            device.fill(count, value, &mut data)
        }
        BufferHead::Uninitialized | BufferHead::Host => {
            write_host(buf, count)?.fill(value);
            Ok(())
        }
    }
}
