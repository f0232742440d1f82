//! Reference accelerator for stagenet.
//!
//! Device memory is emulated with separate host allocations, so every host/device
//! transfer is a real copy the engine has to ask for. Transfers are counted, and a byte
//! budget can be set to make allocation failure reproducible.

use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use stagenet::{Device, DeviceAllocation, Element, NetError, NetResult};
use tracing::trace;

/// Backing store of one emulated allocation. Returns its bytes to the device on drop.
struct RefMemory<T> {
    data: Vec<T>,
    bytes: usize,
    live_bytes: Arc<AtomicUsize>,
}

impl<T> Drop for RefMemory<T> {
    fn drop(&mut self) {
        self.live_bytes.fetch_sub(self.bytes, Ordering::SeqCst);
    }
}

pub struct RefDevice<T: Element> {
    name: String,
    byte_limit: Option<usize>,
    live_bytes: Arc<AtomicUsize>,
    uploads: AtomicUsize,
    downloads: AtomicUsize,
    allocations: AtomicUsize,
    _elem: PhantomData<fn() -> T>,
}

impl<T: Element> RefDevice<T> {
    pub fn new() -> Self {
        RefDevice {
            name: "ref".to_string(),
            byte_limit: None,
            live_bytes: Arc::new(AtomicUsize::new(0)),
            uploads: AtomicUsize::new(0),
            downloads: AtomicUsize::new(0),
            allocations: AtomicUsize::new(0),
            _elem: PhantomData,
        }
    }

    /// Device that refuses allocations once `bytes` are live.
    pub fn with_byte_limit(bytes: usize) -> Self {
        RefDevice {
            byte_limit: Some(bytes),
            ..RefDevice::new()
        }
    }

    pub fn uploads(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    pub fn allocations(&self) -> usize {
        self.allocations.load(Ordering::SeqCst)
    }

    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::SeqCst)
    }

    pub fn reset_counters(&self) {
        self.uploads.store(0, Ordering::SeqCst);
        self.downloads.store(0, Ordering::SeqCst);
        self.allocations.store(0, Ordering::SeqCst);
    }

    /// Reads device memory directly, without going through a transfer.
    pub fn peek(&self, alloc: &DeviceAllocation) -> NetResult<Vec<T>> {
        Ok(memory(alloc)?.data.clone())
    }

    /// Writes device memory directly, as a device kernel would.
    pub fn poke(&self, alloc: &mut DeviceAllocation, values: &[T]) -> NetResult<()> {
        let mem = memory_mut(alloc)?;
        if values.len() > mem.data.len() {
            return Err(NetError::shape(format!(
                "cannot write {} elements into a device allocation of {}",
                values.len(),
                mem.data.len()
            )));
        }
        mem.data[..values.len()].copy_from_slice(values);
        Ok(())
    }
}

impl<T: Element> Default for RefDevice<T> {
    fn default() -> Self {
        RefDevice::new()
    }
}

impl<T: Element> fmt::Debug for RefDevice<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefDevice")
            .field("name", &self.name)
            .field("byte_limit", &self.byte_limit)
            .field("live_bytes", &self.live_bytes())
            .finish()
    }
}

fn memory<T: Element>(alloc: &DeviceAllocation) -> NetResult<&RefMemory<T>> {
    alloc.downcast_ref::<RefMemory<T>>()
}

fn memory_mut<T: Element>(alloc: &mut DeviceAllocation) -> NetResult<&mut RefMemory<T>> {
    alloc.downcast_mut::<RefMemory<T>>()
}

fn check_len(op: &str, n: usize, len: usize) -> NetResult<()> {
    if n > len {
        return Err(NetError::shape(format!(
            "{op} over {n} elements exceeds the allocation of {len}"
        )));
    }
    Ok(())
}

impl<T: Element> Device<T> for RefDevice<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn allocate(&self, len: usize) -> NetResult<DeviceAllocation> {
        let bytes = len * mem::size_of::<T>();
        let live = self.live_bytes.fetch_add(bytes, Ordering::SeqCst) + bytes;
        if let Some(limit) = self.byte_limit {
            if live > limit {
                self.live_bytes.fetch_sub(bytes, Ordering::SeqCst);
                return Err(NetError::allocation(format!(
                    "device '{}' cannot provide {bytes} bytes ({} of {limit} in use)",
                    self.name,
                    live - bytes
                )));
            }
        }
        self.allocations.fetch_add(1, Ordering::SeqCst);
        trace!(device = %self.name, len, bytes, "allocate");
        let memory = RefMemory {
            data: vec![T::zero(); len],
            bytes,
            live_bytes: Arc::clone(&self.live_bytes),
        };
        Ok(DeviceAllocation::new(memory, len))
    }

    fn upload(&self, src: &[T], dst: &mut DeviceAllocation) -> NetResult<()> {
        let mem = memory_mut::<T>(dst)?;
        check_len("upload", src.len(), mem.data.len())?;
        mem.data[..src.len()].copy_from_slice(src);
        self.uploads.fetch_add(1, Ordering::SeqCst);
        trace!(device = %self.name, len = src.len(), "upload");
        Ok(())
    }

    fn download(&self, src: &DeviceAllocation, dst: &mut [T]) -> NetResult<()> {
        let mem = memory::<T>(src)?;
        check_len("download", dst.len(), mem.data.len())?;
        dst.copy_from_slice(&mem.data[..dst.len()]);
        self.downloads.fetch_add(1, Ordering::SeqCst);
        trace!(device = %self.name, len = dst.len(), "download");
        Ok(())
    }

    fn axpy(
        &self,
        n: usize,
        alpha: T,
        x: &DeviceAllocation,
        y: &mut DeviceAllocation,
    ) -> NetResult<()> {
        let xs = &memory::<T>(x)?.data;
        check_len("axpy", n, xs.len())?;
        let ys = &mut memory_mut::<T>(y)?.data;
        check_len("axpy", n, ys.len())?;
        for (y, &x) in ys[..n].iter_mut().zip(&xs[..n]) {
            *y += alpha * x;
        }
        Ok(())
    }

    fn asum(&self, n: usize, x: &DeviceAllocation) -> NetResult<T> {
        let xs = &memory::<T>(x)?.data;
        check_len("asum", n, xs.len())?;
        Ok(xs[..n]
            .iter()
            .fold(T::zero(), |acc, &v| acc + v.abs_value()))
    }

    fn dot(&self, n: usize, x: &DeviceAllocation, y: &DeviceAllocation) -> NetResult<T> {
        let xs = &memory::<T>(x)?.data;
        let ys = &memory::<T>(y)?.data;
        check_len("dot", n, xs.len().min(ys.len()))?;
        Ok(xs[..n]
            .iter()
            .zip(&ys[..n])
            .fold(T::zero(), |acc, (&a, &b)| acc + a * b))
    }

    fn scal(&self, n: usize, alpha: T, x: &mut DeviceAllocation) -> NetResult<()> {
        let xs = &mut memory_mut::<T>(x)?.data;
        check_len("scal", n, xs.len())?;
        for v in &mut xs[..n] {
            *v *= alpha;
        }
        Ok(())
    }

    fn fill(&self, n: usize, alpha: T, x: &mut DeviceAllocation) -> NetResult<()> {
        let xs = &mut memory_mut::<T>(x)?.data;
        check_len("fill", n, xs.len())?;
        xs[..n].fill(alpha);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfers_are_counted() -> anyhow::Result<()> {
        let dev = RefDevice::<f32>::new();
        let mut alloc = dev.allocate(3)?;
        dev.upload(&[1.0, -2.0, 3.0], &mut alloc)?;
        let mut back = [0.0f32; 3];
        dev.download(&alloc, &mut back)?;
        assert_eq!(back, [1.0, -2.0, 3.0]);
        assert_eq!((dev.uploads(), dev.downloads(), dev.allocations()), (1, 1, 1));
        assert_eq!(dev.asum(3, &alloc)?, 6.0);
        Ok(())
    }

    #[test]
    fn blas_primitives() -> anyhow::Result<()> {
        let dev = RefDevice::<f64>::new();
        let mut x = dev.allocate(3)?;
        let mut y = dev.allocate(3)?;
        dev.poke(&mut x, &[1.0, 2.0, 3.0])?;
        dev.fill(3, 1.0, &mut y)?;
        dev.axpy(3, 2.0, &x, &mut y)?;
        assert_eq!(dev.peek(&y)?, vec![3.0, 5.0, 7.0]);
        assert_eq!(dev.dot(3, &x, &y)?, 3.0 + 10.0 + 21.0);
        dev.scal(2, -1.0, &mut y)?;
        assert_eq!(dev.peek(&y)?, vec![-3.0, -5.0, 7.0]);
        Ok(())
    }

    #[test]
    fn byte_limit_is_recoverable_and_released_on_drop() -> anyhow::Result<()> {
        let dev = RefDevice::<f32>::with_byte_limit(16);
        let first = dev.allocate(4)?;
        let err = dev.allocate(1).unwrap_err();
        assert!(err.is_recoverable());
        drop(first);
        assert_eq!(dev.live_bytes(), 0);
        dev.allocate(4)?;
        Ok(())
    }

    #[test]
    fn foreign_allocations_are_rejected() {
        let dev = RefDevice::<f32>::new();
        let foreign = DeviceAllocation::new(7u8, 1);
        assert!(dev.peek(&foreign).is_err());
    }
}
