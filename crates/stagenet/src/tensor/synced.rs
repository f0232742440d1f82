//! Host/device mirrored storage with lazy synchronization.
//!
//! A [`SyncedBuffer`] owns one logical region that may be resident on the host, on the
//! device, or on both. The [`BufferHead`] records which side is authoritative. Reads of the
//! stale side copy from the authoritative side first and leave the buffer in
//! [`BufferHead::Synced`]; writes make the written side the only valid copy.

use std::collections::TryReserveError;

use crate::device::{DeviceAllocation, DeviceRef};
use crate::error::{NetError, NetResult};
use crate::tensor::Element;

/// Which side of a [`SyncedBuffer`] holds current data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferHead {
    /// Nothing has been allocated or written yet; both sides read as zeros.
    Uninitialized,
    /// Only the host copy is current.
    Host,
    /// Only the device copy is current.
    Device,
    /// Host and device copies agree.
    Synced,
}

enum HostStorage<T> {
    Owned(Vec<T>),
    /// Caller-supplied memory injected without a copy.
    Adopted(Vec<T>),
}

impl<T> HostStorage<T> {
    fn as_slice(&self) -> &[T] {
        match self {
            HostStorage::Owned(v) | HostStorage::Adopted(v) => v,
        }
    }

    fn as_mut_slice(&mut self) -> &mut [T] {
        match self {
            HostStorage::Owned(v) | HostStorage::Adopted(v) => v,
        }
    }

    fn len(&self) -> usize {
        self.as_slice().len()
    }

    fn into_vec(self) -> Vec<T> {
        match self {
            HostStorage::Owned(v) | HostStorage::Adopted(v) => v,
        }
    }
}

/// One region of element storage mirrored between host and an optional device.
pub struct SyncedBuffer<T: Element> {
    capacity: usize,
    head: BufferHead,
    host: Option<HostStorage<T>>,
    device_mem: Option<DeviceAllocation>,
    device: Option<DeviceRef<T>>,
}

impl<T: Element> SyncedBuffer<T> {
    /// Creates an empty buffer; nothing is allocated until first access.
    pub fn new(device: Option<DeviceRef<T>>) -> Self {
        SyncedBuffer {
            capacity: 0,
            head: BufferHead::Uninitialized,
            host: None,
            device_mem: None,
            device,
        }
    }

    /// Number of elements the buffer can hold.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn head(&self) -> BufferHead {
        self.head
    }

    /// Static capability flag: device-side calls fail with `NoDevice` when false.
    pub fn has_device(&self) -> bool {
        self.device.is_some()
    }

    pub fn device(&self) -> Option<&DeviceRef<T>> {
        self.device.as_ref()
    }

    /// Reports whether the host copy is current and covers the full capacity.
    pub fn host_is_current(&self) -> bool {
        matches!(self.head, BufferHead::Host | BufferHead::Synced)
            && self
                .host
                .as_ref()
                .is_some_and(|h| h.len() >= self.capacity)
    }

    /// Reports whether the device copy is current and covers the full capacity.
    pub fn device_is_current(&self) -> bool {
        matches!(self.head, BufferHead::Device | BufferHead::Synced)
            && self
                .device_mem
                .as_ref()
                .is_some_and(|m| m.len() >= self.capacity)
    }

    /// Grows the buffer to hold at least `capacity` elements. Never shrinks.
    ///
    /// Existing contents are preserved. Any device copy is dropped and lazily recreated
    /// from the host on the next device access.
    pub fn ensure(&mut self, capacity: usize) -> NetResult<()> {
        let host_covers = self.host.as_ref().map_or(true, |h| h.len() >= capacity);
        if capacity <= self.capacity && host_covers {
            return Ok(());
        }
        if self.head == BufferHead::Uninitialized {
            self.capacity = self.capacity.max(capacity);
            self.host = None;
            self.device_mem = None;
            return Ok(());
        }
        if self.head == BufferHead::Device {
            self.sync_to_host()?;
        }
        let target = self.capacity.max(capacity);
        let mut data = match self.host.take() {
            Some(storage) => storage.into_vec(),
            None => Vec::new(),
        };
        let additional = target.saturating_sub(data.len());
        if let Err(err) = data.try_reserve_exact(additional) {
            self.host = Some(HostStorage::Owned(data));
            return Err(alloc_error(target, err));
        }
        data.resize(target, T::zero());
        self.host = Some(HostStorage::Owned(data));
        self.device_mem = None;
        self.capacity = target;
        self.head = BufferHead::Host;
        Ok(())
    }

    /// Returns the host copy, copying from the device first when it is stale.
    pub fn read_host(&mut self) -> NetResult<&[T]> {
        self.sync_to_host()?;
        Ok(self.host_view())
    }

    /// Returns the host copy for writing and marks the device copy stale.
    ///
    /// The view reflects the latest data (a stale host side is refreshed first) so partial
    /// writes never resurrect old values.
    pub fn write_host(&mut self) -> NetResult<&mut [T]> {
        self.sync_to_host()?;
        self.head = BufferHead::Host;
        Ok(self.host_view_mut())
    }

    /// Returns the device copy, uploading from the host first when it is stale.
    pub fn read_device(&mut self) -> NetResult<&DeviceAllocation> {
        self.sync_to_device()?;
        self.device_mem
            .as_ref()
            .ok_or_else(|| NetError::allocation("device storage missing after sync"))
    }

    /// Returns the device copy for writing and marks the host copy stale.
    pub fn write_device(&mut self) -> NetResult<&mut DeviceAllocation> {
        self.sync_to_device()?;
        self.head = BufferHead::Device;
        self.device_mem
            .as_mut()
            .ok_or_else(|| NetError::allocation("device storage missing after sync"))
    }

    /// Replaces host storage with caller-supplied memory without copying.
    ///
    /// The device copy becomes stale. A later [`ensure`](Self::ensure) beyond the adopted
    /// length reallocates into owned storage.
    pub fn adopt_host(&mut self, data: Vec<T>) {
        self.capacity = self.capacity.max(data.len());
        self.host = Some(HostStorage::Adopted(data));
        self.head = BufferHead::Host;
    }

    /// Hands adopted memory back to the caller, if the host storage is still adopted.
    pub fn release_adopted(&mut self) -> Option<Vec<T>> {
        match self.host.take() {
            Some(HostStorage::Adopted(data)) => {
                self.head = match self.head {
                    BufferHead::Synced => BufferHead::Device,
                    _ => BufferHead::Uninitialized,
                };
                Some(data)
            }
            other => {
                self.host = other;
                None
            }
        }
    }

    /// Host copy as last synchronized; empty when nothing is allocated.
    pub(crate) fn host_view(&self) -> &[T] {
        self.host.as_ref().map_or(&[], |h| h.as_slice())
    }

    pub(crate) fn host_view_mut(&mut self) -> &mut [T] {
        match self.host.as_mut() {
            Some(h) => h.as_mut_slice(),
            None => &mut [],
        }
    }

    pub(crate) fn device_view(&self) -> Option<&DeviceAllocation> {
        self.device_mem.as_ref()
    }

    pub(crate) fn device_view_mut(&mut self) -> Option<&mut DeviceAllocation> {
        self.device_mem.as_mut()
    }

    fn require_storage(&self) -> NetResult<()> {
        if self.capacity == 0 {
            return Err(NetError::allocation(
                "buffer has no storage; reshape to a non-empty shape first",
            ));
        }
        Ok(())
    }

    fn require_device(&self) -> NetResult<&DeviceRef<T>> {
        self.device
            .as_ref()
            .ok_or_else(|| NetError::no_device("device access on a host-only buffer"))
    }

    fn allocate_host(&mut self) -> NetResult<()> {
        if self.host.as_ref().is_some_and(|h| h.len() >= self.capacity) {
            return Ok(());
        }
        let mut data = match self.host.take() {
            Some(storage) => storage.into_vec(),
            None => Vec::new(),
        };
        let additional = self.capacity.saturating_sub(data.len());
        if let Err(err) = data.try_reserve_exact(additional) {
            self.host = Some(HostStorage::Owned(data));
            return Err(alloc_error(self.capacity, err));
        }
        data.resize(self.capacity, T::zero());
        self.host = Some(HostStorage::Owned(data));
        Ok(())
    }

    fn allocate_device(&mut self) -> NetResult<()> {
        if self
            .device_mem
            .as_ref()
            .is_some_and(|m| m.len() >= self.capacity)
        {
            return Ok(());
        }
        let device = self.require_device()?;
        let allocation = device.allocate(self.capacity)?;
        self.device_mem = Some(allocation);
        Ok(())
    }

    pub(crate) fn sync_to_host(&mut self) -> NetResult<()> {
        self.require_storage()?;
        match self.head {
            BufferHead::Uninitialized => {
                self.allocate_host()?;
                self.head = BufferHead::Host;
            }
            BufferHead::Host | BufferHead::Synced => {
                self.allocate_host()?;
            }
            BufferHead::Device => {
                self.allocate_host()?;
                let device = self.require_device()?.clone();
                let (Some(host), Some(mem)) = (self.host.as_mut(), self.device_mem.as_ref())
                else {
                    return Err(NetError::allocation("device copy missing while authoritative"));
                };
                let n = host.len().min(mem.len());
                device.download(mem, &mut host.as_mut_slice()[..n])?;
                self.head = BufferHead::Synced;
            }
        }
        Ok(())
    }

    pub(crate) fn sync_to_device(&mut self) -> NetResult<()> {
        self.require_device()?;
        self.require_storage()?;
        match self.head {
            BufferHead::Uninitialized => {
                self.allocate_device()?;
                self.head = BufferHead::Device;
            }
            BufferHead::Device | BufferHead::Synced => {
                self.allocate_device()?;
            }
            BufferHead::Host => {
                self.allocate_device()?;
                let device = self.require_device()?.clone();
                let (Some(host), Some(mem)) = (self.host.as_ref(), self.device_mem.as_mut())
                else {
                    return Err(NetError::allocation("host copy missing while authoritative"));
                };
                let n = host.len().min(mem.len());
                device.upload(&host.as_slice()[..n], mem)?;
                self.head = BufferHead::Synced;
            }
        }
        Ok(())
    }
}

fn alloc_error(elements: usize, err: TryReserveError) -> NetError {
    NetError::allocation(format!(
        "cannot reserve host storage for {elements} elements: {err}"
    ))
}
