//! The data store: id-keyed host storage with byte-span accessors

use super::{DataHandle, DataId, DataUsage, HostValue, MemoryHint};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// A `Send`-able raw view of host memory
///
/// Device threads receive copy destinations as `HostSpan`s, the host-side
/// analog of passing device pointers around as plain integers. The pointee
/// must stay alive and unmoved until the transfer that received the span
/// has retired.
#[derive(Clone, Copy, Debug)]
pub struct HostSpan {
    ptr: *mut u8,
    len: usize,
}

unsafe impl Send for HostSpan {}

impl HostSpan {
    /// Build a span over a mutable byte slice
    pub fn from_slice(bytes: &mut [u8]) -> Self {
        Self {
            ptr: bytes.as_mut_ptr(),
            len: bytes.len(),
        }
    }

    /// Length of the span in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the span is empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Reborrow the span as a mutable slice
    ///
    /// # Safety
    ///
    /// The pointee must still be alive, unmoved, and not concurrently
    /// accessed through any other path.
    pub unsafe fn as_slice_mut<'a>(&self) -> &'a mut [u8] {
        std::slice::from_raw_parts_mut(self.ptr, self.len)
    }
}

/// Raw trait-object pointer to externally owned storage
struct AliasPtr(*mut dyn HostValue);

// Alias entries are only dereferenced under the store lock, and the
// create_ref_handle contract keeps the pointee alive and race-free.
unsafe impl Send for AliasPtr {}
unsafe impl Sync for AliasPtr {}

enum Storage {
    /// The store owns the boxed value
    Owned(Box<dyn HostValue>),
    /// The value lives in caller-owned memory
    Aliased(AliasPtr),
    /// Placeholder for a kernel output of not-yet-known content
    Pending,
}

struct DataEntry {
    storage: Storage,
    byte_size: usize,
    type_size: usize,
    mem_hint: MemoryHint,
    usage: DataUsage,
    alias: bool,
}

impl DataEntry {
    /// Pointer and length of the materialized bytes, if any
    fn raw_bytes(&mut self) -> Option<(*mut u8, usize)> {
        let bytes = match &mut self.storage {
            Storage::Owned(value) => value.as_bytes_mut(),
            Storage::Aliased(ptr) => unsafe { (*ptr.0).as_bytes_mut() },
            Storage::Pending => return None,
        };
        Some((bytes.as_mut_ptr(), bytes.len()))
    }
}

/// Host-side value store keyed by [`DataId`]
///
/// The store owns its values (aliased entries borrow), hands out byte
/// spans with stable addresses, and records the residency hint and usage
/// declared at registration. A span stays valid until its own entry is
/// overwritten through [`DataStore::store`]; mutations of other entries
/// never invalidate it.
#[derive(Default)]
pub struct DataStore {
    entries: Mutex<HashMap<DataId, DataEntry>>,
    device_local: Mutex<Vec<DataId>>,
    next_id: AtomicU64,
}

impl DataStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, entry: DataEntry) -> DataId {
        let id = DataId(self.next_id.fetch_add(1, Ordering::Relaxed));
        if entry.mem_hint == MemoryHint::DeviceLocal {
            self.device_local.lock().push(id);
        }
        self.entries.lock().insert(id, entry);
        id
    }

    /// Move a value into the store and return its typed handle
    pub fn create_data_handle<T: HostValue>(
        &self,
        value: T,
        usage: DataUsage,
        mem_hint: MemoryHint,
    ) -> DataHandle<T> {
        let byte_size = value.as_bytes().len();
        let type_size = value.type_size();
        let id = self.register(DataEntry {
            storage: Storage::Owned(Box::new(value)),
            byte_size,
            type_size,
            mem_hint,
            usage,
            alias: false,
        });
        DataHandle::new(id)
    }

    /// Register a handle over caller-owned memory
    ///
    /// The entry records `alias = true`; the store never frees the
    /// pointee.
    ///
    /// # Safety
    ///
    /// `value` must outlive every graph execution that touches the
    /// returned handle, must not move, and must not be accessed by the
    /// caller while a committed graph can read or write it.
    pub unsafe fn create_ref_handle<T: HostValue>(
        &self,
        value: &mut T,
        usage: DataUsage,
        mem_hint: MemoryHint,
    ) -> DataHandle<T> {
        let byte_size = value.as_bytes().len();
        let type_size = value.type_size();
        let ptr: *mut dyn HostValue = value as *mut T;
        let id = self.register(DataEntry {
            storage: Storage::Aliased(AliasPtr(ptr)),
            byte_size,
            type_size,
            mem_hint,
            usage,
            alias: true,
        });
        DataHandle::new(id)
    }

    /// Register a placeholder for a kernel output with no host buffer yet
    ///
    /// Span access fails until real bytes are installed with
    /// [`DataStore::store_bytes`]; `byte_size` is what the scheduler sizes
    /// the device buffer from.
    pub fn create_variable_kernel_handle(
        &self,
        usage: DataUsage,
        mem_hint: MemoryHint,
        byte_size: usize,
    ) -> DataHandle<Vec<u8>> {
        let id = self.register(DataEntry {
            storage: Storage::Pending,
            byte_size,
            type_size: 1,
            mem_hint,
            usage,
            alias: false,
        });
        DataHandle::new(id)
    }

    /// Retrieve a clone of the stored value
    ///
    /// Fails with `TypeMismatch` when the stored type differs from `T` or
    /// the entry is still a placeholder.
    pub fn get<T: Clone + 'static>(&self, handle: &DataHandle<T>) -> Result<T> {
        let entries = self.entries.lock();
        let entry = entries
            .get(&handle.id())
            .ok_or(Error::UnknownDataId { data_id: handle.id() })?;
        let any = match &entry.storage {
            Storage::Owned(value) => value.as_any(),
            Storage::Aliased(ptr) => unsafe { (*ptr.0).as_any() },
            Storage::Pending => return Err(Error::TypeMismatch { data_id: handle.id() }),
        };
        any.downcast_ref::<T>()
            .cloned()
            .ok_or(Error::TypeMismatch { data_id: handle.id() })
    }

    /// Borrow the entry's bytes
    pub fn get_span(&self, id: DataId) -> Result<&[u8]> {
        let (ptr, len) = self.raw_parts(id)?;
        // The pointee is boxed or caller-owned; it stays put while the
        // entry lives.
        Ok(unsafe { std::slice::from_raw_parts(ptr, len) })
    }

    /// Borrow the entry's bytes mutably
    ///
    /// Fails with `ReadOnlyViolation` for `ReadOnly` entries. Exclusivity
    /// across tasks is guaranteed by the graph's single-producer rule.
    pub fn get_span_mut(&self, id: DataId) -> Result<&mut [u8]> {
        let span = self.span_mut_raw(id)?;
        Ok(unsafe { span.as_slice_mut() })
    }

    /// Raw variant of [`DataStore::get_span_mut`] for device threads
    pub fn span_mut_raw(&self, id: DataId) -> Result<HostSpan> {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(&id)
            .ok_or(Error::UnknownDataId { data_id: id })?;
        if entry.usage != DataUsage::ReadWrite {
            return Err(Error::ReadOnlyViolation { data_id: id });
        }
        let (ptr, len) = entry
            .raw_bytes()
            .ok_or_else(|| Error::Internal(format!("data {:?} has no materialized storage", id)))?;
        Ok(HostSpan { ptr, len })
    }

    fn raw_parts(&self, id: DataId) -> Result<(*mut u8, usize)> {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(&id)
            .ok_or(Error::UnknownDataId { data_id: id })?;
        entry
            .raw_bytes()
            .ok_or_else(|| Error::Internal(format!("data {:?} has no materialized storage", id)))
    }

    /// Overwrite the stored value in place
    ///
    /// The incoming type must match the existing storage; placeholders
    /// accept their first value here. Aliased entries are written through
    /// to the caller's memory.
    pub fn store<T: HostValue>(&self, id: DataId, value: T) -> Result<()> {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(&id)
            .ok_or(Error::UnknownDataId { data_id: id })?;
        match &mut entry.storage {
            Storage::Owned(stored) => {
                let slot = stored
                    .as_any_mut()
                    .downcast_mut::<T>()
                    .ok_or(Error::TypeMismatch { data_id: id })?;
                *slot = value;
                entry.byte_size = stored.as_bytes().len();
                entry.type_size = stored.type_size();
            }
            Storage::Aliased(ptr) => {
                let stored = unsafe { &mut *ptr.0 };
                let slot = stored
                    .as_any_mut()
                    .downcast_mut::<T>()
                    .ok_or(Error::TypeMismatch { data_id: id })?;
                *slot = value;
                entry.byte_size = stored.as_bytes().len();
                entry.type_size = stored.type_size();
            }
            Storage::Pending => {
                entry.byte_size = value.as_bytes().len();
                entry.type_size = value.type_size();
                entry.storage = Storage::Owned(Box::new(value));
            }
        }
        Ok(())
    }

    /// Overwrite the entry's bytes
    ///
    /// Installs owned storage for placeholders; otherwise the span length
    /// must match the entry's.
    pub fn store_bytes(&self, id: DataId, bytes: &[u8]) -> Result<()> {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(&id)
            .ok_or(Error::UnknownDataId { data_id: id })?;
        if matches!(entry.storage, Storage::Pending) {
            entry.byte_size = bytes.len();
            entry.type_size = 1;
            entry.storage = Storage::Owned(Box::new(bytes.to_vec()));
            return Ok(());
        }
        let (ptr, len) = entry.raw_bytes().expect("materialized entry has bytes");
        if len != bytes.len() {
            return Err(Error::LengthMismatch {
                data_id: id,
                expected: len,
                got: bytes.len(),
            });
        }
        unsafe { std::slice::from_raw_parts_mut(ptr, len) }.copy_from_slice(bytes);
        Ok(())
    }

    /// Total byte size recorded for the entry
    pub fn byte_size(&self, id: DataId) -> Result<usize> {
        self.with_entry(id, |e| e.byte_size)
    }

    /// Element size recorded for the entry
    pub fn type_size(&self, id: DataId) -> Result<usize> {
        self.with_entry(id, |e| e.type_size)
    }

    /// Residency hint recorded for the entry
    pub fn mem_hint(&self, id: DataId) -> Result<MemoryHint> {
        self.with_entry(id, |e| e.mem_hint)
    }

    /// Declared usage of the entry
    pub fn usage(&self, id: DataId) -> Result<DataUsage> {
        self.with_entry(id, |e| e.usage)
    }

    /// Whether the entry aliases externally owned memory
    pub fn is_alias(&self, id: DataId) -> Result<bool> {
        self.with_entry(id, |e| e.alias)
    }

    /// Whether the id is registered
    pub fn contains(&self, id: DataId) -> bool {
        self.entries.lock().contains_key(&id)
    }

    /// Ids of every `DeviceLocal` entry, in registration order
    ///
    /// The runtime sizes backend proxy buffers from this registry.
    pub fn device_local_entries(&self) -> Vec<DataId> {
        self.device_local.lock().clone()
    }

    fn with_entry<R>(&self, id: DataId, f: impl FnOnce(&DataEntry) -> R) -> Result<R> {
        let entries = self.entries.lock();
        entries
            .get(&id)
            .map(f)
            .ok_or(Error::UnknownDataId { data_id: id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_round_trip() {
        let store = DataStore::new();
        let h = store.create_data_handle(vec![1.0f32, 2.0], DataUsage::ReadOnly, MemoryHint::Unified);
        assert_eq!(store.get(&h).unwrap(), vec![1.0f32, 2.0]);
    }

    #[test]
    fn span_is_stable_across_other_inserts() {
        let store = DataStore::new();
        let h = store.create_data_handle(vec![9u8; 32], DataUsage::ReadOnly, MemoryHint::Unified);
        let span = store.get_span(h.id()).unwrap();
        for _ in 0..256 {
            store.create_data_handle(0u64, DataUsage::ReadOnly, MemoryHint::Unified);
        }
        assert!(span.iter().all(|&b| b == 9));
    }
}
