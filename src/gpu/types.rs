//! Buffer handles and kernel dispatch records

use crate::data::MemoryHint;

/// Handle to a sub-allocated device buffer
///
/// Handles are copy-by-value capabilities; equality and hashing go by
/// `id` alone so a retagged copy still names the same allocation.
#[derive(Clone, Copy, Debug)]
pub struct BufferHandle {
    /// Unique id within the owning executor
    pub id: u64,
    /// Memory class of the slab this buffer lives in
    pub mem_hint: MemoryHint,
    /// Byte offset within the slab
    pub offset: usize,
    /// Usable size in bytes
    pub size: usize,
}

impl PartialEq for BufferHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for BufferHandle {}

impl std::hash::Hash for BufferHandle {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// One submission of a named GPU program
///
/// Buffer ordering matches the kernel signature; the optional counter
/// buffer, when present, is always the last binding.
#[derive(Clone, Debug)]
pub struct KernelDispatch {
    /// Name of the kernel function to launch
    pub kernel_name: String,
    /// Ordered buffer bindings
    pub buffers: Vec<BufferHandle>,
    /// Grid dimensions (threadgroups / blocks)
    pub grid_dim: [u32; 3],
    /// Block dimensions (threads per group)
    pub block_dim: [u32; 3],
}

/// Ordering contract for a batch submission
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchType {
    /// Pairwise ordering in submission order
    Serial,
    /// Any interleaving is permitted
    Concurrent,
}
