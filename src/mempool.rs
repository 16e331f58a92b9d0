//! Arena allocator backing per-task and per-session transient data.
//!
//! One pool lives exactly as long as the task that owns it. Allocation hands
//! back index-based handles instead of references, so nothing derived from a
//! pool can outlive it, and teardown is a single drop with no per-object
//! bookkeeping. There is deliberately no way to free an individual block.

use std::cell::{Cell, RefCell};

/// Default chunk size. Pools grow by whole chunks; oversized allocations get
/// a dedicated chunk.
const CHUNK_SIZE: usize = 16 * 1024;

/// Handle to a byte block allocated from a [`MemPool`]. Only meaningful for
/// the pool that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolBytes {
    chunk: u32,
    start: u32,
    len: u32,
}

/// Handle to a UTF-8 string allocated from a [`MemPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStr(PoolBytes);

pub struct MemPool {
    chunks: RefCell<Vec<Vec<u8>>>,
    allocated: Cell<usize>,
}

impl MemPool {
    pub fn new() -> Self {
        MemPool {
            chunks: RefCell::new(vec![Vec::with_capacity(CHUNK_SIZE)]),
            allocated: Cell::new(0),
        }
    }

    /// Copy `data` into the pool. Zero-size allocations are a contract
    /// violation: reported loudly in debug, tolerated in release.
    pub fn alloc(&self, data: &[u8]) -> PoolBytes {
        debug_assert!(!data.is_empty(), "zero-size pool allocation");
        if data.is_empty() {
            log::error!("zero-size pool allocation");
        }
        let mut chunks = self.chunks.borrow_mut();
        let need = data.len();

        // Oversized blocks get their own chunk so normal chunks stay dense.
        if need > CHUNK_SIZE {
            let mut chunk = Vec::with_capacity(need);
            chunk.extend_from_slice(data);
            chunks.push(chunk);
            self.allocated.set(self.allocated.get() + need);
            return PoolBytes {
                chunk: (chunks.len() - 1) as u32,
                start: 0,
                len: need as u32,
            };
        }

        let last = chunks.len() - 1;
        if chunks[last].len() + need > CHUNK_SIZE {
            chunks.push(Vec::with_capacity(CHUNK_SIZE));
        }
        let idx = chunks.len() - 1;
        let start = chunks[idx].len();
        chunks[idx].extend_from_slice(data);
        self.allocated.set(self.allocated.get() + need);
        PoolBytes {
            chunk: idx as u32,
            start: start as u32,
            len: need as u32,
        }
    }

    pub fn alloc_str(&self, s: &str) -> PoolStr {
        PoolStr(self.alloc(s.as_bytes()))
    }

    /// Resolve a handle. The returned guard borrows the pool, so the bytes
    /// cannot be observed after the pool is gone.
    pub fn get(&self, h: PoolBytes) -> PoolRef<'_> {
        PoolRef { pool: self, h }
    }

    pub fn get_str(&self, h: PoolStr) -> PoolStrRef<'_> {
        PoolStrRef { pool: self, h: h.0 }
    }

    /// Total bytes handed out since creation.
    pub fn allocated_bytes(&self) -> usize {
        self.allocated.get()
    }
}

impl Default for MemPool {
    fn default() -> Self {
        Self::new()
    }
}

pub struct PoolRef<'a> {
    pool: &'a MemPool,
    h: PoolBytes,
}

impl PoolRef<'_> {
    pub fn with<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let chunks = self.pool.chunks.borrow();
        let c = &chunks[self.h.chunk as usize];
        f(&c[self.h.start as usize..(self.h.start + self.h.len) as usize])
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.with(|b| b.to_vec())
    }
}

pub struct PoolStrRef<'a> {
    pool: &'a MemPool,
    h: PoolBytes,
}

impl PoolStrRef<'_> {
    pub fn with<R>(&self, f: impl FnOnce(&str) -> R) -> R {
        let chunks = self.pool.chunks.borrow();
        let c = &chunks[self.h.chunk as usize];
        let bytes = &c[self.h.start as usize..(self.h.start + self.h.len) as usize];
        // Handle was produced from &str, contents are immutable after copy.
        f(std::str::from_utf8(bytes).unwrap_or(""))
    }

    pub fn to_string(&self) -> String {
        self.with(|s| s.to_string())
    }
}
