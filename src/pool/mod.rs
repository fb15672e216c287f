//! Shared buffer pools.
//!
//! # Responsibilities
//! - Growable header buffers for serializing response heads
//! - Fixed 8 KiB scratch slabs for body copy loops
//!
//! # Design Decisions
//! - Items are cleared on release so a pooled buffer never leaks bytes
//!   between exchanges
//! - Returning an item is best-effort; an early-return path that drops one
//!   instead is a benign leak
//! - Retention is bounded so a burst does not pin memory forever

use std::sync::Mutex;

use bytes::BytesMut;

/// Fixed size of a scratch slab. Response bodies are relayed in frames of at
/// most this many bytes.
pub const SLAB_SIZE: usize = 8 * 1024;

const MAX_RETAINED: usize = 64;

/// Pool of growable byte buffers for header blocks. Header blocks have no
/// size bound, so buffers grow as needed and keep their capacity when
/// returned.
pub struct BufferPool {
    free: Mutex<Vec<BytesMut>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            free: Mutex::new(Vec::new()),
        }
    }

    pub fn get(&self) -> BytesMut {
        self.free
            .lock()
            .expect("buffer pool poisoned")
            .pop()
            .unwrap_or_default()
    }

    pub fn release(&self, mut buf: BytesMut) {
        buf.clear();
        let mut free = self.free.lock().expect("buffer pool poisoned");
        if free.len() < MAX_RETAINED {
            free.push(buf);
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Pool of fixed-size scratch slabs.
pub struct SlabPool {
    free: Mutex<Vec<Vec<u8>>>,
}

impl SlabPool {
    pub fn new() -> Self {
        Self {
            free: Mutex::new(Vec::new()),
        }
    }

    pub fn get(&self) -> Vec<u8> {
        self.free
            .lock()
            .expect("slab pool poisoned")
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(SLAB_SIZE))
    }

    pub fn release(&self, mut slab: Vec<u8>) {
        slab.clear();
        let mut free = self.free.lock().expect("slab pool poisoned");
        if free.len() < MAX_RETAINED {
            free.push(slab);
        }
    }
}

impl Default for SlabPool {
    fn default() -> Self {
        Self::new()
    }
}
