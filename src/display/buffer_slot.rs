//! Producer/consumer queue of a hardware-fed layer
//!
//! A producer (video decoder, camera, ...) takes a free slot, fills the buffer behind
//! it and queues it for presentation. On every frame the display takes the oldest
//! queued slot, or presents the previously shown slot again if nothing new arrived.
//! A slot becomes free again only once a newer slot is shown, so the producer never
//! writes into a buffer that might still be scanned out.

use std::{
    collections::VecDeque,
    sync::{Condvar, Mutex},
    time::Duration,
};

use tracing::{error, trace};

use crate::backend::allocator::MemoryHandle;

/// Maximum capacity of a [`BufferSlot`]
pub const MAX_SLOT_COUNT: usize = 32;

#[derive(Debug)]
struct SlotState {
    free: VecDeque<usize>,
    present: VecDeque<usize>,
    last_present: Option<usize>,
    present_total: u64,
    buffers: Vec<Option<MemoryHandle>>,
}

/// Bounded ring of presentable buffers
#[derive(Debug)]
pub struct BufferSlot {
    capacity: usize,
    state: Mutex<SlotState>,
    cond: Condvar,
}

impl BufferSlot {
    /// Create a queue with `count` slots, clamped to `1..=MAX_SLOT_COUNT`
    pub fn new(count: usize) -> BufferSlot {
        let capacity = count.clamp(1, MAX_SLOT_COUNT);
        BufferSlot {
            capacity,
            state: Mutex::new(SlotState {
                free: (0..capacity).collect(),
                present: VecDeque::with_capacity(capacity),
                last_present: None,
                present_total: 0,
                buffers: vec![None; capacity],
            }),
            cond: Condvar::new(),
        }
    }

    /// Number of slots
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Take a free slot, blocking until the display releases one
    pub fn free_slot(&self) -> usize {
        let guard = self.state.lock().unwrap();
        let mut guard = self.cond.wait_while(guard, |state| state.free.is_empty()).unwrap();
        // wait_while guarantees a free entry
        guard.free.pop_front().unwrap_or_default()
    }

    /// Take a free slot, waiting at most `timeout`
    pub fn free_slot_timeout(&self, timeout: Duration) -> Option<usize> {
        let guard = self.state.lock().unwrap();
        let (mut guard, _) = self
            .cond
            .wait_timeout_while(guard, timeout, |state| state.free.is_empty())
            .unwrap();
        guard.free.pop_front()
    }

    /// Queue `slot` for presentation
    ///
    /// `buffer` is recorded the first time the slot is seen, later calls keep the
    /// recorded buffer.
    pub fn add_present_slot(&self, slot: usize, buffer: &MemoryHandle) {
        if slot >= self.capacity {
            error!(slot, capacity = self.capacity, "invalid buffer slot");
            return;
        }
        let mut state = self.state.lock().unwrap();
        if state.buffers[slot].is_none() {
            state.buffers[slot] = Some(buffer.clone());
        }
        state.present.push_back(slot);
        state.present_total += 1;
        trace!(slot, queued = state.present.len(), "slot queued");
    }

    /// Take the slot to show next
    ///
    /// Returns the oldest queued slot or, if nothing is queued, the slot shown last.
    /// The previously shown slot is handed back to the producer once a different slot
    /// is taken. Returns `None` before the first slot was ever queued.
    pub fn present_slot(&self) -> Option<usize> {
        let mut state = self.state.lock().unwrap();
        let Some(next) = state.present.pop_front() else {
            return state.last_present;
        };
        if let Some(previous) = state.last_present.replace(next) {
            if previous != next {
                state.free.push_back(previous);
                self.cond.notify_one();
                trace!(slot = previous, "slot released");
            }
        }
        Some(next)
    }

    /// Buffer recorded for `slot`
    pub fn buffer(&self, slot: usize) -> Option<MemoryHandle> {
        self.state.lock().unwrap().buffers.get(slot).cloned().flatten()
    }

    /// Number of queued slots
    pub fn present_slot_count(&self) -> usize {
        self.state.lock().unwrap().present.len()
    }

    /// Number of slots ever queued
    pub fn present_total(&self) -> u64 {
        self.state.lock().unwrap().present_total
    }

    /// `(free, queued, shown)` slot counts
    pub fn counts(&self) -> (usize, usize, usize) {
        let state = self.state.lock().unwrap();
        (
            state.free.len(),
            state.present.len(),
            state.last_present.is_some() as usize,
        )
    }
}
