//! All threads known to the scheduler: an arena of control blocks plus the
//! ring that fixes their round-robin order.

use alloc::vec::Vec;

use crate::context::Context;
use crate::error::{ThreadError, ThreadResult};
use crate::thread::{ThreadControlBlock, ThreadId, ThreadState};
use crate::time::Instant;

/// Index of a control block in the arena. Stable while the thread is live.
pub type Slot = usize;

pub struct Registry {
    slots: Vec<Option<ThreadControlBlock>>,
    free: Vec<Slot>,
    /// Live slots in arrival order; the successor of the last entry is the first.
    ring: Vec<Slot>,
    cursor: usize,
    next_id: ThreadId,
    /// Ids released by `drain` before they exited, ascending.
    abandoned: Vec<ThreadId>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub const fn new() -> Self {
        Registry {
            slots: Vec::new(),
            free: Vec::new(),
            ring: Vec::new(),
            cursor: 0,
            next_id: 1,
            abandoned: Vec::new(),
        }
    }

    /// Links a new thread at the tail of the ring and returns its id and slot.
    pub fn insert(
        &mut self,
        context: Context,
        name: Option<&'static str>,
    ) -> ThreadResult<(ThreadId, Slot)> {
        self.ring
            .try_reserve(1)
            .map_err(|_| ThreadError::RegistryExhausted)?;
        if self.free.is_empty() {
            self.slots
                .try_reserve(1)
                .map_err(|_| ThreadError::RegistryExhausted)?;
        }

        let id = self.next_id;
        self.next_id += 1;

        let tcb = ThreadControlBlock::new(id, context, name);
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(tcb);
                slot
            }
            None => {
                self.slots.push(Some(tcb));
                self.slots.len() - 1
            }
        };
        self.ring.push(slot);
        Ok((id, slot))
    }

    /// Number of threads still in the ring.
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Id the next created thread will get.
    pub fn next_id(&self) -> ThreadId {
        self.next_id
    }

    pub fn get(&self, slot: Slot) -> Option<&ThreadControlBlock> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, slot: Slot) -> Option<&mut ThreadControlBlock> {
        self.slots.get_mut(slot).and_then(Option::as_mut)
    }

    pub fn find(&self, id: ThreadId) -> Option<Slot> {
        self.ring
            .iter()
            .copied()
            .find(|&slot| self.get(slot).is_some_and(|t| t.id == id))
    }

    /// State of thread `id`. Ids that were handed out but are no longer in the
    /// ring belonged to reclaimed threads, which only happens after they ended,
    /// unless `drain` abandoned them first.
    pub fn status(&self, id: ThreadId) -> Option<ThreadState> {
        if id == 0 || id >= self.next_id || self.was_abandoned(id) {
            return None;
        }
        match self.find(id) {
            Some(slot) => self.get(slot).map(ThreadControlBlock::state),
            None => Some(ThreadState::Terminated),
        }
    }

    /// Moves the cursor back to the head of the ring.
    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    /// Slot under the cursor.
    pub fn cursor(&self) -> Option<Slot> {
        self.ring.get(self.cursor).copied()
    }

    /// Whether `id` was released by [`drain`](Self::drain) without exiting.
    pub fn was_abandoned(&self, id: ThreadId) -> bool {
        self.abandoned.binary_search(&id).is_ok()
    }

    pub fn advance(&mut self) {
        if !self.ring.is_empty() {
            self.cursor = (self.cursor + 1) % self.ring.len();
        }
    }

    /// Unlinks the node under the cursor, leaving the cursor on its successor.
    pub fn remove_at_cursor(&mut self) -> Option<ThreadControlBlock> {
        if self.cursor >= self.ring.len() {
            return None;
        }
        let slot = self.ring.remove(self.cursor);
        if self.cursor >= self.ring.len() {
            self.cursor = 0;
        }
        let tcb = self.slots[slot].take();
        self.free.push(slot);
        tcb
    }

    /// Removes every thread, returning them in ring order. Threads that had not
    /// terminated are remembered as abandoned.
    pub fn drain(&mut self) -> Vec<ThreadControlBlock> {
        let ring = core::mem::take(&mut self.ring);
        let drained: Vec<ThreadControlBlock> = ring
            .into_iter()
            .filter_map(|slot| self.slots[slot].take())
            .collect();
        // Ring order is arrival order, so the list stays sorted.
        self.abandoned.extend(
            drained
                .iter()
                .filter(|t| !t.is_terminated())
                .map(|t| t.id),
        );
        self.slots.clear();
        self.free.clear();
        self.cursor = 0;
        drained
    }

    /// Control blocks in ring order, starting at the head.
    pub fn iter(&self) -> impl Iterator<Item = &ThreadControlBlock> + '_ {
        self.ring.iter().filter_map(move |&slot| self.get(slot))
    }

    pub fn any_runnable(&self) -> bool {
        self.iter().any(ThreadControlBlock::is_runnable)
    }

    pub fn earliest_deadline(&self) -> Option<Instant> {
        self.iter().filter_map(ThreadControlBlock::deadline).min()
    }
}
