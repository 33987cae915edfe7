//! Posted write buffer.
//!
//! Stores are posted here and drained to the bus when no higher-priority
//! read-type transaction is pending. Entries carry their slot index in the
//! bus transaction tag, so the acknowledgement pops by index and never by
//! address. Capacity is small and fixed: when full, the producing FSM stalls
//! rather than dropping the write.

use crate::common::addr::{LineNumber, PhysAddr};

/// Lifecycle of a write-buffer slot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum SlotState {
    /// Slot is free.
    #[default]
    Empty,
    /// Posted, not yet sent on the bus.
    Pending,
    /// Sent, waiting for the bus acknowledgement.
    Issued,
}

/// One posted write.
#[derive(Clone, Copy, Debug, Default)]
pub struct WriteEntry {
    /// Physical word address.
    pub paddr: PhysAddr,
    /// Byte enables within the word.
    pub be: u8,
    /// Write data.
    pub data: u32,
    state: SlotState,
}

/// FIFO of posted writes with read-hazard detection.
pub struct WriteBuffer {
    slots: Vec<WriteEntry>,
    head: usize,
    tail: usize,
    count: usize,
    line_shift: u32,
}

impl WriteBuffer {
    /// Creates an empty buffer of `depth` slots.
    pub fn new(depth: usize, line_shift: u32) -> Self {
        Self {
            slots: vec![WriteEntry::default(); depth],
            head: 0,
            tail: 0,
            count: 0,
            line_shift,
        }
    }

    /// Returns true if no slot is occupied.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Returns true if every slot is occupied.
    pub fn is_full(&self) -> bool {
        self.count == self.slots.len()
    }

    /// Returns true if a pending or in-flight write could race a read of
    /// `paddr`: same line, any live slot. A read must not bypass a more
    /// recent buffered write to its line.
    pub fn would_hazard(&self, paddr: PhysAddr) -> bool {
        let nline: LineNumber = paddr.line(self.line_shift);
        self.slots.iter().any(|slot| {
            slot.state != SlotState::Empty && slot.paddr.line(self.line_shift) == nline
        })
    }

    /// Posts a write. Returns false (and changes nothing) when full.
    pub fn push(&mut self, paddr: PhysAddr, data: u32, be: u8) -> bool {
        if self.is_full() {
            return false;
        }
        self.slots[self.tail] = WriteEntry {
            paddr,
            be,
            data,
            state: SlotState::Pending,
        };
        self.tail = (self.tail + 1) % self.slots.len();
        self.count += 1;
        true
    }

    /// Returns the oldest unsent write and its slot index, if any.
    ///
    /// Writes are sent strictly in post order; one issued-but-unacked write
    /// per slot may be in flight at a time.
    pub fn next_to_issue(&self) -> Option<(usize, WriteEntry)> {
        if self.count == 0 {
            return None;
        }
        let mut idx = self.head;
        for _ in 0..self.count {
            match self.slots[idx].state {
                SlotState::Pending => return Some((idx, self.slots[idx])),
                SlotState::Issued => {
                    idx = (idx + 1) % self.slots.len();
                }
                SlotState::Empty => return None,
            }
        }
        None
    }

    /// Marks slot `index` as sent on the bus.
    pub fn mark_issued(&mut self, index: usize) {
        debug_assert_eq!(self.slots[index].state, SlotState::Pending);
        self.slots[index].state = SlotState::Issued;
    }

    /// Pops slot `index` on bus acknowledgement. Returns false if the slot
    /// was not in flight (a protocol violation the caller reports).
    pub fn pop(&mut self, index: usize) -> bool {
        if index >= self.slots.len() || self.slots[index].state != SlotState::Issued {
            return false;
        }
        self.slots[index].state = SlotState::Empty;
        self.count -= 1;
        // Advance head past freed slots so ordering stays FIFO.
        while self.count > 0 && self.slots[self.head].state == SlotState::Empty {
            self.head = (self.head + 1) % self.slots.len();
        }
        if self.count == 0 {
            self.head = self.tail;
        }
        true
    }
}
