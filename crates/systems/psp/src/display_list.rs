//! Display list records and the list queue.
//!
//! Lists live in a fixed number of slots; a list's id is its slot index.
//! `order` is the submission order, and its front is the list the
//! dispatcher works on.

use crate::GpuError;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

pub const MAX_DISPLAY_LISTS: usize = 64;
pub const MAX_CALL_STACK: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ListState {
    Queued,
    Running,
    /// Waiting for the stall address to move
    Stalled,
    /// Stopped by a PAUSE signal until `continue_list`
    Paused,
    Completed,
}

/// Return information pushed by CALL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackEntry {
    pub pc: u32,
    pub offset_addr: u32,
    pub base_addr: u32,
}

/// What a SIGNAL + END pair asks for, from bits 23..16 of the SIGNAL word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalBehavior {
    Suspend,
    Continue,
    Pause,
    Sync,
    Jump,
    Call,
    Ret,
    RelativeJump,
    RelativeCall,
    OriginJump,
    OriginCall,
    Other(u8),
}

impl SignalBehavior {
    pub fn from_signal(data: u32) -> Self {
        match ((data >> 16) & 0xFF) as u8 {
            0x01 => SignalBehavior::Suspend,
            0x02 => SignalBehavior::Continue,
            0x03 => SignalBehavior::Pause,
            0x08 => SignalBehavior::Sync,
            0x10 => SignalBehavior::Jump,
            0x11 => SignalBehavior::Call,
            0x12 => SignalBehavior::Ret,
            0x13 => SignalBehavior::RelativeJump,
            0x14 => SignalBehavior::RelativeCall,
            0x15 => SignalBehavior::OriginJump,
            0x16 => SignalBehavior::OriginCall,
            other => SignalBehavior::Other(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayList {
    pub id: usize,
    pub start_pc: u32,
    pub pc: u32,
    /// 0 means no stall address
    pub stall: u32,
    pub state: ListState,
    pub stack: Vec<StackEntry>,
    pub bbox_result: bool,
    /// Set by SUSPEND/CONTINUE signals; cleared by the host
    pub interrupt_pending: bool,
    /// Low 16 bits of the last signal
    pub signal_data: u32,
    pub offset_addr: u32,
}

impl DisplayList {
    pub fn new(id: usize, pc: u32, stall: u32) -> Self {
        Self {
            id,
            start_pc: pc,
            pc,
            stall,
            state: ListState::Queued,
            stack: Vec::new(),
            bbox_result: true,
            interrupt_pending: false,
            signal_data: 0,
            offset_addr: 0,
        }
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.state == ListState::Completed
    }

    /// Words left before the stall address, or unbounded without one.
    pub fn downcount(&self) -> u32 {
        if self.stall == 0 {
            0x0FFF_FFFF
        } else {
            self.stall.wrapping_sub(self.pc) / 4
        }
    }

    #[inline]
    pub fn at_stall(&self) -> bool {
        self.stall != 0 && self.pc == self.stall
    }
}

#[derive(Debug, Clone)]
pub struct DisplayListQueue {
    slots: Vec<Option<DisplayList>>,
    order: VecDeque<usize>,
}

impl DisplayListQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, MAX_DISPLAY_LISTS);
        Self {
            slots: vec![None; capacity],
            order: VecDeque::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Add a list at the back of the queue and return its id.
    pub fn enqueue(&mut self, pc: u32, stall: u32) -> Result<usize, GpuError> {
        let id = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(GpuError::ListQueueFull(self.slots.len()))?;
        self.slots[id] = Some(DisplayList::new(id, pc, stall));
        self.order.push_back(id);
        Ok(id)
    }

    pub fn get(&self, id: usize) -> Option<&DisplayList> {
        self.slots.get(id).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut DisplayList> {
        self.slots.get_mut(id).and_then(Option::as_mut)
    }

    /// The list at the front of the queue.
    pub fn front(&self) -> Option<usize> {
        self.order.front().copied()
    }

    pub fn current(&self) -> Option<&DisplayList> {
        self.front().and_then(|id| self.get(id))
    }

    pub fn current_mut(&mut self) -> Option<&mut DisplayList> {
        let id = self.front()?;
        self.get_mut(id)
    }

    /// Free a list's slot.
    pub fn retire(&mut self, id: usize) -> Option<DisplayList> {
        self.order.retain(|&i| i != id);
        self.slots.get_mut(id).and_then(Option::take)
    }

    pub fn order(&self) -> impl Iterator<Item = usize> + '_ {
        self.order.iter().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DisplayList> {
        self.order.iter().filter_map(|&id| self.get(id))
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
        self.order.clear();
    }

    /// Rebuild from saved lists, in queue order.
    pub fn restore(&mut self, lists: Vec<DisplayList>) -> Result<(), GpuError> {
        self.clear();
        for list in lists {
            let id = list.id;
            match self.slots.get_mut(id) {
                Some(slot @ None) => *slot = Some(list),
                _ => return Err(GpuError::InvalidListId(id)),
            }
            self.order.push_back(id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enqueue_assigns_free_slots() {
        let mut q = DisplayListQueue::new(4);
        let a = q.enqueue(0x0800_0000, 0).unwrap();
        let b = q.enqueue(0x0800_1000, 0).unwrap();
        assert_eq!((a, b), (0, 1));
        assert_eq!(q.front(), Some(0));

        q.retire(a);
        assert_eq!(q.front(), Some(1));
        assert_eq!(q.enqueue(0x0800_2000, 0).unwrap(), 0);
        assert_eq!(q.order().collect::<Vec<_>>(), vec![1, 0]);
    }

    #[test]
    fn test_queue_full() {
        let mut q = DisplayListQueue::new(2);
        q.enqueue(0x0800_0000, 0).unwrap();
        q.enqueue(0x0800_0000, 0).unwrap();
        assert!(matches!(
            q.enqueue(0x0800_0000, 0),
            Err(GpuError::ListQueueFull(2))
        ));
    }

    #[test]
    fn test_capacity_is_capped() {
        assert_eq!(DisplayListQueue::new(1000).capacity(), MAX_DISPLAY_LISTS);
        assert_eq!(DisplayListQueue::new(0).capacity(), 1);
    }

    #[test]
    fn test_downcount() {
        let mut list = DisplayList::new(0, 0x0800_0000, 0);
        assert_eq!(list.downcount(), 0x0FFF_FFFF);
        list.stall = 0x0800_0010;
        assert_eq!(list.downcount(), 4);
        list.pc = 0x0800_0010;
        assert!(list.at_stall());
        assert_eq!(list.downcount(), 0);
    }

    #[test]
    fn test_signal_behavior_decode() {
        assert_eq!(SignalBehavior::from_signal(0x03_0000), SignalBehavior::Pause);
        assert_eq!(SignalBehavior::from_signal(0x13_0040), SignalBehavior::RelativeJump);
        assert_eq!(SignalBehavior::from_signal(0x42_0000), SignalBehavior::Other(0x42));
    }

    #[test]
    fn test_restore_rejects_duplicate_ids() {
        let mut q = DisplayListQueue::new(4);
        let lists = vec![
            DisplayList::new(1, 0x0800_0000, 0),
            DisplayList::new(1, 0x0800_0100, 0),
        ];
        assert!(matches!(q.restore(lists), Err(GpuError::InvalidListId(1))));
    }
}
