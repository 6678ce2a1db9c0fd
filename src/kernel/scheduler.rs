//! Strict-priority ready queue and the dispatcher seam.
//!
//! Ready threads are kept sorted by priority, most urgent first. Within one
//! priority level threads are served in arrival order; a preempted thread is
//! put back at the head of its level so it resumes before its peers.

use crate::kernel::priority::ThreadPriority;
use crate::kernel::thread::{ThreadEntry, ThreadId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerError {
    QueueFull,
}

/// Why a thread is (re)entering the ready queue; decides where it lands
/// within its priority level.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RescheduleReason {
    /// Displaced by a more urgent thread before it gave up the core.
    Preempted,
    /// Gave up the core voluntarily.
    Yielded,
    /// Used up its round-robin time slice.
    Ticked,
    /// A wait completed or a suspension was lifted.
    Woken,
    /// Newly created.
    Started,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadyEntry {
    pub id: ThreadId,
    pub priority: ThreadPriority,
}

pub struct ReadyQueue<const MAX: usize> {
    entries: [Option<ReadyEntry>; MAX],
    len: usize,
}

impl<const MAX: usize> ReadyQueue<MAX> {
    pub const fn new() -> Self {
        Self {
            entries: [None; MAX],
            len: 0,
        }
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn insert(
        &mut self,
        id: ThreadId,
        priority: ThreadPriority,
        reason: RescheduleReason,
    ) -> Result<(), SchedulerError> {
        if self.len == MAX {
            return Err(SchedulerError::QueueFull);
        }

        let position = match reason {
            RescheduleReason::Preempted => self.position(|p| p <= priority),
            _ => self.position(|p| p < priority),
        };

        let mut idx = self.len;
        while idx > position {
            self.entries[idx] = self.entries[idx - 1];
            idx -= 1;
        }
        self.entries[position] = Some(ReadyEntry { id, priority });
        self.len += 1;
        Ok(())
    }

    /// Takes the most urgent thread.
    pub fn pop(&mut self) -> Option<ReadyEntry> {
        if self.len == 0 {
            return None;
        }
        let head = self.entries[0];
        self.remove_at(0);
        head
    }

    pub fn remove(&mut self, id: ThreadId) -> bool {
        match self.find(id) {
            Some(idx) => {
                self.remove_at(idx);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: ThreadId) -> bool {
        self.find(id).is_some()
    }

    pub fn highest_priority(&self) -> Option<ThreadPriority> {
        self.entries[..self.len]
            .first()
            .and_then(|entry| entry.map(|e| e.priority))
    }

    /// Whether a ready thread would take the core from one at `priority`.
    pub fn outranks(&self, priority: ThreadPriority) -> bool {
        self.highest_priority().is_some_and(|p| p > priority)
    }

    pub fn has_peer(&self, priority: ThreadPriority) -> bool {
        self.iter().any(|entry| entry.priority == priority)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReadyEntry> + '_ {
        self.entries[..self.len].iter().flatten()
    }

    fn position(&self, mut stop: impl FnMut(ThreadPriority) -> bool) -> usize {
        self.iter()
            .position(|entry| stop(entry.priority))
            .unwrap_or(self.len)
    }

    fn find(&self, id: ThreadId) -> Option<usize> {
        self.iter().position(|entry| entry.id == id)
    }

    fn remove_at(&mut self, position: usize) {
        let mut idx = position;
        while idx + 1 < self.len {
            self.entries[idx] = self.entries[idx + 1];
            idx += 1;
        }
        self.len -= 1;
        self.entries[self.len] = None;
    }
}

impl<const MAX: usize> Default for ReadyQueue<MAX> {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything a port needs to resume or start a thread.
#[derive(Clone, Copy, Debug)]
pub struct Dispatch {
    pub id: ThreadId,
    pub entry: ThreadEntry,
    pub argument: usize,
    /// Set the first time the thread gets the core; the port must build its
    /// initial frame and enter `entry(argument)`.
    pub first_run: bool,
}

/// The context-switch primitive supplied by the port.
pub trait Dispatcher {
    /// Called after the manager has picked the next thread. `to == None`
    /// means no thread is ready and the core should idle.
    fn switch_to(&mut self, from: Option<ThreadId>, to: Option<Dispatch>);
}

/// Dispatcher for hosts that only track state, such as simulations.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoDispatch;

impl Dispatcher for NoDispatch {
    fn switch_to(&mut self, _from: Option<ThreadId>, _to: Option<Dispatch>) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(index: u16) -> ThreadId {
        ThreadId::new(index, 1)
    }

    #[test]
    fn pops_highest_priority_first() {
        let mut queue: ReadyQueue<4> = ReadyQueue::new();
        queue
            .insert(id(0), ThreadPriority::LOW, RescheduleReason::Started)
            .unwrap();
        queue
            .insert(id(1), ThreadPriority::HIGH, RescheduleReason::Started)
            .unwrap();
        queue
            .insert(id(2), ThreadPriority::NORMAL, RescheduleReason::Started)
            .unwrap();
        assert_eq!(queue.highest_priority(), Some(ThreadPriority::HIGH));
        assert_eq!(queue.pop().map(|e| e.id), Some(id(1)));
        assert_eq!(queue.pop().map(|e| e.id), Some(id(2)));
        assert_eq!(queue.pop().map(|e| e.id), Some(id(0)));
        assert!(queue.pop().is_none());
    }

    #[test]
    fn equal_priority_is_fifo_and_preempted_goes_first() {
        let mut queue: ReadyQueue<4> = ReadyQueue::new();
        queue
            .insert(id(0), ThreadPriority::NORMAL, RescheduleReason::Started)
            .unwrap();
        queue
            .insert(id(1), ThreadPriority::NORMAL, RescheduleReason::Woken)
            .unwrap();
        queue
            .insert(id(2), ThreadPriority::NORMAL, RescheduleReason::Preempted)
            .unwrap();
        let order: Vec<_> = queue.iter().map(|e| e.id).collect();
        assert_eq!(order, vec![id(2), id(0), id(1)]);
    }

    #[test]
    fn full_queue_rejects_insert() {
        let mut queue: ReadyQueue<1> = ReadyQueue::new();
        queue
            .insert(id(0), ThreadPriority::NORMAL, RescheduleReason::Started)
            .unwrap();
        assert_eq!(
            queue.insert(id(1), ThreadPriority::NORMAL, RescheduleReason::Started),
            Err(SchedulerError::QueueFull)
        );
    }

    #[test]
    fn remove_keeps_order() {
        let mut queue: ReadyQueue<4> = ReadyQueue::new();
        for idx in 0..3 {
            queue
                .insert(id(idx), ThreadPriority::NORMAL, RescheduleReason::Started)
                .unwrap();
        }
        assert!(queue.remove(id(1)));
        assert!(!queue.remove(id(1)));
        assert!(!queue.contains(id(1)));
        let order: Vec<_> = queue.iter().map(|e| e.id).collect();
        assert_eq!(order, vec![id(0), id(2)]);
        assert!(queue.has_peer(ThreadPriority::NORMAL));
        assert!(!queue.outranks(ThreadPriority::NORMAL));
        assert!(queue.outranks(ThreadPriority::LOW));
    }
}
