// Message ID allocation and response slots for one connection.

use crate::ber::Packet;
use crate::error::{LdapError, Result};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// What the reader hands to a waiting caller: a decoded message or a per-message failure.
pub type ResponseItem = Result<Packet>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    /// One response expected; capacity 1.
    Single,
    /// Search: entries and references followed by a done message.
    Stream,
}

enum SlotSender {
    Single(mpsc::Sender<ResponseItem>),
    Stream(mpsc::UnboundedSender<ResponseItem>),
}

pub enum ResponseReceiver {
    Single(mpsc::Receiver<ResponseItem>),
    Stream(mpsc::UnboundedReceiver<ResponseItem>),
}

impl ResponseReceiver {
    /// `None` once the slot was closed (connection shutdown or removal).
    pub async fn recv(&mut self) -> Option<ResponseItem> {
        match self {
            ResponseReceiver::Single(rx) => rx.recv().await,
            ResponseReceiver::Stream(rx) => rx.recv().await,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// Slot still holds an unconsumed response; the new one was dropped.
    Full,
    /// Receiver is gone; the entry has been removed.
    Abandoned,
    /// No entry for this ID.
    Unknown,
}

struct Inner {
    next_id: i32,
    slots: HashMap<i32, SlotSender>,
    closed: bool,
}

impl Inner {
    // IDs run 1..=i32::MAX and wrap, skipping IDs still outstanding. 0 is never handed out.
    fn allocate(&mut self) -> Result<i32> {
        if self.slots.len() >= i32::MAX as usize {
            return Err(LdapError::InvalidRequest("all message IDs are in use".to_string()));
        }
        loop {
            let id = self.next_id;
            self.next_id = if id == i32::MAX { 1 } else { id + 1 };
            if !self.slots.contains_key(&id) {
                return Ok(id);
            }
        }
    }
}

pub struct MessageRegistry {
    inner: Mutex<Inner>,
}

impl Default for MessageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageRegistry {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub(crate) fn starting_at(next_id: i32) -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: next_id.max(1),
                slots: HashMap::new(),
                closed: false,
            }),
        }
    }

    // Critical sections never panic midway, so a poisoned lock still holds consistent state.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Allocate an ID and insert its slot in one critical section.
    pub fn register(&self, kind: SlotKind) -> Result<(i32, ResponseReceiver)> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(LdapError::Network("connection closed".to_string()));
        }
        let id = inner.allocate()?;
        let (sender, receiver) = match kind {
            SlotKind::Single => {
                let (tx, rx) = mpsc::channel(1);
                (SlotSender::Single(tx), ResponseReceiver::Single(rx))
            }
            SlotKind::Stream => {
                let (tx, rx) = mpsc::unbounded_channel();
                (SlotSender::Stream(tx), ResponseReceiver::Stream(rx))
            }
        };
        inner.slots.insert(id, sender);
        Ok((id, receiver))
    }

    /// One non-blocking delivery attempt.
    pub fn deliver(&self, id: i32, item: ResponseItem) -> Delivery {
        let mut inner = self.lock();
        let outcome = match inner.slots.get(&id) {
            None => return Delivery::Unknown,
            Some(SlotSender::Single(tx)) => match tx.try_send(item) {
                Ok(()) => Delivery::Delivered,
                Err(TrySendError::Full(_)) => Delivery::Full,
                Err(TrySendError::Closed(_)) => Delivery::Abandoned,
            },
            Some(SlotSender::Stream(tx)) => match tx.send(item) {
                Ok(()) => Delivery::Delivered,
                Err(_) => Delivery::Abandoned,
            },
        };
        if outcome == Delivery::Abandoned {
            inner.slots.remove(&id);
        }
        outcome
    }

    pub fn remove(&self, id: i32) -> bool {
        self.lock().slots.remove(&id).is_some()
    }

    /// Close the registry and drop every slot sender; returns how many were open.
    /// Later calls return 0.
    pub fn close_all(&self) -> usize {
        let drained: Vec<SlotSender> = {
            let mut inner = self.lock();
            inner.closed = true;
            inner.slots.drain().map(|(_, sender)| sender).collect()
        };
        drained.len()
    }

    pub fn outstanding(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn contains(&self, id: i32) -> bool {
        self.lock().slots.contains_key(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn msg() -> ResponseItem {
        Ok(Packet::sequence("msg"))
    }

    #[test]
    fn test_ids_are_sequential_and_nonzero() {
        let registry = MessageRegistry::new();
        let (a, _ra) = registry.register(SlotKind::Single).unwrap();
        let (b, _rb) = registry.register(SlotKind::Single).unwrap();
        assert_eq!((a, b), (1, 2));
        assert_eq!(registry.outstanding(), 2);
    }

    #[test]
    fn test_wraparound_skips_outstanding() {
        let registry = MessageRegistry::starting_at(i32::MAX);
        let (max, _r0) = registry.register(SlotKind::Single).unwrap();
        assert_eq!(max, i32::MAX);
        let (one, _r1) = registry.register(SlotKind::Single).unwrap();
        assert_eq!(one, 1);

        // wrap again while 1 and MAX are still taken
        let registry = MessageRegistry::starting_at(i32::MAX - 1);
        let (_a, _ra) = registry.register(SlotKind::Single).unwrap();
        let (_b, _rb) = registry.register(SlotKind::Single).unwrap();
        let (c, _rc) = registry.register(SlotKind::Single).unwrap();
        assert_eq!(c, 1);
        {
            let mut inner = registry.lock();
            inner.next_id = i32::MAX - 1;
        }
        let (d, _rd) = registry.register(SlotKind::Single).unwrap();
        assert_eq!(d, 2);
    }

    #[test]
    fn test_concurrent_registration_unique() {
        let registry = Arc::new(MessageRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    (0..200)
                        .map(|_| registry.register(SlotKind::Single).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut ids = HashSet::new();
        let mut receivers = Vec::new();
        for handle in handles {
            for (id, rx) in handle.join().unwrap() {
                assert!(ids.insert(id), "duplicate id {id}");
                receivers.push(rx);
            }
        }
        assert_eq!(ids.len(), 1600);
        assert_eq!(registry.outstanding(), 1600);
    }

    #[tokio::test]
    async fn test_deliver_single() {
        let registry = MessageRegistry::new();
        let (id, mut rx) = registry.register(SlotKind::Single).unwrap();
        assert_eq!(registry.deliver(id, msg()), Delivery::Delivered);
        assert_eq!(registry.deliver(id, msg()), Delivery::Full);
        assert!(rx.recv().await.unwrap().is_ok());
        assert_eq!(registry.deliver(id + 1, msg()), Delivery::Unknown);
        // entry stays until the caller removes it
        assert!(registry.contains(id));
        assert!(registry.remove(id));
        assert!(!registry.remove(id));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_deliver_stream_never_full() {
        let registry = MessageRegistry::new();
        let (id, mut rx) = registry.register(SlotKind::Stream).unwrap();
        for _ in 0..100 {
            assert_eq!(registry.deliver(id, msg()), Delivery::Delivered);
        }
        for _ in 0..100 {
            assert!(rx.recv().await.is_some());
        }
    }

    #[test]
    fn test_deliver_to_dropped_receiver() {
        let registry = MessageRegistry::new();
        let (id, rx) = registry.register(SlotKind::Single).unwrap();
        drop(rx);
        assert_eq!(registry.deliver(id, msg()), Delivery::Abandoned);
        assert_eq!(registry.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_close_all_wakes_every_receiver_once() {
        let registry = MessageRegistry::new();
        let mut receivers: Vec<_> = (0..5)
            .map(|i| {
                let kind = if i % 2 == 0 { SlotKind::Single } else { SlotKind::Stream };
                registry.register(kind).unwrap().1
            })
            .collect();
        assert_eq!(registry.close_all(), 5);
        assert_eq!(registry.close_all(), 0);
        for rx in receivers.iter_mut() {
            assert!(rx.recv().await.is_none());
        }
        assert!(registry.is_closed());
        let err = registry.register(SlotKind::Single).err().unwrap();
        assert!(err.is_network());
    }
}
