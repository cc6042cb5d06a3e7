//! Generic revisioned record storage with optimistic concurrency and
//! resumable watch streams.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use tokio::sync::broadcast;
use tracing::warn;

use super::records::Record;
use crate::{Error, Result};

pub type Revision = u64;

/// A record together with the revision of its last write.
#[derive(Clone, Debug)]
pub struct Stored<T> {
    pub record: T,
    pub revision: Revision,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Added,
    Modified,
    Deleted,
}

#[derive(Clone, Debug)]
pub struct Event<T> {
    pub kind: EventKind,
    pub record: T,
    pub revision: Revision,
}

const WATCH_BUFFER: usize = 1024;

/// One collection of records of a single kind. Every mutation bumps the
/// collection revision; writers must present the revision they read to
/// update, and lose with [`Error::Conflict`] when it is stale.
pub struct Collection<T: Record> {
    shared: Mutex<Shared<T>>,
    tx: broadcast::Sender<Event<T>>,
}

struct Shared<T> {
    items: BTreeMap<String, Stored<T>>,
    revision: Revision,
}

impl<T: Record> Collection<T> {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(WATCH_BUFFER);
        Self {
            shared: Mutex::new(Shared {
                items: BTreeMap::new(),
                revision: 0,
            }),
            tx,
        }
    }

    /// All records, sorted by key.
    pub fn list(&self) -> Vec<Stored<T>> {
        let shared = self.shared.lock().unwrap();
        shared.items.values().cloned().collect()
    }

    pub fn get(&self, key: &str) -> Result<Stored<T>> {
        let shared = self.shared.lock().unwrap();
        shared.items.get(key).cloned().ok_or_else(|| Error::NotFound {
            kind: T::KIND,
            name: key.to_owned(),
        })
    }

    pub fn create(&self, record: T) -> Result<Stored<T>> {
        let mut shared = self.shared.lock().unwrap();
        let key = record.key();
        if shared.items.contains_key(&key) {
            return Err(Error::AlreadyExists {
                kind: T::KIND,
                name: key,
            });
        }
        shared.revision += 1;
        let stored = Stored {
            record,
            revision: shared.revision,
        };
        shared.items.insert(key, stored.clone());
        // Send while holding the lock so a subscriber registered through
        // watch() either has this record in its snapshot or receives the
        // event, never neither.
        let _ = self.tx.send(Event {
            kind: EventKind::Added,
            record: stored.record.clone(),
            revision: stored.revision,
        });
        Ok(stored)
    }

    pub fn update(&self, expected: Revision, record: T) -> Result<Stored<T>> {
        let mut shared = self.shared.lock().unwrap();
        let key = record.key();
        let Some(current) = shared.items.get(&key) else {
            return Err(Error::NotFound {
                kind: T::KIND,
                name: key,
            });
        };
        if current.revision != expected {
            return Err(Error::Conflict {
                kind: T::KIND,
                name: key,
                stored: current.revision,
                expected,
            });
        }
        shared.revision += 1;
        let stored = Stored {
            record,
            revision: shared.revision,
        };
        shared.items.insert(key, stored.clone());
        let _ = self.tx.send(Event {
            kind: EventKind::Modified,
            record: stored.record.clone(),
            revision: stored.revision,
        });
        Ok(stored)
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        let mut shared = self.shared.lock().unwrap();
        let Some(previous) = shared.items.remove(key) else {
            return Err(Error::NotFound {
                kind: T::KIND,
                name: key.to_owned(),
            });
        };
        shared.revision += 1;
        let _ = self.tx.send(Event {
            kind: EventKind::Deleted,
            record: previous.record,
            revision: shared.revision,
        });
        Ok(())
    }

    /// Opens a watch stream. It first yields a synthetic `Added` event for
    /// every pre-existing record, then live events in emission order. A
    /// stream that falls behind terminates; the consumer re-watches, which
    /// re-lists through the synthetic `Added`s.
    pub fn watch(&self) -> Watch<T> {
        let shared = self.shared.lock().unwrap();
        let rx = self.tx.subscribe();
        let backlog = shared
            .items
            .values()
            .map(|stored| Event {
                kind: EventKind::Added,
                record: stored.record.clone(),
                revision: stored.revision,
            })
            .collect();
        Watch { backlog, rx }
    }
}

impl<T: Record> Default for Collection<T> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Watch<T> {
    backlog: VecDeque<Event<T>>,
    rx: broadcast::Receiver<Event<T>>,
}

impl<T: Record> Watch<T> {
    /// `None` means the stream terminated; re-watch to re-list and resume.
    pub async fn next(&mut self) -> Option<Event<T>> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }
        match self.rx.recv().await {
            Ok(event) => Some(event),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!("{} watch lagged behind by {} events", T::KIND, missed);
                None
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }
}
