//! Keyed state store: one [StateEntry] per facility, owned by an actor task.
//!
//! The actor serializes every message on a single channel, which is what gives
//! the pipeline its consistency guarantees: a `Snapshot` request queued after
//! a batch's `Put`s observes all of them, and no reader can interleave between
//! a `Get` and the matching `Put` for the same key because the forwarder is
//! the only writer and processes one batch at a time.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::error::Error;
use crate::message::ReadingValue;

/// Per-facility memory of the last emitted value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct StateEntry {
    /// Comparable fields of the most recently emitted reading for this key.
    pub(crate) last_emitted: ReadingValue,
    /// Timestamp of the most recent reading processed for this key, emitted
    /// or not. Duplicates advance it too; it drives the eviction sweep.
    pub(crate) last_seen_at: DateTime<Utc>,
}

enum ActorMessage {
    Get {
        key: String,
        respond_to: oneshot::Sender<Option<StateEntry>>,
    },
    Put {
        key: String,
        entry: StateEntry,
    },
    Evict {
        key: String,
    },
    Snapshot {
        respond_to: oneshot::Sender<Vec<(String, StateEntry)>>,
    },
    Seed {
        entries: Vec<(String, StateEntry)>,
    },
    #[cfg(test)]
    Len {
        respond_to: oneshot::Sender<usize>,
    },
}

struct StateStore {
    entries: HashMap<String, StateEntry>,
    receiver: mpsc::Receiver<ActorMessage>,
}

impl StateStore {
    fn new(receiver: mpsc::Receiver<ActorMessage>) -> Self {
        Self {
            entries: HashMap::new(),
            receiver,
        }
    }

    async fn run(mut self) {
        while let Some(message) = self.receiver.recv().await {
            self.handle_message(message);
        }
    }

    fn handle_message(&mut self, message: ActorMessage) {
        match message {
            ActorMessage::Get { key, respond_to } => {
                let _ = respond_to.send(self.entries.get(&key).cloned());
            }
            ActorMessage::Put { key, entry } => {
                self.entries.insert(key, entry);
            }
            ActorMessage::Evict { key } => {
                // evicting an absent key is a no-op
                self.entries.remove(&key);
            }
            ActorMessage::Snapshot { respond_to } => {
                let snapshot = self
                    .entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                let _ = respond_to.send(snapshot);
            }
            ActorMessage::Seed { entries } => {
                self.entries = entries.into_iter().collect();
            }
            #[cfg(test)]
            ActorMessage::Len { respond_to } => {
                let _ = respond_to.send(self.entries.len());
            }
        }
    }
}

/// Handle to the state store actor. Cheap to clone.
#[derive(Clone)]
pub(crate) struct StateStoreHandle {
    sender: mpsc::Sender<ActorMessage>,
}

impl StateStoreHandle {
    pub(crate) fn new() -> Self {
        let (sender, receiver) = mpsc::channel(500);
        tokio::spawn(StateStore::new(receiver).run());
        Self { sender }
    }

    /// Look up the entry for a key. Absence is a valid, expected result for
    /// unseen (or evicted) keys.
    pub(crate) async fn get(&self, key: &str) -> crate::Result<Option<StateEntry>> {
        let (tx, rx) = oneshot::channel();
        let msg = ActorMessage::Get {
            key: key.to_string(),
            respond_to: tx,
        };
        // Ignore send errors. If send fails, so does the recv.await below. There's no reason
        // to check for the same failure twice.
        let _ = self.sender.send(msg).await;
        rx.await
            .map_err(|e| Error::ActorPatternRecv(e.to_string()))
    }

    /// Overwrite the entry for a key. Ordered with respect to every other
    /// message on this handle, so a snapshot requested afterwards sees it.
    pub(crate) async fn put(&self, key: String, entry: StateEntry) -> crate::Result<()> {
        self.sender
            .send(ActorMessage::Put { key, entry })
            .await
            .map_err(|e| Error::StateStore(format!("Sending put to state store: {e}")))
    }

    pub(crate) async fn evict(&self, key: String) -> crate::Result<()> {
        self.sender
            .send(ActorMessage::Evict { key })
            .await
            .map_err(|e| Error::StateStore(format!("Sending evict to state store: {e}")))
    }

    /// A consistent point-in-time view of the whole store, for checkpointing.
    pub(crate) async fn snapshot(&self) -> crate::Result<Vec<(String, StateEntry)>> {
        let (tx, rx) = oneshot::channel();
        let _ = self.sender.send(ActorMessage::Snapshot { respond_to: tx }).await;
        rx.await
            .map_err(|e| Error::ActorPatternRecv(e.to_string()))
    }

    /// Replace the store contents wholesale; used once while restoring.
    pub(crate) async fn seed(&self, entries: Vec<(String, StateEntry)>) -> crate::Result<()> {
        self.sender
            .send(ActorMessage::Seed { entries })
            .await
            .map_err(|e| Error::StateStore(format!("Sending seed to state store: {e}")))
    }

    #[cfg(test)]
    pub(crate) async fn len(&self) -> crate::Result<usize> {
        let (tx, rx) = oneshot::channel();
        let _ = self.sender.send(ActorMessage::Len { respond_to: tx }).await;
        rx.await
            .map_err(|e| Error::ActorPatternRecv(e.to_string()))
    }
}
