//! Source seam: a source produces one [Batch] per polling cycle and is told,
//! via ack, when a batch has been fully processed and checkpointed. The
//! concrete source runs behind an actor task so the forwarder only ever holds
//! a cheap cloneable handle.

use tokio::sync::{mpsc, oneshot};

use crate::error::Error;
use crate::message::Batch;

/// [Grand Lyon feed] adapter, the builtin production source.
///
/// [Grand Lyon feed]: https://data.grandlyon.com
pub(crate) mod lyon;

/// Read side of a source: produce the next polling cycle's batch. `None`
/// means the source is exhausted; only finite (test) sources do that.
#[trait_variant::make(SourceReader: Send)]
pub(crate) trait LocalSourceReader {
    #[allow(dead_code)]
    /// Name of the source.
    fn name(&self) -> &'static str;

    async fn read(&mut self) -> crate::Result<Option<Batch>>;
}

/// Ack side of a source: mark a batch as fully processed. For sources that
/// cannot replay this is a no-op.
#[trait_variant::make(SourceAcker: Send)]
pub(crate) trait LocalSourceAcker {
    async fn ack(&mut self, batch_id: u64) -> crate::Result<()>;
}

#[derive(Debug)]
enum ActorMessage {
    Read {
        respond_to: oneshot::Sender<crate::Result<Option<Batch>>>,
    },
    Ack {
        batch_id: u64,
        respond_to: oneshot::Sender<crate::Result<()>>,
    },
}

struct SourceActor<R, A> {
    receiver: mpsc::Receiver<ActorMessage>,
    reader: R,
    acker: A,
}

impl<R, A> SourceActor<R, A>
where
    R: SourceReader,
    A: SourceAcker,
{
    fn new(receiver: mpsc::Receiver<ActorMessage>, reader: R, acker: A) -> Self {
        Self {
            receiver,
            reader,
            acker,
        }
    }

    async fn handle_message(&mut self, msg: ActorMessage) {
        match msg {
            ActorMessage::Read { respond_to } => {
                let batch = self.reader.read().await;
                let _ = respond_to.send(batch);
            }
            ActorMessage::Ack {
                batch_id,
                respond_to,
            } => {
                let ack = self.acker.ack(batch_id).await;
                let _ = respond_to.send(ack);
            }
        }
    }
}

/// Handle to the source actor. Cheap to clone.
#[derive(Clone)]
pub(crate) struct SourceHandle {
    sender: mpsc::Sender<ActorMessage>,
}

impl SourceHandle {
    pub(crate) fn new<R, A>(reader: R, acker: A) -> Self
    where
        R: SourceReader + Send + 'static,
        A: SourceAcker + Send + 'static,
    {
        let (sender, receiver) = mpsc::channel(10);
        tokio::spawn(async move {
            let mut actor = SourceActor::new(receiver, reader, acker);
            while let Some(msg) = actor.receiver.recv().await {
                actor.handle_message(msg).await;
            }
        });
        Self { sender }
    }

    pub(crate) async fn read(&self) -> crate::Result<Option<Batch>> {
        let (tx, rx) = oneshot::channel();
        let msg = ActorMessage::Read { respond_to: tx };
        // Ignore send errors. If send fails, so does the recv.await below. There's no reason
        // to check for the same failure twice.
        let _ = self.sender.send(msg).await;
        rx.await
            .map_err(|e| Error::ActorPatternRecv(e.to_string()))?
    }

    pub(crate) async fn ack(&self, batch_id: u64) -> crate::Result<()> {
        let (tx, rx) = oneshot::channel();
        let msg = ActorMessage::Ack {
            batch_id,
            respond_to: tx,
        };
        let _ = self.sender.send(msg).await;
        rx.await
            .map_err(|e| Error::ActorPatternRecv(e.to_string()))?
    }
}
