//! Sink seam: a sink accepts a batch of emissions and reports per-record
//! success or failure, so the forwarder can retry exactly the records that
//! failed. Like the source, the concrete sink runs behind an actor task.

use tokio::sync::{mpsc, oneshot};

use crate::error::Error;
use crate::message::Emission;

pub(crate) mod log;

#[trait_variant::make(Sink: Send)]
pub(crate) trait LocalSink {
    async fn sink(&mut self, emissions: Vec<Emission>) -> crate::Result<Vec<ResponseFromSink>>;
}

/// Sink's response per emission, keyed by the emission's in-batch id.
#[derive(Debug, PartialEq)]
pub(crate) struct ResponseFromSink {
    pub(crate) id: String,
    pub(crate) status: ResponseStatusFromSink,
}

#[derive(Debug, PartialEq)]
pub(crate) enum ResponseStatusFromSink {
    /// Write was successful.
    Success,
    /// Write failed with the given reason; the record will be retried.
    Failed(String),
}

enum ActorMessage {
    Sink {
        emissions: Vec<Emission>,
        respond_to: oneshot::Sender<crate::Result<Vec<ResponseFromSink>>>,
    },
}

struct SinkActor<S> {
    receiver: mpsc::Receiver<ActorMessage>,
    sink: S,
}

impl<S> SinkActor<S>
where
    S: Sink,
{
    fn new(receiver: mpsc::Receiver<ActorMessage>, sink: S) -> Self {
        Self { receiver, sink }
    }

    async fn handle_message(&mut self, msg: ActorMessage) {
        match msg {
            ActorMessage::Sink {
                emissions,
                respond_to,
            } => {
                let responses = self.sink.sink(emissions).await;
                let _ = respond_to.send(responses);
            }
        }
    }
}

/// Handle to the sink actor. Cheap to clone.
#[derive(Clone)]
pub(crate) struct SinkHandle {
    sender: mpsc::Sender<ActorMessage>,
}

impl SinkHandle {
    pub(crate) fn new<S>(sink: S) -> Self
    where
        S: Sink + Send + 'static,
    {
        let (sender, receiver) = mpsc::channel(10);
        tokio::spawn(async move {
            let mut actor = SinkActor::new(receiver, sink);
            while let Some(msg) = actor.receiver.recv().await {
                actor.handle_message(msg).await;
            }
        });
        Self { sender }
    }

    pub(crate) async fn sink(
        &self,
        emissions: Vec<Emission>,
    ) -> crate::Result<Vec<ResponseFromSink>> {
        let (tx, rx) = oneshot::channel();
        let msg = ActorMessage::Sink {
            emissions,
            respond_to: tx,
        };
        // Ignore send errors. If send fails, so does the recv.await below. There's no reason
        // to check for the same failure twice.
        let _ = self.sender.send(msg).await;
        rx.await
            .map_err(|e| Error::ActorPatternRecv(e.to_string()))?
    }
}
