//! Streaming bridge.
//!
//! Normalizes every producer shape — direct pushes from cooperative tasks,
//! async streaming translation loops, and producers that own their own
//! scheduling domain and must run on a dedicated worker thread — into one
//! ordered `OutputEvent` sequence behind a single primitive, instead of ad
//! hoc thread+queue pairs per handler.
//!
//! The channel is bounded: a slow consumer stalls the producer's push,
//! items are never dropped or reordered. The producer side finishes with an
//! explicit end-of-stream sentinel; the consumer yields events until the
//! sentinel arrives or every sender is gone.

use tokio::sync::mpsc;

use crate::events::OutputEvent;

/// Wire item on the hand-off channel. The sentinel is explicit so a
/// consumer can distinguish "producer finished" from "producer vanished".
#[derive(Debug)]
enum Handoff {
    Item(OutputEvent),
    End,
}

/// Producer half for cooperative (same scheduling domain) producers.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<Handoff>,
}

impl EventSink {
    /// Push one event, waiting if the channel is full (backpressure).
    /// Returns false once the consumer is gone; producers should unwind.
    pub async fn send(&self, event: OutputEvent) -> bool {
        self.tx.send(Handoff::Item(event)).await.is_ok()
    }

    /// Send the end-of-stream sentinel. Idempotent from the consumer's
    /// point of view: the stream stops at the first sentinel it sees.
    pub async fn finish(&self) {
        let _ = self.tx.send(Handoff::End).await;
    }

    /// Handle for producers running outside the async scheduling domain
    /// (dedicated worker threads). Pushes block the worker, not the
    /// runtime.
    pub fn worker_handle(&self) -> WorkerSink {
        WorkerSink {
            tx: self.tx.clone(),
        }
    }
}

/// Blocking producer half, used from dedicated worker threads.
pub struct WorkerSink {
    tx: mpsc::Sender<Handoff>,
}

impl WorkerSink {
    /// Blocking push. Returns false once the consumer is gone.
    pub fn send(&self, event: OutputEvent) -> bool {
        self.tx.blocking_send(Handoff::Item(event)).is_ok()
    }

    pub fn finish(&self) {
        let _ = self.tx.blocking_send(Handoff::End);
    }
}

/// Consumer half.
pub struct EventStream {
    rx: mpsc::Receiver<Handoff>,
    ended: bool,
}

impl EventStream {
    /// Next event, in push order. `None` after the sentinel or once all
    /// senders are dropped.
    pub async fn next(&mut self) -> Option<OutputEvent> {
        if self.ended {
            return None;
        }
        match self.rx.recv().await {
            Some(Handoff::Item(event)) => Some(event),
            Some(Handoff::End) | None => {
                self.ended = true;
                None
            }
        }
    }

    /// Drain the remaining sequence into a vector (used by non-streaming
    /// callers and nested agent dispatch).
    pub async fn collect(mut self) -> Vec<OutputEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await {
            events.push(event);
        }
        events
    }
}

/// Create a bounded bridge channel.
pub fn channel(capacity: usize) -> (EventSink, EventStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (EventSink { tx }, EventStream { rx, ended: false })
}
