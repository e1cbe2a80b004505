//! Rendezvous handoff between a transport's ingestion task and the agent loop
//!
//! A producer's [`Handoff::send`] completes only once the consumer has taken the item, so at
//! most one item is ever waiting. Items are fed in batches; [`Handoff::abandon`] ends the
//! current batch, which stops its producer and discards any of its items still in the slot.

use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffError {
    #[error("handoff cancelled")]
    Cancelled,

    #[error("batch abandoned")]
    Abandoned,

    #[error("handoff closed")]
    Closed,
}

struct Offer<T> {
    item: T,
    generation: u64,
    accepted: oneshot::Sender<()>,
}

struct Generation {
    id: u64,
    token: CancellationToken,
}

/// Snapshot of the batch a producer is feeding
#[derive(Debug, Clone)]
pub struct Batch {
    generation: u64,
    token: CancellationToken,
}

impl Batch {
    pub fn is_abandoned(&self) -> bool {
        self.token.is_cancelled()
    }
}

pub struct Handoff<T> {
    tx: mpsc::Sender<Offer<T>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Offer<T>>>,
    current: Mutex<Generation>,
}

impl<T: Send> Handoff<T> {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            current: Mutex::new(Generation {
                id: 0,
                token: CancellationToken::new(),
            }),
        }
    }

    /// Start (or join) the current batch.
    pub fn batch(&self) -> Batch {
        let current = self.lock();
        Batch {
            generation: current.id,
            token: current.token.clone(),
        }
    }

    /// End the current batch. Its producer's pending and future sends fail with
    /// [`HandoffError::Abandoned`] and its undelivered item is dropped.
    pub fn abandon(&self) {
        let mut current = self.lock();
        current.token.cancel();
        current.id += 1;
        current.token = CancellationToken::new();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Generation> {
        // The guarded state is two plain fields; a poisoned lock still holds valid data.
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn generation(&self) -> u64 {
        self.lock().id
    }

    /// Offer `item` and wait until the consumer takes it.
    pub async fn send(
        &self,
        batch: &Batch,
        item: T,
        shutdown: &CancellationToken,
    ) -> Result<(), HandoffError> {
        if batch.generation != self.generation() {
            return Err(HandoffError::Abandoned);
        }

        let (accepted, taken) = oneshot::channel();
        let offer = Offer {
            item,
            generation: batch.generation,
            accepted,
        };

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Err(HandoffError::Cancelled),
            _ = batch.token.cancelled() => return Err(HandoffError::Abandoned),
            sent = self.tx.send(offer) => sent.map_err(|_| HandoffError::Closed)?,
        }

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => Err(HandoffError::Cancelled),
            taken = taken => taken.map_err(|_| HandoffError::Abandoned),
            _ = batch.token.cancelled() => Err(HandoffError::Abandoned),
        }
    }

    /// Take the next item of the current batch.
    pub async fn recv(&self, shutdown: &CancellationToken) -> Result<T, HandoffError> {
        let mut rx = tokio::select! {
            _ = shutdown.cancelled() => return Err(HandoffError::Cancelled),
            rx = self.rx.lock() => rx,
        };

        loop {
            let offer = tokio::select! {
                _ = shutdown.cancelled() => return Err(HandoffError::Cancelled),
                offer = rx.recv() => offer.ok_or(HandoffError::Closed)?,
            };

            if offer.generation != self.generation() {
                tracing::debug!("[Handoff] Dropping item from abandoned batch");
                continue;
            }
            if offer.accepted.send(()).is_err() {
                // The producer gave up after offering.
                continue;
            }
            return Ok(offer.item);
        }
    }
}

impl<T: Send> Default for Handoff<T> {
    fn default() -> Self {
        Self::new()
    }
}
