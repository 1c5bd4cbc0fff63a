//! Snapshot publisher: fan-out of the latest `EmsStatus` to any number of
//! subscribers.
//!
//! Built on `tokio::sync::watch`, which is a buffer of one with latest-wins
//! overwrite. A slow or idle subscriber never applies back-pressure to the
//! aggregation loop; it simply observes fewer intermediate snapshots.

use std::sync::Arc;

use futures::stream::{self, Stream};
use tokio::sync::watch;
use tracing::trace;

use crate::domain::EmsStatus;

/// Publishing side, held by the aggregation loop.
#[derive(Clone)]
pub struct Publisher {
    tx: Arc<watch::Sender<Arc<EmsStatus>>>,
}

impl Publisher {
    pub fn new(initial: Arc<EmsStatus>) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    /// Replace the published snapshot. Never blocks, even with zero
    /// subscribers.
    pub fn publish(&self, status: Arc<EmsStatus>) {
        trace!(tick = status.tick, health = %status.overall_health, "publishing snapshot");
        self.tx.send_replace(status);
    }

    /// The most recently published snapshot.
    pub fn current(&self) -> Arc<EmsStatus> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> StatusSubscription {
        StatusSubscription {
            rx: self.tx.subscribe(),
        }
    }
}

/// A consumer's view of the snapshot feed.
pub struct StatusSubscription {
    rx: watch::Receiver<Arc<EmsStatus>>,
}

impl StatusSubscription {
    /// The latest snapshot, without waiting.
    pub fn latest(&self) -> Arc<EmsStatus> {
        self.rx.borrow().clone()
    }

    /// Wait for a snapshot newer than the last one seen. Returns `None` once
    /// the publisher has been dropped.
    pub async fn next(&mut self) -> Option<Arc<EmsStatus>> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    /// Adapt the subscription into a `Stream` of snapshots.
    pub fn into_stream(self) -> impl Stream<Item = Arc<EmsStatus>> {
        stream::unfold(self, |mut sub| async move {
            sub.next().await.map(|status| (status, sub))
        })
    }
}
