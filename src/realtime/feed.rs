//! Per-viewer push feed
//!
//! Opening a feed sends an immediate statistics snapshot, then a fresh
//! snapshot after bus events for the poll, plus a heartbeat on a fixed
//! interval. Events that arrive while a recompute is pending collapse into
//! one, so a slow viewer holds at most one pending notification.
//! Dropping the [`LiveFeed`] removes the bus subscription at once and
//! cancels the task that owns the heartbeat timer.

use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::{LiveUpdateBus, Subscription};
use crate::stats::{PollStatistics, StatisticsEngine};
use crate::types::PollId;
use crate::{Error, Result};

/// Events buffered per viewer before the feed applies backpressure
const FEED_BUFFER: usize = 16;

/// What a viewer receives
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum FeedEvent {
    /// First message after connecting
    Snapshot(PollStatistics),
    /// Recomputed statistics after a change
    Update(PollStatistics),
    /// Idle keep-alive
    Heartbeat,
}

impl FeedEvent {
    /// Render as a Server-Sent Events frame
    pub fn to_sse_frame(&self) -> Result<String> {
        match self {
            Self::Heartbeat => Ok(": ping\n\n".to_string()),
            event => Ok(format!("data: {}\n\n", serde_json::to_string(event)?)),
        }
    }

    pub fn statistics(&self) -> Option<&PollStatistics> {
        match self {
            Self::Snapshot(stats) | Self::Update(stats) => Some(stats),
            Self::Heartbeat => None,
        }
    }
}

/// Reconnect hint sent once at the start of an SSE stream
pub fn sse_retry_frame(retry_ms: u64) -> String {
    format!("retry: {retry_ms}\n\n")
}

/// A viewer's live statistics channel
pub struct LiveFeed {
    poll_id: PollId,
    events: mpsc::Receiver<FeedEvent>,
    // Dropped before `task` is aborted, so the bus forgets this viewer even
    // if the runtime is slow to cancel the task.
    subscription: Option<Subscription>,
    task: JoinHandle<()>,
}

impl LiveFeed {
    /// Connect a viewer to `poll_id`.
    ///
    /// Fails `NotFound` if the poll does not exist at connect time.
    pub async fn open(
        poll_id: PollId,
        stats: StatisticsEngine,
        bus: &LiveUpdateBus,
        heartbeat: Duration,
    ) -> Result<Self> {
        // Subscribe before the snapshot so a change landing in between is
        // still seen
        let (notify_tx, notify_rx) = mpsc::channel::<()>(1);
        let subscription = bus.subscribe(poll_id, move |_event| match notify_tx.try_send(()) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(())) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(())) => {
                Err(Error::internal("live feed receiver closed"))
            }
        })?;

        // On failure `subscription` drops here and leaves the bus
        let snapshot = stats.compute(&poll_id).await?;

        let (events_tx, events) = mpsc::channel(FEED_BUFFER);
        events_tx
            .send(FeedEvent::Snapshot(snapshot))
            .await
            .map_err(|_| Error::internal("live feed closed before snapshot"))?;

        let task = tokio::spawn(run_feed(poll_id, stats, notify_rx, events_tx, heartbeat));
        tracing::debug!(%poll_id, "live feed opened");

        Ok(Self {
            poll_id,
            events,
            subscription: Some(subscription),
            task,
        })
    }

    pub fn poll_id(&self) -> PollId {
        self.poll_id
    }

    /// Next event, or `None` once the feed has ended
    pub async fn next(&mut self) -> Option<FeedEvent> {
        self.events.recv().await
    }

    /// Disconnect the viewer
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for LiveFeed {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
        self.task.abort();
        tracing::debug!(poll_id = %self.poll_id, "live feed closed");
    }
}

async fn run_feed(
    poll_id: PollId,
    stats: StatisticsEngine,
    mut notifications: mpsc::Receiver<()>,
    events: mpsc::Sender<FeedEvent>,
    heartbeat: Duration,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + heartbeat, heartbeat);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            notification = notifications.recv() => {
                // The sender lives in the bus listener; `None` means we were
                // unsubscribed or the bus was cleared.
                if notification.is_none() {
                    break;
                }
                match stats.compute(&poll_id).await {
                    Ok(latest) => {
                        if events.send(FeedEvent::Update(latest)).await.is_err() {
                            break;
                        }
                    }
                    Err(Error::NotFound { .. }) => break,
                    Err(err) => {
                        tracing::warn!(%poll_id, "failed to refresh live statistics: {err}");
                    }
                }
            }
            _ = ticker.tick() => {
                tracing::trace!(%poll_id, "live feed heartbeat");
                if events.send(FeedEvent::Heartbeat).await.is_err() {
                    break;
                }
            }
        }
    }
}
