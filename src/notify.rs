use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{info, warn};

use crate::model::Reservation;

/// Per-call budget for a dispatcher before the loop gives up on it.
pub const DISPATCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Created,
    Cancelled,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationKind::Created => "created",
            NotificationKind::Cancelled => "cancelled",
        }
    }
}

/// Lifecycle event plus the reservation as committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub reservation: Reservation,
}

#[derive(Debug)]
pub enum DispatchError {
    /// The downstream refused this notification.
    Rejected(String),
    /// The downstream could not be reached.
    Unavailable(String),
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchError::Rejected(msg) => write!(f, "notification rejected: {msg}"),
            DispatchError::Unavailable(msg) => write!(f, "notification target unavailable: {msg}"),
        }
    }
}

impl std::error::Error for DispatchError {}

/// Whatever composes and sends confirmations (email, PDF, webhooks).
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<(), DispatchError>;
}

/// Writes each notification to the log as JSON.
pub struct LogDispatcher;

#[async_trait]
impl NotificationDispatcher for LogDispatcher {
    async fn notify(&self, notification: &Notification) -> Result<(), DispatchError> {
        let payload = serde_json::to_string(notification)
            .map_err(|e| DispatchError::Rejected(e.to_string()))?;
        info!("notification {payload}");
        Ok(())
    }
}

/// Bounded queue between the engine and the dispatch loop. Publishing never
/// waits: when the queue is full the notification is dropped and counted.
#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::Sender<Notification>,
}

impl Outbox {
    /// Outbox plus the receiving end, for callers that drive dispatch themselves.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Outbox whose receiver is drained by a background `run_dispatcher` task.
    pub fn spawn(capacity: usize, dispatcher: Arc<dyn NotificationDispatcher>) -> Self {
        let (outbox, rx) = Self::channel(capacity);
        tokio::spawn(run_dispatcher(rx, dispatcher, DISPATCH_TIMEOUT));
        outbox
    }

    pub fn publish(&self, notification: Notification) {
        let (reason, notification) = match self.tx.try_send(notification) {
            Ok(()) => return,
            Err(TrySendError::Full(n)) => ("outbox full", n),
            Err(TrySendError::Closed(n)) => ("outbox closed", n),
        };
        warn!(
            "{reason}, dropping {} notification for reservation {}",
            notification.kind.as_str(),
            notification.reservation.id
        );
        metrics::counter!(
            crate::observability::NOTIFICATIONS_DROPPED_TOTAL,
            "kind" => notification.kind.as_str()
        )
        .increment(1);
    }
}

/// Hand each queued notification to `dispatcher`, one at a time. Failures and
/// timeouts are logged and counted; nothing is retried.
pub async fn run_dispatcher(
    mut rx: mpsc::Receiver<Notification>,
    dispatcher: Arc<dyn NotificationDispatcher>,
    timeout: Duration,
) {
    while let Some(notification) = rx.recv().await {
        let kind = notification.kind.as_str();
        let id = notification.reservation.id;
        match tokio::time::timeout(timeout, dispatcher.notify(&notification)).await {
            Ok(Ok(())) => {
                metrics::counter!(crate::observability::NOTIFICATIONS_DISPATCHED_TOTAL, "kind" => kind)
                    .increment(1);
            }
            Ok(Err(e)) => {
                warn!("{kind} notification for reservation {id} failed: {e}");
                metrics::counter!(crate::observability::NOTIFICATIONS_FAILED_TOTAL, "kind" => kind)
                    .increment(1);
            }
            Err(_) => {
                warn!("{kind} notification for reservation {id} timed out after {timeout:?}");
                metrics::counter!(crate::observability::NOTIFICATIONS_FAILED_TOTAL, "kind" => kind)
                    .increment(1);
            }
        }
    }
}

/// Dispatcher that records what it receives, optionally failing every call.
#[cfg(test)]
pub(crate) struct RecordingDispatcher {
    pub received: std::sync::Mutex<Vec<Notification>>,
    pub fail: bool,
}

#[cfg(test)]
impl RecordingDispatcher {
    pub fn new(fail: bool) -> Arc<Self> {
        Arc::new(Self {
            received: std::sync::Mutex::new(Vec::new()),
            fail,
        })
    }

    pub fn kinds(&self) -> Vec<NotificationKind> {
        self.received.lock().unwrap().iter().map(|n| n.kind).collect()
    }
}

#[cfg(test)]
#[async_trait]
impl NotificationDispatcher for RecordingDispatcher {
    async fn notify(&self, notification: &Notification) -> Result<(), DispatchError> {
        self.received.lock().unwrap().push(notification.clone());
        if self.fail {
            return Err(DispatchError::Unavailable("smtp down".into()));
        }
        Ok(())
    }
}
