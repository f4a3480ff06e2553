use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[cfg(any(test, feature = "testing"))]
use mockall::automock;

use crate::error::WorkflowError;
use crate::ids::{CourseId, EnrollmentId, UserId};
use crate::notifications::tracker::{NotificationKind, NotificationTracker};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendReason {
    /// Triggered by a lifecycle transition; success is recorded on the enrollment
    Automatic,
    /// Requested by an administrator; success is not recorded
    ManualResend,
}

/// "Send enrollment e-mail of kind K"
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailCommand {
    pub enrollment_id: EnrollmentId,
    pub course_id: CourseId,
    pub recipient: UserId,
    pub kind: NotificationKind,
    pub reason: SendReason,
}

/// Outbound e-mail transport
#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait::async_trait]
pub trait EmailDispatcher: Send + Sync {
    async fn send(&self, command: &EmailCommand) -> Result<()>;
}

/// Dispatcher that only logs; used when no transport is configured
pub struct LoggingDispatcher;

#[async_trait::async_trait]
impl EmailDispatcher for LoggingDispatcher {
    async fn send(&self, command: &EmailCommand) -> Result<()> {
        info!(
            enrollment_id = %command.enrollment_id,
            recipient = %command.recipient,
            kind = %command.kind,
            reason = ?command.reason,
            "Enrollment e-mail dispatched"
        );
        Ok(())
    }
}

/// Producer side of the outbound queue. Enqueueing never waits.
#[derive(Debug, Clone)]
pub struct NotificationQueue {
    tx: mpsc::Sender<EmailCommand>,
}

impl NotificationQueue {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<EmailCommand>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Returns false when the command was dropped (queue full or worker gone)
    pub fn enqueue(&self, command: EmailCommand) -> bool {
        match self.tx.try_send(command) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(command)) => {
                warn!(
                    enrollment_id = %command.enrollment_id,
                    kind = %command.kind,
                    "Notification queue full, e-mail dropped"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(command)) => {
                warn!(
                    enrollment_id = %command.enrollment_id,
                    kind = %command.kind,
                    "Notification worker stopped, e-mail dropped"
                );
                false
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Sent and recorded on the enrollment
    Recorded,
    /// Sent, but an earlier automatic send was already recorded
    AlreadyRecorded,
    /// Sent as a manual resend; flags untouched
    Resent,
    /// Transport failed; flags untouched
    Failed(String),
    /// Sent, but the receipt could not be stored
    ReceiptFailed(String),
}

/// Consumer side: sends queued e-mails and reports automatic successes
pub struct NotificationWorker {
    rx: mpsc::Receiver<EmailCommand>,
    dispatcher: Arc<dyn EmailDispatcher>,
    tracker: Arc<NotificationTracker>,
}

impl NotificationWorker {
    pub fn new(
        rx: mpsc::Receiver<EmailCommand>,
        dispatcher: Arc<dyn EmailDispatcher>,
        tracker: Arc<NotificationTracker>,
    ) -> Self {
        Self {
            rx,
            dispatcher,
            tracker,
        }
    }

    pub fn spawn(self) -> JoinHandle<usize> {
        tokio::spawn(self.run())
    }

    /// Drain the queue until every producer is dropped; returns commands handled
    pub async fn run(mut self) -> usize {
        let mut handled = 0;
        while let Some(command) = self.rx.recv().await {
            self.deliver(&command).await;
            handled += 1;
        }
        debug!(handled, "Notification worker finished");
        handled
    }

    pub async fn deliver(&self, command: &EmailCommand) -> DeliveryOutcome {
        if let Err(e) = self.dispatcher.send(command).await {
            warn!(
                enrollment_id = %command.enrollment_id,
                kind = %command.kind,
                error = %e,
                "Enrollment e-mail failed"
            );
            return DeliveryOutcome::Failed(e.to_string());
        }

        if command.reason == SendReason::ManualResend {
            return DeliveryOutcome::Resent;
        }

        match self
            .tracker
            .mark_sent(command.enrollment_id, command.kind, Utc::now())
            .await
        {
            Ok(()) => DeliveryOutcome::Recorded,
            Err(WorkflowError::AlreadyResolved { .. }) => {
                debug!(
                    enrollment_id = %command.enrollment_id,
                    kind = %command.kind,
                    "Notification already recorded"
                );
                DeliveryOutcome::AlreadyRecorded
            }
            Err(e) => {
                warn!(
                    enrollment_id = %command.enrollment_id,
                    kind = %command.kind,
                    error = %e,
                    "Could not record notification receipt"
                );
                DeliveryOutcome::ReceiptFailed(e.to_string())
            }
        }
    }
}
