use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{WorkflowError, WorkflowResult};
use crate::ids::EnrollmentId;
use crate::workflow::EnrollmentLocks;
use crate::store::EnrollmentStore;

/// The lifecycle e-mails an enrollment can trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// Sent when the enrollment is created
    Confirmation,
    /// Sent when the final step is approved
    FinalApproval,
    /// Sent on rejection or excuse
    StatusChange,
}

impl NotificationKind {
    pub const ALL: [NotificationKind; 3] = [
        NotificationKind::Confirmation,
        NotificationKind::FinalApproval,
        NotificationKind::StatusChange,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Confirmation => "confirmation",
            NotificationKind::FinalApproval => "final_approval",
            NotificationKind::StatusChange => "status_change",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "confirmation" => Ok(NotificationKind::Confirmation),
            "final_approval" | "final-approval" => Ok(NotificationKind::FinalApproval),
            "status_change" | "status-change" => Ok(NotificationKind::StatusChange),
            other => Err(format!("Unknown notification kind: {other}")),
        }
    }
}

/// Per-enrollment sent markers, one per kind.
///
/// A marker answers "did at least one automatic send succeed". It is only
/// ever set, never cleared: approval transitions don't touch it and manual
/// resends bypass it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationFlags {
    pub confirmation_sent_at: Option<DateTime<Utc>>,
    pub final_approval_sent_at: Option<DateTime<Utc>>,
    pub status_change_sent_at: Option<DateTime<Utc>>,
}

impl NotificationFlags {
    fn slot(&self, kind: NotificationKind) -> &Option<DateTime<Utc>> {
        match kind {
            NotificationKind::Confirmation => &self.confirmation_sent_at,
            NotificationKind::FinalApproval => &self.final_approval_sent_at,
            NotificationKind::StatusChange => &self.status_change_sent_at,
        }
    }

    fn slot_mut(&mut self, kind: NotificationKind) -> &mut Option<DateTime<Utc>> {
        match kind {
            NotificationKind::Confirmation => &mut self.confirmation_sent_at,
            NotificationKind::FinalApproval => &mut self.final_approval_sent_at,
            NotificationKind::StatusChange => &mut self.status_change_sent_at,
        }
    }

    pub fn is_sent(&self, kind: NotificationKind) -> bool {
        self.slot(kind).is_some()
    }

    pub fn sent_at(&self, kind: NotificationKind) -> Option<DateTime<Utc>> {
        *self.slot(kind)
    }

    /// Record a successful automatic send. Allowed once per kind.
    pub fn mark_sent(&mut self, kind: NotificationKind, at: DateTime<Utc>) -> WorkflowResult<()> {
        let slot = self.slot_mut(kind);
        if let Some(previous) = *slot {
            return Err(WorkflowError::already_resolved(format!(
                "{kind} notification already marked sent at {previous}"
            )));
        }
        *slot = Some(at);
        Ok(())
    }
}

/// Persists sent markers, one enrollment at a time.
///
/// Shares the engine's lock table so a receipt never interleaves with an
/// approval transition on the same enrollment, but it never changes status.
pub struct NotificationTracker {
    store: Arc<dyn EnrollmentStore>,
    locks: Arc<EnrollmentLocks>,
}

impl NotificationTracker {
    pub fn new(store: Arc<dyn EnrollmentStore>, locks: Arc<EnrollmentLocks>) -> Self {
        Self { store, locks }
    }

    pub async fn mark_sent(
        &self,
        enrollment_id: EnrollmentId,
        kind: NotificationKind,
        at: DateTime<Utc>,
    ) -> WorkflowResult<()> {
        let _guard = self.locks.acquire(enrollment_id).await;

        let mut enrollment = self.store.load_enrollment(enrollment_id).await?;
        enrollment.notifications.mark_sent(kind, at)?;
        self.store.save_enrollment(&enrollment).await?;

        info!(
            enrollment_id = %enrollment_id,
            kind = %kind,
            "Notification marked sent"
        );
        Ok(())
    }

    pub async fn flags(&self, enrollment_id: EnrollmentId) -> WorkflowResult<NotificationFlags> {
        let enrollment = self.store.load_enrollment(enrollment_id).await?;
        debug!(enrollment_id = %enrollment_id, "Loaded notification flags");
        Ok(enrollment.notifications)
    }
}
