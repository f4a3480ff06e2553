// Attendance gate - only approved enrollees check in

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::enrollment::EnrollmentStatus;
use crate::error::{WorkflowError, WorkflowResult};
use crate::ids::{AttendanceId, EnrollmentId};
use crate::store::EnrollmentStore;
use crate::workflow::EnrollmentLocks;

/// One check-in/check-out pair. Duration is derived, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub id: AttendanceId,
    pub enrollment_id: EnrollmentId,
    pub checked_in_at: DateTime<Utc>,
    pub checked_out_at: Option<DateTime<Utc>>,
}

impl AttendanceRecord {
    pub fn open(enrollment_id: EnrollmentId, checked_in_at: DateTime<Utc>) -> Self {
        Self {
            id: AttendanceId::new(),
            enrollment_id,
            checked_in_at,
            checked_out_at: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.checked_out_at.is_none()
    }

    /// `None` while still checked in
    pub fn duration(&self) -> Option<Duration> {
        self.checked_out_at.map(|out| out - self.checked_in_at)
    }

    pub fn elapsed(&self, now: DateTime<Utc>) -> Duration {
        self.checked_out_at.unwrap_or(now) - self.checked_in_at
    }
}

pub struct AttendanceRecorder {
    store: Arc<dyn EnrollmentStore>,
    locks: Arc<EnrollmentLocks>,
}

impl AttendanceRecorder {
    pub fn new(store: Arc<dyn EnrollmentStore>, locks: Arc<EnrollmentLocks>) -> Self {
        Self { store, locks }
    }

    pub async fn check_in(
        &self,
        enrollment_id: EnrollmentId,
        now: DateTime<Utc>,
    ) -> WorkflowResult<AttendanceRecord> {
        let _guard = self.locks.acquire(enrollment_id).await;

        let enrollment = self.store.load_enrollment(enrollment_id).await?;
        if enrollment.status != EnrollmentStatus::Approved {
            warn!(
                enrollment_id = %enrollment_id,
                status = %enrollment.status,
                "Check-in refused"
            );
            return Err(WorkflowError::NotApproved {
                enrollment_id,
                status: enrollment.status,
            });
        }

        let records = self.store.list_attendance(enrollment_id).await?;
        if records.iter().any(AttendanceRecord::is_open) {
            return Err(WorkflowError::AlreadyCheckedIn { enrollment_id });
        }

        let record = AttendanceRecord::open(enrollment_id, now);
        self.store.insert_attendance(&record).await?;

        info!(
            enrollment_id = %enrollment_id,
            attendance_id = %record.id,
            "Checked in"
        );
        Ok(record)
    }

    pub async fn check_out(
        &self,
        attendance_id: AttendanceId,
        now: DateTime<Utc>,
    ) -> WorkflowResult<AttendanceRecord> {
        let enrollment_id = self.store.load_attendance(attendance_id).await?.enrollment_id;
        let _guard = self.locks.acquire(enrollment_id).await;

        let mut record = self.store.load_attendance(attendance_id).await?;
        if let Some(out) = record.checked_out_at {
            return Err(WorkflowError::already_resolved(format!(
                "attendance {attendance_id} checked out at {out}"
            )));
        }
        if now < record.checked_in_at {
            return Err(WorkflowError::InvalidTimestamp {
                reason: format!(
                    "check-out {} precedes check-in {}",
                    now, record.checked_in_at
                ),
            });
        }

        record.checked_out_at = Some(now);
        self.store.save_attendance(&record).await?;

        info!(
            enrollment_id = %enrollment_id,
            attendance_id = %attendance_id,
            minutes = record.elapsed(now).num_minutes(),
            "Checked out"
        );
        Ok(record)
    }

    pub async fn records(&self, enrollment_id: EnrollmentId) -> WorkflowResult<Vec<AttendanceRecord>> {
        Ok(self.store.list_attendance(enrollment_id).await?)
    }

    /// Sum of closed records; an open record doesn't count yet
    pub async fn total_attended(&self, enrollment_id: EnrollmentId) -> WorkflowResult<Duration> {
        let records = self.store.list_attendance(enrollment_id).await?;
        Ok(records
            .iter()
            .filter_map(AttendanceRecord::duration)
            .fold(Duration::zero(), |total, d| total + d))
    }
}
