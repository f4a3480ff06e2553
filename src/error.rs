use thiserror::Error;

use crate::enrollment::EnrollmentStatus;
use crate::ids::{CategoryId, CourseId, EnrollmentId, StepId, UserId};
use crate::store::StoreError;

/// Errors surfaced by the approval workflow, the state machine and the attendance gate.
///
/// Every error is local to the call that produced it. Nothing is retried
/// automatically and a failed call never leaves a partial write behind.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Approval chain misconfigured for category {category:?}: {reason}")]
    ChainMisconfigured {
        category: Option<CategoryId>,
        reason: String,
    },

    #[error("Step {step_id} is not the current step (current: {current:?})")]
    NotCurrentStep {
        step_id: StepId,
        current: Option<StepId>,
    },

    #[error("Unauthorized: {reason}")]
    Unauthorized { reason: String },

    #[error("Already resolved: {what}")]
    AlreadyResolved { what: String },

    #[error("Excuse window closed: {reason}")]
    ExcuseWindowClosed { reason: String },

    #[error("Enrollment {enrollment_id} is not approved (status: {status})")]
    NotApproved {
        enrollment_id: EnrollmentId,
        status: EnrollmentStatus,
    },

    #[error("Concurrent update of enrollment {enrollment_id}: expected version {expected}, found {found}")]
    OptimisticConflict {
        enrollment_id: EnrollmentId,
        expected: u64,
        found: u64,
    },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("User {user_id} is already enrolled in course {course_id}")]
    AlreadyEnrolled { course_id: CourseId, user_id: UserId },

    #[error("Enrollment {enrollment_id} already has an open attendance record")]
    AlreadyCheckedIn { enrollment_id: EnrollmentId },

    #[error("Invalid timestamp: {reason}")]
    InvalidTimestamp { reason: String },

    #[error("Storage error: {0}")]
    Storage(String),
}

impl WorkflowError {
    pub fn misconfigured(category: Option<CategoryId>, reason: impl Into<String>) -> Self {
        WorkflowError::ChainMisconfigured {
            category,
            reason: reason.into(),
        }
    }

    pub fn unauthorized(reason: impl Into<String>) -> Self {
        WorkflowError::Unauthorized {
            reason: reason.into(),
        }
    }

    pub fn already_resolved(what: impl Into<String>) -> Self {
        WorkflowError::AlreadyResolved { what: what.into() }
    }

    /// Errors after which the caller should re-read the enrollment and try again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WorkflowError::AlreadyResolved { .. }
                | WorkflowError::NotCurrentStep { .. }
                | WorkflowError::OptimisticConflict { .. }
        )
    }

    /// Errors that should be shown to the end user rather than logged as faults
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self,
            WorkflowError::ExcuseWindowClosed { .. }
                | WorkflowError::NotApproved { .. }
                | WorkflowError::AlreadyEnrolled { .. }
                | WorkflowError::AlreadyCheckedIn { .. }
        )
    }
}

impl From<StoreError> for WorkflowError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, id } => WorkflowError::NotFound { entity, id },
            StoreError::VersionConflict {
                enrollment_id,
                expected,
                found,
            } => WorkflowError::OptimisticConflict {
                enrollment_id,
                expected,
                found,
            },
            StoreError::LiveEnrollment { course_id, user_id } => {
                WorkflowError::AlreadyEnrolled { course_id, user_id }
            }
            other => WorkflowError::Storage(other.to_string()),
        }
    }
}

pub type WorkflowResult<T> = Result<T, WorkflowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(WorkflowError::already_resolved("step").is_retryable());
        assert!(WorkflowError::NotCurrentStep {
            step_id: StepId::new(),
            current: None
        }
        .is_retryable());
        assert!(!WorkflowError::unauthorized("no role").is_retryable());
        assert!(!WorkflowError::misconfigured(None, "empty").is_retryable());
    }

    #[test]
    fn test_store_conflict_maps_to_optimistic_conflict() {
        let enrollment_id = EnrollmentId::new();
        let err: WorkflowError = StoreError::VersionConflict {
            enrollment_id,
            expected: 2,
            found: 3,
        }
        .into();
        assert!(matches!(
            err,
            WorkflowError::OptimisticConflict { expected: 2, found: 3, .. }
        ));
    }

    #[test]
    fn test_store_backend_error_maps_to_storage() {
        let err: WorkflowError = StoreError::LiveEnrollment {
            course_id: CourseId::new(),
            user_id: UserId::new(),
        }
        .into();
        assert!(matches!(err, WorkflowError::AlreadyEnrolled { .. }));

        let err: WorkflowError = StoreError::Backend("disk full".to_string()).into();
        assert!(matches!(err, WorkflowError::Storage(ref msg) if msg.contains("disk full")));
    }
}
