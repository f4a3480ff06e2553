// Persistence collaborator - the engine is written entirely against this trait

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

use crate::attendance::AttendanceRecord;
use crate::chain::ChainStepDefinition;
use crate::enrollment::{Course, Enrollment};
use crate::ids::{AttendanceId, CategoryId, CourseId, EnrollmentId, RoleId, UserId};

pub use memory::InMemoryStore;

/// Errors raised by store backends
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Version conflict on enrollment {enrollment_id}: expected {expected}, found {found}")]
    VersionConflict {
        enrollment_id: EnrollmentId,
        expected: u64,
        found: u64,
    },

    #[error("Duplicate {entity} {id}")]
    Duplicate { entity: &'static str, id: String },

    #[error("User {user_id} already holds a live enrollment in course {course_id}")]
    LiveEnrollment { course_id: CourseId, user_id: UserId },

    #[error("Corrupt record: {reason}")]
    Corrupt { reason: String },

    #[error("Backend error: {0}")]
    Backend(String),

    #[cfg(feature = "database")]
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[cfg(feature = "database")]
    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        StoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn corrupt(reason: impl Into<String>) -> Self {
        StoreError::Corrupt {
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub id: RoleId,
    pub name: String,
}

/// Storage operations used by the workflow engine and the attendance recorder.
///
/// `insert_enrollment` and `save_enrollment` persist the enrollment together
/// with all of its step rows as one atomic transaction. `insert_enrollment`
/// fails with `LiveEnrollment` when the user already holds a Pending or
/// Approved enrollment in the course. `save_enrollment`
/// only succeeds when the stored version equals `enrollment.version`, and
/// returns the new version.
#[async_trait]
pub trait EnrollmentStore: Send + Sync {
    async fn save_role(&self, role: &Role) -> Result<(), StoreError>;

    async fn known_roles(&self) -> Result<HashSet<RoleId>, StoreError>;

    async fn save_course(&self, course: &Course) -> Result<(), StoreError>;

    async fn load_course(&self, course_id: CourseId) -> Result<Course, StoreError>;

    /// Step definitions for a category, in any order; empty when none are configured
    async fn load_chain(&self, category_id: CategoryId)
        -> Result<Vec<ChainStepDefinition>, StoreError>;

    async fn save_chain(
        &self,
        category_id: CategoryId,
        steps: &[ChainStepDefinition],
    ) -> Result<(), StoreError>;

    async fn insert_enrollment(&self, enrollment: &Enrollment) -> Result<(), StoreError>;

    async fn load_enrollment(&self, enrollment_id: EnrollmentId) -> Result<Enrollment, StoreError>;

    async fn save_enrollment(&self, enrollment: &Enrollment) -> Result<u64, StoreError>;

    async fn find_enrollments(
        &self,
        course_id: CourseId,
        user_id: UserId,
    ) -> Result<Vec<Enrollment>, StoreError>;

    async fn insert_attendance(&self, record: &AttendanceRecord) -> Result<(), StoreError>;

    async fn load_attendance(&self, attendance_id: AttendanceId)
        -> Result<AttendanceRecord, StoreError>;

    async fn save_attendance(&self, record: &AttendanceRecord) -> Result<(), StoreError>;

    /// Records for an enrollment ordered by check-in time
    async fn list_attendance(
        &self,
        enrollment_id: EnrollmentId,
    ) -> Result<Vec<AttendanceRecord>, StoreError>;
}
