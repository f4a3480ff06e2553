// Workflow engine - snapshots chains and walks enrollments through them

pub mod authority;
pub mod engine;
pub mod locks;
pub mod snapshot;

pub use authority::{check_authority, Actor, RoleGrant};
pub use engine::{NewEnrollment, Progress, WorkflowEngine};
pub use locks::EnrollmentLocks;
pub use snapshot::{auto_resolve, create_enrollment_snapshot, current_step, resolve_step, StepOutcome};
