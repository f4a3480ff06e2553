// Enrollment Gate Library - Course Enrollment Approval Workflow
// This exposes the core components for testing and integration

pub mod attendance;
pub mod chain;
pub mod config;
pub mod database;
pub mod enrollment;
pub mod error;
pub mod ids;
pub mod notifications;
pub mod store;
pub mod telemetry;
pub mod workflow;

// Re-export key types for easy access
pub use attendance::{AttendanceRecord, AttendanceRecorder};
pub use chain::{
    validate_chain, validate_role_references, ApprovalChain, ChainCatalog, ChainFile,
    ChainStepDefinition, StepAuthority,
};
pub use config::{config, init_config, EnrollmentGateConfig};
pub use database::open_store;
#[cfg(feature = "database")]
pub use database::SqliteStore;
pub use enrollment::{
    excuse, ApprovalStep, Course, Decision, Enrollment, EnrollmentLifecycle, EnrollmentStatus,
    LifecycleEvent, StepResolution,
};
pub use error::{WorkflowError, WorkflowResult};
pub use ids::{
    AttendanceId, CategoryId, CourseId, EnrollmentId, OrganizationId, RoleId, StepId,
    TemplateStepId, UserId,
};
pub use notifications::{
    DeliveryOutcome, EmailCommand, EmailDispatcher, LoggingDispatcher, NotificationFlags,
    NotificationKind, NotificationQueue, NotificationTracker, NotificationWorker, SendReason,
};
pub use store::{EnrollmentStore, InMemoryStore, Role, StoreError};
pub use telemetry::{create_workflow_span, generate_correlation_id, init_telemetry};
pub use workflow::{
    check_authority, create_enrollment_snapshot, current_step, Actor, EnrollmentLocks,
    NewEnrollment, Progress, RoleGrant, StepOutcome, WorkflowEngine,
};
