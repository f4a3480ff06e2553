// Enrollment aggregate and its status lifecycle

pub mod lifecycle;
pub mod types;

pub use lifecycle::{apply_event, excuse, excuse_window_open, EnrollmentLifecycle, LifecycleEvent};
pub use types::{
    ApprovalStep, Course, Decision, Enrollment, EnrollmentStatus, StepResolution,
};
