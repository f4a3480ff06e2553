use chrono::{DateTime, Duration, Utc};
use statig::prelude::*;

use crate::enrollment::types::{Enrollment, EnrollmentStatus};
use crate::error::{WorkflowError, WorkflowResult};
use crate::ids::EnrollmentId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    FinalStepApproved,
    StepRejected,
    ExcuseRequested {
        now: DateTime<Utc>,
        course_start: DateTime<Utc>,
        window_hours: Option<u32>,
    },
}

/// Status machine for a single enrollment.
///
/// Every machine starts in `pending`; terminal statuses are never re-entered
/// from storage, so callers only build one for an enrollment that is still
/// Pending and read the outcome back from the shared storage.
#[derive(Debug)]
pub struct EnrollmentLifecycle {
    enrollment_id: EnrollmentId,
    status: EnrollmentStatus,
    final_approval: bool,
    refusal: Option<String>,
}

impl EnrollmentLifecycle {
    pub fn new(enrollment_id: EnrollmentId) -> Self {
        Self {
            enrollment_id,
            status: EnrollmentStatus::Pending,
            final_approval: false,
            refusal: None,
        }
    }

    pub fn status(&self) -> EnrollmentStatus {
        self.status
    }

    pub fn final_approval(&self) -> bool {
        self.final_approval
    }

    pub fn refusal(&self) -> Option<&str> {
        self.refusal.as_deref()
    }

    fn settle(&mut self, status: EnrollmentStatus) {
        self.status = status;
        self.final_approval = true;
        tracing::info!(
            enrollment_id = %self.enrollment_id,
            status = %status,
            "Enrollment status settled"
        );
    }
}

#[state_machine(initial = "State::pending()")]
impl EnrollmentLifecycle {
    #[state]
    fn pending(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::FinalStepApproved => {
                self.settle(EnrollmentStatus::Approved);
                Transition(State::approved())
            }
            LifecycleEvent::StepRejected => {
                self.settle(EnrollmentStatus::Rejected);
                Transition(State::rejected())
            }
            LifecycleEvent::ExcuseRequested {
                now,
                course_start,
                window_hours,
            } => {
                if excuse_window_open(*now, *course_start, *window_hours) {
                    self.settle(EnrollmentStatus::Excused);
                    Transition(State::excused())
                } else {
                    self.refusal = Some(format!(
                        "excuses close {} hours before the course starts at {}",
                        window_hours.unwrap_or_default(),
                        course_start
                    ));
                    tracing::warn!(
                        enrollment_id = %self.enrollment_id,
                        "Excuse requested after the window closed"
                    );
                    Handled
                }
            }
        }
    }

    #[state]
    fn approved(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        self.ignore(event);
        Handled
    }

    #[state]
    fn rejected(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        self.ignore(event);
        Handled
    }

    #[state]
    fn excused(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        self.ignore(event);
        Handled
    }
}

impl EnrollmentLifecycle {
    fn ignore(&mut self, event: &LifecycleEvent) {
        tracing::debug!(
            enrollment_id = %self.enrollment_id,
            status = %self.status,
            event = ?event,
            "Event ignored in terminal status"
        );
    }
}

/// `now ≤ course_start − window`; an unset window never closes.
///
/// A window reaching past the representable date range is treated as closed.
pub fn excuse_window_open(
    now: DateTime<Utc>,
    course_start: DateTime<Utc>,
    window_hours: Option<u32>,
) -> bool {
    let Some(hours) = window_hours else {
        return true;
    };
    Duration::try_hours(i64::from(hours))
        .and_then(|window| course_start.checked_sub_signed(window))
        .is_some_and(|deadline| now <= deadline)
}

/// Drive an enrollment's status through the lifecycle machine.
///
/// Only Pending, non-finalized enrollments can move. Anything else fails with
/// `AlreadyResolved`, or `ExcuseWindowClosed` for excuse requests.
pub fn apply_event(
    enrollment: &mut Enrollment,
    event: LifecycleEvent,
) -> WorkflowResult<EnrollmentStatus> {
    let is_excuse = matches!(event, LifecycleEvent::ExcuseRequested { .. });

    if enrollment.final_approval || enrollment.status != EnrollmentStatus::Pending {
        let what = format!(
            "enrollment {} is already {}",
            enrollment.id, enrollment.status
        );
        return Err(if is_excuse {
            WorkflowError::ExcuseWindowClosed { reason: what }
        } else {
            WorkflowError::already_resolved(what)
        });
    }

    let mut machine = EnrollmentLifecycle::new(enrollment.id).state_machine();
    machine.handle(&event);
    let lifecycle = machine.inner();

    if let Some(reason) = lifecycle.refusal() {
        return Err(WorkflowError::ExcuseWindowClosed {
            reason: reason.to_string(),
        });
    }

    enrollment.status = lifecycle.status();
    enrollment.final_approval = lifecycle.final_approval();
    Ok(enrollment.status)
}

/// Self-service withdrawal. Unresolved steps are left as they are.
pub fn excuse(
    enrollment: &mut Enrollment,
    now: DateTime<Utc>,
    course_start: DateTime<Utc>,
    excuse_window_hours: Option<u32>,
) -> WorkflowResult<()> {
    apply_event(
        enrollment,
        LifecycleEvent::ExcuseRequested {
            now,
            course_start,
            window_hours: excuse_window_hours,
        },
    )?;
    enrollment.updated_at = now;
    Ok(())
}
