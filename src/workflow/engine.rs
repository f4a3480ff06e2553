use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, Instrument};

use crate::chain::ChainCatalog;
use crate::enrollment::{excuse as excuse_enrollment, ApprovalStep, Decision, Enrollment, EnrollmentStatus};
use crate::error::{WorkflowError, WorkflowResult};
use crate::ids::{CourseId, EnrollmentId, OrganizationId, StepId, UserId};
use crate::notifications::{
    EmailCommand, NotificationKind, NotificationQueue, NotificationTracker, SendReason,
};
use crate::store::EnrollmentStore;
use crate::telemetry::{create_workflow_span, generate_correlation_id};
use crate::workflow::authority::Actor;
use crate::workflow::locks::EnrollmentLocks;
use crate::workflow::snapshot::{self, create_enrollment_snapshot, resolve_step};

/// Request to enroll a user in a course
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewEnrollment {
    pub course_id: CourseId,
    pub user_id: UserId,
    /// The enrollee's organization as reported by the directory right now
    pub organization_id: Option<OrganizationId>,
}

/// Read-only view of where an enrollment stands in its chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub enrollment_id: EnrollmentId,
    pub status: EnrollmentStatus,
    pub resolved: usize,
    pub total: usize,
    pub current_step: Option<ApprovalStep>,
}

/// Drives enrollments through their approval chains.
///
/// Every mutation is a read-modify-write of one enrollment under that
/// enrollment's lock, saved with an optimistic version check. E-mails are
/// queued after the save and outside the lock.
pub struct WorkflowEngine {
    store: Arc<dyn EnrollmentStore>,
    catalog: Arc<ChainCatalog>,
    locks: Arc<EnrollmentLocks>,
    tracker: Arc<NotificationTracker>,
    queue: Option<NotificationQueue>,
}

impl WorkflowEngine {
    pub fn new(store: Arc<dyn EnrollmentStore>, catalog: Arc<ChainCatalog>) -> Self {
        let locks = Arc::new(EnrollmentLocks::new());
        let tracker = Arc::new(NotificationTracker::new(store.clone(), locks.clone()));
        Self {
            store,
            catalog,
            locks,
            tracker,
            queue: None,
        }
    }

    pub fn with_notifications(mut self, queue: NotificationQueue) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn catalog(&self) -> &Arc<ChainCatalog> {
        &self.catalog
    }

    /// Lock table shared with the notification tracker and attendance recorder
    pub fn locks(&self) -> Arc<EnrollmentLocks> {
        self.locks.clone()
    }

    pub fn tracker(&self) -> Arc<NotificationTracker> {
        self.tracker.clone()
    }

    /// Enroll a user: snapshot the category's chain and persist both atomically.
    ///
    /// Auto-approving categories come back Approved.
    pub async fn create_enrollment(&self, request: NewEnrollment) -> WorkflowResult<Enrollment> {
        let correlation_id = generate_correlation_id();
        let span = create_workflow_span("create_enrollment", None, &correlation_id);

        async move {
            // Early refusal; the store's insert is what enforces uniqueness
            let existing = self
                .store
                .find_enrollments(request.course_id, request.user_id)
                .await?;
            if existing.iter().any(|e| e.status.is_live()) {
                return Err(WorkflowError::AlreadyEnrolled {
                    course_id: request.course_id,
                    user_id: request.user_id,
                });
            }

            let course = self.store.load_course(request.course_id).await?;
            let chain = self.catalog.get_chain(course.category_id).await?;

            let now = Utc::now();
            let mut enrollment = Enrollment::new(
                request.course_id,
                request.user_id,
                request.organization_id,
                now,
            );
            enrollment.steps = create_enrollment_snapshot(enrollment.id, &chain)?;
            if chain.is_implicit() {
                snapshot::auto_resolve(&mut enrollment, now)?;
            }

            self.store.insert_enrollment(&enrollment).await?;

            info!(
                enrollment_id = %enrollment.id,
                course_id = %enrollment.course_id,
                user_id = %enrollment.user_id,
                steps = enrollment.steps.len(),
                status = %enrollment.status,
                "Enrollment created"
            );

            self.notify(&enrollment, NotificationKind::Confirmation);
            if enrollment.status == EnrollmentStatus::Approved {
                self.notify(&enrollment, NotificationKind::FinalApproval);
            }
            Ok(enrollment)
        }
        .instrument(span)
        .await
    }

    pub async fn enrollment(&self, enrollment_id: EnrollmentId) -> WorkflowResult<Enrollment> {
        Ok(self.store.load_enrollment(enrollment_id).await?)
    }

    pub async fn current_step(&self, enrollment_id: EnrollmentId) -> WorkflowResult<Option<ApprovalStep>> {
        let enrollment = self.store.load_enrollment(enrollment_id).await?;
        Ok(snapshot::current_step(&enrollment).cloned())
    }

    pub async fn progress(&self, enrollment_id: EnrollmentId) -> WorkflowResult<Progress> {
        let enrollment = self.store.load_enrollment(enrollment_id).await?;
        Ok(Progress {
            enrollment_id,
            status: enrollment.status,
            resolved: enrollment.resolved_steps(),
            total: enrollment.steps.len(),
            current_step: snapshot::current_step(&enrollment).cloned(),
        })
    }

    pub async fn approve_step(
        &self,
        enrollment_id: EnrollmentId,
        step_id: StepId,
        actor: &Actor,
        comment: Option<String>,
    ) -> WorkflowResult<Enrollment> {
        self.resolve("approve_step", enrollment_id, step_id, actor, Decision::Approved, comment)
            .await
    }

    pub async fn reject_step(
        &self,
        enrollment_id: EnrollmentId,
        step_id: StepId,
        actor: &Actor,
        comment: Option<String>,
    ) -> WorkflowResult<Enrollment> {
        self.resolve("reject_step", enrollment_id, step_id, actor, Decision::Rejected, comment)
            .await
    }

    async fn resolve(
        &self,
        operation: &str,
        enrollment_id: EnrollmentId,
        step_id: StepId,
        actor: &Actor,
        decision: Decision,
        comment: Option<String>,
    ) -> WorkflowResult<Enrollment> {
        let correlation_id = generate_correlation_id();
        let span = create_workflow_span(operation, Some(enrollment_id), &correlation_id);

        async move {
            let enrollment = {
                let _guard = self.locks.acquire(enrollment_id).await;
                let mut enrollment = self.store.load_enrollment(enrollment_id).await?;
                resolve_step(&mut enrollment, step_id, actor, decision, comment, Utc::now())?;
                enrollment.version = self.store.save_enrollment(&enrollment).await?;
                enrollment
            };

            match enrollment.status {
                EnrollmentStatus::Approved => {
                    self.notify(&enrollment, NotificationKind::FinalApproval)
                }
                EnrollmentStatus::Rejected => {
                    self.notify(&enrollment, NotificationKind::StatusChange)
                }
                _ => {}
            }
            Ok(enrollment)
        }
        .instrument(span)
        .await
    }

    /// Self-service withdrawal by the enrollee
    pub async fn excuse(
        &self,
        enrollment_id: EnrollmentId,
        requester: UserId,
        now: DateTime<Utc>,
    ) -> WorkflowResult<Enrollment> {
        let correlation_id = generate_correlation_id();
        let span = create_workflow_span("excuse", Some(enrollment_id), &correlation_id);

        async move {
            let enrollment = {
                let _guard = self.locks.acquire(enrollment_id).await;
                let mut enrollment = self.store.load_enrollment(enrollment_id).await?;
                if enrollment.user_id != requester {
                    return Err(WorkflowError::unauthorized(format!(
                        "only the enrollee may excuse enrollment {enrollment_id}"
                    )));
                }

                let course = self.store.load_course(enrollment.course_id).await?;
                excuse_enrollment(
                    &mut enrollment,
                    now,
                    course.starts_at,
                    course.excuse_window_hours,
                )?;
                enrollment.version = self.store.save_enrollment(&enrollment).await?;
                enrollment
            };

            info!(enrollment_id = %enrollment_id, "Enrollment excused");
            self.notify(&enrollment, NotificationKind::StatusChange);
            Ok(enrollment)
        }
        .instrument(span)
        .await
    }

    pub async fn mark_sent(
        &self,
        enrollment_id: EnrollmentId,
        kind: NotificationKind,
        at: DateTime<Utc>,
    ) -> WorkflowResult<()> {
        self.tracker.mark_sent(enrollment_id, kind, at).await
    }

    /// Queue an administrator resend. The sent marker is neither checked nor set.
    ///
    /// Returns false when no queue is attached or the queue refused the command.
    pub async fn resend_notification(
        &self,
        enrollment_id: EnrollmentId,
        kind: NotificationKind,
    ) -> WorkflowResult<bool> {
        let enrollment = self.store.load_enrollment(enrollment_id).await?;
        let Some(queue) = &self.queue else {
            debug!(enrollment_id = %enrollment_id, "No notification queue attached");
            return Ok(false);
        };

        Ok(queue.enqueue(EmailCommand {
            enrollment_id,
            course_id: enrollment.course_id,
            recipient: enrollment.user_id,
            kind,
            reason: SendReason::ManualResend,
        }))
    }

    fn notify(&self, enrollment: &Enrollment, kind: NotificationKind) {
        let Some(queue) = &self.queue else {
            return;
        };
        if enrollment.notifications.is_sent(kind) {
            debug!(enrollment_id = %enrollment.id, kind = %kind, "Notification already sent");
            return;
        }

        queue.enqueue(EmailCommand {
            enrollment_id: enrollment.id,
            course_id: enrollment.course_id,
            recipient: enrollment.user_id,
            kind,
            reason: SendReason::Automatic,
        });
    }
}
