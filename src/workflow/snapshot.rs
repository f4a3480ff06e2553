use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::chain::{ApprovalChain, StepAuthority};
use crate::enrollment::{apply_event, ApprovalStep, Decision, Enrollment, LifecycleEvent, StepResolution};
use crate::error::{WorkflowError, WorkflowResult};
use crate::ids::{EnrollmentId, StepId, UserId};
use crate::workflow::authority::{check_authority, Actor};

/// What resolving a step did to the enrollment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Step approved, enrollment still Pending
    Advanced { next_step: Option<StepId> },
    /// Final step approved
    Approved,
    /// Step rejected; enrollment is Rejected
    Rejected,
}

/// Freeze a chain into per-enrollment step instances, one per template step
pub fn create_enrollment_snapshot(
    enrollment_id: EnrollmentId,
    chain: &ApprovalChain,
) -> WorkflowResult<Vec<ApprovalStep>> {
    chain.verify()?;

    let steps: Vec<ApprovalStep> = chain
        .steps()
        .iter()
        .map(|step| ApprovalStep {
            id: StepId::new(),
            enrollment_id,
            template_step_id: step.id,
            order: step.order,
            authority: step.authority,
            final_step: step.final_step,
            resolution: None,
        })
        .collect();

    debug!(
        enrollment_id = %enrollment_id,
        category_id = %chain.category_id(),
        steps = steps.len(),
        "Approval chain snapshot taken"
    );
    Ok(steps)
}

/// First step in template order that is neither approved nor rejected
pub fn current_step(enrollment: &Enrollment) -> Option<&ApprovalStep> {
    enrollment
        .steps
        .iter()
        .filter(|step| !step.is_resolved())
        .min_by_key(|step| step.order)
}

/// Record a decision on one step and move the enrollment accordingly.
///
/// Preconditions are checked in a fixed order: unknown step (`NotFound`),
/// step or enrollment already resolved (`AlreadyResolved`), step out of turn
/// (`NotCurrentStep`), then authority (`Unauthorized`). A failed call leaves
/// the enrollment untouched.
pub fn resolve_step(
    enrollment: &mut Enrollment,
    step_id: StepId,
    actor: &Actor,
    decision: Decision,
    comment: Option<String>,
    now: DateTime<Utc>,
) -> WorkflowResult<StepOutcome> {
    let index = enrollment
        .steps
        .iter()
        .position(|step| step.id == step_id)
        .ok_or_else(|| WorkflowError::NotFound {
            entity: "approval step",
            id: step_id.to_string(),
        })?;

    let step = &enrollment.steps[index];
    if step.is_resolved() {
        return Err(WorkflowError::already_resolved(format!(
            "step {} of enrollment {}",
            step.order, enrollment.id
        )));
    }
    if enrollment.is_finalized() {
        return Err(WorkflowError::already_resolved(format!(
            "enrollment {} is already {}",
            enrollment.id, enrollment.status
        )));
    }

    let current = current_step(enrollment).map(|step| step.id);
    if current != Some(step_id) {
        return Err(WorkflowError::NotCurrentStep { step_id, current });
    }

    check_authority(step, actor, enrollment.organization_id)?;

    let final_step = step.final_step;
    record(enrollment, index, decision, Some(actor.user_id), comment, now, final_step)
}

/// Resolve the automatic step of an auto-approving chain
pub fn auto_resolve(enrollment: &mut Enrollment, now: DateTime<Utc>) -> WorkflowResult<StepOutcome> {
    let index = current_step(enrollment)
        .filter(|step| step.authority == StepAuthority::Automatic)
        .and_then(|step| enrollment.steps.iter().position(|s| s.id == step.id))
        .ok_or_else(|| {
            WorkflowError::misconfigured(
                None,
                format!("enrollment {} has no automatic step pending", enrollment.id),
            )
        })?;

    let final_step = enrollment.steps[index].final_step;
    record(enrollment, index, Decision::Approved, None, None, now, final_step)
}

fn record(
    enrollment: &mut Enrollment,
    index: usize,
    decision: Decision,
    actor: Option<UserId>,
    comment: Option<String>,
    now: DateTime<Utc>,
    final_step: bool,
) -> WorkflowResult<StepOutcome> {
    // Status moves first so a refused transition leaves the step untouched
    let outcome = match (decision, final_step) {
        (Decision::Rejected, _) => {
            apply_event(enrollment, LifecycleEvent::StepRejected)?;
            StepOutcome::Rejected
        }
        (Decision::Approved, true) => {
            apply_event(enrollment, LifecycleEvent::FinalStepApproved)?;
            StepOutcome::Approved
        }
        (Decision::Approved, false) => StepOutcome::Advanced { next_step: None },
    };

    let step = &mut enrollment.steps[index];
    step.resolution = Some(StepResolution {
        decision,
        actor,
        resolved_at: now,
        comment,
    });
    let order = step.order;
    enrollment.updated_at = now;

    let outcome = match outcome {
        StepOutcome::Advanced { .. } => StepOutcome::Advanced {
            next_step: current_step(enrollment).map(|step| step.id),
        },
        other => other,
    };

    info!(
        enrollment_id = %enrollment.id,
        step = order,
        decision = ?decision,
        status = %enrollment.status,
        "Approval step resolved"
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{validate_chain, ChainStepDefinition};
    use crate::enrollment::EnrollmentStatus;
    use crate::ids::{CategoryId, CourseId, OrganizationId, RoleId};
    use crate::workflow::authority::RoleGrant;

    struct Fixture {
        enrollment: Enrollment,
        manager: RoleId,
        org: OrganizationId,
    }

    fn two_step() -> Fixture {
        let manager = RoleId::new();
        let org = OrganizationId::new();
        let chain = validate_chain(
            CategoryId::new(),
            &[
                ChainStepDefinition::head(1),
                ChainStepDefinition::role(2, manager).finalize(),
            ],
        )
        .unwrap();

        let mut enrollment = Enrollment::new(CourseId::new(), UserId::new(), Some(org), Utc::now());
        enrollment.steps = create_enrollment_snapshot(enrollment.id, &chain).unwrap();
        Fixture {
            enrollment,
            manager,
            org,
        }
    }

    fn head() -> Actor {
        Actor::new(UserId::new()).as_head()
    }

    #[test]
    fn test_snapshot_mirrors_chain_order() {
        let fixture = two_step();
        let steps = &fixture.enrollment.steps;
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].order, 1);
        assert_eq!(steps[0].authority, StepAuthority::Head);
        assert!(steps[1].final_step);
        assert!(steps.iter().all(|s| !s.is_resolved()));
        assert!(steps.iter().all(|s| s.enrollment_id == fixture.enrollment.id));
    }

    #[test]
    fn test_current_step_advances_after_approval() {
        let mut fixture = two_step();
        let first = fixture.enrollment.steps[0].id;
        let second = fixture.enrollment.steps[1].id;
        assert_eq!(current_step(&fixture.enrollment).map(|s| s.id), Some(first));

        let outcome = resolve_step(
            &mut fixture.enrollment,
            first,
            &head(),
            Decision::Approved,
            None,
            Utc::now(),
        )
        .unwrap();

        assert_eq!(outcome, StepOutcome::Advanced { next_step: Some(second) });
        assert_eq!(fixture.enrollment.status, EnrollmentStatus::Pending);
        assert_eq!(current_step(&fixture.enrollment).map(|s| s.id), Some(second));
    }

    #[test]
    fn test_out_of_order_step_is_not_current() {
        let mut fixture = two_step();
        let second = fixture.enrollment.steps[1].id;
        let manager = Actor::new(UserId::new()).with_role(RoleGrant::scoped(fixture.manager, fixture.org));

        let err = resolve_step(
            &mut fixture.enrollment,
            second,
            &manager,
            Decision::Approved,
            None,
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, WorkflowError::NotCurrentStep { .. }));
        assert!(!fixture.enrollment.steps[1].is_resolved());
    }

    #[test]
    fn test_unknown_step_is_not_found() {
        let mut fixture = two_step();
        let err = resolve_step(
            &mut fixture.enrollment,
            StepId::new(),
            &head(),
            Decision::Approved,
            None,
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, WorkflowError::NotFound { .. }));
    }

    #[test]
    fn test_authority_checked_after_ordering() {
        let mut fixture = two_step();
        let first = fixture.enrollment.steps[0].id;
        let err = resolve_step(
            &mut fixture.enrollment,
            first,
            &Actor::new(UserId::new()),
            Decision::Approved,
            None,
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, WorkflowError::Unauthorized { .. }));
        assert_eq!(fixture.enrollment.resolved_steps(), 0);
    }

    #[test]
    fn test_rejection_records_comment_and_finalizes() {
        let mut fixture = two_step();
        let first = fixture.enrollment.steps[0].id;
        let actor = head();

        let outcome = resolve_step(
            &mut fixture.enrollment,
            first,
            &actor,
            Decision::Rejected,
            Some("Not this quarter".to_string()),
            Utc::now(),
        )
        .unwrap();

        assert_eq!(outcome, StepOutcome::Rejected);
        assert_eq!(fixture.enrollment.status, EnrollmentStatus::Rejected);
        assert!(fixture.enrollment.final_approval);
        let step = &fixture.enrollment.steps[0];
        assert_eq!(step.actor(), Some(actor.user_id));
        assert_eq!(step.comment(), Some("Not this quarter"));
        assert!(!fixture.enrollment.steps[1].is_resolved());
    }

    #[test]
    fn test_resolved_step_reports_already_resolved_before_order() {
        let mut fixture = two_step();
        let first = fixture.enrollment.steps[0].id;
        resolve_step(&mut fixture.enrollment, first, &head(), Decision::Approved, None, Utc::now())
            .unwrap();

        let before = fixture.enrollment.clone();
        let err = resolve_step(&mut fixture.enrollment, first, &head(), Decision::Rejected, None, Utc::now())
            .unwrap_err();
        assert!(matches!(err, WorkflowError::AlreadyResolved { .. }));
        assert_eq!(fixture.enrollment, before);
    }

    #[test]
    fn test_auto_resolve_approves_implicit_chain() {
        let chain = ApprovalChain::auto_approve(CategoryId::new());
        let mut enrollment = Enrollment::new(CourseId::new(), UserId::new(), None, Utc::now());
        enrollment.steps = create_enrollment_snapshot(enrollment.id, &chain).unwrap();

        assert_eq!(auto_resolve(&mut enrollment, Utc::now()).unwrap(), StepOutcome::Approved);
        assert_eq!(enrollment.status, EnrollmentStatus::Approved);
        assert_eq!(enrollment.steps[0].actor(), None);
        assert!(enrollment.steps[0].is_approved());
    }

    #[test]
    fn test_auto_resolve_refuses_human_steps() {
        let mut fixture = two_step();
        assert!(matches!(
            auto_resolve(&mut fixture.enrollment, Utc::now()),
            Err(WorkflowError::ChainMisconfigured { .. })
        ));
    }
}
