// Property-Based Testing for Approval Chains
// Chain validation and step ordering invariants under arbitrary inputs

use chrono::Utc;
use enrollment_gate::workflow::{current_step, resolve_step};
use enrollment_gate::{
    create_enrollment_snapshot, validate_chain, Actor, CategoryId, ChainStepDefinition, CourseId,
    Decision, Enrollment, EnrollmentStatus, RoleGrant, RoleId, UserId, WorkflowError,
};
use proptest::prelude::*;

/// A valid chain of `len` steps: optional head at order 1, role steps after, last one final
fn chain_definitions(len: u32, with_head: bool, role: RoleId) -> Vec<ChainStepDefinition> {
    (1..=len)
        .map(|order| {
            let step = if with_head && order == 1 {
                ChainStepDefinition::head(order)
            } else {
                ChainStepDefinition::role(order, role)
            };
            if order == len {
                step.finalize()
            } else {
                step
            }
        })
        .collect()
}

fn actor_for_everything(role: RoleId) -> Actor {
    Actor::new(UserId::new())
        .as_head()
        .with_role(RoleGrant::global(role))
}

fn shuffled<T: Clone>(items: &[T], seed: &[usize]) -> Vec<T> {
    let mut items = items.to_vec();
    for (i, s) in seed.iter().enumerate() {
        let len = items.len();
        if len > 1 {
            items.swap(i % len, s % len);
        }
    }
    items
}

#[cfg(test)]
mod property_tests {
    use super::*;

    proptest! {
        #[test]
        fn prop_valid_chains_validate_in_any_input_order(
            len in 1u32..8,
            with_head in any::<bool>(),
            seed in prop::collection::vec(0usize..16, 0..16),
        ) {
            let role = RoleId::new();
            let definitions = shuffled(&chain_definitions(len, with_head, role), &seed);

            let chain = validate_chain(CategoryId::new(), &definitions).unwrap();
            let orders: Vec<u32> = chain.steps().iter().map(|s| s.order).collect();
            prop_assert_eq!(orders, (1..=len).collect::<Vec<_>>());
            prop_assert_eq!(chain.steps().iter().filter(|s| s.final_step).count(), 1);
        }

        #[test]
        fn prop_final_flag_count_other_than_one_is_rejected(
            len in 1u32..8,
            finals in prop::collection::vec(any::<bool>(), 8),
        ) {
            let role = RoleId::new();
            let definitions: Vec<ChainStepDefinition> = (1..=len)
                .map(|order| {
                    let mut step = ChainStepDefinition::role(order, role);
                    step.final_step = finals[(order - 1) as usize];
                    step
                })
                .collect();
            let final_count = definitions.iter().filter(|d| d.final_step).count();

            let result = validate_chain(CategoryId::new(), &definitions);
            if final_count == 1 {
                prop_assert!(result.is_ok());
            } else {
                let is_misconfigured = matches!(result, Err(WorkflowError::ChainMisconfigured { .. }));
                prop_assert!(is_misconfigured);
            }
        }

        #[test]
        fn prop_gaps_in_order_are_rejected(len in 2u32..8, gap_at in 0usize..7) {
            let role = RoleId::new();
            let mut definitions = chain_definitions(len, false, role);
            let index = gap_at % definitions.len();
            definitions[index].order += len;

            prop_assert!(validate_chain(CategoryId::new(), &definitions).is_err());
        }

        #[test]
        fn prop_only_the_current_step_can_be_approved(
            len in 1u32..7,
            with_head in any::<bool>(),
            attempts in prop::collection::vec(0usize..7, 1..24),
        ) {
            let role = RoleId::new();
            let chain = validate_chain(CategoryId::new(), &chain_definitions(len, with_head, role)).unwrap();
            let mut enrollment = Enrollment::new(CourseId::new(), UserId::new(), None, Utc::now());
            enrollment.steps = create_enrollment_snapshot(enrollment.id, &chain).unwrap();
            let actor = actor_for_everything(role);

            for attempt in attempts {
                let step_id = enrollment.steps[attempt % enrollment.steps.len()].id;
                let expected_current = current_step(&enrollment).map(|s| s.id);
                let before = enrollment.clone();

                match resolve_step(&mut enrollment, step_id, &actor, Decision::Approved, None, Utc::now()) {
                    Ok(_) => prop_assert_eq!(Some(step_id), expected_current),
                    Err(_) => prop_assert_eq!(&enrollment, &before),
                }

                // Resolved steps always form a prefix of the chain
                let resolved: Vec<bool> = enrollment.steps.iter().map(|s| s.is_resolved()).collect();
                let prefix = resolved.iter().take_while(|r| **r).count();
                prop_assert!(resolved[prefix..].iter().all(|r| !*r));
            }

            if enrollment.resolved_steps() == enrollment.steps.len() {
                prop_assert_eq!(enrollment.status, EnrollmentStatus::Approved);
                prop_assert!(enrollment.final_approval);
            } else {
                prop_assert_eq!(enrollment.status, EnrollmentStatus::Pending);
            }
        }

        #[test]
        fn prop_rejection_anywhere_is_final(len in 1u32..7, reject_at in 0usize..7) {
            let role = RoleId::new();
            let chain = validate_chain(CategoryId::new(), &chain_definitions(len, true, role)).unwrap();
            let mut enrollment = Enrollment::new(CourseId::new(), UserId::new(), None, Utc::now());
            enrollment.steps = create_enrollment_snapshot(enrollment.id, &chain).unwrap();
            let actor = actor_for_everything(role);
            let reject_at = reject_at % enrollment.steps.len();

            for index in 0..reject_at {
                let step_id = enrollment.steps[index].id;
                resolve_step(&mut enrollment, step_id, &actor, Decision::Approved, None, Utc::now()).unwrap();
            }
            let step_id = enrollment.steps[reject_at].id;
            resolve_step(&mut enrollment, step_id, &actor, Decision::Rejected, None, Utc::now()).unwrap();

            prop_assert_eq!(enrollment.status, EnrollmentStatus::Rejected);
            prop_assert!(enrollment.final_approval);

            for step in enrollment.steps.clone() {
                let result = resolve_step(&mut enrollment, step.id, &actor, Decision::Approved, None, Utc::now());
                let is_already_resolved = matches!(result, Err(WorkflowError::AlreadyResolved { .. }));
                prop_assert!(is_already_resolved);
            }
        }
    }
}
