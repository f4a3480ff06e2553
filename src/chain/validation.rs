use std::collections::HashSet;

use crate::chain::types::{ApprovalChain, ChainStep, ChainStepDefinition, StepAuthority};
use crate::error::{WorkflowError, WorkflowResult};
use crate::ids::{CategoryId, RoleId};

/// Validate a category's step definitions and turn them into an ordered chain.
///
/// Rejects with `ChainMisconfigured` unless exactly one step is final, the
/// orders are unique and contiguous from 1, at most one step is a head step,
/// and every non-head step names a role. An empty list is rejected too;
/// "no steps" is handled by [`crate::chain::ChainCatalog::get_chain`].
pub fn validate_chain(
    category_id: CategoryId,
    definitions: &[ChainStepDefinition],
) -> WorkflowResult<ApprovalChain> {
    let mut steps = definitions
        .iter()
        .map(|definition| typed_step(category_id, definition))
        .collect::<WorkflowResult<Vec<_>>>()?;
    steps.sort_by_key(|step| step.order);

    check_invariants(category_id, &steps, false)?;
    Ok(ApprovalChain::from_validated(category_id, steps))
}

/// Reject role-scoped steps that reference roles the role provider doesn't know
pub fn validate_role_references(
    chain: &ApprovalChain,
    known_roles: &HashSet<RoleId>,
) -> WorkflowResult<()> {
    for step in chain.steps() {
        if let StepAuthority::Role(role_id) = step.authority {
            if !known_roles.contains(&role_id) {
                return Err(WorkflowError::misconfigured(
                    Some(chain.category_id()),
                    format!("step {} references unknown role {}", step.order, role_id),
                ));
            }
        }
    }
    Ok(())
}

fn typed_step(category_id: CategoryId, definition: &ChainStepDefinition) -> WorkflowResult<ChainStep> {
    let authority = match (definition.head_approval, definition.role_id) {
        (true, None) => StepAuthority::Head,
        (false, Some(role_id)) => StepAuthority::Role(role_id),
        (true, Some(_)) => {
            return Err(WorkflowError::misconfigured(
                Some(category_id),
                format!("step {} is a head step but also names a role", definition.order),
            ))
        }
        (false, None) => {
            return Err(WorkflowError::misconfigured(
                Some(category_id),
                format!("step {} needs a role reference", definition.order),
            ))
        }
    };

    Ok(ChainStep {
        id: definition.id,
        order: definition.order,
        authority,
        final_step: definition.final_step,
    })
}

/// Invariants over an already-typed, order-sorted step list
pub(crate) fn check_invariants(
    category_id: CategoryId,
    steps: &[ChainStep],
    allow_automatic: bool,
) -> WorkflowResult<()> {
    let fail = |reason: String| Err(WorkflowError::misconfigured(Some(category_id), reason));

    if steps.is_empty() {
        return fail("chain has no steps".to_string());
    }

    for (index, step) in steps.iter().enumerate() {
        let expected = index as u32 + 1;
        if step.order != expected {
            return fail(format!(
                "step orders must be unique and contiguous from 1: expected {expected}, found {}",
                step.order
            ));
        }
        if step.authority == StepAuthority::Automatic && !allow_automatic {
            return fail(format!("step {} cannot be automatic", step.order));
        }
    }

    let final_steps = steps.iter().filter(|step| step.final_step).count();
    if final_steps != 1 {
        return fail(format!("expected exactly one final step, found {final_steps}"));
    }

    let head_steps = steps
        .iter()
        .filter(|step| step.authority == StepAuthority::Head)
        .count();
    if head_steps > 1 {
        return fail(format!("expected at most one head step, found {head_steps}"));
    }

    Ok(())
}
