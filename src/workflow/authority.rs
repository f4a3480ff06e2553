// Authority checks - who may action which step

use serde::{Deserialize, Serialize};

use crate::chain::StepAuthority;
use crate::enrollment::ApprovalStep;
use crate::error::{WorkflowError, WorkflowResult};
use crate::ids::{OrganizationId, RoleId, UserId};

/// A role membership as reported by the identity provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleGrant {
    pub role_id: RoleId,
    /// Organization the grant is scoped to
    pub organization_id: Option<OrganizationId>,
    /// Grant applies to enrollees of every organization
    #[serde(default)]
    pub all_organizations: bool,
}

impl RoleGrant {
    pub fn scoped(role_id: RoleId, organization_id: OrganizationId) -> Self {
        Self {
            role_id,
            organization_id: Some(organization_id),
            all_organizations: false,
        }
    }

    pub fn global(role_id: RoleId) -> Self {
        Self {
            role_id,
            organization_id: None,
            all_organizations: true,
        }
    }

    /// Whether this grant's scope reaches an enrollee of `enrollee_organization`
    pub fn covers(&self, enrollee_organization: Option<OrganizationId>) -> bool {
        if self.all_organizations {
            return true;
        }
        match (self.organization_id, enrollee_organization) {
            (Some(granted), Some(enrollee)) => granted == enrollee,
            _ => false,
        }
    }
}

/// The acting user, with everything the engine needs to authorize them.
///
/// Headship is resolved by the directory collaborator before the call; the
/// engine never walks a department tree itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub user_id: UserId,
    #[serde(default)]
    pub roles: Vec<RoleGrant>,
    #[serde(default)]
    pub head_of_enrollee: bool,
}

impl Actor {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            roles: Vec::new(),
            head_of_enrollee: false,
        }
    }

    pub fn with_role(mut self, grant: RoleGrant) -> Self {
        self.roles.push(grant);
        self
    }

    pub fn as_head(mut self) -> Self {
        self.head_of_enrollee = true;
        self
    }
}

pub fn check_authority(
    step: &ApprovalStep,
    actor: &Actor,
    enrollee_organization: Option<OrganizationId>,
) -> WorkflowResult<()> {
    match step.authority {
        StepAuthority::Head => {
            if actor.head_of_enrollee {
                Ok(())
            } else {
                Err(WorkflowError::unauthorized(format!(
                    "user {} is not the enrollee's head",
                    actor.user_id
                )))
            }
        }
        StepAuthority::Role(role_id) => {
            let holds_role = actor.roles.iter().any(|grant| grant.role_id == role_id);
            if !holds_role {
                return Err(WorkflowError::unauthorized(format!(
                    "user {} does not hold role {}",
                    actor.user_id, role_id
                )));
            }

            let in_scope = actor
                .roles
                .iter()
                .any(|grant| grant.role_id == role_id && grant.covers(enrollee_organization));
            if in_scope {
                Ok(())
            } else {
                Err(WorkflowError::unauthorized(format!(
                    "role {} held by user {} does not cover the enrollee's organization",
                    role_id, actor.user_id
                )))
            }
        }
        StepAuthority::Automatic => Err(WorkflowError::unauthorized(
            "automatic steps are resolved by the engine",
        )),
    }
}
