// Core types for approval chain templates

use serde::{Deserialize, Serialize};

use crate::error::{WorkflowError, WorkflowResult};
use crate::ids::{CategoryId, RoleId, TemplateStepId};

/// A template row as stored or authored, before validation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainStepDefinition {
    #[serde(default)]
    pub id: TemplateStepId,
    pub order: u32,
    #[serde(default)]
    pub head_approval: bool,
    #[serde(default)]
    pub final_step: bool,
    #[serde(default)]
    pub role_id: Option<RoleId>,
}

impl ChainStepDefinition {
    pub fn head(order: u32) -> Self {
        Self {
            id: TemplateStepId::new(),
            order,
            head_approval: true,
            final_step: false,
            role_id: None,
        }
    }

    pub fn role(order: u32, role_id: RoleId) -> Self {
        Self {
            id: TemplateStepId::new(),
            order,
            head_approval: false,
            final_step: false,
            role_id: Some(role_id),
        }
    }

    pub fn finalize(mut self) -> Self {
        self.final_step = true;
        self
    }
}

/// Who may resolve a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "role_id", rename_all = "snake_case")]
pub enum StepAuthority {
    /// The enrollee's head, as decided by the directory collaborator
    Head,
    /// Any holder of the role whose scope covers the enrollee
    Role(RoleId),
    /// Resolved by the engine itself; only used by the implicit chain
    Automatic,
}

impl StepAuthority {
    pub fn role_id(&self) -> Option<RoleId> {
        match self {
            StepAuthority::Role(role_id) => Some(*role_id),
            _ => None,
        }
    }

    pub fn label(&self) -> String {
        match self {
            StepAuthority::Head => "head".to_string(),
            StepAuthority::Role(role_id) => format!("role:{role_id}"),
            StepAuthority::Automatic => "automatic".to_string(),
        }
    }
}

/// A validated template step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainStep {
    pub id: TemplateStepId,
    pub order: u32,
    pub authority: StepAuthority,
    pub final_step: bool,
}

impl ChainStep {
    pub fn to_definition(&self) -> ChainStepDefinition {
        ChainStepDefinition {
            id: self.id,
            order: self.order,
            head_approval: self.authority == StepAuthority::Head,
            final_step: self.final_step,
            role_id: self.authority.role_id(),
        }
    }
}

/// An ordered, validated approval chain for one course category.
///
/// Only constructed through [`crate::chain::validate_chain`] or
/// [`ApprovalChain::auto_approve`], so holders can rely on its invariants.
/// Serialization is one-way; chains are rebuilt from their step definitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApprovalChain {
    category_id: CategoryId,
    steps: Vec<ChainStep>,
    implicit: bool,
}

impl ApprovalChain {
    pub(crate) fn from_validated(category_id: CategoryId, steps: Vec<ChainStep>) -> Self {
        Self {
            category_id,
            steps,
            implicit: false,
        }
    }

    /// The chain used by categories without any configured steps
    pub fn auto_approve(category_id: CategoryId) -> Self {
        Self {
            category_id,
            steps: vec![ChainStep {
                id: TemplateStepId::new(),
                order: 1,
                authority: StepAuthority::Automatic,
                final_step: true,
            }],
            implicit: true,
        }
    }

    pub fn category_id(&self) -> CategoryId {
        self.category_id
    }

    pub fn steps(&self) -> &[ChainStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn is_implicit(&self) -> bool {
        self.implicit
    }

    pub fn final_step(&self) -> Option<&ChainStep> {
        self.steps.iter().find(|step| step.final_step)
    }

    pub fn head_step(&self) -> Option<&ChainStep> {
        self.steps
            .iter()
            .find(|step| step.authority == StepAuthority::Head)
    }

    pub fn definitions(&self) -> Vec<ChainStepDefinition> {
        self.steps.iter().map(ChainStep::to_definition).collect()
    }

    /// Re-check the chain invariants; used again when a snapshot is taken
    pub fn verify(&self) -> WorkflowResult<()> {
        super::validation::check_invariants(self.category_id, &self.steps, self.implicit)
    }
}

/// On-disk chain file, e.g.
///
/// ```toml
/// [[steps]]
/// order = 1
/// head_approval = true
///
/// [[steps]]
/// order = 2
/// final_step = true
/// role_id = "6f1c0a1e-3f1b-4f57-9a55-0f1c8b1d9c11"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChainFile {
    #[serde(default)]
    pub steps: Vec<ChainStepDefinition>,
}

impl ChainFile {
    pub fn from_toml_str(content: &str) -> WorkflowResult<Self> {
        toml::from_str(content)
            .map_err(|e| WorkflowError::misconfigured(None, format!("unreadable chain file: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::validate_chain;

    #[test]
    fn test_constructed_chains_satisfy_invariants() {
        let implicit = ApprovalChain::auto_approve(CategoryId::new());
        assert!(implicit.is_implicit());
        implicit.verify().unwrap();

        let configured = validate_chain(
            CategoryId::new(),
            &[
                ChainStepDefinition::role(2, RoleId::new()).finalize(),
                ChainStepDefinition::head(1),
            ],
        )
        .unwrap();
        assert!(!configured.is_implicit());
        configured.verify().unwrap();

        let json = serde_json::to_value(&configured).unwrap();
        assert_eq!(json["steps"].as_array().map(Vec::len), Some(2));
    }
}
