// Approval chain templates - one ordered chain per course category

pub mod catalog;
pub mod types;
pub mod validation;

pub use catalog::ChainCatalog;
pub use types::{ApprovalChain, ChainFile, ChainStep, ChainStepDefinition, StepAuthority};
pub use validation::{validate_chain, validate_role_references};
