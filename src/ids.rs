// Identifier newtypes - every relation in the domain is expressed through these

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }
    };
}

define_id!(
    /// A person known to the identity provider (enrollee, approver or admin)
    UserId
);
define_id!(
    /// Organization (company, department or segment) as known to the directory
    OrganizationId
);
define_id!(RoleId);
define_id!(CategoryId);
define_id!(CourseId);
define_id!(EnrollmentId);
define_id!(
    /// A row of a category's approval chain template
    TemplateStepId
);
define_id!(
    /// A per-enrollment frozen copy of a template step
    StepId
);
define_id!(AttendanceId);
