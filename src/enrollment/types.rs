// Core types for enrollments and their frozen approval steps

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::chain::StepAuthority;
use crate::ids::{CategoryId, CourseId, EnrollmentId, OrganizationId, StepId, TemplateStepId, UserId};
use crate::notifications::NotificationFlags;

/// Overall enrollment status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    /// Still walking the approval chain
    Pending,
    /// Final step approved
    Approved,
    /// Some step rejected
    Rejected,
    /// Withdrawn by the enrollee before the excuse window closed
    Excused,
}

impl EnrollmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrollmentStatus::Pending => "pending",
            EnrollmentStatus::Approved => "approved",
            EnrollmentStatus::Rejected => "rejected",
            EnrollmentStatus::Excused => "excused",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, EnrollmentStatus::Pending)
    }

    /// Pending and Approved enrollments block a second enrollment in the same course
    pub fn is_live(&self) -> bool {
        matches!(self, EnrollmentStatus::Pending | EnrollmentStatus::Approved)
    }
}

impl fmt::Display for EnrollmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnrollmentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EnrollmentStatus::Pending),
            "approved" => Ok(EnrollmentStatus::Approved),
            "rejected" => Ok(EnrollmentStatus::Rejected),
            "excused" => Ok(EnrollmentStatus::Excused),
            other => Err(format!("Unknown enrollment status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approved,
    Rejected,
}

/// The outcome recorded on a step. Its presence makes the step immutable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepResolution {
    pub decision: Decision,
    /// `None` only for steps the engine resolved automatically
    pub actor: Option<UserId>,
    pub resolved_at: DateTime<Utc>,
    pub comment: Option<String>,
}

/// One link of an enrollment's frozen chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalStep {
    pub id: StepId,
    pub enrollment_id: EnrollmentId,
    pub template_step_id: TemplateStepId,
    pub order: u32,
    pub authority: StepAuthority,
    pub final_step: bool,
    pub resolution: Option<StepResolution>,
}

impl ApprovalStep {
    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }

    pub fn is_approved(&self) -> bool {
        matches!(
            self.resolution,
            Some(StepResolution {
                decision: Decision::Approved,
                ..
            })
        )
    }

    pub fn is_rejected(&self) -> bool {
        matches!(
            self.resolution,
            Some(StepResolution {
                decision: Decision::Rejected,
                ..
            })
        )
    }

    pub fn actor(&self) -> Option<UserId> {
        self.resolution.as_ref().and_then(|r| r.actor)
    }

    pub fn resolved_at(&self) -> Option<DateTime<Utc>> {
        self.resolution.as_ref().map(|r| r.resolved_at)
    }

    pub fn comment(&self) -> Option<&str> {
        self.resolution.as_ref().and_then(|r| r.comment.as_deref())
    }
}

/// The enrollment aggregate: status, flags and its ordered step instances.
///
/// Relations to the course, the user and the organization are identifiers
/// only. `version` is bumped by the store on every successful save.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enrollment {
    pub id: EnrollmentId,
    pub course_id: CourseId,
    pub user_id: UserId,
    pub organization_id: Option<OrganizationId>,
    pub status: EnrollmentStatus,
    pub final_approval: bool,
    pub steps: Vec<ApprovalStep>,
    pub notifications: NotificationFlags,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

impl Enrollment {
    pub fn new(
        course_id: CourseId,
        user_id: UserId,
        organization_id: Option<OrganizationId>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: EnrollmentId::new(),
            course_id,
            user_id,
            organization_id,
            status: EnrollmentStatus::Pending,
            final_approval: false,
            steps: Vec::new(),
            notifications: NotificationFlags::default(),
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    pub fn step(&self, step_id: StepId) -> Option<&ApprovalStep> {
        self.steps.iter().find(|step| step.id == step_id)
    }

    pub fn is_pending(&self) -> bool {
        self.status == EnrollmentStatus::Pending
    }

    /// True once the enrollment has left Pending for any reason
    pub fn is_finalized(&self) -> bool {
        self.final_approval
    }

    pub fn resolved_steps(&self) -> usize {
        self.steps.iter().filter(|step| step.is_resolved()).count()
    }
}

/// A course as far as the approval workflow is concerned
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Course {
    pub id: CourseId,
    pub category_id: CategoryId,
    pub title: String,
    pub starts_at: DateTime<Utc>,
    pub excuse_window_hours: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            EnrollmentStatus::Pending,
            EnrollmentStatus::Approved,
            EnrollmentStatus::Rejected,
            EnrollmentStatus::Excused,
        ] {
            assert_eq!(status.as_str().parse::<EnrollmentStatus>().unwrap(), status);
        }
        assert!("approve".parse::<EnrollmentStatus>().is_err());
    }

    #[test]
    fn test_only_pending_is_non_terminal() {
        assert!(!EnrollmentStatus::Pending.is_terminal());
        assert!(EnrollmentStatus::Approved.is_terminal());
        assert!(EnrollmentStatus::Rejected.is_terminal());
        assert!(EnrollmentStatus::Excused.is_terminal());
    }

    #[test]
    fn test_step_resolution_accessors() {
        let actor = UserId::new();
        let mut step = ApprovalStep {
            id: StepId::new(),
            enrollment_id: EnrollmentId::new(),
            template_step_id: TemplateStepId::new(),
            order: 1,
            authority: StepAuthority::Head,
            final_step: true,
            resolution: None,
        };
        assert!(!step.is_resolved());
        assert_eq!(step.actor(), None);

        step.resolution = Some(StepResolution {
            decision: Decision::Rejected,
            actor: Some(actor),
            resolved_at: Utc::now(),
            comment: Some("Budget freeze".to_string()),
        });
        assert!(step.is_resolved());
        assert!(step.is_rejected());
        assert!(!step.is_approved());
        assert_eq!(step.actor(), Some(actor));
        assert_eq!(step.comment(), Some("Budget freeze"));
    }
}
