use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

use crate::attendance::AttendanceRecord;
use crate::chain::ChainStepDefinition;
use crate::enrollment::{Course, Enrollment};
use crate::ids::{AttendanceId, CategoryId, CourseId, EnrollmentId, RoleId, UserId};
use crate::store::{EnrollmentStore, Role, StoreError};

#[derive(Debug, Default)]
struct Tables {
    roles: HashMap<RoleId, Role>,
    courses: HashMap<CourseId, Course>,
    chains: HashMap<CategoryId, Vec<ChainStepDefinition>>,
    enrollments: HashMap<EnrollmentId, Enrollment>,
    attendance: HashMap<AttendanceId, AttendanceRecord>,
}

/// Process-local store; every call is one atomic critical section
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EnrollmentStore for InMemoryStore {
    async fn save_role(&self, role: &Role) -> Result<(), StoreError> {
        self.tables.write().await.roles.insert(role.id, role.clone());
        Ok(())
    }

    async fn known_roles(&self) -> Result<HashSet<RoleId>, StoreError> {
        Ok(self.tables.read().await.roles.keys().copied().collect())
    }

    async fn save_course(&self, course: &Course) -> Result<(), StoreError> {
        self.tables
            .write()
            .await
            .courses
            .insert(course.id, course.clone());
        Ok(())
    }

    async fn load_course(&self, course_id: CourseId) -> Result<Course, StoreError> {
        self.tables
            .read()
            .await
            .courses
            .get(&course_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("course", course_id))
    }

    async fn load_chain(
        &self,
        category_id: CategoryId,
    ) -> Result<Vec<ChainStepDefinition>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .chains
            .get(&category_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn save_chain(
        &self,
        category_id: CategoryId,
        steps: &[ChainStepDefinition],
    ) -> Result<(), StoreError> {
        self.tables
            .write()
            .await
            .chains
            .insert(category_id, steps.to_vec());
        Ok(())
    }

    async fn insert_enrollment(&self, enrollment: &Enrollment) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if tables.enrollments.contains_key(&enrollment.id) {
            return Err(StoreError::Duplicate {
                entity: "enrollment",
                id: enrollment.id.to_string(),
            });
        }
        if enrollment.status.is_live()
            && tables.enrollments.values().any(|e| {
                e.course_id == enrollment.course_id
                    && e.user_id == enrollment.user_id
                    && e.status.is_live()
            })
        {
            return Err(StoreError::LiveEnrollment {
                course_id: enrollment.course_id,
                user_id: enrollment.user_id,
            });
        }
        tables.enrollments.insert(enrollment.id, enrollment.clone());
        Ok(())
    }

    async fn load_enrollment(&self, enrollment_id: EnrollmentId) -> Result<Enrollment, StoreError> {
        self.tables
            .read()
            .await
            .enrollments
            .get(&enrollment_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("enrollment", enrollment_id))
    }

    async fn save_enrollment(&self, enrollment: &Enrollment) -> Result<u64, StoreError> {
        let mut tables = self.tables.write().await;
        let stored = tables
            .enrollments
            .get_mut(&enrollment.id)
            .ok_or_else(|| StoreError::not_found("enrollment", enrollment.id))?;

        if stored.version != enrollment.version {
            return Err(StoreError::VersionConflict {
                enrollment_id: enrollment.id,
                expected: enrollment.version,
                found: stored.version,
            });
        }

        let mut updated = enrollment.clone();
        updated.version += 1;
        let version = updated.version;
        *stored = updated;
        Ok(version)
    }

    async fn find_enrollments(
        &self,
        course_id: CourseId,
        user_id: UserId,
    ) -> Result<Vec<Enrollment>, StoreError> {
        let tables = self.tables.read().await;
        let mut found: Vec<Enrollment> = tables
            .enrollments
            .values()
            .filter(|e| e.course_id == course_id && e.user_id == user_id)
            .cloned()
            .collect();
        found.sort_by_key(|e| e.created_at);
        Ok(found)
    }

    async fn insert_attendance(&self, record: &AttendanceRecord) -> Result<(), StoreError> {
        self.tables
            .write()
            .await
            .attendance
            .insert(record.id, record.clone());
        Ok(())
    }

    async fn load_attendance(
        &self,
        attendance_id: AttendanceId,
    ) -> Result<AttendanceRecord, StoreError> {
        self.tables
            .read()
            .await
            .attendance
            .get(&attendance_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("attendance record", attendance_id))
    }

    async fn save_attendance(&self, record: &AttendanceRecord) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        match tables.attendance.get_mut(&record.id) {
            Some(stored) => {
                *stored = record.clone();
                Ok(())
            }
            None => Err(StoreError::not_found("attendance record", record.id)),
        }
    }

    async fn list_attendance(
        &self,
        enrollment_id: EnrollmentId,
    ) -> Result<Vec<AttendanceRecord>, StoreError> {
        let tables = self.tables.read().await;
        let mut records: Vec<AttendanceRecord> = tables
            .attendance
            .values()
            .filter(|r| r.enrollment_id == enrollment_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.checked_in_at);
        Ok(records)
    }
}
