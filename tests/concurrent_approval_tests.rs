// Concurrent decisions on the same enrollment must serialize

use async_trait::async_trait;
use chrono::Utc;
use enrollment_gate::{
    Actor, AttendanceId, AttendanceRecord, CategoryId, ChainCatalog, ChainStepDefinition, Course,
    CourseId, Enrollment, EnrollmentId, EnrollmentStatus, EnrollmentStore, InMemoryStore,
    NewEnrollment, Role, RoleId, StoreError, UserId, WorkflowEngine, WorkflowError,
};
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Holds every enrollment read for a while before returning it, so that
/// engines without a shared lock table act on the same stale snapshot.
struct StaleReadStore {
    inner: InMemoryStore,
    delay: Duration,
}

impl StaleReadStore {
    fn new(delay: Duration) -> Self {
        Self {
            inner: InMemoryStore::new(),
            delay,
        }
    }
}

#[async_trait]
impl EnrollmentStore for StaleReadStore {
    async fn save_role(&self, role: &Role) -> Result<(), StoreError> {
        self.inner.save_role(role).await
    }

    async fn known_roles(&self) -> Result<HashSet<RoleId>, StoreError> {
        self.inner.known_roles().await
    }

    async fn save_course(&self, course: &Course) -> Result<(), StoreError> {
        self.inner.save_course(course).await
    }

    async fn load_course(&self, course_id: CourseId) -> Result<Course, StoreError> {
        self.inner.load_course(course_id).await
    }

    async fn load_chain(
        &self,
        category_id: CategoryId,
    ) -> Result<Vec<ChainStepDefinition>, StoreError> {
        self.inner.load_chain(category_id).await
    }

    async fn save_chain(
        &self,
        category_id: CategoryId,
        steps: &[ChainStepDefinition],
    ) -> Result<(), StoreError> {
        self.inner.save_chain(category_id, steps).await
    }

    async fn insert_enrollment(&self, enrollment: &Enrollment) -> Result<(), StoreError> {
        self.inner.insert_enrollment(enrollment).await
    }

    async fn load_enrollment(&self, enrollment_id: EnrollmentId) -> Result<Enrollment, StoreError> {
        let enrollment = self.inner.load_enrollment(enrollment_id).await;
        tokio::time::sleep(self.delay).await;
        enrollment
    }

    async fn save_enrollment(&self, enrollment: &Enrollment) -> Result<u64, StoreError> {
        self.inner.save_enrollment(enrollment).await
    }

    async fn find_enrollments(
        &self,
        course_id: CourseId,
        user_id: UserId,
    ) -> Result<Vec<Enrollment>, StoreError> {
        let found = self.inner.find_enrollments(course_id, user_id).await;
        tokio::time::sleep(self.delay).await;
        found
    }

    async fn insert_attendance(&self, record: &AttendanceRecord) -> Result<(), StoreError> {
        self.inner.insert_attendance(record).await
    }

    async fn load_attendance(
        &self,
        attendance_id: AttendanceId,
    ) -> Result<AttendanceRecord, StoreError> {
        self.inner.load_attendance(attendance_id).await
    }

    async fn save_attendance(&self, record: &AttendanceRecord) -> Result<(), StoreError> {
        self.inner.save_attendance(record).await
    }

    async fn list_attendance(
        &self,
        enrollment_id: EnrollmentId,
    ) -> Result<Vec<AttendanceRecord>, StoreError> {
        self.inner.list_attendance(enrollment_id).await
    }
}

/// Two engines, each with its own lock table, over one shared store
async fn engines_sharing_store(
    chain: &[ChainStepDefinition],
) -> (WorkflowEngine, WorkflowEngine, Arc<StaleReadStore>, Course) {
    let store = Arc::new(StaleReadStore::new(Duration::from_millis(50)));
    let course = Course {
        id: CourseId::new(),
        category_id: CategoryId::new(),
        title: "Confined spaces".to_string(),
        starts_at: Utc::now() + chrono::Duration::days(5),
        excuse_window_hours: None,
    };
    store.save_course(&course).await.unwrap();

    let catalog = Arc::new(ChainCatalog::new(store.clone(), 8, Duration::from_secs(60)));
    if !chain.is_empty() {
        catalog.define_chain(course.category_id, chain).await.unwrap();
    }

    let first = WorkflowEngine::new(store.clone(), catalog.clone());
    let second = WorkflowEngine::new(store.clone(), catalog);
    (first, second, store, course)
}

async fn engine_with_enrollment(
    chain: &[ChainStepDefinition],
) -> (Arc<WorkflowEngine>, enrollment_gate::Enrollment) {
    let store = Arc::new(InMemoryStore::new());
    let course = Course {
        id: CourseId::new(),
        category_id: CategoryId::new(),
        title: "Hazmat handling".to_string(),
        starts_at: Utc::now() + chrono::Duration::days(5),
        excuse_window_hours: None,
    };
    store.save_course(&course).await.unwrap();

    let catalog = Arc::new(ChainCatalog::new(
        store.clone(),
        8,
        std::time::Duration::from_secs(60),
    ));
    catalog.define_chain(course.category_id, chain).await.unwrap();

    let engine = Arc::new(WorkflowEngine::new(store, catalog));
    let enrollment = engine
        .create_enrollment(NewEnrollment {
            course_id: course.id,
            user_id: UserId::new(),
            organization_id: None,
        })
        .await
        .unwrap();
    (engine, enrollment)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_approvals_exactly_one_succeeds() {
    let (engine, enrollment) =
        engine_with_enrollment(&[ChainStepDefinition::head(1).finalize()]).await;
    let (enrollment_id, step_id) = (enrollment.id, enrollment.steps[0].id);

    let attempts = (0..16).map(|_| {
        let engine = engine.clone();
        tokio::spawn(async move {
            let head = Actor::new(UserId::new()).as_head();
            engine.approve_step(enrollment_id, step_id, &head, None).await
        })
    });
    let results: Vec<_> = join_all(attempts)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    let successes = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(successes, 1);
    assert!(results.iter().filter_map(|r| r.as_ref().err()).all(|e| {
        matches!(e, WorkflowError::AlreadyResolved { .. }) && e.is_retryable()
    }));

    let stored = engine.enrollment(enrollment_id).await.unwrap();
    assert_eq!(stored.status, EnrollmentStatus::Approved);
    assert_eq!(stored.version, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_approve_and_reject_settle_once() {
    let (engine, enrollment) =
        engine_with_enrollment(&[ChainStepDefinition::head(1).finalize()]).await;
    let step_id = enrollment.steps[0].id;
    let head = Actor::new(UserId::new()).as_head();

    let (approved, rejected) = tokio::join!(
        engine.approve_step(enrollment.id, step_id, &head, None),
        engine.reject_step(enrollment.id, step_id, &head, None),
    );
    assert!(approved.is_ok() ^ rejected.is_ok());

    let stored = engine.enrollment(enrollment.id).await.unwrap();
    let expected = if approved.is_ok() {
        EnrollmentStatus::Approved
    } else {
        EnrollmentStatus::Rejected
    };
    assert_eq!(stored.status, expected);
    assert_eq!(stored.resolved_steps(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_duplicate_enrollment_requests_create_one() {
    let store = Arc::new(InMemoryStore::new());
    let course = Course {
        id: CourseId::new(),
        category_id: CategoryId::new(),
        title: "Induction".to_string(),
        starts_at: Utc::now(),
        excuse_window_hours: None,
    };
    store.save_course(&course).await.unwrap();
    let catalog = Arc::new(ChainCatalog::new(
        store.clone(),
        8,
        std::time::Duration::from_secs(60),
    ));
    let engine = Arc::new(WorkflowEngine::new(store.clone(), catalog));
    let user = UserId::new();

    let requests = (0..8).map(|_| {
        let engine = engine.clone();
        let course_id = course.id;
        tokio::spawn(async move {
            engine
                .create_enrollment(NewEnrollment {
                    course_id,
                    user_id: user,
                    organization_id: None,
                })
                .await
        })
    });
    let results: Vec<_> = join_all(requests)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(store.find_enrollments(course.id, user).await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_approve_and_excuse_settle_once() {
    let (engine, enrollment) =
        engine_with_enrollment(&[ChainStepDefinition::head(1).finalize()]).await;
    let step_id = enrollment.steps[0].id;
    let head = Actor::new(UserId::new()).as_head();

    let (approved, excused) = tokio::join!(
        engine.approve_step(enrollment.id, step_id, &head, None),
        engine.excuse(enrollment.id, enrollment.user_id, Utc::now()),
    );
    assert!(approved.is_ok() ^ excused.is_ok());

    let stored = engine.enrollment(enrollment.id).await.unwrap();
    assert!(stored.final_approval);
    if approved.is_ok() {
        assert_eq!(stored.status, EnrollmentStatus::Approved);
        assert!(matches!(excused, Err(WorkflowError::ExcuseWindowClosed { .. })));
    } else {
        assert_eq!(stored.status, EnrollmentStatus::Excused);
        assert!(matches!(approved, Err(WorkflowError::AlreadyResolved { .. })));
        assert!(!stored.steps[0].is_resolved());
    }
}

#[tokio::test]
async fn test_stale_save_from_another_engine_is_an_optimistic_conflict() {
    let (first, second, _store, course) =
        engines_sharing_store(&[ChainStepDefinition::head(1).finalize()]).await;
    let enrollment = first
        .create_enrollment(NewEnrollment {
            course_id: course.id,
            user_id: UserId::new(),
            organization_id: None,
        })
        .await
        .unwrap();
    let step_id = enrollment.steps[0].id;
    let head = Actor::new(UserId::new()).as_head();

    let (a, b) = tokio::join!(
        first.approve_step(enrollment.id, step_id, &head, None),
        second.approve_step(enrollment.id, step_id, &head, None),
    );
    assert!(a.is_ok() ^ b.is_ok());
    let err = a.err().or(b.err()).unwrap();
    assert!(matches!(
        err,
        WorkflowError::OptimisticConflict {
            expected: 0,
            found: 1,
            ..
        }
    ));
    assert!(err.is_retryable());

    let stored = first.enrollment(enrollment.id).await.unwrap();
    assert_eq!(stored.version, 1);
    assert_eq!(stored.status, EnrollmentStatus::Approved);
}

#[tokio::test]
async fn test_enrollment_uniqueness_holds_across_engines() {
    let (first, second, store, course) = engines_sharing_store(&[]).await;
    let user = UserId::new();
    let request = NewEnrollment {
        course_id: course.id,
        user_id: user,
        organization_id: None,
    };

    let (a, b) = tokio::join!(
        first.create_enrollment(request.clone()),
        second.create_enrollment(request),
    );
    assert!(a.is_ok() ^ b.is_ok());
    assert!(matches!(
        a.err().or(b.err()),
        Some(WorkflowError::AlreadyEnrolled { .. })
    ));

    let live = store
        .find_enrollments(course.id, user)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.status.is_live())
        .count();
    assert_eq!(live, 1);
}
