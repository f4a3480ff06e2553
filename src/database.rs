#[cfg(feature = "database")]
use async_trait::async_trait;
#[cfg(feature = "database")]
use chrono::{DateTime, SecondsFormat, Utc};
#[cfg(feature = "database")]
use sqlx::{
    migrate::MigrateDatabase, sqlite::SqlitePoolOptions, sqlite::SqliteRow, Row, SqlitePool,
};
#[cfg(feature = "database")]
use std::collections::HashSet;
#[cfg(feature = "database")]
use std::str::FromStr;
#[cfg(feature = "database")]
use tracing::{debug, info};

#[cfg(feature = "database")]
use crate::attendance::AttendanceRecord;
#[cfg(feature = "database")]
use crate::chain::{ChainStepDefinition, StepAuthority};
#[cfg(feature = "database")]
use crate::enrollment::{ApprovalStep, Course, Decision, Enrollment, EnrollmentStatus, StepResolution};
#[cfg(feature = "database")]
use crate::ids::{AttendanceId, CategoryId, CourseId, EnrollmentId, RoleId, UserId};
#[cfg(feature = "database")]
use crate::notifications::NotificationFlags;
#[cfg(feature = "database")]
use crate::store::{EnrollmentStore, Role, StoreError};

use crate::config::DatabaseConfig;

#[cfg(feature = "database")]
/// SQLite-backed store. Enrollment rows and their step rows are written in one transaction.
pub struct SqliteStore {
    pool: SqlitePool,
}

#[cfg(feature = "database")]
impl SqliteStore {
    /// Open (creating if needed) the database and optionally run migrations
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        if !sqlx::Sqlite::database_exists(&config.url).await? {
            info!("Creating database at {}", config.url);
            sqlx::Sqlite::create_database(&config.url).await?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect(&config.url)
            .await?;

        let store = Self { pool };
        if config.auto_migrate {
            store.migrate().await?;
        }
        Ok(store)
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        info!("Running database migrations...");
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    /// Get database pool for queries
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close database connections gracefully
    pub async fn shutdown(&self) {
        info!("Shutting down database connections...");
        self.pool.close().await;
        info!("Database connections closed");
    }

    async fn load_steps(&self, enrollment_id: EnrollmentId) -> Result<Vec<ApprovalStep>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, enrollment_id, template_step_id, step_order, authority, role_id,
                   final_step, approved, rejected, actor_id, resolved_at, comment
            FROM enrollment_steps
            WHERE enrollment_id = ?1
            ORDER BY step_order ASC
            "#,
        )
        .bind(enrollment_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(step_from_row).collect()
    }

    async fn enrollment_with_steps(&self, row: &SqliteRow) -> Result<Enrollment, StoreError> {
        let id: EnrollmentId = parse_id(&row.try_get::<String, _>("id")?)?;
        let steps = self.load_steps(id).await?;
        enrollment_from_row(row, steps)
    }
}

#[cfg(feature = "database")]
#[async_trait]
impl EnrollmentStore for SqliteStore {
    async fn save_role(&self, role: &Role) -> Result<(), StoreError> {
        sqlx::query("INSERT OR REPLACE INTO roles (id, name) VALUES (?1, ?2)")
            .bind(role.id.to_string())
            .bind(&role.name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn known_roles(&self) -> Result<HashSet<RoleId>, StoreError> {
        let rows = sqlx::query("SELECT id FROM roles")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| parse_id(&row.try_get::<String, _>("id")?))
            .collect()
    }

    async fn save_course(&self, course: &Course) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO courses (id, category_id, title, starts_at, excuse_window_hours)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(course.id.to_string())
        .bind(course.category_id.to_string())
        .bind(&course.title)
        .bind(timestamp(course.starts_at))
        .bind(course.excuse_window_hours.map(i64::from))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_course(&self, course_id: CourseId) -> Result<Course, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, category_id, title, starts_at, excuse_window_hours
            FROM courses
            WHERE id = ?1
            "#,
        )
        .bind(course_id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::not_found("course", course_id))?;

        let window: Option<i64> = row.try_get("excuse_window_hours")?;
        Ok(Course {
            id: parse_id(&row.try_get::<String, _>("id")?)?,
            category_id: parse_id(&row.try_get::<String, _>("category_id")?)?,
            title: row.try_get("title")?,
            starts_at: parse_timestamp(&row.try_get::<String, _>("starts_at")?)?,
            excuse_window_hours: window.map(to_u32).transpose()?,
        })
    }

    async fn load_chain(
        &self,
        category_id: CategoryId,
    ) -> Result<Vec<ChainStepDefinition>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, step_order, head_approval, final_step, role_id
            FROM chain_steps
            WHERE category_id = ?1
            ORDER BY step_order ASC
            "#,
        )
        .bind(category_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok::<_, StoreError>(ChainStepDefinition {
                    id: parse_id(&row.try_get::<String, _>("id")?)?,
                    order: to_u32(row.try_get("step_order")?)?,
                    head_approval: row.try_get("head_approval")?,
                    final_step: row.try_get("final_step")?,
                    role_id: parse_optional_id(row.try_get("role_id")?)?,
                })
            })
            .collect()
    }

    async fn save_chain(
        &self,
        category_id: CategoryId,
        steps: &[ChainStepDefinition],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM chain_steps WHERE category_id = ?1")
            .bind(category_id.to_string())
            .execute(&mut *tx)
            .await?;

        for step in steps {
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO chain_steps
                    (id, category_id, step_order, head_approval, final_step, role_id)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
            )
            .bind(step.id.to_string())
            .bind(category_id.to_string())
            .bind(i64::from(step.order))
            .bind(step.head_approval)
            .bind(step.final_step)
            .bind(step.role_id.map(|id| id.to_string()))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(category_id = %category_id, steps = steps.len(), "Chain definition stored");
        Ok(())
    }

    async fn insert_enrollment(&self, enrollment: &Enrollment) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO enrollments
                (id, course_id, user_id, organization_id, status, final_approval,
                 confirmation_sent_at, final_approval_sent_at, status_change_sent_at,
                 created_at, updated_at, version)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
        )
        .bind(enrollment.id.to_string())
        .bind(enrollment.course_id.to_string())
        .bind(enrollment.user_id.to_string())
        .bind(enrollment.organization_id.map(|id| id.to_string()))
        .bind(enrollment.status.as_str())
        .bind(enrollment.final_approval)
        .bind(enrollment.notifications.confirmation_sent_at.map(timestamp))
        .bind(enrollment.notifications.final_approval_sent_at.map(timestamp))
        .bind(enrollment.notifications.status_change_sent_at.map(timestamp))
        .bind(timestamp(enrollment.created_at))
        .bind(timestamp(enrollment.updated_at))
        .bind(to_i64(enrollment.version)?)
        .execute(&mut *tx)
        .await;

        if let Err(sqlx::Error::Database(db_error)) = &inserted {
            if db_error.is_unique_violation() && db_error.message().contains("enrollments.course_id") {
                return Err(StoreError::LiveEnrollment {
                    course_id: enrollment.course_id,
                    user_id: enrollment.user_id,
                });
            }
            if db_error.is_unique_violation() {
                return Err(StoreError::Duplicate {
                    entity: "enrollment",
                    id: enrollment.id.to_string(),
                });
            }
        }
        inserted?;

        for step in &enrollment.steps {
            let (authority, role_id) = encode_authority(&step.authority);
            let resolution = step.resolution.as_ref();
            sqlx::query(
                r#"
                INSERT INTO enrollment_steps
                    (id, enrollment_id, template_step_id, step_order, authority, role_id,
                     final_step, approved, rejected, actor_id, resolved_at, comment)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                "#,
            )
            .bind(step.id.to_string())
            .bind(enrollment.id.to_string())
            .bind(step.template_step_id.to_string())
            .bind(i64::from(step.order))
            .bind(authority)
            .bind(role_id)
            .bind(step.final_step)
            .bind(step.is_approved())
            .bind(step.is_rejected())
            .bind(resolution.and_then(|r| r.actor).map(|id| id.to_string()))
            .bind(resolution.map(|r| timestamp(r.resolved_at)))
            .bind(resolution.and_then(|r| r.comment.clone()))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn load_enrollment(&self, enrollment_id: EnrollmentId) -> Result<Enrollment, StoreError> {
        let row = sqlx::query(&select_enrollments("WHERE id = ?1"))
            .bind(enrollment_id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("enrollment", enrollment_id))?;

        self.enrollment_with_steps(&row).await
    }

    async fn save_enrollment(&self, enrollment: &Enrollment) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let expected = to_i64(enrollment.version)?;

        let updated = sqlx::query(
            r#"
            UPDATE enrollments
            SET status = ?1,
                final_approval = ?2,
                confirmation_sent_at = ?3,
                final_approval_sent_at = ?4,
                status_change_sent_at = ?5,
                updated_at = ?6,
                version = version + 1
            WHERE id = ?7 AND version = ?8
            "#,
        )
        .bind(enrollment.status.as_str())
        .bind(enrollment.final_approval)
        .bind(enrollment.notifications.confirmation_sent_at.map(timestamp))
        .bind(enrollment.notifications.final_approval_sent_at.map(timestamp))
        .bind(enrollment.notifications.status_change_sent_at.map(timestamp))
        .bind(timestamp(enrollment.updated_at))
        .bind(enrollment.id.to_string())
        .bind(expected)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            let found: Option<i64> =
                sqlx::query_scalar("SELECT version FROM enrollments WHERE id = ?1")
                    .bind(enrollment.id.to_string())
                    .fetch_optional(&mut *tx)
                    .await?;
            return Err(match found {
                None => StoreError::not_found("enrollment", enrollment.id),
                Some(found) => StoreError::VersionConflict {
                    enrollment_id: enrollment.id,
                    expected: enrollment.version,
                    found: to_u64(found)?,
                },
            });
        }

        // Resolved rows are never changed again, so only unresolved ones can match
        for step in &enrollment.steps {
            let Some(resolution) = &step.resolution else {
                continue;
            };
            sqlx::query(
                r#"
                UPDATE enrollment_steps
                SET approved = ?1, rejected = ?2, actor_id = ?3, resolved_at = ?4, comment = ?5
                WHERE id = ?6 AND approved = 0 AND rejected = 0
                "#,
            )
            .bind(resolution.decision == Decision::Approved)
            .bind(resolution.decision == Decision::Rejected)
            .bind(resolution.actor.map(|id| id.to_string()))
            .bind(timestamp(resolution.resolved_at))
            .bind(resolution.comment.clone())
            .bind(step.id.to_string())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(enrollment.version + 1)
    }

    async fn find_enrollments(
        &self,
        course_id: CourseId,
        user_id: UserId,
    ) -> Result<Vec<Enrollment>, StoreError> {
        let rows = sqlx::query(&select_enrollments(
            "WHERE course_id = ?1 AND user_id = ?2 ORDER BY created_at ASC",
        ))
        .bind(course_id.to_string())
        .bind(user_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        let mut enrollments = Vec::with_capacity(rows.len());
        for row in &rows {
            enrollments.push(self.enrollment_with_steps(row).await?);
        }
        Ok(enrollments)
    }

    async fn insert_attendance(&self, record: &AttendanceRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO attendance (id, enrollment_id, checked_in_at, checked_out_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(record.id.to_string())
        .bind(record.enrollment_id.to_string())
        .bind(timestamp(record.checked_in_at))
        .bind(record.checked_out_at.map(timestamp))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_attendance(
        &self,
        attendance_id: AttendanceId,
    ) -> Result<AttendanceRecord, StoreError> {
        let row = sqlx::query(
            "SELECT id, enrollment_id, checked_in_at, checked_out_at FROM attendance WHERE id = ?1",
        )
        .bind(attendance_id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::not_found("attendance record", attendance_id))?;

        attendance_from_row(&row)
    }

    async fn save_attendance(&self, record: &AttendanceRecord) -> Result<(), StoreError> {
        let updated = sqlx::query("UPDATE attendance SET checked_out_at = ?1 WHERE id = ?2")
            .bind(record.checked_out_at.map(timestamp))
            .bind(record.id.to_string())
            .execute(&self.pool)
            .await?;

        if updated.rows_affected() == 0 {
            return Err(StoreError::not_found("attendance record", record.id));
        }
        Ok(())
    }

    async fn list_attendance(
        &self,
        enrollment_id: EnrollmentId,
    ) -> Result<Vec<AttendanceRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, enrollment_id, checked_in_at, checked_out_at
            FROM attendance
            WHERE enrollment_id = ?1
            ORDER BY checked_in_at ASC
            "#,
        )
        .bind(enrollment_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(attendance_from_row).collect()
    }
}

#[cfg(feature = "database")]
fn select_enrollments(filter: &str) -> String {
    format!(
        r#"
        SELECT id, course_id, user_id, organization_id, status, final_approval,
               confirmation_sent_at, final_approval_sent_at, status_change_sent_at,
               created_at, updated_at, version
        FROM enrollments
        {filter}
        "#
    )
}

#[cfg(feature = "database")]
fn enrollment_from_row(row: &SqliteRow, steps: Vec<ApprovalStep>) -> Result<Enrollment, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(Enrollment {
        id: parse_id(&row.try_get::<String, _>("id")?)?,
        course_id: parse_id(&row.try_get::<String, _>("course_id")?)?,
        user_id: parse_id(&row.try_get::<String, _>("user_id")?)?,
        organization_id: parse_optional_id(row.try_get("organization_id")?)?,
        status: status.parse::<EnrollmentStatus>().map_err(StoreError::corrupt)?,
        final_approval: row.try_get("final_approval")?,
        steps,
        notifications: NotificationFlags {
            confirmation_sent_at: parse_optional_timestamp(row.try_get("confirmation_sent_at")?)?,
            final_approval_sent_at: parse_optional_timestamp(
                row.try_get("final_approval_sent_at")?,
            )?,
            status_change_sent_at: parse_optional_timestamp(row.try_get("status_change_sent_at")?)?,
        },
        created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_timestamp(&row.try_get::<String, _>("updated_at")?)?,
        version: to_u64(row.try_get("version")?)?,
    })
}

#[cfg(feature = "database")]
fn step_from_row(row: &SqliteRow) -> Result<ApprovalStep, StoreError> {
    let approved: bool = row.try_get("approved")?;
    let rejected: bool = row.try_get("rejected")?;
    let decision = match (approved, rejected) {
        (false, false) => None,
        (true, false) => Some(Decision::Approved),
        (false, true) => Some(Decision::Rejected),
        (true, true) => return Err(StoreError::corrupt("step is both approved and rejected")),
    };

    let resolution = match decision {
        None => None,
        Some(decision) => {
            let resolved_at: Option<String> = row.try_get("resolved_at")?;
            let resolved_at = resolved_at
                .ok_or_else(|| StoreError::corrupt("resolved step has no resolution time"))?;
            Some(StepResolution {
                decision,
                actor: parse_optional_id(row.try_get("actor_id")?)?,
                resolved_at: parse_timestamp(&resolved_at)?,
                comment: row.try_get("comment")?,
            })
        }
    };

    let authority: String = row.try_get("authority")?;
    Ok(ApprovalStep {
        id: parse_id(&row.try_get::<String, _>("id")?)?,
        enrollment_id: parse_id(&row.try_get::<String, _>("enrollment_id")?)?,
        template_step_id: parse_id(&row.try_get::<String, _>("template_step_id")?)?,
        order: to_u32(row.try_get("step_order")?)?,
        authority: decode_authority(&authority, parse_optional_id(row.try_get("role_id")?)?)?,
        final_step: row.try_get("final_step")?,
        resolution,
    })
}

#[cfg(feature = "database")]
fn attendance_from_row(row: &SqliteRow) -> Result<AttendanceRecord, StoreError> {
    Ok(AttendanceRecord {
        id: parse_id(&row.try_get::<String, _>("id")?)?,
        enrollment_id: parse_id(&row.try_get::<String, _>("enrollment_id")?)?,
        checked_in_at: parse_timestamp(&row.try_get::<String, _>("checked_in_at")?)?,
        checked_out_at: parse_optional_timestamp(row.try_get("checked_out_at")?)?,
    })
}

#[cfg(feature = "database")]
fn encode_authority(authority: &StepAuthority) -> (&'static str, Option<String>) {
    match authority {
        StepAuthority::Head => ("head", None),
        StepAuthority::Role(role_id) => ("role", Some(role_id.to_string())),
        StepAuthority::Automatic => ("automatic", None),
    }
}

#[cfg(feature = "database")]
fn decode_authority(kind: &str, role_id: Option<RoleId>) -> Result<StepAuthority, StoreError> {
    match (kind, role_id) {
        ("head", None) => Ok(StepAuthority::Head),
        ("role", Some(role_id)) => Ok(StepAuthority::Role(role_id)),
        ("automatic", None) => Ok(StepAuthority::Automatic),
        (other, _) => Err(StoreError::corrupt(format!("invalid step authority '{other}'"))),
    }
}

// Fixed-width UTC so stored timestamps sort lexically
#[cfg(feature = "database")]
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[cfg(feature = "database")]
fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| StoreError::corrupt(format!("invalid timestamp '{value}': {e}")))
}

#[cfg(feature = "database")]
fn parse_optional_timestamp(value: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    value.as_deref().map(parse_timestamp).transpose()
}

#[cfg(feature = "database")]
fn parse_id<T: FromStr<Err = uuid::Error>>(value: &str) -> Result<T, StoreError> {
    value
        .parse()
        .map_err(|e| StoreError::corrupt(format!("invalid id '{value}': {e}")))
}

#[cfg(feature = "database")]
fn parse_optional_id<T: FromStr<Err = uuid::Error>>(
    value: Option<String>,
) -> Result<Option<T>, StoreError> {
    value.as_deref().map(parse_id).transpose()
}

#[cfg(feature = "database")]
fn to_u32(value: i64) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::corrupt(format!("value {value} out of range")))
}

#[cfg(feature = "database")]
fn to_u64(value: i64) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::corrupt(format!("value {value} out of range")))
}

#[cfg(feature = "database")]
fn to_i64(value: u64) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::corrupt(format!("version {value} out of range")))
}

#[cfg(feature = "database")]
/// Open the configured SQLite store
pub async fn open_store(
    config: Option<&DatabaseConfig>,
) -> anyhow::Result<std::sync::Arc<dyn EnrollmentStore>> {
    let Some(config) = config else {
        anyhow::bail!("No [database] section configured");
    };
    info!("Initializing database at {}", config.url);
    let store = SqliteStore::connect(config).await?;
    Ok(std::sync::Arc::new(store))
}

// Stub implementation for when database feature is not enabled
#[cfg(not(feature = "database"))]
pub async fn open_store(
    _config: Option<&DatabaseConfig>,
) -> anyhow::Result<std::sync::Arc<dyn crate::store::EnrollmentStore>> {
    tracing::info!("Database feature not enabled, no persistent store available");
    anyhow::bail!("This command needs a persistent store; rebuild with --features database")
}
