use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use enrollment_gate::{
    config, init_telemetry, open_store, validate_chain, Actor, AttendanceId, AttendanceRecorder,
    CategoryId, ChainCatalog, ChainFile, Course, CourseId, EnrollmentGateConfig, EnrollmentId,
    EnrollmentStore, LoggingDispatcher, NewEnrollment, NotificationKind, NotificationQueue,
    NotificationWorker, OrganizationId, Role, RoleGrant, RoleId, StepId, UserId, WorkflowEngine,
};

#[derive(Parser)]
#[command(name = "enrollment-gate")]
#[command(about = "Multi-step approval workflow for course enrollments")]
#[command(long_about = "Enrollment Gate walks course enrollments through per-category approval \
                       chains, tracks notification receipts and gates attendance on approval. \
                       Start with 'enrollment-gate validate-chain <file>' to check a chain definition.")]
struct Cli {
    /// Configuration file (defaults to enrollment-gate.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a chain definition file without touching any store
    ValidateChain {
        /// TOML file with [[steps]] entries
        file: PathBuf,
    },
    /// Register a role that chain steps may reference
    DefineRole {
        #[arg(long)]
        name: String,
        #[arg(long, help = "Role id; generated when omitted")]
        id: Option<RoleId>,
    },
    /// Register or update a course
    DefineCourse {
        #[arg(long)]
        title: String,
        #[arg(long)]
        category: CategoryId,
        #[arg(long, help = "Course start as RFC 3339, e.g. 2026-11-02T09:00:00Z")]
        starts_at: DateTime<Utc>,
        #[arg(long, help = "Excuses close this many hours before the start")]
        excuse_window_hours: Option<u32>,
        #[arg(long, help = "Course id; generated when omitted")]
        id: Option<CourseId>,
    },
    /// Validate and store the approval chain of a category
    DefineChain {
        #[arg(long)]
        category: CategoryId,
        file: PathBuf,
    },
    /// Enroll a user in a course
    Enroll {
        #[arg(long)]
        course: CourseId,
        #[arg(long)]
        user: UserId,
        #[arg(long, help = "The enrollee's organization")]
        organization: Option<OrganizationId>,
    },
    /// Approve the current step of an enrollment
    Approve {
        #[command(flatten)]
        decision: DecisionArgs,
    },
    /// Reject the current step of an enrollment
    Reject {
        #[command(flatten)]
        decision: DecisionArgs,
    },
    /// Withdraw an enrollment as the enrollee
    Excuse {
        #[arg(long)]
        enrollment: EnrollmentId,
        #[arg(long)]
        user: UserId,
    },
    /// Print an enrollment with its steps and progress as JSON
    Show {
        #[arg(long)]
        enrollment: EnrollmentId,
    },
    /// Record a check-in for an approved enrollment
    CheckIn {
        #[arg(long)]
        enrollment: EnrollmentId,
    },
    /// Close an open attendance record
    CheckOut {
        #[arg(long)]
        attendance: AttendanceId,
    },
    /// Send an enrollment e-mail again, ignoring whether it was sent before
    Resend {
        #[arg(long)]
        enrollment: EnrollmentId,
        #[arg(long, help = "confirmation, final_approval or status_change")]
        kind: NotificationKind,
    },
}

#[derive(clap::Args)]
struct DecisionArgs {
    #[arg(long)]
    enrollment: EnrollmentId,
    #[arg(long)]
    step: StepId,
    #[arg(long)]
    actor: UserId,
    #[arg(long, help = "The actor is the enrollee's head")]
    head: bool,
    #[arg(
        long = "role",
        value_parser = parse_grant,
        help = "Role grant as ROLE_ID@ORGANIZATION_ID, or ROLE_ID@* for all organizations"
    )]
    roles: Vec<RoleGrant>,
    #[arg(long)]
    comment: Option<String>,
}

impl DecisionArgs {
    fn actor(&self) -> Actor {
        Actor {
            user_id: self.actor,
            roles: self.roles.clone(),
            head_of_enrollee: self.head,
        }
    }
}

fn parse_grant(value: &str) -> Result<RoleGrant, String> {
    let (role, scope) = value
        .split_once('@')
        .ok_or_else(|| format!("expected ROLE_ID@ORGANIZATION_ID or ROLE_ID@*, got '{value}'"))?;
    let role_id: RoleId = role.parse().map_err(|e| format!("invalid role id '{role}': {e}"))?;

    if scope == "*" {
        return Ok(RoleGrant::global(role_id));
    }
    let organization_id: OrganizationId = scope
        .parse()
        .map_err(|e| format!("invalid organization id '{scope}': {e}"))?;
    Ok(RoleGrant::scoped(role_id, organization_id))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let _ = EnrollmentGateConfig::load_env_file();
    let settings = match &cli.config {
        Some(path) => EnrollmentGateConfig::load_from(Some(path))
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => config()?.clone(),
    };
    init_telemetry(&settings.observability)?;

    tokio::runtime::Runtime::new()?.block_on(async { run(cli.command, settings).await })
}

async fn run(command: Commands, settings: EnrollmentGateConfig) -> Result<()> {
    if let Commands::ValidateChain { file } = &command {
        return validate_chain_command(file);
    }

    let store = open_store(settings.database.as_ref()).await?;
    let catalog = Arc::new(ChainCatalog::new(
        store.clone(),
        settings.workflow.chain_cache_capacity,
        settings.workflow.chain_cache_ttl(),
    ));

    let (queue, rx) = NotificationQueue::channel(settings.workflow.notification_queue_capacity);
    let engine = WorkflowEngine::new(store.clone(), catalog).with_notifications(queue);
    let worker =
        NotificationWorker::new(rx, Arc::new(LoggingDispatcher), engine.tracker()).spawn();
    let recorder = AttendanceRecorder::new(store.clone(), engine.locks());

    let result = dispatch(command, &engine, &recorder, store.as_ref()).await;

    // Closing the queue lets the worker drain and record what was sent
    drop(engine);
    let delivered = worker.await.context("Notification worker panicked")?;
    tracing::debug!(delivered, "Notification queue drained");

    result
}

async fn dispatch(
    command: Commands,
    engine: &WorkflowEngine,
    recorder: &AttendanceRecorder,
    store: &dyn EnrollmentStore,
) -> Result<()> {
    match command {
        Commands::ValidateChain { file } => validate_chain_command(&file),
        Commands::DefineRole { name, id } => {
            let role = Role {
                id: id.unwrap_or_default(),
                name,
            };
            store.save_role(&role).await?;
            println!("✅ Role '{}' defined: {}", role.name, role.id);
            Ok(())
        }
        Commands::DefineCourse {
            title,
            category,
            starts_at,
            excuse_window_hours,
            id,
        } => {
            let course = Course {
                id: id.unwrap_or_default(),
                category_id: category,
                title,
                starts_at,
                excuse_window_hours,
            };
            store.save_course(&course).await?;
            println!("✅ Course '{}' defined: {}", course.title, course.id);
            Ok(())
        }
        Commands::DefineChain { category, file } => {
            let chain_file = read_chain_file(&file)?;
            let chain = engine
                .catalog()
                .define_chain(category, &chain_file.steps)
                .await?;
            println!("✅ Chain for category {} defined with {} step(s)", category, chain.len());
            Ok(())
        }
        Commands::Enroll {
            course,
            user,
            organization,
        } => {
            let enrollment = engine
                .create_enrollment(NewEnrollment {
                    course_id: course,
                    user_id: user,
                    organization_id: organization,
                })
                .await?;
            println!("✅ Enrollment {} created ({})", enrollment.id, enrollment.status);
            if let Some(step) = enrollment_gate::current_step(&enrollment) {
                println!("   Next step: {} ({})", step.id, step.authority.label());
            }
            Ok(())
        }
        Commands::Approve { decision } => {
            let enrollment = engine
                .approve_step(
                    decision.enrollment,
                    decision.step,
                    &decision.actor(),
                    decision.comment.clone(),
                )
                .await?;
            println!("✅ Step approved; enrollment is {}", enrollment.status);
            Ok(())
        }
        Commands::Reject { decision } => {
            let enrollment = engine
                .reject_step(
                    decision.enrollment,
                    decision.step,
                    &decision.actor(),
                    decision.comment.clone(),
                )
                .await?;
            println!("❌ Step rejected; enrollment is {}", enrollment.status);
            Ok(())
        }
        Commands::Excuse { enrollment, user } => {
            let enrollment = engine.excuse(enrollment, user, Utc::now()).await?;
            println!("✅ Enrollment {} excused", enrollment.id);
            Ok(())
        }
        Commands::Show { enrollment } => {
            let progress = engine.progress(enrollment).await?;
            let enrollment = engine.enrollment(enrollment).await?;
            let view = serde_json::json!({
                "enrollment": enrollment,
                "progress": progress,
            });
            println!("{}", serde_json::to_string_pretty(&view)?);
            Ok(())
        }
        Commands::CheckIn { enrollment } => {
            let record = recorder.check_in(enrollment, Utc::now()).await?;
            println!("✅ Checked in: attendance {}", record.id);
            Ok(())
        }
        Commands::CheckOut { attendance } => {
            let record = recorder.check_out(attendance, Utc::now()).await?;
            let total = recorder.total_attended(record.enrollment_id).await?;
            println!(
                "✅ Checked out after {} minute(s); {} minute(s) attended in total",
                record.elapsed(Utc::now()).num_minutes(),
                total.num_minutes()
            );
            Ok(())
        }
        Commands::Resend { enrollment, kind } => {
            if engine.resend_notification(enrollment, kind).await? {
                println!("📨 {kind} e-mail queued for enrollment {enrollment}");
            } else {
                println!("⚠️  {kind} e-mail could not be queued");
            }
            Ok(())
        }
    }
}

fn read_chain_file(file: &Path) -> Result<ChainFile> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read chain file {}", file.display()))?;
    Ok(ChainFile::from_toml_str(&content)?)
}

fn validate_chain_command(file: &Path) -> Result<()> {
    let chain_file = read_chain_file(file)?;
    let chain = validate_chain(CategoryId::new(), &chain_file.steps)?;

    println!("✅ Chain is valid ({} step(s))", chain.len());
    for step in chain.steps() {
        let marker = if step.final_step { " [final]" } else { "" };
        println!("   {}. {}{}", step.order, step.authority.label(), marker);
    }
    Ok(())
}
