use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

use crate::config::ObservabilityConfig;
use crate::ids::EnrollmentId;

/// Initialize structured logging.
///
/// `RUST_LOG` wins over the configured level. JSON output carries the
/// current span and span list so correlation ids travel with every event.
pub fn init_telemetry(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))?;

    if config.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true),
            )
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()?;
    }

    tracing::debug!("Enrollment gate telemetry initialized");
    Ok(())
}

/// Generate a correlation ID for linking related operations
pub fn generate_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Span wrapping one workflow operation on one enrollment
pub fn create_workflow_span(
    operation: &str,
    enrollment_id: Option<EnrollmentId>,
    correlation_id: &str,
) -> tracing::Span {
    let enrollment_id = enrollment_id.map(|id| id.to_string());
    tracing::info_span!(
        "enrollment_workflow",
        operation = operation,
        enrollment.id = enrollment_id.as_deref(),
        correlation.id = correlation_id,
    )
}
