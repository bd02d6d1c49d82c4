//! Logging initialization and span helpers.
//!
//! Diagnostics go to stderr through `tracing`; stdout is reserved for CLI
//! output such as `docflow status`.

use std::sync::Once;
use tracing::{Span, Subscriber};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    /// JSON lines, one object per event.
    Json,
    /// Human-readable multi-line output.
    #[default]
    Pretty,
}

/// Initializes the global subscriber. Later calls are no-ops.
///
/// `RUST_LOG` selects levels, defaulting to `info`.
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        subscriber(format, env_filter, std::io::stderr).init();
    });
}

/// Subscriber writing `format` events that pass `filter` to `writer`.
pub fn subscriber<W>(
    format: LogFormat,
    filter: EnvFilter,
    writer: W,
) -> Box<dyn Subscriber + Send + Sync>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => Box::new(registry.with(fmt::layer().json().with_writer(writer))),
        LogFormat::Pretty => Box::new(registry.with(fmt::layer().pretty().with_writer(writer))),
    }
}

/// Span wrapping the processing of one work item.
#[must_use]
pub fn document_span(project_id: &str, document: &str) -> Span {
    tracing::info_span!("process_document", project_id = project_id, document = document)
}

/// Span wrapping one completion check.
#[must_use]
pub fn finalize_span(project_id: &str) -> Span {
    tracing::info_span!("finalize", project_id = project_id)
}
