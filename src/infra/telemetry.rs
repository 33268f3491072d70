use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::application::engagement::{
    METRIC_CACHE_UNAVAILABLE, METRIC_ENGAGEMENT_ACCEPTED, METRIC_ENGAGEMENT_REJECTED,
};
use crate::config::{LogFormat, LoggingSettings};
use crate::infra::http::realtime::METRIC_REALTIME_CONNECTIONS;

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            METRIC_ENGAGEMENT_ACCEPTED,
            Unit::Count,
            "Engagement actions admitted and counted, labelled by action."
        );
        describe_counter!(
            METRIC_ENGAGEMENT_REJECTED,
            Unit::Count,
            "Engagement actions rejected as repeats within the window, labelled by action."
        );
        describe_counter!(
            METRIC_CACHE_UNAVAILABLE,
            Unit::Count,
            "Engagement actions that failed because the cache was unreachable."
        );
        describe_gauge!(
            METRIC_REALTIME_CONNECTIONS,
            Unit::Count,
            "Realtime connections currently open on this process."
        );
    });
}
