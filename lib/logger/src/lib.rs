use anyhow::Context;
use pivot_client::entities::logger::{LogConfig, StdioLogMode};
use tracing::level_filters::LevelFilter;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::{
  Layer, Registry, layer::SubscriberExt, util::SubscriberInitExt,
};

mod otel;

/// Install the global tracing subscriber from the log config:
/// an stdio layer (standard / pretty / json / none) plus an
/// optional OTLP export layer.
pub fn init(config: &LogConfig) -> anyhow::Result<()> {
  let log_level: tracing::Level = config.level.into();

  let stdio = match (config.stdio, config.pretty) {
    (StdioLogMode::Standard, true) => Some(
      tracing_subscriber::fmt::layer()
        .pretty()
        .with_file(false)
        .with_line_number(false)
        .boxed(),
    ),
    (StdioLogMode::Standard, false) => Some(
      tracing_subscriber::fmt::layer()
        .with_file(false)
        .with_line_number(false)
        .boxed(),
    ),
    (StdioLogMode::Json, _) => {
      Some(tracing_subscriber::fmt::layer().json().boxed())
    }
    (StdioLogMode::None, _) => None,
  };

  let otel = (!config.otlp_endpoint.is_empty()).then(|| {
    OpenTelemetryLayer::new(otel::tracer(
      &config.otlp_endpoint,
      config.opentelemetry_service_name.clone(),
    ))
  });

  if stdio.is_none() && otel.is_none() {
    return Ok(());
  }

  Registry::default()
    .with(LevelFilter::from(log_level))
    .with(stdio)
    .with(otel)
    .try_init()
    .context("failed to init logger")
}
