//! Tracing initialization for embedding binaries.
//!
//! The core only emits via `tracing` macros; hosts decide where output goes.
//! This helper wires the common setup: an `EnvFilter` driven by the `LOG`
//! env var with a verbosity fallback, a stderr layer, and an optional
//! non-blocking file layer.

use std::fs;
use std::path::PathBuf;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

const LOG_FILE_PREFIX: &str = "partymeter.log";

#[derive(Clone, Debug, Default)]
pub struct TelemetryConfig {
    /// 0 = warn, 1 = info, 2 = debug, 3+ = trace.
    pub verbosity: u8,
    /// When set, logs are also appended to rotating daily files here.
    pub log_dir: Option<PathBuf>,
    pub stderr: bool,
}

pub struct TelemetryGuard {
    _guards: Vec<tracing_appender::non_blocking::WorkerGuard>,
}

pub fn init(config: TelemetryConfig) -> TelemetryGuard {
    let filter = EnvFilter::builder()
        .with_default_directive(level_from_verbosity(config.verbosity).into())
        .with_env_var("LOG")
        .from_env_lossy();

    let mut guards = Vec::new();
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    if config.stderr {
        layers.push(Box::new(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true),
        ));
    }

    let mut file_setup_error = None;
    if let Some(dir) = &config.log_dir {
        match fs::create_dir_all(dir) {
            Ok(()) => {
                let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
                let (writer, guard) = tracing_appender::non_blocking(appender);
                layers.push(Box::new(
                    tracing_subscriber::fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false),
                ));
                guards.push(guard);
            }
            Err(err) => {
                file_setup_error = Some(format!("log dir init failed for {}: {err}", dir.display()));
            }
        }
    }

    layers.push(Box::new(filter));

    Registry::default().with(layers).init();

    if let Some(error) = file_setup_error {
        tracing::warn!("{error}");
    }

    TelemetryGuard { _guards: guards }
}

fn level_from_verbosity(verbosity: u8) -> Level {
    match verbosity {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    }
}
