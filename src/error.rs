use thiserror::Error;

use crate::capture::CaptureError;
use crate::config::ConfigError;

/// Crate-level convenience error.
///
/// Transport, classifier, and decoder errors never surface here: the
/// pipeline absorbs them into drop counters per the degradation policy.
/// Only capture-source and configuration failures reach the caller.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
