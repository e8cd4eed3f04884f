//! Error taxonomy for configuration, resources, and capability warnings.
//!
//! Fatal conditions are ordinary `Err` values; a failed call leaves the
//! context exactly as it was. Capability warnings are non-fatal: they are
//! recorded on the context and emitted at `warn` level, and the call that
//! produced them still succeeds.

use std::fmt;

use thiserror::Error;

use crate::method::{Kind, Method};

/// Top-level error type returned by every fallible engine call.
#[derive(Debug, Error)]
pub enum DiffusionError {
    /// The requested configuration is invalid or the call sequence is wrong.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// An operating-system resource could not be obtained.
    #[error(transparent)]
    Resource(#[from] ResourceError),
}

/// Validation and lifecycle errors.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("{kind} input must have {expected} axes, got {actual}")]
    AxisCount {
        kind: Kind,
        expected: usize,
        actual: usize,
    },

    #[error("tensor input must carry {expected} components on the leading axis, got {actual}")]
    ComponentExtent { expected: usize, actual: usize },

    #[error("input axis {axis} has zero extent")]
    EmptyAxis { axis: usize },

    #[error("radius must be at least 1, got {0}")]
    Radius(usize),

    #[error("thread count must be at least 1, got {0}")]
    Threads(usize),

    #[error("method \"{method}\" is not implemented for {kind} data")]
    UnsupportedMethod { kind: Kind, method: Method },

    #[error("method \"{method}\" takes {expected} parameter(s), got {actual}")]
    ParameterCount {
        method: Method,
        expected: usize,
        actual: usize,
    },

    #[error("spacing must be set on all spatial axes or on none ({present} of 3 set)")]
    PartialSpacing { present: usize },

    #[error("spacing {value} on axis {axis} is not usable (must be finite and nonzero)")]
    InvalidSpacing { axis: usize, value: f64 },

    #[error("context has not been configured")]
    NotConfigured,

    #[error("worker pool is already running")]
    AlreadyRunning,

    #[error("worker pool is not running")]
    NotRunning,

    #[error("worker pool already ran to completion; reconfigure before starting again")]
    PoolExhausted,
}

/// Allocation and thread-pool failures.
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("failed to spawn worker thread {index}")]
    ThreadSpawn {
        index: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("volume buffer of {elements} elements exceeds addressable memory")]
    BufferTooLarge { elements: u128 },
}

/// Non-fatal conditions recorded during configuration.
///
/// Warnings never abort a call; they are kept on the context so callers and
/// tests can inspect them, and logged at `warn` level as they occur.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityWarning {
    /// Requested more threads than there are Z slices to hand out; the
    /// effective thread count was clamped down.
    ThreadsClamped { requested: usize, clamped: usize },
    /// No spatial axis carried spacing metadata; unit spacing was assumed.
    UnitSpacingAssumed,
}

impl fmt::Display for CapabilityWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapabilityWarning::ThreadsClamped { requested, clamped } => write!(
                f,
                "requested {requested} threads but only {clamped} slices are available; \
                 clamping to {clamped}"
            ),
            CapabilityWarning::UnitSpacingAssumed => {
                f.write_str("no axis spacing available; assuming unit spacing")
            }
        }
    }
}
