use thiserror::Error;

/// Startup configuration problems. All of them are fatal.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be plain ASCII, got {value:?}")]
    NonAsciiField { field: &'static str, value: String },

    #[error("device address offset {offset} puts the unit id above 247")]
    DeviceOffsetOutOfRange { offset: u16 },

    #[error("correction factor must be finite and positive, got {0}")]
    InvalidCorrectionFactor(f64),

    #[error("initial {counter} energy must be finite and non-negative, got {value}")]
    InvalidInitialEnergy { counter: &'static str, value: f64 },

    #[error("missing required setting {0}")]
    MissingSetting(&'static str),
}

/// Telemetry samples that cannot be encoded. The update is skipped.
#[derive(Debug, Error, PartialEq)]
pub enum SampleError {
    #[error("power sample is not finite: {0}")]
    NonFinite(f64),

    #[error("power sample {0} W does not fit a single-precision float")]
    OutOfRange(f64),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegisterError {
    #[error("registers {start}..{start}+{count} are outside the meter map")]
    OutOfRange { start: u16, count: u16 },
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("quota payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("quota field {field} is not a number: {value}")]
    NotANumber { field: &'static str, value: String },
}
