//! Construction-time error taxonomy.  Runtime failures (missing zone refs,
//! hardware faults) are logged and absorbed where they occur; only invalid
//! records are surfaced to the caller as typed errors.

use thiserror::Error;

/// A schedule record whose fields do not form exactly one valid shape
/// (Weekly / Interval / Single).
#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("invalid schedule definition: {0}")]
    InvalidDefinition(String),
}

/// A zone record with an unknown type tag or attrs that fail the
/// type's schema.
#[derive(Debug, Error)]
pub enum ZoneError {
    #[error("unknown zone type '{0}'")]
    UnknownType(String),
    #[error("invalid attrs for zone type '{kind}': {reason}")]
    InvalidAttrs { kind: String, reason: String },
}

/// A program record with an unknown type tag.
#[derive(Debug, Error)]
pub enum ProgramError {
    #[error("unknown program type '{0}'")]
    UnknownType(String),
}
