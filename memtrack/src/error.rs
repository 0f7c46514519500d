use thiserror::Error;

/// Errors surfaced while configuring the tracker or reading traces.
///
/// Tracking itself never fails: ill-formed event streams degrade into
/// missing intervals, which are counted in [`crate::TrackerStats`].
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid tracker settings: {0}")]
    InvalidSettings(&'static str),

    #[error("line {line}: {reason}")]
    Parse { line: usize, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
