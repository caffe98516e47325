//! Error classification shared by every layer.

use std::fmt;

/// Operational class of a failure.
///
/// - Transient: may succeed if tried again later.
/// - Permanent: retrying is pointless (bad input, unsupported schema).
/// - Infrastructure: the broker, disk or process table is in trouble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Transient,
    Permanent,
    Infrastructure,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Infrastructure => "infrastructure",
        };
        f.write_str(s)
    }
}
