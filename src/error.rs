use std::{fmt, io, path::PathBuf};

/// Failure categories surfaced by the core. Raised through `anyhow` so callers
/// can `downcast_ref::<NesError>()` when they need to tell them apart.
#[derive(Debug)]
pub enum NesError {
    /// ROM file missing or unreadable.
    Io { path: PathBuf, source: io::Error },
    /// The image is not a usable iNES file.
    InvalidRom(String),
    /// Mapper ID outside the implemented set.
    UnsupportedMapper(u16),
    /// Audio requested with a channel count other than 1 or 2.
    InvalidChannelConfig(u16),
}

impl fmt::Display for NesError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NesError::Io { path, source } => {
                write!(f, "failed to read ROM {}: {source}", path.display())
            }
            NesError::InvalidRom(reason) => write!(f, "invalid ROM image: {reason}"),
            NesError::UnsupportedMapper(id) => write!(f, "unsupported mapper {id}"),
            NesError::InvalidChannelConfig(channels) => {
                write!(f, "invalid audio channel count {channels}, expected 1 or 2")
            }
        }
    }
}

impl std::error::Error for NesError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NesError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}
