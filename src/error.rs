use std::io;

use crate::{EffectBusId, MixerId};

/// Failure to carry out a control operation
///
/// Rejected operations leave the previous state untouched.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// A parameter was outside of its valid range
    #[error("invalid {param}: {value}")]
    InvalidArgument {
        /// Name of the rejected parameter
        param: &'static str,
        /// The rejected value
        value: f64,
    },
    /// A loop region was empty or inverted
    #[error("invalid loop region {start}..{end}")]
    InvalidLoopRegion {
        /// First frame of the region
        start: u64,
        /// One past the last frame of the region
        end: u64,
    },
    /// The mixer was destroyed
    #[error("mixer {0:?} no longer exists")]
    StaleMixer(MixerId),
    /// The effect bus was destroyed
    #[error("effect bus {0:?} no longer exists")]
    StaleEffectBus(EffectBusId),
    /// Routing a mixer through the requested parent would route it through itself
    #[error("mixer {0:?} cannot be routed through its own descendant")]
    MixerCycle(MixerId),
    /// Routing an effect bus into the requested output would feed it back into itself
    #[error("effect bus {0:?} cannot output into its own input chain")]
    EffectBusCycle(EffectBusId),
    /// The master mixer and global effect bus cannot be rerouted or destroyed
    #[error("the root of a routing tree cannot be modified this way")]
    Root,
    /// Every slot of a fixed-capacity table is in use
    #[error("all {capacity} {kind} slots are in use")]
    Exhausted {
        /// What ran out
        kind: &'static str,
        /// Configured capacity
        capacity: usize,
    },
}

impl Error {
    pub(crate) fn invalid(param: &'static str, value: impl Into<f64>) -> Self {
        Error::InvalidArgument {
            param,
            value: value.into(),
        }
    }
}

/// Failure to load a sound, after which it reports [`is_failed`](crate::SoundView::is_failed)
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// The data couldn't be read
    #[error("failed to read sound data")]
    Io(#[from] io::Error),
    /// The data wasn't a usable WAV file
    #[cfg(feature = "wav")]
    #[error("malformed WAV data")]
    Wav(#[from] hound::Error),
    /// The data described a sound that can't be played
    #[error("unplayable sound: {0}")]
    Unplayable(&'static str),
    /// The loader was dropped without reporting a result
    #[error("loading was abandoned")]
    Abandoned,
}

/// Result of a control operation
pub type Result<T, E = Error> = std::result::Result<T, E>;
