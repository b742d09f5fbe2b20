use std::sync::Arc;

use crate::{sound::Shared, LoadError, SoundInfo};

/// Completion token for a sound that is still loading
///
/// Obtained from [`Remote::loading`](crate::Remote::loading) alongside the sound it completes.
/// May be sent to whichever thread does the loading. Dropping it without calling
/// [`finish`](Self::finish) or [`fail`](Self::fail) marks the sound as failed.
pub struct Loader {
    shared: Option<Arc<Shared>>,
}

impl Loader {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared: Some(shared),
        }
    }

    /// Mark the sound ready to play, backed by data described by `info`
    ///
    /// Fails the sound instead if `info` describes something unplayable.
    pub fn finish(self, info: SoundInfo) {
        self.complete(Ok(info));
    }

    /// Mark the sound as permanently failed
    pub fn fail(self, error: LoadError) {
        self.complete(Err(error));
    }

    /// Report the outcome of loading
    pub fn complete(mut self, result: Result<SoundInfo, LoadError>) {
        if let Some(shared) = self.shared.take() {
            shared.finish_loading(result);
        }
    }
}

impl Drop for Loader {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.finish_loading(Err(LoadError::Abandoned));
        }
    }
}

/// Read the properties of the WAV data in `reader` from its header
///
/// Sample data is left for whatever eventually streams it.
#[cfg(feature = "wav")]
pub fn wav_info<R: std::io::Read>(reader: R) -> Result<SoundInfo, LoadError> {
    let reader = hound::WavReader::new(reader)?;
    let spec = reader.spec();
    Ok(SoundInfo::new(
        spec.sample_rate,
        spec.channels,
        reader.duration().into(),
    ))
}

#[cfg(feature = "wav")]
pub(crate) fn wav_info_from_path(path: &std::path::Path) -> Result<SoundInfo, LoadError> {
    let file = std::fs::File::open(path)?;
    wav_info(std::io::BufReader::new(file))
}
