//! Lock-free handles to sound instances for game audio
//!
//! A [`Remote`] creates [`Sound`]s and manages routing on the game thread, while an [`Engine`]
//! tracks their playback wherever mixing happens. Neither side ever waits for the other.
//!
//! ```
//! let (mut remote, mut engine) = chirp::engine().build();
//!
//! // In game logic:
//! let mut music = remote.sound(chirp::SoundInfo::new(44100, 2, 44100 * 60))?;
//! music.set_loop_count(-1)?;
//! music.set_volume(0.8)?;
//! music.play();
//!
//! // In the audio callback:
//! # let dt = 0.01;
//! engine.update(dt);
//! for voice in engine.voices() {
//!     // Mix `voice.id` from `voice.position` with `voice.gain` and `voice.pan`
//! #   assert_eq!(voice.id, music.id());
//! }
//! # Ok::<(), chirp::Error>(())
//! ```

#![warn(missing_docs)]

mod engine;
mod error;
mod load;
mod pan;
mod pool;
mod remote;
mod routing;
mod sound;
mod spsc;
mod swap;

pub use engine::{Engine, VoiceParams};
pub use error::{Error, LoadError, Result};
#[cfg(feature = "wav")]
pub use load::wav_info;
pub use load::Loader;
pub use pan::{Pan, PanMatrix};
pub use pool::{SoundLibrary, SoundPool};
pub use remote::{engine, Builder, Remote};
pub use routing::{EffectBusId, MixerId};
pub use sound::{LoopRegion, Motion, Sound, SoundId, SoundInfo, SoundView};
