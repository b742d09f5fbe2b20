use std::{num::NonZeroU64, sync::Arc, thread};

use crate::{
    engine::Engine,
    routing::{Routing, RoutingControl},
    sound::{Shared, SoundId},
    spsc, EffectBusId, Error, LoadError, Loader, MixerId, Result, Sound, SoundInfo,
};

/// Begin building an engine and the remote that controls it
pub fn engine() -> Builder {
    Builder::default()
}

/// Configuration that engines are built from
#[must_use]
#[derive(Debug, Clone)]
pub struct Builder {
    max_sounds: usize,
    max_voices: usize,
    max_mixers: usize,
    max_effect_buses: usize,
}

impl Builder {
    /// Maximum number of sounds in existence at once, loaded or not
    pub fn max_sounds(&mut self, n: usize) -> &mut Self {
        self.max_sounds = n;
        self
    }

    /// Maximum number of sounds mixed at once
    ///
    /// Playing sounds beyond this budget are made virtual, quietest first, and promoted again
    /// when room frees up.
    pub fn max_voices(&mut self, n: usize) -> &mut Self {
        self.max_voices = n;
        self
    }

    /// Maximum number of mixers, including the master mixer
    pub fn max_mixers(&mut self, n: usize) -> &mut Self {
        self.max_mixers = n;
        self
    }

    /// Maximum number of effect buses, including the global effect bus
    pub fn max_effect_buses(&mut self, n: usize) -> &mut Self {
        self.max_effect_buses = n;
        self
    }

    /// Construct a remote and the engine it controls from this configuration
    #[must_use]
    pub fn build(&self) -> (Remote, Engine) {
        let (routing, routing_control) = Routing::new(self.max_mixers, self.max_effect_buses);
        let routing = Arc::new(routing);
        let (sound_send, sound_recv) = spsc::channel(self.max_sounds);
        let (free_send, free_recv) = spsc::channel(self.max_sounds);
        let remote = Remote {
            sender: sound_send,
            free: free_recv,
            routing,
            routing_control,
            next_id: NonZeroU64::MIN,
            active: 0,
            max_sounds: self.max_sounds,
        };
        let engine = Engine::new(sound_recv, free_send, self.max_sounds, self.max_voices);
        log::debug!("built engine: {:?}", self);
        (remote, engine)
    }
}

impl Default for Builder {
    fn default() -> Self {
        Builder {
            max_sounds: 256,
            max_voices: 32,
            max_mixers: 64,
            max_effect_buses: 16,
        }
    }
}

/// Handle for creating sounds and managing routing from the control thread
pub struct Remote {
    sender: spsc::Sender<Arc<Shared>>,
    free: spsc::Receiver<Arc<Shared>>,
    routing: Arc<Routing>,
    routing_control: RoutingControl,
    next_id: NonZeroU64,
    active: usize,
    max_sounds: usize,
}

impl Remote {
    /// Create a sound backed by resident data described by `info`, ready immediately
    ///
    /// If `info` is unplayable the sound reports [`is_failed`](crate::SoundView::is_failed).
    pub fn sound(&mut self, info: SoundInfo) -> Result<Sound> {
        let (sound, loader) = self.loading()?;
        loader.finish(info);
        Ok(sound)
    }

    /// Create a sound whose data is still loading, and the token that completes it
    pub fn loading(&mut self) -> Result<(Sound, Loader)> {
        let shared = self.register()?;
        Ok((Sound::new(shared.clone()), Loader::new(shared)))
    }

    /// Create a sound that loads by running `load` on a background thread
    pub fn load_with<F>(&mut self, load: F) -> Result<Sound>
    where
        F: FnOnce() -> Result<SoundInfo, LoadError> + Send + 'static,
    {
        let (sound, loader) = self.loading()?;
        let spawned = thread::Builder::new()
            .name("chirp-loader".into())
            .spawn(move || loader.complete(load()));
        if let Err(e) = spawned {
            // The loader was dropped along with the closure, failing the sound
            log::warn!("couldn't spawn loader thread: {}", e);
        }
        Ok(sound)
    }

    /// Create a sound that streams from the WAV file at `path`
    ///
    /// The header is read on a background thread; the sound becomes ready once it's known to be
    /// valid.
    #[cfg(feature = "wav")]
    pub fn load_wav(&mut self, path: impl Into<std::path::PathBuf>) -> Result<Sound> {
        let path = path.into();
        log::debug!("loading {}", path.display());
        self.load_with(move || crate::load::wav_info_from_path(&path))
    }

    fn register(&mut self) -> Result<Arc<Shared>> {
        self.gc();
        if self.active == self.max_sounds {
            return Err(Error::Exhausted {
                kind: "sound",
                capacity: self.max_sounds,
            });
        }
        let id = SoundId::new(self.next_id);
        self.next_id = self.next_id.checked_add(1).unwrap_or(self.next_id);
        let shared = Arc::new(Shared::new(id, self.routing.clone()));
        self.sender
            .send(shared.clone())
            .unwrap_or_else(|_| unreachable!("queue has capacity for every sound"));
        self.active += 1;
        Ok(shared)
    }

    // Free sounds the engine is finished with
    fn gc(&mut self) {
        for _ in self.free.drain() {
            self.active -= 1;
        }
    }

    /// The root of the mixer tree
    pub fn master_mixer(&self) -> MixerId {
        MixerId::MASTER
    }

    /// Create a mixer routed into `parent`
    pub fn new_mixer(&mut self, parent: MixerId) -> Result<MixerId> {
        self.routing.new_mixer(&mut self.routing_control, parent)
    }

    /// Destroy `mixer`; sounds and mixers routed through it fall back to the master
    pub fn destroy_mixer(&mut self, mixer: MixerId) -> Result<()> {
        self.routing.destroy_mixer(&mut self.routing_control, mixer)
    }

    /// Route `mixer` into `parent`, which must not be routed through `mixer`
    pub fn set_mixer_parent(&mut self, mixer: MixerId, parent: MixerId) -> Result<()> {
        self.routing.set_mixer_parent(mixer, parent)
    }

    /// Mixer that `mixer` is routed into, or `None` for the master
    pub fn mixer_parent(&self, mixer: MixerId) -> Result<Option<MixerId>> {
        self.routing.mixer_parent(mixer)
    }

    /// Scale the volume of everything routed through `mixer`
    pub fn set_mixer_volume(&mut self, mixer: MixerId, volume: f32) -> Result<()> {
        self.routing.set_mixer_volume(mixer, volume)
    }

    /// Volume of `mixer` alone
    pub fn mixer_volume(&self, mixer: MixerId) -> Result<f32> {
        self.routing.mixer_volume(mixer)
    }

    /// Pause or resume everything routed through `mixer`
    pub fn set_mixer_paused(&mut self, mixer: MixerId, paused: bool) -> Result<()> {
        self.routing.set_mixer_paused(mixer, paused)
    }

    /// Whether `mixer` itself is paused
    pub fn is_mixer_paused(&self, mixer: MixerId) -> Result<bool> {
        self.routing.is_mixer_paused(mixer)
    }

    /// The effect bus that always exists
    pub fn global_effect_bus(&self) -> EffectBusId {
        EffectBusId::GLOBAL
    }

    /// Create an effect bus feeding the final mix
    pub fn new_effect_bus(&mut self) -> Result<EffectBusId> {
        self.routing.new_bus(&mut self.routing_control)
    }

    /// Destroy `bus`; sounds routed through it are mixed dry
    pub fn destroy_effect_bus(&mut self, bus: EffectBusId) -> Result<()> {
        self.routing.destroy_bus(&mut self.routing_control, bus)
    }

    /// Route the output of `bus` into `output`, or into the final mix if `None`
    pub fn set_effect_bus_output(
        &mut self,
        bus: EffectBusId,
        output: Option<EffectBusId>,
    ) -> Result<()> {
        self.routing.set_bus_output(bus, output)
    }

    /// Where the output of `bus` goes
    pub fn effect_bus_output(&self, bus: EffectBusId) -> Result<Option<EffectBusId>> {
        self.routing.bus_output(bus)
    }

    /// Pass audio through `bus` without applying its effects
    pub fn set_effect_bus_bypassed(&mut self, bus: EffectBusId, bypassed: bool) -> Result<()> {
        self.routing.set_bus_bypassed(bus, bypassed)
    }

    /// Whether `bus` is bypassed
    pub fn is_effect_bus_bypassed(&self, bus: EffectBusId) -> Result<bool> {
        self.routing.is_bus_bypassed(bus)
    }
}
