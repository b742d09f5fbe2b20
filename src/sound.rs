use std::{
    num::NonZeroU64,
    ops::Deref,
    sync::{
        atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, AtomicU8, Ordering},
        Arc, OnceLock,
    },
};

use crate::{
    routing::{Routing, NONE},
    swap::Swap,
    EffectBusId, Error, LoadError, MixerId, Pan, PanMatrix, Result,
};

/// Weak reference to a sound, used to chain sounds together
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct SoundId(NonZeroU64);

impl SoundId {
    pub(crate) fn new(raw: NonZeroU64) -> Self {
        Self(raw)
    }

    fn to_bits(id: Option<Self>) -> u64 {
        id.map_or(0, |x| x.0.get())
    }

    fn from_bits(bits: u64) -> Option<Self> {
        NonZeroU64::new(bits).map(Self)
    }
}

/// Properties of a sound's backing data, known once it has loaded
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SoundInfo {
    /// Frames per second
    pub sample_rate: u32,
    /// 1 for mono, 2 for stereo
    pub channels: u16,
    /// Number of frames
    pub length: u64,
}

impl SoundInfo {
    /// Describe a sound of `length` frames
    pub fn new(sample_rate: u32, channels: u16, length: u64) -> Self {
        Self {
            sample_rate,
            channels,
            length,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), LoadError> {
        if self.sample_rate == 0 {
            return Err(LoadError::Unplayable("zero sample rate"));
        }
        if !(1..=2).contains(&self.channels) {
            return Err(LoadError::Unplayable("only mono and stereo are supported"));
        }
        if self.length > MAX_FRAMES {
            return Err(LoadError::Unplayable("too long"));
        }
        Ok(())
    }

    pub(crate) fn frames_to_ms(&self, frames: u64) -> f64 {
        frames as f64 * 1000.0 / f64::from(self.sample_rate)
    }
}

/// Part of a sound that repeats while looping
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct LoopRegion {
    /// First frame of the region
    pub start: u64,
    /// One past the last frame of the region, or `None` for the end of the sound
    pub end: Option<u64>,
}

impl LoopRegion {
    /// The entire sound
    pub const WHOLE: LoopRegion = LoopRegion {
        start: 0,
        end: None,
    };

    const OPEN_END: u32 = u32::MAX;

    fn to_bits(self) -> u64 {
        let end = self.end.map_or(Self::OPEN_END, |x| x as u32);
        (self.start << 32) | u64::from(end)
    }

    fn from_bits(bits: u64) -> Self {
        let end = bits as u32;
        Self {
            start: bits >> 32,
            end: if end == Self::OPEN_END {
                None
            } else {
                Some(end.into())
            },
        }
    }

    /// Frame range covered for a sound of `length` frames, if nonempty
    pub(crate) fn resolve(&self, length: u64) -> Option<(u64, u64)> {
        let end = self.end.map_or(length, |x| x.min(length));
        if self.start < end {
            Some((self.start, end))
        } else {
            None
        }
    }
}

/// Position and velocity of a sound in 3D space, relative to the listener
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Motion {
    /// Meters
    pub position: mint::Point3<f32>,
    /// Meters per second
    pub velocity: mint::Vector3<f32>,
}

impl Default for Motion {
    fn default() -> Self {
        Self {
            position: [0.0; 3].into(),
            velocity: [0.0; 3].into(),
        }
    }
}

/// Read-only view of a sound's state
///
/// Cheap to clone and usable from any thread, e.g. to drive UI feedback or from the thread
/// doing the actual mixing. Every query reflects the most recent write without tearing.
#[derive(Clone)]
pub struct SoundView {
    pub(crate) shared: Arc<Shared>,
}

impl SoundView {
    /// Identifier for chaining other sounds to this one
    pub fn id(&self) -> SoundId {
        self.shared.id
    }

    /// Whether the backing data has loaded and the sound can be played
    pub fn is_ready(&self) -> bool {
        self.shared.load.load(Ordering::Acquire) == READY
    }

    /// Whether loading failed, permanently
    pub fn is_failed(&self) -> bool {
        self.shared.load.load(Ordering::Acquire) == FAILED
    }

    /// Whether [`Sound::destroy`] has been called
    pub fn is_destroyed(&self) -> bool {
        self.shared.destroyed.load(Ordering::Relaxed)
    }

    /// Whether the engine is tracking the sound without mixing it, to save resources
    pub fn is_virtual(&self) -> bool {
        self.shared.is_virtual.load(Ordering::Relaxed)
    }

    /// Whether the sound was started and has neither been stopped nor run out
    ///
    /// Independent of pausing and virtualization.
    pub fn is_playing(&self) -> bool {
        self.shared.transport.load(Ordering::Acquire) & PLAYING != 0
    }

    /// Whether the sound's own pause flag is set
    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::Relaxed)
    }

    /// Whether the sound can currently be heard: playing, not paused by itself or any mixer,
    /// and not virtual
    pub fn is_audible(&self) -> bool {
        self.is_playing() && !self.mixed_pause_state() && !self.is_virtual()
    }

    /// Backing data properties, once ready
    pub fn info(&self) -> Option<SoundInfo> {
        self.shared.info()
    }

    /// Frames per second, once ready
    pub fn sample_rate(&self) -> Option<u32> {
        self.info().map(|x| x.sample_rate)
    }

    /// Number of channels, once ready
    pub fn channels(&self) -> Option<u16> {
        self.info().map(|x| x.channels)
    }

    /// Length in frames, once ready. Unaffected by playback speed.
    pub fn length(&self) -> Option<u64> {
        self.info().map(|x| x.length)
    }

    /// Playback duration in milliseconds at the current speed, once ready
    pub fn length_ms(&self) -> Option<f32> {
        let info = self.info()?;
        Some((info.frames_to_ms(info.length) / f64::from(self.speed())) as f32)
    }

    /// Linear volume of this sound alone
    pub fn volume(&self) -> f32 {
        load_f32(&self.shared.volume)
    }

    /// Effective volume after applying every mixer between this sound and the master
    pub fn mixed_volume(&self) -> f32 {
        self.volume() * self.shared.routing.mixed(self.mixer_bits()).0
    }

    /// Whether this sound or any mixer between it and the master is paused
    pub fn mixed_pause_state(&self) -> bool {
        self.is_paused() || self.shared.routing.mixed(self.mixer_bits()).1
    }

    /// Playback rate multiplier
    pub fn speed(&self) -> f32 {
        load_f32(&self.shared.speed)
    }

    /// Pitch shift in half steps, independent of speed
    pub fn pitch_shift(&self) -> f32 {
        load_f32(&self.shared.pitch_shift)
    }

    /// Whether spatial parameters should be applied
    pub fn is_3d_enabled(&self) -> bool {
        self.shared.spatial.load(Ordering::Relaxed)
    }

    /// Whether reaching the end of the loop region repeats it
    pub fn is_loop_enabled(&self) -> bool {
        self.shared.loop_flags.load(Ordering::Relaxed) & LOOP_ENABLED != 0
    }

    /// Whether [`Sound::release_loop`] was called since looping was last enabled
    pub fn is_loop_released(&self) -> bool {
        self.shared.loop_flags.load(Ordering::Relaxed) & LOOP_RELEASED != 0
    }

    /// Number of repeats: -1 for unbounded, 0 to play once
    pub fn loop_count(&self) -> i32 {
        self.shared.loop_count.load(Ordering::Relaxed)
    }

    /// Part of the sound that repeats
    pub fn loop_region(&self) -> LoopRegion {
        LoopRegion::from_bits(self.shared.loop_region.load(Ordering::Relaxed))
    }

    /// Number of times the loop region has repeated in the current playback
    pub fn current_loop(&self) -> u32 {
        self.shared.progress().loop_index
    }

    /// Playback position in frames
    pub fn play_position(&self) -> u64 {
        self.shared.progress().cursor
    }

    /// Playback position in milliseconds, or 0 before the sound is ready
    ///
    /// Derived from the same value as [`play_position`](Self::play_position).
    pub fn play_position_ms(&self) -> f32 {
        match self.info() {
            Some(info) => info.frames_to_ms(self.play_position()) as f32,
            None => 0.0,
        }
    }

    /// Mixer this sound is routed through; the master if its mixer was destroyed
    pub fn mixer(&self) -> MixerId {
        self.shared.routing.resolve_mixer(self.mixer_bits())
    }

    /// Effect bus this sound is routed through, if any
    pub fn effect_bus(&self) -> Option<EffectBusId> {
        self.shared
            .routing
            .resolve_bus(self.shared.effect_bus.load(Ordering::Relaxed))
    }

    /// Sound to be started when this one finishes naturally
    pub fn next_sound(&self) -> Option<SoundId> {
        SoundId::from_bits(self.shared.next.load(Ordering::Relaxed))
    }

    fn mixer_bits(&self) -> u64 {
        self.shared.mixer.load(Ordering::Relaxed)
    }
}

/// Handle controlling a single sound instance
///
/// Owned by the control thread. Every setter returns immediately and takes effect from the
/// engine's next update. Read-only queries are inherited from [`SoundView`].
///
/// Operations on a sound whose loading failed, or which was destroyed, have no effect.
/// Dropping the handle destroys the sound.
pub struct Sound {
    view: SoundView,
    pan: Pan,
    motion: Motion,
}

impl Sound {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self {
            view: SoundView { shared },
            pan: Pan::default(),
            motion: Motion::default(),
        }
    }

    /// Read-only view that can be shared with other threads
    pub fn view(&self) -> SoundView {
        self.view.clone()
    }

    /// Start playback from the current position
    ///
    /// Has no effect unless the sound is ready. A virtual sound remains virtual until the
    /// engine promotes it.
    pub fn play(&mut self) {
        if !self.is_ready() || self.is_destroyed() {
            log::debug!(
                "ignoring play of {:?}: {}",
                self.id(),
                if self.is_failed() {
                    "loading failed"
                } else if self.is_destroyed() {
                    "destroyed"
                } else {
                    "still loading"
                }
            );
            return;
        }
        self.shared.start();
    }

    /// Stop playback and rewind to the start
    pub fn stop(&mut self) {
        if !self.live("stop") {
            return;
        }
        self.shared.halt();
    }

    /// Suspend or resume playback without losing the position
    pub fn set_paused(&mut self, paused: bool) {
        if !self.live("set_paused") {
            return;
        }
        self.shared.paused.store(paused, Ordering::Relaxed);
    }

    /// Set the linear volume, which must be non-negative
    pub fn set_volume(&mut self, volume: f32) -> Result<()> {
        if !self.live("set_volume") {
            return Ok(());
        }
        if !(volume >= 0.0 && volume.is_finite()) {
            return Err(Error::invalid("volume", volume));
        }
        store_f32(&self.shared.volume, volume);
        Ok(())
    }

    /// Set the playback rate multiplier, which must be positive
    ///
    /// Changes the effective duration reported by [`length_ms`](SoundView::length_ms).
    pub fn set_speed(&mut self, speed: f32) -> Result<()> {
        if !self.live("set_speed") {
            return Ok(());
        }
        if !(speed > 0.0 && speed.is_finite()) {
            return Err(Error::invalid("speed", speed));
        }
        store_f32(&self.shared.speed, speed);
        Ok(())
    }

    /// Set the pitch shift in half steps
    pub fn set_pitch_shift(&mut self, half_steps: f32) -> Result<()> {
        if !self.live("set_pitch_shift") {
            return Ok(());
        }
        if !half_steps.is_finite() {
            return Err(Error::invalid("pitch shift", half_steps));
        }
        store_f32(&self.shared.pitch_shift, half_steps);
        Ok(())
    }

    /// Current pan as a scalar in [-1, 1]
    ///
    /// Derived on a best-effort basis if a matrix was set last.
    pub fn pan(&self) -> f32 {
        self.pan.scalar()
    }

    /// Pan between -1 (left) and 1 (right), replacing any pan matrix
    pub fn set_pan(&mut self, pan: f32) -> Result<()> {
        if !self.live("set_pan") {
            return Ok(());
        }
        self.send_pan(Pan::scalar_checked(pan)?);
        Ok(())
    }

    /// Current pan as a matrix, derived if a scalar was set last
    pub fn pan_matrix(&self) -> PanMatrix {
        self.pan.matrix()
    }

    /// Route channels explicitly, replacing any scalar pan
    pub fn set_pan_matrix(&mut self, matrix: PanMatrix) -> Result<()> {
        if !self.live("set_pan_matrix") {
            return Ok(());
        }
        self.send_pan(Pan::matrix_checked(matrix)?);
        Ok(())
    }

    fn send_pan(&mut self, pan: Pan) {
        self.pan = pan;
        // Sound because `&mut self` makes this the only producer
        unsafe {
            self.view.shared.pan.send(pan);
        }
    }

    /// Position relative to the listener in meters
    pub fn position_3d(&self) -> mint::Point3<f32> {
        self.motion.position
    }

    /// Set the position relative to the listener in meters
    pub fn set_3d_position(&mut self, position: mint::Point3<f32>) -> Result<()> {
        if !self.live("set_3d_position") {
            return Ok(());
        }
        check_vector("3D position", [position.x, position.y, position.z])?;
        self.send_motion(Motion {
            position,
            ..self.motion
        });
        Ok(())
    }

    /// Velocity relative to the listener in meters per second
    pub fn velocity_3d(&self) -> mint::Vector3<f32> {
        self.motion.velocity
    }

    /// Set the velocity relative to the listener in meters per second
    pub fn set_3d_velocity(&mut self, velocity: mint::Vector3<f32>) -> Result<()> {
        if !self.live("set_3d_velocity") {
            return Ok(());
        }
        check_vector("3D velocity", [velocity.x, velocity.y, velocity.z])?;
        self.send_motion(Motion {
            velocity,
            ..self.motion
        });
        Ok(())
    }

    fn send_motion(&mut self, motion: Motion) {
        self.motion = motion;
        // Sound because `&mut self` makes this the only producer
        unsafe {
            self.view.shared.motion.send(motion);
        }
    }

    /// Enable or disable application of spatial parameters
    pub fn set_3d_enabled(&mut self, enabled: bool) {
        if !self.live("set_3d_enabled") {
            return;
        }
        self.shared.spatial.store(enabled, Ordering::Relaxed);
    }

    /// Enable or disable repetition of the loop region
    ///
    /// Enabling restarts the loop counter and cancels any loop release. Disabling lets
    /// playback run past the loop region but otherwise keeps playing.
    pub fn set_loop(&mut self, enabled: bool) {
        if !self.live("set_loop") {
            return;
        }
        if enabled {
            self.shared.loop_flags.store(LOOP_ENABLED, Ordering::Relaxed);
            self.shared.update_progress(|p| Progress {
                loop_index: 0,
                ..p
            });
        } else {
            self.shared
                .loop_flags
                .fetch_and(!LOOP_ENABLED, Ordering::Relaxed);
        }
    }

    /// Choose the part of the sound that repeats
    ///
    /// `end` is exclusive; `None` denotes the end of the sound.
    pub fn set_loop_region(&mut self, start: u64, end: Option<u64>) -> Result<()> {
        if !self.live("set_loop_region") {
            return Ok(());
        }
        let invalid = Error::InvalidLoopRegion {
            start,
            end: end.unwrap_or(u64::MAX),
        };
        if start >= u64::from(LoopRegion::OPEN_END) {
            return Err(invalid);
        }
        if let Some(end) = end {
            if end <= start || end >= u64::from(LoopRegion::OPEN_END) {
                return Err(invalid);
            }
        }
        if let Some(length) = self.length() {
            if (LoopRegion { start, end }).resolve(length).is_none() {
                return Err(invalid);
            }
        }
        self.shared
            .loop_region
            .store(LoopRegion { start, end }.to_bits(), Ordering::Relaxed);
        Ok(())
    }

    /// Set the number of times the loop region repeats: -1 for unbounded, 0 to play once
    pub fn set_loop_count(&mut self, count: i32) -> Result<()> {
        if !self.live("set_loop_count") {
            return Ok(());
        }
        if count < -1 {
            return Err(Error::invalid("loop count", count));
        }
        self.shared.loop_count.store(count, Ordering::Relaxed);
        Ok(())
    }

    /// Let the current loop iteration finish and play on past the loop region
    ///
    /// Lasts until looping is next enabled with [`set_loop`](Self::set_loop).
    pub fn release_loop(&mut self) {
        if !self.live("release_loop") {
            return;
        }
        self.shared
            .loop_flags
            .fetch_or(LOOP_RELEASED, Ordering::Relaxed);
    }

    /// Seek to `frame`, clamped to the length of the sound
    ///
    /// Has no effect before the sound is ready, since the length is unknown.
    pub fn set_play_position(&mut self, frame: u64) {
        if !self.live("set_play_position") {
            return;
        }
        let length = match self.length() {
            Some(x) => x,
            None => {
                log::debug!("ignoring seek of {:?} while loading", self.id());
                return;
            }
        };
        let cursor = frame.min(length);
        self.shared.update_progress(|p| Progress { cursor, ..p });
    }

    /// Seek to `ms` milliseconds, rounded to the nearest frame
    ///
    /// Has no effect before the sound is ready, since the sample rate is unknown.
    pub fn set_play_position_ms(&mut self, ms: f32) -> Result<()> {
        if !self.live("set_play_position_ms") {
            return Ok(());
        }
        if !(ms >= 0.0 && ms.is_finite()) {
            return Err(Error::invalid("play position", ms));
        }
        let info = match self.info() {
            Some(x) => x,
            None => {
                log::debug!("ignoring millisecond seek of {:?} while loading", self.id());
                return Ok(());
            }
        };
        let frame = (f64::from(ms) * f64::from(info.sample_rate) / 1000.0).round() as u64;
        self.set_play_position(frame);
        Ok(())
    }

    /// Route this sound through `mixer`
    pub fn set_mixer(&mut self, mixer: MixerId) -> Result<()> {
        if !self.live("set_mixer") {
            return Ok(());
        }
        self.shared.routing.check_mixer(mixer)?;
        self.shared.mixer.store(mixer.to_bits(), Ordering::Relaxed);
        Ok(())
    }

    /// Route this sound through `bus`, or straight to the mix if `None`
    pub fn set_effect_bus(&mut self, bus: Option<EffectBusId>) -> Result<()> {
        if !self.live("set_effect_bus") {
            return Ok(());
        }
        let bits = match bus {
            Some(bus) => {
                self.shared.routing.check_bus(bus)?;
                bus.to_bits()
            }
            None => NONE,
        };
        self.shared.effect_bus.store(bits, Ordering::Relaxed);
        Ok(())
    }

    /// Start `next` as soon as this sound finishes naturally, without a gap
    pub fn set_next_sound(&mut self, next: Option<SoundId>) {
        if !self.live("set_next_sound") {
            return;
        }
        self.shared
            .next
            .store(SoundId::to_bits(next), Ordering::Relaxed);
    }

    /// Stop the sound for good and release it from the engine
    ///
    /// Idempotent. Queries keep returning their last values afterwards.
    pub fn destroy(&mut self) {
        if self.shared.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.halt();
        log::trace!("destroyed {:?}", self.id());
    }

    /// Whether mutation is still meaningful, logging why not otherwise
    fn live(&self, op: &'static str) -> bool {
        if self.is_destroyed() {
            log::debug!("ignoring {} on destroyed {:?}", op, self.id());
            return false;
        }
        if self.is_failed() {
            log::debug!("ignoring {} on failed {:?}", op, self.id());
            return false;
        }
        true
    }
}

impl Deref for Sound {
    type Target = SoundView;
    fn deref(&self) -> &SoundView {
        &self.view
    }
}

impl Drop for Sound {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn check_vector(param: &'static str, xs: [f32; 3]) -> Result<()> {
    match xs.iter().find(|x| !x.is_finite()) {
        Some(&x) => Err(Error::invalid(param, x)),
        None => Ok(()),
    }
}

fn load_f32(x: &AtomicU32) -> f32 {
    f32::from_bits(x.load(Ordering::Relaxed))
}

fn store_f32(x: &AtomicU32, value: f32) {
    x.store(value.to_bits(), Ordering::Relaxed);
}

const LOADING: u8 = 0;
const READY: u8 = 1;
const FAILED: u8 = 2;

/// Low bit of the transport word; the remaining bits count `play`/`stop` calls
pub(crate) const PLAYING: u32 = 1;

const LOOP_ENABLED: u8 = 0b01;
const LOOP_RELEASED: u8 = 0b10;

const CURSOR_BITS: u32 = 44;
const CURSOR_MASK: u64 = (1 << CURSOR_BITS) - 1;
pub(crate) const MAX_LOOP_INDEX: u32 = (1 << (64 - CURSOR_BITS)) - 1;
/// Longest supported sound, also bounded by the loop region encoding
const MAX_FRAMES: u64 = LoopRegion::OPEN_END as u64 - 1;

/// Loop counter and playback cursor, stored together so neither is ever observed without the
/// other
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct Progress {
    pub(crate) loop_index: u32,
    pub(crate) cursor: u64,
}

impl Progress {
    pub(crate) const START: Progress = Progress {
        loop_index: 0,
        cursor: 0,
    };

    pub(crate) fn to_bits(self) -> u64 {
        u64::from(self.loop_index.min(MAX_LOOP_INDEX)) << CURSOR_BITS | (self.cursor & CURSOR_MASK)
    }

    pub(crate) fn from_bits(bits: u64) -> Self {
        Self {
            loop_index: (bits >> CURSOR_BITS) as u32,
            cursor: bits & CURSOR_MASK,
        }
    }
}

/// State shared between a [`Sound`], its [`SoundView`]s and the engine
pub(crate) struct Shared {
    pub(crate) id: SoundId,
    pub(crate) routing: Arc<Routing>,
    load: AtomicU8,
    info: OnceLock<SoundInfo>,
    pub(crate) destroyed: AtomicBool,
    /// Written only by the engine
    pub(crate) is_virtual: AtomicBool,
    pub(crate) transport: AtomicU32,
    /// Number of `stop`s, bumped before the rewind is stored
    stops: AtomicU32,
    pub(crate) paused: AtomicBool,
    volume: AtomicU32,
    speed: AtomicU32,
    pitch_shift: AtomicU32,
    pub(crate) pan: Swap<Pan>,
    pub(crate) motion: Swap<Motion>,
    spatial: AtomicBool,
    loop_flags: AtomicU8,
    loop_count: AtomicI32,
    loop_region: AtomicU64,
    progress: AtomicU64,
    pub(crate) mixer: AtomicU64,
    effect_bus: AtomicU64,
    next: AtomicU64,
}

impl Shared {
    pub(crate) fn new(id: SoundId, routing: Arc<Routing>) -> Self {
        Self {
            id,
            routing,
            load: AtomicU8::new(LOADING),
            info: OnceLock::new(),
            destroyed: AtomicBool::new(false),
            is_virtual: AtomicBool::new(false),
            transport: AtomicU32::new(0),
            stops: AtomicU32::new(0),
            paused: AtomicBool::new(false),
            volume: AtomicU32::new(1.0f32.to_bits()),
            speed: AtomicU32::new(1.0f32.to_bits()),
            pitch_shift: AtomicU32::new(0.0f32.to_bits()),
            pan: Swap::new(Pan::default()),
            motion: Swap::new(Motion::default()),
            spatial: AtomicBool::new(false),
            loop_flags: AtomicU8::new(LOOP_ENABLED),
            loop_count: AtomicI32::new(0),
            loop_region: AtomicU64::new(LoopRegion::WHOLE.to_bits()),
            progress: AtomicU64::new(Progress::START.to_bits()),
            mixer: AtomicU64::new(MixerId::MASTER.to_bits()),
            effect_bus: AtomicU64::new(NONE),
            next: AtomicU64::new(0),
        }
    }

    /// Publish the outcome of loading. Called at most once, by the loader.
    pub(crate) fn finish_loading(&self, result: Result<SoundInfo, LoadError>) {
        let result = result.and_then(|info| info.validate().map(|()| info));
        match result {
            Ok(info) => {
                // Only the loader sets this
                let _ = self.info.set(info);
                self.load.store(READY, Ordering::Release);
                log::debug!("{:?} ready: {:?}", self.id, info);
            }
            Err(e) => {
                self.load.store(FAILED, Ordering::Release);
                log::warn!("{:?} failed to load: {}", self.id, e);
            }
        }
    }

    pub(crate) fn info(&self) -> Option<SoundInfo> {
        self.info.get().copied()
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.load.load(Ordering::Acquire) == READY
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Set the playing flag, starting a new transport epoch
    pub(crate) fn start(&self) {
        let _ = self
            .transport
            .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |t| {
                Some(t.wrapping_add(2) | PLAYING)
            });
    }

    /// Clear the playing flag and rewind, starting a new transport epoch
    fn halt(&self) {
        let _ = self
            .transport
            .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |t| {
                Some(t.wrapping_add(2) & !PLAYING)
            });
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.progress
            .store(Progress::START.to_bits(), Ordering::SeqCst);
    }

    /// Count of stops so far, to be passed to [`commit_progress`](Self::commit_progress)
    pub(crate) fn stops(&self) -> u32 {
        self.stops.load(Ordering::SeqCst)
    }

    /// Clear the playing flag unless the transport changed since it read `observed`. Engine only.
    pub(crate) fn complete(&self, observed: u32) -> bool {
        self.transport
            .compare_exchange(
                observed,
                observed & !PLAYING,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    pub(crate) fn progress(&self) -> Progress {
        Progress::from_bits(self.progress.load(Ordering::Acquire))
    }

    /// Replace the progress unless it changed since it read `observed`, or a stop began after
    /// `stops` was read. Engine only.
    pub(crate) fn commit_progress(&self, stops: u32, observed: Progress, next: Progress) -> bool {
        if self
            .progress
            .compare_exchange(
                observed.to_bits(),
                next.to_bits(),
                Ordering::SeqCst,
                Ordering::Relaxed,
            )
            .is_err()
        {
            return false;
        }
        if self.stops() == stops {
            return true;
        }
        // A stop rewound between our reads and our write; restore the rewind unless something
        // newer has been written since
        let _ = self.progress.compare_exchange(
            next.to_bits(),
            Progress::START.to_bits(),
            Ordering::SeqCst,
            Ordering::Relaxed,
        );
        false
    }

    fn update_progress(&self, f: impl Fn(Progress) -> Progress) {
        let _ = self
            .progress
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                Some(f(Progress::from_bits(bits)).to_bits())
            });
    }

    pub(crate) fn volume(&self) -> f32 {
        load_f32(&self.volume)
    }

    pub(crate) fn speed(&self) -> f32 {
        load_f32(&self.speed)
    }

    pub(crate) fn pitch_shift(&self) -> f32 {
        load_f32(&self.pitch_shift)
    }

    pub(crate) fn is_3d_enabled(&self) -> bool {
        self.spatial.load(Ordering::Relaxed)
    }

    /// Whether the loop region should repeat after `loop_index` repeats so far
    pub(crate) fn repeats_after(&self, loop_index: u32) -> bool {
        let flags = self.loop_flags.load(Ordering::Relaxed);
        if flags & LOOP_ENABLED == 0 || flags & LOOP_RELEASED != 0 {
            return false;
        }
        match self.loop_count.load(Ordering::Relaxed) {
            -1 => true,
            n => i64::from(loop_index) < i64::from(n),
        }
    }

    /// Repeats still allowed after `loop_index` repeats so far, or `None` if unbounded
    pub(crate) fn repeats_left(&self, loop_index: u32) -> Option<u64> {
        match self.loop_count.load(Ordering::Relaxed) {
            -1 => None,
            n => Some(u64::from(n.max(0) as u32).saturating_sub(loop_index.into())),
        }
    }

    pub(crate) fn loop_region(&self) -> LoopRegion {
        LoopRegion::from_bits(self.loop_region.load(Ordering::Relaxed))
    }

    pub(crate) fn next_sound(&self) -> Option<SoundId> {
        SoundId::from_bits(self.next.load(Ordering::Relaxed))
    }

    pub(crate) fn effect_bus(&self) -> Option<EffectBusId> {
        self.routing
            .resolve_bus(self.effect_bus.load(Ordering::Relaxed))
    }

    /// Most recent pan. Engine only.
    pub(crate) unsafe fn latest_pan(&self) -> Pan {
        self.pan.refresh();
        *self.pan.received()
    }

    /// Most recent motion. Engine only.
    pub(crate) unsafe fn latest_motion(&self) -> Motion {
        self.motion.refresh();
        *self.motion.received()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use proptest::prelude::*;

    use super::*;
    use crate::{engine, Engine, Remote};

    fn setup() -> (Remote, Engine) {
        engine().build()
    }

    fn ready(remote: &mut Remote, length: u64) -> Sound {
        remote.sound(SoundInfo::new(1000, 2, length)).unwrap()
    }

    #[test]
    fn defaults() {
        let (mut remote, _engine) = setup();
        let s = ready(&mut remote, 100);
        assert!(s.is_ready() && !s.is_playing() && !s.is_paused());
        assert_eq!(s.volume(), 1.0);
        assert_eq!(s.speed(), 1.0);
        assert_eq!(s.pan(), 0.0);
        assert!(s.is_loop_enabled());
        assert_eq!(s.loop_count(), 0);
        assert_eq!(s.loop_region(), LoopRegion::WHOLE);
        assert_eq!(s.mixer(), MixerId::MASTER);
        assert_eq!(s.effect_bus(), None);
        assert_eq!(s.next_sound(), None);
        assert!(!s.is_3d_enabled());
    }

    #[test]
    fn play_and_stop() {
        let (mut remote, _engine) = setup();
        let mut s = ready(&mut remote, 100);
        s.play();
        assert!(s.is_playing());
        s.set_play_position(40);
        s.stop();
        assert!(!s.is_playing());
        assert_eq!(s.play_position(), 0);
    }

    #[test]
    fn loading_sound_ignores_play() {
        let (mut remote, _engine) = setup();
        let (mut s, loader) = remote.loading().unwrap();
        s.play();
        assert!(!s.is_playing());
        assert_eq!(s.length(), None);
        assert_eq!(s.length_ms(), None);
        s.set_play_position_ms(500.0).unwrap();
        assert_eq!(s.play_position_ms(), 0.0);

        // Configuration is kept for when loading completes
        s.set_volume(0.5).unwrap();
        loader.finish(SoundInfo::new(1000, 1, 100));
        assert!(s.is_ready());
        assert_eq!(s.volume(), 0.5);
        s.play();
        assert!(s.is_playing());
    }

    #[test]
    fn seek_while_loading_is_ignored() {
        let (mut remote, _engine) = setup();
        let (mut s, loader) = remote.loading().unwrap();
        s.set_play_position(500);
        assert_eq!(s.play_position(), 0);
        assert_eq!(s.play_position_ms(), 0.0);
        loader.finish(SoundInfo::new(1000, 1, 100));
        assert_eq!(s.play_position(), 0);
        s.set_play_position(500);
        assert_eq!(s.play_position(), 100);
        assert_eq!(s.play_position_ms(), 100.0);
    }

    #[test]
    fn commit_after_stop_keeps_rewind() {
        let (mut remote, _engine) = setup();
        let mut s = ready(&mut remote, 100);
        let shared = s.shared.clone();
        let later = Progress {
            loop_index: 0,
            cursor: 10,
        };

        s.play();
        let stops = shared.stops();
        let observed = shared.progress();
        assert!(shared.commit_progress(stops, observed, later));
        assert_eq!(s.play_position(), 10);

        // Stop lands entirely between the engine reading the transport and the progress
        let stops = shared.stops();
        s.stop();
        let observed = shared.progress();
        assert_eq!(observed, Progress::START);
        assert!(!shared.commit_progress(stops, observed, later));
        assert_eq!(s.play_position(), 0);
        assert!(!s.is_playing());
    }

    #[test]
    fn failed_sound_ignores_everything() {
        let (mut remote, _engine) = setup();
        let (mut s, loader) = remote.loading().unwrap();
        drop(loader);
        assert!(s.is_failed());
        s.play();
        assert!(!s.is_playing());
        s.set_volume(0.25).unwrap();
        assert_eq!(s.volume(), 1.0);
        s.set_loop_count(5).unwrap();
        assert_eq!(s.loop_count(), 0);
    }

    #[test]
    fn invalid_arguments_keep_state() {
        let (mut remote, _engine) = setup();
        let mut s = ready(&mut remote, 100);
        s.set_volume(0.5).unwrap();
        assert!(s.set_volume(-1.0).is_err());
        assert!(s.set_volume(f32::NAN).is_err());
        assert_eq!(s.volume(), 0.5);
        assert!(s.set_speed(0.0).is_err());
        assert_eq!(s.speed(), 1.0);
        assert!(s.set_pan(1.5).is_err());
        assert!(s.set_pan(f32::NAN).is_err());
        assert_eq!(s.pan(), 0.0);
        assert!(s
            .set_3d_position([0.0, f32::INFINITY, 0.0].into())
            .is_err());
        assert_eq!(s.position_3d(), mint::Point3::from([0.0; 3]));
        assert!(s.set_pitch_shift(f32::NAN).is_err());
        assert_eq!(s.pitch_shift(), 0.0);
        assert!(s.set_play_position_ms(-1.0).is_err());
    }

    #[test]
    fn pan_last_writer_wins() {
        let (mut remote, _engine) = setup();
        let mut s = ready(&mut remote, 100);
        s.set_pan(0.5).unwrap();
        assert_eq!(s.pan(), 0.5);
        let m = PanMatrix::new(0.0, 1.0, 1.0, 0.0);
        s.set_pan_matrix(m).unwrap();
        assert_eq!(s.pan_matrix(), m);
        s.set_pan(-0.25).unwrap();
        assert_eq!(s.pan(), -0.25);
        assert_eq!(s.pan_matrix(), Pan::Scalar(-0.25).matrix());
        assert!(s
            .set_pan_matrix(PanMatrix::new(f32::NAN, 0.0, 0.0, 1.0))
            .is_err());
        assert_eq!(s.pan(), -0.25);
    }

    #[test]
    fn loop_region_validation() {
        let (mut remote, _engine) = setup();
        let mut s = ready(&mut remote, 100);
        assert_eq!(
            s.set_loop_region(50, Some(20)),
            Err(Error::InvalidLoopRegion { start: 50, end: 20 })
        );
        assert!(s.set_loop_region(20, Some(20)).is_err());
        assert!(s.set_loop_region(100, None).is_err());
        assert_eq!(s.loop_region(), LoopRegion::WHOLE);
        s.set_loop_region(20, Some(60)).unwrap();
        assert_eq!(
            s.loop_region(),
            LoopRegion {
                start: 20,
                end: Some(60)
            }
        );
        s.set_loop_region(10, None).unwrap();
        assert_eq!(s.loop_region().end, None);
    }

    #[test]
    fn enabling_loop_resets_counter() {
        let (mut remote, mut engine) = setup();
        let mut s = remote.sound(SoundInfo::new(100, 1, 10)).unwrap();
        s.set_loop_count(-1).unwrap();
        s.play();
        engine.update(0.25);
        assert_eq!(s.current_loop(), 2);
        s.release_loop();
        assert!(s.is_loop_released());
        s.set_loop(true);
        assert!(!s.is_loop_released());
        assert_eq!(s.current_loop(), 0);
        assert_eq!(s.play_position(), 5);
    }

    #[test]
    fn seek_is_clamped() {
        let (mut remote, _engine) = setup();
        let mut s = ready(&mut remote, 100);
        s.set_play_position(1000);
        assert_eq!(s.play_position(), 100);
        s.set_play_position_ms(50.0).unwrap();
        assert_eq!(s.play_position(), 50);
        assert_eq!(s.play_position_ms(), 50.0);
    }

    #[test]
    fn length_follows_speed() {
        let (mut remote, _engine) = setup();
        let mut s = ready(&mut remote, 2000);
        assert_eq!(s.length_ms(), Some(2000.0));
        s.set_speed(4.0).unwrap();
        assert_eq!(s.length_ms(), Some(500.0));
        assert_eq!(s.length(), Some(2000));
    }

    #[test]
    fn routing() {
        let (mut remote, _engine) = setup();
        let mut s = ready(&mut remote, 100);
        let sfx = remote.new_mixer(remote.master_mixer()).unwrap();
        let loud = remote.new_mixer(sfx).unwrap();
        remote.set_mixer_volume(sfx, 0.5).unwrap();
        remote.set_mixer_volume(loud, 0.5).unwrap();
        s.set_volume(0.5).unwrap();
        s.set_mixer(loud).unwrap();
        assert_eq!(s.mixed_volume(), 0.125);

        remote.set_mixer_paused(sfx, true).unwrap();
        assert!(s.mixed_pause_state());
        assert!(!s.is_paused());

        remote.destroy_mixer(loud).unwrap();
        assert_eq!(s.mixer(), MixerId::MASTER);
        assert_eq!(s.mixed_volume(), 0.5);
        assert!(!s.mixed_pause_state());
        assert_eq!(s.set_mixer(loud), Err(Error::StaleMixer(loud)));

        let bus = remote.new_effect_bus().unwrap();
        s.set_effect_bus(Some(bus)).unwrap();
        assert_eq!(s.effect_bus(), Some(bus));
        remote.destroy_effect_bus(bus).unwrap();
        assert_eq!(s.effect_bus(), None);
    }

    #[test]
    fn destroy_is_idempotent() {
        let (mut remote, _engine) = setup();
        let mut s = ready(&mut remote, 100);
        s.set_volume(0.5).unwrap();
        s.play();
        s.destroy();
        s.destroy();
        assert!(s.is_destroyed());
        assert!(!s.is_playing());
        s.play();
        assert!(!s.is_playing());
        s.set_volume(0.75).unwrap();
        assert_eq!(s.volume(), 0.5);
    }

    #[test]
    fn views_observe_writes_whole() {
        let (mut remote, _engine) = setup();
        let mut s = ready(&mut remote, 100);
        let view = s.view();
        const VALUES: [f32; 3] = [0.125, 0.5, 1.0];
        let reader = thread::spawn(move || {
            for _ in 0..10_000 {
                let x = view.mixed_volume();
                assert!(VALUES.contains(&x), "torn read: {}", x);
            }
        });
        for i in 0..10_000 {
            s.set_volume(VALUES[i % VALUES.len()]).unwrap();
        }
        reader.join().unwrap();
    }

    proptest! {
        #[test]
        fn loop_count_round_trips(count in -1..=i32::MAX) {
            let (mut remote, _engine) = setup();
            let mut s = ready(&mut remote, 100);
            s.set_loop_count(count).unwrap();
            prop_assert_eq!(s.loop_count(), count);
        }

        #[test]
        fn negative_loop_counts_are_rejected(count in i32::MIN..-1) {
            let (mut remote, _engine) = setup();
            let mut s = ready(&mut remote, 100);
            prop_assert!(s.set_loop_count(count).is_err());
            prop_assert_eq!(s.loop_count(), 0);
        }

        #[test]
        fn ms_seek_rounds_to_nearest_frame(rate in 1..=192_000u32, ms in 0.0..100_000.0f32) {
            let (mut remote, _engine) = setup();
            let mut s = remote.sound(SoundInfo::new(rate, 1, 1 << 31)).unwrap();
            s.set_play_position_ms(ms).unwrap();
            let expected = (f64::from(ms) * f64::from(rate) / 1000.0).round() as u64;
            prop_assert_eq!(s.play_position(), expected);
        }

        #[test]
        fn progress_packing(loop_index in 0..=MAX_LOOP_INDEX, cursor in 0..=MAX_FRAMES) {
            let p = Progress { loop_index, cursor };
            prop_assert_eq!(Progress::from_bits(p.to_bits()), p);
        }
    }
}
