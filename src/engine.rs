use std::sync::{atomic::Ordering, Arc};

use crate::{
    sound::{Motion, Progress, Shared, MAX_LOOP_INDEX, PLAYING},
    spsc, EffectBusId, PanMatrix, SoundId,
};

/// Tracks playback of every sound, intended to run on the mixing thread
///
/// Constructed by calling [`engine`](crate::engine). Call [`update`](Self::update) once per mix
/// pass, then read [`voices`](Self::voices) to learn what should be mixed and how.
///
/// No method waits, allocates after construction, or frees memory: sounds the engine is done
/// with are handed back to the [`Remote`](crate::Remote) to be dropped.
pub struct Engine {
    recv: spsc::Receiver<Arc<Shared>>,
    free: spsc::Sender<Arc<Shared>>,
    voices: Vec<Voice>,
    max_voices: usize,
    /// Voices that ran out during the current update, with the seconds left over
    completions: Vec<(usize, f32)>,
    /// Candidates for mixing by priority
    ranking: Vec<(f32, usize)>,
}

struct Voice {
    shared: Arc<Shared>,
    /// Fraction of a frame not yet applied to the cursor
    remainder: f64,
    pan: PanMatrix,
    motion: Motion,
}

impl Engine {
    pub(crate) fn new(
        recv: spsc::Receiver<Arc<Shared>>,
        free: spsc::Sender<Arc<Shared>>,
        max_sounds: usize,
        max_voices: usize,
    ) -> Self {
        Self {
            recv,
            free,
            voices: Vec::with_capacity(max_sounds),
            max_voices,
            completions: Vec::with_capacity(max_sounds),
            ranking: Vec::with_capacity(max_sounds),
        }
    }

    /// Advance playback by `dt` seconds
    ///
    /// Applies loop boundaries, finishes sounds that ran out of data, starts their successors
    /// and redistributes the voice budget.
    ///
    /// A negative or non-finite `dt` is treated as zero.
    pub fn update(&mut self, dt: f32) {
        let dt = if dt.is_finite() && dt > 0.0 { dt } else { 0.0 };
        while let Some(shared) = self.recv.pop() {
            self.voices.push(Voice {
                shared,
                remainder: 0.0,
                pan: PanMatrix::IDENTITY,
                motion: Motion::default(),
            });
        }

        for i in (0..self.voices.len()).rev() {
            if self.voices[i].shared.is_destroyed() {
                let voice = self.voices.swap_remove(i);
                voice.shared.is_virtual.store(false, Ordering::Relaxed);
                self.free
                    .send(voice.shared)
                    .unwrap_or_else(|_| unreachable!("free queue has capacity for every sound"));
            }
        }

        for voice in &mut self.voices {
            // Sound because the engine is the only consumer
            unsafe {
                voice.pan = voice.shared.latest_pan().matrix();
                voice.motion = voice.shared.latest_motion();
            }
        }

        self.completions.clear();
        for (i, voice) in self.voices.iter_mut().enumerate() {
            if let Some(leftover) = voice.advance(dt) {
                self.completions.push((i, leftover));
            }
        }

        // Start successors with whatever time their predecessors didn't use. Bounded in case
        // of cycles of empty sounds.
        let mut k = 0;
        while k < self.completions.len() && k < 2 * self.voices.len() {
            let (i, leftover) = self.completions[k];
            k += 1;
            let next = match self.voices[i].shared.next_sound() {
                Some(x) => x,
                None => continue,
            };
            let j = match self.voices.iter().position(|v| v.shared.id == next) {
                Some(j) => j,
                None => continue,
            };
            let successor = &mut self.voices[j];
            if !successor.shared.is_ready()
                || successor.shared.is_destroyed()
                || successor.is_playing()
            {
                continue;
            }
            successor.shared.start();
            if let Some(leftover) = successor.advance(leftover) {
                if self.completions.len() < self.completions.capacity() {
                    self.completions.push((j, leftover));
                }
            }
        }

        self.virtualize();
    }

    /// Make the lowest priority voices beyond the budget virtual, and the rest real
    fn virtualize(&mut self) {
        self.ranking.clear();
        for (i, voice) in self.voices.iter().enumerate() {
            if voice.is_candidate() {
                self.ranking.push((voice.priority(), i));
            } else {
                voice.shared.is_virtual.store(false, Ordering::Relaxed);
            }
        }
        let budget = self.max_voices.min(self.ranking.len());
        if budget < self.ranking.len() {
            self.ranking
                .select_nth_unstable_by(budget, |a, b| b.0.total_cmp(&a.0));
        }
        for (n, &(_, i)) in self.ranking.iter().enumerate() {
            self.voices[i]
                .shared
                .is_virtual
                .store(n >= budget, Ordering::Relaxed);
        }
    }

    /// Parameters of every voice that should be mixed, as of the last update
    pub fn voices(&self) -> impl Iterator<Item = VoiceParams> + '_ {
        self.voices
            .iter()
            .filter(|v| v.is_candidate() && !v.shared.is_virtual.load(Ordering::Relaxed))
            .map(|v| {
                let shared = &v.shared;
                VoiceParams {
                    id: shared.id,
                    gain: v.gain(),
                    pan: v.pan,
                    spatial: if shared.is_3d_enabled() {
                        Some(v.motion)
                    } else {
                        None
                    },
                    speed: shared.speed(),
                    pitch_shift: shared.pitch_shift(),
                    effect_bus: shared.effect_bus(),
                    position: shared.progress().cursor,
                }
            })
    }

    /// Number of sounds being tracked, audible or not
    pub fn len(&self) -> usize {
        self.voices.len()
    }

    /// Whether no sounds are being tracked
    pub fn is_empty(&self) -> bool {
        self.voices.is_empty()
    }
}

impl Voice {
    fn is_playing(&self) -> bool {
        self.shared.transport.load(Ordering::Acquire) & PLAYING != 0
    }

    /// Whether this voice wants to be heard, budget permitting
    fn is_candidate(&self) -> bool {
        self.shared.is_ready() && self.is_playing() && !self.is_paused()
    }

    fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::Relaxed) || self.mixed().1
    }

    fn mixed(&self) -> (f32, bool) {
        self.shared
            .routing
            .mixed(self.shared.mixer.load(Ordering::Relaxed))
    }

    fn gain(&self) -> f32 {
        self.shared.volume() * self.mixed().0
    }

    /// Louder and nearer voices are more important
    fn priority(&self) -> f32 {
        let gain = self.gain();
        if !self.shared.is_3d_enabled() {
            return gain;
        }
        let p = self.motion.position;
        let distance = (p.x * p.x + p.y * p.y + p.z * p.z).sqrt();
        gain / distance.max(1.0)
    }

    /// Move the cursor `dt` seconds forward. Returns the seconds left over if the sound ran out.
    fn advance(&mut self, dt: f32) -> Option<f32> {
        let shared = &*self.shared;
        // Read before the transport, so a stop that isn't counted yet can't have cleared it
        let stops = shared.stops();
        let transport = shared.transport.load(Ordering::Acquire);
        if transport & PLAYING == 0
            || !shared.is_ready()
            || shared.is_destroyed()
            || self.is_paused()
        {
            return None;
        }
        let info = shared.info()?;
        let rate = f64::from(info.sample_rate) * f64::from(shared.speed());
        let frames = self.remainder + f64::from(dt) * rate;
        let whole = frames.floor();
        self.remainder = frames - whole;
        let mut step = whole as u64;

        let observed = shared.progress();
        let mut p = observed;
        let region = shared.loop_region().resolve(info.length);
        let finished = loop {
            match region.filter(|&(_, end)| p.cursor < end && shared.repeats_after(p.loop_index)) {
                Some((start, end)) => {
                    let to_end = end - p.cursor;
                    if step < to_end {
                        p.cursor += step;
                        break false;
                    }
                    step -= to_end;
                    p.cursor = start;
                    p.loop_index = (p.loop_index + 1).min(MAX_LOOP_INDEX);
                    // Skip whole laps at once rather than iterating over tiny regions
                    let len = end - start;
                    let laps = match shared.repeats_left(p.loop_index) {
                        Some(left) => (step / len).min(left),
                        None => step / len,
                    };
                    step -= laps * len;
                    p.loop_index =
                        (u64::from(p.loop_index) + laps).min(MAX_LOOP_INDEX.into()) as u32;
                }
                None => {
                    let to_end = info.length.saturating_sub(p.cursor);
                    if step < to_end {
                        p.cursor += step;
                        break false;
                    }
                    step -= to_end;
                    p.cursor = info.length;
                    break true;
                }
            }
        };

        if !finished {
            // A failed exchange means the control thread moved the cursor; its write wins
            shared.commit_progress(stops, observed, p);
            return None;
        }
        if !shared.complete(transport) {
            return None;
        }
        shared.commit_progress(stops, observed, Progress::START);
        let leftover = (step as f64 + self.remainder) / rate;
        self.remainder = 0.0;
        Some(leftover as f32)
    }
}

/// Everything a mixer needs to know about a voice it should be mixing
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct VoiceParams {
    /// Sound being mixed
    pub id: SoundId,
    /// Effective linear volume, including every mixer it's routed through
    pub gain: f32,
    /// Stereo routing
    pub pan: PanMatrix,
    /// Position and velocity relative to the listener, if 3D is enabled
    pub spatial: Option<Motion>,
    /// Playback rate multiplier
    pub speed: f32,
    /// Pitch shift in half steps
    pub pitch_shift: f32,
    /// Effect bus to send the voice through
    pub effect_bus: Option<EffectBusId>,
    /// Frame to read next
    pub position: u64,
}
