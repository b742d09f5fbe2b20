//! Mixers and effect buses
//!
//! Both live in fixed-capacity arenas shared between the control thread and the engine. Sounds
//! and child entities refer to them by generational index, so destroying one never leaves a
//! dangling reference: stale ids simply fall back to the root of their tree.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crate::{Error, Result};

/// Weak reference to a mixer
///
/// Mixers form a tree rooted at the master mixer. A sound's effective volume and pause state
/// compose its own settings with those of every mixer between it and the root.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct MixerId(Key);

impl MixerId {
    /// The master mixer, which always exists
    pub const MASTER: MixerId = MixerId(Key::ROOT);

    pub(crate) fn to_bits(self) -> u64 {
        self.0.to_bits()
    }

}

/// Weak reference to an effect bus
///
/// Effect buses host DSP effects outside the scope of this crate. A bus without an output feeds
/// the final mix directly.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct EffectBusId(Key);

impl EffectBusId {
    /// The global effect bus, which always exists
    pub const GLOBAL: EffectBusId = EffectBusId(Key::ROOT);

    pub(crate) fn to_bits(self) -> u64 {
        self.0.to_bits()
    }

    pub(crate) fn from_bits(bits: u64) -> Option<Self> {
        if bits == NONE {
            None
        } else {
            Some(EffectBusId(Key::from_bits(bits)))
        }
    }
}

/// Packed form of "no reference"; generation 0 is never live
pub(crate) const NONE: u64 = 0;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
struct Key {
    index: u32,
    /// Odd while the slot is live
    generation: u32,
}

impl Key {
    const ROOT: Key = Key {
        index: 0,
        generation: 1,
    };

    fn to_bits(self) -> u64 {
        u64::from(self.generation) << 32 | u64::from(self.index)
    }

    fn from_bits(bits: u64) -> Self {
        Key {
            index: bits as u32,
            generation: (bits >> 32) as u32,
        }
    }
}

struct Slot<T> {
    generation: AtomicU32,
    data: T,
}

/// Fixed-capacity table of generationally-indexed entries whose slot 0 is a permanent root
struct Arena<T> {
    slots: Box<[Slot<T>]>,
}

impl<T: Node> Arena<T> {
    fn new(capacity: usize) -> Self {
        let slots = (0..capacity.max(1))
            .map(|i| Slot {
                generation: AtomicU32::new(if i == 0 { Key::ROOT.generation } else { 0 }),
                data: T::default(),
            })
            .collect();
        Self { slots }
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn get(&self, key: Key) -> Option<&T> {
        let slot = self.slots.get(key.index as usize)?;
        if slot.generation.load(Ordering::Acquire) != key.generation {
            return None;
        }
        Some(&slot.data)
    }

    /// Resolve `bits` to a live entry, falling back to the root
    fn resolve(&self, bits: u64) -> (Key, &T) {
        let key = Key::from_bits(bits);
        match self.get(key) {
            Some(data) => (key, data),
            None => (Key::ROOT, &self.slots[0].data),
        }
    }

    /// Claim a free slot. Control thread only.
    fn alloc(&self, free: &mut Vec<u32>, kind: &'static str) -> Result<Key> {
        let index = free.pop().ok_or(Error::Exhausted {
            kind,
            capacity: self.capacity(),
        })?;
        let slot = &self.slots[index as usize];
        slot.data.reset();
        let generation = slot.generation.load(Ordering::Relaxed).wrapping_add(1);
        slot.generation.store(generation, Ordering::Release);
        Ok(Key { index, generation })
    }

    /// Release a live slot. Control thread only.
    fn free(&self, key: Key, free: &mut Vec<u32>) -> bool {
        if key.index == 0 || self.get(key).is_none() {
            return false;
        }
        self.slots[key.index as usize]
            .generation
            .store(key.generation.wrapping_add(1), Ordering::Release);
        free.push(key.index);
        true
    }

    /// Whether making `parent` the parent of `child` would route `child` through itself
    fn would_cycle(&self, child: Key, parent: Key) -> bool {
        let mut bits = parent.to_bits();
        // Bounded by the capacity in case of a concurrent reparenting race
        for _ in 0..self.capacity() {
            let key = Key::from_bits(bits);
            if key == child {
                return true;
            }
            match self.get(key) {
                Some(node) if key.index != 0 => bits = node.parent().load(Ordering::Relaxed),
                _ => return false,
            }
        }
        false
    }

    fn free_list(&self) -> Vec<u32> {
        (1..self.capacity() as u32).rev().collect()
    }
}

trait Node: Default {
    fn reset(&self);
    fn parent(&self) -> &AtomicU64;
}

struct MixerData {
    volume: AtomicU32,
    paused: AtomicBool,
    parent: AtomicU64,
}

impl Default for MixerData {
    fn default() -> Self {
        Self {
            volume: AtomicU32::new(1.0f32.to_bits()),
            paused: AtomicBool::new(false),
            parent: AtomicU64::new(NONE),
        }
    }
}

impl Node for MixerData {
    fn reset(&self) {
        self.volume.store(1.0f32.to_bits(), Ordering::Relaxed);
        self.paused.store(false, Ordering::Relaxed);
        self.parent.store(NONE, Ordering::Relaxed);
    }

    fn parent(&self) -> &AtomicU64 {
        &self.parent
    }
}

#[derive(Default)]
struct BusData {
    bypassed: AtomicBool,
    output: AtomicU64,
}

impl Node for BusData {
    fn reset(&self) {
        self.bypassed.store(false, Ordering::Relaxed);
        self.output.store(NONE, Ordering::Relaxed);
    }

    fn parent(&self) -> &AtomicU64 {
        &self.output
    }
}

/// Every mixer and effect bus known to an engine
pub(crate) struct Routing {
    mixers: Arena<MixerData>,
    buses: Arena<BusData>,
}

/// Control-side bookkeeping for [`Routing`]
pub(crate) struct RoutingControl {
    free_mixers: Vec<u32>,
    free_buses: Vec<u32>,
}

impl Routing {
    pub(crate) fn new(max_mixers: usize, max_effect_buses: usize) -> (Self, RoutingControl) {
        let routing = Self {
            mixers: Arena::new(max_mixers),
            buses: Arena::new(max_effect_buses),
        };
        let control = RoutingControl {
            free_mixers: routing.mixers.free_list(),
            free_buses: routing.buses.free_list(),
        };
        (routing, control)
    }

    /// Product of the volumes and union of the pause states along the mixer chain from
    /// `mixer` to the master
    pub(crate) fn mixed(&self, mixer: u64) -> (f32, bool) {
        let mut volume = 1.0;
        let mut paused = false;
        let mut bits = mixer;
        for _ in 0..self.mixers.capacity() {
            let (key, data) = self.mixers.resolve(bits);
            volume *= f32::from_bits(data.volume.load(Ordering::Relaxed));
            paused |= data.paused.load(Ordering::Relaxed);
            if key.index == 0 {
                break;
            }
            bits = data.parent.load(Ordering::Relaxed);
        }
        (volume, paused)
    }

    /// Live id for `mixer`, or the master if it was destroyed
    pub(crate) fn resolve_mixer(&self, mixer: u64) -> MixerId {
        MixerId(self.mixers.resolve(mixer).0)
    }

    /// Live id for `bus`, if any
    pub(crate) fn resolve_bus(&self, bus: u64) -> Option<EffectBusId> {
        let id = EffectBusId::from_bits(bus)?;
        self.buses.get(id.0).map(|_| id)
    }

    pub(crate) fn check_mixer(&self, mixer: MixerId) -> Result<()> {
        self.mixers
            .get(mixer.0)
            .map(|_| ())
            .ok_or(Error::StaleMixer(mixer))
    }

    pub(crate) fn check_bus(&self, bus: EffectBusId) -> Result<()> {
        self.buses
            .get(bus.0)
            .map(|_| ())
            .ok_or(Error::StaleEffectBus(bus))
    }

    fn mixer(&self, mixer: MixerId) -> Result<&MixerData> {
        self.mixers.get(mixer.0).ok_or(Error::StaleMixer(mixer))
    }

    fn bus(&self, bus: EffectBusId) -> Result<&BusData> {
        self.buses.get(bus.0).ok_or(Error::StaleEffectBus(bus))
    }

    pub(crate) fn new_mixer(&self, ctl: &mut RoutingControl, parent: MixerId) -> Result<MixerId> {
        self.check_mixer(parent)?;
        let key = self.mixers.alloc(&mut ctl.free_mixers, "mixer")?;
        self.mixers.slots[key.index as usize]
            .data
            .parent
            .store(parent.to_bits(), Ordering::Relaxed);
        Ok(MixerId(key))
    }

    pub(crate) fn destroy_mixer(&self, ctl: &mut RoutingControl, mixer: MixerId) -> Result<()> {
        if mixer == MixerId::MASTER {
            return Err(Error::Root);
        }
        if !self.mixers.free(mixer.0, &mut ctl.free_mixers) {
            return Err(Error::StaleMixer(mixer));
        }
        Ok(())
    }

    pub(crate) fn set_mixer_parent(&self, mixer: MixerId, parent: MixerId) -> Result<()> {
        if mixer == MixerId::MASTER {
            return Err(Error::Root);
        }
        let data = self.mixer(mixer)?;
        self.check_mixer(parent)?;
        if self.mixers.would_cycle(mixer.0, parent.0) {
            return Err(Error::MixerCycle(mixer));
        }
        data.parent.store(parent.to_bits(), Ordering::Relaxed);
        Ok(())
    }

    pub(crate) fn mixer_parent(&self, mixer: MixerId) -> Result<Option<MixerId>> {
        if mixer == MixerId::MASTER {
            return Ok(None);
        }
        let data = self.mixer(mixer)?;
        Ok(Some(self.resolve_mixer(data.parent.load(Ordering::Relaxed))))
    }

    pub(crate) fn set_mixer_volume(&self, mixer: MixerId, volume: f32) -> Result<()> {
        if !(volume >= 0.0 && volume.is_finite()) {
            return Err(Error::invalid("mixer volume", volume));
        }
        self.mixer(mixer)?
            .volume
            .store(volume.to_bits(), Ordering::Relaxed);
        Ok(())
    }

    pub(crate) fn mixer_volume(&self, mixer: MixerId) -> Result<f32> {
        Ok(f32::from_bits(
            self.mixer(mixer)?.volume.load(Ordering::Relaxed),
        ))
    }

    pub(crate) fn set_mixer_paused(&self, mixer: MixerId, paused: bool) -> Result<()> {
        self.mixer(mixer)?.paused.store(paused, Ordering::Relaxed);
        Ok(())
    }

    pub(crate) fn is_mixer_paused(&self, mixer: MixerId) -> Result<bool> {
        Ok(self.mixer(mixer)?.paused.load(Ordering::Relaxed))
    }

    pub(crate) fn new_bus(&self, ctl: &mut RoutingControl) -> Result<EffectBusId> {
        Ok(EffectBusId(
            self.buses.alloc(&mut ctl.free_buses, "effect bus")?,
        ))
    }

    pub(crate) fn destroy_bus(&self, ctl: &mut RoutingControl, bus: EffectBusId) -> Result<()> {
        if bus == EffectBusId::GLOBAL {
            return Err(Error::Root);
        }
        if !self.buses.free(bus.0, &mut ctl.free_buses) {
            return Err(Error::StaleEffectBus(bus));
        }
        Ok(())
    }

    pub(crate) fn set_bus_output(&self, bus: EffectBusId, output: Option<EffectBusId>) -> Result<()> {
        let data = self.bus(bus)?;
        let bits = match output {
            Some(output) => {
                self.check_bus(output)?;
                if self.buses.would_cycle(bus.0, output.0) {
                    return Err(Error::EffectBusCycle(bus));
                }
                output.to_bits()
            }
            None => NONE,
        };
        data.output.store(bits, Ordering::Relaxed);
        Ok(())
    }

    pub(crate) fn bus_output(&self, bus: EffectBusId) -> Result<Option<EffectBusId>> {
        let bits = self.bus(bus)?.output.load(Ordering::Relaxed);
        Ok(self.resolve_bus(bits))
    }

    pub(crate) fn set_bus_bypassed(&self, bus: EffectBusId, bypassed: bool) -> Result<()> {
        self.bus(bus)?.bypassed.store(bypassed, Ordering::Relaxed);
        Ok(())
    }

    pub(crate) fn is_bus_bypassed(&self, bus: EffectBusId) -> Result<bool> {
        Ok(self.bus(bus)?.bypassed.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn routing() -> (Routing, RoutingControl) {
        Routing::new(4, 4)
    }

    #[test]
    fn master_only() {
        let (r, _) = routing();
        assert_eq!(r.mixed(MixerId::MASTER.to_bits()), (1.0, false));
        r.set_mixer_volume(MixerId::MASTER, 0.5).unwrap();
        assert_eq!(r.mixed(NONE), (0.5, false));
    }

    #[test]
    fn chain_composes() {
        let (r, mut ctl) = routing();
        let music = r.new_mixer(&mut ctl, MixerId::MASTER).unwrap();
        let combat = r.new_mixer(&mut ctl, music).unwrap();
        r.set_mixer_volume(MixerId::MASTER, 0.5).unwrap();
        r.set_mixer_volume(music, 0.5).unwrap();
        r.set_mixer_paused(music, true).unwrap();
        let (volume, paused) = r.mixed(combat.to_bits());
        assert_eq!(volume, 0.25);
        assert!(paused);
    }

    #[test]
    fn stale_mixer_falls_back_to_master() {
        let (r, mut ctl) = routing();
        let a = r.new_mixer(&mut ctl, MixerId::MASTER).unwrap();
        r.set_mixer_volume(a, 0.0).unwrap();
        r.destroy_mixer(&mut ctl, a).unwrap();
        assert_eq!(r.resolve_mixer(a.to_bits()), MixerId::MASTER);
        assert_eq!(r.mixed(a.to_bits()), (1.0, false));
        assert_eq!(r.set_mixer_volume(a, 1.0), Err(Error::StaleMixer(a)));

        // The slot is reused under a new generation
        let b = r.new_mixer(&mut ctl, MixerId::MASTER).unwrap();
        assert_ne!(a, b);
        assert_eq!(r.mixer_volume(b), Ok(1.0));
    }

    #[test]
    fn cycles_rejected() {
        let (r, mut ctl) = routing();
        let a = r.new_mixer(&mut ctl, MixerId::MASTER).unwrap();
        let b = r.new_mixer(&mut ctl, a).unwrap();
        assert_eq!(r.set_mixer_parent(a, b), Err(Error::MixerCycle(a)));
        assert_eq!(r.set_mixer_parent(a, a), Err(Error::MixerCycle(a)));
        assert_eq!(r.set_mixer_parent(MixerId::MASTER, a), Err(Error::Root));
        assert_eq!(r.mixer_parent(b), Ok(Some(a)));
    }

    #[test]
    fn capacity() {
        let (r, mut ctl) = routing();
        for _ in 0..3 {
            r.new_mixer(&mut ctl, MixerId::MASTER).unwrap();
        }
        assert_eq!(
            r.new_mixer(&mut ctl, MixerId::MASTER),
            Err(Error::Exhausted {
                kind: "mixer",
                capacity: 4
            })
        );
    }

    #[test]
    fn invalid_volume_keeps_previous() {
        let (r, _) = routing();
        assert!(r.set_mixer_volume(MixerId::MASTER, -1.0).is_err());
        assert!(r.set_mixer_volume(MixerId::MASTER, f32::NAN).is_err());
        assert_eq!(r.mixer_volume(MixerId::MASTER), Ok(1.0));
    }

    #[test]
    fn buses() {
        let (r, mut ctl) = routing();
        let reverb = r.new_bus(&mut ctl).unwrap();
        r.set_bus_output(reverb, Some(EffectBusId::GLOBAL)).unwrap();
        assert_eq!(r.bus_output(reverb), Ok(Some(EffectBusId::GLOBAL)));
        assert!(r.set_bus_output(EffectBusId::GLOBAL, Some(reverb)).is_err());
        let echo = r.new_bus(&mut ctl).unwrap();
        r.set_bus_output(echo, Some(reverb)).unwrap();
        assert_eq!(
            r.set_bus_output(reverb, Some(echo)),
            Err(Error::EffectBusCycle(reverb))
        );
        assert_eq!(r.bus_output(reverb), Ok(Some(EffectBusId::GLOBAL)));
        r.set_bus_bypassed(reverb, true).unwrap();
        assert_eq!(r.is_bus_bypassed(reverb), Ok(true));
        r.destroy_bus(&mut ctl, reverb).unwrap();
        assert_eq!(r.resolve_bus(reverb.to_bits()), None);
        assert_eq!(r.destroy_bus(&mut ctl, EffectBusId::GLOBAL), Err(Error::Root));
    }
}
