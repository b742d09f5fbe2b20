use std::{borrow::Borrow, collections::HashMap, hash::Hash};

use rand::{seq::SliceRandom, Rng};

use crate::{Error, Remote, Result, Sound};

/// A fixed set of interchangeable instances of the same sound, for overlapping playback
///
/// Useful for effects like footsteps or gunfire which may be triggered again before the
/// previous trigger has finished.
pub struct SoundPool {
    instances: Vec<Sound>,
}

impl SoundPool {
    /// Wrap existing instances
    pub fn new(instances: Vec<Sound>) -> Self {
        Self { instances }
    }

    /// Create `count` instances by calling `make`
    pub fn with(
        remote: &mut Remote,
        count: usize,
        mut make: impl FnMut(&mut Remote) -> Result<Sound>,
    ) -> Result<Self> {
        let instances = (0..count)
            .map(|_| make(remote))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { instances })
    }

    /// Create `count` instances each streaming the WAV file at `path`
    #[cfg(feature = "wav")]
    pub fn load_wav(
        remote: &mut Remote,
        path: impl AsRef<std::path::Path>,
        count: usize,
    ) -> Result<Self> {
        let path = path.as_ref();
        Self::with(remote, count, |remote| remote.load_wav(path))
    }

    /// Whether every instance is ready to play
    pub fn is_ready(&self) -> bool {
        self.instances.iter().all(|x| x.is_ready())
    }

    /// Whether any instance failed to load
    pub fn is_failed(&self) -> bool {
        self.instances.iter().any(|x| x.is_failed())
    }

    /// The instances in this pool
    pub fn instances(&self) -> &[Sound] {
        &self.instances
    }

    /// Play an idle instance from the start with `loop_count` repeats at `volume`
    ///
    /// Returns the instance played, or `None` if every ready instance is busy.
    pub fn play(&mut self, loop_count: i32, volume: f32) -> Result<Option<&mut Sound>> {
        if loop_count < -1 {
            return Err(Error::invalid("loop count", loop_count));
        }
        if !(volume >= 0.0 && volume.is_finite()) {
            return Err(Error::invalid("volume", volume));
        }
        let sound = match self
            .instances
            .iter_mut()
            .find(|x| x.is_ready() && !x.is_playing())
        {
            Some(x) => x,
            None => return Ok(None),
        };
        sound.set_loop_count(loop_count)?;
        sound.set_volume(volume)?;
        sound.set_play_position(0);
        sound.play();
        Ok(Some(sound))
    }
}

/// Sound pools looked up by key
pub struct SoundLibrary<K> {
    pools: HashMap<K, SoundPool>,
}

impl<K: Eq + Hash> SoundLibrary<K> {
    /// Create an empty library
    pub fn new() -> Self {
        Self {
            pools: HashMap::new(),
        }
    }

    /// Add `pool` under `key`, returning any pool it replaces
    pub fn insert(&mut self, key: K, pool: SoundPool) -> Option<SoundPool> {
        self.pools.insert(key, pool)
    }

    /// Remove the pool under `key`, destroying its instances once dropped
    pub fn remove<Q>(&mut self, key: &Q) -> Option<SoundPool>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.pools.remove(key)
    }

    /// Look up a pool
    pub fn get<Q>(&self, key: &Q) -> Option<&SoundPool>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.pools.get(key)
    }

    /// Look up a pool for modification
    pub fn get_mut<Q>(&mut self, key: &Q) -> Option<&mut SoundPool>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.pools.get_mut(key)
    }

    /// Play an idle instance from the pool under `key`
    ///
    /// Returns `None` if there is no such pool or all of its instances are busy.
    pub fn play<Q>(
        &mut self,
        key: &Q,
        loop_count: i32,
        volume: f32,
    ) -> Result<Option<&mut Sound>>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        match self.pools.get_mut(key) {
            Some(pool) => pool.play(loop_count, volume),
            None => Ok(None),
        }
    }

    /// Play an idle instance from a pool chosen uniformly at random among `keys`
    pub fn play_random<Q>(
        &mut self,
        keys: &[&Q],
        loop_count: i32,
        volume: f32,
    ) -> Result<Option<&mut Sound>>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.play_random_with(&mut rand::thread_rng(), keys, loop_count, volume)
    }

    /// Like [`play_random`](Self::play_random), drawing from `rng`
    pub fn play_random_with<Q, R>(
        &mut self,
        rng: &mut R,
        keys: &[&Q],
        loop_count: i32,
        volume: f32,
    ) -> Result<Option<&mut Sound>>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
        R: Rng + ?Sized,
    {
        match keys.choose(rng) {
            Some(key) => self.play(*key, loop_count, volume),
            None => Ok(None),
        }
    }

    /// Whether every instance of every pool is ready to play
    pub fn is_ready(&self) -> bool {
        self.pools.values().all(SoundPool::is_ready)
    }

    /// Whether any instance of any pool failed to load
    pub fn is_failed(&self) -> bool {
        self.pools.values().any(SoundPool::is_failed)
    }

    /// Number of pools
    pub fn len(&self) -> usize {
        self.pools.len()
    }

    /// Whether there are no pools
    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }
}

impl<K: Eq + Hash> Default for SoundLibrary<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;
    use crate::{engine, Engine, SoundInfo};

    fn pool(count: usize) -> (Remote, Engine, SoundPool) {
        let (mut remote, engine) = engine().build();
        let pool = SoundPool::with(&mut remote, count, |remote| {
            remote.sound(SoundInfo::new(100, 1, 10))
        })
        .unwrap();
        (remote, engine, pool)
    }

    #[test]
    fn plays_idle_instances() {
        let (_remote, _engine, mut pool) = pool(2);
        assert!(pool.is_ready());
        let a = pool.play(0, 1.0).unwrap().unwrap().id();
        let b = pool.play(-1, 0.5).unwrap().unwrap().id();
        assert_ne!(a, b);
        assert!(pool.play(0, 1.0).unwrap().is_none());
        assert_eq!(pool.instances()[1].loop_count(), -1);
        assert_eq!(pool.instances()[1].volume(), 0.5);
    }

    #[test]
    fn finished_instances_are_reused() {
        let (_remote, mut engine, mut pool) = pool(1);
        pool.play(0, 1.0).unwrap().unwrap();
        assert!(pool.play(0, 1.0).unwrap().is_none());
        engine.update(0.2);
        assert!(pool.play(0, 1.0).unwrap().is_some());
    }

    #[test]
    fn invalid_arguments() {
        let (_remote, _engine, mut pool) = pool(1);
        assert!(matches!(
            pool.play(-2, 1.0),
            Err(Error::InvalidArgument { .. })
        ));
        assert!(matches!(
            pool.play(0, f32::NAN),
            Err(Error::InvalidArgument { .. })
        ));
        assert!(!pool.instances()[0].is_playing());
    }

    #[test]
    fn unready_instances_are_skipped() {
        let (mut remote, _engine) = engine().build();
        let (loading, _loader) = remote.loading().unwrap();
        let mut pool = SoundPool::new(vec![loading]);
        assert!(!pool.is_ready());
        assert!(pool.play(0, 1.0).unwrap().is_none());
    }

    #[test]
    fn library_waits_for_every_pool() {
        let (mut remote, _engine) = engine().build();
        let (loading, loader) = remote.loading().unwrap();
        let mut library = SoundLibrary::new();
        library.insert("music", SoundPool::new(vec![loading]));
        library.insert(
            "click",
            SoundPool::with(&mut remote, 1, |remote| {
                remote.sound(SoundInfo::new(100, 1, 10))
            })
            .unwrap(),
        );
        assert!(!library.is_ready());
        loader.finish(SoundInfo::new(100, 1, 10));
        assert!(library.is_ready());
    }

    #[test]
    fn library() {
        let (mut remote, _engine) = engine().build();
        let mut library = SoundLibrary::new();
        for name in ["step1", "step2"] {
            let pool = SoundPool::with(&mut remote, 1, |remote| {
                remote.sound(SoundInfo::new(100, 1, 10))
            })
            .unwrap();
            library.insert(name.to_owned(), pool);
        }
        assert_eq!(library.len(), 2);
        assert!(library.is_ready());
        assert!(!library.is_failed());
        assert!(library.play("step1", 0, 1.0).unwrap().is_some());
        assert!(library.play("step1", 0, 1.0).unwrap().is_none());
        assert!(library.play("missing", 0, 1.0).unwrap().is_none());

        let mut rng = StdRng::seed_from_u64(0);
        let played = library
            .play_random_with(&mut rng, &["step2"][..], 0, 1.0)
            .unwrap()
            .map(|x| x.id());
        assert_eq!(played, Some(library.get("step2").unwrap().instances()[0].id()));
        assert!(library.play_random::<str>(&[], 0, 1.0).unwrap().is_none());
    }
}
