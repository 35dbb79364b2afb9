use std::{
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, OnceLock, PoisonError},
};

use lru::LruCache;
use tracing::instrument;

use crate::{
    crnn_net::CrnnNet, east_net::EastNet, error::Result, ExecutionProvider, RecognitionOptions,
};

/// Distinct checkpoints kept loaded per model kind.
pub const CACHE_CAPACITY: usize = 100;

/// Loaded models keyed by checkpoint directory. Loading holds the lock, so a
/// path is never loaded twice while it stays cached.
pub struct ModelCache<M> {
    entries: Mutex<LruCache<PathBuf, Arc<M>>>,
}

impl<M> ModelCache<M> {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get_or_try_load<E>(
        &self,
        checkpoint_dir: &Path,
        load: impl FnOnce(&Path) -> std::result::Result<M, E>,
    ) -> std::result::Result<Arc<M>, E> {
        let key = std::fs::canonicalize(checkpoint_dir)
            .unwrap_or_else(|_| checkpoint_dir.to_path_buf());
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(model) = entries.get(&key) {
            log::debug!("Reusing model loaded from {key:?}");
            return Ok(Arc::clone(model));
        }

        let model = Arc::new(load(checkpoint_dir)?);
        if let Some((evicted, _)) = entries.push(key, Arc::clone(&model)) {
            log::debug!("Evicted model loaded from {evicted:?}");
        }
        Ok(model)
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

static EAST_MODELS: OnceLock<ModelCache<EastNet>> = OnceLock::new();
static CRNN_MODELS: OnceLock<ModelCache<CrnnNet>> = OnceLock::new();

/// The process-wide EAST instance for `checkpoint_dir`.
#[instrument(level = "debug")]
pub fn east_model(
    checkpoint_dir: &Path,
    num_threads: usize,
    execution_providers: &[ExecutionProvider],
) -> Result<Arc<EastNet>> {
    EAST_MODELS
        .get_or_init(|| ModelCache::new(CACHE_CAPACITY))
        .get_or_try_load(checkpoint_dir, |dir| {
            EastNet::init(dir, num_threads, execution_providers)
        })
}

/// The process-wide CRNN instance for `checkpoint_dir`.
#[instrument(level = "debug")]
pub fn crnn_model(
    checkpoint_dir: &Path,
    options: RecognitionOptions,
    num_threads: usize,
    execution_providers: &[ExecutionProvider],
) -> Result<Arc<CrnnNet>> {
    CRNN_MODELS
        .get_or_init(|| ModelCache::new(CACHE_CAPACITY))
        .get_or_try_load(checkpoint_dir, |dir| {
            CrnnNet::init(dir, options, num_threads, execution_providers)
        })
}
