//! Process-scoped owner of the pool, caches, pipeline and workers.
//!
//! # Examples
//!
//! ```ignore
//! let engine = Engine::new(EngineConfig::default(), Arc::new(FileFetcher::new("photos")))?;
//! let task = engine.request("a.jpg", DecodeOptions::new().resize(Resize::new(256, 256)));
//! let result = task.wait()?;
//! // Display `result.buffer`, then let go of it.
//! result.release();
//! engine.shutdown();
//! ```

use std::sync::Arc;

use thiserror::Error;

use crate::cache::{DiskTransformCache, MemoryResourceCache};
use crate::codec::{FormatCodec, ImageCodec};
use crate::config::{ConfigError, EngineConfig};
use crate::decode::{DecodeContext, DecodeInterceptorChain, DecodeResult};
use crate::error::{CacheError, PipelineError};
use crate::options::DecodeOptions;
use crate::pipeline::RequestPipeline;
use crate::pool::{BufferPool, TrimLevel};
use crate::source::ImageFetcher;
use crate::worker::{RequestTask, WorkerPool};

/// Errors raised while constructing an [`Engine`].
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to open disk cache: {0}")]
    Cache(#[from] CacheError),

    #[error("Failed to start worker pool: {0}")]
    Workers(#[from] rayon::ThreadPoolBuildError),
}

/// The decode-and-cache core, constructed once and shared by reference.
pub struct Engine {
    config: EngineConfig,
    pool: Arc<BufferPool>,
    memory: Arc<MemoryResourceCache>,
    disk: Option<Arc<DiskTransformCache>>,
    pipeline: Arc<RequestPipeline>,
    workers: WorkerPool,
}

impl Engine {
    /// Build an engine decoding with the default [`ImageCodec`].
    pub fn new(config: EngineConfig, fetcher: Arc<dyn ImageFetcher>) -> Result<Self, EngineError> {
        Self::with_codec(config, fetcher, Arc::new(ImageCodec))
    }

    pub fn with_codec(
        config: EngineConfig,
        fetcher: Arc<dyn ImageFetcher>,
        codec: Arc<dyn FormatCodec>,
    ) -> Result<Self, EngineError> {
        config.validate()?;

        let pool = Arc::new(BufferPool::new(config.buffer_pool.clone()));
        let memory = Arc::new(MemoryResourceCache::new(config.memory_cache.max_bytes));
        let disk = config
            .disk_cache
            .as_ref()
            .map(DiskTransformCache::open)
            .transpose()?
            .map(Arc::new);

        let mut ctx = DecodeContext::new(codec, Arc::clone(&pool), config.decode.clone());
        if let Some(disk) = &disk {
            ctx = ctx.with_disk_cache(Arc::clone(disk));
        }
        let pipeline = Arc::new(RequestPipeline::new(
            Arc::clone(&memory),
            DecodeInterceptorChain::new(ctx),
            fetcher,
        ));
        let workers = WorkerPool::new(config.workers.threads)?;

        tracing::info!(
            memory_bytes = config.memory_cache.max_bytes,
            pool_bytes = config.buffer_pool.max_bytes,
            disk_cache = disk.is_some(),
            threads = workers.threads(),
            "Engine started"
        );
        Ok(Self {
            config,
            pool,
            memory,
            disk,
            pipeline,
            workers,
        })
    }

    /// Queue a request on the worker pool.
    pub fn request(&self, source_id: impl Into<String>, options: DecodeOptions) -> RequestTask {
        let source_id = source_id.into();
        let pipeline = Arc::clone(&self.pipeline);
        self.workers
            .spawn(move || pipeline.execute(&source_id, &options))
    }

    /// Run a request on the calling thread.
    pub fn execute(
        &self,
        source_id: &str,
        options: &DecodeOptions,
    ) -> Result<DecodeResult, PipelineError> {
        if !self.workers.is_accepting() {
            return Err(PipelineError::Aborted);
        }
        self.pipeline.execute(source_id, options)
    }

    /// Give memory back to the system.
    pub fn on_memory_pressure(&self, level: TrimLevel) {
        tracing::info!(?level, "Memory pressure");
        self.memory.trim(level);
        self.pool.trim(level);
    }

    /// Stop accepting requests and drop cached memory.
    ///
    /// Requests already queued or running still complete; handles held by
    /// consumers stay valid until released.
    pub fn shutdown(&self) {
        self.workers.shutdown();
        self.memory.clear();
        self.pool.clear();
        tracing::info!("Engine shut down");
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn memory_cache(&self) -> &MemoryResourceCache {
        &self.memory
    }

    pub fn buffer_pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn disk_cache(&self) -> Option<&DiskTransformCache> {
        self.disk.as_deref()
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("pipeline", &self.pipeline)
            .field("workers", &self.workers)
            .finish()
    }
}
