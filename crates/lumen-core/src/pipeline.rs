//! Request orchestration: cache lookups, de-duplication, fetch and decode.
//!
//! For one request the pipeline:
//! 1. Builds the [`CacheKey`] and tries the memory cache
//! 2. Fails with `DepthExceeded` if the request may not go past memory
//! 3. Takes the per-key lock and checks the memory cache again, so that
//!    concurrent identical requests wait for the first decode and then share
//!    its buffer
//! 4. Fetches and probes the source, then runs the decode chain, retrying
//!    once without pooled buffers if the codec rejected one
//! 5. Registers the result in the memory cache
//!
//! The source is always fetched before the decode chain runs, because image
//! metadata is re-derived from the original bytes. A committed transformed
//! result on disk therefore does not let a request reach past its depth: a
//! `Local` request for a network source fails with `DepthExceeded` even when
//! its transformed result is on disk.
//!
//! Results larger than the whole memory budget are never cached, so
//! concurrent identical requests for them each decode in turn behind the
//! key lock.

use std::sync::Arc;

use crate::cache::MemoryResourceCache;
use crate::decode::{DecodeInterceptorChain, DecodeRequest, DecodeResult};
use crate::error::{FetchError, PipelineError};
use crate::handle::ResultMeta;
use crate::options::{CacheKey, DecodeOptions, RequestDepth};
use crate::raster::DataFrom;
use crate::source::{FetchedImage, ImageFetcher};

/// Turns `(source_id, options)` into a decoded, cached result.
pub struct RequestPipeline {
    memory: Arc<MemoryResourceCache>,
    chain: DecodeInterceptorChain,
    fetcher: Arc<dyn ImageFetcher>,
}

impl RequestPipeline {
    pub fn new(
        memory: Arc<MemoryResourceCache>,
        chain: DecodeInterceptorChain,
        fetcher: Arc<dyn ImageFetcher>,
    ) -> Self {
        Self {
            memory,
            chain,
            fetcher,
        }
    }

    pub fn memory(&self) -> &Arc<MemoryResourceCache> {
        &self.memory
    }

    pub fn chain(&self) -> &DecodeInterceptorChain {
        &self.chain
    }

    /// Run one request to completion on the calling thread.
    pub fn execute(
        &self,
        source_id: &str,
        options: &DecodeOptions,
    ) -> Result<DecodeResult, PipelineError> {
        let key = CacheKey::build(source_id, options);

        if let Some(hit) = self.memory_hit(&key, options) {
            return Ok(hit);
        }
        if options.depth == RequestDepth::Memory {
            tracing::debug!(%key, "Memory-only request missed");
            return Err(PipelineError::DepthExceeded {
                allowed: RequestDepth::Memory,
                required: RequestDepth::Local,
            });
        }

        let _guard = self.memory.lock_key(&key);
        if let Some(hit) = self.memory_hit(&key, options) {
            tracing::debug!(%key, "Served by a concurrent decode");
            return Ok(hit);
        }

        let result = self.decode(&key, source_id, options)?;
        result.buffer.set_meta(ResultMeta {
            info: result.info.clone(),
            applied_transforms: result.applied_transforms.clone(),
        });
        if options.memory_cache.can_write() {
            self.memory
                .put(key.clone(), &result.buffer, result.buffer.byte_size());
        }
        tracing::debug!(
            %key,
            data_from = ?result.data_from,
            width = result.buffer.width(),
            height = result.buffer.height(),
            "Request decoded"
        );
        Ok(result)
    }

    /// A result built from the memory cache, if it may be read and has `key`.
    fn memory_hit(&self, key: &CacheKey, options: &DecodeOptions) -> Option<DecodeResult> {
        if !options.memory_cache.can_read() {
            return None;
        }
        let handle = self.memory.get(key)?;
        let Some(meta) = handle.meta().cloned() else {
            // Registered without metadata; treat as a miss and decode again.
            tracing::warn!(%key, "Memory cache entry without metadata");
            return None;
        };
        let mut result = DecodeResult::new(handle, meta.info, DataFrom::Memory);
        for tag in meta.applied_transforms {
            result.push_transform(tag);
        }
        Some(result.finalized())
    }

    fn fetch(&self, source_id: &str, depth: RequestDepth) -> Result<FetchedImage, PipelineError> {
        self.fetcher
            .fetch(source_id, depth)
            .map_err(|err| match err {
                FetchError::DepthBlocked { required } => PipelineError::DepthExceeded {
                    allowed: depth,
                    required: required.depth(),
                },
                other => PipelineError::Fetch(other),
            })
    }

    fn decode(
        &self,
        key: &CacheKey,
        source_id: &str,
        options: &DecodeOptions,
    ) -> Result<DecodeResult, PipelineError> {
        let source = self.fetch(source_id, options.depth)?;
        let info = self.chain.probe(&source)?;
        let request = DecodeRequest::new(key, &source, &info, options);

        match self.chain.decode(&request) {
            Err(PipelineError::Decode(err)) if err.is_recoverable() && request.pooling => {
                tracing::warn!(%key, error = %err, "Retrying decode without pooled buffers");
                let retry = DecodeRequest {
                    pooling: false,
                    ..request
                };
                self.chain.decode(&retry)
            }
            other => other,
        }
    }
}

impl std::fmt::Debug for RequestPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestPipeline")
            .field("memory", &self.memory)
            .field("chain", &self.chain)
            .finish()
    }
}
