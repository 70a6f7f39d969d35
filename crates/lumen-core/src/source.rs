//! Fetch-layer contract.
//!
//! Fetching (network, disk, assets) is outside the core: an [`ImageFetcher`]
//! hands the pipeline the encoded bytes of a source, its declared MIME type
//! and the tier they came from. Two simple fetchers are provided for local
//! files and for bytes registered in memory.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use image::ImageFormat;
use parking_lot::RwLock;

use crate::error::FetchError;
use crate::options::RequestDepth;
use crate::raster::DataFrom;

/// Encoded bytes of one source.
#[derive(Debug, Clone)]
pub struct FetchedImage {
    pub bytes: Arc<[u8]>,
    /// MIME type declared by the source, if it declared one.
    pub mime_type: Option<String>,
    /// Stable identity of the source, e.g. a canonical URI.
    pub identity: String,
    pub data_from: DataFrom,
}

/// Delivers source bytes to the pipeline.
pub trait ImageFetcher: Send + Sync {
    /// Fetch `source_id` without escalating beyond `depth`.
    ///
    /// Must fail with [`FetchError::DepthBlocked`] instead of reaching a
    /// deeper tier than allowed.
    fn fetch(&self, source_id: &str, depth: RequestDepth) -> Result<FetchedImage, FetchError>;
}

fn check_depth(data_from: DataFrom, depth: RequestDepth) -> Result<(), FetchError> {
    if data_from.depth() > depth {
        return Err(FetchError::DepthBlocked {
            required: data_from,
        });
    }
    Ok(())
}

/// Reads sources from files under a root directory.
///
/// Source ids are relative paths; ids that would escape the root are
/// reported as not found.
#[derive(Debug, Clone)]
pub struct FileFetcher {
    root: PathBuf,
}

impl FileFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, source_id: &str) -> Option<PathBuf> {
        let relative = Path::new(source_id);
        let contained = relative
            .components()
            .all(|component| matches!(component, Component::Normal(_) | Component::CurDir));
        contained.then(|| self.root.join(relative))
    }
}

impl ImageFetcher for FileFetcher {
    fn fetch(&self, source_id: &str, depth: RequestDepth) -> Result<FetchedImage, FetchError> {
        check_depth(DataFrom::Local, depth)?;
        let path = self
            .resolve(source_id)
            .ok_or_else(|| FetchError::NotFound(source_id.to_string()))?;
        let bytes = std::fs::read(&path).map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => FetchError::NotFound(source_id.to_string()),
            _ => FetchError::Io(format!("{}: {err}", path.display())),
        })?;
        let mime_type = ImageFormat::from_path(&path)
            .ok()
            .map(|format| format.to_mime_type().to_string());
        tracing::trace!(source_id, bytes = bytes.len(), "Read local source");
        Ok(FetchedImage {
            bytes: bytes.into(),
            mime_type,
            identity: path.to_string_lossy().into_owned(),
            data_from: DataFrom::Local,
        })
    }
}

/// Serves bytes registered in memory, each tagged with the tier it stands for.
#[derive(Debug, Default)]
pub struct MemoryFetcher {
    sources: RwLock<HashMap<String, (Arc<[u8]>, DataFrom)>>,
}

impl MemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, source_id: impl Into<String>, bytes: impl Into<Arc<[u8]>>, data_from: DataFrom) {
        self.sources
            .write()
            .insert(source_id.into(), (bytes.into(), data_from));
    }

    pub fn remove(&self, source_id: &str) -> bool {
        self.sources.write().remove(source_id).is_some()
    }
}

impl ImageFetcher for MemoryFetcher {
    fn fetch(&self, source_id: &str, depth: RequestDepth) -> Result<FetchedImage, FetchError> {
        let (bytes, data_from) = self
            .sources
            .read()
            .get(source_id)
            .cloned()
            .ok_or_else(|| FetchError::NotFound(source_id.to_string()))?;
        check_depth(data_from, depth)?;
        Ok(FetchedImage {
            bytes,
            mime_type: None,
            identity: source_id.to_string(),
            data_from,
        })
    }
}
