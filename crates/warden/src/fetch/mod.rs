//! Policy module fetching and on-disk caching.
//!
//! A module reference resolves to a local file. Remote modules are downloaded
//! once into a download directory, at a path derived from the reference alone:
//! the existence of that file *is* the cache. There is no expiry and no
//! re-validation, so publishing a new module means publishing a new reference
//! (usually a new tag).
//!
//! ```text
//! registry://ghcr.io/acme/policies/pod-privileged:v0.1.9
//!   -> <dir>/ghcr.io/acme/policies/pod-privileged:v0.1.9.wasm
//! ```

mod oci;

use std::path::{MAIN_SEPARATOR_STR, Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

pub use oci::{
    Descriptor, OCI_MANIFEST_MEDIA_TYPE, OciManifest, OciRegistry, Reference, Registry,
    WASM_LAYER_MEDIA_TYPE, sha256_digest,
};

/// Errors that can occur while fetching a policy module
#[derive(Debug, Error)]
pub enum FetchError {
    /// The reference cannot be parsed
    #[error("invalid module reference: {0}")]
    InvalidReference(String),
    /// The reference uses a scheme we cannot fetch from
    #[error("unsupported module scheme: {0}")]
    UnsupportedScheme(String),
    /// The module does not exist
    #[error("module not found: {0}")]
    NotFound(String),
    /// The artifact does not have exactly one layer
    #[error("OCI artifact {reference} is expected to have just one layer, found {layers} layers instead")]
    AmbiguousArtifact {
        /// The artifact reference
        reference: String,
        /// Number of layers found
        layers: usize,
    },
    /// The single layer is not a Wasm module
    #[error("OCI artifact {reference} has a layer of unexpected media type {media_type}")]
    UnexpectedMediaType {
        /// The artifact reference
        reference: String,
        /// Media type found
        media_type: String,
    },
    /// Downloaded content does not match its digest
    #[error("content does not match digest {0}")]
    DigestMismatch(String),
    /// The remote answered with an unexpected status
    #[error("{url} answered with status {status}")]
    Registry {
        /// Requested URL
        url: String,
        /// HTTP status code
        status: u16,
    },
    /// Transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    /// The manifest is not valid JSON of the expected shape
    #[error("invalid manifest: {0}")]
    Manifest(#[from] serde_json::Error),
    /// IO error while reading or writing the cache
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where a module reference points to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ModuleSource {
    /// A local file, used in place
    File(PathBuf),
    /// A file served over HTTP(S)
    Http(Url),
    /// An artifact in an OCI registry
    Registry(Reference),
}

impl ModuleSource {
    /// Parse a module reference.
    ///
    /// References without a scheme are registry references.
    pub fn parse(reference: &str) -> Result<Self, FetchError> {
        let invalid = || FetchError::InvalidReference(reference.to_string());

        match reference.split_once("://") {
            None => Ok(ModuleSource::Registry(Reference::parse(reference)?)),
            Some(("registry", rest)) => Ok(ModuleSource::Registry(Reference::parse(rest)?)),
            Some(("file", _)) => {
                let url = Url::parse(reference).map_err(|_| invalid())?;
                let path = url.to_file_path().map_err(|_| invalid())?;
                Ok(ModuleSource::File(path))
            }
            Some(("http" | "https", _)) => {
                let url = Url::parse(reference).map_err(|_| invalid())?;
                Ok(ModuleSource::Http(url))
            }
            Some((scheme, _)) => Err(FetchError::UnsupportedScheme(scheme.to_string())),
        }
    }
}

/// Compute the cache path of a reference inside `dest_dir`.
///
/// Path separators in the reference become directory levels and `.wasm` is
/// appended. The same reference always maps to the same path.
pub fn destination_path(reference: &str, dest_dir: impl AsRef<Path>) -> PathBuf {
    let path = reference.replace('/', MAIN_SEPARATOR_STR);
    dest_dir.as_ref().join(format!("{path}.wasm"))
}

/// Path of a remote reference below the download directory.
///
/// The scheme is dropped, so `registry://x` and `x` share a cache entry.
/// References that would resolve outside the directory are refused.
fn cache_key(reference: &str) -> Result<&str, FetchError> {
    let key = reference.split_once("://").map_or(reference, |(_, rest)| rest);
    let escapes = key.starts_with(['/', '\\'])
        || key.split(['/', '\\']).any(|segment| segment == "..");
    if escapes {
        return Err(FetchError::InvalidReference(reference.to_string()));
    }
    Ok(key)
}

/// A module that has to be downloaded.
enum Remote<'a> {
    Http(&'a Url),
    Registry(&'a Reference),
}

/// Resolves module references to local files, downloading them when needed.
///
/// Concurrent fetches of the same destination are serialized, so a module is
/// downloaded at most once even when several policies share it.
#[derive(Clone)]
pub struct ArtifactFetcher {
    registry: Arc<dyn Registry>,
    http: reqwest::Client,
    locks: Arc<DashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for ArtifactFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactFetcher").finish_non_exhaustive()
    }
}

impl Default for ArtifactFetcher {
    fn default() -> Self {
        Self::new(Arc::new(OciRegistry::default()))
    }
}

impl ArtifactFetcher {
    /// Create a fetcher pulling registry references from `registry`.
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self {
            registry,
            http: reqwest::Client::new(),
            locks: Arc::new(DashMap::new()),
        }
    }

    /// Use a specific HTTP client for `http(s)://` references.
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    /// Resolve `reference` to a local file, downloading into `dest_dir` if needed.
    pub async fn fetch(&self, reference: &str, dest_dir: &Path) -> Result<PathBuf, FetchError> {
        let source = ModuleSource::parse(reference)?;
        let remote = match &source {
            ModuleSource::File(path) => {
                return if tokio::fs::try_exists(path).await? {
                    Ok(path.clone())
                } else {
                    Err(FetchError::NotFound(path.display().to_string()))
                };
            }
            ModuleSource::Http(url) => Remote::Http(url),
            ModuleSource::Registry(reference) => Remote::Registry(reference),
        };

        let dest = destination_path(cache_key(reference)?, dest_dir);
        if tokio::fs::try_exists(&dest).await? {
            debug!(reference, dest = %dest.display(), "policy module found on disk");
            return Ok(dest);
        }

        let lock = Arc::clone(&self.locks.entry(dest.clone()).or_default());
        let result = self.download_once(reference, remote, &dest, &lock).await;
        drop(lock);
        // Only the map holds the lock once every fetcher of `dest` is done
        self.locks.remove_if(&dest, |_, lock| Arc::strong_count(lock) == 1);

        result.map(|()| dest)
    }

    /// Download `remote` into `dest` unless another task did while we waited.
    async fn download_once(
        &self,
        reference: &str,
        remote: Remote<'_>,
        dest: &Path,
        lock: &Mutex<()>,
    ) -> Result<(), FetchError> {
        let _guard = lock.lock().await;
        if tokio::fs::try_exists(dest).await? {
            debug!(reference, dest = %dest.display(), "policy module found on disk");
            return Ok(());
        }

        info!(reference, dest = %dest.display(), "downloading policy module");
        let bytes = match remote {
            Remote::Http(url) => self.download_http(url).await?,
            Remote::Registry(reference) => self.download_registry(reference).await?,
        };
        write_atomically(dest, &bytes).await?;
        info!(reference, size = bytes.len(), "policy module downloaded");
        Ok(())
    }

    async fn download_http(&self, url: &Url) -> Result<Vec<u8>, FetchError> {
        let response = self.http.get(url.clone()).send().await?;
        match response.status() {
            s if s.is_success() => Ok(response.bytes().await?.to_vec()),
            reqwest::StatusCode::NOT_FOUND => Err(FetchError::NotFound(url.to_string())),
            s => Err(FetchError::Registry {
                url: url.to_string(),
                status: s.as_u16(),
            }),
        }
    }

    async fn download_registry(&self, reference: &Reference) -> Result<Vec<u8>, FetchError> {
        let manifest = self.registry.manifest(reference).await?;
        let [layer] = manifest.layers.as_slice() else {
            return Err(FetchError::AmbiguousArtifact {
                reference: reference.to_string(),
                layers: manifest.layers.len(),
            });
        };
        if layer.media_type != WASM_LAYER_MEDIA_TYPE {
            return Err(FetchError::UnexpectedMediaType {
                reference: reference.to_string(),
                media_type: layer.media_type.clone(),
            });
        }

        let bytes = self.registry.blob(reference, &layer.digest).await?;
        oci::verify_digest(&layer.digest, &bytes)?;
        Ok(bytes)
    }
}

/// Write `bytes` to `dest` so that readers never observe a partial file.
async fn write_atomically(dest: &Path, bytes: &[u8]) -> Result<(), FetchError> {
    let file_name = dest
        .file_name()
        .ok_or_else(|| FetchError::InvalidReference(dest.display().to_string()))?;
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut tmp_name = std::ffi::OsString::from(".");
    tmp_name.push(file_name);
    tmp_name.push(format!(".{}.part", std::process::id()));
    let tmp = dest.with_file_name(tmp_name);

    let result = match tokio::fs::write(&tmp, bytes).await {
        Ok(()) => tokio::fs::rename(&tmp, dest).await,
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        if let Err(cleanup) = tokio::fs::remove_file(&tmp).await {
            warn!(path = %tmp.display(), error = %cleanup, "cannot remove partial download");
        }
        return Err(e.into());
    }
    Ok(())
}
