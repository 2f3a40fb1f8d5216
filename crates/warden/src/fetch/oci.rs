//! OCI registry access.
//!
//! Policy modules are distributed as OCI artifacts: an image manifest whose
//! single layer holds the Wasm bytes. Only anonymous pulls are supported;
//! registries asking for a bearer token get one from the advertised realm.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::header::{ACCEPT, WWW_AUTHENTICATE};
use reqwest::{Response, StatusCode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::FetchError;

/// Media type of the layer holding a policy module.
pub const WASM_LAYER_MEDIA_TYPE: &str = "application/vnd.wasm.content.layer.v1+wasm";

/// Media type of OCI image manifests.
pub const OCI_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

const DOCKER_HUB: &str = "docker.io";
const DOCKER_HUB_ENDPOINT: &str = "registry-1.docker.io";

/// A parsed OCI reference: `registry/repository[:tag][@digest]`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Reference {
    /// Registry host, with optional port
    pub registry: String,
    /// Repository path inside the registry
    pub repository: String,
    /// Tag, `latest` when neither tag nor digest is given
    pub tag: Option<String>,
    /// Content digest (`sha256:...`)
    pub digest: Option<String>,
}

impl Reference {
    /// Parse a reference such as `ghcr.io/acme/policies/pod-privileged:v0.1.9`.
    pub fn parse(reference: &str) -> Result<Self, FetchError> {
        let invalid = || FetchError::InvalidReference(reference.to_string());

        let (rest, digest) = match reference.split_once('@') {
            Some((rest, digest)) if digest.contains(':') => (rest, Some(digest.to_string())),
            Some(_) => return Err(invalid()),
            None => (reference, None),
        };

        // A ':' after the last '/' separates the tag; earlier ones are ports
        let last_slash = rest.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (name, tag) = match rest[last_slash..].rfind(':') {
            Some(i) => (&rest[..last_slash + i], Some(rest[last_slash + i + 1..].to_string())),
            None => (rest, None),
        };
        if name.is_empty() || tag.as_deref() == Some("") {
            return Err(invalid());
        }

        let (registry, repository) = match name.split_once('/') {
            Some((first, path))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), path.to_string())
            }
            _ => (DOCKER_HUB.to_string(), name.to_string()),
        };
        let repository = if registry == DOCKER_HUB && !repository.contains('/') {
            format!("library/{repository}")
        } else {
            repository
        };
        if repository.is_empty()
            || repository
                .split('/')
                .any(|segment| segment.is_empty() || segment == "..")
        {
            return Err(invalid());
        }

        let tag = match (&tag, &digest) {
            (None, None) => Some("latest".to_string()),
            _ => tag,
        };

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Tag or digest identifying the manifest.
    pub fn manifest_reference(&self) -> &str {
        self.digest
            .as_deref()
            .or(self.tag.as_deref())
            .unwrap_or("latest")
    }

    fn endpoint(&self) -> &str {
        if self.registry == DOCKER_HUB {
            DOCKER_HUB_ENDPOINT
        } else {
            &self.registry
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

/// A content descriptor in a manifest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Media type of the referenced content
    pub media_type: String,
    /// Content digest
    pub digest: String,
    /// Size in bytes
    #[serde(default)]
    pub size: u64,
    /// Free-form annotations
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
}

/// An OCI image manifest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciManifest {
    /// Always 2
    pub schema_version: u32,
    /// Media type of the manifest itself
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// Configuration blob
    pub config: Descriptor,
    /// Content layers
    #[serde(default)]
    pub layers: Vec<Descriptor>,
}

/// Read access to an OCI-compatible registry.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Fetch the image manifest for `reference`.
    async fn manifest(&self, reference: &Reference) -> Result<OciManifest, FetchError>;

    /// Fetch the blob with the given digest from the reference's repository.
    async fn blob(&self, reference: &Reference, digest: &str) -> Result<Vec<u8>, FetchError>;
}

/// [`Registry`] speaking the OCI distribution HTTP API.
#[derive(Debug, Clone)]
pub struct OciRegistry {
    client: reqwest::Client,
    plain_http: bool,
    tokens: std::sync::Arc<DashMap<String, String>>,
}

impl Default for OciRegistry {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

impl OciRegistry {
    /// Create a registry client over HTTPS.
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            plain_http: false,
            tokens: Default::default(),
        }
    }

    /// Talk plain HTTP, for local test registries.
    pub fn plain_http(mut self, plain_http: bool) -> Self {
        self.plain_http = plain_http;
        self
    }

    fn url(&self, reference: &Reference, path: &str) -> String {
        let scheme = if self.plain_http { "http" } else { "https" };
        format!(
            "{scheme}://{}/v2/{}/{path}",
            reference.endpoint(),
            reference.repository
        )
    }

    async fn get(
        &self,
        reference: &Reference,
        url: &str,
        accept: &str,
    ) -> Result<Response, FetchError> {
        let cache_key = format!("{}/{}", reference.registry, reference.repository);
        let token = self.tokens.get(&cache_key).map(|t| t.value().clone());

        let mut request = self.client.get(url).header(ACCEPT, accept);
        if let Some(token) = &token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return check_status(reference, url, response);
        }

        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|h| h.to_str().ok())
            .and_then(BearerChallenge::parse)
            .ok_or_else(|| FetchError::Registry {
                url: url.to_string(),
                status: StatusCode::UNAUTHORIZED.as_u16(),
            })?;
        let token = self.token(reference, &challenge).await?;
        self.tokens.insert(cache_key, token.clone());

        let response = self
            .client
            .get(url)
            .header(ACCEPT, accept)
            .bearer_auth(token)
            .send()
            .await?;
        check_status(reference, url, response)
    }

    async fn token(
        &self,
        reference: &Reference,
        challenge: &BearerChallenge,
    ) -> Result<String, FetchError> {
        #[derive(Deserialize)]
        struct TokenResponse {
            token: Option<String>,
            access_token: Option<String>,
        }

        let scope = challenge
            .scope
            .clone()
            .unwrap_or_else(|| format!("repository:{}:pull", reference.repository));
        let mut query = vec![("scope", scope)];
        if let Some(service) = &challenge.service {
            query.push(("service", service.clone()));
        }

        debug!(realm = %challenge.realm, "requesting anonymous registry token");
        let response = self
            .client
            .get(&challenge.realm)
            .query(&query)
            .send()
            .await?;
        let response = check_status(reference, &challenge.realm, response)?;
        let body: TokenResponse = response.json().await?;
        body.token
            .or(body.access_token)
            .ok_or_else(|| FetchError::Registry {
                url: challenge.realm.clone(),
                status: StatusCode::UNAUTHORIZED.as_u16(),
            })
    }
}

fn check_status(reference: &Reference, url: &str, response: Response) -> Result<Response, FetchError> {
    match response.status() {
        s if s.is_success() => Ok(response),
        StatusCode::NOT_FOUND => Err(FetchError::NotFound(reference.to_string())),
        s => Err(FetchError::Registry {
            url: url.to_string(),
            status: s.as_u16(),
        }),
    }
}

#[async_trait]
impl Registry for OciRegistry {
    async fn manifest(&self, reference: &Reference) -> Result<OciManifest, FetchError> {
        let url = self.url(reference, &format!("manifests/{}", reference.manifest_reference()));
        let bytes = self
            .get(reference, &url, OCI_MANIFEST_MEDIA_TYPE)
            .await?
            .bytes()
            .await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn blob(&self, reference: &Reference, digest: &str) -> Result<Vec<u8>, FetchError> {
        let url = self.url(reference, &format!("blobs/{digest}"));
        let bytes = self
            .get(reference, &url, "application/octet-stream")
            .await?
            .bytes()
            .await?;
        Ok(bytes.to_vec())
    }
}

/// Parsed `WWW-Authenticate: Bearer ...` challenge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct BearerChallenge {
    pub realm: String,
    pub service: Option<String>,
    pub scope: Option<String>,
}

impl BearerChallenge {
    pub(crate) fn parse(header: &str) -> Option<Self> {
        let params = header.trim().strip_prefix("Bearer ")?;
        let mut realm = None;
        let mut service = None;
        let mut scope = None;

        let mut rest = params.trim();
        while !rest.is_empty() {
            let (key, after_key) = rest.split_once('=')?;
            let after_key = after_key.strip_prefix('"')?;
            let (value, after_value) = after_key.split_once('"')?;
            match key.trim() {
                "realm" => realm = Some(value.to_string()),
                "service" => service = Some(value.to_string()),
                "scope" => scope = Some(value.to_string()),
                _ => {}
            }
            rest = after_value.trim_start_matches(',').trim();
        }

        Some(Self {
            realm: realm?,
            service,
            scope,
        })
    }
}

/// Check that `bytes` hash to `digest` (`sha256:<hex>`).
pub(crate) fn verify_digest(digest: &str, bytes: &[u8]) -> Result<(), FetchError> {
    let mismatch = || FetchError::DigestMismatch(digest.to_string());
    let expected = digest.strip_prefix("sha256:").ok_or_else(mismatch)?;
    let actual = hex::encode(Sha256::digest(bytes));
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(mismatch())
    }
}

/// Digest string for `bytes`, in the form registries use.
pub fn sha256_digest(bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}
