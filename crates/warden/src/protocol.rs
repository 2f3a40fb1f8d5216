//! Wire format exchanged with policy guests.
//!
//! Two operations are defined. `validate` takes
//! `{"request": <versioned admission request>, "settings": <policy settings>}`
//! and answers with a [`ValidationResponse`]. `validate_settings` takes the
//! settings document alone and answers with a [`SettingsValidationResponse`].
//! Everything is JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::admission::{AdmissionRequest, VersionedRequest};

/// Operation validating an admission request.
pub const VALIDATE: &str = "validate";

/// Operation validating a policy's settings.
pub const VALIDATE_SETTINGS: &str = "validate_settings";

/// Errors that can occur while encoding or decoding guest messages
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A message cannot be encoded
    #[error("cannot encode {what}: {source}")]
    Encode {
        /// What was being encoded
        what: &'static str,
        /// Underlying error
        #[source]
        source: serde_json::Error,
    },
    /// A message is malformed
    #[error("malformed {what}: {source}")]
    Decode {
        /// What was being decoded
        what: &'static str,
        /// Underlying error
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Serialize)]
struct ValidationEnvelope<'a> {
    request: &'a VersionedRequest,
    settings: &'a Value,
}

/// A `validate` payload as seen by a guest.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValidationRequest {
    /// The admission request
    pub request: AdmissionRequest,
    /// The policy settings, verbatim
    pub settings: Value,
}

/// Answer to a `validate` call.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationResponse {
    /// Whether the request is accepted
    pub accepted: bool,
    /// Explanation, usually set on rejection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// HTTP-like status code for rejections
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
    /// Patched object proposed by a mutating policy
    #[serde(
        default,
        alias = "mutatedObject",
        skip_serializing_if = "Option::is_none"
    )]
    pub mutated_object: Option<Value>,
}

/// Answer to a `validate_settings` call.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingsValidationResponse {
    /// Whether the settings are valid
    pub valid: bool,
    /// Explanation, usually set when invalid
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Encode a `validate` payload.
///
/// The settings are passed through untouched; only their policy interprets them.
pub fn encode_validation_request(
    request: &VersionedRequest,
    settings: &Value,
) -> Result<Vec<u8>, ProtocolError> {
    serde_json::to_vec(&ValidationEnvelope { request, settings }).map_err(|source| {
        ProtocolError::Encode {
            what: "validation request",
            source,
        }
    })
}

/// Decode a `validate` payload.
pub fn decode_validation_request(bytes: &[u8]) -> Result<ValidationRequest, ProtocolError> {
    serde_json::from_slice(bytes).map_err(|source| ProtocolError::Decode {
        what: "validation request",
        source,
    })
}

/// Decode the answer to a `validate` call. `accepted` is required.
pub fn decode_validation_response(bytes: &[u8]) -> Result<ValidationResponse, ProtocolError> {
    serde_json::from_slice(bytes).map_err(|source| ProtocolError::Decode {
        what: "validation response",
        source,
    })
}

/// Encode a `validate_settings` payload.
pub fn encode_settings(settings: &Value) -> Result<Vec<u8>, ProtocolError> {
    serde_json::to_vec(settings).map_err(|source| ProtocolError::Encode {
        what: "settings",
        source,
    })
}

/// Decode the answer to a `validate_settings` call. `valid` is required.
pub fn decode_settings_validation_response(
    bytes: &[u8],
) -> Result<SettingsValidationResponse, ProtocolError> {
    serde_json::from_slice(bytes).map_err(|source| ProtocolError::Decode {
        what: "settings validation response",
        source,
    })
}
