//! Resource limits for policy execution

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Resource limits applied to every policy instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ResourceLimits {
    /// Maximum linear memory a guest may grow to, in bytes
    #[serde(default = "default_max_memory_bytes")]
    pub max_memory_bytes: u64,
    /// Wall-clock deadline for a single invocation
    #[serde(default = "default_timeout", rename = "timeoutMs", with = "duration_ms")]
    pub timeout: Duration,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory_bytes: default_max_memory_bytes(),
            timeout: default_timeout(),
        }
    }
}

impl ResourceLimits {
    /// Return a copy of these limits with a different timeout.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            timeout,
            ..self.clone()
        }
    }
}

fn default_max_memory_bytes() -> u64 {
    64 * 1024 * 1024 // 64 MB
}

fn default_timeout() -> Duration {
    Duration::from_secs(2)
}

/// Helper for serializing Duration as milliseconds
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}
