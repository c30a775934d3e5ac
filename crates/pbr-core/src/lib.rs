pub mod channel_ipc;
pub mod schema;

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

pub const DEFAULT_PLAYBACK_RATE: f64 = 1.0;
pub const PLAYBACK_RATE_MIN: f64 = 0.0;
pub const PLAYBACK_RATE_MAX: f64 = 4.0;
pub const PLAYBACK_RATE_STEP: f64 = 0.5;

/// Per-hostname preferences as persisted by the store.
///
/// Serialized as `{ "name", "default", "children": { url: record } }`.
/// `children` is optional on the way in, older documents only carry the
/// name and default rate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SiteProfile {
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_rate", rename = "default")]
    pub default_rate: f64,
    #[serde(default, deserialize_with = "deserialize_children")]
    pub children: BTreeMap<String, SiteRecord>,
}

impl SiteProfile {
    /// The profile a hostname has before anything was ever written for it.
    pub fn default_for(hostname: &str) -> Self {
        Self {
            name: hostname.to_string(),
            default_rate: DEFAULT_PLAYBACK_RATE,
            children: BTreeMap::new(),
        }
    }

    pub fn record(&self, url: &str) -> Option<&SiteRecord> {
        self.children.get(url)
    }

    /// Rate the page at `url` should play at: its override, else the site
    /// default. A zero default counts as unset and plays at normal speed.
    pub fn effective_rate(&self, url: &str) -> f64 {
        match self.children.get(url) {
            Some(record) => record.playback_rate,
            None if self.default_rate == 0.0 || self.default_rate.is_nan() => {
                DEFAULT_PLAYBACK_RATE
            }
            None => self.default_rate,
        }
    }
}

/// A per-page override inside a [`SiteProfile`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SiteRecord {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "playbackRate")]
    pub playback_rate: f64,
}

impl SiteRecord {
    pub fn new(name: impl Into<String>, playback_rate: f64) -> Self {
        Self {
            name: name.into(),
            playback_rate,
        }
    }
}

impl Default for SiteRecord {
    fn default() -> Self {
        Self {
            name: String::new(),
            playback_rate: DEFAULT_PLAYBACK_RATE,
        }
    }
}

/// Identity of a page as reported by its agent (`getURI` response).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct PageIdentity {
    pub href: String,
    pub hostname: String,
}

impl PageIdentity {
    pub fn new(href: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            href: href.into(),
            hostname: hostname.into(),
        }
    }

    /// Derives the hostname from `href`. Fails for URLs without a host.
    pub fn from_href(href: &str) -> Result<Self, IdentityError> {
        let parsed =
            url::Url::parse(href).map_err(|err| IdentityError::InvalidUrl(err.to_string()))?;
        let hostname = parsed
            .host_str()
            .ok_or_else(|| IdentityError::MissingHost(href.to_string()))?;
        Ok(Self::new(href, hostname))
    }
}

impl fmt::Display for PageIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.href)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("url has no host: {0}")]
    MissingHost(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Error)]
#[error("invalid playback rate: {0}")]
pub struct InvalidRate(pub f64);

/// Accepts any finite, non-negative rate.
pub fn validate_rate(rate: f64) -> Result<f64, InvalidRate> {
    if rate.is_finite() && rate >= PLAYBACK_RATE_MIN {
        Ok(rate)
    } else {
        Err(InvalidRate(rate))
    }
}

/// Clamps to the slider range and rounds to the nearest step.
pub fn snap_rate(rate: f64) -> f64 {
    if !rate.is_finite() {
        return DEFAULT_PLAYBACK_RATE;
    }
    let clamped = rate.clamp(PLAYBACK_RATE_MIN, PLAYBACK_RATE_MAX);
    (clamped / PLAYBACK_RATE_STEP).round() * PLAYBACK_RATE_STEP
}

fn default_rate() -> f64 {
    DEFAULT_PLAYBACK_RATE
}

fn deserialize_children<'de, D>(deserializer: D) -> Result<BTreeMap<String, SiteRecord>, D::Error>
where
    D: Deserializer<'de>,
{
    let children: Option<BTreeMap<String, SiteRecord>> = Option::deserialize(deserializer)?;
    Ok(children.unwrap_or_default())
}
