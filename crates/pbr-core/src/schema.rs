//! Compile-time channel contracts.
//!
//! A schema is an uninhabited marker type; each event of the schema is a
//! zero-sized type implementing [`ChannelEvent`] with `Schema` pointing at
//! that marker. Channels are generic over the schema and only accept events
//! that belong to it, so a `getURI` request can only be built with the
//! parameter type `getURI` declares and only yields its response type.

use crate::PageIdentity;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub trait ChannelSchema: 'static {
    /// Every event name the schema declares.
    const EVENTS: &'static [&'static str];

    fn declares(event_name: &str) -> bool {
        Self::EVENTS.contains(&event_name)
    }
}

pub trait ChannelEvent: 'static {
    type Schema: ChannelSchema;
    type Params: Serialize + DeserializeOwned + Send + 'static;
    type Response: Serialize + DeserializeOwned + Send + 'static;

    const NAME: &'static str;
}

/// The playback-rate keeper's event contract.
pub enum PlaybackSchema {}

impl ChannelSchema for PlaybackSchema {
    const EVENTS: &'static [&'static str] = &[ChangePlayback::NAME, GetUri::NAME];
}

/// Backend or surface → page: apply a rate to every media element.
pub struct ChangePlayback;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ChangePlaybackParams {
    #[serde(rename = "playbackRate")]
    pub playback_rate: f64,
}

impl ChannelEvent for ChangePlayback {
    type Schema = PlaybackSchema;
    type Params = ChangePlaybackParams;
    type Response = ();

    const NAME: &'static str = "changePlayback";
}

/// Surface → page: report the page's href and hostname.
pub struct GetUri;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GetUriParams {}

impl ChannelEvent for GetUri {
    type Schema = PlaybackSchema;
    type Params = GetUriParams;
    type Response = PageIdentity;

    const NAME: &'static str = "getURI";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn playback_schema_declares_both_events() {
        assert!(PlaybackSchema::declares("changePlayback"));
        assert!(PlaybackSchema::declares("getURI"));
        assert!(!PlaybackSchema::declares("getUri"));
    }

    #[test]
    fn params_use_wire_names() {
        let params = ChangePlaybackParams { playback_rate: 2.5 };
        assert_eq!(
            serde_json::to_value(params).expect("serialize"),
            serde_json::json!({"playbackRate": 2.5})
        );
        assert_eq!(
            serde_json::to_value(GetUriParams::default()).expect("serialize"),
            serde_json::json!({})
        );
    }
}
