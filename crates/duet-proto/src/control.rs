use serde::{Deserialize, Serialize};

/// Local or remote audio/video toggles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaState {
    #[serde(default)]
    pub audio_muted: bool,
    #[serde(default)]
    pub video_off: bool,
}

impl MediaState {
    pub fn new(audio_muted: bool, video_off: bool) -> Self {
        Self {
            audio_muted,
            video_off,
        }
    }
}

/// Messages carried over the auxiliary data stream once the direct link is
/// up. Encoded as JSON text frames tagged by `type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ControlMessage {
    MediaState(MediaState),
    CallEnded,
}

impl ControlMessage {
    pub fn encode(&self) -> String {
        // Serializing a fieldless enum or two booleans cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }

    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

impl From<MediaState> for ControlMessage {
    fn from(state: MediaState) -> Self {
        ControlMessage::MediaState(state)
    }
}
