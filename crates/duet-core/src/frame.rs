//! Data-channel framing
//!
//! Everything on the data channel is UTF-8 text. Chat lines travel raw,
//! structured payloads are small JSON envelopes, and keepalive frames carry
//! a NUL sentinel prefix so they can never collide with typed input.

use serde::{Deserialize, Serialize};

/// Prefix reserved for control frames on the data channel
pub const CONTROL_PREFIX: char = '\u{0}';

const PING_TAG: &str = "ping:";
const PONG_TAG: &str = "pong:";

/// A decoded data-channel frame
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DataFrame {
    /// Keepalive ping with a sequence number
    Ping(u64),
    /// Keepalive reply echoing the ping's sequence number
    Pong(u64),
    /// Sentinel-prefixed frame this build does not understand
    Control(String),
    /// Application traffic
    App(Payload),
}

impl DataFrame {
    /// Decode raw channel text
    pub fn decode(text: &str) -> Self {
        let Some(body) = text.strip_prefix(CONTROL_PREFIX) else {
            return DataFrame::App(Payload::decode(text));
        };

        let parse_seq = |tag: &str| body.strip_prefix(tag).and_then(|s| s.parse::<u64>().ok());

        if let Some(seq) = parse_seq(PING_TAG) {
            DataFrame::Ping(seq)
        } else if let Some(seq) = parse_seq(PONG_TAG) {
            DataFrame::Pong(seq)
        } else {
            DataFrame::Control(body.to_string())
        }
    }

    /// Encode for the wire
    pub fn encode(&self) -> String {
        match self {
            DataFrame::Ping(seq) => format!("{CONTROL_PREFIX}{PING_TAG}{seq}"),
            DataFrame::Pong(seq) => format!("{CONTROL_PREFIX}{PONG_TAG}{seq}"),
            DataFrame::Control(body) => format!("{CONTROL_PREFIX}{body}"),
            DataFrame::App(payload) => payload.encode(),
        }
    }

    /// Keepalive and other sentinel frames
    pub fn is_control(&self) -> bool {
        !matches!(self, DataFrame::App(_))
    }
}

/// Application payload delivered to the UI
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    /// A chat line
    Text(String),
    /// A file shared by URL
    File { name: String, size: u64, url: String },
    /// A reaction emoji
    Reaction { emoji: String },
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Envelope {
    File { name: String, size: u64, url: String },
    Reaction { emoji: String },
}

impl Payload {
    /// Decode application text. Anything that is not a known envelope is a chat line.
    pub fn decode(text: &str) -> Self {
        if text.trim_start().starts_with('{') {
            if let Ok(envelope) = serde_json::from_str::<Envelope>(text) {
                return match envelope {
                    Envelope::File { name, size, url } => Payload::File { name, size, url },
                    Envelope::Reaction { emoji } => Payload::Reaction { emoji },
                };
            }
        }
        Payload::Text(text.to_string())
    }

    pub fn encode(&self) -> String {
        let envelope = match self {
            Payload::Text(text) => return text.clone(),
            Payload::File { name, size, url } => Envelope::File {
                name: name.clone(),
                size: *size,
                url: url.clone(),
            },
            Payload::Reaction { emoji } => Envelope::Reaction {
                emoji: emoji.clone(),
            },
        };
        // Envelope only holds strings and integers
        serde_json::to_string(&envelope).unwrap_or_default()
    }
}
