// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! JSON framing helpers for room messages.
//!
//! Each [`Message`] is carried as exactly one WebSocket text frame; there is
//! no length-prefix framing here (unlike the binary Unix-socket transports
//! elsewhere in this workspace) since the transport already delimits
//! messages for us.

use crate::Message;
use thiserror::Error;

/// Error decoding a wire message.
#[derive(Debug, Error)]
pub enum WireError {
    /// The frame was not valid JSON, or didn't match any known `$` tag.
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Serialize a message to its JSON text-frame form.
pub fn encode(msg: &Message) -> Result<String, WireError> {
    Ok(serde_json::to_string(msg)?)
}

/// Parse a JSON text frame into a [`Message`].
///
/// Unrecognized `$` tags surface as [`WireError::Malformed`]; callers that
/// want forward-compatible "ignore unknown messages" behavior (per the
/// broker's `UnknownMessage` error kind) should match on this and drop the
/// frame rather than propagate it.
pub fn decode(text: &str) -> Result<Message, WireError> {
    Ok(serde_json::from_str(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trips_post() {
        let msg = Message::Post {
            room: "lobby".into(),
            time: 1234,
            name: "xyz".into(),
            data: json!({"k": "v"}),
        };
        let text = encode(&msg).unwrap();
        let back = decode(&text).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode("not json").is_err());
    }

    #[test]
    fn decode_rejects_unknown_tag() {
        assert!(decode(r#"{"$":"nope"}"#).is_err());
    }
}
