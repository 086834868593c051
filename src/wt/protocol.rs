//! Wire format for the WT (WebTiles) WebSocket protocol: JSON payloads
//! compressed with raw deflate, one or many per frame.

use crate::errors::BeemError;
use flate2::read::DeflateDecoder;
use serde::{Deserialize, Serialize};
use std::io::Read;

/// Trailing bytes the server appends per permessage-deflate framing; must
/// be restored before inflating, per the spec's wire-protocol note.
const DEFLATE_TAIL: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// Inflates one raw-deflate WebSocket frame into its UTF-8 JSON text.
pub fn inflate_frame(data: &[u8]) -> Result<String, BeemError> {
    let mut padded = Vec::with_capacity(data.len() + DEFLATE_TAIL.len());
    padded.extend_from_slice(data);
    padded.extend_from_slice(&DEFLATE_TAIL);

    let mut decoder = DeflateDecoder::new(&padded[..]);
    let mut out = String::new();
    decoder
        .read_to_string(&mut out)
        .map_err(|e| BeemError::ProtocolViolation(format!("inflate failed: {e}")))?;
    Ok(out)
}

/// A decoded frame: a single message (the `msg` tag lives at the top
/// level) or a batch keyed under `msgs`, per the spec's "each frame
/// contains either `msg` or `msgs`" note.
pub struct Frame;

#[derive(Debug, Deserialize)]
struct BatchFrame {
    msgs: Vec<WireMessage>,
}

impl Frame {
    pub fn parse(text: &str) -> Result<Vec<WireMessage>, BeemError> {
        if let Ok(batch) = serde_json::from_str::<BatchFrame>(text) {
            return Ok(batch.msgs);
        }
        let single: WireMessage = serde_json::from_str(text)
            .map_err(|e| BeemError::ProtocolViolation(format!("malformed WT frame: {e}")))?;
        Ok(vec![single])
    }
}

/// Recognized incoming message types, tagged on the `msg` field.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "msg")]
#[serde(rename_all = "snake_case")]
pub enum WireMessage {
    Ping,
    LoginSuccess {
        username: String,
    },
    LoginFail {
        #[serde(default)]
        reason: Option<String>,
    },
    LobbyEntry {
        id: String,
        username: String,
        game_id: String,
        #[serde(default)]
        spectator_count: u64,
        #[serde(default)]
        idle_time: u64,
    },
    LobbyRemove {
        id: String,
    },
    LobbyClear,
    LobbyComplete,
    WatchingStarted,
    UpdateSpectators {
        #[serde(default)]
        spectator_count: u64,
    },
    GameEnded,
    GoLobby,
    Go {
        #[serde(default)]
        path: Option<String>,
    },
    Chat {
        content: String,
    },
    Dump {
        url: String,
    },
    #[serde(other)]
    Unrecognized,
}

/// Outgoing message types, serialized with the same `msg` tag.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "msg")]
#[serde(rename_all = "snake_case")]
pub enum OutgoingMessage {
    Pong,
    Login { username: String, password: String },
    Watch { username: String },
    ChatMsg { text: String },
}
