//! Client → server frame classification.
//!
//! Terminal input and control messages share one WebSocket. A frame is a
//! control message only if it decodes as one of the known JSON shapes;
//! everything else is terminal input and is forwarded untouched.

use pty_session::Dimensions;
use serde::{Deserialize, Serialize};

/// Resize requests larger than this are clamped
pub const MAX_DIMENSION: u16 = 4096;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMessage {
    Resize { dimensions: ResizeRequest },
    Keepalive,
}

/// Requested size as sent by the client. Signed so that out-of-range values
/// still decode and can be rejected here rather than passed through as input.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeRequest {
    pub cols: i64,
    pub rows: i64,
}

impl ResizeRequest {
    /// `None` for non-positive sizes; oversized values clamp to [`MAX_DIMENSION`]
    pub fn to_dimensions(&self) -> Option<Dimensions> {
        if self.rows <= 0 || self.cols <= 0 {
            return None;
        }
        let clamp = |v: i64| v.min(i64::from(MAX_DIMENSION)) as u16;
        Dimensions::new(clamp(self.rows), clamp(self.cols))
    }
}

impl ControlMessage {
    pub fn resize(rows: u16, cols: u16) -> Self {
        ControlMessage::Resize {
            dimensions: ResizeRequest {
                cols: i64::from(cols),
                rows: i64::from(rows),
            },
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// What a client frame turned out to be
#[derive(Debug, PartialEq, Eq)]
pub enum Inbound<'a> {
    Control(ControlMessage),
    /// Terminal input, exactly as received
    Raw(&'a [u8]),
}

pub fn classify(payload: &[u8]) -> Inbound<'_> {
    // Keystrokes almost never start with '{'; skip the decode for them
    if !looks_like_object(payload) {
        return Inbound::Raw(payload);
    }
    match serde_json::from_slice::<ControlMessage>(payload) {
        Ok(msg) => Inbound::Control(msg),
        Err(_) => Inbound::Raw(payload),
    }
}

fn looks_like_object(payload: &[u8]) -> bool {
    payload.iter().find(|b| !b.is_ascii_whitespace()) == Some(&b'{')
}
