//! WSP lifecycle messages
//!
//! Payload of a `MSG_WSP` record, little-endian, 20 bytes:
//!
//! ```text
//! 0      4      8      12             20
//! │event │ tid  │res id│  object ptr  │
//! ```
//!
//! Page-level events carry resource id 0 and a null pointer.

use serde::Serialize;

pub const WSP_MSG_LEN: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WspEvent {
    PageLoadBegin = 1,
    PageLoadEnd = 2,
    ResLoadBegin = 3,
    ResLoadEnd = 4,
    ResProcBegin = 5,
    ResProcEnd = 6,
    DrawBegin = 7,
    DrawEnd = 8,
}

impl WspEvent {
    #[must_use]
    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            1 => WspEvent::PageLoadBegin,
            2 => WspEvent::PageLoadEnd,
            3 => WspEvent::ResLoadBegin,
            4 => WspEvent::ResLoadEnd,
            5 => WspEvent::ResProcBegin,
            6 => WspEvent::ResProcEnd,
            7 => WspEvent::DrawBegin,
            8 => WspEvent::DrawEnd,
            _ => return None,
        })
    }

    #[must_use]
    pub fn code(self) -> u32 {
        self as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WspMessage {
    pub event: WspEvent,
    pub tid: u32,
    pub res_id: u32,
    pub ptr: u64,
}

impl WspMessage {
    #[must_use]
    pub fn page(event: WspEvent, tid: u32) -> Self {
        Self { event, tid, res_id: 0, ptr: 0 }
    }

    #[must_use]
    pub fn encode(&self) -> [u8; WSP_MSG_LEN] {
        let mut out = [0u8; WSP_MSG_LEN];
        out[0..4].copy_from_slice(&self.event.code().to_le_bytes());
        out[4..8].copy_from_slice(&self.tid.to_le_bytes());
        out[8..12].copy_from_slice(&self.res_id.to_le_bytes());
        out[12..20].copy_from_slice(&self.ptr.to_le_bytes());
        out
    }

    #[must_use]
    pub fn decode(raw: &[u8]) -> Option<Self> {
        if raw.len() != WSP_MSG_LEN {
            return None;
        }
        let word = |at: usize| u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]]);
        let mut ptr = [0u8; 8];
        ptr.copy_from_slice(&raw[12..20]);
        Some(Self {
            event: WspEvent::from_code(word(0))?,
            tid: word(4),
            res_id: word(8),
            ptr: u64::from_le_bytes(ptr),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let msg = WspMessage { event: WspEvent::ResLoadBegin, tid: 9, res_id: 2, ptr: 0xb6f0_1000 };
        let raw = msg.encode();
        assert_eq!(&raw[0..4], &[3, 0, 0, 0]);
        assert_eq!(&raw[12..16], &[0x00, 0x10, 0xf0, 0xb6]);
        assert_eq!(WspMessage::decode(&raw), Some(msg));
    }

    #[test]
    fn test_decode_rejects_bad_input() {
        let mut raw = WspMessage::page(WspEvent::DrawEnd, 1).encode();
        assert!(WspMessage::decode(&raw[..19]).is_none());
        raw[0] = 42;
        assert!(WspMessage::decode(&raw).is_none());
    }
}
