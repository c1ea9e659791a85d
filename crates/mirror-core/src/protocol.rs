//! Wire protocol: type-tagged binary payloads for video and audio, and the
//! JSON text frames exchanged with viewers and dashboards.
//!
//! Binary layout (little-endian):
//!
//! ```text
//! u8  type_tag              0x01 delta, 0x02 keyframe, 0x05 audio
//! i64 timestamp_ms          server wall-clock at encode
//! i32 num_tiles             0 => full-frame fallback follows
//! if num_tiles == 0:
//!     i32 full_w, i32 full_h, i32 len, u8[len]
//! else per tile:
//!     i32 x, i32 y, i32 w, i32 h, i32 len, u8[len]
//! ```
//!
//! Audio payloads are `u8 0x05, u32 len, u8[len]`.

use bytes::{Buf, BufMut, Bytes};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::Tier;

pub const PROTOCOL_VERSION: &str = "1.0.0";

pub const DELTA: u8 = 0x01;
pub const KEYFRAME: u8 = 0x02;
pub const INPUT_POINTER: u8 = 0x03;
pub const INPUT_KEY: u8 = 0x04;
pub const AUDIO: u8 = 0x05;

/// Byte offset of the payload body: tag + timestamp.
const VIDEO_HEADER: usize = 1 + 8;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("buffer too short: need {need} bytes, have {have}")]
    BufferTooShort { need: usize, have: usize },
    #[error("unknown payload type: 0x{0:02x}")]
    UnknownType(u8),
    #[error("negative length field: {0}")]
    NegativeLength(i32),
    #[error("full-frame delta must carry exactly one tile, got {0}")]
    BadFullFrame(usize),
}

/// A tile already run through the codec, ready for framing.
#[derive(Debug, Clone)]
pub struct EncodedTile {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
    pub data: Vec<u8>,
}

/// A framed binary payload ready for fan-out. Cloning shares the buffer.
#[derive(Debug, Clone)]
pub struct Payload {
    bytes: Bytes,
}

impl Payload {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Bytes::from(bytes),
        }
    }

    pub fn type_tag(&self) -> u8 {
        self.bytes[0]
    }

    pub fn timestamp_ms(&self) -> i64 {
        if self.bytes.len() < VIDEO_HEADER || self.type_tag() == AUDIO {
            return 0;
        }
        let mut cursor = &self.bytes[1..VIDEO_HEADER];
        cursor.get_i64_le()
    }

    pub fn bytes(&self) -> Bytes {
        self.bytes.clone()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Re-tags a full-frame delta as a keyframe; every other byte is kept.
    pub fn into_keyframe(self) -> Payload {
        let mut bytes = self.bytes.to_vec();
        bytes[0] = KEYFRAME;
        Payload::from_bytes(bytes)
    }
}

/// Server wall-clock in milliseconds since the epoch.
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Frames encoded tiles into a delta payload (tag 0x01). A full-frame
/// fallback carries exactly one tile covering the whole frame.
pub fn frame_delta(
    timestamp_ms: i64,
    tiles: &[EncodedTile],
    full_frame: bool,
) -> Result<Payload, ProtocolError> {
    if full_frame && tiles.len() != 1 {
        return Err(ProtocolError::BadFullFrame(tiles.len()));
    }

    let body: usize = tiles.iter().map(|t| 20 + t.data.len()).sum();
    let mut buf = Vec::with_capacity(VIDEO_HEADER + 4 + body);
    buf.put_u8(DELTA);
    buf.put_i64_le(timestamp_ms);

    if full_frame {
        let tile = &tiles[0];
        buf.put_i32_le(0);
        buf.put_i32_le(tile.w);
        buf.put_i32_le(tile.h);
        buf.put_i32_le(tile.data.len() as i32);
        buf.extend_from_slice(&tile.data);
    } else {
        buf.put_i32_le(tiles.len() as i32);
        for tile in tiles {
            buf.put_i32_le(tile.x);
            buf.put_i32_le(tile.y);
            buf.put_i32_le(tile.w);
            buf.put_i32_le(tile.h);
            buf.put_i32_le(tile.data.len() as i32);
            buf.extend_from_slice(&tile.data);
        }
    }

    Ok(Payload::from_bytes(buf))
}

/// Frames an audio packet into the length-prefixed 0x05 envelope.
pub fn frame_audio(packet: &[u8]) -> Payload {
    let mut buf = Vec::with_capacity(5 + packet.len());
    buf.put_u8(AUDIO);
    buf.put_u32_le(packet.len() as u32);
    buf.extend_from_slice(packet);
    Payload::from_bytes(buf)
}

/// True for viewer binary frames that are opaque input events.
pub fn is_input_event(data: &[u8]) -> bool {
    matches!(data.first(), Some(&INPUT_POINTER) | Some(&INPUT_KEY))
}

// --- Decoding (viewer side of the contract, used by tests and tools) ---

#[derive(Debug, Clone)]
pub enum Decoded {
    Video {
        keyframe: bool,
        timestamp_ms: i64,
        frame: VideoFrame,
    },
    Audio {
        data: Vec<u8>,
    },
}

#[derive(Debug, Clone)]
pub enum VideoFrame {
    Full {
        width: i32,
        height: i32,
        data: Vec<u8>,
    },
    Tiles(Vec<EncodedTile>),
}

pub fn decode_payload(buf: &[u8]) -> Result<Decoded, ProtocolError> {
    let need = |need: usize, have: usize| -> Result<(), ProtocolError> {
        if have < need {
            Err(ProtocolError::BufferTooShort { need, have })
        } else {
            Ok(())
        }
    };

    need(1, buf.len())?;
    let tag = buf[0];
    let mut cursor = &buf[1..];

    match tag {
        AUDIO => {
            need(4, cursor.remaining())?;
            let len = cursor.get_u32_le() as usize;
            need(len, cursor.remaining())?;
            Ok(Decoded::Audio {
                data: cursor[..len].to_vec(),
            })
        }
        DELTA | KEYFRAME => {
            need(12, cursor.remaining())?;
            let timestamp_ms = cursor.get_i64_le();
            let num_tiles = cursor.get_i32_le();
            if num_tiles < 0 {
                return Err(ProtocolError::NegativeLength(num_tiles));
            }

            let frame = if num_tiles == 0 {
                need(12, cursor.remaining())?;
                let width = cursor.get_i32_le();
                let height = cursor.get_i32_le();
                let len = cursor.get_i32_le();
                if len < 0 {
                    return Err(ProtocolError::NegativeLength(len));
                }
                need(len as usize, cursor.remaining())?;
                let data = cursor[..len as usize].to_vec();
                VideoFrame::Full {
                    width,
                    height,
                    data,
                }
            } else {
                let mut tiles = Vec::with_capacity(num_tiles as usize);
                for _ in 0..num_tiles {
                    need(20, cursor.remaining())?;
                    let x = cursor.get_i32_le();
                    let y = cursor.get_i32_le();
                    let w = cursor.get_i32_le();
                    let h = cursor.get_i32_le();
                    let len = cursor.get_i32_le();
                    if len < 0 {
                        return Err(ProtocolError::NegativeLength(len));
                    }
                    need(len as usize, cursor.remaining())?;
                    let data = cursor[..len as usize].to_vec();
                    cursor.advance(len as usize);
                    tiles.push(EncodedTile { x, y, w, h, data });
                }
                VideoFrame::Tiles(tiles)
            };

            Ok(Decoded::Video {
                keyframe: tag == KEYFRAME,
                timestamp_ms,
                frame,
            })
        }
        other => Err(ProtocolError::UnknownType(other)),
    }
}

// --- JSON text frames ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Info,
    Warning,
    Error,
}

/// Server-to-viewer text frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerText {
    #[serde(rename = "VERSION")]
    Version {
        version: String,
        monitor_id: u32,
        tier: Tier,
        language: String,
    },
    #[serde(rename = "SYS_EVENT")]
    SysEvent {
        message: String,
        level: EventLevel,
    },
    #[serde(rename = "CLIPBOARD")]
    Clipboard { text: String },
    #[serde(rename = "HEARTBEAT_ACK")]
    HeartbeatAck { timestamp: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backpressure {
    None,
    Heavy,
}

/// Telemetry a viewer reports back; missing fields take calm defaults so a
/// sparse report never reads as pressure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientStats {
    pub fps: f32,
    pub avg_decode_ms: f32,
    pub pending_tiles: u32,
    pub mode: String,
    pub battery: u32,
    pub is_charging: bool,
    pub bandwidth_kbps: f32,
    pub backpressure: Backpressure,
    pub device_name: String,
    pub focus_x: Option<i32>,
    pub focus_y: Option<i32>,
}

impl Default for ClientStats {
    fn default() -> Self {
        Self {
            fps: 60.0,
            avg_decode_ms: 0.0,
            pending_tiles: 0,
            mode: "NORMAL".to_string(),
            battery: 100,
            is_charging: true,
            bandwidth_kbps: 0.0,
            backpressure: Backpressure::None,
            device_name: "Unknown".to_string(),
            focus_x: None,
            focus_y: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DashboardCommand {
    SoftwareReset,
    ForceRefresh,
    SwitchMonitor,
}

/// Viewer-to-server text frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientText {
    #[serde(rename = "CLIENT_STATS")]
    ClientStats(ClientStats),
    #[serde(rename = "HEARTBEAT")]
    Heartbeat {
        #[serde(default)]
        timestamp: i64,
    },
    #[serde(rename = "DASHBOARD_IDENT")]
    DashboardIdent,
    #[serde(rename = "DASHBOARD_CMD")]
    DashboardCmd {
        command: DashboardCommand,
        #[serde(default)]
        monitor_id: u32,
    },
}
