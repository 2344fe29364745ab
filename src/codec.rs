//! Length-prefixed framing, varints, and the handful of typed packet shapes
//! the proxy actually needs to understand: handshake, status request/response,
//! status ping, login-start, and disconnect.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::chat::ChatMessage;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed varint")]
    MalformedVarint,
    #[error("empty packet")]
    EmptyPacket,
    #[error("invalid packet id: expected {expected}, found {found}")]
    UnexpectedId { expected: u32, found: u32 },
    #[error("unexpected trailing data ({0} bytes)")]
    TrailingData(usize),
    #[error("truncated field")]
    Truncated,
    #[error("invalid next_state: {0}")]
    InvalidNextState(u32),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("status ping payload must be exactly 8 bytes, found {0}")]
    BadPingLength(usize),
}

/// A decoded-but-not-yet-typed packet: just the id and the remaining payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPacket {
    pub id: u32,
    pub payload: Vec<u8>,
}

/// What `read_initial` found before any framed decoding was attempted.
pub enum Initial {
    Packet(RawPacket),
    /// A pre-1.7 client, identified by its leading byte (`0xFE` or `0x02`).
    OldClient(u8),
}

/// Reads an unsigned LEB128 varint from `buf`, returning `(value, bytes_consumed)`.
/// Little-endian 7-bit groups, continuation bit 0x80, at most 5 bytes for a
/// 32-bit value.
fn decode_varint(buf: &[u8]) -> Result<(u32, usize), CodecError> {
    let mut result: u32 = 0;
    for (i, &byte) in buf.iter().enumerate() {
        if i >= 5 {
            return Err(CodecError::MalformedVarint);
        }
        result |= ((byte & 0x7F) as u32) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((result, i + 1));
        }
    }
    Err(CodecError::MalformedVarint)
}

pub fn encode_varint(mut value: u32, out: &mut Vec<u8>) {
    loop {
        if value & !0x7F == 0 {
            out.push(value as u8);
            return;
        }
        out.push(((value & 0x7F) | 0x80) as u8);
        value >>= 7;
    }
}

async fn read_varint_async<R: AsyncRead + Unpin>(stream: &mut R) -> Result<u32, CodecError> {
    let mut result: u32 = 0;
    for i in 0..5 {
        let byte = stream.read_u8().await?;
        result |= ((byte & 0x7F) as u32) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(result);
        }
    }
    Err(CodecError::MalformedVarint)
}

/// Reads one byte without consuming it, so the caller can branch on legacy
/// (`0xFE`/`0x02`) clients before attempting framed decoding.
pub async fn read_initial<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Initial, CodecError> {
    let first = stream.read_u8().await?;
    if first == 0xFE || first == 0x02 {
        return Ok(Initial::OldClient(first));
    }
    let packet = read_packet_with_first_byte(stream, first).await?;
    Ok(Initial::Packet(packet))
}

async fn read_packet_with_first_byte<R: AsyncRead + Unpin>(
    stream: &mut R,
    first_len_byte: u8,
) -> Result<RawPacket, CodecError> {
    let length = if first_len_byte & 0x80 == 0 {
        first_len_byte as u32
    } else {
        let mut result = (first_len_byte & 0x7F) as u32;
        let mut shift = 7;
        loop {
            let byte = stream.read_u8().await?;
            result |= ((byte & 0x7F) as u32) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
            if shift >= 35 {
                return Err(CodecError::MalformedVarint);
            }
        }
        result
    };
    read_body(stream, length).await
}

pub async fn read_packet<R: AsyncRead + Unpin>(stream: &mut R) -> Result<RawPacket, CodecError> {
    let length = read_varint_async(stream).await?;
    read_body(stream, length).await
}

async fn read_body<R: AsyncRead + Unpin>(
    stream: &mut R,
    length: u32,
) -> Result<RawPacket, CodecError> {
    if length == 0 {
        return Err(CodecError::EmptyPacket);
    }
    let mut buf = vec![0u8; length as usize];
    stream.read_exact(&mut buf).await?;
    let (id, consumed) = decode_varint(&buf)?;
    Ok(RawPacket {
        id,
        payload: buf[consumed..].to_vec(),
    })
}

pub fn write_raw(packet: &RawPacket) -> Vec<u8> {
    let mut body = Vec::with_capacity(packet.payload.len() + 5);
    encode_varint(packet.id, &mut body);
    body.extend_from_slice(&packet.payload);
    let mut framed = Vec::with_capacity(body.len() + 5);
    encode_varint(body.len() as u32, &mut framed);
    framed.extend_from_slice(&body);
    framed
}

pub async fn write_packet<W: AsyncWrite + Unpin>(
    stream: &mut W,
    packet: &RawPacket,
) -> Result<(), CodecError> {
    stream.write_all(&write_raw(packet)).await?;
    Ok(())
}

fn write_mc_string(s: &str, out: &mut Vec<u8>) {
    encode_varint(s.len() as u32, out);
    out.extend_from_slice(s.as_bytes());
}

fn read_mc_string(buf: &[u8]) -> Result<(String, usize), CodecError> {
    let (len, off) = decode_varint(buf)?;
    let len = len as usize;
    let rest = &buf[off..];
    if rest.len() < len {
        return Err(CodecError::Truncated);
    }
    let s = std::str::from_utf8(&rest[..len])
        .map_err(|_| CodecError::Truncated)?
        .to_owned();
    Ok((s, off + len))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextState {
    Status,
    Login,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub proto: u32,
    pub server_addr: String,
    pub server_port: u16,
    pub next_state: NextState,
}

impl Handshake {
    pub fn decode(packet: &RawPacket) -> Result<Self, CodecError> {
        if packet.id != 0 {
            return Err(CodecError::UnexpectedId {
                expected: 0,
                found: packet.id,
            });
        }
        let payload = &packet.payload;
        let (proto, l) = decode_varint(payload)?;
        let mut offset = l;
        let (server_addr, l) = read_mc_string(&payload[offset..])?;
        offset += l;
        if payload.len() < offset + 2 {
            return Err(CodecError::Truncated);
        }
        let server_port = u16::from_be_bytes([payload[offset], payload[offset + 1]]);
        offset += 2;
        let (next_state_raw, l) = decode_varint(&payload[offset..])?;
        offset += l;
        if offset != payload.len() {
            return Err(CodecError::TrailingData(payload.len() - offset));
        }
        let next_state = match next_state_raw {
            1 => NextState::Status,
            2 => NextState::Login,
            other => return Err(CodecError::InvalidNextState(other)),
        };
        Ok(Handshake {
            proto,
            server_addr,
            server_port,
            next_state,
        })
    }

    pub fn encode(&self) -> RawPacket {
        let mut payload = Vec::new();
        encode_varint(self.proto, &mut payload);
        write_mc_string(&self.server_addr, &mut payload);
        payload.extend_from_slice(&self.server_port.to_be_bytes());
        let next_state = match self.next_state {
            NextState::Status => 1,
            NextState::Login => 2,
        };
        encode_varint(next_state, &mut payload);
        RawPacket { id: 0, payload }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusRequest;

impl StatusRequest {
    pub fn decode(packet: &RawPacket) -> Result<Self, CodecError> {
        if packet.id != 0 {
            return Err(CodecError::UnexpectedId {
                expected: 0,
                found: packet.id,
            });
        }
        if !packet.payload.is_empty() {
            return Err(CodecError::TrailingData(packet.payload.len()));
        }
        Ok(StatusRequest)
    }

    pub fn encode(&self) -> RawPacket {
        RawPacket {
            id: 0,
            payload: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusPing(pub [u8; 8]);

impl StatusPing {
    pub fn decode(packet: &RawPacket) -> Result<Self, CodecError> {
        if packet.id != 1 {
            return Err(CodecError::UnexpectedId {
                expected: 1,
                found: packet.id,
            });
        }
        if packet.payload.len() != 8 {
            return Err(CodecError::BadPingLength(packet.payload.len()));
        }
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&packet.payload);
        Ok(StatusPing(buf))
    }

    pub fn encode(&self) -> RawPacket {
        RawPacket {
            id: 1,
            payload: self.0.to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginStart {
    pub name: String,
}

impl LoginStart {
    pub fn decode(packet: &RawPacket) -> Result<Self, CodecError> {
        if packet.id != 0 {
            return Err(CodecError::UnexpectedId {
                expected: 0,
                found: packet.id,
            });
        }
        let (name, consumed) = read_mc_string(&packet.payload)?;
        if consumed != packet.payload.len() {
            return Err(CodecError::TrailingData(packet.payload.len() - consumed));
        }
        Ok(LoginStart { name })
    }

    pub fn encode(&self) -> RawPacket {
        let mut payload = Vec::new();
        write_mc_string(&self.name, &mut payload);
        RawPacket { id: 0, payload }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionInfo {
    pub name: String,
    pub protocol: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayersInfo {
    pub max: i32,
    pub online: i32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sample: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub version: VersionInfo,
    pub players: PlayersInfo,
    pub description: ChatMessage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub favicon: Option<String>,
}

/// Intermediate shape used only to retry decoding when `description` turns
/// out to be a bare string instead of a chat-message object.
#[derive(Deserialize)]
struct StatusResponseLoose {
    version: VersionInfo,
    players: PlayersInfo,
    description: serde_json::Value,
    #[serde(default)]
    favicon: Option<String>,
}

impl StatusResponse {
    pub fn decode(packet: &RawPacket) -> Result<Self, CodecError> {
        if packet.id != 0 {
            return Err(CodecError::UnexpectedId {
                expected: 0,
                found: packet.id,
            });
        }
        let (json_str, consumed) = read_mc_string(&packet.payload)?;
        if consumed != packet.payload.len() {
            return Err(CodecError::TrailingData(packet.payload.len() - consumed));
        }
        match serde_json::from_str::<StatusResponse>(&json_str) {
            Ok(resp) => Ok(resp),
            Err(_) => {
                // description may be a bare string on some upstreams; retry loosely.
                let loose: StatusResponseLoose = serde_json::from_str(&json_str)?;
                let description = match loose.description {
                    serde_json::Value::String(text) => ChatMessage::new(text),
                    other => serde_json::from_value(other)?,
                };
                Ok(StatusResponse {
                    version: loose.version,
                    players: loose.players,
                    description,
                    favicon: loose.favicon,
                })
            }
        }
    }

    pub fn encode(&self) -> Result<RawPacket, CodecError> {
        let json_str = serde_json::to_string(self)?;
        let mut payload = Vec::new();
        write_mc_string(&json_str, &mut payload);
        Ok(RawPacket { id: 0, payload })
    }
}

/// Login-state disconnect ("kick"): a single packet carrying a chat message,
/// then the socket is closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnect(pub ChatMessage);

impl Disconnect {
    pub fn encode(&self) -> Result<RawPacket, CodecError> {
        let json_str = serde_json::to_string(&self.0)?;
        let mut payload = Vec::new();
        write_mc_string(&json_str, &mut payload);
        Ok(RawPacket { id: 0, payload })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ping_handshake_decodes_and_round_trips() {
        let bytes: &[u8] = &[
            0x13, 0x00, 0x2F, 0x0D, 0x73, 0x65, 0x72, 0x76, 0x65, 0x72, 0x31, 0x2E, 0x6C, 0x6F,
            0x63, 0x61, 0x6C, 0x63, 0xDD, 0x01,
        ];
        let mut cursor = std::io::Cursor::new(bytes);
        let packet = read_packet(&mut cursor).await.unwrap();
        let handshake = Handshake::decode(&packet).unwrap();
        assert_eq!(handshake.proto, 47);
        assert_eq!(handshake.server_addr, "server1.local");
        assert_eq!(handshake.server_port, 25565);
        assert_eq!(handshake.next_state, NextState::Status);

        let re_encoded = write_raw(&handshake.encode());
        assert_eq!(re_encoded, bytes);
    }

    #[tokio::test]
    async fn login_handshake_handles_utf8() {
        let bytes: &[u8] = &[
            0x16, 0x00, 0x2F, 0x10, 0x73, 0x65, 0x72, 0x76, 0x65, 0x72, 0x32, 0x2E, 0x6C, 0x6F,
            0x63, 0x61, 0x6C, 0xE4, 0xB8, 0xAD, 0x63, 0xDD, 0x02,
        ];
        let mut cursor = std::io::Cursor::new(bytes);
        let packet = read_packet(&mut cursor).await.unwrap();
        let handshake = Handshake::decode(&packet).unwrap();
        assert_eq!(handshake.server_addr, "server2.local中");
        assert_eq!(handshake.next_state, NextState::Login);
        assert_eq!(write_raw(&handshake.encode()), bytes);
    }

    #[tokio::test]
    async fn legacy_client_is_detected_without_varint_parsing() {
        let bytes: &[u8] = &[0xFE, 0x01];
        let mut cursor = std::io::Cursor::new(bytes);
        match read_initial(&mut cursor).await.unwrap() {
            Initial::OldClient(b) => assert_eq!(b, 0xFE),
            Initial::Packet(_) => panic!("expected legacy client detection"),
        }
    }

    #[test]
    fn write_mc_string_length_prefixes_utf8_bytes() {
        let mut out = Vec::new();
        write_mc_string("012", &mut out);
        assert_eq!(out, vec![0x03, 0x30, 0x31, 0x32]);
    }

    #[test]
    fn raw_packet_round_trips_through_write_raw() {
        let packet = RawPacket {
            id: 3,
            payload: vec![1, 2, 3, 4, 5],
        };
        let bytes = write_raw(&packet);
        // Fully drive it back through the synchronous decode path.
        let (len, off) = decode_varint(&bytes).unwrap();
        let body = &bytes[off..off + len as usize];
        let (id, id_len) = decode_varint(body).unwrap();
        assert_eq!(id, packet.id);
        assert_eq!(&body[id_len..], &packet.payload[..]);
    }

    #[test]
    fn status_response_accepts_bare_string_description() {
        let json = r#"{"version":{"name":"x","protocol":1},"players":{"max":1,"online":0},"description":"hello"}"#;
        let mut payload = Vec::new();
        write_mc_string(json, &mut payload);
        let packet = RawPacket { id: 0, payload };
        let resp = StatusResponse::decode(&packet).unwrap();
        assert_eq!(resp.description.text, "hello");
    }

    #[test]
    fn status_response_rejects_unrelated_json_errors() {
        let json = r#"{"version":{"name":"x"},"players":{}}"#;
        let mut payload = Vec::new();
        write_mc_string(json, &mut payload);
        let packet = RawPacket { id: 0, payload };
        assert!(StatusResponse::decode(&packet).is_err());
    }
}
