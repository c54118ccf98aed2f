//! Packet headers, sub-record framing and the size budget shared by both
//! sides of the protocol.
//!
//! Every datagram starts with a one-byte header. Update packets then carry
//! a stream of sub-records, each introduced by a [`NetObject`] byte and
//! terminated by a mandatory [`NetObject::EndOfMessage`]. Record bodies are
//! length-prefixed bincode blobs, which keeps the stream self-delimiting:
//! a body that fails to decode is skipped by its declared length instead of
//! stalling the rest of the packet.

use log::warn;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Transport MTU ceiling for a single outbound datagram.
pub const MTU: usize = 1200;
/// Safety margin subtracted from the MTU when filling a packet.
pub const MTU_SAFETY_MARGIN: usize = 20;
/// Maximum number of entity events encoded into one batch.
pub const MAX_EVENTS_PER_WRITE: usize = 20;
/// Maximum number of chat messages written into one packet.
pub const MAX_CHAT_MESSAGES_PER_PACKET: usize = 10;
/// Outbound sync interval in milliseconds.
pub const UPDATE_INTERVAL_MS: u64 = 150;
/// Protocol version checked during the auth handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// First byte of every client-to-server datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClientPacketHeader {
    RequestAuth = 1,
    RequestInit = 2,
    ResponseStartGame = 3,
    UpdateLobby = 4,
    UpdateIngame = 5,
    ServerCommand = 6,
    FileRequest = 7,
    Disconnect = 8,
}

impl ClientPacketHeader {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::RequestAuth),
            2 => Some(Self::RequestInit),
            3 => Some(Self::ResponseStartGame),
            4 => Some(Self::UpdateLobby),
            5 => Some(Self::UpdateIngame),
            6 => Some(Self::ServerCommand),
            7 => Some(Self::FileRequest),
            8 => Some(Self::Disconnect),
            _ => None,
        }
    }
}

/// First byte of every server-to-client datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerPacketHeader {
    AuthResponse = 1,
    LobbyUpdate = 2,
    IngameUpdate = 3,
    StartGame = 4,
    EndGame = 5,
    FileTransfer = 6,
    Disconnect = 7,
}

impl ServerPacketHeader {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::AuthResponse),
            2 => Some(Self::LobbyUpdate),
            3 => Some(Self::IngameUpdate),
            4 => Some(Self::StartGame),
            5 => Some(Self::EndGame),
            6 => Some(Self::FileTransfer),
            7 => Some(Self::Disconnect),
            _ => None,
        }
    }
}

/// Object-kind byte delimiting sub-records inside update payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NetObject {
    SyncIds = 1,
    ChatMessage = 2,
    EntityState = 3,
    EntityEventInitial = 4,
    EntityPosition = 5,
    Vote = 6,
    LobbyState = 7,
    EndOfMessage = 8,
}

impl NetObject {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::SyncIds),
            2 => Some(Self::ChatMessage),
            3 => Some(Self::EntityState),
            4 => Some(Self::EntityEventInitial),
            5 => Some(Self::EntityPosition),
            6 => Some(Self::Vote),
            7 => Some(Self::LobbyState),
            8 => Some(Self::EndOfMessage),
            _ => None,
        }
    }
}

/// Assembles an outbound datagram: header byte, raw fields and
/// length-prefixed bincode bodies.
#[derive(Debug)]
pub struct PacketWriter {
    buf: Vec<u8>,
}

impl PacketWriter {
    pub fn client(header: ClientPacketHeader) -> Self {
        Self {
            buf: vec![header as u8],
        }
    }

    pub fn server(header: ServerPacketHeader) -> Self {
        Self {
            buf: vec![header as u8],
        }
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_object(&mut self, kind: NetObject) {
        self.buf.push(kind as u8);
    }

    /// Writes a record body as a u16-length-prefixed bincode blob.
    pub fn write_body<T: Serialize>(&mut self, body: &T) -> Result<(), bincode::Error> {
        let data = bincode::serialize(body)?;
        debug_assert!(data.len() <= u16::MAX as usize);
        self.buf.extend_from_slice(&(data.len() as u16).to_le_bytes());
        self.buf.extend_from_slice(&data);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Terminates the sub-record stream and returns the finished datagram.
    pub fn finish(mut self) -> Vec<u8> {
        self.buf.push(NetObject::EndOfMessage as u8);
        self.buf
    }

    /// Returns the datagram without an end-of-message terminator, for
    /// single-body packets (auth responses, handshakes).
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor over an inbound datagram.
#[derive(Debug)]
pub struct PacketReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    pub fn read_u8(&mut self) -> Option<u8> {
        let byte = *self.buf.get(self.pos)?;
        self.pos += 1;
        Some(byte)
    }

    pub fn read_u16(&mut self) -> Option<u16> {
        let bytes = self.buf.get(self.pos..self.pos + 2)?;
        self.pos += 2;
        Some(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_u64(&mut self) -> Option<u64> {
        let bytes = self.buf.get(self.pos..self.pos + 8)?;
        self.pos += 8;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(bytes);
        Some(u64::from_le_bytes(arr))
    }

    pub fn read_bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        let bytes = self.buf.get(self.pos..self.pos + len)?;
        self.pos += len;
        Some(bytes)
    }

    pub fn skip(&mut self, len: usize) -> bool {
        if self.remaining() < len {
            self.pos = self.buf.len();
            return false;
        }
        self.pos += len;
        true
    }

    /// Skips over a length-prefixed body without decoding it.
    pub fn skip_body(&mut self) -> bool {
        match self.read_u16() {
            Some(len) => self.skip(len as usize),
            None => false,
        }
    }

    /// Reads a length-prefixed bincode body.
    ///
    /// The cursor always advances past the declared length, so a body that
    /// fails to decode is skipped without desynchronizing the stream.
    pub fn read_body<T: DeserializeOwned>(&mut self) -> Option<T> {
        let len = self.read_u16()? as usize;
        let data = self.read_bytes(len)?;
        match bincode::deserialize(data) {
            Ok(body) => Some(body),
            Err(e) => {
                warn!("Failed to decode a {}-byte record body: {}", len, e);
                None
            }
        }
    }
}
