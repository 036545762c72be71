//! # Wire codec
//!
//! The protocol's communication packets share a fixed envelope: a 4-byte
//! magic prefix, a 1-byte type code (an ASCII letter), a 1-byte protocol
//! version, a 32-byte correlation id, and a variable payload. All multi-byte
//! integers are network byte order.
//!
//! Decoders validate the prefix, the type, the version and every declared
//! length before touching the payload; a failed decode drops the packet at
//! the dispatcher, never the dispatch loop. Peer-list decoders are tolerant:
//! a truncated list yields the identities that fit and logs the shortfall.

use thiserror::Error;
use tracing::warn;

use crate::identity::{Destination, IdentityError, KEY_BLOCK_LEN};

/// Magic prefix of every communication packet.
pub const PACKET_PREFIX: [u8; 4] = [0x6D, 0x30, 0x52, 0xE9];

pub const PROTOCOL_V4: u8 = 4;
pub const PROTOCOL_V5: u8 = 5;

/// Envelope header: prefix + type + version + CID.
pub const HEADER_LEN: usize = 4 + 1 + 1 + 32;

/// 32-byte correlation id matching a request to its response.
pub type Cid = [u8; 32];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("packet truncated")]
    TruncatedPacket,
    #[error("unknown packet type {0:#04x}")]
    UnknownType(u8),
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown status code {0}")]
    UnknownStatus(u8),
    #[error("malformed identity: {0}")]
    MalformedIdentity(#[from] IdentityError),
}

/// Communication packet type codes (single ASCII letters on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    /// `R` — relay request (unimplemented by this node).
    Relay,
    /// `K` — relay return (unimplemented by this node).
    RelayReturn,
    /// `N` — generic response.
    Response,
    /// `A` — peer-list request.
    PeerListRequest,
    /// `Q` — retrieve a stored record.
    Retrieve,
    /// `Y` — deletion query.
    DeletionQuery,
    /// `S` — store a record.
    Store,
    /// `D` — email packet delete.
    EmailDelete,
    /// `X` — index entry delete.
    IndexDelete,
    /// `F` — find close peers (the legacy fetch code was retired in its favor).
    FindClosePeers,
}

impl PacketType {
    pub fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            b'R' => Self::Relay,
            b'K' => Self::RelayReturn,
            b'N' => Self::Response,
            b'A' => Self::PeerListRequest,
            b'Q' => Self::Retrieve,
            b'Y' => Self::DeletionQuery,
            b'S' => Self::Store,
            b'D' => Self::EmailDelete,
            b'X' => Self::IndexDelete,
            b'F' => Self::FindClosePeers,
            _ => return None,
        })
    }

    pub fn as_byte(self) -> u8 {
        match self {
            Self::Relay => b'R',
            Self::RelayReturn => b'K',
            Self::Response => b'N',
            Self::PeerListRequest => b'A',
            Self::Retrieve => b'Q',
            Self::DeletionQuery => b'Y',
            Self::Store => b'S',
            Self::EmailDelete => b'D',
            Self::IndexDelete => b'X',
            Self::FindClosePeers => b'F',
        }
    }
}

/// Stored record kinds, by data-type letter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    Index,
    Email,
    Contact,
}

impl RecordType {
    pub fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            b'I' => Self::Index,
            b'E' => Self::Email,
            b'C' => Self::Contact,
            _ => return None,
        })
    }

    pub fn as_byte(self) -> u8 {
        match self {
            Self::Index => b'I',
            Self::Email => b'E',
            Self::Contact => b'C',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok,
    GeneralError,
    NoDataFound,
    InvalidPacket,
    InvalidHashcash,
    InsufficientHashcash,
    NoDiskSpace,
}

impl StatusCode {
    pub fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0 => Self::Ok,
            1 => Self::GeneralError,
            2 => Self::NoDataFound,
            3 => Self::InvalidPacket,
            4 => Self::InvalidHashcash,
            5 => Self::InsufficientHashcash,
            6 => Self::NoDiskSpace,
            _ => return None,
        })
    }

    pub fn as_byte(self) -> u8 {
        match self {
            Self::Ok => 0,
            Self::GeneralError => 1,
            Self::NoDataFound => 2,
            Self::InvalidPacket => 3,
            Self::InvalidHashcash => 4,
            Self::InsufficientHashcash => 5,
            Self::NoDiskSpace => 6,
        }
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Ok => "OK",
            Self::GeneralError => "GENERAL_ERROR",
            Self::NoDataFound => "NO_DATA_FOUND",
            Self::InvalidPacket => "INVALID_PACKET",
            Self::InvalidHashcash => "INVALID_HASHCASH",
            Self::InsufficientHashcash => "INSUFFICIENT_HASHCASH",
            Self::NoDiskSpace => "NO_DISK_SPACE",
        };
        f.write_str(s)
    }
}

/// The generic envelope shared by every request and response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommPacket {
    pub packet_type: PacketType,
    pub version: u8,
    pub cid: Cid,
    pub payload: Vec<u8>,
}

impl CommPacket {
    pub fn new(packet_type: PacketType, version: u8, cid: Cid, payload: Vec<u8>) -> Self {
        Self {
            packet_type,
            version,
            cid,
            payload,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.extend_from_slice(&PACKET_PREFIX);
        out.push(self.packet_type.as_byte());
        out.push(self.version);
        out.extend_from_slice(&self.cid);
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < HEADER_LEN {
            return Err(CodecError::TruncatedPacket);
        }
        if buf[..4] != PACKET_PREFIX {
            return Err(CodecError::TruncatedPacket);
        }
        let packet_type = PacketType::from_byte(buf[4]).ok_or(CodecError::UnknownType(buf[4]))?;
        let version = buf[5];
        if version != PROTOCOL_V4 && version != PROTOCOL_V5 {
            return Err(CodecError::UnsupportedVersion(version));
        }
        let mut cid = [0u8; 32];
        cid.copy_from_slice(&buf[6..38]);
        Ok(Self {
            packet_type,
            version,
            cid,
            payload: buf[HEADER_LEN..].to_vec(),
        })
    }
}

/// Retrieve request payload: data-type letter + 32-byte key.
///
/// The data-type byte is kept raw so the server can answer INVALID_PACKET
/// for letters it does not know rather than failing the parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrieveRequest {
    pub data_type: u8,
    pub key: [u8; 32],
}

impl RetrieveRequest {
    pub fn new(record_type: RecordType, key: [u8; 32]) -> Self {
        Self {
            data_type: record_type.as_byte(),
            key,
        }
    }

    pub fn record_type(&self) -> Option<RecordType> {
        RecordType::from_byte(self.data_type)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(33);
        out.push(self.data_type);
        out.extend_from_slice(&self.key);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < 33 {
            return Err(CodecError::TruncatedPacket);
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&buf[1..33]);
        Ok(Self {
            data_type: buf[0],
            key,
        })
    }
}

/// Store request payload: hashcash token and the serialized record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreRequest {
    pub hashcash: Vec<u8>,
    pub data: Vec<u8>,
}

impl StoreRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.hashcash.len() + self.data.len());
        out.extend_from_slice(&(self.hashcash.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.hashcash);
        out.extend_from_slice(&(self.data.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.data);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < 2 {
            return Err(CodecError::TruncatedPacket);
        }
        let hc_len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
        let mut offset = 2;
        if buf.len() < offset + hc_len + 2 {
            return Err(CodecError::TruncatedPacket);
        }
        let hashcash = buf[offset..offset + hc_len].to_vec();
        offset += hc_len;
        let data_len = u16::from_be_bytes([buf[offset], buf[offset + 1]]) as usize;
        offset += 2;
        if buf.len() < offset + data_len {
            return Err(CodecError::TruncatedPacket);
        }
        Ok(Self {
            hashcash,
            data: buf[offset..offset + data_len].to_vec(),
        })
    }
}

/// Email delete payload: DHT key + delete authorization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailDeleteRequest {
    pub key: [u8; 32],
    pub delete_auth: [u8; 32],
}

impl EmailDeleteRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        out.extend_from_slice(&self.key);
        out.extend_from_slice(&self.delete_auth);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < 64 {
            return Err(CodecError::TruncatedPacket);
        }
        let mut key = [0u8; 32];
        let mut delete_auth = [0u8; 32];
        key.copy_from_slice(&buf[..32]);
        delete_auth.copy_from_slice(&buf[32..64]);
        Ok(Self { key, delete_auth })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexDeleteEntry {
    pub key: [u8; 32],
    pub delete_auth: [u8; 32],
}

/// Index delete payload: destination hash, entry count, entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDeleteRequest {
    pub dest_hash: [u8; 32],
    pub entries: Vec<IndexDeleteEntry>,
}

impl IndexDeleteRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(33 + self.entries.len() * 64);
        out.extend_from_slice(&self.dest_hash);
        out.push(self.entries.len() as u8);
        for entry in &self.entries {
            out.extend_from_slice(&entry.key);
            out.extend_from_slice(&entry.delete_auth);
        }
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < 33 {
            return Err(CodecError::TruncatedPacket);
        }
        let mut dest_hash = [0u8; 32];
        dest_hash.copy_from_slice(&buf[..32]);
        let count = buf[32] as usize;
        let mut offset = 33;
        if buf.len() < offset + count * 64 {
            return Err(CodecError::TruncatedPacket);
        }
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let mut key = [0u8; 32];
            let mut delete_auth = [0u8; 32];
            key.copy_from_slice(&buf[offset..offset + 32]);
            delete_auth.copy_from_slice(&buf[offset + 32..offset + 64]);
            entries.push(IndexDeleteEntry { key, delete_auth });
            offset += 64;
        }
        Ok(Self { dest_hash, entries })
    }
}

/// Find-close-peers payload: the 32-byte target key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindClosePeersRequest {
    pub key: [u8; 32],
}

impl FindClosePeersRequest {
    pub fn encode(&self) -> Vec<u8> {
        self.key.to_vec()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < 32 {
            return Err(CodecError::TruncatedPacket);
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&buf[..32]);
        Ok(Self { key })
    }
}

/// Generic response payload: status byte, u16 length, data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponsePacket {
    pub status: StatusCode,
    pub data: Vec<u8>,
}

impl ResponsePacket {
    pub fn new(status: StatusCode, data: Vec<u8>) -> Self {
        Self { status, data }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(3 + self.data.len());
        out.push(self.status.as_byte());
        out.extend_from_slice(&(self.data.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.data);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < 3 {
            return Err(CodecError::TruncatedPacket);
        }
        let status = StatusCode::from_byte(buf[0]).ok_or(CodecError::UnknownStatus(buf[0]))?;
        let data_len = u16::from_be_bytes([buf[1], buf[2]]) as usize;
        if buf.len() < 3 + data_len {
            return Err(CodecError::TruncatedPacket);
        }
        Ok(Self {
            status,
            data: buf[3..3 + data_len].to_vec(),
        })
    }
}

pub const PEER_LIST_MARKER: u8 = b'L';

/// Marker bytes a peer-list payload may start with; both dialects appear in
/// the wild.
pub fn is_peer_list_marker(b: u8) -> bool {
    b == b'L' || b == b'P'
}

/// A peer list as carried in find-close-peers and peer-list responses.
///
/// Version 4 serializes each identity as its bare 384-byte key block (the
/// decoder appends the null certificate); version 5 identities carry their
/// certificate and are self-delimiting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerList {
    pub peers: Vec<Destination>,
}

impl PeerList {
    pub fn new(peers: Vec<Destination>) -> Self {
        Self { peers }
    }

    pub fn encode(&self, version: u8) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(PEER_LIST_MARKER);
        out.push(version);
        out.extend_from_slice(&(self.peers.len() as u16).to_be_bytes());
        for peer in &self.peers {
            if version == PROTOCOL_V4 {
                out.extend_from_slice(peer.key_block());
            } else {
                out.extend_from_slice(peer.as_bytes());
            }
        }
        out
    }

    /// Decode a peer list, dispatching on the embedded version byte.
    ///
    /// Truncation inside the identity array is non-fatal: the peers decoded
    /// so far are returned and the shortfall logged, matching the tolerant
    /// readers deployed in the wild.
    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < 4 {
            return Err(CodecError::TruncatedPacket);
        }
        if !is_peer_list_marker(buf[0]) {
            return Err(CodecError::UnknownType(buf[0]));
        }
        let version = buf[1];
        let count = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        let mut offset = 4;
        let mut peers = Vec::with_capacity(count.min(1024));

        match version {
            PROTOCOL_V4 => {
                for i in 0..count {
                    if offset == buf.len() {
                        warn!(expected = count, decoded = i, "peer list ends early");
                        break;
                    }
                    if offset + KEY_BLOCK_LEN > buf.len() {
                        warn!(expected = count, decoded = i, "incomplete peer list entry");
                        break;
                    }
                    match Destination::from_key_block(&buf[offset..offset + KEY_BLOCK_LEN]) {
                        Ok(dest) => peers.push(dest),
                        Err(e) => {
                            warn!(error = %e, "skipping malformed v4 identity");
                        }
                    }
                    offset += KEY_BLOCK_LEN;
                }
            }
            PROTOCOL_V5 => {
                for i in 0..count {
                    if offset >= buf.len() {
                        warn!(expected = count, decoded = i, "peer list ends early");
                        break;
                    }
                    match Destination::from_bytes(&buf[offset..]) {
                        Ok((dest, consumed)) => {
                            peers.push(dest);
                            offset += consumed;
                        }
                        Err(e) => {
                            warn!(expected = count, decoded = i, error = %e, "incomplete peer list entry");
                            break;
                        }
                    }
                }
            }
            other => return Err(CodecError::UnsupportedVersion(other)),
        }

        Ok(Self { peers })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    /// DHT key of the stored email packet.
    pub key: [u8; 32],
    /// SHA-256 of the packet's delete authorization.
    pub delete_hash: [u8; 32],
    /// Seconds since the epoch when the entry was stored.
    pub time: u32,
}

/// Index record stored under a recipient's identity hash, listing the DHT
/// keys of email packets addressed to them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexPacket {
    pub dest_hash: [u8; 32],
    pub entries: Vec<IndexEntry>,
}

impl IndexPacket {
    pub const MARKER: u8 = b'I';

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(35 + self.entries.len() * 68);
        out.push(Self::MARKER);
        out.push(PROTOCOL_V4);
        out.extend_from_slice(&self.dest_hash);
        out.push(self.entries.len() as u8);
        for entry in &self.entries {
            out.extend_from_slice(&entry.key);
            out.extend_from_slice(&entry.delete_hash);
            out.extend_from_slice(&entry.time.to_be_bytes());
        }
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < 35 {
            return Err(CodecError::TruncatedPacket);
        }
        if buf[0] != Self::MARKER {
            return Err(CodecError::UnknownType(buf[0]));
        }
        if buf[1] != PROTOCOL_V4 {
            return Err(CodecError::UnsupportedVersion(buf[1]));
        }
        let mut dest_hash = [0u8; 32];
        dest_hash.copy_from_slice(&buf[2..34]);
        let count = buf[34] as usize;
        let mut offset = 35;
        if buf.len() < offset + count * 68 {
            return Err(CodecError::TruncatedPacket);
        }
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let mut key = [0u8; 32];
            let mut delete_hash = [0u8; 32];
            key.copy_from_slice(&buf[offset..offset + 32]);
            delete_hash.copy_from_slice(&buf[offset + 32..offset + 64]);
            let time = u32::from_be_bytes([
                buf[offset + 64],
                buf[offset + 65],
                buf[offset + 66],
                buf[offset + 67],
            ]);
            entries.push(IndexEntry {
                key,
                delete_hash,
                time,
            });
            offset += 68;
        }
        Ok(Self { dest_hash, entries })
    }
}

/// Encrypted email record: the ciphertext plus the envelope fields the DHT
/// needs (key, delete hash, algorithm, stored time).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailEncryptedPacket {
    pub key: [u8; 32],
    pub delete_hash: [u8; 32],
    pub algorithm: u8,
    pub stored_time: u32,
    pub ciphertext: Vec<u8>,
}

impl EmailEncryptedPacket {
    pub const MARKER: u8 = b'E';

    /// DHT key of an email packet: SHA-256 of the 2-byte big-endian
    /// ciphertext length followed by the ciphertext.
    pub fn compute_key(ciphertext: &[u8]) -> [u8; 32] {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update((ciphertext.len() as u16).to_be_bytes());
        hasher.update(ciphertext);
        let digest = hasher.finalize();
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        out
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(73 + self.ciphertext.len());
        out.push(Self::MARKER);
        out.push(PROTOCOL_V4);
        out.extend_from_slice(&self.key);
        out.extend_from_slice(&self.delete_hash);
        out.push(self.algorithm);
        out.extend_from_slice(&self.stored_time.to_be_bytes());
        out.extend_from_slice(&(self.ciphertext.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.ciphertext);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < 73 {
            return Err(CodecError::TruncatedPacket);
        }
        if buf[0] != Self::MARKER {
            return Err(CodecError::UnknownType(buf[0]));
        }
        if buf[1] != PROTOCOL_V4 {
            return Err(CodecError::UnsupportedVersion(buf[1]));
        }
        let mut key = [0u8; 32];
        let mut delete_hash = [0u8; 32];
        key.copy_from_slice(&buf[2..34]);
        delete_hash.copy_from_slice(&buf[34..66]);
        let algorithm = buf[66];
        let stored_time = u32::from_be_bytes([buf[67], buf[68], buf[69], buf[70]]);
        let len = u16::from_be_bytes([buf[71], buf[72]]) as usize;
        if buf.len() < 73 + len {
            return Err(CodecError::TruncatedPacket);
        }
        Ok(Self {
            key,
            delete_hash,
            algorithm,
            stored_time,
            ciphertext: buf[73..73 + len].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::test_destination;

    fn make_cid(seed: u8) -> Cid {
        [seed; 32]
    }

    #[test]
    fn comm_packet_round_trip() {
        let packet = CommPacket::new(
            PacketType::Retrieve,
            PROTOCOL_V4,
            make_cid(7),
            vec![1, 2, 3],
        );
        let bytes = packet.encode();
        assert_eq!(CommPacket::decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn comm_packet_rejects_bad_envelope() {
        let packet = CommPacket::new(PacketType::Store, PROTOCOL_V4, make_cid(1), vec![]);
        let mut bytes = packet.encode();

        assert_eq!(
            CommPacket::decode(&bytes[..HEADER_LEN - 1]),
            Err(CodecError::TruncatedPacket)
        );

        bytes[4] = b'Z';
        assert_eq!(
            CommPacket::decode(&bytes),
            Err(CodecError::UnknownType(b'Z'))
        );

        bytes[4] = b'S';
        bytes[5] = 9;
        assert_eq!(
            CommPacket::decode(&bytes),
            Err(CodecError::UnsupportedVersion(9))
        );
    }

    #[test]
    fn retrieve_round_trip_and_unknown_data_type() {
        let req = RetrieveRequest::new(RecordType::Email, [9u8; 32]);
        let decoded = RetrieveRequest::decode(&req.encode()).unwrap();
        assert_eq!(decoded, req);
        assert_eq!(decoded.record_type(), Some(RecordType::Email));

        let odd = RetrieveRequest {
            data_type: b'Z',
            key: [0u8; 32],
        };
        let decoded = RetrieveRequest::decode(&odd.encode()).unwrap();
        assert_eq!(decoded.record_type(), None);
    }

    #[test]
    fn store_round_trip_and_truncation() {
        let req = StoreRequest {
            hashcash: b"1:20:stamp".to_vec(),
            data: vec![0xAB; 100],
        };
        let bytes = req.encode();
        assert_eq!(StoreRequest::decode(&bytes).unwrap(), req);

        // data length claims more than the buffer holds
        let mut lying = req.encode();
        let hc_end = 2 + req.hashcash.len();
        lying[hc_end..hc_end + 2].copy_from_slice(&1000u16.to_be_bytes());
        assert_eq!(StoreRequest::decode(&lying), Err(CodecError::TruncatedPacket));
    }

    #[test]
    fn delete_requests_round_trip() {
        let email = EmailDeleteRequest {
            key: [1u8; 32],
            delete_auth: [2u8; 32],
        };
        assert_eq!(EmailDeleteRequest::decode(&email.encode()).unwrap(), email);

        let index = IndexDeleteRequest {
            dest_hash: [3u8; 32],
            entries: vec![
                IndexDeleteEntry {
                    key: [4u8; 32],
                    delete_auth: [5u8; 32],
                },
                IndexDeleteEntry {
                    key: [6u8; 32],
                    delete_auth: [7u8; 32],
                },
            ],
        };
        let decoded = IndexDeleteRequest::decode(&index.encode()).unwrap();
        assert_eq!(decoded, index);
        // entries come back in transmission order
        assert_eq!(decoded.entries[0].key, [4u8; 32]);
        assert_eq!(decoded.entries[1].key, [6u8; 32]);
    }

    #[test]
    fn response_round_trip_all_statuses() {
        for status in [
            StatusCode::Ok,
            StatusCode::GeneralError,
            StatusCode::NoDataFound,
            StatusCode::InvalidPacket,
            StatusCode::InvalidHashcash,
            StatusCode::InsufficientHashcash,
            StatusCode::NoDiskSpace,
        ] {
            let resp = ResponsePacket::new(status, vec![1, 2, 3, 4]);
            assert_eq!(ResponsePacket::decode(&resp.encode()).unwrap(), resp);
        }
    }

    #[test]
    fn response_with_lying_length_is_truncated() {
        let mut bytes = ResponsePacket::new(StatusCode::Ok, vec![1, 2]).encode();
        bytes[1..3].copy_from_slice(&500u16.to_be_bytes());
        assert_eq!(
            ResponsePacket::decode(&bytes),
            Err(CodecError::TruncatedPacket)
        );
    }

    #[test]
    fn peer_list_v4_round_trip_preserves_order() {
        let peers = vec![
            test_destination(1),
            test_destination(2),
            test_destination(3),
        ];
        let list = PeerList::new(peers.clone());
        let bytes = list.encode(PROTOCOL_V4);
        let decoded = PeerList::decode(&bytes).unwrap();
        assert_eq!(decoded.peers.len(), 3);
        for (got, want) in decoded.peers.iter().zip(&peers) {
            assert_eq!(got, want);
        }
    }

    #[test]
    fn peer_list_v5_round_trip() {
        let list = PeerList::new(vec![test_destination(0x11), test_destination(0x22)]);
        let bytes = list.encode(PROTOCOL_V5);
        let decoded = PeerList::decode(&bytes).unwrap();
        assert_eq!(decoded, list);
    }

    #[test]
    fn peer_list_tolerates_truncation() {
        let list = PeerList::new(vec![test_destination(1), test_destination(2)]);
        let bytes = list.encode(PROTOCOL_V4);
        // cut into the second identity
        let cut = &bytes[..bytes.len() - 10];
        let decoded = PeerList::decode(cut).unwrap();
        assert_eq!(decoded.peers.len(), 1);

        let bytes = list.encode(PROTOCOL_V5);
        let cut = &bytes[..bytes.len() - 10];
        let decoded = PeerList::decode(cut).unwrap();
        assert_eq!(decoded.peers.len(), 1);
    }

    #[test]
    fn peer_list_empty_contributes_nothing() {
        let bytes = PeerList::new(vec![]).encode(PROTOCOL_V5);
        let decoded = PeerList::decode(&bytes).unwrap();
        assert!(decoded.peers.is_empty());
    }

    #[test]
    fn index_packet_round_trip() {
        let packet = IndexPacket {
            dest_hash: [8u8; 32],
            entries: vec![IndexEntry {
                key: [9u8; 32],
                delete_hash: [10u8; 32],
                time: 1_700_000_000,
            }],
        };
        assert_eq!(IndexPacket::decode(&packet.encode()).unwrap(), packet);
    }

    #[test]
    fn email_packet_round_trip_and_key() {
        let ciphertext = vec![0x5A; 200];
        let key = EmailEncryptedPacket::compute_key(&ciphertext);
        let packet = EmailEncryptedPacket {
            key,
            delete_hash: [11u8; 32],
            algorithm: 2,
            stored_time: 0,
            ciphertext,
        };
        let decoded = EmailEncryptedPacket::decode(&packet.encode()).unwrap();
        assert_eq!(decoded, packet);
        assert_eq!(
            EmailEncryptedPacket::compute_key(&decoded.ciphertext),
            decoded.key
        );
    }
}
