// Wire format primitives: security envelope framing, commands, TLV encoding.
// Numan Thabit 2025

use std::convert::TryFrom;

use thiserror::Error;

use crate::types::{Challenge, LeaderData, Rloc16, CHALLENGE_LEN};

/// Security suite byte leading every datagram.
pub const SUITE_154: u8 = 0x00;
pub const SUITE_NONE: u8 = 0xFF;

/// Length of the security header in bytes.
pub const SECURITY_HEADER_LEN: usize = 10;

/// Security control byte: level 5 (ENC-MIC-32), key id mode 2.
pub const SECURITY_CONTROL: u8 = 0x15;

/// Security level encoded in [`SECURITY_CONTROL`], used in nonce construction.
pub const SECURITY_LEVEL: u8 = 5;

const TLV_EXTENDED_LENGTH: u8 = 0xFF;

/// Wire-level error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    /// Buffer shorter than required.
    #[error("buffer too short: expected at least {expected} bytes, got {actual}")]
    BufferTooShort { expected: usize, actual: usize },

    /// Unknown security suite byte.
    #[error("unknown security suite {0:#04x}")]
    UnknownSuite(u8),

    /// Security control byte did not match the supported mode.
    #[error("unsupported security control {0:#04x}")]
    UnsupportedSecurityControl(u8),

    /// Key index inconsistent with the key source field.
    #[error("key index {index} inconsistent with key epoch {epoch}")]
    KeyIndexMismatch { index: u8, epoch: u32 },

    /// Unknown command byte.
    #[error("unknown command {0:#04x}")]
    UnknownCommand(u8),

    /// TLV extends past the end of the buffer.
    #[error("truncated tlv type {type_id}")]
    TruncatedTlv { type_id: u8 },

    /// TLV value shorter than its type requires.
    #[error("tlv type {type_id} too short: expected {expected} bytes, got {actual}")]
    TlvTooShort {
        type_id: u8,
        expected: usize,
        actual: usize,
    },

    /// TLV value exceeds the encodable length range.
    #[error("tlv value length {len} exceeds u16 range for type {type_id}")]
    InvalidTlvLength { type_id: u8, len: usize },

    /// A required TLV was absent.
    #[error("missing tlv type {type_id}")]
    MissingTlv { type_id: u8 },

    /// TLV value failed semantic validation.
    #[error("malformed tlv type {type_id}: {reason}")]
    MalformedTlv { type_id: u8, reason: &'static str },
}

/// Command byte following the (decrypted) security envelope.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    LinkRequest = 0,
    LinkAccept = 1,
    LinkAcceptAndRequest = 2,
    Advertisement = 4,
    DataRequest = 7,
    DataResponse = 8,
    ParentRequest = 9,
    ParentResponse = 10,
    ChildIdRequest = 11,
    ChildIdResponse = 12,
    ChildUpdateRequest = 13,
    ChildUpdateResponse = 14,
    Announce = 15,
}

impl Command {
    /// Commands permitted without a security envelope.
    pub fn allows_no_security(self) -> bool {
        matches!(self, Command::Announce)
    }
}

impl TryFrom<u8> for Command {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Command::LinkRequest),
            1 => Ok(Command::LinkAccept),
            2 => Ok(Command::LinkAcceptAndRequest),
            4 => Ok(Command::Advertisement),
            7 => Ok(Command::DataRequest),
            8 => Ok(Command::DataResponse),
            9 => Ok(Command::ParentRequest),
            10 => Ok(Command::ParentResponse),
            11 => Ok(Command::ChildIdRequest),
            12 => Ok(Command::ChildIdResponse),
            13 => Ok(Command::ChildUpdateRequest),
            14 => Ok(Command::ChildUpdateResponse),
            15 => Ok(Command::Announce),
            other => Err(WireError::UnknownCommand(other)),
        }
    }
}

/// Security header carried between the suite byte and the ciphertext.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecurityHeader {
    /// Per-sender monotonic frame counter.
    pub frame_counter: u32,
    /// Network-wide key epoch ("key sequence") selecting the active key.
    pub key_epoch: u32,
}

impl SecurityHeader {
    pub fn encode(&self) -> [u8; SECURITY_HEADER_LEN] {
        let mut buf = [0u8; SECURITY_HEADER_LEN];
        buf[0] = SECURITY_CONTROL;
        buf[1..5].copy_from_slice(&self.frame_counter.to_be_bytes());
        buf[5..9].copy_from_slice(&self.key_epoch.to_be_bytes());
        buf[9] = ((self.key_epoch & 0x7F) as u8).wrapping_add(1);
        buf
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < SECURITY_HEADER_LEN {
            return Err(WireError::BufferTooShort {
                expected: SECURITY_HEADER_LEN,
                actual: bytes.len(),
            });
        }
        if bytes[0] != SECURITY_CONTROL {
            return Err(WireError::UnsupportedSecurityControl(bytes[0]));
        }
        let frame_counter = u32::from_be_bytes(bytes[1..5].try_into().unwrap());
        let key_epoch = u32::from_be_bytes(bytes[5..9].try_into().unwrap());
        let index = bytes[9];
        if index != ((key_epoch & 0x7F) as u8).wrapping_add(1) {
            return Err(WireError::KeyIndexMismatch {
                index,
                epoch: key_epoch,
            });
        }
        Ok(Self {
            frame_counter,
            key_epoch,
        })
    }
}

/// TLV type identifiers.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlvType {
    SourceAddress = 0,
    Mode = 1,
    Timeout = 2,
    Challenge = 3,
    Response = 4,
    LinkFrameCounter = 5,
    MleFrameCounter = 8,
    Address16 = 10,
    LeaderData = 11,
    NetworkData = 12,
    TlvRequest = 13,
    ScanMask = 14,
    Connectivity = 15,
    LinkMargin = 16,
    Status = 17,
    Version = 18,
    AddressRegistration = 19,
    Channel = 20,
    PanId = 21,
    ActiveTimestamp = 22,
    PendingTimestamp = 23,
    ActiveDataset = 24,
    PendingDataset = 25,
    SupervisionInterval = 26,
    CslClockAccuracy = 30,
}

/// Scan Mask TLV bits selecting which device kinds may answer a Parent Request.
pub mod scan_mask {
    pub const ROUTERS: u8 = 0x80;
    pub const REEDS: u8 = 0x40;
}

/// Status TLV values.
pub mod status {
    pub const ERROR: u8 = 1;
}

/// Connectivity TLV: a would-be parent's advertised capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Connectivity {
    pub parent_priority: i8,
    pub link_quality_3: u8,
    pub link_quality_2: u8,
    pub link_quality_1: u8,
    pub leader_cost: u8,
    pub id_sequence: u8,
    pub active_routers: u8,
    pub sed_buffer_size: u16,
    pub sed_datagram_count: u8,
}

const CONNECTIVITY_LEN: usize = 10;

impl Connectivity {
    fn encode(&self) -> [u8; CONNECTIVITY_LEN] {
        let mut buf = [0u8; CONNECTIVITY_LEN];
        // Priority occupies the top two bits, clamped to [-2, 1].
        buf[0] = ((self.parent_priority.clamp(-2, 1) as u8) & 0x03) << 6;
        buf[1] = self.link_quality_3;
        buf[2] = self.link_quality_2;
        buf[3] = self.link_quality_1;
        buf[4] = self.leader_cost;
        buf[5] = self.id_sequence;
        buf[6] = self.active_routers;
        buf[7..9].copy_from_slice(&self.sed_buffer_size.to_be_bytes());
        buf[9] = self.sed_datagram_count;
        buf
    }

    fn parse(value: &[u8]) -> Result<Self, WireError> {
        if value.len() < CONNECTIVITY_LEN {
            return Err(WireError::TlvTooShort {
                type_id: TlvType::Connectivity as u8,
                expected: CONNECTIVITY_LEN,
                actual: value.len(),
            });
        }
        let priority_bits = (value[0] >> 6) & 0x03;
        // Sign-extend the two-bit field.
        let parent_priority = if priority_bits & 0x02 != 0 {
            (priority_bits as i8) - 4
        } else {
            priority_bits as i8
        };
        Ok(Self {
            parent_priority,
            link_quality_3: value[1],
            link_quality_2: value[2],
            link_quality_1: value[3],
            leader_cost: value[4],
            id_sequence: value[5],
            active_routers: value[6],
            sed_buffer_size: u16::from_be_bytes(value[7..9].try_into().unwrap()),
            sed_datagram_count: value[9],
        })
    }
}

/// CSL Clock Accuracy TLV value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CslClockAccuracy {
    pub accuracy_ppm: u8,
    pub uncertainty: u8,
}

const LEADER_DATA_LEN: usize = 8;

fn encode_leader_data(data: &LeaderData) -> [u8; LEADER_DATA_LEN] {
    let mut buf = [0u8; LEADER_DATA_LEN];
    buf[0..4].copy_from_slice(&data.partition_id.to_be_bytes());
    buf[4] = data.weighting;
    buf[5] = data.data_version;
    buf[6] = data.stable_data_version;
    buf[7] = data.leader_router_id;
    buf
}

fn parse_leader_data(value: &[u8]) -> Result<LeaderData, WireError> {
    if value.len() < LEADER_DATA_LEN {
        return Err(WireError::TlvTooShort {
            type_id: TlvType::LeaderData as u8,
            expected: LEADER_DATA_LEN,
            actual: value.len(),
        });
    }
    Ok(LeaderData {
        partition_id: u32::from_be_bytes(value[0..4].try_into().unwrap()),
        weighting: value[4],
        data_version: value[5],
        stable_data_version: value[6],
        leader_router_id: value[7],
    })
}

/// Parsed TLV view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tlv<'a> {
    pub type_id: u8,
    pub value: &'a [u8],
}

/// Cursor over `[type:1][length:1|extended][value]` records.
pub struct TlvCursor<'a> {
    buf: &'a [u8],
    offset: usize,
    failed: bool,
}

impl<'a> TlvCursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            offset: 0,
            failed: false,
        }
    }
}

impl<'a> Iterator for TlvCursor<'a> {
    type Item = Result<Tlv<'a>, WireError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.buf.len() {
            return None;
        }

        let remaining = &self.buf[self.offset..];
        if remaining.len() < 2 {
            self.failed = true;
            return Some(Err(WireError::TruncatedTlv {
                type_id: remaining[0],
            }));
        }

        let type_id = remaining[0];
        let (len, header_len) = if remaining[1] == TLV_EXTENDED_LENGTH {
            if remaining.len() < 4 {
                self.failed = true;
                return Some(Err(WireError::TruncatedTlv { type_id }));
            }
            let len = u16::from_be_bytes(remaining[2..4].try_into().unwrap()) as usize;
            (len, 4)
        } else {
            (remaining[1] as usize, 2)
        };

        let end = header_len + len;
        if remaining.len() < end {
            self.failed = true;
            return Some(Err(WireError::TruncatedTlv { type_id }));
        }

        let value = &remaining[header_len..end];
        self.offset += end;
        Some(Ok(Tlv { type_id, value }))
    }
}

/// Parsed (plaintext) message: command byte plus its TLV section.
#[derive(Debug, Clone, Copy)]
pub struct MleMessage<'a> {
    pub command: Command,
    tlv_bytes: &'a [u8],
}

impl<'a> MleMessage<'a> {
    /// Parses a decrypted message body.
    pub fn parse(plaintext: &'a [u8]) -> Result<Self, WireError> {
        if plaintext.is_empty() {
            return Err(WireError::BufferTooShort {
                expected: 1,
                actual: 0,
            });
        }
        let command = Command::try_from(plaintext[0])?;
        Ok(Self {
            command,
            tlv_bytes: &plaintext[1..],
        })
    }

    pub fn tlv_bytes(&self) -> &'a [u8] {
        self.tlv_bytes
    }

    /// Returns the first TLV with the given type, scanning the whole section
    /// so a truncated record anywhere is still reported.
    pub fn find(&self, kind: TlvType) -> Result<Option<Tlv<'a>>, WireError> {
        let mut found = None;
        for item in TlvCursor::new(self.tlv_bytes) {
            let tlv = item?;
            if tlv.type_id == kind as u8 && found.is_none() {
                found = Some(tlv);
            }
        }
        Ok(found)
    }

    fn require(&self, kind: TlvType) -> Result<Tlv<'a>, WireError> {
        self.find(kind)?.ok_or(WireError::MissingTlv {
            type_id: kind as u8,
        })
    }

    fn fixed<const N: usize>(&self, kind: TlvType) -> Result<[u8; N], WireError> {
        let tlv = self.require(kind)?;
        if tlv.value.len() < N {
            return Err(WireError::TlvTooShort {
                type_id: kind as u8,
                expected: N,
                actual: tlv.value.len(),
            });
        }
        let mut out = [0u8; N];
        out.copy_from_slice(&tlv.value[..N]);
        Ok(out)
    }

    pub fn u8_tlv(&self, kind: TlvType) -> Result<u8, WireError> {
        Ok(self.fixed::<1>(kind)?[0])
    }

    pub fn u16_tlv(&self, kind: TlvType) -> Result<u16, WireError> {
        Ok(u16::from_be_bytes(self.fixed::<2>(kind)?))
    }

    pub fn u32_tlv(&self, kind: TlvType) -> Result<u32, WireError> {
        Ok(u32::from_be_bytes(self.fixed::<4>(kind)?))
    }

    pub fn u64_tlv(&self, kind: TlvType) -> Result<u64, WireError> {
        Ok(u64::from_be_bytes(self.fixed::<8>(kind)?))
    }

    pub fn source_address(&self) -> Result<Rloc16, WireError> {
        Ok(Rloc16(self.u16_tlv(TlvType::SourceAddress)?))
    }

    pub fn address16(&self) -> Result<Rloc16, WireError> {
        Ok(Rloc16(self.u16_tlv(TlvType::Address16)?))
    }

    pub fn challenge(&self) -> Result<Challenge, WireError> {
        Ok(Challenge(self.fixed::<CHALLENGE_LEN>(TlvType::Challenge)?))
    }

    pub fn response(&self) -> Result<&'a [u8], WireError> {
        Ok(self.require(TlvType::Response)?.value)
    }

    pub fn leader_data(&self) -> Result<LeaderData, WireError> {
        parse_leader_data(self.require(TlvType::LeaderData)?.value)
    }

    pub fn connectivity(&self) -> Result<Connectivity, WireError> {
        Connectivity::parse(self.require(TlvType::Connectivity)?.value)
    }

    pub fn csl_clock_accuracy(&self) -> Result<Option<CslClockAccuracy>, WireError> {
        match self.find(TlvType::CslClockAccuracy)? {
            None => Ok(None),
            Some(tlv) => {
                if tlv.value.len() < 2 {
                    return Err(WireError::TlvTooShort {
                        type_id: TlvType::CslClockAccuracy as u8,
                        expected: 2,
                        actual: tlv.value.len(),
                    });
                }
                Ok(Some(CslClockAccuracy {
                    accuracy_ppm: tlv.value[0],
                    uncertainty: tlv.value[1],
                }))
            }
        }
    }
}

/// Builder for a plaintext message body (command + TLVs).
#[derive(Debug, Clone)]
pub struct MleWriter {
    buf: Vec<u8>,
}

impl MleWriter {
    pub fn new(command: Command) -> Self {
        let mut buf = Vec::with_capacity(64);
        buf.push(command as u8);
        Self { buf }
    }

    pub fn push(&mut self, kind: TlvType, value: &[u8]) -> Result<&mut Self, WireError> {
        self.push_raw(kind as u8, value)
    }

    pub fn push_raw(&mut self, type_id: u8, value: &[u8]) -> Result<&mut Self, WireError> {
        if value.len() > u16::MAX as usize {
            return Err(WireError::InvalidTlvLength {
                type_id,
                len: value.len(),
            });
        }
        self.buf.push(type_id);
        if value.len() >= TLV_EXTENDED_LENGTH as usize {
            self.buf.push(TLV_EXTENDED_LENGTH);
            self.buf
                .extend_from_slice(&(value.len() as u16).to_be_bytes());
        } else {
            self.buf.push(value.len() as u8);
        }
        self.buf.extend_from_slice(value);
        Ok(self)
    }

    pub fn put_u8(&mut self, kind: TlvType, value: u8) -> Result<&mut Self, WireError> {
        self.push(kind, &[value])
    }

    pub fn put_u16(&mut self, kind: TlvType, value: u16) -> Result<&mut Self, WireError> {
        self.push(kind, &value.to_be_bytes())
    }

    pub fn put_u32(&mut self, kind: TlvType, value: u32) -> Result<&mut Self, WireError> {
        self.push(kind, &value.to_be_bytes())
    }

    pub fn put_u64(&mut self, kind: TlvType, value: u64) -> Result<&mut Self, WireError> {
        self.push(kind, &value.to_be_bytes())
    }

    pub fn put_challenge(&mut self, challenge: &Challenge) -> Result<&mut Self, WireError> {
        self.push(TlvType::Challenge, &challenge.0)
    }

    pub fn put_response(&mut self, challenge: &Challenge) -> Result<&mut Self, WireError> {
        self.push(TlvType::Response, &challenge.0)
    }

    pub fn put_leader_data(&mut self, data: &LeaderData) -> Result<&mut Self, WireError> {
        self.push(TlvType::LeaderData, &encode_leader_data(data))
    }

    pub fn put_connectivity(&mut self, conn: &Connectivity) -> Result<&mut Self, WireError> {
        self.push(TlvType::Connectivity, &conn.encode())
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn security_header_round_trip() {
        let hdr = SecurityHeader {
            frame_counter: 0xDEAD_BEEF,
            key_epoch: 300,
        };
        let bytes = hdr.encode();
        assert_eq!(SecurityHeader::parse(&bytes).unwrap(), hdr);
    }

    #[test]
    fn security_header_rejects_bad_control() {
        let mut bytes = SecurityHeader {
            frame_counter: 1,
            key_epoch: 1,
        }
        .encode();
        bytes[0] = 0x00;
        assert!(matches!(
            SecurityHeader::parse(&bytes),
            Err(WireError::UnsupportedSecurityControl(0x00))
        ));
    }

    #[test]
    fn security_header_rejects_inconsistent_key_index() {
        let mut bytes = SecurityHeader {
            frame_counter: 1,
            key_epoch: 7,
        }
        .encode();
        bytes[9] = bytes[9].wrapping_add(1);
        assert!(matches!(
            SecurityHeader::parse(&bytes),
            Err(WireError::KeyIndexMismatch { .. })
        ));
    }

    #[test]
    fn message_typed_getters() {
        let mut writer = MleWriter::new(Command::ParentResponse);
        writer.put_u16(TlvType::SourceAddress, 0x4400).unwrap();
        writer
            .put_leader_data(&LeaderData {
                partition_id: 0xAABBCCDD,
                weighting: 64,
                data_version: 5,
                stable_data_version: 4,
                leader_router_id: 3,
            })
            .unwrap();
        writer
            .put_connectivity(&Connectivity {
                parent_priority: -1,
                link_quality_3: 2,
                sed_buffer_size: 1280,
                sed_datagram_count: 1,
                ..Default::default()
            })
            .unwrap();
        let body = writer.finish();

        let msg = MleMessage::parse(&body).unwrap();
        assert_eq!(msg.command, Command::ParentResponse);
        assert_eq!(msg.source_address().unwrap(), Rloc16(0x4400));
        let leader = msg.leader_data().unwrap();
        assert_eq!(leader.partition_id, 0xAABBCCDD);
        let conn = msg.connectivity().unwrap();
        assert_eq!(conn.parent_priority, -1);
        assert_eq!(conn.sed_buffer_size, 1280);
        assert!(matches!(
            msg.u8_tlv(TlvType::Status),
            Err(WireError::MissingTlv { type_id }) if type_id == TlvType::Status as u8
        ));
    }

    #[test]
    fn truncated_tlv_detected_mid_section() {
        let mut writer = MleWriter::new(Command::DataResponse);
        writer.put_u8(TlvType::Status, 1).unwrap();
        let mut body = writer.finish();
        body.push(TlvType::NetworkData as u8);
        body.push(20); // declares 20 bytes, none follow

        let msg = MleMessage::parse(&body).unwrap();
        assert!(matches!(
            msg.find(TlvType::Status),
            Err(WireError::TruncatedTlv { .. })
        ));
    }

    #[test]
    fn connectivity_priority_sign_round_trip() {
        for priority in [-2i8, -1, 0, 1] {
            let conn = Connectivity {
                parent_priority: priority,
                ..Default::default()
            };
            let parsed = Connectivity::parse(&conn.encode()).unwrap();
            assert_eq!(parsed.parent_priority, priority);
        }
    }

    proptest! {
        #[test]
        fn tlv_round_trip(entries in prop::collection::vec((0u8..=30u8, prop::collection::vec(any::<u8>(), 0..600)), 0..8)) {
            let mut writer = MleWriter::new(Command::DataResponse);
            for (ty, val) in &entries {
                writer.push_raw(*ty, val).unwrap();
            }
            let body = writer.finish();
            let msg = MleMessage::parse(&body).unwrap();

            let decoded: Vec<(u8, Vec<u8>)> = TlvCursor::new(msg.tlv_bytes())
                .map(|item| item.map(|tlv| (tlv.type_id, tlv.value.to_vec())))
                .collect::<Result<_, _>>()
                .unwrap();
            prop_assert_eq!(entries, decoded);
        }
    }
}
