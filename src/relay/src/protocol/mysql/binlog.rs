use crate::error::{RelayError, RelayResult};

use byteorder::{ByteOrder, LittleEndian};
use crc::{Crc, CRC_32_ISO_HDLC};
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;

pub const EVENT_HEADER_LEN: usize = 19;
pub const CHECKSUM_LEN: usize = 4;
/// Binlog checksum algorithm ids carried in the FDE.
pub const CHECKSUM_ALG_OFF: u8 = 0;
pub const CHECKSUM_ALG_CRC32: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum EventType {
    Unknown = 0,
    StartV3 = 1,
    Query = 2,
    Stop = 3,
    Rotate = 4,
    Intvar = 5,
    Load = 6,
    Slave = 7,
    CreateFile = 8,
    AppendBlock = 9,
    ExecLoad = 10,
    DeleteFile = 11,
    NewLoad = 12,
    Rand = 13,
    UserVar = 14,
    FormatDescription = 15,
    Xid = 16,
    BeginLoadQuery = 17,
    ExecuteLoadQuery = 18,
    TableMap = 19,
    PreGaWriteRows = 20,
    PreGaUpdateRows = 21,
    PreGaDeleteRows = 22,
    WriteRowsV1 = 23,
    UpdateRowsV1 = 24,
    DeleteRowsV1 = 25,
    Incident = 26,
    Heartbeat = 27,
    Ignorable = 28,
    RowsQuery = 29,
    WriteRowsV2 = 30,
    UpdateRowsV2 = 31,
    DeleteRowsV2 = 32,
    Gtid = 33,
    AnonymousGtid = 34,
    PreviousGtids = 35,
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventFlags: u16 {
        const BINLOG_IN_USE            = 0x0001;
        const FORCED_ROTATE            = 0x0002;
        const THREAD_SPECIFIC          = 0x0004;
        const SUPPRESS_USE             = 0x0008;
        const UPDATE_TABLE_MAP_VERSION = 0x0010;
        const ARTIFICIAL               = 0x0020;
        const RELAY_LOG                = 0x0040;
        const IGNORABLE                = 0x0080;
        const NO_FILTER                = 0x0100;
        const MTS_ISOLATE              = 0x0200;
    }
}

/// The 19-byte header in front of every binlog event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventHeader {
    pub timestamp: u32,
    pub event_type: u8,
    pub server_id: u32,
    pub event_size: u32,
    pub log_pos: u32,
    pub flags: u16,
}

impl EventHeader {
    pub fn parse(buffer: &[u8]) -> RelayResult<Self> {
        if buffer.len() < EVENT_HEADER_LEN {
            return Err(RelayError::BufferNotSufficient(EVENT_HEADER_LEN));
        }
        Ok(EventHeader {
            timestamp: LittleEndian::read_u32(&buffer[0..]),
            event_type: buffer[4],
            server_id: LittleEndian::read_u32(&buffer[5..]),
            event_size: LittleEndian::read_u32(&buffer[9..]),
            log_pos: LittleEndian::read_u32(&buffer[13..]),
            flags: LittleEndian::read_u16(&buffer[17..]),
        })
    }

    pub fn write_to(&self, out: &mut [u8]) {
        LittleEndian::write_u32(&mut out[0..], self.timestamp);
        out[4] = self.event_type;
        LittleEndian::write_u32(&mut out[5..], self.server_id);
        LittleEndian::write_u32(&mut out[9..], self.event_size);
        LittleEndian::write_u32(&mut out[13..], self.log_pos);
        LittleEndian::write_u16(&mut out[17..], self.flags);
    }

    pub fn event_type(&self) -> RelayResult<EventType> {
        EventType::from_u8(self.event_type).ok_or(RelayError::UnknownEvent(self.event_type))
    }

    pub fn event_flags(&self) -> EventFlags {
        EventFlags::from_bits_truncate(self.flags)
    }

    /// Fake events are synthesized by a master mid-stream; they carry no
    /// position and must never advance the stored one.
    pub fn is_fake(&self) -> bool {
        self.log_pos == 0
    }
}

/// Body of a ROTATE_EVENT: where the stream continues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotateEvent {
    pub position: u64,
    pub next_name: String,
}

impl RotateEvent {
    pub fn parse(body: &[u8], has_checksum: bool) -> RelayResult<Self> {
        let trailer = if has_checksum { CHECKSUM_LEN } else { 0 };
        if body.len() < 8 + trailer {
            return Err(RelayError::BadPacket);
        }
        let position = LittleEndian::read_u64(&body[0..]);
        let name = &body[8..body.len() - trailer];
        Ok(RotateEvent {
            position,
            next_name: String::from_utf8_lossy(name).into_owned(),
        })
    }
}

/// The interesting fields of a FORMAT_DESCRIPTION_EVENT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatDescriptionEvent {
    pub binlog_version: u16,
    pub server_version: String,
    pub created: u32,
    pub header_len: u8,
    /// `CHECKSUM_ALG_CRC32` when every subsequent event carries a CRC trailer.
    pub checksum_alg: u8,
}

impl FormatDescriptionEvent {
    pub fn parse(body: &[u8]) -> RelayResult<Self> {
        if body.len() < 2 + 50 + 4 + 1 {
            return Err(RelayError::BadPacket);
        }
        let binlog_version = LittleEndian::read_u16(&body[0..]);
        let raw_version = &body[2..52];
        let end = raw_version
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(raw_version.len());
        let server_version = String::from_utf8_lossy(&raw_version[..end]).into_owned();
        let created = LittleEndian::read_u32(&body[52..]);
        let header_len = body[56];
        // Servers from 5.6.1 on close the body with the checksum algorithm
        // byte and the FDE's own CRC-32.
        let checksum_alg = if version_at_least(&server_version, 5, 6, 1) {
            body[body.len() - CHECKSUM_LEN - 1]
        } else {
            CHECKSUM_ALG_OFF
        };
        Ok(FormatDescriptionEvent {
            binlog_version,
            server_version,
            created,
            header_len,
            checksum_alg,
        })
    }
}

fn version_at_least(version: &str, major: u32, minor: u32, patch: u32) -> bool {
    let mut parts = [0u32; 3];
    for (idx, piece) in version.splitn(3, '.').enumerate().take(3) {
        let digits: String = piece.chars().take_while(|c| c.is_ascii_digit()).collect();
        parts[idx] = digits.parse().unwrap_or(0);
    }
    parts >= [major, minor, patch]
}

// ---------------------------------------------------------------------------
// checksums and synthesized events
// ---------------------------------------------------------------------------

const BINLOG_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// CRC-32 over a full event minus its trailer, as mysqld computes it.
pub fn event_crc32(event_without_trailer: &[u8]) -> u32 {
    BINLOG_CRC.checksum(event_without_trailer)
}

/// Build the artificial ROTATE_EVENT a master sends to (re)connecting
/// replicas: `log_pos` 0, ARTIFICIAL flag, fresh CRC trailer.
pub fn build_fake_rotate(server_id: u32, name: &str, position: u64) -> Vec<u8> {
    let body_len = 8 + name.len();
    let total = EVENT_HEADER_LEN + body_len + CHECKSUM_LEN;
    let header = EventHeader {
        timestamp: 0,
        event_type: EventType::Rotate as u8,
        server_id,
        event_size: total as u32,
        log_pos: 0,
        flags: EventFlags::ARTIFICIAL.bits(),
    };
    let mut event = vec![0u8; total];
    header.write_to(&mut event);
    LittleEndian::write_u64(&mut event[EVENT_HEADER_LEN..], position);
    event[EVENT_HEADER_LEN + 8..EVENT_HEADER_LEN + body_len].copy_from_slice(name.as_bytes());
    let crc = event_crc32(&event[..total - CHECKSUM_LEN]);
    LittleEndian::write_u32(&mut event[total - CHECKSUM_LEN..], crc);
    event
}

/// Turn a real FDE read from disk into the synthetic one a replica gets on
/// reconnect: `log_pos` forced to 0, CRC recomputed when the event carries
/// one. `event` is the full header+body byte run.
pub fn rewrite_fde_as_fake(event: &mut [u8]) -> RelayResult<()> {
    if event.len() < EVENT_HEADER_LEN {
        return Err(RelayError::BufferNotSufficient(EVENT_HEADER_LEN));
    }
    let fde = FormatDescriptionEvent::parse(&event[EVENT_HEADER_LEN..])?;
    LittleEndian::write_u32(&mut event[13..], 0);
    if fde.checksum_alg == CHECKSUM_ALG_CRC32 {
        let trailer_at = event.len() - CHECKSUM_LEN;
        let crc = event_crc32(&event[..trailer_at]);
        LittleEndian::write_u32(&mut event[trailer_at..], crc);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// binlog file names
// ---------------------------------------------------------------------------

pub const MAX_BINLOG_SEQ: u32 = 999_999;

/// `"mysql-bin.000005"` → `("mysql-bin", 5)`.
pub fn parse_binlog_name(name: &str) -> RelayResult<(&str, u32)> {
    let (prefix, suffix) = name
        .rsplit_once('.')
        .ok_or_else(|| RelayError::BadBinlogName(name.to_string()))?;
    if prefix.is_empty() || suffix.is_empty() {
        return Err(RelayError::BadBinlogName(name.to_string()));
    }
    let seq: u32 = suffix
        .parse()
        .map_err(|_| RelayError::BadBinlogName(name.to_string()))?;
    Ok((prefix, seq))
}

pub fn to_binlog_name(prefix: &str, seq: u32) -> String {
    format!("{prefix}.{seq:06}")
}

pub fn next_binlog_name(name: &str) -> RelayResult<String> {
    let (prefix, seq) = parse_binlog_name(name)?;
    if seq >= MAX_BINLOG_SEQ {
        return Err(RelayError::BadBinlogName(name.to_string()));
    }
    Ok(to_binlog_name(prefix, seq + 1))
}
