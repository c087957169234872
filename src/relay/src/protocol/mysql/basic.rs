use crate::error::{RelayError, RelayResult};
use crate::protocol::mysql::constants::{
    relay_capabilities, CommandCode, AUTH_PLUGIN_DATA_PART_1_LENGTH, SCRAMBLE_SIZE,
};

use byteorder::{LittleEndian, WriteBytesExt};
use mysql_common::constants::{CapabilityFlags, StatusFlags};
use std::io::Write;
use winnow::binary::{le_u16, le_u32, le_u8};
use winnow::combinator::{alt, preceded, rest};
use winnow::prelude::*;
use winnow::token::{literal, take, take_until};
use winnow::Parser;

/// Server greeting, HandshakeV10. The relay parses these from the upstream
/// master and builds its own toward downstream replicas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub protocol_version: u8,
    pub server_version: String,
    pub conn_id: u32,
    /// 20-byte random challenge.
    pub scramble: Vec<u8>,
    pub capabilities: CapabilityFlags,
    pub charset: u8,
    pub status_flags: StatusFlags,
    pub auth_plugin: Vec<u8>,
}

/// Client reply to the greeting, HandshakeResponse41.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct HandshakeResponse {
    pub client_flag: CapabilityFlags,
    pub max_packet_len: u32,
    pub collation: u16,
    pub username: Option<Vec<u8>>,
    pub auth_response: Vec<u8>,
    pub auth_plugin: Vec<u8>,
    pub database: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OkPacket {
    pub header: u8,
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: StatusFlags,
    pub warnings: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrPacket {
    pub error_code: u16,
    pub sql_state: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EofPacket {
    pub warnings: u16,
    pub status_flags: StatusFlags,
}

/// First-byte disambiguation of a response payload.
#[derive(Debug, Clone, PartialEq)]
pub enum GenericResponse {
    Ok(OkPacket),
    Err(ErrPacket),
    Eof(EofPacket),
}

// ---------------------------------------------------------------------------
// length-encoded integers
// ---------------------------------------------------------------------------

/// Strict decode: `(value, bytes consumed)`. The NULL sentinel and 0xff are
/// errors here; resultset row parsing handles NULL before calling this.
pub fn get_lenenc_int(buffer: &[u8]) -> RelayResult<(u64, usize)> {
    let first = *buffer.first().ok_or(RelayError::BadPacket)?;
    let (need, width) = match first {
        0xfb => return Err(RelayError::LenencIsNull),
        0xff => return Err(RelayError::LenencInvalid(first)),
        0xfc => (2usize, 3usize),
        0xfd => (3, 4),
        0xfe => (8, 9),
        b => return Ok((b as u64, 1)),
    };
    if buffer.len() < 1 + need {
        return Err(RelayError::BadPacket);
    }
    let mut bytes = [0u8; 8];
    bytes[..need].copy_from_slice(&buffer[1..1 + need]);
    Ok((u64::from_le_bytes(bytes), width))
}

/// Shortest-form encode, appended to `buffer`; returns bytes written.
pub fn put_lenenc_int(n: u64, buffer: &mut Vec<u8>) -> usize {
    if n < 251 {
        buffer.push(n as u8);
        1
    } else if n <= 0xffff {
        buffer.push(0xfc);
        buffer.extend_from_slice(&(n as u16).to_le_bytes());
        3
    } else if n <= 0xff_ffff {
        buffer.push(0xfd);
        buffer.extend_from_slice(&(n as u32).to_le_bytes()[..3]);
        4
    } else {
        buffer.push(0xfe);
        buffer.extend_from_slice(&n.to_le_bytes());
        9
    }
}

// Permissive variant for winnow pipelines: 0xfb decodes as 0, like the rest
// of the ecosystem does inside OK packets.
fn lenenc_u64(i: &[u8]) -> IResult<&[u8], u64> {
    let (i, b) = le_u8.parse_peek(i)?;
    let r_size: usize = match b {
        0xfb => return Ok((i, 0)),
        0xfc => 2,
        0xfd => 3,
        0xfe => 8,
        _ => return Ok((i, b as u64)),
    };
    let mut bytes = [0u8; 8];
    let (i, b) = take(r_size).parse_peek(i)?;
    bytes[..r_size].copy_from_slice(b);
    Ok((i, u64::from_le_bytes(bytes)))
}

fn null_str(i: &[u8]) -> IResult<&[u8], &[u8]> {
    let (i, s) = take_until(0.., "\0").parse_peek(i)?;
    let (i, _) = literal(b"\0").parse_peek(i)?;
    Ok((i, s))
}

// ---------------------------------------------------------------------------
// handshake
// ---------------------------------------------------------------------------

impl Handshake {
    /// Parse a HandshakeV10 payload read from a master.
    pub fn parse(payload: &[u8]) -> RelayResult<Self> {
        let proto = *payload.first().ok_or(RelayError::BadHandshake)?;
        if proto != 10 {
            return Err(RelayError::ProtocolNotSupported(proto));
        }
        let (_, handshake) =
            handshake_v10(&payload[1..]).map_err(|_| RelayError::BadHandshake)?;
        if handshake.scramble.len() != SCRAMBLE_SIZE {
            return Err(RelayError::BadHandshake);
        }
        Ok(handshake)
    }

    /// Serialize as a HandshakeV10 payload. Only the layout the relay
    /// advertises is supported: plugin auth with a 20-byte challenge.
    pub fn write_payload<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_u8(self.protocol_version)?;
        w.write_all(self.server_version.as_bytes())?;
        w.write_u8(0x00)?;
        w.write_u32::<LittleEndian>(self.conn_id)?;
        w.write_all(&self.scramble[..AUTH_PLUGIN_DATA_PART_1_LENGTH])?;
        w.write_u8(0x00)?;
        let caps = self.capabilities.bits().to_le_bytes();
        w.write_all(&caps[..2])?;
        w.write_u8(self.charset)?;
        w.write_u16::<LittleEndian>(self.status_flags.bits())?;
        w.write_all(&caps[2..4])?;
        w.write_u8((self.scramble.len() + 1) as u8)?;
        w.write_all(&[0u8; 10])?;
        w.write_all(&self.scramble[AUTH_PLUGIN_DATA_PART_1_LENGTH..])?;
        w.write_u8(0x00)?;
        w.write_all(&self.auth_plugin)?;
        w.write_u8(0x00)?;
        Ok(())
    }
}

fn handshake_v10(i: &[u8]) -> IResult<&[u8], Handshake> {
    let (i, server_version) = null_str(i)?;
    let (i, conn_id) = le_u32.parse_peek(i)?;
    let (i, part1) = take(8usize).parse_peek(i)?;
    let (i, _filler) = le_u8.parse_peek(i)?;
    let (i, cap_low) = le_u16.parse_peek(i)?;
    let (i, charset) = le_u8.parse_peek(i)?;
    let (i, status) = le_u16.parse_peek(i)?;
    let (i, cap_high) = le_u16.parse_peek(i)?;
    let capabilities =
        CapabilityFlags::from_bits_truncate((cap_high as u32) << 16 | cap_low as u32);
    let (i, auth_data_len) = le_u8.parse_peek(i)?;
    let (i, _reserved) = take(10usize).parse_peek(i)?;

    let mut scramble = part1.to_vec();
    let (i, auth_plugin) = if capabilities.contains(CapabilityFlags::CLIENT_SECURE_CONNECTION) {
        // part-2 is max(13, auth_data_len - 8) bytes, NUL terminated.
        let part2_len = std::cmp::max(13, auth_data_len.saturating_sub(8) as usize);
        let (i, part2) = take(part2_len).parse_peek(i)?;
        scramble.extend_from_slice(&part2[..SCRAMBLE_SIZE - AUTH_PLUGIN_DATA_PART_1_LENGTH]);
        if capabilities.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH) {
            let (i, plugin) = null_str(i)?;
            (i, plugin.to_vec())
        } else {
            (i, Vec::new())
        }
    } else {
        (i, Vec::new())
    };

    Ok((
        i,
        Handshake {
            protocol_version: 10,
            server_version: String::from_utf8_lossy(server_version).into_owned(),
            conn_id,
            scramble,
            capabilities,
            charset,
            status_flags: StatusFlags::from_bits_truncate(status),
            auth_plugin,
        },
    ))
}

impl HandshakeResponse {
    /// Serialize the reply the relay sends to a master it connects to.
    /// Requires the relay capability set to have been negotiated.
    pub fn write_payload<W: Write>(&self, w: &mut W) -> RelayResult<()> {
        if !self.client_flag.contains(relay_capabilities()) {
            return Err(RelayError::CapabilityNotSufficient(self.client_flag));
        }
        w.write_u32::<LittleEndian>(self.client_flag.bits())?;
        w.write_u32::<LittleEndian>(self.max_packet_len)?;
        w.write_u8(self.collation as u8)?;
        w.write_all(&[0u8; 23])?;
        if let Some(username) = &self.username {
            w.write_all(username)?;
        }
        w.write_u8(0x00)?;
        let mut len = Vec::with_capacity(9);
        put_lenenc_int(self.auth_response.len() as u64, &mut len);
        w.write_all(&len)?;
        w.write_all(&self.auth_response)?;
        if self.client_flag.contains(CapabilityFlags::CLIENT_CONNECT_WITH_DB) {
            if let Some(db) = &self.database {
                w.write_all(db)?;
            }
            w.write_u8(0x00)?;
        }
        w.write_all(&self.auth_plugin)?;
        w.write_u8(0x00)?;
        Ok(())
    }
}

/// Parse a HandshakeResponse41 received from a downstream replica.
pub fn client_handshake_response(i: &[u8]) -> IResult<&[u8], HandshakeResponse> {
    let (i, capability_flags) = le_u16.parse_peek(i)?;
    let mut capabilities = CapabilityFlags::from_bits_truncate(capability_flags as u32);
    if !capabilities.contains(CapabilityFlags::CLIENT_PROTOCOL_41) {
        // Pre-4.1 responses carry no plugin data; surface the flags so the
        // caller can refuse with the capability error.
        return Ok((
            i,
            HandshakeResponse {
                client_flag: capabilities,
                max_packet_len: 0,
                collation: 0,
                username: None,
                auth_response: Vec::new(),
                auth_plugin: Vec::new(),
                database: None,
            },
        ));
    }
    let (i, cap2) = le_u16.parse_peek(i)?;
    capabilities =
        CapabilityFlags::from_bits_truncate((cap2 as u32) << 16 | capability_flags as u32);

    let (i, max_packet_len) = le_u32.parse_peek(i)?;
    let (i, collation) = le_u8.parse_peek(i)?;
    let (i, _) = take(23usize).parse_peek(i)?;
    let (i, username) = null_str(i)?;

    let (i, auth_response) =
        if capabilities.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA) {
            let (i, size) = lenenc_u64(i)?;
            take(size).parse_peek(i)?
        } else if capabilities.contains(CapabilityFlags::CLIENT_SECURE_CONNECTION) {
            let (i, size) = le_u8.parse_peek(i)?;
            take(size).parse_peek(i)?
        } else {
            null_str(i)?
        };

    let (i, db) = if capabilities.contains(CapabilityFlags::CLIENT_CONNECT_WITH_DB) && !i.is_empty()
    {
        let (i, db) = null_str(i)?;
        (i, Some(db.to_vec()))
    } else {
        (i, None)
    };

    let (i, auth_plugin) =
        if capabilities.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH) && !i.is_empty() {
            let (i, plugin) = null_str(i)?;
            (i, plugin.to_vec())
        } else {
            (i, Vec::new())
        };

    Ok((
        i,
        HandshakeResponse {
            client_flag: capabilities,
            max_packet_len,
            collation: u16::from(collation),
            username: Some(username.to_vec()),
            auth_response: auth_response.to_vec(),
            auth_plugin,
            database: db,
        },
    ))
}

// ---------------------------------------------------------------------------
// generic responses
// ---------------------------------------------------------------------------

pub fn ok_packet(i: &[u8]) -> IResult<&[u8], OkPacket> {
    let (i, header) = le_u8.parse_peek(i)?;
    let (i, affected_rows) = lenenc_u64(i)?;
    let (i, last_insert_id) = lenenc_u64(i)?;
    let (i, status) = le_u16.parse_peek(i)?;
    let (i, warnings) = le_u16.parse_peek(i)?;
    Ok((
        i,
        OkPacket {
            header,
            affected_rows,
            last_insert_id,
            status_flags: StatusFlags::from_bits_truncate(status),
            warnings,
        },
    ))
}

pub fn err_packet(i: &[u8]) -> IResult<&[u8], ErrPacket> {
    let (i, _header) = literal([0xffu8]).parse_peek(i)?;
    let (i, error_code) = le_u16.parse_peek(i)?;
    let (i, sql_state) = if i.first() == Some(&b'#') {
        let (i, _) = le_u8.parse_peek(i)?;
        let (i, state) = take(5usize).parse_peek(i)?;
        (i, String::from_utf8_lossy(state).into_owned())
    } else {
        (i, String::new())
    };
    let (i, message) = rest.parse_peek(i)?;
    Ok((
        i,
        ErrPacket {
            error_code,
            sql_state,
            message: String::from_utf8_lossy(message).into_owned(),
        },
    ))
}

pub fn eof_packet(i: &[u8]) -> IResult<&[u8], EofPacket> {
    let (i, _header) = literal([0xfeu8]).parse_peek(i)?;
    let (i, warnings) = le_u16.parse_peek(i)?;
    let (i, status) = le_u16.parse_peek(i)?;
    Ok((
        i,
        EofPacket {
            warnings,
            status_flags: StatusFlags::from_bits_truncate(status),
        },
    ))
}

impl GenericResponse {
    pub fn parse(payload: &[u8]) -> RelayResult<Self> {
        match payload.first() {
            Some(0x00) => {
                let (_, ok) = ok_packet(payload).map_err(|_| RelayError::BadPacket)?;
                Ok(GenericResponse::Ok(ok))
            }
            Some(0xff) => {
                let (_, err) = err_packet(payload).map_err(|_| RelayError::BadPacket)?;
                Ok(GenericResponse::Err(err))
            }
            Some(0xfe) if payload.len() <= 5 => {
                let (_, eof) = eof_packet(payload).map_err(|_| RelayError::BadPacket)?;
                Ok(GenericResponse::Eof(eof))
            }
            Some(other) => Err(RelayError::NotGenericResponse(*other)),
            None => Err(RelayError::BadPacket),
        }
    }

    /// OK or bust; ERR packets become [`RelayError::Server`].
    pub fn into_ok(self) -> RelayResult<OkPacket> {
        match self {
            GenericResponse::Ok(ok) => Ok(ok),
            GenericResponse::Err(err) => Err(RelayError::Server {
                code: err.error_code,
                state: err.sql_state,
                message: err.message,
            }),
            GenericResponse::Eof(_) => Err(RelayError::WrongPacketType {
                expected: "OK",
                got: 0xfe,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// commands
// ---------------------------------------------------------------------------

/// Commands the downstream server dispatches on.
#[derive(Debug, PartialEq, Eq)]
pub enum Command<'a> {
    Query(&'a [u8]),
    Ping,
    Quit,
    RegisterSlave(&'a [u8]),
    BinlogDump(&'a [u8]),
    Unknown(u8),
}

pub fn from_packet(pkt: &[u8]) -> IResult<&[u8], Command<'_>> {
    alt((
        preceded(literal([CommandCode::ComQuery as u8]), rest).map(Command::Query),
        literal([CommandCode::ComPing as u8]).map(|_| Command::Ping),
        literal([CommandCode::ComQuit as u8]).map(|_| Command::Quit),
        preceded(literal([CommandCode::ComRegisterSlave as u8]), rest)
            .map(Command::RegisterSlave),
        preceded(literal([CommandCode::ComBinlogDump as u8]), rest).map(Command::BinlogDump),
        (le_u8, rest).map(|(code, _): (u8, &[u8])| Command::Unknown(code)),
    ))
    .parse_peek(pkt)
}

/// Body of COM_BINLOG_DUMP (without the command byte).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComBinlogDump {
    pub binlog_pos: u32,
    pub flags: u16,
    pub server_id: u32,
    pub binlog_filename: String,
}

impl ComBinlogDump {
    pub fn parse(body: &[u8]) -> RelayResult<Self> {
        let (_, dump) = com_binlog_dump(body).map_err(|_| RelayError::BadPacket)?;
        Ok(dump)
    }
}

fn com_binlog_dump(i: &[u8]) -> IResult<&[u8], ComBinlogDump> {
    let (i, binlog_pos) = le_u32.parse_peek(i)?;
    let (i, flags) = le_u16.parse_peek(i)?;
    let (i, server_id) = le_u32.parse_peek(i)?;
    let (i, filename) = rest.parse_peek(i)?;
    Ok((
        i,
        ComBinlogDump {
            binlog_pos,
            flags,
            server_id,
            binlog_filename: String::from_utf8_lossy(filename).into_owned(),
        },
    ))
}

/// Body of COM_REGISTER_SLAVE: only the server id matters to the relay.
pub fn register_slave_server_id(body: &[u8]) -> RelayResult<u32> {
    let (_, id) = com_register_slave(body).map_err(|_| RelayError::BadPacket)?;
    Ok(id)
}

fn com_register_slave(i: &[u8]) -> IResult<&[u8], u32> {
    le_u32.parse_peek(i)
}
