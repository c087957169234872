use crate::protocol::mysql::basic::{put_lenenc_int, Handshake, HandshakeResponse};
use crate::protocol::mysql::constants::{
    relay_capabilities, AuthPluginName, CommandCode, SEMISYNC_INDICATOR, UTF8_GENERAL_CI,
};
use crate::protocol::mysql::error_codes::ErrorKind;

use byteorder::{LittleEndian, WriteBytesExt};
use mysql_common::constants::{ColumnFlags, ColumnType, StatusFlags};
use mysql_common::io::WriteMysqlExt;
use std::io::{self, Write};
use tokio::io::AsyncWrite;

use super::packet_writer::PacketWriter;

pub async fn write_ok_packet<W: AsyncWrite + Unpin>(
    w: &mut PacketWriter<W>,
    s: StatusFlags,
) -> io::Result<()> {
    w.write_u8(0x00)?; // OK header
    w.write_lenenc_int(0)?; // affected rows
    w.write_lenenc_int(0)?; // last insert id
    w.write_u16::<LittleEndian>(s.bits())?;
    w.write_all(&[0x00, 0x00])?; // no warnings
    w.end_packet().await
}

pub async fn write_err_packet<W: AsyncWrite + Unpin>(
    err: ErrorKind,
    msg: &[u8],
    w: &mut PacketWriter<W>,
) -> io::Result<()> {
    w.write_u8(0xff)?;
    w.write_u16::<LittleEndian>(err as u16)?;
    w.write_u8(b'#')?;
    w.write_all(err.sqlstate())?;
    w.write_all(msg)?;
    w.end_packet().await
}

pub async fn write_eof_packet<W: AsyncWrite + Unpin>(
    w: &mut PacketWriter<W>,
    s: StatusFlags,
) -> io::Result<()> {
    w.write_all(&[0xfe, 0x00, 0x00])?;
    w.write_u16::<LittleEndian>(s.bits())?;
    w.end_packet().await
}

/// The greeting the relay sends to a freshly accepted replica.
pub async fn write_initial_handshake<W: AsyncWrite + Unpin>(
    writer: &mut PacketWriter<W>,
    conn_id: u32,
    scramble: [u8; 20],
    server_version: &str,
) -> io::Result<()> {
    let handshake = Handshake {
        protocol_version: 10,
        server_version: server_version.to_string(),
        conn_id,
        scramble: scramble.to_vec(),
        capabilities: relay_capabilities(),
        charset: UTF8_GENERAL_CI as u8,
        status_flags: StatusFlags::SERVER_STATUS_AUTOCOMMIT,
        auth_plugin: AuthPluginName::AuthNativePassword
            .as_ref()
            .as_bytes()
            .to_vec(),
    };
    writer.set_seq(0);
    handshake.write_payload(writer)?;
    writer.end_packet().await?;
    writer.flush_all().await
}

/// The reply the relay sends to a master it connects to.
pub async fn write_handshake_response<W: AsyncWrite + Unpin>(
    w: &mut PacketWriter<W>,
    response: &HandshakeResponse,
) -> io::Result<()> {
    response
        .write_payload(w)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    w.end_packet().await?;
    w.flush_all().await
}

// ---------------------------------------------------------------------------
// commands (client side)
// ---------------------------------------------------------------------------

pub async fn write_com_query<W: AsyncWrite + Unpin>(
    w: &mut PacketWriter<W>,
    query: &str,
) -> io::Result<()> {
    w.set_seq(0);
    w.write_u8(CommandCode::ComQuery as u8)?;
    w.write_all(query.as_bytes())?;
    w.end_packet().await?;
    w.flush_all().await
}

/// COM_REGISTER_SLAVE with the identity fields zeroed, as the original
/// replicas-by-proxy do; only the server id matters.
pub async fn write_com_register_slave<W: AsyncWrite + Unpin>(
    w: &mut PacketWriter<W>,
    server_id: u32,
) -> io::Result<()> {
    w.set_seq(0);
    w.write_u8(CommandCode::ComRegisterSlave as u8)?;
    w.write_u32::<LittleEndian>(server_id)?;
    w.write_all(&[0u8; 13])?; // hostname/user/password lens, port, rank, master id
    w.end_packet().await?;
    w.flush_all().await
}

pub async fn write_com_binlog_dump<W: AsyncWrite + Unpin>(
    w: &mut PacketWriter<W>,
    file: &str,
    pos: u32,
    server_id: u32,
) -> io::Result<()> {
    w.set_seq(0);
    w.write_u8(CommandCode::ComBinlogDump as u8)?;
    w.write_u32::<LittleEndian>(pos)?;
    w.write_u16::<LittleEndian>(0)?; // flags
    w.write_u32::<LittleEndian>(server_id)?;
    w.write_all(file.as_bytes())?;
    w.end_packet().await?;
    w.flush_all().await
}

/// Semisync ack: magic byte, durable position, file name. Always sequence 0.
pub async fn write_semisync_ack<W: AsyncWrite + Unpin>(
    w: &mut PacketWriter<W>,
    file: &str,
    pos: u64,
) -> io::Result<()> {
    w.set_seq(0);
    w.write_u8(SEMISYNC_INDICATOR)?;
    w.write_u64::<LittleEndian>(pos)?;
    w.write_all(file.as_bytes())?;
    w.end_packet().await?;
    w.flush_all().await
}

// ---------------------------------------------------------------------------
// text resultsets (server side)
// ---------------------------------------------------------------------------

/// Column metadata for the fixed probe resultsets.
#[derive(Debug, Clone)]
pub struct ColumnDef {
    pub schema: &'static str,
    pub table: &'static str,
    pub org_table: &'static str,
    pub name: &'static str,
    pub org_name: &'static str,
    pub charset: u16,
    pub column_length: u32,
    pub column_type: ColumnType,
    pub flags: ColumnFlags,
    pub decimals: u8,
}

impl Default for ColumnDef {
    fn default() -> Self {
        ColumnDef {
            schema: "",
            table: "",
            org_table: "",
            name: "",
            org_name: "",
            charset: UTF8_GENERAL_CI,
            column_length: 28,
            column_type: ColumnType::MYSQL_TYPE_VAR_STRING,
            flags: ColumnFlags::empty(),
            decimals: 0,
        }
    }
}

async fn write_column_definition<W: AsyncWrite + Unpin>(
    w: &mut PacketWriter<W>,
    c: &ColumnDef,
) -> io::Result<()> {
    w.write_lenenc_str(b"def")?;
    w.write_lenenc_str(c.schema.as_bytes())?;
    w.write_lenenc_str(c.table.as_bytes())?;
    w.write_lenenc_str(c.org_table.as_bytes())?;
    w.write_lenenc_str(c.name.as_bytes())?;
    w.write_lenenc_str(c.org_name.as_bytes())?;
    w.write_lenenc_int(0x0c)?; // fixed length of the trailing block
    w.write_u16::<LittleEndian>(c.charset)?;
    w.write_u32::<LittleEndian>(c.column_length)?;
    w.write_u8(c.column_type as u8)?;
    w.write_u16::<LittleEndian>(c.flags.bits())?;
    w.write_u8(c.decimals)?;
    w.write_all(&[0x00, 0x00])?; // filler
    w.end_packet().await
}

async fn write_result_row<W: AsyncWrite + Unpin>(
    w: &mut PacketWriter<W>,
    values: &[Option<String>],
) -> io::Result<()> {
    for value in values {
        match value {
            Some(v) => {
                let mut len = Vec::with_capacity(9);
                put_lenenc_int(v.len() as u64, &mut len);
                w.write_all(&len)?;
                w.write_all(v.as_bytes())?;
            }
            None => {
                w.write_u8(0xfb)?;
            }
        }
    }
    w.end_packet().await
}

/// Emit a complete text resultset. The caller positions the writer's
/// sequence (command sequence + 1); packets then follow the
/// count / columns / EOF / rows / EOF layout with consecutive sequences.
pub async fn write_resultset<W: AsyncWrite + Unpin>(
    w: &mut PacketWriter<W>,
    columns: &[ColumnDef],
    rows: &[Vec<Option<String>>],
) -> io::Result<()> {
    w.write_lenenc_int(columns.len() as u64)?;
    w.end_packet().await?;
    for column in columns {
        write_column_definition(w, column).await?;
    }
    write_eof_packet(w, StatusFlags::SERVER_STATUS_AUTOCOMMIT).await?;
    for row in rows {
        write_result_row(w, row).await?;
    }
    write_eof_packet(w, StatusFlags::SERVER_STATUS_AUTOCOMMIT).await?;
    w.flush_all().await
}
