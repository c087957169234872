use crate::error::{RelayError, RelayResult};
use crate::protocol::mysql::basic::{GenericResponse, Handshake, HandshakeResponse, OkPacket};
use crate::protocol::mysql::constants::relay_capabilities;
use crate::protocol::mysql::packet::packet_reader::PacketReader;
use crate::protocol::mysql::packet::packet_writer::PacketWriter;
use crate::protocol::mysql::packet::writers;
use crate::protocol::mysql::packet::Packet;
use crate::server::auth::auth_response;
use crate::util::deadline;

use std::io;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

/// Connection parameters for one upstream master.
#[derive(Debug, Clone)]
pub struct MasterEndpoint {
    pub addr: String,
    pub username: String,
    pub password: String,
    pub server_id: u32,
    pub read_timeout: Duration,
}

/// An authenticated connection to a master, still in the command phase.
pub struct MasterConn {
    reader: PacketReader<OwnedReadHalf>,
    writer: PacketWriter<OwnedWriteHalf>,
    read_timeout: Duration,
}

impl MasterEndpoint {
    /// TCP connect, read the greeting, answer it, and consume the auth OK.
    pub async fn connect(&self) -> RelayResult<MasterConn> {
        let stream = deadline(self.read_timeout, TcpStream::connect(&self.addr)).await?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        let mut reader = PacketReader::new(read_half);
        let mut writer = PacketWriter::new(write_half);

        let (seq, greeting) = deadline(self.read_timeout, reader.next_async())
            .await?
            .ok_or_else(closed_early)?;
        if seq != 0 {
            return Err(RelayError::BadHandshake);
        }
        let handshake = Handshake::parse(&greeting)?;
        if !handshake.capabilities.contains(relay_capabilities()) {
            return Err(RelayError::CapabilityNotSufficient(handshake.capabilities));
        }
        debug!(
            server_version = %handshake.server_version,
            conn_id = handshake.conn_id,
            "master greeting"
        );

        let response = HandshakeResponse {
            client_flag: relay_capabilities(),
            max_packet_len: 0,
            collation: u16::from(handshake.charset),
            username: Some(self.username.clone().into_bytes()),
            auth_response: auth_response(&handshake.scramble, &self.password),
            auth_plugin: handshake.auth_plugin.clone(),
            database: None,
        };
        writer.set_seq(seq.wrapping_add(1));
        writers::write_handshake_response(&mut writer, &response).await?;

        let (ok_seq, packet) = deadline(self.read_timeout, reader.next_async())
            .await?
            .ok_or_else(closed_early)?;
        if ok_seq != seq.wrapping_add(2) {
            return Err(RelayError::SequenceMismatch {
                expected: seq.wrapping_add(2),
                got: ok_seq,
            });
        }
        GenericResponse::parse(&packet)?.into_ok()?;

        Ok(MasterConn {
            reader,
            writer,
            read_timeout: self.read_timeout,
        })
    }
}

fn closed_early() -> RelayError {
    RelayError::Io(io::Error::new(
        io::ErrorKind::ConnectionAborted,
        "master closed the connection",
    ))
}

impl MasterConn {
    async fn next_packet(&mut self) -> RelayResult<(u8, Packet)> {
        deadline(self.read_timeout, self.reader.next_async())
            .await?
            .ok_or_else(closed_early)
    }

    /// COM_QUERY expecting a bare OK; server errors surface as
    /// [`RelayError::Server`].
    pub async fn query_ok(&mut self, sql: &str) -> RelayResult<OkPacket> {
        writers::write_com_query(&mut self.writer, sql).await?;
        let (_, packet) = self.next_packet().await?;
        GenericResponse::parse(&packet)?.into_ok()
    }

    pub async fn register_slave(&mut self, server_id: u32) -> RelayResult<OkPacket> {
        writers::write_com_register_slave(&mut self.writer, server_id).await?;
        let (_, packet) = self.next_packet().await?;
        GenericResponse::parse(&packet)?.into_ok()
    }

    /// Issue COM_BINLOG_DUMP. No response is read here: the next packet on
    /// the wire is the first event (or an error the dumper will decode).
    pub async fn start_dump(&mut self, file: &str, pos: u32, server_id: u32) -> RelayResult<()> {
        writers::write_com_binlog_dump(&mut self.writer, file, pos, server_id).await?;
        Ok(())
    }

    /// Hand the halves to the dump pipeline: the raw read half for event
    /// streaming, the packet writer for semisync acks.
    pub fn into_parts(self) -> (OwnedReadHalf, PacketWriter<OwnedWriteHalf>) {
        (self.reader.into_inner(), self.writer)
    }
}
