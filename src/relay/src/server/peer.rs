use crate::error::{RelayError, RelayResult};
use crate::protocol::mysql::basic::{
    client_handshake_response, from_packet, register_slave_server_id, ComBinlogDump, Command,
};
use crate::protocol::mysql::constants::relay_capabilities;
use crate::protocol::mysql::error_codes::ErrorKind;
use crate::protocol::mysql::packet::packet_reader::PacketReader;
use crate::protocol::mysql::packet::packet_writer::PacketWriter;
use crate::protocol::mysql::packet::writers::{
    write_err_packet, write_initial_handshake, write_ok_packet,
};
use crate::server::auth::{check_auth, gen_scramble};
use crate::server::{binlog_dump, query_table, ServerCtx, UpstreamHandle};

use mysql_common::constants::StatusFlags;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::{debug, info};

/// One replica session: host gate, handshake, auth, then the command loop.
/// Any error tears the session down; the caller removes it from the map.
pub async fn serve(
    ctx: Arc<ServerCtx>,
    conn_id: u32,
    stream: TcpStream,
    peer_addr: SocketAddr,
) -> RelayResult<()> {
    stream.set_nodelay(true)?;
    let (read_half, write_half) = stream.into_split();
    let mut reader = PacketReader::new(read_half);
    let mut writer = PacketWriter::new(write_half);
    let ip = peer_addr.ip();

    if !ctx.host_allowed(&ip) {
        writer.set_seq(0);
        let msg = format!("Host '{ip}' is not allowed to connect to this MySQL server");
        write_err_packet(ErrorKind::ER_HOST_NOT_PRIVILEGED, msg.as_bytes(), &mut writer).await?;
        writer.flush_all().await?;
        return Ok(());
    }

    let scramble = gen_scramble();
    write_initial_handshake(&mut writer, conn_id, scramble, &ctx.server.version).await?;

    let Some((auth_seq, auth_pkt)) = reader.next_async().await? else {
        return Ok(());
    };
    let (_, response) =
        client_handshake_response(&auth_pkt).map_err(|_| RelayError::BadHandshake)?;
    if !response.client_flag.contains(relay_capabilities()) {
        return Err(RelayError::CapabilityNotSufficient(response.client_flag));
    }
    let username = response
        .username
        .as_deref()
        .map(|u| String::from_utf8_lossy(u).into_owned())
        .unwrap_or_default();

    writer.set_seq(auth_seq.wrapping_add(1));
    let authed = ctx.lookup_user(&username).filter(|user| {
        user.host.contains(&ip) && check_auth(&scramble, &user.hash2, &response.auth_response)
    });
    let Some(user) = authed else {
        let using = if response.auth_response.is_empty() { "NO" } else { "YES" };
        let msg = format!("Access denied for user '{username}'@'{ip}' (using password: {using})");
        write_err_packet(ErrorKind::ER_ACCESS_DENIED_ERROR, msg.as_bytes(), &mut writer).await?;
        writer.flush_all().await?;
        return Ok(());
    };
    let upstream: &UpstreamHandle =
        ctx.upstreams
            .get(&user.upstream)
            .ok_or_else(|| RelayError::BinlogNotExists(user.upstream.clone()))?;
    write_ok_packet(&mut writer, StatusFlags::SERVER_STATUS_AUTOCOMMIT).await?;
    writer.flush_all().await?;
    info!(conn_id, user = %username, %ip, upstream = %user.upstream, "replica authenticated");

    let mut replica_server_id: u32 = 0;
    loop {
        let Some((seq, packet)) = reader.next_async().await? else {
            break;
        };
        writer.set_seq(seq.wrapping_add(1));
        let command = match from_packet(&packet) {
            Ok((_, command)) => command,
            Err(_) => {
                write_err_packet(ErrorKind::ER_UNKNOWN_COM_ERROR, b"", &mut writer).await?;
                writer.flush_all().await?;
                continue;
            }
        };
        match command {
            Command::Query(query) => {
                query_table::on_query(&ctx, query, &mut writer).await?;
            }
            Command::Ping => {
                write_ok_packet(&mut writer, StatusFlags::SERVER_STATUS_AUTOCOMMIT).await?;
                writer.flush_all().await?;
            }
            Command::Quit => break,
            Command::RegisterSlave(body) => {
                replica_server_id = register_slave_server_id(body).unwrap_or(0);
                debug!(conn_id, replica_server_id, "slave registered");
                write_ok_packet(&mut writer, StatusFlags::SERVER_STATUS_AUTOCOMMIT).await?;
                writer.flush_all().await?;
            }
            Command::BinlogDump(body) => {
                let dump = ComBinlogDump::parse(body)?;
                info!(
                    conn_id,
                    replica_server_id,
                    file = %dump.binlog_filename,
                    pos = dump.binlog_pos,
                    "binlog dump requested"
                );
                // does not return until the replica drops or an error ends
                // the session
                binlog_dump::run(upstream, &mut writer, &dump, ctx.server.server_id).await?;
                break;
            }
            Command::Unknown(code) => {
                debug!(conn_id, code, "unknown command");
                write_err_packet(ErrorKind::ER_UNKNOWN_COM_ERROR, b"", &mut writer).await?;
                writer.flush_all().await?;
            }
        }
    }
    Ok(())
}
