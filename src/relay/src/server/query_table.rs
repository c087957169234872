use crate::protocol::mysql::constants::{LATIN1_SWEDISH_CI, VERSION_COMMENT};
use crate::protocol::mysql::error_codes::ErrorKind;
use crate::protocol::mysql::packet::packet_writer::PacketWriter;
use crate::protocol::mysql::packet::writers::{
    write_err_packet, write_ok_packet, write_resultset, ColumnDef,
};
use crate::server::ServerCtx;

use mysql_common::constants::{ColumnFlags, ColumnType, StatusFlags};
use regex::Regex;
use std::io;
use std::sync::OnceLock;
use tokio::io::AsyncWrite;
use tracing::debug;

/// Replicas probe their master with a fixed query sequence after auth; the
/// relay answers each from this table and refuses everything else.
pub async fn on_query<W: AsyncWrite + Unpin>(
    ctx: &ServerCtx,
    query: &[u8],
    w: &mut PacketWriter<W>,
) -> io::Result<()> {
    let raw = String::from_utf8_lossy(query);
    let query = normalize(&raw);
    debug!(query = %query, "downstream query");
    match query.as_str() {
        "select @@version_comment limit 1" => {
            one_string_row(w, "@@version_comment", VERSION_COMMENT).await
        }
        "show variables like 'server_id'" => {
            variable_row(w, "server_id", &ctx.server.server_id.to_string()).await
        }
        "show variables like 'server_uuid'" => {
            variable_row(w, "server_uuid", &ctx.server.uuid).await
        }
        "select unix_timestamp()" => {
            let now = chrono::Utc::now().timestamp().to_string();
            let cols = vec![ColumnDef {
                name: "unix_timestamp()",
                charset: LATIN1_SWEDISH_CI,
                column_length: 11,
                column_type: ColumnType::MYSQL_TYPE_LONGLONG,
                decimals: 127,
                ..Default::default()
            }];
            write_resultset(w, &cols, &[vec![Some(now)]]).await
        }
        "select version()" => one_string_row(w, "version()", &ctx.server.version).await,
        "set @master_binlog_checksum='none'"
        | "set @master_binlog_checksum=@@global.binlog_checksum" => ok(w).await,
        "select @master_binlog_checksum" => {
            one_string_row(w, "@master_binlog_checksum", "CRC32").await
        }
        "select @@global.gtid_mode" => one_string_row(w, "@@global.gtid_mode", "OFF").await,
        _ if query.starts_with("set @master_heartbeat_period=")
            || query.starts_with("set @slave_uuid=")
            || query.starts_with("set names ") =>
        {
            ok(w).await
        }
        _ => {
            write_err_packet(ErrorKind::ER_NOT_SUPPORTED_YET, b"this", w).await?;
            w.flush_all().await
        }
    }
}

/// Lowercase, trim, and collapse any spaces around `[ ~!%^&*()=+<>,/.-]`
/// down to the single special character. Idempotent.
pub fn normalize(query: &str) -> String {
    static NORMALIZE_RE: OnceLock<Regex> = OnceLock::new();
    let re = NORMALIZE_RE
        .get_or_init(|| Regex::new(r"[ ]*([ ~!%^&*()=+<>,/.\-])[ ]*").expect("fixed pattern"));
    re.replace_all(query.trim(), "$1").to_lowercase()
}

async fn ok<W: AsyncWrite + Unpin>(w: &mut PacketWriter<W>) -> io::Result<()> {
    write_ok_packet(w, StatusFlags::SERVER_STATUS_AUTOCOMMIT).await?;
    w.flush_all().await
}

async fn one_string_row<W: AsyncWrite + Unpin>(
    w: &mut PacketWriter<W>,
    name: &'static str,
    value: &str,
) -> io::Result<()> {
    let cols = vec![ColumnDef {
        name,
        charset: LATIN1_SWEDISH_CI,
        column_length: 28,
        decimals: 127,
        ..Default::default()
    }];
    write_resultset(w, &cols, &[vec![Some(value.to_string())]]).await
}

/// The two-column `SHOW VARIABLES LIKE ...` shape.
async fn variable_row<W: AsyncWrite + Unpin>(
    w: &mut PacketWriter<W>,
    name: &str,
    value: &str,
) -> io::Result<()> {
    let cols = vec![
        ColumnDef {
            schema: "information_schema",
            table: "VARIABLES",
            org_table: "VARIABLES",
            name: "Variable_name",
            org_name: "VARIABLE_NAME",
            charset: LATIN1_SWEDISH_CI,
            column_length: 192,
            flags: ColumnFlags::NOT_NULL_FLAG,
            ..Default::default()
        },
        ColumnDef {
            schema: "information_schema",
            table: "VARIABLES",
            org_table: "VARIABLES",
            name: "Variable_value",
            org_name: "VARIABLE_VALUE",
            charset: LATIN1_SWEDISH_CI,
            column_length: 3072,
            ..Default::default()
        },
    ];
    let rows = vec![vec![Some(name.to_string()), Some(value.to_string())]];
    write_resultset(w, &cols, &rows).await
}
