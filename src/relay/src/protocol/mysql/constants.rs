use mysql_common::constants::CapabilityFlags;
use num_derive::{FromPrimitive, ToPrimitive};
use std::sync::OnceLock;
use strum_macros::AsRefStr;

// max packet payload length (24-bit length field).
pub const MAX_PAYLOAD_LEN: usize = 16_777_215;

pub const PACKET_HEADER_LEN: usize = 4;
/// auth-plugin-data-part-1: the first 8 bytes of the scramble.
pub const AUTH_PLUGIN_DATA_PART_1_LENGTH: usize = 8;
/// Full scramble length (part-1 + part-2).
pub const SCRAMBLE_SIZE: usize = 20;

/// Magic at offset 0 of every binlog file.
pub const BINLOG_MAGIC: [u8; 4] = [0xfe, b'b', b'i', b'n'];
/// First event offset, immediately past the magic.
pub const BINLOG_START_POS: u64 = 4;

/// Version advertised in `select @@version_comment`.
pub const VERSION_COMMENT: &str = "MySQL Relay Server 0.1.0";

/// First payload byte of a semisync-decorated event or an ack packet.
pub const SEMISYNC_INDICATOR: u8 = 0xef;

#[derive(Debug, PartialEq, AsRefStr)]
pub enum AuthPluginName {
    #[strum(serialize = "mysql_old_password")]
    AuthMySQlOldPassword,
    #[strum(serialize = "mysql_native_password")]
    AuthNativePassword,
}

#[derive(Debug, PartialEq, ToPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum HeaderInfo {
    OKHeader = 0x00,
    ErrHeader = 0xff,
    EOFHeader = 0xfe,
    NullHeader = 0xfb,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum CommandCode {
    ComSleep = 0,
    ComQuit,
    ComInitDB,
    ComQuery,
    ComFieldList,
    ComCreateDB,
    ComDropDB,
    ComRefresh,
    ComShutdown,
    ComStatistics,
    ComProcessInfo,
    ComConnect,
    ComProcessKill,
    ComDebug,
    ComPing,
    ComTime,
    ComDelayedInsert,
    ComChangeUser,
    ComBinlogDump,
    ComTableDump,
    ComConnectOut,
    ComRegisterSlave,
    ComStmtPrepare,
    ComStmtExecute,
    ComStmtSendLongData,
    ComStmtClose,
    ComStmtReset,
    ComSetOption,
    ComStmtFetch,
    ComDaemon,
    ComBinlogDumpGtid,
    ComResetConnection,
    ComEnd,
}

/// Capabilities the relay requires on both sides of every connection.
///
/// Acting as a client we refuse masters missing any of these; acting as a
/// server we advertise exactly this set and refuse replicas that negotiated
/// without it.
pub fn relay_capabilities() -> CapabilityFlags {
    static RELAY_CAP: OnceLock<CapabilityFlags> = OnceLock::new();
    *RELAY_CAP.get_or_init(|| {
        CapabilityFlags::CLIENT_PROTOCOL_41
            | CapabilityFlags::CLIENT_PLUGIN_AUTH
            | CapabilityFlags::CLIENT_SECURE_CONNECTION
            | CapabilityFlags::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA
    })
}

// Charset ids used by the fixed resultsets.
pub const LATIN1_SWEDISH_CI: u16 = 8;
pub const UTF8_GENERAL_CI: u16 = 33;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_packet_size() {
        let max_u24_size = 16_777_215;
        assert_eq!(max_u24_size, MAX_PAYLOAD_LEN);
    }

    #[test]
    fn command_codes_match_wire_values() {
        assert_eq!(CommandCode::ComQuery as u8, 3);
        assert_eq!(CommandCode::ComPing as u8, 14);
        assert_eq!(CommandCode::ComBinlogDump as u8, 18);
        assert_eq!(CommandCode::ComRegisterSlave as u8, 21);
    }

    #[test]
    fn relay_capability_set() {
        let caps = relay_capabilities();
        assert!(caps.contains(CapabilityFlags::CLIENT_PROTOCOL_41));
        assert!(caps.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH));
        assert!(caps.contains(CapabilityFlags::CLIENT_SECURE_CONNECTION));
        assert!(caps.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA));
    }

    #[test]
    fn plugin_names() {
        assert_eq!(
            AuthPluginName::AuthNativePassword.as_ref(),
            "mysql_native_password"
        );
    }
}
