use mysql_common::constants::CapabilityFlags;

/// Everything that can go wrong between the wire and the local binlog files.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("bad packet")]
    BadPacket,
    #[error("bad handshake packet")]
    BadHandshake,
    #[error("buffer not sufficient for packet of {0} bytes")]
    BufferNotSufficient(usize),
    #[error("not a generic response packet (first byte {0:#04x})")]
    NotGenericResponse(u8),
    #[error("expected {expected} packet, got first byte {got:#04x}")]
    WrongPacketType { expected: &'static str, got: u8 },
    #[error("read {got} bytes, expected {expected}")]
    BytesReadMismatch { expected: usize, got: usize },
    #[error("packet sequence mismatch: expected {expected}, got {got}")]
    SequenceMismatch { expected: u8, got: u8 },
    #[error("protocol version {0} not supported")]
    ProtocolNotSupported(u8),
    #[error("peer capability not sufficient: {0:?}")]
    CapabilityNotSufficient(CapabilityFlags),
    #[error("length-encoded integer is NULL")]
    LenencIsNull,
    #[error("invalid length-encoded integer prefix {0:#04x}")]
    LenencInvalid(u8),
    #[error("unknown binlog event type {0}")]
    UnknownEvent(u8),
    #[error("bad binlog file name {0:?}")]
    BadBinlogName(String),
    #[error("binlog {0:?} does not exist")]
    BinlogNotExists(String),
    #[error(
        "binlog position mismatch in {name:?}: at offset {pos}, event claims \
         log_pos {log_pos} with size {event_size}"
    )]
    PositionMismatch {
        name: String,
        pos: u64,
        log_pos: u32,
        event_size: u32,
    },
    /// An ERR packet received from the other side, surfaced as an error.
    #[error("server error {code} ({state}): {message}")]
    Server {
        code: u16,
        state: String,
        message: String,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type RelayResult<T> = Result<T, RelayError>;

impl RelayError {
    /// True for transport-level failures where reconnecting may help, as
    /// opposed to protocol violations that will just repeat.
    pub fn is_io(&self) -> bool {
        matches!(self, RelayError::Io(_))
    }
}
