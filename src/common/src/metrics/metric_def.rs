pub const RELAY_CURR_PEERS: &str = "relay_curr_peers";
pub const RELAY_PEERS_TOTAL: &str = "relay_peers_total";
pub const RELAY_EVENTS_RELAYED: &str = "relay_events_relayed_total";
pub const RELAY_BYTES_WRITTEN: &str = "relay_bytes_written_total";
pub const RELAY_UPSTREAM_RECONNECTS: &str = "relay_upstream_reconnects_total";
pub const RELAY_SEMISYNC_ACKS: &str = "relay_semisync_acks_total";
