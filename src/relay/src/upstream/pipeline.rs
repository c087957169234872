use crate::error::{RelayError, RelayResult};
use crate::protocol::mysql::basic::err_packet;
use crate::protocol::mysql::binlog::{
    EventHeader, EventType, FormatDescriptionEvent, RotateEvent, CHECKSUM_ALG_CRC32,
    EVENT_HEADER_LEN,
};
use crate::protocol::mysql::constants::{BINLOG_MAGIC, BINLOG_START_POS, SEMISYNC_INDICATOR};
use crate::protocol::mysql::packet::packet_writer::PacketWriter;
use crate::protocol::mysql::packet::writers::write_semisync_ack;
use crate::protocol::mysql::packet::{read_packet_header, PayloadReader};
use crate::upstream::file_index::FileIndex;
use crate::upstream::ops_log::OpsLog;
use crate::util::{barrier, deadline, PairError};

use common::metrics::metric_def::{RELAY_BYTES_WRITTEN, RELAY_EVENTS_RELAYED, RELAY_SEMISYNC_ACKS};
use common::metrics::{counter_add, upstream_labels};
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Buffers circulating between the dumper and the writer. The dumper can
/// hold at most this many event chunks in flight; each buffer is owned by
/// exactly one task at a time.
pub const POOL_BUFFERS: usize = 4;
pub const POOL_BUFFER_SIZE: usize = 16 * 1024;
/// Scratch for packet headers, error packets and the small metadata events
/// the dumper parses in place.
const DUMP_SCRATCH_SIZE: usize = 8192;

/// One chunk of one event on its way to disk.
pub struct WriteTask {
    pub name: Arc<str>,
    /// File offset of this chunk.
    pub pos: u64,
    pub buf: Vec<u8>,
    pub len: usize,
    pub seq: u8,
    /// Last chunk of the event: commit to the index, maybe fsync.
    pub end_of_event: bool,
    /// Master-side position to acknowledge once durable.
    pub ack_pos: Option<u64>,
}

pub struct DumpConfig {
    pub upstream: String,
    pub local_dir: PathBuf,
    pub start_file: String,
    pub start_pos: u64,
    pub read_timeout: Duration,
    pub sync_binlog: u32,
    pub semisync: bool,
}

/// Drive one dump session: the dumper reads events off `reader`, the writer
/// persists them and keeps the index, the ack sender answers semisync
/// requests on `ack_writer`. Ends when either side fails or the master
/// closes the stream; both errors are surfaced.
pub async fn run<R, W>(
    mut reader: R,
    ack_writer: PacketWriter<W>,
    index: Arc<FileIndex>,
    ops: Arc<OpsLog>,
    cfg: DumpConfig,
) -> Result<(), PairError<RelayError>>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (bufs_tx, bufs_rx) = mpsc::channel::<Vec<u8>>(POOL_BUFFERS);
    let (tasks_tx, tasks_rx) = mpsc::channel::<WriteTask>(POOL_BUFFERS);
    let (ack_tx, ack_rx) = mpsc::channel::<(Arc<str>, u64)>(POOL_BUFFERS);
    for _ in 0..POOL_BUFFERS {
        bufs_tx
            .send(vec![0u8; POOL_BUFFER_SIZE])
            .await
            .expect("fresh pool channel");
    }

    let ack_task = tokio::spawn(send_acks(ack_rx, ack_writer, cfg.upstream.clone()));

    let dumper = dump_events(&mut reader, bufs_rx, tasks_tx, &cfg, ops.clone());
    let writer = write_events(tasks_rx, bufs_tx, ack_tx, index, ops, &cfg);
    let result = barrier(dumper, writer).await;

    // the writer dropped its ack sender; let the forwarder drain and stop
    let _ = ack_task.await;
    result
}

async fn send_acks<W: AsyncWrite + Unpin>(
    mut ack_rx: mpsc::Receiver<(Arc<str>, u64)>,
    mut writer: PacketWriter<W>,
    upstream: String,
) {
    let labels = upstream_labels(&upstream);
    while let Some((name, pos)) = ack_rx.recv().await {
        if let Err(e) = write_semisync_ack(&mut writer, &name, pos).await {
            warn!(upstream = %upstream, "semisync ack failed: {e}");
            break;
        }
        counter_add(RELAY_SEMISYNC_ACKS, 1, Some(&labels));
    }
}

async fn dump_events<R: AsyncRead + Unpin>(
    reader: &mut R,
    mut bufs_rx: mpsc::Receiver<Vec<u8>>,
    tasks_tx: mpsc::Sender<WriteTask>,
    cfg: &DumpConfig,
    ops: Arc<OpsLog>,
) -> RelayResult<()> {
    let mut scratch = vec![0u8; DUMP_SCRATCH_SIZE];
    let mut expected_seq: u8 = 1;
    let mut target_name: Arc<str> = Arc::from(cfg.start_file.as_str());
    let mut target_pos: u64 = cfg.start_pos;
    let mut has_checksum = false;

    loop {
        let header = deadline(cfg.read_timeout, read_packet_header(reader)).await?;
        if header.seq != expected_seq {
            return Err(RelayError::SequenceMismatch {
                expected: expected_seq,
                got: header.seq,
            });
        }
        expected_seq = expected_seq.wrapping_add(1);

        let plen = header.length as usize;
        if plen == 0 {
            return Err(RelayError::BadPacket);
        }
        let first_len = std::cmp::min(plen, scratch.len());
        deadline(cfg.read_timeout, reader.read_exact(&mut scratch[..first_len])).await?;

        match scratch[0] {
            0x00 => {}
            0xff => {
                let (_, err) =
                    err_packet(&scratch[..first_len]).map_err(|_| RelayError::BadPacket)?;
                return Err(RelayError::Server {
                    code: err.error_code,
                    state: err.sql_state,
                    message: err.message,
                });
            }
            0xfe if plen < 9 => {
                // EOF: the master ended the dump cleanly
                return Ok(());
            }
            other => return Err(RelayError::NotGenericResponse(other)),
        }

        let mut offset = 1usize;
        let mut ack_requested = false;
        if cfg.semisync {
            if first_len < 3 || scratch[1] != SEMISYNC_INDICATOR {
                return Err(RelayError::BadPacket);
            }
            ack_requested = scratch[2] == 0x01;
            offset = 3;
        }
        if first_len < offset + EVENT_HEADER_LEN {
            return Err(RelayError::BadPacket);
        }
        let event_header = EventHeader::parse(&scratch[offset..offset + EVENT_HEADER_LEN])?;
        let event_len = plen - offset;
        let is_fake = event_header.is_fake();

        // metadata events are small enough to sit fully in the scratch
        let mut rotate: Option<RotateEvent> = None;
        match event_header.event_type() {
            Ok(EventType::FormatDescription) if first_len >= plen => {
                let body = &scratch[offset + EVENT_HEADER_LEN..offset + event_len];
                let fde = FormatDescriptionEvent::parse(body)?;
                has_checksum = fde.checksum_alg == CHECKSUM_ALG_CRC32;
                info!(
                    upstream = %cfg.upstream,
                    version = %fde.server_version,
                    checksum = has_checksum,
                    "format description event"
                );
            }
            Ok(EventType::Rotate) if first_len >= plen => {
                let body = &scratch[offset + EVENT_HEADER_LEN..offset + event_len];
                rotate = Some(RotateEvent::parse(body, has_checksum)?);
            }
            _ => {}
        }

        let discard = is_fake
            || matches!(event_header.event_type(), Ok(EventType::Heartbeat));
        if discard {
            if plen > first_len {
                let mut payload = PayloadReader::new(reader, &scratch[..first_len], plen, first_len);
                deadline(cfg.read_timeout, payload.drain()).await?;
            }
            if let Some(rotate) = rotate {
                debug!(upstream = %cfg.upstream, to = %rotate.next_name, pos = rotate.position, "fake rotate");
                ops.info(&format!(
                    "rotate (out of band) to {}:{}",
                    rotate.next_name, rotate.position
                ));
                target_name = Arc::from(rotate.next_name.as_str());
                target_pos = rotate.position;
            }
            continue;
        }

        // stream the event bytes to the writer through the pool
        let event_start = target_pos;
        let ack_pos = ack_requested.then_some(u64::from(event_header.log_pos));
        let mut sent: u64 = 0;
        let mut payload = PayloadReader::new(reader, &scratch[..first_len], plen, offset);
        while payload.remaining() > 0 {
            let Some(mut buf) = bufs_rx.recv().await else {
                // writer is gone; its error carries the cause
                return Ok(());
            };
            let n = deadline(cfg.read_timeout, payload.read(&mut buf)).await?;
            sent += n as u64;
            let task = WriteTask {
                name: target_name.clone(),
                pos: event_start + sent - n as u64,
                buf,
                len: n,
                seq: header.seq,
                end_of_event: payload.remaining() == 0,
                ack_pos: if payload.remaining() == 0 { ack_pos } else { None },
            };
            if tasks_tx.send(task).await.is_err() {
                return Ok(());
            }
        }
        target_pos = event_start + u64::from(event_len as u32);

        if let Some(rotate) = rotate {
            ops.info(&format!(
                "rotate to {}:{}",
                rotate.next_name, rotate.position
            ));
            target_name = Arc::from(rotate.next_name.as_str());
            target_pos = rotate.position;
        }
    }
}

struct OpenBinlog {
    name: Arc<str>,
    file: File,
    offset: u64,
}

async fn write_events(
    mut tasks_rx: mpsc::Receiver<WriteTask>,
    bufs_tx: mpsc::Sender<Vec<u8>>,
    ack_tx: mpsc::Sender<(Arc<str>, u64)>,
    index: Arc<FileIndex>,
    ops: Arc<OpsLog>,
    cfg: &DumpConfig,
) -> RelayResult<()> {
    let labels = upstream_labels(&cfg.upstream);
    let mut current: Option<OpenBinlog> = None;
    let mut event_bytes: u64 = 0;
    let mut events_since_sync: u32 = 0;
    let mut pending_ack: Option<(Arc<str>, u64)> = None;

    while let Some(task) = tasks_rx.recv().await {
        if current.as_ref().map(|c| &*c.name) != Some(&*task.name) {
            if let Some(old) = current.take() {
                old.file.sync_data().await?;
                ops.info(&format!("sealed {} at {}", old.name, old.offset));
            }
            current = Some(open_binlog(cfg, &index, &ops, &task).await?);
        }
        let open = current.as_mut().expect("current binlog file");

        open.file.write_all(&task.buf[..task.len]).await?;
        open.offset += task.len as u64;
        event_bytes += task.len as u64;

        // hand the buffer back; the dumper may already be gone
        let _ = bufs_tx.send(task.buf).await;

        if task.end_of_event {
            if let Some(pos) = task.ack_pos {
                pending_ack = Some((task.name.clone(), pos));
            }
            events_since_sync += 1;
            if events_since_sync >= cfg.sync_binlog {
                open.file.sync_data().await?;
                events_since_sync = 0;
                if let Some((name, pos)) = pending_ack.take() {
                    let _ = ack_tx.send((name, pos)).await;
                }
            }
            index.grow_tail(event_bytes, 1);
            counter_add(RELAY_EVENTS_RELAYED, 1, Some(&labels));
            counter_add(RELAY_BYTES_WRITTEN, event_bytes, Some(&labels));
            event_bytes = 0;
        }
    }

    if let Some(open) = current.take() {
        open.file.sync_data().await?;
    }
    Ok(())
}

async fn open_binlog(
    cfg: &DumpConfig,
    index: &FileIndex,
    ops: &OpsLog,
    task: &WriteTask,
) -> RelayResult<OpenBinlog> {
    let path = cfg.local_dir.join(&*task.name);
    if task.pos > BINLOG_START_POS {
        // resuming into a file captured earlier
        let mut file = OpenOptions::new().write(true).read(true).open(&path).await?;
        file.seek(SeekFrom::Start(task.pos)).await?;
        index.append_file(&task.name, task.pos);
        ops.info(&format!("resumed {} at {}", task.name, task.pos));
        Ok(OpenBinlog {
            name: task.name.clone(),
            file,
            offset: task.pos,
        })
    } else {
        let mut file = File::create(&path).await?;
        file.write_all(&BINLOG_MAGIC).await?;
        index.append_file(&task.name, BINLOG_START_POS);
        ops.info(&format!("created {}", task.name));
        Ok(OpenBinlog {
            name: task.name.clone(),
            file,
            offset: BINLOG_START_POS,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::mysql::binlog::build_fake_rotate;
    use crate::protocol::mysql::constants::BINLOG_MAGIC;

    fn event_bytes(
        event_type: EventType,
        server_id: u32,
        body: &[u8],
        log_pos: u32,
    ) -> Vec<u8> {
        let total = EVENT_HEADER_LEN + body.len();
        let header = EventHeader {
            timestamp: 1,
            event_type: event_type as u8,
            server_id,
            event_size: total as u32,
            log_pos,
            flags: 0,
        };
        let mut event = vec![0u8; EVENT_HEADER_LEN];
        header.write_to(&mut event);
        event.extend_from_slice(body);
        event
    }

    fn frame(seq: u8, event: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let len = (event.len() + 1) as u32;
        out.extend_from_slice(&len.to_le_bytes()[..3]);
        out.push(seq);
        out.push(0x00);
        out.extend_from_slice(event);
        out
    }

    fn sample_fde(log_pos: u32) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&4u16.to_le_bytes());
        let mut ver = [0u8; 50];
        ver[..6].copy_from_slice(b"5.5.40");
        body.extend_from_slice(&ver);
        body.extend_from_slice(&0u32.to_le_bytes());
        body.push(EVENT_HEADER_LEN as u8);
        body.extend_from_slice(&[0u8; 35]);
        event_bytes(EventType::FormatDescription, 1, &body, log_pos)
    }

    /// Full session: fake rotate, FDE, events, real rotate; the local file
    /// carries the non-fake events in order and the index matches.
    #[tokio::test]
    async fn end_to_end_session() {
        let dir = tempfile::tempdir().unwrap();
        let index = Arc::new(FileIndex::new());
        let ops = Arc::new(OpsLog::open(dir.path(), "test").unwrap());

        let mut wire = Vec::new();
        let mut seq = 1u8;
        let mut push = |frame_bytes: Vec<u8>| wire.extend_from_slice(&frame_bytes);

        // artificial rotate to log.000001:4
        push(frame(seq, &build_fake_rotate(1, "log.000001", 4)));
        seq += 1;

        let fde = sample_fde(4 + 93);
        push(frame(seq, &fde));
        seq += 1;

        let mut pos = 4 + fde.len() as u32;
        let mut real_events = vec![fde.clone()];
        for body in [&b"BEGIN"[..], &b"TBLMAP"[..], &b"WRITEROWS"[..], &b"XID"[..]] {
            let size = (EVENT_HEADER_LEN + body.len()) as u32;
            pos += size;
            let event = event_bytes(EventType::Query, 1, body, pos);
            push(frame(seq, &event));
            real_events.push(event);
            seq += 1;
        }

        // real rotate to log.000002
        let mut rotate_body = Vec::new();
        rotate_body.extend_from_slice(&4u64.to_le_bytes());
        rotate_body.extend_from_slice(b"log.000002");
        let rotate_size = (EVENT_HEADER_LEN + rotate_body.len()) as u32;
        pos += rotate_size;
        let rotate = event_bytes(EventType::Rotate, 1, &rotate_body, pos);
        push(frame(seq, &rotate));
        real_events.push(rotate);
        seq += 1;

        // one event into the next file
        let next_event = event_bytes(EventType::Query, 1, b"BEGIN2", 4 + 25 + 6);
        push(frame(seq, &next_event));

        let cfg = DumpConfig {
            upstream: "test".into(),
            local_dir: dir.path().to_path_buf(),
            start_file: "log.000001".into(),
            start_pos: 4,
            read_timeout: Duration::from_secs(5),
            sync_binlog: 1,
            semisync: false,
        };
        let ack_writer = PacketWriter::new(Vec::new());
        run(
            std::io::Cursor::new(wire),
            ack_writer,
            index.clone(),
            ops,
            cfg,
        )
        .await
        .unwrap_err(); // the cursor ends mid-session: an UnexpectedEof from the dumper

        // first file: magic + fde + 4 events + rotate, in order
        let mut expect = BINLOG_MAGIC.to_vec();
        for event in &real_events {
            expect.extend_from_slice(event);
        }
        let written = std::fs::read(dir.path().join("log.000001")).unwrap();
        assert_eq!(written, expect);

        let entries = index.entries_snapshot();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "log.000001");
        assert_eq!(entries[0].size, expect.len() as u64);
        assert_eq!(entries[0].count, 6);
        assert_eq!(entries[1].name, "log.000002");
        assert_eq!(entries[1].size, 4 + next_event.len() as u64);
        assert_eq!(entries[1].count, 1);

        let second = std::fs::read(dir.path().join("log.000002")).unwrap();
        assert_eq!(&second[..4], &BINLOG_MAGIC);
        assert_eq!(&second[4..], &next_event[..]);
    }

    #[tokio::test]
    async fn sequence_mismatch_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let index = Arc::new(FileIndex::new());
        let ops = Arc::new(OpsLog::open(dir.path(), "test").unwrap());
        let wire = frame(7, &build_fake_rotate(1, "log.000001", 4));
        let cfg = DumpConfig {
            upstream: "test".into(),
            local_dir: dir.path().to_path_buf(),
            start_file: "log.000001".into(),
            start_pos: 4,
            read_timeout: Duration::from_secs(5),
            sync_binlog: 1,
            semisync: false,
        };
        let err = run(
            std::io::Cursor::new(wire),
            PacketWriter::new(Vec::new()),
            index,
            ops,
            cfg,
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err.dumper,
            Some(RelayError::SequenceMismatch { expected: 1, got: 7 })
        ));
    }

    #[tokio::test]
    async fn err_packet_aborts_with_server_error() {
        let dir = tempfile::tempdir().unwrap();
        let index = Arc::new(FileIndex::new());
        let ops = Arc::new(OpsLog::open(dir.path(), "test").unwrap());

        let mut payload = vec![0xff, 0xd4, 0x04, b'#'];
        payload.extend_from_slice(b"HY000");
        payload.extend_from_slice(b"Could not find first log file name");
        let mut wire = Vec::new();
        wire.extend_from_slice(&(payload.len() as u32).to_le_bytes()[..3]);
        wire.push(1);
        wire.extend_from_slice(&payload);

        let cfg = DumpConfig {
            upstream: "test".into(),
            local_dir: dir.path().to_path_buf(),
            start_file: "log.000001".into(),
            start_pos: 4,
            read_timeout: Duration::from_secs(5),
            sync_binlog: 1,
            semisync: false,
        };
        let err = run(
            std::io::Cursor::new(wire),
            PacketWriter::new(Vec::new()),
            index,
            ops,
            cfg,
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err.dumper,
            Some(RelayError::Server { code: 1236, .. })
        ));
    }

    /// An event larger than one pool buffer streams through in chunks and
    /// still commits as a single index entry.
    #[tokio::test]
    async fn large_event_streams_through_pool() {
        let dir = tempfile::tempdir().unwrap();
        let index = Arc::new(FileIndex::new());
        let ops = Arc::new(OpsLog::open(dir.path(), "big").unwrap());

        let body = vec![0xabu8; POOL_BUFFER_SIZE * 3 + 123];
        let size = (EVENT_HEADER_LEN + body.len()) as u32;
        let event = event_bytes(EventType::Query, 1, &body, 4 + size);
        let wire = frame(1, &event);

        let cfg = DumpConfig {
            upstream: "big".into(),
            local_dir: dir.path().to_path_buf(),
            start_file: "log.000001".into(),
            start_pos: 4,
            read_timeout: Duration::from_secs(5),
            sync_binlog: 1,
            semisync: false,
        };
        let err = run(
            std::io::Cursor::new(wire),
            PacketWriter::new(Vec::new()),
            index.clone(),
            ops,
            cfg,
        )
        .await
        .unwrap_err();
        assert!(matches!(err.dumper, Some(RelayError::Io(_))));

        let written = std::fs::read(dir.path().join("log.000001")).unwrap();
        assert_eq!(written.len(), 4 + event.len());
        assert_eq!(&written[4..], &event[..]);
        let entry = index.info_by_index(0).unwrap();
        assert_eq!(entry.count, 1);
        assert_eq!(entry.size, 4 + event.len() as u64);
    }
}
