use crate::error::{RelayError, RelayResult};
use crate::protocol::mysql::basic::ComBinlogDump;
use crate::protocol::mysql::binlog::{
    build_fake_rotate, rewrite_fde_as_fake, EventHeader, EVENT_HEADER_LEN,
};
use crate::protocol::mysql::constants::{BINLOG_START_POS, MAX_PAYLOAD_LEN};
use crate::protocol::mysql::error_codes::ErrorKind;
use crate::protocol::mysql::packet::packet_writer::PacketWriter;
use crate::protocol::mysql::packet::writers::write_err_packet;
use crate::server::UpstreamHandle;
use crate::util::AutoDelayer;

use byteorder::{ByteOrder, LittleEndian};
use std::io::SeekFrom;
use std::io::Write;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

const STREAM_CHUNK: usize = 16 * 1024;

/// Serve COM_BINLOG_DUMP: synthesize the rotate (and, mid-file, the format
/// description), then tail the captured files, blocking on the index when
/// the live file runs dry. Returns only on error or when the peer goes away.
pub async fn run<W: AsyncWrite + Unpin>(
    upstream: &UpstreamHandle,
    writer: &mut PacketWriter<W>,
    dump: &ComBinlogDump,
    server_id: u32,
) -> RelayResult<()> {
    let Some(mut current_index) = upstream.index.find_index(&dump.binlog_filename) else {
        write_err_packet(
            ErrorKind::ER_MASTER_FATAL_ERROR_READING_BINLOG,
            b"Could not find first log file name in binary log index file",
            writer,
        )
        .await?;
        writer.flush_all().await?;
        return Err(RelayError::BinlogNotExists(dump.binlog_filename.clone()));
    };
    let mut current_pos = u64::from(dump.binlog_pos);
    let mut delayer = AutoDelayer::default();
    let mut chunk = vec![0u8; STREAM_CHUNK];

    loop {
        let entry = upstream
            .index
            .info_by_index(current_index)
            .ok_or(RelayError::BadPacket)?;
        debug!(file = %entry.name, pos = current_pos, "dumping file");

        // (a) announce where we are with an artificial rotate
        send_event(writer, &build_fake_rotate(server_id, &entry.name, current_pos)).await?;
        // (b) prime a mid-file replica with the file's format description
        if current_pos > BINLOG_START_POS {
            let fde = read_fake_fde(upstream, &entry.name).await?;
            send_event(writer, &fde).await?;
        }

        let path = upstream.local_dir.join(&entry.name);
        let mut file = File::open(&path).await?;
        file.seek(SeekFrom::Start(current_pos)).await?;
        let mut end_pos = entry.size;

        loop {
            while current_pos < end_pos {
                current_pos =
                    stream_one_event(writer, &mut file, &entry.name, current_pos, &mut chunk)
                        .await?;
            }
            // committed bytes may have grown while we were sending
            let fresh = upstream
                .index
                .info_by_index(current_index)
                .ok_or(RelayError::BadPacket)?;
            if fresh.size > end_pos {
                end_pos = fresh.size;
                delayer.reset();
                continue;
            }
            if !upstream.index.is_tail(current_index) {
                break;
            }
            // live file, fully drained: wait for the writer to commit more
            delayer.delay().await;
        }

        current_index += 1;
        current_pos = BINLOG_START_POS;
        delayer.reset();
    }
}

/// Forward one event from the local file as one wire packet of
/// `EventSize + 1` bytes, OK prefix included. Bytes beyond the header
/// stream through `chunk` without buffering the whole event.
async fn stream_one_event<W: AsyncWrite + Unpin>(
    writer: &mut PacketWriter<W>,
    file: &mut File,
    name: &str,
    pos: u64,
    chunk: &mut [u8],
) -> RelayResult<u64> {
    let mut first = [0u8; EVENT_HEADER_LEN + 1];
    first[0] = 0x00; // wire-level OK prefix
    file.read_exact(&mut first[1..]).await?;
    let header = EventHeader::parse(&first[1..])?;

    if !header.is_fake() && u64::from(header.log_pos) != pos + u64::from(header.event_size) {
        return Err(RelayError::PositionMismatch {
            name: name.to_string(),
            pos,
            log_pos: header.log_pos,
            event_size: header.event_size,
        });
    }
    let total = header.event_size as usize;
    if total < EVENT_HEADER_LEN || total + 1 > MAX_PAYLOAD_LEN {
        return Err(RelayError::BadPacket);
    }

    let mut packet_head = [0u8; 4];
    LittleEndian::write_u24(&mut packet_head, (total + 1) as u32);
    packet_head[3] = writer.seq();
    writer.bump_seq();
    writer.inner.write_all(&packet_head).await?;
    writer.inner.write_all(&first).await?;

    let mut remaining = total - EVENT_HEADER_LEN;
    while remaining > 0 {
        let n = std::cmp::min(remaining, chunk.len());
        file.read_exact(&mut chunk[..n]).await?;
        writer.inner.write_all(&chunk[..n]).await?;
        remaining -= n;
    }
    writer.inner.flush().await?;
    Ok(pos + u64::from(header.event_size))
}

/// Send a synthesized event held in memory as one packet.
async fn send_event<W: AsyncWrite + Unpin>(
    writer: &mut PacketWriter<W>,
    event: &[u8],
) -> RelayResult<()> {
    writer.write_all(&[0x00])?;
    writer.write_all(event)?;
    writer.end_packet().await?;
    writer.flush_all().await?;
    Ok(())
}

/// Read the real FDE at offset 4, force `log_pos` to 0 and refresh its CRC.
async fn read_fake_fde(upstream: &UpstreamHandle, name: &str) -> RelayResult<Vec<u8>> {
    let path = upstream.local_dir.join(name);
    let mut file = File::open(&path).await?;
    file.seek(SeekFrom::Start(BINLOG_START_POS)).await?;
    let mut header_buf = [0u8; EVENT_HEADER_LEN];
    file.read_exact(&mut header_buf).await?;
    let header = EventHeader::parse(&header_buf)?;

    let total = header.event_size as usize;
    if total < EVENT_HEADER_LEN {
        return Err(RelayError::BadPacket);
    }
    let mut event = vec![0u8; total];
    event[..EVENT_HEADER_LEN].copy_from_slice(&header_buf);
    file.read_exact(&mut event[EVENT_HEADER_LEN..]).await?;
    rewrite_fde_as_fake(&mut event)?;
    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::mysql::binlog::{
        event_crc32, EventFlags, EventType, RotateEvent, CHECKSUM_LEN,
    };
    use crate::protocol::mysql::constants::BINLOG_MAGIC;
    use crate::upstream::file_index::FileIndex;
    use std::path::Path;
    use std::sync::Arc;

    fn event_bytes(event_type: EventType, body: &[u8], log_pos: u32) -> Vec<u8> {
        let total = EVENT_HEADER_LEN + body.len();
        let header = EventHeader {
            timestamp: 9,
            event_type: event_type as u8,
            server_id: 1,
            event_size: total as u32,
            log_pos,
            flags: 0,
        };
        let mut event = vec![0u8; EVENT_HEADER_LEN];
        header.write_to(&mut event);
        event.extend_from_slice(body);
        event
    }

    fn fde_body() -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&4u16.to_le_bytes());
        let mut ver = [0u8; 50];
        ver[..6].copy_from_slice(b"5.5.40");
        body.extend_from_slice(&ver);
        body.extend_from_slice(&0u32.to_le_bytes());
        body.push(EVENT_HEADER_LEN as u8);
        body.extend_from_slice(&[0u8; 35]);
        body
    }

    /// A file with magic + FDE + one query event, registered in the index.
    fn fixture(dir: &Path) -> (UpstreamHandle, Vec<u8>, Vec<u8>) {
        let fde = event_bytes(EventType::FormatDescription, &fde_body(), 4 + 111);
        let query = event_bytes(EventType::Query, b"BEGIN", 4 + 111 + 24);
        let mut contents = BINLOG_MAGIC.to_vec();
        contents.extend_from_slice(&fde);
        contents.extend_from_slice(&query);
        std::fs::write(dir.join("log.000001"), &contents).unwrap();

        let index = Arc::new(FileIndex::new());
        index.append_file("log.000001", contents.len() as u64);
        (
            UpstreamHandle {
                index,
                local_dir: dir.to_path_buf(),
            },
            fde,
            query,
        )
    }

    fn split_packets(mut raw: &[u8]) -> Vec<(u8, Vec<u8>)> {
        let mut packets = Vec::new();
        while raw.len() >= 4 {
            let len = u32::from_le_bytes([raw[0], raw[1], raw[2], 0]) as usize;
            packets.push((raw[3], raw[4..4 + len].to_vec()));
            raw = &raw[4 + len..];
        }
        packets
    }

    #[tokio::test]
    async fn missing_binlog_reports_master_fatal_error() {
        let dir = tempfile::tempdir().unwrap();
        let (upstream, _, _) = fixture(dir.path());
        let mut writer = PacketWriter::new(Vec::new());
        writer.set_seq(1);
        let dump = ComBinlogDump {
            binlog_pos: 4,
            flags: 0,
            server_id: 33,
            binlog_filename: "log.999000".into(),
        };
        let err = run(&upstream, &mut writer, &dump, 2).await.unwrap_err();
        assert!(matches!(err, RelayError::BinlogNotExists(_)));

        let packets = split_packets(&writer.inner);
        assert_eq!(packets.len(), 1);
        let (seq, payload) = &packets[0];
        assert_eq!(*seq, 1);
        assert_eq!(payload[0], 0xff);
        assert_eq!(u16::from_le_bytes([payload[1], payload[2]]), 1236);
    }

    #[tokio::test]
    async fn dump_from_start_sends_rotate_then_file_events() {
        let dir = tempfile::tempdir().unwrap();
        let (upstream, fde, query) = fixture(dir.path());
        // a second index entry seals the first file so the loop advances;
        // its backing file is absent, which ends the dump with an error
        // instead of tailing forever.
        upstream.index.append_file("log.000002", 4);

        let mut writer = PacketWriter::new(Vec::new());
        writer.set_seq(1);
        let dump = ComBinlogDump {
            binlog_pos: 4,
            flags: 0,
            server_id: 33,
            binlog_filename: "log.000001".into(),
        };
        let result = run(&upstream, &mut writer, &dump, 2).await;
        assert!(result.is_err());

        let packets = split_packets(&writer.inner);
        // fake rotate for file 1, FDE, query, fake rotate for file 2
        assert!(packets.len() >= 4);
        let seqs: Vec<u8> = packets.iter().map(|(seq, _)| *seq).collect();
        assert_eq!(seqs[..4], [1, 2, 3, 4]);

        // every event packet is OK-prefixed
        for (_, payload) in &packets {
            assert_eq!(payload[0], 0x00);
        }

        // packet 1: artificial rotate announcing log.000001:4
        let rotate_header = EventHeader::parse(&packets[0].1[1..]).unwrap();
        assert!(rotate_header.is_fake());
        assert!(rotate_header.event_flags().contains(EventFlags::ARTIFICIAL));
        assert_eq!(rotate_header.server_id, 2);
        let rotate =
            RotateEvent::parse(&packets[0].1[1 + EVENT_HEADER_LEN..], true).unwrap();
        assert_eq!(rotate.next_name, "log.000001");
        assert_eq!(rotate.position, 4);

        // packets 2 and 3: the file's events, byte-identical
        assert_eq!(&packets[1].1[1..], &fde[..]);
        assert_eq!(&packets[2].1[1..], &query[..]);
        // packet 4: rotate into the next file
        let rotate = RotateEvent::parse(&packets[3].1[1 + EVENT_HEADER_LEN..], true).unwrap();
        assert_eq!(rotate.next_name, "log.000002");
        assert_eq!(rotate.position, 4);
    }

    #[tokio::test]
    async fn mid_file_dump_synthesizes_fde_with_zero_log_pos() {
        let dir = tempfile::tempdir().unwrap();
        let (upstream, fde, query) = fixture(dir.path());
        upstream.index.append_file("log.000002", 4);

        let start = 4 + fde.len() as u32;
        let mut writer = PacketWriter::new(Vec::new());
        writer.set_seq(1);
        let dump = ComBinlogDump {
            binlog_pos: start,
            flags: 0,
            server_id: 33,
            binlog_filename: "log.000001".into(),
        };
        let _ = run(&upstream, &mut writer, &dump, 2).await;

        let packets = split_packets(&writer.inner);
        // rotate, synthesized FDE, then the query event
        let synth = &packets[1].1[1..];
        let synth_header = EventHeader::parse(synth).unwrap();
        assert!(synth_header.is_fake());
        assert_eq!(synth.len(), fde.len());
        // all but log_pos matches the on-disk FDE (5.5 file: no CRC trailer)
        assert_eq!(&synth[..13], &fde[..13]);
        assert_eq!(&synth[17..], &fde[17..]);
        assert_eq!(&packets[2].1[1..], &query[..]);
    }

    #[tokio::test]
    async fn position_mismatch_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        // event whose log_pos disagrees with its offset
        let bogus = event_bytes(EventType::Query, b"BEGIN", 999);
        let mut contents = BINLOG_MAGIC.to_vec();
        contents.extend_from_slice(&bogus);
        std::fs::write(dir.path().join("log.000001"), &contents).unwrap();
        let index = Arc::new(FileIndex::new());
        index.append_file("log.000001", contents.len() as u64);
        let upstream = UpstreamHandle {
            index,
            local_dir: dir.path().to_path_buf(),
        };

        let mut writer = PacketWriter::new(Vec::new());
        writer.set_seq(1);
        let dump = ComBinlogDump {
            binlog_pos: 4,
            flags: 0,
            server_id: 33,
            binlog_filename: "log.000001".into(),
        };
        let err = run(&upstream, &mut writer, &dump, 2).await.unwrap_err();
        assert!(matches!(err, RelayError::PositionMismatch { pos: 4, .. }));
    }

    #[test]
    fn fake_rotate_crc_is_valid() {
        let event = build_fake_rotate(2, "log.000001", 4);
        let trailer_at = event.len() - CHECKSUM_LEN;
        assert_eq!(
            LittleEndian::read_u32(&event[trailer_at..]),
            event_crc32(&event[..trailer_at])
        );
    }
}
