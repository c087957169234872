use crate::protocol::mysql::constants::{MAX_PAYLOAD_LEN, PACKET_HEADER_LEN};

use byteorder::{ByteOrder, LittleEndian};
use std::io;
use std::io::prelude::*;
use std::io::IoSlice;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Buffers one payload via the [`Write`] impl, then `end_packet` frames and
/// emits it. Header and payload go out in a single vectored write so a
/// packet is never torn across syscalls; oversized payloads are split at the
/// 16M boundary with continuation headers.
pub struct PacketWriter<W> {
    buf: Vec<u8>,
    seq: u8,
    pub inner: W,
}

impl<W> PacketWriter<W> {
    pub fn new(write: W) -> Self {
        Self {
            buf: Vec::new(),
            seq: 0,
            inner: write,
        }
    }

    pub fn set_seq(&mut self, seq: u8) {
        self.seq = seq;
    }

    pub fn seq(&self) -> u8 {
        self.seq
    }

    pub fn bump_seq(&mut self) {
        self.seq = self.seq.wrapping_add(1);
    }

    fn take_buffer(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}

impl<W> Write for PacketWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<W: AsyncWrite + Unpin> PacketWriter<W> {
    pub async fn end_packet(&mut self) -> io::Result<()> {
        let mut header = [0u8; PACKET_HEADER_LEN];
        let raw = self.take_buffer();
        if raw.is_empty() {
            LittleEndian::write_u24(&mut header, 0);
            header[3] = self.seq;
            self.bump_seq();
            self.inner.write_all(&header).await?;
            return Ok(());
        }
        for chunk in raw.chunks(MAX_PAYLOAD_LEN) {
            LittleEndian::write_u24(&mut header, chunk.len() as u32);
            header[3] = self.seq;
            self.bump_seq();
            let written = self
                .inner
                .write_vectored(&[IoSlice::new(&header), IoSlice::new(chunk)])
                .await?;
            // if the vectored write did not drain, fall back to write_all
            if written != PACKET_HEADER_LEN + chunk.len() {
                let remaining: Vec<u8> = header
                    .iter()
                    .chain(chunk.iter())
                    .skip(written)
                    .cloned()
                    .collect();
                self.inner.write_all(&remaining).await?;
            }
        }
        Ok(())
    }

    pub async fn flush_all(&mut self) -> io::Result<()> {
        self.inner.flush().await
    }
}
