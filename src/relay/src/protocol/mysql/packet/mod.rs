pub mod packet_reader;
pub mod packet_writer;
pub mod writers;

use crate::protocol::mysql::constants::HeaderInfo;
use std::io;
use std::ops::Deref;
use tokio::io::{AsyncRead, AsyncReadExt};

/// One reassembled payload of the MySQL wire protocol. Packets larger than
/// 16M-1 arrive split; [`packet_reader::PacketReader`] joins them before
/// handing out a `Packet`.
/// [MySQL Packet](https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_basic_packets.html)
#[derive(Clone, Debug)]
pub struct Packet(Vec<u8>);

impl Packet {
    pub fn from_vec(vec: Vec<u8>) -> Self {
        Packet(vec)
    }

    pub fn is_ok_packet(&self) -> bool {
        !self.0.is_empty() && self.0[0] == (HeaderInfo::OKHeader as u8)
    }

    pub fn is_err_packet(&self) -> bool {
        !self.0.is_empty() && self.0[0] == (HeaderInfo::ErrHeader as u8)
    }

    /// See [MySQL EOF_Packet](https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_basic_eof_packet.html)
    pub fn is_eof_packet(&self) -> bool {
        !self.0.is_empty() && self.0[0] == (HeaderInfo::EOFHeader as u8) && self.0.len() <= 5
    }
}

impl AsRef<[u8]> for Packet {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Deref for Packet {
    type Target = [u8];
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

/// The 4-byte frame header: 24-bit payload length, 8-bit sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub length: u32,
    pub seq: u8,
}

impl PacketHeader {
    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        let word = u32::from_le_bytes(bytes);
        PacketHeader {
            length: word & 0x00ff_ffff,
            seq: (word >> 24) as u8,
        }
    }

    pub fn to_bytes(self) -> [u8; 4] {
        ((self.length & 0x00ff_ffff) | (u32::from(self.seq) << 24)).to_le_bytes()
    }
}

/// Read just the frame header from a raw stream. The binlog dumper frames
/// packets itself so it can stream large event bodies through a bounded
/// buffer pool instead of reassembling them.
pub async fn read_packet_header<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<PacketHeader> {
    let mut head = [0u8; 4];
    r.read_exact(&mut head).await?;
    Ok(PacketHeader::from_bytes(head))
}

/// Streams one packet payload: first out of the scratch bytes that were read
/// while inspecting the packet, then straight from the connection, under an
/// exact budget of `total` payload bytes.
pub struct PayloadReader<'a, R> {
    reader: &'a mut R,
    first: &'a [u8],
    pos: usize,
    total: usize,
}

impl<'a, R: AsyncRead + Unpin> PayloadReader<'a, R> {
    /// `first` holds the payload prefix already read from the stream;
    /// `skip` positions the stream past bytes the caller has consumed
    /// (e.g. the one-byte OK prefix of a binlog event packet).
    pub fn new(reader: &'a mut R, first: &'a [u8], total: usize, skip: usize) -> Self {
        debug_assert!(skip <= first.len() && first.len() <= total);
        PayloadReader {
            reader,
            first,
            pos: skip,
            total,
        }
    }

    pub fn remaining(&self) -> usize {
        self.total - self.pos
    }

    /// Fill as much of `buf` as the budget allows; `Ok(0)` at end of payload.
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.total {
            return Ok(0);
        }
        let mut filled = 0;
        while filled < buf.len() && self.pos < self.total {
            if self.pos < self.first.len() {
                let src_end = std::cmp::min(self.first.len(), self.total);
                let n = std::cmp::min(src_end - self.pos, buf.len() - filled);
                buf[filled..filled + n].copy_from_slice(&self.first[self.pos..self.pos + n]);
                self.pos += n;
                filled += n;
            } else {
                let want = std::cmp::min(self.total - self.pos, buf.len() - filled);
                let n = self.reader.read(&mut buf[filled..filled + want]).await?;
                if n == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed inside a packet",
                    ));
                }
                self.pos += n;
                filled += n;
            }
        }
        Ok(filled)
    }

    /// Consume whatever is left of the budget and discard it.
    pub async fn drain(&mut self) -> io::Result<()> {
        let mut sink = [0u8; 512];
        while self.remaining() > 0 {
            self.read(&mut sink).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn header_round_trip() {
        let header = PacketHeader { length: 0x01_0203, seq: 7 };
        assert_eq!(PacketHeader::from_bytes(header.to_bytes()), header);
        assert_eq!(
            PacketHeader::from_bytes([0x01, 0x00, 0x00, 0x00]),
            PacketHeader { length: 1, seq: 0 }
        );
    }

    #[tokio::test]
    async fn payload_reader_spans_scratch_and_stream() {
        let stream_rest = b"6789abcdef".to_vec();
        let mut cursor = Cursor::new(stream_rest);
        // scratch holds the first 6 payload bytes; budget is 16; skip 1.
        let first = b"\x0012345";
        let mut reader = PayloadReader::new(&mut cursor, first, 16, 1);

        let mut out = Vec::new();
        let mut buf = [0u8; 4];
        loop {
            let n = reader.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, b"123456789abcdef");
    }

    #[tokio::test]
    async fn payload_reader_enforces_budget() {
        let mut cursor = Cursor::new(b"abcdefgh".to_vec());
        let first = b"\x00";
        let mut reader = PayloadReader::new(&mut cursor, first, 4, 1);
        let mut buf = [0u8; 16];
        let n = reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"abc");
        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
        // the cursor stopped exactly at the budget
        assert_eq!(cursor.position(), 3);
    }
}
