use crate::protocol::mysql::constants::MAX_PAYLOAD_LEN;
use crate::protocol::mysql::packet::{Packet, PacketHeader};

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Reads whole MySQL packets off a stream into a reusable scratch buffer,
/// reassembling 16M continuation frames. Suitable for the command phase;
/// binlog event streaming frames packets itself (see `upstream::pipeline`).
pub struct PacketReader<R> {
    scratch: Vec<u8>,
    pub r: R,
}

impl<R> PacketReader<R> {
    pub fn new(r: R) -> Self {
        PacketReader {
            scratch: Vec::new(),
            r,
        }
    }

    pub fn into_inner(self) -> R {
        self.r
    }
}

impl<R: AsyncRead + Unpin> PacketReader<R> {
    /// Next `(sequence, payload)`. `Ok(None)` on clean end of stream.
    pub async fn next_async(&mut self) -> io::Result<Option<(u8, Packet)>> {
        let mut head = [0u8; 4];
        match self.r.read_exact(&mut head).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }
        let mut header = PacketHeader::from_bytes(head);
        let seq = header.seq;

        self.scratch.clear();
        loop {
            let start = self.scratch.len();
            self.scratch.resize(start + header.length as usize, 0);
            self.r.read_exact(&mut self.scratch[start..]).await?;
            if (header.length as usize) < MAX_PAYLOAD_LEN {
                break;
            }
            // continuation frame follows
            self.r.read_exact(&mut head).await?;
            header = PacketHeader::from_bytes(head);
        }
        Ok(Some((seq, Packet::from_vec(std::mem::take(&mut self.scratch)))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn read_one_ping() {
        let bytes = vec![0x01, 0x00, 0x00, 0x00, 0x0e];
        let mut reader = PacketReader::new(Cursor::new(bytes));
        let (seq, packet) = reader.next_async().await.unwrap().unwrap();
        assert_eq!(seq, 0);
        assert_eq!(&*packet, &[0x0e]);
        assert!(reader.next_async().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn read_sequence_and_payload() {
        let mut bytes = vec![0x03, 0x00, 0x00, 0x05];
        bytes.extend_from_slice(b"abc");
        let mut reader = PacketReader::new(Cursor::new(bytes));
        let (seq, packet) = reader.next_async().await.unwrap().unwrap();
        assert_eq!(seq, 5);
        assert_eq!(&*packet, b"abc");
    }

    #[tokio::test]
    async fn reassembles_max_payload_continuation() {
        let mut bytes = vec![0xff, 0xff, 0xff, 0x00];
        bytes.extend(std::iter::repeat(0u8).take(MAX_PAYLOAD_LEN));
        bytes.extend_from_slice(&[0x01, 0x00, 0x00, 0x01, 0x10]);
        let mut reader = PacketReader::new(Cursor::new(bytes));
        let (seq, packet) = reader.next_async().await.unwrap().unwrap();
        assert_eq!(seq, 0);
        assert_eq!(packet.len(), MAX_PAYLOAD_LEN + 1);
        assert_eq!(packet[MAX_PAYLOAD_LEN], 0x10);
    }

    #[tokio::test]
    async fn truncated_payload_is_an_error() {
        let bytes = vec![0x05, 0x00, 0x00, 0x00, b'a', b'b'];
        let mut reader = PacketReader::new(Cursor::new(bytes));
        assert!(reader.next_async().await.is_err());
    }
}
