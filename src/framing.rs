//! Message framing with a carry buffer for overshooting socket reads.
//!
//! Each logical message on the wire is a 4-byte little-endian length `L`
//! followed by exactly `L` payload bytes. A single socket read may deliver
//! more or fewer bytes than one message; the surplus is kept in the
//! `unread` carry buffer and consumed before any fresh socket read. After a
//! complete frame is decoded the carry buffer holds the verbatim head of
//! whatever follows on the stream: the next framed message, or the leading
//! bytes of a raw file body.

use std::collections::VecDeque;
use std::io::{self, Read};

use crate::error::{FrameError, SocketError};
use crate::socket;

/// Wraps a payload in the 4-byte little-endian length prefix.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame: Vec<u8> = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Reads length-prefixed frames off a blocking stream, carrying surplus
/// bytes between calls.
///
/// Deadlines are the stream's responsibility: the caller configures socket
/// timeouts (see [`crate::socket`]), and timed-out reads surface here as
/// [`SocketError::Timeout`].
pub struct FrameReader {
    unread: VecDeque<u8>,
    buffer_size: usize,
    timeout_ms: u64,
}

impl FrameReader {
    pub fn new(buffer_size: usize, timeout_ms: u64) -> Self {
        Self {
            unread: VecDeque::with_capacity(buffer_size),
            buffer_size,
            timeout_ms,
        }
    }

    /// Bytes currently carried over for the next message or file stream.
    pub fn carry_len(&self) -> usize {
        self.unread.len()
    }

    /// Removes and returns up to `max` carried bytes.
    ///
    /// The inbound file pipeline drains the carry into the destination file
    /// before issuing any fresh socket reads: the sender may have coalesced
    /// the head of the file stream with the transfer request frame.
    pub fn drain_carry(&mut self, max: usize) -> Vec<u8> {
        let count: usize = max.min(self.unread.len());
        self.unread.drain(..count).collect()
    }

    /// Reads one complete frame and returns its payload (type code + body).
    pub fn read_frame<R: Read>(&mut self, reader: &mut R) -> Result<Vec<u8>, FrameError> {
        // Length prefix. Reads here may overshoot into the payload (or
        // beyond); the surplus stays in the carry buffer.
        while self.unread.len() < 4 {
            match self.fill(reader) {
                Ok(()) => {}
                Err(SocketError::PeerClosed) if self.unread.is_empty() => {
                    return Err(SocketError::PeerClosed.into());
                }
                Err(SocketError::PeerClosed) => return Err(FrameError::TruncatedLength),
                Err(e) => return Err(e.into()),
            }
        }
        let prefix: Vec<u8> = self.take(4);
        let length: usize = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;

        // Payload: drain the carry first, then read the exact remainder.
        // Payload reads never overshoot, so bytes following this frame are
        // left either in the carry buffer or in the socket.
        let mut payload: Vec<u8> = Vec::with_capacity(length);
        let from_carry: usize = length.min(self.unread.len());
        payload.extend(self.unread.drain(..from_carry));

        let mut chunk: Vec<u8> = vec![0; self.buffer_size];
        while payload.len() < length {
            let want: usize = self.buffer_size.min(length - payload.len());
            match reader.read(&mut chunk[..want]) {
                Ok(0) => {
                    return Err(FrameError::TruncatedPayload {
                        expected: length,
                        received: payload.len(),
                    });
                }
                Ok(n) => payload.extend_from_slice(&chunk[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(socket::classify(e, self.timeout_ms).into()),
            }
        }

        debug_assert!(self.unread.len() < self.buffer_size);
        Ok(payload)
    }

    /// One socket read of at most `buffer_size` bytes appended to the carry.
    fn fill<R: Read>(&mut self, reader: &mut R) -> Result<(), SocketError> {
        let mut chunk: Vec<u8> = vec![0; self.buffer_size];
        loop {
            match reader.read(&mut chunk) {
                Ok(0) => return Err(SocketError::PeerClosed),
                Ok(n) => {
                    self.unread.extend(&chunk[..n]);
                    return Ok(());
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(socket::classify(e, self.timeout_ms)),
            }
        }
    }

    fn take(&mut self, count: usize) -> Vec<u8> {
        self.unread.drain(..count).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::min;

    const BUFFER_SIZE: usize = 64;

    /// Reader that hands out its data in fixed-size chunks, the way a real
    /// socket delivers partial reads.
    struct MockChannel {
        data: Vec<u8>,
        cursor: usize,
        chunk: usize,
    }

    impl MockChannel {
        fn new(data: Vec<u8>, chunk: usize) -> Self {
            Self {
                data,
                cursor: 0,
                chunk,
            }
        }
    }

    impl Read for MockChannel {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.cursor == self.data.len() {
                return Ok(0);
            }
            let count: usize = min(min(self.chunk, buf.len()), self.data.len() - self.cursor);
            buf[..count].copy_from_slice(&self.data[self.cursor..self.cursor + count]);
            self.cursor += count;
            Ok(count)
        }
    }

    fn frame_of(payload: &[u8]) -> Vec<u8> {
        encode_frame(payload)
    }

    #[test]
    fn test_single_frame_roundtrip() {
        let wire: Vec<u8> = frame_of(b"hello frame");
        let mut channel = MockChannel::new(wire, 5);
        let mut reader = FrameReader::new(BUFFER_SIZE, 0);

        let payload: Vec<u8> = reader.read_frame(&mut channel).unwrap();

        assert_eq!(payload, b"hello frame");
        assert_eq!(reader.carry_len(), 0);
    }

    #[test]
    fn test_concatenated_frames_decode_in_sequence() {
        // Stream associativity: N frames glued together on the wire decode
        // the same as N independent reads, whatever the chunking.
        let payloads: [&[u8]; 3] = [b"first", b"the second payload", b"x"];
        let mut wire: Vec<u8> = Vec::new();
        for p in payloads {
            wire.extend(frame_of(p));
        }

        for chunk in [1, 3, 7, BUFFER_SIZE] {
            let mut channel = MockChannel::new(wire.clone(), chunk);
            let mut reader = FrameReader::new(BUFFER_SIZE, 0);

            for expected in payloads {
                let payload: Vec<u8> = reader.read_frame(&mut channel).unwrap();
                assert_eq!(payload, expected, "chunk size {}", chunk);
                assert!(reader.carry_len() < BUFFER_SIZE);
            }
        }
    }

    #[test]
    fn test_carry_holds_head_of_following_stream() {
        // A frame followed by raw file bytes delivered in one big read: the
        // file bytes must survive verbatim in the carry buffer.
        let mut wire: Vec<u8> = frame_of(b"req");
        let file_bytes: &[u8] = &[0x01, 0x02, 0x03];
        wire.extend_from_slice(file_bytes);

        let mut channel = MockChannel::new(wire, BUFFER_SIZE);
        let mut reader = FrameReader::new(BUFFER_SIZE, 0);

        let payload: Vec<u8> = reader.read_frame(&mut channel).unwrap();
        assert_eq!(payload, b"req");

        assert_eq!(reader.carry_len(), 3);
        assert_eq!(reader.drain_carry(16), file_bytes);
        assert_eq!(reader.carry_len(), 0);
    }

    #[test]
    fn test_payload_filling_first_read_leaves_no_carry() {
        // Payload length of exactly buffer_size - 4: the length prefix plus
        // payload fill one read to the brim, and nothing must be carried.
        let payload: Vec<u8> = vec![0xAB; BUFFER_SIZE - 4];
        let wire: Vec<u8> = frame_of(&payload);
        assert_eq!(wire.len(), BUFFER_SIZE);

        let mut channel = MockChannel::new(wire, BUFFER_SIZE);
        let mut reader = FrameReader::new(BUFFER_SIZE, 0);

        let decoded: Vec<u8> = reader.read_frame(&mut channel).unwrap();

        assert_eq!(decoded, payload);
        assert_eq!(reader.carry_len(), 0);
    }

    #[test]
    fn test_truncated_length_prefix() {
        let mut channel = MockChannel::new(vec![0x05, 0x00], 2);
        let mut reader = FrameReader::new(BUFFER_SIZE, 0);

        match reader.read_frame(&mut channel) {
            Err(FrameError::TruncatedLength) => {}
            other => panic!("expected TruncatedLength, got {:?}", other),
        }
    }

    #[test]
    fn test_truncated_payload() {
        let wire: Vec<u8> = frame_of(b"hello")[..7].to_vec();
        let mut channel = MockChannel::new(wire, BUFFER_SIZE);
        let mut reader = FrameReader::new(BUFFER_SIZE, 0);

        match reader.read_frame(&mut channel) {
            Err(FrameError::TruncatedPayload {
                expected: 5,
                received: 3,
            }) => {}
            other => panic!("expected TruncatedPayload, got {:?}", other),
        }
    }

    #[test]
    fn test_clean_close_before_any_byte() {
        let mut channel = MockChannel::new(Vec::new(), 1);
        let mut reader = FrameReader::new(BUFFER_SIZE, 0);

        match reader.read_frame(&mut channel) {
            Err(FrameError::Socket(SocketError::PeerClosed)) => {}
            other => panic!("expected PeerClosed, got {:?}", other),
        }
    }

    #[test]
    fn test_carry_stays_below_buffer_size() {
        // Many tiny frames delivered in buffer-size reads keep the carry
        // strictly under the buffer size at every step.
        let mut wire: Vec<u8> = Vec::new();
        for i in 0..100u8 {
            wire.extend(frame_of(&[i]));
        }

        let mut channel = MockChannel::new(wire, BUFFER_SIZE);
        let mut reader = FrameReader::new(BUFFER_SIZE, 0);

        for i in 0..100u8 {
            let payload: Vec<u8> = reader.read_frame(&mut channel).unwrap();
            assert_eq!(payload, [i]);
            assert!(reader.carry_len() < BUFFER_SIZE);
        }
    }
}
