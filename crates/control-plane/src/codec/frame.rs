//! Length-prefixed frame codec.
//!
//! Every frame on the control channel is `<decimal-length>#<payload>`: an
//! ASCII decimal length of at most five digits, a `#`, then exactly that
//! many payload bytes. Bytes arrive in arbitrary chunks, so the decoder is
//! a stream decoder; it buffers partial length prefixes and partial
//! payloads and surfaces complete frames as they materialize.

use bytes::{Buf, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Initial capacity of the inbound reassembly buffer
const INITIAL_BUFFER_SIZE: usize = 12 * 1024;

/// Maximum number of digits in the length prefix
const MAX_LENGTH_DIGITS: usize = 5;

/// Streaming decoder for length-prefixed frames
///
/// Feed raw socket bytes in with [`extend`](Self::extend), then drain
/// complete frames with [`next_frame`](Self::next_frame) until it returns
/// `Ok(None)`. A decode error is unrecoverable; the session owning the
/// decoder must be torn down.
pub struct FrameDecoder {
    buf: BytesMut,
    /// Parsed length of the frame currently being reassembled
    pending: Option<usize>,
}

impl FrameDecoder {
    /// Creates an empty decoder
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            pending: None,
        }
    }

    /// Appends freshly read bytes to the reassembly buffer
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Tries to decode the next complete frame
    ///
    /// Returns `Ok(None)` when more bytes are needed. Returns an error on a
    /// malformed length prefix; no further frames can be decoded after that.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>> {
        let len = match self.pending {
            Some(len) => len,
            None => match self.read_length()? {
                Some(len) => {
                    self.pending = Some(len);
                    len
                }
                None => return Ok(None),
            },
        };

        if self.buf.len() < len {
            return Ok(None);
        }

        self.pending = None;
        Ok(Some(self.buf.split_to(len).freeze()))
    }

    /// Parses `<digits>#` off the front of the buffer.
    ///
    /// Returns `Ok(None)` when the stream was split in the middle of the
    /// prefix; the buffered digits stay put to be re-read once the rest
    /// arrives.
    fn read_length(&mut self) -> Result<Option<usize>> {
        let mut len: usize = 0;
        for (i, &b) in self.buf.iter().enumerate() {
            match b {
                b'#' => {
                    if i == 0 {
                        return Err(Error::Frame("empty length prefix".to_string()));
                    }
                    self.buf.advance(i + 1);
                    return Ok(Some(len));
                }
                b'0'..=b'9' => {
                    if i == MAX_LENGTH_DIGITS {
                        return Err(Error::Frame(
                            "message length prefix exceeds five digits".to_string(),
                        ));
                    }
                    len = len * 10 + (b - b'0') as usize;
                }
                other => {
                    return Err(Error::Frame(format!(
                        "invalid byte {:#04x} in message length prefix",
                        other
                    )));
                }
            }
        }
        Ok(None)
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Encodes a payload into a single wire frame
pub fn encode_frame(payload: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(payload.len() + 8);
    out.extend_from_slice(payload.len().to_string().as_bytes());
    out.extend_from_slice(b"#");
    out.extend_from_slice(payload);
    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect_frames(decoder: &mut FrameDecoder) -> Vec<String> {
        let mut frames = Vec::new();
        while let Some(frame) = decoder.next_frame().expect("decode") {
            frames.push(String::from_utf8(frame.to_vec()).expect("utf8"));
        }
        frames
    }

    #[test]
    fn test_single_frame() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(b"5#hello");
        assert_eq!(collect_frames(&mut decoder), vec!["hello"]);
        assert!(decoder.next_frame().expect("decode").is_none());
    }

    #[test]
    fn test_resync_across_reads() {
        // payload split mid-frame, next frame glued onto the remainder
        let mut decoder = FrameDecoder::new();
        decoder.extend(b"5#hel");
        assert!(decoder.next_frame().expect("decode").is_none());
        decoder.extend(b"lo7#goodbye");
        assert_eq!(collect_frames(&mut decoder), vec!["hello", "goodbye"]);
    }

    #[test]
    fn test_split_length_prefix() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(b"1");
        assert!(decoder.next_frame().expect("decode").is_none());
        decoder.extend(b"1#hello");
        assert!(decoder.next_frame().expect("decode").is_none());
        decoder.extend(b" world");
        assert_eq!(collect_frames(&mut decoder), vec!["hello world"]);
    }

    #[test]
    fn test_malformed_length_is_fatal() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(b"abc#payload");
        assert!(decoder.next_frame().is_err());
    }

    #[test]
    fn test_six_digit_length_rejected() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(b"123456#");
        assert!(decoder.next_frame().is_err());

        // five digits are still fine
        let mut decoder = FrameDecoder::new();
        decoder.extend(b"99999#");
        assert!(decoder.next_frame().expect("decode").is_none());
    }

    #[test]
    fn test_missing_length_rejected() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(b"#payload");
        assert!(decoder.next_frame().is_err());
    }

    #[test]
    fn test_round_trip() {
        let payloads: Vec<String> = vec![
            String::new(),
            "x".to_string(),
            "a|b|c\r\nINVITE sip:alice@example.com SIP/2.0".to_string(),
            "y".repeat(40_000),
        ];
        for payload in payloads {
            let wire = encode_frame(payload.as_bytes());
            let mut decoder = FrameDecoder::new();
            decoder.extend(&wire);
            let frame = decoder.next_frame().expect("decode").expect("complete");
            assert_eq!(frame.as_ref(), payload.as_bytes());
        }
    }

    #[test]
    fn test_round_trip_byte_by_byte() {
        let payload = b"m1|sip|t1|d1|\r\nBYE sip:bob@example.com SIP/2.0";
        let wire = encode_frame(payload);
        let mut decoder = FrameDecoder::new();
        let mut out = None;
        for &b in wire.iter() {
            decoder.extend(&[b]);
            if let Some(frame) = decoder.next_frame().expect("decode") {
                assert!(out.is_none(), "only one frame expected");
                out = Some(frame);
            }
        }
        assert_eq!(out.expect("frame").as_ref(), payload.as_slice());
    }

    #[test]
    fn test_back_to_back_frames_in_one_read() {
        let mut decoder = FrameDecoder::new();
        let mut wire = Vec::new();
        wire.extend_from_slice(&encode_frame(b"one"));
        wire.extend_from_slice(&encode_frame(b"two"));
        wire.extend_from_slice(&encode_frame(b"three"));
        decoder.extend(&wire);
        assert_eq!(collect_frames(&mut decoder), vec!["one", "two", "three"]);
    }
}
