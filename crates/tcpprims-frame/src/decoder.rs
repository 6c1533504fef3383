use bytes::{Bytes, BytesMut};

use crate::codec::{read_length, FrameConfig, HEADER_SIZE};
use crate::error::{FrameError, Result};

/// Upper bound on the buffer reserved up front for a payload. Larger
/// payloads grow as their bytes actually arrive, so a header alone cannot
/// force a large allocation.
const MAX_PREALLOC: usize = 64 * 1024;

/// Where the decoder is within the current frame.
#[derive(Debug)]
pub enum DecodeState {
    /// Collecting the length prefix; `filled` of [`HEADER_SIZE`] bytes seen.
    AwaitingHeader {
        header: [u8; HEADER_SIZE],
        filled: usize,
    },
    /// Collecting `expected` payload bytes; `payload` holds those seen so far.
    AwaitingPayload { expected: usize, payload: BytesMut },
}

impl DecodeState {
    fn fresh() -> Self {
        DecodeState::AwaitingHeader {
            header: [0u8; HEADER_SIZE],
            filled: 0,
        }
    }
}

/// Resumable frame decoder for non-blocking reads.
///
/// A single read may deliver a fragment of a header, a fragment of a payload
/// or several whole frames back to back. [`feed`](FrameDecoder::feed) takes
/// whatever arrived, emits every frame it completes and keeps the remainder
/// for the next call.
#[derive(Debug)]
pub struct FrameDecoder {
    state: DecodeState,
    max_payload_size: usize,
}

impl FrameDecoder {
    /// Create a decoder that rejects payloads above `max_payload_size`.
    pub fn new(max_payload_size: usize) -> Self {
        Self {
            state: DecodeState::fresh(),
            max_payload_size,
        }
    }

    /// Create a decoder from a frame configuration.
    pub fn with_config(config: &FrameConfig) -> Self {
        Self::new(config.max_payload_size)
    }

    /// Feed freshly read bytes, calling `on_frame` for each completed payload.
    ///
    /// Returns the number of frames emitted. A length prefix above the bound
    /// returns [`FrameError::PayloadTooLarge`]; the stream is unrecoverable at
    /// that point and the caller is expected to drop the connection.
    pub fn feed(&mut self, mut input: &[u8], mut on_frame: impl FnMut(Bytes)) -> Result<usize> {
        let mut emitted = 0usize;

        loop {
            match &mut self.state {
                DecodeState::AwaitingHeader { header, filled } => {
                    if input.is_empty() {
                        break;
                    }
                    let take = (HEADER_SIZE - *filled).min(input.len());
                    header[*filled..*filled + take].copy_from_slice(&input[..take]);
                    *filled += take;
                    input = &input[take..];
                    if *filled < HEADER_SIZE {
                        break;
                    }

                    let expected = read_length(&header[..]);
                    if expected > self.max_payload_size {
                        return Err(FrameError::PayloadTooLarge {
                            size: expected,
                            max: self.max_payload_size,
                        });
                    }
                    if expected == 0 {
                        self.state = DecodeState::fresh();
                        on_frame(Bytes::new());
                        emitted += 1;
                        continue;
                    }
                    self.state = DecodeState::AwaitingPayload {
                        expected,
                        payload: BytesMut::with_capacity(expected.min(MAX_PREALLOC)),
                    };
                }
                DecodeState::AwaitingPayload { expected, payload } => {
                    if input.is_empty() {
                        break;
                    }
                    let take = (*expected - payload.len()).min(input.len());
                    payload.extend_from_slice(&input[..take]);
                    input = &input[take..];
                    if payload.len() < *expected {
                        break;
                    }

                    let complete = std::mem::take(payload).freeze();
                    self.state = DecodeState::fresh();
                    on_frame(complete);
                    emitted += 1;
                }
            }
        }

        Ok(emitted)
    }

    /// True when no partial frame is buffered.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, DecodeState::AwaitingHeader { filled: 0, .. })
    }

    /// Bytes of the current partial frame buffered so far (header included).
    pub fn buffered(&self) -> usize {
        match &self.state {
            DecodeState::AwaitingHeader { filled, .. } => *filled,
            DecodeState::AwaitingPayload { payload, .. } => HEADER_SIZE + payload.len(),
        }
    }

    /// Check the decoder at end of input.
    ///
    /// `Ok(())` when the stream ended on a frame boundary,
    /// [`FrameError::Truncated`] when a partial frame is left over.
    pub fn finish(&self) -> Result<()> {
        let expected = match &self.state {
            DecodeState::AwaitingHeader { filled: 0, .. } => return Ok(()),
            DecodeState::AwaitingHeader { .. } => HEADER_SIZE,
            DecodeState::AwaitingPayload { expected, .. } => HEADER_SIZE + expected,
        };
        Err(FrameError::Truncated {
            expected,
            received: self.buffered(),
        })
    }

    /// Current decode state.
    pub fn state(&self) -> &DecodeState {
        &self.state
    }
}

#[cfg(test)]
mod tests {
    use bytes::BufMut;

    use super::*;
    use crate::codec::{encode_frame, DEFAULT_MAX_PAYLOAD};

    fn wire(payloads: &[&[u8]]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        for payload in payloads {
            encode_frame(payload, &mut buf).unwrap();
        }
        buf.to_vec()
    }

    fn collect(decoder: &mut FrameDecoder, chunks: &[&[u8]]) -> Vec<Bytes> {
        let mut out = Vec::new();
        for chunk in chunks {
            decoder.feed(chunk, |frame| out.push(frame)).unwrap();
        }
        out
    }

    #[test]
    fn whole_frame_in_one_feed() {
        let bytes = wire(&[b"hello"]);
        let mut decoder = FrameDecoder::new(DEFAULT_MAX_PAYLOAD);

        let frames = collect(&mut decoder, &[&bytes]);
        assert_eq!(frames, vec![Bytes::from_static(b"hello")]);
        assert!(decoder.is_idle());
    }

    #[test]
    fn byte_by_byte_matches_whole() {
        let bytes = wire(&[b"alpha", b"", b"gamma-gamma"]);
        let mut decoder = FrameDecoder::new(DEFAULT_MAX_PAYLOAD);

        let chunks: Vec<&[u8]> = bytes.chunks(1).collect();
        let frames = collect(&mut decoder, &chunks);

        assert_eq!(
            frames,
            vec![
                Bytes::from_static(b"alpha"),
                Bytes::new(),
                Bytes::from_static(b"gamma-gamma"),
            ]
        );
        assert!(decoder.is_idle());
    }

    #[test]
    fn every_split_point_yields_same_frames() {
        let bytes = wire(&[b"split-me", b"and-me-too"]);

        for cut in 0..=bytes.len() {
            let mut decoder = FrameDecoder::new(DEFAULT_MAX_PAYLOAD);
            let frames = collect(&mut decoder, &[&bytes[..cut], &bytes[cut..]]);
            assert_eq!(
                frames,
                vec![
                    Bytes::from_static(b"split-me"),
                    Bytes::from_static(b"and-me-too"),
                ],
                "split at {cut}"
            );
        }
    }

    #[test]
    fn partial_header_is_kept() {
        let bytes = wire(&[b"xyz"]);
        let mut decoder = FrameDecoder::new(DEFAULT_MAX_PAYLOAD);

        assert_eq!(decoder.feed(&bytes[..2], |_| {}).unwrap(), 0);
        assert!(!decoder.is_idle());
        assert_eq!(decoder.buffered(), 2);

        let frames = collect(&mut decoder, &[&bytes[2..]]);
        assert_eq!(frames, vec![Bytes::from_static(b"xyz")]);
    }

    #[test]
    fn leftover_after_frames_is_preserved() {
        let mut bytes = wire(&[b"one", b"two"]);
        let next = wire(&[b"three"]);
        bytes.extend_from_slice(&next[..5]);

        let mut decoder = FrameDecoder::new(DEFAULT_MAX_PAYLOAD);
        let mut frames = Vec::new();
        let emitted = decoder.feed(&bytes, |f| frames.push(f)).unwrap();
        assert_eq!(emitted, 2);
        assert_eq!(decoder.buffered(), 5);
        assert!(matches!(
            decoder.state(),
            DecodeState::AwaitingPayload { expected: 5, .. }
        ));

        decoder.feed(&next[5..], |f| frames.push(f)).unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[2].as_ref(), b"three");
    }

    #[test]
    fn zero_length_frame_emitted_once() {
        let bytes = wire(&[b""]);
        let mut decoder = FrameDecoder::new(DEFAULT_MAX_PAYLOAD);

        let mut count = 0;
        decoder.feed(&bytes, |f| {
            assert!(f.is_empty());
            count += 1;
        })
        .unwrap();
        assert_eq!(count, 1);

        assert_eq!(decoder.feed(&[], |_| count += 1).unwrap(), 0);
        assert_eq!(count, 1);
    }

    #[test]
    fn oversized_length_is_rejected_before_payload() {
        let mut header = BytesMut::new();
        header.put_u32(1025);

        let mut decoder = FrameDecoder::new(1024);
        let err = decoder.feed(&header, |_| panic!("no frame expected")).unwrap_err();
        assert!(matches!(
            err,
            FrameError::PayloadTooLarge {
                size: 1025,
                max: 1024
            }
        ));
    }

    #[test]
    fn payload_at_bound_is_accepted() {
        let payload = vec![0x5A; 1024];
        let bytes = wire(&[&payload]);

        let mut decoder = FrameDecoder::new(1024);
        let chunks: Vec<&[u8]> = bytes.chunks(100).collect();
        let frames = collect(&mut decoder, &chunks);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_ref(), payload.as_slice());
    }

    #[test]
    fn finish_reports_partial_frame() {
        let bytes = wire(&[b"cut short"]);
        let mut decoder = FrameDecoder::new(DEFAULT_MAX_PAYLOAD);
        assert!(decoder.finish().is_ok());

        decoder.feed(&bytes[..2], |_| {}).unwrap();
        assert!(matches!(
            decoder.finish(),
            Err(FrameError::Truncated {
                expected: HEADER_SIZE,
                received: 2
            })
        ));

        decoder.feed(&bytes[2..8], |_| {}).unwrap();
        assert!(matches!(
            decoder.finish(),
            Err(FrameError::Truncated {
                expected: 13,
                received: 8
            })
        ));
    }
}
