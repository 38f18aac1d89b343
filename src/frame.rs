//! Length-prefixed binary framing used by the provider's streaming endpoint.
//!
//! Each frame is `flag:u8 | length:u32 (big-endian) | payload[length]`. Frames
//! arrive concatenated over a chunked HTTP body with no alignment to reads.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes, BytesMut};
use futures_util::stream::{Stream, StreamExt};
use tracing::{debug, warn};

use crate::error::RelayError;
use crate::models::provider::ProviderEvent;

pub const HEADER_LEN: usize = 5;
pub const FLAG_MESSAGE: u8 = 0x00;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub flag: u8,
    pub payload: Bytes,
}

/// Serialize one frame.
pub fn encode_frame(flag: u8, payload: &[u8]) -> Result<Bytes, RelayError> {
    let len = u32::try_from(payload.len()).map_err(|_| {
        RelayError::UpstreamRequestFailed(format!(
            "frame payload of {} bytes exceeds u32 length prefix",
            payload.len()
        ))
    })?;
    let mut out = BytesMut::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&[flag]);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out.freeze())
}

/// Reassembly buffer. Push bytes as they arrive, pop complete frames.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: BytesMut,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    pub fn next_frame(&mut self) -> Option<Frame> {
        if self.buf.len() < HEADER_LEN {
            return None;
        }
        let flag = self.buf[0];
        let len = u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]) as usize;
        if self.buf.len() < HEADER_LEN + len {
            return None;
        }
        self.buf.advance(HEADER_LEN);
        let payload = self.buf.split_to(len).freeze();
        Some(Frame { flag, payload })
    }

    /// Bytes held back waiting for the rest of a frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Adapts a raw byte stream into a stream of complete frames.
pub struct FrameDecoder<S> {
    inner: S,
    buffer: FrameBuffer,
    done: bool,
}

impl<S> FrameDecoder<S>
where
    S: Stream<Item = Result<Bytes, RelayError>> + Unpin,
{
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            buffer: FrameBuffer::new(),
            done: false,
        }
    }
}

impl<S> Stream for FrameDecoder<S>
where
    S: Stream<Item = Result<Bytes, RelayError>> + Unpin,
{
    type Item = Result<Frame, RelayError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            if this.done {
                return Poll::Ready(None);
            }

            if let Some(frame) = this.buffer.next_frame() {
                if frame.flag != FLAG_MESSAGE {
                    warn!(
                        "Provider frame with unexpected flag 0x{:02x} ({} bytes); decoding anyway",
                        frame.flag,
                        frame.payload.len()
                    );
                }
                return Poll::Ready(Some(Ok(frame)));
            }

            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    this.buffer.push(&chunk);
                }
                Poll::Ready(Some(Err(err))) => {
                    this.done = true;
                    return Poll::Ready(Some(Err(err)));
                }
                Poll::Ready(None) => {
                    this.done = true;
                    let pending = this.buffer.pending();
                    if pending > 0 {
                        return Poll::Ready(Some(Err(RelayError::StreamDecodeError(format!(
                            "stream closed with {pending} bytes of an incomplete frame"
                        )))));
                    }
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

pub type EventStream = Pin<Box<dyn Stream<Item = Result<ProviderEvent, RelayError>> + Send>>;

/// Decode a provider byte stream into typed events. The first decode error is
/// yielded and ends the stream.
pub fn decode_events<S>(bytes: S) -> EventStream
where
    S: Stream<Item = Result<Bytes, RelayError>> + Unpin + Send + 'static,
{
    let mut frames = FrameDecoder::new(bytes);
    Box::pin(async_stream::stream! {
        while let Some(frame) = frames.next().await {
            let parsed = frame.and_then(|f| ProviderEvent::parse(&f.payload));
            match parsed {
                Ok(Some(event)) => yield Ok(event),
                Ok(None) => debug!("Skipping provider frame without a known event"),
                Err(err) => {
                    yield Err(err);
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    fn frames_bytes(payloads: &[&str]) -> Vec<u8> {
        let mut out = Vec::new();
        for p in payloads {
            out.extend_from_slice(&encode_frame(FLAG_MESSAGE, p.as_bytes()).unwrap());
        }
        out
    }

    fn drain(buffer: &mut FrameBuffer) -> Vec<Bytes> {
        let mut out = Vec::new();
        while let Some(frame) = buffer.next_frame() {
            out.push(frame.payload);
        }
        out
    }

    #[test]
    fn encodes_flag_and_big_endian_length() {
        let frame = encode_frame(0, b"{}").unwrap();
        assert_eq!(&frame[..], &[0, 0, 0, 0, 2, b'{', b'}']);
    }

    #[test]
    fn reassembles_frames_split_at_every_offset() {
        let payloads = [
            r#"{"textEvent":{"text":"Hi"}}"#,
            "{}",
            r#"{"textEvent":{"text":"there"}}"#,
            r#"{"doneEvent":{}}"#,
        ];
        let bytes = frames_bytes(&payloads);

        let mut whole = FrameBuffer::new();
        whole.push(&bytes);
        let expected = drain(&mut whole);
        assert_eq!(expected.len(), payloads.len());

        for first in 0..=bytes.len() {
            for second in first..=bytes.len() {
                let mut buffer = FrameBuffer::new();
                let mut got = Vec::new();
                for piece in [&bytes[..first], &bytes[first..second], &bytes[second..]] {
                    buffer.push(piece);
                    got.extend(drain(&mut buffer));
                }
                assert_eq!(got, expected, "split at {first}/{second}");
                assert_eq!(buffer.pending(), 0);
            }
        }
    }

    #[test]
    fn byte_at_a_time_feeding_matches_whole_feed() {
        let bytes = frames_bytes(&[r#"{"textEvent":{"text":"a"}}"#, r#"{"doneEvent":{}}"#]);
        let mut buffer = FrameBuffer::new();
        let mut got = Vec::new();
        for b in &bytes {
            buffer.push(std::slice::from_ref(b));
            got.extend(drain(&mut buffer));
        }
        assert_eq!(
            got,
            vec![
                Bytes::from_static(br#"{"textEvent":{"text":"a"}}"#),
                Bytes::from_static(br#"{"doneEvent":{}}"#),
            ]
        );
    }

    #[test]
    fn zero_length_frame_is_emitted() {
        let mut buffer = FrameBuffer::new();
        buffer.push(&[0, 0, 0, 0, 0]);
        assert_eq!(buffer.next_frame().unwrap().payload.len(), 0);
        assert!(buffer.next_frame().is_none());
    }

    #[tokio::test]
    async fn decoder_handles_empty_and_packed_chunks() {
        let bytes = frames_bytes(&[r#"{"textEvent":{"text":"x"}}"#, r#"{"doneEvent":{}}"#]);
        let chunks: Vec<Result<Bytes, RelayError>> = vec![
            Ok(Bytes::new()),
            Ok(Bytes::copy_from_slice(&bytes[..3])),
            Ok(Bytes::new()),
            Ok(Bytes::copy_from_slice(&bytes[3..])),
        ];
        let frames: Vec<_> = FrameDecoder::new(stream::iter(chunks)).collect().await;
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.is_ok()));
    }

    #[tokio::test]
    async fn nonzero_flag_is_still_decoded() {
        let mut bytes = encode_frame(0x02, br#"{"textEvent":{"text":"late"}}"#)
            .unwrap()
            .to_vec();
        bytes.extend_from_slice(&encode_frame(0, br#"{"doneEvent":{}}"#).unwrap());
        let events: Vec<_> = decode_events(stream::iter(vec![Ok(Bytes::from(bytes))]))
            .collect()
            .await;
        assert_eq!(
            events,
            vec![
                Ok(ProviderEvent::Text {
                    text: "late".into()
                }),
                Ok(ProviderEvent::Done)
            ]
        );
    }

    #[tokio::test]
    async fn malformed_payload_aborts_remaining_frames() {
        let mut bytes = encode_frame(0, b"not json").unwrap().to_vec();
        bytes.extend_from_slice(&encode_frame(0, br#"{"doneEvent":{}}"#).unwrap());
        let events: Vec<_> = decode_events(stream::iter(vec![Ok(Bytes::from(bytes))]))
            .collect()
            .await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Err(RelayError::StreamDecodeError(_))));
    }

    #[tokio::test]
    async fn truncated_trailing_frame_is_a_decode_error() {
        let bytes = encode_frame(0, br#"{"doneEvent":{}}"#).unwrap();
        let truncated = bytes.slice(..bytes.len() - 1);
        let frames: Vec<_> = FrameDecoder::new(stream::iter(vec![Ok(truncated)]))
            .collect()
            .await;
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0], Err(RelayError::StreamDecodeError(_))));
    }

    #[tokio::test]
    async fn transport_error_ends_the_stream() {
        let chunks: Vec<Result<Bytes, RelayError>> = vec![
            Err(RelayError::Timeout("read timed out".into())),
            Ok(encode_frame(0, br#"{"doneEvent":{}}"#).unwrap()),
        ];
        let events: Vec<_> = decode_events(stream::iter(chunks)).collect().await;
        assert_eq!(events, vec![Err(RelayError::Timeout("read timed out".into()))]);
    }
}
