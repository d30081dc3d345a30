//! Stream protocol: 4-byte big-endian length prefix, then the payload.
//!
//! ```text
//! +-------------------------------+------------------------------+
//! | payload length (u32, BE)      | payload (length bytes) ...   |
//! +-------------------------------+------------------------------+
//! ```
//!
//! The decoder accepts input in arbitrarily small pieces: it first gathers
//! exactly four length bytes, then exactly that many payload bytes.

use crate::error::{Error, Result};

use super::{FrameCodec, ProtocolType, TaskMessage};

const LENGTH_PREFIX: usize = 4;

/// Encode one payload as a stream frame.
pub fn encode_stream_frame(payload: &[u8], max_frame_size: usize) -> Result<Vec<u8>> {
    if payload.len() > max_frame_size || payload.len() > u32::MAX as usize {
        return Err(Error::Protocol(format!(
            "frame of {} bytes exceeds the {} byte limit",
            payload.len(),
            max_frame_size
        )));
    }
    let mut frame = Vec::with_capacity(LENGTH_PREFIX + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

enum ReadState {
    Length { buf: [u8; LENGTH_PREFIX], filled: usize },
    Payload { remaining: usize, buf: Vec<u8> },
}

impl ReadState {
    fn start() -> Self {
        ReadState::Length {
            buf: [0; LENGTH_PREFIX],
            filled: 0,
        }
    }
}

/// Codec for the stream protocol.
pub struct StreamCodec {
    max_frame_size: usize,
    state: ReadState,
}

impl StreamCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            max_frame_size,
            state: ReadState::start(),
        }
    }
}

impl FrameCodec for StreamCodec {
    fn protocol(&self) -> ProtocolType {
        ProtocolType::Stream
    }

    fn encode(&mut self, message: &TaskMessage) -> Result<Vec<Vec<u8>>> {
        if message.out_of_band {
            return Err(Error::Unsupported(
                "stream frames carry no header for out-of-band messages".to_string(),
            ));
        }
        Ok(vec![encode_stream_frame(&message.payload, self.max_frame_size)?])
    }

    fn decode(&mut self, mut data: &[u8]) -> Result<Vec<TaskMessage>> {
        let mut done = Vec::new();
        while !data.is_empty() {
            match &mut self.state {
                ReadState::Length { buf, filled } => {
                    let take = (LENGTH_PREFIX - *filled).min(data.len());
                    buf[*filled..*filled + take].copy_from_slice(&data[..take]);
                    *filled += take;
                    data = &data[take..];
                    if *filled < LENGTH_PREFIX {
                        continue;
                    }

                    let len = u32::from_be_bytes(*buf) as usize;
                    if len > self.max_frame_size {
                        self.state = ReadState::start();
                        return Err(Error::Protocol(format!(
                            "declared frame length {} exceeds the {} byte limit",
                            len, self.max_frame_size
                        )));
                    }
                    if len == 0 {
                        done.push(TaskMessage::new(Vec::new()));
                        self.state = ReadState::start();
                    } else {
                        self.state = ReadState::Payload {
                            remaining: len,
                            buf: Vec::with_capacity(len),
                        };
                    }
                }
                ReadState::Payload { remaining, buf } => {
                    let take = (*remaining).min(data.len());
                    buf.extend_from_slice(&data[..take]);
                    *remaining -= take;
                    data = &data[take..];
                    if *remaining == 0 {
                        let payload = std::mem::take(buf);
                        done.push(TaskMessage::new(payload));
                        self.state = ReadState::start();
                    }
                }
            }
        }
        Ok(done)
    }

    fn is_mid_frame(&self) -> bool {
        !matches!(self.state, ReadState::Length { filled: 0, .. })
    }

    fn reset(&mut self) {
        self.state = ReadState::start();
    }
}
