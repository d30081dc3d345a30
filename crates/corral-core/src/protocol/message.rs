//! Message protocol: chunked delivery reassembled by message id.

use rustc_hash::FxHashMap;

use crate::error::{Error, Result};

use super::{FrameCodec, ProtocolType, TASK_HEADER_LEN, TaskHeader, TaskMessage, flags};

/// A message being reassembled.
struct Partial {
    task_id: u64,
    out_of_band: bool,
    data: Vec<u8>,
}

/// Codec for the message protocol.
///
/// Chunks of different messages may interleave; chunks of one message must
/// arrive in order, which every transport guarantees per endpoint. Buffers
/// are keyed by `(src_worker_id, msg_id)` so senders sharing one queue
/// cannot collide.
pub struct MessageCodec {
    max_packet_size: usize,
    max_message_size: usize,
    next_msg_id: u64,
    buffers: FxHashMap<(u32, u64), Partial>,
    abandoned: u64,
}

impl MessageCodec {
    pub fn new(max_packet_size: usize, max_message_size: usize) -> Self {
        Self {
            max_packet_size,
            max_message_size,
            next_msg_id: 1,
            buffers: FxHashMap::default(),
            abandoned: 0,
        }
    }

    /// Messages currently waiting for more chunks.
    pub fn pending(&self) -> usize {
        self.buffers.len()
    }

    /// Partial messages thrown away because their id began again.
    pub fn abandoned(&self) -> u64 {
        self.abandoned
    }

    fn chunk_capacity(&self) -> usize {
        self.max_packet_size - TASK_HEADER_LEN
    }
}

impl FrameCodec for MessageCodec {
    fn protocol(&self) -> ProtocolType {
        ProtocolType::Message
    }

    fn encode(&mut self, message: &TaskMessage) -> Result<Vec<Vec<u8>>> {
        if message.payload.len() > self.max_message_size {
            return Err(Error::Protocol(format!(
                "message of {} bytes exceeds the {} byte limit",
                message.payload.len(),
                self.max_message_size
            )));
        }

        let msg_id = self.next_msg_id;
        self.next_msg_id = self.next_msg_id.wrapping_add(1).max(1);

        let capacity = self.chunk_capacity();
        let mut chunks: Vec<&[u8]> = message.payload.chunks(capacity).collect();
        if chunks.is_empty() {
            chunks.push(&[]);
        }

        let last = chunks.len() - 1;
        let packets = chunks
            .into_iter()
            .enumerate()
            .map(|(i, chunk)| {
                let mut chunk_flags = message.base_flags() | flags::CHUNK;
                if i == 0 {
                    chunk_flags |= flags::BEGIN;
                }
                if i == last {
                    chunk_flags |= flags::END;
                }
                let header = TaskHeader {
                    task_id: message.task_id,
                    msg_id,
                    src_worker_id: message.src_worker_id,
                    len: chunk.len() as u32,
                    flags: chunk_flags,
                };
                let mut packet = Vec::with_capacity(TASK_HEADER_LEN + chunk.len());
                header.write_to(&mut packet);
                packet.extend_from_slice(chunk);
                packet
            })
            .collect();
        Ok(packets)
    }

    fn decode(&mut self, data: &[u8]) -> Result<Vec<TaskMessage>> {
        let (header, chunk) = TaskHeader::parse(data)?;

        if !header.has(flags::CHUNK) {
            return Ok(vec![TaskMessage {
                task_id: header.task_id,
                src_worker_id: header.src_worker_id,
                out_of_band: header.has(flags::OUT_OF_BAND),
                payload: chunk.to_vec(),
            }]);
        }

        let key = (header.src_worker_id, header.msg_id);
        if header.has(flags::BEGIN) {
            if let Some(stale) = self.buffers.remove(&key) {
                self.abandoned += 1;
                tracing::warn!(
                    msg_id = header.msg_id,
                    src = header.src_worker_id,
                    dropped = stale.data.len(),
                    "BEGIN for a message still being reassembled, restarting it"
                );
            }
            self.buffers.insert(
                key,
                Partial {
                    task_id: header.task_id,
                    out_of_band: header.has(flags::OUT_OF_BAND),
                    data: Vec::new(),
                },
            );
        }

        let Some(partial) = self.buffers.get_mut(&key) else {
            return Err(Error::Protocol(format!(
                "chunk for message {} without a matching BEGIN",
                header.msg_id
            )));
        };

        if partial.data.len() + chunk.len() > self.max_message_size {
            self.buffers.remove(&key);
            return Err(Error::Protocol(format!(
                "message {} exceeds the {} byte limit",
                header.msg_id, self.max_message_size
            )));
        }
        partial.data.extend_from_slice(chunk);

        if !header.has(flags::END) {
            return Ok(Vec::new());
        }

        let partial = self.buffers.remove(&key).map(|p| TaskMessage {
            task_id: p.task_id,
            src_worker_id: header.src_worker_id,
            out_of_band: p.out_of_band,
            payload: p.data,
        });
        Ok(partial.into_iter().collect())
    }

    fn is_mid_frame(&self) -> bool {
        !self.buffers.is_empty()
    }

    fn reset(&mut self) {
        self.buffers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PACKET: usize = TASK_HEADER_LEN + 4;

    fn decode_all(codec: &mut MessageCodec, packets: &[Vec<u8>]) -> Vec<TaskMessage> {
        packets
            .iter()
            .flat_map(|p| codec.decode(p).unwrap())
            .collect()
    }

    #[test]
    fn test_multi_chunk_reassembly() {
        let mut sender = MessageCodec::new(PACKET, 1024);
        let mut receiver = MessageCodec::new(PACKET, 1024);

        let message = TaskMessage::new(b"abcdefghij".to_vec()).with_task_id(3);
        let packets = sender.encode(&message).unwrap();
        assert_eq!(packets.len(), 3);

        let (first, _) = TaskHeader::parse(&packets[0]).unwrap();
        let (mid, _) = TaskHeader::parse(&packets[1]).unwrap();
        let (last, _) = TaskHeader::parse(&packets[2]).unwrap();
        assert!(first.has(flags::BEGIN) && !first.has(flags::END));
        assert!(!mid.has(flags::BEGIN) && !mid.has(flags::END));
        assert!(last.has(flags::END) && !last.has(flags::BEGIN));

        assert!(receiver.decode(&packets[0]).unwrap().is_empty());
        assert!(receiver.decode(&packets[1]).unwrap().is_empty());
        let done = receiver.decode(&packets[2]).unwrap();
        assert_eq!(done, vec![message]);
        assert_eq!(receiver.pending(), 0);
    }

    #[test]
    fn test_single_chunk_carries_both_flags() {
        let mut codec = MessageCodec::new(PACKET, 1024);
        let packets = codec.encode(&TaskMessage::new(b"ab".to_vec())).unwrap();
        assert_eq!(packets.len(), 1);
        let (header, _) = TaskHeader::parse(&packets[0]).unwrap();
        assert!(header.has(flags::BEGIN) && header.has(flags::END));
    }

    #[test]
    fn test_empty_message() {
        let mut codec = MessageCodec::new(PACKET, 1024);
        let packets = codec.encode(&TaskMessage::new(Vec::new())).unwrap();
        assert_eq!(packets.len(), 1);
        let done = codec.decode(&packets[0]).unwrap();
        assert_eq!(done.len(), 1);
        assert!(done[0].payload.is_empty());
    }

    #[test]
    fn test_interleaved_messages() {
        let mut sender = MessageCodec::new(PACKET, 1024);
        let mut receiver = MessageCodec::new(PACKET, 1024);

        let a = TaskMessage::new(b"aaaaaaaaaaaa".to_vec()).with_task_id(1);
        let b = TaskMessage::new(b"bbbbbbbb".to_vec()).with_task_id(2);
        let pa = sender.encode(&a).unwrap();
        let pb = sender.encode(&b).unwrap();

        let order = [&pa[0], &pb[0], &pa[1], &pb[1], &pa[2]];
        let mut done = Vec::new();
        for packet in order {
            done.extend(receiver.decode(packet).unwrap());
        }
        assert_eq!(done, vec![b, a]);
    }

    #[test]
    fn test_same_msg_id_from_different_sources() {
        let mut worker_a = MessageCodec::new(PACKET, 1024);
        let mut worker_b = MessageCodec::new(PACKET, 1024);
        let mut receiver = MessageCodec::new(PACKET, 1024);

        let a = TaskMessage::new(b"from-a!!".to_vec()).with_source(0);
        let b = TaskMessage::new(b"from-b!!".to_vec()).with_source(1);
        let pa = worker_a.encode(&a).unwrap();
        let pb = worker_b.encode(&b).unwrap();

        let mut done = Vec::new();
        for packet in [&pa[0], &pb[0], &pb[1], &pa[1]] {
            done.extend(receiver.decode(packet).unwrap());
        }
        assert_eq!(done, vec![b, a]);
    }

    #[test]
    fn test_end_without_begin_is_violation() {
        let mut sender = MessageCodec::new(PACKET, 1024);
        let mut receiver = MessageCodec::new(PACKET, 1024);

        let packets = sender.encode(&TaskMessage::new(b"abcdefgh".to_vec())).unwrap();
        assert!(matches!(
            receiver.decode(&packets[1]),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_violation_does_not_corrupt_other_messages() {
        let mut sender = MessageCodec::new(PACKET, 1024);
        let mut receiver = MessageCodec::new(PACKET, 1024);

        let good = TaskMessage::new(b"goodgood".to_vec());
        let good_packets = sender.encode(&good).unwrap();
        let stray = sender.encode(&TaskMessage::new(b"xxxxyyyy".to_vec())).unwrap();

        assert!(receiver.decode(&good_packets[0]).unwrap().is_empty());
        assert!(receiver.decode(&stray[1]).is_err());
        assert_eq!(receiver.decode(&good_packets[1]).unwrap(), vec![good]);
    }

    #[test]
    fn test_repeated_begin_restarts_message() {
        let mut receiver = MessageCodec::new(PACKET, 1024);
        let chunk = |flag_bits: u8, data: &[u8]| {
            let mut packet = Vec::new();
            TaskHeader {
                task_id: 4,
                msg_id: 9,
                src_worker_id: 2,
                len: data.len() as u32,
                flags: flags::CHUNK | flag_bits,
            }
            .write_to(&mut packet);
            packet.extend_from_slice(data);
            packet
        };

        assert!(receiver.decode(&chunk(flags::BEGIN, b"old-")).unwrap().is_empty());
        assert!(receiver.decode(&chunk(flags::BEGIN, b"new-")).unwrap().is_empty());
        assert_eq!(receiver.abandoned(), 1);
        assert_eq!(receiver.pending(), 1);

        let done = receiver.decode(&chunk(flags::END, b"tail")).unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].payload, b"new-tail");
        assert_eq!(done[0].task_id, 4);
        assert_eq!(receiver.pending(), 0);
    }

    #[test]
    fn test_oversized_message_rejected() {
        let mut sender = MessageCodec::new(PACKET, 1024);
        let mut receiver = MessageCodec::new(PACKET, 6);

        assert!(MessageCodec::new(PACKET, 6)
            .encode(&TaskMessage::new(vec![0u8; 7]))
            .is_err());

        let packets = sender.encode(&TaskMessage::new(vec![0u8; 8])).unwrap();
        assert!(receiver.decode(&packets[0]).unwrap().is_empty());
        assert!(receiver.decode(&packets[1]).is_err());
        assert_eq!(receiver.pending(), 0);
    }

    #[test]
    fn test_unchunked_packet_passes_through() {
        let mut receiver = MessageCodec::new(PACKET, 1024);
        let mut packet = Vec::new();
        TaskHeader {
            task_id: 11,
            len: 2,
            ..TaskHeader::default()
        }
        .write_to(&mut packet);
        packet.extend_from_slice(b"hi");

        let done = receiver.decode(&packet).unwrap();
        assert_eq!(done[0].payload, b"hi");
        assert_eq!(done[0].task_id, 11);
    }

    #[test]
    fn test_decode_all_helper_order() {
        let mut sender = MessageCodec::new(PACKET, 1024);
        let mut receiver = MessageCodec::new(PACKET, 1024);
        let m = TaskMessage::new(b"0123456789abcdef".to_vec());
        let packets = sender.encode(&m).unwrap();
        assert_eq!(decode_all(&mut receiver, &packets), vec![m]);
    }
}
