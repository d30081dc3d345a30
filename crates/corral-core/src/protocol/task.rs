//! Task protocol: one message per packet, oversized payloads spill to disk.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

use super::{
    CodecSettings, FrameCodec, ProtocolType, TASK_HEADER_LEN, TaskHeader, TaskMessage, flags,
};

/// File name prefix of spilled payloads. The receiver refuses any other path.
const SPILL_PREFIX: &str = "corral-task-";

/// Codec for the task protocol.
///
/// Delivery is atomic per call: `encode` always yields exactly one packet.
pub struct TaskCodec {
    settings: CodecSettings,
}

impl TaskCodec {
    pub fn new(settings: CodecSettings) -> Self {
        Self { settings }
    }

    /// Largest payload sent inline.
    pub fn inline_capacity(&self) -> usize {
        self.settings.max_packet_size - TASK_HEADER_LEN
    }

    fn spill(&self, payload: &[u8]) -> Result<PathBuf> {
        let path = self
            .settings
            .spill_dir
            .join(format!("{}{}.tmp", SPILL_PREFIX, uuid::Uuid::new_v4()));
        std::fs::write(&path, payload).map_err(|e| {
            Error::Spill(format!("failed to write {}: {}", path.display(), e))
        })?;
        tracing::debug!(path = %path.display(), bytes = payload.len(), "spilled task payload");
        Ok(path)
    }

    fn load_spilled(&self, path_bytes: &[u8]) -> Result<Vec<u8>> {
        let path = std::str::from_utf8(path_bytes)
            .map(Path::new)
            .map_err(|_| Error::Protocol("spill path is not valid UTF-8".to_string()))?;

        let in_spill_dir = path.parent() == Some(self.settings.spill_dir.as_path());
        let named_like_spill = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with(SPILL_PREFIX));
        if !in_spill_dir || !named_like_spill {
            return Err(Error::Protocol(format!(
                "refusing spill path outside {}: {}",
                self.settings.spill_dir.display(),
                path.display()
            )));
        }

        let payload = std::fs::read(path)
            .map_err(|e| Error::Spill(format!("failed to read {}: {}", path.display(), e)))?;
        if let Err(e) = std::fs::remove_file(path) {
            tracing::warn!(path = %path.display(), "failed to remove spill file: {}", e);
        }
        Ok(payload)
    }
}

/// Remove the spill file referenced by a packet that was never delivered.
pub(crate) fn discard_spilled(packet: &[u8]) {
    let Ok((header, body)) = TaskHeader::parse(packet) else {
        return;
    };
    if !header.has(flags::SPILLED) {
        return;
    }
    if let Ok(path) = std::str::from_utf8(body) {
        if let Err(e) = std::fs::remove_file(path) {
            tracing::debug!(path, "failed to remove undelivered spill file: {}", e);
        }
    }
}

impl FrameCodec for TaskCodec {
    fn protocol(&self) -> ProtocolType {
        ProtocolType::Task
    }

    fn encode(&mut self, message: &TaskMessage) -> Result<Vec<Vec<u8>>> {
        let mut header = TaskHeader {
            task_id: message.task_id,
            msg_id: 0,
            src_worker_id: message.src_worker_id,
            len: 0,
            flags: message.base_flags(),
        };

        let spilled;
        let body: &[u8] = if message.payload.len() > self.inline_capacity() {
            spilled = self.spill(&message.payload)?.into_os_string().into_encoded_bytes();
            if spilled.len() > self.inline_capacity() {
                return Err(Error::Spill(
                    "spill path does not fit in a single packet".to_string(),
                ));
            }
            header.flags |= flags::SPILLED;
            &spilled
        } else {
            &message.payload
        };

        header.len = body.len() as u32;
        let mut packet = Vec::with_capacity(TASK_HEADER_LEN + body.len());
        header.write_to(&mut packet);
        packet.extend_from_slice(body);
        Ok(vec![packet])
    }

    fn decode(&mut self, data: &[u8]) -> Result<Vec<TaskMessage>> {
        let (header, body) = TaskHeader::parse(data)?;
        let payload = if header.has(flags::SPILLED) {
            self.load_spilled(body)?
        } else {
            body.to_vec()
        };
        Ok(vec![TaskMessage {
            task_id: header.task_id,
            src_worker_id: header.src_worker_id,
            out_of_band: header.has(flags::OUT_OF_BAND),
            payload,
        }])
    }
}
