use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Result};

/// Fixed size of the on-disk entry metadata record:
/// term (8) + timestamp (8) + flags (1) + command id (4) + length (8).
pub const ENTRY_METADATA_SIZE: usize = 29;

const FLAG_SNAPSHOT: u8 = 0b0000_0001;
const FLAG_COMMAND_ID: u8 = 0b0000_0010;

/// Metadata header stored in front of every payload, little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EntryMeta {
    pub term: u64,
    /// Wall-clock creation time, unix-epoch milliseconds.
    pub timestamp: u64,
    pub is_snapshot: bool,
    /// Application-defined type tag. Presence is carried in a flag bit, so
    /// zero is a valid id.
    pub command_id: Option<u32>,
    /// Payload length in bytes.
    pub length: u64,
}

impl EntryMeta {
    pub fn encode(&self) -> [u8; ENTRY_METADATA_SIZE] {
        let mut buf = [0u8; ENTRY_METADATA_SIZE];
        buf[0..8].copy_from_slice(&self.term.to_le_bytes());
        buf[8..16].copy_from_slice(&self.timestamp.to_le_bytes());
        let mut flags = 0u8;
        if self.is_snapshot {
            flags |= FLAG_SNAPSHOT;
        }
        if self.command_id.is_some() {
            flags |= FLAG_COMMAND_ID;
        }
        buf[16] = flags;
        buf[17..21].copy_from_slice(&self.command_id.unwrap_or(0).to_le_bytes());
        buf[21..29].copy_from_slice(&self.length.to_le_bytes());
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < ENTRY_METADATA_SIZE {
            return Err(anyhow!(
                "entry metadata requires {} bytes, got {}",
                ENTRY_METADATA_SIZE,
                data.len()
            ));
        }

        let mut u64_bytes = [0u8; 8];
        u64_bytes.copy_from_slice(&data[0..8]);
        let term = u64::from_le_bytes(u64_bytes);

        u64_bytes.copy_from_slice(&data[8..16]);
        let timestamp = u64::from_le_bytes(u64_bytes);

        let flags = data[16];
        if flags & !(FLAG_SNAPSHOT | FLAG_COMMAND_ID) != 0 {
            return Err(anyhow!("unknown entry flags {:#04x}", flags));
        }

        let mut u32_bytes = [0u8; 4];
        u32_bytes.copy_from_slice(&data[17..21]);
        let raw_command_id = u32::from_le_bytes(u32_bytes);

        u64_bytes.copy_from_slice(&data[21..29]);
        let length = u64::from_le_bytes(u64_bytes);

        Ok(Self {
            term,
            timestamp,
            is_snapshot: flags & FLAG_SNAPSHOT != 0,
            command_id: (flags & FLAG_COMMAND_ID != 0).then_some(raw_command_id),
            length,
        })
    }
}

/// An owned log entry: metadata plus opaque payload bytes.
///
/// Entries read back from a partition or from the snapshot file are
/// materialized into this form through a session buffer, so they stay valid
/// after the session is released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub term: u64,
    pub timestamp: u64,
    pub command_id: Option<u32>,
    is_snapshot: bool,
    pub payload: Vec<u8>,
}

impl LogEntry {
    pub fn new(term: u64, payload: Vec<u8>) -> Self {
        Self {
            term,
            timestamp: unix_millis(),
            command_id: None,
            is_snapshot: false,
            payload,
        }
    }

    pub fn with_command(term: u64, command_id: u32, payload: Vec<u8>) -> Self {
        Self {
            command_id: Some(command_id),
            ..Self::new(term, payload)
        }
    }

    /// A snapshot entry. Regular appends reject these; only
    /// `install_snapshot` and the snapshot builder produce them.
    pub fn snapshot(term: u64, payload: Vec<u8>) -> Self {
        Self {
            is_snapshot: true,
            ..Self::new(term, payload)
        }
    }

    /// The ephemeral entry at index 0 of an empty log. Never stored on disk.
    pub fn initial() -> Self {
        Self {
            term: 0,
            timestamp: 0,
            command_id: None,
            is_snapshot: false,
            payload: Vec::new(),
        }
    }

    pub(crate) fn from_parts(meta: EntryMeta, payload: Vec<u8>) -> Self {
        Self {
            term: meta.term,
            timestamp: meta.timestamp,
            command_id: meta.command_id,
            is_snapshot: meta.is_snapshot,
            payload,
        }
    }

    pub fn is_snapshot(&self) -> bool {
        self.is_snapshot
    }

    pub fn meta(&self) -> EntryMeta {
        EntryMeta {
            term: self.term,
            timestamp: self.timestamp,
            is_snapshot: self.is_snapshot,
            command_id: self.command_id,
            length: self.payload.len() as u64,
        }
    }
}

pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_round_trip() {
        let meta = EntryMeta {
            term: 7,
            timestamp: 1_700_000_000_000,
            is_snapshot: false,
            command_id: Some(0),
            length: 42,
        };

        let bytes = meta.encode();
        assert_eq!(bytes.len(), ENTRY_METADATA_SIZE);

        let decoded = EntryMeta::decode(&bytes).unwrap();
        assert_eq!(decoded, meta);
        // Zero is a real command id, distinguished from absence by the flag.
        assert_eq!(decoded.command_id, Some(0));
    }

    #[test]
    fn test_metadata_without_command_id() {
        let meta = LogEntry::new(3, b"payload".to_vec()).meta();
        let decoded = EntryMeta::decode(&meta.encode()).unwrap();
        assert_eq!(decoded.command_id, None);
        assert!(!decoded.is_snapshot);
        assert_eq!(decoded.length, 7);
    }

    #[test]
    fn test_snapshot_flag() {
        let meta = LogEntry::snapshot(5, vec![1, 2, 3]).meta();
        let decoded = EntryMeta::decode(&meta.encode()).unwrap();
        assert!(decoded.is_snapshot);
        assert_eq!(decoded.term, 5);
    }

    #[test]
    fn test_decode_short_input() {
        assert!(EntryMeta::decode(&[0u8; 10]).is_err());
    }

    #[test]
    fn test_decode_unknown_flags() {
        let mut bytes = EntryMeta::default().encode();
        bytes[16] = 0x80;
        assert!(EntryMeta::decode(&bytes).is_err());
    }

    #[test]
    fn test_initial_entry() {
        let initial = LogEntry::initial();
        assert_eq!(initial.term, 0);
        assert!(initial.payload.is_empty());
        assert!(!initial.is_snapshot());
    }
}
