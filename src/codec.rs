//! Chunk Codec
//!
//! Splits an artifact's bytes into bounded-size chunk messages and puts them back
//! together. Wire form of one chunk:
//!
//! ```text
//! <identity>|<sequence index>|<total count>|<raw payload bytes>
//! ```
//!
//! Reassembly never relies on transport ordering: every chunk carries its index and
//! the buffer fills slots by index.

use crate::error::SorterError;
use crate::types::LogicalIdentity;

/// Wire delimiter between header fields.
pub const FIELD_DELIMITER: u8 = b'|';

/// One bounded-size fragment of an artifact plus its position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkMessage {
    pub identity: LogicalIdentity,
    pub index: usize,
    pub count: usize,
    pub payload: Vec<u8>,
}

impl ChunkMessage {
    /// Serialize header and payload into one wire message.
    pub fn to_wire(&self) -> Vec<u8> {
        let header = format!(
            "{}|{}|{}|",
            self.identity.as_str(),
            self.index,
            self.count
        );
        let mut msg = Vec::with_capacity(header.len() + self.payload.len());
        msg.extend_from_slice(header.as_bytes());
        msg.extend_from_slice(&self.payload);
        msg
    }

    /// Parse a wire message.
    ///
    /// The first three `|` split off the header; everything after the third is
    /// payload and may itself contain `|`.
    pub fn decode(message: &[u8]) -> Result<Self, SorterError> {
        let mut parts = message.splitn(4, |b| *b == FIELD_DELIMITER);
        let (Some(raw_id), Some(raw_index), Some(raw_count), Some(payload)) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(SorterError::MalformedMessage(
                "header must have identity, index and count fields".to_string(),
            ));
        };

        let id_str = std::str::from_utf8(raw_id)
            .map_err(|_| SorterError::MalformedMessage("identity is not UTF-8".to_string()))?;
        let identity = LogicalIdentity::parse(id_str).ok_or_else(|| {
            SorterError::MalformedMessage(format!("invalid identity '{}'", id_str))
        })?;
        let index = parse_field(raw_index, "index")?;
        let count = parse_field(raw_count, "count")?;

        if count == 0 {
            return Err(SorterError::MalformedMessage(format!(
                "chunk count must be at least 1 for {}",
                identity
            )));
        }
        if index >= count {
            return Err(SorterError::MalformedMessage(format!(
                "chunk index {} out of range for count {} ({})",
                index, count, identity
            )));
        }

        Ok(Self {
            identity,
            index,
            count,
            payload: payload.to_vec(),
        })
    }
}

fn parse_field(raw: &[u8], field: &str) -> Result<usize, SorterError> {
    if raw.is_empty() || !raw.iter().all(u8::is_ascii_digit) {
        return Err(SorterError::MalformedMessage(format!(
            "{} field '{}' is not a non-negative integer",
            field,
            String::from_utf8_lossy(raw)
        )));
    }
    // All ASCII digits, so the only failure left is overflow.
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .ok_or_else(|| SorterError::MalformedMessage(format!("{} field overflows", field)))
}

/// Split `bytes` into `ceil(len / max_chunk_size)` chunks tagged with index and count.
///
/// An empty artifact still produces one (empty) chunk so that the consumer sees a
/// complete stream.
pub fn encode(
    identity: &LogicalIdentity,
    bytes: &[u8],
    max_chunk_size: usize,
) -> Result<Vec<ChunkMessage>, SorterError> {
    if max_chunk_size == 0 {
        return Err(SorterError::ConfigError(
            "chunk size must be at least 1 byte".to_string(),
        ));
    }
    if bytes.is_empty() {
        return Ok(vec![ChunkMessage {
            identity: identity.clone(),
            index: 0,
            count: 1,
            payload: Vec::new(),
        }]);
    }

    let count = bytes.len().div_ceil(max_chunk_size);
    Ok(bytes
        .chunks(max_chunk_size)
        .enumerate()
        .map(|(index, slice)| ChunkMessage {
            identity: identity.clone(),
            index,
            count,
            payload: slice.to_vec(),
        })
        .collect())
}

/// Outcome of feeding one chunk into a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reassembly {
    /// All slots filled; the concatenated bytes in index order.
    Complete(Vec<u8>),
    Incomplete { received: usize, total: usize },
}

/// Per-identity accumulator of chunk payloads.
#[derive(Debug, Clone)]
pub struct ReassemblyBuffer {
    slots: Vec<Option<Vec<u8>>>,
    received: usize,
}

impl ReassemblyBuffer {
    /// Create a buffer sized to the count reported by the first chunk seen.
    pub fn new(count: usize) -> Self {
        Self {
            slots: vec![None; count],
            received: 0,
        }
    }

    pub fn total(&self) -> usize {
        self.slots.len()
    }

    pub fn received(&self) -> usize {
        self.received
    }

    /// Insert a payload into slot `index`.
    ///
    /// A chunk delivered twice overwrites its slot without counting twice.
    pub fn insert(
        &mut self,
        identity: &LogicalIdentity,
        index: usize,
        count: usize,
        payload: Vec<u8>,
    ) -> Result<Reassembly, SorterError> {
        if count != self.slots.len() {
            return Err(SorterError::ChunkCountMismatch {
                identity: identity.clone(),
                expected: self.slots.len(),
                actual: count,
            });
        }
        let slot = self.slots.get_mut(index).ok_or_else(|| {
            SorterError::MalformedMessage(format!(
                "chunk index {} out of range for count {} ({})",
                index, count, identity
            ))
        })?;
        if slot.is_none() {
            self.received += 1;
        }
        *slot = Some(payload);

        if self.received < self.slots.len() {
            return Ok(Reassembly::Incomplete {
                received: self.received,
                total: self.slots.len(),
            });
        }

        let size = self.slots.iter().flatten().map(Vec::len).sum();
        let mut bytes = Vec::with_capacity(size);
        for part in self.slots.iter().flatten() {
            bytes.extend_from_slice(part);
        }
        Ok(Reassembly::Complete(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn id() -> LogicalIdentity {
        LogicalIdentity::new("hostA", "a.png").unwrap()
    }

    fn feed(messages: &[ChunkMessage]) -> Option<Vec<u8>> {
        let mut buffer = ReassemblyBuffer::new(messages[0].count);
        let mut out = None;
        for msg in messages {
            let decoded = ChunkMessage::decode(&msg.to_wire()).unwrap();
            if let Reassembly::Complete(bytes) = buffer
                .insert(&decoded.identity, decoded.index, decoded.count, decoded.payload)
                .unwrap()
            {
                out = Some(bytes);
            }
        }
        out
    }

    #[test]
    fn test_encode_chunk_count() {
        let data = vec![7u8; 10];
        let chunks = encode(&id(), &data, 4).unwrap();
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.count == 3));
        assert_eq!(chunks[2].payload.len(), 2);
        assert_eq!(
            chunks.iter().map(|c| c.index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[test]
    fn test_encode_rejects_zero_chunk_size() {
        assert!(matches!(
            encode(&id(), b"abc", 0),
            Err(SorterError::ConfigError(_))
        ));
    }

    #[test]
    fn test_empty_artifact_is_one_empty_chunk() {
        let chunks = encode(&id(), b"", 16).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(feed(&chunks), Some(Vec::new()));
    }

    #[test]
    fn test_wire_header_format() {
        let msg = ChunkMessage {
            identity: id(),
            index: 1,
            count: 3,
            payload: b"xy|z".to_vec(),
        };
        assert_eq!(msg.to_wire(), b"hostA:a.png|1|3|xy|z".to_vec());
        assert_eq!(ChunkMessage::decode(b"hostA:a.png|1|3|xy|z").unwrap(), msg);
    }

    #[test]
    fn test_decode_rejects_malformed_headers() {
        let cases = [
            "hostA:a.png|1|3",
            "hostA:a.png|x|3|data",
            "hostA:a.png|-1|3|data",
            "hostA:a.png|+1|3|data",
            "hostA:a.png|3|3|data",
            "hostA:a.png|0|0|",
            "no-host|0|1|data",
            "|0|1|data",
            "hostA:a.png|99999999999999999999999|1|",
        ];
        for case in cases {
            assert!(
                matches!(
                    ChunkMessage::decode(case.as_bytes()),
                    Err(SorterError::MalformedMessage(_))
                ),
                "expected malformed: {}",
                case
            );
        }
        assert!(ChunkMessage::decode(&[0xff, b'|', b'0', b'|', b'1', b'|']).is_err());
    }

    #[test]
    fn test_partial_delivery_completes_on_last_chunk() {
        let data = b"abcdefghi".to_vec();
        let chunks = encode(&id(), &data, 3).unwrap();
        let mut buffer = ReassemblyBuffer::new(3);

        for i in [0, 2] {
            let c = &chunks[i];
            let r = buffer.insert(&c.identity, c.index, c.count, c.payload.clone()).unwrap();
            assert!(matches!(r, Reassembly::Incomplete { total: 3, .. }));
        }
        let c = &chunks[1];
        let r = buffer.insert(&c.identity, c.index, c.count, c.payload.clone()).unwrap();
        assert_eq!(r, Reassembly::Complete(data));
    }

    #[test]
    fn test_duplicate_chunk_is_not_counted_twice() {
        let mut buffer = ReassemblyBuffer::new(2);
        buffer.insert(&id(), 0, 2, b"a".to_vec()).unwrap();
        let r = buffer.insert(&id(), 0, 2, b"a".to_vec()).unwrap();
        assert_eq!(r, Reassembly::Incomplete { received: 1, total: 2 });
    }

    #[test]
    fn test_count_mismatch() {
        let mut buffer = ReassemblyBuffer::new(3);
        buffer.insert(&id(), 0, 3, b"a".to_vec()).unwrap();
        let err = buffer.insert(&id(), 1, 4, b"b".to_vec()).unwrap_err();
        assert!(matches!(
            err,
            SorterError::ChunkCountMismatch {
                expected: 3,
                actual: 4,
                ..
            }
        ));
    }

    proptest! {
        #[test]
        fn prop_reassembly_is_order_independent(
            data in proptest::collection::vec(any::<u8>(), 0..2048),
            max_chunk in 1usize..300,
            seed in any::<u64>(),
        ) {
            let mut chunks = encode(&id(), &data, max_chunk).unwrap();
            prop_assert_eq!(chunks.len(), data.len().div_ceil(max_chunk).max(1));

            // Deterministic shuffle driven by the seed.
            let mut state = seed | 1;
            for i in (1..chunks.len()).rev() {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                let j = (state % (i as u64 + 1)) as usize;
                chunks.swap(i, j);
            }

            prop_assert_eq!(feed(&chunks), Some(data));
        }
    }
}
