//! Whole-log summaries.
//!
//! A summary serializes the entire chunk table of a log: open chunks with
//! their edits, referenced chunks as just their handle. Loading a summary
//! validates it strictly, a malformed summary is rejected as a whole.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::edit::Edit;
use crate::store::ChunkHandle;

/// Version tag prepended to the serialized form of a [`Summary`].
pub const SUMMARY_VERSION: u32 = 1;

/// A serialized snapshot of a whole log.
///
/// Entries cover the log contiguously from index 0, one per chunk. The chunk
/// size is carried along so that a fresh replica can bootstrap from a summary
/// alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    /// The chunk size of the log this summary was taken from.
    pub chunk_size: u64,
    /// One entry per chunk, in log order.
    pub entries: Vec<SummaryEntry>,
}

/// One chunk of a [`Summary`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryEntry {
    /// First index covered by this chunk.
    pub start: u64,
    /// The chunk, either inline or by reference.
    pub chunk: SummaryChunk,
}

/// The two serialized forms of a chunk.
///
/// Consumers tell the forms apart by the serialized variant, there is no
/// separate discriminator field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SummaryChunk {
    /// A chunk serialized with its edits.
    Open(Vec<Edit>),
    /// A chunk serialized as the handle of its uploaded payload.
    ///
    /// Referenced chunks are always full, so the entry describes exactly
    /// `chunk_size` edits.
    Referenced(ChunkHandle),
}

/// Errors when validating or decoding a [`Summary`].
#[derive(Debug, thiserror::Error)]
pub enum SummaryError {
    /// The serialized summary has an unknown format version.
    #[error("summary version {found} is not supported")]
    UnsupportedVersion {
        /// The version found in the serialized bytes.
        found: u32,
    },
    /// The summary declares a chunk size of zero.
    #[error("chunk size must not be zero")]
    ZeroChunkSize,
    /// An entry does not start where the previous one ended.
    #[error("summary entries are not contiguous: expected chunk start {expected}, found {found}")]
    NonContiguous {
        /// Where the entry should have started.
        expected: u64,
        /// Where the entry claims to start.
        found: u64,
    },
    /// An open chunk has the wrong number of edits.
    #[error("open chunk at {start} has {found} edits, expected {expected}")]
    WrongChunkLength {
        /// First index of the chunk.
        start: u64,
        /// The number of edits required at this position.
        expected: u64,
        /// The number of edits found.
        found: u64,
    },
    /// An open chunk has no edits at all.
    #[error("summary contains an empty chunk at {start}")]
    EmptyChunk {
        /// First index of the chunk.
        start: u64,
    },
    /// Encoding or decoding the postcard bytes failed.
    #[error(transparent)]
    Postcard(#[from] postcard::Error),
}

impl Summary {
    /// The number of edits this summary describes.
    pub fn len(&self) -> u64 {
        self.entries
            .iter()
            .map(|entry| match &entry.chunk {
                SummaryChunk::Open(edits) => edits.len() as u64,
                SummaryChunk::Referenced(_) => self.chunk_size,
            })
            .sum()
    }

    /// Whether the summary describes an empty log.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Validate the summary.
    ///
    /// Checks that the chunk size is nonzero, that the entries cover the log
    /// contiguously from index 0 in order, that every non-final open chunk
    /// holds exactly `chunk_size` edits and that the final open chunk holds
    /// between one and `chunk_size` edits.
    pub fn check(&self) -> Result<(), SummaryError> {
        if self.chunk_size == 0 {
            return Err(SummaryError::ZeroChunkSize);
        }
        for (ord, entry) in self.entries.iter().enumerate() {
            let expected = ord as u64 * self.chunk_size;
            if entry.start != expected {
                return Err(SummaryError::NonContiguous {
                    expected,
                    found: entry.start,
                });
            }
            // referenced chunks are full by construction
            if let SummaryChunk::Open(edits) = &entry.chunk {
                if edits.is_empty() {
                    return Err(SummaryError::EmptyChunk { start: entry.start });
                }
                let last = ord + 1 == self.entries.len();
                let found = edits.len() as u64;
                if found > self.chunk_size || (!last && found != self.chunk_size) {
                    return Err(SummaryError::WrongChunkLength {
                        start: entry.start,
                        expected: self.chunk_size,
                        found,
                    });
                }
            }
        }
        Ok(())
    }

    /// Serialize to bytes, prefixed with [`SUMMARY_VERSION`].
    pub fn to_bytes(&self) -> Result<Bytes, SummaryError> {
        let mut bytes = postcard::to_stdvec(&SUMMARY_VERSION)?;
        bytes.extend_from_slice(&postcard::to_stdvec(self)?);
        Ok(bytes.into())
    }

    /// Deserialize from bytes produced by [`Self::to_bytes`].
    ///
    /// The summary is validated with [`Self::check`]; malformed input fails
    /// outright.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SummaryError> {
        let (version, rest) = postcard::take_from_bytes::<u32>(bytes)?;
        if version != SUMMARY_VERSION {
            return Err(SummaryError::UnsupportedVersion { found: version });
        }
        let summary: Summary = postcard::from_bytes(rest)?;
        summary.check()?;
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edit::EditId;

    const C: u64 = 3;

    fn edit(i: u8) -> Edit {
        Edit::with_id(EditId::from_bytes([i; 16]), vec![i])
    }

    fn edits(range: std::ops::Range<u8>) -> Vec<Edit> {
        range.map(edit).collect()
    }

    fn handle(i: u8) -> ChunkHandle {
        ChunkHandle::from_bytes([i; 32])
    }

    fn summary(entries: Vec<SummaryEntry>) -> Summary {
        Summary {
            chunk_size: C,
            entries,
        }
    }

    fn open(start: u64, edits: Vec<Edit>) -> SummaryEntry {
        SummaryEntry {
            start,
            chunk: SummaryChunk::Open(edits),
        }
    }

    fn referenced(start: u64, h: ChunkHandle) -> SummaryEntry {
        SummaryEntry {
            start,
            chunk: SummaryChunk::Referenced(h),
        }
    }

    #[test]
    fn test_check_ok() {
        summary(vec![]).check().unwrap();
        summary(vec![open(0, edits(0..1))]).check().unwrap();
        summary(vec![referenced(0, handle(1))]).check().unwrap();
        summary(vec![
            referenced(0, handle(1)),
            open(C, edits(0..3)),
            open(2 * C, edits(3..4)),
        ])
        .check()
        .unwrap();
    }

    #[test]
    fn test_check_len() {
        let s = summary(vec![
            referenced(0, handle(1)),
            open(C, edits(0..2)),
        ]);
        s.check().unwrap();
        assert_eq!(s.len(), C + 2);
        assert!(summary(vec![]).is_empty());
    }

    #[test]
    fn test_check_rejects_gap() {
        let err = summary(vec![referenced(0, handle(1)), open(2 * C, edits(0..1))])
            .check()
            .unwrap_err();
        assert!(matches!(
            err,
            SummaryError::NonContiguous { expected, found } if expected == C && found == 2 * C
        ));
    }

    #[test]
    fn test_check_rejects_out_of_order() {
        let err = summary(vec![open(C, edits(0..3)), referenced(0, handle(1))])
            .check()
            .unwrap_err();
        assert!(matches!(
            err,
            SummaryError::NonContiguous { expected: 0, found } if found == C
        ));
    }

    #[test]
    fn test_check_rejects_short_non_final_chunk() {
        let err = summary(vec![open(0, edits(0..2)), open(C, edits(2..3))])
            .check()
            .unwrap_err();
        assert!(matches!(
            err,
            SummaryError::WrongChunkLength { start: 0, found: 2, .. }
        ));
    }

    #[test]
    fn test_check_rejects_oversize_final_chunk() {
        let err = summary(vec![open(0, edits(0..5))]).check().unwrap_err();
        assert!(matches!(
            err,
            SummaryError::WrongChunkLength { start: 0, found: 5, .. }
        ));
    }

    #[test]
    fn test_check_rejects_empty_chunk() {
        let err = summary(vec![open(0, vec![])]).check().unwrap_err();
        assert!(matches!(err, SummaryError::EmptyChunk { start: 0 }));
    }

    #[test]
    fn test_check_rejects_zero_chunk_size() {
        let s = Summary {
            chunk_size: 0,
            entries: vec![],
        };
        assert!(matches!(s.check(), Err(SummaryError::ZeroChunkSize)));
    }

    #[test]
    fn test_bytes_roundtrip() {
        let s = summary(vec![referenced(0, handle(1)), open(C, edits(0..2))]);
        let bytes = s.to_bytes().unwrap();
        let restored = Summary::from_bytes(&bytes).unwrap();
        assert_eq!(s, restored);
    }

    #[test]
    fn test_from_bytes_rejects_unknown_version() {
        let s = summary(vec![open(0, edits(0..1))]);
        let mut bytes = postcard::to_stdvec(&99u32).unwrap();
        bytes.extend_from_slice(&postcard::to_stdvec(&s).unwrap());
        let err = Summary::from_bytes(&bytes).unwrap_err();
        assert!(matches!(
            err,
            SummaryError::UnsupportedVersion { found: 99 }
        ));
    }

    #[test]
    fn test_from_bytes_rejects_malformed() {
        let s = summary(vec![open(0, edits(0..2)), open(C, edits(2..3))]);
        // encoding does not validate, decoding does
        let bytes = s.to_bytes().unwrap();
        let err = Summary::from_bytes(&bytes).unwrap_err();
        assert!(matches!(err, SummaryError::WrongChunkLength { .. }));
    }

    #[test]
    fn test_json_shape_distinguishes_chunks() {
        let s = summary(vec![referenced(0, handle(1)), open(C, edits(0..1))]);
        let json = serde_json::to_value(&s).unwrap();
        let entries = json.get("entries").unwrap().as_array().unwrap();
        assert!(entries[0].get("chunk").unwrap().get("Referenced").unwrap().is_string());
        assert!(entries[1].get("chunk").unwrap().get("Open").unwrap().is_array());
    }
}
