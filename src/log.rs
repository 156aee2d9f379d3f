//! The append-only edit log and its chunk table.
//!
//! The log is partitioned into chunks of a fixed number of edits. The tail
//! chunk fills up as edits are appended; full chunks are eligible for upload
//! to a chunk store, after which only the [`ChunkHandle`] is kept locally.
//! Reading inside such a chunk fetches the payload back on demand and caches
//! it.
//!
//! All mutation is synchronous. The only operation that suspends is
//! [`EditLog::read_at`], and only to fetch a missing payload.

use std::collections::BTreeMap;
use std::num::NonZeroU64;
use std::sync::Arc;

use bytes::Bytes;
use iroh_metrics::inc;
use parking_lot::RwLock;
use tracing::trace;

use crate::bus::ReplicaId;
use crate::edit::Edit;
use crate::metrics::Metrics;
use crate::store::{ChunkHandle, FetchError, Store};
use crate::summary::{Summary, SummaryChunk, SummaryEntry, SummaryError};

/// Chunk size used by the [`EditLog`] `Default` impl.
pub const DEFAULT_CHUNK_SIZE: u64 = 100;

/// The state of one chunk of the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkState {
    /// The edits of this chunk are held locally.
    ///
    /// Only the open tail chunk grows; a full open chunk is waiting to be
    /// uploaded or to receive a handle from a peer.
    Open {
        /// The edits of this chunk, at most `chunk_size` of them.
        edits: Vec<Edit>,
    },
    /// The payload of this chunk lives in the chunk store.
    ///
    /// A chunk becomes referenced at most once and never goes back to open.
    Referenced {
        /// The handle under which the payload can be fetched.
        handle: ChunkHandle,
        /// Payload cache, populated on the first successful fetch.
        cached: Option<Arc<[Edit]>>,
    },
}

impl ChunkState {
    /// Whether the edits of this chunk are held locally.
    pub fn is_open(&self) -> bool {
        matches!(self, ChunkState::Open { .. })
    }

    /// Whether this chunk has been offloaded to the store.
    pub fn is_referenced(&self) -> bool {
        matches!(self, ChunkState::Referenced { .. })
    }

    /// The handle of a referenced chunk.
    pub fn handle(&self) -> Option<ChunkHandle> {
        match self {
            ChunkState::Referenced { handle, .. } => Some(*handle),
            ChunkState::Open { .. } => None,
        }
    }
}

/// Notification that a buffered remote assignment was applied.
///
/// Emitted to [`EditLog::subscribe`] senders when an append fills a chunk for
/// which a handle assignment had been buffered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedAssignment {
    /// First index of the chunk.
    pub start: u64,
    /// The installed handle.
    pub handle: ChunkHandle,
    /// The replica the assignment came from.
    pub from: ReplicaId,
}

/// Outcome of installing a handle on a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    /// The chunk went from open to referenced.
    Installed,
    /// The chunk already carried this handle. No-op.
    AlreadyReferenced,
    /// The chunk is not full yet; the assignment was buffered and will be
    /// applied by the append that fills the chunk.
    Buffered,
}

/// Errors when installing a handle on a chunk.
#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    /// Conflicting handles for the same chunk.
    ///
    /// Two replicas must derive the same handle for the same full chunk. If
    /// they do not, the histories have diverged, which this layer cannot
    /// repair. The state is left untouched.
    #[error("conflicting handles for chunk at {start}: have {}, received {}", existing.fmt_short(), incoming.fmt_short())]
    HandleMismatch {
        /// First index of the chunk.
        start: u64,
        /// The handle already installed.
        existing: ChunkHandle,
        /// The conflicting handle.
        incoming: ChunkHandle,
    },
    /// The index does not lie on a chunk boundary.
    #[error("index {start} is not a chunk boundary")]
    UnalignedStart {
        /// The offending index.
        start: u64,
    },
    /// No full local chunk at this index.
    #[error("no full open chunk at {start} to install a handle on")]
    NotFull {
        /// First index of the chunk.
        start: u64,
    },
}

/// Errors when reading an edit from the log.
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    /// The index is past the end of the log.
    #[error("index {index} is out of range, log length is {len}")]
    OutOfRange {
        /// The requested index.
        index: u64,
        /// The length of the log.
        len: u64,
    },
    /// Fetching the chunk payload from the store failed.
    #[error("failed to fetch chunk at {start}")]
    Fetch {
        /// First index of the chunk.
        start: u64,
        /// The store error.
        #[source]
        source: FetchError,
    },
    /// The fetched payload did not decode to a list of edits.
    #[error("failed to decode payload for chunk at {start}")]
    Decode {
        /// First index of the chunk.
        start: u64,
        /// The decode error.
        #[source]
        source: postcard::Error,
    },
    /// The fetched payload decoded to the wrong number of edits.
    #[error("payload for chunk at {start} contains {found} edits, expected {expected}")]
    WrongPayloadLength {
        /// First index of the chunk.
        start: u64,
        /// The chunk size of the log.
        expected: u64,
        /// The number of edits in the payload.
        found: u64,
    },
}

/// Encode a chunk payload for upload.
///
/// The encoding is deterministic, so two replicas holding the same edits
/// produce byte-identical payloads.
pub fn encode_chunk(edits: &[Edit]) -> Result<Bytes, postcard::Error> {
    postcard::to_stdvec(&edits).map(Bytes::from)
}

/// Decode a chunk payload fetched from the store.
pub fn decode_chunk(payload: &[u8]) -> Result<Vec<Edit>, postcard::Error> {
    postcard::from_bytes(payload)
}

#[derive(Debug)]
struct BufferedAssignment {
    handle: ChunkHandle,
    from: ReplicaId,
}

#[derive(Debug)]
struct Inner {
    chunk_size: u64,
    /// Chunk states in order. `chunks[i]` covers indices
    /// `i * chunk_size .. (i + 1) * chunk_size`.
    chunks: Vec<ChunkState>,
    /// Remote assignments for chunks that are not full yet, by start index.
    buffered: BTreeMap<u64, BufferedAssignment>,
    subscribers: Vec<flume::Sender<AppliedAssignment>>,
}

impl Inner {
    fn len(&self) -> u64 {
        match self.chunks.last() {
            None => 0,
            Some(last) => {
                let full = (self.chunks.len() as u64 - 1) * self.chunk_size;
                full + self.chunk_len(last)
            }
        }
    }

    fn chunk_len(&self, chunk: &ChunkState) -> u64 {
        match chunk {
            ChunkState::Open { edits } => edits.len() as u64,
            // only full chunks are ever uploaded
            ChunkState::Referenced { .. } => self.chunk_size,
        }
    }

    /// Install a handle on a chunk that must exist and be full.
    fn install_full(
        &mut self,
        start: u64,
        handle: ChunkHandle,
    ) -> Result<InstallOutcome, InstallError> {
        let chunk_size = self.chunk_size;
        if start % chunk_size != 0 {
            return Err(InstallError::UnalignedStart { start });
        }
        let Some(state) = self.chunks.get_mut((start / chunk_size) as usize) else {
            return Err(InstallError::NotFull { start });
        };
        match state {
            ChunkState::Open { edits } => {
                if edits.len() as u64 != chunk_size {
                    return Err(InstallError::NotFull { start });
                }
                // this drops the local payload, reads will fetch it back
                *state = ChunkState::Referenced {
                    handle,
                    cached: None,
                };
                inc!(Metrics, assignments_applied);
                Ok(InstallOutcome::Installed)
            }
            ChunkState::Referenced { handle: existing, .. } => {
                if *existing == handle {
                    Ok(InstallOutcome::AlreadyReferenced)
                } else {
                    inc!(Metrics, handle_mismatches);
                    Err(InstallError::HandleMismatch {
                        start,
                        existing: *existing,
                        incoming: handle,
                    })
                }
            }
        }
    }

    fn emit(&mut self, event: AppliedAssignment) {
        self.subscribers
            .retain(|sender| sender.try_send(event.clone()).is_ok());
    }
}

/// A replicated, append-only log of edits, virtualized in chunks.
///
/// Cheaply cloneable; all clones share the same state. Appending and length
/// queries are synchronous, reading may suspend to fetch an offloaded chunk
/// payload from a [`Store`].
#[derive(Debug, Clone)]
pub struct EditLog {
    inner: Arc<RwLock<Inner>>,
}

impl Default for EditLog {
    fn default() -> Self {
        Self::new(NonZeroU64::new(DEFAULT_CHUNK_SIZE).expect("not zero"))
    }
}

impl EditLog {
    /// Create an empty log with the given chunk size.
    pub fn new(chunk_size: NonZeroU64) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                chunk_size: chunk_size.get(),
                chunks: Vec::new(),
                buffered: BTreeMap::new(),
                subscribers: Vec::new(),
            })),
        }
    }

    /// Rebuild a log from a summary.
    ///
    /// The summary is validated first; a malformed summary is rejected as a
    /// whole and no log is constructed. Referenced chunks start out without a
    /// cached payload, the first read inside one fetches it.
    pub fn from_summary(summary: Summary) -> Result<Self, SummaryError> {
        summary.check()?;
        let chunks = summary
            .entries
            .into_iter()
            .map(|entry| match entry.chunk {
                SummaryChunk::Open(edits) => ChunkState::Open { edits },
                SummaryChunk::Referenced(handle) => ChunkState::Referenced {
                    handle,
                    cached: None,
                },
            })
            .collect();
        Ok(Self {
            inner: Arc::new(RwLock::new(Inner {
                chunk_size: summary.chunk_size,
                chunks,
                buffered: BTreeMap::new(),
                subscribers: Vec::new(),
            })),
        })
    }

    /// Serialize the current state into a summary.
    ///
    /// Referenced chunks contribute their handle, open chunks their edits.
    /// Cached payloads of referenced chunks are never included.
    pub fn summary(&self) -> Summary {
        let inner = self.inner.read();
        let chunk_size = inner.chunk_size;
        let entries = inner
            .chunks
            .iter()
            .enumerate()
            .map(|(ord, chunk)| SummaryEntry {
                start: ord as u64 * chunk_size,
                chunk: match chunk {
                    ChunkState::Open { edits } => SummaryChunk::Open(edits.clone()),
                    ChunkState::Referenced { handle, .. } => SummaryChunk::Referenced(*handle),
                },
            })
            .collect();
        Summary {
            chunk_size,
            entries,
        }
    }

    /// The configured chunk size.
    pub fn chunk_size(&self) -> u64 {
        self.inner.read().chunk_size
    }

    /// The number of edits in the log.
    pub fn len(&self) -> u64 {
        self.inner.read().len()
    }

    /// Whether the log contains no edits.
    pub fn is_empty(&self) -> bool {
        self.inner.read().chunks.is_empty()
    }

    /// The number of chunks, `ceil(len / chunk_size)`.
    pub fn chunk_count(&self) -> u64 {
        self.inner.read().chunks.len() as u64
    }

    /// The chunk states with their start indices, in order.
    pub fn chunk_states(&self) -> Vec<(u64, ChunkState)> {
        let inner = self.inner.read();
        inner
            .chunks
            .iter()
            .enumerate()
            .map(|(ord, chunk)| (ord as u64 * inner.chunk_size, chunk.clone()))
            .collect()
    }

    /// Subscribe to notifications about buffered assignments being applied.
    ///
    /// Disconnected subscribers are dropped on the next notification.
    pub fn subscribe(&self, sender: flume::Sender<AppliedAssignment>) {
        self.inner.write().subscribers.push(sender);
    }

    /// Append an edit at the tail of the log.
    ///
    /// Returns the index the edit was appended at. Never fails and never
    /// suspends. If the append fills the tail chunk and a remote assignment
    /// is buffered for it, the assignment is applied in the same step.
    pub fn append(&self, edit: Edit) -> u64 {
        let mut inner = self.inner.write();
        let index = inner.len();
        let chunk_size = inner.chunk_size;
        if index % chunk_size == 0 {
            inner.chunks.push(ChunkState::Open { edits: vec![edit] });
        } else if let Some(ChunkState::Open { edits }) = inner.chunks.last_mut() {
            edits.push(edit);
        } else {
            // a non-boundary length means the tail chunk is open and partial
            unreachable!("tail chunk not open");
        }
        inc!(Metrics, appends);
        if (index + 1) % chunk_size == 0 {
            let start = index + 1 - chunk_size;
            inc!(Metrics, chunks_filled);
            trace!(start, "chunk filled");
            if let Some(buffered) = inner.buffered.remove(&start) {
                let ord = (start / chunk_size) as usize;
                inner.chunks[ord] = ChunkState::Referenced {
                    handle: buffered.handle,
                    cached: None,
                };
                inc!(Metrics, assignments_applied);
                inner.emit(AppliedAssignment {
                    start,
                    handle: buffered.handle,
                    from: buffered.from,
                });
            }
        }
        index
    }

    /// Read the edit at `index`.
    ///
    /// Resolves synchronously for open chunks and for referenced chunks whose
    /// payload is cached. Otherwise the payload is fetched from the store,
    /// validated, cached and the edit returned. A failed fetch leaves the
    /// chunk state untouched, so a later read simply retries.
    pub async fn read_at<S: Store>(&self, index: u64, store: &S) -> Result<Edit, ReadError> {
        // resolve as far as possible under the lock, without fetching
        let (start, offset, chunk_size, handle) = {
            let inner = self.inner.read();
            let len = inner.len();
            if index >= len {
                return Err(ReadError::OutOfRange { index, len });
            }
            let chunk_size = inner.chunk_size;
            let ord = (index / chunk_size) as usize;
            let offset = (index % chunk_size) as usize;
            match &inner.chunks[ord] {
                ChunkState::Open { edits } => return Ok(edits[offset].clone()),
                ChunkState::Referenced { handle, cached } => match cached {
                    Some(edits) => {
                        inc!(Metrics, read_cache_hits);
                        return Ok(edits[offset].clone());
                    }
                    None => (index - index % chunk_size, offset, chunk_size, *handle),
                },
            }
        };

        inc!(Metrics, chunk_fetches);
        let payload = store
            .fetch(&handle)
            .await
            .map_err(|source| ReadError::Fetch { start, source })?;
        let edits = decode_chunk(&payload).map_err(|source| ReadError::Decode { start, source })?;
        if edits.len() as u64 != chunk_size {
            return Err(ReadError::WrongPayloadLength {
                start,
                expected: chunk_size,
                found: edits.len() as u64,
            });
        }
        let edits: Arc<[Edit]> = edits.into();
        let edit = edits[offset].clone();

        // install the cache, the first fetch wins
        let mut inner = self.inner.write();
        let ord = (start / chunk_size) as usize;
        if let Some(ChunkState::Referenced {
            handle: existing,
            cached,
        }) = inner.chunks.get_mut(ord)
        {
            if *existing == handle && cached.is_none() {
                *cached = Some(edits);
            }
        }
        Ok(edit)
    }

    /// The start indices of all full open chunks, in ascending order.
    ///
    /// These are the chunks an upload should be started for. Chunks that are
    /// partial or already referenced are not included.
    pub fn upload_candidates(&self) -> Vec<u64> {
        let inner = self.inner.read();
        let chunk_size = inner.chunk_size;
        inner
            .chunks
            .iter()
            .enumerate()
            .filter_map(|(ord, chunk)| match chunk {
                ChunkState::Open { edits } if edits.len() as u64 == chunk_size => {
                    Some(ord as u64 * chunk_size)
                }
                _ => None,
            })
            .collect()
    }

    /// Snapshot the edits of the full open chunk at `start`.
    ///
    /// Returns `None` when there is no full open chunk at that index, e.g.
    /// because a remote assignment was installed after the chunk was scanned.
    pub fn full_open_edits(&self, start: u64) -> Option<Vec<Edit>> {
        let inner = self.inner.read();
        let chunk_size = inner.chunk_size;
        if start % chunk_size != 0 {
            return None;
        }
        match inner.chunks.get((start / chunk_size) as usize) {
            Some(ChunkState::Open { edits }) if edits.len() as u64 == chunk_size => {
                Some(edits.clone())
            }
            _ => None,
        }
    }

    /// Install the handle returned by our own upload of the chunk at `start`.
    ///
    /// Idempotent when the chunk already carries an equal handle, which
    /// happens when a peer uploaded the same chunk and its assignment arrived
    /// first. Never buffers: uploads are only started for full chunks.
    pub fn apply_upload(
        &self,
        start: u64,
        handle: ChunkHandle,
    ) -> Result<InstallOutcome, InstallError> {
        self.inner.write().install_full(start, handle)
    }

    /// Apply a handle assignment received from a peer.
    ///
    /// If the chunk is full, the handle is installed immediately. If the
    /// chunk does not exist yet or is still partial, the assignment is
    /// buffered and applied by the append that fills the chunk. Re-delivery
    /// of the same assignment is a no-op in every state; a conflicting handle
    /// for the same chunk is an error in every state.
    pub fn apply_remote(
        &self,
        start: u64,
        handle: ChunkHandle,
        from: ReplicaId,
    ) -> Result<InstallOutcome, InstallError> {
        let mut inner = self.inner.write();
        let chunk_size = inner.chunk_size;
        if start % chunk_size != 0 {
            return Err(InstallError::UnalignedStart { start });
        }
        let ord = (start / chunk_size) as usize;
        let full = match inner.chunks.get(ord) {
            Some(ChunkState::Open { edits }) => edits.len() as u64 == chunk_size,
            Some(ChunkState::Referenced { .. }) => true,
            None => false,
        };
        if full {
            return inner.install_full(start, handle);
        }
        match inner.buffered.get(&start) {
            Some(buffered) if buffered.handle == handle => Ok(InstallOutcome::Buffered),
            Some(buffered) => {
                inc!(Metrics, handle_mismatches);
                Err(InstallError::HandleMismatch {
                    start,
                    existing: buffered.handle,
                    incoming: handle,
                })
            }
            None => {
                inner
                    .buffered
                    .insert(start, BufferedAssignment { handle, from });
                inc!(Metrics, assignments_buffered);
                Ok(InstallOutcome::Buffered)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edit::EditId;
    use crate::store::mem;

    const C: u64 = 4;

    fn log() -> EditLog {
        EditLog::new(NonZeroU64::new(C).unwrap())
    }

    fn edit(i: u8) -> Edit {
        Edit::with_id(EditId::from_bytes([i; 16]), vec![i])
    }

    fn fill(log: &EditLog, range: std::ops::Range<u8>) {
        for i in range {
            log.append(edit(i));
        }
    }

    fn replica() -> ReplicaId {
        ReplicaId::from_bytes([9; 16])
    }

    #[test]
    fn test_chunk_count() {
        for len in 0..=(3 * C + 1) {
            let log = log();
            for i in 0..len {
                log.append(edit(i as u8));
            }
            assert_eq!(log.len(), len);
            assert_eq!(log.chunk_count(), len.div_ceil(C), "len {len}");
        }
    }

    #[test]
    fn test_all_chunks_but_last_are_full() {
        let log = log();
        fill(&log, 0..(3 * C as u8 + 2));
        let states = log.chunk_states();
        for (start, state) in &states[..states.len() - 1] {
            match state {
                ChunkState::Open { edits } => {
                    assert_eq!(edits.len() as u64, C, "chunk at {start}")
                }
                ChunkState::Referenced { .. } => {}
            }
        }
    }

    #[tokio::test]
    async fn test_append_read() {
        let store = mem::Store::new();
        let log = log();
        for i in 0..10u8 {
            let index = log.append(edit(i));
            assert_eq!(index, i as u64);
        }
        for i in 0..10u8 {
            let got = log.read_at(i as u64, &store).await.unwrap();
            assert_eq!(got, edit(i));
        }
        let err = log.read_at(10, &store).await.unwrap_err();
        assert!(matches!(err, ReadError::OutOfRange { index: 10, len: 10 }));
    }

    #[test]
    fn test_upload_candidates() {
        let log = log();
        assert!(log.upload_candidates().is_empty());
        fill(&log, 0..(2 * C as u8 + 1));
        assert_eq!(log.upload_candidates(), vec![0, C]);
        // referenced chunks are no longer candidates
        let handle = ChunkHandle::from_bytes([1; 32]);
        log.apply_upload(0, handle).unwrap();
        assert_eq!(log.upload_candidates(), vec![C]);
    }

    #[test]
    fn test_apply_upload() {
        let log = log();
        fill(&log, 0..C as u8);
        let handle = ChunkHandle::from_bytes([1; 32]);
        assert_eq!(log.apply_upload(0, handle).unwrap(), InstallOutcome::Installed);
        assert_eq!(log.chunk_states()[0].1.handle(), Some(handle));
        // equal handle is a no-op
        assert_eq!(
            log.apply_upload(0, handle).unwrap(),
            InstallOutcome::AlreadyReferenced
        );
        // conflicting handle is an error and leaves the state untouched
        let other = ChunkHandle::from_bytes([2; 32]);
        let err = log.apply_upload(0, other).unwrap_err();
        assert!(matches!(err, InstallError::HandleMismatch { start: 0, .. }));
        assert_eq!(log.chunk_states()[0].1.handle(), Some(handle));
    }

    #[test]
    fn test_apply_upload_requires_full_chunk() {
        let log = log();
        fill(&log, 0..(C as u8 - 1));
        let handle = ChunkHandle::from_bytes([1; 32]);
        let err = log.apply_upload(0, handle).unwrap_err();
        assert!(matches!(err, InstallError::NotFull { start: 0 }));
        let err = log.apply_upload(1, handle).unwrap_err();
        assert!(matches!(err, InstallError::UnalignedStart { start: 1 }));
    }

    #[test]
    fn test_apply_remote_direct() {
        let log = log();
        fill(&log, 0..C as u8);
        let handle = ChunkHandle::from_bytes([1; 32]);
        assert_eq!(
            log.apply_remote(0, handle, replica()).unwrap(),
            InstallOutcome::Installed
        );
        // re-delivery is a no-op
        assert_eq!(
            log.apply_remote(0, handle, replica()).unwrap(),
            InstallOutcome::AlreadyReferenced
        );
    }

    #[test]
    fn test_apply_remote_buffers_until_chunk_fills() {
        let log = log();
        let (tx, rx) = flume::unbounded();
        log.subscribe(tx);
        fill(&log, 0..2);

        let handle = ChunkHandle::from_bytes([1; 32]);
        assert_eq!(
            log.apply_remote(0, handle, replica()).unwrap(),
            InstallOutcome::Buffered
        );
        // buffering does not change the chunk state
        assert!(log.chunk_states()[0].1.is_open());
        // re-delivery while buffered is a no-op
        assert_eq!(
            log.apply_remote(0, handle, replica()).unwrap(),
            InstallOutcome::Buffered
        );
        // a conflicting buffered assignment is an error
        let other = ChunkHandle::from_bytes([2; 32]);
        let err = log.apply_remote(0, other, replica()).unwrap_err();
        assert!(matches!(err, InstallError::HandleMismatch { start: 0, .. }));

        // the append that fills the chunk applies the assignment
        fill(&log, 2..C as u8);
        assert_eq!(log.chunk_states()[0].1.handle(), Some(handle));
        let applied = rx.try_recv().unwrap();
        assert_eq!(
            applied,
            AppliedAssignment {
                start: 0,
                handle,
                from: replica()
            }
        );
    }

    #[test]
    fn test_apply_remote_buffers_future_chunk() {
        let log = log();
        let handle = ChunkHandle::from_bytes([1; 32]);
        // chunk at 2 * C does not exist at all yet
        assert_eq!(
            log.apply_remote(2 * C, handle, replica()).unwrap(),
            InstallOutcome::Buffered
        );
        fill(&log, 0..(3 * C as u8));
        assert_eq!(log.chunk_states()[2].1.handle(), Some(handle));
    }

    #[tokio::test]
    async fn test_read_at_fetches_and_caches() {
        let store = mem::Store::new();
        let log = log();
        fill(&log, 0..C as u8);
        let edits = log.full_open_edits(0).unwrap();
        let payload = encode_chunk(&edits).unwrap();
        let handle = store.upload(payload).await.unwrap();
        log.apply_upload(0, handle).unwrap();

        // the local payload was dropped on install
        assert!(matches!(
            &log.chunk_states()[0].1,
            ChunkState::Referenced { cached: None, .. }
        ));
        // reads resolve through the store and fill the cache
        for i in 0..C {
            assert_eq!(log.read_at(i, &store).await.unwrap(), edit(i as u8));
        }
        assert!(matches!(
            &log.chunk_states()[0].1,
            ChunkState::Referenced { cached: Some(_), .. }
        ));
    }

    #[tokio::test]
    async fn test_read_at_fetch_failure_leaves_state() {
        let store = mem::Store::new();
        let log = log();
        fill(&log, 0..C as u8);
        let edits = log.full_open_edits(0).unwrap();
        let payload = encode_chunk(&edits).unwrap();
        // install the correct handle without uploading the payload
        let handle = mem::Store::handle_for(&payload);
        log.apply_upload(0, handle).unwrap();

        let err = log.read_at(0, &store).await.unwrap_err();
        assert!(matches!(
            err,
            ReadError::Fetch {
                start: 0,
                source: FetchError::HandleNotFound(_)
            }
        ));
        assert_eq!(log.chunk_states()[0].1.handle(), Some(handle));

        // once the store has the payload the same read succeeds
        store.upload(payload).await.unwrap();
        assert_eq!(log.read_at(0, &store).await.unwrap(), edit(0));
    }

    #[tokio::test]
    async fn test_read_at_rejects_short_payload() {
        let store = mem::Store::new();
        let log = log();
        fill(&log, 0..C as u8);
        // a payload with too few edits, stored under its own handle
        let short = encode_chunk(&[edit(0)]).unwrap();
        let handle = store.upload(short).await.unwrap();
        log.apply_upload(0, handle).unwrap();

        let err = log.read_at(0, &store).await.unwrap_err();
        assert!(matches!(
            err,
            ReadError::WrongPayloadLength {
                start: 0,
                expected: C,
                found: 1
            }
        ));
    }

    #[tokio::test]
    async fn test_read_at_rejects_undecodable_payload() {
        let store = mem::Store::new();
        let log = log();
        fill(&log, 0..C as u8);
        // bytes that do not decode to an edit list, stored under their own
        // handle
        let garbage = Bytes::from_static(&[0xff; 9]);
        let handle = store.upload(garbage).await.unwrap();
        log.apply_upload(0, handle).unwrap();

        let err = log.read_at(0, &store).await.unwrap_err();
        assert!(matches!(err, ReadError::Decode { start: 0, .. }));
        // the reference is untouched, a later fetch of good bytes could
        // still succeed
        assert_eq!(log.chunk_states()[0].1.handle(), Some(handle));
    }

    #[test]
    fn test_summary_roundtrip() {
        let log = log();
        fill(&log, 0..(2 * C as u8 + 1));
        let handle = ChunkHandle::from_bytes([1; 32]);
        log.apply_upload(0, handle).unwrap();

        let restored = EditLog::from_summary(log.summary()).unwrap();
        assert_eq!(restored.len(), log.len());
        assert_eq!(restored.chunk_size(), log.chunk_size());
        assert_eq!(restored.chunk_states(), log.chunk_states());
    }
}
