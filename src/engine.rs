//! The engine that drives chunk virtualization for one replica.
//!
//! [`Engine::spawn`] starts an actor that owns everything asynchronous about
//! a log: uploading full chunks to the store on save, broadcasting the
//! resulting handle assignments over the bus, and applying assignments
//! received from peers. The [`Engine`] itself is a cheap handle to that
//! actor.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Poll;

use anyhow::Result;
use futures_lite::{Stream, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::task::AbortOnDropHandle;
use tracing::{error, error_span, Instrument};

use crate::bus::{Bus, ReplicaId};
use crate::edit::Edit;
use crate::log::{EditLog, ReadError};
use crate::store::{ChunkHandle, Store};
use crate::summary::Summary;

use self::actor::{Actor, ToActor};

mod actor;

/// Capacity of the channel for the [`ToActor`] messages.
const ACTOR_CHANNEL_CAP: usize = 64;
/// Capacity for the channels for [`Engine::subscribe`].
const SUBSCRIBE_CHANNEL_CAP: usize = 256;

/// Configuration for an [`Engine`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum number of chunk uploads that run concurrently.
    ///
    /// Further candidates wait in a queue and are started in ascending chunk
    /// order as slots free up.
    pub max_concurrent_uploads: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent_uploads: 8,
        }
    }
}

/// Events informing about the progress of virtualization.
#[derive(Debug, Clone, Eq, PartialEq, strum::Display)]
pub enum Event {
    /// A chunk uploaded by this replica is now referenced by its handle.
    ChunkUploaded {
        /// First index of the chunk.
        start: u64,
        /// The handle the chunk was uploaded under.
        handle: ChunkHandle,
    },
    /// A handle assignment received from a peer was applied to a chunk.
    RemoteAssignment {
        /// First index of the chunk.
        start: u64,
        /// The installed handle.
        handle: ChunkHandle,
        /// The peer that uploaded the chunk.
        from: ReplicaId,
    },
    /// All uploads begun by one save call have settled.
    ///
    /// Emitted exactly once per save, after every upload of that save either
    /// completed (and its assignment was broadcast) or failed.
    ChunksUploaded {
        /// Number of chunks that ended up referenced.
        uploaded: usize,
        /// Number of chunks whose upload failed and which stayed open.
        failed: usize,
    },
    /// Two different handles were observed for the same chunk.
    ///
    /// This cannot happen while all replicas hold the same history, so it
    /// means the histories have diverged. The engine keeps serving reads and
    /// appends; it is up to the application to decide how to react.
    HandleMismatch {
        /// First index of the chunk.
        start: u64,
        /// The handle the chunk already carries.
        existing: ChunkHandle,
        /// The conflicting handle.
        incoming: ChunkHandle,
    },
}

/// Outcome of the upload batch begun by one save.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UploadOutcome {
    /// Chunks that ended up referenced, by our upload or by an equal
    /// assignment from a peer.
    pub uploaded: usize,
    /// Chunks whose upload failed and which stayed open. The next save picks
    /// them up again.
    pub failed: usize,
}

/// Error returned when waiting for a save's upload batch.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SaveError {
    /// The engine shut down before the batch settled.
    #[error("engine shut down before the uploads settled")]
    ActorClosed,
}

/// Handle returned by [`Engine::save`].
///
/// The summary is available immediately via [`SaveHandle::summary`].
/// Awaiting the handle resolves once every upload begun by this save has
/// settled; dropping it does not cancel the uploads.
#[derive(Debug)]
pub struct SaveHandle {
    summary: Summary,
    /// Receiver to retrieve the outcome of this save's upload batch.
    receiver: oneshot::Receiver<UploadOutcome>,
}

impl SaveHandle {
    /// The summary taken by this save.
    pub fn summary(&self) -> &Summary {
        &self.summary
    }

    /// Consume the handle, keeping only the summary.
    pub fn into_summary(self) -> Summary {
        self.summary
    }
}

impl Future for SaveHandle {
    type Output = Result<UploadOutcome, SaveError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<Self::Output> {
        use std::task::Poll::*;
        // remove the receiver error from the middle, holders only care
        // whether the batch settled
        match Pin::new(&mut self.receiver).poll(cx) {
            Ready(Ok(outcome)) => Ready(Ok(outcome)),
            Ready(Err(_recv_err)) => Ready(Err(SaveError::ActorClosed)),
            Pending => Pending,
        }
    }
}

/// The virtualization engine of one replica.
///
/// Cheap to clone. The actor is aborted when the last clone is dropped; use
/// [`Engine::shutdown`] for a clean exit.
#[derive(derive_more::Debug, Clone)]
pub struct Engine<S: Store> {
    log: EditLog,
    #[debug("Store")]
    store: S,
    me: ReplicaId,
    to_actor: mpsc::Sender<ToActor>,
    #[allow(dead_code)]
    actor_handle: Arc<AbortOnDropHandle<()>>,
}

impl<S: Store> Engine<S> {
    /// Start the engine for `log`.
    ///
    /// Full chunks are uploaded to `store`; handle assignments are exchanged
    /// with peers over `bus`. Spawns a tokio task for the actor, so this must
    /// be called from within a runtime.
    pub fn spawn<B: Bus>(log: EditLog, store: S, bus: B, me: ReplicaId, config: Config) -> Self {
        let (to_actor, inbox) = mpsc::channel(ACTOR_CHANNEL_CAP);
        // subscribe before the actor starts so no bus message is missed
        let bus_events = bus.subscribe().boxed();
        let actor = Actor::new(log.clone(), store.clone(), bus, bus_events, config, inbox);
        let me_short = me.fmt_short();
        let actor_handle = tokio::task::spawn(
            async move {
                if let Err(err) = actor.run().await {
                    error!("engine actor failed: {err:?}");
                }
            }
            .instrument(error_span!("engine", me = %me_short)),
        );
        Self {
            log,
            store,
            me,
            to_actor,
            actor_handle: Arc::new(AbortOnDropHandle::new(actor_handle)),
        }
    }

    /// The replica id of this engine.
    pub fn me(&self) -> ReplicaId {
        self.me
    }

    /// The log this engine drives.
    pub fn log(&self) -> &EditLog {
        &self.log
    }

    /// Append an edit to the log, returning its index.
    pub fn append(&self, edit: Edit) -> u64 {
        self.log.append(edit)
    }

    /// The number of edits in the log.
    pub fn len(&self) -> u64 {
        self.log.len()
    }

    /// Whether the log contains no edits.
    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    /// Read the edit at `index`, fetching its chunk from the store if it is
    /// not held locally.
    pub async fn read_at(&self, index: u64) -> Result<Edit, ReadError> {
        self.log.read_at(index, &self.store).await
    }

    /// Save the log.
    ///
    /// Takes a summary of the current state and begins uploading all full
    /// chunks that still hold their edits locally. The summary is available
    /// on the returned handle immediately; the uploads proceed in the
    /// background, see [`SaveHandle`].
    pub async fn save(&self) -> Result<SaveHandle> {
        let (reply, reply_rx) = oneshot::channel();
        self.to_actor.send(ToActor::Save { reply }).await?;
        let handle = reply_rx.await?;
        Ok(handle)
    }

    /// Subscribe to engine events.
    pub async fn subscribe(&self) -> Result<impl Stream<Item = Event> + Send + Unpin + 'static> {
        let (sender, receiver) = flume::bounded(SUBSCRIBE_CHANNEL_CAP);
        self.to_actor.send(ToActor::Subscribe { sender }).await?;
        Ok(receiver.into_stream())
    }

    /// Shutdown the engine.
    ///
    /// Aborts uploads that are still running; pending save handles resolve
    /// with [`SaveError::ActorClosed`].
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, reply_rx) = oneshot::channel();
        self.to_actor.send(ToActor::Shutdown { reply }).await?;
        reply_rx.await?;
        Ok(())
    }
}
