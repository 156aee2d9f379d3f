use std::collections::{HashMap, HashSet, VecDeque};

use anyhow::{Context, Result};
use futures_lite::{stream::Boxed, StreamExt};
use iroh_metrics::inc;
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinSet,
};
use tracing::{debug, error, trace, warn};

use crate::bus::{Bus, BusMessage, ReplicaId};
use crate::edit::Edit;
use crate::log::{encode_chunk, AppliedAssignment, EditLog, InstallError, InstallOutcome};
use crate::metrics::Metrics;
use crate::store::{ChunkHandle, Store, UploadError};

use super::{Config, Event, SaveHandle, UploadOutcome};

/// A chunklog operation broadcast over the bus.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
enum Op {
    /// A chunk was uploaded, reference it by this handle.
    Assign {
        /// First index of the chunk.
        start: u64,
        /// The handle the chunk payload was uploaded under.
        handle: ChunkHandle,
    },
}

/// Messages to the engine actor.
#[derive(derive_more::Debug, strum::Display)]
pub(super) enum ToActor {
    Save {
        #[debug("oneshot::Sender")]
        reply: oneshot::Sender<SaveHandle>,
    },
    Subscribe {
        #[debug("sender")]
        sender: flume::Sender<Event>,
    },
    Shutdown {
        #[debug("oneshot::Sender")]
        reply: oneshot::Sender<()>,
    },
}

/// (batch id, chunk start, upload result) of one finished upload task.
type UploadRes = (u64, u64, Result<ChunkHandle, UploadError>);

/// Bookkeeping for the upload batch begun by one save.
#[derive(derive_more::Debug)]
struct Batch {
    /// Uploads of this batch that have not settled yet.
    remaining: usize,
    outcome: UploadOutcome,
    #[debug("oneshot::Sender")]
    reply: oneshot::Sender<UploadOutcome>,
}

pub(super) struct Actor<S: Store, B: Bus> {
    /// Receiver for actor messages.
    inbox: mpsc::Receiver<ToActor>,
    log: EditLog,
    store: S,
    bus: B,
    config: Config,
    /// Assignments installed inside the log by appends that filled a chunk.
    log_events: flume::Receiver<AppliedAssignment>,
    /// Messages broadcast by other replicas.
    bus_events: Boxed<BusMessage>,
    /// Running upload tasks.
    upload_tasks: JoinSet<UploadRes>,
    /// Chunks with an upload queued or running, by start index.
    pending_chunks: HashSet<u64>,
    /// Uploads waiting for a free slot, in save order.
    upload_queue: VecDeque<(u64, u64)>,
    /// Upload batches that have not settled yet, by batch id.
    batches: HashMap<u64, Batch>,
    /// Id for the next save.
    next_batch_id: u64,
    /// Subscribers to engine events.
    subscribers: Subscribers,
}

impl<S: Store, B: Bus> Actor<S, B> {
    pub fn new(
        log: EditLog,
        store: S,
        bus: B,
        bus_events: Boxed<BusMessage>,
        config: Config,
        inbox: mpsc::Receiver<ToActor>,
    ) -> Self {
        let (log_events_tx, log_events_rx) = flume::unbounded();
        log.subscribe(log_events_tx);
        Self {
            inbox,
            log,
            store,
            bus,
            config,
            log_events: log_events_rx,
            bus_events,
            upload_tasks: Default::default(),
            pending_chunks: Default::default(),
            upload_queue: Default::default(),
            batches: Default::default(),
            next_batch_id: 0,
            subscribers: Default::default(),
        }
    }

    /// Run the actor loop.
    pub async fn run(mut self) -> Result<()> {
        let shutdown_reply = self.run_inner().await;
        if let Err(err) = self.shutdown().await {
            error!(?err, "Error during shutdown");
        }
        drop(self);
        match shutdown_reply {
            Ok(reply) => {
                reply.send(()).ok();
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn run_inner(&mut self) -> Result<oneshot::Sender<()>> {
        let mut i = 0;
        loop {
            i += 1;
            trace!(?i, "tick wait");
            inc!(Metrics, actor_tick_main);
            tokio::select! {
                biased;
                msg = self.inbox.recv() => {
                    let msg = msg.context("to_actor closed")?;
                    trace!(?i, %msg, "tick: to_actor");
                    inc!(Metrics, actor_tick_inbox);
                    match msg {
                        ToActor::Shutdown { reply } => {
                            break Ok(reply);
                        }
                        msg => {
                            self.on_actor_message(msg).await;
                        }
                    }
                }
                event = self.log_events.recv_async() => {
                    trace!(?i, "tick: log_event");
                    inc!(Metrics, actor_tick_log_event);
                    let event = event.context("log events closed")?;
                    self.on_applied_assignment(event).await;
                }
                msg = self.bus_events.next() => {
                    trace!(?i, "tick: bus_event");
                    inc!(Metrics, actor_tick_bus);
                    let msg = msg.context("bus subscription ended")?;
                    self.on_bus_message(msg).await?;
                }
                Some(res) = self.upload_tasks.join_next(), if !self.upload_tasks.is_empty() => {
                    trace!(?i, "tick: upload_done");
                    inc!(Metrics, actor_tick_upload);
                    let (batch_id, start, res) = res.context("upload task panicked")?;
                    self.on_upload_done(batch_id, start, res).await?;
                }
            }
        }
    }

    async fn on_actor_message(&mut self, msg: ToActor) {
        match msg {
            ToActor::Shutdown { .. } => {
                unreachable!("handled in run_inner");
            }
            ToActor::Save { reply } => {
                self.on_save(reply).await;
            }
            ToActor::Subscribe { sender } => {
                self.subscribers.subscribe(sender);
            }
        }
    }

    async fn on_save(&mut self, reply: oneshot::Sender<SaveHandle>) {
        inc!(Metrics, saves);
        let summary = self.log.summary();
        // Chunks that already have an upload queued or running stay with the
        // batch that started them.
        let candidates: Vec<u64> = self
            .log
            .upload_candidates()
            .into_iter()
            .filter(|start| !self.pending_chunks.contains(start))
            .collect();
        let batch_id = self.next_batch_id;
        self.next_batch_id += 1;
        debug!(batch = batch_id, uploads = candidates.len(), "save");
        let (done_tx, done_rx) = oneshot::channel();
        if candidates.is_empty() {
            // nothing to upload, the batch settles right away
            self.subscribers
                .send(Event::ChunksUploaded {
                    uploaded: 0,
                    failed: 0,
                })
                .await;
            done_tx.send(UploadOutcome::default()).ok();
        } else {
            for start in &candidates {
                self.pending_chunks.insert(*start);
                self.upload_queue.push_back((batch_id, *start));
            }
            self.batches.insert(
                batch_id,
                Batch {
                    remaining: candidates.len(),
                    outcome: UploadOutcome::default(),
                    reply: done_tx,
                },
            );
            self.launch_queued().await;
        }
        reply
            .send(SaveHandle {
                summary,
                receiver: done_rx,
            })
            .ok();
    }

    /// Start queued uploads until the concurrency limit is reached.
    async fn launch_queued(&mut self) {
        while self.upload_tasks.len() < self.config.max_concurrent_uploads {
            let Some((batch_id, start)) = self.upload_queue.pop_front() else {
                break;
            };
            match self.log.full_open_edits(start) {
                Some(edits) => {
                    inc!(Metrics, uploads_started);
                    trace!(start, "upload chunk");
                    let store = self.store.clone();
                    self.upload_tasks.spawn(async move {
                        let res = upload_chunk(store, edits).await;
                        (batch_id, start, res)
                    });
                }
                None => {
                    // the chunk got its handle while queued, a peer's upload
                    // won the race
                    trace!(start, "skip upload, chunk already referenced");
                    self.settle_upload(batch_id, start, false).await;
                }
            }
        }
    }

    async fn on_upload_done(
        &mut self,
        batch_id: u64,
        start: u64,
        res: Result<ChunkHandle, UploadError>,
    ) -> Result<()> {
        match res {
            Ok(handle) => {
                inc!(Metrics, uploads_completed);
                match self.log.apply_upload(start, handle) {
                    Ok(InstallOutcome::Installed) => {
                        debug!(start, handle = %handle.fmt_short(), "chunk uploaded");
                        self.broadcast_assignment(start, handle).await?;
                        self.subscribers
                            .send(Event::ChunkUploaded { start, handle })
                            .await;
                        self.settle_upload(batch_id, start, false).await;
                    }
                    Ok(InstallOutcome::AlreadyReferenced) => {
                        // a peer uploaded the identical chunk and its
                        // assignment arrived first
                        trace!(start, "upload done, chunk already referenced");
                        self.settle_upload(batch_id, start, false).await;
                    }
                    Ok(InstallOutcome::Buffered) => {
                        unreachable!("uploads are only applied to full chunks");
                    }
                    Err(InstallError::HandleMismatch {
                        start,
                        existing,
                        incoming,
                    }) => {
                        self.on_handle_mismatch(start, existing, incoming).await;
                        self.settle_upload(batch_id, start, true).await;
                    }
                    Err(err) => {
                        error!(?err, start, "failed to apply our own upload");
                        self.settle_upload(batch_id, start, true).await;
                    }
                }
            }
            Err(err) => {
                inc!(Metrics, uploads_failed);
                // no retry here, the next save picks the chunk up again
                warn!(?err, start, "chunk upload failed, chunk stays open");
                self.settle_upload(batch_id, start, true).await;
            }
        }
        self.launch_queued().await;
        Ok(())
    }

    /// Account one settled upload to its batch.
    async fn settle_upload(&mut self, batch_id: u64, start: u64, failed: bool) {
        self.pending_chunks.remove(&start);
        let Some(batch) = self.batches.get_mut(&batch_id) else {
            warn!(batch = batch_id, start, "settled upload for unknown batch");
            return;
        };
        batch.remaining -= 1;
        if failed {
            batch.outcome.failed += 1;
        } else {
            batch.outcome.uploaded += 1;
        }
        if batch.remaining > 0 {
            return;
        }
        let Some(batch) = self.batches.remove(&batch_id) else {
            return;
        };
        debug!(
            batch = batch_id,
            uploaded = batch.outcome.uploaded,
            failed = batch.outcome.failed,
            "upload batch settled"
        );
        self.subscribers
            .send(Event::ChunksUploaded {
                uploaded: batch.outcome.uploaded,
                failed: batch.outcome.failed,
            })
            .await;
        batch.reply.send(batch.outcome).ok();
    }

    async fn broadcast_assignment(&mut self, start: u64, handle: ChunkHandle) -> Result<()> {
        let op = Op::Assign { start, handle };
        let message = postcard::to_stdvec(&op)?.into();
        self.bus.broadcast(message).await?;
        inc!(Metrics, assignments_sent);
        Ok(())
    }

    async fn on_bus_message(&mut self, msg: BusMessage) -> Result<()> {
        let op: Op = match postcard::from_bytes(&msg.content) {
            Ok(op) => op,
            Err(err) => {
                warn!(from = %msg.from.fmt_short(), ?err, "failed to decode bus message");
                return Ok(());
            }
        };
        match op {
            Op::Assign { start, handle } => {
                inc!(Metrics, assignments_received);
                self.on_assignment(start, handle, msg.from).await;
            }
        }
        Ok(())
    }

    async fn on_assignment(&mut self, start: u64, handle: ChunkHandle, from: ReplicaId) {
        trace!(start, handle = %handle.fmt_short(), from = %from.fmt_short(), "assignment received");
        match self.log.apply_remote(start, handle, from) {
            Ok(InstallOutcome::Installed) => {
                debug!(start, handle = %handle.fmt_short(), from = %from.fmt_short(), "assignment applied");
                self.subscribers
                    .send(Event::RemoteAssignment {
                        start,
                        handle,
                        from,
                    })
                    .await;
            }
            Ok(InstallOutcome::AlreadyReferenced) => {
                // re-delivery, or our own upload of the identical chunk won
                trace!(start, "assignment already applied");
            }
            Ok(InstallOutcome::Buffered) => {
                debug!(start, "assignment buffered until the chunk fills");
            }
            Err(InstallError::HandleMismatch {
                start,
                existing,
                incoming,
            }) => {
                self.on_handle_mismatch(start, existing, incoming).await;
            }
            Err(err) => {
                warn!(?err, from = %from.fmt_short(), "could not apply assignment");
            }
        }
    }

    /// An assignment buffered in the log was installed by the append that
    /// filled its chunk.
    async fn on_applied_assignment(&mut self, event: AppliedAssignment) {
        let AppliedAssignment {
            start,
            handle,
            from,
        } = event;
        debug!(start, handle = %handle.fmt_short(), from = %from.fmt_short(), "buffered assignment applied");
        self.subscribers
            .send(Event::RemoteAssignment {
                start,
                handle,
                from,
            })
            .await;
    }

    async fn on_handle_mismatch(
        &mut self,
        start: u64,
        existing: ChunkHandle,
        incoming: ChunkHandle,
    ) {
        // replicas derived different content for the same chunk, the
        // histories have diverged
        error!(start, existing = %existing.fmt_short(), incoming = %incoming.fmt_short(), "conflicting handles for chunk");
        self.subscribers
            .send(Event::HandleMismatch {
                start,
                existing,
                incoming,
            })
            .await;
    }

    async fn shutdown(&mut self) -> Result<()> {
        // cancel all subscriptions
        self.subscribers.clear();
        // abort uploads that are still running
        self.upload_tasks.shutdown().await;
        Ok(())
    }
}

async fn upload_chunk<S: Store>(store: S, edits: Vec<Edit>) -> Result<ChunkHandle, UploadError> {
    let payload = encode_chunk(&edits).map_err(|err| UploadError::Rejected(err.into()))?;
    store.upload(payload).await
}

#[derive(Debug, Default)]
struct Subscribers(Vec<flume::Sender<Event>>);

impl Subscribers {
    fn subscribe(&mut self, sender: flume::Sender<Event>) {
        self.0.push(sender)
    }

    async fn send(&mut self, event: Event) -> bool {
        trace!(%event, "emit event");
        let futs = self.0.iter().map(|sender| sender.send_async(event.clone()));
        let res = futures_buffered::join_all(futs).await;
        // reverse the order so removing does not shift remaining indices
        for (i, res) in res.into_iter().enumerate().rev() {
            if res.is_err() {
                self.0.remove(i);
            }
        }
        !self.0.is_empty()
    }

    fn clear(&mut self) {
        self.0.clear();
    }
}
