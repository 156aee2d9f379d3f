//! Virtualized history for a replicated append-only edit log
//!
//! Edits accumulate in fixed-size chunks. Full chunks are uploaded to a
//! content-addressed [`store::Store`] on save and replaced by an opaque
//! handle; the handles are exchanged with other replicas over a
//! [`bus::Bus`], so each chunk is uploaded once no matter how many replicas
//! hold the log. Reading inside an offloaded chunk fetches its payload back
//! on demand.
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod bus;
pub mod edit;
pub mod engine;
pub mod log;
pub mod metrics;
pub mod store;
pub mod summary;

pub use crate::bus::ReplicaId;
pub use crate::edit::{Edit, EditId};
pub use crate::engine::{Config, Engine, Event, SaveError, SaveHandle, UploadOutcome};
pub use crate::log::{EditLog, DEFAULT_CHUNK_SIZE};
pub use crate::store::ChunkHandle;
pub use crate::summary::Summary;
