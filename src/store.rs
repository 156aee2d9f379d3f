//! The chunk store boundary.
//!
//! Full chunks are uploaded to an external content-addressed store. The store
//! hands back a [`ChunkHandle`] under which the payload can be fetched again.
//! This crate only defines the client trait; [`mem::Store`] is the in-process
//! reference implementation.

use std::fmt;
use std::future::Future;
use std::str::FromStr;

use bytes::Bytes;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

pub mod mem;

/// Opaque reference to an uploaded chunk payload.
///
/// A handle identifies exactly one immutable payload. Handles are compared
/// for equality only; the byte-wise ordering exists for use in sorted
/// containers. Stores that address content by hash return equal handles for
/// equal payloads, which is what lets two replicas that uploaded the same
/// chunk converge on one reference.
#[derive(PartialEq, Eq, PartialOrd, Ord, Copy, Clone, Hash)]
pub struct ChunkHandle([u8; 32]);

impl ChunkHandle {
    /// Create a `ChunkHandle` from its raw bytes representation.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Bytes of the handle.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert the handle to a hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Convert to a hex string limited to the first 5 bytes for a friendly
    /// string representation of the handle.
    pub fn fmt_short(&self) -> String {
        hex::encode(&self.0[..5])
    }
}

impl fmt::Debug for ChunkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkHandle({self})")
    }
}

impl fmt::Display for ChunkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // result will be 52 bytes
        let mut res = [b'b'; 52];
        data_encoding::BASE32_NOPAD.encode_mut(&self.0, &mut res);
        // convert to string, this is guaranteed to succeed
        let t = std::str::from_utf8_mut(res.as_mut()).unwrap();
        // hack since data_encoding doesn't have BASE32LOWER_NOPAD as a const
        t.make_ascii_lowercase();
        f.write_str(t)
    }
}

impl FromStr for ChunkHandle {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let sb = s.as_bytes();
        if sb.len() == 64 {
            // this is most likely a hex encoded handle
            let mut bytes = [0u8; 32];
            if hex::decode_to_slice(sb, &mut bytes).is_ok() {
                return Ok(Self(bytes));
            }
        }
        anyhow::ensure!(sb.len() == 52, "invalid base32 length");
        // this is a base32 encoded handle, we can decode it directly
        let mut t = [0u8; 52];
        t.copy_from_slice(sb);
        std::str::from_utf8_mut(t.as_mut())
            .unwrap()
            .make_ascii_uppercase();
        let mut res = [0u8; 32];
        data_encoding::BASE32_NOPAD
            .decode_mut(&t, &mut res)
            .map_err(|_e| anyhow::anyhow!("invalid base32"))?;
        Ok(Self(res))
    }
}

impl From<[u8; 32]> for ChunkHandle {
    fn from(value: [u8; 32]) -> Self {
        Self(value)
    }
}

impl From<ChunkHandle> for [u8; 32] {
    fn from(value: ChunkHandle) -> Self {
        value.0
    }
}

impl Serialize for ChunkHandle {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(self.to_string().as_str())
        } else {
            self.0.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for ChunkHandle {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            s.parse().map_err(de::Error::custom)
        } else {
            let bytes = <[u8; 32]>::deserialize(deserializer)?;
            Ok(Self(bytes))
        }
    }
}

/// A client for a content-addressed chunk store.
///
/// Implementations are cheaply cloneable handles that can be used from many
/// tasks concurrently. Both operations may take arbitrarily long; everything
/// else in this crate stays synchronous around them.
pub trait Store: Clone + Send + Sync + 'static {
    /// Upload a chunk payload.
    ///
    /// On success the payload is durably stored and can be fetched under the
    /// returned handle. On failure nothing is assumed about the store state;
    /// the same payload can be uploaded again later.
    fn upload(&self, payload: Bytes) -> impl Future<Output = Result<ChunkHandle, UploadError>> + Send;

    /// Fetch the payload previously stored under the given handle.
    fn fetch(&self, handle: &ChunkHandle) -> impl Future<Output = Result<Bytes, FetchError>> + Send;
}

/// Errors when uploading a chunk payload.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    /// The store could not be reached.
    #[error("store unavailable")]
    Unavailable(#[source] anyhow::Error),
    /// The store refused to accept the payload.
    #[error("store rejected the payload")]
    Rejected(#[source] anyhow::Error),
}

/// Errors when fetching a chunk payload.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// No payload is stored under the given handle.
    #[error("no payload stored for handle {}", .0.fmt_short())]
    HandleNotFound(ChunkHandle),
    /// The store could not be reached.
    #[error("store unavailable")]
    Unavailable(#[source] anyhow::Error),
}
