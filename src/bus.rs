//! The replication bus boundary.
//!
//! Replicas of one log exchange small broadcast messages: whenever a replica
//! uploads a chunk, it announces the resulting handle to everyone else. The
//! bus is deliberately minimal. [`mem::Bus`] connects replicas within one
//! process; network transports implement the same trait elsewhere.

use std::fmt;
use std::future::Future;
use std::str::FromStr;

use bytes::Bytes;
use futures_lite::Stream;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

pub mod mem;

/// Identifier of one replica on the bus.
///
/// 16 random bytes, generated once per replica. Used to attribute received
/// messages and to avoid delivering a broadcast back to its sender.
#[derive(PartialEq, Eq, PartialOrd, Ord, Copy, Clone, Hash)]
pub struct ReplicaId([u8; 16]);

impl ReplicaId {
    /// Create a new random id.
    pub fn generate() -> Self {
        Self(rand::random())
    }

    /// Create a `ReplicaId` from its raw bytes representation.
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Bytes of the id.
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Convert the id to a hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Convert to a hex string limited to the first 5 bytes for a friendly
    /// string representation of the id.
    pub fn fmt_short(&self) -> String {
        hex::encode(&self.0[..5])
    }
}

impl fmt::Debug for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReplicaId({})", self.to_hex())
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for ReplicaId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 16];
        hex::decode_to_slice(s, &mut bytes).map_err(|_| anyhow::anyhow!("invalid hex"))?;
        Ok(Self(bytes))
    }
}

impl From<[u8; 16]> for ReplicaId {
    fn from(value: [u8; 16]) -> Self {
        Self(value)
    }
}

impl Serialize for ReplicaId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_hex())
        } else {
            self.0.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for ReplicaId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            s.parse().map_err(de::Error::custom)
        } else {
            let bytes = <[u8; 16]>::deserialize(deserializer)?;
            Ok(Self(bytes))
        }
    }
}

/// A message received from the bus.
#[derive(Debug, Clone)]
pub struct BusMessage {
    /// The replica that sent the message.
    pub from: ReplicaId,
    /// The message payload.
    pub content: Bytes,
}

/// A broadcast channel connecting the replicas of one log.
///
/// Delivery is assumed reliable and in order per sender. A broadcast is
/// delivered to every subscribed replica except the sender itself.
pub trait Bus: Clone + Send + Sync + 'static {
    /// Broadcast a message to all other replicas.
    fn broadcast(&self, msg: Bytes) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Subscribe to messages broadcast by other replicas.
    ///
    /// Only messages broadcast after the subscription are delivered, nothing
    /// is replayed.
    fn subscribe(&self) -> impl Stream<Item = BusMessage> + Send + Unpin + 'static;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replica_id_roundtrip() {
        let id = ReplicaId::from_bytes([3; 16]);
        assert_eq!(id.to_string().parse::<ReplicaId>().unwrap(), id);
        let ser = postcard::to_stdvec(&id).unwrap();
        assert_eq!(ser.len(), 16);
        assert_eq!(postcard::from_bytes::<ReplicaId>(&ser).unwrap(), id);
    }
}
