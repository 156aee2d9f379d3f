//! An in-memory bus for replicas living in the same process.
//!
//! Mostly useful for testing. All replicas join a [`Hub`], and each
//! broadcast is fanned out to every other endpoint. Messages from one
//! sender arrive in the order they were broadcast.

use std::sync::Arc;

use bytes::Bytes;
use futures_lite::Stream;
use parking_lot::Mutex;

use super::{BusMessage, ReplicaId};

/// A hub connecting in-process bus endpoints.
///
/// Cheap to clone, all clones refer to the same hub.
#[derive(Debug, Clone, Default)]
pub struct Hub {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    subscribers: Vec<Subscriber>,
}

#[derive(Debug)]
struct Subscriber {
    owner: ReplicaId,
    sender: flume::Sender<BusMessage>,
}

impl Hub {
    /// Create a new, empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the hub as replica `me`.
    pub fn join(&self, me: ReplicaId) -> Bus {
        Bus {
            hub: self.clone(),
            me,
        }
    }
}

/// An endpoint of an in-memory [`Hub`].
#[derive(Debug, Clone)]
pub struct Bus {
    hub: Hub,
    me: ReplicaId,
}

impl super::Bus for Bus {
    async fn broadcast(&self, msg: Bytes) -> anyhow::Result<()> {
        let mut inner = self.hub.inner.lock();
        // Fan out under the lock so messages from one sender keep their
        // order. Subscribers whose receiver is gone are dropped.
        inner.subscribers.retain(|sub| {
            if sub.owner == self.me {
                return true;
            }
            sub.sender
                .try_send(BusMessage {
                    from: self.me,
                    content: msg.clone(),
                })
                .is_ok()
        });
        Ok(())
    }

    fn subscribe(&self) -> impl Stream<Item = BusMessage> + Send + Unpin + 'static {
        let (sender, receiver) = flume::unbounded();
        self.hub.inner.lock().subscribers.push(Subscriber {
            owner: self.me,
            sender,
        });
        receiver.into_stream()
    }
}
