//! Group-communication transport seen by the consensus layer
//!
//! The node only needs to address a member, broadcast to the current view and
//! receive what others sent. [`LocalNetwork`] provides this in-process, with
//! link failures that can be injected at runtime.

use crate::types::NodeId;
use crate::{RaftError, Result};
use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use tracing::trace;

/// A payload delivered to this member
#[derive(Debug, Clone)]
pub struct Envelope {
    pub from: NodeId,
    pub payload: Bytes,
}

/// Receiving side of a member's transport
pub type Inbox = async_channel::Receiver<Envelope>;

/// Member-addressed message delivery
///
/// Delivery is FIFO per sender. Messages may be lost; the protocol retries.
pub trait Transport: Send + Sync + 'static {
    fn local_id(&self) -> &NodeId;

    /// Members currently reachable through this transport, self included
    fn view(&self) -> Vec<NodeId>;

    fn send(&self, to: &NodeId, payload: Bytes) -> Result<()>;

    /// Send to every member of the view except self
    fn broadcast(&self, payload: Bytes) -> Result<()> {
        let local = self.local_id().clone();
        for member in self.view().into_iter().filter(|m| *m != local) {
            if let Err(e) = self.send(&member, payload.clone()) {
                trace!(from = %local, to = %member, error = %e, "Broadcast send failed");
            }
        }
        Ok(())
    }
}

struct NetworkInner {
    members: DashMap<NodeId, async_channel::Sender<Envelope>>,
    isolated: DashSet<NodeId>,
    /// Directed links that drop everything
    blocked: DashSet<(NodeId, NodeId)>,
}

/// In-process network connecting any number of members
#[derive(Clone)]
pub struct LocalNetwork {
    inner: Arc<NetworkInner>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                members: DashMap::new(),
                isolated: DashSet::new(),
                blocked: DashSet::new(),
            }),
        }
    }

    /// Add a member to the view, replacing an earlier incarnation
    pub fn join(&self, id: impl Into<NodeId>) -> (Arc<LocalTransport>, Inbox) {
        let id = id.into();
        let (tx, rx) = async_channel::unbounded();
        self.inner.members.insert(id.clone(), tx);

        let transport = Arc::new(LocalTransport {
            id,
            network: self.clone(),
        });
        (transport, rx)
    }

    /// Remove a member from the view; its inbox is closed
    pub fn leave(&self, id: &NodeId) {
        if let Some((_, tx)) = self.inner.members.remove(id) {
            tx.close();
        }
    }

    /// Drop all traffic to and from `id`
    pub fn isolate(&self, id: &NodeId) {
        self.inner.isolated.insert(id.clone());
    }

    /// Drop all traffic between the two sides
    pub fn partition(&self, left: &[NodeId], right: &[NodeId]) {
        for a in left {
            for b in right {
                self.inner.blocked.insert((a.clone(), b.clone()));
                self.inner.blocked.insert((b.clone(), a.clone()));
            }
        }
    }

    /// Restore every link
    pub fn heal(&self) {
        self.inner.isolated.clear();
        self.inner.blocked.clear();
    }

    pub fn view(&self) -> Vec<NodeId> {
        let mut view: Vec<NodeId> = self.inner.members.iter().map(|m| m.key().clone()).collect();
        view.sort();
        view
    }

    fn is_blocked(&self, from: &NodeId, to: &NodeId) -> bool {
        self.inner.isolated.contains(from)
            || self.inner.isolated.contains(to)
            || self.inner.blocked.contains(&(from.clone(), to.clone()))
    }

    fn deliver(&self, from: &NodeId, to: &NodeId, payload: Bytes) -> Result<()> {
        let tx = self
            .inner
            .members
            .get(to)
            .map(|m| m.value().clone())
            .ok_or_else(|| RaftError::Rpc(format!("{} is not in the view", to)))?;

        if self.is_blocked(from, to) {
            trace!(%from, %to, "Dropping message on blocked link");
            return Ok(());
        }

        tx.try_send(Envelope {
            from: from.clone(),
            payload,
        })
        .map_err(|e| RaftError::Rpc(format!("delivery to {} failed: {}", to, e)))
    }
}

impl Default for LocalNetwork {
    fn default() -> Self {
        Self::new()
    }
}

/// One member's endpoint on a [`LocalNetwork`]
pub struct LocalTransport {
    id: NodeId,
    network: LocalNetwork,
}

impl Transport for LocalTransport {
    fn local_id(&self) -> &NodeId {
        &self.id
    }

    fn view(&self) -> Vec<NodeId> {
        self.network.view()
    }

    fn send(&self, to: &NodeId, payload: Bytes) -> Result<()> {
        self.network.deliver(&self.id, to, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_and_broadcast() {
        let network = LocalNetwork::new();
        let (a, _a_inbox) = network.join("A");
        let (_b, b_inbox) = network.join("B");
        let (_c, c_inbox) = network.join("C");

        assert_eq!(
            a.view(),
            vec![NodeId::from("A"), NodeId::from("B"), NodeId::from("C")]
        );

        a.send(&NodeId::from("B"), Bytes::from_static(b"direct")).unwrap();
        a.broadcast(Bytes::from_static(b"all")).unwrap();

        let first = b_inbox.recv().await.unwrap();
        assert_eq!(first.from, NodeId::from("A"));
        assert_eq!(&first.payload[..], b"direct");
        assert_eq!(&b_inbox.recv().await.unwrap().payload[..], b"all");
        assert_eq!(&c_inbox.recv().await.unwrap().payload[..], b"all");
        assert!(c_inbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_isolation_and_partition() {
        let network = LocalNetwork::new();
        let (a, _a_inbox) = network.join("A");
        let (_b, b_inbox) = network.join("B");
        let (c, c_inbox) = network.join("C");

        network.isolate(&NodeId::from("A"));
        a.broadcast(Bytes::from_static(b"lost")).unwrap();
        assert!(b_inbox.try_recv().is_err());

        network.heal();
        network.partition(&[NodeId::from("C")], &[NodeId::from("A"), NodeId::from("B")]);
        c.send(&NodeId::from("B"), Bytes::from_static(b"lost")).unwrap();
        a.send(&NodeId::from("C"), Bytes::from_static(b"lost")).unwrap();
        assert!(b_inbox.try_recv().is_err());
        assert!(c_inbox.try_recv().is_err());

        network.heal();
        a.send(&NodeId::from("C"), Bytes::from_static(b"ok")).unwrap();
        assert_eq!(&c_inbox.recv().await.unwrap().payload[..], b"ok");
    }

    #[tokio::test]
    async fn test_leave_closes_inbox() {
        let network = LocalNetwork::new();
        let (a, _a_inbox) = network.join("A");
        let (_b, b_inbox) = network.join("B");

        network.leave(&NodeId::from("B"));
        assert!(b_inbox.recv().await.is_err());
        assert!(a.send(&NodeId::from("B"), Bytes::new()).is_err());
        assert_eq!(network.view(), vec![NodeId::from("A")]);
    }
}
