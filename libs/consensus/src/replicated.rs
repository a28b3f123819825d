//! Replicated key/value map
//!
//! Writes go through the log and are applied on every member; reads are
//! served from the local copy.

use crate::apply::StateMachine;
use crate::config::RaftConfig;
use crate::node::RaftNode;
use crate::transport::{Inbox, Transport};
use crate::types::NodeId;
use crate::Result;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// A write to the replicated map, as stored in the log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MapCommand<K, V> {
    Put { key: K, value: V },
    Remove { key: K },
}

/// Bounds for keys and values of a [`ReplicatedStateMachine`]
pub trait MapItem: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> MapItem for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

struct MapStateMachine<K, V> {
    map: Arc<RwLock<HashMap<K, V>>>,
}

impl<K, V> StateMachine for MapStateMachine<K, V>
where
    K: MapItem + Hash + Eq,
    V: MapItem,
{
    /// Output is the bincode-encoded previous value
    fn apply(&mut self, command: &[u8]) -> Vec<u8> {
        let previous = match bincode::deserialize::<MapCommand<K, V>>(command) {
            Ok(MapCommand::Put { key, value }) => self.map.write().insert(key, value),
            Ok(MapCommand::Remove { key }) => self.map.write().remove(&key),
            Err(e) => {
                warn!(error = %e, "Skipping undecodable map command");
                None
            }
        };
        bincode::serialize(&previous).unwrap_or_default()
    }

    fn snapshot(&self) -> Vec<u8> {
        let map = self.map.read();
        let entries: Vec<(&K, &V)> = map.iter().collect();
        match bincode::serialize(&entries) {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, "Failed to serialize map snapshot");
                Vec::new()
            }
        }
    }

    fn restore(&mut self, snapshot: &[u8]) {
        match bincode::deserialize::<Vec<(K, V)>>(snapshot) {
            Ok(entries) => *self.map.write() = entries.into_iter().collect(),
            Err(e) => warn!(error = %e, "Ignoring undecodable map snapshot"),
        }
    }
}

/// A map kept identical on every member of the cluster
pub struct ReplicatedStateMachine<K, V> {
    node: RaftNode,
    map: Arc<RwLock<HashMap<K, V>>>,
    timeout: RwLock<Duration>,
}

impl<K, V> ReplicatedStateMachine<K, V>
where
    K: MapItem + Hash + Eq,
    V: MapItem,
{
    /// Start a member holding a replica of the map
    pub fn start(config: RaftConfig, transport: Arc<dyn Transport>, inbox: Inbox) -> Result<Self> {
        let map = Arc::new(RwLock::new(HashMap::new()));
        let timeout = config.request_timeout;
        let node = RaftNode::new(
            config,
            transport,
            inbox,
            MapStateMachine {
                map: Arc::clone(&map),
            },
        )?;

        Ok(Self {
            node,
            map,
            timeout: RwLock::new(timeout),
        })
    }

    /// Store `value` under `key` on every member
    ///
    /// Returns the previous value once the write was applied locally on the
    /// leader. Fails with `Timeout` if that did not happen within
    /// [`timeout`](Self::timeout); the write may still take effect later.
    pub async fn put(&self, key: K, value: V) -> Result<Option<V>> {
        self.submit(MapCommand::Put { key, value }).await
    }

    pub async fn remove(&self, key: K) -> Result<Option<V>> {
        self.submit(MapCommand::Remove { key }).await
    }

    async fn submit(&self, command: MapCommand<K, V>) -> Result<Option<V>> {
        let command = Bytes::from(bincode::serialize(&command)?);
        let output = self.node.propose_timeout(command, self.timeout()).await?;
        Ok(bincode::deserialize(&output)?)
    }

    /// Read from the local replica
    pub fn get(&self, key: &K) -> Option<V> {
        self.map.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    pub fn timeout(&self) -> Duration {
        *self.timeout.read()
    }

    pub fn set_timeout(&self, timeout: Duration) {
        *self.timeout.write() = timeout;
    }

    pub fn is_leader(&self) -> bool {
        self.node.is_leader()
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.node.leader()
    }

    pub fn node(&self) -> &RaftNode {
        &self.node
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalNetwork;
    use crate::RaftError;

    fn map_sm() -> MapStateMachine<String, u32> {
        MapStateMachine {
            map: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn encode(command: &MapCommand<String, u32>) -> Vec<u8> {
        bincode::serialize(command).unwrap()
    }

    fn previous(output: &[u8]) -> Option<u32> {
        bincode::deserialize(output).unwrap()
    }

    #[test]
    fn test_map_state_machine() {
        let mut sm = map_sm();

        let out = sm.apply(&encode(&MapCommand::Put {
            key: "a".to_string(),
            value: 1,
        }));
        assert_eq!(previous(&out), None);

        let out = sm.apply(&encode(&MapCommand::Put {
            key: "a".to_string(),
            value: 2,
        }));
        assert_eq!(previous(&out), Some(1));

        let out = sm.apply(&encode(&MapCommand::Remove {
            key: "a".to_string(),
        }));
        assert_eq!(previous(&out), Some(2));
        assert!(sm.map.read().is_empty());

        // Garbage leaves the map untouched
        let out = sm.apply(&[0xff, 0x01]);
        assert_eq!(previous(&out), None);
    }

    #[test]
    fn test_map_snapshot_restore() {
        let mut sm = map_sm();
        for (i, key) in ["x", "y", "z"].iter().enumerate() {
            sm.apply(&encode(&MapCommand::Put {
                key: key.to_string(),
                value: i as u32,
            }));
        }

        let snapshot = sm.snapshot();
        let mut restored = map_sm();
        restored.restore(&snapshot);
        assert_eq!(*restored.map.read(), *sm.map.read());
    }

    #[tokio::test]
    async fn test_single_member_map() {
        let network = LocalNetwork::new();
        let (transport, inbox) = network.join("A");
        let config = RaftConfig::builder()
            .members(["A"])
            .raft_id("A")
            .election_interval(Duration::from_millis(50), Duration::from_millis(100))
            .heartbeat_interval(Duration::from_millis(10))
            .build()
            .unwrap();
        let map = ReplicatedStateMachine::<String, String>::start(config, transport, inbox).unwrap();
        map.set_timeout(Duration::from_secs(2));
        assert_eq!(map.timeout(), Duration::from_secs(2));

        for _ in 0..100 {
            if map.is_leader() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(map.is_leader());
        assert_eq!(map.leader(), Some(NodeId::from("A")));

        assert_eq!(map.put("k".to_string(), "v1".to_string()).await.unwrap(), None);
        assert_eq!(
            map.put("k".to_string(), "v2".to_string()).await.unwrap(),
            Some("v1".to_string())
        );
        assert_eq!(map.get(&"k".to_string()), Some("v2".to_string()));
        assert_eq!(
            map.remove("k".to_string()).await.unwrap(),
            Some("v2".to_string())
        );
        assert!(map.is_empty());

        map.node().shutdown().await;
        assert!(matches!(
            map.put("k".to_string(), "v3".to_string()).await,
            Err(RaftError::ShuttingDown)
        ));
    }
}
