use crate::grpc::{ProtoClusterConfig, ProtoClusterMember};
use crate::replica::peer_client::{ConnectError, RaftClient};
use crate::replica::Index;
use bytes::Bytes;
use prost::Message;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Duration;

/// ReplicaId...or maybe it should be NodeId or ServerId. It's the node name.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub(crate) struct ReplicaId(String);

impl ReplicaId {
    pub(crate) fn new(id: impl Into<String>) -> Self {
        ReplicaId(id.into())
    }

    pub(crate) fn as_str(&self) -> &str {
        &self.0
    }

    pub(crate) fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// ClusterConfig is the set of voters, each with the address raft RPCs are sent to.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct ClusterConfig {
    voters: BTreeMap<ReplicaId, String>,
}

impl ClusterConfig {
    pub(crate) fn single(id: ReplicaId, addr: String) -> Self {
        let mut voters = BTreeMap::new();
        voters.insert(id, addr);
        ClusterConfig { voters }
    }

    pub(crate) fn contains(&self, id: &ReplicaId) -> bool {
        self.voters.contains_key(id)
    }

    pub(crate) fn addr(&self, id: &ReplicaId) -> Option<&str> {
        self.voters.get(id).map(|a| a.as_str())
    }

    pub(crate) fn len(&self) -> usize {
        self.voters.len()
    }

    pub(crate) fn voters(&self) -> impl Iterator<Item = (&ReplicaId, &String)> {
        self.voters.iter()
    }

    pub(crate) fn with_voter(&self, id: ReplicaId, addr: String) -> Self {
        let mut voters = self.voters.clone();
        voters.insert(id, addr);
        ClusterConfig { voters }
    }

    pub(crate) fn without_voter(&self, id: &ReplicaId) -> Self {
        let mut voters = self.voters.clone();
        voters.remove(id);
        ClusterConfig { voters }
    }

    pub(crate) fn encode(&self) -> Bytes {
        let proto = ProtoClusterConfig::from(self);
        let mut buf = Vec::with_capacity(proto.encoded_len());
        // Encoding into a Vec only fails when capacity is exhausted, which Vec grows past.
        let _ = proto.encode(&mut buf);
        Bytes::from(buf)
    }

    pub(crate) fn decode(data: &[u8]) -> Result<Self, prost::DecodeError> {
        ProtoClusterConfig::decode(data).map(ClusterConfig::from)
    }
}

impl From<&ClusterConfig> for ProtoClusterConfig {
    fn from(config: &ClusterConfig) -> Self {
        ProtoClusterConfig {
            voters: config
                .voters
                .iter()
                .map(|(id, addr)| ProtoClusterMember {
                    replica_id: id.as_str().to_string(),
                    addr: addr.clone(),
                })
                .collect(),
        }
    }
}

impl From<ProtoClusterConfig> for ClusterConfig {
    fn from(proto: ProtoClusterConfig) -> Self {
        ClusterConfig {
            voters: proto
                .voters
                .into_iter()
                .map(|m| (ReplicaId::new(m.replica_id), m.addr))
                .collect(),
        }
    }
}

/// Peer is another voter. The RPC client connects lazily on first use and is shared by every
/// request task for the peer.
#[derive(Clone)]
pub(crate) struct Peer {
    pub(crate) replica_id: ReplicaId,
    pub(crate) addr: String,
    client: Arc<Mutex<Option<RaftClient>>>,
}

impl Peer {
    fn new(replica_id: ReplicaId, addr: String) -> Self {
        Peer {
            replica_id,
            addr,
            client: Arc::new(Mutex::new(None)),
        }
    }

    pub(crate) async fn client(&self, connect_timeout: Duration) -> Result<RaftClient, ConnectError> {
        let mut guard = self.client.lock().await;
        if let Some(client) = guard.as_ref() {
            return Ok(client.clone());
        }

        let client = RaftClient::connect(self.addr.clone(), connect_timeout).await?;
        guard.replace(client.clone());
        Ok(client)
    }
}

/// ClusterTracker knows the cluster configuration history and the peers of the latest one.
///
/// > a server always uses the latest configuration in its log, regardless of whether the entry
/// > is committed
///
/// Uncommitted configurations are kept in order so a log truncation can fall back to an older
/// one.
pub(crate) struct ClusterTracker {
    my_replica_id: ReplicaId,
    committed_index: Option<Index>,
    committed: ClusterConfig,
    uncommitted: Vec<(Index, ClusterConfig)>,
    peers: HashMap<ReplicaId, Peer>,
}

impl ClusterTracker {
    pub(crate) fn new(my_replica_id: ReplicaId, index: Option<Index>, config: ClusterConfig) -> Self {
        let mut tracker = ClusterTracker {
            my_replica_id,
            committed_index: index,
            committed: config,
            uncommitted: Vec::new(),
            peers: HashMap::new(),
        };
        tracker.refresh_peers();
        tracker
    }

    pub(crate) fn my_replica_id(&self) -> &ReplicaId {
        &self.my_replica_id
    }

    pub(crate) fn latest_config(&self) -> &ClusterConfig {
        self.uncommitted.last().map(|(_, c)| c).unwrap_or(&self.committed)
    }

    pub(crate) fn committed_config(&self) -> &ClusterConfig {
        &self.committed
    }

    pub(crate) fn has_uncommitted_config(&self) -> bool {
        !self.uncommitted.is_empty()
    }

    pub(crate) fn am_voter(&self) -> bool {
        self.latest_config().contains(&self.my_replica_id)
    }

    pub(crate) fn num_voting_replicas(&self) -> usize {
        self.latest_config().len()
    }

    pub(crate) fn addr_of(&self, id: &ReplicaId) -> Option<String> {
        self.latest_config()
            .addr(id)
            .or_else(|| self.committed.addr(id))
            .map(|a| a.to_string())
    }

    /// A configuration entry takes effect as soon as it is appended to the log.
    pub(crate) fn set_latest(&mut self, index: Index, config: ClusterConfig) {
        self.uncommitted.push((index, config));
        self.refresh_peers();
    }

    pub(crate) fn commit_through(&mut self, commit_index: Index) {
        while let Some((index, _)) = self.uncommitted.first() {
            if *index > commit_index {
                break;
            }
            let (index, config) = self.uncommitted.remove(0);
            self.committed_index = Some(index);
            self.committed = config;
        }
    }

    /// Forget configurations at `index` and later. Used when the log suffix is truncated.
    pub(crate) fn truncate_from(&mut self, index: Index) {
        let before = self.uncommitted.len();
        self.uncommitted.retain(|(i, _)| *i < index);
        if self.uncommitted.len() != before {
            self.refresh_peers();
        }
    }

    /// Replace all history, e.g. after installing a snapshot.
    pub(crate) fn reset(&mut self, index: Option<Index>, config: ClusterConfig) {
        self.committed_index = index;
        self.committed = config;
        self.uncommitted.clear();
        self.refresh_peers();
    }

    pub(crate) fn peer(&self, peer_id: &ReplicaId) -> Option<&Peer> {
        self.peers.get(peer_id)
    }

    pub(crate) fn peer_ids(&self) -> HashSet<ReplicaId> {
        self.peers.keys().cloned().collect()
    }

    pub(crate) fn iter_peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    fn refresh_peers(&mut self) {
        let latest = self.latest_config().clone();

        self.peers
            .retain(|id, peer| latest.addr(id).map(|addr| addr == peer.addr).unwrap_or(false));
        for (id, addr) in latest.voters() {
            if id == &self.my_replica_id || self.peers.contains_key(id) {
                continue;
            }
            self.peers.insert(id.clone(), Peer::new(id.clone(), addr.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> ReplicaId {
        ReplicaId::new(s)
    }

    fn index(i: u64) -> Index {
        Index::new(i).unwrap()
    }

    #[test]
    fn config_round_trips_through_proto() {
        let config = ClusterConfig::single(id("a"), "127.0.0.1:1".into()).with_voter(id("b"), "127.0.0.1:2".into());
        let decoded = ClusterConfig::decode(&config.encode()).unwrap();
        assert_eq!(decoded, config);
    }

    #[tokio::test]
    async fn latest_config_wins_and_truncation_reverts() {
        let base = ClusterConfig::single(id("a"), "addr-a".into());
        let mut tracker = ClusterTracker::new(id("a"), Some(index(1)), base.clone());
        assert!(tracker.am_voter());
        assert!(tracker.peer_ids().is_empty());

        let two = base.with_voter(id("b"), "addr-b".into());
        tracker.set_latest(index(5), two.clone());
        assert!(tracker.has_uncommitted_config());
        assert_eq!(tracker.latest_config(), &two);
        assert_eq!(tracker.committed_config(), &base);
        assert!(tracker.peer(&id("b")).is_some());

        tracker.truncate_from(index(5));
        assert_eq!(tracker.latest_config(), &base);
        assert!(tracker.peer(&id("b")).is_none());

        tracker.set_latest(index(6), two.clone());
        tracker.commit_through(index(6));
        assert!(!tracker.has_uncommitted_config());
        assert_eq!(tracker.committed_config(), &two);
    }

    #[tokio::test]
    async fn removed_leader_is_not_a_voter() {
        let config = ClusterConfig::single(id("a"), "addr-a".into()).with_voter(id("b"), "addr-b".into());
        let mut tracker = ClusterTracker::new(id("a"), None, config.clone());

        tracker.set_latest(index(3), config.without_voter(&id("a")));
        assert!(!tracker.am_voter());
        assert_eq!(tracker.num_voting_replicas(), 1);
        assert_eq!(tracker.addr_of(&id("a")), Some("addr-a".to_string()));
    }
}
