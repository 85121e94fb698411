use crate::gossip::{gossip_member, GossipMember};
use std::collections::HashMap;
use std::convert::TryFrom;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Tag carrying the address of a member's RPC listener.
pub const RPC_ADDR_TAG: &str = "rpc_addr";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemberStatus {
    Alive,
    Left,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Member {
    pub name: String,
    /// Gossip address.
    pub addr: SocketAddr,
    pub tags: HashMap<String, String>,
    /// Start generation. A restarted member gossips with a newer one.
    pub incarnation: u64,
    pub heartbeat: u64,
    pub status: MemberStatus,
}

impl Member {
    pub fn rpc_addr(&self) -> Option<&str> {
        self.tags.get(RPC_ADDR_TAG).map(String::as_str)
    }

    fn version(&self) -> (u64, u64) {
        (self.incarnation, self.heartbeat)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MembershipEvent {
    MemberJoined(Member),
    MemberLeft(Member),
    MemberFailed(Member),
}

impl MembershipEvent {
    pub fn member(&self) -> &Member {
        match self {
            MembershipEvent::MemberJoined(member)
            | MembershipEvent::MemberLeft(member)
            | MembershipEvent::MemberFailed(member) => member,
        }
    }
}

impl From<&Member> for GossipMember {
    fn from(member: &Member) -> Self {
        let status = match member.status {
            MemberStatus::Alive => gossip_member::Status::Alive,
            MemberStatus::Left => gossip_member::Status::Left,
            MemberStatus::Failed => gossip_member::Status::Failed,
        };

        GossipMember {
            name: member.name.clone(),
            addr: member.addr.to_string(),
            tags: member.tags.clone(),
            incarnation: member.incarnation,
            heartbeat: member.heartbeat,
            status: status as i32,
        }
    }
}

impl TryFrom<GossipMember> for Member {
    type Error = &'static str;

    fn try_from(proto: GossipMember) -> Result<Self, Self::Error> {
        let status = match gossip_member::Status::from_i32(proto.status) {
            Some(gossip_member::Status::Alive) => MemberStatus::Alive,
            Some(gossip_member::Status::Left) => MemberStatus::Left,
            Some(gossip_member::Status::Failed) => MemberStatus::Failed,
            None => return Err("Unknown member status"),
        };
        if proto.name.is_empty() {
            return Err("Member name is empty");
        }
        let addr = proto.addr.parse().map_err(|_| "Member address is not a socket address")?;

        Ok(Member {
            name: proto.name,
            addr,
            tags: proto.tags,
            incarnation: proto.incarnation,
            heartbeat: proto.heartbeat,
            status,
        })
    }
}

struct Entry {
    member: Member,
    // Local time the member's heartbeat last moved forward, or it was marked left.
    last_progress: Instant,
}

/// MemberTable is one node's view of the cluster, ourselves included.
///
/// Merge rules: a newer `(incarnation, heartbeat)` wins. Within an incarnation `Left` is final.
/// Failure is judged locally: an alive member whose heartbeat hasn't moved for the suspect timeout
/// is marked failed, and it's revived if its heartbeat moves again. Left and failed members are
/// forgotten once nothing has been heard from them for the tombstone retention.
pub(crate) struct MemberTable {
    local_name: String,
    entries: HashMap<String, Entry>,
}

impl MemberTable {
    pub(crate) fn new(local: Member, now: Instant) -> Self {
        let local_name = local.name.clone();
        let mut entries = HashMap::new();
        entries.insert(
            local_name.clone(),
            Entry {
                member: local,
                last_progress: now,
            },
        );

        MemberTable { local_name, entries }
    }

    pub(crate) fn local_name(&self) -> &str {
        &self.local_name
    }

    pub(crate) fn bump_local_heartbeat(&mut self, now: Instant) {
        if let Some(entry) = self.entries.get_mut(&self.local_name) {
            entry.member.heartbeat += 1;
            entry.last_progress = now;
        }
    }

    pub(crate) fn mark_local_left(&mut self) {
        if let Some(entry) = self.entries.get_mut(&self.local_name) {
            entry.member.status = MemberStatus::Left;
            entry.member.heartbeat += 1;
        }
    }

    pub(crate) fn members(&self) -> Vec<Member> {
        self.entries.values().map(|entry| entry.member.clone()).collect()
    }

    /// Gossip addresses of every other alive member.
    pub(crate) fn alive_peer_addrs(&self) -> Vec<SocketAddr> {
        self.entries
            .values()
            .filter(|entry| entry.member.name != self.local_name && entry.member.status == MemberStatus::Alive)
            .map(|entry| entry.member.addr)
            .collect()
    }

    pub(crate) fn merge(&mut self, remote: Member, now: Instant) -> Option<MembershipEvent> {
        if remote.name == self.local_name {
            return None;
        }

        let entry = match self.entries.get_mut(&remote.name) {
            Some(entry) => entry,
            None => {
                let event = match remote.status {
                    MemberStatus::Alive => Some(MembershipEvent::MemberJoined(remote.clone())),
                    // Old news about someone we never saw. Remember it so stale gossip can't
                    // resurrect them.
                    MemberStatus::Left | MemberStatus::Failed => None,
                };
                self.entries.insert(
                    remote.name.clone(),
                    Entry {
                        member: remote,
                        last_progress: now,
                    },
                );
                return event;
            }
        };

        if remote.version() <= entry.member.version() {
            return None;
        }

        let previous = entry.member.status;
        if remote.incarnation > entry.member.incarnation {
            // Restarted member. Take its state wholesale.
            let status = remote.status;
            entry.member = remote;
            entry.last_progress = now;
            return match (previous, status) {
                (MemberStatus::Alive, MemberStatus::Left) => Some(MembershipEvent::MemberLeft(entry.member.clone())),
                (MemberStatus::Left, MemberStatus::Alive) | (MemberStatus::Failed, MemberStatus::Alive) => {
                    Some(MembershipEvent::MemberJoined(entry.member.clone()))
                }
                _ => None,
            };
        }

        if previous == MemberStatus::Left {
            return None;
        }

        entry.member.heartbeat = remote.heartbeat;
        entry.member.tags = remote.tags;
        entry.last_progress = now;
        match (previous, remote.status) {
            (_, MemberStatus::Left) => {
                entry.member.status = MemberStatus::Left;
                if previous == MemberStatus::Alive {
                    Some(MembershipEvent::MemberLeft(entry.member.clone()))
                } else {
                    None
                }
            }
            (MemberStatus::Failed, MemberStatus::Alive) => {
                entry.member.status = MemberStatus::Alive;
                Some(MembershipEvent::MemberJoined(entry.member.clone()))
            }
            // Someone else's failure verdict. Ours is made locally.
            _ => None,
        }
    }

    /// Marks alive members whose heartbeat stalled for longer than `suspect_timeout` as failed.
    pub(crate) fn detect_failures(&mut self, now: Instant, suspect_timeout: Duration) -> Vec<MembershipEvent> {
        let local_name = &self.local_name;
        self.entries
            .values_mut()
            .filter(|entry| &entry.member.name != local_name && entry.member.status == MemberStatus::Alive)
            .filter(|entry| now.saturating_duration_since(entry.last_progress) > suspect_timeout)
            .map(|entry| {
                entry.member.status = MemberStatus::Failed;
                MembershipEvent::MemberFailed(entry.member.clone())
            })
            .collect()
    }

    /// Forgets left and failed members that have been quiet for longer than `retention`.
    /// Returns their names.
    pub(crate) fn prune_departed(&mut self, now: Instant, retention: Duration) -> Vec<String> {
        let departed: Vec<String> = self
            .entries
            .values()
            .filter(|entry| entry.member.name != self.local_name && entry.member.status != MemberStatus::Alive)
            .filter(|entry| now.saturating_duration_since(entry.last_progress) > retention)
            .map(|entry| entry.member.name.clone())
            .collect();

        for name in departed.iter() {
            self.entries.remove(name);
        }
        departed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(name: &str, port: u16, incarnation: u64, heartbeat: u64, status: MemberStatus) -> Member {
        let mut tags = HashMap::new();
        tags.insert(RPC_ADDR_TAG.to_string(), format!("127.0.0.1:{}", port + 1000));
        Member {
            name: name.to_string(),
            addr: format!("127.0.0.1:{}", port).parse().unwrap(),
            tags,
            incarnation,
            heartbeat,
            status,
        }
    }

    fn table(now: Instant) -> MemberTable {
        MemberTable::new(member("local", 7000, 1, 0, MemberStatus::Alive), now)
    }

    #[test]
    fn unknown_alive_member_joins() {
        let now = Instant::now();
        let mut table = table(now);

        let event = table.merge(member("a", 7001, 1, 3, MemberStatus::Alive), now);
        match event {
            Some(MembershipEvent::MemberJoined(m)) => {
                assert_eq!(m.name, "a");
                assert_eq!(m.rpc_addr(), Some("127.0.0.1:8001"));
            }
            other => panic!("Unexpected event: {:?}", other),
        }
        assert_eq!(table.alive_peer_addrs(), vec!["127.0.0.1:7001".parse::<SocketAddr>().unwrap()]);

        // Same news again is not an event.
        assert_eq!(table.merge(member("a", 7001, 1, 3, MemberStatus::Alive), now), None);
    }

    #[test]
    fn self_is_ignored() {
        let now = Instant::now();
        let mut table = table(now);

        assert_eq!(table.merge(member("local", 7000, 1, 99, MemberStatus::Left), now), None);
        assert_eq!(table.members().len(), 1);
        assert_eq!(table.members()[0].status, MemberStatus::Alive);
    }

    #[test]
    fn left_is_final_within_incarnation() {
        let now = Instant::now();
        let mut table = table(now);
        table.merge(member("a", 7001, 1, 1, MemberStatus::Alive), now);

        let event = table.merge(member("a", 7001, 1, 2, MemberStatus::Left), now);
        assert!(matches!(event, Some(MembershipEvent::MemberLeft(_))));

        // Stale alive gossip with a higher heartbeat can't bring it back.
        assert_eq!(table.merge(member("a", 7001, 1, 5, MemberStatus::Alive), now), None);
        assert!(table.alive_peer_addrs().is_empty());

        // A restart can.
        let event = table.merge(member("a", 7001, 2, 0, MemberStatus::Alive), now);
        assert!(matches!(event, Some(MembershipEvent::MemberJoined(_))));
    }

    #[test]
    fn stalled_heartbeat_fails_then_recovers() {
        let start = Instant::now();
        let mut table = table(start);
        table.merge(member("a", 7001, 1, 1, MemberStatus::Alive), start);

        let suspect_timeout = Duration::from_secs(3);
        assert!(table.detect_failures(start + Duration::from_secs(2), suspect_timeout).is_empty());

        let events = table.detect_failures(start + Duration::from_secs(4), suspect_timeout);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], MembershipEvent::MemberFailed(m) if m.name == "a"));
        // Reported once.
        assert!(table.detect_failures(start + Duration::from_secs(5), suspect_timeout).is_empty());

        let event = table.merge(member("a", 7001, 1, 2, MemberStatus::Alive), start + Duration::from_secs(6));
        assert!(matches!(event, Some(MembershipEvent::MemberJoined(_))));
    }

    #[test]
    fn local_member_never_fails() {
        let start = Instant::now();
        let mut table = table(start);

        assert!(table
            .detect_failures(start + Duration::from_secs(60), Duration::from_secs(1))
            .is_empty());
    }

    #[test]
    fn proto_conversion_rejects_garbage() {
        let mut proto = GossipMember::from(&member("a", 7001, 1, 1, MemberStatus::Failed));
        assert_eq!(Member::try_from(proto.clone()).unwrap().status, MemberStatus::Failed);

        proto.addr = "not an address".to_string();
        assert!(Member::try_from(proto.clone()).is_err());

        proto.addr = "127.0.0.1:1".to_string();
        proto.status = 42;
        assert!(Member::try_from(proto).is_err());
    }

    #[test]
    fn departed_members_are_pruned_after_retention() {
        let start = Instant::now();
        let retention = Duration::from_secs(60);
        let mut table = table(start);
        table.merge(member("alive", 7001, 1, 1, MemberStatus::Alive), start);
        table.merge(member("left", 7002, 1, 1, MemberStatus::Alive), start);
        table.merge(member("left", 7002, 1, 2, MemberStatus::Left), start + Duration::from_secs(10));
        // Heard of only as a tombstone.
        table.merge(member("gone", 7003, 1, 9, MemberStatus::Failed), start);

        assert!(table.prune_departed(start + Duration::from_secs(30), retention).is_empty());
        assert_eq!(table.members().len(), 4);

        let pruned = table.prune_departed(start + Duration::from_secs(65), retention);
        assert_eq!(pruned, vec!["gone".to_string()]);

        let pruned = table.prune_departed(start + Duration::from_secs(75), retention);
        assert_eq!(pruned, vec!["left".to_string()]);

        // Alive members and ourselves stay no matter how old.
        assert!(table.prune_departed(start + Duration::from_secs(3600), retention).is_empty());
        let mut names: Vec<String> = table.members().into_iter().map(|m| m.name).collect();
        names.sort();
        assert_eq!(names, vec!["alive".to_string(), "local".to_string()]);
    }
}
