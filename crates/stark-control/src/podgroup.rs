//! The pod-group store: TTL-scoped membership sets.
//!
//! Groups are created lazily on first join and deleted when their last
//! membership expires or leaves. Membership state never touches the
//! persistent store; fan-out queries run agent-side over the peer channels
//! and only the rosters live here.

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;

use stark_core::proto::GroupMemberInfo;
use stark_core::{GroupId, NodeId, PodId};

use crate::error::{ControlError, Result};

/// One pod's membership in one group.
#[derive(Debug, Clone)]
pub struct Membership {
    /// When the membership was first created.
    pub joined_at: DateTime<Utc>,
    /// Last join/refresh time; visibility is measured from here.
    pub last_refreshed_at: DateTime<Utc>,
    /// Lifetime from the last refresh; zero means no expiry.
    pub ttl: Duration,
    /// Node hosting the member, recorded so queriers can open channels.
    pub node_id: NodeId,
    /// Caller-supplied metadata.
    pub metadata: serde_json::Value,
}

impl Membership {
    /// Whether the membership is visible at `now`.
    #[must_use]
    pub fn is_visible(&self, now: DateTime<Utc>) -> bool {
        self.ttl.is_zero() || now <= self.last_refreshed_at + self.ttl
    }
}

/// TTL-keyed group membership store.
pub struct PodGroupStore {
    groups: RwLock<HashMap<GroupId, HashMap<PodId, Membership>>>,
    /// Optional cap on members per group; `0` means uncapped.
    member_cap: usize,
}

impl PodGroupStore {
    /// Create a store with the given per-group member cap (`0` = none).
    #[must_use]
    pub fn new(member_cap: usize) -> Self {
        Self {
            groups: RwLock::new(HashMap::new()),
            member_cap,
        }
    }

    /// Join a group, or refresh an existing membership.
    ///
    /// Idempotent upsert: re-joining keeps `joined_at` and moves
    /// `last_refreshed_at` forward. Returns the visible roster after the
    /// join.
    ///
    /// # Errors
    ///
    /// Returns `GroupFull` when a new member would exceed the cap.
    pub fn join(
        &self,
        group_id: &GroupId,
        pod_id: PodId,
        node_id: NodeId,
        ttl_ms: u64,
        metadata: serde_json::Value,
    ) -> Result<Vec<GroupMemberInfo>> {
        let now = Utc::now();
        let ttl = Duration::milliseconds(i64::try_from(ttl_ms).unwrap_or(i64::MAX));
        let mut groups = self.groups.write();
        let members = groups.entry(group_id.clone()).or_default();

        if let Some(existing) = members.get_mut(&pod_id) {
            existing.last_refreshed_at = now;
            existing.ttl = ttl;
            existing.node_id = node_id;
            existing.metadata = metadata;
        } else {
            let visible = members.values().filter(|m| m.is_visible(now)).count();
            if self.member_cap > 0 && visible >= self.member_cap {
                return Err(ControlError::GroupFull(group_id.to_string()));
            }
            members.insert(
                pod_id,
                Membership {
                    joined_at: now,
                    last_refreshed_at: now,
                    ttl,
                    node_id,
                    metadata,
                },
            );
        }

        Ok(Self::roster(members, now))
    }

    /// Leave a group. Returns whether a membership existed; empty groups
    /// are deleted.
    pub fn leave(&self, group_id: &GroupId, pod_id: &PodId) -> bool {
        let mut groups = self.groups.write();
        let Some(members) = groups.get_mut(group_id) else {
            return false;
        };
        let existed = members.remove(pod_id).is_some();
        if members.is_empty() {
            groups.remove(group_id);
        }
        existed
    }

    /// Drop every membership a pod holds; used when the pod terminates.
    pub fn leave_all(&self, pod_id: &PodId) -> usize {
        let mut groups = self.groups.write();
        let mut left = 0;
        groups.retain(|_, members| {
            if members.remove(pod_id).is_some() {
                left += 1;
            }
            !members.is_empty()
        });
        left
    }

    /// The currently visible members of a group.
    #[must_use]
    pub fn list(&self, group_id: &GroupId) -> Vec<GroupMemberInfo> {
        let now = Utc::now();
        self.groups
            .read()
            .get(group_id)
            .map(|members| Self::roster(members, now))
            .unwrap_or_default()
    }

    /// Number of groups currently held (including ones awaiting the
    /// reaper).
    #[must_use]
    pub fn group_count(&self) -> usize {
        self.groups.read().len()
    }

    /// Delete expired memberships and empty groups. Returns
    /// `(memberships_removed, groups_removed)`.
    pub fn reap(&self) -> (usize, usize) {
        let now = Utc::now();
        let mut groups = self.groups.write();
        let mut removed_members = 0;
        let before = groups.len();
        groups.retain(|group_id, members| {
            members.retain(|pod_id, membership| {
                let keep = membership.is_visible(now);
                if !keep {
                    tracing::debug!(
                        group_id = %group_id,
                        pod_id = %pod_id,
                        "Membership expired"
                    );
                    removed_members += 1;
                }
                keep
            });
            !members.is_empty()
        });
        let removed_groups = before - groups.len();
        if removed_members > 0 {
            tracing::debug!(
                memberships = removed_members,
                groups = removed_groups,
                "Reaped expired pod-group state"
            );
        }
        (removed_members, removed_groups)
    }

    /// Run the reaper until the task is aborted.
    pub async fn run_reaper(&self, interval: std::time::Duration) {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            self.reap();
        }
    }

    fn roster(members: &HashMap<PodId, Membership>, now: DateTime<Utc>) -> Vec<GroupMemberInfo> {
        let mut roster: Vec<GroupMemberInfo> = members
            .iter()
            .filter(|(_, m)| m.is_visible(now))
            .map(|(pod_id, m)| GroupMemberInfo {
                pod_id: *pod_id,
                node_id: m.node_id,
                joined_at_ms: u64::try_from(m.joined_at.timestamp_millis()).unwrap_or(0),
                metadata: m.metadata.clone(),
            })
            .collect();
        roster.sort_by_key(|m| m.pod_id);
        roster
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group() -> GroupId {
        "chat:room".parse().unwrap()
    }

    fn pod(seed: u64) -> PodId {
        PodId::generate_deterministic(seed)
    }

    fn node(seed: u64) -> NodeId {
        NodeId::generate_deterministic(seed)
    }

    #[test]
    fn join_creates_group_lazily() {
        let store = PodGroupStore::new(0);
        assert_eq!(store.group_count(), 0);

        let roster = store
            .join(&group(), pod(1), node(1), 60_000, serde_json::json!({}))
            .unwrap();
        assert_eq!(roster.len(), 1);
        assert_eq!(store.group_count(), 1);
    }

    #[test]
    fn rejoin_is_idempotent_and_refreshes() {
        let store = PodGroupStore::new(0);
        store
            .join(&group(), pod(1), node(1), 60_000, serde_json::json!({}))
            .unwrap();
        let first = store.list(&group());

        std::thread::sleep(std::time::Duration::from_millis(5));
        let roster = store
            .join(&group(), pod(1), node(1), 60_000, serde_json::json!({"v": 2}))
            .unwrap();

        assert_eq!(roster.len(), 1, "one membership after re-join");
        assert_eq!(roster[0].joined_at_ms, first[0].joined_at_ms);
        assert_eq!(roster[0].metadata["v"], 2);
    }

    #[test]
    fn expired_membership_invisible_then_reaped() {
        let store = PodGroupStore::new(0);
        store
            .join(&group(), pod(1), node(1), 1, serde_json::json!({}))
            .unwrap();

        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(store.list(&group()).is_empty(), "expired member invisible");
        assert_eq!(store.group_count(), 1, "group still held until reap");

        let (members, groups) = store.reap();
        assert_eq!(members, 1);
        assert_eq!(groups, 1);
        assert_eq!(store.group_count(), 0);
    }

    #[test]
    fn zero_ttl_never_expires() {
        let store = PodGroupStore::new(0);
        store
            .join(&group(), pod(1), node(1), 0, serde_json::json!({}))
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));

        assert_eq!(store.list(&group()).len(), 1);
        let (members, groups) = store.reap();
        assert_eq!((members, groups), (0, 0));
    }

    #[test]
    fn leave_deletes_empty_group() {
        let store = PodGroupStore::new(0);
        store
            .join(&group(), pod(1), node(1), 60_000, serde_json::json!({}))
            .unwrap();

        assert!(store.leave(&group(), &pod(1)));
        assert!(!store.leave(&group(), &pod(1)));
        assert_eq!(store.group_count(), 0);
    }

    #[test]
    fn pod_can_hold_many_memberships_and_leave_all() {
        let store = PodGroupStore::new(0);
        let other: GroupId = "presence".parse().unwrap();
        store
            .join(&group(), pod(1), node(1), 60_000, serde_json::json!({}))
            .unwrap();
        store
            .join(&other, pod(1), node(1), 60_000, serde_json::json!({}))
            .unwrap();
        store
            .join(&other, pod(2), node(1), 60_000, serde_json::json!({}))
            .unwrap();

        assert_eq!(store.leave_all(&pod(1)), 2);
        assert_eq!(store.group_count(), 1);
        assert_eq!(store.list(&other).len(), 1);
    }

    #[test]
    fn member_cap_enforced() {
        let store = PodGroupStore::new(2);
        store
            .join(&group(), pod(1), node(1), 60_000, serde_json::json!({}))
            .unwrap();
        store
            .join(&group(), pod(2), node(1), 60_000, serde_json::json!({}))
            .unwrap();

        let result = store.join(&group(), pod(3), node(1), 60_000, serde_json::json!({}));
        assert!(matches!(result, Err(ControlError::GroupFull(_))));

        // Refreshing an existing member is not capped.
        store
            .join(&group(), pod(2), node(1), 60_000, serde_json::json!({}))
            .unwrap();
    }
}
