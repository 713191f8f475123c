//! The ephemeral-plane client: pod groups and fan-out queries.
//!
//! Group membership lives on the orchestrator; queries travel pod-to-pod
//! over the same peer channels the overlay uses. Nothing here is
//! persisted: a query resolves once every target answered or the deadline
//! passed, and timed-out pods are reported, not retried.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use stark_core::envelope::ResponseEnvelope;
use stark_core::proto::{Body, GroupJoin, GroupLeave, GroupMemberInfo, GroupMembers, GroupRoster};
use stark_core::{CoreError, GroupId, PodId, QueryId};

use crate::netstack::NetworkStack;
use crate::session::ControlChannel;

/// The aggregate outcome of one fan-out query.
#[derive(Debug)]
pub struct QueryOutcome {
    /// The query's identity.
    pub query_id: QueryId,
    /// Responses keyed by the answering pod.
    pub responses: HashMap<PodId, ResponseEnvelope>,
    /// Pods that did not answer before the deadline.
    pub timed_out: Vec<PodId>,
    /// Whether every target answered.
    pub complete: bool,
    /// When the aggregate resolved.
    pub completed_at: DateTime<Utc>,
}

/// Client for the ephemeral plane, one per agent.
pub struct EphemeralClient {
    session: Arc<dyn ControlChannel>,
    netstack: Arc<NetworkStack>,
    query_timeout: Duration,
}

impl EphemeralClient {
    /// Wire up the client.
    #[must_use]
    pub fn new(
        session: Arc<dyn ControlChannel>,
        netstack: Arc<NetworkStack>,
        query_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            session,
            netstack,
            query_timeout,
        })
    }

    /// Join a group on behalf of a local pod.
    ///
    /// Joining is an idempotent upsert; re-joining refreshes the
    /// membership.
    ///
    /// # Errors
    ///
    /// Returns the orchestrator's verdict (`ResourceExhausted` when the
    /// group is capped) or transport errors.
    pub async fn join(
        self: &Arc<Self>,
        pod_id: PodId,
        group_id: GroupId,
        ttl_ms: u64,
        metadata: serde_json::Value,
    ) -> stark_core::Result<PodGroupHandle> {
        let roster = self
            .join_inner(pod_id, &group_id, ttl_ms, metadata.clone())
            .await?;
        Ok(PodGroupHandle {
            client: Arc::clone(self),
            group_id,
            pod_id,
            ttl_ms,
            metadata,
            members: Mutex::new(roster),
            left: AtomicBool::new(false),
        })
    }

    async fn join_inner(
        &self,
        pod_id: PodId,
        group_id: &GroupId,
        ttl_ms: u64,
        metadata: serde_json::Value,
    ) -> stark_core::Result<Vec<GroupMemberInfo>> {
        let value = self
            .session
            .request(Body::GroupJoin(GroupJoin {
                pod_id,
                group_id: group_id.clone(),
                ttl_ms,
                metadata,
            }))
            .await?;
        let roster: GroupRoster = serde_json::from_value(value)
            .map_err(|e| CoreError::Invalid(format!("bad roster reply: {e}")))?;
        Ok(roster.members)
    }

    async fn members_inner(&self, group_id: &GroupId) -> stark_core::Result<Vec<GroupMemberInfo>> {
        let value = self
            .session
            .request(Body::GroupMembers(GroupMembers {
                group_id: group_id.clone(),
            }))
            .await?;
        let roster: GroupRoster = serde_json::from_value(value)
            .map_err(|e| CoreError::Invalid(format!("bad roster reply: {e}")))?;
        Ok(roster.members)
    }

    /// Fan a query out to explicit target pods and aggregate the answers.
    pub async fn query_pods(
        &self,
        source_pod: PodId,
        targets: &[GroupMemberInfo],
        path: &str,
        query: &serde_json::Value,
        timeout: Option<Duration>,
    ) -> QueryOutcome {
        let query_id = QueryId::generate();
        let timeout = timeout.unwrap_or(self.query_timeout);
        let body = serde_json::to_vec(query).unwrap_or_default();

        let calls = targets.iter().map(|member| {
            let body = body.clone();
            async move {
                let result = self
                    .netstack
                    .request_to_pod(
                        source_pod,
                        member.pod_id,
                        member.node_id,
                        "POST",
                        path,
                        body,
                        timeout,
                    )
                    .await;
                (member.pod_id, result)
            }
        });

        let results = futures::future::join_all(calls).await;

        let mut responses = HashMap::new();
        let mut timed_out = Vec::new();
        for (pod_id, result) in results {
            match result {
                Ok(response) => {
                    responses.insert(pod_id, response);
                }
                Err(e) => {
                    tracing::debug!(pod_id = %pod_id, error = %e, "Query target did not answer");
                    timed_out.push(pod_id);
                }
            }
        }
        timed_out.sort();

        QueryOutcome {
            query_id,
            complete: timed_out.is_empty(),
            responses,
            timed_out,
            completed_at: Utc::now(),
        }
    }
}

/// Caller-facing handle to one pod's membership in one group.
pub struct PodGroupHandle {
    client: Arc<EphemeralClient>,
    group_id: GroupId,
    pod_id: PodId,
    ttl_ms: u64,
    metadata: serde_json::Value,
    members: Mutex<Vec<GroupMemberInfo>>,
    left: AtomicBool,
}

impl PodGroupHandle {
    /// The group this handle belongs to.
    #[must_use]
    pub const fn group_id(&self) -> &GroupId {
        &self.group_id
    }

    /// The member pod this handle represents.
    #[must_use]
    pub const fn pod_id(&self) -> PodId {
        self.pod_id
    }

    /// The cached member roster from the last join/refresh.
    #[must_use]
    pub fn members(&self) -> Vec<GroupMemberInfo> {
        self.members.lock().clone()
    }

    /// The cached member pod IDs.
    #[must_use]
    pub fn pod_ids(&self) -> Vec<PodId> {
        self.members.lock().iter().map(|m| m.pod_id).collect()
    }

    fn ensure_live(&self) -> stark_core::Result<()> {
        if self.left.load(Ordering::SeqCst) {
            return Err(CoreError::Invalid(format!(
                "pod group handle for {} already left",
                self.group_id
            )));
        }
        Ok(())
    }

    /// Refresh the membership (push the TTL window forward) and the cached
    /// roster.
    ///
    /// # Errors
    ///
    /// Rejected once the handle has left the group.
    pub async fn refresh(&self) -> stark_core::Result<()> {
        self.ensure_live()?;
        let roster = self
            .client
            .join_inner(self.pod_id, &self.group_id, self.ttl_ms, self.metadata.clone())
            .await?;
        *self.members.lock() = roster;
        Ok(())
    }

    /// Re-fetch the roster without refreshing the TTL.
    ///
    /// # Errors
    ///
    /// Rejected once the handle has left the group.
    pub async fn fetch_members(&self) -> stark_core::Result<Vec<GroupMemberInfo>> {
        self.ensure_live()?;
        let roster = self.client.members_inner(&self.group_id).await?;
        *self.members.lock() = roster.clone();
        Ok(roster)
    }

    /// Leave the group; every further operation on this handle is
    /// rejected.
    ///
    /// # Errors
    ///
    /// Rejected if already left; transport errors pass through.
    pub async fn leave(&self) -> stark_core::Result<()> {
        self.ensure_live()?;
        self.left.store(true, Ordering::SeqCst);
        self.client
            .session
            .request(Body::GroupLeave(GroupLeave {
                pod_id: self.pod_id,
                group_id: self.group_id.clone(),
            }))
            .await?;
        Ok(())
    }

    /// Query every other member of the group and aggregate the answers.
    ///
    /// Resolves when all targets answered or the timeout elapsed;
    /// non-answering pods land in `timed_out`.
    ///
    /// # Errors
    ///
    /// Rejected once the handle has left the group.
    pub async fn query_pods(
        &self,
        path: &str,
        query: &serde_json::Value,
        timeout: Option<Duration>,
    ) -> stark_core::Result<QueryOutcome> {
        self.ensure_live()?;
        let targets: Vec<GroupMemberInfo> = self
            .members
            .lock()
            .iter()
            .filter(|m| m.pod_id != self.pod_id)
            .cloned()
            .collect();
        Ok(self
            .client
            .query_pods(self.pod_id, &targets, path, query, timeout)
            .await)
    }
}
