//! The closed-loop reconcile cycle.
//!
//! Each cycle snapshots the store, closes replica deficits and surpluses,
//! steps rolling updates, and runs the placement pipeline over pending pods.
//! The cycle itself never writes pod state: every decision goes through the
//! [`PlacementSink`], which the lifecycle controller implements. The
//! snapshot is advisory; conflicting concurrent mutations surface as sink
//! errors and are retried next cycle.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;

use stark_core::{NodeId, PodId, PodStatus, Resources};
use stark_store::{Pod, PodOwner, Store};

use crate::filter::{eligible_nodes, summarize_rejections, with_pod_slot};
use crate::preempt::plan_preemption;
use crate::score::select_node;
use crate::snapshot::Snapshot;
use crate::types::{CycleSummary, NewPodSpec, SchedulerConfig, Trigger, WorkloadView};
use crate::Result;

/// Annotation recording the node a replacement pod should avoid.
pub const AVOID_NODE_ANNOTATION: &str = "scheduler.stark/avoid-node";

/// The actions a reconcile cycle can take, enforced by the lifecycle
/// controller.
#[async_trait]
pub trait PlacementSink: Send + Sync {
    /// Create a pending pod. Implementations record the
    /// [`AVOID_NODE_ANNOTATION`] when `spec.avoid_node` is set.
    async fn create_pod(&self, spec: NewPodSpec) -> stark_core::Result<PodId>;

    /// Place a pending pod onto a node and issue the deploy command.
    async fn assign_pod(&self, pod_id: &PodId, node_id: &NodeId) -> stark_core::Result<()>;

    /// Gracefully stop a pod (scale-down, ineligible node).
    async fn stop_pod(&self, pod_id: &PodId, reason: &str) -> stark_core::Result<()>;

    /// Gracefully stop an outdated pod as a rolling-update step, recording
    /// the version change in its history.
    async fn rollout_pod(&self, pod_id: &PodId, new_version: &str) -> stark_core::Result<()>;

    /// Evict a pod (preemption victim, orphan).
    async fn evict_pod(&self, pod_id: &PodId, reason: &str) -> stark_core::Result<()>;

    /// Record a placement failure on a pending pod: bump its consecutive
    /// failure counter and set the status message. The pod stays pending.
    async fn mark_schedule_failed(&self, pod_id: &PodId, message: &str) -> stark_core::Result<()>;

    /// Flip a workload's degraded flag. Must be idempotent.
    async fn set_workload_degraded(
        &self,
        owner: &PodOwner,
        degraded: bool,
    ) -> stark_core::Result<()>;

    /// Write back observed replica counts.
    async fn record_replica_counts(
        &self,
        owner: &PodOwner,
        ready: u32,
        available: u32,
    ) -> stark_core::Result<()>;
}

/// Handle for nudging the reconcile loop ahead of its next tick.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<Trigger>,
}

impl SchedulerHandle {
    /// Create a handle and the trigger receiver its scheduler will drain.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Trigger>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Wake the loop. Dropped silently once the scheduler has shut down.
    pub fn nudge(&self, trigger: Trigger) {
        if self.tx.send(trigger).is_err() {
            tracing::debug!(?trigger, "Scheduler loop gone, nudge dropped");
        }
    }
}

/// A pod awaiting placement this cycle.
struct PendingItem {
    pod_id: PodId,
    owner: PodOwner,
    requests: Resources,
    priority: i32,
    avoid_node: Option<NodeId>,
    created_at: chrono::DateTime<Utc>,
}

/// The replica reconciler and placement pipeline.
pub struct Scheduler<S, P> {
    store: Arc<S>,
    sink: Arc<P>,
    config: SchedulerConfig,
}

impl<S: Store, P: PlacementSink> Scheduler<S, P> {
    /// Create a scheduler over a store and a placement sink.
    #[must_use]
    pub fn new(store: Arc<S>, sink: Arc<P>, config: SchedulerConfig) -> Self {
        Self {
            store,
            sink,
            config,
        }
    }

    /// Run the reconcile loop until the trigger channel closes.
    ///
    /// Wakes on the configured tick and on every nudge; extra queued nudges
    /// are drained so a burst of mutations costs one cycle.
    pub async fn run(&self, mut triggers: mpsc::UnboundedReceiver<Trigger>) {
        let mut tick =
            tokio::time::interval(std::time::Duration::from_millis(self.config.tick_interval_ms));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(
            tick_ms = self.config.tick_interval_ms,
            "Scheduler reconcile loop started"
        );

        loop {
            tokio::select! {
                _ = tick.tick() => {}
                trigger = triggers.recv() => {
                    match trigger {
                        Some(_) => {
                            while triggers.try_recv().is_ok() {}
                        }
                        None => break,
                    }
                }
            }

            match self.reconcile_cycle().await {
                Ok(summary) if !summary.is_noop() => {
                    tracing::info!(
                        created = summary.created,
                        assigned = summary.assigned,
                        stopped = summary.stopped,
                        evicted = summary.evicted,
                        unplaced = summary.unplaced,
                        "Reconcile cycle"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "Reconcile cycle failed, will retry");
                }
            }
        }

        tracing::info!("Scheduler reconcile loop stopped");
    }

    /// Run one reconcile cycle.
    ///
    /// # Errors
    ///
    /// Returns an error when the snapshot cannot be loaded; individual sink
    /// failures are logged and retried next cycle.
    pub async fn reconcile_cycle(&self) -> Result<CycleSummary> {
        let snap = Snapshot::load(self.store.as_ref())?;
        let mut summary = CycleSummary::default();
        let mut committed = snap.committed_by_node();
        let mut new_items: Vec<PendingItem> = Vec::new();
        let mut stopped: HashSet<PodId> = HashSet::new();

        for workload in &snap.workloads {
            let result = if workload.is_daemon_set() {
                self.reconcile_daemon_set(workload, &snap, &mut committed, &mut summary)
                    .await
            } else {
                self.reconcile_replicas(
                    workload,
                    &snap,
                    &mut new_items,
                    &mut stopped,
                    &mut summary,
                )
                .await
            };
            if let Err(e) = result {
                tracing::warn!(owner = %workload.owner, error = %e, "Workload reconcile failed");
            }

            self.record_counts(workload, &snap, &stopped).await;
        }

        self.place_pending(&snap, new_items, &stopped, &mut committed, &mut summary)
            .await;

        Ok(summary)
    }

    /// Reconcile a fixed-replica workload: rollout step, then deficit or
    /// surplus.
    async fn reconcile_replicas(
        &self,
        workload: &WorkloadView,
        snap: &Snapshot,
        new_items: &mut Vec<PendingItem>,
        stopped: &mut HashSet<PodId>,
        summary: &mut CycleSummary,
    ) -> stark_core::Result<()> {
        let active = snap.active_pods_of(&workload.owner);

        // Rolling update: stop outdated pods, at most `max_unavailable`
        // below the desired running count at any time.
        let outdated: Vec<&&Pod> = active
            .iter()
            .filter(|p| p.pack_version != workload.pack_version)
            .collect();
        if !outdated.is_empty() {
            let running = active
                .iter()
                .filter(|p| p.status == PodStatus::Running)
                .count();
            let unavailable = workload
                .replicas
                .saturating_sub(u32::try_from(running).unwrap_or(u32::MAX));
            let budget = self.config.max_unavailable.saturating_sub(unavailable);

            let mut oldest_first = outdated;
            oldest_first.sort_by_key(|p| p.created_at);
            for pod in oldest_first.into_iter().take(budget as usize) {
                self.sink
                    .rollout_pod(&pod.id, &workload.pack_version)
                    .await?;
                stopped.insert(pod.id);
                summary.stopped += 1;
                tracing::info!(
                    pod_id = %pod.id,
                    from = %pod.pack_version,
                    to = %workload.pack_version,
                    "Rolling update step"
                );
            }
        }

        let effective: Vec<&&Pod> = active.iter().filter(|p| !stopped.contains(&p.id)).collect();
        let desired = i64::from(workload.replicas);
        let current = i64::try_from(effective.len()).unwrap_or(i64::MAX);

        if current < desired {
            self.create_replacements(
                workload,
                snap,
                usize::try_from(desired - current).unwrap_or(0),
                new_items,
                summary,
            )
            .await?;
        } else if current > desired {
            // Scale down: youngest first.
            let mut youngest_first: Vec<&&Pod> = effective;
            youngest_first.sort_by_key(|p| std::cmp::Reverse(p.created_at));
            for pod in youngest_first
                .into_iter()
                .take(usize::try_from(current - desired).unwrap_or(0))
            {
                self.sink.stop_pod(&pod.id, "ScaleDown").await?;
                stopped.insert(pod.id);
                summary.stopped += 1;
            }
        }

        Ok(())
    }

    /// Create pods to close a deficit, honoring the failure backoff.
    async fn create_replacements(
        &self,
        workload: &WorkloadView,
        snap: &Snapshot,
        count: usize,
        new_items: &mut Vec<PendingItem>,
        summary: &mut CycleSummary,
    ) -> stark_core::Result<()> {
        // A failure is fresh if it post-dates every live pod of the
        // workload; stale failures from an older generation do not gate new
        // creations.
        let newest_active = snap
            .active_pods_of(&workload.owner)
            .iter()
            .map(|p| p.created_at)
            .max();
        let fresh_failure = snap.latest_failed_pod_of(&workload.owner).filter(|failed| {
            newest_active.map_or(true, |newest| failed.updated_at > newest)
        });

        let (inherited, avoid_node, last_failure_at) = match fresh_failure {
            Some(failed) => (failed.consecutive_failures, failed.node_id, failed.updated_at),
            None => (0, None, snap.taken_at),
        };

        if inherited >= self.config.failure_threshold {
            self.sink
                .set_workload_degraded(&workload.owner, true)
                .await?;
            let resume_at = last_failure_at + self.config.backoff_for(inherited);
            if snap.taken_at < resume_at {
                tracing::debug!(
                    owner = %workload.owner,
                    failures = inherited,
                    resume_at = %resume_at,
                    "Backing off replacement creation"
                );
                return Ok(());
            }
        } else {
            self.sink
                .set_workload_degraded(&workload.owner, false)
                .await?;
        }

        for _ in 0..count {
            let spec = NewPodSpec {
                owner: workload.owner.clone(),
                namespace: workload.namespace,
                pack_id: workload.pack_id,
                pack_version: workload.pack_version.clone(),
                requests: workload.requests,
                limits: workload.limits,
                labels: workload.labels.clone(),
                priority: workload.priority,
                consecutive_failures: inherited,
                avoid_node,
                reason: if inherited > 0 {
                    "Replacement".to_string()
                } else {
                    "ScaleUp".to_string()
                },
            };
            let pod_id = self.sink.create_pod(spec).await?;
            new_items.push(PendingItem {
                pod_id,
                owner: workload.owner.clone(),
                requests: workload.requests,
                priority: workload.priority,
                avoid_node,
                created_at: Utc::now(),
            });
            summary.created += 1;
        }
        Ok(())
    }

    /// DaemonSet mode: exactly one pod per eligible node.
    async fn reconcile_daemon_set(
        &self,
        workload: &WorkloadView,
        snap: &Snapshot,
        committed: &mut HashMap<NodeId, Resources>,
        summary: &mut CycleSummary,
    ) -> stark_core::Result<()> {
        let active = snap.active_pods_of(&workload.owner);
        let (eligible, _) = eligible_nodes(workload, &workload.requests, &snap.nodes, committed);
        let eligible_ids: HashSet<NodeId> = eligible.iter().map(|n| n.id).collect();

        let covered: HashSet<NodeId> = active.iter().filter_map(|p| p.node_id).collect();
        // Unassigned daemon pods from an earlier failed assignment count
        // against new creations so the set cannot grow unboundedly.
        let mut spare = active.iter().filter(|p| p.node_id.is_none()).count();

        for node in &eligible {
            if covered.contains(&node.id) {
                continue;
            }
            if spare > 0 {
                spare -= 1;
                continue;
            }
            let spec = NewPodSpec {
                owner: workload.owner.clone(),
                namespace: workload.namespace,
                pack_id: workload.pack_id,
                pack_version: workload.pack_version.clone(),
                requests: workload.requests,
                limits: workload.limits,
                labels: workload.labels.clone(),
                priority: workload.priority,
                consecutive_failures: 0,
                avoid_node: None,
                reason: "DaemonSet".to_string(),
            };
            let pod_id = self.sink.create_pod(spec).await?;
            self.sink.assign_pod(&pod_id, &node.id).await?;
            let entry = committed.entry(node.id).or_insert(Resources::ZERO);
            *entry = entry.saturating_add(&with_pod_slot(&workload.requests));
            summary.created += 1;
            summary.assigned += 1;
        }

        // Pods on nodes that fell out of the eligible set.
        for pod in &active {
            if let Some(node_id) = pod.node_id {
                if !eligible_ids.contains(&node_id) {
                    self.sink.stop_pod(&pod.id, "NodeIneligible").await?;
                    summary.stopped += 1;
                }
            }
        }

        Ok(())
    }

    /// The placement pipeline over all pending pods.
    async fn place_pending(
        &self,
        snap: &Snapshot,
        new_items: Vec<PendingItem>,
        stopped: &HashSet<PodId>,
        committed: &mut HashMap<NodeId, Resources>,
        summary: &mut CycleSummary,
    ) {
        let pods_by_node = snap.pods_by_node();

        let mut items: Vec<PendingItem> = snap
            .pods
            .iter()
            .filter(|p| p.status == PodStatus::Pending && !stopped.contains(&p.id))
            .map(|p| PendingItem {
                pod_id: p.id,
                owner: p.owner.clone(),
                requests: p.resource_requests,
                priority: p.priority,
                avoid_node: p
                    .annotations
                    .get(AVOID_NODE_ANNOTATION)
                    .and_then(|s| s.parse().ok()),
                created_at: p.created_at,
            })
            .collect();
        let known: HashSet<PodId> = items.iter().map(|i| i.pod_id).collect();
        items.extend(new_items.into_iter().filter(|i| !known.contains(&i.pod_id)));

        // Highest priority first; FIFO within a priority band.
        items.sort_by_key(|i| (std::cmp::Reverse(i.priority), i.created_at));

        for item in items {
            let Some(workload) = snap.workload_of(&item.owner) else {
                if let Err(e) = self.sink.evict_pod(&item.pod_id, "OwnerDeleted").await {
                    tracing::warn!(pod_id = %item.pod_id, error = %e, "Orphan eviction failed");
                }
                summary.evicted += 1;
                continue;
            };

            let (eligible, rejections) =
                eligible_nodes(workload, &item.requests, &snap.nodes, committed);

            if let Some(node) = select_node(
                workload,
                &eligible,
                committed,
                &pods_by_node,
                item.avoid_node.as_ref(),
            ) {
                match self.sink.assign_pod(&item.pod_id, &node.id).await {
                    Ok(()) => {
                        let entry = committed.entry(node.id).or_insert(Resources::ZERO);
                        *entry = entry.saturating_add(&with_pod_slot(&item.requests));
                        summary.assigned += 1;
                    }
                    Err(e) => {
                        tracing::warn!(
                            pod_id = %item.pod_id,
                            node_id = %node.id,
                            error = %e,
                            "Assignment failed, pod stays pending"
                        );
                        summary.unplaced += 1;
                    }
                }
                continue;
            }

            // Preemption for priority pods that fit nowhere.
            if item.priority > 0 {
                if let Some(plan) = plan_preemption(
                    workload,
                    &item.requests,
                    item.priority,
                    &snap.nodes,
                    &pods_by_node,
                    committed,
                ) {
                    tracing::info!(
                        pod_id = %item.pod_id,
                        node_id = %plan.node_id,
                        victims = plan.victims.len(),
                        "Preempting for priority pod"
                    );
                    for victim in &plan.victims {
                        if let Err(e) = self.sink.evict_pod(victim, "Preempted").await {
                            tracing::warn!(pod_id = %victim, error = %e, "Eviction failed");
                        } else {
                            summary.evicted += 1;
                        }
                    }
                    // Placement retries next cycle once the victims are gone.
                    summary.unplaced += 1;
                    continue;
                }
            }

            let message = summarize_rejections(&rejections);
            if let Err(e) = self.sink.mark_schedule_failed(&item.pod_id, &message).await {
                tracing::warn!(pod_id = %item.pod_id, error = %e, "Recording schedule failure failed");
            }
            summary.unplaced += 1;
        }
    }

    /// Write back observed replica counts for a workload.
    async fn record_counts(
        &self,
        workload: &WorkloadView,
        snap: &Snapshot,
        stopped: &HashSet<PodId>,
    ) {
        let active = snap.active_pods_of(&workload.owner);
        let available = active.iter().filter(|p| !stopped.contains(&p.id)).count();
        let ready = active
            .iter()
            .filter(|p| !stopped.contains(&p.id) && p.status == PodStatus::Running)
            .count();
        if let Err(e) = self
            .sink
            .record_replica_counts(
                &workload.owner,
                u32::try_from(ready).unwrap_or(u32::MAX),
                u32::try_from(available).unwrap_or(u32::MAX),
            )
            .await
        {
            tracing::debug!(owner = %workload.owner, error = %e, "Replica count write failed");
        }
    }
}
