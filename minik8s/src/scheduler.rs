//! Two-phase pod scheduler: filter nodes a pod can run on, score the
//! survivors, bind to the winner.
//!
//! Binding writes `spec.nodeName`, the `Scheduled` phase and a
//! `PodScheduled=True` condition in a single conditional update, so
//! observers never see a half-bound pod. The pods-per-node counter used in
//! scoring comes from this process's own bind history, not the store; it
//! resets on restart and is only meaningful while this is the sole
//! scheduler.

use crate::store::{Store, StoreError};
use anyhow::Result;
use chrono::{DateTime, Utc};
use common::quantity::{parse_cpu, parse_memory, parse_memory_gib, QuantityError};
use common::{
    Node, Object, Pod, PodCondition, PodPhase, ResourceKind, RESOURCE_CPU, RESOURCE_MEMORY,
};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_SCHEDULE_INTERVAL: Duration = Duration::from_secs(10);

/// A bind this process performed, keyed by `namespace/name`.
#[derive(Debug, Clone)]
pub struct ScheduledPod {
    pub node_name: String,
    pub time: DateTime<Utc>,
    pub status: &'static str,
}

pub struct Scheduler {
    store: Arc<dyn Store>,
    interval: Duration,
    scheduled: Arc<RwLock<HashMap<String, ScheduledPod>>>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn Store>, interval: Duration) -> Self {
        Self {
            store,
            interval,
            scheduled: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Spawn the scheduling loop; one assignment pass per tick.
    pub fn run(self: Arc<Self>, shutdown: CancellationToken) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("scheduler stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.schedule_once().await {
                            warn!("scheduling pass failed: {e:#}");
                        }
                    }
                }
            }
        });
    }

    /// One pass: list pods and nodes, bind every unscheduled pod that has
    /// a feasible node. Pods without one stay Pending, silently.
    pub async fn schedule_once(&self) -> Result<()> {
        let pods = self.store.list(ResourceKind::Pod, "").await?;
        let mut nodes: Vec<Node> = self
            .store
            .list(ResourceKind::Node, "")
            .await?
            .into_iter()
            .filter_map(Object::into_node)
            .collect();
        // Stable candidate order keeps tie-breaking deterministic.
        nodes.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));

        let unscheduled: Vec<Pod> = pods
            .into_iter()
            .filter_map(Object::into_pod)
            .filter(|p| p.spec.node_name.is_empty() && p.status.phase == PodPhase::Pending)
            .collect();
        if unscheduled.is_empty() {
            return Ok(());
        }
        debug!("found {} unscheduled pods", unscheduled.len());

        for pod in unscheduled {
            let key = pod.metadata.key();
            if let Err(e) = self.schedule_pod(pod, &nodes).await {
                warn!("failed to schedule pod {key}: {e:#}");
            }
        }
        Ok(())
    }

    async fn schedule_pod(&self, mut pod: Pod, nodes: &[Node]) -> Result<()> {
        let pods_per_node = self.pods_per_node().await;
        let Some(node_name) = self.find_best_node(&pod, nodes, &pods_per_node)? else {
            debug!("no feasible node for pod {}", pod.metadata.key());
            return Ok(());
        };

        let key = pod.metadata.key();
        pod.spec.node_name = node_name.clone();
        pod.status.phase = PodPhase::Scheduled;
        pod.status.conditions.push(PodCondition {
            condition_type: "PodScheduled".to_string(),
            status: "True".to_string(),
            last_transition_time: Some(Utc::now()),
            reason: "Scheduled".to_string(),
            message: format!("Pod scheduled to node {node_name}"),
        });

        match self.store.update(Object::Pod(pod)).await {
            Ok(_) => {}
            // The pod moved under us (deleted or bound elsewhere); the
            // next tick re-observes it.
            Err(StoreError::Conflict { .. }) | Err(StoreError::NotFound { .. }) => {
                debug!("bind of {key} lost a race, retrying next tick");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        info!("pod {key} scheduled to node {node_name}");
        self.scheduled.write().await.insert(
            key,
            ScheduledPod {
                node_name,
                time: Utc::now(),
                status: "Scheduled",
            },
        );
        Ok(())
    }

    /// Filter then score. Returns the winning node name, or `None` when no
    /// node passes the predicates. Malformed pod requests fail the pod;
    /// malformed node quantities exclude the node.
    fn find_best_node(
        &self,
        pod: &Pod,
        nodes: &[Node],
        pods_per_node: &HashMap<String, usize>,
    ) -> Result<Option<String>> {
        let (cpu_request, memory_request) = pod_resource_requests(pod)?;

        let mut best: Option<(&Node, f64)> = None;
        for node in nodes {
            if !self.feasible(pod, node, cpu_request, memory_request) {
                continue;
            }
            let score = match node_score(node, pods_per_node) {
                Ok(score) => score,
                Err(e) => {
                    warn!(
                        "excluding node {} from scoring: {e}",
                        node.metadata.name
                    );
                    continue;
                }
            };
            // Strict comparison keeps the first-encountered node on ties.
            if best.is_none_or(|(_, s)| score > s) {
                best = Some((node, score));
            }
        }
        Ok(best.map(|(node, _)| node.metadata.name.clone()))
    }

    fn feasible(&self, pod: &Pod, node: &Node, cpu_request: f64, memory_request: f64) -> bool {
        if !node.status.is_ready() {
            return false;
        }
        if node.spec.unschedulable {
            return false;
        }
        if !matches_node_selector(pod, node) {
            return false;
        }
        if !has_sufficient_resources(node, cpu_request, memory_request) {
            return false;
        }
        tolerates_taints(pod, node)
    }

    async fn pods_per_node(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for tracked in self.scheduled.read().await.values() {
            *counts.entry(tracked.node_name.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Everything this process has bound so far.
    pub async fn scheduled_pods(&self) -> HashMap<String, ScheduledPod> {
        self.scheduled.read().await.clone()
    }
}

/// Sum of container requests for the two scheduled resource dimensions.
fn pod_resource_requests(pod: &Pod) -> Result<(f64, f64), QuantityError> {
    let mut cpu = 0.0;
    let mut memory = 0.0;
    for container in &pod.spec.containers {
        if let Some(q) = container.resources.requests.get(RESOURCE_CPU) {
            cpu += parse_cpu(q)?;
        }
        if let Some(q) = container.resources.requests.get(RESOURCE_MEMORY) {
            memory += parse_memory(q)?;
        }
    }
    Ok((cpu, memory))
}

fn matches_node_selector(pod: &Pod, node: &Node) -> bool {
    pod.spec
        .node_selector
        .iter()
        .all(|(k, v)| node.metadata.labels.get(k) == Some(v))
}

/// A node without an allocatable entry for a resource is unconstrained in
/// that dimension.
fn has_sufficient_resources(node: &Node, cpu_request: f64, memory_request: f64) -> bool {
    if cpu_request > 0.0 {
        if let Some(q) = node.status.allocatable.get(RESOURCE_CPU) {
            match parse_cpu(q) {
                Ok(available) if cpu_request <= available => {}
                Ok(_) => return false,
                Err(e) => {
                    warn!("node {} has malformed allocatable cpu: {e}", node.metadata.name);
                    return false;
                }
            }
        }
    }
    if memory_request > 0.0 {
        if let Some(q) = node.status.allocatable.get(RESOURCE_MEMORY) {
            match parse_memory(q) {
                Ok(available) if memory_request <= available => {}
                Ok(_) => return false,
                Err(e) => {
                    warn!(
                        "node {} has malformed allocatable memory: {e}",
                        node.metadata.name
                    );
                    return false;
                }
            }
        }
    }
    true
}

/// Baseline policy: every pod tolerates every taint.
fn tolerates_taints(_pod: &Pod, _node: &Node) -> bool {
    true
}

/// Available cpu cores plus available memory in GiB, minus the pods this
/// process already placed on the node.
fn node_score(node: &Node, pods_per_node: &HashMap<String, usize>) -> Result<f64, QuantityError> {
    let mut score = 0.0;
    if let Some(q) = node.status.allocatable.get(RESOURCE_CPU) {
        score += parse_cpu(q)?;
    }
    if let Some(q) = node.status.allocatable.get(RESOURCE_MEMORY) {
        score += parse_memory_gib(q)?;
    }
    score -= *pods_per_node.get(&node.metadata.name).unwrap_or(&0) as f64;
    Ok(score)
}
