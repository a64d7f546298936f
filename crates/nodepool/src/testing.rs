//! In-memory [`NodePoolApi`] for exercising the lifecycle logic without an API server.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Mutex,
};

use async_trait::async_trait;
use tokio::time::Instant;

use crate::{
    ApiError,
    api::{Eviction, NodeSelector, NodeSnapshot, PodSnapshot, ReadyCondition},
    nodes::NodePoolApi,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    ListNodes,
    Cordon(String),
    ListPods(String),
    Evict(String),
}

#[derive(Default)]
struct State {
    /// Successive `list_nodes` answers; the last one repeats.
    node_lists: VecDeque<Vec<NodeSnapshot>>,
    list_nodes_fails: bool,
    cordon_fails: HashSet<String>,
    cordoned: HashSet<String>,
    pods: HashMap<String, Vec<PodSnapshot>>,
    /// Eviction accepted but the pod never terminates.
    stuck: HashSet<String>,
    /// Eviction refused this many more times.
    blocked: HashMap<String, u32>,
    evict_fails: HashSet<String>,
    /// Deleted by someone else just before the eviction request arrives.
    vanishing: HashSet<String>,
    calls: Vec<(Instant, Call)>,
}

#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<State>,
}

pub fn ready(name: &str) -> NodeSnapshot {
    NodeSnapshot::new(name, Some(ReadyCondition::True))
}

pub fn not_ready(name: &str) -> NodeSnapshot {
    NodeSnapshot::new(name, Some(ReadyCondition::False))
}

impl FakeCluster {
    pub fn with_nodes(nodes: Vec<NodeSnapshot>) -> Self {
        let fake = Self::default();
        fake.push_node_list(nodes);
        fake
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn push_node_list(&self, nodes: Vec<NodeSnapshot>) {
        self.state().node_lists.push_back(nodes);
    }

    pub fn fail_list_nodes(&self) {
        self.state().list_nodes_fails = true;
    }

    pub fn fail_cordon(&self, node: &str) {
        self.state().cordon_fails.insert(node.to_string());
    }

    pub fn add_pod(&self, node: &str, pod: PodSnapshot) {
        self.state()
            .pods
            .entry(node.to_string())
            .or_default()
            .push(pod);
    }

    pub fn make_stuck(&self, pod: &str) {
        self.state().stuck.insert(pod.to_string());
    }

    pub fn block_eviction(&self, pod: &str, times: u32) {
        self.state().blocked.insert(pod.to_string(), times);
    }

    pub fn fail_eviction(&self, pod: &str) {
        self.state().evict_fails.insert(pod.to_string());
    }

    pub fn delete_before_eviction(&self, pod: &str) {
        self.state().vanishing.insert(pod.to_string());
    }

    pub fn is_cordoned(&self, node: &str) -> bool {
        self.state().cordoned.contains(node)
    }

    pub fn pods_on(&self, node: &str) -> Vec<String> {
        self.state()
            .pods
            .get(node)
            .map(|pods| pods.iter().map(PodSnapshot::key).collect())
            .unwrap_or_default()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.iter().map(|(_, c)| c.clone()).collect()
    }

    pub fn timed_calls(&self) -> Vec<(Instant, Call)> {
        self.state().calls.clone()
    }

    fn record(state: &mut State, call: Call) {
        state.calls.push((Instant::now(), call));
    }
}

#[async_trait]
impl NodePoolApi for FakeCluster {
    async fn list_nodes(&self, _selector: &NodeSelector) -> Result<Vec<NodeSnapshot>, ApiError> {
        let mut state = self.state();
        Self::record(&mut state, Call::ListNodes);

        if state.list_nodes_fails {
            return Err("forbidden: cannot list nodes".into());
        }
        let nodes = if state.node_lists.len() > 1 {
            state.node_lists.pop_front().unwrap_or_default()
        } else {
            state.node_lists.front().cloned().unwrap_or_default()
        };
        Ok(nodes)
    }

    async fn cordon_node(&self, node: &str) -> Result<(), ApiError> {
        let mut state = self.state();
        Self::record(&mut state, Call::Cordon(node.to_string()));

        if state.cordon_fails.contains(node) {
            return Err(format!("nodes {node:?} is forbidden").into());
        }
        state.cordoned.insert(node.to_string());
        Ok(())
    }

    async fn list_pods_on_node(&self, node: &str) -> Result<Vec<PodSnapshot>, ApiError> {
        let mut state = self.state();
        Self::record(&mut state, Call::ListPods(node.to_string()));
        Ok(state.pods.get(node).cloned().unwrap_or_default())
    }

    async fn evict_pod(&self, pod: &PodSnapshot) -> Result<Eviction, ApiError> {
        let mut state = self.state();
        let key = pod.key();
        Self::record(&mut state, Call::Evict(key.clone()));

        if state.evict_fails.contains(&key) {
            return Err(format!("pods {key:?} is forbidden").into());
        }
        if let Some(remaining) = state.blocked.get_mut(&key)
            && *remaining > 0
        {
            *remaining -= 1;
            return Ok(Eviction::Blocked(
                "Cannot evict pod as it would violate the pod's disruption budget.".to_string(),
            ));
        }
        if state.vanishing.remove(&key) {
            for pods in state.pods.values_mut() {
                pods.retain(|p| p.key() != key);
            }
        }

        let exists = state
            .pods
            .values()
            .any(|pods| pods.iter().any(|p| p.key() == key));
        if !exists {
            return Ok(Eviction::AlreadyGone);
        }
        if !state.stuck.contains(&key) {
            for pods in state.pods.values_mut() {
                pods.retain(|p| p.key() != key);
            }
        }
        Ok(Eviction::Accepted)
    }

    async fn pod_is_gone(&self, pod: &PodSnapshot) -> Result<bool, ApiError> {
        let key = pod.key();
        Ok(!self
            .state()
            .pods
            .values()
            .any(|pods| pods.iter().any(|p| p.key() == key)))
    }
}
