use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

pub mod quantity;

/// API version served by the control plane.
pub const API_VERSION: &str = "v1alpha1";

/// CPU, in cores.
pub const RESOURCE_CPU: &str = "cpu";
/// Memory, in bytes.
pub const RESOURCE_MEMORY: &str = "memory";

/// A set of (resource name, quantity) pairs, e.g. `{"cpu": "500m"}`.
pub type ResourceList = BTreeMap<String, String>;

/// The object kinds the store can hold. The wire schema uses the kind
/// string as the discriminator, so every kind registered here must have a
/// matching arm in [`Object`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Pod,
    Node,
    ReplicaSet,
    Deployment,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Pod => "Pod",
            ResourceKind::Node => "Node",
            ResourceKind::ReplicaSet => "ReplicaSet",
            ResourceKind::Deployment => "Deployment",
        }
    }

    /// Cluster-scoped kinds have no namespace segment in store keys.
    pub fn is_namespaced(&self) -> bool {
        !matches!(self, ResourceKind::Node)
    }

    pub fn list_kind(&self) -> String {
        format!("{}List", self.as_str())
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown resource kind {0:?}")]
pub struct UnknownKind(pub String);

impl FromStr for ResourceKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pod" => Ok(ResourceKind::Pod),
            "Node" => Ok(ResourceKind::Node),
            "ReplicaSet" => Ok(ResourceKind::ReplicaSet),
            "Deployment" => Ok(ResourceKind::Deployment),
            other => Err(UnknownKind(other.to_string())),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,
    #[serde(
        rename = "resourceVersion",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub resource_version: String,
    #[serde(
        rename = "creationTimestamp",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub creation_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
    #[serde(
        rename = "ownerReferences",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub owner_references: Vec<OwnerReference>,
}

impl ObjectMeta {
    /// `namespace/name` key used by controller caches and schedulers.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// One-way annotation naming an owning object. Deleting the owner does not
/// delete the objects that reference it.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct OwnerReference {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: ResourceKind,
    pub name: String,
    pub uid: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Container {
    pub name: String,
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(rename = "workingDir", default, skip_serializing_if = "String::is_empty")]
    pub working_dir: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<ContainerPort>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    #[serde(default, skip_serializing_if = "ResourceRequirements::is_empty")]
    pub resources: ResourceRequirements,
    #[serde(rename = "volumeMounts", default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMount>,
    #[serde(rename = "livenessProbe", default, skip_serializing_if = "Option::is_none")]
    pub liveness_probe: Option<Probe>,
    #[serde(
        rename = "readinessProbe",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub readiness_probe: Option<Probe>,
    #[serde(
        rename = "imagePullPolicy",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub image_pull_policy: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct ResourceRequirements {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub limits: ResourceList,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: ResourceList,
}

impl ResourceRequirements {
    pub fn is_empty(&self) -> bool {
        self.limits.is_empty() && self.requests.is_empty()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ContainerPort {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(rename = "hostPort", default, skip_serializing_if = "is_zero_i32")]
    pub host_port: i32,
    #[serde(rename = "containerPort")]
    pub container_port: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub protocol: String,
    #[serde(rename = "hostIP", default, skip_serializing_if = "String::is_empty")]
    pub host_ip: String,
}

fn is_zero_i32(v: &i32) -> bool {
    *v == 0
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct EnvVar {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct VolumeMount {
    pub name: String,
    #[serde(rename = "readOnly", default, skip_serializing_if = "std::ops::Not::not")]
    pub read_only: bool,
    #[serde(rename = "mountPath")]
    pub mount_path: String,
}

/// A health check. Exactly one of the actions is expected to be set.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct Probe {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec: Option<ExecAction>,
    #[serde(rename = "httpGet", default, skip_serializing_if = "Option::is_none")]
    pub http_get: Option<HttpGetAction>,
    #[serde(rename = "tcpSocket", default, skip_serializing_if = "Option::is_none")]
    pub tcp_socket: Option<TcpSocketAction>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ExecAction {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct HttpGetAction {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    pub port: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub scheme: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TcpSocketAction {
    pub port: i32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Volume {
    pub name: String,
    #[serde(rename = "volumeSource", default)]
    pub volume_source: VolumeSource,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct VolumeSource {
    #[serde(rename = "hostPath", default, skip_serializing_if = "Option::is_none")]
    pub host_path: Option<HostPathVolumeSource>,
    #[serde(rename = "emptyDir", default, skip_serializing_if = "Option::is_none")]
    pub empty_dir: Option<EmptyDirVolumeSource>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct HostPathVolumeSource {
    pub path: String,
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub path_type: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct EmptyDirVolumeSource {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub medium: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct PodSpec {
    #[serde(default)]
    pub containers: Vec<Container>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
    /// Empty means the pod is not yet bound to a node.
    #[serde(rename = "nodeName", default, skip_serializing_if = "String::is_empty")]
    pub node_name: String,
    #[serde(
        rename = "nodeSelector",
        default,
        skip_serializing_if = "HashMap::is_empty"
    )]
    pub node_selector: HashMap<String, String>,
    #[serde(
        rename = "restartPolicy",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub restart_policy: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PodPhase {
    #[default]
    Pending,
    Scheduled,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl fmt::Display for PodPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PodPhase::Pending => "Pending",
            PodPhase::Scheduled => "Scheduled",
            PodPhase::Running => "Running",
            PodPhase::Succeeded => "Succeeded",
            PodPhase::Failed => "Failed",
            PodPhase::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct PodStatus {
    #[serde(default)]
    pub phase: PodPhase,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<PodCondition>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(rename = "hostIP", default, skip_serializing_if = "String::is_empty")]
    pub host_ip: String,
    #[serde(rename = "podIP", default, skip_serializing_if = "String::is_empty")]
    pub pod_ip: String,
    #[serde(rename = "startTime", default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(
        rename = "containerStatuses",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub container_statuses: Vec<ContainerStatus>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PodCondition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: String,
    #[serde(
        rename = "lastTransitionTime",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub last_transition_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ContainerStatus {
    pub name: String,
    #[serde(default)]
    pub state: ContainerState,
    #[serde(default)]
    pub ready: bool,
    #[serde(rename = "restartCount", default)]
    pub restart_count: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,
    #[serde(rename = "imageID", default, skip_serializing_if = "String::is_empty")]
    pub image_id: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct ContainerState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waiting: Option<ContainerStateWaiting>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running: Option<ContainerStateRunning>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminated: Option<ContainerStateTerminated>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct ContainerStateWaiting {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ContainerStateRunning {
    #[serde(rename = "startedAt", default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ContainerStateTerminated {
    #[serde(rename = "exitCode")]
    pub exit_code: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(rename = "finishedAt", default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// The unit of scheduling and execution.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Pod {
    #[serde(rename = "apiVersion", default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: PodSpec,
    #[serde(default)]
    pub status: PodStatus,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct NodeSpec {
    #[serde(rename = "podCIDR", default, skip_serializing_if = "String::is_empty")]
    pub pod_cidr: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub unschedulable: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub taints: Vec<Taint>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Taint {
    pub key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,
    pub effect: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct Toleration {
    /// Empty matches every taint key.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub operator: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,
    /// Empty matches every effect.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub effect: String,
}

impl Toleration {
    pub fn tolerates(&self, taint: &Taint) -> bool {
        if !self.effect.is_empty() && self.effect != taint.effect {
            return false;
        }
        if !self.key.is_empty() && self.key != taint.key {
            return false;
        }
        match self.operator.as_str() {
            "Exists" => true,
            _ => self.value == taint.value,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct NodeStatus {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub capacity: ResourceList,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub allocatable: ResourceList,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<NodeCondition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<NodeAddress>,
    #[serde(rename = "nodeInfo", default)]
    pub node_info: NodeSystemInfo,
}

impl NodeStatus {
    /// Ready means a `Ready` condition with status `True`.
    pub fn is_ready(&self) -> bool {
        self.conditions
            .iter()
            .any(|c| c.condition_type == "Ready" && c.status == "True")
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct NodeCondition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: String,
    #[serde(
        rename = "lastHeartbeatTime",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub last_heartbeat_time: Option<DateTime<Utc>>,
    #[serde(
        rename = "lastTransitionTime",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub last_transition_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct NodeAddress {
    #[serde(rename = "type")]
    pub address_type: String,
    pub address: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct NodeSystemInfo {
    #[serde(rename = "machineID", default)]
    pub machine_id: String,
    #[serde(rename = "kernelVersion", default)]
    pub kernel_version: String,
    #[serde(rename = "osImage", default)]
    pub os_image: String,
    #[serde(rename = "containerRuntimeVersion", default)]
    pub container_runtime_version: String,
    #[serde(rename = "operatingSystem", default)]
    pub operating_system: String,
    #[serde(default)]
    pub architecture: String,
}

/// A participating compute host. Cluster-scoped.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Node {
    #[serde(rename = "apiVersion", default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: NodeSpec,
    #[serde(default)]
    pub status: NodeStatus,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct LabelSelector {
    #[serde(rename = "matchLabels", default, skip_serializing_if = "HashMap::is_empty")]
    pub match_labels: HashMap<String, String>,
    #[serde(
        rename = "matchExpressions",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub match_expressions: Vec<LabelSelectorRequirement>,
}

impl LabelSelector {
    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty() && self.match_expressions.is_empty()
    }

    /// True when every matchLabels pair and every matchExpressions
    /// requirement holds against the given label set.
    pub fn matches(&self, labels: &HashMap<String, String>) -> bool {
        for (k, v) in self.match_labels.iter() {
            match labels.get(k) {
                Some(val) if val == v => (),
                _ => return false,
            }
        }

        for expr in self.match_expressions.iter() {
            match expr.operator {
                LabelSelectorOperator::In => {
                    let v = labels.get(&expr.key);
                    if v.is_none() || !expr.values.contains(v.unwrap()) {
                        return false;
                    }
                }
                LabelSelectorOperator::NotIn => {
                    if let Some(v) = labels.get(&expr.key) {
                        if expr.values.contains(v) {
                            return false;
                        }
                    }
                }
                LabelSelectorOperator::Exists => {
                    if !labels.contains_key(&expr.key) {
                        return false;
                    }
                }
                LabelSelectorOperator::DoesNotExist => {
                    if labels.contains_key(&expr.key) {
                        return false;
                    }
                }
            }
        }

        true
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct LabelSelectorRequirement {
    pub key: String,
    pub operator: LabelSelectorOperator,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum LabelSelectorOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct PodTemplateSpec {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: PodSpec,
}

impl PodTemplateSpec {
    /// The image of the first container; used to tell templates apart.
    pub fn primary_image(&self) -> Option<&str> {
        self.spec.containers.first().map(|c| c.image.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct ReplicaSetSpec {
    #[serde(default)]
    pub replicas: i32,
    #[serde(default)]
    pub selector: LabelSelector,
    #[serde(default)]
    pub template: PodTemplateSpec,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct ReplicaSetStatus {
    #[serde(default)]
    pub replicas: i32,
    #[serde(rename = "fullyLabeledReplicas", default)]
    pub fully_labeled_replicas: i32,
    #[serde(rename = "readyReplicas", default)]
    pub ready_replicas: i32,
    #[serde(rename = "availableReplicas", default)]
    pub available_replicas: i32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ReplicaSet {
    #[serde(rename = "apiVersion", default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: ReplicaSetSpec,
    #[serde(default)]
    pub status: ReplicaSetStatus,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct DeploymentSpec {
    #[serde(default)]
    pub replicas: i32,
    #[serde(default)]
    pub selector: LabelSelector,
    #[serde(default)]
    pub template: PodTemplateSpec,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct DeploymentStatus {
    #[serde(default)]
    pub replicas: i32,
    #[serde(rename = "updatedReplicas", default)]
    pub updated_replicas: i32,
    #[serde(rename = "availableReplicas", default)]
    pub available_replicas: i32,
    #[serde(rename = "unavailableReplicas", default)]
    pub unavailable_replicas: i32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Deployment {
    #[serde(rename = "apiVersion", default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: DeploymentSpec,
    #[serde(default)]
    pub status: DeploymentStatus,
}

/// Tagged union over every persistable kind. Encoding delegates to the
/// inner value; decoding dispatches on the `kind` field.
#[derive(Debug, Clone, PartialEq)]
pub enum Object {
    Pod(Pod),
    Node(Node),
    ReplicaSet(ReplicaSet),
    Deployment(Deployment),
}

impl Object {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Object::Pod(_) => ResourceKind::Pod,
            Object::Node(_) => ResourceKind::Node,
            Object::ReplicaSet(_) => ResourceKind::ReplicaSet,
            Object::Deployment(_) => ResourceKind::Deployment,
        }
    }

    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            Object::Pod(p) => &p.metadata,
            Object::Node(n) => &n.metadata,
            Object::ReplicaSet(r) => &r.metadata,
            Object::Deployment(d) => &d.metadata,
        }
    }

    pub fn metadata_mut(&mut self) -> &mut ObjectMeta {
        match self {
            Object::Pod(p) => &mut p.metadata,
            Object::Node(n) => &mut n.metadata,
            Object::ReplicaSet(r) => &mut r.metadata,
            Object::Deployment(d) => &mut d.metadata,
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata().name
    }

    pub fn namespace(&self) -> &str {
        &self.metadata().namespace
    }

    pub fn as_pod(&self) -> Option<&Pod> {
        match self {
            Object::Pod(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_node(&self) -> Option<&Node> {
        match self {
            Object::Node(n) => Some(n),
            _ => None,
        }
    }

    pub fn into_pod(self) -> Option<Pod> {
        match self {
            Object::Pod(p) => Some(p),
            _ => None,
        }
    }

    pub fn into_node(self) -> Option<Node> {
        match self {
            Object::Node(n) => Some(n),
            _ => None,
        }
    }

    pub fn into_replicaset(self) -> Option<ReplicaSet> {
        match self {
            Object::ReplicaSet(r) => Some(r),
            _ => None,
        }
    }

    pub fn into_deployment(self) -> Option<Deployment> {
        match self {
            Object::Deployment(d) => Some(d),
            _ => None,
        }
    }

    /// Decode a JSON document into the kind named by the key it was stored
    /// under, ignoring any conflicting `kind` field in the body.
    pub fn decode(kind: ResourceKind, data: &[u8]) -> Result<Object, serde_json::Error> {
        Ok(match kind {
            ResourceKind::Pod => Object::Pod(serde_json::from_slice(data)?),
            ResourceKind::Node => Object::Node(serde_json::from_slice(data)?),
            ResourceKind::ReplicaSet => Object::ReplicaSet(serde_json::from_slice(data)?),
            ResourceKind::Deployment => Object::Deployment(serde_json::from_slice(data)?),
        })
    }

    /// A placeholder carrying only identity, for delete notifications where
    /// the full body is no longer available.
    pub fn tombstone(kind: ResourceKind, namespace: &str, name: &str) -> Object {
        let metadata = ObjectMeta {
            name: name.to_string(),
            namespace: namespace.to_string(),
            ..Default::default()
        };
        match kind {
            ResourceKind::Pod => Object::Pod(Pod {
                api_version: API_VERSION.to_string(),
                kind: kind.as_str().to_string(),
                metadata,
                spec: Default::default(),
                status: Default::default(),
            }),
            ResourceKind::Node => Object::Node(Node {
                api_version: API_VERSION.to_string(),
                kind: kind.as_str().to_string(),
                metadata,
                spec: Default::default(),
                status: Default::default(),
            }),
            ResourceKind::ReplicaSet => Object::ReplicaSet(ReplicaSet {
                api_version: API_VERSION.to_string(),
                kind: kind.as_str().to_string(),
                metadata,
                spec: Default::default(),
                status: Default::default(),
            }),
            ResourceKind::Deployment => Object::Deployment(Deployment {
                api_version: API_VERSION.to_string(),
                kind: kind.as_str().to_string(),
                metadata,
                spec: Default::default(),
                status: Default::default(),
            }),
        }
    }
}

impl From<Pod> for Object {
    fn from(p: Pod) -> Self {
        Object::Pod(p)
    }
}

impl From<Node> for Object {
    fn from(n: Node) -> Self {
        Object::Node(n)
    }
}

impl From<ReplicaSet> for Object {
    fn from(r: ReplicaSet) -> Self {
        Object::ReplicaSet(r)
    }
}

impl From<Deployment> for Object {
    fn from(d: Deployment) -> Self {
        Object::Deployment(d)
    }
}

impl Serialize for Object {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Object::Pod(p) => p.serialize(serializer),
            Object::Node(n) => n.serialize(serializer),
            Object::ReplicaSet(r) => r.serialize(serializer),
            Object::Deployment(d) => d.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Object {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        let kind = value
            .get("kind")
            .and_then(|k| k.as_str())
            .ok_or_else(|| D::Error::missing_field("kind"))?;
        let kind: ResourceKind = kind.parse().map_err(D::Error::custom)?;
        match kind {
            ResourceKind::Pod => serde_json::from_value(value).map(Object::Pod),
            ResourceKind::Node => serde_json::from_value(value).map(Object::Node),
            ResourceKind::ReplicaSet => serde_json::from_value(value).map(Object::ReplicaSet),
            ResourceKind::Deployment => serde_json::from_value(value).map(Object::Deployment),
        }
        .map_err(D::Error::custom)
    }
}

/// The change-feed event types delivered to watchers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Added,
    Modified,
    Deleted,
    Error,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventType::Added => "ADDED",
            EventType::Modified => "MODIFIED",
            EventType::Deleted => "DELETED",
            EventType::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// A single watch event as carried on the wire: one JSON object per line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatchEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<Object>,
}

impl WatchEvent {
    pub fn new(event_type: EventType, object: Object) -> Self {
        Self {
            event_type,
            object: Some(object),
        }
    }

    pub fn error() -> Self {
        Self {
            event_type: EventType::Error,
            object: None,
        }
    }
}

/// List envelope returned by collection endpoints:
/// `{"apiVersion": ..., "kind": "PodList", "items": [...]}`.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ObjectList<T> {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
}

impl<T> ObjectList<T> {
    pub fn new(kind: ResourceKind, items: Vec<T>) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: kind.list_kind(),
            items,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_pod() -> Pod {
        Pod {
            api_version: API_VERSION.to_string(),
            kind: "Pod".to_string(),
            metadata: ObjectMeta {
                name: "nginx-1".to_string(),
                namespace: "default".to_string(),
                ..Default::default()
            },
            spec: PodSpec {
                containers: vec![Container {
                    name: "web".to_string(),
                    image: "nginx:1.25".to_string(),
                    command: Vec::new(),
                    args: Vec::new(),
                    working_dir: String::new(),
                    ports: Vec::new(),
                    env: Vec::new(),
                    resources: Default::default(),
                    volume_mounts: Vec::new(),
                    liveness_probe: None,
                    readiness_probe: None,
                    image_pull_policy: String::new(),
                }],
                ..Default::default()
            },
            status: Default::default(),
        }
    }

    #[test]
    fn object_decode_dispatches_on_kind() {
        let pod = sample_pod();
        let data = serde_json::to_vec(&pod).unwrap();

        let obj: Object = serde_json::from_slice(&data).unwrap();
        assert_eq!(obj.kind(), ResourceKind::Pod);
        assert_eq!(obj.name(), "nginx-1");
        assert_eq!(obj.into_pod().unwrap(), pod);
    }

    #[test]
    fn object_decode_rejects_unknown_kind() {
        let data = br#"{"kind": "Widget", "apiVersion": "v1alpha1", "metadata": {"name": "x"}}"#;
        assert!(serde_json::from_slice::<Object>(data).is_err());
    }

    #[test]
    fn pod_survives_json_round_trip() {
        let mut pod = sample_pod();
        pod.spec.node_selector
            .insert("zone".to_string(), "us-east-1".to_string());
        pod.status.phase = PodPhase::Scheduled;

        let data = serde_json::to_string(&pod).unwrap();
        let back: Pod = serde_json::from_str(&data).unwrap();
        assert_eq!(back, pod);
    }

    #[test]
    fn empty_node_name_is_omitted_from_wire() {
        let pod = sample_pod();
        let value = serde_json::to_value(&pod).unwrap();
        assert!(value["spec"].get("nodeName").is_none());
    }

    #[test]
    fn watch_event_wire_shape() {
        let ev = WatchEvent::new(EventType::Added, Object::Pod(sample_pod()));
        let value = serde_json::to_value(&ev).unwrap();
        assert_eq!(value["type"], "ADDED");
        assert_eq!(value["object"]["metadata"]["name"], "nginx-1");

        let back: WatchEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back.event_type, EventType::Added);
    }

    #[test]
    fn selector_matches_labels_and_expressions() {
        let mut labels = HashMap::new();
        labels.insert("app".to_string(), "nginx".to_string());
        labels.insert("tier".to_string(), "frontend".to_string());

        let mut sel = LabelSelector::default();
        sel.match_labels
            .insert("app".to_string(), "nginx".to_string());
        assert!(sel.matches(&labels));

        sel.match_expressions.push(LabelSelectorRequirement {
            key: "tier".to_string(),
            operator: LabelSelectorOperator::In,
            values: vec!["frontend".to_string(), "backend".to_string()],
        });
        assert!(sel.matches(&labels));

        sel.match_expressions.push(LabelSelectorRequirement {
            key: "env".to_string(),
            operator: LabelSelectorOperator::DoesNotExist,
            values: Vec::new(),
        });
        assert!(sel.matches(&labels));

        sel.match_labels
            .insert("app".to_string(), "apache".to_string());
        assert!(!sel.matches(&labels));
    }

    #[test]
    fn toleration_matching() {
        let taint = Taint {
            key: "node.kubernetes.io/not-ready".to_string(),
            value: String::new(),
            effect: "NoExecute".to_string(),
        };

        let any = Toleration {
            operator: "Exists".to_string(),
            ..Default::default()
        };
        assert!(any.tolerates(&taint));

        let wrong_effect = Toleration {
            operator: "Exists".to_string(),
            effect: "NoSchedule".to_string(),
            ..Default::default()
        };
        assert!(!wrong_effect.tolerates(&taint));
    }
}
