//! Admission checks applied before objects reach the store.

use common::{Deployment, LabelSelector, Object, Pod, PodSpec, ReplicaSet, API_VERSION};

#[derive(Debug, thiserror::Error, PartialEq)]
#[error("{0}")]
pub struct ValidationError(pub String);

type Result = std::result::Result<(), ValidationError>;

fn invalid(msg: impl Into<String>) -> ValidationError {
    ValidationError(msg.into())
}

/// Names follow DNS-label rules: lowercase alphanumeric and `-`,
/// alphanumeric at both ends, at most 253 characters.
pub fn validate_name(name: &str) -> Result {
    if name.is_empty() {
        return Err(invalid("metadata.name must not be empty"));
    }
    if name.len() > 253 {
        return Err(invalid(format!(
            "metadata.name {name:?} exceeds 253 characters"
        )));
    }
    let valid_char = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-';
    if !name.chars().all(valid_char) {
        return Err(invalid(format!(
            "metadata.name {name:?} must be lowercase alphanumeric or '-'"
        )));
    }
    if name.starts_with('-') || name.ends_with('-') {
        return Err(invalid(format!(
            "metadata.name {name:?} must start and end with an alphanumeric character"
        )));
    }
    Ok(())
}

fn validate_type_meta(kind: &str, api_version: &str, expected_kind: &str) -> Result {
    if !kind.is_empty() && kind != expected_kind {
        return Err(invalid(format!(
            "kind {kind:?} does not match endpoint kind {expected_kind:?}"
        )));
    }
    if !api_version.is_empty() && api_version != API_VERSION {
        return Err(invalid(format!(
            "apiVersion {api_version:?} is not supported, expected {API_VERSION:?}"
        )));
    }
    Ok(())
}

fn validate_pod_spec(spec: &PodSpec, field: &str) -> Result {
    if spec.containers.is_empty() {
        return Err(invalid(format!("{field}.containers must not be empty")));
    }
    for (i, c) in spec.containers.iter().enumerate() {
        if c.name.is_empty() {
            return Err(invalid(format!("{field}.containers[{i}].name must not be empty")));
        }
        if c.image.is_empty() {
            return Err(invalid(format!(
                "{field}.containers[{i}].image must not be empty"
            )));
        }
    }
    Ok(())
}

fn validate_selector(selector: &LabelSelector) -> Result {
    if selector.is_empty() {
        return Err(invalid("spec.selector must select something"));
    }
    Ok(())
}

pub fn validate_pod(pod: &Pod) -> Result {
    validate_type_meta(&pod.kind, &pod.api_version, "Pod")?;
    validate_name(&pod.metadata.name)?;
    validate_pod_spec(&pod.spec, "spec")
}

pub fn validate_replicaset(rs: &ReplicaSet) -> Result {
    validate_type_meta(&rs.kind, &rs.api_version, "ReplicaSet")?;
    validate_name(&rs.metadata.name)?;
    if rs.spec.replicas < 0 {
        return Err(invalid("spec.replicas must not be negative"));
    }
    validate_selector(&rs.spec.selector)?;
    validate_pod_spec(&rs.spec.template.spec, "spec.template.spec")
}

pub fn validate_deployment(deploy: &Deployment) -> Result {
    validate_type_meta(&deploy.kind, &deploy.api_version, "Deployment")?;
    validate_name(&deploy.metadata.name)?;
    if deploy.spec.replicas < 0 {
        return Err(invalid("spec.replicas must not be negative"));
    }
    validate_selector(&deploy.spec.selector)?;
    validate_pod_spec(&deploy.spec.template.spec, "spec.template.spec")
}

pub fn validate(obj: &Object) -> Result {
    match obj {
        Object::Pod(pod) => validate_pod(pod),
        Object::Node(node) => {
            validate_type_meta(&node.kind, &node.api_version, "Node")?;
            validate_name(&node.metadata.name)
        }
        Object::ReplicaSet(rs) => validate_replicaset(rs),
        Object::Deployment(deploy) => validate_deployment(deploy),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{Container, ObjectMeta, PodTemplateSpec, ReplicaSetSpec};
    use std::collections::HashMap;

    fn container(name: &str, image: &str) -> Container {
        Container {
            name: name.to_string(),
            image: image.to_string(),
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
        }
    }

    #[test]
    fn names_follow_dns_label_rules() {
        assert!(validate_name("nginx-1").is_ok());
        assert!(validate_name("a").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("Nginx").is_err());
        assert!(validate_name("nginx_1").is_err());
        assert!(validate_name("-nginx").is_err());
        assert!(validate_name("nginx-").is_err());
        assert!(validate_name(&"a".repeat(254)).is_err());
    }

    #[test]
    fn pod_needs_containers_with_name_and_image() {
        let mut pod = Pod {
            api_version: API_VERSION.to_string(),
            kind: "Pod".to_string(),
            metadata: ObjectMeta {
                name: "p1".to_string(),
                namespace: "default".to_string(),
                ..Default::default()
            },
            spec: Default::default(),
            status: Default::default(),
        };
        assert!(validate_pod(&pod).is_err());

        pod.spec.containers.push(container("c", ""));
        assert!(validate_pod(&pod).is_err());

        pod.spec.containers[0].image = "nginx:1.25".to_string();
        assert!(validate_pod(&pod).is_ok());
    }

    #[test]
    fn mismatched_kind_is_rejected() {
        let pod = Pod {
            api_version: API_VERSION.to_string(),
            kind: "Node".to_string(),
            metadata: ObjectMeta {
                name: "p1".to_string(),
                ..Default::default()
            },
            spec: PodSpec {
                containers: vec![container("c", "nginx:1.25")],
                ..Default::default()
            },
            status: Default::default(),
        };
        assert!(validate_pod(&pod).is_err());
    }

    #[test]
    fn replicaset_needs_selector_and_template() {
        let mut labels = HashMap::new();
        labels.insert("app".to_string(), "web".to_string());

        let mut rs = ReplicaSet {
            api_version: API_VERSION.to_string(),
            kind: "ReplicaSet".to_string(),
            metadata: ObjectMeta {
                name: "rs1".to_string(),
                namespace: "default".to_string(),
                ..Default::default()
            },
            spec: ReplicaSetSpec {
                replicas: 3,
                selector: LabelSelector {
                    match_labels: labels,
                    match_expressions: Vec::new(),
                },
                template: PodTemplateSpec {
                    metadata: Default::default(),
                    spec: PodSpec {
                        containers: vec![container("c", "nginx:1.25")],
                        ..Default::default()
                    },
                },
            },
            status: Default::default(),
        };
        assert!(validate_replicaset(&rs).is_ok());

        rs.spec.replicas = -1;
        assert!(validate_replicaset(&rs).is_err());
        rs.spec.replicas = 0;
        assert!(validate_replicaset(&rs).is_ok());

        rs.spec.selector = Default::default();
        assert!(validate_replicaset(&rs).is_err());
    }
}
