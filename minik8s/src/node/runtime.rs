//! Collaborator traits the node agent drives: the container runtime,
//! network plugin and volume driver are opaque to the control core. Mock
//! implementations back the agent's tests.

use anyhow::Result;
use async_trait::async_trait;
use common::{Container, NodeSystemInfo, Pod, ResourceList, Volume};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn pull_image(&self, image: &str) -> Result<()>;

    /// Create a container for the pod; returns the runtime's container id.
    async fn create_container(&self, pod: &Pod, container: &Container) -> Result<String>;

    async fn start_container(&self, container_id: &str) -> Result<()>;

    async fn stop_container(&self, container_id: &str) -> Result<()>;

    async fn remove_container(&self, container_id: &str) -> Result<()>;

    /// Total resources of the host this runtime manages.
    fn node_capacity(&self) -> ResourceList;

    fn node_info(&self) -> NodeSystemInfo;
}

#[async_trait]
pub trait NetworkManager: Send + Sync {
    /// Wire the pod into the node's network; returns the pod IP.
    async fn setup_pod_network(&self, pod: &Pod) -> Result<String>;

    async fn teardown_pod_network(&self, pod_key: &str) -> Result<()>;
}

#[async_trait]
pub trait VolumeManager: Send + Sync {
    /// Prepare the volume on the host; returns the mount path.
    async fn mount_volume(&self, pod: &Pod, volume: &Volume) -> Result<String>;

    async fn unmount_volume(&self, pod_key: &str, volume_name: &str) -> Result<()>;
}

/// In-memory runtime standing in for a container engine.
#[derive(Default)]
pub struct MockRuntime {
    next_id: AtomicU64,
    pub running: Mutex<HashSet<String>>,
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn pull_image(&self, _image: &str) -> Result<()> {
        Ok(())
    }

    async fn create_container(&self, pod: &Pod, container: &Container) -> Result<String> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        Ok(format!("{}-{}-{id}", pod.metadata.name, container.name))
    }

    async fn start_container(&self, container_id: &str) -> Result<()> {
        self.running
            .lock()
            .expect("runtime state poisoned")
            .insert(container_id.to_string());
        Ok(())
    }

    async fn stop_container(&self, container_id: &str) -> Result<()> {
        self.running
            .lock()
            .expect("runtime state poisoned")
            .remove(container_id);
        Ok(())
    }

    async fn remove_container(&self, _container_id: &str) -> Result<()> {
        Ok(())
    }

    fn node_capacity(&self) -> ResourceList {
        let mut capacity = ResourceList::new();
        capacity.insert(common::RESOURCE_CPU.to_string(), "4".to_string());
        capacity.insert(common::RESOURCE_MEMORY.to_string(), "8Gi".to_string());
        capacity
    }

    fn node_info(&self) -> NodeSystemInfo {
        NodeSystemInfo {
            machine_id: "mock".to_string(),
            kernel_version: "0.0.0".to_string(),
            os_image: "mock".to_string(),
            container_runtime_version: "mock://0.1".to_string(),
            operating_system: "linux".to_string(),
            architecture: std::env::consts::ARCH.to_string(),
        }
    }
}

#[derive(Default)]
pub struct MockNetwork;

#[async_trait]
impl NetworkManager for MockNetwork {
    async fn setup_pod_network(&self, _pod: &Pod) -> Result<String> {
        Ok("10.244.0.10".to_string())
    }

    async fn teardown_pod_network(&self, _pod_key: &str) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct MockVolumes;

#[async_trait]
impl VolumeManager for MockVolumes {
    async fn mount_volume(&self, _pod: &Pod, volume: &Volume) -> Result<String> {
        Ok(format!("/var/lib/minik8s/volumes/{}", volume.name))
    }

    async fn unmount_volume(&self, _pod_key: &str, _volume_name: &str) -> Result<()> {
        Ok(())
    }
}
