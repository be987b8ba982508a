use crate::store::{Options, StoreConfig, StoreType};
use anyhow::Result;
use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "minik8s", version, about = "minik8s control-plane daemon")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the API server, controller manager and scheduler
    Serve(ServeArgs),
    /// Run a node agent against the mock runtime collaborators
    Agent(AgentArgs),
}

#[derive(Args)]
pub struct StoreArgs {
    /// Store backend: memory or etcd
    #[arg(long = "store", env = "MINIK8S_STORE_TYPE", default_value = "memory")]
    pub store: String,

    /// Comma-separated etcd endpoint list
    #[arg(
        long = "etcd-endpoints",
        env = "MINIK8S_ETCD_ENDPOINTS",
        default_value = "localhost:2379",
        value_delimiter = ','
    )]
    pub etcd_endpoints: Vec<String>,

    /// Key prefix in the external backend
    #[arg(
        long = "store-prefix",
        env = "MINIK8S_STORE_PREFIX",
        default_value = "/minik8s"
    )]
    pub store_prefix: String,

    /// Degrade to the in-memory store when etcd is unreachable at startup
    #[arg(
        long = "enable-fallback",
        env = "MINIK8S_ENABLE_FALLBACK",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub enable_fallback: bool,
}

impl StoreArgs {
    pub fn store_config(&self) -> Result<StoreConfig> {
        Ok(StoreConfig {
            store_type: self.store.parse::<StoreType>()?,
            endpoints: self.etcd_endpoints.clone(),
            prefix: self.store_prefix.clone(),
            enable_fallback: self.enable_fallback,
            options: Options::default(),
        })
    }
}

#[derive(Args)]
pub struct ServeArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// API listen port
    #[arg(long, env = "MINIK8S_PORT", default_value_t = 8080)]
    pub port: u16,

    /// Controller-manager tick, in seconds
    #[arg(long = "sync-interval", default_value_t = 30)]
    pub sync_interval: u64,

    /// Scheduler tick, in seconds
    #[arg(long = "schedule-interval", default_value_t = 10)]
    pub schedule_interval: u64,
}

#[derive(Args)]
pub struct AgentArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Name this node registers under
    #[arg(long = "node-name")]
    pub node_name: String,

    /// Address advertised for this node
    #[arg(long = "host-ip", default_value = "127.0.0.1")]
    pub host_ip: String,

    /// Node-status heartbeat cadence, in seconds
    #[arg(long = "heartbeat-interval", default_value_t = 30)]
    pub heartbeat_interval: u64,
}
