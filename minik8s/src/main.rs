use anyhow::Result;
use clap::Parser;
use log::info;
use minik8s::api;
use minik8s::cli::{AgentArgs, Cli, Commands, ServeArgs};
use minik8s::controllers::{ControllerManager, DeploymentController, ReplicaSetController};
use minik8s::node::runtime::{MockNetwork, MockRuntime, MockVolumes};
use minik8s::node::{Agent, AgentConfig};
use minik8s::scheduler::Scheduler;
use minik8s::store::new_store;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown requested");
                shutdown.cancel();
            }
        });
    }

    match cli.command {
        Commands::Serve(args) => serve(args, shutdown).await,
        Commands::Agent(args) => agent(args, shutdown).await,
    }
}

async fn serve(args: ServeArgs, shutdown: CancellationToken) -> Result<()> {
    let store = new_store(&args.store.store_config()?).await?;

    let manager = Arc::new(ControllerManager::new(Duration::from_secs(
        args.sync_interval,
    )));
    manager
        .add_controller(Arc::new(ReplicaSetController::new(store.clone())))
        .await;
    manager
        .add_controller(Arc::new(DeploymentController::new(store.clone())))
        .await;
    manager.start(shutdown.child_token()).await?;

    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        Duration::from_secs(args.schedule_interval),
    ));
    scheduler.run(shutdown.child_token());

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    api::serve(addr, store.clone(), shutdown.clone()).await?;

    manager.stop().await;
    store.close().await;
    Ok(())
}

async fn agent(args: AgentArgs, shutdown: CancellationToken) -> Result<()> {
    let store = new_store(&args.store.store_config()?).await?;

    let agent = Agent::new(
        AgentConfig {
            node_name: args.node_name,
            host_ip: args.host_ip,
            heartbeat_interval: Duration::from_secs(args.heartbeat_interval),
        },
        store.clone(),
        Arc::new(MockRuntime::default()),
        Arc::new(MockNetwork),
        Arc::new(MockVolumes),
    );
    agent.start(shutdown.child_token()).await?;

    shutdown.cancelled().await;
    store.close().await;
    Ok(())
}
