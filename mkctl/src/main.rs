//! Command-line client for the minik8s API server.
//!
//! Manifests may be YAML or JSON; the `kind` field picks the endpoint.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use common::{Object, ObjectList, ResourceKind, WatchEvent};
use futures::StreamExt;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Parser)]
#[command(name = "mkctl", version, about = "minik8s command-line client")]
struct Cli {
    /// API server base URL
    #[arg(long, global = true, default_value = "http://localhost:8080")]
    server: String,

    #[arg(short = 'n', long, global = true, default_value = "default")]
    namespace: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a resource from a manifest file
    Create {
        #[arg(short = 'f', long = "filename")]
        filename: PathBuf,
    },
    /// List resources, or show one in full
    Get {
        resource: String,
        name: Option<String>,
    },
    /// Delete a resource by name
    Delete { resource: String, name: String },
    /// Stream change events for a resource
    Watch { resource: String, name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    match &cli.command {
        Commands::Create { filename } => create(&cli, &client, filename).await,
        Commands::Get { resource, name } => get(&cli, &client, resource, name.as_deref()).await,
        Commands::Delete { resource, name } => delete(&cli, &client, resource, name).await,
        Commands::Watch { resource, name } => watch(&cli, &client, resource, name).await,
    }
}

fn parse_resource(arg: &str) -> Result<ResourceKind> {
    match arg.to_lowercase().as_str() {
        "pod" | "pods" => Ok(ResourceKind::Pod),
        "node" | "nodes" => Ok(ResourceKind::Node),
        "replicaset" | "replicasets" | "rs" => Ok(ResourceKind::ReplicaSet),
        "deployment" | "deployments" => Ok(ResourceKind::Deployment),
        other => bail!("unsupported resource {other:?} (try pods, nodes, replicasets, deployments)"),
    }
}

fn plural(kind: ResourceKind) -> &'static str {
    match kind {
        ResourceKind::Pod => "pods",
        ResourceKind::Node => "nodes",
        ResourceKind::ReplicaSet => "replicasets",
        ResourceKind::Deployment => "deployments",
    }
}

fn collection_url(cli: &Cli, kind: ResourceKind) -> String {
    if kind.is_namespaced() {
        format!(
            "{}/api/v1alpha1/namespaces/{}/{}",
            cli.server,
            cli.namespace,
            plural(kind)
        )
    } else {
        format!("{}/api/v1alpha1/{}", cli.server, plural(kind))
    }
}

fn item_url(cli: &Cli, kind: ResourceKind, name: &str) -> String {
    format!("{}/{}", collection_url(cli, kind), name)
}

async fn create(cli: &Cli, client: &reqwest::Client, filename: &PathBuf) -> Result<()> {
    let raw = std::fs::read_to_string(filename)
        .with_context(|| format!("failed to read {}", filename.display()))?;
    // YAML is a superset of JSON, so one parser covers both formats.
    let manifest: serde_json::Value =
        serde_yaml::from_str(&raw).context("failed to parse manifest")?;

    let kind_str = manifest
        .get("kind")
        .and_then(|k| k.as_str())
        .context("manifest is missing the kind field")?;
    let kind = ResourceKind::from_str(kind_str)?;

    let resp = client
        .post(collection_url(cli, kind))
        .json(&manifest)
        .send()
        .await
        .context("request failed")?;

    if resp.status() == reqwest::StatusCode::CREATED {
        let name = manifest
            .get("metadata")
            .and_then(|m| m.get("name"))
            .and_then(|n| n.as_str())
            .unwrap_or("<unnamed>");
        println!("{kind}/{name} created");
        Ok(())
    } else {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        bail!("create failed: {status} {body}")
    }
}

async fn get(
    cli: &Cli,
    client: &reqwest::Client,
    resource: &str,
    name: Option<&str>,
) -> Result<()> {
    let kind = parse_resource(resource)?;

    match name {
        Some(name) => {
            let resp = client.get(item_url(cli, kind, name)).send().await?;
            if !resp.status().is_success() {
                let status = resp.status();
                bail!("get failed: {status} {}", resp.text().await.unwrap_or_default());
            }
            let obj: serde_json::Value = resp.json().await?;
            println!("{}", serde_json::to_string_pretty(&obj)?);
        }
        None => {
            let resp = client.get(collection_url(cli, kind)).send().await?;
            if !resp.status().is_success() {
                let status = resp.status();
                bail!("list failed: {status} {}", resp.text().await.unwrap_or_default());
            }
            let list: ObjectList<Object> = resp.json().await?;
            if list.items.is_empty() {
                println!("No resources found");
                return Ok(());
            }
            for item in &list.items {
                println!("{}", describe(item));
            }
        }
    }
    Ok(())
}

fn describe(obj: &Object) -> String {
    match obj {
        Object::Pod(pod) => {
            let node = if pod.spec.node_name.is_empty() {
                "<none>"
            } else {
                &pod.spec.node_name
            };
            format!("{}\t{}\t{}", pod.metadata.name, pod.status.phase, node)
        }
        Object::Node(node) => {
            let status = if node.status.is_ready() {
                "Ready"
            } else {
                "NotReady"
            };
            format!("{}\t{}", node.metadata.name, status)
        }
        Object::ReplicaSet(rs) => format!(
            "{}\t{}/{}",
            rs.metadata.name, rs.status.replicas, rs.spec.replicas
        ),
        Object::Deployment(d) => format!(
            "{}\t{}/{}",
            d.metadata.name, d.status.available_replicas, d.spec.replicas
        ),
    }
}

async fn delete(cli: &Cli, client: &reqwest::Client, resource: &str, name: &str) -> Result<()> {
    let kind = parse_resource(resource)?;
    let resp = client.delete(item_url(cli, kind, name)).send().await?;
    if resp.status().is_success() {
        println!("{kind}/{name} deleted");
        Ok(())
    } else {
        let status = resp.status();
        bail!("delete failed: {status} {}", resp.text().await.unwrap_or_default())
    }
}

async fn watch(cli: &Cli, client: &reqwest::Client, resource: &str, name: &str) -> Result<()> {
    let kind = parse_resource(resource)?;
    let url = format!("{}/watch", item_url(cli, kind, name));
    let resp = client.get(url).send().await?;
    if !resp.status().is_success() {
        let status = resp.status();
        bail!("watch failed: {status} {}", resp.text().await.unwrap_or_default());
    }

    // Events arrive as newline-delimited JSON on a chunked body.
    let mut buffer = Vec::new();
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        buffer.extend_from_slice(&chunk?);
        while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=pos).collect();
            if line.len() <= 1 {
                continue;
            }
            match serde_json::from_slice::<WatchEvent>(&line) {
                Ok(event) => print_event(&event),
                Err(e) => eprintln!("skipping malformed event: {e}"),
            }
        }
    }
    Ok(())
}

fn print_event(event: &WatchEvent) {
    match &event.object {
        Some(obj) => println!("{}\t{}", event.event_type, describe(obj)),
        None => println!("{}", event.event_type),
    }
}
