//! `cohort simulate`
//!
//! Runs every configured HA service on N in-process nodes, then repeatedly
//! takes the current master of the first service out of the partition and
//! brings it back, recording who holds each master replica after every step.

use anyhow::{bail, Result};
use clap::Args;
use cohort_core::{CohortConfig, Payload, PartitionConfig};
use cohort_partition::{LocalFabric, LocalPartition};
use cohort_service::{
    HaService, HaServiceHandler, PartitionDirectory, PartitionServices, ReplicantSnapshot,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const DEMO_SERVICE: &str = "demo";

/// Simulate membership churn on an in-process partition.
#[derive(Args)]
pub struct SimulateCommand {
    /// Number of nodes in the partition
    #[arg(short, long, default_value = "3")]
    pub nodes: usize,

    /// Churn rounds; in each the current master leaves and rejoins
    #[arg(short, long, default_value = "2")]
    pub rounds: usize,

    /// Milliseconds to wait for each membership change to propagate
    #[arg(long, default_value = "50")]
    pub settle_ms: u64,

    /// Print transitions as JSON
    #[arg(long)]
    pub json: bool,
}

/// Master replica of one service after one simulation step.
#[derive(Debug, Clone, Serialize)]
pub struct Transition {
    /// What just happened
    pub step: String,
    /// Service name
    pub service: String,
    /// Node holding the master replica, if any
    pub master: Option<String>,
    /// Replicant view id as seen by the master
    pub view_id: u64,
    /// Number of replicants as seen by the master
    pub replicants: usize,
}

/// Handle simulate command execution
pub async fn handle_simulate_command(cmd: &SimulateCommand, config: &CohortConfig) -> Result<()> {
    let transitions = run(cmd, config).await?;
    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&transitions)?);
    } else {
        for t in &transitions {
            println!(
                "{:<28} {:<12} master={:<8} view={:<4} replicants={}",
                t.step,
                t.service,
                t.master.as_deref().unwrap_or("-"),
                t.view_id,
                t.replicants
            );
        }
    }
    Ok(())
}

/// Service that contributes its node name as token and logs topology changes.
struct Demo {
    node: String,
}

impl HaServiceHandler for Demo {
    fn replicant_token(&self) -> Payload {
        Payload::from_bytes(self.node.as_bytes().to_vec())
    }

    fn replicants_changed(&self, snapshot: &ReplicantSnapshot) {
        info!(
            node = %self.node,
            service = %snapshot.service,
            view = %snapshot.view_id,
            master = ?snapshot.master().map(ToString::to_string),
            "replicants changed"
        );
    }
}

struct SimNode {
    name: String,
    partition: Arc<LocalPartition>,
    services: PartitionServices,
    instances: Vec<HaService<Demo>>,
}

impl SimNode {
    async fn start(
        fabric: &LocalFabric,
        name: String,
        config: &PartitionConfig,
        service_names: &[String],
    ) -> Result<Self> {
        let partition = fabric.join(name.clone(), config.clone())?;
        let services = PartitionServices::start(partition.clone(), config).await?;
        let directory = PartitionDirectory::new();
        directory.register(services.clone());

        let mut instances = Vec::with_capacity(service_names.len());
        for service in service_names {
            let instance = HaService::create(
                service.clone(),
                Demo { node: name.clone() },
                directory.clone(),
            )?;
            instance.set_partition_name(config.name.clone())?;
            instance.start().await?;
            instances.push(instance);
        }
        Ok(Self {
            name,
            partition,
            services,
            instances,
        })
    }

    async fn stop(&self) -> Result<()> {
        for instance in &self.instances {
            instance.stop().await?;
        }
        self.services.stop();
        Ok(())
    }
}

/// Services configured for the partition, or a single demo service.
fn service_names(config: &CohortConfig) -> Vec<String> {
    let names: Vec<_> = config
        .services
        .iter()
        .filter(|s| config.partition_for(s) == config.partition.name)
        .map(|s| s.name.clone())
        .collect();
    if names.is_empty() {
        vec![DEMO_SERVICE.to_string()]
    } else {
        names
    }
}

fn record(step: &str, nodes: &[SimNode], service_names: &[String], out: &mut Vec<Transition>) {
    for (i, service) in service_names.iter().enumerate() {
        let master = nodes.iter().find(|n| n.instances[i].is_master_replica());
        let snapshot = master.map(|n| n.instances[i].replicants());
        out.push(Transition {
            step: step.to_string(),
            service: service.clone(),
            master: master.map(|n| n.name.clone()),
            view_id: snapshot.as_ref().map_or(0, |s| s.view_id.0),
            replicants: snapshot.as_ref().map_or(0, |s| s.len()),
        });
    }
}

/// Run the simulation and return every recorded transition.
pub async fn run(cmd: &SimulateCommand, config: &CohortConfig) -> Result<Vec<Transition>> {
    if cmd.nodes == 0 {
        bail!("--nodes must be at least 1");
    }
    let settle = Duration::from_millis(cmd.settle_ms);
    let names = service_names(config);
    let fabric = LocalFabric::new(config.partition.name.clone());

    let mut nodes = Vec::with_capacity(cmd.nodes);
    for i in 1..=cmd.nodes {
        nodes.push(SimNode::start(&fabric, format!("node-{i}"), &config.partition, &names).await?);
    }
    tokio::time::sleep(settle).await;

    let mut transitions = Vec::new();
    record("initial", &nodes, &names, &mut transitions);

    for round in 1..=cmd.rounds {
        let Some(master) = nodes.iter().find(|n| n.instances[0].is_master_replica()) else {
            break;
        };
        info!(round, node = %master.name, "master leaves");
        master.partition.leave();
        tokio::time::sleep(settle).await;
        record(&format!("round {round}: {} left", master.name), &nodes, &names, &mut transitions);

        master.partition.rejoin();
        tokio::time::sleep(settle).await;
        record(&format!("round {round}: {} rejoined", master.name), &nodes, &names, &mut transitions);
    }

    for node in &nodes {
        node.stop().await?;
    }
    Ok(transitions)
}
