//! ebbd — the ebbgrid rollout tool.
//!
//! Validates rollout policies, dry-runs the planner against an inventory
//! snapshot, queries a load-balancer controller for a target's state, and
//! rehearses whole rollouts against the in-memory cluster.
//!
//! # Usage
//!
//! ```text
//! ebbd validate rollout.toml
//! ebbd plan rollout.toml --inventory inventory.json
//! ebbd probe 10.0.0.5:9000 chat-7f3a --prefix /targets
//! ebbd simulate rollout.toml --old-replicas 5 --fail-stop 3
//! ```

mod simulate;

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::info;

use ebb_core::{Inventory, RolloutPolicy};
use ebbgrid_health::HttpTargetOracle;
use ebbgrid_rollout::{Counts, check_batch, is_converged, next_batch};

#[derive(Parser)]
#[command(name = "ebbd", about = "Graceful sticky-session rollouts")]
struct Cli {
    /// Emit logs as JSON.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load and validate a rollout policy, then print the resolved plan.
    Validate {
        /// Path to the policy file.
        policy: PathBuf,
    },

    /// Compute the next batch for an inventory snapshot without acting on it.
    Plan {
        policy: PathBuf,

        /// JSON array of instances.
        #[arg(long)]
        inventory: PathBuf,
    },

    /// Ask a load-balancer controller for a target's registration state.
    Probe {
        /// Controller address (host:port).
        address: String,

        /// Target (instance) id.
        instance: String,

        /// Path prefix of the target resources.
        #[arg(long, default_value = "/targets")]
        prefix: String,
    },

    /// Rehearse a rollout against a simulated cluster, printing progress
    /// events as JSON lines.
    Simulate {
        policy: PathBuf,

        /// Size of the existing fleet.
        #[arg(long, default_value = "3")]
        old_replicas: u32,

        /// Make the oldest instance fail this many stops.
        #[arg(long, default_value = "0")]
        fail_stop: u32,

        /// Report one old instance out of service once, then healthy again.
        #[arg(long)]
        flap: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Validate { policy } => validate(&policy),
        Command::Plan { policy, inventory } => plan(&policy, &inventory),
        Command::Probe {
            address,
            instance,
            prefix,
        } => probe(address, &instance, prefix).await,
        Command::Simulate {
            policy,
            old_replicas,
            fail_stop,
            flap,
        } => {
            let policy = load_policy(&policy)?;
            simulate::run(
                policy,
                simulate::Faults {
                    old_replicas,
                    fail_stop,
                    flap,
                },
            )
            .await
        }
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,ebbd=debug,ebbgrid=debug"));
    // Logs go to stderr; stdout carries command output.
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_policy(path: &Path) -> anyhow::Result<RolloutPolicy> {
    let policy = RolloutPolicy::from_file(path)
        .with_context(|| format!("loading policy {}", path.display()))?;
    info!(path = %path.display(), generation = %policy.generation.generation(), "policy loaded");
    Ok(policy)
}

fn validate(path: &Path) -> anyhow::Result<()> {
    let policy = load_policy(path)?;
    let plan = policy.plan();
    let summary = json!({
        "generation": plan.generation,
        "revision": policy.generation.revision(),
        "desired": plan.desired,
        "surge_capacity": plan.surge_capacity(),
        "max_unavailable": plan.max_unavailable,
        "drain_window_secs": plan.drain_window.as_secs(),
        "lb_deregistration_delay_secs": policy.lb_deregistration_delay.as_secs(),
        "progress_deadline_secs": policy.progress_deadline.as_secs(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn plan(policy_path: &Path, inventory_path: &Path) -> anyhow::Result<()> {
    let policy = load_policy(policy_path)?;
    let content = std::fs::read_to_string(inventory_path)
        .with_context(|| format!("reading inventory {}", inventory_path.display()))?;
    let inventory: Inventory =
        serde_json::from_str(&content).context("parsing inventory snapshot")?;

    let plan = policy.plan();
    let batch = next_batch(&inventory, &plan)?;
    check_batch(&inventory, &plan, &batch)?;

    let out = json!({
        "generation": plan.generation,
        "counts": Counts::observe(&inventory, &plan.generation),
        "available": inventory.available(),
        "converged": is_converged(&inventory, &plan),
        "batch": batch,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

async fn probe(address: String, instance: &str, prefix: String) -> anyhow::Result<()> {
    let oracle = HttpTargetOracle::new(address, prefix);
    let state = oracle.target_state(instance).await?;
    let out = json!({
        "instance": instance,
        "state": state,
        "registered": state.is_registered(),
        "in_service": state.is_in_service(),
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}
