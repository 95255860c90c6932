//! # nfio Node
//!
//! Command-line front-end of the VNF lifecycle engine. Every invocation runs
//! one lifecycle verb against the VNFs described in the node configuration.
//!
//! ## Usage
//! ```bash
//! nfio-node --config /etc/nfio/node.yaml deploy fw
//! nfio-node exec fw --command "ifconfig eth0"
//! nfio-node --dev chain
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info};

use nfio_hypervisor::{HypervisorError, HypervisorFactory, LifecycleOp, ProcessIo, VnfSpec};
use nfio_node::cli::{Args, Command};
use nfio_node::config::DEFAULT_CONFIG_PATH;
use nfio_node::{Config, OperationError, VnfOperations};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Initialize logging
    if args.json_logs {
        nfio_common::init_logging_json(&args.log_level)?;
    } else {
        nfio_common::init_logging(&args.log_level)?;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting nfio node"
    );

    let config = load_config(&args)?;

    info!(
        backend = %config.hypervisor.backend,
        vnfs = config.vnfs.len(),
        "Node configured"
    );

    let factory = HypervisorFactory::new(config.registry(), Arc::new(ProcessIo::new()));
    let ops = VnfOperations::new(Arc::new(factory), config.operation_settings());

    let result = run(&ops, &config, &args.command).await;
    ops.shutdown().await;

    if let Err(ref e) = result {
        match e.downcast_ref::<OperationError>() {
            Some(op_err) => error!(code = op_err.code(), error = %op_err, "Operation failed"),
            None => error!(error = %e, "Command failed"),
        }
    }
    result
}

fn load_config(args: &Args) -> Result<Config> {
    match &args.config {
        Some(config_path) => {
            // Explicit config file provided
            let cfg = Config::load(config_path)
                .with_context(|| format!("Failed to load configuration from {}", config_path))?;
            info!(config_path = %config_path, "Configuration loaded");
            Ok(cfg.with_cli_overrides(args))
        }
        None => match Config::load(DEFAULT_CONFIG_PATH) {
            Ok(cfg) => {
                info!(config_path = %DEFAULT_CONFIG_PATH, "Configuration loaded from default location");
                Ok(cfg.with_cli_overrides(args))
            }
            Err(_) => {
                info!("No config file found, using CLI arguments and defaults");
                Ok(Config::default_with_cli(args))
            }
        },
    }
}

/// Start tracking `spec` from its backend state. A VNF unknown to the
/// backend stays untracked.
async fn track(ops: &VnfOperations, spec: &VnfSpec) -> Result<()> {
    match ops.adopt(spec.clone()).await {
        Ok(_) => Ok(()),
        Err(e) if matches!(e.kind(), HypervisorError::NotFound(_)) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn transition(ops: &VnfOperations, config: &Config, name: &str, op: LifecycleOp) -> Result<()> {
    track(ops, &config.vnf(name)?).await?;

    match op {
        LifecycleOp::Start => ops.start(name).await?,
        LifecycleOp::Restart => ops.restart(name).await?,
        LifecycleOp::Stop => ops.stop(name).await?,
        LifecycleOp::Pause => ops.pause(name).await?,
        LifecycleOp::Unpause => ops.unpause(name).await?,
        LifecycleOp::Destroy => ops.destroy(name).await?,
        other => anyhow::bail!("{} is not a name-level transition", other),
    }

    print_state(ops, name)
}

fn print_state(ops: &VnfOperations, name: &str) -> Result<()> {
    match ops.record(name) {
        Ok(record) => print_json(&record),
        Err(_) => print_json(&serde_json::json!({ "name": name, "state": "absent" })),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(ops: &VnfOperations, config: &Config, command: &Command) -> Result<()> {
    match command {
        Command::Create { name } => {
            let record = ops.create(config.vnf(name)?).await?;
            print_json(&record)
        }
        Command::Deploy { name } => {
            let spec = config.vnf(name)?;
            track(ops, &spec).await?;
            let record = ops.deploy(spec).await?;
            print_json(&record)
        }
        Command::Start { name } => transition(ops, config, name, LifecycleOp::Start).await,
        Command::Restart { name } => transition(ops, config, name, LifecycleOp::Restart).await,
        Command::Stop { name } => transition(ops, config, name, LifecycleOp::Stop).await,
        Command::Pause { name } => transition(ops, config, name, LifecycleOp::Pause).await,
        Command::Unpause { name } => transition(ops, config, name, LifecycleOp::Unpause).await,
        Command::Destroy { name } => transition(ops, config, name, LifecycleOp::Destroy).await,
        Command::Exec { name, command } => {
            track(ops, &config.vnf(name)?).await?;
            let output = ops.execute_command(name, command).await?;
            print!("{}", output.stdout);
            Ok(())
        }
        Command::Status { name } => {
            let specs = match name {
                Some(name) => vec![config.vnf(name)?],
                None => config.all_vnfs(),
            };
            for spec in specs {
                track(ops, &spec).await?;
                if ops.state(&spec.name).is_ok() {
                    if let Ok(ip) = ops.ip_address(&spec.name).await {
                        info!(vnf = %spec.name, ip = %ip, "VNF address");
                    }
                }
                print_state(ops, &spec.name)?;
            }
            Ok(())
        }
        Command::Stats { name, stat } => {
            track(ops, &config.vnf(name)?).await?;
            let value = ops.guest_stats(name, *stat).await?;
            println!("{}", value);
            Ok(())
        }
        Command::Chain { names } => {
            let specs = if names.is_empty() {
                config.all_vnfs()
            } else {
                names.iter().map(|n| config.vnf(n)).collect::<Result<Vec<_>>>()?
            };
            for spec in &specs {
                track(ops, spec).await?;
            }

            let total = specs.len();
            let outcomes = ops.deploy_chain(specs).await;
            let mut failed = 0;
            for (name, outcome) in &outcomes {
                match outcome {
                    Ok(record) => print_json(record)?,
                    Err(e) => {
                        failed += 1;
                        error!(vnf = %name, code = e.code(), error = %e, "Chain element failed");
                    }
                }
            }

            if failed > 0 {
                anyhow::bail!("{} of {} VNFs in the chain failed to deploy", failed, total);
            }
            Ok(())
        }
    }
}
