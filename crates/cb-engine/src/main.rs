//! cb-deploy: CloudBox deployment CLI
//!
//! Runs the CloudBox Install Protocol against one remote host: either the
//! full flow (repository sync, validation, install, start, verify) or a
//! single lifecycle script with `--script`.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cb_core::config::{self, EngineConfig};
use cb_core::types::{DeploymentDescriptor, HostConfig};
use cb_engine::{run_deployment, run_script, OutputRouter, RepositorySpec};
use cb_protocol::lifecycle::LifecycleScript;
use cb_protocol::output::OutputChannel;

#[derive(Parser)]
#[command(name = "cb-deploy")]
#[command(author, version, about = "CloudBox Install Protocol deployment engine")]
struct Cli {
    /// Remote host to deploy to
    #[arg(long)]
    host: String,

    /// SSH port
    #[arg(long, default_value_t = 22)]
    port: u16,

    /// SSH username
    #[arg(long)]
    username: String,

    /// Path to the SSH private key file
    #[arg(long)]
    key: PathBuf,

    /// Deployment id
    #[arg(long)]
    deployment_id: u64,

    /// Project id
    #[arg(long)]
    project_id: u64,

    /// Deployment name
    #[arg(long)]
    name: String,

    /// Explicit remote deployment path
    #[arg(long)]
    deploy_path: Option<String>,

    /// Base path joined with the deployment name when no explicit path is set
    #[arg(long)]
    deploy_base_path: Option<String>,

    /// Named port the deployment binds, repeatable
    #[arg(long = "publish", value_name = "NAME=PORT")]
    publish: Vec<String>,

    /// Repository clone URL; omit to deploy whatever is already at the path
    #[arg(long)]
    repo: Option<String>,

    /// Branch to deploy
    #[arg(long, default_value = "main")]
    branch: String,

    /// Specific commit to check out
    #[arg(long)]
    commit: Option<String>,

    /// Access token for https clone URLs
    #[arg(long, env = "CLOUDBOX_ACCESS_TOKEN", hide_env_values = true)]
    access_token: Option<String>,

    /// Run a single lifecycle script instead of the full flow
    #[arg(long, value_name = "SCRIPT", conflicts_with = "repo")]
    script: Option<LifecycleScript>,

    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| cli.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = load_engine_config(cli.config.as_ref())?;

    let private_key = tokio::fs::read_to_string(&cli.key)
        .await
        .with_context(|| format!("Failed to read key file {:?}", cli.key))?;

    let host = HostConfig {
        hostname: cli.host.clone(),
        port: cli.port,
        username: cli.username.clone(),
        private_key,
        deploy_base_path: cli.deploy_base_path.clone(),
    };

    let deployment = DeploymentDescriptor {
        id: cli.deployment_id,
        project_id: cli.project_id,
        name: cli.name.clone(),
        deploy_path: cli.deploy_path.clone(),
        ports: parse_publish_flags(&cli.publish)?,
    };

    let repository = cli.repo.as_ref().map(|url| RepositorySpec {
        clone_url: url.clone(),
        branch: cli.branch.clone(),
        commit: cli.commit.clone(),
        access_token: cli.access_token.clone(),
    });

    let cancel = CancellationToken::new();
    let cancel_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received Ctrl+C, cancelling...");
            cancel_signal.cancel();
        }
    });

    let (router, mut lines) = OutputRouter::channel();
    let printer = tokio::spawn(async move {
        while let Some(line) = lines.recv().await {
            match line.channel {
                OutputChannel::Stdout | OutputChannel::Info => println!("{}", line.text),
                OutputChannel::Stderr | OutputChannel::Error => eprintln!("{}", line.text),
            }
        }
    });

    let result = match cli.script {
        Some(script) => run_script(config, &host, &deployment, script, &router, cancel)
            .await
            .map(|()| None),
        None => run_deployment(config, &host, &deployment, repository.as_ref(), &router, cancel)
            .await
            .map(Some),
    };

    // Drain queued output before the verdict so the two never interleave
    drop(router);
    let _ = printer.await;

    match result {
        Ok(Some(outcome)) => {
            println!(
                "Deployment succeeded (build {} ms, deploy {} ms)",
                outcome.build_millis, outcome.deploy_millis
            );
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Load the engine configuration.
///
/// An explicitly requested file must parse; the default location falls
/// back to defaults when absent or unreadable.
fn load_engine_config(path: Option<&PathBuf>) -> Result<EngineConfig> {
    if let Some(path) = path {
        return config::load_config(path)
            .with_context(|| format!("Failed to load config from {:?}", path));
    }
    let default_path = config::default_config_path();
    if default_path.exists() {
        Ok(config::load_config(&default_path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load config from {:?}: {}", default_path, e);
            EngineConfig::default()
        }))
    } else {
        tracing::debug!("Using default configuration");
        Ok(EngineConfig::default())
    }
}

fn parse_publish_flags(flags: &[String]) -> Result<BTreeMap<String, u16>> {
    let mut ports = BTreeMap::new();
    for flag in flags {
        let (name, port) = flag
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("Invalid --publish '{}', expected NAME=PORT", flag))?;
        let name = name.trim();
        if name.is_empty() {
            anyhow::bail!("Invalid --publish '{}', port name is empty", flag);
        }
        let port: u16 = port
            .trim()
            .parse()
            .with_context(|| format!("Invalid --publish '{}', port must be 1-65535", flag))?;
        ports.insert(name.to_string(), port);
    }
    Ok(ports)
}
