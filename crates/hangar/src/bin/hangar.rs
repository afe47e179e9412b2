/*
 * Hangar - Operator CLI
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Hangar CLI - run a deployment end to end or operate on a running app
//!
//! `deploy` wires the full pipeline against the configured cluster, object
//! storage and GitHub App, registers the repository in an in-memory store and
//! waits for the run to finish.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use hangar::github::{GitHubAppClient, InstallationTokenCache};
use hangar::kubernetes::{KubernetesReconciler, WorkloadReconciler};
use hangar::providers::ProviderFactory;
use hangar::source::SourceStager;
use hangar::storage::S3ObjectStore;
use hangar::store::{DeploymentConfigStore, MemoryStore, RepositoryStore};
use hangar::{
    CloudVendor, DeploymentConfig, DeploymentService, DeploymentStatus, HangarConfig,
    PipelineDeps, PipelineOrchestrator, PipelineWorkers, PollSchedule, RepositoryId,
    SourceRepository,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "hangar")]
#[command(about = "Build and deploy commits to Kubernetes", version)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, env = "HANGAR_CONFIG", default_value = "hangar.yaml")]
    config: String,

    /// Log output format.
    #[arg(long, env = "HANGAR_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a commit and deploy it.
    Deploy {
        /// Repository owner.
        #[arg(long)]
        owner: String,

        /// Repository name.
        #[arg(long)]
        repo: String,

        /// Vendor tag (NCP, AWS, ON_PREMISE).
        #[arg(long, default_value = "NCP")]
        vendor: String,

        #[arg(long, default_value = "main")]
        branch: String,

        /// Commit SHA to build.
        #[arg(long)]
        commit: String,

        #[arg(long, default_value = "1")]
        replicas: i32,

        /// Container port; 0 uses the default.
        #[arg(long, default_value = "0")]
        port: i32,

        /// Environment variable, repeatable.
        #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env_pair)]
        env: Vec<(String, String)>,

        /// Host to expose through an ingress.
        #[arg(long)]
        domain: Option<String>,
    },

    /// Set the replica count of an app.
    Scale {
        #[arg(long)]
        app: String,

        #[arg(long)]
        replicas: i32,
    },

    /// Scale an app to zero and back.
    Restart {
        #[arg(long)]
        app: String,

        #[arg(long, default_value = "1")]
        replicas: i32,
    },
}

fn parse_env_pair(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,hangar=debug".into());
    let (text, json) = match format {
        LogFormat::Text => (Some(tracing_subscriber::fmt::layer()), None),
        LogFormat::Json => (None, Some(tracing_subscriber::fmt::layer().json())),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(text)
        .with(json)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = HangarConfig::from_file(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config))?;
    let client = kube::Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;
    let reconciler = Arc::new(KubernetesReconciler::new(client.clone(), &config.kubernetes));

    match cli.command {
        Commands::Deploy {
            owner,
            repo,
            vendor,
            branch,
            commit,
            replicas,
            port,
            env,
            domain,
        } => {
            let vendor: CloudVendor = vendor.parse()?;
            let repository = SourceRepository::new(RepositoryId(1), &owner, &repo, vendor);
            let deploy_config = DeploymentConfig {
                repository_id: repository.id,
                min_replicas: replicas,
                max_replicas: replicas.max(1),
                env_vars: env.into_iter().collect::<BTreeMap<_, _>>(),
                container_port: port,
                domain_url: domain,
            };
            deploy(config, client, reconciler, repository, deploy_config, &branch, &commit).await
        }
        Commands::Scale { app, replicas } => {
            if replicas < 0 {
                bail!("replica count must not be negative");
            }
            reconciler.scale(&app, replicas).await?;
            println!("Scaled {app} to {replicas} replicas");
            Ok(())
        }
        Commands::Restart { app, replicas } => {
            reconciler.scale(&app, 0).await?;
            reconciler.scale(&app, replicas.max(1)).await?;
            println!("Restarted {app} with {} replicas", replicas.max(1));
            Ok(())
        }
    }
}

async fn deploy(
    config: HangarConfig,
    client: kube::Client,
    reconciler: Arc<KubernetesReconciler>,
    repository: SourceRepository,
    deploy_config: DeploymentConfig,
    branch: &str,
    commit: &str,
) -> Result<()> {
    let store = Arc::new(MemoryStore::seeded_from_clock());
    store.insert(&repository).await?;
    store.put_config(&deploy_config).await?;

    let objects = Arc::new(S3ObjectStore::from_config(&config.storage)?);
    let stager = SourceStager::new(config.github.api_base_url.clone(), objects)?;
    let github = Arc::new(GitHubAppClient::from_config(&config.github)?);
    let providers = ProviderFactory::from_config(&config, client, stager)?;

    let deps = PipelineDeps {
        deployments: store.clone(),
        repositories: store.clone(),
        configs: store,
        tokens: Arc::new(InstallationTokenCache::new(github)),
        providers,
        reconciler,
    };
    let orchestrator = Arc::new(PipelineOrchestrator::new(
        deps,
        PollSchedule::from(&config.pipeline),
    ));
    let workers = Arc::new(PipelineWorkers::new(orchestrator, &config.pipeline)?);
    let service = DeploymentService::new(workers);

    let deployment = service.create_deployment(repository.id, branch, commit).await?;
    info!(
        deployment_id = %deployment.id,
        repository = %repository.full_name(),
        "Waiting for pipeline"
    );

    let view = loop {
        let view = service.get_status(deployment.id).await?;
        if view.status.is_terminal() {
            break view;
        }
        tokio::time::sleep(STATUS_POLL_INTERVAL).await;
    };

    if view.status != DeploymentStatus::Success {
        let reason = view.fail_reason.unwrap_or_else(|| "no reason recorded".to_string());
        warn!(deployment_id = %deployment.id, status = %view.status, "Deployment did not succeed");
        bail!("deployment {} finished {}: {reason}", deployment.id, view.status);
    }
    println!(
        "Deployment {} succeeded: {}",
        deployment.id,
        repository.image_uri(&config.build.registry_endpoint)
    );
    Ok(())
}
