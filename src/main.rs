use std::sync::Arc;

use agent::{CollectionLoop, RuntimeState, WorkDir};
use clap::Parser;
use config::{AgentConfig, Args};
use credentials::{AuthInterceptor, TokenSource};
use negotiator::TokioSleeper;

mod agent;
mod cloudprofilerpb;
mod command;
mod config;
mod converter;
mod credentials;
mod errors;
mod negotiator;
mod remote;
mod reporter;
mod rpcpb;
mod sampling;
mod subprocess;
mod symbol_tree;

#[cfg(test)]
mod testing;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    colog::init();

    let args = Args::parse();
    // project inference may query the metadata server
    let config = tokio::task::spawn_blocking(move || AgentConfig::from_args(args)).await??;
    log::info!(
        "starting agent for project {} target {}",
        config.deployment.project_id,
        config.deployment.target
    );

    let tokens = Arc::new(TokenSource::new(&config.credentials)?);
    let client = remote::connect(&config.api, config.insecure, AuthInterceptor::new(tokens)).await?;

    let workdir = WorkDir::create(config.workdir.clone())?;
    log::info!("using working directory {}", workdir.path().display());

    let mut state = RuntimeState { client, workdir };
    CollectionLoop::new(config, TokioSleeper).run(&mut state).await?;

    log::info!("agent stopped");
    Ok(())
}
