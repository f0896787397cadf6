use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use guardian::allowlist::AllowlistCache;
use guardian::approver::DomainApprover;
use guardian::decisions::DecisionStore;
use guardian::events::{Event, EventHub};
use guardian::proxy::Proxy;
use guardian::queue::ApprovalQueue;
use guardian::tokens::TokenRegistry;
use guardian::{approval_api, token_api, Args};

fn main() {
    init_tracing();

    if let Err(err) = run() {
        tracing::error!("{err:#}");
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main(flavor = "multi_thread")]
async fn run() -> Result<()> {
    let args = Args::parse().apply_instance_id();
    std::fs::create_dir_all(&args.data_dir)
        .with_context(|| format!("create data dir {}", args.data_dir.display()))?;

    let events = Arc::new(EventHub::new());
    let registry = Arc::new(TokenRegistry::new(Some(events.clone())).with_instance_id(args.instance_id.clone()));
    let decisions = Arc::new(DecisionStore::new(args.data_dir.join("decisions")));

    let allowlist = AllowlistCache::new(
        args.default_allowlist.clone(),
        args.project_allowlist_dir.clone(),
        decisions.clone(),
    )
    .await
    .context("build initial allowlist snapshot")?;

    let queue = ApprovalQueue::new(args.approval_timeout, Some(events.clone()));
    let approver = Arc::new(DomainApprover::new(allowlist.clone(), queue.clone(), decisions.clone()));

    let proxy = Proxy::new(registry.clone(), approver.clone());
    proxy.start(args.proxy_addr).await.context("start CONNECT proxy")?;
    if let Some(addr) = proxy.listen_addr() {
        tracing::info!(%addr, "proxy ready");
        write_addr_file(args.proxy_addr_file.as_deref(), addr)?;
    }

    let sighup_task = {
        let allowlist = allowlist.clone();
        let events = events.clone();
        tokio::spawn(async move { run_sighup_listener(allowlist, events).await })
    };

    let token_api_task = {
        let registry = registry.clone();
        let allowlist = allowlist.clone();
        let addr_file = args.token_api_addr_file.clone();
        tokio::spawn(async move { token_api::serve(args.token_api_addr, registry, allowlist, addr_file.as_deref()).await })
    };

    let approval_api_task = {
        let queue = queue.clone();
        let events = events.clone();
        let addr_file = args.approval_api_addr_file.clone();
        tokio::spawn(async move { approval_api::serve(args.approval_api_addr, queue, events, addr_file.as_deref()).await })
    };

    let run_result: Result<()> = tokio::select! {
        result = token_api_task => result.context("token api task panicked")?.context("token api"),
        result = approval_api_task => result.context("approval api task panicked")?.context("approval api"),
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received shutdown signal");
            Ok(())
        }
    };

    sighup_task.abort();
    proxy.stop(std::time::Duration::from_secs(5)).await?;
    run_result
}

/// Spec §4.2's second reload trigger, alongside the explicit reload the
/// approver fires after persisting a decision (see
/// `DomainApprover::apply_scope`). Lets an operator who hand-edited a
/// decision or static-config file on disk push it live without a restart.
async fn run_sighup_listener(allowlist: Arc<AllowlistCache>, events: Arc<EventHub>) {
    let Ok(mut hangup) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) else {
        tracing::warn!("could not install SIGHUP listener");
        return;
    };

    loop {
        hangup.recv().await;
        tracing::info!("SIGHUP received, reloading allowlist");
        if let Err(err) = allowlist.reload().await {
            tracing::warn!(?err, "allowlist reload triggered by SIGHUP failed");
        }
        events.broadcast(Event::DecisionsReloaded);
    }
}

fn write_addr_file(path: Option<&std::path::Path>, addr: std::net::SocketAddr) -> Result<()> {
    let Some(path) = path else {
        return Ok(());
    };
    std::fs::write(path, addr.to_string()).with_context(|| format!("write addr file {}", path.display()))
}
