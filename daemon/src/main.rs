use anyhow::Context;
use config::AppConfig;
use ledger::{BasicAuth, HttpLedgerClient, LedgerClient, LedgerError};
use node_rpc::cln::ClnRpcClient;
use node_rpc::{NodeError, NodeRpc};
use notifier::{NotifierConfig, PaymentNotifier};
use queue::{AuditLog, JobQueue, RetryPolicy};
use replenisher::{ReplenishConfig, Replenisher};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing() {
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(env_filter))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn retry_policy(cfg: &AppConfig) -> RetryPolicy {
    RetryPolicy {
        base: Duration::from_secs(cfg.retry.base_secs),
        multiplier: cfg.retry.multiplier,
        cap: Duration::from_secs(cfg.retry.cap_secs),
        jitter: cfg.retry.jitter,
        max_attempts: cfg.retry.max_attempts,
    }
}

fn notifier_config(cfg: &AppConfig) -> NotifierConfig {
    NotifierConfig {
        workers: cfg.delivery.workers,
        poll_interval: Duration::from_millis(cfg.delivery.poll_interval_ms),
        request_timeout: Duration::from_secs(cfg.ledger.timeout_secs),
        retention: Duration::from_secs(cfg.delivery.retention_days.saturating_mul(24 * 60 * 60)),
        prune_interval: Duration::from_secs(cfg.delivery.prune_interval_secs),
        initial_pay_index: cfg.delivery.initial_pay_index,
        ..NotifierConfig::default()
    }
}

fn replenish_config(cfg: &AppConfig) -> ReplenishConfig {
    let inv = &cfg.inventory;
    ReplenishConfig {
        target: inv.target,
        amount_sat: inv.amount_sat,
        description: inv.description.clone(),
        expiry_min: inv.expiry_min,
        expiry_max: inv.expiry_max,
        expiry_unit: inv.expiry_unit,
        interval: Duration::from_secs(inv.interval_secs),
        escalate_after: inv.escalate_after,
        request_timeout: Duration::from_secs(cfg.node.timeout_secs),
    }
}

fn create_ledger_client(cfg: &AppConfig) -> anyhow::Result<Arc<HttpLedgerClient>> {
    let creds = config::load_credentials(&cfg.ledger)?;
    let auth = BasicAuth {
        username: creds.username,
        password: creds.password,
    };
    let client = HttpLedgerClient::new(
        cfg.ledger.base_url.clone(),
        cfg.ledger.notify_url.clone(),
        auth,
        Duration::from_secs(cfg.ledger.timeout_secs),
    )?;
    tracing::info!(base_url = %client.base_url, notify_url = %client.notify_url, "Using ledger service");
    Ok(client)
}

/// One bounded call to each side. The daemon refuses to start half
/// configured.
async fn preflight(
    ledger: &dyn LedgerClient,
    node: &dyn NodeRpc,
    timeout: Duration,
) -> anyhow::Result<()> {
    let count = tokio::time::timeout(timeout, ledger.invoice_count())
        .await
        .unwrap_or(Err(LedgerError::Timeout))
        .context("ledger service unreachable at startup")?;
    let info = tokio::time::timeout(timeout, node.get_info())
        .await
        .unwrap_or(Err(NodeError::Timeout))
        .context("node RPC unreachable at startup")?;
    tracing::info!(
        invoice_count = count,
        node_id = %info.id,
        blockheight = info.blockheight,
        "Ledger service and node reachable"
    );
    Ok(())
}

async fn run() -> anyhow::Result<()> {
    let cfg = config::load()?;
    cfg.validate()?;

    let ledger = create_ledger_client(&cfg)?;
    let rpc_path = cfg.node_rpc_path()?;
    tracing::info!(socket = %rpc_path.display(), "Using node RPC socket");
    let node = ClnRpcClient::new(
        rpc_path,
        Duration::from_secs(cfg.node.timeout_secs),
        Duration::from_secs(cfg.node.wait_window_secs),
    );
    let startup_timeout = Duration::from_secs(cfg.ledger.timeout_secs.max(cfg.node.timeout_secs));
    preflight(ledger.as_ref(), node.as_ref(), startup_timeout).await?;

    let audit = match &cfg.storage.audit_log {
        Some(path) => AuditLog::to_file(path),
        None => AuditLog::disabled(),
    };
    let queue = JobQueue::open(&cfg.storage.queue_path, retry_policy(&cfg), audit).await?;
    let counts = queue.counts()?;
    tracing::info!(
        path = %cfg.storage.queue_path,
        pending = counts.pending,
        delivered = counts.delivered,
        abandoned = counts.abandoned,
        max_attempts = queue.policy().max_attempts,
        "Job queue opened"
    );

    let (stop, shutdown) = watch::channel(false);
    let ledger: Arc<dyn LedgerClient> = ledger;
    let notifier = PaymentNotifier::new(Arc::new(queue), ledger.clone(), notifier_config(&cfg));
    let mut handles = notifier.spawn(node.clone(), shutdown.clone());

    if cfg.inventory.enabled {
        let replenisher = Replenisher::new(ledger, node, replenish_config(&cfg));
        handles.push(tokio::spawn(replenisher.run(shutdown)));
    } else {
        tracing::info!("Invoice replenishment disabled for this instance");
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested, waiting for running tasks");
    let _ = stop.send(true);
    for handle in handles {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Task ended abnormally");
        }
    }
    tracing::info!("Stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "ln-bridge exited with an error");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger::mock::MockLedger;
    use node_rpc::mock::MockNode;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, UnixListener};

    const TIMEOUT: Duration = Duration::from_secs(2);

    fn node_at(path: std::path::PathBuf) -> Arc<ClnRpcClient> {
        ClnRpcClient::new(path, TIMEOUT, Duration::from_secs(1))
    }

    #[tokio::test]
    async fn preflight_passes_when_both_sides_answer() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lightning-rpc");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await.unwrap();
            let reply = br#"{"jsonrpc":"2.0","id":1,"result":{"id":"02abc","blockheight":1}}"#;
            socket.write_all(reply).await.unwrap();
        });

        preflight(MockLedger::with_count(60).as_ref(), node_at(path).as_ref(), TIMEOUT)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn preflight_fails_without_node_socket() {
        let dir = TempDir::new().unwrap();
        let node = node_at(dir.path().join("lightning-rpc"));

        let err = preflight(MockLedger::with_count(60).as_ref(), node.as_ref(), TIMEOUT)
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("node RPC unreachable"));
    }

    #[tokio::test]
    async fn preflight_fails_when_ledger_is_unreachable() {
        // Bind then drop to get a local port nothing listens on.
        let port = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let auth = BasicAuth {
            username: "user".to_string(),
            password: "pass".to_string(),
        };
        let ledger =
            HttpLedgerClient::new(format!("http://127.0.0.1:{port}"), None, auth, TIMEOUT).unwrap();

        let err = preflight(ledger.as_ref(), MockNode::new().as_ref(), TIMEOUT)
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("ledger service unreachable"));
    }
}
