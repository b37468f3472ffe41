//! `substrate serve`: route JSON-lines requests from stdin to per-tenant
//! workers and funnel their output to stdout through a single writer.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use substrate_store::{TenantDirectory, validate_tenant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::config::ServeConfig;
use crate::protocol::{ErrorBody, Reply, Request, parse_request, reply_line};
use crate::worker::{self, WorkerOptions};

struct Router {
    dir: TenantDirectory,
    config: ServeConfig,
    tenants: HashMap<String, mpsc::Sender<Request>>,
    out: mpsc::Sender<String>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Router {
    fn options(&self) -> WorkerOptions {
        WorkerOptions {
            engine: self.config.engine.clone(),
            persist_timeout: Duration::from_millis(self.config.persist_timeout_ms),
            max_group: self.config.max_group,
            journal_ticks: self.config.journal_ticks,
        }
    }

    /// Start the worker for `tenant` unless it is already running.
    async fn start(&mut self, tenant: &str) -> Result<mpsc::Sender<Request>> {
        if let Some(tx) = self.tenants.get(tenant) {
            return Ok(tx.clone());
        }
        validate_tenant(tenant)?;

        let dir = self.dir.clone();
        let name = tenant.to_string();
        let options = self.options();
        let out = self.out.clone();
        let worker = tokio::task::spawn_blocking(move || worker::load(&dir, &name, options, out))
            .await
            .context("tenant loader panicked")?
            .with_context(|| format!("failed to open tenant '{tenant}'"))?;

        let (tx, rx) = mpsc::channel(self.config.queue_capacity);
        self.tracker.spawn(worker.run(rx, self.cancel.clone()));
        self.tenants.insert(tenant.to_string(), tx.clone());
        Ok(tx)
    }

    async fn route(&mut self, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        let request = match parse_request(line) {
            Ok(request) => request,
            Err(reply) => {
                self.reply(&reply).await;
                return;
            }
        };

        let tx = match self.start(&request.tenant).await {
            Ok(tx) => tx,
            Err(e) => {
                warn!(tenant = %request.tenant, error = %e, "tenant unavailable");
                let body = ErrorBody::new("tenant_unavailable", format!("{e:#}"), false);
                self.reply(&Reply::err(&request, body)).await;
                return;
            }
        };
        if let Err(mpsc::error::SendError(request)) = tx.send(request).await {
            // worker exited; a later request restarts it
            self.tenants.remove(&request.tenant);
            let body = ErrorBody::new("tenant_unavailable", "tenant worker stopped", true);
            self.reply(&Reply::err(&request, body)).await;
        }
    }

    async fn reply(&self, reply: &Reply) {
        let _ = self.out.send(reply_line(reply)).await;
    }
}

async fn write_lines(mut rx: mpsc::Receiver<String>) -> std::io::Result<()> {
    let mut stdout = tokio::io::stdout();
    while let Some(line) = rx.recv().await {
        stdout.write_all(line.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
    }
    Ok(())
}

pub async fn serve(dir: TenantDirectory, config: ServeConfig, tenants: Vec<String>) -> Result<()> {
    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();
    let (out_tx, out_rx) = mpsc::channel::<String>(1024);
    let writer = tokio::spawn(write_lines(out_rx));

    let mut eager: Vec<String> = config.tenants.clone();
    eager.extend(tenants);
    eager.sort();
    eager.dedup();

    let mut router = Router {
        dir,
        config,
        tenants: HashMap::new(),
        out: out_tx,
        cancel: cancel.clone(),
        tracker: tracker.clone(),
    };
    for tenant in &eager {
        router.start(tenant).await?;
    }
    info!(tenants = eager.len(), "serving on stdio");

    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            interrupt.cancel();
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => router.route(&line).await,
                Ok(None) => {
                    info!("stdin closed, draining tenants");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "stdin read failed");
                    break;
                }
            },
        }
    }

    // Dropping the senders lets each worker finish its queue and exit.
    drop(router);
    tracker.close();
    tracker.wait().await;
    writer
        .await
        .context("output writer panicked")?
        .context("failed to write to stdout")?;
    info!("shutdown complete");
    Ok(())
}
