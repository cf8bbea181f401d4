use sshmcp::commands::handle_line;
use sshmcp::{EnvConfig, SshService};
use sshmcp_ssh::ssh::Ssh2Connector;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Logs go to stderr; stdout carries responses only.
fn init_logging(json: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = if json {
        fmt::layer()
            .json()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        fmt::layer()
            .with_target(true)
            .with_ansi(false)
            .with_writer(std::io::stderr)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

#[tokio::main]
async fn main() {
    let env = match EnvConfig::from_env() {
        Ok(env) => env,
        Err(e) => {
            init_logging(false);
            tracing::error!("Invalid configuration: {}", e);
            std::process::exit(2);
        }
    };
    init_logging(env.log_json);

    let service = Arc::new(SshService::new(
        Arc::new(Ssh2Connector::new()),
        env.service_config(),
    ));

    match service.auto_connect(&env).await {
        Ok(Some(id)) => tracing::info!(session_id = %id, "default session ready"),
        Ok(None) => tracing::debug!("no preset connection configured"),
        Err(e) => tracing::warn!("Preset connection failed: {}", e),
    }

    serve_stdio(service.clone()).await;

    let closed = service.cleanup().await;
    tracing::info!(closed, "shutdown complete");
}

/// Read JSON-lines requests from stdin and answer each on stdout.
///
/// Requests run concurrently; responses are written in completion order.
async fn serve_stdio(service: Arc<SshService>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = rx.recv().await {
            if stdout.write_all(line.as_bytes()).await.is_err()
                || stdout.write_all(b"\n").await.is_err()
                || stdout.flush().await.is_err()
            {
                tracing::error!("stdout closed; dropping responses");
                break;
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut tasks = JoinSet::new();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let interrupted = loop {
        tokio::select! {
            _ = &mut ctrl_c => break true,
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let service = service.clone();
                    let tx = tx.clone();
                    tasks.spawn(async move {
                        let response = handle_line(&service, &line).await;
                        let _ = tx.send(response.to_string());
                    });
                }
                Ok(None) => break false,
                Err(e) => {
                    tracing::error!("Error reading stdin: {}", e);
                    break false;
                }
            },
            Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
        }
    };

    if interrupted {
        tracing::info!(in_flight = tasks.len(), "interrupted; abandoning in-flight requests");
        tasks.abort_all();
    }
    while tasks.join_next().await.is_some() {}

    drop(tx);
    let _ = writer.await;
}
