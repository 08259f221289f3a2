//! Graceful shutdown.
//!
//! On the signal the listener stops accepting and, at the same time, the
//! executor drains running jobs for the grace period before killing their
//! tools. Requests still waiting on those jobs answer with the job's terminal
//! state, so the HTTP drain finishes no later than the executor's.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use convertd_jobs::JobExecutor;

/// Serve `app` until `signal` resolves, then drain.
///
/// Returns `true` when every running job finished inside `grace`.
pub async fn serve_until<F>(
    listener: TcpListener,
    app: Router,
    executor: Arc<JobExecutor>,
    grace: Duration,
    signal: F,
) -> anyhow::Result<bool>
where
    F: Future<Output = ()> + Send + 'static,
{
    let stop = CancellationToken::new();
    let trigger = tokio::spawn({
        let stop = stop.clone();
        async move {
            signal.await;
            stop.cancel();
        }
    });
    let drain = tokio::spawn({
        let stop = stop.clone();
        async move {
            stop.cancelled().await;
            info!("Shutdown: draining running jobs");
            executor.shutdown(grace).await
        }
    });

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(stop.clone().cancelled_owned())
        .await;

    // The server may also have stopped on its own; drain the jobs either way.
    stop.cancel();
    trigger.abort();
    let drained = drain.await.context("executor drain task failed")?;
    served.context("server error")?;
    if !drained {
        warn!("Jobs still running after {}s were terminated", grace.as_secs());
    }
    Ok(drained)
}

/// Resolves on SIGINT or SIGTERM (ctrl-c elsewhere).
pub async fn signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
            (Ok(mut sigint), Ok(mut sigterm)) => {
                tokio::select! {
                    _ = sigint.recv() => {}
                    _ = sigterm.recv() => {}
                }
            }
            _ => {
                warn!("Could not register signal handlers, falling back to ctrl_c");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::Value;
    use tempfile::TempDir;
    use tokio::sync::oneshot;

    use convertd_core::{Config, JobKind};
    use convertd_storage::StorageManager;
    use convertd_tool_runtime::{ToolAdapter, ToolContext, ToolError, ToolOutput, ToolRegistry, ToolRequest, ToolStatus};

    use crate::router::build_router;
    use crate::startup::assemble;

    /// Renders nothing; holds its worker until shutdown cancels it.
    struct StuckRender;

    #[async_trait]
    impl ToolAdapter for StuckRender {
        fn kind(&self) -> JobKind {
            JobKind::Render
        }

        fn operations(&self) -> &'static [&'static str] {
            &["from-text"]
        }

        async fn check(&self) -> ToolStatus {
            ToolStatus {
                kind: JobKind::Render,
                binaries: Vec::new(),
                details: None,
            }
        }

        async fn invoke(&self, _request: &ToolRequest, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
            ctx.cancel.cancelled().await;
            Err(ToolError::Cancelled)
        }
    }

    #[tokio::test]
    async fn signal_with_job_in_flight_kills_it_after_grace() {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::for_profile("SHUTDOWNTEST");
        config.storage.storage_dir = tmp.path().to_path_buf();
        let storage = StorageManager::new(tmp.path());
        storage.ensure_layout().await.unwrap();
        let mut registry = ToolRegistry::new();
        registry.register(StuckRender).unwrap();
        let state = assemble(config, storage, registry, Vec::new());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(serve_until(
            listener,
            build_router(state.clone()),
            state.executor.clone(),
            Duration::from_millis(200),
            async move {
                let _ = stop_rx.await;
            },
        ));

        let request = tokio::spawn(async move {
            reqwest::Client::new()
                .post(format!("http://{addr}/pdf/from-text"))
                .header("content-type", "application/json")
                .body(r#"{"text":"hello"}"#)
                .send()
                .await
        });
        while state.executor.admission().running_total() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        stop_tx.send(()).unwrap();
        let drained = tokio::time::timeout(Duration::from_secs(3), server)
            .await
            .expect("server stopped within the grace period")
            .unwrap()
            .unwrap();
        assert!(!drained);

        let resp = request.await.unwrap().unwrap();
        assert_eq!(resp.status().as_u16(), 500);
        let body: Value = serde_json::from_str(&resp.text().await.unwrap()).unwrap();
        assert_eq!(body["error"], "terminated by shutdown");
        assert_eq!(body["data"]["job"]["state"], "failed");
        assert_eq!(state.executor.admission().running_total(), 0);
        assert_eq!(state.executor.history().recent(10).len(), 1);
    }
}
