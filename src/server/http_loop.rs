// src/server/http_loop.rs

//! The main accept loop: binds the axum `Router` to accepted TCP (or, when
//! TLS is configured, TLS-wrapped) connections via hyper, until shutdown is
//! requested (Ctrl-C or a background task exiting unexpectedly).

use super::context::ServerContext;
use super::stream::AnyStream;
use axum::Router;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use tower::Service;
use tracing::{error, info, warn};

/// Runs the main accept loop until shutdown. Consumes the `ServerContext`.
pub async fn run(ctx: ServerContext) {
    let ServerContext {
        state,
        router,
        listener,
        mut background_tasks,
        acceptor,
    } = ctx;

    loop {
        tokio::select! {
            biased;

            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, cancelling all work.");
                state.root_cancel.cancel();
                break;
            }

            Some(task_result) = background_tasks.join_next(), if !background_tasks.is_empty() => {
                match task_result {
                    Ok(Ok(())) => warn!("a background task exited unexpectedly"),
                    Ok(Err(e)) => error!(error = %e, "a background task failed"),
                    Err(e) => error!(error = %e, "a background task panicked"),
                }
            }

            accept = listener.accept() => {
                let (stream, peer_addr) = match accept {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!(error = %e, "failed to accept connection");
                        continue;
                    }
                };

                let router = router.clone();
                let acceptor = acceptor.clone();
                let cancel = state.root_cancel.child_token();

                tokio::spawn(async move {
                    let any_stream = if let Some(acceptor) = acceptor {
                        match acceptor.accept(stream).await {
                            Ok(tls_stream) => AnyStream::Tls(Box::new(tls_stream)),
                            Err(e) => {
                                warn!(peer = %peer_addr, error = %e, "TLS handshake failed");
                                return;
                            }
                        }
                    } else {
                        AnyStream::Tcp(stream)
                    };

                    serve_connection(any_stream, router, cancel).await;
                });
            }
        }
    }

    info!("Waiting for in-flight connections and background tasks to finish.");
    while let Some(result) = background_tasks.join_next().await {
        if let Err(e) = result {
            error!(error = %e, "background task panicked during shutdown");
        }
    }
}

async fn serve_connection(stream: AnyStream, router: Router, cancel: tokio_util::sync::CancellationToken) {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let mut router = router.clone();
        async move { router.call(req).await }
    });

    let conn = AutoBuilder::new(TokioExecutor::new()).serve_connection_with_upgrades(io, service);
    tokio::pin!(conn);

    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            conn.as_mut().graceful_shutdown();
            let _ = conn.await;
        }
        result = conn.as_mut() => {
            if let Err(e) = result {
                tracing::debug!(error = %e, "connection closed with error");
            }
        }
    }
}
