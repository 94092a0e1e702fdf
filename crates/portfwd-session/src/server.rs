//! `serve` and `connect` entry points over TCP

use crate::session::{local_handler, Session};
use crate::{SessionConfig, SessionError};
use std::future::Future;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Accept sessions until `shutdown` resolves
///
/// Each connection gets its own handler and sockets; tunnels listed in
/// `config` are ignored here, peers register their own.
pub async fn serve<F>(listener: TcpListener, config: SessionConfig, shutdown: F) -> Result<(), SessionError>
where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    let (stop_tx, stop_rx) = watch::channel(false);
    let mut sessions = JoinSet::new();

    if let Ok(addr) = listener.local_addr() {
        info!("Accepting port-forward sessions on {}", addr);
    }

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutting down server");
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Failed to accept session: {}", e);
                        continue;
                    }
                };
                if let Err(e) = stream.set_nodelay(true) {
                    warn!("Failed to set TCP_NODELAY for {}: {}", peer_addr, e);
                }

                let session = Session::with_handler(
                    stream,
                    local_handler(&config.handler),
                    config.poll_interval(),
                );
                info!("New session {} from {}", session.id(), peer_addr);

                let mut stop = stop_rx.clone();
                sessions.spawn(async move {
                    let result = session
                        .run(async move {
                            let _ = stop.changed().await;
                        })
                        .await;
                    if let Err(e) = result {
                        error!("Session from {} failed: {}", peer_addr, e);
                    }
                });
            }
            Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                if let Err(e) = finished {
                    error!("Session task panicked: {}", e);
                }
            }
        }
    }

    let _ = stop_tx.send(true);
    while sessions.join_next().await.is_some() {}
    Ok(())
}

/// Bind `config.listen` and serve on it
pub async fn bind_and_serve<F>(config: SessionConfig, shutdown: F) -> Result<(), SessionError>
where
    F: Future<Output = ()>,
{
    let listener = TcpListener::bind(&config.listen)
        .await
        .map_err(|source| SessionError::Bind {
            address: config.listen.clone(),
            source,
        })?;
    serve(listener, config, shutdown).await
}

/// Open a session to `config.server` and run it until `shutdown` resolves
pub async fn connect<F>(config: &SessionConfig, shutdown: F) -> Result<(), SessionError>
where
    F: Future<Output = ()>,
{
    let address = config.server.as_deref().ok_or(SessionError::MissingServer)?;
    let stream = TcpStream::connect(address)
        .await
        .map_err(|source| SessionError::Connect {
            address: address.to_string(),
            source,
        })?;
    stream.set_nodelay(true)?;
    info!("Connected to {}", address);

    Session::new(stream, config)?.run(shutdown).await
}
