//! The edge protocol frontend.
//!
//! Accepts client connections speaking the binary protocol, compiles
//! their queries through an external compiler endpoint, and runs the
//! compiled SQL on a backing Postgres connection. See [`start`].

pub mod backend;
pub mod buffer;
pub mod conn;
pub mod proto;
pub mod typedesc;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use patina_types::config::EdgeConfig;

use crate::backend::{Authenticator, BackendProvider};

pub struct EdgeServer {
    pub local_addr: SocketAddr,
}

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Binds the listener and spawns the accept loop. Cancelling `cancel`
/// stops accepting and aborts live connections.
pub async fn start(
    cfg: EdgeConfig,
    provider: Arc<dyn BackendProvider>,
    auth: Arc<dyn Authenticator>,
    cancel: CancellationToken,
) -> Result<EdgeServer, StartError> {
    let listener = TcpListener::bind(cfg.bind_addr).await?;
    let local_addr = listener.local_addr()?;
    info!("accepting edge connections on {local_addr}");

    tokio::spawn(async move {
        loop {
            let (stream, remote_addr) = tokio::select! {
                res = listener.accept() => match res {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!("could not accept edge connection: {e}");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                },
                _ = cancel.cancelled() => break,
            };
            debug!("accepted edge connection from {remote_addr}");
            counter!("patina.connections.accepted").increment(1);

            if let Err(e) = stream.set_nodelay(true) {
                debug!("could not set nodelay on {remote_addr}: {e}");
            }

            tokio::spawn(conn::handle_conn(
                stream,
                cfg.clone(),
                provider.clone(),
                auth.clone(),
                cancel.clone(),
            ));
        }
        debug!("edge listener is done");
    });

    Ok(EdgeServer { local_addr })
}
