//! Connection listener: one [`Session`] per accepted TCP connection

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::pipeline::Services;
use crate::session::{Session, SessionConfig};
use crate::{Error, Result};

/// Accept loop of the voice socket
pub struct Listener {
    listener: TcpListener,
    services: Services,
    config: SessionConfig,
}

impl Listener {
    /// Bind the socket
    ///
    /// # Errors
    ///
    /// Returns error if the address cannot be bound
    pub async fn bind(addr: SocketAddr, services: Services, config: SessionConfig) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Config(format!("failed to bind voice listener on {addr}: {e}")))?;
        Ok(Self {
            listener,
            services,
            config,
        })
    }

    /// Address actually bound (useful with port 0)
    ///
    /// # Errors
    ///
    /// Returns error if the socket has no local address
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `cancel` fires, then cancel every session
    /// and wait for all of them to tear down
    ///
    /// # Errors
    ///
    /// Currently infallible once bound; accept errors are logged and retried
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let addr = self.local_addr()?;
        tracing::info!(%addr, "voice listener started");

        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "session task panicked");
                    }
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let session = Session::new(
                            self.services.clone(),
                            self.config.clone(),
                            cancel.child_token(),
                        );
                        sessions.spawn(serve(session, stream, peer));
                    }
                    Err(e) => {
                        // Usually fd exhaustion; back off instead of spinning
                        tracing::warn!(error = %e, "accept failed");
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                },
            }
        }

        tracing::info!(open = sessions.len(), "voice listener stopping");
        while let Some(joined) = sessions.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "session task panicked");
            }
        }
        tracing::info!("voice listener stopped");
        Ok(())
    }
}

async fn serve(session: Session, stream: TcpStream, peer: SocketAddr) {
    let session_id = session.id();
    tracing::info!(%session_id, %peer, "connection accepted");

    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(%session_id, error = %e, "failed to set TCP_NODELAY");
    }

    let (reader, writer) = stream.into_split();
    match session.run(reader, writer).await {
        Ok(()) => tracing::info!(%session_id, %peer, "connection closed"),
        Err(e) => tracing::warn!(%session_id, %peer, error = %e, "connection closed with error"),
    }
}
