use crate::config::Pop3ServerConfig;
use crate::provider::MaildropProvider;
use crate::session::Pop3Session;
use anyhow::Context;
use mailwire::{BoxedAsyncReadAndWrite, ConnectionLimiter, Transport};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::Instrument;

pub(crate) struct ServerState {
    pub config: Pop3ServerConfig,
    pub disabled: HashSet<String>,
    pub provider: Arc<dyn MaildropProvider>,
    pub tls: Option<TlsAcceptor>,
}

/// Configures a POP3 listener.
pub struct Pop3Server {
    config: Pop3ServerConfig,
    provider: Arc<dyn MaildropProvider>,
    tls: Option<TlsAcceptor>,
}

impl Pop3Server {
    pub fn new<P: MaildropProvider + 'static>(config: Pop3ServerConfig, provider: P) -> Self {
        Self {
            config,
            provider: Arc::new(provider),
            tls: None,
        }
    }

    /// Enables STLS
    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls.replace(acceptor);
        self
    }

    pub fn with_configured_tls(self) -> anyhow::Result<Self> {
        let acceptor = mailwire::tls::make_acceptor(
            &self.config.hostname,
            self.config.tls_private_key.as_deref(),
            self.config.tls_certificate.as_deref(),
        )
        .context("configuring POP3 TLS")?;
        Ok(self.with_tls(acceptor))
    }

    pub fn build(self) -> Pop3Service {
        let disabled = self
            .config
            .disabled
            .iter()
            .map(|verb| verb.to_ascii_uppercase())
            .collect();
        Pop3Service {
            state: Arc::new(ServerState {
                config: self.config,
                disabled,
                provider: self.provider,
                tls: self.tls,
            }),
        }
    }

    pub async fn bind(self) -> anyhow::Result<Pop3Listener> {
        let endpoint = self.config.listen.clone();
        let limiter = ConnectionLimiter::new(self.config.max_connections);
        let listener = TcpListener::bind(&endpoint)
            .await
            .with_context(|| format!("failed to bind to {endpoint}"))?;
        Ok(Pop3Listener {
            listener,
            limiter,
            service: self.build(),
        })
    }
}

#[derive(Clone)]
pub struct Pop3Service {
    state: Arc<ServerState>,
}

impl Pop3Service {
    pub fn session(&self, stream: BoxedAsyncReadAndWrite, peer_address: SocketAddr) -> Pop3Session {
        let transport = Transport::new(stream, peer_address)
            .with_io_timeout(self.state.config.io_timeout);
        Pop3Session::new(Arc::clone(&self.state), transport)
    }

    pub async fn handle_connection(&self, stream: BoxedAsyncReadAndWrite, peer_address: SocketAddr) {
        tracing::info!("connection from {peer_address}");
        let mut session = self.session(stream, peer_address);
        match session.run().await {
            Ok(()) => tracing::info!("session ended"),
            Err(err) if err.is_hangup() => tracing::debug!("client went away: {err:#}"),
            Err(err) => tracing::warn!("session failed: {err:#}"),
        }
    }

    async fn turn_away(&self, stream: BoxedAsyncReadAndWrite, peer_address: SocketAddr) {
        tracing::warn!("too many connections; rejecting {peer_address}");
        let mut transport = Transport::new(stream, peer_address)
            .with_io_timeout(self.state.config.io_timeout);
        if let Err(err) = transport.write_line("-ERR Too many connections").await {
            tracing::debug!("while rejecting {peer_address}: {err:#}");
        }
        transport.shutdown().await;
    }
}

pub struct Pop3Listener {
    listener: TcpListener,
    limiter: ConnectionLimiter,
    service: Pop3Service,
}

impl Pop3Listener {
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn serve(self) -> anyhow::Result<()> {
        let addr = self.listener.local_addr()?;
        tracing::info!("pop3 listener on {addr:?}");
        loop {
            let (socket, peer_address) = self
                .listener
                .accept()
                .await
                .context("accepting connection")?;
            let service = self.service.clone();
            let permit = self.limiter.try_admit();
            let span = tracing::info_span!("pop3", peer = %peer_address);
            tokio::spawn(
                async move {
                    match permit {
                        Some(_permit) => {
                            service
                                .handle_connection(Box::new(socket), peer_address)
                                .await
                        }
                        None => service.turn_away(Box::new(socket), peer_address).await,
                    }
                }
                .instrument(span),
            );
        }
    }
}
