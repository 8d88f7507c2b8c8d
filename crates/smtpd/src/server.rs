use crate::auth::AuthNegotiator;
use crate::config::SmtpServerConfig;
use crate::extension::{Extension, ExtensionRegistry, RegistryError};
use crate::handler::MessageHandler;
use crate::message::{MailparseDecoder, MessageDecoder};
use crate::session::Session;
use anyhow::Context;
use mailwire::{BoxedAsyncReadAndWrite, ConnectionLimiter, Transport};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::Instrument;

/// Everything a session needs from the server.
/// Built once by [SmtpServer::build] and never modified afterwards.
pub(crate) struct ServerState {
    pub config: SmtpServerConfig,
    /// Upper-cased verbs
    pub disabled: HashSet<String>,
    pub handler: Arc<dyn MessageHandler>,
    pub decoder: Arc<dyn MessageDecoder>,
    pub tls: Option<TlsAcceptor>,
    pub auth: Option<Arc<AuthNegotiator>>,
    pub extensions: ExtensionRegistry,
}

/// Configures an SMTP listener.
pub struct SmtpServer {
    config: SmtpServerConfig,
    handler: Arc<dyn MessageHandler>,
    decoder: Arc<dyn MessageDecoder>,
    tls: Option<TlsAcceptor>,
    auth: Option<AuthNegotiator>,
    extensions: ExtensionRegistry,
}

impl SmtpServer {
    pub fn new<H: MessageHandler + 'static>(config: SmtpServerConfig, handler: H) -> Self {
        Self {
            config,
            handler: Arc::new(handler),
            decoder: Arc::new(MailparseDecoder),
            tls: None,
            auth: None,
            extensions: ExtensionRegistry::new(),
        }
    }

    /// Enables STARTTLS
    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls.replace(acceptor);
        self
    }

    /// Enables STARTTLS using the key and certificate named in the
    /// configuration, or a self-signed certificate if none are named.
    pub fn with_configured_tls(self) -> anyhow::Result<Self> {
        let acceptor = mailwire::tls::make_acceptor(
            &self.config.hostname,
            self.config.tls_private_key.as_deref(),
            self.config.tls_certificate.as_deref(),
        )
        .context("configuring SMTP TLS")?;
        Ok(self.with_tls(acceptor))
    }

    pub fn with_auth(mut self, auth: AuthNegotiator) -> Self {
        self.auth.replace(auth);
        self
    }

    pub fn with_decoder<D: MessageDecoder + 'static>(mut self, decoder: D) -> Self {
        self.decoder = Arc::new(decoder);
        self
    }

    pub fn extend<E: Extension + 'static>(
        mut self,
        verb: &str,
        extension: E,
    ) -> Result<Self, RegistryError> {
        self.extensions.register(verb, extension)?;
        Ok(self)
    }

    pub fn build(self) -> SmtpService {
        let disabled = self
            .config
            .disabled
            .iter()
            .map(|verb| verb.to_ascii_uppercase())
            .collect();
        SmtpService {
            state: Arc::new(ServerState {
                config: self.config,
                disabled,
                handler: self.handler,
                decoder: self.decoder,
                tls: self.tls,
                auth: self.auth.map(Arc::new),
                extensions: self.extensions,
            }),
        }
    }

    pub async fn bind(self) -> anyhow::Result<SmtpListener> {
        let endpoint = self.config.listen.clone();
        let limiter = ConnectionLimiter::new(self.config.max_connections);
        let listener = TcpListener::bind(&endpoint)
            .await
            .with_context(|| format!("failed to bind to {endpoint}"))?;
        Ok(SmtpListener {
            listener,
            limiter,
            service: self.build(),
        })
    }
}

/// A frozen server configuration, able to serve connections.
#[derive(Clone)]
pub struct SmtpService {
    state: Arc<ServerState>,
}

impl SmtpService {
    pub fn session(&self, stream: BoxedAsyncReadAndWrite, peer_address: SocketAddr) -> Session {
        let transport = Transport::new(stream, peer_address)
            .with_io_timeout(self.state.config.io_timeout);
        Session::new(Arc::clone(&self.state), transport)
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
        let reply = format!(
            "554 {} Too many connections, try again later",
            self.state.config.hostname
        );
        if let Err(err) = transport.write_line(&reply).await {
            tracing::debug!("while rejecting {peer_address}: {err:#}");
        }
        transport.shutdown().await;
    }
}

pub struct SmtpListener {
    listener: TcpListener,
    limiter: ConnectionLimiter,
    service: SmtpService,
}

impl SmtpListener {
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until the task running this is dropped,
    /// serving each in its own task.
    pub async fn serve(self) -> anyhow::Result<()> {
        let addr = self.listener.local_addr()?;
        tracing::info!("smtp listener on {addr:?}");
        loop {
            let (socket, peer_address) = self
                .listener
                .accept()
                .await
                .context("accepting connection")?;
            let service = self.service.clone();
            let permit = self.limiter.try_admit();
            let span = tracing::info_span!("smtp", peer = %peer_address);
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
