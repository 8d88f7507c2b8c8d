use crate::address::extract_address;
use crate::auth::{AuthError, Identity};
use crate::handler::Envelope;
use crate::reply::Reply;
use crate::server::ServerState;
use mailwire::{Command, FloodPolicy, Transport, TransportError, Verdict};
use std::net::SocketAddr;
use std::sync::Arc;

/// What the command loop should do after a command has been handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

/// One client connection.
///
/// Owned by the task serving the connection; nothing in here is shared
/// with other sessions except the read-only server state.
pub struct Session {
    server: Arc<ServerState>,
    transport: Option<Transport>,
    identity: Option<Arc<Identity>>,
    transaction: Option<Envelope>,
    helo_domain: Option<String>,
    policy: FloodPolicy,
}

impl Session {
    pub(crate) fn new(server: Arc<ServerState>, transport: Transport) -> Self {
        let policy = FloodPolicy::new(
            server.config.max_commands,
            server.config.max_unrecognized_commands,
        );
        Self {
            server,
            transport: Some(transport),
            identity: None,
            transaction: None,
            helo_domain: None,
            policy,
        }
    }

    fn transport(&mut self) -> Result<&mut Transport, TransportError> {
        self.transport.as_mut().ok_or(TransportError::NotConnected)
    }

    pub fn hostname(&self) -> &str {
        &self.server.config.hostname
    }

    pub fn peer_address(&self) -> Option<SocketAddr> {
        self.transport.as_ref().map(|t| t.peer_address())
    }

    pub fn is_encrypted(&self) -> bool {
        self.transport
            .as_ref()
            .map(|t| t.is_encrypted())
            .unwrap_or(false)
    }

    pub fn identity(&self) -> Option<&Arc<Identity>> {
        self.identity.as_ref()
    }

    /// The envelope of the open MAIL transaction, if any
    pub fn transaction(&self) -> Option<&Envelope> {
        self.transaction.as_ref()
    }

    pub fn helo_domain(&self) -> Option<&str> {
        self.helo_domain.as_deref()
    }

    pub fn unrecognized_count(&self) -> usize {
        self.policy.unrecognized_count()
    }

    pub fn commands_processed(&self) -> usize {
        self.policy.commands()
    }

    pub async fn write_reply(&mut self, reply: &Reply) -> Result<(), TransportError> {
        let transport = self.transport()?;
        for line in reply.wire_lines() {
            transport.write_line(&line).await?;
        }
        Ok(())
    }

    pub async fn write_response<S: Into<String>>(
        &mut self,
        code: u16,
        message: S,
    ) -> Result<(), TransportError> {
        self.write_reply(&Reply::new(code, message)).await
    }

    /// Sends a 334 challenge and returns the client's response line.
    pub async fn challenge(&mut self, text: &str) -> Result<String, TransportError> {
        self.write_response(334, text).await?;
        let max_line_length = self.server.config.max_line_length;
        self.transport()?.read_line(max_line_length).await
    }

    /// Runs the command loop until the client quits, the connection
    /// fails, or a limit is reached.
    pub async fn run(&mut self) -> Result<(), TransportError> {
        let greeting = format!(
            "{} {}",
            self.hostname(),
            chrono::Utc::now().format("%a, %d %b %Y %H:%M:%S %z")
        );
        self.write_response(220, greeting).await?;

        let max_line_length = self.server.config.max_line_length;
        loop {
            if self.policy.commands_exhausted() {
                tracing::warn!(
                    "closing session after {} commands",
                    self.policy.commands()
                );
                break;
            }
            let line = match self.transport()?.read_line(max_line_length).await {
                Ok(line) => line,
                Err(TransportError::SizeExceeded { .. }) => {
                    self.policy.command_received();
                    self.write_response(554, "Line too long").await?;
                    continue;
                }
                Err(TransportError::InvalidUtf8(_)) => {
                    self.policy.command_received();
                    if self.unrecognized().await? == Flow::Close {
                        break;
                    }
                    continue;
                }
                Err(err) => return Err(err),
            };
            self.policy.command_received();

            if self.handle_line(&line).await? == Flow::Close {
                break;
            }
        }

        self.transport()?.shutdown().await;
        Ok(())
    }

    /// Dispatches a single command line
    pub async fn handle_line(&mut self, line: &str) -> Result<Flow, TransportError> {
        let command = Command::parse(line);
        let server = Arc::clone(&self.server);

        if server.disabled.contains(&command.verb) {
            self.policy.recognized();
            let code = if command.is("EHLO") { 550 } else { 502 };
            self.write_response(code, "Not implemented").await?;
            return Ok(Flow::Continue);
        }

        if let Some(extension) = server.extensions.get(&command.verb) {
            self.policy.recognized();
            return match extension.handle(self, &command.args).await {
                Err(err) if !err.is_terminal() => {
                    tracing::debug!("{} extension: {err:#}", command.verb);
                    self.write_response(554, format!("Error: {err}")).await?;
                    Ok(Flow::Continue)
                }
                result => result,
            };
        }

        let flow = match command.verb.as_str() {
            "HELO" => self.helo(&command.args).await?,
            "EHLO" => self.ehlo(&command.args).await?,
            "MAIL" => self.mail(&command.args).await?,
            "RCPT" => self.rcpt(&command.args).await?,
            "DATA" => self.data().await?,
            "RSET" => {
                self.transaction.take();
                self.write_response(250, "OK").await?;
                Flow::Continue
            }
            "VRFY" | "EXPN" | "HELP" | "NOOP" => {
                self.write_response(250, "OK").await?;
                Flow::Continue
            }
            "QUIT" => {
                self.write_response(221, "Bye").await?;
                Flow::Close
            }
            "STARTTLS" => self.starttls().await?,
            "AUTH" => self.auth(&command.args).await?,
            _ => return self.unrecognized().await,
        };
        self.policy.recognized();
        Ok(flow)
    }

    async fn unrecognized(&mut self) -> Result<Flow, TransportError> {
        let verdict = self.policy.unrecognized();
        self.write_response(500, "unrecognized command").await?;
        if verdict == Verdict::TooManyUnrecognized {
            tracing::warn!("closing session after too many unrecognized commands");
            self.write_response(500, "Too many unrecognized commands")
                .await?;
            return Ok(Flow::Close);
        }
        Ok(Flow::Continue)
    }

    async fn helo(&mut self, domain: &str) -> Result<Flow, TransportError> {
        self.transaction.take();
        self.helo_domain.replace(domain.to_string());
        let text = format!("{} Hello {domain}", self.hostname());
        self.write_response(250, text.trim_end()).await?;
        Ok(Flow::Continue)
    }

    async fn ehlo(&mut self, domain: &str) -> Result<Flow, TransportError> {
        self.transaction.take();
        self.helo_domain.replace(domain.to_string());

        let server = Arc::clone(&self.server);
        let peer = self
            .peer_address()
            .map(|addr| addr.ip().to_string())
            .unwrap_or_default();
        let mut lines = vec![
            format!("{} Hello {peer}", self.hostname()),
            format!("SIZE {}", server.config.max_message_size),
        ];
        if server.tls.is_some() && !self.is_encrypted() {
            lines.push("STARTTLS".to_string());
        }
        if let Some(auth) = &server.auth {
            if self.identity.is_none() && !auth.is_empty() {
                lines.push(format!("AUTH {}", auth.mechanism_list()));
            }
        }
        lines.extend(server.extensions.describe());
        lines.push("HELP".to_string());

        self.write_reply(&Reply::multi_line(250, lines)).await?;
        Ok(Flow::Continue)
    }

    /// Returns true (having sent a 530) if the session must authenticate
    /// before starting a transaction
    async fn needs_authentication(&mut self) -> Result<bool, TransportError> {
        if self.server.config.require_authentication
            && self.server.auth.is_some()
            && self.identity.is_none()
        {
            self.write_response(530, "Authentication required").await?;
            return Ok(true);
        }
        Ok(false)
    }

    async fn mail(&mut self, args: &str) -> Result<Flow, TransportError> {
        if self.needs_authentication().await? {
            return Ok(Flow::Continue);
        }
        let sender = extract_address(args, "FROM:").unwrap_or_else(|err| {
            tracing::warn!("MAIL {args:?}: {err:#}");
            String::new()
        });
        self.transaction.replace(Envelope {
            sender,
            recipients: vec![],
        });
        self.write_response(250, "OK").await?;
        Ok(Flow::Continue)
    }

    async fn rcpt(&mut self, args: &str) -> Result<Flow, TransportError> {
        if self.needs_authentication().await? {
            return Ok(Flow::Continue);
        }
        match extract_address(args, "TO:") {
            Ok(recipient) => self
                .transaction
                .get_or_insert_with(Envelope::default)
                .recipients
                .push(recipient),
            Err(err) => tracing::warn!("RCPT {args:?}: {err:#}"),
        }
        self.write_response(250, "Accepted").await?;
        Ok(Flow::Continue)
    }

    async fn data(&mut self) -> Result<Flow, TransportError> {
        if self.needs_authentication().await? {
            return Ok(Flow::Continue);
        }
        self.write_response(354, "Enter message, ending with \".\" on a line by itself")
            .await?;

        let max_message_size = self.server.config.max_message_size;
        let envelope = self.transaction.take().unwrap_or_default();
        let data = match self.transport()?.read_data(max_message_size).await {
            Ok(data) => data,
            Err(TransportError::SizeExceeded { limit }) => {
                tracing::info!("rejected message larger than {limit} bytes");
                self.write_response(554, "Error: maximum message size exceeded")
                    .await?;
                return Ok(Flow::Continue);
            }
            Err(err) => return Err(err),
        };

        let server = Arc::clone(&self.server);
        let message = match server.decoder.decode(&data) {
            Ok(message) => message,
            Err(err) => {
                tracing::info!("could not decode message: {err:#}");
                self.write_response(554, format!("Error: {err}")).await?;
                return Ok(Flow::Continue);
            }
        };

        match server.handler.handle(&envelope, &message).await {
            Ok(()) => {
                tracing::info!(
                    "queued {} from {:?} for {:?}",
                    message.id,
                    envelope.sender,
                    envelope.recipients
                );
                self.write_response(250, format!("OK : queued as {}", message.id))
                    .await?;
            }
            Err(err) => {
                tracing::info!("handler refused message: {err:#}");
                self.write_response(err.code, format!("Error: {}", err.message))
                    .await?;
            }
        }
        Ok(Flow::Continue)
    }

    async fn starttls(&mut self) -> Result<Flow, TransportError> {
        let Some(acceptor) = self.server.tls.clone() else {
            self.write_response(454, "TLS not available").await?;
            return Ok(Flow::Continue);
        };
        if self.is_encrypted() {
            self.write_response(503, "Already running in TLS").await?;
            return Ok(Flow::Continue);
        }

        self.write_response(220, "Ready to start TLS").await?;
        let transport = self.transport.take().ok_or(TransportError::NotConnected)?;
        match transport.upgrade(&acceptor).await {
            Ok(upgraded) => {
                self.transport.replace(upgraded);
                Ok(Flow::Continue)
            }
            Err(err) => {
                tracing::warn!("STARTTLS failed: {err:#}");
                Err(err)
            }
        }
    }

    async fn auth(&mut self, args: &str) -> Result<Flow, TransportError> {
        let Some(auth) = self.server.auth.clone() else {
            self.write_response(502, "Not implemented").await?;
            return Ok(Flow::Continue);
        };
        if self.identity.is_some() {
            self.write_response(503, "Already authenticated").await?;
            return Ok(Flow::Continue);
        }

        let (mechanism, initial) = match args.trim().split_once(' ') {
            Some((mechanism, initial)) => (mechanism, initial.trim()),
            None => (args.trim(), ""),
        };
        if mechanism.is_empty() {
            self.write_response(501, "Syntax: AUTH mechanism [initial-response]")
                .await?;
            return Ok(Flow::Continue);
        }

        match auth.negotiate(mechanism, initial, self).await {
            Ok(identity) => {
                tracing::info!(
                    "authenticated as {} via {}",
                    identity.authzid,
                    identity.mechanism
                );
                self.identity.replace(identity);
                self.write_response(235, "Authentication succeeded").await?;
            }
            Err(AuthError::Transport(err)) if err.is_terminal() => return Err(err),
            Err(err) => {
                tracing::debug!("AUTH {mechanism}: {err:#}");
                self.write_reply(&err.reply()).await?;
            }
        }
        Ok(Flow::Continue)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("Session")
            .field("peer_address", &self.peer_address())
            .field("encrypted", &self.is_encrypted())
            .field("identity", &self.identity)
            .field("transaction", &self.transaction)
            .field("helo_domain", &self.helo_domain)
            .finish()
    }
}
