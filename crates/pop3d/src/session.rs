use crate::maildrop::{Maildrop, MaildropError};
use crate::provider::{Credentials, Pop3AuthError};
use crate::server::ServerState;
use mailwire::stuffing::apply_dot_stuffing;
use mailwire::{Command, FloodPolicy, Transport, TransportError, Verdict};
use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pop3State {
    Authorization,
    Transaction,
    Update,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

/// Verbs that are only valid once the client has authenticated
const TRANSACTION_VERBS: &[&str] = &[
    "STAT", "LIST", "UIDL", "RETR", "TOP", "DELE", "RSET", "NOOP",
];

/// Verbs that are only valid before the client has authenticated
const AUTHORIZATION_VERBS: &[&str] = &["USER", "PASS", "APOP", "STLS"];

pub struct Pop3Session {
    server: Arc<ServerState>,
    transport: Option<Transport>,
    state: Pop3State,
    user: Option<String>,
    maildrop: Option<Arc<dyn Maildrop>>,
    apop_timestamp: Option<String>,
    policy: FloodPolicy,
}

impl Pop3Session {
    pub(crate) fn new(server: Arc<ServerState>, transport: Transport) -> Self {
        let policy = FloodPolicy::new(
            server.config.max_commands,
            server.config.max_unrecognized_commands,
        );
        let apop_timestamp = server.provider.supports_apop().then(|| {
            let nanos = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or_default();
            format!(
                "<{}.{nanos}@{}>",
                std::process::id(),
                server.config.hostname
            )
        });
        Self {
            server,
            transport: Some(transport),
            state: Pop3State::Authorization,
            user: None,
            maildrop: None,
            apop_timestamp,
            policy,
        }
    }

    fn transport(&mut self) -> Result<&mut Transport, TransportError> {
        self.transport.as_mut().ok_or(TransportError::NotConnected)
    }

    pub fn state(&self) -> Pop3State {
        self.state
    }

    /// The authenticated user, once in the TRANSACTION state
    pub fn user(&self) -> Option<&str> {
        match self.state {
            Pop3State::Authorization => None,
            _ => self.user.as_deref(),
        }
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

    pub fn unrecognized_count(&self) -> usize {
        self.policy.unrecognized_count()
    }

    async fn ok<S: AsRef<str>>(&mut self, message: S) -> Result<(), TransportError> {
        let line = format!("+OK {}", message.as_ref());
        self.transport()?.write_line(line.trim_end()).await
    }

    async fn err<S: AsRef<str>>(&mut self, message: S) -> Result<(), TransportError> {
        let line = format!("-ERR {}", message.as_ref());
        self.transport()?.write_line(&line).await
    }

    /// Sends a positive status line followed by a dot-terminated body
    async fn multi_line(&mut self, status: &str, body: &[u8]) -> Result<(), TransportError> {
        self.ok(status).await?;
        let mut data = apply_dot_stuffing(body).into_owned();
        if !data.is_empty() && !data.ends_with(b"\r\n") {
            data.extend_from_slice(b"\r\n");
        }
        data.extend_from_slice(b".\r\n");
        self.transport()?.write_all(&data).await
    }

    /// Runs the session to completion. The maildrop, if one was opened,
    /// is always unlocked before this returns.
    pub async fn run(&mut self) -> Result<(), TransportError> {
        let result = self.command_loop().await;
        if let Some(maildrop) = self.maildrop.take() {
            if let Err(err) = maildrop.unlock().await {
                tracing::error!("failed to unlock maildrop: {err:#}");
            }
        }
        if let Some(transport) = self.transport.as_mut() {
            transport.shutdown().await;
        }
        result
    }

    async fn command_loop(&mut self) -> Result<(), TransportError> {
        let greeting = match &self.apop_timestamp {
            Some(timestamp) => format!("POP3 server ready {timestamp}"),
            None => "POP3 server ready".to_string(),
        };
        self.ok(greeting).await?;

        let max_line_length = self.server.config.max_line_length;
        loop {
            if self.policy.commands_exhausted() {
                tracing::warn!(
                    "closing session after {} commands",
                    self.policy.commands()
                );
                return Ok(());
            }
            let line = match self.transport()?.read_line(max_line_length).await {
                Ok(line) => line,
                Err(TransportError::SizeExceeded { .. }) => {
                    self.policy.command_received();
                    self.err("Line too long").await?;
                    continue;
                }
                Err(TransportError::InvalidUtf8(_)) => {
                    self.policy.command_received();
                    if self.unrecognized("Command not understood").await? == Flow::Close {
                        return Ok(());
                    }
                    continue;
                }
                Err(err) => return Err(err),
            };
            self.policy.command_received();

            if self.handle_line(&line).await? == Flow::Close {
                return Ok(());
            }
        }
    }

    async fn unrecognized(&mut self, message: &str) -> Result<Flow, TransportError> {
        let verdict = self.policy.unrecognized();
        self.err(message).await?;
        if verdict == Verdict::TooManyUnrecognized {
            tracing::warn!("closing session after too many unrecognized commands");
            self.err("Too many unrecognized commands").await?;
            return Ok(Flow::Close);
        }
        Ok(Flow::Continue)
    }

    async fn handle_line(&mut self, line: &str) -> Result<Flow, TransportError> {
        let command = Command::parse(line);
        let verb = command.verb.as_str();
        let known = verb == "QUIT"
            || verb == "CAPA"
            || TRANSACTION_VERBS.contains(&verb)
            || AUTHORIZATION_VERBS.contains(&verb);

        if self.server.disabled.contains(verb) {
            self.policy.recognized();
            self.err("Feature is disabled").await?;
            return Ok(Flow::Continue);
        }

        if self.state == Pop3State::Authorization
            && !matches!(verb, "QUIT" | "USER" | "PASS" | "APOP" | "CAPA" | "STLS")
        {
            if !known {
                return self.unrecognized("Authentication required").await;
            }
            self.policy.recognized();
            self.err("Authentication required").await?;
            return Ok(Flow::Continue);
        }

        if !known {
            return self.unrecognized("Command not understood").await;
        }
        self.policy.recognized();

        let args = command.args.trim();
        match (self.state, verb) {
            (_, "CAPA") => self.capa().await?,
            (Pop3State::Authorization, "QUIT") => {
                self.sign_off().await?;
                return Ok(Flow::Close);
            }
            (Pop3State::Authorization, "USER") => self.user_command(args).await?,
            (Pop3State::Authorization, "PASS") => self.pass(args).await?,
            (Pop3State::Authorization, "APOP") => self.apop(args).await?,
            (Pop3State::Authorization, "STLS") => self.stls().await?,
            (Pop3State::Transaction, "QUIT") => {
                self.update().await?;
                return Ok(Flow::Close);
            }
            (Pop3State::Transaction, "STAT") => self.stat().await?,
            (Pop3State::Transaction, "LIST") => self.list(args, false).await?,
            (Pop3State::Transaction, "UIDL") => self.list(args, true).await?,
            (Pop3State::Transaction, "RETR") => self.retr(args).await?,
            (Pop3State::Transaction, "TOP") => self.top(args).await?,
            (Pop3State::Transaction, "DELE") => self.dele(args).await?,
            (Pop3State::Transaction, "RSET") => self.rset().await?,
            (Pop3State::Transaction, "NOOP") => self.ok("").await?,
            _ => self.err("Command not valid in this state").await?,
        }
        Ok(Flow::Continue)
    }

    async fn sign_off(&mut self) -> Result<(), TransportError> {
        let message = format!("{} POP3 server signing off", self.server.config.hostname);
        self.ok(message).await
    }

    async fn capa(&mut self) -> Result<(), TransportError> {
        let mut caps = vec!["USER", "TOP", "UIDL", "PIPELINING"];
        if self.state == Pop3State::Authorization
            && self.server.tls.is_some()
            && !self.is_encrypted()
        {
            caps.push("STLS");
        }
        let body = caps.join("\r\n");
        self.multi_line("Capability list follows", body.as_bytes())
            .await
    }

    async fn user_command(&mut self, args: &str) -> Result<(), TransportError> {
        if args.is_empty() {
            return self.err("Missing username").await;
        }
        self.user.replace(args.to_string());
        self.ok("").await
    }

    async fn pass(&mut self, args: &str) -> Result<(), TransportError> {
        let Some(user) = self.user.clone() else {
            return self.err("USER first").await;
        };
        let credentials = Credentials::User {
            user,
            password: args.to_string(),
        };
        self.authenticate(credentials).await
    }

    async fn apop(&mut self, args: &str) -> Result<(), TransportError> {
        let Some(timestamp) = self.apop_timestamp.clone() else {
            return self.err("APOP not supported").await;
        };
        let Some((user, digest)) = args.split_once(' ') else {
            return self.err("Syntax: APOP name digest").await;
        };
        let credentials = Credentials::Apop {
            user: user.to_string(),
            timestamp,
            digest: digest.trim().to_ascii_lowercase(),
        };
        self.authenticate(credentials).await
    }

    async fn authenticate(&mut self, credentials: Credentials) -> Result<(), TransportError> {
        let provider = Arc::clone(&self.server.provider);
        let maildrop = match provider.open(&credentials).await {
            Ok(maildrop) => maildrop,
            Err(Pop3AuthError::Maildrop(err)) => {
                tracing::warn!("opening maildrop for {}: {err:#}", credentials.user());
                self.user.take();
                return self.err("Unable to open maildrop").await;
            }
            Err(err) => {
                tracing::info!("authentication failed for {}: {err:#}", credentials.user());
                self.user.take();
                return self.err("Invalid credentials").await;
            }
        };

        if let Err(err) = maildrop.lock().await {
            tracing::info!("locking maildrop for {}: {err:#}", credentials.user());
            self.user.take();
            return self.err("[IN-USE] Unable to lock maildrop").await;
        }

        self.user.replace(credentials.user().to_string());
        self.maildrop.replace(maildrop);
        self.state = Pop3State::Transaction;
        tracing::info!("{} entered the transaction state", credentials.user());

        match self.summary().await {
            Ok(summary) => self.ok(summary).await,
            Err(err) => self.maildrop_error(err).await,
        }
    }

    async fn stls(&mut self) -> Result<(), TransportError> {
        let Some(acceptor) = self.server.tls.clone() else {
            return self.err("TLS not available").await;
        };
        if self.is_encrypted() {
            return self.err("Already running in TLS").await;
        }
        self.ok("Begin TLS negotiation").await?;
        let transport = self.transport.take().ok_or(TransportError::NotConnected)?;
        match transport.upgrade(&acceptor).await {
            Ok(upgraded) => {
                self.transport.replace(upgraded);
                Ok(())
            }
            Err(err) => {
                tracing::warn!("STLS failed: {err:#}");
                Err(err)
            }
        }
    }

    fn maildrop(&self) -> Result<Arc<dyn Maildrop>, MaildropError> {
        self.maildrop.clone().ok_or(MaildropError::NotLocked)
    }

    async fn summary(&mut self) -> Result<String, MaildropError> {
        let maildrop = self.maildrop()?;
        let count = maildrop.count().await?;
        let size = maildrop.size().await?;
        Ok(format!("maildrop has {count} messages ({size} octets)"))
    }

    async fn maildrop_error(&mut self, err: MaildropError) -> Result<(), TransportError> {
        match err {
            MaildropError::NoSuchMessage => self.err("No such message").await,
            MaildropError::AlreadyDeleted => self.err("Message already deleted").await,
            err => {
                tracing::error!("maildrop error: {err:#}");
                self.err("Maildrop unavailable").await
            }
        }
    }

    async fn stat(&mut self) -> Result<(), TransportError> {
        let result = match self.maildrop() {
            Ok(maildrop) => async move {
                Ok::<_, MaildropError>((maildrop.count().await?, maildrop.size().await?))
            }
            .await,
            Err(err) => Err(err),
        };
        match result {
            Ok((count, size)) => self.ok(format!("{count} {size}")).await,
            Err(err) => self.maildrop_error(err).await,
        }
    }

    async fn list(&mut self, args: &str, unique_ids: bool) -> Result<(), TransportError> {
        let maildrop = match self.maildrop() {
            Ok(maildrop) => maildrop,
            Err(err) => return self.maildrop_error(err).await,
        };
        let describe = |number: usize, info: &crate::maildrop::MessageInfo| {
            if unique_ids {
                format!("{number} {}", info.id)
            } else {
                format!("{number} {}", info.size)
            }
        };

        if !args.is_empty() {
            let Some(index) = message_index(args) else {
                return self.err("Invalid message number").await;
            };
            return match maildrop.get(index).await {
                Ok(info) => self.ok(describe(index + 1, &info)).await,
                Err(err) => self.maildrop_error(err).await,
            };
        }

        let messages = match maildrop.messages().await {
            Ok(messages) => messages,
            Err(err) => return self.maildrop_error(err).await,
        };
        let body = messages
            .iter()
            .map(|(index, info)| describe(index + 1, info))
            .collect::<Vec<_>>()
            .join("\r\n");
        let status = if unique_ids {
            "Unique-ID listing follows".to_string()
        } else {
            let size: usize = messages.iter().map(|(_, info)| info.size).sum();
            format!("{} messages ({size} octets)", messages.len())
        };
        self.multi_line(&status, body.as_bytes()).await
    }

    async fn retr(&mut self, args: &str) -> Result<(), TransportError> {
        let Some(index) = message_index(args) else {
            return self.err("Invalid message number").await;
        };
        let content = match self.content(index).await {
            Ok(content) => content,
            Err(err) => return self.maildrop_error(err).await,
        };
        self.multi_line(&format!("{} octets", content.len()), &content)
            .await
    }

    async fn top(&mut self, args: &str) -> Result<(), TransportError> {
        let mut fields = args.split_whitespace();
        let (Some(index), Some(lines)) = (
            fields.next().and_then(message_index),
            fields.next().and_then(|n| n.parse::<usize>().ok()),
        ) else {
            return self.err("Syntax: TOP msg n").await;
        };
        let content = match self.content(index).await {
            Ok(content) => content,
            Err(err) => return self.maildrop_error(err).await,
        };
        self.multi_line("Top of message follows", top_of_message(&content, lines))
            .await
    }

    async fn content(&mut self, index: usize) -> Result<Vec<u8>, MaildropError> {
        let maildrop = self.maildrop()?;
        maildrop.content(index).await
    }

    async fn dele(&mut self, args: &str) -> Result<(), TransportError> {
        let Some(index) = message_index(args) else {
            return self.err("Invalid message number").await;
        };
        let result = match self.maildrop() {
            Ok(maildrop) => maildrop.flag(index).await,
            Err(err) => Err(err),
        };
        match result {
            Ok(()) => self.ok(format!("Message {} deleted", index + 1)).await,
            Err(err) => self.maildrop_error(err).await,
        }
    }

    async fn rset(&mut self) -> Result<(), TransportError> {
        let result = match self.maildrop() {
            Ok(maildrop) => maildrop.unflag_all().await,
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            return self.maildrop_error(err).await;
        }
        match self.summary().await {
            Ok(summary) => self.ok(summary).await,
            Err(err) => self.maildrop_error(err).await,
        }
    }

    async fn update(&mut self) -> Result<(), TransportError> {
        self.state = Pop3State::Update;
        let result = match self.maildrop() {
            Ok(maildrop) => maildrop.delete().await,
            Err(err) => Err(err),
        };
        match result {
            Ok(deleted) => {
                tracing::info!("removed {deleted} messages");
                self.sign_off().await
            }
            Err(err) => {
                tracing::error!("failed to remove deleted messages: {err:#}");
                self.err("Some deleted messages not removed").await
            }
        }
    }
}

/// Converts a 1-based message number from the wire into an index
fn message_index(arg: &str) -> Option<usize> {
    arg.trim().parse::<usize>().ok()?.checked_sub(1)
}

/// The header block, the blank line that ends it and up to `lines`
/// lines of the body
fn top_of_message(content: &[u8], lines: usize) -> &[u8] {
    let body_start = match memchr::memmem::find(content, b"\r\n\r\n") {
        Some(idx) => idx + 4,
        None => return content,
    };
    let mut end = body_start;
    for _ in 0..lines {
        match memchr::memchr(b'\n', &content[end..]) {
            Some(idx) => end += idx + 1,
            None => return content,
        }
    }
    &content[..end]
}

impl std::fmt::Debug for Pop3Session {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("Pop3Session")
            .field("peer_address", &self.peer_address())
            .field("state", &self.state)
            .field("user", &self.user)
            .field("encrypted", &self.is_encrypted())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn message_numbers() {
        k9::assert_equal!(message_index("1"), Some(0));
        k9::assert_equal!(message_index(" 12 "), Some(11));
        k9::assert_equal!(message_index("0"), None);
        k9::assert_equal!(message_index("-1"), None);
        k9::assert_equal!(message_index("one"), None);
    }

    #[test]
    fn top() {
        let msg = b"Subject: x\r\nFrom: a@b\r\n\r\nline1\r\nline2\r\nline3\r\n";
        k9::assert_equal!(
            top_of_message(msg, 0),
            b"Subject: x\r\nFrom: a@b\r\n\r\n".as_slice()
        );
        k9::assert_equal!(
            top_of_message(msg, 2),
            b"Subject: x\r\nFrom: a@b\r\n\r\nline1\r\nline2\r\n".as_slice()
        );
        k9::assert_equal!(top_of_message(msg, 10), msg.as_slice());
        k9::assert_equal!(top_of_message(b"no body", 1), b"no body".as_slice());
    }

    use crate::maildrop::MemoryMaildrop;
    use crate::provider::{MaildropProvider, StaticMaildropProvider};
    use crate::{Pop3Server, Pop3ServerConfig};
    use async_trait::async_trait;
    use k9::assert_equal;
    use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
    use tokio::task::JoinHandle;

    struct Client<S> {
        stream: BufReader<S>,
    }

    impl<S: AsyncRead + AsyncWrite + Unpin> Client<S> {
        async fn line(&mut self) -> String {
            let mut line = String::new();
            self.stream.read_line(&mut line).await.unwrap();
            line.trim_end_matches("\r\n").to_string()
        }

        async fn command(&mut self, line: &str) -> String {
            self.stream
                .write_all(format!("{line}\r\n").as_bytes())
                .await
                .unwrap();
            self.line().await
        }

        /// Reads the body of a multi-line response, undoing dot-stuffing
        async fn body(&mut self) -> Vec<String> {
            let mut lines = vec![];
            loop {
                let line = self.line().await;
                if line == "." {
                    return lines;
                }
                lines.push(line.strip_prefix('.').map(str::to_string).unwrap_or(line));
            }
        }
    }

    type Running = JoinHandle<(Pop3Session, Result<(), TransportError>)>;

    fn config() -> Pop3ServerConfig {
        Pop3ServerConfig {
            hostname: "pop.example.com".to_string(),
            ..Default::default()
        }
    }

    fn alice_maildrop() -> Arc<MemoryMaildrop> {
        let md = Arc::new(MemoryMaildrop::new());
        md.push("uid-1", "Subject: one\r\n\r\nfirst\r\n.hidden\r\n");
        md.push("uid-2", "Subject: two\r\n\r\nsecond\r\nmore\r\nlines\r\n");
        md
    }

    fn provider(maildrop: &Arc<MemoryMaildrop>) -> StaticMaildropProvider {
        let mut provider = StaticMaildropProvider::new();
        provider.add_user("alice", "secret", Arc::clone(maildrop));
        provider
    }

    async fn start(server: Pop3Server) -> (Running, Client<tokio::io::DuplexStream>) {
        let (server_side, client_side) = tokio::io::duplex(64 * 1024);
        let mut session = server
            .build()
            .session(Box::new(server_side), "10.0.0.2:5555".parse().unwrap());
        let running = tokio::spawn(async move {
            let result = session.run().await;
            (session, result)
        });
        let mut client = Client {
            stream: BufReader::new(client_side),
        };
        assert_equal!(client.line().await, "+OK POP3 server ready");
        (running, client)
    }

    async fn login(client: &mut Client<tokio::io::DuplexStream>) {
        assert_equal!(client.command("USER alice").await, "+OK");
        assert_equal!(
            client.command("PASS secret").await,
            "+OK maildrop has 2 messages (69 octets)"
        );
    }

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn session_can_run_on_a_spawned_task() {
        let md = alice_maildrop();
        let (server_side, _client) = tokio::io::duplex(1024);
        let mut session = Pop3Server::new(config(), provider(&md))
            .build()
            .session(Box::new(server_side), "10.0.0.2:5555".parse().unwrap());
        assert_send(&session.run());
    }

    #[tokio::test]
    async fn authentication_required() {
        let md = alice_maildrop();
        let (running, mut client) = start(Pop3Server::new(config(), provider(&md))).await;
        assert_equal!(client.command("LIST").await, "-ERR Authentication required");
        assert_equal!(client.command("STAT").await, "-ERR Authentication required");
        assert_equal!(
            client.command("QUIT").await,
            "+OK pop.example.com POP3 server signing off"
        );
        let (session, result) = running.await.unwrap();
        result.unwrap();
        assert_equal!(session.state(), Pop3State::Authorization);
        assert_equal!(session.user(), None);
        assert!(!md.is_locked());
    }

    #[tokio::test]
    async fn bad_credentials() {
        let md = alice_maildrop();
        let (_running, mut client) = start(Pop3Server::new(config(), provider(&md))).await;
        assert_equal!(client.command("PASS secret").await, "-ERR USER first");
        client.command("USER alice").await;
        assert_equal!(client.command("PASS nope").await, "-ERR Invalid credentials");
        // A failed PASS forgets the user
        assert_equal!(client.command("PASS secret").await, "-ERR USER first");
        assert_equal!(
            client.command("APOP alice 0123456789abcdef").await,
            "-ERR APOP not supported"
        );
        assert!(!md.is_locked());
    }

    #[tokio::test]
    async fn list_retr_top() {
        let md = alice_maildrop();
        let (_running, mut client) = start(Pop3Server::new(config(), provider(&md))).await;
        login(&mut client).await;
        assert!(md.is_locked());

        assert_equal!(client.command("STAT").await, "+OK 2 69");
        assert_equal!(client.command("LIST").await, "+OK 2 messages (69 octets)");
        assert_equal!(client.body().await, vec!["1 32", "2 37"]);
        assert_equal!(client.command("LIST 2").await, "+OK 2 37");
        assert_equal!(client.command("LIST 3").await, "-ERR No such message");
        assert_equal!(client.command("LIST x").await, "-ERR Invalid message number");
        assert_equal!(client.command("UIDL").await, "+OK Unique-ID listing follows");
        assert_equal!(client.body().await, vec!["1 uid-1", "2 uid-2"]);
        assert_equal!(client.command("UIDL 1").await, "+OK 1 uid-1");

        assert_equal!(client.command("RETR 1").await, "+OK 32 octets");
        assert_equal!(
            client.body().await,
            vec!["Subject: one", "", "first", ".hidden"]
        );
        assert_equal!(client.command("TOP 2 1").await, "+OK Top of message follows");
        assert_equal!(client.body().await, vec!["Subject: two", "", "second"]);
        assert_equal!(client.command("TOP 2").await, "-ERR Syntax: TOP msg n");
        assert_equal!(client.command("NOOP").await, "+OK");
        assert_equal!(
            client.command("USER bob").await,
            "-ERR Command not valid in this state"
        );
    }

    #[tokio::test]
    async fn deletion_is_deferred_until_update() {
        let md = alice_maildrop();
        let (running, mut client) = start(Pop3Server::new(config(), provider(&md))).await;
        login(&mut client).await;

        assert_equal!(client.command("DELE 1").await, "+OK Message 1 deleted");
        assert_equal!(client.command("DELE 1").await, "-ERR Message already deleted");
        assert_equal!(client.command("RETR 1").await, "-ERR Message already deleted");
        assert_equal!(client.command("STAT").await, "+OK 1 37");
        assert_equal!(
            client.command("RSET").await,
            "+OK maildrop has 2 messages (69 octets)"
        );
        assert_equal!(client.command("DELE 2").await, "+OK Message 2 deleted");
        assert_equal!(md.ids().len(), 2);

        assert_equal!(
            client.command("QUIT").await,
            "+OK pop.example.com POP3 server signing off"
        );
        let (session, result) = running.await.unwrap();
        result.unwrap();
        assert_equal!(session.state(), Pop3State::Update);
        assert_equal!(session.user(), Some("alice"));
        assert_equal!(md.ids(), vec!["uid-1".to_string()]);
        assert!(!md.is_locked());
    }

    #[tokio::test]
    async fn disconnect_discards_flags_and_unlocks() {
        let md = alice_maildrop();
        let (running, mut client) = start(Pop3Server::new(config(), provider(&md))).await;
        login(&mut client).await;
        client.command("DELE 1").await;
        drop(client);

        let (_session, result) = running.await.unwrap();
        assert!(result.unwrap_err().is_hangup());
        assert!(!md.is_locked());
        assert_equal!(md.ids().len(), 2);
    }

    #[tokio::test]
    async fn maildrop_in_use() {
        let md = alice_maildrop();
        md.lock().await.unwrap();
        let (_running, mut client) = start(Pop3Server::new(config(), provider(&md))).await;
        client.command("USER alice").await;
        assert_equal!(
            client.command("PASS secret").await,
            "-ERR [IN-USE] Unable to lock maildrop"
        );
        assert_equal!(client.command("STAT").await, "-ERR Authentication required");
    }

    #[tokio::test]
    async fn disabled_and_unknown_verbs() {
        let config = Pop3ServerConfig {
            disabled: ["top".to_string()].into_iter().collect(),
            ..config()
        };
        let md = alice_maildrop();
        let (running, mut client) = start(Pop3Server::new(config, provider(&md))).await;
        assert_equal!(client.command("TOP 1 1").await, "-ERR Feature is disabled");
        login(&mut client).await;
        assert_equal!(client.command("TOP 1 1").await, "-ERR Feature is disabled");

        for _ in 0..3 {
            assert_equal!(client.command("XYZZY").await, "-ERR Command not understood");
        }
        assert_equal!(client.command("PLUGH").await, "-ERR Command not understood");
        assert_equal!(client.line().await, "-ERR Too many unrecognized commands");
        assert_equal!(client.line().await, "");

        let (session, result) = running.await.unwrap();
        result.unwrap();
        assert_equal!(session.unrecognized_count(), 4);
        assert!(!md.is_locked());
    }

    #[tokio::test]
    async fn capabilities() {
        let md = alice_maildrop();
        let acceptor = mailwire::tls::make_acceptor("pop.example.com", None, None).unwrap();
        let server = Pop3Server::new(config(), provider(&md)).with_tls(acceptor);
        let (_running, mut client) = start(server).await;
        assert_equal!(client.command("CAPA").await, "+OK Capability list follows");
        assert_equal!(
            client.body().await,
            vec!["USER", "TOP", "UIDL", "PIPELINING", "STLS"]
        );
        login(&mut client).await;
        client.command("CAPA").await;
        assert_equal!(client.body().await, vec!["USER", "TOP", "UIDL", "PIPELINING"]);
    }

    #[tokio::test]
    async fn stls() {
        let md = alice_maildrop();
        let acceptor = mailwire::tls::make_acceptor("pop.example.com", None, None).unwrap();
        let server = Pop3Server::new(config(), provider(&md)).with_tls(acceptor);
        let (running, mut client) = start(server).await;
        assert_equal!(client.command("STLS").await, "+OK Begin TLS negotiation");

        let connector = mailwire::tls::make_insecure_connector().unwrap();
        let name = rustls::pki_types::ServerName::try_from("pop.example.com").unwrap();
        let stream = connector
            .connect(name, client.stream.into_inner())
            .await
            .unwrap();
        let mut client = Client {
            stream: BufReader::new(stream),
        };
        assert_equal!(client.command("STLS").await, "-ERR Already running in TLS");
        assert_equal!(client.command("USER alice").await, "+OK");
        assert_equal!(
            client.command("PASS secret").await,
            "+OK maildrop has 2 messages (69 octets)"
        );
        client.command("QUIT").await;
        let (session, result) = running.await.unwrap();
        result.unwrap();
        assert!(session.is_encrypted());
    }

    struct ApopProvider(Arc<MemoryMaildrop>);

    #[async_trait]
    impl MaildropProvider for ApopProvider {
        async fn open(
            &self,
            credentials: &Credentials,
        ) -> Result<Arc<dyn Maildrop>, Pop3AuthError> {
            match credentials {
                Credentials::Apop {
                    user,
                    timestamp,
                    digest,
                } if user == "alice"
                    && timestamp.starts_with('<')
                    && timestamp.ends_with("@pop.example.com>")
                    && digest == "0123456789abcdef0123456789abcdef" =>
                {
                    let maildrop: Arc<dyn Maildrop> = self.0.clone();
                    Ok(maildrop)
                }
                _ => Err(Pop3AuthError::InvalidCredentials),
            }
        }

        fn supports_apop(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn apop() {
        let md = alice_maildrop();
        let (server_side, client_side) = tokio::io::duplex(64 * 1024);
        let mut session = Pop3Server::new(config(), ApopProvider(md.clone()))
            .build()
            .session(Box::new(server_side), "10.0.0.2:5555".parse().unwrap());
        let _running = tokio::spawn(async move { session.run().await });
        let mut client = Client {
            stream: BufReader::new(client_side),
        };

        let greeting = client.line().await;
        assert!(greeting.starts_with("+OK POP3 server ready <"), "{greeting}");
        assert!(greeting.ends_with("@pop.example.com>"), "{greeting}");
        assert_equal!(
            client.command("APOP alice ffffffffffffffffffffffffffffffff").await,
            "-ERR Invalid credentials"
        );
        assert_equal!(client.command("APOP alice").await, "-ERR Syntax: APOP name digest");
        assert_equal!(
            client
                .command("APOP alice 0123456789ABCDEF0123456789ABCDEF")
                .await,
            "+OK maildrop has 2 messages (69 octets)"
        );
    }
}
