use k9::assert_equal;
use pop3d::{MemoryMaildrop, Pop3Server, Pop3ServerConfig, StaticMaildropProvider};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

struct Client {
    stream: BufReader<TcpStream>,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        Self {
            stream: BufReader::new(TcpStream::connect(addr).await.unwrap()),
        }
    }

    async fn line(&mut self) -> String {
        let mut line = String::new();
        self.stream.read_line(&mut line).await.unwrap();
        line.trim_end().to_string()
    }

    async fn command(&mut self, line: &str) -> String {
        self.stream
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .unwrap();
        self.line().await
    }
}

fn config() -> Pop3ServerConfig {
    Pop3ServerConfig {
        listen: "127.0.0.1:0".to_string(),
        hostname: "pop.example.com".to_string(),
        ..Default::default()
    }
}

async fn start(config: Pop3ServerConfig, maildrop: &Arc<MemoryMaildrop>) -> SocketAddr {
    let mut provider = StaticMaildropProvider::new();
    provider.add_user("bob", "hunter2", Arc::clone(maildrop));
    let listener = Pop3Server::new(config, provider).bind().await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(listener.serve());
    addr
}

#[tokio::test]
async fn pop3_conversation() {
    let maildrop = Arc::new(MemoryMaildrop::new());
    maildrop.push("a1", "Subject: hello\r\n\r\nhi\r\n");
    let addr = start(config(), &maildrop).await;

    let mut client = Client::connect(addr).await;
    assert_equal!(client.line().await, "+OK POP3 server ready");
    assert_equal!(client.command("LIST").await, "-ERR Authentication required");
    assert_equal!(client.command("USER bob").await, "+OK");
    assert_equal!(
        client.command("PASS hunter2").await,
        "+OK maildrop has 1 messages (22 octets)"
    );
    assert_equal!(client.command("DELE 1").await, "+OK Message 1 deleted");
    assert_equal!(
        client.command("QUIT").await,
        "+OK pop.example.com POP3 server signing off"
    );
    assert_equal!(client.line().await, "");

    assert!(maildrop.ids().is_empty());
    assert!(!maildrop.is_locked());
}

#[tokio::test]
async fn second_session_sees_locked_maildrop() {
    let maildrop = Arc::new(MemoryMaildrop::new());
    let addr = start(config(), &maildrop).await;

    let mut first = Client::connect(addr).await;
    first.line().await;
    first.command("USER bob").await;
    assert_equal!(
        first.command("PASS hunter2").await,
        "+OK maildrop has 0 messages (0 octets)"
    );

    let mut second = Client::connect(addr).await;
    second.line().await;
    second.command("USER bob").await;
    assert_equal!(
        second.command("PASS hunter2").await,
        "-ERR [IN-USE] Unable to lock maildrop"
    );

    first.command("QUIT").await;
    assert_equal!(first.line().await, "");
    second.command("USER bob").await;
    assert_equal!(
        second.command("PASS hunter2").await,
        "+OK maildrop has 0 messages (0 octets)"
    );
}

#[tokio::test]
async fn connection_limit() {
    let config = Pop3ServerConfig {
        max_connections: 1,
        ..config()
    };
    let maildrop = Arc::new(MemoryMaildrop::new());
    let addr = start(config, &maildrop).await;

    let mut first = Client::connect(addr).await;
    assert_equal!(first.line().await, "+OK POP3 server ready");

    let mut second = Client::connect(addr).await;
    assert_equal!(second.line().await, "-ERR Too many connections");
    assert_equal!(second.line().await, "");
}
