//! End-to-end session tests over in-memory duplex streams.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use mailgate_common::Signal;
use mailgate_smtp::{
    Environment, Settings, SmtpConnection,
    hooks::{AcceptAll, Credentials, Hooks, Rejection},
    session::Session,
};
use pretty_assertions::assert_eq;
use tokio::{
    io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader, DuplexStream, ReadHalf, WriteHalf},
    sync::broadcast,
    task::JoinHandle,
};

/// Accepts tim/secret, refuses recipients at example.net.
struct Policy;

#[async_trait]
impl Hooks for Policy {
    async fn on_auth(
        &self,
        credentials: Credentials,
        _session: &Session,
    ) -> Result<String, Rejection> {
        match &credentials {
            Credentials::Plain { username, password }
            | Credentials::Login { username, password }
                if username == "tim" && password == "secret" =>
            {
                Ok(username.clone())
            }
            _ => Err(Rejection::message("Error: authentication failed")),
        }
    }

    async fn on_rcpt_to(&self, session: &Session) -> Result<(), Rejection> {
        if session
            .envelope
            .rcpt_to
            .iter()
            .any(|rcpt| rcpt.address.ends_with("@example.net"))
        {
            Err(Rejection::new(550, "Error: no thanks"))
        } else {
            Ok(())
        }
    }
}

struct Client {
    reader: BufReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
    server: JoinHandle<()>,
    shutdown: broadcast::Sender<Signal>,
}

impl Client {
    async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .unwrap();
    }

    async fn raw(&mut self, bytes: &str) {
        self.writer.write_all(bytes.as_bytes()).await.unwrap();
    }

    async fn line(&mut self) -> String {
        let mut line = String::new();
        let read = self.reader.read_line(&mut line).await.unwrap();
        assert!(read > 0, "server closed the stream early");
        line.trim_end().to_string()
    }

    /// All lines of one (possibly multi-line) reply.
    async fn reply(&mut self) -> Vec<String> {
        let mut lines = Vec::new();

        loop {
            let line = self.line().await;
            let done = line.as_bytes().get(3) != Some(&b'-');
            lines.push(line);

            if done {
                return lines;
            }
        }
    }
}

fn connect(settings: Settings, hooks: Arc<dyn Hooks>) -> Client {
    let (client, server) = tokio::io::duplex(4096);
    let (shutdown, receiver) = broadcast::channel(4);

    let env = Environment {
        settings: Arc::new(Settings {
            disable_reverse_lookup: true,
            ..settings
        }),
        hooks,
        middleware: Vec::new(),
        reverse_dns: None,
        tls_config: None,
    };

    let local: SocketAddr = "127.0.0.1:25".parse().unwrap();
    let remote: SocketAddr = "192.0.2.7:54321".parse().unwrap();
    let connection = SmtpConnection::new(server, local, remote, env, receiver);

    let handle = tokio::spawn(async move {
        let _ = connection.run().await;
    });

    let (reader, writer) = tokio::io::split(client);

    Client {
        reader: BufReader::new(reader),
        writer,
        server: handle,
        shutdown,
    }
}

fn settings() -> Settings {
    Settings {
        name: "mail.example.com".to_string(),
        auth_optional: true,
        ..Settings::default()
    }
}

#[tokio::test]
async fn greeting_then_ehlo_features() {
    let mut client = connect(settings(), Arc::new(AcceptAll));

    assert_eq!(client.line().await, "220 mail.example.com ESMTP");

    client.send("EHLO client.example").await;
    let reply = client.reply().await;

    assert_eq!(reply[0], "250-mail.example.com Welcome, [192.0.2.7]");
    assert!(reply.contains(&"250-PIPELINING".to_string()));
    assert!(reply.iter().any(|line| line.starts_with("250 ")));
}

#[tokio::test]
async fn pipelined_transaction_replies_in_order() {
    let mut client = connect(settings(), Arc::new(Policy));
    client.line().await;

    client.send("EHLO client.example").await;
    client.reply().await;

    // One write, four commands: replies must come back in command order.
    client
        .raw(
            "MAIL FROM:<a@b.com>\r\nRCPT TO:<c@d.com>\r\nRCPT TO:<x@example.net>\r\nDATA\r\n",
        )
        .await;

    assert_eq!(client.line().await, "250 Accepted");
    assert_eq!(client.line().await, "250 Accepted");
    assert_eq!(client.line().await, "550 Error: no thanks");
    assert_eq!(client.line().await, "354 End data with <CR><LF>.<CR><LF>");

    client.raw("Subject: hi\r\n\r\nhello\r\n.\r\n").await;
    assert_eq!(client.line().await, "250 Message accepted");

    // The transaction reset after DATA: a fresh MAIL is accepted.
    client.send("MAIL FROM:<a@b.com>").await;
    assert_eq!(client.line().await, "250 Accepted");
}

#[tokio::test]
async fn auth_login_round_trip() {
    let auth_settings = Settings {
        allow_insecure_auth: true,
        auth_optional: false,
        ..settings()
    };
    let mut client = connect(auth_settings, Arc::new(Policy));
    client.line().await;

    client.send("EHLO client.example").await;
    client.reply().await;

    client.send("MAIL FROM:<a@b.com>").await;
    assert_eq!(client.line().await, "530 Error: authentication required");

    client.send("AUTH LOGIN").await;
    assert_eq!(client.line().await, "334 VXNlcm5hbWU6");
    client.send(&STANDARD.encode("tim")).await;
    assert_eq!(client.line().await, "334 UGFzc3dvcmQ6");
    client.send(&STANDARD.encode("wrong")).await;
    assert_eq!(client.line().await, "535 Error: authentication failed");

    client.send("AUTH LOGIN").await;
    client.line().await;
    client.send(&STANDARD.encode("tim")).await;
    client.line().await;
    client.send(&STANDARD.encode("secret")).await;
    assert_eq!(client.line().await, "235 Authentication successful");

    // RSET keeps the authentication.
    client.send("RSET").await;
    assert_eq!(client.line().await, "250 Reset");
    client.send("MAIL FROM:<a@b.com>").await;
    assert_eq!(client.line().await, "250 Accepted");
}

#[tokio::test]
async fn lmtp_answers_data_per_recipient() {
    let lmtp_settings = Settings {
        lmtp: true,
        ..settings()
    };
    let mut client = connect(lmtp_settings, Arc::new(AcceptAll));

    assert_eq!(client.line().await, "220 mail.example.com LMTP");

    client.send("EHLO client.example").await;
    assert_eq!(
        client.line().await,
        "500 Error: EHLO not allowed in LMTP server"
    );

    client.send("LHLO client.example").await;
    client.reply().await;

    client.send("MAIL FROM:<a@b.com>").await;
    client.line().await;
    client.send("RCPT TO:<c@d.com>").await;
    client.line().await;
    client.send("RCPT TO:<e@f.com>").await;
    client.line().await;
    client.send("DATA").await;
    client.line().await;
    client.raw("hello\r\n.\r\n").await;

    assert_eq!(client.line().await, "250 c@d.com: Message accepted");
    assert_eq!(client.line().await, "250 e@f.com: Message accepted");
}

#[tokio::test]
async fn xclient_swaps_identity_once() {
    let xclient_settings = Settings {
        use_xclient: true,
        ..settings()
    };
    let mut client = connect(xclient_settings, Arc::new(AcceptAll));
    client.line().await;

    client.send("XCLIENT ADDR=198.51.100.1 PORT=2525").await;
    assert_eq!(client.line().await, "220 mail.example.com ESMTP");

    client.send("EHLO client.example").await;
    let reply = client.reply().await;
    assert_eq!(reply[0], "250-mail.example.com Welcome, [198.51.100.1]");
    assert!(!reply.iter().any(|line| line.contains("XCLIENT")));

    client.send("XCLIENT ADDR=198.51.100.2").await;
    assert_eq!(client.line().await, "550 Error: not allowed");
}

#[tokio::test]
async fn xforward_is_refused_after_xclient() {
    let proxied = Settings {
        use_xclient: true,
        use_xforward: true,
        ..settings()
    };
    let mut client = connect(proxied, Arc::new(AcceptAll));
    client.line().await;

    client.send("XFORWARD NAME=upstream.example").await;
    assert_eq!(client.line().await, "220 OK");

    client.send("XCLIENT ADDR=198.51.100.1").await;
    assert_eq!(client.line().await, "220 mail.example.com ESMTP");

    client.send("XFORWARD NAME=spoof.example").await;
    assert_eq!(client.line().await, "550 Error: not allowed");
}

#[tokio::test]
async fn failed_greeting_leaves_the_gates_closed() {
    let mut client = connect(settings(), Arc::new(Policy));
    client.line().await;

    client.send("EHLO").await;
    assert_eq!(client.line().await, "501 Error: Syntax: EHLO hostname");

    client.send("AUTH LOGIN").await;
    assert_eq!(client.line().await, "503 Error: send HELO/EHLO first");

    client.send("MAIL FROM:<a@b.com>").await;
    assert_eq!(client.line().await, "503 Error: send HELO/EHLO first");

    client.send("EHLO client.example two.example").await;
    assert_eq!(client.line().await, "501 Error: Syntax: EHLO hostname");

    client.send("EHLO client.example").await;
    let reply = client.reply().await;
    assert_eq!(reply[0], "250-mail.example.com Welcome, [192.0.2.7]");

    client.send("MAIL FROM:<a@b.com>").await;
    assert_eq!(client.line().await, "250 Accepted");
}

#[tokio::test]
async fn unknown_and_disabled_commands_get_500() {
    let trimmed = Settings {
        disabled_commands: vec!["VRFY".to_string()],
        ..settings()
    };
    let mut client = connect(trimmed, Arc::new(AcceptAll));
    client.line().await;

    client.send("FROBNICATE now").await;
    assert_eq!(client.line().await, "500 Error: command not recognized");

    client.send("VRFY tim").await;
    assert_eq!(client.line().await, "500 Error: command not recognized");

    // The proxy verbs exist, but without the feature they are refused.
    client.send("XCLIENT ADDR=198.51.100.1").await;
    assert_eq!(client.line().await, "550 Error: not allowed");

    client.send("XFORWARD NAME=upstream.example").await;
    assert_eq!(client.line().await, "550 Error: not allowed");

    client.send("NOOP").await;
    assert_eq!(client.line().await, "250 OK");
}

#[tokio::test]
async fn quit_ends_the_session() {
    let mut client = connect(settings(), Arc::new(AcceptAll));
    client.line().await;

    client.send("QUIT").await;
    assert_eq!(client.line().await, "221 Goodbye");

    client.server.await.unwrap();
}

#[tokio::test]
async fn finalise_signal_sends_421() {
    let mut client = connect(settings(), Arc::new(AcceptAll));
    client.line().await;

    client.shutdown.send(Signal::Finalise).unwrap();
    assert_eq!(client.line().await, "421 Server shutting down");

    client.server.await.unwrap();
}

#[tokio::test]
async fn idle_sessions_are_told_421() {
    let mut impatient = settings();
    impatient.timeouts.idle_secs = 0;

    let mut client = connect(impatient, Arc::new(AcceptAll));
    client.line().await;

    let line = tokio::time::timeout(Duration::from_secs(5), client.line())
        .await
        .unwrap();
    assert_eq!(line, "421 Connection idle timeout");
}

#[tokio::test]
async fn resolved_hostname_appears_in_the_welcome() {
    struct FixedDns;

    #[async_trait]
    impl mailgate_smtp::dns::ReverseDns for FixedDns {
        async fn reverse(
            &self,
            _addr: std::net::IpAddr,
        ) -> Result<Option<String>, mailgate_smtp::error::DnsError> {
            Ok(Some("client.example".to_string()))
        }
    }

    let (client, server) = tokio::io::duplex(4096);
    let (_shutdown, receiver) = broadcast::channel(4);

    let env = Environment {
        settings: Arc::new(settings()),
        hooks: Arc::new(AcceptAll),
        middleware: Vec::new(),
        reverse_dns: Some(Arc::new(FixedDns)),
        tls_config: None,
    };

    let local: SocketAddr = "127.0.0.1:25".parse().unwrap();
    let remote: SocketAddr = "192.0.2.7:54321".parse().unwrap();
    let connection = SmtpConnection::new(server, local, remote, env, receiver);
    tokio::spawn(async move {
        let _ = connection.run().await;
    });

    let mut reader = BufReader::new(client);
    let mut line = String::new();

    reader.read_line(&mut line).await.unwrap();
    assert_eq!(line.trim_end(), "220 mail.example.com ESMTP");

    reader
        .get_mut()
        .write_all(b"HELO client.example\r\n")
        .await
        .unwrap();

    line.clear();
    reader.read_line(&mut line).await.unwrap();
    assert_eq!(
        line.trim_end(),
        "250 mail.example.com Welcome, client.example"
    );
}

#[tokio::test]
async fn connect_hook_rejection_closes_after_the_error() {
    struct NoEntry;

    #[async_trait]
    impl Hooks for NoEntry {
        async fn on_connect(&self, _session: &Session) -> Result<(), Rejection> {
            Err(Rejection::new(554, "No entry"))
        }
    }

    let mut client = connect(settings(), Arc::new(NoEntry));
    assert_eq!(client.line().await, "554 No entry");

    client.server.await.unwrap();
}
