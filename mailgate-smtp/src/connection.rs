//! Per-connection driver.
//!
//! [`SmtpConnection`] owns the transport, the framer, the session record,
//! and the protocol modules, and is the only place session state is
//! written. Commands are answered strictly in arrival order, which is what
//! makes PIPELINING safe: the framer may hold a whole batch of commands,
//! but the loop dispatches and replies to them one at a time.

use std::{net::IpAddr, net::SocketAddr, sync::Arc};

use mailgate_common::{Signal, incoming, internal, outgoing, status::Status};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::broadcast,
};
use tokio_rustls::rustls::ServerConfig;

use crate::{
    config::Settings,
    dns::ReverseDns,
    error::{ConnectionError, SessionError, SessionResult},
    framer::{Framer, Segment},
    hooks::{Body, Hooks, Rejection},
    middleware::{CommandContext, DispatchResult, Dispatcher, Middleware, Next},
    proto::{Effect, ProtocolModules, handshake, mail},
    proxy,
    reply::Reply,
    session::{Session, TlsDetails},
    transport::Transport,
};

/// Everything a connection shares with its server: configuration, policy,
/// and the TLS identity. Cloned once per accepted socket.
#[derive(Clone)]
pub struct Environment {
    pub settings: Arc<Settings>,
    pub hooks: Arc<dyn Hooks>,
    pub middleware: Vec<Arc<dyn Middleware>>,
    pub reverse_dns: Option<Arc<dyn ReverseDns>>,
    pub tls_config: Option<Arc<ServerConfig>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Ready,
    Closing,
    Closed,
}

/// Outcome of one wait on the socket.
enum Event {
    Signal(Option<Signal>),
    TimedOut,
    Read(crate::error::ConnectionResult<usize>),
}

/// Accumulates body chunks between DATA and the terminating dot. Chunks
/// past the size ceiling are counted but not stored.
#[derive(Debug, Default)]
struct BodyCollector {
    bytes: Vec<u8>,
    size: u64,
    max: u64,
}

impl BodyCollector {
    fn push(&mut self, chunk: &[u8]) {
        self.size += chunk.len() as u64;

        if self.max == 0 || self.size <= self.max {
            self.bytes.extend_from_slice(chunk);
        }
    }
}

pub struct SmtpConnection<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> {
    transport: Option<Transport<Stream>>,
    framer: Framer,
    session: Session,
    modules: ProtocolModules,
    settings: Arc<Settings>,
    hooks: Arc<dyn Hooks>,
    middleware: Vec<Arc<dyn Middleware>>,
    reverse_dns: Option<Arc<dyn ReverseDns>>,
    tls_config: Option<Arc<ServerConfig>>,
    shutdown: broadcast::Receiver<Signal>,
    state: ConnState,
    body: Option<BodyCollector>,
}

/// The innermost middleware target: the built-in protocol modules.
struct CoreDispatch<'a> {
    modules: &'a mut ProtocolModules,
    settings: &'a Settings,
    hooks: &'a dyn Hooks,
}

#[async_trait::async_trait]
impl Dispatcher for CoreDispatch<'_> {
    async fn dispatch(&mut self, ctx: &CommandContext<'_>) -> DispatchResult {
        self.modules.dispatch(ctx, self.settings, self.hooks).await
    }
}

/// IPv4-mapped IPv6 peers read as plain IPv4.
fn canonical_ip(addr: IpAddr) -> String {
    match addr {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map_or_else(|| v6.to_string(), |v4| v4.to_string()),
    }
}

fn verb_of(line: &str) -> String {
    line.split_whitespace()
        .next()
        .map(|word| word.split(':').next().unwrap_or(word))
        .unwrap_or_default()
        .to_ascii_uppercase()
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> SmtpConnection<Stream> {
    pub fn new(
        stream: Stream,
        local: SocketAddr,
        remote: SocketAddr,
        env: Environment,
        shutdown: broadcast::Receiver<Signal>,
    ) -> Self {
        let session = Session::new(
            canonical_ip(local.ip()),
            local.port(),
            canonical_ip(remote.ip()),
            remote.port(),
        );

        Self {
            transport: Some(Transport::plain(stream)),
            framer: Framer::default(),
            session,
            modules: ProtocolModules::default(),
            settings: env.settings,
            hooks: env.hooks,
            middleware: env.middleware,
            reverse_dns: env.reverse_dns,
            tls_config: env.tls_config,
            shutdown,
            state: ConnState::Ready,
            body: None,
        }
    }

    #[must_use]
    pub const fn session(&self) -> &Session {
        &self.session
    }

    /// Drive the session to completion. The close hook runs however the
    /// session ends.
    pub async fn run(mut self) -> SessionResult<()> {
        let result = self.drive().await;

        self.framer.close();
        self.state = ConnState::Closed;
        self.hooks.on_close(&self.session).await;

        match &result {
            Ok(()) => internal!("{}: session ended", self.session.id),
            Err(error) => internal!(level = WARN, "{}: session failed: {error}", self.session.id),
        }

        result
    }

    async fn drive(&mut self) -> SessionResult<()> {
        self.establish().await?;

        let idle = self.settings.timeouts.idle();
        let mut buf = [0u8; 4096];

        while self.state == ConnState::Ready {
            while let Some(segment) = self.framer.next_segment() {
                self.handle(segment).await?;

                if self.state != ConnState::Ready {
                    return Ok(());
                }
            }

            // The select only produces an event; replies go out after the
            // transport borrow is released.
            let event = {
                let transport = self.transport.as_mut().ok_or(ConnectionError::Closed)?;

                tokio::select! {
                    signal = self.shutdown.recv() => Event::Signal(signal.ok()),
                    read = tokio::time::timeout(idle, transport.receive(&mut buf)) => match read {
                        Err(_elapsed) => Event::TimedOut,
                        Ok(result) => Event::Read(result),
                    },
                }
            };

            match event {
                Event::Signal(Some(Signal::Finalise)) => {
                    self.send(&Reply::new(Status::Unavailable, "Server shutting down"))
                        .await?;
                    return Ok(());
                }
                Event::Signal(_) => {}
                Event::TimedOut => {
                    internal!("{}: idle timeout", self.session.id);
                    // Best effort: the peer may already be gone.
                    let _ = self
                        .send(&Reply::new(Status::Unavailable, "Connection idle timeout"))
                        .await;
                    return Ok(());
                }
                Event::Read(Ok(0)) => return Ok(()),
                Event::Read(Ok(count)) => self.framer.feed(&buf[..count]),
                Event::Read(Err(error)) => return Err(SessionError::Connection(error)),
            }
        }

        Ok(())
    }

    /// Pre-greeting work: PROXY preamble, implicit TLS, reverse DNS, and
    /// the connect hook.
    async fn establish(&mut self) -> SessionResult<()> {
        if self.settings.use_proxy {
            let transport = self.transport.as_mut().ok_or(ConnectionError::Closed)?;

            if let Some(info) = proxy::read_proxy_header(transport).await? {
                self.session.remote_address = info.remote_address;
                self.session.remote_port = info.remote_port;
            }
        }

        if self.settings.secure && self.tls_config.is_some() {
            self.upgrade().await?;

            if self.state != ConnState::Ready {
                return Ok(());
            }
        }

        self.session.resolved_hostname = self.resolve_hostname().await;

        if let Err(Rejection { code, message }) = self.hooks.on_connect(&self.session).await {
            self.send(&Reply::new(
                code.unwrap_or(Status::TransactionFailed),
                message,
            ))
            .await?;
            self.state = ConnState::Closing;
            return Ok(());
        }

        internal!(
            "{}: connected from {}:{} ({})",
            self.session.id,
            self.session.remote_address,
            self.session.remote_port,
            self.session.resolved_hostname
        );

        self.send(&handshake::banner(&self.settings)).await
    }

    async fn resolve_hostname(&self) -> String {
        let literal = format!("[{}]", self.session.remote_address);

        if self.settings.disable_reverse_lookup {
            return literal;
        }

        let Some(resolver) = &self.reverse_dns else {
            return literal;
        };

        let Ok(addr) = self.session.remote_address.parse::<IpAddr>() else {
            return literal;
        };

        match tokio::time::timeout(self.settings.timeouts.reverse_dns(), resolver.reverse(addr))
            .await
        {
            Ok(Ok(Some(hostname))) => hostname,
            Ok(Ok(None)) => literal,
            Ok(Err(error)) => {
                internal!("{}: reverse lookup failed: {error}", self.session.id);
                literal
            }
            Err(_elapsed) => {
                internal!("{}: reverse lookup timed out", self.session.id);
                literal
            }
        }
    }

    async fn handle(&mut self, segment: Segment) -> SessionResult<()> {
        match segment {
            Segment::Command(line) => {
                incoming!("{}: {line}", self.session.id);

                let outcome = self.dispatch(line).await;
                match outcome {
                    Ok(effects) => self.apply(effects).await,
                    Err(Rejection { code, message }) => {
                        self.send(&Reply::new(
                            code.unwrap_or(Status::TransactionFailed),
                            message,
                        ))
                        .await
                    }
                }
            }
            Segment::Body(chunk) => {
                if let Some(collector) = &mut self.body {
                    collector.push(&chunk);
                }
                Ok(())
            }
            Segment::BodyEnd { exceeded } => self.finish_data(exceeded).await,
        }
    }

    async fn dispatch(&mut self, line: String) -> DispatchResult {
        let ctx = CommandContext {
            verb: verb_of(&line),
            line,
            session: &self.session,
        };

        let mut core = CoreDispatch {
            modules: &mut self.modules,
            settings: &self.settings,
            hooks: self.hooks.as_ref(),
        };

        Next::new(&self.middleware, &mut core).run(&ctx).await
    }

    async fn apply(&mut self, effects: Vec<Effect>) -> SessionResult<()> {
        for effect in effects {
            match effect {
                Effect::Reply(reply) => self.send(&reply).await?,
                Effect::Update(patch) => self.session.apply(patch),
                Effect::Reset => self.session.reset(),
                Effect::StartBody { max_bytes } => {
                    self.body = Some(BodyCollector {
                        max: max_bytes,
                        ..BodyCollector::default()
                    });
                    self.framer.start_body(max_bytes);
                }
                Effect::Upgrade => self.upgrade().await?,
                Effect::Close => self.state = ConnState::Closing,
            }

            if self.state != ConnState::Ready {
                break;
            }
        }

        Ok(())
    }

    async fn send(&mut self, reply: &Reply) -> SessionResult<()> {
        outgoing!("{}: {reply}", self.session.id);

        let transport = self.transport.as_mut().ok_or(ConnectionError::Closed)?;
        transport
            .send(reply)
            .await
            .map_err(SessionError::Connection)?;

        if reply.is_error() {
            self.session.last_error = Some(reply.text().to_string());
        }

        if reply.closes_connection() {
            self.state = ConnState::Closing;
        }

        Ok(())
    }

    /// TLS handshake over the current socket. Any bytes the framer still
    /// holds belong to the plaintext channel and are discarded (RFC 3207);
    /// so is everything the client negotiated before the upgrade.
    async fn upgrade(&mut self) -> SessionResult<()> {
        let Some(config) = self.tls_config.clone() else {
            self.state = ConnState::Closing;
            return Ok(());
        };

        self.framer.clear();

        let transport = self.transport.take().ok_or(ConnectionError::Closed)?;

        match tokio::time::timeout(
            self.settings.timeouts.tls_upgrade(),
            transport.upgrade(config),
        )
        .await
        {
            Ok(Ok((transport, info))) => {
                self.transport = Some(transport);
                self.session.secure = true;
                self.session.tls = Some(TlsDetails {
                    protocol: info.proto(),
                    cipher: info.cipher(),
                });
                self.session.reset();
                self.session.client_greeting = None;
                self.session.advertised_hostname = None;

                internal!(
                    "{}: TLS established ({})",
                    self.session.id,
                    self.session
                        .tls
                        .as_ref()
                        .map(|tls| tls.protocol.clone())
                        .unwrap_or_default()
                );

                Ok(())
            }
            Ok(Err(error)) => Err(SessionError::Tls(error)),
            Err(_elapsed) => {
                internal!("{}: TLS handshake timed out", self.session.id);
                self.state = ConnState::Closing;
                Ok(())
            }
        }
    }

    async fn finish_data(&mut self, exceeded: bool) -> SessionResult<()> {
        let collector = self.body.take().unwrap_or_default();
        let body = Body::new(collector.bytes, collector.size, exceeded);

        let outcome = self.hooks.on_data(body, &self.session).await;
        let replies = mail::data_replies(&outcome, &self.session, self.settings.lmtp);

        for reply in replies {
            self.send(&reply).await?;
        }

        self.session.reset();
        Ok(())
    }
}
