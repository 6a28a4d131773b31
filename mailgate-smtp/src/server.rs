//! TCP front end: accept loop, session registry, graceful stop.

use std::{net::SocketAddr, sync::Arc};

use futures_util::future::join_all;
use mailgate_common::{Signal, internal};
use tokio::{net::TcpListener, sync::broadcast};

use crate::{
    config::Settings,
    connection::{Environment, SmtpConnection},
    dns::{HickoryReverseDns, ReverseDns},
    hooks::Hooks,
    middleware::Middleware,
    transport,
};

pub struct Server {
    settings: Arc<Settings>,
    hooks: Arc<dyn Hooks>,
    middleware: Vec<Arc<dyn Middleware>>,
    reverse_dns: Option<Arc<dyn ReverseDns>>,
    shutdown: broadcast::Sender<Signal>,
}

impl Server {
    pub fn new(settings: Settings, hooks: Arc<dyn Hooks>) -> Self {
        let (shutdown, _) = broadcast::channel(16);

        Self {
            settings: Arc::new(settings),
            hooks,
            middleware: Vec::new(),
            reverse_dns: None,
            shutdown,
        }
    }

    /// Append a middleware layer; layers run in registration order.
    #[must_use]
    pub fn layer(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middleware.push(middleware);
        self
    }

    /// Replace the resolver used for client PTR lookups. Without one (and
    /// unless lookups are disabled) the system resolver is used.
    #[must_use]
    pub fn with_reverse_dns(mut self, resolver: Arc<dyn ReverseDns>) -> Self {
        self.reverse_dns = Some(resolver);
        self
    }

    /// Begin a graceful stop: the accept loop closes, live sessions get the
    /// configured grace period, stragglers are told 421.
    pub fn stop(&self) {
        let _ = self.shutdown.send(Signal::Shutdown);
    }

    pub async fn serve(&self, socket: SocketAddr) -> anyhow::Result<()> {
        let tls_config = self
            .settings
            .tls
            .as_ref()
            .map(|tls| transport::server_config(tls, &self.settings.sni))
            .transpose()?;

        if self.settings.secure && tls_config.is_none() {
            anyhow::bail!("implicit TLS requires a configured certificate");
        }

        let reverse_dns = match (&self.reverse_dns, self.settings.disable_reverse_lookup) {
            (_, true) => None,
            (Some(resolver), _) => Some(Arc::clone(resolver)),
            (None, false) => Some(Arc::new(HickoryReverseDns::new()?) as Arc<dyn ReverseDns>),
        };

        let env = Environment {
            settings: Arc::clone(&self.settings),
            hooks: Arc::clone(&self.hooks),
            middleware: self.middleware.clone(),
            reverse_dns,
            tls_config,
        };

        let listener = TcpListener::bind(socket).await?;
        let mut shutdown = self.shutdown.subscribe();
        let mut sessions = Vec::new();

        internal!(level = INFO, "Serving {} on {socket}", self.settings.protocol());

        loop {
            tokio::select! {
                sig = shutdown.recv() => {
                    if matches!(sig, Ok(Signal::Shutdown)) {
                        internal!(level = INFO, "{socket}: received shutdown, finishing sessions ...");
                        break;
                    }
                }

                connection = listener.accept() => {
                    let (stream, peer) = connection?;
                    let local = stream.local_addr()?;
                    let connection = SmtpConnection::new(
                        stream,
                        local,
                        peer,
                        env.clone(),
                        self.shutdown.subscribe(),
                    );

                    sessions.push(tokio::spawn(async move {
                        if let Err(err) = connection.run().await {
                            internal!(level = ERROR, "Error: {err}");
                        }
                    }));
                }
            }
        }

        drop(listener);

        let mut pending = join_all(sessions);
        if tokio::time::timeout(self.settings.timeouts.close_grace(), &mut pending)
            .await
            .is_err()
        {
            // Grace expired; remaining sessions are told to go away.
            let _ = self.shutdown.send(Signal::Finalise);
            let _ = pending.await;
        }

        Ok(())
    }
}
