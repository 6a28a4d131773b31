//! Application hook points.
//!
//! The protocol engine owns sequencing and syntax; everything with a policy
//! dimension (who may connect, which credentials are valid, which envelopes
//! and messages are accepted) is delegated to a [`Hooks`] implementation.
//!
//! Hooks observe the session but never mutate it. For envelope decisions the
//! engine hands over a session clone with the candidate sender or recipient
//! already staged, so a hook sees exactly the state that will be committed if
//! it accepts.

use std::io::Cursor;

use async_trait::async_trait;
use hmac::{Hmac, Mac as _};
use md5::Md5;
use mailgate_common::{internal, status::Status};

use crate::session::Session;

/// An application-supplied refusal. When `code` is `None` the engine picks
/// the default for the hook point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub code: Option<Status>,
    pub message: String,
}

impl Rejection {
    pub fn new(code: impl Into<Status>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
        }
    }

    pub fn message(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }
}

pub type HookResult = Result<(), Rejection>;

/// Credentials assembled by the AUTH exchange, handed to
/// [`Hooks::on_auth`] for verification.
#[derive(Debug, Clone)]
pub enum Credentials {
    Plain {
        username: String,
        password: String,
    },
    Login {
        username: String,
        password: String,
    },
    XOAuth2 {
        username: String,
        access_token: String,
    },
    /// CRAM-MD5 never reveals the password; the hook looks the shared
    /// secret up by username and calls [`CramMd5Verifier::verify`].
    CramMd5 {
        username: String,
        verifier: CramMd5Verifier,
    },
    /// Identity forwarded by a trusted proxy via XCLIENT LOGIN.
    XClient { username: String },
}

impl Credentials {
    #[must_use]
    pub fn username(&self) -> &str {
        match self {
            Self::Plain { username, .. }
            | Self::Login { username, .. }
            | Self::XOAuth2 { username, .. }
            | Self::CramMd5 { username, .. }
            | Self::XClient { username } => username,
        }
    }
}

/// The challenge/response pair of a CRAM-MD5 exchange.
#[derive(Debug, Clone)]
pub struct CramMd5Verifier {
    pub challenge: String,
    pub response: String,
}

impl CramMd5Verifier {
    /// Check the client digest against a shared secret (RFC 2195).
    #[must_use]
    pub fn verify(&self, secret: &str) -> bool {
        let Ok(mut mac) = Hmac::<Md5>::new_from_slice(secret.as_bytes()) else {
            return false;
        };

        mac.update(self.challenge.as_bytes());

        let digest = mac.finalize().into_bytes();
        let expected: String = digest.iter().map(|byte| format!("{byte:02x}")).collect();

        expected == self.response.to_lowercase()
    }
}

/// One received message body, delivered to [`Hooks::on_data`] after the
/// terminating dot.
#[derive(Debug)]
pub struct Body {
    bytes: Vec<u8>,
    size: u64,
    exceeded: bool,
}

impl Body {
    #[must_use]
    pub fn new(bytes: Vec<u8>, size: u64, exceeded: bool) -> Self {
        Self {
            bytes,
            size,
            exceeded,
        }
    }

    /// The message content with dot-stuffing already removed.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Total size received, counted before de-stuffing.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Whether the body exceeded the advertised maximum size.
    #[must_use]
    pub const fn exceeded_max_size(&self) -> bool {
        self.exceeded
    }

    #[must_use]
    pub fn reader(&self) -> Cursor<&[u8]> {
        Cursor::new(&self.bytes)
    }
}

/// Policy callbacks invoked at each decision point of a session.
///
/// Every default accepts, except `on_auth`, which refuses: offering AUTH
/// without a verifier would let anyone in.
#[async_trait]
pub trait Hooks: Send + Sync {
    /// Called once the remote hostname is resolved, before the greeting is
    /// sent. Rejection closes the connection after the error reply.
    async fn on_connect(&self, _session: &Session) -> HookResult {
        Ok(())
    }

    /// Verify credentials; return the authenticated username on success.
    async fn on_auth(
        &self,
        _credentials: Credentials,
        _session: &Session,
    ) -> Result<String, Rejection> {
        Err(Rejection::message("Not implemented"))
    }

    /// The candidate sender is staged in `session.envelope.mail_from`.
    async fn on_mail_from(&self, _session: &Session) -> HookResult {
        Ok(())
    }

    /// The candidate recipient is staged in `session.envelope.rcpt_to`.
    async fn on_rcpt_to(&self, _session: &Session) -> HookResult {
        Ok(())
    }

    /// Accept or refuse a completed message. `Ok(Some(text))` customizes
    /// the 250 text; `Ok(None)` uses the default.
    async fn on_data(&self, body: Body, session: &Session) -> Result<Option<String>, Rejection> {
        internal!(
            "{}: received message, {} bytes, {} recipient(s)",
            session.id,
            body.size(),
            session.envelope.rcpt_to.len()
        );

        Ok(None)
    }

    /// Called when the session ends, however it ends.
    async fn on_close(&self, _session: &Session) {}
}

/// The do-nothing policy: everything is accepted, nobody can authenticate.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

#[async_trait]
impl Hooks for AcceptAll {}
