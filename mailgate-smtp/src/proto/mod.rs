//! Protocol modules: command semantics behind the dispatcher.
//!
//! Each handler inspects the session but never mutates it; outcomes are
//! expressed as an ordered list of [`Effect`] values the connection driver
//! applies. That keeps session writes in one place and makes handlers
//! trivially testable.

pub mod auth;
pub mod handshake;
pub mod mail;
pub mod xclient;
pub mod xforward;

use mailgate_common::status::Status;

use crate::{
    config::Settings,
    hooks::Hooks,
    middleware::{CommandContext, DispatchResult},
    reply::Reply,
    session::SessionPatch,
};

/// One instruction from a handler to the connection driver, applied in
/// order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Send a reply.
    Reply(Reply),
    /// Apply session updates.
    Update(SessionPatch),
    /// Abandon the current mail transaction.
    Reset,
    /// Perform the TLS handshake (follows the 220 STARTTLS reply).
    Upgrade,
    /// Switch the framer to body mode. Zero means no size ceiling.
    StartBody { max_bytes: u64 },
    /// Flush and close the connection.
    Close,
}

/// The reply for verbs the session does not understand, including verbs
/// disabled by configuration.
#[must_use]
pub fn unrecognized() -> Effect {
    Effect::Reply(Reply::new(
        Status::CommandUnrecognized,
        "Error: command not recognized",
    ))
}

/// The built-in protocol modules. Only authentication carries state: the
/// pending continuation that claims the next client line.
#[derive(Debug, Default)]
pub struct ProtocolModules {
    auth: auth::Auth,
}

impl ProtocolModules {
    /// Route one command line. A pending AUTH continuation always wins the
    /// line, whatever its first token looks like.
    pub async fn dispatch(
        &mut self,
        ctx: &CommandContext<'_>,
        settings: &Settings,
        hooks: &dyn Hooks,
    ) -> DispatchResult {
        if let Some(pending) = self.auth.take_pending() {
            return self.auth.resume(pending, ctx, hooks).await;
        }

        if settings.is_disabled(&ctx.verb) {
            return Ok(vec![unrecognized()]);
        }

        match ctx.verb.as_str() {
            "HELO" | "EHLO" => handshake::greeting(ctx, settings),
            "LHLO" if settings.lmtp => handshake::greeting(ctx, settings),
            "QUIT" => Ok(handshake::quit()),
            "NOOP" => Ok(handshake::noop()),
            "RSET" => Ok(handshake::rset()),
            "HELP" => Ok(handshake::help()),
            "VRFY" => Ok(handshake::vrfy()),
            "STARTTLS" => handshake::starttls(ctx, settings),
            "AUTH" => self.auth.command(ctx, settings, hooks).await,
            "MAIL" => mail::mail(ctx, settings, hooks).await,
            "RCPT" => mail::rcpt(ctx, settings, hooks).await,
            "DATA" => mail::data(ctx, settings),
            "XCLIENT" if settings.use_xclient => xclient::command(ctx, settings, hooks).await,
            "XFORWARD" if settings.use_xforward => xforward::command(ctx),
            // The proxy verbs exist but are refused when the feature is off.
            "XCLIENT" | "XFORWARD" => Ok(vec![Effect::Reply(Reply::new(
                Status::ActionNotTaken,
                "Error: not allowed",
            ))]),
            _ => Ok(vec![unrecognized()]),
        }
    }
}
