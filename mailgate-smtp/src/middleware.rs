//! Command middleware.
//!
//! Each parsed command line passes through an ordered chain of
//! [`Middleware`] before reaching the protocol dispatcher. A layer can
//! answer the command itself, rewrite nothing and forward, or refuse it;
//! calling [`Next::run`] hands control to the rest of the chain.

use std::sync::Arc;

use async_trait::async_trait;

use crate::{hooks::Rejection, proto::Effect, session::Session};

/// The command under dispatch, with read access to the session it arrived
/// on.
#[derive(Debug)]
pub struct CommandContext<'s> {
    /// Uppercased first word of the line, with anything after a `:`
    /// dropped.
    pub verb: String,
    /// The full command line as received, CRLF stripped.
    pub line: String,
    pub session: &'s Session,
}

pub type DispatchResult = Result<Vec<Effect>, Rejection>;

#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(&self, ctx: &CommandContext<'_>, next: Next<'_>) -> DispatchResult;
}

/// The terminal handler a middleware chain bottoms out in.
#[async_trait]
pub trait Dispatcher: Send {
    async fn dispatch(&mut self, ctx: &CommandContext<'_>) -> DispatchResult;
}

/// The remainder of the chain from one layer's point of view.
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
    dispatcher: &'a mut (dyn Dispatcher + 'a),
}

impl<'a> Next<'a> {
    pub fn new(chain: &'a [Arc<dyn Middleware>], dispatcher: &'a mut (dyn Dispatcher + 'a)) -> Self {
        Self { chain, dispatcher }
    }

    pub async fn run(self, ctx: &CommandContext<'_>) -> DispatchResult {
        match self.chain.split_first() {
            Some((layer, rest)) => {
                let next = Next {
                    chain: rest,
                    dispatcher: self.dispatcher,
                };

                layer.handle(ctx, next).await
            }
            None => self.dispatcher.dispatch(ctx).await,
        }
    }
}
