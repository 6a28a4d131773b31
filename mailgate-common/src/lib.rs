pub mod logging;
pub mod status;

pub use tracing;

/// Broadcast signal used to coordinate server shutdown.
///
/// `Shutdown` stops the accept loop and starts the grace period;
/// `Finalise` tells every still-open session to reply 421 and close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
    Finalise,
}
