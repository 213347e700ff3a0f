//! Discovery engine: state machine, result queues, cancellation and the
//! C-style facade on top.

pub mod cancel;
pub mod discovery;
pub mod facade;
pub mod queue;

pub use cancel::CancelToken;
pub use discovery::{DiscoveryCallback, DiscoveryEngine};
pub use queue::ResultQueue;
