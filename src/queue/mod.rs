//! Offline action queue: durable log, replay pass, HTTP dispatch.

mod action;
mod http;
mod replay;
mod store;

pub use action::{ActionKind, Operation, QueuedAction};
pub use http::{route, HttpDispatcher};
pub use replay::{ActionDispatcher, Replayer, SyncOutcome, SyncSummary};
pub use store::ActionQueue;

#[cfg(test)]
pub(crate) use replay::testing;
