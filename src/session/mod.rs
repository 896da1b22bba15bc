//! Request sessions — the arbitration core.
//!
//! Each client request (get, create, clear) runs as its own session: a
//! pure state machine ([`get::GetSession`], [`create::CreateSession`],
//! [`clear::ClearSession`]) driven by a per-request actor task
//! ([`driver::spawn_session`]). The state machines consume
//! [`core::SessionEvent`]s and emit [`core::SessionAction`]s; the actor
//! executes the actions against the daemon's provider transport, the
//! selector, and the client callback.
//!
//! All mutable session state lives on the actor task. Provider
//! invocations run as sub-tasks that feed their replies back into the
//! session's event channel, so replies, selections, and cancellation are
//! serialized per request.

pub mod clear;
pub mod core;
pub mod create;
pub mod driver;
pub mod entries;
pub mod error;
pub mod get;
pub mod status;
pub mod types;
