//! `session-fanout` drains extra queue sessions while a slow downstream call is in flight.
//!
//! A host runtime hands the consumer one locked session per invocation. Forwarding that session
//! to the downstream system takes seconds, and the consumer would otherwise sit idle for that
//! time. The orchestrator uses the idle window to accept up to N more sessions straight from the
//! broker. It drains each one, forwards it with the same downstream call, and completes its
//! messages independently.
//!
//! Core modules:
//! - [`message`]: messages and ordered per-session batches
//! - [`broker`]: broker client seam (+ an in-memory broker)
//! - [`session`]: exclusive session leases, released exactly once
//! - [`drain`]: pull a session until it goes idle
//! - [`forward`]: downstream call (HTTP or Lambda) + retry policy
//! - [`complete`]: acknowledge or abandon after forwarding
//! - [`orchestrator`]: primary + additional session workers for one invocation
//! - [`config`]: YAML config manifest

pub mod broker;
pub mod complete;
pub mod config;
pub mod drain;
pub mod forward;
pub mod message;
pub mod orchestrator;
pub mod session;
