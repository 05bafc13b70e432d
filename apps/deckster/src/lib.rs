//! Client-side session synchronization engine for the Deckster presentation
//! builder: Director WebSocket transport, session state reducer, snapshot
//! cache, debounced persistence queue, and message reconciliation.

pub mod builder;
pub mod cache;
pub mod config;
pub mod queue;
pub mod reconcile;
pub mod session;
pub mod telemetry;
pub mod transport;
