//! hearth: a multithreaded, event-driven HTTP/1.x file server.
//!
//! A mio readiness queue multiplexes every connection across a pool of
//! workers; per-connection bytes accumulate in a segmented receive log
//! (`hearth-buffer`); request lines are validated by a pattern FSM compiled
//! at startup from an augmented-BNF grammar (`hearth-pattern`).

pub mod client;
pub mod context;
pub mod http;
pub mod mime;
pub mod reactor;
mod table;

pub use context::AppContext;
pub use reactor::{Server, ServerConfig, ServerHandle};
