//! Outbound, multiplexed tunnel between an agent (which owns the sources)
//! and a consumer (which fetches and watches them).
//!
//! ```text
//! agent                          relay                         consumer
//!   dial ------------------------> <------------------------- accept
//!   HELLO(version, flags) ------------------------------------->
//!   <--------------------------------------- HELLO echo | FATAL
//!   <------------------------------------- REQUEST(stream, op)
//!   RESPONSE | EVENT* END | ERROR ----------------------------->
//! ```

pub mod agent;
pub mod consumer;
pub mod handlers;
pub mod mux;
pub mod ops;
pub mod protocol;
pub mod router;
pub mod transport;

pub use agent::{Agent, AgentConfig, SessionState};
pub use consumer::{accept, accept_within, SessionOwner, TunnelClient, WatchStream};
pub use handlers::AgentState;
pub use ops::{OpCode, Operation, WatchRequest};
pub use transport::{Dialer, TcpDialer};
