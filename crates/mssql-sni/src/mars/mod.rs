//! Multiple Active Result Sets over one physical connection.
//!
//! ```text
//! PhysicalHandle ──► MarsConnection ──► Demuxer ──► SessionCore ──► MarsSession
//! ```
//!
//! The connection owns the demultiplexer and the session map; sessions own
//! their flow-control state.

mod demux;

pub mod connection;
pub mod session;

pub use connection::MarsConnection;
pub use session::{
    ACK_THRESHOLD, AsyncReceive, INITIAL_WINDOW, MarsSession, PendingReceive, SendCompletion,
};
