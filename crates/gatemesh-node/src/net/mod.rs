//! Inter-node networking: framed connections, the accept loop, and
//! request/response correlation.

pub mod connection;
pub mod correlator;
pub mod listener;

pub use connection::{Connection, DialInfo, LinkState};
pub use correlator::Correlator;
