//! Connection registry and room membership

pub mod connection;
pub mod manager;

pub use connection::{CloseReason, Connection};
pub use manager::{ConnectError, ConnectOutcome, ConnectionManager};
