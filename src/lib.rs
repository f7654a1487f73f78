//! Replays recorded MySQL client/server exchanges so they can stand in for a
//! real server in tests.

pub mod config;
pub mod metrics;
pub mod mock;
pub mod protocol;
pub mod proxy;
pub mod replay;
pub mod session;
