//! Daemon internals: configuration, discovery glue, session management and
//! the framed message channel. The binary in `main.rs` wires these together.

pub mod channel;
pub mod config;
pub mod events;
pub mod netselect;
pub mod session;
pub mod ui;
