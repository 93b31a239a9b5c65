//! pmk-daemon library surface.
//!
//! The binary in `main.rs` wires tracing, config, and middleware around
//! these modules. They are public so the in-process scenario tests can
//! compose the router without binding a socket.

pub mod api_types;
pub mod routes;
pub mod state;
