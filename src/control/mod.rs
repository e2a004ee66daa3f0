//! Local control surface. Clients connect to a Unix socket in the application directory and
//! exchange newline-delimited JSON frames, see [protocol].

pub mod client;
pub mod protocol;
pub mod server;

pub use client::ControlClient;
pub use server::ControlServer;
