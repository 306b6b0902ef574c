// src/ssh/mod.rs
//! SSH gateway: public-key authentication, exec dispatch to the git
//! protocol backend, repository listing for bare logins.

pub mod middleware;
pub mod server;
pub mod session;

pub use server::start_ssh_server;
