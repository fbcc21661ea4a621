//! Daemon assembly: configuration, bootstrap, the application API server,
//! and the admin command channel.

pub mod admin;
pub mod api;
pub mod bootstrap;
pub mod config;
pub mod xdr;
