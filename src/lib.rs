#![deny(rust_2018_compatibility)]
#![warn(rust_2018_idioms)]

//! A TLS-terminating TCP relay in front of an authorization service.
//!
//! Clients connect, send a cleartext preamble, upgrade to TLS, and issue
//! one short command. `OPEN` carries a ticket that the authorization
//! service exchanges for a backend endpoint; from then on the broker
//! splices bytes both ways and reports the final counters when the
//! connection ends.

pub mod config;
pub mod connection;
pub mod consts;
pub mod dispatcher;
pub mod error;
pub mod stats;
pub mod tls;
pub mod uds;
pub mod worker;

pub use crate::{config::Config, dispatcher::Broker, error::Error};
