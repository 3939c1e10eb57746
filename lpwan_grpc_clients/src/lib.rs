//! gRPC clients used by the LPWAN application server.
//!
//! All clients share a [`ChannelPool`](pool::ChannelPool) so every server is connected to at most
//! once.

#![deny(clippy::unwrap_used)]
#![warn(missing_docs)]
#![warn(clippy::missing_errors_doc)]
#![warn(clippy::missing_panics_doc)]
#![warn(clippy::missing_docs_in_private_items)]
#![warn(clippy::pedantic)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod m2m;
pub mod network_server;
pub mod pool;
