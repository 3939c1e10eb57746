//! Hook into ChirpStack MQTT communication.
//!
//! A library to facilitate hooking into the ChirpStack gateway bridge and the application
//! integration. Allows adding callbacks to gateway events, gateway states and decoded device
//! uplinks, and publishing downlink frames through a gateway.

#![deny(clippy::unwrap_used)]
#![warn(missing_docs)]
#![warn(clippy::missing_errors_doc)]
#![warn(clippy::missing_panics_doc)]
#![warn(clippy::missing_docs_in_private_items)]
#![warn(clippy::pedantic)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::module_name_repetitions)]

pub mod downlinks;
pub mod error;
pub mod runtime;
pub mod topics;
