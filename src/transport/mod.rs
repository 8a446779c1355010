//! # Live Service Transport
//!
//! WebSocket link to the remote conversational audio service.
//!
//! - **messages**: JSON wire types (setup, realtime input, server content)
//! - **channel**: connection task, outbound queue, inbound event stream

pub mod channel;
pub mod messages;

pub use channel::{Connector, TransportChannel, TransportEvent, WebSocketConnector};
