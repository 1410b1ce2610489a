//! Websocket fan-out of ledger changes.

pub mod audience;
pub mod broadcast;
pub mod connections;
pub mod handler;
pub mod messages;

pub use audience::Audience;
pub use broadcast::broadcast_to_audience;
pub use handler::handle_websocket_event;
pub use messages::BroadcastMessage;
