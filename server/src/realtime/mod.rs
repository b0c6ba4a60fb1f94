pub mod handshake;
pub mod websocket;

pub use websocket::{ws_handler, ConnectQuery};
