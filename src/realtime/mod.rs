pub mod connection;
pub mod messages;
pub mod transport;

pub use connection::{ConnectionManager, ConnectionState, EventStream};
pub use messages::{ClientCommand, Modality, RemoteError, ServerEvent, SessionSettings, TurnDetection};
pub use transport::{Connector, Duplex, WebSocketConnector};
