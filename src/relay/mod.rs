pub mod client;
pub mod memory;
pub mod transport;

pub use client::{IdentityClient, RelayEvent};
pub use memory::MemoryRelay;
pub use transport::{RelayConnector, RelayLink, RelayTransport, WsConnector};
