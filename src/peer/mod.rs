pub mod connection;
pub mod ice;
pub mod loopback;
pub mod negotiator;
pub mod state;
pub mod types;

pub use connection::RtcNegotiator;
pub use loopback::LoopbackNegotiator;
pub use negotiator::{LinkState, MediaEvent, MediaEvents, MediaNegotiator};
pub use state::{CallDirection, CallSession, CallState, CallTransition, SessionSnapshot};
pub use types::{ConnectionId, IceCandidate, ServerConfig, SessionDescription, SignalingIdentity};
