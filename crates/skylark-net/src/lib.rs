//! TCP networking: framing, message serialization, background sending,
//! dispatch, and session lifecycle with reconnection.

pub mod dispatch;
pub mod framing;
pub mod messages;
pub mod sender;
pub mod session;
pub mod transport;

pub use dispatch::{Dispatcher, EnvelopeHandler, ExecutionContext, HandlerResult, MainQueue};
pub use framing::{Envelope, FrameConfig, FrameDecoder, FrameError, encode_frame};
pub use messages::{
    EntitySnapshot, MessageError, MoveAck, PROTOCOL_VERSION, Ping, Pong, WorldEvent,
    decode_payload, encode_payload, kind,
};
pub use sender::BackgroundSender;
pub use session::{
    DisconnectReason, Session, SessionError, SessionEvent, SessionState, SessionStateWatch,
};
pub use transport::{
    CloseReason, Transport, TransportCounters, TransportError, TransportEvent, TransportStats,
};
