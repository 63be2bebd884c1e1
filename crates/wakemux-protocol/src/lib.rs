pub mod event;
pub mod server;
pub mod session;

pub use event::{read_event, write_event, ChunkFormat, Event, MAX_HEADER_BYTES, MAX_PAYLOAD_BYTES};
pub use server::ProtocolServer;
pub use session::{ProtocolSession, SessionState};
