//! Streaming conversation engine for Noor.
//!
//! Decodes the answer service's newline-delimited JSON stream, keeps the
//! set of conversations, enforces one in-flight request with cancellation,
//! and mirrors the daily quota the service enforces.

pub mod decoder;
pub mod engine;
pub mod error;
pub mod history;
pub mod quota;
pub mod session;
pub mod store;
pub mod transport;

pub use decoder::{decode_stream, DecodeMode, StreamDecoder};
pub use engine::{ChatEngine, SendOutcome, NETWORK_ERROR_TEXT};
pub use error::ChatError;
pub use quota::QuotaTracker;
pub use session::{FileSessionStore, MemorySessionStore, SessionStore};
pub use store::ConversationStore;
pub use transport::{AskRequest, AskTransport, ByteStream, HttpTransport, TransportError};
