pub mod clarifier;
pub mod client;
pub mod retry;
pub mod sse;
pub mod transport;
mod wire;

#[cfg(any(test, feature = "testing"))]
pub mod test_server;

pub use clarifier::{Clarifier, ClarifierError};
pub use client::{ClarificationClient, ClarificationServiceError};
pub use retry::RetryConfig;
pub use sse::{SseDecoder, SseRecord};
pub use transport::{RunHandle, RunEvent, RunRequest, StreamTransport, TransportConfig, TransportError};
