// Session pool for a session-oriented SOAP/XML travel-reservation service

// Export modules
pub mod error;
pub mod pool;
pub mod session;
pub mod soap;
pub mod transport;

// Re-export key types for convenience
pub use error::{NetworkError, PoolError, SessionError};
pub use pool::{LoggedError, PoolConfig, PoolStats, QueueState, SessionPool};
pub use session::{ExpireScheme, Identity, RemoteFault, Session};
pub use soap::SoapTransport;
pub use transport::SessionTransport;
