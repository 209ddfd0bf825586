// The remote collaborator the pool talks to when it opens and closes sessions

use async_trait::async_trait;

use crate::error::{NetworkError, SessionError};
use crate::session::{Identity, Session};

#[async_trait]
pub trait SessionTransport: Send + Sync + 'static {
    // A returned session carrying a fault means the service was reached but rejected the request.
    // Err means nothing usable came back.
    async fn create_session(
        &self,
        service_url: &str,
        identity: &Identity,
    ) -> Result<Session, NetworkError>;

    // Release the remote context behind a session
    async fn close_session(&self, service_url: &str, session: &Session) -> Result<(), SessionError>;
}
