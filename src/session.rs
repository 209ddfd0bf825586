// Session handles and the values that travel with them

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::error::{PoolError, SessionError};

// A logical rejection carried by a well-formed SOAP response
#[derive(Error, Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct RemoteFault {
    pub code: String,
    pub message: String,
}

impl RemoteFault {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

// A server-side authenticated context used to issue further protocol calls.
// Sessions are never mutated once created. The pool hands out clones, so the
// value a caller holds between `pick` and `put` is its own.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Session {
    id: String,
    fault: Option<RemoteFault>,
    created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fault: None,
            created_at: Utc::now(),
        }
    }

    // The create call reached the service but it rejected the request
    pub fn faulted(id: impl Into<String>, fault: RemoteFault) -> Self {
        Self {
            id: id.into(),
            fault: Some(fault),
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn fault(&self) -> Option<&RemoteFault> {
        self.fault.as_ref()
    }

    // Callers must check this before using the session for real work.
    pub fn fault_error(&self) -> Option<SessionError> {
        self.fault.clone().map(SessionError::Fault)
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    // Zero-value session handed out by a closed pool
    pub fn is_zero(&self) -> bool {
        self.id.is_empty() && self.fault.is_none()
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).to_std().unwrap_or_default()
    }
}

// Lifetime window within which a session is expected to stay valid.
// Renewal itself runs outside the pool; this only answers "when" questions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpireScheme {
    min: Duration,
    max: Duration,
}

impl Default for ExpireScheme {
    fn default() -> Self {
        // Remote sessions idle out after 15 minutes
        Self {
            min: Duration::from_secs(10 * 60),
            max: Duration::from_secs(14 * 60),
        }
    }
}

impl ExpireScheme {
    pub fn new(min: Duration, max: Duration) -> Result<Self, PoolError> {
        if min > max {
            return Err(PoolError::InvalidConfig(format!(
                "expire scheme min {:?} is greater than max {:?}",
                min, max
            )));
        }
        Ok(Self { min, max })
    }

    pub fn min(&self) -> Duration {
        self.min
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    // Pick a renewal point inside the window so sessions created together do not
    // all renew at the same instant
    pub fn renewal_delay(&self) -> Duration {
        if self.min == self.max {
            return self.min;
        }
        rand::thread_rng().gen_range(self.min..=self.max)
    }

    pub fn is_expired(&self, session: &Session, now: DateTime<Utc>) -> bool {
        session.age(now) > self.max
    }
}

// Credentials and routing parameters sent with every session create call
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Identity {
    pub username: String,
    pub password: String,
    pub organization: String,
    pub domain: String,
    pub from_party: String,
    pub to_party: String,
    pub conversation_id: String,
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("organization", &self.organization)
            .field("domain", &self.domain)
            .field("from_party", &self.from_party)
            .field("to_party", &self.to_party)
            .field("conversation_id", &self.conversation_id)
            .finish()
    }
}
