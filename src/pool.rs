// Session pool: a bounded set of pre-authenticated sessions shared by concurrent callers
// Every piece of shared state lives behind one lock so the busy count
// (allow_pool_size - available) is never observed torn. Waiting callers park on a Notify.

use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::error::{NetworkError, PoolError, SessionError};
use crate::session::{ExpireScheme, Identity, Session};
use crate::soap::SoapTransport;
use crate::transport::SessionTransport;

// Pool configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub service_url: String,
    pub pool_size: usize,
    pub expire_scheme: ExpireScheme,
    pub request_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            service_url: String::new(),
            pool_size: 10,
            expire_scheme: ExpireScheme::default(),
            request_timeout_ms: 30_000,
        }
    }
}

// State of the available-sessions queue. Closed is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Open,
    Closed,
}

// One entry of the append-only diagnostic logs
#[derive(Debug, Clone, PartialEq)]
pub struct LoggedError {
    pub at: DateTime<Utc>,
    pub error: SessionError,
}

// Consistent snapshot of the pool's accounting
#[derive(Debug, Default, Clone, PartialEq)]
pub struct PoolStats {
    pub config_pool_size: usize,
    pub allow_pool_size: usize,
    pub available: usize,
    pub busy: usize,
    pub network_errors: usize,
    pub fault_errors: usize,
    pub closed: bool,
}

struct PoolState {
    available: VecDeque<Session>,
    allow_pool_size: usize,
    queue: QueueState,
    populated: bool,
    network_errors: Vec<LoggedError>,
    fault_errors: Vec<LoggedError>,
}

impl PoolState {
    fn log(&mut self, error: SessionError) {
        let entry = LoggedError {
            at: Utc::now(),
            error,
        };
        if entry.error.is_network() {
            self.network_errors.push(entry);
        } else {
            self.fault_errors.push(entry);
        }
    }
}

// Applies the zero-session rule when a populate future is dropped before its
// attempts finish, so callers never wait on a pool nobody will fill
struct PopulateGuard<'a> {
    pool: &'a SessionPool,
    finished: bool,
}

impl Drop for PopulateGuard<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let mut state = self.pool.state.lock();
        if state.queue == QueueState::Open && state.allow_pool_size == 0 {
            state.queue = QueueState::Closed;
            drop(state);
            self.pool.notify.notify_waiters();
            warn!("Populate cancelled before any session was created, pool closed");
        }
    }
}

pub struct SessionPool {
    service_url: String,
    config_pool_size: usize,
    expire_scheme: ExpireScheme,
    identity: Identity,
    transport: Arc<dyn SessionTransport>,
    state: Mutex<PoolState>,
    notify: Notify,
}

impl SessionPool {
    // Build an unpopulated pool. No network I/O happens here.
    // `allow_pool_size` starts at zero so a populated pool can be told apart
    // from a fresh one.
    pub fn new(
        config: PoolConfig,
        identity: Identity,
        transport: Arc<dyn SessionTransport>,
    ) -> Result<Self, PoolError> {
        if config.pool_size == 0 {
            return Err(PoolError::InvalidConfig(
                "pool size must be greater than zero".to_string(),
            ));
        }
        if config.service_url.trim().is_empty() {
            return Err(PoolError::InvalidConfig(
                "service url must not be empty".to_string(),
            ));
        }
        // Deserialized configs bypass ExpireScheme::new
        let expire_scheme =
            ExpireScheme::new(config.expire_scheme.min(), config.expire_scheme.max())?;

        Ok(Self {
            service_url: config.service_url,
            config_pool_size: config.pool_size,
            expire_scheme,
            identity,
            transport,
            state: Mutex::new(PoolState {
                available: VecDeque::with_capacity(config.pool_size),
                allow_pool_size: 0,
                queue: QueueState::Open,
                populated: false,
                network_errors: Vec::new(),
                fault_errors: Vec::new(),
            }),
            notify: Notify::new(),
        })
    }

    // Pool backed by the SOAP session service
    pub fn with_soap(config: PoolConfig, identity: Identity) -> Result<Self, PoolError> {
        let transport =
            SoapTransport::new(Duration::from_millis(config.request_timeout_ms), &identity)?;
        Self::new(config, identity, Arc::new(transport))
    }

    // Run `config_pool_size` concurrent create attempts and install every session
    // that is not a hard network failure.
    // Returns the granted size. When nothing could be created the queue is closed so
    // that `pick` returns immediately instead of waiting forever.
    pub async fn populate(&self) -> Result<usize, PoolError> {
        {
            let mut state = self.state.lock();
            if state.queue == QueueState::Closed {
                return Err(PoolError::Closed);
            }
            if state.populated {
                return Err(PoolError::AlreadyPopulated);
            }
            state.populated = true;
        }

        info!(
            service_url = %self.service_url,
            pool_size = self.config_pool_size,
            "Populating session pool"
        );

        let mut guard = PopulateGuard {
            pool: self,
            finished: false,
        };

        let mut attempts: FuturesUnordered<_> = (0..self.config_pool_size)
            .map(|attempt| async move {
                let result = self
                    .transport
                    .create_session(&self.service_url, &self.identity)
                    .await;
                (attempt, result)
            })
            .collect();

        let mut last_network_error: Option<NetworkError> = None;
        let mut orphans = Vec::new();

        while let Some((attempt, result)) = attempts.next().await {
            match result {
                Ok(session) => {
                    if let Some(orphan) = self.install(attempt, session) {
                        orphans.push(orphan);
                    }
                }
                Err(error) => {
                    warn!(attempt, error = %error, "Session create failed");
                    last_network_error = Some(error.clone());
                    self.state.lock().log(SessionError::Network(error));
                }
            }
        }

        guard.finished = true;

        // Closed while we were still creating: release what arrived late
        for orphan in orphans {
            self.close_one(orphan).await;
        }

        let granted = {
            let mut state = self.state.lock();
            if state.queue == QueueState::Closed {
                return Err(PoolError::Closed);
            }
            if state.allow_pool_size == 0 {
                state.queue = QueueState::Closed;
                drop(state);
                self.notify.notify_waiters();
                warn!(
                    attempts = self.config_pool_size,
                    "No session could be created, pool closed"
                );
                return Err(PoolError::NoSessions {
                    attempts: self.config_pool_size,
                    last_error: last_network_error,
                });
            }
            state.allow_pool_size
        };

        info!(
            granted,
            requested = self.config_pool_size,
            "Session pool populated"
        );
        Ok(granted)
    }

    // Installs a freshly created session, handing it back if the pool was closed meanwhile
    fn install(&self, attempt: usize, session: Session) -> Option<Session> {
        let mut state = self.state.lock();
        if state.queue == QueueState::Closed {
            return Some(session);
        }

        if let Some(error) = session.fault_error() {
            warn!(attempt, error = %error, "Session created with remote fault");
            state.log(error);
        } else {
            debug!(attempt, "Session created");
        }

        state.available.push_back(session);
        state.allow_pool_size += 1;
        drop(state);
        self.notify.notify_one();
        None
    }

    // Borrow a session, waiting until one is returned if none is available.
    // A closed pool yields a zero-value session without waiting.
    pub async fn pick(&self) -> Session {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a put between the check and the await is not missed
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some(session) = state.available.pop_front() {
                    return session;
                }
                if state.queue == QueueState::Closed {
                    return Session::default();
                }
            }

            notified.await;
        }
    }

    // Never waits: None only when the pool is open and empty
    pub fn try_pick(&self) -> Option<Session> {
        let mut state = self.state.lock();
        match state.available.pop_front() {
            Some(session) => Some(session),
            None if state.queue == QueueState::Closed => Some(Session::default()),
            None => None,
        }
    }

    pub async fn pick_timeout(&self, timeout: Duration) -> Result<Session, PoolError> {
        tokio::time::timeout(timeout, self.pick())
            .await
            .map_err(|_| PoolError::Timeout(timeout))
    }

    // Return a picked session and wake one waiting `pick`.
    // Returning a session to a closed pool is an error, as is returning more
    // sessions than the pool granted.
    pub fn put(&self, session: Session) -> Result<(), PoolError> {
        let mut state = self.state.lock();
        if state.queue == QueueState::Closed {
            warn!("Session returned to a closed pool");
            return Err(PoolError::Closed);
        }
        if state.available.len() >= state.allow_pool_size {
            return Err(PoolError::Full);
        }

        state.available.push_back(session);
        drop(state);
        self.notify.notify_one();
        Ok(())
    }

    // Tear the pool down, closing every session it currently holds.
    // The queue is closed before the remote calls go out, so pending and future
    // `pick`s return zero-value sessions right away. Sessions that are busy at this
    // point are not closed remotely. Returns how many sessions closed cleanly.
    pub async fn close(&self) -> usize {
        let (drained, busy) = {
            let mut state = self.state.lock();
            let busy = state.allow_pool_size - state.available.len();
            let drained: Vec<Session> = state.available.drain(..).collect();
            state.allow_pool_size = 0;
            state.queue = QueueState::Closed;
            (drained, busy)
        };
        self.notify.notify_waiters();

        if busy > 0 {
            warn!(busy, "Closing pool with sessions still checked out");
        }

        let total = drained.len();
        let results =
            futures::future::join_all(drained.into_iter().map(|session| self.close_one(session)))
                .await;
        let closed = results.into_iter().filter(|ok| *ok).count();

        info!(closed, total, "Session pool closed");
        closed
    }

    async fn close_one(&self, session: Session) -> bool {
        match self
            .transport
            .close_session(&self.service_url, &session)
            .await
        {
            Ok(()) => {
                debug!("Session closed");
                true
            }
            Err(error) => {
                warn!(error = %error, "Session close failed");
                self.state.lock().log(error);
                false
            }
        }
    }

    pub fn service_url(&self) -> &str {
        &self.service_url
    }

    pub fn expire_scheme(&self) -> ExpireScheme {
        self.expire_scheme
    }

    pub fn config_pool_size(&self) -> usize {
        self.config_pool_size
    }

    pub fn allow_pool_size(&self) -> usize {
        self.state.lock().allow_pool_size
    }

    pub fn available(&self) -> usize {
        self.state.lock().available.len()
    }

    pub fn busy(&self) -> usize {
        let state = self.state.lock();
        state.allow_pool_size - state.available.len()
    }

    pub fn queue_state(&self) -> QueueState {
        self.state.lock().queue
    }

    pub fn is_closed(&self) -> bool {
        self.queue_state() == QueueState::Closed
    }

    pub fn is_populated(&self) -> bool {
        self.state.lock().populated
    }

    pub fn network_errors(&self) -> Vec<LoggedError> {
        self.state.lock().network_errors.clone()
    }

    pub fn fault_errors(&self) -> Vec<LoggedError> {
        self.state.lock().fault_errors.clone()
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            config_pool_size: self.config_pool_size,
            allow_pool_size: state.allow_pool_size,
            available: state.available.len(),
            busy: state.allow_pool_size - state.available.len(),
            network_errors: state.network_errors.len(),
            fault_errors: state.fault_errors.len(),
            closed: state.queue == QueueState::Closed,
        }
    }
}
