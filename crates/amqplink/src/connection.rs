//! A connection to one AMQP container.
//!
//! `Connection` owns the transport engine and is the only place the engine is
//! ticked. Each tick runs under a single lock so clients sharing one connection
//! serialize their network activity. Events produced by the tick are routed to
//! per-link channels; links drain their own channel when their owner checks on
//! them.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::address::Address;
use crate::auth::Auth;
use crate::cbs::{CbsAuthenticator, Sleeper, ThreadSleeper};
use crate::config::ConnectionConfig;
use crate::engine::{
    AttachParams, DeliveryOutcome, EngineEvent, LinkHandle, OpenParams, SessionHandle,
    SessionParams, TransportEngine,
};
use crate::error::{AmqpError, Result};
use crate::link::LinkEvent;
use crate::message::Message;
use crate::tick::TickCounter;

/// Result of one connection iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// The connection can keep ticking.
    Open,
    /// The engine closed or failed; no further ticks run.
    Closed,
}

struct ConnectionInner {
    hostname: String,
    container_id: String,
    auth: Auth,
    trace_frames: bool,
    engine: Mutex<Box<dyn TransportEngine>>,
    routes: DashMap<LinkHandle, UnboundedSender<LinkEvent>>,
    sessions: Mutex<HashSet<SessionHandle>>,
    cbs: Mutex<Option<Arc<CbsAuthenticator>>>,
    counter: TickCounter,
    closed: AtomicBool,
    destroyed: AtomicBool,
    close_reason: Mutex<Option<String>>,
}

/// Shared handle to an open connection. Clones refer to the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

/// Options for opening a [`Connection`].
pub struct ConnectionBuilder {
    hostname: String,
    port: u16,
    auth: Auth,
    container_id: Option<String>,
    config: ConnectionConfig,
    counter: TickCounter,
    sleeper: Arc<dyn Sleeper>,
}

impl ConnectionBuilder {
    pub fn auth(mut self, auth: Auth) -> Self {
        self.auth = auth;
        self
    }

    pub fn container_id(mut self, container_id: impl Into<String>) -> Self {
        self.container_id = Some(container_id.into());
        self
    }

    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Clock used for every timeout measured on this connection.
    pub fn counter(mut self, counter: TickCounter) -> Self {
        self.counter = counter;
        self
    }

    /// Blocking sleep used between CBS retries.
    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Opens the transport and, for token auth, starts the CBS authenticator.
    pub fn open(self, mut engine: Box<dyn TransportEngine>) -> Result<Connection> {
        let container_id = self
            .container_id
            .unwrap_or_else(|| format!("amqplink-{}", Uuid::new_v4()));
        let params = OpenParams {
            hostname: self.hostname.clone(),
            port: self.port,
            container_id: container_id.clone(),
            auth: self.auth.clone(),
            max_frame_size: self.config.max_frame_size,
            channel_max: self.config.channel_max,
            idle_timeout_ms: self.config.idle_timeout_ms,
            properties: self.config.properties.clone(),
            idle_empty_frame_ratio: self.config.idle_empty_frame_ratio,
            trace: self.config.trace_frames,
        };
        engine.open(&params).map_err(|e| AmqpError::Connection {
            reason: format!("failed to open connection to {}: {}", self.hostname, e),
        })?;

        let connection = Connection {
            inner: Arc::new(ConnectionInner {
                hostname: self.hostname,
                container_id,
                auth: self.auth,
                trace_frames: self.config.trace_frames,
                engine: Mutex::new(engine),
                routes: DashMap::new(),
                sessions: Mutex::new(HashSet::new()),
                cbs: Mutex::new(None),
                counter: self.counter,
                closed: AtomicBool::new(false),
                destroyed: AtomicBool::new(false),
                close_reason: Mutex::new(None),
            }),
        };

        if let Auth::SasToken(sas) = &connection.inner.auth {
            match CbsAuthenticator::create(&connection, sas.clone(), self.sleeper) {
                Ok(cbs) => *connection.inner.cbs.lock() = Some(Arc::new(cbs)),
                Err(e) => {
                    connection.close();
                    return Err(e);
                }
            }
        }

        info!(
            hostname = %connection.inner.hostname,
            container_id = %connection.inner.container_id,
            mechanism = connection.inner.auth.mechanism(),
            "connection opened"
        );
        Ok(connection)
    }
}

impl Connection {
    /// Starts configuring a connection to `address`'s host.
    pub fn builder(address: &Address) -> ConnectionBuilder {
        ConnectionBuilder {
            hostname: address.hostname().to_string(),
            port: address.port(),
            auth: Auth::from_address(address),
            container_id: None,
            config: ConnectionConfig::default(),
            counter: TickCounter::new(),
            sleeper: Arc::new(ThreadSleeper),
        }
    }

    /// Opens a connection with default settings.
    pub fn open(address: &Address, auth: Auth, engine: Box<dyn TransportEngine>) -> Result<Connection> {
        Self::builder(address).auth(auth).open(engine)
    }

    pub fn hostname(&self) -> &str {
        &self.inner.hostname
    }

    pub fn container_id(&self) -> &str {
        &self.inner.container_id
    }

    pub fn auth(&self) -> &Auth {
        &self.inner.auth
    }

    pub fn counter(&self) -> &TickCounter {
        &self.inner.counter
    }

    /// The CBS authenticator, if this connection negotiates tokens.
    pub fn cbs(&self) -> Option<Arc<CbsAuthenticator>> {
        self.inner.cbs.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn close_reason(&self) -> Option<String> {
        self.inner.close_reason.lock().clone()
    }

    /// Number of sessions begun and not yet ended.
    pub fn session_count(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    /// Number of links currently receiving events.
    pub fn link_count(&self) -> usize {
        self.inner.routes.len()
    }

    /// Performs one transport pass and routes what it produced.
    ///
    /// Transient engine errors are logged and absorbed; fatal ones close the
    /// connection and are reported as `Closed`.
    pub fn tick(&self) -> ConnectionStatus {
        if self.is_closed() {
            return ConnectionStatus::Closed;
        }
        let mut engine = self.inner.engine.lock();
        match engine.tick() {
            Ok(events) => {
                for event in events {
                    self.dispatch(event);
                }
            }
            Err(e) if !e.is_fatal() => {
                debug!(hostname = %self.inner.hostname, error = %e, "transient transport error, retrying next tick");
            }
            Err(e) => {
                warn!(hostname = %self.inner.hostname, error = %e, "transport failed");
                self.mark_closed(Some(e.to_string()));
            }
        }
        drop(engine);

        if self.is_closed() {
            ConnectionStatus::Closed
        } else {
            ConnectionStatus::Open
        }
    }

    /// `tick` on the blocking pool.
    pub async fn tick_async(&self) -> Result<ConnectionStatus> {
        let connection = self.clone();
        Ok(tokio::task::spawn_blocking(move || connection.tick()).await?)
    }

    /// Closes the CBS authenticator, then the transport. Further calls are no-ops.
    pub fn close(&self) {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        let cbs = self.inner.cbs.lock().take();
        if let Some(cbs) = cbs {
            debug!(hostname = %self.inner.hostname, "closing CBS authenticator");
            cbs.close();
        }
        if let Err(e) = self.inner.engine.lock().close() {
            debug!(hostname = %self.inner.hostname, error = %e, "engine close failed");
        }
        self.mark_closed(None);
        self.inner.routes.clear();
        self.inner.sessions.lock().clear();
        info!(hostname = %self.inner.hostname, "connection closed");
    }

    /// `close` on the blocking pool.
    pub async fn close_async(&self) -> Result<()> {
        let connection = self.clone();
        Ok(tokio::task::spawn_blocking(move || connection.close()).await?)
    }

    fn dispatch(&self, event: EngineEvent) {
        if self.inner.trace_frames {
            trace!(hostname = %self.inner.hostname, event = ?event, "engine event");
        }
        let (link, link_event) = match event {
            EngineEvent::ConnectionClosed { error } => {
                self.mark_closed(error);
                return;
            }
            EngineEvent::Attached { link, max_message_size } => {
                (link, LinkEvent::Attached { max_message_size })
            }
            EngineEvent::Detached { link, error } => (link, LinkEvent::Detached { error }),
            EngineEvent::Credit { link, credit } => (link, LinkEvent::Credit(credit)),
            EngineEvent::Delivery { link, delivery_id, message, settled } => {
                (link, LinkEvent::Delivery { delivery_id, message, settled })
            }
            EngineEvent::Disposition { link, delivery_id, outcome } => {
                (link, LinkEvent::Disposition { delivery_id, outcome })
            }
        };

        let delivered = match self.inner.routes.get(&link) {
            Some(route) => route.send(link_event).is_ok(),
            None => {
                debug!(link = %link, "event for unknown link dropped");
                true
            }
        };
        if !delivered {
            self.inner.routes.remove(&link);
        }
    }

    fn mark_closed(&self, reason: Option<String>) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if reason.is_some() {
            *self.inner.close_reason.lock() = reason.clone();
        }
        for route in self.inner.routes.iter() {
            let _ = route.value().send(LinkEvent::ConnectionClosed { error: reason.clone() });
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(AmqpError::ConnectionClosed {
                reason: self.close_reason(),
            });
        }
        Ok(())
    }

    pub(crate) fn begin_session(&self, params: &SessionParams) -> Result<SessionHandle> {
        self.ensure_open()?;
        let handle = self.inner.engine.lock().begin_session(params)?;
        self.inner.sessions.lock().insert(handle);
        Ok(handle)
    }

    pub(crate) fn end_session(&self, session: SessionHandle) -> Result<()> {
        if !self.inner.sessions.lock().remove(&session) || self.is_closed() {
            return Ok(());
        }
        self.inner.engine.lock().end_session(session)
    }

    /// Attaches a link and registers its event channel under the engine lock,
    /// so no tick can produce events for it before the route exists.
    pub(crate) fn attach_link(
        &self,
        session: SessionHandle,
        params: &AttachParams,
    ) -> Result<(LinkHandle, UnboundedReceiver<LinkEvent>)> {
        self.ensure_open()?;
        let mut engine = self.inner.engine.lock();
        let handle = engine.attach(session, params)?;
        let (tx, rx) = unbounded_channel();
        self.inner.routes.insert(handle, tx);
        Ok((handle, rx))
    }

    pub(crate) fn detach_link(&self, link: LinkHandle) -> Result<()> {
        self.inner.routes.remove(&link);
        if self.is_closed() {
            return Ok(());
        }
        self.inner.engine.lock().detach(link)
    }

    pub(crate) fn transfer(&self, link: LinkHandle, delivery_id: u64, message: &Message, settled: bool) -> Result<()> {
        self.ensure_open()?;
        self.inner.engine.lock().transfer(link, delivery_id, message, settled)
    }

    pub(crate) fn settle(&self, link: LinkHandle, delivery_id: u64, outcome: DeliveryOutcome) -> Result<()> {
        self.ensure_open()?;
        self.inner.engine.lock().settle(link, delivery_id, outcome)
    }

    pub(crate) fn flow(&self, link: LinkHandle, credit: u32) -> Result<()> {
        self.ensure_open()?;
        self.inner.engine.lock().flow(link, credit)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("hostname", &self.inner.hostname)
            .field("container_id", &self.inner.container_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
