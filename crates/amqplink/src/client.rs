//! Client lifecycle shared by the send, receive and management clients.
//!
//! This module provides the `ClientCore` every client is built on:
//! - Opening a connection, or adopting an existing shared one
//! - Choosing the session (the CBS session when the connection negotiates tokens)
//! - The `do_work` gate: token handling, readiness, then the role's run step
//! - Closing only what the client owns
//!
//! `AmqpClient` is the core with no link of its own, used for management requests.

use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::address::Address;
use crate::auth::Auth;
use crate::cbs::{Sleeper, ThreadSleeper, TokenProgress};
use crate::config::ClientConfig;
use crate::connection::{Connection, ConnectionStatus};
use crate::engine::EngineFactory;
use crate::error::{AmqpError, Result};
use crate::message::Message;
use crate::mgmt::{MgmtOptions, MgmtResponse};
use crate::session::Session;
use crate::tick::TickCounter;

/// Whether a client can keep working after a `do_work` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkStatus {
    /// The connection is open; call `do_work` again.
    Continue,
    /// The client has shut down or the connection has closed.
    Stop,
}

impl From<ConnectionStatus> for WorkStatus {
    fn from(status: ConnectionStatus) -> Self {
        match status {
            ConnectionStatus::Open => WorkStatus::Continue,
            ConnectionStatus::Closed => WorkStatus::Stop,
        }
    }
}

/// Settings common to every client.
#[derive(Clone, Default)]
pub struct ClientOptions {
    /// Explicit auth. Defaults from the address: SASL-Plain with its userinfo, or anonymous.
    pub auth: Option<Auth>,
    pub config: ClientConfig,
    /// Clock for connections this client opens.
    pub counter: Option<TickCounter>,
    /// Sleep used between CBS retries.
    pub sleeper: Option<Arc<dyn Sleeper>>,
}

impl ClientOptions {
    pub fn with_auth(mut self, auth: Auth) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_counter(mut self, counter: TickCounter) -> Self {
        self.counter = Some(counter);
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = Some(sleeper);
        self
    }
}

impl std::fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientOptions")
            .field("auth", &self.auth)
            .field("config", &self.config)
            .finish()
    }
}

/// Role-specific halves of the `do_work` gate.
pub(crate) trait ClientRole {
    /// Returns true once the role's links are open. May start opening them.
    fn client_ready(&mut self, core: &mut ClientCore) -> Result<bool>;

    /// One iteration of work once ready.
    fn client_run(&mut self, core: &mut ClientCore) -> Result<WorkStatus>;
}

pub(crate) struct ClientCore {
    remote: Address,
    auth: Auth,
    name: String,
    config: ClientConfig,
    factory: Arc<dyn EngineFactory>,
    counter: TickCounter,
    sleeper: Arc<dyn Sleeper>,
    connection: Option<Connection>,
    ext_connection: bool,
    session: Option<Session>,
    pub(crate) shutdown: bool,
}

impl ClientCore {
    pub(crate) fn new(remote: Address, factory: Arc<dyn EngineFactory>, options: ClientOptions) -> Self {
        let auth = match options.auth {
            Some(Auth::SasToken(sas)) => Auth::SasToken(sas.with_cbs_config(&options.config.cbs)),
            Some(auth) => auth,
            None => Auth::from_address(&remote),
        };
        let name = options
            .config
            .client_name
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Self {
            remote,
            auth,
            name,
            config: options.config,
            factory,
            counter: options.counter.unwrap_or_default(),
            sleeper: options.sleeper.unwrap_or_else(|| Arc::new(ThreadSleeper)),
            connection: None,
            ext_connection: false,
            session: None,
            shutdown: false,
        }
    }

    pub(crate) fn remote(&self) -> &Address {
        &self.remote
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub(crate) fn counter(&self) -> &TickCounter {
        &self.counter
    }

    pub(crate) fn connection(&self) -> Option<&Connection> {
        self.connection.as_ref()
    }

    pub(crate) fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub(crate) fn is_open(&self) -> bool {
        self.session.is_some()
    }

    pub(crate) fn is_shared(&self) -> bool {
        self.ext_connection
    }

    /// Opens the client, either on a new connection or on `connection`.
    ///
    /// A passed-in connection is shared: its auth is adopted and it is left open
    /// when this client closes. A no-op if already open.
    pub(crate) fn open(&mut self, connection: Option<Connection>) -> Result<()> {
        if self.session.is_some() {
            return Ok(());
        }
        debug!(client = %self.name, "opening client connection");
        let connection = match connection {
            Some(connection) => {
                debug!(client = %self.name, "using existing connection");
                self.auth = connection.auth().clone();
                self.counter = connection.counter().clone();
                self.ext_connection = true;
                connection
            }
            None => {
                self.ext_connection = false;
                Connection::builder(&self.remote)
                    .auth(self.auth.clone())
                    .container_id(self.name.clone())
                    .config(self.config.connection.clone())
                    .counter(self.counter.clone())
                    .sleeper(Arc::clone(&self.sleeper))
                    .open(self.factory.create())?
            }
        };

        let session = match connection.cbs() {
            Some(cbs) => cbs.session().clone(),
            None => match Session::begin(&connection, self.config.session.clone()) {
                Ok(session) => session,
                Err(e) => {
                    if !self.ext_connection {
                        connection.close();
                    }
                    return Err(e);
                }
            },
        };
        self.connection = Some(connection);
        self.session = Some(session);
        self.shutdown = false;
        Ok(())
    }

    /// Closes the session and connection this client owns. A shared connection,
    /// and its CBS session, are left open. A no-op if already closed.
    pub(crate) fn close(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        if let Some(connection) = self.connection.take() {
            let has_cbs = connection.cbs().is_some();
            if has_cbs && !self.ext_connection {
                debug!(client = %self.name, "closing CBS session");
            } else if !has_cbs {
                debug!(client = %self.name, "closing non-CBS session");
                session.destroy();
            } else {
                debug!(client = %self.name, "not closing CBS session");
            }
            if !self.ext_connection {
                debug!(client = %self.name, "closing unshared connection");
                connection.close();
            } else {
                debug!(client = %self.name, "shared connection remaining open");
            }
        }
    }

    /// Runs one gated iteration for `role`.
    ///
    /// Order: stop if closed; advance CBS; fail on auth timeout; tick while auth
    /// is in progress or the role is not ready; otherwise run the role.
    pub(crate) fn do_work_with<R: ClientRole>(&mut self, role: &mut R) -> Result<WorkStatus> {
        let Some(connection) = self.connection.clone() else {
            return Ok(WorkStatus::Stop);
        };
        if connection.is_closed() {
            return Ok(WorkStatus::Stop);
        }
        let progress = match connection.cbs() {
            Some(cbs) => cbs.handle_token()?,
            None => TokenProgress::default(),
        };
        if self.shutdown {
            return Ok(WorkStatus::Stop);
        }
        if progress.timed_out {
            return Err(self.auth_timeout());
        }
        if progress.in_progress {
            return Ok(connection.tick().into());
        }
        if !role.client_ready(self)? {
            return Ok(connection.tick().into());
        }
        role.client_run(self)
    }

    /// One step of waiting for CBS before a management request. Returns true
    /// once the token is settled.
    pub(crate) fn mgmt_auth_step(&self) -> Result<bool> {
        let connection = self
            .connection
            .as_ref()
            .ok_or_else(|| AmqpError::InvalidArgument("session not yet open".to_string()))?;
        let progress = match connection.cbs() {
            Some(cbs) => cbs.handle_token()?,
            None => return Ok(true),
        };
        if progress.timed_out {
            return Err(self.auth_timeout());
        }
        if !progress.in_progress {
            return Ok(true);
        }
        if connection.tick() == ConnectionStatus::Closed {
            return Err(AmqpError::ConnectionClosed {
                reason: connection.close_reason(),
            });
        }
        Ok(false)
    }

    pub(crate) fn mgmt_request(
        &self,
        message: Message,
        operation: &str,
        op_type: &str,
        options: &MgmtOptions,
    ) -> Result<MgmtResponse> {
        while !self.mgmt_auth_step()? {}
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| AmqpError::InvalidArgument("session not yet open".to_string()))?;
        session.mgmt_request(message, operation, op_type, options)
    }

    /// Ticks the connection once, if open.
    pub(crate) fn tick(&self) -> WorkStatus {
        match &self.connection {
            Some(connection) => connection.tick().into(),
            None => WorkStatus::Stop,
        }
    }

    fn auth_timeout(&self) -> AmqpError {
        let timeout_ms = match &self.auth {
            Auth::SasToken(sas) => sas.timeout().as_millis() as u64,
            _ => 0,
        };
        AmqpError::timeout("authorization", timeout_ms)
    }
}

struct NoRole;

impl ClientRole for NoRole {
    fn client_ready(&mut self, _core: &mut ClientCore) -> Result<bool> {
        Ok(true)
    }

    fn client_run(&mut self, core: &mut ClientCore) -> Result<WorkStatus> {
        Ok(core.tick())
    }
}

/// A client with no link of its own, for management requests.
pub struct AmqpClient {
    core: ClientCore,
}

impl AmqpClient {
    pub fn new(remote: Address, factory: Arc<dyn EngineFactory>, options: ClientOptions) -> Self {
        Self {
            core: ClientCore::new(remote, factory, options),
        }
    }

    /// Opens the client on a new connection, or on a shared `connection`.
    pub fn open(&mut self, connection: Option<Connection>) -> Result<()> {
        self.core.open(connection)
    }

    pub fn close(&mut self) {
        self.core.close();
    }

    /// Runs one connection iteration.
    pub fn do_work(&mut self) -> Result<WorkStatus> {
        self.core.do_work_with(&mut NoRole)
    }

    /// Runs a request/response operation once token negotiation has settled.
    pub fn mgmt_request(
        &mut self,
        message: Message,
        operation: &str,
        op_type: &str,
        options: &MgmtOptions,
    ) -> Result<MgmtResponse> {
        self.core.mgmt_request(message, operation, op_type, options)
    }

    pub fn connection(&self) -> Option<&Connection> {
        self.core.connection()
    }

    pub fn session(&self) -> Option<&Session> {
        self.core.session()
    }

    pub fn name(&self) -> &str {
        self.core.name()
    }

    pub fn is_open(&self) -> bool {
        self.core.is_open()
    }

    pub(crate) fn core(&self) -> &ClientCore {
        &self.core
    }
}

impl Drop for AmqpClient {
    fn drop(&mut self) {
        self.core.close();
    }
}

impl std::fmt::Debug for AmqpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpClient")
            .field("name", &self.core.name())
            .field("remote", &self.core.remote().to_string())
            .field("open", &self.core.is_open())
            .field("shared", &self.core.is_shared())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::auth::{SasTokenAuth, TokenExpiry};
    use crate::cbs::CbsStatus;
    use crate::mgmt::MgmtResult;
    use crate::sim::{SimBroker, TokenPolicy};

    const URI: &str = "amqps://sim.local/hub";

    fn client(broker: &SimBroker, options: ClientOptions) -> AmqpClient {
        AmqpClient::new(Address::parse(URI).unwrap(), broker.factory(), options)
    }

    fn token_options(counter: TickCounter) -> ClientOptions {
        let auth = SasTokenAuth::new("sb://sim.local/hub", URI, "token", TokenExpiry::ExpiresIn(Duration::from_secs(3600))).unwrap();
        ClientOptions::default()
            .with_auth(Auth::SasToken(auth))
            .with_counter(counter)
    }

    #[test]
    fn test_open_close_idempotent() {
        let broker = SimBroker::new();
        let mut client = client(&broker, ClientOptions::default());
        assert_eq!(client.do_work().unwrap(), WorkStatus::Stop);

        client.open(None).unwrap();
        client.open(None).unwrap();
        assert!(client.is_open());
        assert_eq!(broker.stats().connections_opened, 1);
        assert_eq!(client.do_work().unwrap(), WorkStatus::Continue);

        client.close();
        client.close();
        assert!(!client.is_open());
        assert_eq!(broker.stats().connections_closed, 1);
        assert_eq!(client.do_work().unwrap(), WorkStatus::Stop);
    }

    #[test]
    fn test_client_name_from_config() {
        let broker = SimBroker::new();
        let mut config = ClientConfig::default();
        config.client_name = Some("orders-client".to_string());
        let mut client = client(&broker, ClientOptions::default().with_config(config));
        client.open(None).unwrap();
        assert_eq!(client.name(), "orders-client");
        assert_eq!(broker.last_open().unwrap().container_id, "orders-client");
    }

    #[test]
    fn test_open_failure_leaves_client_closed() {
        let broker = SimBroker::new();
        broker.fail_open("connection refused");
        let mut client = client(&broker, ClientOptions::default());
        match client.open(None) {
            Err(AmqpError::Connection { reason }) => assert!(reason.contains("connection refused")),
            other => panic!("expected connection error, got {:?}", other),
        }
        assert!(!client.is_open());
        assert!(client.connection().is_none());
    }

    #[test]
    fn test_shared_connection_left_open() {
        let broker = SimBroker::new();
        let address = Address::parse(URI).unwrap();
        let shared = Connection::open(&address, Auth::SaslAnonymous, broker.engine()).unwrap();

        let mut first = client(&broker, ClientOptions::default());
        let mut second = client(&broker, ClientOptions::default());
        first.open(Some(shared.clone())).unwrap();
        second.open(Some(shared.clone())).unwrap();
        assert_eq!(shared.session_count(), 2);

        first.close();
        second.close();
        assert!(!shared.is_closed());
        assert_eq!(shared.session_count(), 0);
        assert_eq!(broker.stats().connections_closed, 0);
        shared.close();
    }

    #[test]
    fn test_mgmt_request() {
        let broker = SimBroker::new();
        let mut client = client(&broker, ClientOptions::default());
        client.open(None).unwrap();
        let response = client
            .mgmt_request(Message::new("query"), "READ", "com.example:queue", &MgmtOptions::default())
            .unwrap();
        assert_eq!(response.result, MgmtResult::Ok);
        assert_eq!(response.description, "OK");
    }

    #[test]
    fn test_mgmt_request_before_open_fails() {
        let broker = SimBroker::new();
        let mut client = client(&broker, ClientOptions::default());
        assert!(matches!(
            client.mgmt_request(Message::new("query"), "READ", "entity", &MgmtOptions::default()),
            Err(AmqpError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_cbs_gates_work_until_token_accepted() {
        let broker = SimBroker::new();
        let mut client = client(&broker, token_options(TickCounter::new()));
        client.open(None).unwrap();
        let cbs = client.connection().and_then(Connection::cbs).unwrap();
        assert_eq!(cbs.status(), CbsStatus::Idle);

        for _ in 0..20 {
            assert_eq!(client.do_work().unwrap(), WorkStatus::Continue);
            if cbs.status() == CbsStatus::Ok {
                break;
            }
        }
        assert_eq!(cbs.status(), CbsStatus::Ok);
        assert_eq!(broker.stats().token_requests, 1);

        // Clients on a token connection share the CBS session.
        assert_eq!(client.session().map(Session::handle), Some(cbs.session().handle()));
    }

    #[test]
    fn test_cbs_timeout_fails_work() {
        let broker = SimBroker::new();
        broker.set_token_policy(TokenPolicy::Silent);
        let counter = TickCounter::manual();
        broker.advance_clock_on_tick(&counter, Duration::from_millis(50));
        let mut options = token_options(counter);
        options.config.cbs.auth_timeout_ms = 200;
        let mut client = client(&broker, options);
        client.open(None).unwrap();

        let mut result = Ok(WorkStatus::Continue);
        for _ in 0..20 {
            result = client.do_work();
            if result.is_err() {
                break;
            }
        }
        match result {
            Err(AmqpError::Timeout { operation, timeout_ms }) => {
                assert_eq!(operation, "authorization");
                assert_eq!(timeout_ms, 200);
            }
            other => panic!("expected authorization timeout, got {:?}", other),
        }
    }

    #[test]
    fn test_drop_closes_owned_connection() {
        let broker = SimBroker::new();
        {
            let mut client = client(&broker, ClientOptions::default());
            client.open(None).unwrap();
        }
        assert_eq!(broker.stats().connections_closed, 1);
    }
}
