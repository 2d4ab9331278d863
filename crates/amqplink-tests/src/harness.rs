//! Test Harness - simulated broker environment for client scenarios

use std::sync::Once;
use std::time::Duration;

use amqplink::sim::SimBroker;
use amqplink::{
    AmqpClient, Auth, ClientOptions, Message, ReceiveClient, SasTokenAuth, SendClient, Source, Target,
    TickCounter, TokenExpiry,
};
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Host every harness address points at.
pub const SIM_HOST: &str = "sim.local";

static TRACING: Once = Once::new();

/// Installs a test-writer fmt subscriber once per process. Filtered by `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// One broker plus a manual clock that advances on every engine tick.
#[derive(Debug, Clone)]
pub struct SimEnv {
    broker: SimBroker,
    counter: TickCounter,
}

impl SimEnv {
    /// Environment whose clock advances `tick_ms` per connection tick.
    pub fn new(tick_ms: u64) -> Self {
        init_tracing();
        let broker = SimBroker::new();
        let counter = TickCounter::manual();
        broker.advance_clock_on_tick(&counter, Duration::from_millis(tick_ms));
        debug!(tick_ms, "sim environment ready");
        Self { broker, counter }
    }

    pub fn broker(&self) -> &SimBroker {
        &self.broker
    }

    pub fn counter(&self) -> &TickCounter {
        &self.counter
    }

    pub fn now_ms(&self) -> u64 {
        self.counter.current_ms()
    }

    pub fn uri(&self, entity: &str) -> String {
        format!("amqps://{}/{}", SIM_HOST, entity)
    }

    /// Client options on this environment's clock.
    pub fn options(&self) -> ClientOptions {
        ClientOptions::default().with_counter(self.counter.clone())
    }

    /// Options authenticating with a SAS token for `entity`.
    pub fn token_options(&self, entity: &str) -> ClientOptions {
        let uri = self.uri(entity);
        let audience = format!("sb://{}/{}", SIM_HOST, entity);
        let auth = SasTokenAuth::new(audience, &uri, "SharedAccessSignature sr=sim", TokenExpiry::ExpiresIn(Duration::from_secs(3600)))
            .unwrap_or_else(|e| panic!("invalid token auth for {}: {}", uri, e));
        self.options().with_auth(Auth::SasToken(auth))
    }

    pub fn send_client(&self, entity: &str, options: ClientOptions) -> SendClient {
        SendClient::new(self.target(entity), self.broker.factory(), options)
    }

    pub fn receive_client(&self, entity: &str, options: ClientOptions) -> ReceiveClient {
        ReceiveClient::new(self.source(entity), self.broker.factory(), options)
    }

    pub fn amqp_client(&self, entity: &str, options: ClientOptions) -> AmqpClient {
        let address = self.target(entity).address().clone();
        AmqpClient::new(address, self.broker.factory(), options)
    }

    pub fn target(&self, entity: &str) -> Target {
        let uri = self.uri(entity);
        Target::parse(&uri).unwrap_or_else(|e| panic!("invalid target {}: {}", uri, e))
    }

    pub fn source(&self, entity: &str) -> Source {
        let uri = self.uri(entity);
        Source::parse(&uri).unwrap_or_else(|e| panic!("invalid source {}: {}", uri, e))
    }

    /// Publishes `count` messages with bodies `msg-0`, `msg-1`, ...
    pub fn publish(&self, entity: &str, count: usize) {
        for i in 0..count {
            self.broker.publish(entity, Message::new(format!("msg-{}", i)));
        }
    }
}

impl Default for SimEnv {
    fn default() -> Self {
        Self::new(10)
    }
}
