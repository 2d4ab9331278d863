//! In-process simulated broker.
//!
//! `SimBroker` implements [`EngineFactory`]; every engine it creates talks to
//! the same set of in-memory queues, so a message sent by one client can be
//! received by another. Request/response nodes (`$cbs`, `$management` and any
//! registered handler) answer on the requester's reply address. Attach,
//! disposition and token behavior are configurable, and faults can be injected
//! into the next tick.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::address::Address;
use crate::constants::{
    CBS_DESCRIPTION_FIELD, CBS_NODE, CBS_STATUS_CODE_FIELD, MGMT_DESCRIPTION_FIELD, MGMT_STATUS_CODE_FIELD,
    MGMT_TARGET,
};
use crate::engine::{
    AttachParams, DeliveryOutcome, EngineEvent, EngineFactory, LinkHandle, OpenParams, ReceiverSettleMode, Role,
    SessionHandle, SessionParams, TransportEngine,
};
use crate::error::{AmqpError, Result};
use crate::message::Message;
use crate::tick::TickCounter;
use crate::value::AmqpValue;

/// How the broker answers an ATTACH on a data link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttachPolicy {
    Accept,
    /// Detach with this error.
    Reject(String),
    /// Never answer.
    Stall,
}

/// How the broker settles transfers on a data link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DispositionPolicy {
    /// Queue the message and accept it.
    Accept,
    /// Drop the message and reject it with this condition.
    Reject(String),
    /// Drop the message and never settle it.
    Silent,
}

/// How the `$cbs` node answers a PUT-token request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenPolicy {
    Accept,
    Refuse { status_code: u32, description: String },
    /// Never answer.
    Silent,
}

/// Answers a request sent to a node. `None` leaves it unanswered.
pub type NodeHandler = Arc<dyn Fn(&Message) -> Option<Message> + Send + Sync>;

/// Counters for what the broker has seen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimStats {
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub links_attached: u64,
    pub transfers: u64,
    pub deliveries: u64,
    pub settlements: u64,
    pub token_requests: u64,
    pub mgmt_requests: u64,
}

struct BrokerState {
    queues: HashMap<String, VecDeque<Message>>,
    attach_policy: AttachPolicy,
    disposition_policy: DispositionPolicy,
    sender_credit: u32,
    token_policy: TokenPolicy,
    token_script: VecDeque<TokenPolicy>,
    handlers: HashMap<String, NodeHandler>,
    fail_open: Option<String>,
    transient_failures: u32,
    reset_pending: bool,
    clock: Option<(TickCounter, Duration)>,
    last_open: Option<OpenParams>,
    stats: SimStats,
}

/// Shared in-memory broker. Clones refer to the same broker.
#[derive(Clone)]
pub struct SimBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl Default for SimBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl SimBroker {
    pub fn new() -> Self {
        let mut handlers: HashMap<String, NodeHandler> = HashMap::new();
        handlers.insert(MGMT_TARGET.to_string(), Arc::new(echo_handler));
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                queues: HashMap::new(),
                attach_policy: AttachPolicy::Accept,
                disposition_policy: DispositionPolicy::Accept,
                sender_credit: 100,
                token_policy: TokenPolicy::Accept,
                token_script: VecDeque::new(),
                handlers,
                fail_open: None,
                transient_failures: 0,
                reset_pending: false,
                clock: None,
                last_open: None,
                stats: SimStats::default(),
            })),
        }
    }

    /// Boxed engine factory for client constructors.
    pub fn factory(&self) -> Arc<dyn EngineFactory> {
        Arc::new(self.clone())
    }

    pub fn engine(&self) -> Box<dyn TransportEngine> {
        Box::new(SimEngine::new(self.clone()))
    }

    pub fn set_attach_policy(&self, policy: AttachPolicy) {
        self.state.lock().attach_policy = policy;
    }

    pub fn set_disposition_policy(&self, policy: DispositionPolicy) {
        self.state.lock().disposition_policy = policy;
    }

    /// Credit granted to each sender link on attach.
    pub fn set_sender_credit(&self, credit: u32) {
        self.state.lock().sender_credit = credit;
    }

    /// Default answer to PUT-token requests.
    pub fn set_token_policy(&self, policy: TokenPolicy) {
        self.state.lock().token_policy = policy;
    }

    /// Answers for the next PUT-token requests, used before the default policy.
    pub fn script_tokens(&self, answers: impl IntoIterator<Item = TokenPolicy>) {
        self.state.lock().token_script.extend(answers);
    }

    /// Routes requests sent to `node` through `handler`, replacing any existing one.
    pub fn set_node_handler(&self, node: impl Into<String>, handler: NodeHandler) {
        self.state.lock().handlers.insert(node.into(), handler);
    }

    /// Makes the next engine `open` fail with `reason`.
    pub fn fail_open(&self, reason: impl Into<String>) {
        self.state.lock().fail_open = Some(reason.into());
    }

    /// Makes the next `count` ticks fail with a transient transport error.
    pub fn fail_ticks(&self, count: u32) {
        self.state.lock().transient_failures = count;
    }

    /// Makes the next tick fail with a connection reset.
    pub fn reset_next_tick(&self) {
        self.state.lock().reset_pending = true;
    }

    /// Advances `counter` by `step` on every tick of every engine.
    pub fn advance_clock_on_tick(&self, counter: &TickCounter, step: Duration) {
        self.state.lock().clock = Some((counter.clone(), step));
    }

    /// Adds a message to the queue behind `address`.
    pub fn publish(&self, address: &str, message: Message) {
        let key = queue_key(address);
        self.state.lock().queues.entry(key).or_default().push_back(message);
    }

    pub fn queue_len(&self, address: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(&queue_key(address))
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    /// Removes and returns every message queued behind `address`.
    pub fn drain_queue(&self, address: &str) -> Vec<Message> {
        self.state
            .lock()
            .queues
            .remove(&queue_key(address))
            .map(Vec::from)
            .unwrap_or_default()
    }

    pub fn stats(&self) -> SimStats {
        self.state.lock().stats
    }

    /// Parameters of the most recent successful open.
    pub fn last_open(&self) -> Option<OpenParams> {
        self.state.lock().last_open.clone()
    }
}

impl EngineFactory for SimBroker {
    fn create(&self) -> Box<dyn TransportEngine> {
        self.engine()
    }
}

impl std::fmt::Debug for SimBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SimBroker")
            .field("queues", &state.queues.len())
            .field("stats", &state.stats)
            .finish()
    }
}

/// Queue name for an address: the entity path of a URI, otherwise the string itself.
fn queue_key(address: &str) -> String {
    match Address::parse(address) {
        Ok(parsed) => parsed.entity().to_string(),
        Err(_) => address.to_string(),
    }
}

/// Default `$management` handler: 200 with the request body echoed back.
fn echo_handler(request: &Message) -> Option<Message> {
    Some(
        Message::new(request.body().clone())
            .with_application_property(MGMT_STATUS_CODE_FIELD, AmqpValue::Int(200))
            .with_application_property(MGMT_DESCRIPTION_FIELD, "OK"),
    )
}

struct SimLink {
    role: Role,
    source: String,
    target: String,
    settle_mode: ReceiverSettleMode,
    credit: u32,
    next_delivery_id: u64,
}

impl SimLink {
    /// Queue a receiver reads from. Node links read replies addressed to their target.
    fn inbox(&self, handlers: &HashMap<String, NodeHandler>) -> String {
        if self.source == CBS_NODE || handlers.contains_key(&self.source) {
            self.target.clone()
        } else {
            queue_key(&self.source)
        }
    }
}

/// One simulated connection.
pub struct SimEngine {
    broker: SimBroker,
    open: bool,
    next_session: u32,
    next_link: u32,
    links: HashMap<LinkHandle, SimLink>,
    events: Vec<EngineEvent>,
}

impl SimEngine {
    pub fn new(broker: SimBroker) -> Self {
        Self {
            broker,
            open: false,
            next_session: 0,
            next_link: 0,
            links: HashMap::new(),
            events: Vec::new(),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(AmqpError::ConnectionClosed { reason: None })
        }
    }

    fn deliver(&mut self, state: &mut BrokerState) {
        for (handle, link) in self.links.iter_mut() {
            if link.role != Role::Receiver || link.credit == 0 {
                continue;
            }
            let inbox = link.inbox(&state.handlers);
            let Some(queue) = state.queues.get_mut(&inbox) else {
                continue;
            };
            while link.credit > 0 {
                let Some(message) = queue.pop_front() else {
                    break;
                };
                link.credit -= 1;
                let delivery_id = link.next_delivery_id;
                link.next_delivery_id += 1;
                state.stats.deliveries += 1;
                self.events.push(EngineEvent::Delivery {
                    link: *handle,
                    delivery_id,
                    message,
                    settled: link.settle_mode == ReceiverSettleMode::ReceiveAndDelete,
                });
            }
        }
    }

    fn answer_token(state: &mut BrokerState, request: &Message) -> Option<Message> {
        state.stats.token_requests += 1;
        let policy = state
            .token_script
            .pop_front()
            .unwrap_or_else(|| state.token_policy.clone());
        let (status_code, description) = match policy {
            TokenPolicy::Accept => (202, "Accepted".to_string()),
            TokenPolicy::Refuse { status_code, description } => (status_code, description),
            TokenPolicy::Silent => return None,
        };
        trace!(status_code, body_len = request.body().len(), "answering put-token");
        Some(
            Message::new(bytes::Bytes::new())
                .with_application_property(CBS_STATUS_CODE_FIELD, AmqpValue::Int(status_code as i64))
                .with_application_property(CBS_DESCRIPTION_FIELD, description),
        )
    }
}

impl TransportEngine for SimEngine {
    fn open(&mut self, params: &OpenParams) -> Result<()> {
        let mut state = self.broker.state.lock();
        if let Some(reason) = state.fail_open.take() {
            return Err(AmqpError::Connection { reason });
        }
        state.stats.connections_opened += 1;
        state.last_open = Some(params.clone());
        self.open = true;
        debug!(hostname = %params.hostname, container_id = %params.container_id, "sim connection opened");
        Ok(())
    }

    fn tick(&mut self) -> Result<Vec<EngineEvent>> {
        self.ensure_open()?;
        let broker = self.broker.clone();
        let mut state = broker.state.lock();
        if let Some((counter, step)) = &state.clock {
            counter.advance(*step);
        }
        if state.reset_pending {
            state.reset_pending = false;
            self.open = false;
            return Err(AmqpError::ConnectionReset);
        }
        if state.transient_failures > 0 {
            state.transient_failures -= 1;
            return Err(AmqpError::Transport {
                reason: "simulated short read".to_string(),
            });
        }
        self.deliver(&mut state);
        Ok(std::mem::take(&mut self.events))
    }

    fn begin_session(&mut self, _params: &SessionParams) -> Result<SessionHandle> {
        self.ensure_open()?;
        self.next_session += 1;
        Ok(SessionHandle(self.next_session))
    }

    fn end_session(&mut self, _session: SessionHandle) -> Result<()> {
        Ok(())
    }

    fn attach(&mut self, _session: SessionHandle, params: &AttachParams) -> Result<LinkHandle> {
        self.ensure_open()?;
        self.next_link += 1;
        let handle = LinkHandle(self.next_link);
        let mut state = self.broker.state.lock();

        let node = match params.role {
            Role::Sender => &params.target,
            Role::Receiver => &params.source,
        };
        let is_node = node == CBS_NODE || state.handlers.contains_key(node);
        let policy = if is_node {
            AttachPolicy::Accept
        } else {
            state.attach_policy.clone()
        };

        match policy {
            AttachPolicy::Accept => {
                state.stats.links_attached += 1;
                self.events.push(EngineEvent::Attached {
                    link: handle,
                    max_message_size: Some(params.max_message_size),
                });
                if params.role == Role::Sender {
                    self.events.push(EngineEvent::Credit {
                        link: handle,
                        credit: state.sender_credit,
                    });
                }
            }
            AttachPolicy::Reject(reason) => {
                self.events.push(EngineEvent::Detached {
                    link: handle,
                    error: Some(reason),
                });
            }
            AttachPolicy::Stall => {}
        }

        self.links.insert(
            handle,
            SimLink {
                role: params.role,
                source: params.source.clone(),
                target: params.target.clone(),
                settle_mode: params.receive_settle_mode,
                credit: if params.role == Role::Receiver {
                    params.initial_credit.unwrap_or(0)
                } else {
                    0
                },
                next_delivery_id: 0,
            },
        );
        Ok(handle)
    }

    fn detach(&mut self, link: LinkHandle) -> Result<()> {
        self.links.remove(&link);
        Ok(())
    }

    fn transfer(&mut self, link: LinkHandle, delivery_id: u64, message: &Message, settled: bool) -> Result<()> {
        self.ensure_open()?;
        let Some(target) = self.links.get(&link).map(|l| l.target.clone()) else {
            return Err(AmqpError::Transport {
                reason: format!("transfer on unknown {}", link),
            });
        };
        let mut state = self.broker.state.lock();
        state.stats.transfers += 1;

        let reply = if target == CBS_NODE {
            Some(Self::answer_token(&mut state, message))
        } else if let Some(handler) = state.handlers.get(&target).cloned() {
            state.stats.mgmt_requests += 1;
            Some(handler(message))
        } else {
            None
        };

        let outcome = match reply {
            Some(response) => {
                if let (Some(mut response), Some(reply_to)) = (response, message.properties.reply_to.clone()) {
                    response.properties.correlation_id = message.properties.message_id.clone();
                    state.queues.entry(reply_to).or_default().push_back(response);
                }
                Some(DeliveryOutcome::Accepted)
            }
            None => match state.disposition_policy.clone() {
                DispositionPolicy::Accept => {
                    state.queues.entry(queue_key(&target)).or_default().push_back(message.clone());
                    Some(DeliveryOutcome::Accepted)
                }
                DispositionPolicy::Reject(condition) => Some(DeliveryOutcome::Rejected {
                    condition,
                    description: None,
                }),
                DispositionPolicy::Silent => None,
            },
        };

        if let (Some(outcome), false) = (outcome, settled) {
            self.events.push(EngineEvent::Disposition {
                link,
                delivery_id,
                outcome,
            });
        }
        Ok(())
    }

    fn settle(&mut self, _link: LinkHandle, _delivery_id: u64, _outcome: DeliveryOutcome) -> Result<()> {
        self.broker.state.lock().stats.settlements += 1;
        Ok(())
    }

    fn flow(&mut self, link: LinkHandle, credit: u32) -> Result<()> {
        if let Some(link) = self.links.get_mut(&link) {
            link.credit = credit;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.open {
            self.open = false;
            self.broker.state.lock().stats.connections_closed += 1;
        }
        self.links.clear();
        Ok(())
    }
}
