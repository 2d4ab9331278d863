//! Request/response operations against a named node.
//!
//! A `MgmtOperation` owns a sender and receiver link pair on one session. Every
//! request carries a fresh message id and a reply address; the reply is matched
//! by its correlation id. The non-blocking half (`submit`, `poll`,
//! `take_response`) is what the CBS authenticator drives; `execute` wraps it in
//! a deadline-bounded tick loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::config::{ReceiveConfig, SendConfig};
use crate::connection::{Connection, ConnectionStatus};
use crate::constants::{MGMT_DESCRIPTION_FIELD, MGMT_STATUS_CODE_FIELD, MGMT_TARGET};
use crate::deadline::DeadlineContext;
use crate::engine::ReceiverSettleMode;
use crate::error::{AmqpError, Result};
use crate::message::{Message, SendResult};
use crate::receiver::MessageReceiver;
use crate::sender::MessageSender;
use crate::session::Session;

/// Where a request goes and how its response is read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MgmtOptions {
    pub node: String,
    /// Application property holding the response status code.
    pub status_code_field: String,
    /// Application property holding the response status description.
    pub description_field: String,
    /// Zero waits forever.
    pub timeout_ms: u64,
}

impl Default for MgmtOptions {
    fn default() -> Self {
        Self {
            node: MGMT_TARGET.to_string(),
            status_code_field: MGMT_STATUS_CODE_FIELD.to_string(),
            description_field: MGMT_DESCRIPTION_FIELD.to_string(),
            timeout_ms: 0,
        }
    }
}

impl MgmtOptions {
    pub fn node(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            ..Default::default()
        }
    }

    pub fn with_status_fields(mut self, status_code_field: impl Into<String>, description_field: impl Into<String>) -> Self {
        self.status_code_field = status_code_field.into();
        self.description_field = description_field.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// How a request finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MgmtResult {
    /// A 2xx status.
    Ok,
    /// A response with a non-2xx or missing status.
    Error,
    /// The request was never accepted by the node.
    Failed,
}

/// A parsed management reply.
#[derive(Debug, Clone)]
pub struct MgmtResponse {
    pub result: MgmtResult,
    /// Value of the status-code field, 0 when absent.
    pub status_code: u32,
    pub description: String,
    /// The response message, absent when the request itself failed.
    pub message: Option<Message>,
}

#[derive(Debug, Clone)]
enum MgmtFault {
    Open(String),
    Link(String),
    Closed,
}

impl MgmtFault {
    fn to_error(&self) -> AmqpError {
        match self {
            MgmtFault::Open(reason) => AmqpError::Connection {
                reason: format!("unable to open management session: {}; confirm the namespace exists", reason),
            },
            MgmtFault::Link(reason) => AmqpError::Management {
                reason: format!("management link error: {}", reason),
            },
            MgmtFault::Closed => AmqpError::Management {
                reason: "management operation closed".to_string(),
            },
        }
    }
}

struct MgmtLinks {
    sender: MessageSender,
    receiver: MessageReceiver,
}

/// Request/response link pair against one node.
pub struct MgmtOperation {
    connection: Connection,
    options: MgmtOptions,
    reply_to: String,
    links: Mutex<MgmtLinks>,
    responses: DashMap<String, Option<MgmtResponse>>,
    sent: Mutex<HashMap<u64, String>>,
    next_tag: AtomicU64,
    fault: Mutex<Option<MgmtFault>>,
}

impl MgmtOperation {
    /// Attaches the link pair. An attach failure is recorded and reported by
    /// the first request rather than returned here.
    pub fn open(session: &Session, options: MgmtOptions) -> Self {
        let reply_to = format!("{}-reply-{}", options.node, Uuid::new_v4());
        let send_config = SendConfig::default();
        let receive_config = ReceiveConfig {
            receive_settle_mode: ReceiverSettleMode::PeekLock,
            prefetch: 50,
            ..Default::default()
        };
        let mut sender = MessageSender::new(session, &reply_to, &options.node, Some(format!("{}-sender", reply_to)), &send_config);
        let mut receiver = MessageReceiver::new(session, &options.node, &reply_to, Some(format!("{}-receiver", reply_to)), &receive_config);

        let fault = sender
            .open()
            .and_then(|_| receiver.open())
            .err()
            .map(|e| {
                warn!(node = %options.node, error = %e, "management links failed to open");
                MgmtFault::Open(e.to_string())
            });

        Self {
            connection: session.connection().clone(),
            options,
            reply_to,
            links: Mutex::new(MgmtLinks { sender, receiver }),
            responses: DashMap::new(),
            sent: Mutex::new(HashMap::new()),
            next_tag: AtomicU64::new(0),
            fault: Mutex::new(fault),
        }
    }

    pub fn node(&self) -> &str {
        &self.options.node
    }

    pub fn options(&self) -> &MgmtOptions {
        &self.options
    }

    pub fn reply_to(&self) -> &str {
        &self.reply_to
    }

    /// Requests submitted whose response has not been taken.
    pub fn pending_operations(&self) -> usize {
        self.responses.len()
    }

    pub fn is_pending(&self, operation_id: &str) -> bool {
        self.responses.contains_key(operation_id)
    }

    /// The recorded open or link error, if any.
    pub fn error(&self) -> Option<AmqpError> {
        self.fault.lock().as_ref().map(MgmtFault::to_error)
    }

    pub fn has_failed(&self) -> bool {
        self.fault.lock().is_some()
    }

    /// True once both links are attached.
    pub fn is_open(&self) -> bool {
        let links = self.links.lock();
        links.sender.state() == crate::link::LinkState::Open
            && links.receiver.state() == crate::link::LinkState::Open
    }

    /// Queues a request and returns its operation id.
    ///
    /// `operation` and `op_type` are added to the message's application properties.
    pub fn submit(&self, operation: &str, op_type: &str, mut message: Message) -> Result<String> {
        if let Some(err) = self.error() {
            return Err(err);
        }
        let operation_id = Uuid::new_v4().to_string();
        message.properties.message_id = Some(operation_id.clone());
        message.properties.reply_to = Some(self.reply_to.clone());
        message.application_properties.insert("operation".to_string(), operation.into());
        message.application_properties.insert("type".to_string(), op_type.into());

        self.responses.insert(operation_id.clone(), None);
        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
        self.sent.lock().insert(tag, operation_id.clone());
        self.links.lock().sender.send_async(tag, message, Duration::ZERO);
        debug!(node = %self.options.node, operation, op_type, operation_id = %operation_id, "management request queued");
        Ok(operation_id)
    }

    /// Drains both links, matching responses to pending requests.
    pub fn poll(&self) {
        let mut links = self.links.lock();
        links.sender.pump();
        for completion in links.sender.take_completions() {
            let Some(operation_id) = self.sent.lock().remove(&completion.tag) else {
                continue;
            };
            if let SendResult::Ok = completion.result {
                continue;
            }
            let reason = match completion.result {
                SendResult::Error(reason) => reason,
                other => format!("{:?}", other),
            };
            if let Some(mut entry) = self.responses.get_mut(&operation_id) {
                *entry = Some(MgmtResponse {
                    result: MgmtResult::Failed,
                    status_code: 0,
                    description: reason,
                    message: None,
                });
            }
        }

        for message in links.receiver.pump() {
            let Some(operation_id) = message.properties.correlation_id.clone() else {
                debug!(node = %self.options.node, "response without correlation id dropped");
                continue;
            };
            match self.responses.get_mut(&operation_id) {
                Some(mut entry) => *entry = Some(self.parse_response(message)),
                None => debug!(node = %self.options.node, operation_id = %operation_id, "response for unknown or expired request dropped"),
            }
        }

        let link_error = [
            (links.sender.state(), links.sender.error()),
            (links.receiver.state(), links.receiver.error()),
        ]
        .into_iter()
        .find(|(state, _)| state.is_terminal())
        .map(|(_, err)| err.unwrap_or("link detached").to_string());
        drop(links);

        if let Some(reason) = link_error {
            let mut fault = self.fault.lock();
            if fault.is_none() {
                warn!(node = %self.options.node, reason = %reason, "management operation error");
                *fault = Some(MgmtFault::Link(reason));
            }
        }
    }

    /// Removes and returns the response for `operation_id` once it has arrived.
    pub fn take_response(&self, operation_id: &str) -> Option<MgmtResponse> {
        self.responses
            .remove_if(operation_id, |_, response| response.is_some())
            .and_then(|(_, response)| response)
    }

    /// Forgets a request. A late response for it is dropped.
    pub fn cancel(&self, operation_id: &str) {
        self.responses.remove(operation_id);
        self.sent.lock().retain(|_, id| id != operation_id);
    }

    /// Sends a request and ticks the connection until its response arrives.
    ///
    /// Fails with `Timeout` once `timeout` elapses (zero waits forever). The
    /// request's entry is removed on every exit path.
    pub fn execute(&self, operation: &str, op_type: &str, message: Message, timeout: Duration) -> Result<MgmtResponse> {
        let operation_id = self.submit(operation, op_type, message)?;
        let deadline = DeadlineContext::from_timeout(self.connection.counter(), timeout);
        let outcome = loop {
            if let Some(err) = self.step(&operation_id, &deadline) {
                break err;
            }
            if self.connection.tick() == ConnectionStatus::Closed {
                break Err(AmqpError::ConnectionClosed {
                    reason: self.connection.close_reason(),
                });
            }
        };
        self.finish(&operation_id, outcome)
    }

    /// `execute`, ticking the connection on the blocking pool.
    pub async fn execute_async(
        &self,
        operation: &str,
        op_type: &str,
        message: Message,
        timeout: Duration,
    ) -> Result<MgmtResponse> {
        let operation_id = self.submit(operation, op_type, message)?;
        let deadline = DeadlineContext::from_timeout(self.connection.counter(), timeout);
        let outcome = loop {
            if let Some(err) = self.step(&operation_id, &deadline) {
                break err;
            }
            match self.connection.tick_async().await {
                Ok(ConnectionStatus::Open) => {}
                Ok(ConnectionStatus::Closed) => {
                    break Err(AmqpError::ConnectionClosed {
                        reason: self.connection.close_reason(),
                    })
                }
                Err(e) => break Err(e),
            }
        };
        self.finish(&operation_id, outcome)
    }

    /// Detaches the links and drops every pending request.
    pub fn destroy(&self) {
        {
            let mut fault = self.fault.lock();
            if fault.is_none() {
                *fault = Some(MgmtFault::Closed);
            }
        }
        let mut links = self.links.lock();
        links.sender.destroy();
        links.receiver.destroy();
        drop(links);
        self.responses.clear();
        self.sent.lock().clear();
        debug!(node = %self.options.node, "management operation destroyed");
    }

    /// One loop iteration before ticking: `Some` ends the loop.
    fn step(&self, operation_id: &str, deadline: &DeadlineContext) -> Option<Result<MgmtResponse>> {
        self.poll();
        if let Some(err) = self.error() {
            return Some(Err(err));
        }
        if let Some(response) = self.take_response(operation_id) {
            return Some(Ok(response));
        }
        if let Err(err) = deadline.check("management request") {
            return Some(Err(err));
        }
        None
    }

    fn finish(&self, operation_id: &str, outcome: Result<MgmtResponse>) -> Result<MgmtResponse> {
        if outcome.is_err() {
            self.cancel(operation_id);
        }
        let response = outcome?;
        if response.result != MgmtResult::Ok {
            error!(
                node = %self.options.node,
                status_code = response.status_code,
                description = %response.description,
                "failed to complete management operation"
            );
        }
        Ok(response)
    }

    fn parse_response(&self, message: Message) -> MgmtResponse {
        let props = &message.application_properties;
        let status_code = props
            .get(&self.options.status_code_field)
            .and_then(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
            .map(|code| code as u32);
        let description = props
            .get(&self.options.description_field)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let result = match status_code {
            Some(code) if (200..300).contains(&code) => MgmtResult::Ok,
            _ => MgmtResult::Error,
        };
        MgmtResponse {
            result,
            status_code: status_code.unwrap_or(0),
            description,
            message: Some(message),
        }
    }
}

impl Drop for MgmtOperation {
    fn drop(&mut self) {
        let links = self.links.get_mut();
        links.sender.destroy();
        links.receiver.destroy();
    }
}

impl std::fmt::Debug for MgmtOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MgmtOperation")
            .field("node", &self.options.node)
            .field("pending", &self.pending_operations())
            .field("failed", &self.has_failed())
            .finish()
    }
}
