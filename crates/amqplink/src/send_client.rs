//! Sending client.
//!
//! Messages are queued on the client, then handed to the sender link once it
//! is attached. Each queued message carries its own state; the client only
//! escalates failures when a caller asks for all-or-nothing semantics through
//! `send_message`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::address::{Address, Target};
use crate::client::{ClientCore, ClientOptions, ClientRole, WorkStatus};
use crate::connection::Connection;
use crate::engine::EngineFactory;
use crate::error::{AmqpError, Result};
use crate::link::LinkState;
use crate::message::{Gather, Message, MessageState, SendResult};
use crate::sender::MessageSender;

struct Pending {
    tag: u64,
    message: Message,
}

struct SendRole {
    target: Target,
    sender: Option<MessageSender>,
    pending: Vec<Pending>,
    watched: HashSet<u64>,
    finished: HashMap<u64, Message>,
    next_tag: u64,
    msg_timeout_ms: u64,
}

impl SendRole {
    fn queue(&mut self, message: Message, now_ms: u64, watch: bool) -> u64 {
        let tag = self.next_tag;
        self.next_tag += 1;
        let mut message = message;
        message.mark_queued(now_ms);
        if watch {
            self.watched.insert(tag);
        }
        self.pending.push(Pending { tag, message });
        tag
    }

    fn apply_completions(&mut self) {
        let Some(sender) = self.sender.as_mut() else {
            return;
        };
        sender.pump();
        for completion in sender.take_completions() {
            if let Some(entry) = self.pending.iter_mut().find(|p| p.tag == completion.tag) {
                if let SendResult::Error(reason) = &completion.result {
                    debug!(tag = completion.tag, reason = %reason, "message send failed");
                }
                entry.message.on_message_sent(completion.result);
            }
        }
    }

    /// Fails queued messages older than the message timeout.
    fn expire_stale(&mut self, now_ms: u64) {
        if self.msg_timeout_ms == 0 {
            return;
        }
        for entry in self.pending.iter_mut() {
            if entry.message.state() == MessageState::WaitingToBeSent
                && now_ms.saturating_sub(entry.message.idle_time()) >= self.msg_timeout_ms
            {
                debug!(tag = entry.tag, "message expired before it could be sent");
                entry.message.on_message_sent(SendResult::Timeout);
            }
        }
    }

    /// Removes finished messages, keeping those a caller is waiting on.
    fn prune(&mut self) {
        let mut kept = Vec::with_capacity(self.pending.len());
        for entry in self.pending.drain(..) {
            if !entry.message.state().is_done() {
                kept.push(entry);
            } else if self.watched.contains(&entry.tag) {
                self.finished.insert(entry.tag, entry.message);
            }
        }
        self.pending = kept;
    }

    /// Fails everything still pending with `Cancelled`.
    fn cancel_pending(&mut self) {
        for entry in self.pending.iter_mut() {
            entry.message.on_message_sent(SendResult::Cancelled);
        }
        self.prune();
    }

    fn is_finished(&self, tag: u64) -> bool {
        self.finished.contains_key(&tag)
    }

    fn take_finished(&mut self, tags: &[u64]) -> Vec<Message> {
        tags.iter()
            .filter_map(|tag| {
                self.watched.remove(tag);
                self.finished.remove(tag)
            })
            .collect()
    }

    fn reset(&mut self) {
        if let Some(mut sender) = self.sender.take() {
            sender.destroy();
        }
        self.pending.clear();
        self.watched.clear();
        self.finished.clear();
    }
}

impl ClientRole for SendRole {
    fn client_ready(&mut self, core: &mut ClientCore) -> Result<bool> {
        let Some(sender) = self.sender.as_mut() else {
            let session = core
                .session()
                .ok_or_else(|| AmqpError::InvalidArgument("session not yet open".to_string()))?;
            let mut sender = MessageSender::new(session, core.name(), self.target.as_str(), None, &core.config().send);
            sender.open()?;
            self.sender = Some(sender);
            return Ok(false);
        };
        sender.pump();
        match sender.state() {
            LinkState::Open => Ok(true),
            LinkState::Error | LinkState::Closed => Err(AmqpError::Connection {
                reason: format!(
                    "sender link {} is in an error state ({}); confirm credentials and access permissions",
                    sender.name(),
                    sender.error().unwrap_or("detached")
                ),
            }),
            _ => Ok(false),
        }
    }

    fn client_run(&mut self, core: &mut ClientCore) -> Result<WorkStatus> {
        self.apply_completions();
        self.prune();

        let now = core.counter().current_ms();
        if let Some(sender) = self.sender.as_mut() {
            for entry in self.pending.iter_mut() {
                if entry.message.state() != MessageState::WaitingToBeSent {
                    continue;
                }
                let age = now.saturating_sub(entry.message.idle_time());
                if self.msg_timeout_ms > 0 && age >= self.msg_timeout_ms {
                    debug!(tag = entry.tag, age_ms = age, "message timed out before send");
                    entry.message.on_message_sent(SendResult::Timeout);
                    continue;
                }
                entry.message.mark_in_flight();
                let remaining = if self.msg_timeout_ms > 0 {
                    Duration::from_millis(self.msg_timeout_ms - age)
                } else {
                    Duration::ZERO
                };
                sender.send_async(entry.tag, entry.message.clone(), remaining);
            }
            sender.pump();
        }
        Ok(core.tick())
    }
}

/// Client that sends messages to one target.
pub struct SendClient {
    core: ClientCore,
    role: SendRole,
}

impl SendClient {
    pub fn new(target: Target, factory: Arc<dyn EngineFactory>, options: ClientOptions) -> Self {
        let msg_timeout_ms = options.config.send.msg_timeout_ms;
        let remote: Address = target.address().clone();
        Self {
            core: ClientCore::new(remote, factory, options),
            role: SendRole {
                target,
                sender: None,
                pending: Vec::new(),
                watched: HashSet::new(),
                finished: HashMap::new(),
                next_tag: 0,
                msg_timeout_ms,
            },
        }
    }

    /// Opens the client on a new connection, or on a shared `connection`.
    pub fn open(&mut self, connection: Option<Connection>) -> Result<()> {
        self.core.open(connection)
    }

    /// Destroys the sender link and discards every pending message, then
    /// releases the session and connection this client owns.
    pub fn close(&mut self) {
        self.role.reset();
        self.core.close();
    }

    pub fn target(&self) -> &Target {
        &self.role.target
    }

    pub fn connection(&self) -> Option<&Connection> {
        self.core.connection()
    }

    pub fn is_open(&self) -> bool {
        self.core.is_open()
    }

    /// Sender link state, if the link has been created.
    pub fn link_state(&self) -> Option<LinkState> {
        self.role.sender.as_ref().map(MessageSender::state)
    }

    /// Queues messages to be sent by later `do_work` calls.
    pub fn queue_message<M: Gather>(&mut self, messages: M) {
        let now = self.core.counter().current_ms();
        for message in messages.gather() {
            self.role.queue(message, now, false);
        }
    }

    /// Returns true while any queued message has not finished.
    pub fn messages_pending(&self) -> bool {
        !self.role.pending.is_empty()
    }

    /// Number of queued messages that have not finished.
    pub fn pending_count(&self) -> usize {
        self.role.pending.len()
    }

    /// Runs one client iteration.
    pub fn do_work(&mut self) -> Result<WorkStatus> {
        let now = self.core.counter().current_ms();
        self.role.apply_completions();
        self.role.expire_stale(now);
        self.role.prune();
        self.core.do_work_with(&mut self.role)
    }

    /// Runs `do_work` until nothing is pending. Returns false if the client stopped first.
    pub fn wait(&mut self) -> Result<bool> {
        while self.messages_pending() {
            if self.do_work()? == WorkStatus::Stop {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Sends `messages` and blocks until each has finished.
    ///
    /// Fails with `MessageSendFailed` if any of them did not complete. Messages
    /// still pending when the connection stops are cancelled and count as
    /// failed. The client is closed afterwards when `close_on_done` is set or
    /// when it stopped.
    pub fn send_message<M: Gather>(&mut self, messages: M, close_on_done: bool) -> Result<()> {
        let tags = self.queue_batch(messages);
        let outcome = self.drive(&tags);
        self.finish_send_message(&tags, outcome, close_on_done)
    }

    /// Sends everything queued and returns each message's final state, in
    /// queue order. Individual failures are reported in the states only.
    pub fn send_all_messages(&mut self, close_on_done: bool) -> Result<Vec<MessageState>> {
        let tags = self.watch_all();
        let outcome = self.drive(&tags);
        self.finish_send_all(&tags, outcome, close_on_done)
    }

    fn drive(&mut self, tags: &[u64]) -> Result<BatchStep> {
        loop {
            match self.batch_step(tags)? {
                BatchStep::Pending => {}
                done => return Ok(done),
            }
        }
    }

    /// Queues `messages` and watches them for `batch_step`.
    pub(crate) fn queue_batch<M: Gather>(&mut self, messages: M) -> Vec<u64> {
        let now = self.core.counter().current_ms();
        messages
            .gather()
            .into_iter()
            .map(|message| self.role.queue(message, now, true))
            .collect()
    }

    /// Watches everything currently queued.
    pub(crate) fn watch_all(&mut self) -> Vec<u64> {
        let tags: Vec<u64> = self.role.pending.iter().map(|p| p.tag).collect();
        self.role.watched.extend(tags.iter().copied());
        tags
    }

    /// One iteration towards finishing `tags`, opening the client first if needed.
    pub(crate) fn batch_step(&mut self, tags: &[u64]) -> Result<BatchStep> {
        self.core.open(None)?;
        if tags.iter().all(|tag| self.role.is_finished(*tag)) {
            return Ok(BatchStep::Done);
        }
        match self.do_work()? {
            WorkStatus::Continue => Ok(BatchStep::Pending),
            WorkStatus::Stop => {
                debug!("client stopped with messages pending, cancelling them");
                self.role.apply_completions();
                self.role.cancel_pending();
                Ok(BatchStep::Stopped)
            }
        }
    }

    pub(crate) fn finish_send_message(
        &mut self,
        tags: &[u64],
        outcome: Result<BatchStep>,
        close_on_done: bool,
    ) -> Result<()> {
        let messages = self.finish_batch(tags, outcome, close_on_done)?;
        let failed = messages.iter().filter(|m| m.state() == MessageState::Failed).count();
        if failed > 0 {
            warn!(failed, total = messages.len(), "message batch failed");
            return Err(AmqpError::MessageSendFailed {
                failed,
                total: messages.len(),
            });
        }
        Ok(())
    }

    pub(crate) fn finish_send_all(
        &mut self,
        tags: &[u64],
        outcome: Result<BatchStep>,
        close_on_done: bool,
    ) -> Result<Vec<MessageState>> {
        let messages = self.finish_batch(tags, outcome, close_on_done)?;
        info!(total = messages.len(), "sent all queued messages");
        Ok(messages.iter().map(Message::state).collect())
    }

    fn finish_batch(&mut self, tags: &[u64], outcome: Result<BatchStep>, close_on_done: bool) -> Result<Vec<Message>> {
        let messages = self.role.take_finished(tags);
        let stopped = !matches!(outcome, Ok(BatchStep::Done));
        if close_on_done || stopped {
            self.close();
        }
        outcome?;
        Ok(messages)
    }
}

/// Progress of a blocking send call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BatchStep {
    Pending,
    Done,
    Stopped,
}

impl Drop for SendClient {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for SendClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendClient")
            .field("name", &self.core.name())
            .field("target", &self.role.target.as_str())
            .field("pending", &self.role.pending.len())
            .field("open", &self.core.is_open())
            .finish()
    }
}
