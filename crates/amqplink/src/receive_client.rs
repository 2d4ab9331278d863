//! Receiving client.
//!
//! Deliveries from the receiver link pass through an optional transform
//! callback into a client-side queue. Three consumption modes read that queue:
//! batch (`receive_message_batch`), callback (`receive_messages`) and pull
//! (`receive_messages_iter`).

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::address::{Address, Source};
use crate::client::{ClientCore, ClientOptions, ClientRole, WorkStatus};
use crate::connection::Connection;
use crate::deadline::DeadlineContext;
use crate::engine::EngineFactory;
use crate::error::{AmqpError, Result};
use crate::link::LinkState;
use crate::message::Message;
use crate::receiver::MessageReceiver;

/// Called for every delivered message before it is queued. Returning a
/// message queues it in place of the delivery; `None` queues the delivery
/// unchanged.
pub type MessageCallback = Box<dyn FnMut(&Message) -> Option<Message> + Send>;

struct ReceiveRole {
    source: Source,
    receiver: Option<MessageReceiver>,
    queue: VecDeque<Message>,
    callback: Option<MessageCallback>,
    timeout_ms: u64,
    last_activity: Option<u64>,
    was_message_received: bool,
}

impl ReceiveRole {
    /// Pumps the receiver, running each delivery through the callback into the queue.
    fn pump(&mut self) {
        let Self {
            receiver,
            queue,
            callback,
            was_message_received,
            ..
        } = self;
        let Some(receiver) = receiver.as_mut() else {
            return;
        };
        receiver.pump_with(|message| {
            *was_message_received = true;
            let message = match callback.as_mut().and_then(|callback| callback(&message)) {
                Some(replacement) => replacement,
                None => message,
            };
            queue.push_back(message);
        });
    }

    fn reset(&mut self) {
        if let Some(mut receiver) = self.receiver.take() {
            receiver.destroy();
        }
        self.queue.clear();
        self.last_activity = None;
        self.was_message_received = false;
    }
}

impl ClientRole for ReceiveRole {
    fn client_ready(&mut self, core: &mut ClientCore) -> Result<bool> {
        if self.receiver.is_none() {
            let session = core
                .session()
                .ok_or_else(|| AmqpError::InvalidArgument("session not yet open".to_string()))?;
            let mut receiver =
                MessageReceiver::new(session, self.source.as_str(), core.name(), None, &core.config().receive);
            receiver.open()?;
            self.receiver = Some(receiver);
            return Ok(false);
        }
        self.pump();
        let Some(receiver) = self.receiver.as_ref() else {
            return Ok(false);
        };
        match receiver.state() {
            LinkState::Open => Ok(true),
            LinkState::Error | LinkState::Closed => Err(AmqpError::Connection {
                reason: format!(
                    "receiver link {} is in an error state ({}); confirm credentials and access permissions",
                    receiver.name(),
                    receiver.error().unwrap_or("detached")
                ),
            }),
            _ => {
                self.last_activity = Some(core.counter().current_ms());
                Ok(false)
            }
        }
    }

    fn client_run(&mut self, core: &mut ClientCore) -> Result<WorkStatus> {
        let status = core.tick();
        self.pump();

        let now = core.counter().current_ms();
        match self.last_activity {
            Some(last) if !self.was_message_received => {
                if self.timeout_ms > 0 && now.saturating_sub(last) >= self.timeout_ms {
                    info!(timeout_ms = self.timeout_ms, "receive timeout reached, closing receiver");
                    core.shutdown = true;
                }
            }
            _ => self.last_activity = Some(now),
        }
        self.was_message_received = false;
        Ok(status)
    }
}

/// Client that receives messages from one source.
pub struct ReceiveClient {
    core: ClientCore,
    role: ReceiveRole,
    prefetch: u32,
}

impl ReceiveClient {
    pub fn new(source: Source, factory: Arc<dyn EngineFactory>, options: ClientOptions) -> Self {
        let timeout_ms = options.config.receive.timeout_ms;
        let prefetch = options.config.receive.prefetch.max(1);
        let remote: Address = source.address().clone();
        Self {
            core: ClientCore::new(remote, factory, options),
            role: ReceiveRole {
                source,
                receiver: None,
                queue: VecDeque::new(),
                callback: None,
                timeout_ms,
                last_activity: None,
                was_message_received: false,
            },
            prefetch,
        }
    }

    /// Opens the client on a new connection, or on a shared `connection`.
    pub fn open(&mut self, connection: Option<Connection>) -> Result<()> {
        self.core.open(connection)
    }

    /// Destroys the receiver link and drops every queued message, then releases
    /// the session and connection this client owns.
    pub fn close(&mut self) {
        self.role.reset();
        self.core.close();
    }

    pub fn source(&self) -> &Source {
        &self.role.source
    }

    pub fn prefetch(&self) -> u32 {
        self.prefetch
    }

    pub fn connection(&self) -> Option<&Connection> {
        self.core.connection()
    }

    pub fn is_open(&self) -> bool {
        self.core.is_open()
    }

    /// Receiver link state, if the link has been created.
    pub fn link_state(&self) -> Option<LinkState> {
        self.role.receiver.as_ref().map(MessageReceiver::state)
    }

    /// Messages received but not yet handed out.
    pub fn queued(&self) -> usize {
        self.role.queue.len()
    }

    /// Replaces the transform callback applied to every delivery.
    pub fn set_message_callback(&mut self, callback: Option<MessageCallback>) {
        self.role.callback = callback;
    }

    /// Runs one client iteration.
    pub fn do_work(&mut self) -> Result<WorkStatus> {
        self.core.do_work_with(&mut self.role)
    }

    /// Receives up to `max_batch_size` messages (default: the prefetch).
    ///
    /// Returns early with what has arrived once an iteration brings nothing
    /// new, once `timeout` passes (zero waits indefinitely) or once the client
    /// stops. `callback` replaces the transform callback when given. Fails
    /// without touching the connection if `max_batch_size` exceeds the prefetch.
    pub fn receive_message_batch(
        &mut self,
        max_batch_size: Option<usize>,
        callback: Option<MessageCallback>,
        timeout: Duration,
    ) -> Result<Vec<Message>> {
        let mut batch = self.begin_batch(max_batch_size, callback, timeout)?;
        while !self.batch_step(&mut batch)? {}
        Ok(batch.into_messages())
    }

    /// Validates and starts a batch receive driven by `batch_step`.
    pub(crate) fn begin_batch(
        &mut self,
        max_batch_size: Option<usize>,
        callback: Option<MessageCallback>,
        timeout: Duration,
    ) -> Result<BatchReceive> {
        let max = max_batch_size.unwrap_or(self.prefetch as usize);
        if max > self.prefetch as usize {
            return Err(AmqpError::InvalidArgument(format!(
                "max_batch_size ({}) must be less than or equal to the prefetch ({})",
                max, self.prefetch
            )));
        }
        if max == 0 {
            return Err(AmqpError::InvalidArgument("max_batch_size must be at least 1".to_string()));
        }
        if callback.is_some() {
            self.role.callback = callback;
        }
        let deadline = DeadlineContext::from_timeout(self.core.counter(), timeout);
        self.core.open(None)?;
        Ok(BatchReceive {
            max,
            deadline,
            batch: Vec::with_capacity(max),
            receiving: true,
        })
    }

    /// One iteration of a batch receive. Returns true once the batch is done.
    pub(crate) fn batch_step(&mut self, batch: &mut BatchReceive) -> Result<bool> {
        batch.drain(&mut self.role.queue);
        if batch.is_full() || !batch.receiving {
            return Ok(true);
        }
        if batch.deadline.is_expired() {
            debug!(received = batch.batch.len(), "batch receive deadline reached");
            return Ok(true);
        }

        let before = self.role.queue.len();
        if self.do_work()? == WorkStatus::Stop {
            batch.receiving = false;
        }
        let received = self.role.queue.len().saturating_sub(before);
        batch.drain(&mut self.role.queue);

        if received == 0 && !batch.batch.is_empty() {
            debug!(received = batch.batch.len(), "no new messages, returning partial batch");
            return Ok(true);
        }
        Ok(batch.is_full() || !batch.receiving)
    }

    /// Hands every message to `on_message` until the client stops, then closes it.
    ///
    /// Messages pass through the transform callback first, if one is set.
    pub fn receive_messages<F: FnMut(Message)>(&mut self, mut on_message: F) -> Result<()> {
        if let Err(e) = self.core.open(None) {
            self.close();
            return Err(e);
        }
        loop {
            let status = match self.do_work() {
                Ok(status) => status,
                Err(e) => {
                    self.close();
                    return Err(e);
                }
            };
            while let Some(message) = self.role.queue.pop_front() {
                on_message(message);
            }
            if status == WorkStatus::Stop {
                break;
            }
        }
        self.close();
        Ok(())
    }

    pub(crate) fn take_queued(&mut self) -> Vec<Message> {
        self.role.queue.drain(..).collect()
    }

    /// Pulls the next message, driving the client until one arrives.
    ///
    /// Returns `None` once the client has stopped and the queue is empty.
    pub fn next_message(&mut self) -> Result<Option<Message>> {
        self.core.open(None)?;
        loop {
            if let Some(message) = self.role.queue.pop_front() {
                return Ok(Some(message));
            }
            if self.do_work()? == WorkStatus::Stop {
                return Ok(self.role.queue.pop_front());
            }
        }
    }

    /// Returns an iterator over received messages.
    ///
    /// The client is closed when the iterator ends, fails or is dropped.
    /// `callback` replaces the transform callback when given.
    pub fn receive_messages_iter(&mut self, callback: Option<MessageCallback>) -> MessageIter<'_> {
        if callback.is_some() {
            self.role.callback = callback;
        }
        MessageIter {
            client: self,
            done: false,
        }
    }
}

impl Drop for ReceiveClient {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for ReceiveClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceiveClient")
            .field("name", &self.core.name())
            .field("source", &self.role.source.as_str())
            .field("prefetch", &self.prefetch)
            .field("queued", &self.role.queue.len())
            .field("open", &self.core.is_open())
            .finish()
    }
}

/// State of an in-progress batch receive.
pub(crate) struct BatchReceive {
    max: usize,
    deadline: DeadlineContext,
    batch: Vec<Message>,
    receiving: bool,
}

impl BatchReceive {
    fn drain(&mut self, queue: &mut VecDeque<Message>) {
        while self.batch.len() < self.max {
            match queue.pop_front() {
                Some(message) => self.batch.push(message),
                None => break,
            }
        }
    }

    fn is_full(&self) -> bool {
        self.batch.len() >= self.max
    }

    pub(crate) fn into_messages(self) -> Vec<Message> {
        self.batch
    }
}

/// Pull-mode receive. Yields messages until the client stops.
pub struct MessageIter<'a> {
    client: &'a mut ReceiveClient,
    done: bool,
}

impl Iterator for MessageIter<'_> {
    type Item = Result<Message>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.client.next_message() {
            Ok(Some(message)) => Some(Ok(message)),
            Ok(None) => {
                self.done = true;
                self.client.close();
                None
            }
            Err(e) => {
                self.done = true;
                self.client.close();
                Some(Err(e))
            }
        }
    }
}

impl Drop for MessageIter<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.client.close();
        }
    }
}
