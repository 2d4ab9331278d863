//! Receiver link.

use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::ReceiveConfig;
use crate::engine::{AttachParams, DeliveryOutcome, ReceiverSettleMode, Role, SenderSettleMode};
use crate::error::Result;
use crate::link::{LinkCore, LinkEvent, LinkState};
use crate::message::Message;
use crate::session::Session;
use crate::value::PropertyMap;

/// Receiving half of a link with prefetch credit.
pub struct MessageReceiver {
    link: LinkCore,
    source: String,
    target: String,
    settle_mode: ReceiverSettleMode,
    prefetch: u32,
    outstanding: u32,
    properties: PropertyMap,
    received: u64,
}

impl MessageReceiver {
    /// Creates a receiver on `session`. The link is not attached until `open`.
    pub fn new(session: &Session, source: &str, target: &str, name: Option<String>, config: &ReceiveConfig) -> Self {
        let name = name.unwrap_or_else(|| format!("receiver-link-{}", Uuid::new_v4()));
        Self {
            link: LinkCore::new(session, name, Role::Receiver, config.max_message_size),
            source: source.to_string(),
            target: target.to_string(),
            settle_mode: config.receive_settle_mode,
            prefetch: config.prefetch.max(1),
            outstanding: 0,
            properties: config.link_properties.clone(),
            received: 0,
        }
    }

    /// Attaches the link, granting `prefetch` credit.
    pub fn open(&mut self) -> Result<()> {
        let params = AttachParams {
            name: self.link.name().to_string(),
            role: Role::Receiver,
            source: self.source.clone(),
            target: self.target.clone(),
            send_settle_mode: SenderSettleMode::Unsettled,
            receive_settle_mode: self.settle_mode,
            max_message_size: self.link.max_message_size(),
            initial_credit: Some(self.prefetch),
            properties: self.properties.clone(),
        };
        self.link.attach(&params)?;
        self.outstanding = self.prefetch;
        Ok(())
    }

    pub fn name(&self) -> &str {
        self.link.name()
    }

    pub fn state(&self) -> LinkState {
        self.link.state()
    }

    pub fn error(&self) -> Option<&str> {
        self.link.error()
    }

    pub fn prefetch(&self) -> u32 {
        self.prefetch
    }

    pub fn settle_mode(&self) -> ReceiverSettleMode {
        self.settle_mode
    }

    /// Total messages delivered to this receiver.
    pub fn received_count(&self) -> u64 {
        self.received
    }

    /// Applies routed events, handing each delivery to `on_message`.
    ///
    /// In PeekLock mode an unsettled delivery is accepted once `on_message`
    /// has taken it. Returns the number of messages delivered.
    pub fn pump_with<F: FnMut(Message)>(&mut self, mut on_message: F) -> usize {
        let mut delivered = 0;
        while let Some(event) = self.link.next_event() {
            match event {
                LinkEvent::Delivery { delivery_id, message, settled } => {
                    self.outstanding = self.outstanding.saturating_sub(1);
                    self.received += 1;
                    delivered += 1;
                    on_message(message);
                    if !settled && self.settle_mode == ReceiverSettleMode::PeekLock {
                        self.accept(delivery_id);
                    }
                }
                LinkEvent::Attached { .. } => {
                    debug!(link = %self.link.name(), prefetch = self.prefetch, "receiver attached")
                }
                _ => {}
            }
        }
        if self.link.state() == LinkState::Open {
            self.replenish();
        }
        delivered
    }

    /// `pump_with`, collecting the delivered messages.
    pub fn pump(&mut self) -> Vec<Message> {
        let mut messages = Vec::new();
        self.pump_with(|m| messages.push(m));
        messages
    }

    /// Detaches the link.
    pub fn destroy(&mut self) {
        self.link.detach();
    }

    fn accept(&mut self, delivery_id: u64) {
        let Some(handle) = self.link.handle() else {
            return;
        };
        if let Err(e) = self
            .link
            .session()
            .connection()
            .settle(handle, delivery_id, DeliveryOutcome::Accepted)
        {
            warn!(link = %self.link.name(), delivery_id, error = %e, "failed to accept delivery");
        }
    }

    /// Tops credit back up to `prefetch` once half of it is used.
    fn replenish(&mut self) {
        if self.outstanding > self.prefetch / 2 {
            return;
        }
        let Some(handle) = self.link.handle() else {
            return;
        };
        match self.link.session().connection().flow(handle, self.prefetch) {
            Ok(()) => self.outstanding = self.prefetch,
            Err(e) => debug!(link = %self.link.name(), error = %e, "credit top-up failed"),
        }
    }
}

impl std::fmt::Debug for MessageReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageReceiver")
            .field("name", &self.link.name())
            .field("state", &self.link.state())
            .field("prefetch", &self.prefetch)
            .field("outstanding", &self.outstanding)
            .finish()
    }
}
