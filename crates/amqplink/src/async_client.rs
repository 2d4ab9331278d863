//! Async client wrappers.
//!
//! Each wrapper owns its sync client behind a mutex and drives it one
//! `do_work` step at a time on tokio's blocking pool, so ordering is the same
//! as the sync path and only one step per client is ever in flight.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, Stream};
use parking_lot::Mutex;
use tracing::debug;

use crate::address::{Address, Source, Target};
use crate::client::{AmqpClient, ClientOptions, WorkStatus};
use crate::connection::Connection;
use crate::engine::EngineFactory;
use crate::error::{AmqpError, Result};
use crate::message::{Gather, Message, MessageState};
use crate::mgmt::{MgmtOptions, MgmtResponse};
use crate::receive_client::{MessageCallback, ReceiveClient};
use crate::send_client::{BatchStep, SendClient};

async fn blocking<C, T, F>(client: &Arc<Mutex<C>>, f: F) -> Result<T>
where
    C: Send + 'static,
    T: Send + 'static,
    F: FnOnce(&mut C) -> T + Send + 'static,
{
    let client = Arc::clone(client);
    Ok(tokio::task::spawn_blocking(move || f(&mut client.lock())).await?)
}

/// Async counterpart of `AmqpClient`.
pub struct AsyncAmqpClient {
    inner: Arc<Mutex<AmqpClient>>,
}

impl AsyncAmqpClient {
    pub fn new(remote: Address, factory: Arc<dyn EngineFactory>, options: ClientOptions) -> Self {
        Self {
            inner: Arc::new(Mutex::new(AmqpClient::new(remote, factory, options))),
        }
    }

    pub async fn open(&self, connection: Option<Connection>) -> Result<()> {
        blocking(&self.inner, move |c| c.open(connection)).await?
    }

    pub async fn close(&self) -> Result<()> {
        blocking(&self.inner, |c| c.close()).await
    }

    pub async fn do_work(&self) -> Result<WorkStatus> {
        blocking(&self.inner, |c| c.do_work()).await?
    }

    pub fn connection(&self) -> Option<Connection> {
        self.inner.lock().connection().cloned()
    }

    /// Waits for token negotiation step by step, then runs the request.
    pub async fn mgmt_request(
        &self,
        message: Message,
        operation: &str,
        op_type: &str,
        options: &MgmtOptions,
    ) -> Result<MgmtResponse> {
        while !blocking(&self.inner, |c| c.core().mgmt_auth_step()).await?? {}
        let session = self
            .inner
            .lock()
            .session()
            .cloned()
            .ok_or_else(|| AmqpError::InvalidArgument("session not yet open".to_string()))?;
        session.mgmt_request_async(message, operation, op_type, options).await
    }
}

/// Async counterpart of `SendClient`.
pub struct AsyncSendClient {
    inner: Arc<Mutex<SendClient>>,
}

impl AsyncSendClient {
    pub fn new(target: Target, factory: Arc<dyn EngineFactory>, options: ClientOptions) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SendClient::new(target, factory, options))),
        }
    }

    pub async fn open(&self, connection: Option<Connection>) -> Result<()> {
        blocking(&self.inner, move |c| c.open(connection)).await?
    }

    pub async fn close(&self) -> Result<()> {
        blocking(&self.inner, |c| c.close()).await
    }

    pub async fn do_work(&self) -> Result<WorkStatus> {
        blocking(&self.inner, |c| c.do_work()).await?
    }

    pub fn queue_message<M: Gather>(&self, messages: M) {
        self.inner.lock().queue_message(messages);
    }

    pub fn messages_pending(&self) -> bool {
        self.inner.lock().messages_pending()
    }

    /// See `SendClient::send_message`.
    pub async fn send_message<M: Gather>(&self, messages: M, close_on_done: bool) -> Result<()> {
        let tags: Arc<[u64]> = self.inner.lock().queue_batch(messages).into();
        let outcome = self.drive(Arc::clone(&tags)).await;
        blocking(&self.inner, move |c| c.finish_send_message(&tags, outcome, close_on_done)).await?
    }

    /// See `SendClient::send_all_messages`.
    pub async fn send_all_messages(&self, close_on_done: bool) -> Result<Vec<MessageState>> {
        let tags: Arc<[u64]> = self.inner.lock().watch_all().into();
        let outcome = self.drive(Arc::clone(&tags)).await;
        blocking(&self.inner, move |c| c.finish_send_all(&tags, outcome, close_on_done)).await?
    }

    async fn drive(&self, tags: Arc<[u64]>) -> Result<BatchStep> {
        loop {
            let tags = Arc::clone(&tags);
            match blocking(&self.inner, move |c| c.batch_step(&tags)).await?? {
                BatchStep::Pending => {}
                done => return Ok(done),
            }
        }
    }
}

/// Async counterpart of `ReceiveClient`.
pub struct AsyncReceiveClient {
    inner: Arc<Mutex<ReceiveClient>>,
}

impl AsyncReceiveClient {
    pub fn new(source: Source, factory: Arc<dyn EngineFactory>, options: ClientOptions) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ReceiveClient::new(source, factory, options))),
        }
    }

    pub async fn open(&self, connection: Option<Connection>) -> Result<()> {
        blocking(&self.inner, move |c| c.open(connection)).await?
    }

    pub async fn close(&self) -> Result<()> {
        blocking(&self.inner, |c| c.close()).await
    }

    pub async fn do_work(&self) -> Result<WorkStatus> {
        blocking(&self.inner, |c| c.do_work()).await?
    }

    pub fn set_message_callback(&self, callback: Option<MessageCallback>) {
        self.inner.lock().set_message_callback(callback);
    }

    /// See `ReceiveClient::receive_message_batch`.
    pub async fn receive_message_batch(
        &self,
        max_batch_size: Option<usize>,
        callback: Option<MessageCallback>,
        timeout: Duration,
    ) -> Result<Vec<Message>> {
        let mut batch =
            blocking(&self.inner, move |c| c.begin_batch(max_batch_size, callback, timeout)).await??;
        loop {
            let (returned, done) = blocking(&self.inner, move |c| {
                let done = c.batch_step(&mut batch);
                (batch, done)
            })
            .await?;
            batch = returned;
            if done? {
                return Ok(batch.into_messages());
            }
        }
    }

    /// See `ReceiveClient::receive_messages`. The callback runs on the calling task.
    pub async fn receive_messages<F: FnMut(Message)>(&self, mut on_message: F) -> Result<()> {
        let result = self.receive_loop(&mut on_message).await;
        self.close().await?;
        result
    }

    async fn receive_loop<F: FnMut(Message)>(&self, on_message: &mut F) -> Result<()> {
        blocking(&self.inner, |c| c.open(None)).await??;
        loop {
            let (status, messages) = blocking(&self.inner, |c| {
                let status = c.do_work();
                (status, c.take_queued())
            })
            .await?;
            for message in messages {
                on_message(message);
            }
            if status? == WorkStatus::Stop {
                return Ok(());
            }
        }
    }

    /// Stream of received messages, ending when the client stops. The client
    /// is closed when the stream ends or fails.
    pub fn messages(&self) -> impl Stream<Item = Result<Message>> + Send + 'static {
        let inner = Arc::clone(&self.inner);
        stream::unfold(Some(inner), |state| async move {
            let inner = state?;
            match blocking(&inner, |c| c.next_message()).await {
                Ok(Ok(Some(message))) => Some((Ok(message), Some(inner))),
                Ok(Ok(None)) => {
                    debug!("message stream finished");
                    let _ = blocking(&inner, |c| c.close()).await;
                    None
                }
                Ok(Err(e)) | Err(e) => {
                    let _ = blocking(&inner, |c| c.close()).await;
                    Some((Err(e), None))
                }
            }
        })
    }
}
