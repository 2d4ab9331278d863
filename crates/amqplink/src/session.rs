//! Sessions multiplex links over a connection.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::debug;

use crate::config::SessionConfig;
use crate::connection::Connection;
use crate::engine::{AttachParams, LinkHandle, SessionHandle, SessionParams};
use crate::error::Result;
use crate::link::LinkEvent;
use crate::message::Message;
use crate::mgmt::{MgmtOperation, MgmtOptions, MgmtResponse};

struct SessionInner {
    connection: Connection,
    handle: SessionHandle,
    config: SessionConfig,
    links: Mutex<HashSet<LinkHandle>>,
    mgmt_ops: Mutex<HashMap<String, Arc<MgmtOperation>>>,
    destroyed: AtomicBool,
}

/// Shared handle to a session. Clones refer to the same session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Sends BEGIN on `connection`.
    pub fn begin(connection: &Connection, config: SessionConfig) -> Result<Self> {
        let params = SessionParams {
            incoming_window: config.incoming_window,
            outgoing_window: config.outgoing_window,
            handle_max: config.handle_max,
        };
        let handle = connection.begin_session(&params)?;
        debug!(session = handle.0, incoming = config.incoming_window, outgoing = config.outgoing_window, "session begun");
        Ok(Self {
            inner: Arc::new(SessionInner {
                connection: connection.clone(),
                handle,
                config,
                links: Mutex::new(HashSet::new()),
                mgmt_ops: Mutex::new(HashMap::new()),
                destroyed: AtomicBool::new(false),
            }),
        })
    }

    pub fn connection(&self) -> &Connection {
        &self.inner.connection
    }

    pub fn handle(&self) -> SessionHandle {
        self.inner.handle
    }

    pub fn incoming_window(&self) -> u32 {
        self.inner.config.incoming_window
    }

    pub fn outgoing_window(&self) -> u32 {
        self.inner.config.outgoing_window
    }

    pub fn handle_max(&self) -> Option<u32> {
        self.inner.config.handle_max
    }

    pub fn link_count(&self) -> usize {
        self.inner.links.lock().len()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }

    /// Runs a request/response operation against `options.node`.
    ///
    /// One operation link pair per node is opened on first use and reused.
    /// The cache is keyed by node alone: the status field names of the first
    /// request to a node stay in effect for later requests to it, whatever
    /// their `options` say. `options.timeout` is read on every call. Open a
    /// separate `MgmtOperation` to read a node with other field names.
    pub fn mgmt_request(
        &self,
        message: Message,
        operation: &str,
        op_type: &str,
        options: &MgmtOptions,
    ) -> Result<MgmtResponse> {
        let mgmt_op = self.mgmt_operation(options);
        mgmt_op.execute(operation, op_type, message, options.timeout())
    }

    /// `mgmt_request`, ticking the connection on the blocking pool.
    pub async fn mgmt_request_async(
        &self,
        message: Message,
        operation: &str,
        op_type: &str,
        options: &MgmtOptions,
    ) -> Result<MgmtResponse> {
        let mgmt_op = self.mgmt_operation(options);
        mgmt_op.execute_async(operation, op_type, message, options.timeout()).await
    }

    fn mgmt_operation(&self, options: &MgmtOptions) -> Arc<MgmtOperation> {
        let mut ops = self.inner.mgmt_ops.lock();
        ops.entry(options.node.clone())
            .or_insert_with(|| Arc::new(MgmtOperation::open(self, options.clone())))
            .clone()
    }

    /// Ends the session and its cached management operations. Further calls
    /// are no-ops.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        let ops: Vec<_> = self.inner.mgmt_ops.lock().drain().map(|(_, op)| op).collect();
        for op in ops {
            op.destroy();
        }
        if let Err(e) = self.inner.connection.end_session(self.inner.handle) {
            debug!(session = self.inner.handle.0, error = %e, "end session failed");
        }
        debug!(session = self.inner.handle.0, "session destroyed");
    }

    pub(crate) fn attach_link(&self, params: &AttachParams) -> Result<(LinkHandle, UnboundedReceiver<LinkEvent>)> {
        let (handle, events) = self.inner.connection.attach_link(self.inner.handle, params)?;
        self.inner.links.lock().insert(handle);
        Ok((handle, events))
    }

    pub(crate) fn detach_link(&self, link: LinkHandle) -> Result<()> {
        self.inner.links.lock().remove(&link);
        self.inner.connection.detach_link(link)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("handle", &self.inner.handle)
            .field("links", &self.link_count())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}
