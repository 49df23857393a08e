use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use marlinsql_common::error::{Error, Result};
use marlinsql_common::metadata::MetadataCache;

use crate::options::PlanOptions;
use crate::remote::RemoteStore;
use crate::session::SessionHandle;

/// Everything an operator needs while executing: remote access, the schema
/// cache, the batch session, caller options, the cancellation signal and the
/// informational message sink. Cheap to clone; cloned into every operator
/// stream.
#[derive(Clone)]
pub struct ExecutionContext {
    pub remote: Arc<dyn RemoteStore>,
    pub metadata: Arc<MetadataCache>,
    pub session: SessionHandle,
    pub options: Arc<PlanOptions>,
    pub cancel: CancellationToken,
    messages: Arc<Mutex<Vec<String>>>,
}

impl ExecutionContext {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        metadata: Arc<MetadataCache>,
        session: SessionHandle,
        options: Arc<PlanOptions>,
    ) -> Self {
        Self {
            remote,
            metadata,
            session,
            options,
            cancel: CancellationToken::new(),
            messages: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// The cancellation check every operator runs between rows.
    pub fn ensure_active(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// A context whose cancellation is additionally controlled by the caller;
    /// used by `ParallelPartition` to stop in-flight siblings on first error.
    pub fn with_child_cancel(&self) -> (Self, CancellationToken) {
        let token = self.cancel.child_token();
        let mut child = self.clone();
        child.cancel = token.clone();
        (child, token)
    }

    /// Effective fan-out bound: caller option when set, the pool otherwise.
    pub fn pool_capacity(&self) -> usize {
        if self.options.pool_capacity > 0 {
            self.options.pool_capacity
        } else {
            self.remote.pool_capacity().max(1)
        }
    }

    /// Record an informational message (PRINT output, DML row failures).
    pub fn info(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!(target: "marlinsql::exec", "{}", message);
        self.messages.lock().push(message);
    }

    /// Drain messages accumulated since the last call.
    pub fn take_messages(&self) -> Vec<String> {
        std::mem::take(&mut *self.messages.lock())
    }
}
