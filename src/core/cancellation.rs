//! Operation tracking and cancellation
//!
//! Every service operation is registered here before it touches a device.
//! The caller gets an [`Operation`] handle; the task doing the work gets the
//! matching [`Completer`]. The outcome is delivered exactly once, and a
//! cancel that lands before completion replaces the result with
//! [`Outcome::Cancelled`].

use super::error::NotchError;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Unique id of a service operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OperationId(u64);

impl OperationId {
    /// Raw id value
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

/// Service operation kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Scan,
    ScanForNew,
    Init,
    UncheckedInit,
    Color,
    Erase,
    ConfigureSteady,
    ConfigureCapture,
    ConfigureTimedCapture,
    Steady,
    Capture,
    TimedCapture,
    Stop,
    Download,
    GetSteadyData,
    Disconnect,
    ShutDown,
}

impl OperationKind {
    /// Check if the operation moves the session through a lifecycle transition
    ///
    /// A cancelled lifecycle operation leaves devices in an unknown state.
    pub fn is_lifecycle(&self) -> bool {
        !matches!(
            self,
            Self::Scan
                | Self::ScanForNew
                | Self::Color
                | Self::Erase
                | Self::Download
                | Self::GetSteadyData
        )
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Scan => "scan",
            Self::ScanForNew => "scan-for-new",
            Self::Init => "init",
            Self::UncheckedInit => "unchecked-init",
            Self::Color => "color",
            Self::Erase => "erase",
            Self::ConfigureSteady => "configure-steady",
            Self::ConfigureCapture => "configure-capture",
            Self::ConfigureTimedCapture => "configure-timed-capture",
            Self::Steady => "steady",
            Self::Capture => "capture",
            Self::TimedCapture => "timed-capture",
            Self::Stop => "stop",
            Self::Download => "download",
            Self::GetSteadyData => "get-steady-data",
            Self::Disconnect => "disconnect",
            Self::ShutDown => "shut-down",
        };
        f.write_str(name)
    }
}

/// Terminal result of an operation
#[derive(Debug, Clone)]
pub enum Outcome<T> {
    /// Operation completed
    Success(T),
    /// Operation failed
    Failure(NotchError),
    /// Operation was cancelled
    Cancelled,
}

impl<T> Outcome<T> {
    /// Wrap a result, mapping [`NotchError::Cancelled`] to [`Outcome::Cancelled`]
    pub fn from_result(result: Result<T, NotchError>) -> Self {
        match result {
            Ok(value) => Self::Success(value),
            Err(NotchError::Cancelled) => Self::Cancelled,
            Err(err) => Self::Failure(err),
        }
    }

    /// Convert into a `Result`
    pub fn into_result(self) -> Result<T, NotchError> {
        match self {
            Self::Success(value) => Ok(value),
            Self::Failure(err) => Err(err),
            Self::Cancelled => Err(NotchError::Cancelled),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Check if the operation was rejected because another one was running
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Failure(NotchError::OperationInProgress { .. }))
    }

    /// Error, if the operation failed
    pub fn error(&self) -> Option<&NotchError> {
        match self {
            Self::Failure(err) => Some(err),
            _ => None,
        }
    }

    /// Map the success value
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Self::Success(value) => Outcome::Success(f(value)),
            Self::Failure(err) => Outcome::Failure(err),
            Self::Cancelled => Outcome::Cancelled,
        }
    }
}

/// Snapshot of an outstanding operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOperation {
    pub id: OperationId,
    pub kind: OperationKind,
    pub issued_at: DateTime<Utc>,
    /// Cancel was requested but the operation has not finished yet
    pub cancelled: bool,
}

struct Entry {
    kind: OperationKind,
    issued_at: DateTime<Utc>,
    token: CancellationToken,
    cancelled: bool,
}

#[derive(Default)]
struct RegistryInner {
    next_id: u64,
    entries: BTreeMap<OperationId, Entry>,
}

/// Registry of outstanding operations
#[derive(Clone, Default)]
pub struct CancellationRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl CancellationRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new operation
    pub fn register<T>(&self, kind: OperationKind) -> (Operation<T>, Completer<T>) {
        let token = CancellationToken::new();
        let id = {
            let mut inner = self.inner.lock();
            inner.next_id += 1;
            let id = OperationId(inner.next_id);
            inner.entries.insert(
                id,
                Entry {
                    kind,
                    issued_at: Utc::now(),
                    token: token.clone(),
                    cancelled: false,
                },
            );
            id
        };
        debug!("registered {} ({})", id, kind);

        let (tx, rx) = oneshot::channel();
        let operation = Operation {
            id,
            kind,
            registry: self.clone(),
            rx,
        };
        let completer = Completer {
            id,
            kind,
            token,
            registry: self.clone(),
            tx: Some(tx),
            settled: None,
        };
        (operation, completer)
    }

    /// Request cancellation
    ///
    /// Returns `true` if this call moved a pending operation to cancelled.
    /// Cancelling a finished, unknown or already cancelled operation is a
    /// no-op.
    pub fn cancel(&self, id: OperationId) -> bool {
        let mut inner = self.inner.lock();
        match inner.entries.get_mut(&id) {
            Some(entry) if !entry.cancelled => {
                entry.cancelled = true;
                entry.token.cancel();
                debug!("cancel requested for {} ({})", id, entry.kind);
                true
            }
            _ => false,
        }
    }

    /// Remove an operation, reporting whether it was cancelled
    ///
    /// Returns `None` if the operation is unknown or already finished.
    pub fn finish(&self, id: OperationId) -> Option<bool> {
        self.inner.lock().entries.remove(&id).map(|entry| entry.cancelled)
    }

    /// Check if an operation is still outstanding
    pub fn is_pending(&self, id: OperationId) -> bool {
        self.inner.lock().entries.contains_key(&id)
    }

    /// Outstanding operations, oldest first
    pub fn pending(&self) -> Vec<PendingOperation> {
        self.inner
            .lock()
            .entries
            .iter()
            .map(|(id, entry)| PendingOperation {
                id: *id,
                kind: entry.kind,
                issued_at: entry.issued_at,
                cancelled: entry.cancelled,
            })
            .collect()
    }

    /// Number of outstanding operations
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Check if nothing is outstanding
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Cloneable cancel capability for an operation
#[derive(Clone)]
pub struct CancelHandle {
    id: OperationId,
    registry: CancellationRegistry,
}

impl CancelHandle {
    /// Operation id
    pub fn id(&self) -> OperationId {
        self.id
    }

    /// Request cancellation (idempotent)
    pub fn cancel(&self) -> bool {
        self.registry.cancel(self.id)
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle").field("id", &self.id).finish()
    }
}

/// Caller side of an operation
pub struct Operation<T> {
    id: OperationId,
    kind: OperationKind,
    registry: CancellationRegistry,
    rx: oneshot::Receiver<Outcome<T>>,
}

impl<T> Operation<T> {
    pub fn id(&self) -> OperationId {
        self.id
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Request cancellation (idempotent)
    pub fn cancel(&self) -> bool {
        self.registry.cancel(self.id)
    }

    /// Cancel capability that outlives `wait()`
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            id: self.id,
            registry: self.registry.clone(),
        }
    }

    /// Check if the operation has not finished yet
    pub fn is_pending(&self) -> bool {
        self.registry.is_pending(self.id)
    }

    /// Wait for the terminal outcome
    pub async fn wait(self) -> Outcome<T> {
        self.rx.await.unwrap_or(Outcome::Failure(NotchError::Abandoned))
    }

    /// Wait and convert into a `Result`
    pub async fn result(self) -> Result<T, NotchError> {
        self.wait().await.into_result()
    }
}

impl<T: Send + 'static> Operation<T> {
    /// Run `callback` with the outcome once the operation finishes
    pub fn on_complete<F>(self, callback: F) -> CancelHandle
    where
        F: FnOnce(Outcome<T>) + Send + 'static,
    {
        let handle = self.cancel_handle();
        tokio::spawn(async move {
            callback(self.wait().await);
        });
        handle
    }
}

impl<T> fmt::Debug for Operation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Worker side of an operation
pub struct Completer<T> {
    id: OperationId,
    kind: OperationKind,
    token: CancellationToken,
    registry: CancellationRegistry,
    tx: Option<oneshot::Sender<Outcome<T>>>,
    settled: Option<bool>,
}

impl<T> Completer<T> {
    pub fn id(&self) -> OperationId {
        self.id
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Token fired when cancellation is requested
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Close the operation to further cancels
    ///
    /// Returns whether a cancel was requested before this point. Later
    /// cancels are no-ops, so the caller may commit state based on the
    /// answer without racing a cancel. Idempotent.
    pub fn settle(&mut self) -> bool {
        if let Some(cancelled) = self.settled {
            return cancelled;
        }
        let cancelled = self.registry.finish(self.id).unwrap_or(false);
        self.settled = Some(cancelled);
        cancelled
    }

    /// Deliver the outcome
    ///
    /// If cancellation was requested before settling, `Cancelled` is
    /// delivered instead.
    pub fn complete(mut self, outcome: Outcome<T>) {
        let outcome = if self.settle() { Outcome::Cancelled } else { outcome };
        debug!(
            "{} ({}) finished: {}",
            self.id,
            self.kind,
            match &outcome {
                Outcome::Success(_) => "success",
                Outcome::Failure(_) => "failure",
                Outcome::Cancelled => "cancelled",
            }
        );
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(outcome);
        }
    }

    /// Deliver a `Result`
    pub fn resolve(self, result: Result<T, NotchError>) {
        self.complete(Outcome::from_result(result));
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            self.registry.finish(self.id);
            let _ = tx.send(Outcome::Failure(NotchError::Abandoned));
        }
    }
}

/// Handle for a timed capture
///
/// Exposes the auto-stop deadline once the capture has started.
pub struct TimedOperation {
    operation: Operation<super::descriptor::Measurement>,
    deadline: Arc<Mutex<Option<Instant>>>,
}

impl TimedOperation {
    pub(crate) fn new(
        operation: Operation<super::descriptor::Measurement>,
        deadline: Arc<Mutex<Option<Instant>>>,
    ) -> Self {
        Self { operation, deadline }
    }

    pub fn id(&self) -> OperationId {
        self.operation.id()
    }

    /// Auto-stop instant, once every device has started
    pub fn deadline(&self) -> Option<Instant> {
        *self.deadline.lock()
    }

    /// Request cancellation (idempotent)
    pub fn cancel(&self) -> bool {
        self.operation.cancel()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.operation.cancel_handle()
    }

    /// Wait for the measurement
    pub async fn wait(self) -> Outcome<super::descriptor::Measurement> {
        self.operation.wait().await
    }

    /// Give up the deadline view
    pub fn into_operation(self) -> Operation<super::descriptor::Measurement> {
        self.operation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exactly_once_delivery() {
        let registry = CancellationRegistry::new();
        let (op, completer) = registry.register::<u32>(OperationKind::Color);
        assert!(op.is_pending());
        assert_eq!(registry.len(), 1);

        completer.complete(Outcome::Success(7));
        assert!(registry.is_empty());
        assert!(!op.cancel(), "cancel after completion is a no-op");

        match op.wait().await {
            Outcome::Success(v) => assert_eq!(v, 7),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_replaces_result() {
        let registry = CancellationRegistry::new();
        let (op, completer) = registry.register::<u32>(OperationKind::Erase);
        let token = completer.token();

        assert!(op.cancel());
        assert!(!op.cancel(), "second cancel is a no-op");
        assert!(token.is_cancelled());
        assert!(registry.pending()[0].cancelled);

        completer.complete(Outcome::Success(1));
        assert!(op.wait().await.is_cancelled());
    }

    #[tokio::test]
    async fn test_settle_closes_cancellation() {
        let registry = CancellationRegistry::new();
        let (op, mut completer) = registry.register::<()>(OperationKind::Init);
        let handle = op.cancel_handle();

        assert!(!completer.settle());
        assert!(!handle.cancel());
        assert!(!completer.token().is_cancelled());

        completer.complete(Outcome::Success(()));
        assert!(op.wait().await.is_success());
    }

    #[tokio::test]
    async fn test_dropped_completer_reports_abandoned() {
        let registry = CancellationRegistry::new();
        let (op, completer) = registry.register::<()>(OperationKind::Stop);
        drop(completer);

        assert!(registry.is_empty());
        assert!(matches!(op.wait().await, Outcome::Failure(NotchError::Abandoned)));
    }

    #[tokio::test]
    async fn test_on_complete_callback() {
        let registry = CancellationRegistry::new();
        let (op, completer) = registry.register::<&'static str>(OperationKind::Scan);
        let (tx, rx) = oneshot::channel();

        op.on_complete(move |outcome| {
            let _ = tx.send(outcome.into_result().ok());
        });
        completer.resolve(Ok("done"));

        assert_eq!(rx.await.unwrap(), Some("done"));
    }

    #[test]
    fn test_pending_is_ordered_by_id() {
        let registry = CancellationRegistry::new();
        let (a, _ca) = registry.register::<()>(OperationKind::Scan);
        let (b, _cb) = registry.register::<()>(OperationKind::Download);

        let pending = registry.pending();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, a.id());
        assert_eq!(pending[1].kind, OperationKind::Download);
        assert_eq!(b.id().to_string(), format!("op-{}", b.id().value()));
    }

    #[test]
    fn test_outcome_from_result() {
        assert!(Outcome::<()>::from_result(Err(NotchError::Cancelled)).is_cancelled());
        assert!(Outcome::<()>::from_result(Err(NotchError::EmptyDeviceSet)).is_failure());
        assert!(matches!(
            Outcome::Success(2).map(|v| v * 2).into_result(),
            Ok(4)
        ));
    }
}
