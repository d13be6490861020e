//! One-shot promises dispatched onto a bound executor.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Error;
use crate::executor::Executor;

type ResolveHandler<T> = Box<dyn FnOnce(T) + Send>;
type RejectHandler = Box<dyn FnOnce(Error) + Send>;

/// One-shot completion object: settled exactly once with a value or an
/// [`Error`], after which the matching callback is posted onto the
/// executor the promise was bound to at creation.
///
/// Clones are handles to the same promise; the first settlement wins
/// and later attempts are silently dropped. Dropping the last handle to
/// a still-pending promise rejects it with [`Error::OperationAborted`].
///
/// Cross-strand handoff is done by chaining: an inner promise bound to
/// the producer's strand forwards to a user promise bound to the
/// consumer's strand inside its `then` callbacks.
pub struct Promise<T> {
    inner: Arc<PromiseInner<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct PromiseInner<T> {
    state: Mutex<PromiseState<T>>,
}

struct PromiseState<T> {
    resolve: Option<ResolveHandler<T>>,
    reject: Option<RejectHandler>,
    /// Present while the promise is pending; taken on settlement.
    executor: Option<Executor>,
}

impl<T: Send + 'static> Promise<T> {
    /// Create a pending promise bound to `executor`.
    pub fn defer(executor: impl Into<Executor>) -> Self {
        Self {
            inner: Arc::new(PromiseInner {
                state: Mutex::new(PromiseState {
                    resolve: None,
                    reject: None,
                    executor: Some(executor.into()),
                }),
            }),
        }
    }

    /// Install the settlement callbacks. Must be called before the
    /// promise is settled; a settlement that finds no matching callback
    /// is dropped.
    pub fn then(
        &self,
        on_resolve: impl FnOnce(T) + Send + 'static,
        on_reject: impl FnOnce(Error) + Send + 'static,
    ) {
        let mut state = self.inner.state.lock();
        state.resolve = Some(Box::new(on_resolve));
        state.reject = Some(Box::new(on_reject));
    }

    /// Settle with a value. The resolve callback is posted on the bound
    /// executor; both callbacks and the binding are cleared.
    pub fn resolve(&self, value: T) {
        let mut state = self.inner.state.lock();
        if let Some(executor) = state.executor.take() {
            if let Some(callback) = state.resolve.take() {
                executor.post(move || callback(value));
            }
        }
        state.resolve = None;
        state.reject = None;
    }

    /// Settle with an error. The reject callback is posted on the bound
    /// executor; both callbacks and the binding are cleared.
    pub fn reject(&self, error: Error) {
        let mut state = self.inner.state.lock();
        if let Some(executor) = state.executor.take() {
            if let Some(callback) = state.reject.take() {
                executor.post(move || callback(error));
            }
        }
        state.resolve = None;
        state.reject = None;
    }

    /// Whether the promise has not been settled yet.
    pub fn is_pending(&self) -> bool {
        self.inner.state.lock().executor.is_some()
    }
}

impl<T> Drop for PromiseInner<T> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let Some(executor) = state.executor.take() {
            if let Some(callback) = state.reject.take() {
                executor.post(move || callback(Error::OperationAborted));
            }
        }
    }
}
