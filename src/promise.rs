//! A cancellable deferred result.
//!
//! [`Promise`] is the handle every asynchronous operation in sptcli hands
//! back to its caller. The creator settles it exactly once, either with a
//! value ([`Promise::settle`]) or with an error ([`Promise::fail`]). The
//! receiver can attach handlers at any time, before or after settlement, or
//! simply `.wait().await` the outcome.
//!
//! Cancellation is orthogonal to settlement. [`Promise::cancel`] raises a
//! flag, fires the promise's [`CancellationToken`] and runs the cancellation
//! hook, but never settles the promise itself. Whoever created the promise
//! watches the token at its suspension points and fails the promise with a
//! canceled error. [`Promise::spawn`] wires that up for the common case.
//!
//! # Example
//!
//! ```rust,ignore
//! let promise = Promise::spawn(|cancel| async move {
//!     transport.perform_with_cancel(request, &cancel).await.map_err(Into::into)
//! });
//!
//! promise
//!     .on_success(|response| println!("{}", response.status))
//!     .on_failure(|e| eprintln!("{e}"));
//! ```

use std::{
    fmt,
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

type SuccessHandler<T> = Box<dyn FnOnce(T) + Send>;
type FailureHandler = Box<dyn FnOnce(Error) + Send>;
type CancelHook = Box<dyn FnOnce() + Send>;

pub struct Promise<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    settled: Notify,
    cancel: CancellationToken,
}

struct State<T> {
    outcome: Option<Result<T>>,
    canceled: bool,
    on_success: Option<SuccessHandler<T>>,
    on_failure: Option<FailureHandler>,
    on_cancel: Option<CancelHook>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("Promise")
            .field("settled", &state.outcome.is_some())
            .field("canceled", &state.canceled)
            .finish()
    }
}

impl<T> Default for Promise<T>
where
    T: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Promise<T>
where
    T: Clone + Send + 'static,
{
    /// Creates an unsettled promise. Nothing runs until the creator does so.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    outcome: None,
                    canceled: false,
                    on_success: None,
                    on_failure: None,
                    on_cancel: None,
                }),
                settled: Notify::new(),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Runs `work` on the tokio runtime and settles the promise with its
    /// result.
    ///
    /// `work` receives the promise's cancellation token so it can race its
    /// own suspension points against it. Independently of that, the driver
    /// stops polling `work` as soon as the token fires and fails the promise
    /// with [`Error::canceled`].
    pub fn spawn<F, Fut>(work: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let promise = Self::new();
        let token = promise.cancellation_token();
        let future = work(token.clone());
        let driver = promise.clone();

        tokio::spawn(async move {
            let outcome = tokio::select! {
                biased;
                () = token.cancelled() => Err(Error::canceled()),
                outcome = future => outcome,
            };
            driver.complete(outcome);
        });

        promise
    }

    /// Resolves the promise with `value`.
    ///
    /// Returns `false` if the promise had already been settled, in which case
    /// the earlier outcome stands.
    pub fn settle(&self, value: T) -> bool {
        self.complete(Ok(value))
    }

    /// Fails the promise with `error`.
    ///
    /// Returns `false` if the promise had already been settled, in which case
    /// the earlier outcome stands.
    pub fn fail(&self, error: Error) -> bool {
        self.complete(Err(error))
    }

    fn complete(&self, outcome: Result<T>) -> bool {
        let mut state = self.lock();
        if state.outcome.is_some() {
            log::debug!("ignoring second settlement of promise");
            return false;
        }

        let handler: Option<Box<dyn FnOnce() + Send>> = match &outcome {
            Ok(value) => state.on_success.take().map(|handler| {
                let value = value.clone();
                Box::new(move || handler(value)) as Box<dyn FnOnce() + Send>
            }),
            Err(error) => state.on_failure.take().map(|handler| {
                let error = error.clone();
                Box::new(move || handler(error)) as Box<dyn FnOnce() + Send>
            }),
        };
        state.outcome = Some(outcome);
        drop(state);

        self.inner.settled.notify_waiters();
        if let Some(handler) = handler {
            handler();
        }
        true
    }

    /// Requests cancellation.
    ///
    /// Fires the cancellation token and runs the cancellation hook. The
    /// promise stays unsettled until its creator reacts.
    pub fn cancel(&self) {
        let hook = {
            let mut state = self.lock();
            state.canceled = true;
            state.on_cancel.take()
        };

        self.inner.cancel.cancel();
        if let Some(hook) = hook {
            hook();
        }
    }

    /// Registers the success handler. Runs immediately if already resolved.
    pub fn on_success<F>(&self, handler: F) -> &Self
    where
        F: FnOnce(T) + Send + 'static,
    {
        let mut state = self.lock();
        match state
            .outcome
            .as_ref()
            .map(|outcome| outcome.as_ref().ok().cloned())
        {
            Some(Some(value)) => {
                drop(state);
                handler(value);
            }
            Some(None) => {}
            None => state.on_success = Some(Box::new(handler)),
        }
        self
    }

    /// Registers the failure handler. Runs immediately if already failed.
    pub fn on_failure<F>(&self, handler: F) -> &Self
    where
        F: FnOnce(Error) + Send + 'static,
    {
        let mut state = self.lock();
        match state
            .outcome
            .as_ref()
            .map(|outcome| outcome.as_ref().err().cloned())
        {
            Some(Some(error)) => {
                drop(state);
                handler(error);
            }
            Some(None) => {}
            None => state.on_failure = Some(Box::new(handler)),
        }
        self
    }

    /// Registers the cancellation hook. Runs immediately if cancellation was
    /// already requested.
    pub fn on_cancel<F>(&self, hook: F) -> &Self
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.lock();
        if state.canceled {
            drop(state);
            hook();
        } else {
            state.on_cancel = Some(Box::new(hook));
        }
        self
    }

    /// Waits for the promise to settle and returns a copy of the outcome.
    pub async fn wait(&self) -> Result<T> {
        loop {
            let notified = self.inner.settled.notified();
            let outcome = self.lock().outcome.clone();
            if let Some(outcome) = outcome {
                return outcome;
            }
            notified.await;
        }
    }

    /// The token suspension points race against.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.lock().outcome.is_some()
    }

    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.lock().canceled
    }
}

impl<T> Promise<T> {
    /// Whether both handles refer to the same promise.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use super::*;
    use crate::error::{CredentialError, TransportError};

    fn counter() -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    #[test]
    fn success_handler_attached_after_settle_runs_once() {
        let promise = Promise::new();
        assert!(promise.settle(42));

        let calls = counter();
        let seen = Arc::new(Mutex::new(None));
        {
            let calls = Arc::clone(&calls);
            let seen = Arc::clone(&seen);
            promise.on_success(move |value| {
                calls.fetch_add(1, Ordering::SeqCst);
                *seen.lock().unwrap() = Some(value);
            });
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(*seen.lock().unwrap(), Some(42));
    }

    #[test]
    fn success_handler_attached_before_settle_runs_on_settle() {
        let promise = Promise::new();
        let calls = counter();
        {
            let calls = Arc::clone(&calls);
            promise.on_success(move |_: &str| {
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        promise.settle("done");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failure_handler_attached_after_fail_runs_once() {
        let promise: Promise<()> = Promise::new();
        promise.fail(CredentialError::NoCredential.into());

        let calls = counter();
        {
            let calls = Arc::clone(&calls);
            promise.on_failure(move |e| {
                assert!(matches!(e, Error::Credential(CredentialError::NoCredential)));
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }
        promise.on_success(|()| panic!("success handler must not run"));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancel_hook_attached_after_cancel_runs_immediately() {
        let promise: Promise<()> = Promise::new();
        promise.cancel();

        let calls = counter();
        {
            let calls = Arc::clone(&calls);
            promise.on_cancel(move || {
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(promise.is_canceled());
        assert!(!promise.is_settled(), "cancel must not settle by itself");
    }

    #[test]
    fn second_settlement_is_rejected() {
        let promise = Promise::new();
        assert!(promise.settle(1));
        assert!(!promise.settle(2));
        assert!(!promise.fail(Error::canceled()));

        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            promise.on_success(move |v| seen.lock().unwrap().push(v));
        }
        assert_eq!(*seen.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn wait_returns_outcome() {
        let promise = Promise::new();
        let settler = promise.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            settler.settle("late".to_string());
        });

        assert_eq!(promise.wait().await.unwrap(), "late");
        // waiting again yields the same outcome
        assert_eq!(promise.wait().await.unwrap(), "late");
    }

    #[tokio::test]
    async fn spawn_settles_from_future() {
        let promise = Promise::spawn(|_| async { Ok(7_u32) });
        assert_eq!(promise.wait().await.unwrap(), 7);

        let failed: Promise<u32> =
            Promise::spawn(|_| async { Err(TransportError::Timeout(Duration::ZERO).into()) });
        assert!(matches!(
            failed.wait().await,
            Err(Error::Transport(TransportError::Timeout(_)))
        ));
    }

    #[tokio::test]
    async fn cancel_fails_spawned_promise() {
        let promise: Promise<()> = Promise::spawn(|_| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        });

        promise.cancel();
        let err = promise.wait().await.unwrap_err();
        assert!(err.is_canceled());
    }
}
