use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use crate::error::UploadError;

// Tagged state, all transitions by compare_exchange. Whoever wins the CAS
// into TERMINATED performs the delivery.
const WAITING: u8 = 0;
const REQUESTED: u8 = 1;
const HAS_RESPONSE: u8 = 2;
const TERMINATED: u8 = 3;

struct Inner<T> {
    state: AtomicU8,
    slot: Mutex<Option<Result<T, UploadError>>>,
    waker: Mutex<Option<Waker>>,
    abort: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

/// Single-emission bridge from a one-shot request/response operation to an
/// awaitable value.
///
/// The producer side ([`ArbiterHandle`]) fulfills exactly once; the consumer
/// side ([`ResponseFuture`]) signals demand by polling. Across any
/// interleaving of demand, fulfillment, and cancellation the consumer
/// observes exactly one terminal event: the value, an error, or
/// [`UploadError::Cancelled`]. A fulfillment arriving after cancellation is
/// discarded.
pub struct CallArbiter;

impl CallArbiter {
    pub fn channel<T: Send>() -> (ArbiterHandle<T>, ResponseFuture<T>, Canceller<T>) {
        let inner = Arc::new(Inner {
            state: AtomicU8::new(WAITING),
            slot: Mutex::new(None),
            waker: Mutex::new(None),
            abort: Mutex::new(None),
        });
        (
            ArbiterHandle {
                inner: inner.clone(),
            },
            ResponseFuture {
                inner: inner.clone(),
                done: false,
            },
            Canceller { inner },
        )
    }
}

/// Producer side: delivers the operation's outcome exactly once.
pub struct ArbiterHandle<T> {
    inner: Arc<Inner<T>>,
}

impl<T: Send> ArbiterHandle<T> {
    /// Delivers the response or error. If the arbiter was already cancelled
    /// the outcome is discarded; the consumer is gone.
    pub fn fulfill(self, result: Result<T, UploadError>) {
        let inner = &self.inner;

        // The slot is written only after winning a CAS, and only while
        // holding the slot lock. `terminate` clears the slot under the
        // same lock, so a cancellation can never let a parked value
        // slip through to the consumer.
        let mut slot = lock(&inner.slot);
        loop {
            match inner.state.load(Ordering::Acquire) {
                WAITING => {
                    // Response arrived before demand: park it.
                    if inner
                        .state
                        .compare_exchange(WAITING, HAS_RESPONSE, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        *slot = Some(result);
                        return;
                    }
                }
                REQUESTED => {
                    // Demand is already registered: deliver now.
                    if inner
                        .state
                        .compare_exchange(
                            REQUESTED,
                            TERMINATED,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        *slot = Some(result);
                        drop(slot);
                        if let Some(waker) = lock(&inner.waker).take() {
                            waker.wake();
                        }
                        return;
                    }
                }
                _ => {
                    // Cancelled (or already delivered): late response is
                    // discarded without ever touching the slot.
                    return;
                }
            }
        }
    }
}

/// Consumer side: polling is the demand signal. Dropping an unresolved
/// future cancels the underlying operation.
pub struct ResponseFuture<T> {
    inner: Arc<Inner<T>>,
    done: bool,
}

impl<T: Send> Future for ResponseFuture<T> {
    type Output = Result<T, UploadError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let inner = self.inner.clone();
        *lock(&inner.waker) = Some(cx.waker().clone());

        loop {
            match inner.state.load(Ordering::Acquire) {
                WAITING => {
                    if inner
                        .state
                        .compare_exchange(WAITING, REQUESTED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return Poll::Pending;
                    }
                }
                REQUESTED => return Poll::Pending,
                HAS_RESPONSE => {
                    if inner
                        .state
                        .compare_exchange(
                            HAS_RESPONSE,
                            TERMINATED,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        self.done = true;
                        let outcome = lock(&inner.slot)
                            .take()
                            .unwrap_or(Err(UploadError::Cancelled));
                        return Poll::Ready(outcome);
                    }
                }
                _ => {
                    self.done = true;
                    let outcome = lock(&inner.slot)
                        .take()
                        .unwrap_or(Err(UploadError::Cancelled));
                    return Poll::Ready(outcome);
                }
            }
        }
    }
}

impl<T> Drop for ResponseFuture<T> {
    fn drop(&mut self) {
        if !self.done {
            terminate(&self.inner);
        }
    }
}

/// Cancellation side: cloneable, usable from any worker.
pub struct Canceller<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Canceller<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Canceller<T> {
    /// Registers the hook that aborts the underlying operation when the
    /// arbiter is cancelled. Runs immediately if already cancelled.
    pub fn set_abort(&self, abort: impl FnOnce() + Send + 'static) {
        if self.inner.state.load(Ordering::Acquire) == TERMINATED {
            abort();
            return;
        }
        *lock(&self.inner.abort) = Some(Box::new(abort));
    }

    /// Cancels the in-flight operation. No delivery occurs unless a
    /// terminal event was already delivered; the consumer observes
    /// [`UploadError::Cancelled`].
    pub fn cancel(&self) {
        terminate(&self.inner);
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == TERMINATED
    }
}

fn terminate<T>(inner: &Inner<T>) {
    let previous = inner.state.swap(TERMINATED, Ordering::AcqRel);
    if previous == TERMINATED {
        return;
    }
    // Unconditionally discard anything parked. `fulfill` re-checks the
    // state under the slot lock before writing, so once this take has
    // run no value can reach the consumer.
    lock(&inner.slot).take();
    if let Some(abort) = lock(&inner.abort).take() {
        abort();
    }
    if let Some(waker) = lock(&inner.waker).take() {
        waker.wake();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
