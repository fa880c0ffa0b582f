// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Deferred continuation scheduling
//!
//! Continuations triggered by I/O completion are never run on the thread that signalled
//! the completion. They are handed to the worker pool instead, so completion chains
//! spanning many streams cannot nest on one call stack.

use std::{
  future::Future,
  pin::Pin,
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
  },
  task::{Context, Poll, Waker},
};

use futures::task::{ArcWake, AtomicWaker};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Process-wide scheduler for deferred continuations
///
/// The scheduler carries no state; all callers share [DeferredScheduler::shared].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeferredScheduler;

static SHARED_SCHEDULER: DeferredScheduler = DeferredScheduler;

impl DeferredScheduler {
  pub fn shared() -> &'static DeferredScheduler {
    &SHARED_SCHEDULER
  }

  /// Produces a suspension which never reports completion synchronously
  ///
  /// The first poll always returns [Poll::Pending] and queues the awaiting task's
  /// wakeup through [DeferredScheduler::resume].
  pub fn suspend(&'static self) -> Suspension {
    Suspension {
      scheduler: self,
      shared: Arc::new(SuspensionShared::default()),
      registered: false,
    }
  }

  /// Runs `continuation` on the worker pool rather than the current call stack
  ///
  /// Outside of a runtime, a detached thread stands in for the worker pool.
  pub fn resume<F>(&self, continuation: F)
  where
    F: FnOnce() + Send + 'static,
  {
    match tokio::runtime::Handle::try_current() {
      Ok(handle) => {
        handle.spawn(async move { continuation() });
      }
      Err(_) => {
        tracing::trace!("No worker pool on this thread; resuming on a detached thread");
        drop(std::thread::spawn(continuation));
      }
    }
  }

  /// Wraps a waker so that waking it schedules the wakeup instead of running it inline
  pub fn deferred_waker(&'static self, waker: &Waker) -> Waker {
    futures::task::waker(Arc::new(DeferredWake {
      scheduler: self,
      inner: waker.clone(),
    }))
  }
}

#[derive(Default)]
struct SuspensionShared {
  resumed: AtomicBool,
  waker: AtomicWaker,
}

/// A completion token which is never complete at the moment it is observed
pub struct Suspension {
  scheduler: &'static DeferredScheduler,
  shared: Arc<SuspensionShared>,
  registered: bool,
}

impl Suspension {
  pub fn is_complete(&self) -> bool {
    self.shared.resumed.load(Ordering::Acquire)
  }
}

impl std::fmt::Debug for Suspension {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Suspension")
      .field("registered", &self.registered)
      .field("complete", &self.is_complete())
      .finish()
  }
}

impl Future for Suspension {
  type Output = ();

  fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    self.shared.waker.register(cx.waker());
    if !self.registered {
      self.registered = true;
      let shared = Arc::clone(&self.shared);
      self.scheduler.resume(move || {
        shared.resumed.store(true, Ordering::Release);
        shared.waker.wake();
      });
      return Poll::Pending;
    }
    if self.is_complete() {
      Poll::Ready(())
    } else {
      Poll::Pending
    }
  }
}

struct DeferredWake {
  scheduler: &'static DeferredScheduler,
  inner: Waker,
}

impl ArcWake for DeferredWake {
  fn wake_by_ref(arc_self: &Arc<Self>) {
    let waker = arc_self.inner.clone();
    arc_self.scheduler.resume(move || waker.wake());
  }
}

pin_project_lite::pin_project! {
  /// An I/O object whose readiness notifications pass through the deferred scheduler
  ///
  /// A task awaiting this object is always woken from the worker pool, never from
  /// inside the call which completed the underlying operation.
  #[derive(Debug)]
  pub struct Deferred<T> {
    #[pin]
    inner: T,
  }
}

impl<T> Deferred<T> {
  pub fn new(inner: T) -> Self {
    Self { inner }
  }

  pub fn get_ref(&self) -> &T {
    &self.inner
  }

  pub fn into_inner(self) -> T {
    self.inner
  }
}

fn with_deferred_context<R>(cx: &Context<'_>, op: impl FnOnce(&mut Context<'_>) -> R) -> R {
  let waker = DeferredScheduler::shared().deferred_waker(cx.waker());
  let mut deferred_cx = Context::from_waker(&waker);
  op(&mut deferred_cx)
}

impl<T: AsyncRead> AsyncRead for Deferred<T> {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    let this = self.project();
    with_deferred_context(cx, |cx| this.inner.poll_read(cx, buf))
  }
}

impl<T: AsyncWrite> AsyncWrite for Deferred<T> {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, std::io::Error>> {
    let this = self.project();
    with_deferred_context(cx, |cx| this.inner.poll_write(cx, buf))
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
    let this = self.project();
    with_deferred_context(cx, |cx| this.inner.poll_flush(cx))
  }

  fn poll_shutdown(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
  ) -> Poll<Result<(), std::io::Error>> {
    let this = self.project();
    with_deferred_context(cx, |cx| this.inner.poll_shutdown(cx))
  }
}

#[cfg(test)]
mod tests {
  use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
  };

  use futures::FutureExt;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};

  use super::{Deferred, DeferredScheduler};

  fn assert_never_synchronous() {
    let scheduler = DeferredScheduler::shared();
    let suspension = scheduler.suspend();
    assert!(!suspension.is_complete());
    assert!(
      suspension.now_or_never().is_none(),
      "A suspension must never complete on its first poll"
    );
  }

  #[tokio::test]
  async fn suspension_is_pending_within_runtime() {
    assert_never_synchronous();
    let suspension = DeferredScheduler::shared().suspend();
    suspension.await;
  }

  #[tokio::test]
  async fn suspension_is_pending_after_prior_resumption() {
    DeferredScheduler::shared().suspend().await;
    DeferredScheduler::shared().suspend().await;
    assert_never_synchronous();
  }

  #[tokio::test]
  async fn suspension_is_pending_inside_a_continuation() {
    let (sender, receiver) = tokio::sync::oneshot::channel();
    DeferredScheduler::shared().resume(move || {
      assert_never_synchronous();
      let _ = sender.send(());
    });
    receiver.await.expect("continuation must run");
  }

  #[test]
  fn suspension_is_pending_outside_of_a_runtime() {
    assert_never_synchronous();
    futures::executor::block_on(DeferredScheduler::shared().suspend());
  }

  #[tokio::test]
  async fn resume_never_runs_inline() {
    let ran = Arc::new(AtomicBool::new(false));
    let (sender, receiver) = tokio::sync::oneshot::channel();
    {
      let ran = Arc::clone(&ran);
      DeferredScheduler::shared().resume(move || {
        ran.store(true, Ordering::SeqCst);
        let _ = sender.send(());
      });
    }
    assert!(
      !ran.load(Ordering::SeqCst),
      "Continuation must not run on the resuming call stack"
    );
    receiver.await.expect("continuation must run");
    assert!(ran.load(Ordering::SeqCst));
  }

  #[tokio::test]
  async fn long_continuation_chains_do_not_nest() {
    const DEPTH: usize = 10_000;
    fn step(remaining: usize, counter: Arc<AtomicUsize>, done: tokio::sync::oneshot::Sender<usize>) {
      counter.fetch_add(1, Ordering::Relaxed);
      if remaining == 0 {
        let _ = done.send(counter.load(Ordering::Relaxed));
        return;
      }
      DeferredScheduler::shared().resume(move || step(remaining - 1, counter, done));
    }
    let counter = Arc::new(AtomicUsize::new(0));
    let (sender, receiver) = tokio::sync::oneshot::channel();
    DeferredScheduler::shared().resume(move || step(DEPTH, counter, sender));
    assert_eq!(receiver.await.expect("chain must complete"), DEPTH + 1);
  }

  #[tokio::test]
  async fn deferred_io_delivers_data() {
    let (a, b) = tokio::io::duplex(64);
    let mut reader = Deferred::new(a);
    let mut writer = Deferred::new(b);
    let read = tokio::spawn(async move {
      let mut buf = Vec::new();
      reader.read_to_end(&mut buf).await.map(|_| buf)
    });
    writer.write_all(b"deferred").await.unwrap();
    writer.shutdown().await.unwrap();
    drop(writer);
    assert_eq!(read.await.unwrap().unwrap(), b"deferred");
  }
}
