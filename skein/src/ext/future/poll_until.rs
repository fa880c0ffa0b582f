// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{pin::Pin, task::Poll};

use futures::{future::FusedFuture, Future, FutureExt};

/// Polls a task until it completes or a canceller resolves, whichever comes first
///
/// Both futures are boxed so neither needs to be [Unpin]; the canceller is polled
/// first, so a canceller which is already resolved always wins.
pub struct PollUntil<F, C> {
  pub(super) task: Option<Pin<Box<F>>>,
  pub(super) canceller: Option<Pin<Box<C>>>,
}

impl<F, C> PollUntil<F, C> {
  fn terminate(&mut self) {
    self.canceller = None;
    self.task = None;
  }
}

impl<F, C> Future for PollUntil<F, C>
where
  F: Future,
  C: Future,
{
  type Output = Option<F::Output>;

  fn poll(
    mut self: std::pin::Pin<&mut Self>,
    cx: &mut std::task::Context<'_>,
  ) -> std::task::Poll<Self::Output> {
    let this = std::ops::DerefMut::deref_mut(&mut self);
    let (canceller, task) = match (this.canceller.as_mut(), this.task.as_mut()) {
      (Some(canceller), Some(task)) => (canceller, task),
      // Terminated; behave as a fused future
      _ => return Poll::Pending,
    };
    if canceller.poll_unpin(cx).is_ready() {
      this.terminate();
      return Poll::Ready(None);
    }
    let res = futures::ready!(task.poll_unpin(cx));
    this.terminate();
    Poll::Ready(Some(res))
  }
}

impl<F, C> FusedFuture for PollUntil<F, C>
where
  F: Future,
  C: Future,
{
  fn is_terminated(&self) -> bool {
    self.canceller.is_none()
  }
}

#[cfg(test)]
mod tests {
  use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
  };

  use futures::future::{pending, ready, FutureExt};

  use crate::ext::future::FutureExtExt;
  use crate::util::dropkick::Dropkick;

  #[test]
  fn completes_with_task_output() {
    let res = ready(5)
      .poll_until(pending::<()>())
      .now_or_never()
      .expect("must be instant");
    assert_eq!(res, Some(5));
  }

  #[test]
  fn canceller_wins_when_both_ready() {
    let res = ready(5)
      .poll_until(ready(()))
      .now_or_never()
      .expect("must be instant");
    assert_eq!(res, None);
  }

  #[test]
  fn cancelled_task_is_released_on_completion() {
    let released = Arc::new(AtomicBool::new(false));
    let guard = {
      let released = Arc::clone(&released);
      Dropkick::callback(move || released.store(true, Ordering::SeqCst))
    };
    let mut until = Box::pin(
      async move {
        let _guard = guard;
        pending::<()>().await
      }
      .poll_until(ready(())),
    );
    assert_eq!((&mut until).now_or_never(), Some(None));
    assert!(
      released.load(Ordering::SeqCst),
      "The task must be dropped as soon as cancellation resolves"
    );
  }
}
