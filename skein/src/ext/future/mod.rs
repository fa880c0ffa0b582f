// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use futures::{Future, FutureExt};

mod poll_until;
pub use poll_until::PollUntil;

pub trait FutureExtExt: FutureExt {
  /// Runs until `cancellation` resolves, yielding `None` if it does so first
  fn poll_until<C>(self, cancellation: C) -> PollUntil<Self, C>
  where
    C: Future,
    Self: Sized,
  {
    PollUntil {
      canceller: Some(Box::pin(cancellation)),
      task: Some(Box::pin(self)),
    }
  }
}

impl<Fut: ?Sized + FutureExt> FutureExtExt for Fut {}
