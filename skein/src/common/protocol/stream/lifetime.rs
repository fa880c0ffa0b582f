// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::sync::Arc;

use super::{StreamCloseReason, StreamContext, StreamId};

/// Receives stream lifecycle notifications from a registry
///
/// `on_stream_closed` is called exactly once per stream, after the stream is marked
/// closed and its resources are released, and never while the registry lock is held.
#[cfg_attr(test, mockall::automock)]
pub trait StreamLifetimeHandler: Send + Sync + 'static {
  fn on_stream_closed(&self, stream_id: StreamId, reason: &StreamCloseReason);

  fn on_stream_opened(&self, _context: &Arc<StreamContext>) {}
}

impl<F> StreamLifetimeHandler for F
where
  F: Fn(StreamId, &StreamCloseReason) + Send + Sync + 'static,
{
  fn on_stream_closed(&self, stream_id: StreamId, reason: &StreamCloseReason) {
    (self)(stream_id, reason)
  }
}
