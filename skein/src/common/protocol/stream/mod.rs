// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Per-stream state within a connection
//!
//! A [StreamContext] carries everything protocol code needs about one stream: its id,
//! the settings in force when it was created, its half-close state, and the lifetime
//! handler that is told when it ends. Contexts are only ever created by the
//! [StreamRegistry], after the concurrency limit has been checked.

use std::{
  error::Error,
  io,
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, MutexGuard, PoisonError, Weak,
  },
};

use arc_swap::ArcSwap;

use crate::{common::settings::ConnectionSettings, util::dropkick::Dropkick};

pub mod extension;
pub mod id;
pub mod lifetime;
pub mod registry;

pub use extension::ExtensionSession;
pub use id::{StreamId, StreamIdAllocator};
pub use lifetime::StreamLifetimeHandler;
pub use registry::StreamRegistry;

use registry::RegistryShared;

/// Well-known codes carried by stream resets
pub mod reset_code {
  pub const NO_ERROR: u32 = 0x0;
  pub const INTERNAL_ERROR: u32 = 0x2;
  pub const FLOW_CONTROL_ERROR: u32 = 0x3;
  pub const REFUSED_STREAM: u32 = 0x7;
  pub const CANCEL: u32 = 0x8;
}

/// Which side of the connection initiated a stream, from the local point of view
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum StreamKind {
  Local,
  Remote,
}

/// One direction's end of a stream
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum StreamEnd {
  /// Our sending direction
  Local,
  /// The peer's sending direction
  Remote,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum StreamState {
  /// Identifier reserved, not yet visible
  Idle,
  Open,
  /// The named end has finished sending
  HalfClosed(StreamEnd),
  Closed,
}

#[derive(thiserror::Error, Debug, Clone)]
pub enum StreamError {
  #[error("Concurrent stream limit of {limit} reached")]
  ConcurrencyLimitExceeded { limit: u32 },
  #[error("Invalid settings value: {0}")]
  InvalidSettingsValue(#[from] crate::common::settings::SettingsError),
  #[error("Stream {0} is closed")]
  StreamClosed(StreamId),
  #[error("Stream transform failed to initialize: {0}")]
  TransformInitializationFailed(Arc<io::Error>),
  #[error("Connection aborted")]
  ConnectionAborted,
  #[error("Stream id {0} is not valid for a peer-initiated stream")]
  InvalidStreamId(StreamId),
  #[error("Stream identifier space exhausted")]
  StreamIdsExhausted,
  #[error("No stream with id {0} is registered")]
  UnknownStream(StreamId),
  #[error("Operation cancelled")]
  Cancelled,
  #[error("Stream {0} already carries an extension session")]
  ExtensionSessionOccupied(StreamId),
  #[error("Extension sessions are not enabled on both sides of the connection")]
  ExtensionSessionsDisabled,
}

impl From<StreamError> for io::Error {
  fn from(error: StreamError) -> Self {
    let kind = match &error {
      StreamError::StreamClosed(_) => io::ErrorKind::NotConnected,
      StreamError::ConnectionAborted => io::ErrorKind::ConnectionAborted,
      StreamError::Cancelled => io::ErrorKind::Interrupted,
      StreamError::TransformInitializationFailed(inner) => inner.kind(),
      _ => io::ErrorKind::Other,
    };
    io::Error::new(kind, error)
  }
}

#[derive(thiserror::Error, Debug, Clone)]
pub enum StreamCloseReason {
  #[error("Stream completed in both directions")]
  Completed,
  #[error("Stream reset by {} with code {code:#x}", if *(.remote_initiated) { "peer" } else { "local side" })]
  Reset { remote_initiated: bool, code: u32 },
  #[error("Stream transform failed to initialize: {0}")]
  TransformInitializationFailed(Arc<io::Error>),
  #[error("Connection aborted - initiator: {}", if *(.remote_initiated) { "peer" } else { "local side" })]
  ConnectionAborted { remote_initiated: bool },
  #[error("Stream cancelled locally")]
  Cancelled,
  #[error("Stream closed due to error: {0}")]
  Error(Arc<dyn Error + Send + Sync + 'static>),
}

impl StreamCloseReason {
  #[must_use]
  pub fn is_completed(&self) -> bool {
    matches!(self, StreamCloseReason::Completed)
  }

  #[must_use]
  pub fn is_connection_aborted(&self) -> bool {
    matches!(self, StreamCloseReason::ConnectionAborted { .. })
  }

  /// The reset code to send to the peer when this closure originates locally
  pub fn local_reset_code(&self) -> Option<u32> {
    match self {
      StreamCloseReason::Reset {
        remote_initiated: false,
        code,
      } => Some(*code),
      StreamCloseReason::Cancelled => Some(reset_code::CANCEL),
      StreamCloseReason::TransformInitializationFailed(_) | StreamCloseReason::Error(_) => {
        Some(reset_code::INTERNAL_ERROR)
      }
      _ => None,
    }
  }
}

type ReleaseCallback = Box<dyn FnOnce() + Send + 'static>;

struct ContextInner {
  state: StreamState,
  close_reason: Option<StreamCloseReason>,
  extension: Option<Arc<dyn ExtensionSession>>,
  releases: Vec<Dropkick<ReleaseCallback>>,
}

/// Resources detached from a context as it transitions to closed
pub(crate) struct ClosingResources {
  extension: Option<Arc<dyn ExtensionSession>>,
  releases: Vec<Dropkick<ReleaseCallback>>,
}

pub struct StreamContext {
  id: StreamId,
  kind: StreamKind,
  registry: Weak<RegistryShared>,
  local_settings: Arc<ConnectionSettings>,
  peer_settings: ArcSwap<ConnectionSettings>,
  handler: Arc<dyn StreamLifetimeHandler>,
  used: AtomicBool,
  inner: Mutex<ContextInner>,
}

impl StreamContext {
  pub(crate) fn new(
    id: StreamId,
    kind: StreamKind,
    registry: Weak<RegistryShared>,
    local_settings: Arc<ConnectionSettings>,
    peer_settings: Arc<ConnectionSettings>,
    handler: Arc<dyn StreamLifetimeHandler>,
  ) -> Self {
    Self {
      id,
      kind,
      registry,
      local_settings,
      peer_settings: ArcSwap::new(peer_settings),
      handler,
      used: AtomicBool::new(false),
      inner: Mutex::new(ContextInner {
        state: StreamState::Idle,
        close_reason: None,
        extension: None,
        releases: Vec::new(),
      }),
    }
  }

  fn lock(&self) -> MutexGuard<'_, ContextInner> {
    self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub(crate) fn activate(&self) {
    let mut inner = self.lock();
    if inner.state == StreamState::Idle {
      inner.state = StreamState::Open;
    }
  }

  pub fn id(&self) -> StreamId {
    self.id
  }

  pub fn kind(&self) -> StreamKind {
    self.kind
  }

  pub fn state(&self) -> StreamState {
    self.lock().state
  }

  pub fn is_closed(&self) -> bool {
    self.state() == StreamState::Closed
  }

  pub fn close_reason(&self) -> Option<StreamCloseReason> {
    self.lock().close_reason.clone()
  }

  pub fn ensure_open(&self) -> Result<(), StreamError> {
    match self.state() {
      StreamState::Closed => Err(StreamError::StreamClosed(self.id)),
      _ => Ok(()),
    }
  }

  /// Our own settings as they were when the stream was created
  pub fn local_settings(&self) -> &ConnectionSettings {
    &self.local_settings
  }

  pub fn peer_settings(&self) -> Arc<ConnectionSettings> {
    self.peer_settings.load_full()
  }

  /// The peer settings currently in force on the connection
  ///
  /// Unlike [Self::peer_settings] this tracks every SETTINGS frame, used or not; it falls
  /// back to the stream's snapshot once the connection is gone.
  pub fn connection_peer_settings(&self) -> Arc<ConnectionSettings> {
    match self.registry.upgrade() {
      Some(registry) => registry.peer_settings(),
      None => self.peer_settings(),
    }
  }

  /// Records that stream I/O has begun, freezing the peer settings snapshot
  pub fn mark_used(&self) {
    self.used.store(true, Ordering::Release);
  }

  pub fn is_used(&self) -> bool {
    self.used.load(Ordering::Acquire)
  }

  /// Picks up the connection's current peer settings, if the stream is still unused
  ///
  /// The connection calls this on every open stream each time it applies a SETTINGS
  /// frame. Returns whether the snapshot was replaced.
  pub fn refresh_peer_settings(&self) -> Result<bool, StreamError> {
    self.ensure_open()?;
    if self.is_used() {
      return Ok(false);
    }
    let registry = self
      .registry
      .upgrade()
      .ok_or(StreamError::ConnectionAborted)?;
    self.peer_settings.store(registry.peer_settings());
    Ok(true)
  }

  /// Runs `callback` when the stream closes, or immediately if it already has
  pub fn on_release<F>(&self, callback: F)
  where
    F: FnOnce() + Send + 'static,
  {
    let callback: ReleaseCallback = Box::new(callback);
    let mut inner = self.lock();
    if inner.state == StreamState::Closed {
      drop(inner);
      callback();
    } else {
      inner.releases.push(Dropkick::new(callback));
    }
  }

  pub fn attach_extension_session(
    &self,
    session: Arc<dyn ExtensionSession>,
  ) -> Result<(), StreamError> {
    if !(self.local_settings.enable_extension_sessions
      && self.peer_settings().enable_extension_sessions)
    {
      return Err(StreamError::ExtensionSessionsDisabled);
    }
    let mut inner = self.lock();
    if inner.state == StreamState::Closed {
      return Err(StreamError::StreamClosed(self.id));
    }
    if inner.extension.is_some() {
      return Err(StreamError::ExtensionSessionOccupied(self.id));
    }
    inner.extension = Some(session);
    Ok(())
  }

  pub fn detach_extension_session(&self) -> Option<Arc<dyn ExtensionSession>> {
    self.lock().extension.take()
  }

  pub fn extension_session(&self) -> Option<Arc<dyn ExtensionSession>> {
    self.lock().extension.clone()
  }

  /// Marks our sending direction finished, closing the stream if the peer's already is
  pub fn finish_local(&self) -> Result<StreamState, StreamError> {
    self.finish(StreamEnd::Local)
  }

  /// Marks the peer's sending direction finished, closing the stream if ours already is
  pub fn finish_remote(&self) -> Result<StreamState, StreamError> {
    self.finish(StreamEnd::Remote)
  }

  fn finish(&self, end: StreamEnd) -> Result<StreamState, StreamError> {
    {
      let mut inner = self.lock();
      match inner.state {
        StreamState::Closed => return Err(StreamError::StreamClosed(self.id)),
        StreamState::HalfClosed(finished) if finished == end => return Ok(inner.state),
        StreamState::HalfClosed(_) => {}
        StreamState::Idle | StreamState::Open => {
          inner.state = StreamState::HalfClosed(end);
          tracing::trace!(stream = %self.id, ?end, "Stream half-closed");
          return Ok(inner.state);
        }
      }
    }
    self.close(StreamCloseReason::Completed);
    Ok(StreamState::Closed)
  }

  /// Closes the stream through its registry; returns false if it was already closed
  pub fn close(&self, reason: StreamCloseReason) -> bool {
    match self.registry.upgrade() {
      Some(registry) => registry.close_stream(self.id, reason),
      None => match self.begin_close(&reason) {
        Some(resources) => {
          self.finish_close(resources, &reason);
          true
        }
        None => false,
      },
    }
  }

  /// Transitions to closed, detaching the resources to release; `None` if already closed
  pub(crate) fn begin_close(&self, reason: &StreamCloseReason) -> Option<ClosingResources> {
    let mut inner = self.lock();
    if inner.state == StreamState::Closed {
      return None;
    }
    inner.state = StreamState::Closed;
    inner.close_reason = Some(reason.clone());
    Some(ClosingResources {
      extension: inner.extension.take(),
      releases: std::mem::take(&mut inner.releases),
    })
  }

  /// Releases detached resources and notifies the lifetime handler
  ///
  /// Must be called exactly once per successful [StreamContext::begin_close],
  /// without holding the registry lock.
  pub(crate) fn finish_close(&self, resources: ClosingResources, reason: &StreamCloseReason) {
    let ClosingResources {
      extension,
      releases,
    } = resources;
    drop(releases);
    if let Some(session) = extension {
      session.on_carrier_closed(reason);
    }
    tracing::debug!(stream = %self.id, kind = ?self.kind, %reason, "Stream closed");
    self.handler.on_stream_closed(self.id, reason);
  }
}

impl std::fmt::Debug for StreamContext {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("StreamContext")
      .field("id", &self.id)
      .field("kind", &self.kind)
      .field("state", &self.state())
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Weak,
  };

  use super::{
    StreamCloseReason, StreamContext, StreamEnd, StreamError, StreamId, StreamKind, StreamState,
  };
  use crate::common::settings::ConnectionSettings;

  fn detached_context(notifications: Arc<AtomicUsize>) -> StreamContext {
    let handler = move |_: StreamId, _: &StreamCloseReason| {
      notifications.fetch_add(1, Ordering::SeqCst);
    };
    let context = StreamContext::new(
      StreamId::new(1),
      StreamKind::Local,
      Weak::new(),
      Arc::new(ConnectionSettings::default()),
      Arc::new(ConnectionSettings::default()),
      Arc::new(handler),
    );
    context.activate();
    context
  }

  #[test]
  fn finishing_both_directions_completes_in_either_order() {
    for local_first in [true, false] {
      let notifications = Arc::new(AtomicUsize::new(0));
      let context = detached_context(Arc::clone(&notifications));
      let (first, second) = if local_first {
        (StreamEnd::Local, StreamEnd::Remote)
      } else {
        (StreamEnd::Remote, StreamEnd::Local)
      };
      let finish = |end| match end {
        StreamEnd::Local => context.finish_local(),
        StreamEnd::Remote => context.finish_remote(),
      };
      assert_eq!(finish(first).unwrap(), StreamState::HalfClosed(first));
      assert_eq!(finish(first).unwrap(), StreamState::HalfClosed(first));
      assert_eq!(finish(second).unwrap(), StreamState::Closed);
      assert!(context.close_reason().unwrap().is_completed());
      assert_eq!(notifications.load(Ordering::SeqCst), 1);
    }
  }

  #[test]
  fn operations_on_closed_streams_fail() {
    let context = detached_context(Arc::new(AtomicUsize::new(0)));
    assert!(context.close(StreamCloseReason::Cancelled));
    assert!(!context.close(StreamCloseReason::Cancelled));
    assert!(matches!(
      context.finish_local(),
      Err(StreamError::StreamClosed(id)) if id == StreamId::new(1)
    ));
    assert!(matches!(
      context.ensure_open(),
      Err(StreamError::StreamClosed(_))
    ));
  }

  #[test]
  fn release_callbacks_run_once_on_close() {
    let context = detached_context(Arc::new(AtomicUsize::new(0)));
    let released = Arc::new(AtomicUsize::new(0));
    {
      let released = Arc::clone(&released);
      context.on_release(move || {
        released.fetch_add(1, Ordering::SeqCst);
      });
    }
    assert_eq!(released.load(Ordering::SeqCst), 0);
    context.close(StreamCloseReason::Cancelled);
    context.close(StreamCloseReason::Cancelled);
    assert_eq!(released.load(Ordering::SeqCst), 1);
    {
      let released = Arc::clone(&released);
      context.on_release(move || {
        released.fetch_add(1, Ordering::SeqCst);
      });
    }
    assert_eq!(
      released.load(Ordering::SeqCst),
      2,
      "Callbacks registered after closure run immediately"
    );
  }

  #[test]
  fn local_reset_codes() {
    assert_eq!(StreamCloseReason::Completed.local_reset_code(), None);
    assert_eq!(
      StreamCloseReason::Reset {
        remote_initiated: true,
        code: 3
      }
      .local_reset_code(),
      None
    );
    assert_eq!(
      StreamCloseReason::Reset {
        remote_initiated: false,
        code: 3
      }
      .local_reset_code(),
      Some(3)
    );
  }
}
