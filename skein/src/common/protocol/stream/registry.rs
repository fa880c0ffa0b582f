// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{
  collections::HashMap,
  sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tokio::sync::Notify;

use super::{
  StreamCloseReason, StreamContext, StreamError, StreamId, StreamIdAllocator, StreamKind,
  StreamLifetimeHandler,
};
use crate::{
  common::{
    protocol::connection::ConnectionSide,
    settings::{ConnectionSettings, SettingsError},
  },
  ext::future::FutureExtExt,
  util::cancellation::CancellationListener,
};

struct RegistryState {
  streams: HashMap<StreamId, Arc<StreamContext>>,
  local_ids: StreamIdAllocator,
  remote_ids: StreamIdAllocator,
  active_local: usize,
  active_remote: usize,
  local_settings: Arc<ConnectionSettings>,
  peer_settings: Arc<ConnectionSettings>,
  aborted: bool,
}

impl RegistryState {
  /// Local streams are bounded by what the peer accepts, remote ones by what we accept
  fn limit_for(&self, kind: StreamKind) -> u32 {
    match kind {
      StreamKind::Local => self.peer_settings.max_concurrent_streams,
      StreamKind::Remote => self.local_settings.max_concurrent_streams,
    }
  }

  fn active_mut(&mut self, kind: StreamKind) -> &mut usize {
    match kind {
      StreamKind::Local => &mut self.active_local,
      StreamKind::Remote => &mut self.active_remote,
    }
  }

  fn check_capacity(&self, kind: StreamKind) -> Result<(), StreamError> {
    if self.aborted {
      return Err(StreamError::ConnectionAborted);
    }
    let limit = self.limit_for(kind);
    let active = match kind {
      StreamKind::Local => self.active_local,
      StreamKind::Remote => self.active_remote,
    };
    if active >= limit as usize {
      return Err(StreamError::ConcurrencyLimitExceeded { limit });
    }
    Ok(())
  }
}

pub(crate) struct RegistryShared {
  side: ConnectionSide,
  handler: Arc<dyn StreamLifetimeHandler>,
  state: Mutex<RegistryState>,
  slot_released: Notify,
}

impl RegistryShared {
  fn lock(&self) -> MutexGuard<'_, RegistryState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub(crate) fn peer_settings(&self) -> Arc<ConnectionSettings> {
    Arc::clone(&self.lock().peer_settings)
  }

  pub(crate) fn close_stream(&self, id: StreamId, reason: StreamCloseReason) -> bool {
    let (context, resources) = {
      let state = self.lock();
      let context = match state.streams.get(&id) {
        Some(context) => Arc::clone(context),
        None => return false,
      };
      match context.begin_close(&reason) {
        Some(resources) => (context, resources),
        None => return false,
      }
    };
    context.finish_close(resources, &reason);
    {
      let mut state = self.lock();
      if state.streams.remove(&id).is_some() {
        let active = state.active_mut(context.kind());
        *active = active.saturating_sub(1);
      }
    }
    self.slot_released.notify_waiters();
    true
  }

  fn abort(&self, remote_initiated: bool) -> usize {
    let closing: Vec<_> = {
      let mut state = self.lock();
      state.aborted = true;
      state.active_local = 0;
      state.active_remote = 0;
      let reason = StreamCloseReason::ConnectionAborted { remote_initiated };
      state
        .streams
        .drain()
        .filter_map(|(_, context)| {
          context
            .begin_close(&reason)
            .map(|resources| (context, resources))
        })
        .collect()
    };
    let reason = StreamCloseReason::ConnectionAborted { remote_initiated };
    let count = closing.len();
    for (context, resources) in closing {
      context.finish_close(resources, &reason);
    }
    self.slot_released.notify_waiters();
    count
  }
}

impl Drop for RegistryShared {
  fn drop(&mut self) {
    let abandoned = self
      .state
      .get_mut()
      .map(|state| state.streams.len())
      .unwrap_or_default();
    if abandoned > 0 {
      tracing::debug!(abandoned, "Registry dropped with live streams; aborting them");
      self.abort(false);
    }
  }
}

/// The set of live streams on one connection
///
/// All mutation is serialized by one lock. Lifetime notifications are delivered
/// after a stream is marked closed but outside the lock, so handlers may call back
/// into the registry.
#[derive(Clone)]
pub struct StreamRegistry {
  shared: Arc<RegistryShared>,
}

impl StreamRegistry {
  pub fn new(
    side: ConnectionSide,
    local_settings: ConnectionSettings,
    peer_settings: ConnectionSettings,
    handler: Arc<dyn StreamLifetimeHandler>,
  ) -> Result<Self, SettingsError> {
    local_settings.validate()?;
    peer_settings.validate()?;
    Ok(Self {
      shared: Arc::new(RegistryShared {
        side,
        handler,
        state: Mutex::new(RegistryState {
          streams: HashMap::new(),
          local_ids: StreamIdAllocator::for_initiator(side),
          remote_ids: StreamIdAllocator::for_initiator(side.opposite()),
          active_local: 0,
          active_remote: 0,
          local_settings: Arc::new(local_settings),
          peer_settings: Arc::new(peer_settings),
          aborted: false,
        }),
        slot_released: Notify::new(),
      }),
    })
  }

  pub fn side(&self) -> ConnectionSide {
    self.shared.side
  }

  fn create_context(
    &self,
    state: &mut RegistryState,
    id: StreamId,
    kind: StreamKind,
  ) -> Arc<StreamContext> {
    let context = Arc::new(StreamContext::new(
      id,
      kind,
      Arc::downgrade(&self.shared),
      Arc::clone(&state.local_settings),
      Arc::clone(&state.peer_settings),
      Arc::clone(&self.shared.handler),
    ));
    context.activate();
    state.streams.insert(id, Arc::clone(&context));
    *state.active_mut(kind) += 1;
    context
  }

  fn announce(&self, context: &Arc<StreamContext>) {
    tracing::debug!(stream = %context.id(), kind = ?context.kind(), "Stream opened");
    self.shared.handler.on_stream_opened(context);
  }

  /// Registers a new stream with the next identifier of `kind`'s space
  ///
  /// Identifiers are only consumed by successful opens.
  pub fn open_stream(&self, kind: StreamKind) -> Result<Arc<StreamContext>, StreamError> {
    let context = {
      let mut state = self.shared.lock();
      state.check_capacity(kind)?;
      let id = match kind {
        StreamKind::Local => state.local_ids.reserve()?,
        StreamKind::Remote => state.remote_ids.reserve()?,
      };
      self.create_context(&mut state, id, kind)
    };
    self.announce(&context);
    Ok(context)
  }

  /// Registers a stream the peer announced under identifier `id`
  pub fn register_remote_stream(&self, id: StreamId) -> Result<Arc<StreamContext>, StreamError> {
    let context = {
      let mut state = self.shared.lock();
      if !state.remote_ids.can_accept(id) {
        return Err(StreamError::InvalidStreamId(id));
      }
      state.check_capacity(StreamKind::Remote)?;
      state.remote_ids.accept(id);
      self.create_context(&mut state, id, StreamKind::Remote)
    };
    self.announce(&context);
    Ok(context)
  }

  /// As [StreamRegistry::open_stream], waiting for a slot instead of failing at the limit
  pub async fn open_stream_until(
    &self,
    kind: StreamKind,
    cancellation: &CancellationListener,
  ) -> Result<Arc<StreamContext>, StreamError> {
    loop {
      let released = self.shared.slot_released.notified();
      match self.open_stream(kind) {
        Err(StreamError::ConcurrencyLimitExceeded { limit }) => {
          tracing::trace!(?kind, limit, "Waiting for a stream slot");
        }
        other => return other,
      }
      if released.poll_until(cancellation.cancelled()).await.is_none() {
        return Err(StreamError::Cancelled);
      }
    }
  }

  /// Closes a stream, notifying the lifetime handler exactly once
  ///
  /// Returns false if the stream was unknown or already closed.
  pub fn close_stream(&self, id: StreamId, reason: StreamCloseReason) -> bool {
    self.shared.close_stream(id, reason)
  }

  /// Replaces the peer's settings for streams created from now on
  pub fn update_settings(&self, settings: ConnectionSettings) -> Result<(), StreamError> {
    settings.validate()?;
    self.shared.lock().peer_settings = Arc::new(settings);
    tracing::debug!(?settings, "Peer settings updated");
    self.shared.slot_released.notify_waiters();
    Ok(())
  }

  /// Replaces our own settings for streams created from now on
  pub fn update_local_settings(&self, settings: ConnectionSettings) -> Result<(), StreamError> {
    settings.validate()?;
    self.shared.lock().local_settings = Arc::new(settings);
    tracing::debug!(?settings, "Local settings updated");
    Ok(())
  }

  /// Closes every stream with [StreamCloseReason::ConnectionAborted] and refuses new ones
  ///
  /// Returns the number of streams closed by this call.
  pub fn abort(&self, remote_initiated: bool) -> usize {
    let count = self.shared.abort(remote_initiated);
    tracing::debug!(count, remote_initiated, "Stream registry aborted");
    count
  }

  pub fn is_aborted(&self) -> bool {
    self.shared.lock().aborted
  }

  pub fn get(&self, id: StreamId) -> Option<Arc<StreamContext>> {
    self.shared.lock().streams.get(&id).cloned()
  }

  pub fn stream_ids(&self) -> Vec<StreamId> {
    self.shared.lock().streams.keys().copied().collect()
  }

  pub fn len(&self) -> usize {
    self.shared.lock().streams.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn local_settings(&self) -> Arc<ConnectionSettings> {
    Arc::clone(&self.shared.lock().local_settings)
  }

  pub fn peer_settings(&self) -> Arc<ConnectionSettings> {
    self.shared.peer_settings()
  }
}

impl std::fmt::Debug for StreamRegistry {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("StreamRegistry")
      .field("side", &self.shared.side)
      .field("streams", &self.len())
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use std::{
    sync::{Arc, Mutex},
    time::Duration,
  };

  use mockall::predicate;

  use super::StreamRegistry;
  use crate::{
    common::{
      protocol::{
        connection::ConnectionSide,
        stream::{
          lifetime::MockStreamLifetimeHandler, ExtensionSession, StreamCloseReason, StreamError,
          StreamId, StreamKind, StreamLifetimeHandler,
        },
      },
      settings::ConnectionSettings,
    },
    util::cancellation::CancellationListener,
  };

  #[derive(Default)]
  struct Recorder {
    closed: Mutex<Vec<(StreamId, StreamCloseReason)>>,
  }

  impl Recorder {
    fn closed(&self) -> Vec<(StreamId, StreamCloseReason)> {
      self.closed.lock().unwrap().clone()
    }
  }

  impl StreamLifetimeHandler for Recorder {
    fn on_stream_closed(&self, stream_id: StreamId, reason: &StreamCloseReason) {
      self.closed.lock().unwrap().push((stream_id, reason.clone()));
    }
  }

  fn registry_with_limit(limit: u32) -> (StreamRegistry, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    let settings = ConnectionSettings::default().with_max_concurrent_streams(limit);
    let registry =
      StreamRegistry::new(ConnectionSide::Connect, settings, settings, recorder.clone())
        .expect("settings are valid");
    (registry, recorder)
  }

  #[test]
  fn ids_are_distinct_and_increasing_up_to_the_limit() {
    let (registry, _) = registry_with_limit(3);
    let ids: Vec<StreamId> = (0..3)
      .map(|_| registry.open_stream(StreamKind::Local).unwrap().id())
      .collect();
    assert_eq!(ids, vec![StreamId::new(1), StreamId::new(3), StreamId::new(5)]);
    assert!(matches!(
      registry.open_stream(StreamKind::Local),
      Err(StreamError::ConcurrencyLimitExceeded { limit: 3 })
    ));
  }

  #[test]
  fn released_slots_are_reused_without_reusing_ids() {
    let (registry, _) = registry_with_limit(2);
    let first = registry.open_stream(StreamKind::Local).unwrap();
    let second = registry.open_stream(StreamKind::Local).unwrap();
    assert_eq!((first.id().inner(), second.id().inner()), (1, 3));
    assert!(registry.open_stream(StreamKind::Local).is_err());
    assert!(registry.close_stream(first.id(), StreamCloseReason::Completed));
    let third = registry.open_stream(StreamKind::Local).unwrap();
    assert_eq!(third.id(), StreamId::new(5));
    let mut ids = registry.stream_ids();
    ids.sort();
    assert_eq!(ids, vec![StreamId::new(3), StreamId::new(5)]);
  }

  #[test]
  fn closing_twice_notifies_once() {
    let mut handler = MockStreamLifetimeHandler::new();
    handler.expect_on_stream_opened().return_const(());
    handler
      .expect_on_stream_closed()
      .with(predicate::eq(StreamId::new(1)), predicate::always())
      .times(1)
      .return_const(());
    let settings = ConnectionSettings::default();
    let registry =
      StreamRegistry::new(ConnectionSide::Connect, settings, settings, Arc::new(handler)).unwrap();
    let stream = registry.open_stream(StreamKind::Local).unwrap();
    assert!(registry.close_stream(stream.id(), StreamCloseReason::Cancelled));
    assert!(!registry.close_stream(stream.id(), StreamCloseReason::Cancelled));
    assert!(!stream.close(StreamCloseReason::Completed));
    assert!(registry.is_empty());
  }

  #[test]
  fn abort_notifies_every_stream_once() {
    let (registry, recorder) = registry_with_limit(10);
    let a = registry.open_stream(StreamKind::Local).unwrap();
    let b = registry.open_stream(StreamKind::Local).unwrap();
    assert_eq!(registry.abort(false), 2);
    assert!(registry.is_empty());
    let closed = recorder.closed();
    assert_eq!(closed.len(), 2);
    assert!(closed.iter().all(|(_, reason)| matches!(
      reason,
      StreamCloseReason::ConnectionAborted {
        remote_initiated: false
      }
    )));
    assert!(!a.close(StreamCloseReason::Completed));
    assert!(!b.close(StreamCloseReason::Completed));
    assert_eq!(registry.abort(false), 0);
    assert_eq!(recorder.closed().len(), 2);
    assert!(matches!(
      registry.open_stream(StreamKind::Local),
      Err(StreamError::ConnectionAborted)
    ));
  }

  #[test]
  fn rejected_settings_leave_prior_values_in_force() {
    let (registry, _) = registry_with_limit(4);
    let invalid = ConnectionSettings {
      initial_window_size: 1,
      ..ConnectionSettings::default().with_max_concurrent_streams(1)
    };
    assert!(matches!(
      registry.update_settings(invalid),
      Err(StreamError::InvalidSettingsValue(_))
    ));
    let stream = registry.open_stream(StreamKind::Local).unwrap();
    assert_eq!(stream.peer_settings().max_concurrent_streams, 4);
    assert_eq!(
      stream.peer_settings().initial_window_size,
      ConnectionSettings::default().initial_window_size
    );
  }

  #[test]
  fn settings_updates_reach_only_new_or_unused_streams() {
    let (registry, _) = registry_with_limit(4);
    let used = registry.open_stream(StreamKind::Local).unwrap();
    let unused = registry.open_stream(StreamKind::Local).unwrap();
    used.mark_used();
    registry
      .update_settings(ConnectionSettings::default().with_max_concurrent_streams(8))
      .unwrap();
    assert_eq!(used.peer_settings().max_concurrent_streams, 4);
    assert!(!used.refresh_peer_settings().unwrap());
    assert_eq!(used.peer_settings().max_concurrent_streams, 4);
    assert!(unused.refresh_peer_settings().unwrap());
    assert_eq!(unused.peer_settings().max_concurrent_streams, 8);
    let fresh = registry.open_stream(StreamKind::Local).unwrap();
    assert_eq!(fresh.peer_settings().max_concurrent_streams, 8);
  }

  #[test]
  fn remote_ids_must_belong_to_the_peer_and_advance() {
    let (registry, _) = registry_with_limit(4);
    assert!(matches!(
      registry.register_remote_stream(StreamId::new(3)),
      Err(StreamError::InvalidStreamId(_))
    ));
    assert!(matches!(
      registry.register_remote_stream(StreamId::CONTROL),
      Err(StreamError::InvalidStreamId(_))
    ));
    let context = registry.register_remote_stream(StreamId::new(4)).unwrap();
    assert_eq!(context.kind(), StreamKind::Remote);
    assert!(matches!(
      registry.register_remote_stream(StreamId::new(2)),
      Err(StreamError::InvalidStreamId(_))
    ));
    assert!(registry.register_remote_stream(StreamId::new(6)).is_ok());
  }

  #[test]
  fn local_and_remote_limits_are_independent() {
    let recorder = Arc::new(Recorder::default());
    let registry = StreamRegistry::new(
      ConnectionSide::Listen,
      ConnectionSettings::default().with_max_concurrent_streams(1),
      ConnectionSettings::default().with_max_concurrent_streams(2),
      recorder,
    )
    .unwrap();
    assert!(registry.register_remote_stream(StreamId::new(1)).is_ok());
    assert!(matches!(
      registry.register_remote_stream(StreamId::new(3)),
      Err(StreamError::ConcurrencyLimitExceeded { limit: 1 })
    ));
    assert_eq!(
      registry.open_stream(StreamKind::Local).unwrap().id(),
      StreamId::new(2)
    );
    assert!(registry.open_stream(StreamKind::Local).is_ok());
    assert!(registry.open_stream(StreamKind::Local).is_err());
  }

  #[tokio::test]
  async fn waiting_open_resumes_when_a_slot_is_released() {
    let (registry, _) = registry_with_limit(1);
    let first = registry.open_stream(StreamKind::Local).unwrap();
    let waiter = {
      let registry = registry.clone();
      tokio::spawn(async move {
        registry
          .open_stream_until(StreamKind::Local, &CancellationListener::default())
          .await
      })
    };
    tokio::task::yield_now().await;
    assert!(!waiter.is_finished());
    registry.close_stream(first.id(), StreamCloseReason::Completed);
    let opened = tokio::time::timeout(Duration::from_secs(5), waiter)
      .await
      .expect("waiter must be woken")
      .unwrap()
      .unwrap();
    assert_eq!(opened.id(), StreamId::new(3));
  }

  #[tokio::test]
  async fn waiting_open_honours_cancellation() {
    let (registry, _) = registry_with_limit(0);
    let token = tokio_util::sync::CancellationToken::new();
    token.cancel();
    let res = registry
      .open_stream_until(StreamKind::Local, &CancellationListener::from(token))
      .await;
    assert!(matches!(res, Err(StreamError::Cancelled)));
  }

  #[derive(Debug, Default)]
  struct TestSession {
    carrier_closed: Mutex<Option<StreamCloseReason>>,
  }

  impl ExtensionSession for TestSession {
    fn on_carrier_closed(&self, reason: &StreamCloseReason) {
      *self.carrier_closed.lock().unwrap() = Some(reason.clone());
    }
  }

  #[test]
  fn extension_sessions_are_released_on_close() {
    let recorder = Arc::new(Recorder::default());
    let settings = ConnectionSettings::default().with_extension_sessions(true);
    let registry =
      StreamRegistry::new(ConnectionSide::Connect, settings, settings, recorder).unwrap();
    let stream = registry.open_stream(StreamKind::Local).unwrap();
    let session = Arc::new(TestSession::default());
    stream.attach_extension_session(session.clone()).unwrap();
    assert!(matches!(
      stream.attach_extension_session(Arc::new(TestSession::default())),
      Err(StreamError::ExtensionSessionOccupied(_))
    ));
    let attached = stream.extension_session().expect("session attached");
    assert!(attached.downcast_arc::<TestSession>().is_ok());
    registry.close_stream(stream.id(), StreamCloseReason::Cancelled);
    assert!(stream.extension_session().is_none());
    assert!(matches!(
      *session.carrier_closed.lock().unwrap(),
      Some(StreamCloseReason::Cancelled)
    ));
  }

  #[test]
  fn extension_sessions_require_both_sides() {
    let (registry, _) = registry_with_limit(1);
    let stream = registry.open_stream(StreamKind::Local).unwrap();
    assert!(matches!(
      stream.attach_extension_session(Arc::new(TestSession::default())),
      Err(StreamError::ExtensionSessionsDisabled)
    ));
  }

  #[test]
  fn handlers_may_reenter_the_registry() {
    let registry_slot: Arc<Mutex<Option<StreamRegistry>>> = Arc::new(Mutex::new(None));
    let observed = Arc::new(Mutex::new(Vec::new()));
    let handler = {
      let registry_slot = Arc::clone(&registry_slot);
      let observed = Arc::clone(&observed);
      move |id: StreamId, _: &StreamCloseReason| {
        if let Some(registry) = registry_slot.lock().unwrap().as_ref() {
          observed.lock().unwrap().push((id, registry.len()));
        }
      }
    };
    let settings = ConnectionSettings::default();
    let registry =
      StreamRegistry::new(ConnectionSide::Connect, settings, settings, Arc::new(handler)).unwrap();
    *registry_slot.lock().unwrap() = Some(registry.clone());
    let stream = registry.open_stream(StreamKind::Local).unwrap();
    registry.close_stream(stream.id(), StreamCloseReason::Completed);
    assert_eq!(*observed.lock().unwrap(), vec![(stream.id(), 1)]);
    registry_slot.lock().unwrap().take();
  }
}
