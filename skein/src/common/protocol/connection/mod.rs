// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! A multiplexed connection over one duplex channel
//!
//! Establishment exchanges the connection preface and both sides' settings, after
//! which a driver task demultiplexes frames into the connection's streams.

use std::sync::Arc;

use tokio::{
  io::AsyncWriteExt,
  sync::{mpsc, watch, Mutex},
};
use tokio_util::sync::CancellationToken;

use crate::{
  common::{
    protocol::{
      frame::{read_frame, write_frame, Frame, FrameKind, FrameReadError, FrameWriteError},
      negotiation::{exchange_preface, NegotiationError, ProtocolVersion, ProtocolVersions},
      stream::{
        StreamCloseReason, StreamContext, StreamError, StreamId, StreamKind,
        StreamLifetimeHandler, StreamRegistry,
      },
    },
    settings::{ConnectionSettings, SettingsError},
    transport::TransportInfo,
  },
  util::{
    adapter::{ChannelStream, ReadOptions, WriteOptions},
    cancellation::CancellationListener,
    dropkick::Dropkick,
    duplex::DuplexChannel,
  },
};

mod driver;
pub mod id;
pub mod stream;

pub use driver::{INCOMING_BACKLOG, OUTBOUND_QUEUE_DEPTH};
pub use id::ConnectionId;
pub use stream::StreamChannel;

use driver::{AdvertisedLimits, ConnectionLifetime, DriverState};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ConnectionSide {
  /// The side which initiated the transport
  Connect,
  Listen,
}

impl ConnectionSide {
  pub fn opposite(&self) -> Self {
    match self {
      ConnectionSide::Connect => ConnectionSide::Listen,
      ConnectionSide::Listen => ConnectionSide::Connect,
    }
  }
}

/// How transports are layered and negotiated into connections
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionOptions {
  pub settings: ConnectionSettings,
  pub read_options: ReadOptions,
  pub write_options: WriteOptions,
}

#[derive(thiserror::Error, Debug)]
pub enum ConnectionError {
  #[error(transparent)]
  Negotiation(#[from] NegotiationError),
  #[error("Invalid connection settings: {0}")]
  Settings(#[from] SettingsError),
  #[error(transparent)]
  FrameRead(#[from] FrameReadError),
  #[error(transparent)]
  FrameWrite(#[from] FrameWriteError),
  #[error("Protocol violation: {0}")]
  ProtocolViolation(String),
  #[error("Connection aborted")]
  Aborted,
}

struct ConnectionShared {
  id: ConnectionId,
  side: ConnectionSide,
  version: ProtocolVersion,
  transport: TransportInfo,
  registry: StreamRegistry,
  lifetime: Arc<ConnectionLifetime>,
  limits: Arc<AdvertisedLimits>,
  outbound: mpsc::Sender<Frame>,
  incoming: Mutex<mpsc::Receiver<StreamChannel>>,
  shutdown: CancellationToken,
  driver_exited: watch::Receiver<bool>,
}

/// Handle to an established connection; clones share the connection
///
/// The connection shuts down once every handle has been dropped. Streams opened
/// from it remain usable until then.
#[derive(Clone)]
pub struct Connection {
  shared: Arc<ConnectionShared>,
  _guard: Arc<Dropkick<CancellationToken>>,
}

impl Connection {
  /// Negotiates a connection over `channel` and starts driving it
  pub async fn establish<C>(
    channel: C,
    side: ConnectionSide,
    settings: ConnectionSettings,
    transport: TransportInfo,
  ) -> Result<Connection, ConnectionError>
  where
    C: DuplexChannel + 'static,
  {
    Self::establish_with_observer(channel, side, settings, transport, None).await
  }

  /// As [Connection::establish], additionally notifying `observer` of stream lifetimes
  #[tracing::instrument(level = "debug", skip(channel, settings, observer), fields(remote = %transport.remote), err)]
  pub async fn establish_with_observer<C>(
    channel: C,
    side: ConnectionSide,
    settings: ConnectionSettings,
    transport: TransportInfo,
    observer: Option<Arc<dyn StreamLifetimeHandler>>,
  ) -> Result<Connection, ConnectionError>
  where
    C: DuplexChannel + 'static,
  {
    settings.validate()?;
    let mut link = ChannelStream::new(channel);
    let version = exchange_preface(&mut link, ProtocolVersions::supported()).await?;
    write_frame(&mut link, &Frame::settings(&settings)?).await?;
    link.flush().await.map_err(FrameWriteError::from)?;

    let peer_settings = match read_frame(&mut link, settings.max_frame_size).await? {
      Some(frame) if frame.kind == FrameKind::Settings => frame.decode_settings()?,
      Some(_) => {
        return Err(ConnectionError::ProtocolViolation(
          "first frame was not SETTINGS".into(),
        ))
      }
      None => {
        return Err(ConnectionError::ProtocolViolation(
          "transport closed before SETTINGS".into(),
        ))
      }
    };
    peer_settings.validate()?;

    let id = id::next_connection_id();
    let (outbound, queue) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
    let (incoming_sender, incoming) = mpsc::channel(INCOMING_BACKLOG);
    let lifetime = Arc::new(ConnectionLifetime::new(id, outbound.clone(), observer));
    let registry = StreamRegistry::new(
      side,
      settings,
      peer_settings,
      Arc::clone(&lifetime) as Arc<dyn StreamLifetimeHandler>,
    )?;
    let limits = Arc::new(AdvertisedLimits::new(&settings));
    let shutdown = CancellationToken::new();
    let (exited, driver_exited) = watch::channel(false);
    let (reader, writer) = tokio::io::split(link);
    driver::spawn_driver(
      DriverState {
        connection: id,
        registry: registry.clone(),
        lifetime: Arc::clone(&lifetime),
        incoming: incoming_sender,
        limits: Arc::clone(&limits),
      },
      reader,
      writer,
      queue,
      shutdown.clone(),
      exited,
    );
    tracing::debug!(connection = %id, ?side, ?version, "Connection established");
    Ok(Connection {
      _guard: Arc::new(Dropkick::new(shutdown.clone())),
      shared: Arc::new(ConnectionShared {
        id,
        side,
        version,
        transport,
        registry,
        lifetime,
        limits,
        outbound,
        incoming: Mutex::new(incoming),
        shutdown,
        driver_exited,
      }),
    })
  }

  pub fn id(&self) -> ConnectionId {
    self.shared.id
  }

  pub fn side(&self) -> ConnectionSide {
    self.shared.side
  }

  pub fn version(&self) -> ProtocolVersion {
    self.shared.version
  }

  pub fn transport(&self) -> &TransportInfo {
    &self.shared.transport
  }

  pub fn registry(&self) -> &StreamRegistry {
    &self.shared.registry
  }

  pub fn local_settings(&self) -> Arc<ConnectionSettings> {
    self.shared.registry.local_settings()
  }

  pub fn peer_settings(&self) -> Arc<ConnectionSettings> {
    self.shared.registry.peer_settings()
  }

  async fn start_local(&self, context: Arc<StreamContext>) -> Result<StreamChannel, StreamError> {
    let stream_id = context.id();
    let channel = driver::attach_stream(context, &self.shared.lifetime);
    if self.shared.outbound.send(Frame::open(stream_id)).await.is_err() {
      channel.context().close(StreamCloseReason::ConnectionAborted {
        remote_initiated: false,
      });
      return Err(StreamError::ConnectionAborted);
    }
    Ok(channel)
  }

  /// Opens a stream to the peer, failing when the peer's concurrency limit is reached
  pub async fn open_stream(&self) -> Result<StreamChannel, StreamError> {
    let context = self.shared.registry.open_stream(StreamKind::Local)?;
    self.start_local(context).await
  }

  /// Opens a stream to the peer, waiting for a slot if the limit is reached
  pub async fn open_stream_until(
    &self,
    cancellation: &CancellationListener,
  ) -> Result<StreamChannel, StreamError> {
    let context = self
      .shared
      .registry
      .open_stream_until(StreamKind::Local, cancellation)
      .await?;
    self.start_local(context).await
  }

  /// Waits for the next stream opened by the peer; `None` once the connection has closed
  pub async fn accept_stream(&self) -> Option<StreamChannel> {
    self.shared.incoming.lock().await.recv().await
  }

  pub fn close_stream(&self, id: StreamId, reason: StreamCloseReason) -> bool {
    self.shared.registry.close_stream(id, reason)
  }

  /// Applies new local settings and advertises them to the peer
  ///
  /// Streams which already exist keep the settings they were created with. Inbound
  /// frames stay acceptable up to the largest frame size ever advertised.
  pub async fn advertise_settings(&self, settings: ConnectionSettings) -> Result<(), ConnectionError> {
    self
      .shared
      .registry
      .update_local_settings(settings)
      .map_err(|error| match error {
        StreamError::InvalidSettingsValue(error) => ConnectionError::Settings(error),
        _ => ConnectionError::Aborted,
      })?;
    let frame = Frame::settings(&settings)?;
    self.shared.limits.record(&settings);
    self
      .shared
      .outbound
      .send(frame)
      .await
      .map_err(|_| ConnectionError::Aborted)
  }

  /// Closes every stream with [StreamCloseReason::ConnectionAborted] and shuts the connection down
  ///
  /// Returns the number of streams closed by this call.
  pub fn abort(&self) -> usize {
    let closed = self.shared.registry.abort(false);
    if !self.shared.shutdown.is_cancelled() {
      // Queued ahead of shutdown; the writer drains its queue before closing
      if let Err(error) = self.shared.outbound.try_send(Frame::go_away()) {
        tracing::trace!(connection = %self.shared.id, %error, "GOAWAY not queued");
      }
    }
    self.shared.shutdown.cancel();
    tracing::debug!(connection = %self.shared.id, closed, "Connection aborted locally");
    closed
  }

  pub fn is_closed(&self) -> bool {
    *self.shared.driver_exited.borrow()
  }

  /// Resolves once the transport is closed and every stream has reached a terminal state
  pub async fn closed(&self) {
    let mut exited = self.shared.driver_exited.clone();
    while !*exited.borrow() {
      if exited.changed().await.is_err() {
        break;
      }
    }
  }
}

impl std::fmt::Debug for Connection {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Connection")
      .field("id", &self.shared.id)
      .field("side", &self.shared.side)
      .field("transport", &self.shared.transport)
      .field("registry", &self.shared.registry)
      .finish_non_exhaustive()
  }
}
