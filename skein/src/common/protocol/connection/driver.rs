// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Frame demultiplexing and the per-stream pumps behind [StreamChannel]s

use std::sync::{
  atomic::{AtomicU32, AtomicUsize, Ordering},
  Arc,
};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::{
  io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf},
  sync::{mpsc, watch, Semaphore},
};
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

use super::{stream::StreamChannel, ConnectionError, ConnectionId};
use crate::{
  common::{
    protocol::{
      frame::{read_frame, write_frame, Frame, FrameKind, FrameWriteError},
      stream::{
        reset_code, StreamCloseReason, StreamContext, StreamError, StreamId, StreamLifetimeHandler,
        StreamRegistry,
      },
    },
    settings::{ConnectionSettings, MAX_WINDOW_SIZE},
  },
  ext::future::FutureExtExt,
};

/// Frames queued for the writer before senders must wait
pub const OUTBOUND_QUEUE_DEPTH: usize = 256;
/// Peer-initiated streams awaiting [super::Connection::accept_stream] before new ones are refused
pub const INCOMING_BACKLOG: usize = 64;

enum Inbound {
  Data(Bytes),
  Finish,
}

struct StreamRoute {
  inbound: mpsc::UnboundedSender<Inbound>,
  /// Bytes received from the peer and not yet written into the stream's pipe
  queued: Arc<AtomicUsize>,
  /// Bytes the peer has allowed us to send
  credit: Arc<Semaphore>,
}

/// The most permissive limits ever advertised to the peer
///
/// The peer may still be acting on an earlier SETTINGS frame when a later one lowers a
/// limit, so inbound frames are held to the largest value we have announced.
pub(crate) struct AdvertisedLimits {
  max_frame_size: AtomicU32,
  initial_window_size: AtomicU32,
}

impl AdvertisedLimits {
  pub(crate) fn new(settings: &ConnectionSettings) -> Self {
    Self {
      max_frame_size: AtomicU32::new(settings.max_frame_size),
      initial_window_size: AtomicU32::new(settings.initial_window_size),
    }
  }

  pub(crate) fn record(&self, settings: &ConnectionSettings) {
    self
      .max_frame_size
      .fetch_max(settings.max_frame_size, Ordering::AcqRel);
    self
      .initial_window_size
      .fetch_max(settings.initial_window_size, Ordering::AcqRel);
  }

  pub(crate) fn max_frame_size(&self) -> u32 {
    self.max_frame_size.load(Ordering::Acquire)
  }

  pub(crate) fn initial_window_size(&self) -> u32 {
    self.initial_window_size.load(Ordering::Acquire)
  }
}

/// The connection's stream lifetime handler
///
/// Tears down a stream's route when it closes and tells the peer about local resets.
/// An optional observer receives every notification afterwards.
pub(crate) struct ConnectionLifetime {
  connection: ConnectionId,
  routes: DashMap<StreamId, StreamRoute>,
  outbound: mpsc::Sender<Frame>,
  observer: Option<Arc<dyn StreamLifetimeHandler>>,
}

impl ConnectionLifetime {
  pub(crate) fn new(
    connection: ConnectionId,
    outbound: mpsc::Sender<Frame>,
    observer: Option<Arc<dyn StreamLifetimeHandler>>,
  ) -> Self {
    Self {
      connection,
      routes: DashMap::new(),
      outbound,
      observer,
    }
  }

  fn send_reset(&self, stream_id: StreamId, code: u32) {
    match self.outbound.try_send(Frame::reset(stream_id, code)) {
      Ok(()) => {}
      Err(mpsc::error::TrySendError::Full(frame)) => {
        let outbound = self.outbound.clone();
        match tokio::runtime::Handle::try_current() {
          Ok(handle) => {
            handle.spawn(async move {
              let _ = outbound.send(frame).await;
            });
          }
          Err(_) => {
            tracing::warn!(stream = %stream_id, code, "Frame queue full outside a runtime; reset not sent")
          }
        }
      }
      Err(mpsc::error::TrySendError::Closed(_)) => {
        tracing::trace!(stream = %stream_id, "Connection writer has stopped; reset not sent");
      }
    }
  }
}

impl StreamLifetimeHandler for ConnectionLifetime {
  fn on_stream_closed(&self, stream_id: StreamId, reason: &StreamCloseReason) {
    self.routes.remove(&stream_id);
    if let Some(code) = reason.local_reset_code() {
      self.send_reset(stream_id, code);
    }
    if let Some(observer) = &self.observer {
      observer.on_stream_closed(stream_id, reason);
    }
  }

  fn on_stream_opened(&self, context: &Arc<StreamContext>) {
    if let Some(observer) = &self.observer {
      observer.on_stream_opened(context);
    }
  }
}

/// Builds the channel for a newly registered stream and starts its pumps
pub(crate) fn attach_stream(
  context: Arc<StreamContext>,
  lifetime: &ConnectionLifetime,
) -> StreamChannel {
  let stream_id = context.id();
  let buffer_size = context.local_settings().stream_buffer_size as usize;
  let (user_end, pump_end) = tokio::io::duplex(buffer_size);
  let (inbound_sender, inbound) = mpsc::unbounded_channel();
  let queued = Arc::new(AtomicUsize::new(0));
  let credit = Arc::new(Semaphore::new(0));
  lifetime.routes.insert(
    stream_id,
    StreamRoute {
      inbound: inbound_sender,
      queued: Arc::clone(&queued),
      credit: Arc::clone(&credit),
    },
  );
  if context.is_closed() {
    // Closed before the route existed; its removal already happened
    lifetime.routes.remove(&stream_id);
  }

  let closed = CancellationToken::new();
  {
    let closed = closed.clone();
    context.on_release(move || closed.cancel());
  }
  let abandon_input = CancellationToken::new();

  let (pump_input, pump_output) = tokio::io::split(pump_end);
  let span = tracing::debug_span!("stream_pump", connection = %lifetime.connection, stream = %stream_id);
  let returns = CreditReturn {
    stream_id,
    queued,
    outbound: lifetime.outbound.clone(),
    pending: 0,
    threshold: (context.local_settings().initial_window_size / 2).max(1),
  };
  tokio::spawn(
    deliver_inbound(
      Arc::clone(&context),
      inbound,
      pump_output,
      returns,
      abandon_input.clone(),
    )
    .instrument(span.clone()),
  );
  tokio::spawn(
    forward_outbound(
      Arc::clone(&context),
      pump_input,
      lifetime.outbound.clone(),
      credit,
      closed,
    )
    .instrument(span),
  );
  StreamChannel::new(context, user_end, abandon_input)
}

/// Hands send credit back to the peer as its data leaves the route
struct CreditReturn {
  stream_id: StreamId,
  queued: Arc<AtomicUsize>,
  outbound: mpsc::Sender<Frame>,
  pending: usize,
  threshold: u32,
}

impl CreditReturn {
  async fn consumed(&mut self, bytes: usize) {
    let remaining = self
      .queued
      .fetch_sub(bytes, Ordering::AcqRel)
      .saturating_sub(bytes);
    self.pending += bytes;
    // An idle route flushes so a sender waiting on its last credit is never stranded
    if self.pending >= self.threshold as usize || (remaining == 0 && self.pending > 0) {
      let increment = std::mem::take(&mut self.pending);
      let frame = Frame::window_update(self.stream_id, increment as u32);
      if self.outbound.send(frame).await.is_err() {
        tracing::trace!("Connection writer has stopped; window update not sent");
      }
    }
  }
}

async fn discard_until_finished(
  inbound: &mut mpsc::UnboundedReceiver<Inbound>,
  returns: &mut CreditReturn,
) -> bool {
  while let Some(item) = inbound.recv().await {
    match item {
      Inbound::Data(bytes) => returns.consumed(bytes.len()).await,
      Inbound::Finish => return true,
    }
  }
  false
}

/// Moves peer data into the stream's pipe until the peer finishes or the stream closes
async fn deliver_inbound(
  context: Arc<StreamContext>,
  mut inbound: mpsc::UnboundedReceiver<Inbound>,
  mut pipe: WriteHalf<DuplexStream>,
  mut returns: CreditReturn,
  abandon: CancellationToken,
) {
  let delivered = async {
    while let Some(item) = inbound.recv().await {
      match item {
        Inbound::Data(bytes) => {
          pipe.write_all(&bytes).await?;
          returns.consumed(bytes.len()).await;
        }
        Inbound::Finish => return Ok(true),
      }
    }
    Ok::<_, std::io::Error>(false)
  }
  .poll_until(abandon.cancelled())
  .await;
  let finished = match delivered {
    Some(Ok(finished)) => finished,
    Some(Err(error)) => {
      tracing::trace!(?error, "Stream reader is gone; discarding inbound data");
      discard_until_finished(&mut inbound, &mut returns).await
    }
    None => {
      tracing::trace!("Stream input abandoned; discarding inbound data");
      discard_until_finished(&mut inbound, &mut returns).await
    }
  };
  let _ = pipe.shutdown().await;
  if finished {
    if let Err(error) = context.finish_remote() {
      tracing::trace!(%error, "Peer finished a stream which had already closed");
    }
  }
}

/// Takes up to `wanted` bytes of send credit, waiting until at least one is available
async fn take_credit(credit: &Semaphore, wanted: usize) -> Option<usize> {
  credit.acquire().await.ok()?.forget();
  // The pump is the only consumer, so permits seen here stay available
  let extra = credit.available_permits().min(wanted.saturating_sub(1));
  if extra == 0 {
    return Some(1);
  }
  match credit.try_acquire_many(extra as u32) {
    Ok(permits) => {
      permits.forget();
      Some(extra + 1)
    }
    Err(_) => Some(1),
  }
}

/// Moves bytes written to the stream into data frames, finishing the stream on end-of-input
///
/// Data is only sent against credit granted by the peer: the initial window from its
/// settings plus every WINDOW_UPDATE since. Frames are cut to the peer's current maximum.
async fn forward_outbound(
  context: Arc<StreamContext>,
  mut pipe: ReadHalf<DuplexStream>,
  outbound: mpsc::Sender<Frame>,
  credit: Arc<Semaphore>,
  closed: CancellationToken,
) {
  let stream_id = context.id();
  let forwarded = async {
    let mut chunk = vec![0u8; context.local_settings().stream_buffer_size as usize];
    let mut window_granted = false;
    loop {
      let read = pipe.read(&mut chunk).await?;
      if read == 0 {
        break;
      }
      if !window_granted {
        // Writing froze the stream's view of the peer settings; its window applies from here
        credit.add_permits(context.peer_settings().initial_window_size as usize);
        window_granted = true;
      }
      let mut sent = 0;
      while sent < read {
        let max_frame_size = context.connection_peer_settings().max_frame_size as usize;
        let piece = match take_credit(&credit, (read - sent).min(max_frame_size)).await {
          Some(piece) => piece,
          None => return Ok(false),
        };
        let frame = Frame::data(stream_id, Bytes::copy_from_slice(&chunk[sent..sent + piece]));
        if outbound.send(frame).await.is_err() {
          return Ok(false);
        }
        sent += piece;
      }
    }
    Ok::<_, std::io::Error>(outbound.send(Frame::finish(stream_id)).await.is_ok())
  }
  .poll_until(closed.cancelled())
  .await;
  match forwarded {
    Some(Ok(true)) => {
      if let Err(error) = context.finish_local() {
        tracing::trace!(%error, "Stream closed while finishing");
      }
    }
    Some(Ok(false)) => tracing::trace!("Connection writer has stopped"),
    Some(Err(error)) => {
      tracing::warn!(?error, "Stream output failed; resetting");
      context.close(StreamCloseReason::Reset {
        remote_initiated: false,
        code: reset_code::INTERNAL_ERROR,
      });
    }
    None => tracing::trace!("Stream closed; outbound pump stopped"),
  }
}

pub(crate) struct DriverState {
  pub(crate) connection: ConnectionId,
  pub(crate) registry: StreamRegistry,
  pub(crate) lifetime: Arc<ConnectionLifetime>,
  pub(crate) incoming: mpsc::Sender<StreamChannel>,
  pub(crate) limits: Arc<AdvertisedLimits>,
}

enum ReadOutcome {
  EndOfStream,
  GoAway,
}

impl DriverState {
  async fn read_loop<R: AsyncRead + Unpin>(&self, mut reader: R) -> Result<ReadOutcome, ConnectionError> {
    loop {
      let frame = match read_frame(&mut reader, self.limits.max_frame_size()).await? {
        Some(frame) => frame,
        None => return Ok(ReadOutcome::EndOfStream),
      };
      match frame.kind {
        FrameKind::Settings => match frame.decode_settings() {
          Ok(settings) => match self.registry.update_settings(settings) {
            Ok(()) => self.refresh_unused_streams(),
            Err(error) => tracing::warn!(%error, "Ignoring out-of-range settings from peer"),
          },
          Err(error) => tracing::warn!(%error, "Ignoring undecodable settings from peer"),
        },
        FrameKind::Open => self.accept_remote(frame.stream_id)?,
        FrameKind::Data => self.route_data(frame.stream_id, frame.payload),
        FrameKind::Finish => self.route(frame.stream_id, Inbound::Finish),
        FrameKind::Reset => {
          let code = frame.reset_code().unwrap_or(reset_code::INTERNAL_ERROR);
          self.registry.close_stream(
            frame.stream_id,
            StreamCloseReason::Reset {
              remote_initiated: true,
              code,
            },
          );
        }
        FrameKind::GoAway => return Ok(ReadOutcome::GoAway),
        FrameKind::WindowUpdate => {
          let increment = frame.window_increment().unwrap_or(0);
          self.grant_credit(frame.stream_id, increment);
        }
      }
    }
  }

  /// Streams without I/O yet adopt the peer's newest settings
  fn refresh_unused_streams(&self) {
    for stream_id in self.registry.stream_ids() {
      if let Some(context) = self.registry.get(stream_id) {
        if let Ok(true) = context.refresh_peer_settings() {
          tracing::trace!(stream = %stream_id, "Stream adopted updated peer settings");
        }
      }
    }
  }

  fn route(&self, stream_id: StreamId, item: Inbound) {
    match self.routes_get(stream_id) {
      Some((sender, _, _)) => {
        let _ = sender.send(item);
      }
      None => tracing::trace!(stream = %stream_id, "Frame for a stream with no route; discarded"),
    }
  }

  fn route_data(&self, stream_id: StreamId, payload: Bytes) {
    let (sender, queued, _) = match self.routes_get(stream_id) {
      Some(route) => route,
      None => {
        tracing::trace!(stream = %stream_id, "Data for a stream with no route; discarded");
        return;
      }
    };
    let window = self.limits.initial_window_size() as usize;
    let total = queued.fetch_add(payload.len(), Ordering::AcqRel) + payload.len();
    if total > window {
      tracing::warn!(stream = %stream_id, queued = total, window, "Peer overran the stream window");
      self.reset_flow_control(stream_id);
      return;
    }
    let _ = sender.send(Inbound::Data(payload));
  }

  fn grant_credit(&self, stream_id: StreamId, increment: u32) {
    let credit = match self.routes_get(stream_id) {
      Some((_, _, credit)) => credit,
      None => {
        tracing::trace!(stream = %stream_id, "Window update for a stream with no route; discarded");
        return;
      }
    };
    let available = credit.available_permits() + increment as usize;
    if available > MAX_WINDOW_SIZE as usize {
      tracing::warn!(stream = %stream_id, available, "Peer granted credit beyond the largest window");
      self.reset_flow_control(stream_id);
      return;
    }
    credit.add_permits(increment as usize);
  }

  fn reset_flow_control(&self, stream_id: StreamId) {
    self.registry.close_stream(
      stream_id,
      StreamCloseReason::Reset {
        remote_initiated: false,
        code: reset_code::FLOW_CONTROL_ERROR,
      },
    );
  }

  /// Clones out of the route table so no shard lock is held while closing streams
  fn routes_get(
    &self,
    stream_id: StreamId,
  ) -> Option<(mpsc::UnboundedSender<Inbound>, Arc<AtomicUsize>, Arc<Semaphore>)> {
    self.lifetime.routes.get(&stream_id).map(|route| {
      (
        route.inbound.clone(),
        Arc::clone(&route.queued),
        Arc::clone(&route.credit),
      )
    })
  }

  /// Registers a peer-opened stream without waiting on the writer
  fn accept_remote(&self, stream_id: StreamId) -> Result<(), ConnectionError> {
    match self.registry.register_remote_stream(stream_id) {
      Ok(context) => {
        let channel = attach_stream(context, &self.lifetime);
        match self.incoming.try_send(channel) {
          Ok(()) => {}
          Err(mpsc::error::TrySendError::Full(channel) | mpsc::error::TrySendError::Closed(channel)) => {
            tracing::debug!(stream = %stream_id, "Incoming stream backlog unavailable; refusing");
            channel.reset(reset_code::REFUSED_STREAM);
          }
        }
        Ok(())
      }
      Err(StreamError::ConcurrencyLimitExceeded { limit }) => {
        tracing::debug!(stream = %stream_id, limit, "Refusing stream over the concurrency limit");
        self.lifetime.send_reset(stream_id, reset_code::REFUSED_STREAM);
        Ok(())
      }
      Err(StreamError::InvalidStreamId(id)) => Err(ConnectionError::ProtocolViolation(format!(
        "peer opened stream {} outside its identifier space or out of order",
        id
      ))),
      Err(StreamError::ConnectionAborted) => Err(ConnectionError::Aborted),
      Err(error) => {
        tracing::warn!(stream = %stream_id, %error, "Failed registering peer stream");
        self.lifetime.send_reset(stream_id, reset_code::INTERNAL_ERROR);
        Ok(())
      }
    }
  }
}

async fn write_batch<W: AsyncWrite + Unpin>(
  writer: &mut W,
  first: Frame,
  queue: &mut mpsc::Receiver<Frame>,
) -> Result<(), FrameWriteError> {
  write_frame(&mut *writer, &first).await?;
  while let Ok(frame) = queue.try_recv() {
    write_frame(&mut *writer, &frame).await?;
  }
  writer.flush().await?;
  Ok(())
}

async fn write_loop<W: AsyncWrite + Unpin>(
  mut writer: W,
  mut queue: mpsc::Receiver<Frame>,
  shutdown: &CancellationToken,
) -> Result<(), FrameWriteError> {
  loop {
    let next = tokio::select! {
      biased;
      frame = queue.recv() => frame,
      _ = shutdown.cancelled() => None,
    };
    match next {
      Some(frame) => write_batch(&mut writer, frame, &mut queue).await?,
      None => break,
    }
  }
  queue.close();
  while let Ok(frame) = queue.try_recv() {
    write_frame(&mut writer, &frame).await?;
  }
  writer.flush().await?;
  writer.shutdown().await?;
  Ok(())
}

/// Runs the connection's reader and writer until either stops, then aborts the registry
pub(crate) fn spawn_driver<R, W>(
  state: DriverState,
  reader: R,
  writer: W,
  queue: mpsc::Receiver<Frame>,
  shutdown: CancellationToken,
  exited: watch::Sender<bool>,
) where
  R: AsyncRead + Send + Unpin + 'static,
  W: AsyncWrite + Send + Unpin + 'static,
{
  let span = tracing::debug_span!("connection_driver", connection = %state.connection);
  tokio::spawn(
    async move {
      let read = async {
        let outcome = state.read_loop(reader).poll_until(shutdown.cancelled()).await;
        let remote_initiated = match outcome {
          None => {
            tracing::debug!("Connection shut down locally");
            false
          }
          Some(Ok(ReadOutcome::EndOfStream)) => {
            tracing::debug!("Peer closed the transport");
            true
          }
          Some(Ok(ReadOutcome::GoAway)) => {
            tracing::debug!("Peer sent GOAWAY");
            true
          }
          Some(Err(error)) => {
            tracing::warn!(%error, "Connection read failed");
            false
          }
        };
        state.registry.abort(remote_initiated);
        shutdown.cancel();
      };
      let write = async {
        if let Err(error) = write_loop(writer, queue, &shutdown).await {
          tracing::debug!(%error, "Connection write failed");
        }
        shutdown.cancel();
      };
      tokio::join!(read, write);
      drop(state);
      let _ = exited.send(true);
      tracing::debug!("Connection driver exited");
    }
    .instrument(span),
  );
}
