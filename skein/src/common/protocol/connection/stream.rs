// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! The duplex channel protocol code sees for one multiplexed stream

use std::{
  io,
  pin::Pin,
  sync::Arc,
  task::{Context, Poll},
};

use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;

use crate::{
  common::protocol::stream::{
    StreamCloseReason, StreamContext, StreamEnd, StreamError, StreamId, StreamState,
  },
  util::{
    adapter::{self, DuplexStreamAdapter, ReadOptions, StreamTransform, WriteOptions},
    cancellation::CancellationListener,
    dropkick::Dropkick,
    duplex::{Channel, ChannelCompletion, DuplexChannel},
    scheduler::Deferred,
  },
};

type PipeChannel = Channel<Deferred<ReadHalf<DuplexStream>>, Deferred<WriteHalf<DuplexStream>>>;

/// One stream of a connection, presented as a [DuplexChannel]
///
/// Bytes written are sent to the peer as data frames; shutting down the output
/// finishes our direction. Reads yield the peer's data until it finishes its own.
/// Dropping the channel before its output completes cancels the stream.
pub struct StreamChannel {
  context: Arc<StreamContext>,
  channel: PipeChannel,
  abandon_input: Option<Dropkick<CancellationToken>>,
}

impl StreamChannel {
  pub(crate) fn new(
    context: Arc<StreamContext>,
    pipe: DuplexStream,
    abandon_input: CancellationToken,
  ) -> Self {
    let (input, output) = tokio::io::split(pipe);
    Self {
      context,
      channel: Channel::new(Deferred::new(input), Deferred::new(output)),
      abandon_input: Some(Dropkick::new(abandon_input)),
    }
  }

  pub fn id(&self) -> StreamId {
    self.context.id()
  }

  pub fn context(&self) -> &Arc<StreamContext> {
    &self.context
  }

  /// Abruptly terminates the stream in both directions, notifying the peer with `code`
  pub fn reset(&self, code: u32) -> bool {
    self.context.close(StreamCloseReason::Reset {
      remote_initiated: false,
      code,
    })
  }

  /// Layers `transform` over this stream
  ///
  /// On failure the stream is closed with [StreamCloseReason::TransformInitializationFailed].
  pub async fn wrap<F>(
    self,
    transform: F,
    read_options: ReadOptions,
    write_options: WriteOptions,
  ) -> Result<DuplexStreamAdapter<F::Output>, StreamError>
  where
    F: StreamTransform<adapter::ChannelStream<StreamChannel>>,
  {
    self
      .wrap_until(
        transform,
        read_options,
        write_options,
        &CancellationListener::default(),
      )
      .await
  }

  /// As [StreamChannel::wrap], abandoning initialization once `cancellation` fires
  ///
  /// A cancelled initialization closes the stream with [StreamCloseReason::Cancelled]
  /// and yields [StreamError::Cancelled].
  pub async fn wrap_until<F>(
    self,
    transform: F,
    read_options: ReadOptions,
    write_options: WriteOptions,
    cancellation: &CancellationListener,
  ) -> Result<DuplexStreamAdapter<F::Output>, StreamError>
  where
    F: StreamTransform<adapter::ChannelStream<StreamChannel>>,
  {
    let context = Arc::clone(&self.context);
    match adapter::wrap_until(self, transform, read_options, write_options, cancellation).await {
      Ok(adapter) => Ok(adapter),
      Err(failure) if failure.is_cancelled() && cancellation.is_cancelled() => {
        context.close(StreamCloseReason::Cancelled);
        drop(failure.upstream);
        Err(StreamError::Cancelled)
      }
      Err(failure) => {
        let source = Arc::new(failure.source);
        context.close(StreamCloseReason::TransformInitializationFailed(
          Arc::clone(&source),
        ));
        drop(failure.upstream);
        Err(StreamError::TransformInitializationFailed(source))
      }
    }
  }

  /// Reads fail once the stream has closed for any reason but completion
  fn check_readable(&self) -> io::Result<()> {
    match self.context.close_reason() {
      Some(reason) if !reason.is_completed() => Err(StreamError::StreamClosed(self.id()).into()),
      _ => Ok(()),
    }
  }

  fn check_writable(&self) -> io::Result<()> {
    match self.context.state() {
      StreamState::Closed | StreamState::HalfClosed(StreamEnd::Local) => {
        Err(StreamError::StreamClosed(self.id()).into())
      }
      _ => Ok(()),
    }
  }
}

impl std::fmt::Debug for StreamChannel {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("StreamChannel")
      .field("context", &self.context)
      .field("channel", &self.channel)
      .finish()
  }
}

impl AsyncRead for StreamChannel {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<io::Result<()>> {
    let this = self.get_mut();
    this.check_readable()?;
    this.context.mark_used();
    let filled_before = buf.filled().len();
    futures::ready!(Pin::new(&mut this.channel).poll_read(cx, buf))?;
    if buf.filled().len() == filled_before {
      // A reset ends the inbound pipe as well; report it rather than a clean end
      this.check_readable()?;
    }
    Poll::Ready(Ok(()))
  }
}

impl AsyncWrite for StreamChannel {
  fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
    let this = self.get_mut();
    this.check_writable()?;
    this.context.mark_used();
    Pin::new(&mut this.channel).poll_write(cx, buf)
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    Pin::new(&mut self.get_mut().channel).poll_flush(cx)
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    Pin::new(&mut self.get_mut().channel).poll_shutdown(cx)
  }
}

impl DuplexChannel for StreamChannel {
  fn complete_input(&mut self) {
    self.channel.complete_input();
    // Inbound data for this stream is discarded from now on
    self.abandon_input.take();
  }

  fn completion(&self) -> &ChannelCompletion {
    self.channel.completion()
  }
}

impl Drop for StreamChannel {
  fn drop(&mut self) {
    if !self.channel.completion().is_output_complete() && self.context.close(StreamCloseReason::Cancelled) {
      tracing::debug!(stream = %self.context.id(), "Stream channel dropped before finishing; cancelled");
    }
  }
}
