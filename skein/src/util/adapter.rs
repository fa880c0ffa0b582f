// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Presents a [DuplexChannel] as a conventional stream to a transforming layer,
//! and the transformed stream as a [DuplexChannel] again.
//!
//! Any byte transform that consumes and produces an ordinary stream (TLS, compression,
//! framing) can be layered over a channel this way, without the channel's owner or the
//! transform knowing about one another.

use std::{
  io,
  pin::Pin,
  task::{Context, Poll},
};

use futures::{future::BoxFuture, Future, FutureExt};
use tokio::{
  io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, ReadBuf, ReadHalf, WriteHalf},
  sync::oneshot,
};

use super::{
  cancellation::CancellationListener,
  dropkick::Dropkick,
  duplex::{Channel, ChannelCompletion, DuplexChannel},
};
use crate::ext::future::FutureExtExt;

pub const DEFAULT_BUFFER_SIZE: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOptions {
  pub buffer_size: usize,
}

impl Default for ReadOptions {
  fn default() -> Self {
    Self {
      buffer_size: DEFAULT_BUFFER_SIZE,
    }
  }
}

/// Buffering applied to writes through an adapter
///
/// Buffered bytes are forced out before the next write once at least
/// `flush_threshold` bytes are pending, and on every explicit flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOptions {
  pub buffer_size: usize,
  pub flush_threshold: usize,
}

impl Default for WriteOptions {
  fn default() -> Self {
    Self {
      buffer_size: DEFAULT_BUFFER_SIZE,
      flush_threshold: DEFAULT_BUFFER_SIZE,
    }
  }
}

/// A conventional stream view over a [DuplexChannel]
///
/// Reads consume the channel's input; shutdown completes its output. When the view
/// is dropped, the channel is handed back to whoever holds the matching receiver
/// from [ChannelStream::with_return], or dropped if there is none.
pub struct ChannelStream<C> {
  channel: Dropkick<(C, oneshot::Sender<C>)>,
}

impl<C: DuplexChannel> ChannelStream<C> {
  pub fn new(channel: C) -> Self {
    Self::with_return(channel).0
  }

  /// Builds a view whose channel returns through the receiver when the view drops
  pub fn with_return(channel: C) -> (Self, oneshot::Receiver<C>) {
    let (sender, receiver) = oneshot::channel();
    (
      Self {
        channel: Dropkick::new((channel, sender)),
      },
      receiver,
    )
  }

  pub fn get_ref(&self) -> Option<&C> {
    self.channel.get().map(|(channel, _)| channel)
  }

  /// Recovers the channel without sending it to the return receiver
  pub fn into_inner(self) -> Option<C> {
    self.channel.counter_take().map(|(channel, _)| channel)
  }

  fn channel_pin(self: Pin<&mut Self>) -> io::Result<Pin<&mut C>> {
    match self.get_mut().channel.get_mut() {
      Some((channel, _)) => Ok(Pin::new(channel)),
      None => Err(io::Error::new(
        io::ErrorKind::NotConnected,
        "Channel was detached from its stream view",
      )),
    }
  }
}

impl<C> std::fmt::Debug for ChannelStream<C> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ChannelStream").finish_non_exhaustive()
  }
}

impl<C: DuplexChannel> AsyncRead for ChannelStream<C> {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<io::Result<()>> {
    self.channel_pin()?.poll_read(cx, buf)
  }
}

impl<C: DuplexChannel> AsyncWrite for ChannelStream<C> {
  fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
    self.channel_pin()?.poll_write(cx, buf)
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    self.channel_pin()?.poll_flush(cx)
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    self.channel_pin()?.poll_shutdown(cx)
  }
}

/// A byte transform which converts one stream into another, such as a TLS handshake
///
/// Initialization may perform I/O on the provided stream before yielding the
/// transformed one. Closures returning such a future implement this trait.
pub trait StreamTransform<S>: Send {
  type Output: AsyncRead + AsyncWrite + Send + 'static;

  fn transform(self, stream: S) -> BoxFuture<'static, io::Result<Self::Output>>;
}

impl<S, F, Fut, O> StreamTransform<S> for F
where
  F: FnOnce(S) -> Fut + Send,
  Fut: Future<Output = io::Result<O>> + Send + 'static,
  O: AsyncRead + AsyncWrite + Send + 'static,
{
  type Output = O;

  fn transform(self, stream: S) -> BoxFuture<'static, io::Result<Self::Output>> {
    (self)(stream).boxed()
  }
}

/// A transform which passes the stream through unchanged
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityTransform;

impl<S> StreamTransform<S> for IdentityTransform
where
  S: AsyncRead + AsyncWrite + Send + 'static,
{
  type Output = S;

  fn transform(self, stream: S) -> BoxFuture<'static, io::Result<Self::Output>> {
    futures::future::ready(Ok(stream)).boxed()
  }
}

pin_project_lite::pin_project! {
  /// A buffered writer which drains its buffer before accepting more bytes once
  /// `threshold` bytes are pending
  #[derive(Debug)]
  pub struct ThresholdWriter<W> {
    #[pin]
    inner: BufWriter<W>,
    threshold: usize,
  }
}

impl<W: AsyncWrite> ThresholdWriter<W> {
  pub fn new(inner: W, options: WriteOptions) -> Self {
    Self {
      inner: BufWriter::with_capacity(options.buffer_size.max(1), inner),
      threshold: options.flush_threshold.max(1),
    }
  }

  pub fn buffered(&self) -> usize {
    self.inner.buffer().len()
  }
}

impl<W: AsyncWrite> AsyncWrite for ThresholdWriter<W> {
  fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
    let mut this = self.project();
    if this.inner.buffer().len() >= *this.threshold {
      futures::ready!(this.inner.as_mut().poll_flush(cx))?;
    }
    this.inner.poll_write(cx, buf)
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    self.project().inner.poll_flush(cx)
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    self.project().inner.poll_shutdown(cx)
  }
}

type AdapterChannel<T> = Channel<BufReader<ReadHalf<T>>, ThresholdWriter<WriteHalf<T>>>;

/// A transformed stream presented as a [DuplexChannel]
///
/// Owns the transformed stream, which in turn owns the view of the upstream channel.
/// Teardown therefore releases the transform first, then the view, then the upstream.
pub struct DuplexStreamAdapter<T> {
  channel: AdapterChannel<T>,
}

impl<T> DuplexStreamAdapter<T>
where
  T: AsyncRead + AsyncWrite + Send + 'static,
{
  fn new(transformed: T, read_options: ReadOptions, write_options: WriteOptions) -> Self {
    let (reader, writer) = tokio::io::split(transformed);
    Self {
      channel: Channel::new(
        BufReader::with_capacity(read_options.buffer_size.max(1), reader),
        ThresholdWriter::new(writer, write_options),
      ),
    }
  }

  /// Completes the output, then the input, then releases the transform
  ///
  /// A failure at any step is logged and teardown continues; the first failure is returned.
  #[tracing::instrument(level = "trace", skip(self))]
  pub async fn dispose(mut self) -> io::Result<()> {
    let mut first_error = None;
    if let Err(error) = self.channel.shutdown().await {
      tracing::warn!(?error, "Adapter output did not complete cleanly");
      first_error.get_or_insert(error);
    }
    self.channel.complete_input();
    drop(self);
    tracing::trace!("Adapter released");
    match first_error {
      Some(error) => Err(error),
      None => Ok(()),
    }
  }
}

impl<T> std::fmt::Debug for DuplexStreamAdapter<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("DuplexStreamAdapter")
      .field("channel", &self.channel)
      .finish()
  }
}

impl<T> AsyncRead for DuplexStreamAdapter<T>
where
  T: AsyncRead + AsyncWrite + Send + 'static,
{
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<io::Result<()>> {
    Pin::new(&mut self.get_mut().channel).poll_read(cx, buf)
  }
}

impl<T> AsyncWrite for DuplexStreamAdapter<T>
where
  T: AsyncRead + AsyncWrite + Send + 'static,
{
  fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
    Pin::new(&mut self.get_mut().channel).poll_write(cx, buf)
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    Pin::new(&mut self.get_mut().channel).poll_flush(cx)
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    Pin::new(&mut self.get_mut().channel).poll_shutdown(cx)
  }
}

impl<T> DuplexChannel for DuplexStreamAdapter<T>
where
  T: AsyncRead + AsyncWrite + Send + 'static,
{
  fn complete_input(&mut self) {
    self.channel.complete_input()
  }

  fn completion(&self) -> &ChannelCompletion {
    self.channel.completion()
  }
}

/// The transform failed to initialize
///
/// The upstream channel is returned when the transform released its view of it;
/// a transform which leaked the view leaves `upstream` empty.
#[derive(thiserror::Error)]
#[error("Stream transform failed to initialize: {source}")]
pub struct TransformInitializationFailed<C> {
  #[source]
  pub source: io::Error,
  pub upstream: Option<C>,
}

impl<C> TransformInitializationFailed<C> {
  fn new(source: io::Error, mut returned: oneshot::Receiver<C>) -> Self {
    Self {
      source,
      upstream: returned.try_recv().ok(),
    }
  }

  pub fn is_cancelled(&self) -> bool {
    self.source.kind() == io::ErrorKind::Interrupted
  }
}

impl<C> std::fmt::Debug for TransformInitializationFailed<C> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("TransformInitializationFailed")
      .field("source", &self.source)
      .field("upstream_returned", &self.upstream.is_some())
      .finish()
  }
}

/// Layers `transform` over `upstream`, yielding the transformed stream as a channel
///
/// Resolves only once the transform has finished initializing.
pub async fn wrap<C, F>(
  upstream: C,
  transform: F,
  read_options: ReadOptions,
  write_options: WriteOptions,
) -> Result<DuplexStreamAdapter<F::Output>, TransformInitializationFailed<C>>
where
  C: DuplexChannel + 'static,
  F: StreamTransform<ChannelStream<C>>,
{
  wrap_until(
    upstream,
    transform,
    read_options,
    write_options,
    &CancellationListener::default(),
  )
  .await
}

/// As [wrap], abandoning initialization if `cancellation` fires first
#[tracing::instrument(level = "debug", skip_all)]
pub async fn wrap_until<C, F>(
  upstream: C,
  transform: F,
  read_options: ReadOptions,
  write_options: WriteOptions,
  cancellation: &CancellationListener,
) -> Result<DuplexStreamAdapter<F::Output>, TransformInitializationFailed<C>>
where
  C: DuplexChannel + 'static,
  F: StreamTransform<ChannelStream<C>>,
{
  let (view, returned) = ChannelStream::with_return(upstream);
  // The initialization future, and any view it still holds, is dropped before the
  // outcome is examined so that a failed transform hands the upstream back.
  let outcome = transform
    .transform(view)
    .poll_until(cancellation.cancelled())
    .await;
  match outcome {
    Some(Ok(transformed)) => {
      tracing::trace!("Stream transform initialized");
      Ok(DuplexStreamAdapter::new(
        transformed,
        read_options,
        write_options,
      ))
    }
    Some(Err(source)) => {
      tracing::debug!(error = ?source, "Stream transform failed to initialize");
      Err(TransformInitializationFailed::new(source, returned))
    }
    None => {
      tracing::debug!("Stream transform initialization cancelled");
      let source = io::Error::new(
        io::ErrorKind::Interrupted,
        "Stream transform initialization was cancelled",
      );
      Err(TransformInitializationFailed::new(source, returned))
    }
  }
}
