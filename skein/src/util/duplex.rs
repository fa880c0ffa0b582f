// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Duplex channels: a byte source and a byte sink which complete independently
//!
//! Completing the input stops consumption of incoming bytes; completing the output
//! flushes and half-closes the sink. A channel is closed once both have completed,
//! in either order.

use std::{
  io,
  pin::Pin,
  sync::Arc,
  task::{Context, Poll},
};

use futures::{future::BoxFuture, FutureExt};
use tokio::{
  io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf},
  net::{
    tcp::{OwnedReadHalf, OwnedWriteHalf},
    TcpStream,
  },
  sync::watch,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CompletionState {
  pub input: bool,
  pub output: bool,
}

impl CompletionState {
  pub fn is_closed(&self) -> bool {
    self.input && self.output
  }
}

/// Shared, observable record of which halves of a channel have completed
///
/// Clones observe the same state. Completion is monotonic; a completed half never reopens.
#[derive(Debug, Clone)]
pub struct ChannelCompletion {
  state: Arc<watch::Sender<CompletionState>>,
}

impl Default for ChannelCompletion {
  fn default() -> Self {
    Self::new()
  }
}

impl ChannelCompletion {
  pub fn new() -> Self {
    let (sender, _) = watch::channel(CompletionState::default());
    Self {
      state: Arc::new(sender),
    }
  }

  pub fn complete_input(&self) {
    self.state.send_modify(|state| state.input = true);
  }

  pub fn complete_output(&self) {
    self.state.send_modify(|state| state.output = true);
  }

  pub fn state(&self) -> CompletionState {
    *self.state.borrow()
  }

  pub fn is_input_complete(&self) -> bool {
    self.state().input
  }

  pub fn is_output_complete(&self) -> bool {
    self.state().output
  }

  pub fn is_closed(&self) -> bool {
    self.state().is_closed()
  }

  /// Resolves once both halves have completed
  pub async fn closed(&self) {
    let mut receiver = self.state.subscribe();
    loop {
      if receiver.borrow_and_update().is_closed() {
        return;
      }
      if receiver.changed().await.is_err() {
        return;
      }
    }
  }
}

/// A bidirectional byte channel with independently completable halves
///
/// Output completion is requested through [AsyncWrite::poll_shutdown], which flushes
/// pending bytes before half-closing. Input completion is immediate.
pub trait DuplexChannel: AsyncRead + AsyncWrite + Send + Unpin {
  /// Stops consuming input; subsequent reads observe end-of-stream
  fn complete_input(&mut self);

  fn completion(&self) -> &ChannelCompletion;

  fn is_closed(&self) -> bool {
    self.completion().is_closed()
  }
}

impl<T: DuplexChannel + ?Sized> DuplexChannel for Box<T> {
  fn complete_input(&mut self) {
    T::complete_input(self)
  }

  fn completion(&self) -> &ChannelCompletion {
    T::completion(self)
  }
}

impl<T: DuplexChannel + ?Sized> DuplexChannel for &mut T {
  fn complete_input(&mut self) {
    T::complete_input(self)
  }

  fn completion(&self) -> &ChannelCompletion {
    T::completion(self)
  }
}

pub type BoxedDuplexChannel = Box<dyn DuplexChannel + 'static>;

pub trait DuplexChannelExt: DuplexChannel {
  /// Flushes and half-closes the output
  fn complete_output(&mut self) -> BoxFuture<'_, io::Result<()>>
  where
    Self: Sized,
  {
    AsyncWriteExt::shutdown(self).boxed()
  }

  /// Completes the output, then the input, even if the output fails to complete cleanly
  fn close(&mut self) -> BoxFuture<'_, io::Result<()>>
  where
    Self: Sized,
  {
    async move {
      let res = AsyncWriteExt::shutdown(self).await;
      self.complete_input();
      res
    }
    .boxed()
  }

  fn boxed(self) -> BoxedDuplexChannel
  where
    Self: Sized + 'static,
  {
    Box::new(self)
  }
}

impl<T: DuplexChannel + ?Sized> DuplexChannelExt for T {}

/// A [DuplexChannel] assembled from a separate reader and writer
///
/// End-of-stream from the reader completes the input. Writes after the output
/// completes fail with [io::ErrorKind::BrokenPipe]. Each half is dropped as soon as
/// it completes; dropping the channel completes whatever remains.
pub struct Channel<R, W> {
  input: Option<R>,
  output: Option<W>,
  completion: ChannelCompletion,
}

impl<R, W> Channel<R, W>
where
  R: AsyncRead + Send + Unpin,
  W: AsyncWrite + Send + Unpin,
{
  pub fn new(input: R, output: W) -> Self {
    Self {
      input: Some(input),
      output: Some(output),
      completion: ChannelCompletion::new(),
    }
  }

  pub fn input_ref(&self) -> Option<&R> {
    self.input.as_ref()
  }

  pub fn output_ref(&self) -> Option<&W> {
    self.output.as_ref()
  }
}

impl<S> Channel<ReadHalf<S>, WriteHalf<S>>
where
  S: AsyncRead + AsyncWrite + Send,
{
  pub fn from_stream(stream: S) -> Self {
    let (input, output) = tokio::io::split(stream);
    Self::new(input, output)
  }
}

impl From<TcpStream> for Channel<OwnedReadHalf, OwnedWriteHalf> {
  fn from(stream: TcpStream) -> Self {
    let (input, output) = stream.into_split();
    Self::new(input, output)
  }
}

impl<R, W> std::fmt::Debug for Channel<R, W> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Channel")
      .field("completion", &self.completion.state())
      .finish_non_exhaustive()
  }
}

impl<R, W> AsyncRead for Channel<R, W>
where
  R: AsyncRead + Send + Unpin,
  W: AsyncWrite + Send + Unpin,
{
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<io::Result<()>> {
    let this = self.get_mut();
    let input = match this.input.as_mut() {
      Some(input) => input,
      None => return Poll::Ready(Ok(())),
    };
    let filled_before = buf.filled().len();
    let res = futures::ready!(Pin::new(input).poll_read(cx, buf));
    if res.is_ok() && buf.remaining() > 0 && buf.filled().len() == filled_before {
      // End-of-stream from the source
      this.complete_input();
    }
    Poll::Ready(res)
  }
}

impl<R, W> AsyncWrite for Channel<R, W>
where
  R: AsyncRead + Send + Unpin,
  W: AsyncWrite + Send + Unpin,
{
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, io::Error>> {
    match self.get_mut().output.as_mut() {
      Some(output) => Pin::new(output).poll_write(cx, buf),
      None => Poll::Ready(Err(io::Error::new(
        io::ErrorKind::BrokenPipe,
        "Output of the channel has already completed",
      ))),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
    match self.get_mut().output.as_mut() {
      Some(output) => Pin::new(output).poll_flush(cx),
      None => Poll::Ready(Ok(())),
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
    let this = self.get_mut();
    let output = match this.output.as_mut() {
      Some(output) => output,
      None => return Poll::Ready(Ok(())),
    };
    let res = futures::ready!(Pin::new(output).poll_shutdown(cx));
    // The output is complete even if it failed to shut down cleanly
    this.completion.complete_output();
    this.output = None;
    Poll::Ready(res)
  }
}

impl<R, W> DuplexChannel for Channel<R, W>
where
  R: AsyncRead + Send + Unpin,
  W: AsyncWrite + Send + Unpin,
{
  fn complete_input(&mut self) {
    // Observers see completion before the reader is released
    self.completion.complete_input();
    self.input = None;
  }

  fn completion(&self) -> &ChannelCompletion {
    &self.completion
  }
}

impl<R, W> Drop for Channel<R, W> {
  fn drop(&mut self) {
    self.completion.complete_input();
    self.completion.complete_output();
  }
}

#[cfg(test)]
mod tests {
  use futures::FutureExt;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};

  use super::{Channel, ChannelCompletion, DuplexChannel, DuplexChannelExt};

  #[tokio::test]
  async fn closes_only_after_both_halves_complete_input_first() {
    let (a, _b) = tokio::io::duplex(64);
    let mut channel = Channel::from_stream(a);
    channel.complete_input();
    assert!(channel.completion().is_input_complete());
    assert!(!channel.is_closed());
    channel.complete_output().await.unwrap();
    assert!(channel.is_closed());
  }

  #[tokio::test]
  async fn closes_only_after_both_halves_complete_output_first() {
    let (a, _b) = tokio::io::duplex(64);
    let mut channel = Channel::from_stream(a);
    channel.complete_output().await.unwrap();
    assert!(channel.completion().is_output_complete());
    assert!(!channel.is_closed());
    channel.complete_input();
    assert!(channel.is_closed());
  }

  #[tokio::test]
  async fn end_of_stream_completes_input() {
    let (a, mut b) = tokio::io::duplex(64);
    let mut channel = Channel::from_stream(a);
    b.write_all(b"hello").await.unwrap();
    b.shutdown().await.unwrap();
    let mut received = Vec::new();
    channel.read_to_end(&mut received).await.unwrap();
    assert_eq!(received, b"hello");
    assert!(channel.completion().is_input_complete());
    assert!(!channel.completion().is_output_complete());
  }

  #[tokio::test]
  async fn writes_after_output_completion_fail() {
    let (a, _b) = tokio::io::duplex(64);
    let mut channel = Channel::from_stream(a);
    channel.complete_output().await.unwrap();
    let err = channel.write_all(b"late").await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::BrokenPipe);
  }

  #[tokio::test]
  async fn reads_after_input_completion_observe_end_of_stream() {
    let (a, mut b) = tokio::io::duplex(64);
    let mut channel = Channel::from_stream(a);
    b.write_all(b"ignored").await.unwrap();
    channel.complete_input();
    let mut buf = [0u8; 16];
    assert_eq!(channel.read(&mut buf).await.unwrap(), 0);
  }

  #[tokio::test]
  async fn closed_resolves_after_completion() {
    let (a, _b) = tokio::io::duplex(64);
    let mut channel = Channel::from_stream(a);
    let completion: ChannelCompletion = channel.completion().clone();
    let waiter = tokio::spawn(async move { completion.closed().await });
    channel.complete_input();
    assert!(channel.completion().closed().now_or_never().is_none());
    channel.close().await.unwrap();
    waiter.await.unwrap();
  }

  #[tokio::test]
  async fn dropping_completes_both_halves() {
    let (a, _b) = tokio::io::duplex(64);
    let channel = Channel::from_stream(a).boxed();
    let completion = channel.completion().clone();
    drop(channel);
    assert!(completion.is_closed());
  }
}
