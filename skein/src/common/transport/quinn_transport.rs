// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! QUIC transports, carrying each connection over one bidirectional stream

use std::{
  io,
  net::SocketAddr,
  pin::Pin,
  task::{Context, Poll},
};

use futures::{future::BoxFuture, FutureExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::{AcceptedTransport, TransportAcceptor, TransportAddress, TransportInfo};
use crate::util::duplex::{Channel, ChannelCompletion, DuplexChannel, DuplexChannelExt};

pub fn connection_error_to_io(connection_error: quinn::ConnectionError) -> io::Error {
  let kind = match &connection_error {
    quinn::ConnectionError::VersionMismatch => io::ErrorKind::Unsupported,
    quinn::ConnectionError::TransportError(_) => io::ErrorKind::InvalidData,
    quinn::ConnectionError::ConnectionClosed(_) => io::ErrorKind::ConnectionAborted,
    quinn::ConnectionError::ApplicationClosed(_) => io::ErrorKind::ConnectionAborted,
    quinn::ConnectionError::Reset => io::ErrorKind::ConnectionReset,
    quinn::ConnectionError::TimedOut => io::ErrorKind::TimedOut,
    quinn::ConnectionError::LocallyClosed => io::ErrorKind::NotConnected,
  };
  io::Error::new(kind, connection_error)
}

/// One bidirectional QUIC stream, holding its connection open while in use
pub struct QuinnChannel {
  channel: Channel<quinn::RecvStream, quinn::SendStream>,
  connection: quinn::Connection,
}

impl QuinnChannel {
  pub fn new(connection: quinn::Connection, send: quinn::SendStream, recv: quinn::RecvStream) -> Self {
    Self {
      channel: Channel::new(recv, send),
      connection,
    }
  }

  pub fn connection(&self) -> &quinn::Connection {
    &self.connection
  }

  fn info(&self, local: TransportAddress) -> TransportInfo {
    TransportInfo {
      local,
      remote: TransportAddress::Socket(self.connection.remote_address()),
    }
  }
}

impl std::fmt::Debug for QuinnChannel {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("QuinnChannel")
      .field("remote", &self.connection.remote_address())
      .field("channel", &self.channel)
      .finish()
  }
}

impl AsyncRead for QuinnChannel {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<io::Result<()>> {
    Pin::new(&mut self.get_mut().channel).poll_read(cx, buf)
  }
}

impl AsyncWrite for QuinnChannel {
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

impl DuplexChannel for QuinnChannel {
  fn complete_input(&mut self) {
    self.channel.complete_input()
  }

  fn completion(&self) -> &ChannelCompletion {
    self.channel.completion()
  }
}

pub struct QuinnTransportAcceptor {
  endpoint: quinn::Endpoint,
}

impl QuinnTransportAcceptor {
  pub fn new(endpoint: quinn::Endpoint) -> Self {
    Self { endpoint }
  }

  pub fn endpoint(&self) -> &quinn::Endpoint {
    &self.endpoint
  }
}

impl TransportAcceptor for QuinnTransportAcceptor {
  fn accept(&self) -> BoxFuture<'_, Option<io::Result<AcceptedTransport>>> {
    async move {
      let connecting = self.endpoint.accept().await?;
      let accepted = async {
        let connection = connecting.await.map_err(connection_error_to_io)?;
        tracing::debug!(remote = %connection.remote_address(), "QUIC connection established");
        let (send, recv) = connection
          .accept_bi()
          .await
          .map_err(connection_error_to_io)?;
        let channel = QuinnChannel::new(connection, send, recv);
        Ok(AcceptedTransport {
          info: channel.info(self.local_addr()),
          channel: channel.boxed(),
        })
      }
      .await;
      Some(accepted)
    }
    .boxed()
  }

  fn local_addr(&self) -> TransportAddress {
    self
      .endpoint
      .local_addr()
      .map(TransportAddress::Socket)
      .unwrap_or(TransportAddress::Unidentified)
  }
}

/// Connects to `addr` and opens the stream a connection will run over
///
/// The peer observes the stream once the connection preface is written.
pub async fn connect_quinn(
  endpoint: &quinn::Endpoint,
  addr: SocketAddr,
  server_name: &str,
) -> io::Result<AcceptedTransport> {
  let connecting = endpoint
    .connect(addr, server_name)
    .map_err(|error| io::Error::new(io::ErrorKind::InvalidInput, error))?;
  let connection = connecting.await.map_err(connection_error_to_io)?;
  let (send, recv) = connection.open_bi().await.map_err(connection_error_to_io)?;
  let local = endpoint
    .local_addr()
    .map(TransportAddress::Socket)
    .unwrap_or(TransportAddress::Unidentified);
  let channel = QuinnChannel::new(connection, send, recv);
  Ok(AcceptedTransport {
    info: channel.info(local),
    channel: channel.boxed(),
  })
}
