// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Sources of duplex channels for connections to run over

use std::{io, net::SocketAddr};

use futures::{future::BoxFuture, FutureExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};

use crate::util::duplex::{BoxedDuplexChannel, Channel, DuplexChannelExt};

pub mod quinn_transport;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TransportAddress {
  Unidentified,
  Socket(SocketAddr),
}

impl std::fmt::Display for TransportAddress {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::Unidentified => f.write_str("Unidentified"),
      Self::Socket(socket_addr) => write!(f, "{}", socket_addr),
    }
  }
}

impl From<SocketAddr> for TransportAddress {
  fn from(addr: SocketAddr) -> Self {
    Self::Socket(addr)
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportInfo {
  pub local: TransportAddress,
  pub remote: TransportAddress,
}

impl TransportInfo {
  pub fn unidentified() -> Self {
    Self {
      local: TransportAddress::Unidentified,
      remote: TransportAddress::Unidentified,
    }
  }

  pub fn sockets(local: SocketAddr, remote: SocketAddr) -> Self {
    Self {
      local: local.into(),
      remote: remote.into(),
    }
  }
}

impl Default for TransportInfo {
  fn default() -> Self {
    Self::unidentified()
  }
}

/// A transport session, ready for connection preface negotiation
pub struct AcceptedTransport {
  pub channel: BoxedDuplexChannel,
  pub info: TransportInfo,
}

impl std::fmt::Debug for AcceptedTransport {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("AcceptedTransport")
      .field("info", &self.info)
      .finish_non_exhaustive()
  }
}

/// Produces transport sessions as peers arrive
///
/// Yields `None` once the acceptor can produce no further sessions. Errors describe
/// a single failed session; the acceptor may continue afterwards.
pub trait TransportAcceptor: Send + Sync {
  fn accept(&self) -> BoxFuture<'_, Option<io::Result<AcceptedTransport>>>;

  fn local_addr(&self) -> TransportAddress;
}

pub struct TcpTransportAcceptor {
  listener: TcpListener,
}

impl TcpTransportAcceptor {
  pub async fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
    Ok(Self::from_listener(TcpListener::bind(addr).await?))
  }

  pub fn from_listener(listener: TcpListener) -> Self {
    Self { listener }
  }
}

fn tcp_transport(stream: TcpStream) -> io::Result<AcceptedTransport> {
  stream.set_nodelay(true)?;
  let info = TransportInfo::sockets(stream.local_addr()?, stream.peer_addr()?);
  Ok(AcceptedTransport {
    channel: Channel::from(stream).boxed(),
    info,
  })
}

impl TransportAcceptor for TcpTransportAcceptor {
  fn accept(&self) -> BoxFuture<'_, Option<io::Result<AcceptedTransport>>> {
    async move {
      let accepted = self
        .listener
        .accept()
        .await
        .and_then(|(stream, _)| tcp_transport(stream));
      if let Ok(transport) = &accepted {
        tracing::debug!(remote = %transport.info.remote, "Accepted TCP transport");
      }
      Some(accepted)
    }
    .boxed()
  }

  fn local_addr(&self) -> TransportAddress {
    self
      .listener
      .local_addr()
      .map(TransportAddress::Socket)
      .unwrap_or(TransportAddress::Unidentified)
  }
}

/// Connects a TCP transport to `addr`
pub async fn connect_tcp<A: ToSocketAddrs>(addr: A) -> io::Result<AcceptedTransport> {
  tcp_transport(TcpStream::connect(addr).await?)
}

#[cfg(test)]
mod tests {
  use tokio::io::{AsyncReadExt, AsyncWriteExt};

  use super::{connect_tcp, TcpTransportAcceptor, TransportAcceptor, TransportAddress};

  #[tokio::test]
  async fn tcp_transports_carry_bytes() {
    let acceptor = TcpTransportAcceptor::bind("127.0.0.1:0").await.unwrap();
    let addr = match acceptor.local_addr() {
      TransportAddress::Socket(addr) => addr,
      TransportAddress::Unidentified => panic!("Bound listener must report its address"),
    };
    let (accepted, connected) = tokio::join!(acceptor.accept(), connect_tcp(addr));
    let mut accepted = accepted.expect("TCP acceptors never end").unwrap();
    let mut connected = connected.unwrap();
    assert_eq!(accepted.info.local, connected.info.remote);
    connected.channel.write_all(b"ping").await.unwrap();
    connected.channel.shutdown().await.unwrap();
    let mut received = Vec::new();
    accepted.channel.read_to_end(&mut received).await.unwrap();
    assert_eq!(received, b"ping");
  }
}
