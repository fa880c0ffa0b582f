// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
#![allow(dead_code)]

use std::{io, sync::Arc};

use futures::{future::BoxFuture, FutureExt};
use skein::{
  common::{
    protocol::connection::Connection,
    transport::{AcceptedTransport, TransportAcceptor, TransportAddress, TransportInfo},
  },
  util::duplex::{Channel, DuplexChannelExt},
};
use tokio::{
  io::{AsyncReadExt, AsyncWriteExt},
  sync::{mpsc, Mutex},
};

/// Hands out in-memory transports pushed through its [MemoryConnector]
pub struct MemoryAcceptor {
  incoming: Mutex<mpsc::Receiver<AcceptedTransport>>,
}

#[derive(Clone)]
pub struct MemoryConnector {
  outgoing: mpsc::Sender<AcceptedTransport>,
}

pub fn memory_transport() -> (MemoryAcceptor, MemoryConnector) {
  let (outgoing, incoming) = mpsc::channel(8);
  (
    MemoryAcceptor {
      incoming: Mutex::new(incoming),
    },
    MemoryConnector { outgoing },
  )
}

impl MemoryConnector {
  pub async fn connect(&self) -> AcceptedTransport {
    let (client, server) = tokio::io::duplex(64 * 1024);
    self
      .outgoing
      .send(AcceptedTransport {
        channel: Channel::from_stream(server).boxed(),
        info: TransportInfo::unidentified(),
      })
      .await
      .expect("acceptor must be alive");
    AcceptedTransport {
      channel: Channel::from_stream(client).boxed(),
      info: TransportInfo::unidentified(),
    }
  }
}

impl TransportAcceptor for MemoryAcceptor {
  fn accept(&self) -> BoxFuture<'_, Option<io::Result<AcceptedTransport>>> {
    async move { self.incoming.lock().await.recv().await.map(Ok) }.boxed()
  }

  fn local_addr(&self) -> TransportAddress {
    TransportAddress::Unidentified
  }
}

/// Echoes each inbound stream's full request back once the peer finishes sending
pub fn echo_handler() -> Arc<impl Fn(Connection) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync> {
  Arc::new(|connection: Connection| {
    async move {
      while let Some(mut stream) = connection.accept_stream().await {
        tokio::spawn(async move {
          let mut request = Vec::new();
          stream.read_to_end(&mut request).await?;
          stream.write_all(&request).await?;
          stream.shutdown().await?;
          Ok::<_, io::Error>(())
        });
      }
      Ok::<_, anyhow::Error>(())
    }
    .boxed()
  })
}

pub fn init_tracing() {
  let _ = tracing_subscriber::fmt()
    .with_env_filter(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("skein=debug")),
    )
    .with_test_writer()
    .try_init();
}
