// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Accepting transports, layering transforms over them, and handing out connections

use std::{future::Future, sync::Arc};

use futures::{future::BoxFuture, FutureExt};
use tokio::task::JoinSet;
use tracing_futures::Instrument;

use crate::{
  common::{
    protocol::connection::{Connection, ConnectionOptions, ConnectionSide},
    transport::{AcceptedTransport, TransportAcceptor},
  },
  ext::future::FutureExtExt,
  util::{
    adapter::{wrap_until, ChannelStream, StreamTransform},
    cancellation::CancellationListener,
    duplex::{BoxedDuplexChannel, DuplexChannelExt},
  },
};

/// Serves the streams of one established connection
pub trait ConnectionHandler: Send + Sync + 'static {
  fn handle_connection(&self, connection: Connection) -> BoxFuture<'static, anyhow::Result<()>>;
}

impl<F, Fut> ConnectionHandler for F
where
  F: Fn(Connection) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
  fn handle_connection(&self, connection: Connection) -> BoxFuture<'static, anyhow::Result<()>> {
    (self)(connection).boxed()
  }
}

/// Accepts transports from `acceptor` and runs each as a listening-side connection
///
/// Every transport is passed through `transform` (for example [crate::util::tls::TlsServer])
/// before negotiation.
pub struct ConnectionServer<A, T> {
  acceptor: A,
  transform: T,
  options: ConnectionOptions,
}

impl<A, T> ConnectionServer<A, T>
where
  A: TransportAcceptor,
  T: StreamTransform<ChannelStream<BoxedDuplexChannel>> + Clone + Sync + 'static,
{
  pub fn new(acceptor: A, transform: T, options: ConnectionOptions) -> Self {
    Self {
      acceptor,
      transform,
      options,
    }
  }

  pub fn acceptor(&self) -> &A {
    &self.acceptor
  }

  /// Runs until `shutdown` fires or the acceptor is exhausted, then waits for open connections
  ///
  /// Connections still running when `shutdown` fires are aborted.
  #[tracing::instrument(level = "debug", skip_all, fields(local = %self.acceptor.local_addr()))]
  pub async fn serve<H: ConnectionHandler>(
    &self,
    handler: Arc<H>,
    shutdown: CancellationListener,
  ) -> anyhow::Result<()> {
    let mut connections = JoinSet::new();
    loop {
      tokio::select! {
        _ = shutdown.cancelled() => {
          tracing::debug!("Server shutdown requested");
          break;
        }
        Some(finished) = connections.join_next(), if !connections.is_empty() => {
          if let Err(error) = finished {
            tracing::warn!(?error, "Connection task failed");
          }
        }
        accepted = self.acceptor.accept() => match accepted {
          None => {
            tracing::debug!("Transport acceptor exhausted");
            break;
          }
          Some(Err(error)) => tracing::warn!(?error, "Failed accepting transport"),
          Some(Ok(transport)) => {
            let span = tracing::info_span!("connection", remote = %transport.info.remote);
            connections.spawn(
              run_connection(
                transport,
                self.transform.clone(),
                self.options,
                Arc::clone(&handler),
                shutdown.child(),
              )
              .instrument(span),
            );
          }
        },
      }
    }
    while let Some(finished) = connections.join_next().await {
      if let Err(error) = finished {
        tracing::warn!(?error, "Connection task failed");
      }
    }
    Ok(())
  }
}

async fn run_connection<T, H>(
  transport: AcceptedTransport,
  transform: T,
  options: ConnectionOptions,
  handler: Arc<H>,
  shutdown: CancellationListener,
) where
  T: StreamTransform<ChannelStream<BoxedDuplexChannel>>,
  H: ConnectionHandler,
{
  let AcceptedTransport { channel, info } = transport;
  let adapter = match wrap_until(
    channel,
    transform,
    options.read_options,
    options.write_options,
    &shutdown,
  )
  .await
  {
    Ok(adapter) => adapter,
    Err(failure) => {
      tracing::info!(error = %failure.source, "Transport transform failed");
      if let Some(mut upstream) = failure.upstream {
        if let Err(error) = upstream.close().await {
          tracing::debug!(?error, "Failed closing transport after transform failure");
        }
      }
      return;
    }
  };
  let connection = match Connection::establish(adapter, ConnectionSide::Listen, options.settings, info)
    .poll_until(shutdown.cancelled())
    .await
  {
    Some(Ok(connection)) => connection,
    Some(Err(error)) => {
      tracing::info!(%error, "Connection negotiation failed");
      return;
    }
    None => return,
  };
  tracing::info!(connection = %connection.id(), "Connection established");
  match handler
    .handle_connection(connection.clone())
    .poll_until(shutdown.cancelled())
    .await
  {
    Some(Ok(())) => tracing::debug!(connection = %connection.id(), "Connection handler finished"),
    Some(Err(error)) => {
      tracing::warn!(connection = %connection.id(), ?error, "Connection handler failed");
      connection.abort();
    }
    None => {
      connection.abort();
    }
  }
  connection.closed().poll_until(shutdown.cancelled()).await;
  tracing::info!(connection = %connection.id(), "Connection closed");
}
