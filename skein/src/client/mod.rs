// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Establishing connecting-side connections over transports

use std::io;

use crate::{
  common::{
    protocol::connection::{Connection, ConnectionError, ConnectionOptions, ConnectionSide},
    transport::AcceptedTransport,
  },
  util::{
    adapter::{wrap, ChannelStream, StreamTransform},
    duplex::{BoxedDuplexChannel, DuplexChannelExt},
  },
};

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
  #[error("Transport transform failed to initialize: {0}")]
  TransformInitializationFailed(#[source] io::Error),
  #[error(transparent)]
  Connection(#[from] ConnectionError),
}

/// Layers `transform` over a connected transport and negotiates a connection over it
#[tracing::instrument(level = "debug", skip(transport, transform, options), fields(remote = %transport.info.remote), err)]
pub async fn connect<T>(
  transport: AcceptedTransport,
  transform: T,
  options: &ConnectionOptions,
) -> Result<Connection, ClientError>
where
  T: StreamTransform<ChannelStream<BoxedDuplexChannel>>,
{
  let AcceptedTransport { channel, info } = transport;
  let adapter = match wrap(
    channel,
    transform,
    options.read_options,
    options.write_options,
  )
  .await
  {
    Ok(adapter) => adapter,
    Err(failure) => {
      if let Some(mut upstream) = failure.upstream {
        if let Err(error) = upstream.close().await {
          tracing::debug!(?error, "Failed closing transport after transform failure");
        }
      }
      return Err(ClientError::TransformInitializationFailed(failure.source));
    }
  };
  let connection =
    Connection::establish(adapter, ConnectionSide::Connect, options.settings, info).await?;
  tracing::debug!(connection = %connection.id(), "Connected");
  Ok(connection)
}
