// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Context as AnyhowContext, Result};
use futures::future::{BoxFuture, FutureExt};
use skein::{
  common::{
    protocol::connection::{Connection, ConnectionOptions, StreamChannel},
    settings::ConnectionSettings,
    transport::{quinn_transport::QuinnTransportAcceptor, TcpTransportAcceptor},
  },
  server::ConnectionServer,
  util::{
    adapter::IdentityTransform,
    cancellation::CancellationListener,
    tls::{load_certificates, load_private_key, TlsServer},
  },
};
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

#[derive(Eq, PartialEq, Clone, Debug)]
pub struct CertificateFiles {
  pub cert: PathBuf,
  pub key: PathBuf,
}

/// Parameters used to run an echo server
#[derive(Eq, PartialEq, Clone, Debug)]
pub struct ServerArgs {
  pub certificate: Option<CertificateFiles>,
  pub bind_addr: SocketAddr,
  pub quic: bool,
  pub settings: ConnectionSettings,
}

/// Run a server that echoes every stream of every connection back to its opener
#[tracing::instrument(
skip(config),
fields(
addr=?config.bind_addr,
quic=config.quic,
tls=config.certificate.is_some(),
),
err
)]
pub async fn server_main(config: self::ServerArgs) -> Result<()> {
  let options = ConnectionOptions {
    settings: config.settings,
    ..ConnectionOptions::default()
  };

  let (shutdown, sigint_handler_task) = {
    let shutdown = CancellationToken::new();
    let shutdown_trigger = shutdown.clone();
    let sigint_handler_task = tokio::task::spawn(async move {
      let _ = tokio::signal::ctrl_c().await;
      tracing::trace!("SIGINT detected, initiating graceful shutdown");
      shutdown_trigger.cancel();
    });
    (shutdown, sigint_handler_task)
  };
  let listener = CancellationListener::from(&shutdown);
  let handler = Arc::new(echo_connection);

  match (&config.certificate, config.quic) {
    (Some(files), true) => {
      let endpoint = quinn::Endpoint::server(build_quinn_config(files)?, config.bind_addr)
        .context("Failed binding QUIC endpoint")?;
      tracing::info!(addr = ?endpoint.local_addr()?, "Accepting QUIC connections");
      let server = ConnectionServer::new(
        QuinnTransportAcceptor::new(endpoint.clone()),
        IdentityTransform,
        options,
      );
      server.serve(handler, listener).await?;
      endpoint.close(0u32.into(), b"server shutdown");
      endpoint.wait_idle().await;
    }
    (None, true) => anyhow::bail!("QUIC requires a certificate and key"),
    (Some(files), false) => {
      let tls = TlsServer::from_pem_files(&files.cert, &files.key)?;
      let acceptor = TcpTransportAcceptor::bind(config.bind_addr)
        .await
        .context("Failed binding TCP listener")?;
      tracing::info!(addr = ?config.bind_addr, "Accepting TLS connections");
      ConnectionServer::new(acceptor, tls, options)
        .serve(handler, listener)
        .await?;
    }
    (None, false) => {
      let acceptor = TcpTransportAcceptor::bind(config.bind_addr)
        .await
        .context("Failed binding TCP listener")?;
      tracing::info!(addr = ?config.bind_addr, "Accepting plaintext connections");
      ConnectionServer::new(acceptor, IdentityTransform, options)
        .serve(handler, listener)
        .await?;
    }
  }

  sigint_handler_task.abort();
  let _cancelled = sigint_handler_task.await;

  Ok(())
}

fn echo_connection(connection: Connection) -> BoxFuture<'static, Result<()>> {
  async move {
    tracing::info!(
      id = %connection.id(),
      remote = %connection.transport().remote,
      "Connection established"
    );
    while let Some(stream) = connection.accept_stream().await {
      tokio::spawn(echo_stream(stream));
    }
    tracing::info!(id = %connection.id(), "Connection closed");
    Ok(())
  }
  .boxed()
}

async fn echo_stream(stream: StreamChannel) {
  let id = stream.id();
  let (mut reader, mut writer) = tokio::io::split(stream);
  let echoed = async {
    let copied = tokio::io::copy(&mut reader, &mut writer).await?;
    writer.shutdown().await?;
    Ok::<_, std::io::Error>(copied)
  }
  .await;
  match echoed {
    Ok(bytes) => tracing::debug!(stream = %id, bytes, "Stream echoed"),
    Err(error) => tracing::warn!(stream = %id, ?error, "Stream echo failed"),
  }
}

fn build_quinn_config(files: &CertificateFiles) -> Result<quinn::ServerConfig> {
  let certs = load_certificates(&files.cert).context("Failed reading cert file")?;
  let key = load_private_key(&files.key).context("Failed reading private key file")?;
  let mut transport_config = quinn::TransportConfig::default();
  transport_config.keep_alive_interval(Some(Duration::from_secs(5)));
  transport_config.max_idle_timeout(Some(Duration::from_secs(30).try_into()?));
  let mut server_config = quinn::ServerConfig::with_single_cert(certs, key)
    .context("Quinn rejected the certificate")?;
  server_config.transport_config(Arc::new(transport_config));
  Ok(server_config)
}
