// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use anyhow::{Context as AnyhowContext, Result};
use skein::{
  client,
  common::{
    protocol::connection::{Connection, ConnectionOptions},
    settings::ConnectionSettings,
    transport::{connect_tcp, quinn_transport::connect_quinn},
  },
  util::{
    adapter::IdentityTransform,
    cancellation::CancellationListener,
    tls::{load_certificates, TlsClient},
  },
};
use std::{
  net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
  path::{Path, PathBuf},
  time::Instant,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[derive(Eq, PartialEq, Clone, Debug)]
pub struct ClientArgs {
  pub authority_cert: Option<PathBuf>,
  pub server_host: SocketAddr,
  pub server_san: String,
  pub tls: bool,
  pub quic: bool,
  pub streams: u32,
  pub payload_size: usize,
  pub settings: ConnectionSettings,
}

impl ClientArgs {
  fn uses_tls(&self) -> bool {
    self.tls || self.quic || self.authority_cert.is_some()
  }
}

/// Connect to an echo server and verify that every stream comes back unchanged
#[tracing::instrument(
skip(config),
fields(server=?config.server_host, quic=config.quic, tls=config.uses_tls()),
err
)]
pub async fn client_main(config: ClientArgs) -> Result<()> {
  let options = ConnectionOptions {
    settings: config.settings,
    ..ConnectionOptions::default()
  };

  if config.quic {
    let roots = load_roots(config.authority_cert.as_deref())?;
    let bind_ip = match config.server_host.ip() {
      IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
      IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    let mut endpoint = quinn::Endpoint::client(SocketAddr::new(bind_ip, 0))
      .context("Failed binding QUIC endpoint")?;
    endpoint.set_default_client_config(quinn::ClientConfig::with_root_certificates(roots));
    let transport = connect_quinn(&endpoint, config.server_host, &config.server_san)
      .await
      .context("QUIC connection failed")?;
    let connection = client::connect(transport, IdentityTransform, &options).await?;
    let res = exercise(&connection, &config).await;
    drop(connection);
    endpoint.close(0u32.into(), b"client done");
    endpoint.wait_idle().await;
    return res;
  }

  let transport = connect_tcp(config.server_host)
    .await
    .context("TCP connection failed")?;
  let connection = if config.uses_tls() {
    let roots = load_roots(config.authority_cert.as_deref())?;
    let tls = TlsClient::with_roots(roots, &config.server_san)?;
    client::connect(transport, tls, &options).await?
  } else {
    client::connect(transport, IdentityTransform, &options).await?
  };
  exercise(&connection, &config).await
}

/// Trusts the authority file if one is given, or the platform's roots otherwise
fn load_roots(authority: Option<&Path>) -> Result<rustls::RootCertStore> {
  let certs: Vec<Vec<u8>> = match authority {
    Some(path) => load_certificates(path)?
      .into_iter()
      .map(|cert| cert.0)
      .collect(),
    None => rustls_native_certs::load_native_certs()
      .context("Failed loading platform root certificates")?
      .into_iter()
      .map(|cert| cert.0)
      .collect(),
  };
  let mut roots = rustls::RootCertStore::empty();
  let (added, ignored) = roots.add_parsable_certificates(&certs);
  tracing::debug!(added, ignored, "Loaded root certificates");
  anyhow::ensure!(added > 0, "No usable root certificates were found");
  Ok(roots)
}

async fn exercise(connection: &Connection, config: &ClientArgs) -> Result<()> {
  tracing::info!(
    id = %connection.id(),
    version = ?connection.version(),
    peer_max_streams = connection.peer_settings().max_concurrent_streams,
    "Connected"
  );
  let started = Instant::now();
  let echoes =
    (0..config.streams).map(|index| echo_stream(connection, index, config.payload_size));
  let bytes: usize = futures::future::try_join_all(echoes)
    .await?
    .into_iter()
    .sum();
  tracing::info!(
    streams = config.streams,
    bytes,
    elapsed = ?started.elapsed(),
    "All streams echoed"
  );
  Ok(())
}

/// Streams beyond the peer's concurrency limit wait for a slot
async fn echo_stream(connection: &Connection, index: u32, payload_size: usize) -> Result<usize> {
  let stream = connection
    .open_stream_until(&CancellationListener::default())
    .await
    .context("Failed opening stream")?;
  let id = stream.id();
  let payload: Vec<u8> = (0..payload_size)
    .map(|offset| (offset as u8) ^ (index as u8))
    .collect();

  let (mut reader, mut writer) = tokio::io::split(stream);
  let send = async {
    writer.write_all(&payload).await?;
    writer.shutdown().await?;
    Ok::<_, std::io::Error>(())
  };
  let receive = async {
    let mut echoed = Vec::with_capacity(payload.len());
    reader.read_to_end(&mut echoed).await?;
    Ok::<_, std::io::Error>(echoed)
  };
  let ((), echoed) = futures::future::try_join(send, receive)
    .await
    .with_context(|| format!("Echo failed on stream {}", id))?;
  anyhow::ensure!(
    echoed == payload,
    "Stream {} echoed {} bytes that differ from the {} sent",
    id,
    echoed.len(),
    payload.len()
  );
  tracing::debug!(stream = %id, bytes = payload.len(), "Stream echoed");
  Ok(payload.len())
}
