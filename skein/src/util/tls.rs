// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! TLS stream transforms for layering over duplex channels via the adapter

use std::{
  fs::File,
  io::{self, BufReader},
  path::{Path, PathBuf},
  sync::Arc,
};

use futures::{future::BoxFuture, FutureExt};
use tokio::io::{AsyncRead, AsyncWrite};

use super::adapter::StreamTransform;

/// ALPN protocol identifier for multiplexed connections
pub const ALPN_SKEIN_1: &[u8] = b"skein/1";

#[derive(thiserror::Error, Debug)]
pub enum TlsConfigError {
  #[error("Failed to read TLS material: {0}")]
  Io(#[from] io::Error),
  #[error("No certificates found in {0:?}")]
  NoCertificates(PathBuf),
  #[error("No private key found in {0:?}")]
  NoPrivateKey(PathBuf),
  #[error("Invalid server name {0:?}")]
  InvalidServerName(String),
  #[error(transparent)]
  Rustls(#[from] rustls::Error),
}

pub fn load_certificates(path: &Path) -> Result<Vec<rustls::Certificate>, TlsConfigError> {
  let mut reader = BufReader::new(File::open(path)?);
  let certs = rustls_pemfile::certs(&mut reader)?;
  if certs.is_empty() {
    return Err(TlsConfigError::NoCertificates(path.to_path_buf()));
  }
  Ok(certs.into_iter().map(rustls::Certificate).collect())
}

/// Loads the first PKCS#8, RSA, or EC private key found in a PEM file
pub fn load_private_key(path: &Path) -> Result<rustls::PrivateKey, TlsConfigError> {
  let mut reader = BufReader::new(File::open(path)?);
  loop {
    match rustls_pemfile::read_one(&mut reader)? {
      Some(rustls_pemfile::Item::PKCS8Key(key))
      | Some(rustls_pemfile::Item::RSAKey(key))
      | Some(rustls_pemfile::Item::ECKey(key)) => return Ok(rustls::PrivateKey(key)),
      Some(_) => continue,
      None => return Err(TlsConfigError::NoPrivateKey(path.to_path_buf())),
    }
  }
}

/// Server-side TLS transform; each application performs one handshake
#[derive(Clone)]
pub struct TlsServer {
  acceptor: tokio_rustls::TlsAcceptor,
}

impl TlsServer {
  pub fn new(config: Arc<rustls::ServerConfig>) -> Self {
    Self {
      acceptor: tokio_rustls::TlsAcceptor::from(config),
    }
  }

  pub fn from_certificate(
    certs: Vec<rustls::Certificate>,
    key: rustls::PrivateKey,
  ) -> Result<Self, TlsConfigError> {
    let mut config = rustls::ServerConfig::builder()
      .with_safe_defaults()
      .with_no_client_auth()
      .with_single_cert(certs, key)?;
    config.alpn_protocols = vec![ALPN_SKEIN_1.to_vec()];
    Ok(Self::new(Arc::new(config)))
  }

  pub fn from_pem_files(cert: &Path, key: &Path) -> Result<Self, TlsConfigError> {
    Self::from_certificate(load_certificates(cert)?, load_private_key(key)?)
  }
}

impl std::fmt::Debug for TlsServer {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("TlsServer").finish_non_exhaustive()
  }
}

impl<S> StreamTransform<S> for TlsServer
where
  S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
  type Output = tokio_rustls::server::TlsStream<S>;

  fn transform(self, stream: S) -> BoxFuture<'static, io::Result<Self::Output>> {
    async move { self.acceptor.accept(stream).await }.boxed()
  }
}

/// Client-side TLS transform verifying the peer against `server_name`
#[derive(Clone)]
pub struct TlsClient {
  connector: tokio_rustls::TlsConnector,
  server_name: rustls::ServerName,
}

impl TlsClient {
  pub fn new(config: Arc<rustls::ClientConfig>, server_name: &str) -> Result<Self, TlsConfigError> {
    let server_name = rustls::ServerName::try_from(server_name)
      .map_err(|_| TlsConfigError::InvalidServerName(server_name.to_string()))?;
    Ok(Self {
      connector: tokio_rustls::TlsConnector::from(config),
      server_name,
    })
  }

  /// Trusts only the given roots
  pub fn with_roots(
    roots: rustls::RootCertStore,
    server_name: &str,
  ) -> Result<Self, TlsConfigError> {
    let mut config = rustls::ClientConfig::builder()
      .with_safe_defaults()
      .with_root_certificates(roots)
      .with_no_client_auth();
    config.alpn_protocols = vec![ALPN_SKEIN_1.to_vec()];
    Self::new(Arc::new(config), server_name)
  }

  /// Trusts the certificates in a PEM file as roots
  pub fn from_authority_file(authority: &Path, server_name: &str) -> Result<Self, TlsConfigError> {
    let certs: Vec<Vec<u8>> = load_certificates(authority)?
      .into_iter()
      .map(|cert| cert.0)
      .collect();
    let mut roots = rustls::RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(&certs);
    tracing::debug!(added, ignored, "Loaded TLS authority certificates");
    if added == 0 {
      return Err(TlsConfigError::NoCertificates(authority.to_path_buf()));
    }
    Self::with_roots(roots, server_name)
  }
}

impl std::fmt::Debug for TlsClient {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("TlsClient")
      .field("server_name", &self.server_name)
      .finish_non_exhaustive()
  }
}

impl<S> StreamTransform<S> for TlsClient
where
  S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
  type Output = tokio_rustls::client::TlsStream<S>;

  fn transform(self, stream: S) -> BoxFuture<'static, io::Result<Self::Output>> {
    async move { self.connector.connect(self.server_name, stream).await }.boxed()
  }
}

#[cfg(test)]
mod tests {
  use super::{TlsClient, TlsConfigError};

  #[test]
  fn rejects_invalid_server_names() {
    let err = TlsClient::with_roots(rustls::RootCertStore::empty(), "not a hostname!")
      .expect_err("name must be rejected");
    assert!(matches!(err, TlsConfigError::InvalidServerName(_)));
  }

  #[test]
  fn missing_key_file_is_reported() {
    let dir = std::env::temp_dir().join("skein-tls-missing-key");
    let _ = std::fs::create_dir_all(&dir);
    let path = dir.join("empty.pem");
    std::fs::write(&path, b"").unwrap();
    let err = super::load_private_key(&path).expect_err("no key present");
    assert!(matches!(err, TlsConfigError::NoPrivateKey(_)));
  }
}
