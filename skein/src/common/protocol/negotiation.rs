// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const SKEIN_PREFACE_MAGIC: &[u8; 4] = b"SKNM";

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ProtocolVersion {
  V1 = 1,
}

impl ProtocolVersion {
  pub const ALL: &'static [ProtocolVersion] = &[ProtocolVersion::V1];

  fn bit(self) -> u8 {
    1 << (self as u8 - 1)
  }
}

/// A set of protocol versions, carried on the wire as a bitmask
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ProtocolVersions(u8);

impl ProtocolVersions {
  pub fn supported() -> Self {
    ProtocolVersion::ALL
      .iter()
      .fold(Self::empty(), |set, version| set.with(*version))
  }

  pub const fn empty() -> Self {
    Self(0)
  }

  pub const fn from_bits(bits: u8) -> Self {
    Self(bits)
  }

  pub fn bits(&self) -> u8 {
    self.0
  }

  pub fn with(self, version: ProtocolVersion) -> Self {
    Self(self.0 | version.bit())
  }

  pub fn contains(&self, version: ProtocolVersion) -> bool {
    self.0 & version.bit() != 0
  }

  pub fn highest_common(&self, other: &ProtocolVersions) -> Option<ProtocolVersion> {
    ProtocolVersion::ALL
      .iter()
      .rev()
      .copied()
      .find(|version| self.contains(*version) && other.contains(*version))
  }
}

impl std::fmt::Debug for ProtocolVersions {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "ProtocolVersions({:#010b})", self.0)
  }
}

#[derive(thiserror::Error, Debug)]
pub enum NegotiationError {
  #[error("Failed reading connection preface: {0}")]
  ReadError(#[source] std::io::Error),
  #[error("Failed writing connection preface: {0}")]
  WriteError(#[source] std::io::Error),
  #[error("Peer did not send a valid connection preface")]
  ProtocolViolation,
  #[error("No common protocol version; local {local:?}, remote {remote:?}")]
  UnsupportedProtocolVersion {
    local: ProtocolVersions,
    remote: ProtocolVersions,
  },
}

/// Exchanges connection prefaces with the peer and selects the protocol version
///
/// Both sides write before reading, so the exchange completes regardless of which
/// side speaks first.
#[tracing::instrument(level = "debug", skip(link), err)]
pub async fn exchange_preface<S>(
  link: &mut S,
  local: ProtocolVersions,
) -> Result<ProtocolVersion, NegotiationError>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  link
    .write_all(SKEIN_PREFACE_MAGIC)
    .await
    .map_err(NegotiationError::WriteError)?;
  link
    .write_u8(local.bits())
    .await
    .map_err(NegotiationError::WriteError)?;
  link.flush().await.map_err(NegotiationError::WriteError)?;

  let mut remote_magic = [0u8; 4];
  link
    .read_exact(&mut remote_magic)
    .await
    .map_err(NegotiationError::ReadError)?;
  if &remote_magic != SKEIN_PREFACE_MAGIC {
    return Err(NegotiationError::ProtocolViolation);
  }
  let remote = ProtocolVersions::from_bits(
    link
      .read_u8()
      .await
      .map_err(NegotiationError::ReadError)?,
  );
  local
    .highest_common(&remote)
    .ok_or(NegotiationError::UnsupportedProtocolVersion { local, remote })
}

#[cfg(test)]
mod tests {
  use tokio::io::{AsyncReadExt, AsyncWriteExt};

  use super::{exchange_preface, NegotiationError, ProtocolVersion, ProtocolVersions};

  #[tokio::test]
  async fn both_sides_select_the_same_version() {
    let (mut a, mut b) = tokio::io::duplex(64);
    let (left, right) = tokio::join!(
      exchange_preface(&mut a, ProtocolVersions::supported()),
      exchange_preface(&mut b, ProtocolVersions::supported()),
    );
    assert_eq!(left.unwrap(), ProtocolVersion::V1);
    assert_eq!(right.unwrap(), ProtocolVersion::V1);
  }

  #[tokio::test]
  async fn disjoint_versions_are_unsupported() {
    let (mut a, mut b) = tokio::io::duplex(64);
    let (left, right) = tokio::join!(
      exchange_preface(&mut a, ProtocolVersions::supported()),
      exchange_preface(&mut b, ProtocolVersions::from_bits(0b10)),
    );
    assert!(matches!(
      left,
      Err(NegotiationError::UnsupportedProtocolVersion { .. })
    ));
    assert!(matches!(
      right,
      Err(NegotiationError::UnsupportedProtocolVersion { .. })
    ));
  }

  #[tokio::test]
  async fn wrong_magic_is_a_protocol_violation() {
    let (mut a, mut b) = tokio::io::duplex(64);
    b.write_all(b"HTTP/1.1").await.unwrap();
    let res = exchange_preface(&mut a, ProtocolVersions::supported()).await;
    assert!(matches!(res, Err(NegotiationError::ProtocolViolation)));
    let mut sent = [0u8; 5];
    b.read_exact(&mut sent).await.unwrap();
    assert_eq!(&sent[..4], b"SKNM");
  }

  #[test]
  fn version_sets() {
    let supported = ProtocolVersions::supported();
    assert!(supported.contains(ProtocolVersion::V1));
    assert_eq!(
      supported.highest_common(&ProtocolVersions::empty()),
      None
    );
  }
}
