// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Context as AnyhowContext, Result};
use std::{fs, path::PathBuf};
use tracing::instrument;

/// Writes a self-signed certificate for `host_san` to `<base>.pub.pem` and its key to `<base>.priv.pem`
#[instrument]
pub async fn certgen_main(output_base_path: String, host_san: String) -> Result<()> {
  let path = PathBuf::from(output_base_path);
  let base_name = path
    .file_name()
    .and_then(|name| name.to_str())
    .map(str::to_string)
    .context("Certificate path must end in a UTF-8 file name")?;
  if let Some(parent) = path.parent() {
    fs::create_dir_all(parent).context("Directory creation must succeed for certs")?;
  }
  let cert =
    rcgen::generate_simple_self_signed(vec![host_san]).context("Certificate generation failed")?;
  let public_pem = cert.serialize_pem()?;
  let private_pem = cert.serialize_private_key_pem();
  let public_path = path.with_file_name(format!("{}.pub.pem", base_name));
  let private_path = path.with_file_name(format!("{}.priv.pem", base_name));
  fs::write(&public_path, &public_pem).context("Failed writing public key")?;
  fs::write(&private_path, &private_pem).context("Failed writing private key")?;
  tracing::info!(public = ?public_path, private = ?private_path, "Certificate written");
  Ok(())
}
