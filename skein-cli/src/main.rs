// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
#![warn(unused_imports)]

use anyhow::{Context as AnyhowContext, Result};
use clap::{Arg, ArgMatches, Command};
use skein::{common::settings::ConnectionSettings, util};
use std::path::{Path, PathBuf};

use util::validators::{
  parse_positive_u32, parse_socketaddr, validate_existing_file, validate_positive_u32,
  validate_socketaddr,
};

mod certgen;
mod client;
mod server;

fn main() {
  let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("skein=debug,info"));
  let collector = tracing_subscriber::fmt()
    .pretty()
    .with_env_filter(env_filter)
    .finish();
  tracing::subscriber::set_global_default(collector).expect("Logger init must succeed");
  let app = Command::new(env!("CARGO_BIN_NAME"))
    .version(env!("CARGO_PKG_VERSION"))
    .about(env!("CARGO_PKG_DESCRIPTION"))
    .subcommand(
      Command::new("client")
        .alias("-c")
        .about("Open streams to a server and verify that each is echoed back")
        .arg(
          Arg::new("server")
            .long("server")
            .short('d')
            .validator(validate_socketaddr)
            .takes_value(true)
            .required(true),
        )
        .arg(
          Arg::new("authority")
            .help("PEM certificates to trust instead of the platform roots")
            .long("authority")
            .short('a')
            .validator(validate_existing_file)
            .takes_value(true)
            .required(false),
        )
        .arg(
          Arg::new("server-san")
            .long("server-san")
            .visible_alias("san")
            .short('s')
            .takes_value(true)
            .default_value("localhost"),
        )
        .arg(Arg::new("tls").long("tls").help("Secure the transport with TLS"))
        .arg(
          Arg::new("quic")
            .long("quic")
            .short('q')
            .help("Connect over QUIC rather than TCP"),
        )
        .arg(
          Arg::new("streams")
            .long("streams")
            .short('n')
            .validator(validate_positive_u32)
            .default_value("4")
            .takes_value(true),
        )
        .arg(
          Arg::new("payload-size")
            .long("payload-size")
            .short('b')
            .validator(validate_positive_u32)
            .default_value("65536")
            .takes_value(true),
        )
        .arg(settings_arg()),
    )
    .subcommand(
      Command::new("server")
        .alias("-s")
        .about("Accept connections and echo every stream back to its opener")
        .arg(
          Arg::new("cert")
            .long("cert")
            .short('c')
            .validator(validate_existing_file)
            .takes_value(true)
            .requires("key"),
        )
        .arg(
          Arg::new("key")
            .long("key")
            .short('k')
            .validator(validate_existing_file)
            .takes_value(true)
            .requires("cert"),
        )
        .arg(
          Arg::new("bind")
            .long("bind")
            .short('b')
            .validator(validate_socketaddr)
            .default_value("127.0.0.1:9090")
            .takes_value(true),
        )
        .arg(
          Arg::new("quic")
            .help("Accept QUIC connections rather than TCP; requires a certificate")
            .long("quic")
            .short('q')
            .requires_all(&["cert", "key"]),
        )
        .arg(settings_arg()),
    )
    .subcommand(
      Command::new("cert")
        .about("Generate self-signed certificates for local usage")
        .arg(Arg::new("path").takes_value(true).required(true))
        .arg(
          Arg::new("san")
            .long("san")
            .takes_value(true)
            .required(false)
            .default_value("localhost"),
        ),
    )
    .subcommand_required(true)
    .arg_required_else_help(true);
  let matches = app.get_matches();
  let mode = matches.subcommand_name().unwrap_or("<No subcommand?>");
  let handler = main_args_handler(&matches);
  let rt = tokio::runtime::Builder::new_multi_thread()
    .thread_name("tokio-reactor-worker")
    .enable_all()
    .build()
    .expect("Tokio Runtime setup failure");
  match rt.block_on(handler) {
    Err(err) => {
      tracing::error!(mode = mode, err = ?err, "dispatch_command_failure");
      std::process::exit(1);
    }
    Ok(_) => tracing::info!("{} exited successfully", mode),
  }
}

fn settings_arg() -> Arg<'static> {
  Arg::new("settings")
    .help("JSON file of connection settings to advertise; omitted fields keep their defaults")
    .long("settings")
    .validator(validate_existing_file)
    .takes_value(true)
}

/// Reads advertised settings from a JSON file, falling back to the defaults
pub fn load_settings(path: Option<&Path>) -> Result<ConnectionSettings> {
  let path = match path {
    Some(path) => path,
    None => return Ok(ConnectionSettings::default()),
  };
  let raw = std::fs::read_to_string(path)
    .with_context(|| format!("Failed reading settings file {:?}", path))?;
  let settings: ConnectionSettings =
    serde_json::from_str(&raw).context("Settings file must be a JSON settings object")?;
  settings
    .validated()
    .context("Settings file holds out-of-range values")
}

pub async fn client_arg_handling(args: &'_ ArgMatches) -> Result<client::ClientArgs> {
  let settings = load_settings(args.value_of("settings").map(Path::new))?;
  Ok(client::ClientArgs {
    authority_cert: args.value_of("authority").map(PathBuf::from),
    server_host: parse_socketaddr(args.value_of("server").unwrap())?,
    server_san: args.value_of("server-san").unwrap().into(),
    tls: args.is_present("tls"),
    quic: args.is_present("quic"),
    streams: parse_positive_u32(args.value_of("streams").unwrap())?,
    payload_size: parse_positive_u32(args.value_of("payload-size").unwrap())? as usize,
    settings,
  })
}

pub async fn server_arg_handling(args: &'_ ArgMatches) -> Result<server::ServerArgs> {
  let certificate = match (args.value_of("cert"), args.value_of("key")) {
    (Some(cert), Some(key)) => Some(server::CertificateFiles {
      cert: Path::new(cert).to_path_buf(),
      key: Path::new(key).to_path_buf(),
    }),
    _ => None,
  };
  Ok(server::ServerArgs {
    certificate,
    bind_addr: parse_socketaddr(args.value_of("bind").unwrap())?,
    quic: args.is_present("quic"),
    settings: load_settings(args.value_of("settings").map(Path::new))?,
  })
}

async fn main_args_handler(matches: &'_ ArgMatches) -> Result<()> {
  match matches
    .subcommand()
    .expect("Subcommand is marked as required")
  {
    ("server", opts) => {
      let config = server_arg_handling(opts).await?;
      tracing::info!("Running as server with config {:#?}", config);
      server::server_main(config).await
    }
    ("client", opts) => {
      let config = client_arg_handling(opts).await?;
      tracing::info!("Running as client with config {:#?}", config);
      client::client_main(config).await
    }
    ("cert", opts) => {
      tracing::info!("Generating certs...");
      let path_raw = opts.value_of("path").expect("Path argument is required");
      let san = opts.value_of("san").expect("SAN argument must exist");
      certgen::certgen_main(path_raw.into(), san.into()).await
    }
    (_, _) => unreachable!(),
  }
}
