// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{
  sync::{Arc, Mutex},
  time::Duration,
};

use skein::{
  client::{self, ClientError},
  common::{
    protocol::{
      connection::{Connection, ConnectionOptions, ConnectionSide},
      stream::{StreamCloseReason, StreamError, StreamId, StreamLifetimeHandler},
    },
    settings::ConnectionSettings,
    transport::TransportInfo,
  },
  server::ConnectionServer,
  util::{
    adapter::{ReadOptions, WriteOptions},
    cancellation::CancellationListener,
    duplex::Channel,
    tls::{TlsClient, TlsServer},
  },
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

mod support;

const TIMEOUT: Duration = Duration::from_secs(10);

struct TestAuthority {
  server: TlsServer,
  roots: rustls::RootCertStore,
}

fn test_authority() -> TestAuthority {
  let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
  let cert_der = cert.serialize_der().unwrap();
  let key_der = cert.serialize_private_key_der();
  let server = TlsServer::from_certificate(
    vec![rustls::Certificate(cert_der.clone())],
    rustls::PrivateKey(key_der),
  )
  .unwrap();
  let mut roots = rustls::RootCertStore::empty();
  roots.add(&rustls::Certificate(cert_der)).unwrap();
  TestAuthority { server, roots }
}

#[tokio::test]
async fn connections_run_over_tls_transports() {
  support::init_tracing();
  let authority = test_authority();
  let (acceptor, connector) = support::memory_transport();
  let server = ConnectionServer::new(acceptor, authority.server, ConnectionOptions::default());
  let shutdown = CancellationToken::new();
  let serving = {
    let listener = CancellationListener::from(&shutdown);
    tokio::spawn(async move { server.serve(support::echo_handler(), listener).await })
  };

  let tls = TlsClient::with_roots(authority.roots, "localhost").unwrap();
  let connection = tokio::time::timeout(
    TIMEOUT,
    client::connect(connector.connect().await, tls, &ConnectionOptions::default()),
  )
  .await
  .unwrap()
  .unwrap();

  let mut stream = connection.open_stream().await.unwrap();
  stream.write_all(b"over tls").await.unwrap();
  stream.shutdown().await.unwrap();
  let mut reply = Vec::new();
  tokio::time::timeout(TIMEOUT, stream.read_to_end(&mut reply))
    .await
    .unwrap()
    .unwrap();
  assert_eq!(reply, b"over tls");

  drop(stream);
  drop(connection);
  shutdown.cancel();
  tokio::time::timeout(TIMEOUT, serving)
    .await
    .expect("server stops")
    .unwrap()
    .unwrap();
}

#[tokio::test]
async fn mismatched_server_names_fail_the_transform() {
  let authority = test_authority();
  let (acceptor, connector) = support::memory_transport();
  let server = ConnectionServer::new(acceptor, authority.server, ConnectionOptions::default());
  let shutdown = CancellationToken::new();
  let serving = {
    let listener = CancellationListener::from(&shutdown);
    tokio::spawn(async move { server.serve(support::echo_handler(), listener).await })
  };

  let tls = TlsClient::with_roots(authority.roots, "elsewhere.example").unwrap();
  let res = tokio::time::timeout(
    TIMEOUT,
    client::connect(connector.connect().await, tls, &ConnectionOptions::default()),
  )
  .await
  .unwrap();
  assert!(matches!(res, Err(ClientError::TransformInitializationFailed(_))));

  shutdown.cancel();
  tokio::time::timeout(TIMEOUT, serving)
    .await
    .expect("server stops")
    .unwrap()
    .unwrap();
}

#[tokio::test]
async fn tls_layers_over_individual_streams() {
  let authority = test_authority();
  let (a, b) = tokio::io::duplex(64 * 1024);
  let (listening, connecting) = tokio::join!(
    Connection::establish(
      Channel::from_stream(a),
      ConnectionSide::Listen,
      ConnectionSettings::default(),
      TransportInfo::unidentified(),
    ),
    Connection::establish(
      Channel::from_stream(b),
      ConnectionSide::Connect,
      ConnectionSettings::default(),
      TransportInfo::unidentified(),
    ),
  );
  let (listening, connecting) = (listening.unwrap(), connecting.unwrap());

  let outbound = connecting.open_stream().await.unwrap();
  let inbound = listening.accept_stream().await.unwrap();
  let tls = TlsClient::with_roots(authority.roots, "localhost").unwrap();
  let (client_side, server_side) = tokio::time::timeout(TIMEOUT, async {
    tokio::join!(
      outbound.wrap(tls, ReadOptions::default(), WriteOptions::default()),
      inbound.wrap(
        authority.server,
        ReadOptions::default(),
        WriteOptions::default()
      ),
    )
  })
  .await
  .expect("handshake completes");
  let (mut client_side, mut server_side) = (client_side.unwrap(), server_side.unwrap());

  client_side.write_all(b"ping").await.unwrap();
  client_side.flush().await.unwrap();
  let mut request = [0u8; 4];
  server_side.read_exact(&mut request).await.unwrap();
  assert_eq!(&request, b"ping");
  server_side.write_all(b"pong").await.unwrap();
  server_side.flush().await.unwrap();
  let mut response = [0u8; 4];
  client_side.read_exact(&mut response).await.unwrap();
  assert_eq!(&response, b"pong");

  let (client_disposed, server_disposed) =
    tokio::time::timeout(TIMEOUT, async { tokio::join!(client_side.dispose(), server_side.dispose()) })
      .await
      .expect("disposal completes");
  client_disposed.unwrap();
  server_disposed.unwrap();
}

#[tokio::test]
async fn failed_stream_handshakes_close_the_stream() {
  let (a, b) = tokio::io::duplex(64 * 1024);
  let (listening, connecting) = tokio::join!(
    Connection::establish(
      Channel::from_stream(a),
      ConnectionSide::Listen,
      ConnectionSettings::default(),
      TransportInfo::unidentified(),
    ),
    Connection::establish(
      Channel::from_stream(b),
      ConnectionSide::Connect,
      ConnectionSettings::default(),
      TransportInfo::unidentified(),
    ),
  );
  let (listening, connecting) = (listening.unwrap(), connecting.unwrap());

  let mut outbound = connecting.open_stream().await.unwrap();
  let inbound = listening.accept_stream().await.unwrap();
  let context = inbound.context().clone();
  // Plaintext where a ClientHello belongs
  outbound.write_all(b"definitely not tls").await.unwrap();
  outbound.shutdown().await.unwrap();

  let authority = test_authority();
  let res = tokio::time::timeout(
    TIMEOUT,
    inbound.wrap(authority.server, ReadOptions::default(), WriteOptions::default()),
  )
  .await
  .unwrap();
  assert!(res.is_err());
  assert!(matches!(
    context.close_reason(),
    Some(StreamCloseReason::TransformInitializationFailed(_))
  ));
  assert!(listening.registry().get(context.id()).is_none());
}

#[tokio::test]
async fn cancelled_stream_handshakes_close_the_stream_once() {
  let closed: Arc<Mutex<Vec<(StreamId, StreamCloseReason)>>> = Arc::default();
  let observer = {
    let closed = Arc::clone(&closed);
    move |stream_id: StreamId, reason: &StreamCloseReason| {
      closed.lock().unwrap().push((stream_id, reason.clone()));
    }
  };
  let (a, b) = tokio::io::duplex(64 * 1024);
  let (listening, connecting) = tokio::join!(
    Connection::establish_with_observer(
      Channel::from_stream(a),
      ConnectionSide::Listen,
      ConnectionSettings::default(),
      TransportInfo::unidentified(),
      Some(Arc::new(observer) as Arc<dyn StreamLifetimeHandler>),
    ),
    Connection::establish(
      Channel::from_stream(b),
      ConnectionSide::Connect,
      ConnectionSettings::default(),
      TransportInfo::unidentified(),
    ),
  );
  let (listening, connecting) = (listening.unwrap(), connecting.unwrap());

  // Opened but silent, so the server handshake waits for a ClientHello forever
  let _outbound = connecting.open_stream().await.unwrap();
  let inbound = listening.accept_stream().await.unwrap();
  let context = inbound.context().clone();

  let authority = test_authority();
  let cancel = CancellationToken::new();
  let handshake = {
    let listener = CancellationListener::from(&cancel);
    tokio::spawn(async move {
      inbound
        .wrap_until(
          authority.server,
          ReadOptions::default(),
          WriteOptions::default(),
          &listener,
        )
        .await
        .map(|_| ())
    })
  };
  tokio::time::sleep(Duration::from_millis(50)).await;
  assert!(!handshake.is_finished());
  cancel.cancel();

  let res = tokio::time::timeout(TIMEOUT, handshake)
    .await
    .expect("cancellation ends the handshake")
    .unwrap();
  assert!(matches!(res, Err(StreamError::Cancelled)));
  assert!(matches!(
    context.close_reason(),
    Some(StreamCloseReason::Cancelled)
  ));
  assert!(listening.registry().get(context.id()).is_none());

  tokio::task::yield_now().await;
  let notifications: Vec<_> = closed
    .lock()
    .unwrap()
    .iter()
    .filter(|(stream_id, _)| *stream_id == context.id())
    .map(|(_, reason)| reason.clone())
    .collect();
  assert_eq!(notifications.len(), 1);
  assert!(matches!(notifications[0], StreamCloseReason::Cancelled));
}
