//! Persistent connections: typed client over `ConnectionLink`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use linkwire::client::links::ConnectionLink;
use linkwire::client::RpcClient;
use linkwire::codec::PayloadCodec;
use linkwire::context::Context;
use linkwire::observable::{Observable, Teardown};
use linkwire::rpc_error::{ErrorKind, NormalizedError};
use linkwire::server::{serve_connection, ConnectionConfig, ProcedureBuilder, Router, Server};

fn server(torn_down: Arc<AtomicUsize>) -> Server {
    let router = Router::builder()
        .register(
            "whoami",
            ProcedureBuilder::new().query(|_: (), frame| async move {
                Ok(frame.ctx.get::<String>("peer").cloned().unwrap_or_default())
            }),
        )
        .unwrap()
        .register(
            "add",
            ProcedureBuilder::new().mutation(|(a, b): (i64, i64), _| async move { Ok(a + b) }),
        )
        .unwrap()
        .register(
            "deny",
            ProcedureBuilder::new().query(|_: (), _| async move {
                Err::<(), _>(NormalizedError::forbidden("not for you"))
            }),
        )
        .unwrap()
        .register(
            "feed",
            ProcedureBuilder::new().subscription(move |_: (), _| {
                let torn_down = torn_down.clone();
                async move {
                    Ok(Observable::<&'static str, NormalizedError>::new(move |s| {
                        s.next("first");
                        s.next("second");
                        let torn_down = torn_down.clone();
                        Teardown::new(move || {
                            torn_down.fetch_add(1, Ordering::SeqCst);
                        })
                    }))
                }
            }),
        )
        .unwrap()
        .build();
    Server::new(router)
}

fn connected(codec: PayloadCodec, torn_down: Arc<AtomicUsize>) -> (RpcClient, ConnectionLink) {
    let config = ConnectionConfig {
        codec,
        ..ConnectionConfig::default()
    };
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    tokio::spawn(serve_connection(
        server(torn_down),
        server_io,
        Context::new().with("peer", "duplex".to_string()),
        config.clone(),
    ));

    let link = ConnectionLink::new(client_io, config);
    let client = RpcClient::builder().link(link.clone()).build();
    (client, link)
}

#[tokio::test]
async fn test_calls_over_both_codecs() {
    for codec in [PayloadCodec::Json, PayloadCodec::MsgPack] {
        let (client, link) = connected(codec, Arc::default());

        let peer: String = client.query("whoami", &()).await.unwrap();
        assert_eq!(peer, "duplex");
        let sum: i64 = client.mutation("add", &(2, 40)).await.unwrap();
        assert_eq!(sum, 42);
        assert_eq!(link.pending(), 0);
    }
}

#[tokio::test]
async fn test_concurrent_calls_multiplexed() {
    let (client, _link) = connected(PayloadCodec::Json, Arc::default());
    let calls = (0..20i64).map(|n| {
        let client = client.clone();
        async move { client.mutation::<_, i64>("add", &(n, n)).await.unwrap() }
    });
    let sums = futures::future::join_all(calls).await;
    assert_eq!(sums, (0..20).map(|n| n * 2).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_server_error_over_connection() {
    let (client, _link) = connected(PayloadCodec::MsgPack, Arc::default());
    let err = client.query::<_, ()>("deny", &()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);
    assert_eq!(err.message(), "not for you");
    assert_eq!(err.http_status(), 403);
}

#[tokio::test]
async fn test_subscription_teardown_reaches_server_once() {
    let torn_down = Arc::new(AtomicUsize::new(0));
    let (client, link) = connected(PayloadCodec::Json, torn_down.clone());

    let mut feed = client.subscribe::<_, String>("feed", &()).into_stream();
    assert_eq!(feed.next().await.unwrap().unwrap(), "first");
    assert_eq!(feed.next().await.unwrap().unwrap(), "second");
    feed.close();
    feed.close();
    drop(feed);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(torn_down.load(Ordering::SeqCst), 1);
    assert_eq!(link.pending(), 0);
}

#[tokio::test]
async fn test_closed_link_fails_new_calls() {
    let (client, link) = connected(PayloadCodec::Json, Arc::default());
    link.close();
    let err = client.query::<_, String>("whoami", &()).await.unwrap_err();
    assert!(err.is_transport_failure());
}

#[cfg(unix)]
#[tokio::test]
async fn test_unix_socket_round_trip() {
    use linkwire::transport::{generate_socket_path, serve_socket, SocketListener};
    use tokio_util::sync::CancellationToken;

    let path = generate_socket_path();
    let listener = SocketListener::bind(&path).unwrap();
    let shutdown = CancellationToken::new();
    let serving = tokio::spawn(serve_socket(
        server(Arc::default()),
        listener,
        || Context::new().with("peer", "socket".to_string()),
        ConnectionConfig::default(),
        shutdown.clone(),
    ));

    let link = ConnectionLink::connect_socket(&path, ConnectionConfig::default())
        .await
        .unwrap();
    let client = RpcClient::builder().link(link).build();

    let peer: String = client.query("whoami", &()).await.unwrap();
    assert_eq!(peer, "socket");
    let sum: i64 = client.mutation("add", &(1, 2)).await.unwrap();
    assert_eq!(sum, 3);

    shutdown.cancel();
    serving.await.unwrap().unwrap();
    assert!(!path.exists());
}
