//! Client and server talking over loopback sockets.

use std::sync::Arc;
use std::time::Duration;

use corews_client::{Client, ClientConfig, ClientError, ClientEvent};
use corews_protocol::CloseStatusCode;
use corews_server::{Server, ServerConfig, ServerEvent};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

fn server_config() -> ServerConfig {
    ServerConfig {
        read_timeout: Duration::from_millis(20),
        accept_poll_interval: Duration::from_millis(20),
        ..ServerConfig::default()
    }
}

fn client_config() -> ClientConfig {
    ClientConfig {
        handshake_retry_interval: Duration::from_millis(10),
        read_timeout: Duration::from_millis(20),
        ..ClientConfig::default()
    }
}

async fn start(server: Server) -> (Arc<Server>, JoinHandle<()>, u16) {
    let server = Arc::new(server);
    let server2 = Arc::clone(&server);
    let handle = tokio::spawn(async move {
        server2.run().await.unwrap();
    });

    let mut port = 0;
    for _ in 0..100 {
        port = server.port().await;
        if port > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(port > 0, "server did not bind");
    (server, handle, port)
}

async fn recv<T>(events: &mut mpsc::Receiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("event in time")
        .expect("channel open")
}

/// Skips events the test does not care about.
async fn recv_text(events: &mut mpsc::Receiver<ClientEvent>) -> String {
    loop {
        if let ClientEvent::Text(text) = recv(events).await {
            return text;
        }
    }
}

#[tokio::test]
async fn ping_pong_and_disconnect() {
    let (server, handle, port) = start(Server::new(server_config())).await;
    let mut server_events = server.take_events().await.unwrap();

    let client = Client::connect(&format!("ws://127.0.0.1:{port}/"), &[], client_config())
        .await
        .unwrap();
    let mut client_events = client.take_events().await.unwrap();
    let run = client.spawn().await.unwrap();

    let ServerEvent::ClientConnected { id, .. } = recv(&mut server_events).await else {
        panic!("expected ClientConnected");
    };
    assert!(server.is_registered(id).await);

    assert!(client.send_text("ping"));
    assert_eq!(
        recv(&mut server_events).await,
        ServerEvent::MessageReceived {
            id,
            text: "ping".into()
        }
    );

    assert_eq!(server.broadcast_text("pong").await, 1);
    assert_eq!(recv_text(&mut client_events).await, "pong");

    client.disconnect().await;
    assert_eq!(
        recv(&mut server_events).await,
        ServerEvent::ClientDisconnected {
            id,
            code: CloseStatusCode::NormalClosure
        }
    );

    tokio::time::sleep(server_config().accept_poll_interval).await;
    assert!(!server.is_registered(id).await);
    assert_eq!(server.connection_count().await, 0);
    assert_eq!(run.await.unwrap().code(), CloseStatusCode::NormalClosure);

    server.shutdown();
    handle.await.unwrap();
}

#[tokio::test]
async fn broadcast_reaches_every_client() {
    let (server, handle, port) = start(Server::new(server_config())).await;
    let mut server_events = server.take_events().await.unwrap();
    let url = format!("ws://127.0.0.1:{port}/room");

    let mut clients = Vec::new();
    for _ in 0..3 {
        let client = Client::connect(&url, &[], client_config()).await.unwrap();
        let events = client.take_events().await.unwrap();
        client.spawn().await.unwrap();
        clients.push((client, events));
    }
    for _ in 0..3 {
        assert!(matches!(
            recv(&mut server_events).await,
            ServerEvent::ClientConnected { .. }
        ));
    }

    assert_eq!(server.broadcast_text("hello all").await, 3);
    for (_, events) in &mut clients {
        assert_eq!(recv_text(events).await, "hello all");
    }

    server.shutdown();
    handle.await.unwrap();
    for (client, mut events) in clients {
        loop {
            match recv(&mut events).await {
                ClientEvent::Closed(close) => {
                    assert_eq!(close.code, CloseStatusCode::GoingAway);
                    break;
                }
                ClientEvent::Disconnected => panic!("expected a close handshake"),
                _ => {}
            }
        }
        assert!(!client.is_connected());
    }
}

#[tokio::test]
async fn credentials_travel_in_the_query() {
    let server = Server::new(server_config())
        .with_authenticator(|user, pwd| user == Some("alice") && pwd == Some("s3cret"));
    let (server, handle, port) = start(server).await;

    let denied = Client::connect(
        &format!("ws://127.0.0.1:{port}/?user=alice&pwd=guess"),
        &[],
        client_config(),
    )
    .await;
    assert!(matches!(denied, Err(ClientError::Connection(_))));

    let allowed = Client::connect(
        &format!("ws://127.0.0.1:{port}/?user=alice&pwd=s3cret"),
        &[],
        client_config(),
    )
    .await;
    assert!(allowed.is_ok());

    server.shutdown();
    handle.await.unwrap();
}

#[tokio::test]
async fn dropping_the_client_closes_normally() {
    let (server, handle, port) = start(Server::new(server_config())).await;
    let mut server_events = server.take_events().await.unwrap();

    let client = Client::connect(&format!("ws://127.0.0.1:{port}/"), &[], client_config())
        .await
        .unwrap();
    client.spawn().await.unwrap();
    let ServerEvent::ClientConnected { id, .. } = recv(&mut server_events).await else {
        panic!("expected ClientConnected");
    };

    drop(client);
    assert_eq!(
        recv(&mut server_events).await,
        ServerEvent::ClientDisconnected {
            id,
            code: CloseStatusCode::NormalClosure
        }
    );

    server.shutdown();
    handle.await.unwrap();
}
