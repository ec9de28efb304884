//! Relay orchestration: builds the server from configuration and re-broadcasts
//! every message to all open clients.

use std::sync::Arc;

use anyhow::Context;
use corews_connection::RustlsAcceptor;
use corews_protocol::Frame;
use corews_server::{Server, ServerConfig, ServerEvent};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;

/// Runs the relay until Ctrl-C.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let server = Arc::new(build_server(&config)?);
    let events = server
        .take_events()
        .await
        .context("server events already taken")?;

    let server_run = Arc::clone(&server);
    let server_task = tokio::spawn(async move {
        if let Err(e) = server_run.run().await {
            tracing::error!("server error: {e}");
        }
    });

    let cancel = CancellationToken::new();
    let relay_task = tokio::spawn(relay(Arc::clone(&server), events, cancel.clone()));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
        _ = cancel.cancelled() => {}
    }

    cancel.cancel();
    server.shutdown();
    server_task.await?;
    relay_task.await?;
    Ok(())
}

/// Creates the server described by `config`, with authentication and TLS
/// when configured.
pub fn build_server(config: &Config) -> anyhow::Result<Server> {
    let server_config = ServerConfig {
        port: config.port,
        upgrade_timeout: config.upgrade_timeout(),
        ..ServerConfig::default()
    };
    let mut server = Server::new(server_config);

    if !config.users.is_empty() {
        let users = Arc::new(config.users.clone());
        tracing::info!(users = users.len(), "authentication enabled");
        server = server.with_authenticator(move |user, pwd| match (user, pwd) {
            (Some(user), Some(pwd)) => users.get(user).is_some_and(|expected| expected == pwd),
            _ => false,
        });
    }

    if let Some(tls) = &config.tls {
        let acceptor = RustlsAcceptor::from_pem_files(&tls.cert_path, &tls.key_path)
            .with_context(|| format!("loading TLS certificate {}", tls.cert_path.display()))?;
        server = server.with_tls(Arc::new(acceptor));
        tracing::info!(cert = %tls.cert_path.display(), "TLS enabled");
    }

    Ok(server)
}

/// Forwards every text and binary message to all open clients, the sender
/// included.
pub async fn relay(
    server: Arc<Server>,
    mut events: mpsc::Receiver<ServerEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match event {
            ServerEvent::ClientConnected { id, peer_addr } => {
                tracing::info!(id, %peer_addr, "client joined");
            }
            ServerEvent::MessageReceived { id, text } => {
                let delivered = server.broadcast_text(&text).await;
                tracing::debug!(id, delivered, "relayed text");
            }
            ServerEvent::BinaryReceived { id, data } => {
                let delivered = server.broadcast(Frame::binary(data)).await;
                tracing::debug!(id, delivered, "relayed binary");
            }
            ServerEvent::FragmentReceived { id, .. } => {
                tracing::warn!(id, "dropping fragmented message");
            }
            ServerEvent::ClientDisconnected { id, code } => {
                tracing::info!(id, %code, "client left");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corews_client::{Client, ClientConfig, ClientEvent};
    use std::path::PathBuf;
    use std::time::Duration;

    async fn start(config: &Config) -> (Arc<Server>, CancellationToken, u16) {
        let server = Arc::new(build_server(config).unwrap());
        let events = server.take_events().await.unwrap();
        let cancel = CancellationToken::new();

        let server_run = Arc::clone(&server);
        tokio::spawn(async move { server_run.run().await.unwrap() });
        tokio::spawn(relay(Arc::clone(&server), events, cancel.clone()));

        let mut port = 0;
        for _ in 0..100 {
            port = server.port().await;
            if port > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(port > 0);
        (server, cancel, port)
    }

    async fn next_text(events: &mut mpsc::Receiver<ClientEvent>) -> String {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
                .await
                .unwrap()
                .unwrap();
            if let ClientEvent::Text(text) = event {
                return text;
            }
        }
    }

    fn test_config() -> Config {
        Config {
            port: 0,
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn text_is_relayed_to_every_client() {
        let (server, cancel, port) = start(&test_config()).await;
        let url = format!("ws://127.0.0.1:{port}/");

        let alice = Client::connect(&url, &[], ClientConfig::default()).await.unwrap();
        let bob = Client::connect(&url, &[], ClientConfig::default()).await.unwrap();
        let mut alice_events = alice.take_events().await.unwrap();
        let mut bob_events = bob.take_events().await.unwrap();
        alice.spawn().await.unwrap();
        bob.spawn().await.unwrap();

        // Both registered and open before relaying.
        for _ in 0..100 {
            if server.connection_count().await == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(alice.send_text("hi bob"));
        assert_eq!(next_text(&mut bob_events).await, "hi bob");
        assert_eq!(next_text(&mut alice_events).await, "hi bob");

        cancel.cancel();
        server.shutdown();
    }

    #[tokio::test]
    async fn configured_users_are_enforced() {
        let mut config = test_config();
        config.users.insert("alice".into(), "s3cret".into());
        let (server, cancel, port) = start(&config).await;

        let url = format!("ws://127.0.0.1:{port}/");
        let anonymous = Client::connect(&url, &[], ClientConfig::default()).await;
        assert!(anonymous.is_err());

        let alice = Client::connect(
            &format!("ws://127.0.0.1:{port}/?user=alice&pwd=s3cret"),
            &[],
            ClientConfig::default(),
        )
        .await;
        assert!(alice.is_ok());

        cancel.cancel();
        server.shutdown();
    }

    #[test]
    fn missing_certificate_fails_to_build() {
        let config = Config {
            tls: Some(crate::config::TlsConfig {
                cert_path: PathBuf::from("/nonexistent/cert.pem"),
                key_path: PathBuf::from("/nonexistent/key.pem"),
            }),
            ..test_config()
        };
        let err = build_server(&config).err().unwrap();
        assert!(err.to_string().contains("loading TLS certificate"));
    }

    #[test]
    fn plain_config_builds_insecure_server() {
        let server = build_server(&test_config()).unwrap();
        assert!(!server.is_secure());
    }
}
