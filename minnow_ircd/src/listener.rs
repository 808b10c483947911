//! Accepting and dialing connections.
//!
//! One accept-loop task per listener; one dial task per outbound link
//! attempt. Both mint a client id, set up the connection's I/O tasks, and
//! hand the new client to the event loop.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::{mpsc, watch};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use minnow_proto::Message;

use crate::config::LinkConfig;
use crate::connection::{spawn_io_tasks, ClientId, Connection};
use crate::event::{Event, NewClient};

pub(crate) fn spawn_accept_loop(
    listener: TcpListener,
    tls: Option<Arc<rustls::ServerConfig>>,
    server_name: String,
    next_id: Arc<AtomicU64>,
    events: mpsc::Sender<Event>,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        loop {
            select! {
                _ = shutdown.wait_for(|s| *s) => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            let id = next_id.fetch_add(1, Ordering::Relaxed);
                            setup_inbound(
                                id,
                                stream,
                                peer_addr.ip(),
                                tls.clone(),
                                server_name.clone(),
                                events.clone(),
                            );
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "failed to accept connection");
                        }
                    }
                }
            }
        }
        tracing::info!("listener shutting down");
    });
}

fn setup_inbound(
    id: ClientId,
    stream: TcpStream,
    peer_ip: IpAddr,
    tls: Option<Arc<rustls::ServerConfig>>,
    server_name: String,
    events: mpsc::Sender<Event>,
) {
    tokio::spawn(async move {
        let (conn, rx) = Connection::open(id, peer_ip, tls.is_some());

        match tls {
            Some(config) => {
                match TlsAcceptor::from(config).accept(stream).await {
                    Ok(tls_stream) => spawn_io_tasks(tls_stream, &conn, rx, events.clone()),
                    Err(e) => {
                        tracing::debug!(id, error = %e, "TLS accept failed");
                        return;
                    }
                }
            }
            None => spawn_io_tasks(stream, &conn, rx, events.clone()),
        }

        conn.send(&Message::new(
            "NOTICE",
            vec![
                "AUTH".to_string(),
                format!("*** Processing your connection to {}", server_name),
            ],
        ));

        let _ = events
            .send(Event::NewClient(NewClient { conn, link: None }))
            .await;
    });
}

/// Dial a configured server link. On success the PASS/CAPAB/SERVER
/// introduction is queued before the event loop hears about the client, so
/// the peer always sees it first.
pub(crate) fn spawn_dial(
    link: LinkConfig,
    timeout: Duration,
    tls: Option<Arc<rustls::ClientConfig>>,
    intro: Vec<Message>,
    next_id: Arc<AtomicU64>,
    events: mpsc::Sender<Event>,
) {
    tokio::spawn(async move {
        let addr = format!("{}:{}", link.hostname, link.port);
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                tracing::warn!(link = %link.name, error = %e, "unable to connect");
                return;
            }
            Err(_) => {
                tracing::warn!(link = %link.name, "connection attempt timed out");
                return;
            }
        };

        let peer_ip = stream
            .peer_addr()
            .map(|a| a.ip())
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let id = next_id.fetch_add(1, Ordering::Relaxed);
        let (conn, rx) = Connection::open(id, peer_ip, tls.is_some());

        match tls {
            Some(config) => {
                let name = match rustls::ServerName::try_from(link.hostname.as_str()) {
                    Ok(name) => name,
                    Err(e) => {
                        tracing::warn!(link = %link.name, error = %e, "bad TLS server name");
                        return;
                    }
                };
                match TlsConnector::from(config).connect(name, stream).await {
                    Ok(tls_stream) => spawn_io_tasks(tls_stream, &conn, rx, events.clone()),
                    Err(e) => {
                        tracing::warn!(link = %link.name, error = %e, "TLS handshake failed");
                        return;
                    }
                }
            }
            None => spawn_io_tasks(stream, &conn, rx, events.clone()),
        }

        for message in &intro {
            conn.send(message);
        }

        let _ = events
            .send(Event::NewClient(NewClient {
                conn,
                link: Some(link.name.clone()),
            }))
            .await;
    });
}
