//! # Reconnection Supervisor
//!
//! Owns the single persistent socket to the backend and keeps redialing it.
//!
//! ## Link States:
//! 1. **Disconnected**: no socket, the router falls back to the callback
//! 2. **Connecting**: dial in progress
//! 3. **Connected**: a writer queue is installed in the [`BackendLink`]
//!
//! After a drop the supervisor waits a fixed delay and dials again, forever.
//! Nothing is buffered across connections: each `Connected` state starts with
//! an empty writer queue, and every frame still queued when a socket dies is
//! failed back to its sender.

use crate::bridge::control::ControlHandler;
use crate::error::DeliveryFailed;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type BackendStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One text frame waiting for the socket writer, plus the channel its write
/// result is reported on.
#[derive(Debug)]
pub(crate) struct QueuedFrame {
    pub(crate) text: String,
    pub(crate) written: oneshot::Sender<Result<(), String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

/// Shared view of the persistent backend socket.
///
/// The router reads it on every delivery; only the supervisor writes it.
#[derive(Debug)]
pub struct BackendLink {
    state: RwLock<LinkState>,
    sender: RwLock<Option<mpsc::UnboundedSender<QueuedFrame>>>,
}

impl Default for BackendLink {
    fn default() -> Self {
        Self {
            state: RwLock::new(LinkState::Disconnected),
            sender: RwLock::new(None),
        }
    }
}

impl BackendLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> LinkState {
        *self.state.read()
    }

    /// True while a writer queue is installed and its task is still running.
    pub fn is_open(&self) -> bool {
        self.sender
            .read()
            .as_ref()
            .map(|tx| !tx.is_closed())
            .unwrap_or(false)
    }

    /// Write a text frame on the open socket and wait until the writer has
    /// handed it to the wire.
    pub async fn send(&self, text: String) -> Result<(), DeliveryFailed> {
        let (written, result) = oneshot::channel();
        let queued = self
            .sender
            .read()
            .as_ref()
            .map(|tx| tx.send(QueuedFrame { text, written }).is_ok())
            .unwrap_or(false);

        if !queued {
            return Err(DeliveryFailed::ChannelError(
                "backend socket closed during send".to_string(),
            ));
        }

        match result.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(DeliveryFailed::ChannelError(format!(
                "backend socket write failed: {}",
                err
            ))),
            Err(_) => Err(DeliveryFailed::ChannelError(
                "backend socket closed before the frame was written".to_string(),
            )),
        }
    }

    pub(crate) fn set_connecting(&self) {
        *self.state.write() = LinkState::Connecting;
    }

    pub(crate) fn attach(&self, tx: mpsc::UnboundedSender<QueuedFrame>) {
        *self.sender.write() = Some(tx);
        *self.state.write() = LinkState::Connected;
    }

    pub(crate) fn detach(&self) {
        *self.sender.write() = None;
        *self.state.write() = LinkState::Disconnected;
    }
}

pub struct ReconnectionSupervisor {
    url: String,
    delay: Duration,
    link: Arc<BackendLink>,
    control: Arc<ControlHandler>,
}

impl ReconnectionSupervisor {
    pub fn new(
        url: String,
        delay: Duration,
        link: Arc<BackendLink>,
        control: Arc<ControlHandler>,
    ) -> Self {
        Self {
            url,
            delay,
            link,
            control,
        }
    }

    /// Run the dial loop on the tokio runtime until the handle is aborted.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        loop {
            self.link.set_connecting();
            debug!(url = %self.url, "Dialing backend socket");

            match connect_async(self.url.as_str()).await {
                Ok((stream, _response)) => {
                    info!(url = %self.url, "Backend socket connected");
                    self.drive(stream).await;
                    warn!(url = %self.url, "Backend socket disconnected");
                }
                Err(err) => {
                    warn!(url = %self.url, error = %err, "Backend socket connect failed");
                }
            }

            self.link.detach();
            tokio::time::sleep(self.delay).await;
        }
    }

    /// Pump one connection until it errors or closes.
    async fn drive(&self, stream: BackendStream) {
        let (mut write, mut read) = stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<QueuedFrame>();
        self.link.attach(tx);

        loop {
            tokio::select! {
                outgoing = rx.recv() => {
                    let Some(frame) = outgoing else { break };
                    match write.send(Message::Text(frame.text)).await {
                        Ok(()) => {
                            let _ = frame.written.send(Ok(()));
                        }
                        Err(err) => {
                            warn!(error = %err, "Backend socket write failed");
                            let _ = frame.written.send(Err(err.to_string()));
                            break;
                        }
                    }
                }
                incoming = read.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            self.control.handle(&text);
                        }
                        Some(Ok(Message::Close(frame))) => {
                            debug!(?frame, "Backend socket closed by peer");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            warn!(error = %err, "Backend socket read failed");
                            break;
                        }
                        None => break,
                    }
                }
            }
        }

        // Drop the sender before the socket so the router stops using it.
        self.link.detach();
        rx.close();

        let mut failed = 0usize;
        while let Ok(frame) = rx.try_recv() {
            let _ = frame
                .written
                .send(Err("backend socket disconnected".to_string()));
            failed += 1;
        }
        if failed > 0 {
            warn!(frames = failed, "Frames queued on a lost backend socket were not written");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::connection::testing::recording_handle;
    use crate::bridge::registry::SessionRegistry;
    use crate::bridge::router::{ChannelUsed, DeliveryRouter};
    use crate::bridge::translator::caller_frame_to_envelope;
    use crate::error::DeliveryFailed;
    use crate::state::BridgeMetrics;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    async fn wait_until(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    async fn next_text(ws: &mut WebSocketStream<TcpStream>) -> String {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return text,
                Some(Ok(_)) => continue,
                other => panic!("expected text frame, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_link_starts_disconnected() {
        let link = BackendLink::new();
        assert_eq!(link.state(), LinkState::Disconnected);
        assert!(!link.is_open());
        assert!(matches!(
            link.send("x".to_string()).await,
            Err(DeliveryFailed::ChannelError(_))
        ));
    }

    #[tokio::test]
    async fn test_link_attach_and_detach() {
        let link = Arc::new(BackendLink::new());
        let (tx, mut rx) = mpsc::unbounded_channel::<QueuedFrame>();

        link.attach(tx);
        assert_eq!(link.state(), LinkState::Connected);

        let writer = tokio::spawn(async move {
            let frame = rx.recv().await.unwrap();
            let _ = frame.written.send(Ok(()));
            frame.text
        });
        assert_eq!(link.send("hello".to_string()).await, Ok(()));
        assert_eq!(writer.await.unwrap(), "hello");

        link.detach();
        assert_eq!(link.state(), LinkState::Disconnected);
        assert!(!link.is_open());
    }

    #[tokio::test]
    async fn test_frame_dropped_by_writer_is_a_failure() {
        let link = Arc::new(BackendLink::new());
        let (tx, mut rx) = mpsc::unbounded_channel::<QueuedFrame>();
        link.attach(tx);

        // The writer takes the frame and dies before writing it.
        tokio::spawn(async move {
            let frame = rx.recv().await.unwrap();
            drop(frame);
        });

        assert!(matches!(
            link.send("lost".to_string()).await,
            Err(DeliveryFailed::ChannelError(_))
        ));
    }

    #[tokio::test]
    async fn test_reconnects_and_resumes_persistent_delivery() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());

        let metrics = Arc::new(BridgeMetrics::default());
        let registry = Arc::new(SessionRegistry::new());
        let control = Arc::new(ControlHandler::new(registry, metrics.clone()));
        let link = Arc::new(BackendLink::new());
        let router = DeliveryRouter::new(link.clone(), None, metrics);

        let handle = ReconnectionSupervisor::new(
            url,
            Duration::from_millis(50),
            link.clone(),
            control,
        )
        .spawn();

        let envelope =
            caller_frame_to_envelope(r#"{"event":"stop","streamSid":"S1"}"#).unwrap();

        // First connection
        let (tcp, _) = listener.accept().await.unwrap();
        let mut server = accept_async(tcp).await.unwrap();
        wait_until(|| link.is_open()).await;

        assert_eq!(router.deliver(&envelope).await, Ok(ChannelUsed::Persistent));
        let received: serde_json::Value =
            serde_json::from_str(&next_text(&mut server).await).unwrap();
        assert_eq!(received["type"], "stop");
        assert_eq!(received["streamSid"], "S1");

        // Drop it; the link must fail fast while the supervisor redials.
        drop(server);
        wait_until(|| !link.is_open()).await;
        assert_eq!(
            router.deliver(&envelope).await,
            Err(DeliveryFailed::NoChannelConfigured)
        );

        // Second connection is picked up without any reset.
        let (tcp, _) = listener.accept().await.unwrap();
        let mut server = accept_async(tcp).await.unwrap();
        wait_until(|| link.is_open()).await;

        assert_eq!(router.deliver(&envelope).await, Ok(ChannelUsed::Persistent));
        let received: serde_json::Value =
            serde_json::from_str(&next_text(&mut server).await).unwrap();
        assert_eq!(received["type"], "stop");

        handle.abort();
    }

    #[tokio::test]
    async fn test_backend_control_reaches_caller() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());

        let metrics = Arc::new(BridgeMetrics::default());
        let registry = Arc::new(SessionRegistry::new());
        let (caller, caller_sink) = recording_handle();
        registry.register("S1", caller).unwrap();

        let control = Arc::new(ControlHandler::new(registry, metrics));
        let link = Arc::new(BackendLink::new());
        let handle = ReconnectionSupervisor::new(
            url,
            Duration::from_millis(50),
            link.clone(),
            control,
        )
        .spawn();

        let (tcp, _) = listener.accept().await.unwrap();
        let mut server = accept_async(tcp).await.unwrap();
        wait_until(|| link.is_open()).await;

        server
            .send(Message::Text(
                r#"{"type":"clear","streamSid":"S1"}"#.to_string(),
            ))
            .await
            .unwrap();

        wait_until(|| !caller_sink.frames().is_empty()).await;
        assert_eq!(
            caller_sink.frames(),
            vec![r#"{"event":"clear","streamSid":"S1"}"#.to_string()]
        );

        handle.abort();
    }
}
