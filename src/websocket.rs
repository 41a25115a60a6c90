//! # WebSocket Connection Handlers
//!
//! Two kinds of connections reach the bridge, told apart by path prefix:
//!
//! - **`/caller…`**: the call-audio transport. Each text frame is a caller
//!   event (`start`, `media`, `stop`, ...) that is translated, registered,
//!   copied to observers and delivered to the backend.
//! - **`/observer…`**: backend-side observers. They receive a live copy of all
//!   caller traffic and may send control messages back (`media`, `mark`,
//!   `clear`, `stop`) that are routed to the owning caller.
//!
//! ## Actor Model:
//! Every connection is an independent actix actor that owns its read loop and
//! calls into the bridge core explicitly. The actor's own address doubles as
//! its write sink, which is what the registry and observer set store.
//!
//! ## Authentication:
//! When a shared secret is configured, the `secret` query parameter must match
//! it exactly. Otherwise the socket is closed with a policy-violation code
//! before any frame is looked at.

use crate::bridge::connection::{ConnectionHandle, ConnectionId, FrameSink};
use crate::bridge::translator::{caller_frame_to_envelope, Envelope, Frame};
use crate::error::{BridgeError, BridgeResult};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Query parameter carrying the shared secret.
pub const SECRET_QUERY_PARAM: &str = "secret";

/// Text frame queued for a connection by the bridge core.
#[derive(Message)]
#[rtype(result = "()")]
pub struct OutboundText(pub String);

impl FrameSink for Recipient<OutboundText> {
    fn is_writable(&self) -> bool {
        self.connected()
    }

    fn write_text(&self, text: String) -> BridgeResult<()> {
        self.try_send(OutboundText(text))
            .map_err(|err| BridgeError::Connection(err.to_string()))
    }
}

/// Exact-match check of the `secret` query parameter.
///
/// With no secret configured every connection is accepted.
pub fn secret_matches(expected: Option<&str>, query_string: &str) -> bool {
    let Some(expected) = expected else {
        return true;
    };

    web::Query::<HashMap<String, String>>::from_query(query_string)
        .ok()
        .and_then(|query| query.get(SECRET_QUERY_PARAM).cloned())
        .map(|provided| provided == expected)
        .unwrap_or(false)
}

fn reject_unauthorized<A>(ctx: &mut ws::WebsocketContext<A>, id: ConnectionId)
where
    A: Actor<Context = ws::WebsocketContext<A>>,
{
    warn!(connection = %id, "Rejecting WebSocket with invalid or missing secret");
    ctx.close(Some(ws::CloseReason::from((
        ws::CloseCode::Policy,
        "invalid or missing secret",
    ))));
    ctx.stop();
}

/// Heartbeat shared by both connection kinds: ping on an interval, stop the
/// actor when the peer has been silent for longer than the client timeout.
fn start_heartbeat<A>(ctx: &mut ws::WebsocketContext<A>, state: &AppState)
where
    A: Actor<Context = ws::WebsocketContext<A>> + Heartbeat,
{
    let interval = state.config.bridge.heartbeat_interval();
    let timeout = state.config.bridge.client_timeout();

    ctx.run_interval(interval, move |act, ctx| {
        if Instant::now().duration_since(act.last_heartbeat()) > timeout {
            warn!("WebSocket heartbeat timeout, closing connection");
            ctx.stop();
        } else {
            ctx.ping(b"");
        }
    });
}

trait Heartbeat {
    fn last_heartbeat(&self) -> Instant;
}

/// Actor for one call-audio transport connection.
pub struct CallerSocket {
    id: ConnectionId,
    state: AppState,
    authorized: bool,
    last_heartbeat: Instant,
}

impl CallerSocket {
    pub fn new(state: AppState, authorized: bool) -> Self {
        Self {
            id: ConnectionId::new(),
            state,
            authorized,
            last_heartbeat: Instant::now(),
        }
    }

    fn connection_handle(&self, ctx: &ws::WebsocketContext<Self>) -> ConnectionHandle {
        let recipient: Recipient<OutboundText> = ctx.address().recipient();
        ConnectionHandle::new(self.id, Arc::new(recipient))
    }

    fn handle_text(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        let metrics = &self.state.metrics;

        let envelope = match caller_frame_to_envelope(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                metrics.record_rejected_caller_frame();
                warn!(connection = %self.id, error = %err, "Dropping caller frame");
                return;
            }
        };

        metrics.record_caller_frame();
        self.track_session(&envelope, ctx);

        if !self.state.observers.is_empty() {
            let report = self.state.observers.broadcast(&envelope);
            metrics.record_observer_writes(report.delivered);
            if report.skipped > 0 {
                debug!(
                    connection = %self.id,
                    skipped = report.skipped,
                    "Some observers did not receive the frame"
                );
            }
        }

        let router = self.state.router.clone();
        let connection = self.id;
        tokio::spawn(async move {
            match router.deliver(&envelope).await {
                Ok(channel) => {
                    debug!(
                        connection = %connection,
                        stream_sid = envelope.stream_sid().unwrap_or("-"),
                        kind = envelope.kind(),
                        channel = ?channel,
                        "Envelope delivered"
                    );
                }
                Err(err) => {
                    warn!(
                        connection = %connection,
                        stream_sid = envelope.stream_sid().unwrap_or("-"),
                        kind = envelope.kind(),
                        error = %err,
                        "Envelope dropped"
                    );
                }
            }
        });
    }

    /// Keep the session registry in step with the caller's lifecycle events.
    fn track_session(&self, envelope: &Envelope, ctx: &ws::WebsocketContext<Self>) {
        let registry = &self.state.registry;

        match &envelope.frame {
            Frame::Start {
                stream_sid: Some(stream_sid),
                ..
            } => match registry.register(stream_sid, self.connection_handle(ctx)) {
                Ok(Some(previous)) => {
                    warn!(
                        stream_sid = %stream_sid,
                        connection = %self.id,
                        previous = %previous,
                        "Session token re-registered by another connection"
                    );
                }
                Ok(None) => {
                    info!(stream_sid = %stream_sid, connection = %self.id, "Session started");
                }
                Err(err) => {
                    warn!(connection = %self.id, error = %err, "Session not registered");
                }
            },
            Frame::Start {
                stream_sid: None, ..
            } => {
                warn!(connection = %self.id, "Start frame without streamSid, session not registered");
            }
            Frame::Stop { stream_sid } => {
                if registry.unregister_token(stream_sid, self.id) {
                    info!(stream_sid = %stream_sid, connection = %self.id, "Session stopped");
                } else {
                    debug!(stream_sid = %stream_sid, connection = %self.id, "Stop for a session this connection does not own");
                }
            }
            _ => {
                if let Some(stream_sid) = envelope.stream_sid() {
                    registry.touch(stream_sid);
                }
            }
        }
    }
}

impl Heartbeat for CallerSocket {
    fn last_heartbeat(&self) -> Instant {
        self.last_heartbeat
    }
}

impl Actor for CallerSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        if !self.authorized {
            reject_unauthorized(ctx, self.id);
            return;
        }

        info!(connection = %self.id, "Caller connection started");
        start_heartbeat(ctx, &self.state);
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        let removed = self.state.registry.unregister_connection(self.id);
        info!(connection = %self.id, sessions = ?removed, "Caller connection stopped");
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for CallerSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        if !self.authorized {
            return;
        }

        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                self.handle_text(&text, ctx);
            }
            Ok(ws::Message::Binary(data)) => {
                warn!(connection = %self.id, bytes = data.len(), "Ignoring binary frame from caller");
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(connection = %self.id, ?reason, "Caller closed connection");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(connection = %self.id, "Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                warn!(connection = %self.id, error = %err, "Caller protocol error");
                ctx.stop();
            }
        }
    }
}

impl Handler<OutboundText> for CallerSocket {
    type Result = ();

    fn handle(&mut self, msg: OutboundText, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

/// Actor for one backend observer connection.
pub struct ObserverSocket {
    id: ConnectionId,
    state: AppState,
    authorized: bool,
    last_heartbeat: Instant,
}

impl ObserverSocket {
    pub fn new(state: AppState, authorized: bool) -> Self {
        Self {
            id: ConnectionId::new(),
            state,
            authorized,
            last_heartbeat: Instant::now(),
        }
    }
}

impl Heartbeat for ObserverSocket {
    fn last_heartbeat(&self) -> Instant {
        self.last_heartbeat
    }
}

impl Actor for ObserverSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        if !self.authorized {
            reject_unauthorized(ctx, self.id);
            return;
        }

        let recipient: Recipient<OutboundText> = ctx.address().recipient();
        self.state
            .observers
            .attach(ConnectionHandle::new(self.id, Arc::new(recipient)));

        info!(
            connection = %self.id,
            observers = self.state.observers.len(),
            "Observer attached"
        );
        start_heartbeat(ctx, &self.state);
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        if self.state.observers.detach(self.id) {
            info!(connection = %self.id, "Observer detached");
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for ObserverSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        if !self.authorized {
            return;
        }

        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                let outcome = self.state.control.handle(&text);
                debug!(connection = %self.id, ?outcome, "Observer control message handled");
            }
            Ok(ws::Message::Binary(data)) => {
                warn!(connection = %self.id, bytes = data.len(), "Ignoring binary frame from observer");
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(connection = %self.id, ?reason, "Observer closed connection");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(connection = %self.id, "Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                warn!(connection = %self.id, error = %err, "Observer protocol error");
                ctx.stop();
            }
        }
    }
}

impl Handler<OutboundText> for ObserverSocket {
    type Result = ();

    fn handle(&mut self, msg: OutboundText, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

/// Upgrade handler for the caller path.
pub async fn caller_socket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let authorized = secret_matches(
        state.config.bridge.shared_secret.as_deref(),
        req.query_string(),
    );
    debug!(
        peer = ?req.connection_info().peer_addr(),
        path = req.path(),
        authorized,
        "Caller WebSocket upgrade"
    );

    ws::start(
        CallerSocket::new(state.get_ref().clone(), authorized),
        &req,
        stream,
    )
}

/// Upgrade handler for the observer path.
pub async fn observer_socket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let authorized = secret_matches(
        state.config.bridge.shared_secret.as_deref(),
        req.query_string(),
    );
    debug!(
        peer = ?req.connection_info().peer_addr(),
        path = req.path(),
        authorized,
        "Observer WebSocket upgrade"
    );

    ws::start(
        ObserverSocket::new(state.get_ref().clone(), authorized),
        &req,
        stream,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Collects every OutboundText it receives.
    #[derive(Default)]
    struct Collector {
        frames: Vec<String>,
    }

    impl Actor for Collector {
        type Context = Context<Self>;
    }

    impl Handler<OutboundText> for Collector {
        type Result = ();

        fn handle(&mut self, msg: OutboundText, _ctx: &mut Self::Context) {
            self.frames.push(msg.0);
        }
    }

    #[derive(Message)]
    #[rtype(result = "Vec<String>")]
    struct TakeFrames;

    impl Handler<TakeFrames> for Collector {
        type Result = MessageResult<TakeFrames>;

        fn handle(&mut self, _msg: TakeFrames, _ctx: &mut Self::Context) -> Self::Result {
            MessageResult(std::mem::take(&mut self.frames))
        }
    }

    #[test]
    fn test_secret_not_required() {
        assert!(secret_matches(None, ""));
        assert!(secret_matches(None, "secret=anything"));
    }

    #[test]
    fn test_secret_exact_match() {
        assert!(secret_matches(Some("s3cret"), "secret=s3cret"));
        assert!(secret_matches(Some("s3cret"), "foo=bar&secret=s3cret"));
        assert!(!secret_matches(Some("s3cret"), "secret=S3CRET"));
        assert!(!secret_matches(Some("s3cret"), "secret=s3cret2"));
        assert!(!secret_matches(Some("s3cret"), ""));
        assert!(!secret_matches(Some("s3cret"), "token=s3cret"));
    }

    #[actix_web::test]
    async fn test_recipient_sink_delivers_to_actor() {
        let addr = Collector::default().start();
        let recipient: Recipient<OutboundText> = addr.clone().recipient();
        let handle = ConnectionHandle::new(ConnectionId::new(), Arc::new(recipient));

        assert!(handle.is_writable());
        handle.write_text("hello".to_string()).unwrap();

        let frames = addr.send(TakeFrames).await.unwrap();
        assert_eq!(frames, vec!["hello".to_string()]);
    }

    mod server {
        use super::super::*;
        use crate::config::AppConfig;
        use actix_web::{dev::ServerHandle, App, HttpServer};
        use futures_util::{SinkExt, StreamExt};
        use std::time::Duration;
        use tokio::net::TcpStream;
        use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WireCloseCode;
        use tokio_tungstenite::tungstenite::Message as WireMessage;
        use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

        type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

        /// Run both upgrade handlers on an ephemeral port.
        fn bridge_server(state: AppState) -> (String, ServerHandle) {
            let data = web::Data::new(state);
            let server = HttpServer::new(move || {
                App::new()
                    .app_data(data.clone())
                    .service(web::scope("/caller").default_service(web::to(caller_socket)))
                    .service(web::scope("/observer").default_service(web::to(observer_socket)))
            })
            .workers(1)
            .disable_signals()
            .bind(("127.0.0.1", 0))
            .unwrap();

            let addr = server.addrs()[0];
            let server = server.run();
            let handle = server.handle();
            actix_web::rt::spawn(server);
            (format!("ws://{}", addr), handle)
        }

        async fn connect(url: String) -> Client {
            let (client, _) = connect_async(url).await.unwrap();
            client
        }

        async fn send_text(client: &mut Client, text: &str) {
            client
                .send(WireMessage::Text(text.to_string()))
                .await
                .unwrap();
        }

        async fn wait_until(mut check: impl FnMut() -> bool) {
            tokio::time::timeout(Duration::from_secs(5), async {
                while !check() {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
            .await
            .expect("condition not reached in time");
        }

        async fn close_code(client: &mut Client) -> Option<WireCloseCode> {
            loop {
                match client.next().await {
                    Some(Ok(WireMessage::Close(frame))) => return frame.map(|f| f.code),
                    Some(Ok(_)) => continue,
                    _ => return None,
                }
            }
        }

        #[actix_web::test]
        async fn test_start_registers_and_stop_unregisters() {
            let state = AppState::new(AppConfig::default()).unwrap();
            let registry = state.registry.clone();
            let (base, server) = bridge_server(state);

            let mut client = connect(format!("{}/caller", base)).await;
            send_text(&mut client, r#"{"event":"start","start":{"streamSid":"S1"}}"#).await;
            wait_until(|| registry.resolve("S1").is_some()).await;

            send_text(&mut client, r#"{"event":"stop","streamSid":"S1"}"#).await;
            wait_until(|| registry.resolve("S1").is_none()).await;

            server.stop(false).await;
        }

        #[actix_web::test]
        async fn test_closing_caller_releases_its_sessions() {
            let state = AppState::new(AppConfig::default()).unwrap();
            let registry = state.registry.clone();
            let (base, server) = bridge_server(state);

            let mut client = connect(format!("{}/caller/stream", base)).await;
            send_text(&mut client, r#"{"event":"start","start":{"streamSid":"S1"}}"#).await;
            send_text(&mut client, r#"{"event":"start","streamSid":"S2","start":{}}"#).await;
            wait_until(|| registry.len() == 2).await;

            client.close(None).await.unwrap();
            wait_until(|| registry.is_empty()).await;

            server.stop(false).await;
        }

        #[actix_web::test]
        async fn test_stop_from_replaced_connection_keeps_new_owner() {
            let state = AppState::new(AppConfig::default()).unwrap();
            let registry = state.registry.clone();
            let (base, server) = bridge_server(state);

            let mut first = connect(format!("{}/caller", base)).await;
            send_text(&mut first, r#"{"event":"start","start":{"streamSid":"S1"}}"#).await;
            wait_until(|| registry.resolve("S1").is_some()).await;
            let first_id = registry.resolve("S1").unwrap().id();

            let mut second = connect(format!("{}/caller", base)).await;
            send_text(&mut second, r#"{"event":"start","start":{"streamSid":"S1"}}"#).await;
            wait_until(|| registry.resolve("S1").map(|c| c.id()) != Some(first_id)).await;
            let second_id = registry.resolve("S1").unwrap().id();

            // Frames on one connection are handled in order, so once SYNC is
            // registered the stale stop has been processed.
            send_text(&mut first, r#"{"event":"stop","streamSid":"S1"}"#).await;
            send_text(&mut first, r#"{"event":"start","start":{"streamSid":"SYNC"}}"#).await;
            wait_until(|| registry.resolve("SYNC").is_some()).await;

            assert_eq!(registry.resolve("S1").map(|c| c.id()), Some(second_id));

            server.stop(false).await;
        }

        #[actix_web::test]
        async fn test_wrong_or_missing_secret_closes_with_policy() {
            let mut config = AppConfig::default();
            config.bridge.shared_secret = Some("s3cret".to_string());
            let state = AppState::new(config).unwrap();
            let registry = state.registry.clone();
            let observers = state.observers.clone();
            let (base, server) = bridge_server(state);

            let mut caller = connect(format!("{}/caller?secret=wrong", base)).await;
            assert_eq!(close_code(&mut caller).await, Some(WireCloseCode::Policy));

            let mut observer = connect(format!("{}/observer", base)).await;
            assert_eq!(close_code(&mut observer).await, Some(WireCloseCode::Policy));

            assert!(registry.is_empty());
            assert!(observers.is_empty());

            let mut allowed = connect(format!("{}/caller?secret=s3cret", base)).await;
            send_text(&mut allowed, r#"{"event":"start","start":{"streamSid":"S1"}}"#).await;
            wait_until(|| registry.resolve("S1").is_some()).await;

            server.stop(false).await;
        }

        #[actix_web::test]
        async fn test_observer_receives_caller_traffic() {
            let state = AppState::new(AppConfig::default()).unwrap();
            let observers = state.observers.clone();
            let (base, server) = bridge_server(state);

            let mut observer = connect(format!("{}/observer", base)).await;
            wait_until(|| observers.len() == 1).await;

            let mut caller = connect(format!("{}/caller", base)).await;
            send_text(
                &mut caller,
                r#"{"event":"stop","streamSid":"S1","stop":{"callSid":"C1"}}"#,
            )
            .await;

            let copied = loop {
                match observer.next().await {
                    Some(Ok(WireMessage::Text(text))) => break text,
                    Some(Ok(_)) => continue,
                    other => panic!("expected text frame, got {:?}", other),
                }
            };
            let copied: serde_json::Value = serde_json::from_str(&copied).unwrap();
            assert_eq!(copied["source"], "caller");
            assert_eq!(copied["type"], "stop");
            assert_eq!(copied["stop"]["callSid"], "C1");

            server.stop(false).await;
        }
    }
}
