//! Push discovery over a held WebSocket
//!
//! The service assigns nothing here: the identity is chosen (and for slot
//! identities claimed over HTTP) before connecting, and the first frame
//! back must be a `welcome` echoing it.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use huddle_core::{ErrorCode, HuddleError, IdentityClaimer, ParticipantId, RoomName, SignalPayload};
use huddle_signal::{ClientEvent, ServerEvent};

use crate::client::SignalClient;
use crate::discovery::{decode_signal, DiscoveryEvent, DiscoveryEvents, DiscoveryTransport};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct PushSession {
    room: RoomName,
    outgoing: mpsc::UnboundedSender<ClientEvent>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

pub struct PushTransport {
    client: SignalClient,
    connect_timeout: Duration,
    session: Mutex<Option<PushSession>>,
}

impl PushTransport {
    pub fn new(client: SignalClient, connect_timeout: Duration) -> Self {
        Self {
            client,
            connect_timeout,
            session: Mutex::new(None),
        }
    }

    fn send(&self, event: ClientEvent) -> Result<(), HuddleError> {
        let session = self.session.lock();
        let session = session.as_ref().ok_or(HuddleError::SessionClosed)?;
        session
            .outgoing
            .send(event)
            .map_err(|_| HuddleError::Transport("push link closed".into()))
    }
}

/// `ws[s]://<base>/ws?room=<room>&id=<id>`
pub fn ws_url(base: &Url, room: &RoomName, id: &ParticipantId) -> Result<Url, HuddleError> {
    let mut url = base
        .join("ws")
        .map_err(|e| HuddleError::Transport(e.to_string()))?;

    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        _ => "ws",
    };
    url.set_scheme(scheme)
        .map_err(|_| HuddleError::Transport(format!("cannot derive websocket url from {}", base)))?;

    url.query_pairs_mut()
        .clear()
        .append_pair("room", room.as_str())
        .append_pair("id", id.as_str());
    Ok(url)
}

#[async_trait]
impl IdentityClaimer for PushTransport {
    async fn claim(&self, room: &RoomName, candidate: &ParticipantId) -> Result<(), HuddleError> {
        self.client.claim(candidate, room).await
    }
}

#[async_trait]
impl DiscoveryTransport for PushTransport {
    async fn connect(
        &self,
        room: &RoomName,
        id: &ParticipantId,
    ) -> Result<DiscoveryEvents, HuddleError> {
        let url = ws_url(self.client.base(), room, id)?;
        debug!("Connecting to signal server: {}", url);

        let (mut ws, _response) = timeout(self.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| HuddleError::Transport("timed out connecting to signal server".into()))?
            .map_err(|e| HuddleError::Transport(e.to_string()))?;

        match timeout(self.connect_timeout, recv_event(&mut ws)).await {
            Ok(Ok(ServerEvent::Welcome(assigned))) if assigned == *id => {}
            Ok(Ok(ServerEvent::Welcome(assigned))) => {
                return Err(HuddleError::Protocol(format!(
                    "service assigned {} instead of {}",
                    assigned, id
                )));
            }
            Ok(Ok(ServerEvent::Error { code, message })) => {
                return Err(match code {
                    ErrorCode::IdentityConflict => HuddleError::IdentityConflict(id.clone()),
                    _ => HuddleError::Transport(message),
                });
            }
            Ok(Ok(other)) => {
                return Err(HuddleError::Protocol(format!("expected welcome, got {:?}", other)));
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(HuddleError::Transport("timed out waiting for welcome".into())),
        }

        let (sink, stream) = ws.split();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();

        let writer = tokio::spawn(write_loop(sink, outgoing_rx));
        let reader = tokio::spawn(read_loop(stream, events_tx, id.clone()));

        outgoing
            .send(ClientEvent::JoinRoom)
            .map_err(|_| HuddleError::Transport("push link closed".into()))?;

        let previous = self.session.lock().replace(PushSession {
            room: room.clone(),
            outgoing,
            writer,
            reader,
        });
        if let Some(previous) = previous {
            previous.reader.abort();
            previous.writer.abort();
        }

        info!("Joined room {} as {} (push)", room, id);
        Ok(events_rx)
    }

    async fn tick(&self) -> Result<(), HuddleError> {
        self.send(ClientEvent::Ping)
    }

    async fn send_signal(
        &self,
        to: &ParticipantId,
        payload: &SignalPayload,
    ) -> Result<(), HuddleError> {
        self.send(ClientEvent::Signal {
            to: to.clone(),
            signal: payload.to_value()?,
        })
    }

    async fn leave(&self) -> Result<(), HuddleError> {
        let session = self.session.lock().take();
        let Some(session) = session else {
            return Ok(());
        };

        // Closing the outgoing queue makes the writer close the socket,
        // which the service treats as departure
        drop(session.outgoing);
        if timeout(self.connect_timeout, session.writer).await.is_err() {
            warn!("Timed out closing push link");
        }
        session.reader.abort();

        info!("Left room {} (push)", session.room);
        Ok(())
    }
}

/// Next server event, skipping non-text frames
async fn recv_event(ws: &mut WsStream) -> Result<ServerEvent, HuddleError> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                return ServerEvent::from_json(&text).map_err(|e| HuddleError::Protocol(e.to_string()));
            }
            Some(Ok(Message::Close(_))) | None => {
                return Err(HuddleError::Transport("connection closed".into()));
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(HuddleError::Transport(e.to_string())),
        }
    }
}

async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut outgoing: mpsc::UnboundedReceiver<ClientEvent>,
) {
    while let Some(event) = outgoing.recv().await {
        let json = match event.to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to encode client event: {}", e);
                continue;
            }
        };
        if let Err(e) = sink.send(Message::Text(json)).await {
            debug!("Push link write failed: {}", e);
            return;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(
    mut stream: SplitStream<WsStream>,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
    local: ParticipantId,
) {
    while let Some(msg) = stream.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                warn!("Push link error: {}", e);
                break;
            }
        };

        let event = match ServerEvent::from_json(&text) {
            Ok(event) => event,
            Err(e) => {
                warn!("Ignoring malformed server frame: {}", e);
                continue;
            }
        };

        let discovered = match event {
            ServerEvent::AllUsers(ids) => Some(DiscoveryEvent::Roster(
                ids.into_iter().filter(|id| *id != local).collect(),
            )),
            ServerEvent::UserJoined(id) if id != local => Some(DiscoveryEvent::Joined(id)),
            ServerEvent::UserLeft(id) if id != local => Some(DiscoveryEvent::Left(id)),
            ServerEvent::Signal { from, signal } => decode_signal(from, signal),
            ServerEvent::Error { code, message } => {
                warn!("Signal service error ({:?}): {}", code, message);
                None
            }
            other => {
                debug!("Ignoring server event: {:?}", other);
                None
            }
        };

        if let Some(event) = discovered {
            if events.send(event).is_err() {
                break;
            }
        }
    }
    debug!("Push link for {} closed", local);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use huddle_core::{ClientConfig, DiscoveryMode, IceCandidate, NetworkConfig, SignalConfig};
    use huddle_signal::SignalServer;
    use tokio::net::TcpListener;

    use crate::loopback::{LoopbackEngine, LoopbackNetwork};
    use crate::session::CallSession;

    const WAIT: Duration = Duration::from_secs(5);

    async fn spawn_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = SignalServer::new(SignalConfig::default());
        tokio::spawn(async move { server.serve_on(listener).await });
        format!("http://{}", addr)
    }

    fn transport(url: &str) -> PushTransport {
        let client = SignalClient::new(url, &NetworkConfig::default()).unwrap();
        PushTransport::new(client, WAIT)
    }

    async fn next(rx: &mut DiscoveryEvents) -> DiscoveryEvent {
        timeout(WAIT, rx.recv()).await.unwrap().unwrap()
    }

    fn base(raw: &str) -> Url {
        Url::parse(raw).unwrap()
    }

    #[test]
    fn test_ws_url_from_http() {
        let room = RoomName::parse("Demo").unwrap();
        let url = ws_url(&base("http://localhost:3000/"), &room, &"demo-1".into()).unwrap();
        assert_eq!(url.as_str(), "ws://localhost:3000/ws?room=demo&id=demo-1");
    }

    #[test]
    fn test_ws_url_from_https_with_prefix() {
        let room = RoomName::parse("lobby").unwrap();
        let url = ws_url(&base("https://example.com/huddle/"), &room, &"abc".into()).unwrap();
        assert_eq!(url.as_str(), "wss://example.com/huddle/ws?room=lobby&id=abc");
    }

    #[tokio::test]
    async fn test_send_without_session() {
        let client = SignalClient::new("http://127.0.0.1:9", &Default::default()).unwrap();
        let transport = PushTransport::new(client, Duration::from_secs(1));
        assert_eq!(transport.tick().await, Err(HuddleError::SessionClosed));
        assert!(transport.leave().await.is_ok());
    }

    #[tokio::test]
    async fn test_join_relay_leave_over_websocket() {
        let url = spawn_server().await;
        let room = RoomName::parse("demo").unwrap();
        let a = transport(&url);
        let b = transport(&url);

        let mut a_rx = a.connect(&room, &"a".into()).await.unwrap();
        assert_eq!(next(&mut a_rx).await, DiscoveryEvent::Roster(vec![]));

        let mut b_rx = b.connect(&room, &"b".into()).await.unwrap();
        assert_eq!(next(&mut b_rx).await, DiscoveryEvent::Roster(vec!["a".into()]));
        assert_eq!(next(&mut a_rx).await, DiscoveryEvent::Joined("b".into()));

        let candidate = SignalPayload::Candidate(IceCandidate::new("candidate:1"));
        b.send_signal(&"a".into(), &candidate).await.unwrap();
        assert_eq!(
            next(&mut a_rx).await,
            DiscoveryEvent::Signal { from: "b".into(), payload: candidate }
        );

        b.tick().await.unwrap();
        b.leave().await.unwrap();
        assert_eq!(next(&mut a_rx).await, DiscoveryEvent::Left("b".into()));
        a.leave().await.unwrap();
    }

    #[tokio::test]
    async fn test_identity_held_by_live_connection() {
        let url = spawn_server().await;
        let room = RoomName::parse("demo").unwrap();
        let first = transport(&url);
        let second = transport(&url);

        let mut rx = first.connect(&room, &"demo-1".into()).await.unwrap();
        assert_eq!(next(&mut rx).await, DiscoveryEvent::Roster(vec![]));

        assert_eq!(
            second.connect(&room, &"demo-1".into()).await.unwrap_err(),
            HuddleError::IdentityConflict("demo-1".into())
        );
        first.leave().await.unwrap();
    }

    #[tokio::test]
    async fn test_sessions_meet_through_push() {
        let url = spawn_server().await;
        let room = RoomName::parse("demo").unwrap();
        let network = LoopbackNetwork::new();
        let config = ClientConfig {
            server_url: url.clone(),
            discovery: DiscoveryMode::Push,
            reconcile_interval_ms: 50,
            ..ClientConfig::default()
        };

        let engine = || Arc::new(LoopbackEngine::new(Arc::clone(&network)));
        let a = CallSession::join(&config, room.clone(), engine(), Arc::new(transport(&url)))
            .await
            .unwrap();
        let b = CallSession::join(&config, room.clone(), engine(), Arc::new(transport(&url)))
            .await
            .unwrap();

        let mut a_streams = a.watch_streams();
        let mut b_streams = b.watch_streams();
        timeout(WAIT, a_streams.wait_for(|s| s.len() == 1)).await.unwrap().unwrap();
        timeout(WAIT, b_streams.wait_for(|s| s.len() == 1)).await.unwrap().unwrap();
        assert_eq!(a.remote_streams()[0].peer, *b.local_id());
        assert_eq!(b.remote_streams()[0].peer, *a.local_id());

        // user-left reaches a and nothing is re-offered afterwards
        b.leave().await.unwrap();
        timeout(WAIT, a_streams.wait_for(|s| s.is_empty())).await.unwrap().unwrap();
        timeout(WAIT, async {
            while !a.peers().await.unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("a kept a record for b");

        let roster = SignalClient::new(&url, &NetworkConfig::default())
            .unwrap()
            .list(&room)
            .await
            .unwrap();
        assert_eq!(roster, vec![a.local_id().clone()]);

        a.leave().await.unwrap();
        assert!(!a.is_joined());
    }
}
