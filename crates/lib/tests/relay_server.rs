//! Integration tests: run the relay on a free port with an echoing provider, drive it over
//! real HTTP and WebSocket connections. No provider credentials or network access needed.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use relay::config::RelayConfig;
use relay::dispatch::ResponseDispatcher;
use relay::keypool::KeyPool;
use relay::llm::{GenerateRequest, ProviderAdapter, ProviderError, ProviderFamily};
use relay::relay::{serve, ClientEvent, ClientRole, Relay, RelaySettings, ServerEvent};
use relay::session::SessionStore;
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;

type Ws =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind free port");
    listener.local_addr().expect("local_addr").port()
}

struct EchoAdapter;

#[async_trait]
impl ProviderAdapter for EchoAdapter {
    fn family(&self) -> ProviderFamily {
        ProviderFamily::Gemini
    }

    async fn generate(
        &self,
        request: &GenerateRequest<'_>,
        _api_key: &str,
    ) -> Result<String, ProviderError> {
        Ok(format!("echo: {}", request.prompt))
    }
}

struct TestRelay {
    base: String,
    ws: String,
    relay: Arc<Relay>,
}

async fn start_relay(identify_timeout_ms: u64) -> TestRelay {
    let port = free_port();
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
        .await
        .expect("bind relay port");

    let pool = Arc::new(KeyPool::new("gemini", vec!["test-key".into()]).expect("key pool"));
    let mut dispatcher = ResponseDispatcher::new(Duration::from_secs(5));
    dispatcher.register(Arc::new(EchoAdapter), pool);
    let relay_config = RelayConfig {
        identify_timeout_ms,
        ..RelayConfig::default()
    };
    let relay = Arc::new(Relay::new(
        Arc::new(SessionStore::in_memory()),
        Arc::new(dispatcher),
        None,
        RelaySettings::from(&relay_config),
    ));

    let server_relay = relay.clone();
    tokio::spawn(async move {
        let _ = serve(listener, server_relay, &[], std::future::pending()).await;
    });

    TestRelay {
        base: format!("http://127.0.0.1:{}", port),
        ws: format!("ws://127.0.0.1:{}/ws", port),
        relay,
    }
}

async fn connect(url: &str) -> Ws {
    let (ws, _) = tokio_tungstenite::connect_async(url)
        .await
        .expect("websocket connect");
    ws
}

async fn send(ws: &mut Ws, event: ClientEvent) {
    ws.send(Message::Text(event.to_frame()))
        .await
        .expect("send frame");
}

async fn next_event(ws: &mut Ws) -> ServerEvent {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for an event")
            .expect("connection closed")
            .expect("websocket error");
        if let Message::Text(text) = msg {
            return ServerEvent::parse(&text).expect("parse server event");
        }
    }
}

async fn identify(ws: &mut Ws, role: ClientRole) {
    send(ws, ClientEvent::Identify { role }).await;
}

/// Identify as chatbot and return the session id from `session_initialized`.
async fn chatbot_session(ws: &mut Ws) -> String {
    identify(ws, ClientRole::Chatbot).await;
    match next_event(ws).await {
        ServerEvent::SessionInitialized {
            session_id,
            history_length,
            ..
        } => {
            assert_eq!(history_length, 0);
            session_id
        }
        other => panic!("expected session_initialized, got {:?}", other),
    }
}

/// Identify frames are handled on each socket's own task; wait until the relay has seen them.
async fn wait_for_portals(t: &TestRelay, n: usize) {
    for _ in 0..250 {
        if t.relay.registry().portal_count() == n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("expected {} portal(s) to register within 5s", n);
}

fn hello() -> ClientEvent {
    ClientEvent::SendMessage {
        prompt: "hello".into(),
        images: vec![],
        provider: Some("gemini-25-flash".into()),
    }
}

#[tokio::test]
async fn health_responds_with_running() {
    let t = start_relay(2000).await;
    for path in ["/", "/health"] {
        let json: serde_json::Value = reqwest::get(format!("{}{}", t.base, path))
            .await
            .expect("GET health")
            .json()
            .await
            .expect("parse JSON");
        assert_eq!(json["status"], "ok");
        assert_eq!(json["runtime"], "running");
        assert!(json["port"].as_u64().is_some());
    }
}

#[tokio::test]
async fn chatbot_round_trip_is_persisted() {
    let t = start_relay(2000).await;
    let mut ws = connect(&t.ws).await;
    let session_id = chatbot_session(&mut ws).await;
    assert_eq!(next_event(&mut ws).await, ServerEvent::PortalStatus { connected: false });

    send(&mut ws, hello()).await;
    match next_event(&mut ws).await {
        ServerEvent::BotReply {
            reply,
            provider,
            error,
        } => {
            assert_eq!(reply, "echo: hello");
            assert_eq!(provider, "gemini-25-flash");
            assert_eq!(error, None);
        }
        other => panic!("expected bot_reply, got {:?}", other),
    }

    let messages: Vec<serde_json::Value> =
        reqwest::get(format!("{}/api/sessions/{}/messages", t.base, session_id))
            .await
            .expect("GET messages")
            .json()
            .await
            .expect("parse messages");
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["sender"], "user");
    assert_eq!(messages[0]["message"], "hello");
    assert_eq!(messages[1]["sender"], "bot");

    let sessions: Vec<serde_json::Value> = reqwest::get(format!("{}/api/sessions", t.base))
        .await
        .expect("GET sessions")
        .json()
        .await
        .expect("parse sessions");
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["_id"], session_id.as_str());
    assert_eq!(sessions[0]["lastMessage"], "echo: hello");
    assert!(sessions[0].get("history").is_none());
}

#[tokio::test]
async fn portals_receive_session_updates() {
    let t = start_relay(2000).await;
    let mut portal_a = connect(&t.ws).await;
    let mut portal_b = connect(&t.ws).await;
    identify(&mut portal_a, ClientRole::Portal).await;
    identify(&mut portal_b, ClientRole::Portal).await;

    wait_for_portals(&t, 2).await;

    let mut chatbot = connect(&t.ws).await;
    let session_id = chatbot_session(&mut chatbot).await;
    assert_eq!(next_event(&mut chatbot).await, ServerEvent::PortalStatus { connected: true });

    send(&mut chatbot, hello()).await;
    assert!(matches!(next_event(&mut chatbot).await, ServerEvent::BotReply { .. }));

    for portal in [&mut portal_a, &mut portal_b] {
        assert_eq!(
            next_event(portal).await,
            ServerEvent::SessionUpdated {
                session_id: session_id.clone(),
                last_message: "echo: hello".into(),
                provider: "gemini-25-flash".into(),
            }
        );
    }

    // Last portal leaving flips the chatbot's portal status.
    portal_a.close(None).await.expect("close portal a");
    portal_b.close(None).await.expect("close portal b");
    assert_eq!(next_event(&mut chatbot).await, ServerEvent::PortalStatus { connected: false });
}

#[tokio::test]
async fn silent_connection_becomes_chatbot() {
    let t = start_relay(100).await;
    let mut ws = connect(&t.ws).await;
    assert!(matches!(
        next_event(&mut ws).await,
        ServerEvent::SessionInitialized { .. }
    ));
    // A late identify is ignored.
    identify(&mut ws, ClientRole::Portal).await;
    assert_eq!(next_event(&mut ws).await, ServerEvent::PortalStatus { connected: false });
    send(&mut ws, hello()).await;
    assert!(matches!(next_event(&mut ws).await, ServerEvent::BotReply { .. }));
    assert_eq!(t.relay.registry().portal_count(), 0);
    assert_eq!(t.relay.store().len().await, 1);
}

#[tokio::test]
async fn portal_message_reaches_chatbot_and_missing_session_is_404() {
    let t = start_relay(2000).await;
    let mut ws = connect(&t.ws).await;
    let session_id = chatbot_session(&mut ws).await;
    let _ = next_event(&mut ws).await;

    let client = reqwest::Client::new();
    let res = client
        .post(format!("{}/api/sessions/{}/messages", t.base, session_id))
        .json(&serde_json::json!({ "message": "hi from support" }))
        .send()
        .await
        .expect("POST message");
    assert!(res.status().is_success());
    let saved: serde_json::Value = res.json().await.expect("parse message");
    assert_eq!(saved["sender"], "portal");

    assert!(matches!(
        next_event(&mut ws).await,
        ServerEvent::PortalNotification { message, .. } if message == "hi from support"
    ));

    let res = client
        .post(format!("{}/api/sessions/does-not-exist/messages", t.base))
        .json(&serde_json::json!({ "message": "anyone?" }))
        .send()
        .await
        .expect("POST message");
    assert_eq!(res.status().as_u16(), 404);
    let body: serde_json::Value = res.json().await.expect("parse error body");
    assert_eq!(body["code"], "NOT_FOUND");
    let session = t.relay.store().get(&session_id).await.expect("session");
    assert_eq!(session.history.len(), 1);
}

#[tokio::test]
async fn help_request_over_http_alerts_portals() {
    let t = start_relay(2000).await;
    let mut portal = connect(&t.ws).await;
    identify(&mut portal, ClientRole::Portal).await;
    wait_for_portals(&t, 1).await;
    let mut chatbot = connect(&t.ws).await;
    let session_id = chatbot_session(&mut chatbot).await;

    let res: serde_json::Value = reqwest::Client::new()
        .post(format!("{}/api/sessions/{}/help", t.base, session_id))
        .json(&serde_json::json!({ "message": "stuck on step 3" }))
        .send()
        .await
        .expect("POST help")
        .json()
        .await
        .expect("parse help response");
    assert_eq!(res["success"], true);
    assert_eq!(res["portalNotified"], true);

    match next_event(&mut portal).await {
        ServerEvent::HelpRequest {
            session_id: sid,
            message,
            ..
        } => {
            assert_eq!(sid, session_id);
            assert_eq!(message, "stuck on step 3");
        }
        other => panic!("expected help_request, got {:?}", other),
    }
}

#[tokio::test]
async fn delete_all_reports_count() {
    let t = start_relay(2000).await;
    for i in 0..5 {
        t.relay
            .store()
            .attach(&format!("socket-{}", i), "gemini-25-flash")
            .await
            .expect("attach");
    }
    let client = reqwest::Client::new();
    let res: serde_json::Value = client
        .delete(format!("{}/api/sessions/all", t.base))
        .send()
        .await
        .expect("DELETE all")
        .json()
        .await
        .expect("parse delete response");
    assert_eq!(res["deletedCount"], 5);

    let sessions: Vec<serde_json::Value> = reqwest::get(format!("{}/api/sessions", t.base))
        .await
        .expect("GET sessions")
        .json()
        .await
        .expect("parse sessions");
    assert!(sessions.is_empty());

    let res = client
        .delete(format!("{}/api/sessions/socket-0", t.base))
        .send()
        .await
        .expect("DELETE one");
    assert_eq!(res.status().as_u16(), 404);
}

#[tokio::test]
async fn key_status_lists_configured_keys() {
    let t = start_relay(2000).await;
    let res: serde_json::Value = reqwest::get(format!("{}/api/keys/status", t.base))
        .await
        .expect("GET key status")
        .json()
        .await
        .expect("parse key status");
    assert_eq!(res["success"], true);
    assert_eq!(res["totalKeys"], 1);
    assert_eq!(res["activeKeys"], 1);
    assert_eq!(res["keys"][0]["index"], 1);
    assert_eq!(res["keys"][0]["isCurrent"], true);
}
