//! WebSocket endpoint tests over a live server
//!
//! Binds the real router on an ephemeral port, connects actual WebSocket
//! clients, and verifies the handshake, the speak-to-translated-audio
//! path (using the dev models), the signaling relay, and the
//! replace-on-reconnect close code.

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use babelroom::config::Config;
use babelroom::models::dev::{DevAsr, DevMt, DevTts};
use babelroom::models::directory::{StaticDirectory, StaticRoomRegistry};
use babelroom::models::loader::ModelLoader;
use babelroom::server::auth::JwtAuth;
use babelroom::server::{build_state, router, Ports};
use babelroom::types::UserRecord;
use babelroom::voice::audio::samples_to_bytes;
use babelroom::voice::profile::NoVoiceProfiles;

const SECRET: &str = "ws-endpoint-test-secret";

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    addr: SocketAddr,
    auth: JwtAuth,
    directory: Arc<StaticDirectory>,
}

impl TestServer {
    async fn spawn() -> Self {
        let mut config = Config::default();
        config.pipeline.cycle_interval_ms = 20;
        config.pipeline.min_block_ms = 10;
        config.auth.jwt_secret = Some(SECRET.to_string());

        let directory = Arc::new(StaticDirectory::new());
        let ports = Ports {
            auth: Arc::new(JwtAuth::new(SECRET, 30)),
            directory: directory.clone(),
            rooms: Arc::new(StaticRoomRegistry::open()),
            voice_profiles: Arc::new(NoVoiceProfiles),
            loader: Arc::new(ModelLoader::preloaded(
                Arc::new(DevAsr),
                Arc::new(DevMt),
                Arc::new(DevTts::default()),
            )),
        };
        let state = build_state(config, ports);
        let app = router(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            auth: JwtAuth::new(SECRET, 30),
            directory,
        }
    }

    fn register_user(&self, username: &str, input: &str, output: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.directory.insert(UserRecord {
            id,
            username: username.to_string(),
            full_name: format!("{username} Test"),
            speaks_languages: vec![input.to_string()],
            understands_languages: vec![output.to_string()],
            created_at: None,
        });
        id
    }

    fn token_for(&self, user_id: Uuid) -> String {
        self.auth
            .issue(user_id, chrono::Duration::minutes(5))
            .unwrap()
    }

    async fn connect(&self, room: &str, token: &str) -> WsClient {
        let url = format!("ws://{}/ws/audio/{room}?token={token}", self.addr);
        let (client, _) = connect_async(url).await.expect("upgrade failed");
        client
    }
}

/// Next JSON frame of the given type, skipping everything else
async fn next_of_type(client: &mut WsClient, wanted: &str) -> Value {
    tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            match client.next().await.expect("socket ended").expect("socket error") {
                Message::Text(text) => {
                    let value: Value = serde_json::from_str(&text).unwrap();
                    if value["type"] == wanted {
                        return value;
                    }
                }
                Message::Close(frame) => panic!("closed early: {frame:?}"),
                _ => {}
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no {wanted} frame within 3s"))
}

/// Half a second of loud 16 kHz PCM16, base64 encoded
fn loud_chunk_b64() -> String {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
    let samples: Vec<i16> = (0..8_000).map(|i| if i % 2 == 0 { 5_000 } else { -5_000 }).collect();
    BASE64.encode(samples_to_bytes(&samples))
}

#[tokio::test]
async fn invalid_token_closes_with_policy_violation() {
    let server = TestServer::spawn().await;
    let mut client = server.connect("room", "not-a-token").await;

    match tokio::time::timeout(Duration::from_secs(3), client.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap()
    {
        Message::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 1008),
        other => panic!("expected close, got {other:?}"),
    }
}

#[tokio::test]
async fn speaker_audio_reaches_listener_translated() {
    let server = TestServer::spawn().await;
    let speaker = server.register_user("ana", "pt", "pt");
    let listener = server.register_user("ben", "en", "en");

    let mut speaker_ws = server
        .connect("standup", &server.token_for(speaker))
        .await;
    let connected = next_of_type(&mut speaker_ws, "connected").await;
    assert_eq!(connected["user_id"], json!(speaker));

    let mut listener_ws = server
        .connect("standup", &server.token_for(listener))
        .await;
    next_of_type(&mut listener_ws, "connected").await;

    // The speaker is told about the listener joining
    let joined = next_of_type(&mut speaker_ws, "participant_joined").await;
    assert_eq!(joined["user_id"], json!(listener));
    assert_eq!(joined["participants"].as_array().unwrap().len(), 2);

    // Start the pipeline, then speak
    speaker_ws
        .send(Message::Text(
            json!({
                "type": "init_settings",
                "input_language": "pt",
                "output_language": "pt"
            })
            .to_string()
            .into(),
        ))
        .await
        .unwrap();
    speaker_ws
        .send(Message::Text(
            json!({
                "type": "audio_chunk",
                "audio_data": loud_chunk_b64(),
                "timestamp": 1_000
            })
            .to_string()
            .into(),
        ))
        .await
        .unwrap();

    let translated = next_of_type(&mut listener_ws, "translated_audio").await;
    assert_eq!(translated["detected_language"], "pt");
    assert_eq!(translated["seq"], 1);
    assert_eq!(translated["audio"]["encoding"], "pcm_s16le");
    let text = translated["text"].as_str().unwrap();
    assert!(text.starts_with("[en]"), "unexpected text {text}");
}

#[tokio::test]
async fn signaling_is_relayed_with_sender_id() {
    let server = TestServer::spawn().await;
    let alice = server.register_user("alice", "en", "en");
    let bob = server.register_user("bob", "en", "en");

    let mut alice_ws = server.connect("mesh", &server.token_for(alice)).await;
    next_of_type(&mut alice_ws, "connected").await;
    let mut bob_ws = server.connect("mesh", &server.token_for(bob)).await;
    next_of_type(&mut bob_ws, "connected").await;

    alice_ws
        .send(Message::Text(
            json!({
                "type": "webrtc_offer",
                "target_user_id": bob,
                "offer": {"sdp": "v=0 test", "kind": "offer"}
            })
            .to_string()
            .into(),
        ))
        .await
        .unwrap();

    let offer = next_of_type(&mut bob_ws, "webrtc_offer").await;
    assert_eq!(offer["from_user_id"], json!(alice));
    assert_eq!(offer["offer"]["sdp"], "v=0 test");
}

#[tokio::test]
async fn reconnect_closes_old_socket_with_4001() {
    let server = TestServer::spawn().await;
    let user = server.register_user("carla", "pt", "pt");
    let token = server.token_for(user);

    let mut first = server.connect("room", &token).await;
    next_of_type(&mut first, "connected").await;

    let mut second = server.connect("room", &token).await;
    next_of_type(&mut second, "connected").await;

    // The first socket is evicted with the replaced close code
    let deadline = Duration::from_secs(3);
    let closed = tokio::time::timeout(deadline, async {
        loop {
            match first.next().await {
                Some(Ok(Message::Close(Some(frame)))) => return u16::from(frame.code),
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => panic!("socket ended without close frame"),
            }
        }
    })
    .await
    .expect("no close frame within 3s");
    assert_eq!(closed, 4001);
}
