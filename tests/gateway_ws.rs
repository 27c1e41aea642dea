use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use backchat::{AppState, db, settings::Settings, store::ChatStore};
use backchat::access::RoomKind;
use backchat::rooms::gateway::group_name;
use futures_util::{SinkExt, Stream, StreamExt};
use serde_json::json;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{
    Error as WsError, Message, client::IntoClientRequest,
};
use tower_sessions::SessionStore;
use tower_sessions::session::{Id, Record};

async fn spawn_app(settings: Settings) -> (SocketAddr, AppState) {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    db::init(&pool).await.unwrap();

    let state = AppState::new(pool, settings);
    let app = backchat::app(state.clone())
        .into_make_service_with_connect_info::<SocketAddr>();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, state)
}

/// Seed a signed-in session the way the auth service would and hand back the
/// cookie that selects it.
async fn sign_in(state: &AppState, username: &str) -> String {
    let mut record = Record {
        id: Id::default(),
        data: HashMap::from([("username".to_owned(), json!(username))]),
        expiry_date: time::OffsetDateTime::now_utc() + time::Duration::hours(1),
    };
    state.sessions.create(&mut record).await.unwrap();
    format!("id={}", record.id)
}

async fn connect_with_cookie(
    addr: SocketAddr,
    path: &str,
    cookie: &str,
) -> tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
> {
    let mut request = format!("ws://{addr}{path}").into_client_request().unwrap();
    request
        .headers_mut()
        .insert("cookie", cookie.parse().unwrap());
    let (socket, _) = connect_async(request).await.unwrap();
    socket
}

async fn next_text(
    socket: &mut (impl Stream<Item = Result<Message, WsError>> + Unpin),
) -> serde_json::Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(2), socket.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed early")
            .expect("socket errored");
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

#[tokio::test]
async fn invalid_slugs_are_refused_during_the_handshake() {
    let (addr, _state) = spawn_app(Settings::default()).await;

    let err = connect_async(format!("ws://{addr}/chat/bad!slug"))
        .await
        .unwrap_err();
    match err {
        WsError::Http(response) => assert_eq!(response.status(), 403),
        other => panic!("expected an http refusal, got {other:?}"),
    }
}

#[tokio::test]
async fn private_rooms_close_anonymous_sockets_with_4401() {
    let (addr, state) = spawn_app(Settings::default()).await;
    state
        .store
        .insert_room("team-private", "Team", RoomKind::Private, None, Some("alice"))
        .await
        .unwrap();

    let (mut socket, _) = connect_async(format!("ws://{addr}/chat/team-private"))
        .await
        .unwrap();
    let frame = tokio::time::timeout(Duration::from_secs(2), socket.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    match frame {
        Message::Close(Some(frame)) => {
            assert_eq!(u16::from(frame.code), 4401);
            assert_eq!(frame.reason.as_str(), "unauthorized");
        }
        other => panic!("expected a close frame, got {other:?}"),
    }
}

#[tokio::test]
async fn guest_messages_in_the_public_room_go_nowhere() {
    let (addr, state) = spawn_app(Settings::default()).await;

    let (mut socket, _) = connect_async(format!("ws://{addr}/chat/public"))
        .await
        .unwrap();
    socket
        .send(Message::Text(r#"{"message": "hello"}"#.into()))
        .await
        .unwrap();

    let silence =
        tokio::time::timeout(Duration::from_millis(300), socket.next()).await;
    assert!(silence.is_err(), "guests must not trigger any reply");

    let page = state.store.messages_before("public", None, 10).await.unwrap();
    assert!(page.messages.is_empty());
}

#[tokio::test]
async fn room_events_reach_connected_sockets_in_order() {
    let (addr, state) = spawn_app(Settings::default()).await;

    let (mut socket, _) = connect_async(format!("ws://{addr}/chat/public"))
        .await
        .unwrap();

    // wait until the connection has actually joined the group
    let payload = r#"{"message":"m1","username":"alice","profilePic":null,"room":"public"}"#;
    loop {
        if state.groups.send("chat_public", payload.to_owned()) > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    state.groups.send(
        "chat_public",
        r#"{"message":"m2","username":"alice","profilePic":null,"room":"public"}"#.to_owned(),
    );

    let first = next_text(&mut socket).await;
    assert_eq!(first["message"], "m1");
    let second = next_text(&mut socket).await;
    assert_eq!(second["message"], "m2");
}

#[tokio::test]
async fn guests_behind_one_address_count_once() {
    let (addr, _state) = spawn_app(Settings::default()).await;

    let (mut first, _) = connect_async(format!("ws://{addr}/presence"))
        .await
        .unwrap();
    let hello = next_text(&mut first).await;
    assert_eq!(hello["guests"], 1);

    let (mut second, _) = connect_async(format!("ws://{addr}/presence"))
        .await
        .unwrap();
    let hello = next_text(&mut second).await;
    assert_eq!(hello["guests"], 1);

    // the first socket hears about the newcomer, still one distinct address
    let update = next_text(&mut first).await;
    assert_eq!(update["guests"], 1);
}

#[tokio::test]
async fn presence_sessions_bootstrap_a_cookie_usable_on_the_socket() {
    let (addr, _state) = spawn_app(Settings::default()).await;

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{addr}/api/auth/presence-session"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let cookie = response
        .headers()
        .get("set-cookie")
        .expect("presence session must set a cookie")
        .to_str()
        .unwrap()
        .split(';')
        .next()
        .unwrap()
        .to_owned();
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["ok"], true);

    let mut socket = connect_with_cookie(addr, "/presence", &cookie).await;
    let hello = next_text(&mut socket).await;
    assert_eq!(hello["guests"], 1);
}

#[tokio::test]
async fn signed_in_users_appear_in_the_online_list() {
    let (addr, state) = spawn_app(Settings::default()).await;
    state
        .store
        .upsert_profile("alice", Some("avatars/alice.png"))
        .await
        .unwrap();
    let alice = sign_in(&state, "alice").await;

    let mut socket = connect_with_cookie(addr, "/presence", &alice).await;
    let hello = next_text(&mut socket).await;
    let online = hello["online"].as_array().unwrap();
    assert_eq!(online.len(), 1);
    assert_eq!(online[0]["username"], "alice");
    // the avatar resolves against the Host header the client dialed with
    assert_eq!(
        online[0]["profileImage"],
        format!("http://{addr}/media/avatars/alice.png")
    );
}

#[tokio::test]
async fn direct_rooms_carry_messages_between_their_two_members() {
    let (addr, state) = spawn_app(Settings::default()).await;
    let room = state.store.ensure_direct_room("alice", "bob").await.unwrap();
    let alice = sign_in(&state, "alice").await;
    let bob = sign_in(&state, "bob").await;

    let path = format!("/chat/{}", room.slug);
    let mut alice_socket = connect_with_cookie(addr, &path, &alice).await;
    let mut bob_socket = connect_with_cookie(addr, &path, &bob).await;

    // wait for both subscriptions before anything is said
    let group = group_name(&room.slug);
    while state.groups.receiver_count(&group) < 2 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    alice_socket
        .send(Message::Text(r#"{"message": "hey bob"}"#.into()))
        .await
        .unwrap();

    let frame = next_text(&mut bob_socket).await;
    assert_eq!(frame["message"], "hey bob");
    assert_eq!(frame["username"], "alice");
    assert_eq!(frame["room"], room.slug);

    // the sender hears the echo through the same fan-out
    let echo = next_text(&mut alice_socket).await;
    assert_eq!(echo["message"], "hey bob");

    let page = state
        .store
        .messages_before(&room.slug, None, 10)
        .await
        .unwrap();
    assert_eq!(page.messages.len(), 1);
    assert_eq!(page.messages[0].message, "hey bob");
    assert_eq!(page.messages[0].username, "alice");
}

#[tokio::test]
async fn the_server_reports_healthy_over_plain_http() {
    let (addr, _state) = spawn_app(Settings::default()).await;

    let body: serde_json::Value = reqwest::get(format!("http://{addr}/api/health/ready"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["components"]["database"], "ok");
}
