//! Integration tests for the gateway and the companion HTTP read path.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use ems_server::config::Config;
use ems_server::routes::{build_router, build_state};
use ems_types::api::{LoginResponse, RegisterResponse, UnreadCountResponse};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    base_url: String,
    addr: SocketAddr,
    client: reqwest::Client,
    _tmp: tempfile::TempDir,
}

/// Start the server on a random port over a throwaway database.
async fn start_test_server() -> TestServer {
    let tmp = tempfile::tempdir().expect("Failed to create temp dir");
    let config = Config {
        jwt_secret: "test-secret".into(),
        db_path: tmp.path().join("ems.db"),
        host: "127.0.0.1".into(),
        port: 0,
        token_ttl_days: 1,
        allow_role_signup: true,
    };

    let db = ems_db::Database::open(&config.db_path).expect("Failed to open DB");
    let app = build_router(build_state(&config, db));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        base_url: format!("http://{}", addr),
        addr,
        client: reqwest::Client::new(),
        _tmp: tmp,
    }
}

impl TestServer {
    async fn register(&self, username: &str, role: &str) -> (Uuid, String) {
        let resp = self
            .client
            .post(format!("{}/auth/register", self.base_url))
            .json(&json!({ "username": username, "password": "correct-horse", "role": role }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);
        let body: RegisterResponse = resp.json().await.unwrap();
        (body.user_id, body.token)
    }

    async fn get(&self, path: &str, token: &str) -> reqwest::Response {
        self.client
            .get(format!("{}{}", self.base_url, path))
            .bearer_auth(token)
            .send()
            .await
            .unwrap()
    }

    async fn post(&self, path: &str, token: &str, body: Value) -> reqwest::Response {
        self.client
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    async fn connect(&self, token: &str) -> Ws {
        let url = format!("ws://{}/gateway?token={}", self.addr, token);
        let (mut ws, _) = tokio_tungstenite::connect_async(url).await.expect("WS connect failed");
        let ready = next_event(&mut ws, "Ready").await;
        assert!(ready["data"]["user_id"].is_string());
        ws
    }
}

async fn send_command(ws: &mut Ws, command: Value) {
    ws.send(Message::Text(command.to_string().into())).await.unwrap();
}

/// Read events until one of the given type arrives, skipping the rest.
async fn next_event(ws: &mut Ws, event_type: &str) -> Value {
    let wait = async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    let value: Value = serde_json::from_str(text.as_str()).unwrap();
                    if value["type"] == event_type {
                        return value;
                    }
                }
                Some(Ok(_)) => continue,
                other => panic!("gateway closed while waiting for {}: {:?}", event_type, other),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", event_type))
}

/// Assert that no event of the given type arrives within a short window.
async fn assert_no_event(ws: &mut Ws, event_type: &str) {
    let wait = async {
        while let Some(Ok(msg)) = ws.next().await {
            if let Message::Text(text) = msg {
                let value: Value = serde_json::from_str(text.as_str()).unwrap();
                if value["type"] == event_type {
                    return Some(value);
                }
            }
        }
        None
    };
    if let Ok(Some(value)) = tokio::time::timeout(Duration::from_millis(300), wait).await {
        panic!("unexpected {} event: {}", event_type, value);
    }
}

#[tokio::test]
async fn assignment_reminder_scenario() {
    let server = start_test_server().await;
    let (faculty_id, faculty_token) = server.register("faculty01", "faculty").await;
    let (student_id, student_token) = server.register("student01", "student").await;

    let mut faculty = server.connect(&faculty_token).await;
    let mut student = server.connect(&student_token).await;

    // faculty01 sees student01 come online
    loop {
        let presence = next_event(&mut faculty, "PresenceUpdate").await;
        if presence["data"]["username"] == "student01" {
            assert_eq!(presence["data"]["online"], true);
            break;
        }
    }

    let text = "Please submit your assignment by Friday";
    send_command(
        &mut faculty,
        json!({ "type": "SendMessage", "data": { "to": "student01", "content": text, "client_ref": "r1" } }),
    )
    .await;

    let delivered = next_event(&mut student, "DirectMessage").await;
    assert_eq!(delivered["data"]["content"], text);
    assert_eq!(delivered["data"]["sender_id"], faculty_id.to_string());
    assert_eq!(delivered["data"]["is_read"], false);
    let message_id = delivered["data"]["id"].as_str().unwrap().to_string();

    let ack = next_event(&mut faculty, "MessageAck").await;
    assert_eq!(ack["data"]["message_id"], message_id.as_str());
    assert_eq!(ack["data"]["client_ref"], "r1");
    assert_eq!(ack["data"]["delivered"], true);

    // Exactly one delivery
    assert_no_event(&mut student, "DirectMessage").await;

    // Stored row is unread and visible through the read path
    let history: Value = server
        .get("/messages/with/faculty01", &student_token)
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(history.as_array().unwrap().len(), 1);
    assert_eq!(history[0]["content"], text);
    assert_eq!(history[0]["is_read"], false);

    send_command(&mut student, json!({ "type": "MarkRead", "data": { "message_id": message_id } })).await;

    let receipt = next_event(&mut faculty, "ReadReceipt").await;
    assert_eq!(receipt["data"]["message_id"], message_id.as_str());
    assert_eq!(receipt["data"]["reader_id"], student_id.to_string());

    // Marking again is fine and sends no second receipt
    send_command(&mut student, json!({ "type": "MarkRead", "data": { "message_id": message_id } })).await;
    assert_no_event(&mut student, "Error").await;
    assert_no_event(&mut faculty, "ReadReceipt").await;

    let history: Value = server
        .get("/messages/with/student01", &faculty_token)
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(history[0]["is_read"], true);
}

#[tokio::test]
async fn offline_recipient_reads_later_over_http() {
    let server = start_test_server().await;
    let (_, faculty_token) = server.register("faculty01", "faculty").await;
    let (_, student_token) = server.register("student01", "student").await;

    let resp = server
        .post("/messages/to/student01", &faculty_token, json!({ "content": "Office hours moved" }))
        .await;
    assert_eq!(resp.status(), 201);

    let unread: UnreadCountResponse = server
        .get("/messages/unread-count", &student_token)
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(unread.count, 1);

    let conversations: Value = server
        .get("/messages/conversations", &student_token)
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(conversations[0]["peer_username"], "faculty01");
    assert_eq!(conversations[0]["unread_count"], 1);
    assert_eq!(conversations[0]["last_message"]["content"], "Office hours moved");

    let resp = server
        .post("/messages/to/nobody", &faculty_token, json!({ "content": "hello?" }))
        .await;
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "unknown_recipient");

    let resp = server
        .post("/messages/to/student01", &faculty_token, json!({ "content": "" }))
        .await;
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn notifications_require_a_privileged_role() {
    let server = start_test_server().await;
    let (_, admin_token) = server.register("admin01", "admin").await;
    let (_, student_token) = server.register("student01", "student").await;

    let mut student = server.connect(&student_token).await;

    send_command(
        &mut student,
        json!({ "type": "Broadcast", "data": { "kind": "general", "title": "Party", "message": "Now" } }),
    )
    .await;
    let error = next_event(&mut student, "Error").await;
    assert_eq!(error["data"]["op"], "broadcast");
    assert_eq!(error["data"]["code"], "forbidden");

    let listed: Value = server.get("/notifications", &student_token).await.json().await.unwrap();
    assert!(listed.as_array().unwrap().is_empty());

    let resp = server
        .post(
            "/notifications",
            &admin_token,
            json!({ "kind": "emergency", "title": "Drill", "message": "Fire drill at 10:00" }),
        )
        .await;
    assert_eq!(resp.status(), 201);

    let created = next_event(&mut student, "NotificationCreate").await;
    assert_eq!(created["data"]["title"], "Drill");
    assert_eq!(created["data"]["kind"], "emergency");
    let id = created["data"]["id"].as_str().unwrap().to_string();

    let resp = server
        .post(&format!("/notifications/{}/read", id), &student_token, json!({}))
        .await;
    assert_eq!(resp.status(), 204);

    let listed: Value = server.get("/notifications", &student_token).await.json().await.unwrap();
    assert_eq!(listed[0]["is_read"], true);
}

#[tokio::test]
async fn presence_tracks_connect_and_disconnect() {
    let server = start_test_server().await;
    let (_, faculty_token) = server.register("faculty01", "faculty").await;
    let (_, student_token) = server.register("student01", "student").await;

    let mut faculty = server.connect(&faculty_token).await;
    let student = server.connect(&student_token).await;

    let online: Value = server.get("/presence", &faculty_token).await.json().await.unwrap();
    let names: Vec<_> = online
        .as_array()
        .unwrap()
        .iter()
        .map(|u| u["username"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(names, ["faculty01", "student01"]);

    drop(student);
    loop {
        let presence = next_event(&mut faculty, "PresenceUpdate").await;
        if presence["data"]["username"] == "student01" && presence["data"]["online"] == false {
            break;
        }
    }

    send_command(&mut faculty, json!({ "type": "QueryPresence" })).await;
    let list = next_event(&mut faculty, "PresenceList").await;
    assert_eq!(list["data"]["users"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn gateway_and_api_reject_missing_or_bad_tokens() {
    let server = start_test_server().await;

    let url = format!("ws://{}/gateway", server.addr);
    assert!(tokio_tungstenite::connect_async(url).await.is_err());

    let url = format!("ws://{}/gateway?token=garbage", server.addr);
    assert!(tokio_tungstenite::connect_async(url).await.is_err());

    let resp = server.get("/messages/unread-count", "garbage").await;
    assert_eq!(resp.status(), 401);

    let resp = server
        .client
        .post(format!("{}/auth/register", server.base_url))
        .json(&json!({ "username": "x", "password": "short" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn login_returns_role_and_rejects_wrong_password() {
    let server = start_test_server().await;
    server.register("staff01", "staff").await;

    let resp = server
        .client
        .post(format!("{}/auth/login", server.base_url))
        .json(&json!({ "username": "staff01", "password": "correct-horse" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let login: LoginResponse = resp.json().await.unwrap();
    assert_eq!(login.username, "staff01");
    assert_eq!(login.role.as_str(), "staff");

    let resp = server
        .client
        .post(format!("{}/auth/login", server.base_url))
        .json(&json!({ "username": "staff01", "password": "wrong-horse" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
}

#[tokio::test]
async fn register_rejects_short_or_blank_usernames() {
    let server = start_test_server().await;

    for username in ["日本", "   ", " student01 "] {
        let resp = server
            .client
            .post(format!("{}/auth/register", server.base_url))
            .json(&json!({ "username": username, "password": "correct-horse" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400, "username {:?}", username);
    }

    server.register("日本語", "student").await;

    let resp = server
        .client
        .post(format!("{}/auth/register", server.base_url))
        .json(&json!({ "username": "日本語", "password": "correct-horse" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);
}
