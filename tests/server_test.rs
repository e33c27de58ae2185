// REST and WebSocket surface, exercised against a server on an ephemeral port.

use std::sync::Arc;
use std::time::Duration;

use docchat::{
    auth::IdentityResolver,
    broker::ServerEvent,
    client::{
        ChatApi, ConnectionState, Connector, Credentials, HttpApi, SessionController,
        WsConnector,
    },
    entity::{Participant, Profile, Role},
    server::{self, AppState},
    ChatError, RoomBroker, Store,
};
use reqwest::StatusCode;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::time::timeout;

const SECRET: &str = "server-test-secret";

struct TestServer {
    state: Arc<AppState>,
    addr: std::net::SocketAddr,
}

impl TestServer {
    fn http(&self) -> String {
        format!("http://{}", self.addr)
    }

    fn ws(&self) -> String {
        format!("ws://{}", self.addr)
    }

    fn credentials(&self, identity: Participant) -> Credentials {
        let token = self.state.auth.issue(&identity.id, None).unwrap();
        Credentials::new(identity, token)
    }
}

async fn spawn_server() -> TestServer {
    let store = Store::in_memory().await.unwrap();
    for profile in [
        Profile::new("p1", Role::User, "Pat").with_image("pat.png"),
        Profile::new("d1", Role::Doctor, "Dr. Dee"),
    ] {
        store.save_profile(&profile).await.unwrap();
    }

    let state = AppState::new(
        store,
        Arc::new(RoomBroker::new()),
        IdentityResolver::new(SECRET),
    );
    let app = server::router(state.clone(), &[]);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await });

    TestServer { state, addr }
}

fn send_body(from: &str, from_model: &str, to: &str, to_model: &str, text: &str) -> Value {
    json!({
        "senderId": from,
        "senderModel": from_model,
        "receiverId": to,
        "receiverModel": to_model,
        "message": text,
    })
}

#[tokio::test]
async fn root_reports_liveness() {
    let server = spawn_server().await;
    let body = reqwest::get(server.http()).await.unwrap().text().await.unwrap();
    assert_eq!(body, "API WORKING");
}

#[tokio::test]
async fn send_stores_and_resolves_participants() {
    let server = spawn_server().await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/api/messages/send", server.http()))
        .json(&send_body("p1", "user", "d1", "doctor", "hello"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let stored: Value = response.json().await.unwrap();
    assert_eq!(stored["message"], "hello");
    assert_eq!(stored["isRead"], false);
    assert_eq!(stored["senderModel"], "user");
    assert_eq!(stored["sender"]["name"], "Pat");
    assert_eq!(stored["receiver"]["name"], "Dr. Dee");
    assert!(stored["id"].as_str().is_some_and(|id| !id.is_empty()));
}

#[tokio::test]
async fn send_rejects_incomplete_requests() {
    let server = spawn_server().await;
    let client = reqwest::Client::new();
    let url = format!("{}/api/messages/send", server.http());

    let blank = client
        .post(&url)
        .json(&send_body("p1", "user", "d1", "doctor", "   "))
        .send()
        .await
        .unwrap();
    assert_eq!(blank.status(), StatusCode::BAD_REQUEST);
    let body: Value = blank.json().await.unwrap();
    assert!(body["error"].is_string());

    let missing = client
        .post(&url)
        .json(&json!({ "senderId": "p1", "message": "hi" }))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::BAD_REQUEST);

    let not_json = client
        .post(&url)
        .header("content-type", "application/json")
        .body("{nope")
        .send()
        .await
        .unwrap();
    assert_eq!(not_json.status(), StatusCode::BAD_REQUEST);

    assert!(server.state.store.history("p1", "d1").await.unwrap().is_empty());
}

#[tokio::test]
async fn history_endpoint_acknowledges_patient_messages() {
    let server = spawn_server().await;
    let api = HttpApi::new(server.http()).unwrap();
    let client = reqwest::Client::new();

    client
        .post(format!("{}/api/messages/send", server.http()))
        .json(&send_body("p1", "user", "d1", "doctor", "first"))
        .send()
        .await
        .unwrap();
    client
        .post(format!("{}/api/messages/send", server.http()))
        .json(&send_body("d1", "doctor", "p1", "user", "reply"))
        .send()
        .await
        .unwrap();

    let history = api.history("p1", "d1").await.unwrap();
    let texts: Vec<_> = history.iter().map(|m| m.message.as_str()).collect();
    assert_eq!(texts, vec!["first", "reply"]);
    assert!(history.iter().all(|m| !m.is_read));

    let after = server.state.store.history("p1", "d1").await.unwrap();
    assert!(after[0].is_read, "patient message acknowledged");
    assert!(!after[1].is_read, "doctor reply untouched");
}

#[tokio::test]
async fn history_for_unknown_participant_is_not_found() {
    let server = spawn_server().await;
    let response = reqwest::get(format!("{}/api/messages/p1/nobody", server.http()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn mark_read_and_patient_list() {
    let server = spawn_server().await;
    let client = reqwest::Client::new();

    for text in ["one", "two"] {
        client
            .post(format!("{}/api/messages/send", server.http()))
            .json(&send_body("p1", "user", "d1", "doctor", text))
            .send()
            .await
            .unwrap();
    }

    let patients_url = format!("{}/api/messages/doctor/d1/patients", server.http());
    let before: Value = reqwest::get(&patients_url).await.unwrap().json().await.unwrap();
    assert_eq!(
        before,
        json!([{
            "id": "p1",
            "name": "Pat",
            "profilePic": "pat.png",
            "lastMessage": "two",
            "unreadCount": 2,
        }])
    );

    let marked: Value = client
        .post(format!("{}/api/messages/mark-read", server.http()))
        .json(&json!({ "userId": "p1", "doctorId": "d1" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(marked, json!({ "success": true }));

    let after: Value = reqwest::get(&patients_url).await.unwrap().json().await.unwrap();
    assert_eq!(after[0]["unreadCount"], 0);

    let empty = client
        .post(format!("{}/api/messages/mark-read", server.http()))
        .json(&json!({ "userId": "", "doctorId": "d1" }))
        .send()
        .await
        .unwrap();
    assert_eq!(empty.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn profiles_round_trip_through_the_directory() {
    let server = spawn_server().await;
    let client = reqwest::Client::new();

    let saved = client
        .put(format!("{}/api/profiles", server.http()))
        .json(&json!({ "id": "d2", "role": "doctor", "name": "Dr. Two" }))
        .send()
        .await
        .unwrap();
    assert_eq!(saved.status(), StatusCode::OK);

    let fetched: Profile = reqwest::get(format!("{}/api/profiles/d2", server.http()))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(fetched, Profile::new("d2", Role::Doctor, "Dr. Two"));

    let missing = reqwest::get(format!("{}/api/profiles/ghost", server.http()))
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn websocket_rejects_bad_tokens() {
    let server = spawn_server().await;
    let connector = WsConnector::new(server.ws());

    let forged = IdentityResolver::new("some-other-secret")
        .issue("p1", None)
        .unwrap();
    let err = connector
        .connect(&Credentials::new(Participant::user("p1"), forged))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, ChatError::Transport(_)));
    assert_eq!(server.state.broker.connection_count(), 0);
}

/// Wait until the session sees the broker acknowledge its join.
async fn await_joined(session: &mut SessionController<HttpApi, WsConnector>) {
    timeout(Duration::from_secs(5), async {
        loop {
            match session.next_event().await {
                Some(ServerEvent::Joined { .. }) => return,
                Some(event) => session.handle_event(event).await,
                None => panic!("connection closed before join was acknowledged"),
            }
        }
    })
    .await
    .expect("join acknowledged");
}

#[tokio::test]
async fn live_chat_over_websocket() {
    let server = spawn_server().await;

    let doctor_creds = server.credentials(Participant::doctor("d1"));
    let mut doctor = SessionController::new(
        HttpApi::new(server.http())
            .unwrap()
            .with_token(&doctor_creds.token),
        WsConnector::new(server.ws()),
    );
    doctor.set_identity(doctor_creds).await.unwrap();
    assert_eq!(doctor.connection_state(), ConnectionState::Connected);
    doctor
        .select_conversation(Participant::user("p1"))
        .await
        .unwrap();
    await_joined(&mut doctor).await;

    let patient_creds = server.credentials(Participant::user("p1"));
    let mut patient = SessionController::new(
        HttpApi::new(server.http())
            .unwrap()
            .with_token(&patient_creds.token),
        WsConnector::new(server.ws()),
    );
    patient.set_identity(patient_creds).await.unwrap();
    patient
        .select_conversation(Participant::doctor("d1"))
        .await
        .unwrap();
    await_joined(&mut patient).await;

    let sent = patient.send("can you see this?").await.unwrap();

    let received = timeout(Duration::from_secs(5), doctor.next_event())
        .await
        .expect("message delivered");
    match received {
        Some(ServerEvent::ReceiveMessage(msg)) => {
            assert_eq!(msg.id, sent.id);
            assert_eq!(msg.sender.as_ref().map(|s| s.name.as_str()), Some("Pat"));
            doctor.handle_event(ServerEvent::ReceiveMessage(msg)).await;
        }
        other => panic!("expected receiveMessage, got {other:?}"),
    }

    assert_eq!(doctor.messages().len(), 1);
    assert_eq!(doctor.patients().len(), 1);
    assert_eq!(doctor.patients()[0].unread_count, 0);
    assert!(server.state.store.message(&sent.id).await.unwrap().unwrap().is_read);

    // The sender gets its own echo, which must not duplicate.
    let echo = timeout(Duration::from_secs(5), patient.next_event())
        .await
        .expect("echo delivered")
        .unwrap();
    patient.handle_event(echo).await;
    assert_eq!(patient.messages().len(), 1);

    doctor.logout().await;
    patient.logout().await;
}
