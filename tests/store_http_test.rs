//! HTTP project store integration tests
//!
//! Exercises `HttpStore` against a `wiremock` server standing in for the
//! project store API.

use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use collabsync::model::{MemberRef, User};
use collabsync::store::http::HttpStore;
use collabsync::store::ProjectStore;
use collabsync::CollabError;

fn make_store(server: &MockServer) -> HttpStore {
    HttpStore::new(
        &server.uri(),
        Some("tok".to_string()),
        Duration::from_secs(5),
    )
    .expect("valid store url")
}

#[tokio::test]
async fn test_get_project_parses_members_and_tree() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/projects/get-project/p1"))
        .and(header("authorization", "Bearer tok"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "project": {
                "_id": "p1",
                "name": "demo",
                "users": [{"_id": "u1", "email": "a@example.com"}, "u2"],
                "fileTree": {
                    "index.js": {"file": {"contents": "console.log(1)"}},
                    "README.md": {"contents": "# demo"}
                }
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let session = make_store(&server).get_project("p1").await.unwrap();

    assert_eq!(session.id, "p1");
    assert_eq!(session.name, "demo");
    assert_eq!(
        session.members[0],
        MemberRef::Resolved(User::new("u1", "a@example.com"))
    );
    assert_eq!(session.members[1], MemberRef::Id("u2".to_string()));
    assert!(!session.members[1].is_resolved());
    assert_eq!(session.file_tree["index.js"].contents, "console.log(1)");
    assert_eq!(session.file_tree["README.md"].contents, "# demo");
}

#[tokio::test]
async fn test_get_messages_keeps_store_order() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/projects/messages/p1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "messages": [
                {"_id": "m1", "sender": {"_id": "u1", "email": "a@example.com"}, "message": "first"},
                {"_id": "m2", "sender": {"_id": "ai", "email": "AI"}, "message": "{\"text\":\"hi\"}",
                 "createdAt": "2024-05-01T10:00:00Z"}
            ]
        })))
        .mount(&server)
        .await;

    let messages = make_store(&server).get_messages("p1").await.unwrap();

    let ids: Vec<_> = messages.iter().filter_map(|m| m.id.as_deref()).collect();
    assert_eq!(ids, vec!["m1", "m2"]);
    assert!(messages[1].is_from_agent());
    assert!(messages[1].created_at.is_some());
}

#[tokio::test]
async fn test_post_message_sends_sender_and_returns_persisted_message() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/projects/message"))
        .and(body_json(json!({
            "projectId": "p1",
            "sender": {"_id": "u1", "email": "a@example.com"},
            "message": "hello"
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "message": {
                "_id": "m9",
                "sender": {"_id": "u1", "email": "a@example.com"},
                "message": "hello",
                "createdAt": "2024-05-01T10:00:00Z"
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let sender = User::new("u1", "a@example.com");
    let message = make_store(&server)
        .post_message("p1", &sender, "hello")
        .await
        .unwrap();

    assert_eq!(message.id.as_deref(), Some("m9"));
    assert_eq!(message.body, "hello");
    assert_eq!(message.sender, sender);
}

#[tokio::test]
async fn test_update_file_tree_sends_whole_tree() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/projects/update-file-tree"))
        .and(body_json(json!({
            "projectId": "p1",
            "fileTree": {
                "a.js": {"contents": "a"},
                "b.js": {"contents": "b"}
            }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let tree = serde_json::from_value(json!({
        "a.js": {"contents": "a"},
        "b.js": {"contents": "b"}
    }))
    .unwrap();
    make_store(&server).update_file_tree("p1", &tree).await.unwrap();
}

#[tokio::test]
async fn test_membership_requests() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/projects/add-user"))
        .and(body_json(json!({"projectId": "p1", "users": ["u2", "u3"]})))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/projects/remove-user"))
        .and(body_json(json!({"projectId": "p1", "userId": "u2"})))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let store = make_store(&server);
    store
        .add_users("p1", &["u2".to_string(), "u3".to_string()])
        .await
        .unwrap();
    store.remove_user("p1", "u2").await.unwrap();
}

#[tokio::test]
async fn test_all_users_lists_directory() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users/all"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "users": [
                {"_id": "u1", "email": "a@example.com"},
                {"_id": "u2", "email": "b@example.com"}
            ]
        })))
        .mount(&server)
        .await;

    let users = make_store(&server).all_users().await.unwrap();
    assert_eq!(
        users,
        vec![
            User::new("u1", "a@example.com"),
            User::new("u2", "b@example.com")
        ]
    );
}

#[tokio::test]
async fn test_server_error_is_persistence_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/projects/message"))
        .respond_with(ResponseTemplate::new(500).set_body_string("database down"))
        .mount(&server)
        .await;

    let err = make_store(&server)
        .post_message("p1", &User::new("u1", "a@example.com"), "hello")
        .await
        .unwrap_err();

    match err.downcast_ref::<CollabError>() {
        Some(CollabError::Persistence(msg)) => {
            assert!(msg.contains("500"), "{msg}");
            assert!(msg.contains("database down"), "{msg}");
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_unexpected_body_is_persistence_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/projects/get-project/p1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"nope": true})))
        .mount(&server)
        .await;

    let err = make_store(&server).get_project("p1").await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<CollabError>(),
        Some(CollabError::Persistence(_))
    ));
}
