use axum::Router;
use axum::extract::Path;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Json;
use serde_json::json;
use tandem::meeting::{DirectoryError, HttpMeetingDirectory, MeetingDirectory};
use tokio::net::TcpListener;

const TOKEN: &str = "secret";

async fn meeting(Path(id): Path<String>, headers: HeaderMap) -> Response {
    let authorized = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        == Some("Bearer secret");
    if !authorized {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if id != "standup" {
        return StatusCode::NOT_FOUND.into_response();
    }
    Json(json!({
        "_id": "6650c0ffee",
        "meetingId": "standup",
        "creator": {"_id": "u1", "fullName": "Ada Lovelace"},
        "participant": {"_id": "u2", "fullName": "Alan Turing", "email": "alan@example.com"},
        "createdAt": "2024-05-24T10:00:00.000Z"
    }))
    .into_response()
}

async fn start_api() -> String {
    let router = Router::new().route("/api/meeting/:id", get(meeting));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}/api")
}

#[test_timeout::tokio_timeout_test(20)]
async fn fetches_the_meeting_record_with_a_bearer_token() {
    let api = start_api().await;
    let directory = HttpMeetingDirectory::new(&api, TOKEN).unwrap();

    let record = directory.meeting("standup").await.unwrap();
    assert_eq!(record.meeting_id, "standup");
    assert_eq!(record.creator.email, None);
    assert_eq!(record.counterpart_of("u1").full_name, "Alan Turing");
    assert_eq!(record.counterpart_of("u2").full_name, "Ada Lovelace");
}

#[test_timeout::tokio_timeout_test(20)]
async fn wrong_token_is_unauthorized() {
    let api = start_api().await;
    let directory = HttpMeetingDirectory::new(&api, "guess").unwrap();

    let err = directory.meeting("standup").await.unwrap_err();
    assert!(matches!(err, DirectoryError::Unauthorized));
}

#[test_timeout::tokio_timeout_test(20)]
async fn unknown_meeting_is_not_found() {
    let api = start_api().await;
    let directory = HttpMeetingDirectory::new(&api, TOKEN).unwrap();

    let err = directory.meeting("retro").await.unwrap_err();
    assert!(matches!(err, DirectoryError::NotFound(id) if id == "retro"));
}
