use std::time::Duration;

use gdrive_core::{ApiErrorClass, DriveClient, DriveError, children_query};
use serde_json::json;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn get_file_sends_bearer_token() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/drive/v3/files/root-id"))
        .and(header("authorization", "Bearer test-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "root-id",
            "name": "Wiki",
            "mimeType": "application/vnd.google-apps.folder",
            "modifiedTime": "2024-01-01T00:00:00.000Z"
        })))
        .mount(&server)
        .await;

    let client = DriveClient::with_base_url(&server.uri(), "test-token").unwrap();
    let file = client.get_file("root-id").await.unwrap();

    assert_eq!(file.name, "Wiki");
    assert!(file.is_folder());
    assert!(file.parents.is_empty());
}

#[tokio::test]
async fn list_all_follows_page_tokens() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/drive/v3/files"))
        .and(query_param("q", "'root-id' in parents"))
        .and(query_param("pageToken", "page-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "files": [
                {"id": "b", "name": "B.pdf", "mimeType": "application/pdf", "parents": ["root-id"], "size": "42"}
            ]
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/drive/v3/files"))
        .and(query_param("q", "'root-id' in parents"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "nextPageToken": "page-2",
            "files": [
                {
                    "id": "a",
                    "name": "A",
                    "mimeType": "application/vnd.google-apps.document",
                    "parents": ["root-id"],
                    "version": "7",
                    "lastModifyingUser": {"displayName": "Ann"}
                }
            ]
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;

    let client = DriveClient::with_base_url(&server.uri(), "test-token").unwrap();
    let files = client.list_all(&children_query("root-id")).await.unwrap();

    assert_eq!(files.len(), 2);
    assert_eq!(files[0].id, "a");
    assert_eq!(files[0].version.as_deref(), Some("7"));
    assert_eq!(
        files[0]
            .last_modifying_user
            .as_ref()
            .and_then(|u| u.display_name.as_deref()),
        Some("Ann")
    );
    assert_eq!(files[1].size_bytes(), Some(42));
}

#[tokio::test]
async fn download_streams_media() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/drive/v3/files/bin"))
        .and(query_param("alt", "media"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"payload"))
        .mount(&server)
        .await;

    let client = DriveClient::with_base_url(&server.uri(), "test-token").unwrap();
    let response = client.download("bin").await.unwrap();

    assert_eq!(response.bytes().await.unwrap().as_ref(), b"payload");
}

#[tokio::test]
async fn export_passes_target_mime_type() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/drive/v3/files/doc/export"))
        .and(query_param("mimeType", "text/html"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<p>hi</p>"))
        .mount(&server)
        .await;

    let client = DriveClient::with_base_url(&server.uri(), "test-token").unwrap();
    let response = client.export("doc", "text/html").await.unwrap();

    assert_eq!(response.text().await.unwrap(), "<p>hi</p>");
}

#[tokio::test]
async fn rate_limit_responses_are_classified() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/drive/v3/files/busy"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("retry-after", "3")
                .set_body_string("slow down"),
        )
        .mount(&server)
        .await;

    let client = DriveClient::with_base_url(&server.uri(), "test-token").unwrap();
    let err = client.get_file("busy").await.unwrap_err();

    assert_eq!(err.classification(), Some(ApiErrorClass::RateLimit));
    assert!(err.is_rate_limited());
    assert!(err.is_retryable());
    assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));
}

#[tokio::test]
async fn missing_files_are_not_found() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/drive/v3/files/gone"))
        .and(query_param("alt", "media"))
        .respond_with(ResponseTemplate::new(404).set_body_string("File not found: gone"))
        .mount(&server)
        .await;

    let client = DriveClient::with_base_url(&server.uri(), "test-token").unwrap();
    let err = client.download("gone").await.unwrap_err();

    assert!(err.is_not_found());
    assert!(!err.is_retryable());
    assert!(matches!(err, DriveError::Api { .. }));
}
