//! `GeminiClassifier` against a local HTTP listener standing in for the API.

use std::time::Duration;

use serde_json::json;
use tablemerge::classifier::{ClassificationError, GeminiClassifier, SignatureClassifier};
use tablemerge::gemini::{GeminiClient, GeminiError};
use tablemerge::models::{Signature, Table};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Reads one request (headers plus `content-length` body).
async fn read_request(socket: &mut TcpStream) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = socket.read(&mut chunk).await.unwrap();
        if n == 0 {
            return;
        }
        buf.extend_from_slice(&chunk[..n]);
        let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
            continue;
        };
        let head = String::from_utf8_lossy(&buf[..end]).to_lowercase();
        let body_len = head
            .lines()
            .find_map(|l| l.strip_prefix("content-length:"))
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        if buf.len() >= end + 4 + body_len {
            return;
        }
    }
}

/// Serves one connection. `None` accepts the request and never answers.
async fn fake_gemini(reply: Option<(u16, String)>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        read_request(&mut socket).await;
        match reply {
            Some((status, body)) => {
                let response = format!(
                    "HTTP/1.1 {} Test\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                socket.write_all(response.as_bytes()).await.unwrap();
                let _ = socket.shutdown().await;
            }
            None => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                drop(socket);
            }
        }
    });
    format!("http://{}", addr)
}

fn text_reply(text: &str) -> String {
    json!({
        "candidates": [{ "content": { "parts": [{ "text": text }] } }]
    })
    .to_string()
}

fn classifier(endpoint: &str, timeout_secs: u64) -> GeminiClassifier {
    let client =
        GeminiClient::new(endpoint, "gemini-2.0-flash", "test-key".to_string(), timeout_secs)
            .unwrap();
    GeminiClassifier::with_client(client)
}

fn sample() -> Table {
    Table::new(
        "sales.csv",
        vec!["Region".into(), "Units".into()],
        vec![vec!["North".into(), "1".into()]],
    )
}

#[tokio::test]
async fn test_fenced_prose_reply_is_parsed() {
    let endpoint = fake_gemini(Some((
        200,
        text_reply("Sure! Here it is:\n```json\n{\"column\": \"Region\", \"value\": \"North\"}\n```\nHope that helps."),
    )))
    .await;

    let signature = classifier(&endpoint, 5)
        .classify("sales.csv", &sample())
        .await
        .unwrap();
    assert_eq!(signature, Signature::new("Region", "North").unwrap());
}

#[tokio::test]
async fn test_unanswered_request_times_out() {
    let endpoint = fake_gemini(None).await;

    let err = classifier(&endpoint, 1)
        .classify("sales.csv", &sample())
        .await
        .unwrap_err();
    assert!(
        matches!(
            err,
            ClassificationError::Service {
                source: GeminiError::Timeout(1),
                ..
            }
        ),
        "{:?}",
        err
    );
}

#[tokio::test]
async fn test_error_status_is_a_service_error() {
    let endpoint = fake_gemini(Some((500, r#"{"error":"boom"}"#.to_string()))).await;

    let err = classifier(&endpoint, 5)
        .classify("sales.csv", &sample())
        .await
        .unwrap_err();
    assert!(
        matches!(
            err,
            ClassificationError::Service {
                source: GeminiError::Status { status: 500, .. },
                ..
            }
        ),
        "{:?}",
        err
    );
}

#[tokio::test]
async fn test_reply_without_text_is_a_service_error() {
    let endpoint = fake_gemini(Some((200, r#"{"candidates": []}"#.to_string()))).await;

    let err = classifier(&endpoint, 5)
        .classify("sales.csv", &sample())
        .await
        .unwrap_err();
    assert!(
        matches!(
            err,
            ClassificationError::Service {
                source: GeminiError::EmptyResponse,
                ..
            }
        ),
        "{:?}",
        err
    );
}

#[tokio::test]
async fn test_unparseable_reply_is_a_response_error() {
    let endpoint = fake_gemini(Some((200, text_reply("I could not decide.")))).await;

    let err = classifier(&endpoint, 5)
        .classify("sales.csv", &sample())
        .await
        .unwrap_err();
    assert!(
        matches!(err, ClassificationError::Response { ref identifier, .. } if identifier == "sales.csv"),
        "{:?}",
        err
    );
}
