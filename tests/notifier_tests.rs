//! Webhook delivery against a local HTTP listener

mod common;

use common::*;
use serde_json::{json, Value};
use stepflow::engine::{NotifyError, WebhookNotifier, WebhookPayload};
use stepflow::prelude::*;
use stepflow::workflow::WebhookConfig;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Accept one request, answer with `status_line`, hand back (head, body)
async fn serve_once(status_line: &'static str) -> (String, JoinHandle<(String, Value)>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/hooks/run", listener.local_addr().unwrap());

    let handle = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];

        let (head, body) = loop {
            let n = socket.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed before request was complete");
            buf.extend_from_slice(&chunk[..n]);

            let text = String::from_utf8_lossy(&buf).to_string();
            let Some(split) = text.find("\r\n\r\n") else { continue };
            let head = text[..split].to_string();
            let length = head
                .lines()
                .find_map(|l| {
                    let (k, v) = l.split_once(':')?;
                    k.eq_ignore_ascii_case("content-length")
                        .then(|| v.trim().parse::<usize>().ok())
                        .flatten()
                })
                .unwrap_or(0);
            if buf.len() >= split + 4 + length {
                break (head, buf[split + 4..split + 4 + length].to_vec());
            }
        };

        let response = format!("{}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n", status_line);
        socket.write_all(response.as_bytes()).await.unwrap();
        socket.shutdown().await.ok();

        (head, serde_json::from_slice(&body).unwrap())
    });

    (url, handle)
}

#[tokio::test]
async fn test_webhook_posts_json_payload() {
    let (url, server) = serve_once("HTTP/1.1 200 OK").await;

    let mut headers = std::collections::HashMap::new();
    headers.insert("x-stepflow-token".to_string(), "secret".to_string());
    let notifier = WebhookNotifier::new(&WebhookConfig {
        timeout_ms: 5000,
        headers,
    })
    .unwrap();

    let payload = WebhookPayload {
        run_id: "run-42".into(),
        status: RunStatus::WaitingHuman,
        current_state: "waiting_human".into(),
    };
    notifier.deliver(&url, &payload).await.unwrap();

    let (head, body) = server.await.unwrap();
    assert!(head.starts_with("POST /hooks/run"));
    assert!(head.to_ascii_lowercase().contains("x-stepflow-token: secret"));
    assert!(head.to_ascii_lowercase().contains("content-type: application/json"));
    assert_eq!(
        body,
        json!({"runId": "run-42", "status": "waiting_human", "currentState": "waiting_human"})
    );
}

#[tokio::test]
async fn test_webhook_non_success_status_is_an_error() {
    let (url, server) = serve_once("HTTP/1.1 503 Service Unavailable").await;
    let notifier = WebhookNotifier::new(&WebhookConfig::default()).unwrap();

    let payload = WebhookPayload {
        run_id: "run-1".into(),
        status: RunStatus::Failed,
        current_state: "failed".into(),
    };
    let err = notifier.deliver(&url, &payload).await.unwrap_err();
    assert!(matches!(err, NotifyError::Status(503)));
    server.await.unwrap();
}

#[tokio::test]
async fn test_engine_delivers_webhook_on_pause() {
    let (url, server) = serve_once("HTTP/1.1 204 No Content").await;

    // default notifier: real HTTP delivery
    let engine = Engine::builder()
        .handlers(revision_handlers(ok(), ok(), pausing()))
        .clock(std::sync::Arc::new(stepflow::MockClock::new()))
        .build()
        .await
        .unwrap();

    let run = engine
        .start_run("revision", "proj-1", Payload::new(), Some(url))
        .await
        .unwrap();
    engine.join(&run.id).await;

    let (_, body) = server.await.unwrap();
    assert_eq!(body["runId"], json!(run.id));
    assert_eq!(body["status"], json!("waiting_human"));
}

#[tokio::test]
async fn test_unreachable_webhook_does_not_affect_run() {
    let config = EngineConfig {
        webhook: WebhookConfig {
            timeout_ms: 500,
            ..WebhookConfig::default()
        },
        ..EngineConfig::default()
    };
    let engine = Engine::builder()
        .handlers(revision_handlers(ok(), ok(), ok()))
        .clock(std::sync::Arc::new(stepflow::MockClock::new()))
        .config(config)
        .build()
        .await
        .unwrap();

    // port 1 refuses connections
    let run = engine
        .start_run("revision", "proj-1", Payload::new(), Some("http://127.0.0.1:1/hook".into()))
        .await
        .unwrap();

    let run = settle(&engine, &run.id).await;
    assert_eq!(run.status, RunStatus::Completed);
}
