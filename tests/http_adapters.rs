//! HTTP collaborator adapters against wiremock servers.

use std::sync::Arc;
use std::time::Duration;

use docflow::analysis::{Analyzer, InternalApiAnalyzer, OpenAiAnalyzer, OpenAiClient, PageRenderer};
use docflow::error::{Error, Result};
use docflow::finalize::{Aggregator, HttpAggregator};
use docflow::models::AnalysisRequest;
use docflow::notify::{DeliveryStatus, HttpNotifier, Notification, Notifier};
use docflow::paths::PathLayout;
use docflow::queue::{HttpQueue, QueuePublisher, QueueTransport};
use docflow::storage::s3::AwsCredentials;
use docflow::storage::{BlobStore, InMemoryStore, S3Store};
use serde_json::json;
use wiremock::matchers::{body_json, body_string_contains, header, header_exists, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

// ============ Queue ============

#[tokio::test]
async fn test_http_queue_posts_messages() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/queues/process/messages"))
        .and(body_json(json!({"messages": [{"a": 1}, {"b": 2}]})))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let queue = HttpQueue::new(&server.uri(), 1024, Duration::from_secs(5)).unwrap();
    queue
        .send_batch("process", &["{\"a\":1}".to_string(), "{\"b\":2}".to_string()])
        .await
        .unwrap();
}

#[tokio::test]
async fn test_http_queue_status_mapping() {
    let server = MockServer::start().await;
    Mock::given(path("/queues/busy/messages"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    Mock::given(path("/queues/big/messages"))
        .respond_with(ResponseTemplate::new(413))
        .mount(&server)
        .await;
    Mock::given(path("/queues/bad/messages"))
        .respond_with(ResponseTemplate::new(400).set_body_string("nope"))
        .mount(&server)
        .await;

    let queue = HttpQueue::new(&server.uri(), 1024, Duration::from_secs(5)).unwrap();
    let batch = ["{}".to_string()];
    assert!(queue.send_batch("busy", &batch).await.unwrap_err().is_transient());
    assert!(matches!(
        queue.send_batch("big", &batch).await.unwrap_err(),
        Error::MessageTooLarge { .. }
    ));
    assert!(matches!(
        queue.send_batch("bad", &batch).await.unwrap_err(),
        Error::ExternalService(_)
    ));
}

#[tokio::test]
async fn test_publisher_retries_transient_http_failure() {
    let server = MockServer::start().await;
    Mock::given(path("/queues/process/messages"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(path("/queues/process/messages"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let transport = Arc::new(HttpQueue::new(&server.uri(), 1024, Duration::from_secs(5)).unwrap());
    let publisher = QueuePublisher::new(transport, "process").with_retry(3, Duration::from_millis(10));
    assert_eq!(publisher.send(&[json!({"x": 1})]).await.unwrap(), 1);
}

#[tokio::test]
async fn test_http_batches_fit_the_body_limit() {
    let server = MockServer::start().await;
    Mock::given(path("/queues/process/messages"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    // Each message is 9 bytes; with the 15-byte envelope two fit in 40.
    let transport = Arc::new(HttpQueue::new(&server.uri(), 40, Duration::from_secs(5)).unwrap());
    let publisher = QueuePublisher::new(transport, "process");
    let items: Vec<serde_json::Value> = (0..5).map(|i| json!({"pad": i})).collect();
    assert_eq!(publisher.send(&items).await.unwrap(), 5);

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 3);
    let mut delivered = 0;
    for request in &requests {
        assert!(request.body.len() <= 40, "{} bytes", request.body.len());
        let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
        delivered += body["messages"].as_array().unwrap().len();
    }
    assert_eq!(delivered, 5);
}

// ============ Internal analysis API ============

#[tokio::test]
async fn test_internal_analyzer_request_with_file() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/request-with-file"))
        .and(header("x-api-key", "secret"))
        .and(body_json(json!({"blob_url": "s3://b/k.pdf", "prompt": "p", "model": "m"})))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"response_id": "r1", "content": "{}"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let analyzer = InternalApiAnalyzer::new(
        &format!("{}/api/", server.uri()),
        Some("secret".into()),
        Duration::from_secs(5),
    )
    .unwrap();
    let resp = analyzer
        .analyze(&AnalysisRequest {
            blob_reference: "s3://b/k.pdf".into(),
            prompt: "p".into(),
            model: "m".into(),
        })
        .await
        .unwrap();
    assert_eq!(resp.response_id, "r1");
}

#[tokio::test]
async fn test_internal_analyzer_chained_request_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chained-request"))
        .and(body_json(json!({"model": "m", "prompt": "more", "previous_response_id": "r1"})))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({"error": "boom"})))
        .mount(&server)
        .await;

    let analyzer = InternalApiAnalyzer::new(&server.uri(), None, Duration::from_secs(5)).unwrap();
    let err = analyzer.continue_chain("m", "more", "r1").await.unwrap_err();
    match err {
        Error::ExternalService(msg) => assert!(msg.contains("HTTP 500"), "{msg}"),
        other => panic!("unexpected error {other:?}"),
    }
}

// ============ OpenAI ============

fn openai_response(id: &str, text: &str) -> serde_json::Value {
    json!({
        "id": id,
        "output": [{"type": "message", "content": [{"type": "output_text", "text": text}]}]
    })
}

#[tokio::test]
async fn test_openai_analyzer_uploads_responds_and_archives() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/files"))
        .and(header_exists("authorization"))
        .and(body_string_contains("assistants"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "file-1"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/responses"))
        .and(body_string_contains("file-1"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(openai_response("resp-1", "{\"dispensas\":[{\"n\":1}]}")),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/files/file-1"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let store = Arc::new(InMemoryStore::new());
    store
        .put("base/P1/raw/a.pdf", b"%PDF-1.4".to_vec(), "application/pdf")
        .await
        .unwrap();
    let layout = PathLayout::new("base", "raw", "results", "dispensas", "dispensas_results");
    let client = Arc::new(OpenAiClient::new(&server.uri(), "sk-test", Duration::from_secs(5)).unwrap());
    let analyzer = OpenAiAnalyzer::new(store.clone(), layout, client, None);

    let resp = analyzer
        .analyze(&AnalysisRequest {
            blob_reference: store.locator("base/P1/raw/a.pdf"),
            prompt: "extract".into(),
            model: "gpt-test".into(),
        })
        .await
        .unwrap();
    assert_eq!(resp.response_id, "resp-1");

    let archived = store.get_json("base/P1/processed/a.json").await.unwrap();
    assert_eq!(archived["response_id"], "resp-1");
}

#[tokio::test]
async fn test_openai_upload_retries_then_fails() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/files"))
        .respond_with(ResponseTemplate::new(502))
        .expect(3)
        .mount(&server)
        .await;

    let client = OpenAiClient::new(&server.uri(), "sk-test", Duration::from_secs(5))
        .unwrap()
        .with_upload_retry(3, Duration::from_millis(5), Duration::from_millis(20));
    let err = client.upload_file("a.pdf", b"%PDF").await.unwrap_err();
    assert!(matches!(err, Error::ExternalService(_)));
}

#[tokio::test]
async fn test_openai_server_error_deletes_file_and_surfaces() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/files"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "file-9"})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/responses"))
        .respond_with(ResponseTemplate::new(500).set_body_string("error code: 500"))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/files/file-9"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let store = Arc::new(InMemoryStore::new());
    store.put("base/P1/raw/a.txt", b"hello".to_vec(), "text/plain").await.unwrap();
    let layout = PathLayout::new("base", "raw", "results", "dispensas", "dispensas_results");
    let client = Arc::new(OpenAiClient::new(&server.uri(), "sk-test", Duration::from_secs(5)).unwrap());
    // Neither fallback applies to a non-PDF, so the 500 surfaces.
    let analyzer = OpenAiAnalyzer::new(store, layout, client, Some("gpt-vision".into()));
    let err = analyzer
        .analyze(&AnalysisRequest {
            blob_reference: "base/P1/raw/a.txt".into(),
            prompt: "p".into(),
            model: "m".into(),
        })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("HTTP 500"));
}

struct FixedPages;

impl PageRenderer for FixedPages {
    fn render_pages(&self, _pdf: &[u8]) -> Result<Vec<Vec<u8>>> {
        Ok(vec![b"png-1".to_vec(), b"png-2".to_vec()])
    }
}

#[tokio::test]
async fn test_openai_unreadable_upload_falls_back_to_page_images() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/files"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "file-3"})))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/files/file-3"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/responses"))
        .and(body_string_contains("input_file"))
        .respond_with(ResponseTemplate::new(200).set_body_json(openai_response("resp-1", "{\"dispensas\":[]}")))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/responses"))
        .and(body_string_contains("\"input_image\""))
        .and(body_string_contains("\"gpt-vision\""))
        .and(body_string_contains("data:image/png;base64,cG5nLTE="))
        .and(body_string_contains("data:image/png;base64,cG5nLTI="))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(openai_response("resp-2", "{\"dispensas\":[{\"n\":1}]}")),
        )
        .expect(1)
        .mount(&server)
        .await;

    let store = Arc::new(InMemoryStore::new());
    store
        .put("base/P1/raw/scan.pdf", b"%PDF-1.4".to_vec(), "application/pdf")
        .await
        .unwrap();
    let layout = PathLayout::new("base", "raw", "results", "dispensas", "dispensas_results");
    let client = Arc::new(OpenAiClient::new(&server.uri(), "sk-test", Duration::from_secs(5)).unwrap());
    let analyzer = OpenAiAnalyzer::with_renderer(
        store.clone(),
        layout,
        client,
        Some("gpt-vision".into()),
        Arc::new(FixedPages),
    );

    let resp = analyzer
        .analyze(&AnalysisRequest {
            blob_reference: "base/P1/raw/scan.pdf".into(),
            prompt: "extract".into(),
            model: "gpt-test".into(),
        })
        .await
        .unwrap();
    assert_eq!(resp.response_id, "resp-2");
    let archived = store.get_json("base/P1/processed/scan.json").await.unwrap();
    assert_eq!(archived["response_id"], "resp-2");
}

#[tokio::test]
async fn test_openai_continue_chain() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/responses"))
        .and(body_string_contains("\"previous_response_id\":\"resp-1\""))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "resp-2", "output_text": "ok"})))
        .mount(&server)
        .await;

    let store = Arc::new(InMemoryStore::new());
    let layout = PathLayout::new("base", "raw", "results", "dispensas", "dispensas_results");
    let client = Arc::new(OpenAiClient::new(&server.uri(), "sk-test", Duration::from_secs(5)).unwrap());
    let analyzer = OpenAiAnalyzer::new(store, layout, client, None);
    let resp = analyzer.continue_chain("m", "refine", "resp-1").await.unwrap();
    assert_eq!(resp.response_id, "resp-2");
    assert_eq!(resp.content, "ok");
}

// ============ Notifications ============

#[tokio::test]
async fn test_http_notifier_body_and_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/email-notification"))
        .and(body_json(json!({
            "idProject": "DOCUMENT_ANALYSIS",
            "typeNotification": "EMAIL",
            "notification": "SUCCESS_FINALLY_PROCESS",
            "data": [
                {"label": "{{processName}}", "value": "P1 | CSV generated"},
                {"label": "{{id}}", "value": "folder|P1 | CSV generated"}
            ]
        })))
        .respond_with(ResponseTemplate::new(202))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/email-notification"))
        .respond_with(ResponseTemplate::new(422))
        .mount(&server)
        .await;

    let notifier =
        HttpNotifier::new(&server.uri(), "DOCUMENT_ANALYSIS", "folder", Duration::from_secs(5)).unwrap();
    assert_eq!(
        notifier.send(&Notification::aggregation_success("P1")).await.unwrap(),
        DeliveryStatus::Delivered(202)
    );
    assert_eq!(
        notifier.send(&Notification::start("P1")).await.unwrap(),
        DeliveryStatus::Rejected(422)
    );
}

// ============ Aggregation ============

#[tokio::test]
async fn test_http_aggregator() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/json_to_csv_request"))
        .and(body_json(json!({"project_id": "P1"})))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/json_to_csv_request"))
        .and(body_json(json!({"project_id": "P2"})))
        .respond_with(ResponseTemplate::new(500).set_body_string("csv failed"))
        .mount(&server)
        .await;

    let aggregator = HttpAggregator::new(
        &format!("{}/api/json_to_csv_request", server.uri()),
        Duration::from_secs(5),
    )
    .unwrap();
    aggregator.aggregate("P1").await.unwrap();
    let err = aggregator.aggregate("P2").await.unwrap_err();
    assert!(err.to_string().contains("csv failed"));
}

// ============ S3 ============

fn s3_store(server: &MockServer) -> S3Store {
    S3Store::new(
        "docs",
        "us-east-1",
        Some(server.uri()),
        AwsCredentials {
            access_key_id: "AKID".into(),
            secret_access_key: "secret".into(),
            session_token: None,
        },
    )
    .unwrap()
}

#[tokio::test]
async fn test_s3_store_path_style_operations() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/docs/base/P1/results/dispensas/a.json"))
        .and(header_exists("authorization"))
        .and(header_exists("x-amz-content-sha256"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/docs/base/P1/raw/a.pdf"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"%PDF".to_vec()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/docs/base/P1/raw/missing.pdf"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/docs/base/P1/results/.csv_generation.lock"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("HEAD"))
        .and(path("/docs/base/P1/results/csv_generation.done"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let store = s3_store(&server);
    store
        .put_json("base/P1/results/dispensas/a.json", &json!({"x": 1}))
        .await
        .unwrap();
    assert_eq!(store.get("base/P1/raw/a.pdf").await.unwrap(), b"%PDF".to_vec());
    assert!(store.get("base/P1/raw/missing.pdf").await.unwrap_err().is_not_found());
    store.delete("base/P1/results/.csv_generation.lock").await.unwrap();
    assert!(!store.exists("base/P1/results/csv_generation.done").await.unwrap());
    assert_eq!(store.locator("base/P1/raw/a.pdf"), "s3://docs/base/P1/raw/a.pdf");
}

#[tokio::test]
async fn test_s3_store_list_follows_continuation() {
    let server = MockServer::start().await;
    let page1 = r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult>
  <IsTruncated>true</IsTruncated>
  <Contents><Key>base/P1/raw/b.pdf</Key></Contents>
  <NextContinuationToken>tok-2</NextContinuationToken>
</ListBucketResult>"#;
    let page2 = r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult>
  <IsTruncated>false</IsTruncated>
  <Contents><Key>base/P1/raw/a.pdf</Key></Contents>
</ListBucketResult>"#;
    Mock::given(method("GET"))
        .and(path("/docs/"))
        .and(query_param("continuation-token", "tok-2"))
        .respond_with(ResponseTemplate::new(200).set_body_string(page2))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/docs/"))
        .and(query_param("list-type", "2"))
        .and(query_param("prefix", "base/P1/raw/"))
        .respond_with(ResponseTemplate::new(200).set_body_string(page1))
        .up_to_n_times(1)
        .mount(&server)
        .await;

    let store = s3_store(&server);
    let keys = store.list("base/P1/raw/").await.unwrap();
    assert_eq!(keys, vec!["base/P1/raw/a.pdf".to_string(), "base/P1/raw/b.pdf".to_string()]);
}
