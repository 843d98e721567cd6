//! HTTP API against a server on a random port.

mod common;

use common::{verdict_json, TestHarness, AML_POLICY, CBN_CIRCULAR, THRESHOLD_QUERY};
use compliance_harness::server::build_router;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use tokio::net::TcpListener;

struct TestApp {
    address: String,
    client: Client,
    t: TestHarness,
}

impl TestApp {
    async fn spawn() -> Self {
        let t = TestHarness::new().await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = format!("http://{}", listener.local_addr().unwrap());
        let app = build_router(t.harness.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            address,
            client: Client::new(),
            t,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.address, path)
    }

    async fn post(&self, path: &str, body: Value) -> reqwest::Response {
        self.client
            .post(self.url(path))
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    async fn ingest(&self, id: &str, name: &str, class: &str, text: &str) -> Value {
        let resp = self
            .post(
                &format!("/documents/{}/ingest", id),
                json!({"text": text, "class": class, "name": name}),
            )
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        resp.json().await.unwrap()
    }
}

#[tokio::test]
async fn test_health() {
    let app = TestApp::spawn().await;
    let resp = app.client.get(app.url("/health")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_ingest_search_and_analyze() {
    let app = TestApp::spawn().await;

    let body = app
        .ingest("cbn", "CBN-Circular-2024", "regulator_circular", CBN_CIRCULAR)
        .await;
    assert_eq!(body["document_id"], "cbn");
    assert_eq!(body["chunk_count"], 1);
    assert_eq!(body["status"], "processed");
    app.ingest("aml-v2", "AML-Policy-v2", "internal_policy", AML_POLICY)
        .await;

    let resp = app
        .post("/compliance/search", json!({"query": THRESHOLD_QUERY, "top_k": 1}))
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["evidence"].as_array().unwrap().len(), 1);

    app.t.llm.push_ok(verdict_json(
        "NON_COMPLIANT",
        0.95,
        &["CBN-Circular-2024", "AML-Policy-v2"],
    ));
    let resp = app
        .post("/compliance/analyze", json!({"query": THRESHOLD_QUERY}))
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["verdict"]["status"], "NON_COMPLIANT");
    assert_eq!(
        body["verdict"]["source_documents"].as_array().unwrap().len(),
        2
    );
    assert_eq!(body["verdict"]["recommendations"][0]["priority"], "high");
}

#[tokio::test]
async fn test_unknown_class_is_bad_request() {
    let app = TestApp::spawn().await;
    let resp = app
        .post(
            "/documents/x/ingest",
            json!({"text": "Some text.", "class": "memo"}),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "bad_request");
}

#[tokio::test]
async fn test_ingest_while_in_progress_is_conflict() {
    let app = TestApp::spawn().await;
    let _lease = app.t.harness.ingestor.leases().try_acquire("aml-v2").unwrap();

    let resp = app
        .post(
            "/documents/aml-v2/ingest",
            json!({"text": AML_POLICY, "class": "internal_policy"}),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "in_progress");
}

#[tokio::test]
async fn test_empty_document_is_unprocessable() {
    let app = TestApp::spawn().await;
    let resp = app
        .post(
            "/documents/blank/ingest",
            json!({"text": "  ", "class": "user_upload"}),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_provider_failure_returns_generic_message() {
    let app = TestApp::spawn().await;
    app.ingest("cbn", "CBN-Circular-2024", "regulator_circular", CBN_CIRCULAR)
        .await;
    // Nothing scripted: the model call fails with a permanent error

    let resp = app
        .post("/compliance/analyze", json!({"query": THRESHOLD_QUERY}))
        .await;
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "unavailable");
    let message = body["error"]["message"].as_str().unwrap();
    assert!(!message.contains("scripted"));
}

#[tokio::test]
async fn test_correction_lifecycle() {
    let app = TestApp::spawn().await;

    let resp = app
        .post(
            "/corrections",
            json!({
                "scope": "aml",
                "original_query": THRESHOLD_QUERY,
                "original_response": "100,000",
                "correction_text": "The regulator threshold is 50,000."
            }),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let created: Value = resp.json().await.unwrap();
    let id = created["id"].as_str().unwrap().to_string();
    assert_eq!(created["applied"], false);

    let resp = app.post("/corrections/aml/apply", json!({})).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["applied"], 1);

    let resp = app.post("/corrections/aml/apply", json!({})).await;
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["applied"], 0);

    let body: Value = app
        .client
        .get(app.url("/corrections/aml"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["prompt_version"], 1);
    assert_eq!(body["corrections"][0]["applied"], true);

    let resp = app
        .client
        .delete(app.url(&format!("/corrections/id/{}", id)))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    let resp = app
        .client
        .delete(app.url(&format!("/corrections/id/{}", id)))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_empty_correction_is_bad_request() {
    let app = TestApp::spawn().await;
    let resp = app
        .post(
            "/corrections",
            json!({
                "scope": "aml",
                "original_query": "q",
                "original_response": "",
                "correction_text": ""
            }),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_delete_document() {
    let app = TestApp::spawn().await;
    app.ingest("cbn", "CBN-Circular-2024", "regulator_circular", CBN_CIRCULAR)
        .await;

    let resp = app
        .client
        .delete(app.url("/documents/cbn"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["vectors_removed"], 1);
}

#[tokio::test]
async fn test_delete_while_ingest_in_progress_is_conflict() {
    let app = TestApp::spawn().await;
    app.ingest("cbn", "CBN-Circular-2024", "regulator_circular", CBN_CIRCULAR)
        .await;
    let _lease = app.t.harness.ingestor.leases().try_acquire("cbn").unwrap();

    let resp = app
        .client
        .delete(app.url("/documents/cbn"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "in_progress");
}
