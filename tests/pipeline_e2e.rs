//! End-to-end pipeline tests: HTTP ingestion through routing to webhook
//! delivery against a mock buyer endpoint.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;

use leadgen_backend::api::{self, AppState};
use leadgen_backend::delivery::payload::sign_body;
use leadgen_backend::delivery::{spawn_delivery_workers, ReqwestTransport};
use leadgen_backend::models::Config;
use leadgen_backend::policy_cache::PolicyCache;
use leadgen_backend::routing::{route_lead, RouteOutcome};
use leadgen_backend::seed::{apply_seed, SeedDocument};
use leadgen_backend::store::leads::NewLead;
use leadgen_backend::store::{now_ms, Db};

/// One captured webhook call, with the raw body bytes for signature checks.
#[derive(Debug, Clone)]
struct CapturedDelivery {
    signature: Option<String>,
    delivery_id: Option<String>,
    event: Option<String>,
    raw: String,
    body: serde_json::Value,
}

#[derive(Clone)]
struct BuyerEndpoint {
    /// Status codes to serve, in order; 200 after the script runs out.
    script: Arc<Mutex<VecDeque<u16>>>,
    deliveries: Arc<Mutex<Vec<CapturedDelivery>>>,
}

impl BuyerEndpoint {
    fn new(script: Vec<u16>) -> Self {
        Self {
            script: Arc::new(Mutex::new(script.into())),
            deliveries: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn captured(&self) -> Vec<CapturedDelivery> {
        self.deliveries.lock().clone()
    }
}

async fn buyer_hook(
    State(endpoint): State<BuyerEndpoint>,
    headers: HeaderMap,
    body: String,
) -> StatusCode {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
    };
    endpoint.deliveries.lock().push(CapturedDelivery {
        signature: header("x-webhook-signature"),
        delivery_id: header("x-leadgen-delivery-id"),
        event: header("x-leadgen-event"),
        body: serde_json::from_str(&body).unwrap_or(serde_json::Value::Null),
        raw: body,
    });
    let status = endpoint.script.lock().pop_front().unwrap_or(200);
    StatusCode::from_u16(status).unwrap_or(StatusCode::OK)
}

async fn start_buyer_server(endpoint: BuyerEndpoint) -> String {
    let app = Router::new()
        .route("/hook", post(buyer_hook))
        .with_state(endpoint);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}/hook", addr)
}

struct Harness {
    db: Db,
    base_url: String,
    buyer_endpoint: BuyerEndpoint,
    client: reqwest::Client,
    _tmp: TempDir,
}

fn test_config(db_path: &str) -> Config {
    Config {
        database_path: db_path.to_string(),
        port: 0,
        delivery_workers: 2,
        webhook_max_attempts: 3,
        // Zero backoff keeps the retry scenarios fast; spacing itself is
        // covered by the executor unit tests.
        webhook_backoff_secs: vec![0, 0, 0],
        webhook_connect_timeout_secs: 2,
        webhook_total_timeout_secs: 2,
        queue_visibility_timeout_secs: 30,
        queue_poll_interval_ms: 20,
        policy_cache_ttl_secs: 30,
        request_timeout_secs: 5,
        seed_path: None,
    }
}

fn seed_doc(webhook_url: &str, validation_rules: serde_json::Value) -> SeedDocument {
    let doc = serde_json::json!({
        "markets": [{"name": "austin", "timezone": "America/Chicago", "currency": "USD"}],
        "verticals": [{"name": "Plumbing", "slug": "plumbing"}],
        "offers": [{
            "market": "austin",
            "vertical": "plumbing",
            "name": "plumbing-austin",
            "default_price": 40.0,
            "validation_rules": validation_rules,
            "routing_config": {"strategy": "priority"},
            "sources": [{"source_key": "aus-plb-v1", "kind": "landing_page"}]
        }],
        "buyers": [{
            "name": "B1",
            "balance": 100.0,
            "webhook_url": webhook_url,
            "webhook_secret": "whsec_test",
            "enrollments": [{"offer": "plumbing-austin", "routing_priority": 3}],
            "service_areas": [{"market": "austin", "scope_type": "postal_code", "scope_value": "78701"}]
        }]
    });
    serde_json::from_value(doc).unwrap()
}

/// Boot the full stack: seeded DB, delivery workers, API server, mock buyer.
async fn start_harness(buyer_script: Vec<u16>, validation_rules: serde_json::Value) -> Harness {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("leadgen.db");
    let db_path = db_path.to_str().unwrap().to_string();

    let buyer_endpoint = BuyerEndpoint::new(buyer_script);
    let webhook_url = start_buyer_server(buyer_endpoint.clone()).await;

    let db = Db::open(&db_path).unwrap();
    apply_seed(&db, &seed_doc(&webhook_url, validation_rules)).unwrap();

    let config = Arc::new(test_config(&db_path));
    let transport = Arc::new(
        ReqwestTransport::new(
            config.webhook_connect_timeout_secs,
            config.webhook_total_timeout_secs,
        )
        .unwrap(),
    );
    spawn_delivery_workers(db.clone(), config.clone(), transport);

    let state = AppState {
        db: db.clone(),
        policies: Arc::new(PolicyCache::new(Duration::from_secs(
            config.policy_cache_ttl_secs,
        ))),
        config: config.clone(),
    };
    let app = api::router(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Harness {
        db,
        base_url: format!("http://{}", addr),
        buyer_endpoint,
        client: reqwest::Client::new(),
        _tmp: tmp,
    }
}

fn lead_body() -> serde_json::Value {
    serde_json::json!({
        "source_key": "aus-plb-v1",
        "name": "Jane",
        "email": "j@x.com",
        "phone": "+15125550123",
        "postal_code": "78701"
    })
}

async fn submit(harness: &Harness, body: &serde_json::Value) -> (StatusCode, serde_json::Value) {
    let response = harness
        .client
        .post(format!("{}/api/leads", harness.base_url))
        .json(body)
        .send()
        .await
        .unwrap();
    let status = StatusCode::from_u16(response.status().as_u16()).unwrap();
    let value = response.json::<serde_json::Value>().await.unwrap();
    (status, value)
}

async fn wait_for_status(harness: &Harness, lead_id: i64, wanted: &str) -> serde_json::Value {
    for _ in 0..200 {
        let detail = harness
            .client
            .get(format!("{}/api/leads/{}", harness.base_url, lead_id))
            .send()
            .await
            .unwrap()
            .json::<serde_json::Value>()
            .await
            .unwrap();
        if detail["status"] == wanted {
            return detail;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("lead {} never reached status {}", lead_id, wanted);
}

#[tokio::test(flavor = "multi_thread")]
async fn happy_path_delivers_exactly_once() {
    let harness = start_harness(vec![200], serde_json::json!({})).await;

    let (status, accepted) = submit(&harness, &lead_body()).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    // A fast worker may already have delivered by the time the 202 is built.
    assert!(accepted["status"] == "routed" || accepted["status"] == "delivered");
    assert_eq!(accepted["price"], 40.0);
    let lead_id = accepted["lead_id"].as_i64().unwrap();

    let detail = wait_for_status(&harness, lead_id, "delivered").await;
    assert_eq!(detail["attempt_count"], 1);

    let deliveries = harness.buyer_endpoint.captured();
    assert_eq!(deliveries.len(), 1);
    let delivery = &deliveries[0];
    assert_eq!(delivery.event.as_deref(), Some("lead.delivered"));
    assert!(delivery.delivery_id.is_some());

    // Signature verifies against the configured secret and the exact bytes.
    let expected = sign_body("whsec_test", &delivery.raw).unwrap();
    assert_eq!(delivery.signature.as_deref(), Some(expected.as_str()));

    // No client key was sent, so the body carries the derived SHA-256 key.
    let idempotency = delivery.body["data"]["idempotency"].as_str().unwrap();
    assert_eq!(idempotency.len(), 64);
    assert_eq!(delivery.body["data"]["contact"]["phone"], "+15125550123");
    assert_eq!(delivery.body["data"]["metadata"]["price"], 40.0);

    let attempts = harness.db.attempts_for(lead_id).unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].outcome.as_str(), "success");
}

#[tokio::test(flavor = "multi_thread")]
async fn replay_returns_same_lead_and_adds_no_attempts() {
    let harness = start_harness(vec![200], serde_json::json!({})).await;

    let (_, first) = submit(&harness, &lead_body()).await;
    let lead_id = first["lead_id"].as_i64().unwrap();
    wait_for_status(&harness, lead_id, "delivered").await;

    let (status, second) = submit(&harness, &lead_body()).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(second["lead_id"].as_i64().unwrap(), lead_id);
    assert_eq!(second["status"], "delivered");

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(harness.db.attempt_count(lead_id).unwrap(), 1);
    assert_eq!(harness.buyer_endpoint.captured().len(), 1);
    assert_eq!(harness.db.lead_count().unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_identical_submissions_create_one_lead() {
    let harness = Arc::new(start_harness(vec![], serde_json::json!({})).await);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let harness = harness.clone();
        handles.push(tokio::spawn(async move {
            let (status, body) = submit(&harness, &lead_body()).await;
            assert_eq!(status, StatusCode::ACCEPTED);
            body["lead_id"].as_i64().unwrap()
        }));
    }

    let mut ids = std::collections::HashSet::new();
    for handle in handles {
        ids.insert(handle.await.unwrap());
    }
    assert_eq!(ids.len(), 1);
    assert_eq!(harness.db.lead_count().unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_phone_within_window_is_rejected() {
    let rules = serde_json::json!({
        "duplicate_detection": {
            "enabled": true,
            "window_hours": 24,
            "scope": "offer",
            "keys": ["phone"],
            "match_mode": "any",
            "action": "reject",
            "reason_code": "duplicate_recent"
        }
    });
    let harness = start_harness(vec![200], rules).await;

    let (_, first) = submit(&harness, &lead_body()).await;
    let first_id = first["lead_id"].as_i64().unwrap();

    let mut body = lead_body();
    body["idempotency_key"] = serde_json::json!("client-key-0123456789abcdef");
    let (status, second) = submit(&harness, &body).await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(second["status"], "rejected");
    let second_id = second["lead_id"].as_i64().unwrap();
    assert_ne!(second_id, first_id);

    let detail = wait_for_status(&harness, second_id, "rejected").await;
    assert_eq!(detail["is_duplicate"], true);
    assert_eq!(detail["duplicate_of"].as_i64().unwrap(), first_id);
    assert_eq!(detail["validation_reason"], "duplicate_recent");
}

#[tokio::test(flavor = "multi_thread")]
async fn transient_webhook_failures_retry_to_success() {
    let harness = start_harness(vec![503, 503, 200], serde_json::json!({})).await;

    let (_, accepted) = submit(&harness, &lead_body()).await;
    let lead_id = accepted["lead_id"].as_i64().unwrap();

    let detail = wait_for_status(&harness, lead_id, "delivered").await;
    assert_eq!(detail["attempt_count"], 3);

    let attempts = harness.db.attempts_for(lead_id).unwrap();
    let outcomes: Vec<&str> = attempts.iter().map(|a| a.outcome.as_str()).collect();
    assert_eq!(
        outcomes,
        vec!["transient_failure", "transient_failure", "success"]
    );
    assert_eq!(harness.buyer_endpoint.captured().len(), 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn classification_failures_never_create_leads() {
    let harness = start_harness(vec![], serde_json::json!({})).await;

    let mut body = lead_body();
    body["source_key"] = serde_json::json!("not-a-real-key");
    let (status, error) = submit(&harness, &body).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error["detail"]["code"], "invalid_source_key");
    assert_eq!(harness.db.lead_count().unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_routers_assign_exactly_once() {
    let harness = start_harness(vec![], serde_json::json!({})).await;

    // Build a validated lead directly so two routers can race on it before
    // anything else touches it.
    let source = harness.db.active_source_by_key("aus-plb-v1").unwrap().unwrap();
    let offer = harness.db.offer_by_id(source.offer_id).unwrap().unwrap();
    let (lead_id, created) = harness
        .db
        .insert_lead_idempotent(&NewLead {
            source_id: source.id,
            offer_id: offer.id,
            market_id: offer.market_id,
            vertical_id: offer.vertical_id,
            idempotency_key: "race-key-0123456789abcdef".into(),
            name: "Jane".into(),
            email: "race@x.com".into(),
            phone: "+15125550142".into(),
            postal_code: "78701".into(),
            country_code: "US".into(),
            city: None,
            region_code: None,
            message: None,
            utm_source: None,
            utm_medium: None,
            utm_campaign: None,
            consent: None,
            gdpr_consent: None,
            normalized_email: Some("race@x.com".into()),
            normalized_phone: Some("+15125550142".into()),
            created_at_ms: now_ms(),
        })
        .unwrap();
    assert!(created);
    assert!(harness.db.mark_validated(lead_id).unwrap());

    let policies = Arc::new(PolicyCache::new(Duration::from_secs(30)));
    let spawn_router = |db: Db, policies: Arc<PolicyCache>| {
        tokio::task::spawn_blocking(move || route_lead(&db, &policies, lead_id, now_ms()).unwrap())
    };
    let t1 = spawn_router(harness.db.clone(), policies.clone());
    let t2 = spawn_router(harness.db.clone(), policies.clone());
    let (r1, r2) = (t1.await.unwrap(), t2.await.unwrap());

    let routed = [&r1, &r2]
        .iter()
        .filter(|r| matches!(r, RouteOutcome::Routed { .. }))
        .count();
    let lost = [&r1, &r2]
        .iter()
        .filter(|r| matches!(r, RouteOutcome::AlreadyRouted))
        .count();
    assert_eq!((routed, lost), (1, 1));

    let lead = harness.db.lead(lead_id).unwrap().unwrap();
    assert!(lead.buyer_id.is_some());

    let events = harness.db.lead_events_for(lead_id).unwrap();
    let outcomes: Vec<&str> = events.iter().map(|e| e.outcome.as_str()).collect();
    assert_eq!(outcomes.iter().filter(|o| **o == "routed").count(), 1);
    assert!(outcomes.contains(&"already_routed"));

    // The winner enqueued exactly one job; the workers will drain it.
    wait_for_status(&harness, lead_id, "delivered").await;
    assert_eq!(harness.db.attempt_count(lead_id).unwrap(), 1);
}
