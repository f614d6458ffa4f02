use axum::http::StatusCode;
use chrono::{NaiveDate, NaiveDateTime};
use pointledger_server::{server, storage};
use pointledger_shared::domain::{Child, TransactionKind};
use reqwest::Client;
use serde_json::{Value, json};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::Path;

struct TestServer {
    base: String,
    client: Client,
    store: storage::Store,
    handle: tokio::task::JoinHandle<()>,
    _tempdir: tempfile::TempDir,
}

impl TestServer {
    async fn spawn() -> Option<Self> {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let (addr, store, handle) = match start_server(&db_path).await {
            Ok(v) => v,
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                eprintln!("Skipping test due to sandbox restrictions: {e}");
                return None;
            }
            Err(e) => panic!("failed to start server: {e}"),
        };
        Some(Self {
            base: format!("http://{}", addr),
            client: Client::new(),
            store,
            handle,
            _tempdir: dir,
        })
    }

    async fn request(&self, method: &str, path: &str, body: Option<Value>) -> (StatusCode, Value) {
        let url = format!("{}{}", self.base, path);
        let mut req = match method {
            "GET" => self.client.get(&url),
            "POST" => self.client.post(&url),
            "PUT" => self.client.put(&url),
            other => panic!("unsupported method {other}"),
        };
        if let Some(b) = body {
            req = req.json(&b);
        }
        let resp = req.send().await.unwrap();
        let status = resp.status();
        let text = resp.text().await.unwrap();
        let val = if text.is_empty() {
            json!(null)
        } else {
            serde_json::from_str(&text).unwrap_or(json!({"raw": text}))
        };
        (status, val)
    }

    async fn request_expect(
        &self,
        method: &str,
        path: &str,
        body: Option<Value>,
        expected: StatusCode,
    ) -> Value {
        let (status, value) = self.request(method, path, body).await;
        assert_eq!(
            status, expected,
            "{method} {path} returned {status:?} with body {value:?}",
        );
        value
    }

    async fn award(&self, child: &str, amount: i64) -> Value {
        self.request_expect(
            "POST",
            &format!("/api/children/{child}/transactions"),
            Some(json!({"amount": amount, "kind": "award", "reason": "test"})),
            StatusCode::OK,
        )
        .await
    }

    async fn progress(&self, child: &str) -> Value {
        self.request_expect(
            "GET",
            &format!("/api/children/{child}/progress"),
            None,
            StatusCode::OK,
        )
        .await
    }

    async fn achievements(&self, child: &str) -> Vec<Value> {
        self.request_expect(
            "GET",
            &format!("/api/children/{child}/achievements"),
            None,
            StatusCode::OK,
        )
        .await
        .as_array()
        .unwrap()
        .clone()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn start_server(
    tmp_db: &Path,
) -> Result<(SocketAddr, storage::Store, tokio::task::JoinHandle<()>), std::io::Error> {
    let config = server::AppConfig {
        children: vec![
            Child {
                id: "alice".into(),
                family_id: "fam1".into(),
                display_name: "Alice".into(),
            },
            Child {
                id: "bob".into(),
                family_id: "fam1".into(),
                display_name: "Bob".into(),
            },
        ],
        catalog: server::CatalogConfig::default(),
        timezone: None,
        dev_cors_origin: None,
        listen_port: None,
    };

    let store = storage::Store::connect_sqlite(tmp_db.to_str().unwrap(), chrono_tz::UTC)
        .await
        .expect("db");
    store
        .seed_from_config(&config.children, &config.catalog.levels, &config.catalog.rules)
        .await
        .expect("seed");

    let state = server::AppState::new(config, store.clone());
    let app = server::router(state);

    let listener = tokio::net::TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, 0)).await?;
    let addr = listener.local_addr()?;
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    Ok((addr, store, handle))
}

fn unlocked_keys(resp: &Value) -> Vec<String> {
    resp.get("unlocked")
        .and_then(|v| v.as_array())
        .unwrap()
        .iter()
        .map(|k| k.as_str().unwrap().to_string())
        .collect()
}

fn ts(date: &str) -> NaiveDateTime {
    date.parse::<NaiveDate>().unwrap().and_hms_opt(12, 0, 0).unwrap()
}

#[tokio::test]
async fn public_endpoints_work() {
    let Some(server) = TestServer::spawn().await else {
        return;
    };
    server
        .request_expect("GET", "/healthz", None, StatusCode::OK)
        .await;
    let children = server
        .request_expect("GET", "/api/children", None, StatusCode::OK)
        .await;
    assert!(
        children
            .as_array()
            .unwrap()
            .iter()
            .any(|c| c.get("id").unwrap() == "alice")
    );
    let catalog = server
        .request_expect("GET", "/api/catalog", None, StatusCode::OK)
        .await;
    assert_eq!(catalog.get("levels").unwrap().as_array().unwrap().len(), 3);
    assert!(!catalog.get("rules").unwrap().as_array().unwrap().is_empty());
}

#[tokio::test]
async fn ingest_updates_progress_and_unlocks() {
    let Some(server) = TestServer::spawn().await else {
        return;
    };
    let resp = server.award("alice", 60).await;
    let progress = resp.get("progress").unwrap();
    assert_eq!(progress.get("total_earned").unwrap().as_i64().unwrap(), 60);
    assert_eq!(progress.get("level").unwrap(), "bronze");
    assert_eq!(progress.get("current_streak").unwrap().as_i64().unwrap(), 1);

    let unlocked = unlocked_keys(&resp);
    assert!(unlocked.contains(&"first-points".to_string()));
    assert!(unlocked.contains(&"points-10".to_string()));
    assert!(unlocked.contains(&"points-50".to_string()));
    assert!(unlocked.contains(&"big-task-50".to_string()));
    assert!(!unlocked.contains(&"points-100".to_string()));

    // A second small award unlocks nothing new.
    let resp = server.award("alice", 5).await;
    assert!(unlocked_keys(&resp).is_empty());
    assert_eq!(
        resp.get("progress")
            .unwrap()
            .get("total_earned")
            .unwrap()
            .as_i64()
            .unwrap(),
        65
    );

    // One achievement row per kind, with display metadata denormalized.
    let achievements = server.achievements("alice").await;
    let first_points: Vec<&Value> = achievements
        .iter()
        .filter(|a| a.get("kind").unwrap() == "first-points")
        .collect();
    assert_eq!(first_points.len(), 1);
    assert_eq!(first_points[0].get("title").unwrap(), "First Points!");

    // History is readable back, newest first.
    let history = server
        .request_expect(
            "GET",
            "/api/children/alice/transactions",
            None,
            StatusCode::OK,
        )
        .await;
    let history = history.as_array().unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].get("amount").unwrap().as_i64().unwrap(), 5);

    // Bob is untouched by Alice's events.
    let bob = server.progress("bob").await;
    assert_eq!(bob.get("total_earned").unwrap().as_i64().unwrap(), 0);
}

#[tokio::test]
async fn level_boundaries_follow_catalog() {
    let Some(server) = TestServer::spawn().await else {
        return;
    };
    let resp = server.award("alice", 199).await;
    assert_eq!(resp.get("progress").unwrap().get("level").unwrap(), "bronze");
    let resp = server.award("alice", 1).await;
    assert_eq!(resp.get("progress").unwrap().get("level").unwrap(), "silver");
    let resp = server.award("alice", 300).await;
    let progress = resp.get("progress").unwrap();
    assert_eq!(progress.get("level").unwrap(), "gold");
    assert_eq!(progress.get("total_earned").unwrap().as_i64().unwrap(), 500);
    assert!(unlocked_keys(&resp).contains(&"points-500".to_string()));
}

#[tokio::test]
async fn redemptions_unlock_without_reducing_total() {
    let Some(server) = TestServer::spawn().await else {
        return;
    };
    server.award("alice", 150).await;
    let resp = server
        .request_expect(
            "POST",
            "/api/children/alice/transactions",
            Some(json!({"amount": -120, "kind": "redemption", "reason": "toy"})),
            StatusCode::OK,
        )
        .await;
    let unlocked = unlocked_keys(&resp);
    assert!(unlocked.contains(&"first-spend".to_string()));
    assert!(unlocked.contains(&"big-spend-100".to_string()));
    // total_earned is a lifetime counter; spending never reduces it.
    assert_eq!(
        resp.get("progress")
            .unwrap()
            .get("total_earned")
            .unwrap()
            .as_i64()
            .unwrap(),
        150
    );
}

#[tokio::test]
async fn invalid_requests_are_rejected() {
    let Some(server) = TestServer::spawn().await else {
        return;
    };
    let cases = vec![
        json!({"amount": 0, "kind": "award"}),
        json!({"amount": -5, "kind": "award"}),
        json!({"amount": 5, "kind": "redemption"}),
    ];
    for body in cases {
        server
            .request_expect(
                "POST",
                "/api/children/alice/transactions",
                Some(body),
                StatusCode::BAD_REQUEST,
            )
            .await;
    }
    server
        .request_expect(
            "POST",
            "/api/children/nobody/transactions",
            Some(json!({"amount": 5, "kind": "award"})),
            StatusCode::NOT_FOUND,
        )
        .await;
    // The read-back surface is consistent: every per-child GET 404s for an
    // unknown id instead of returning an empty payload.
    for path in [
        "/api/children/nobody/achievements",
        "/api/children/nobody/transactions",
        "/api/children/nobody/progress",
    ] {
        server
            .request_expect("GET", path, None, StatusCode::NOT_FOUND)
            .await;
    }
}

#[tokio::test]
async fn concurrent_double_award_unlocks_once() {
    let Some(server) = TestServer::spawn().await else {
        return;
    };
    // Two concurrent 300-point awards crossing the 500 milestone together.
    let (a, b) = tokio::join!(server.award("alice", 300), server.award("alice", 300));
    let totals: Vec<i64> = [&a, &b]
        .iter()
        .map(|r| {
            r.get("progress")
                .unwrap()
                .get("total_earned")
                .unwrap()
                .as_i64()
                .unwrap()
        })
        .collect();
    assert!(totals.contains(&600), "one response must see the final total");

    let progress = server.progress("alice").await;
    assert_eq!(progress.get("total_earned").unwrap().as_i64().unwrap(), 600);
    assert_eq!(progress.get("level").unwrap(), "gold");

    let achievements = server.achievements("alice").await;
    let milestone_rows = achievements
        .iter()
        .filter(|a| a.get("kind").unwrap() == "points-500")
        .count();
    assert_eq!(milestone_rows, 1, "milestone must unlock exactly once");
}

#[tokio::test]
async fn reconciliation_repairs_drift() {
    let Some(server) = TestServer::spawn().await else {
        return;
    };
    // Backfill three consecutive award days without running the engine
    // chain, simulating history the real-time path never saw.
    for day in ["2026-05-01", "2026-05-02", "2026-05-03"] {
        server
            .store
            .import_transaction("alice", 10, TransactionKind::Award, None, ts(day))
            .await
            .unwrap();
    }
    let third = server
        .store
        .import_transaction("alice", 10, TransactionKind::Award, None, ts("2026-05-03"))
        .await
        .unwrap();

    // Derived state is stale until the sweep runs.
    let progress = server.progress("alice").await;
    assert_eq!(progress.get("total_earned").unwrap().as_i64().unwrap(), 0);

    let summary = server
        .request_expect(
            "POST",
            "/api/reconcile",
            Some(json!({"child_id": "alice"})),
            StatusCode::OK,
        )
        .await;
    assert_eq!(summary.get("children_checked").unwrap().as_u64().unwrap(), 1);
    assert_eq!(
        summary.get("children_corrected").unwrap().as_u64().unwrap(),
        1
    );
    assert!(summary.get("achievements_added").unwrap().as_u64().unwrap() >= 3);

    let progress = server.progress("alice").await;
    assert_eq!(progress.get("total_earned").unwrap().as_i64().unwrap(), 40);
    assert_eq!(progress.get("current_streak").unwrap().as_i64().unwrap(), 3);
    assert_eq!(progress.get("longest_streak").unwrap().as_i64().unwrap(), 3);
    assert_eq!(progress.get("last_award_date").unwrap(), "2026-05-03");

    let achievements = server.achievements("alice").await;
    let streak3 = achievements
        .iter()
        .find(|a| a.get("kind").unwrap() == "streak-3")
        .expect("streak milestone after replay");
    assert!(
        streak3
            .get("unlocked_at")
            .unwrap()
            .as_str()
            .unwrap()
            .starts_with("2026-05-03"),
        "missed unlocks carry the timestamp of the event that earned them"
    );

    // A second sweep finds nothing to do.
    let summary = server
        .request_expect("POST", "/api/reconcile", None, StatusCode::OK)
        .await;
    assert_eq!(
        summary.get("children_corrected").unwrap().as_u64().unwrap(),
        0
    );
    assert_eq!(
        summary.get("achievements_added").unwrap().as_u64().unwrap(),
        0
    );

    // Operator data correction: delete one event, reconcile, and the
    // projection follows the log while unlocked achievements stay.
    assert!(server.store.delete_transaction(third).await.unwrap());
    let summary = server
        .request_expect(
            "POST",
            "/api/reconcile",
            Some(json!({"child_id": "alice"})),
            StatusCode::OK,
        )
        .await;
    assert_eq!(
        summary.get("children_corrected").unwrap().as_u64().unwrap(),
        1
    );
    let progress = server.progress("alice").await;
    assert_eq!(progress.get("total_earned").unwrap().as_i64().unwrap(), 30);
    let achievements = server.achievements("alice").await;
    assert!(
        achievements
            .iter()
            .any(|a| a.get("kind").unwrap() == "streak-3"),
        "reconciliation never deletes achievements"
    );

    // Reconciling an unknown child is a client error, not a crash.
    server
        .request_expect(
            "POST",
            "/api/reconcile",
            Some(json!({"child_id": "nobody"})),
            StatusCode::BAD_REQUEST,
        )
        .await;
}

#[tokio::test]
async fn catalog_edits_apply_without_redeploy() {
    let Some(server) = TestServer::spawn().await else {
        return;
    };
    // Malformed predicate is rejected at write time.
    server
        .request_expect(
            "PUT",
            "/api/catalog/rules/bogus",
            Some(json!({
                "predicate": "points_at_least",
                "threshold": 5,
                "title": "Bogus",
                "description": "",
                "icon": "x"
            })),
            StatusCode::BAD_REQUEST,
        )
        .await;

    server
        .request_expect(
            "PUT",
            "/api/catalog/rules/tiny-milestone",
            Some(json!({
                "predicate": "total_at_least",
                "threshold": 5,
                "title": "Tiny Milestone",
                "description": "Earned five points",
                "icon": "seedling"
            })),
            StatusCode::NO_CONTENT,
        )
        .await;
    server
        .request_expect(
            "PUT",
            "/api/catalog/levels/silver",
            Some(json!({"min_total": 50})),
            StatusCode::NO_CONTENT,
        )
        .await;

    let resp = server.award("alice", 60).await;
    assert!(unlocked_keys(&resp).contains(&"tiny-milestone".to_string()));
    assert_eq!(resp.get("progress").unwrap().get("level").unwrap(), "silver");

    let catalog = server
        .request_expect("GET", "/api/catalog", None, StatusCode::OK)
        .await;
    assert!(
        catalog
            .get("rules")
            .unwrap()
            .as_array()
            .unwrap()
            .iter()
            .any(|r| r.get("key").unwrap() == "tiny-milestone")
    );
}
