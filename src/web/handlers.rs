//! HTTP request handlers.

use super::AppState;
use crate::db::{AggregateView, GatewayStatus, MachineStat, Snapshot};
use crate::service::{AggregateError, IngestError, ValidationError};

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Json, Response},
};
use chrono::Utc;
use serde_json::json;

// ============================================================================
// Templates
// ============================================================================

const STATUS_TEMPLATE: &str = include_str!("templates/status.html");
const LAYOUT_TEMPLATE: &str = include_str!("templates/layout.html");

/// Shown in place of live values when the aggregate read fails.
const UNAVAILABLE: &str = "unavailable";

/// Pollers may reuse a view briefly and serve it stale a while longer.
const STATS_CACHE_CONTROL: &str = "public, s-maxage=10, stale-while-revalidate=20";

// ============================================================================
// Error mapping
// ============================================================================

/// Client-facing text for store failures; the detail only goes to the log.
const STORAGE_UNAVAILABLE: &str = "Storage unavailable";

fn error_body(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        match self {
            IngestError::Misconfigured => {
                tracing::error!("Rejecting push: SCOUT_API_KEY is not set");
                error_body(StatusCode::INTERNAL_SERVER_ERROR, "Server misconfigured")
            }
            IngestError::Unauthorized => {
                tracing::warn!("Rejecting push: bad credentials");
                error_body(StatusCode::UNAUTHORIZED, "Unauthorized")
            }
            IngestError::InvalidPayload(e) => {
                tracing::warn!("Rejecting push: {}", e);
                let message = match e {
                    ValidationError::InvalidJson(_) => "Invalid JSON",
                    ValidationError::NotAnObject | ValidationError::MissingField(_) => {
                        "Missing required fields"
                    }
                };
                error_body(StatusCode::BAD_REQUEST, message)
            }
            IngestError::Store(e) => {
                tracing::error!("Failed to store push: {}", e);
                error_body(StatusCode::INTERNAL_SERVER_ERROR, STORAGE_UNAVAILABLE)
            }
        }
    }
}

impl IntoResponse for AggregateError {
    fn into_response(self) -> Response {
        match self {
            AggregateError::Timeout(limit) => {
                tracing::warn!("Aggregate read exceeded {:?}", limit);
                error_body(StatusCode::SERVICE_UNAVAILABLE, "Stats temporarily unavailable")
            }
            AggregateError::Store(e) => {
                tracing::error!("Failed to read stats: {}", e);
                error_body(StatusCode::INTERNAL_SERVER_ERROR, STORAGE_UNAVAILABLE)
            }
        }
    }
}

// ============================================================================
// API: Stats
// ============================================================================

pub async fn handle_push_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    match state.ingest.ingest(authorization, &body).await {
        Ok(accepted) => {
            tracing::debug!(
                machine = %accepted.machine_id,
                cpu_temp = ?accepted.cpu_temp,
                push_count = accepted.push_count,
                sampled = accepted.sampled,
                alerts = accepted.alerts,
                "Push accepted"
            );
            Json(json!({ "ok": true })).into_response()
        }
        Err(e) => e.into_response(),
    }
}

pub async fn handle_get_stats(State(state): State<AppState>) -> Response {
    match state.aggregate.get_aggregate().await {
        Ok(view) => ([(header::CACHE_CONTROL, STATS_CACHE_CONTROL)], Json(view)).into_response(),
        Err(e) => e.into_response(),
    }
}

// ============================================================================
// Pages
// ============================================================================

pub async fn handle_status(State(state): State<AppState>) -> impl IntoResponse {
    let db_size = state.store.get_db_size_bytes().unwrap_or(0);
    let page_count = state.store.get_page_count().unwrap_or(0);
    let freelist_count = state.store.get_freelist_count().unwrap_or(0);
    let alert_count = state.store.get_alert_count().unwrap_or(0);
    let machine_stats = state.store.get_machine_stats().unwrap_or_default();
    let view = match state.aggregate.get_aggregate().await {
        Ok(view) => Some(view),
        Err(e) => {
            tracing::error!("Status page rendered without live stats: {}", e);
            None
        }
    };

    let now = Utc::now().timestamp();
    let ttl = state.config.retention.current_ttl_secs;

    let machine_rows: String = machine_stats
        .iter()
        .map(|stat| machine_row(stat, view.as_ref(), now, ttl))
        .collect::<Vec<_>>()
        .join("\n");

    let (latest_alert, monitoring_since, stats_notice) = match &view {
        Some(view) => (
            view.alerts
                .first()
                .map(|alert| {
                    format!(
                        "{} ({})",
                        escape_html(alert.message().unwrap_or("-")),
                        escape_html(alert.machine_id().unwrap_or("-"))
                    )
                })
                .unwrap_or_else(|| "none".to_string()),
            escape_html(view.monitoring_since.as_deref().unwrap_or("never")),
            String::new(),
        ),
        None => (
            UNAVAILABLE.to_string(),
            UNAVAILABLE.to_string(),
            r#"<p class="notice">Live stats unavailable: showing storage figures only.</p>"#
                .to_string(),
        ),
    };

    let content = STATUS_TEMPLATE
        .replace("{{db_size}}", &format_bytes(db_size))
        .replace("{{page_count}}", &page_count.to_string())
        .replace("{{freelist_count}}", &freelist_count.to_string())
        .replace("{{alert_count}}", &alert_count.to_string())
        .replace("{{alerts_max}}", &state.config.retention.alerts_max.to_string())
        .replace("{{history_max}}", &state.config.retention.history_max.to_string())
        .replace("{{stats_notice}}", &stats_notice)
        .replace("{{monitoring_since}}", &monitoring_since)
        .replace("{{latest_alert}}", &latest_alert)
        .replace("{{machine_rows}}", &machine_rows);

    let page = LAYOUT_TEMPLATE
        .replace("{{title}}", "Scout Dashboard Status")
        .replace("{{content}}", &content);

    Html(page)
}

fn machine_row(stat: &MachineStat, view: Option<&AggregateView>, now: i64, ttl: i64) -> String {
    let current = view
        .and_then(|v| v.machines.get(&stat.machine_id))
        .and_then(|record| record.current.as_ref());

    let state = match view {
        None => UNAVAILABLE,
        Some(_) if current.and_then(Snapshot::ts).is_some_and(|ts| now - ts < ttl) => "online",
        Some(_) => "offline",
    };

    let system = current.and_then(Snapshot::system);
    let cpu = current
        .and_then(Snapshot::cpu_temp)
        .map(|t| format!("{:.1}&deg;C", t))
        .unwrap_or_else(|| "-".to_string());
    let memory = system
        .as_ref()
        .map(|s| format!("{} / {} MB free", s.mem_available_mb, s.mem_total_mb))
        .unwrap_or_else(|| "-".to_string());
    let disk = system
        .as_ref()
        .map(|s| format!("{:.1}%", s.disk_used_pct))
        .unwrap_or_else(|| "-".to_string());

    let gateway = match current.and_then(Snapshot::gateway).map(|g| g.status) {
        Some(GatewayStatus::Up) => "up",
        Some(GatewayStatus::Down) => "down",
        None => "-",
    };

    let room = current
        .and_then(Snapshot::sensor)
        .and_then(|s| s.temperature)
        .map(|t| format!("{:.1}&deg;C", t))
        .unwrap_or_else(|| "-".to_string());

    let health = current
        .and_then(Snapshot::dashboard)
        .map(|d| format!("{}/10", d.health_score))
        .unwrap_or_else(|| "-".to_string());

    format!(
        "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
        escape_html(&stat.machine_id),
        state,
        stat.push_count,
        stat.history_len,
        cpu,
        memory,
        disk,
        gateway,
        room,
        health,
    )
}

fn format_bytes(bytes: i64) -> String {
    const KB: i64 = 1024;
    const MB: i64 = KB * 1024;
    const GB: i64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

// ============================================================================
// Static Assets
// ============================================================================

pub async fn handle_favicon() -> impl IntoResponse {
    let svg = r##"<svg xmlns="http://www.w3.org/2000/svg" viewBox="0 0 100 100">
        <circle cx="50" cy="50" r="45" fill="#34d399"/>
        <path d="M20 55 L35 55 L45 30 L55 70 L65 45 L80 45" stroke="white" stroke-width="5" fill="none"/>
    </svg>"##;

    ([(header::CONTENT_TYPE, "image/svg+xml")], svg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::db::{Store, StoreError};
    use crate::web::Server;
    use serde_json::Value;

    const KEY: &str = "test-key";

    async fn spawn_server(api_key: Option<&str>) -> (String, Store) {
        let store = Store::open_in_memory().unwrap();
        let config = ServerConfig {
            api_key: api_key.map(str::to_string),
            ..ServerConfig::default()
        };
        let server = Server::new(config, store.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { server.serve(listener).await });
        (format!("http://{}", addr), store)
    }

    async fn post(base: &str, auth: Option<&str>, body: &str) -> reqwest::Response {
        let mut req = reqwest::Client::new()
            .post(format!("{}/api/stats", base))
            .header("content-type", "application/json")
            .body(body.to_string());
        if let Some(auth) = auth {
            req = req.header("authorization", auth);
        }
        req.send().await.unwrap()
    }

    #[tokio::test]
    async fn test_push_then_read() {
        let (base, _store) = spawn_server(Some(KEY)).await;
        let auth = format!("Bearer {}", KEY);

        let resp = post(
            &base,
            Some(&auth),
            r#"{"ts": 1700000000, "machine": "clawpi", "system": {"cpu_temp": 52.3},
               "alerts": [{"ts": 1700000000, "message": "disk 91%"}]}"#,
        )
        .await;
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.json::<Value>().await.unwrap(), json!({"ok": true}));

        let resp = reqwest::get(format!("{}/api/stats", base)).await.unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(
            resp.headers()[header::CACHE_CONTROL],
            STATS_CACHE_CONTROL
        );

        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["machines"]["clawpi"]["current"]["system"]["cpu_temp"], 52.3);
        assert_eq!(body["machines"]["clawpi"]["history"], json!([]));
        assert_eq!(body["alerts"][0]["machine"], "clawpi");
        assert_eq!(body["alerts"][0]["message"], "disk 91%");
        assert!(body["monitoring_since"].is_string());
    }

    #[tokio::test]
    async fn test_push_error_categories() {
        let (base, store) = spawn_server(Some(KEY)).await;
        let auth = format!("Bearer {}", KEY);

        let resp = post(&base, None, r#"{"ts": 1, "system": {}}"#).await;
        assert_eq!(resp.status(), 401);

        let resp = post(&base, Some("Bearer wrong"), r#"{"ts": 1, "system": {}}"#).await;
        assert_eq!(resp.status(), 401);
        assert_eq!(resp.json::<Value>().await.unwrap()["error"], "Unauthorized");

        let resp = post(&base, Some(&auth), "{oops").await;
        assert_eq!(resp.status(), 400);
        assert_eq!(resp.json::<Value>().await.unwrap()["error"], "Invalid JSON");

        let resp = post(&base, Some(&auth), r#"{"system": {}}"#).await;
        assert_eq!(resp.status(), 400);
        assert_eq!(
            resp.json::<Value>().await.unwrap()["error"],
            "Missing required fields"
        );

        assert!(store.get_machines().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_push_without_configured_key() {
        let (base, store) = spawn_server(None).await;

        let resp = post(&base, Some("Bearer anything"), r#"{"ts": 1, "system": {}}"#).await;
        assert_eq!(resp.status(), 500);
        assert_eq!(
            resp.json::<Value>().await.unwrap()["error"],
            "Server misconfigured"
        );
        assert!(store.get_machines().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_read() {
        let (base, _store) = spawn_server(Some(KEY)).await;

        let body: Value = reqwest::get(format!("{}/api/stats", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body, json!({"machines": {}, "alerts": [], "monitoring_since": null}));
    }

    #[tokio::test]
    async fn test_status_page_escapes_machine_ids() {
        let (base, _store) = spawn_server(Some(KEY)).await;
        let auth = format!("Bearer {}", KEY);
        post(&base, Some(&auth), r#"{"ts": 1, "machine": "<b>pi</b>", "system": {}}"#).await;

        let page = reqwest::get(format!("{}/status", base))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(page.contains("&lt;b&gt;pi&lt;/b&gt;"));
        assert!(!page.contains("<b>pi</b>"));
    }

    #[tokio::test]
    async fn test_status_page_marks_live_stats_unavailable() {
        let (base, store) = spawn_server(Some(KEY)).await;
        let auth = format!("Bearer {}", KEY);
        let body = format!(
            r#"{{"ts": {}, "machine": "m1", "system": {{"cpu_temp": 40.0}}}}"#,
            Utc::now().timestamp()
        );
        assert_eq!(post(&base, Some(&auth), &body).await.status(), 200);
        store.execute_batch("DROP TABLE alerts").unwrap();

        let resp = reqwest::get(format!("{}/status", base)).await.unwrap();
        assert_eq!(resp.status(), 200);
        let page = resp.text().await.unwrap();
        assert!(page.contains("Live stats unavailable"));
        assert!(page.contains("<td>m1</td><td>unavailable</td>"));
        assert!(!page.contains("offline"));
        assert!(!page.contains("never"));

        let resp = reqwest::get(format!("{}/api/stats", base)).await.unwrap();
        assert_eq!(resp.status(), 500);
        let json: Value = resp.json().await.unwrap();
        assert_eq!(json["error"], "Storage unavailable");
        assert!(!json.to_string().contains("alerts"));
    }

    #[tokio::test]
    async fn test_status_page_with_live_stats() {
        let (base, _store) = spawn_server(Some(KEY)).await;
        let auth = format!("Bearer {}", KEY);
        let body = format!(
            r#"{{"ts": {}, "machine": "m1", "system": {{"cpu_temp": 40.0}}}}"#,
            Utc::now().timestamp()
        );
        post(&base, Some(&auth), &body).await;

        let page = reqwest::get(format!("{}/status", base))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(page.contains("<td>m1</td><td>online</td>"));
        assert!(!page.contains("Live stats unavailable"));
    }

    #[tokio::test]
    async fn test_store_errors_hide_internal_detail() {
        let responses = [
            IngestError::Store(StoreError::Poisoned).into_response(),
            AggregateError::Store(StoreError::Poisoned).into_response(),
        ];
        for resp in responses {
            assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
            let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
                .await
                .unwrap();
            let json: Value = serde_json::from_slice(&bytes).unwrap();
            assert_eq!(json, json!({ "error": "Storage unavailable" }));
        }
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.00 MB");
    }
}
