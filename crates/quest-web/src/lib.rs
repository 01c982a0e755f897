//! Admin HTTP surface: health, stats dashboard and CSV exports.

use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use quest_core::{StageCatalog, STAGE_COUNT};
use quest_storage::{export_csv, ExportKind, QuestDb};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "quest-web";

pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub port: u16,
    pub admin_token: Option<String>,
}

impl WebConfig {
    pub fn from_env() -> Self {
        Self {
            port: std::env::var("QUEST_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8080),
            admin_token: std::env::var("QUEST_ADMIN_TOKEN")
                .ok()
                .filter(|v| !v.trim().is_empty()),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    db: QuestDb,
    catalog: Arc<StageCatalog>,
    admin_token: Option<String>,
}

impl AppState {
    pub fn new(db: QuestDb, catalog: Arc<StageCatalog>, admin_token: Option<String>) -> Self {
        Self {
            db,
            catalog,
            admin_token,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct TokenQuery {
    token: Option<String>,
}

struct StageRow {
    number: u8,
    name: String,
    completions: i64,
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    participants: i64,
    users: i64,
    linked_users: i64,
    chained_finishers: i64,
    addresses: i64,
    stages: Vec<StageRow>,
    promos_active: i64,
    promos_used: i64,
    promos_expired: i64,
    exports: Vec<&'static str>,
    token: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/health", get(health_handler))
        .route("/api/stats", get(stats_handler))
        .route("/api/export/{kind}", get(export_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(config: WebConfig, db: QuestDb, catalog: Arc<StageCatalog>) -> anyhow::Result<()> {
    if config.admin_token.is_none() {
        warn!("QUEST_ADMIN_TOKEN is not set; admin endpoints will refuse every request");
    }
    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!(port = config.port, "admin web surface listening");
    axum::serve(listener, app(AppState::new(db, catalog, config.admin_token))).await?;
    Ok(())
}

/// Accepts the token from the header or, for browser links, a `token` query parameter.
fn authorize(state: &AppState, headers: &HeaderMap, query: &TokenQuery) -> Result<String, Response> {
    let Some(expected) = state.admin_token.as_deref() else {
        return Err((StatusCode::FORBIDDEN, "admin surface disabled").into_response());
    };
    let presented = headers
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .or(query.token.as_deref());
    match presented {
        Some(token) if token == expected => Ok(token.to_string()),
        _ => Err((StatusCode::UNAUTHORIZED, "missing or wrong admin token").into_response()),
    }
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok", "service": CRATE_NAME }))
}

async fn stats_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
) -> Response {
    if let Err(resp) = authorize(&state, &headers, &query) {
        return resp;
    }
    match state.db.stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn export_handler(
    State(state): State<Arc<AppState>>,
    Path(kind): Path<String>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
) -> Response {
    if let Err(resp) = authorize(&state, &headers, &query) {
        return resp;
    }
    let Ok(kind) = kind.parse::<ExportKind>() else {
        return (StatusCode::BAD_REQUEST, format!("unknown export '{kind}'")).into_response();
    };
    match export_csv(&state.db, kind).await {
        Ok(bytes) => (
            [
                (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{}\"", kind.file_name()),
                ),
            ],
            bytes,
        )
            .into_response(),
        Err(err) => server_error(err),
    }
}

async fn index_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
) -> Response {
    let token = match authorize(&state, &headers, &query) {
        Ok(token) => token,
        Err(resp) => return resp,
    };
    match load_index(&state, token).await {
        Ok(tpl) => render_html(tpl),
        Err(err) => server_error(err),
    }
}

async fn load_index(state: &AppState, token: String) -> anyhow::Result<IndexTemplate> {
    let stats = state.db.stats().await?;
    let definitions = state.db.list_stage_definitions().await?;
    let stages = (1..=STAGE_COUNT)
        .map(|number| {
            let name = definitions
                .iter()
                .find(|d| d.id == i64::from(number))
                .map(|d| d.name.clone())
                .or_else(|| state.catalog.stage(number).map(|c| c.title.clone()))
                .unwrap_or_default();
            StageRow {
                number,
                name,
                completions: stats.stage_completions[usize::from(number - 1)],
            }
        })
        .collect();

    Ok(IndexTemplate {
        participants: stats.participants,
        users: stats.users,
        linked_users: stats.linked_users,
        chained_finishers: stats.chained_finishers,
        addresses: stats.addresses,
        stages,
        promos_active: stats.promos.active,
        promos_used: stats.promos.used,
        promos_expired: stats.promos.expired,
        exports: ExportKind::ALL.iter().map(|k| k.as_str()).collect(),
        token,
    })
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %err, "admin request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("Server error: {err}"),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use quest_core::ParticipantImport;
    use tower::ServiceExt;

    async fn test_app(token: Option<&str>) -> (Router, QuestDb) {
        let db = QuestDb::in_memory().await.unwrap();
        db.import_participants(&[ParticipantImport {
            external_id: "R-1".to_string(),
            first_name: Some("Анна".to_string()),
            last_name: None,
            email: Some("anna@example.com".to_string()),
            phone: None,
            stage_id: 1,
        }])
        .await
        .unwrap();
        db.load_promo_codes(["RUN-1", "RUN-2"]).await.unwrap();
        let catalog = Arc::new(StageCatalog::embedded().unwrap());
        let router = app(AppState::new(db.clone(), catalog, token.map(str::to_string)));
        (router, db)
    }

    async fn body_text(resp: Response) -> String {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(body.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn health_is_public() {
        let (app, _) = test_app(None).await;
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(body_text(resp).await.contains("\"ok\""));
    }

    #[tokio::test]
    async fn admin_routes_require_the_token() {
        let (app, _) = test_app(Some("s3cret")).await;
        let missing = app
            .clone()
            .oneshot(Request::builder().uri("/api/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

        let wrong = app
            .oneshot(
                Request::builder()
                    .uri("/api/stats")
                    .header(ADMIN_TOKEN_HEADER, "nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);

        let (disabled, _) = test_app(None).await;
        let resp = disabled
            .oneshot(Request::builder().uri("/api/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn stats_report_counts_as_json() {
        let (app, _) = test_app(Some("s3cret")).await;
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/stats")
                    .header(ADMIN_TOKEN_HEADER, "s3cret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let stats: serde_json::Value = serde_json::from_str(&body_text(resp).await).unwrap();
        assert_eq!(stats["participants"], 1);
        assert_eq!(stats["promos"]["active"], 2);
    }

    #[tokio::test]
    async fn exports_are_csv_attachments() {
        let (app, _) = test_app(Some("s3cret")).await;
        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/export/promos?token=s3cret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::CONTENT_DISPOSITION].to_str().unwrap(),
            "attachment; filename=\"promos.csv\""
        );
        let text = body_text(resp).await;
        assert!(text.starts_with("code,status"));
        assert!(text.contains("RUN-2"));

        let unknown = app
            .oneshot(
                Request::builder()
                    .uri("/api/export/secrets?token=s3cret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(unknown.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn dashboard_renders_stage_names() {
        let (app, db) = test_app(Some("s3cret")).await;
        db.upsert_stage_definition(2, "Ночной забег").await.unwrap();
        let resp = app
            .oneshot(Request::builder().uri("/?token=s3cret").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let html = body_text(resp).await;
        assert!(html.contains("Run Quest"));
        assert!(html.contains("Эхо старта"));
        assert!(html.contains("Ночной забег"));
        assert!(html.contains("/api/export/addresses?token=s3cret"));
    }
}
