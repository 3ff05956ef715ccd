use crate::{
    app::{AppContext, AppError, Health, SearchHit},
    auth,
};
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::signal;

#[derive(Clone)]
struct SharedState {
    ctx: Arc<AppContext>,
}

pub fn router(ctx: Arc<AppContext>) -> Router {
    let shared_state = Arc::new(SharedState { ctx });

    Router::new()
        .route("/search", get(search))
        .route("/image/:id", get(image))
        .route("/health", get(health))
        .layer(
            tower_http::trace::TraceLayer::new_for_http()
                .make_span_with(
                    tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO),
                )
                .on_response(
                    tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO),
                ),
        )
        .with_state(shared_state)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            log::error!("failed to listen for ctrl+c: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                log::error!("failed to install SIGTERM handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::warn!("shutting down");
}

async fn start_app(ctx: Arc<AppContext>) -> anyhow::Result<()> {
    let listen = ctx.config().server.listen.clone();
    if ctx.config().server.auth_token.is_none() {
        log::warn!("server.auth_token is not set, the api is open to anyone who can reach {listen}");
    }

    let app = router(ctx);

    let listener = tokio::net::TcpListener::bind(&listen).await?;
    log::info!("listening on {listen}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

/// Serves the query api until ctrl+c or SIGTERM.
pub fn start_server(ctx: Arc<AppContext>) -> anyhow::Result<()> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(start_app(ctx))
}

#[derive(Debug)]
struct HttpError(AppError);

impl IntoResponse for HttpError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self.0 {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Fetch(_) => {
                log::warn!("{}", self.0);
                StatusCode::BAD_GATEWAY
            }
            _ => {
                log::error!("{:?}", self.0);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (status, Json(json!({"error": self.0.to_string()}))).into_response()
    }
}

impl<E> From<E> for HttpError
where
    E: Into<AppError>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

fn authorize(state: &SharedState, headers: &HeaderMap) -> Result<(), HttpError> {
    let header = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    let expected = state.ctx.config().server.auth_token.as_deref();

    if auth::is_authorized(header, expected) {
        Ok(())
    } else {
        Err(AppError::Unauthorized.into())
    }
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    q: Option<String>,
    k: Option<usize>,
}

async fn search(
    State(state): State<Arc<SharedState>>,
    headers: HeaderMap,
    Query(params): Query<SearchParams>,
) -> Result<Json<Vec<SearchHit>>, HttpError> {
    authorize(&state, &headers)?;

    let query = params
        .q
        .filter(|q| !q.trim().is_empty())
        .ok_or_else(|| AppError::BadRequest("missing query parameter q".to_string()))?;

    log::debug!("search: {query:?} k={:?}", params.k);

    let ctx = state.ctx.clone();
    tokio::task::block_in_place(move || {
        ctx.search(&query, params.k).map(Json).map_err(Into::into)
    })
}

async fn image(
    State(state): State<Arc<SharedState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, HttpError> {
    authorize(&state, &headers)?;

    let ctx = state.ctx.clone();
    let bytes = tokio::task::block_in_place(move || ctx.image(&id))?;

    let content_type = image::guess_format(&bytes)
        .map(|format| format.to_mime_type())
        .unwrap_or("application/octet-stream");

    Ok(([(header::CONTENT_TYPE, content_type)], bytes))
}

async fn health(State(state): State<Arc<SharedState>>) -> Json<Health> {
    Json(state.ctx.health())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        app::image_path,
        images,
        ledger::AnnotationRecord,
        tests::{create_context, TestContext},
    };
    use axum::{
        body::{to_bytes, Body},
        http::Request,
    };
    use tower::ServiceExt;

    async fn get(app: Router, uri: &str, token: Option<&str>) -> (StatusCode, Vec<u8>, HeaderMap) {
        let mut request = Request::builder().uri(uri);
        if let Some(token) = token {
            request = request.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let response = app
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec(), headers)
    }

    fn app(test: &TestContext) -> Router {
        router(test.ctx.clone())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_search_returns_ranked_hits() {
        let test = create_context(None);

        let (status, body, _) = get(app(&test), "/search?q=Red", None).await;
        assert_eq!(status, StatusCode::OK);

        let hits: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(hits[0], json!({"img": "/image/car", "caption": "a red car"}));
        assert_eq!(hits.as_array().unwrap().len(), 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_search_k_limits_results() {
        let test = create_context(None);
        let (_, body, _) = get(app(&test), "/search?q=red&k=1", None).await;
        let hits: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(hits.as_array().unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_search_without_query_is_bad_request() {
        let test = create_context(None);
        assert_eq!(get(app(&test), "/search", None).await.0, StatusCode::BAD_REQUEST);
        assert_eq!(get(app(&test), "/search?q=%20", None).await.0, StatusCode::BAD_REQUEST);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_auth_required_when_configured() {
        let test = create_context(Some("s3cret"));

        assert_eq!(get(app(&test), "/search?q=red", None).await.0, StatusCode::UNAUTHORIZED);
        assert_eq!(
            get(app(&test), "/search?q=red", Some("wrong")).await.0,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            get(app(&test), "/image/car", None).await.0,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(get(app(&test), "/search?q=red", Some("s3cret")).await.0, StatusCode::OK);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_image_served_as_png() {
        let test = create_context(None);

        let (status, body, headers) = get(app(&test), "/image/car", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[header::CONTENT_TYPE], "image/png");
        assert!(images::is_png(&body));

        // second request comes from the cache
        get(app(&test), "/image/car", None).await;
        assert_eq!(test.fetch_calls(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_image_link_with_reserved_characters() {
        let test = create_context(None);
        test.ctx
            .ledger()
            .append(AnnotationRecord {
                id: "album/7?x#y".to_string(),
                caption: "a yellow boat".to_string(),
                source_url: "https://m.example.com/4".to_string(),
            })
            .unwrap();

        let link = image_path("album/7?x#y");
        let (status, body, _) = get(app(&test), &link, None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(images::is_png(&body));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unknown_image_is_not_found() {
        let test = create_context(None);
        let (status, body, _) = get(app(&test), "/image/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let error: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(error["error"].as_str().unwrap().contains("nope"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failed_upstream_is_bad_gateway() {
        let test = create_context(None);
        let (status, _, _) = get(app(&test), "/image/broken", None).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_health() {
        let test = create_context(None);
        let (status, body, _) = get(app(&test), "/health", None).await;
        assert_eq!(status, StatusCode::OK);

        let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(health, json!({"records": 4, "indexed": 3}));
    }
}
