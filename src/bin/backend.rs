#![forbid(unsafe_code)]

//! Axum backend for WatchParty.
//!
//! Serves the JSON API used by the polling single-page view plus the static
//! files of that view. Every handler that needs to know who is calling takes
//! a [`Viewer`], resolved once per request from the session token.

use std::{
    net::{IpAddr, SocketAddr},
    path::{Component, Path, PathBuf},
    sync::Arc,
    time::Instant,
};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::Body,
    extract::{
        FromRequest, FromRequestParts, Query, Request, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::{HeaderMap, HeaderValue, StatusCode, header, request::Parts},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use clap::Parser;
use log::{debug, error, info, warn};
use mime_guess::MimeGuess;
use serde::{Deserialize, Serialize};
use tokio::{fs::File, signal, task::spawn_blocking};
use tokio_util::io::ReaderStream;
use watchparty::{
    auth::{Auth, AuthError, SessionGrant},
    config::{RuntimeOverrides, RuntimeSettings, resolve_runtime_settings},
    logging::init_logger,
    security::ensure_not_root,
    store::{NewStream, QueueEntry, Store, StoreError, StreamKind, StreamRecord, UserRecord},
    youtube::{VideoLookup, extract_video_id},
};

const SESSION_COOKIE: &str = "watchparty_session";

#[derive(Debug, Parser)]
#[command(name = "watchparty", version, about = "Shared watch-party server")]
struct Cli {
    /// SQLite database file
    #[arg(long, value_name = "PATH")]
    database: Option<PathBuf>,
    /// Directory holding the web client
    #[arg(long, value_name = "DIR")]
    www_root: Option<PathBuf>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    host: Option<IpAddr>,
    /// Metadata lookup provider: oembed, ytdlp or none
    #[arg(long, value_name = "PROVIDER")]
    metadata: Option<String>,
    /// Log level: error, warn, info, debug or trace
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,
    /// Alternate .env file
    #[arg(long, value_name = "PATH")]
    env_file: Option<PathBuf>,
}

impl Cli {
    fn overrides(self) -> RuntimeOverrides {
        RuntimeOverrides {
            database_path: self.database,
            www_root: self.www_root,
            port: self.port,
            host: self.host.map(|host| host.to_string()),
            metadata_provider: self.metadata,
            log_level: self.log_level,
            env_path: self.env_file,
        }
    }
}

/// Shared state injected into every Axum handler.
#[derive(Clone)]
struct AppState {
    store: Store,
    auth: Auth,
    lookup: Arc<dyn VideoLookup>,
    www_root: Arc<PathBuf>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }

    /// Logs the real cause and hides it from the client.
    fn internal(cause: impl std::fmt::Display) -> Self {
        error!("internal error: {cause}");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::NotFound { resource } => Self::not_found(format!("{resource} not found")),
            StoreError::Conflict(message) => Self::conflict(message),
            err => Self::internal(format!("{err:#}")),
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(value: AuthError) -> Self {
        match value {
            AuthError::InvalidCredentials => Self::unauthorized(value.to_string()),
            AuthError::InvalidEmail | AuthError::WeakPassword => {
                Self::bad_request(value.to_string())
            }
            AuthError::EmailTaken => Self::conflict(value.to_string()),
            AuthError::Store(err) => err.into(),
            AuthError::Hash(err) => Self::internal(err),
            AuthError::SessionExpiry => Self::internal(value),
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

impl From<JsonRejection> for ApiError {
    fn from(value: JsonRejection) -> Self {
        Self::new(value.status(), value.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(value: QueryRejection) -> Self {
        Self::new(value.status(), value.body_text())
    }
}

/// `Json` whose rejections use the API's `{"error"}` shape.
struct ApiJson<T>(T);

impl<T, S> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        Ok(Self(value))
    }
}

/// `Query` whose rejections use the API's `{"error"}` shape.
struct ApiQuery<T>(T);

impl<T, S> FromRequestParts<S> for ApiQuery<T>
where
    Query<T>: FromRequestParts<S, Rejection = QueryRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Query(value) = Query::<T>::from_request_parts(parts, state).await?;
        Ok(Self(value))
    }
}

/// The authenticated user behind the current request.
struct Viewer(UserRecord);

impl FromRequestParts<AppState> for Viewer {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = session_token(&parts.headers)
            .ok_or_else(|| ApiError::unauthorized("Not authenticated"))?;
        let user = state
            .auth
            .authenticate(&token)
            .await?
            .ok_or_else(|| ApiError::unauthorized("Not authenticated"))?;
        Ok(Self(user))
    }
}

/// Bearer header first, then the session cookie.
fn session_token(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
    {
        let mut parts = value.split_ascii_whitespace();
        if parts.next() == Some("Bearer")
            && let Some(token) = parts.next()
        {
            return Some(token.to_string());
        }
    }

    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, value)| *name == SESSION_COOKIE && !value.is_empty())
        .map(|(_, value)| value.to_string())
}

fn session_cookie(grant: &SessionGrant) -> String {
    format!(
        "{SESSION_COOKIE}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
        grant.token,
        grant.max_age.num_seconds()
    )
}

fn expired_session_cookie() -> String {
    format!("{SESSION_COOKIE}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0")
}

#[derive(Deserialize)]
struct CredentialsRequest {
    email: String,
    password: String,
}

#[derive(Serialize)]
struct AuthResponse {
    token: String,
    user: UserRecord,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateStreamRequest {
    creator_id: String,
    url: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListStreamsQuery {
    creator_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ListStreamsResponse {
    streams: Vec<QueueEntry>,
    active_stream: Option<StreamRecord>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VoteRequest {
    stream_id: String,
}

#[derive(Debug, Serialize)]
struct MessageResponse {
    message: &'static str,
}

#[derive(Debug, Serialize)]
struct NextStreamResponse {
    stream: Option<StreamRecord>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let settings = resolve_runtime_settings(Cli::parse().overrides())?;
    init_logger(settings.log_level)?;
    ensure_not_root("watchparty")?;

    let RuntimeSettings {
        database_path,
        www_root,
        port,
        host,
        metadata_provider,
        session_days,
        ..
    } = settings;

    let store = Store::open(&database_path)
        .await
        .context("initializing database")?;
    let lookup = metadata_provider.build();
    info!("video metadata lookups via {}", lookup.name());
    if !www_root.join("index.html").is_file() {
        warn!(
            "{} has no index.html; only the API will be usable",
            www_root.display()
        );
    }

    let state = AppState {
        auth: Auth::new(store.clone(), session_days),
        store,
        lookup,
        www_root: Arc::new(www_root),
    };
    let app = build_router(state);

    let addr = SocketAddr::new(host, port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    info!("listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    info!("shut down");
    Ok(())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/auth/register", post(register))
        .route("/api/auth/login", post(login))
        .route("/api/auth/logout", post(logout))
        .route("/api/auth/user", get(current_user))
        .route("/api/streams", get(list_streams).post(create_stream))
        .route("/api/streams/upvotes", post(upvote))
        .route("/api/streams/downvotes", post(downvote))
        .route("/api/streams/next", get(play_next).post(play_next))
        .fallback(static_fallback)
        .layer(middleware::from_fn(log_requests))
        .with_state(state)
}

async fn shutdown_signal() {
    // Only graceful shutdown depends on this; Ctrl+C still kills the process.
    if let Err(err) = signal::ctrl_c().await {
        error!("Failed to install Ctrl+C handler: {}", err);
    }
}

async fn log_requests(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let started = Instant::now();

    let response = next.run(req).await;

    let status = response.status();
    let elapsed = started.elapsed();
    if status.is_server_error() {
        warn!("{method} {path} -> {} in {elapsed:?}", status.as_u16());
    } else if status.is_client_error() {
        info!("{method} {path} -> {} in {elapsed:?}", status.as_u16());
    } else {
        debug!("{method} {path} -> {} in {elapsed:?}", status.as_u16());
    }
    response
}

async fn register(
    State(state): State<AppState>,
    ApiJson(payload): ApiJson<CredentialsRequest>,
) -> ApiResult<Response> {
    let grant = state
        .auth
        .register(&payload.email, &payload.password)
        .await?;
    Ok(session_response(StatusCode::CREATED, grant))
}

async fn login(
    State(state): State<AppState>,
    ApiJson(payload): ApiJson<CredentialsRequest>,
) -> ApiResult<Response> {
    let grant = state.auth.login(&payload.email, &payload.password).await?;
    Ok(session_response(StatusCode::OK, grant))
}

fn session_response(status: StatusCode, grant: SessionGrant) -> Response {
    let cookie = session_cookie(&grant);
    let body = AuthResponse {
        token: grant.token,
        user: grant.user,
    };
    (status, [(header::SET_COOKIE, cookie)], Json(body)).into_response()
}

async fn logout(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Response> {
    if let Some(token) = session_token(&headers) {
        state.auth.logout(&token).await?;
    }
    Ok((
        StatusCode::NO_CONTENT,
        [(header::SET_COOKIE, expired_session_cookie())],
    )
        .into_response())
}

async fn current_user(Viewer(viewer): Viewer) -> Json<UserRecord> {
    Json(viewer)
}

async fn create_stream(
    State(state): State<AppState>,
    Viewer(viewer): Viewer,
    ApiJson(payload): ApiJson<CreateStreamRequest>,
) -> ApiResult<Json<QueueEntry>> {
    let entry = state.add_stream(&viewer, payload).await?;
    Ok(Json(entry))
}

async fn list_streams(
    State(state): State<AppState>,
    Viewer(viewer): Viewer,
    ApiQuery(query): ApiQuery<ListStreamsQuery>,
) -> ApiResult<Json<ListStreamsResponse>> {
    let creator_id = query
        .creator_id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("Missing creatorId"))?;

    let (streams, active_stream) = tokio::try_join!(
        state.store.list_queue(&creator_id, &viewer.id),
        state.store.current_stream(&creator_id),
    )?;

    Ok(Json(ListStreamsResponse {
        streams,
        active_stream,
    }))
}

async fn upvote(
    State(state): State<AppState>,
    Viewer(viewer): Viewer,
    ApiJson(payload): ApiJson<VoteRequest>,
) -> ApiResult<Json<MessageResponse>> {
    state.store.upvote(&viewer.id, &payload.stream_id).await?;
    Ok(Json(MessageResponse {
        message: "Upvoted successfully",
    }))
}

async fn downvote(
    State(state): State<AppState>,
    Viewer(viewer): Viewer,
    ApiJson(payload): ApiJson<VoteRequest>,
) -> ApiResult<Json<MessageResponse>> {
    state
        .store
        .remove_upvote(&viewer.id, &payload.stream_id)
        .await?;
    Ok(Json(MessageResponse {
        message: "Downvoted successfully",
    }))
}

/// Advances the caller's own queue; only a creator can skip their stream.
async fn play_next(
    State(state): State<AppState>,
    Viewer(viewer): Viewer,
) -> ApiResult<Json<NextStreamResponse>> {
    let stream = state.store.play_next(&viewer.id).await?;
    Ok(Json(NextStreamResponse { stream }))
}

impl AppState {
    /// Validates the URL, resolves title and thumbnails, then queues the
    /// stream on the creator's list. The creator is checked before the
    /// lookup so unknown ids never cost a network round trip.
    async fn add_stream(
        &self,
        viewer: &UserRecord,
        payload: CreateStreamRequest,
    ) -> ApiResult<QueueEntry> {
        let url = payload.url.trim().to_string();
        let video_id = extract_video_id(&url).ok_or_else(|| ApiError::bad_request("Invalid url"))?;

        if self.store.user_by_id(&payload.creator_id).await?.is_none() {
            return Err(ApiError::not_found("creator not found"));
        }

        let lookup = self.lookup.clone();
        let lookup_id = video_id.clone();
        let details = spawn_blocking(move || lookup.lookup(&lookup_id))
            .await
            .map_err(ApiError::internal)?
            .map_err(|err| {
                warn!("{} lookup failed for {video_id}: {err:#}", self.lookup.name());
                ApiError::bad_request("Could not fetch video details")
            })?;

        let (small_img, big_img) = details.images(&video_id);
        let title = match details.title.trim() {
            "" => video_id.clone(),
            title => title.to_string(),
        };

        let stream = self
            .store
            .insert_stream(NewStream {
                creator_id: payload.creator_id,
                added_by: viewer.id.clone(),
                kind: StreamKind::Youtube,
                url,
                extracted_id: video_id,
                title,
                small_img,
                big_img,
            })
            .await?;

        Ok(QueueEntry {
            stream,
            upvotes: 0,
            have_upvoted: false,
        })
    }
}

async fn static_fallback(State(state): State<AppState>, req: Request) -> Response {
    let path = req.uri().path();
    if path == "/api" || path.starts_with("/api/") {
        return ApiError::not_found("endpoint not found").into_response();
    }

    match serve_www_path(&state.www_root, path).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn serve_www_path(root: &Path, request_path: &str) -> ApiResult<Response> {
    let target = resolve_www_path(root, request_path)?;
    let metadata = tokio::fs::metadata(&target).await;

    match metadata {
        Ok(meta) if meta.is_dir() => stream_file(root.join("index.html")).await,
        Ok(_) => stream_file(target).await,
        Err(_) => {
            if should_fallback_to_index(request_path) {
                stream_file(root.join("index.html")).await
            } else {
                Err(ApiError::not_found("file not found"))
            }
        }
    }
}

fn resolve_www_path(root: &Path, request_path: &str) -> ApiResult<PathBuf> {
    let trimmed = request_path.trim_start_matches('/');
    if trimmed.is_empty() {
        return Ok(root.join("index.html"));
    }
    let candidate = Path::new(trimmed);
    if candidate
        .components()
        .any(|component| !matches!(component, Component::Normal(_)))
    {
        return Err(ApiError::not_found("file not found"));
    }
    Ok(root.join(candidate))
}

/// Client-side routes such as `/creator/{id}` have no extension and resolve
/// to the SPA entry point.
fn should_fallback_to_index(request_path: &str) -> bool {
    let trimmed = request_path.trim_start_matches('/');
    if trimmed.is_empty() {
        return true;
    }
    Path::new(trimmed).extension().is_none()
}

async fn stream_file(path: PathBuf) -> ApiResult<Response> {
    let file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;

    let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
    if let Some(mime) = MimeGuess::from_path(&path).first()
        && let Ok(value) = HeaderValue::from_str(mime.as_ref())
    {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use axum::body::to_bytes;
    use axum::http::Request as HttpRequest;
    use serde_json::{Value, json};
    use tempfile::tempdir;
    use tower::ServiceExt;
    use watchparty::youtube::{VideoDetails, default_thumbnails};

    const VIDEO_URL: &str = "https://www.youtube.com/watch?v=dQw4w9WgXcQ";

    struct StubLookup {
        fail: bool,
    }

    impl VideoLookup for StubLookup {
        fn name(&self) -> &'static str {
            "stub"
        }

        fn lookup(&self, video_id: &str) -> Result<VideoDetails> {
            if self.fail {
                bail!("video unavailable");
            }
            Ok(VideoDetails {
                title: format!("Stub {video_id}"),
                thumbnails: default_thumbnails(video_id),
            })
        }
    }

    struct BackendTestContext {
        _temp: tempfile::TempDir,
        state: AppState,
    }

    impl BackendTestContext {
        async fn new() -> Self {
            Self::with_lookup(StubLookup { fail: false }).await
        }

        async fn with_lookup(lookup: StubLookup) -> Self {
            let temp = tempdir().unwrap();
            let store = Store::open(&temp.path().join("watchparty.db"))
                .await
                .unwrap();
            let www_root = temp.path().join("www");
            std::fs::create_dir_all(www_root.join("assets")).unwrap();
            std::fs::write(www_root.join("index.html"), "<html>party</html>").unwrap();
            std::fs::write(www_root.join("assets/app.js"), "console.log(1)").unwrap();

            Self {
                state: AppState {
                    auth: Auth::new(store.clone(), 7),
                    store,
                    lookup: Arc::new(lookup),
                    www_root: Arc::new(www_root),
                },
                _temp: temp,
            }
        }

        async fn user(&self, email: &str) -> SessionGrant {
            self.state
                .auth
                .register(email, "hunter2hunter2")
                .await
                .unwrap()
        }

        async fn queue(&self, creator: &UserRecord, viewer: &UserRecord) -> QueueEntry {
            let Json(entry) = create_stream(
                State(self.state.clone()),
                Viewer(viewer.clone()),
                ApiJson(CreateStreamRequest {
                    creator_id: creator.id.clone(),
                    url: VIDEO_URL.into(),
                }),
            )
            .await
            .unwrap();
            entry
        }

        async fn send(&self, request: HttpRequest<Body>) -> (StatusCode, HeaderMap, Value) {
            let response = build_router(self.state.clone())
                .oneshot(request)
                .await
                .unwrap();
            let status = response.status();
            let headers = response.headers().clone();
            let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
            let value = if body.is_empty() {
                Value::Null
            } else {
                serde_json::from_slice(&body).unwrap_or(Value::String(
                    String::from_utf8_lossy(&body).into_owned(),
                ))
            };
            (status, headers, value)
        }
    }

    fn json_request(method: &str, uri: &str, body: Value) -> HttpRequest<Body> {
        HttpRequest::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn authed(method: &str, uri: &str, token: &str, body: Option<Value>) -> HttpRequest<Body> {
        let builder = HttpRequest::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {token}"));
        match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    #[test]
    fn cli_maps_onto_overrides() {
        let cli = Cli::try_parse_from([
            "watchparty",
            "--database",
            "/tmp/party.db",
            "--port",
            "9000",
            "--host",
            "0.0.0.0",
            "--metadata",
            "none",
        ])
        .unwrap();
        let overrides = cli.overrides();
        assert_eq!(overrides.database_path, Some(PathBuf::from("/tmp/party.db")));
        assert_eq!(overrides.port, Some(9000));
        assert_eq!(overrides.host.as_deref(), Some("0.0.0.0"));
        assert_eq!(overrides.metadata_provider.as_deref(), Some("none"));
        assert!(overrides.www_root.is_none());
    }

    #[test]
    fn cli_rejects_bad_host() {
        assert!(Cli::try_parse_from(["watchparty", "--host", "not-an-ip"]).is_err());
    }

    #[test]
    fn session_token_prefers_bearer_then_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            "theme=dark; watchparty_session=from-cookie".parse().unwrap(),
        );
        assert_eq!(session_token(&headers).as_deref(), Some("from-cookie"));

        headers.insert(header::AUTHORIZATION, "Bearer from-header".parse().unwrap());
        assert_eq!(session_token(&headers).as_deref(), Some("from-header"));

        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Basic abc".parse().unwrap());
        headers.insert(header::COOKIE, "watchparty_session=".parse().unwrap());
        assert_eq!(session_token(&headers), None);
    }

    #[tokio::test]
    async fn create_stream_rejects_foreign_urls() {
        let ctx = BackendTestContext::new().await;
        let creator = ctx.user("creator@example.com").await.user;
        let err = create_stream(
            State(ctx.state.clone()),
            Viewer(creator.clone()),
            ApiJson(CreateStreamRequest {
                creator_id: creator.id.clone(),
                url: "https://vimeo.com/12345".into(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.message, "Invalid url");
    }

    #[tokio::test]
    async fn create_stream_stores_looked_up_details() {
        let ctx = BackendTestContext::new().await;
        let creator = ctx.user("creator@example.com").await.user;
        let viewer = ctx.user("viewer@example.com").await.user;

        let entry = ctx.queue(&creator, &viewer).await;
        assert_eq!(entry.upvotes, 0);
        assert!(!entry.have_upvoted);
        assert_eq!(entry.stream.extracted_id, "dQw4w9WgXcQ");
        assert_eq!(entry.stream.title, "Stub dQw4w9WgXcQ");
        assert!(entry.stream.small_img.ends_with("mqdefault.jpg"));
        assert!(entry.stream.big_img.ends_with("hqdefault.jpg"));
        assert_eq!(entry.stream.user_id, creator.id);
        assert_eq!(entry.stream.added_by, viewer.id);
        assert!(entry.stream.active);
    }

    #[tokio::test]
    async fn create_stream_unknown_creator_is_not_found() {
        let ctx = BackendTestContext::new().await;
        let viewer = ctx.user("viewer@example.com").await.user;
        let err = create_stream(
            State(ctx.state.clone()),
            Viewer(viewer),
            ApiJson(CreateStreamRequest {
                creator_id: "ghost".into(),
                url: VIDEO_URL.into(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn create_stream_lookup_failure_is_bad_request() {
        let ctx = BackendTestContext::with_lookup(StubLookup { fail: true }).await;
        let creator = ctx.user("creator@example.com").await.user;
        let err = create_stream(
            State(ctx.state.clone()),
            Viewer(creator.clone()),
            ApiJson(CreateStreamRequest {
                creator_id: creator.id.clone(),
                url: VIDEO_URL.into(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert!(
            ctx.state
                .store
                .list_queue(&creator.id, &creator.id)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn list_streams_requires_creator_id() {
        let ctx = BackendTestContext::new().await;
        let viewer = ctx.user("viewer@example.com").await.user;
        let err = list_streams(
            State(ctx.state.clone()),
            Viewer(viewer),
            ApiQuery(ListStreamsQuery {
                creator_id: Some("  ".into()),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.message, "Missing creatorId");
    }

    #[tokio::test]
    async fn voting_round_trip() {
        let ctx = BackendTestContext::new().await;
        let creator = ctx.user("creator@example.com").await.user;
        let viewer = ctx.user("viewer@example.com").await.user;
        let entry = ctx.queue(&creator, &viewer).await;
        let vote = || {
            ApiJson(VoteRequest {
                stream_id: entry.stream.id.clone(),
            })
        };

        upvote(State(ctx.state.clone()), Viewer(viewer.clone()), vote())
            .await
            .unwrap();
        let err = upvote(State(ctx.state.clone()), Viewer(viewer.clone()), vote())
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::CONFLICT);

        let Json(listing) = list_streams(
            State(ctx.state.clone()),
            Viewer(viewer.clone()),
            ApiQuery(ListStreamsQuery {
                creator_id: Some(creator.id.clone()),
            }),
        )
        .await
        .unwrap();
        assert_eq!(listing.streams[0].upvotes, 1);
        assert!(listing.streams[0].have_upvoted);
        assert!(listing.active_stream.is_none());

        downvote(State(ctx.state.clone()), Viewer(viewer.clone()), vote())
            .await
            .unwrap();
        let err = downvote(State(ctx.state.clone()), Viewer(viewer.clone()), vote())
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);

        let err = upvote(
            State(ctx.state.clone()),
            Viewer(viewer),
            ApiJson(VoteRequest {
                stream_id: "missing".into(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn play_next_promotes_top_stream_for_caller_only() {
        let ctx = BackendTestContext::new().await;
        let creator = ctx.user("creator@example.com").await.user;
        let viewer = ctx.user("viewer@example.com").await.user;
        ctx.queue(&creator, &viewer).await;
        let favourite = ctx.queue(&creator, &viewer).await;
        ctx.state
            .store
            .upvote(&viewer.id, &favourite.stream.id)
            .await
            .unwrap();

        // A viewer advancing touches only their own (empty) queue.
        let Json(next) = play_next(State(ctx.state.clone()), Viewer(viewer.clone()))
            .await
            .unwrap();
        assert!(next.stream.is_none());

        let Json(next) = play_next(State(ctx.state.clone()), Viewer(creator.clone()))
            .await
            .unwrap();
        assert_eq!(next.stream.unwrap().id, favourite.stream.id);

        let Json(listing) = list_streams(
            State(ctx.state.clone()),
            Viewer(viewer),
            ApiQuery(ListStreamsQuery {
                creator_id: Some(creator.id.clone()),
            }),
        )
        .await
        .unwrap();
        assert_eq!(listing.streams.len(), 1);
        assert_eq!(listing.active_stream.unwrap().id, favourite.stream.id);
    }

    #[tokio::test]
    async fn api_requires_authentication() {
        let ctx = BackendTestContext::new().await;
        let request = HttpRequest::builder()
            .uri("/api/streams?creatorId=abc")
            .body(Body::empty())
            .unwrap();
        let (status, _, body) = ctx.send(request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "Not authenticated");

        let (status, _, _) = ctx
            .send(authed("GET", "/api/auth/user", "bogus-token", None))
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn malformed_bodies_get_json_errors() {
        let ctx = BackendTestContext::new().await;
        let grant = ctx.user("viewer@example.com").await;

        let (status, _, body) = ctx
            .send(authed(
                "POST",
                "/api/streams",
                &grant.token,
                Some(json!({"url": "https://youtu.be/dQw4w9WgXcQ"})),
            ))
            .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(
            body["error"].as_str().unwrap().contains("creatorId"),
            "{body}"
        );

        let request = HttpRequest::builder()
            .method("POST")
            .uri("/api/auth/login")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let (status, _, body) = ctx.send(request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string(), "{body}");

        let request = HttpRequest::builder()
            .method("POST")
            .uri("/api/auth/register")
            .body(Body::from(r#"{"email":"a@b.co","password":"hunter2hunter2"}"#))
            .unwrap();
        let (status, _, body) = ctx.send(request).await;
        assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
        assert!(body["error"].is_string(), "{body}");

        let (status, _, body) = ctx
            .send(authed("GET", "/api/streams?creatorId=a&creatorId=b", &grant.token, None))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string(), "{body}");
    }

    #[tokio::test]
    async fn register_sets_cookie_that_authenticates() {
        let ctx = BackendTestContext::new().await;
        let (status, headers, body) = ctx
            .send(json_request(
                "POST",
                "/api/auth/register",
                json!({"email": "Alice@Example.com", "password": "hunter2hunter2"}),
            ))
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["user"]["email"], "alice@example.com");
        assert!(body["user"].get("passwordHash").is_none());

        let cookie = headers
            .get(header::SET_COOKIE)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(cookie.starts_with("watchparty_session="));
        assert!(cookie.contains("HttpOnly"));
        let pair = cookie.split(';').next().unwrap().to_string();

        let request = HttpRequest::builder()
            .uri("/api/auth/user")
            .header(header::COOKIE, pair)
            .body(Body::empty())
            .unwrap();
        let (status, _, user) = ctx.send(request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(user["id"], body["user"]["id"]);

        let (status, _, _) = ctx
            .send(json_request(
                "POST",
                "/api/auth/register",
                json!({"email": "alice@example.com", "password": "hunter2hunter2"}),
            ))
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn login_and_logout_flow() {
        let ctx = BackendTestContext::new().await;
        ctx.user("alice@example.com").await;

        let (status, _, body) = ctx
            .send(json_request(
                "POST",
                "/api/auth/login",
                json!({"email": "alice@example.com", "password": "wrong-password"}),
            ))
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "Invalid credentials");

        let (status, _, body) = ctx
            .send(json_request(
                "POST",
                "/api/auth/login",
                json!({"email": "alice@example.com", "password": "hunter2hunter2"}),
            ))
            .await;
        assert_eq!(status, StatusCode::OK);
        let token = body["token"].as_str().unwrap().to_string();

        let (status, headers, _) = ctx
            .send(authed("POST", "/api/auth/logout", &token, None))
            .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(
            headers
                .get(header::SET_COOKIE)
                .unwrap()
                .to_str()
                .unwrap()
                .contains("Max-Age=0")
        );

        let (status, _, _) = ctx
            .send(authed("GET", "/api/auth/user", &token, None))
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn full_party_over_http() {
        let ctx = BackendTestContext::new().await;
        let creator = ctx.user("creator@example.com").await;
        let viewer = ctx.user("viewer@example.com").await;

        let (status, _, stream) = ctx
            .send(authed(
                "POST",
                "/api/streams",
                &viewer.token,
                Some(json!({"creatorId": creator.user.id, "url": VIDEO_URL})),
            ))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stream["type"], "Youtube");
        assert_eq!(stream["extractedId"], "dQw4w9WgXcQ");
        assert_eq!(stream["upvotes"], 0);
        assert_eq!(stream["haveUpvoted"], false);

        let (status, _, body) = ctx
            .send(authed(
                "POST",
                "/api/streams/upvotes",
                &viewer.token,
                Some(json!({"streamId": stream["id"]})),
            ))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "Upvoted successfully");

        let uri = format!("/api/streams?creatorId={}", creator.user.id);
        let (status, _, listing) = ctx.send(authed("GET", &uri, &viewer.token, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listing["streams"][0]["upvotes"], 1);
        assert_eq!(listing["streams"][0]["haveUpvoted"], true);
        assert_eq!(listing["activeStream"], Value::Null);

        let (status, _, next) = ctx
            .send(authed("POST", "/api/streams/next", &creator.token, None))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(next["stream"]["id"], stream["id"]);

        let (_, _, listing) = ctx.send(authed("GET", &uri, &creator.token, None)).await;
        assert_eq!(listing["streams"].as_array().unwrap().len(), 0);
        assert_eq!(listing["activeStream"]["id"], stream["id"]);
        assert_eq!(listing["activeStream"]["active"], false);
    }

    #[tokio::test]
    async fn static_files_and_spa_fallback() {
        let ctx = BackendTestContext::new().await;
        let get = |uri: &str| {
            HttpRequest::builder()
                .uri(uri)
                .body(Body::empty())
                .unwrap()
        };

        let (status, headers, _) = ctx.send(get("/assets/app.js")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(
            headers
                .get(header::CONTENT_TYPE)
                .unwrap()
                .to_str()
                .unwrap()
                .contains("javascript")
        );

        for uri in ["/", "/creator/some-id", "/dashboard"] {
            let (status, _, body) = ctx.send(get(uri)).await;
            assert_eq!(status, StatusCode::OK, "{uri}");
            assert_eq!(body, Value::String("<html>party</html>".into()));
        }

        let (status, _, _) = ctx.send(get("/missing.css")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _, body) = ctx.send(get("/api/nothing-here")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "endpoint not found");
    }

    #[test]
    fn resolve_www_path_rejects_traversal() {
        let root = Path::new("/srv/www");
        assert!(resolve_www_path(root, "/../etc/passwd").is_err());
        assert_eq!(
            resolve_www_path(root, "/").unwrap(),
            PathBuf::from("/srv/www/index.html")
        );
        assert_eq!(
            resolve_www_path(root, "/app.js").unwrap(),
            PathBuf::from("/srv/www/app.js")
        );
        assert!(should_fallback_to_index("/creator/abc"));
        assert!(!should_fallback_to_index("/favicon.ico"));
    }

    #[tokio::test]
    async fn api_error_serializes_json() {
        let response = ApiError::not_found("missing").into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["error"], "missing");
    }

    #[test]
    fn store_errors_map_to_statuses() {
        let err: ApiError = StoreError::Conflict("dup".into()).into();
        assert_eq!(err.status, StatusCode::CONFLICT);
        let err: ApiError = StoreError::NotFound { resource: "stream" }.into();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        assert_eq!(err.message, "stream not found");
        let err: ApiError = StoreError::Other(anyhow::anyhow!("disk on fire")).into();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.message, "Internal server error");
    }
}
