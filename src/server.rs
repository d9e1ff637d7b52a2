//!
//! classgate HTTP sidecar
//! ----------------------
//! Axum JSON API over the session/role core so the gate can be driven and
//! inspected without a browser.
//!
//! Responsibilities:
//! - Sign-up, sign-in (optionally through a role portal) and sign-out.
//! - Read-only views of the session snapshot, the gate view and route decisions.
//! - Notebook create/delete behind the mutation guard.
//! - Demo account seeding for local runs.

use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures_util::FutureExt; // for catch_unwind on async blocks
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::config::GateConfig;
use crate::error::{GateError, GateResult};
use crate::identity::{
    route_decision, AuthHandshake, Credentials, GateCoordinator, GateVariant, Identity, IdentityProvider,
    ProfileStore, Role, Route, RouteDecision, RoleResolver, SessionStore, SignUpFields,
};
use crate::memory::{MemoryIdentityProvider, MemoryProfileStore, MemoryResourceStore};
use crate::resources::{NotebookDraft, NotebookService, ResourceStore};

/// Shared server state injected into all handlers.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<GateCoordinator>,
    pub handshake: Arc<AuthHandshake>,
    pub notebooks: Arc<NotebookService>,
}

impl AppState {
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        profiles: Arc<dyn ProfileStore>,
        resources: Arc<dyn ResourceStore>,
        config: &GateConfig,
    ) -> Self {
        let resolver = Arc::new(RoleResolver::new(profiles));
        let session = SessionStore::with_confirm_timeout(provider.clone(), resolver.clone(), config.confirm_timeout);
        let handshake = Arc::new(AuthHandshake::new(provider, session.clone(), resolver.clone()));
        let coordinator = GateCoordinator::new(session, resolver);
        Self { coordinator, handshake, notebooks: Arc::new(NotebookService::new(resources)) }
    }

    /// State wired to the in-memory collaborators. The provider is returned for seeding.
    pub fn in_memory(config: &GateConfig) -> (Self, Arc<MemoryIdentityProvider>) {
        let profiles = Arc::new(MemoryProfileStore::default());
        let provider = Arc::new(MemoryIdentityProvider::new(profiles.clone(), config.min_password_len));
        let resources = Arc::new(MemoryResourceStore::default());
        (Self::new(provider.clone(), profiles, resources, config), provider)
    }

    fn current_identity(&self) -> GateResult<Identity> {
        self.coordinator.session().snapshot().identity().cloned().ok_or(GateError::Unauthenticated)
    }
}

impl IntoResponse for GateError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.body())).into_response()
    }
}

/// Demo accounts for local runs; the password is the same for all three.
pub const DEMO_PASSWORD: &str = "classgate";

pub fn seed_demo_accounts(provider: &MemoryIdentityProvider) -> anyhow::Result<()> {
    let accounts = [
        ("student@classgate.test", "Demo Student", Role::Student, Some("S-0001")),
        ("teacher@classgate.test", "Demo Teacher", Role::Teacher, None),
        ("admin@classgate.test", "Demo Admin", Role::Admin, None),
    ];
    for (email, name, role, student_id) in accounts {
        provider
            .seed_account(email, DEMO_PASSWORD, name, role, student_id)
            .with_context(|| format!("seeding demo account {}", email))?;
        info!(target: "startup", "seeded demo {} account {}", role, email);
    }
    Ok(())
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(|| async { "classgate ok" }))
        .route("/session", get(get_session))
        .route("/gate", get(get_gate))
        .route("/route", get(get_route))
        .route("/auth/sign-up", post(sign_up))
        .route("/auth/sign-in", post(sign_in))
        .route("/auth/sign-out", post(sign_out))
        .route("/notebooks", get(list_notebooks).post(create_notebook))
        .route("/notebooks/{id}", delete(delete_notebook))
        .with_state(state)
}

/// Start the coordinator and serve on an already bound listener.
pub async fn serve(listener: TcpListener, state: AppState) -> anyhow::Result<()> {
    state.coordinator.start();
    let addr = listener.local_addr().context("listener address")?;
    info!(target: "classgate::http", "serving on {}", addr);
    let coordinator = state.coordinator.clone();
    let result = axum::serve(listener, router(state)).await;
    coordinator.shutdown();
    result.context("http server")
}

/// Start the classgate dev server with in-memory collaborators.
pub async fn run(config: GateConfig) -> anyhow::Result<()> {
    let (state, provider) = AppState::in_memory(&config);
    if config.seed_demo {
        seed_demo_accounts(&provider)?;
    }
    let addr = SocketAddr::new(config.bind, config.http_port);
    let listener = TcpListener::bind(addr).await.with_context(|| format!("binding {}", addr))?;
    serve(listener, state).await
}

/// Run a handler body, converting a panic into a 500 instead of dropping the connection.
async fn contained<T, F>(what: &'static str, fut: F) -> Response
where
    T: Serialize,
    F: std::future::Future<Output = GateResult<T>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(value)) => (StatusCode::OK, Json(value)).into_response(),
        Ok(Err(e)) => {
            info!(target: "classgate::http", "{} -> {} {}", what, e.http_status(), e.code_str());
            e.into_response()
        }
        Err(_) => {
            error!(target: "classgate::http", "{} panicked", what);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"code": "internal", "message": "internal server error"})),
            )
                .into_response()
        }
    }
}

async fn get_session(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.coordinator.session().snapshot();
    Json(json!({
        "status": snapshot.status(),
        "session": snapshot.session,
        "generation": snapshot.generation,
    }))
}

async fn get_gate(State(state): State<AppState>) -> impl IntoResponse { Json(state.coordinator.settled().await) }

#[derive(Debug, Deserialize)]
struct RouteQuery {
    #[serde(default)]
    path: Option<String>,
}

#[derive(Debug, Serialize)]
struct RouteAnswer {
    path: String,
    variant: GateVariant,
    decision: RouteDecision,
}

async fn get_route(State(state): State<AppState>, Query(q): Query<RouteQuery>) -> impl IntoResponse {
    let path = q.path.unwrap_or_else(|| "/".to_string());
    let view = state.coordinator.settled().await;
    let decision = route_decision(&Route::parse(&path), view.variant);
    Json(RouteAnswer { path, variant: view.variant, decision })
}

#[derive(Debug, Deserialize)]
struct SignUpPayload {
    #[serde(flatten)]
    fields: SignUpFields,
    role: Role,
}

async fn sign_up(State(state): State<AppState>, Json(payload): Json<SignUpPayload>) -> Response {
    contained("sign_up", state.handshake.sign_up(payload.fields, payload.role)).await
}

#[derive(Debug, Deserialize)]
struct SignInPayload {
    #[serde(flatten)]
    credentials: Credentials,
    #[serde(default)]
    expected_role: Option<Role>,
}

async fn sign_in(State(state): State<AppState>, Json(payload): Json<SignInPayload>) -> Response {
    contained("sign_in", state.handshake.sign_in(payload.credentials, payload.expected_role)).await
}

async fn sign_out(State(state): State<AppState>) -> Response {
    contained("sign_out", async {
        state.coordinator.session().sign_out().await?;
        Ok(json!({"status": "ok"}))
    })
    .await
}

async fn list_notebooks(State(state): State<AppState>) -> Response {
    contained("list_notebooks", async {
        let identity = state.current_identity()?;
        state.notebooks.list(&identity.id).await
    })
    .await
}

async fn create_notebook(State(state): State<AppState>, Json(draft): Json<NotebookDraft>) -> Response {
    contained("create_notebook", async {
        let identity = state.current_identity()?;
        state.notebooks.create(&identity.id, draft).await
    })
    .await
}

async fn delete_notebook(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    contained("delete_notebook", async {
        state.current_identity()?;
        state.notebooks.delete(&id).await?;
        Ok(json!({"status": "ok", "id": id}))
    })
    .await
}
