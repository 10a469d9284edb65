pub mod audit;
pub mod auth;
pub mod balancer;
pub mod config;
pub mod db;
pub mod detector;
pub mod error;
pub mod gate;
pub mod handlers;
pub mod health;
pub mod history;
pub mod logs;
pub mod models;
pub mod proxy;
pub mod registry;
pub mod secrets;
pub mod state;
pub mod system_monitor;

use axum::extract::State;
use axum::http::HeaderValue;
use axum::middleware;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use auth::Requirement;
use models::Permission;
use state::AppState;

/// Middleware that assigns a UUID correlation ID to every request.
/// Recorded on the tracing span and returned as `X-Request-Id`.
pub async fn request_id_middleware(
    request: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let request_id = uuid::Uuid::new_v4().to_string();
    tracing::Span::current().record("request_id", tracing::field::display(&request_id));

    let mut response = next.run(request).await;
    if let Ok(val) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", val);
    }
    response
}

// ── OpenAPI documentation (admin surface) ───────────────────────────────────

#[derive(OpenApi)]
#[openapi(
    info(
        title = "llmlb API",
        description = "LLM load balancer — administrative API",
        license(name = "MIT")
    ),
    paths(handlers::health, handlers::readiness),
    components(schemas(
        models::Dialect,
        models::ApiFamily,
        models::EndpointStatus,
        models::Endpoint,
        models::EndpointModel,
        models::Role,
        models::Permission,
        models::CreateEndpointRequest,
        models::UpdateEndpointRequest,
        models::LoginRequest,
        models::ChangePasswordRequest,
        models::RegisterRequest,
        models::CreateUserRequest,
        models::UpdateUserRequest,
        models::CreateApiKeyRequest,
        models::UpdateApiKeyRequest,
        models::CreateInvitationRequest,
        models::RegisterModelRequest,
        models::HealthResponse,
    )),
    tags(
        (name = "health", description = "Health & readiness"),
        (name = "endpoints", description = "Upstream endpoint management"),
        (name = "auth", description = "Sessions & registration"),
    )
)]
pub struct ApiDoc;

/// Build the application router. Extracted from `main()` so integration
/// tests can construct the app without binding a port.
pub fn create_router(state: AppState) -> Router {
    let requirement =
        |req: Requirement| middleware::from_fn_with_state((state.clone(), req), auth::require);

    // ── Public routes (no auth) ─────────────────────────────────────
    let public = Router::new()
        .route("/", get(index))
        .route("/api/health", get(handlers::health))
        .route("/api/health/ready", get(handlers::readiness))
        .route("/api/auth/login", post(handlers::auth_api::login))
        .route("/api/auth/logout", post(handlers::auth_api::logout))
        .route("/api/auth/register", post(handlers::auth_api::register))
        // Retired registration path; the canonical one lives under /api.
        .route("/v0/models/register", post(handlers::models_api::register_v0_gone));

    // ── OpenAI-compatible inference surface ─────────────────────────
    let inference = Router::new()
        .route("/v1/chat/completions", post(handlers::openai::chat_completions))
        .route("/v1/completions", post(handlers::openai::completions))
        .route("/v1/embeddings", post(handlers::openai::embeddings))
        .route("/v1/responses", post(handlers::openai::responses))
        .route("/v1/audio/speech", post(handlers::openai::audio_speech))
        .route(
            "/v1/audio/transcriptions",
            post(handlers::openai::audio_transcriptions),
        )
        .route(
            "/v1/images/generations",
            post(handlers::openai::image_generations),
        )
        .route("/v1/images/edits", post(handlers::openai::image_edits))
        .route(
            "/v1/images/variations",
            post(handlers::openai::image_variations),
        )
        .route_layer(requirement(Requirement::Permission(Permission::OpenaiInference)));

    let model_listing = Router::new()
        .route("/v1/models", get(handlers::openai::list_models))
        .route("/v1/models/{id}", get(handlers::openai::get_model))
        .route_layer(requirement(Requirement::Permission(Permission::OpenaiModelsRead)));

    // ── Session-only account routes ─────────────────────────────────
    let account = Router::new()
        .route("/api/auth/me", get(handlers::auth_api::me))
        .route("/api/auth/change-password", put(handlers::auth_api::change_password))
        .route_layer(requirement(Requirement::JwtOnly));

    // ── Endpoint management ─────────────────────────────────────────
    // GET routes need endpoints.read, writes need endpoints.manage.
    let endpoints_api = Router::new()
        .route(
            "/api/endpoints",
            get(handlers::endpoints::list).post(handlers::endpoints::create),
        )
        .route(
            "/api/endpoints/{id}",
            get(handlers::endpoints::get)
                .put(handlers::endpoints::update)
                .delete(handlers::endpoints::delete),
        )
        .route("/api/endpoints/{id}/test", post(handlers::endpoints::test))
        .route("/api/endpoints/{id}/sync", post(handlers::endpoints::sync))
        .route_layer(requirement(Requirement::ReadWrite {
            read: Permission::EndpointsRead,
            write: Permission::EndpointsManage,
        }));

    // ── Principals ──────────────────────────────────────────────────
    let users = Router::new()
        .route("/api/users", get(handlers::users::list).post(handlers::users::create))
        .route(
            "/api/users/{id}",
            put(handlers::users::update).delete(handlers::users::delete),
        )
        .route_layer(requirement(Requirement::Permission(Permission::UsersManage)));

    let api_keys = Router::new()
        .route(
            "/api/api-keys",
            get(handlers::api_keys::list).post(handlers::api_keys::create),
        )
        .route(
            "/api/api-keys/{id}",
            put(handlers::api_keys::update).delete(handlers::api_keys::delete),
        )
        .route_layer(requirement(Requirement::Permission(Permission::ApiKeysManage)));

    let invitations = Router::new()
        .route(
            "/api/invitations",
            get(handlers::invitations::list).post(handlers::invitations::create),
        )
        .route_layer(requirement(Requirement::Permission(Permission::InvitationsManage)));

    // ── Registered models ───────────────────────────────────────────
    let models_read = Router::new()
        .route("/api/models/registered", get(handlers::models_api::list_registered))
        .route_layer(requirement(Requirement::AnyOf(&[
            Permission::ModelsManage,
            Permission::RegistryRead,
        ])));

    let models_manage = Router::new()
        .route("/api/models/register", post(handlers::models_api::register))
        .route_layer(requirement(Requirement::Permission(Permission::ModelsManage)));

    // ── Telemetry ───────────────────────────────────────────────────
    let node_logs = Router::new()
        .route("/api/nodes/{id}/logs", get(handlers::system::node_logs))
        .route_layer(requirement(Requirement::Permission(Permission::LogsRead)));

    let metrics = Router::new()
        .route("/api/metrics", get(handlers::system::metrics))
        .route_layer(requirement(Requirement::Permission(Permission::MetricsRead)));

    // ── Dashboard & system (sessions only) ──────────────────────────
    let dashboard = Router::new()
        .route("/api/dashboard/overview", get(handlers::dashboard::overview))
        .route("/api/dashboard/stats", get(handlers::dashboard::stats))
        .route("/api/dashboard/nodes", get(handlers::dashboard::nodes))
        .route(
            "/api/dashboard/request-history",
            get(handlers::dashboard::request_history),
        )
        .route(
            "/api/dashboard/request-history/export",
            get(handlers::dashboard::export_history),
        )
        .route(
            "/api/dashboard/request-responses",
            get(handlers::dashboard::request_responses),
        )
        .route(
            "/api/dashboard/request-responses/{id}",
            get(handlers::dashboard::request_response),
        )
        .route("/api/dashboard/stats/tokens", get(handlers::dashboard::tokens_total))
        .route(
            "/api/dashboard/stats/tokens/daily",
            get(handlers::dashboard::tokens_daily),
        )
        .route(
            "/api/dashboard/stats/tokens/monthly",
            get(handlers::dashboard::tokens_monthly),
        )
        .route("/api/system", get(handlers::system::system_info))
        .route("/api/system/update/check", post(handlers::system::update_check))
        .route("/api/system/update/apply", post(handlers::system::update_apply))
        .route(
            "/api/system/update/apply/force",
            post(handlers::system::update_apply_force),
        )
        .route(
            "/api/system/update/rollback",
            post(handlers::system::update_rollback),
        )
        .route(
            "/api/system/update/schedule",
            get(handlers::system::schedule_get)
                .post(handlers::system::schedule_set)
                .delete(handlers::system::schedule_delete),
        )
        .route("/api/system/audit", get(handlers::system::audit_list))
        .route("/api/system/audit/verify", get(handlers::system::audit_verify))
        .route_layer(requirement(Requirement::JwtOnly));

    public
        .merge(inference)
        .merge(model_listing)
        .merge(account)
        .merge(endpoints_api)
        .merge(users)
        .merge(api_keys)
        .merge(invitations)
        .merge(models_read)
        .merge(models_manage)
        .merge(node_logs)
        .merge(metrics)
        .merge(dashboard)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

async fn index(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "app": "llmlb",
        "version": env!("CARGO_PKG_VERSION"),
        "openai_surface": "/v1",
        "admin_surface": "/api",
        "docs": "/swagger-ui",
        "accepting": state.gate.is_accepting(),
    }))
}

#[allow(dead_code)]
async fn _stub(State(_s): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({}))
}

#[allow(dead_code)]
fn _isolated_repro(state: AppState) -> Router {
    let requirement =
        |req: Requirement| middleware::from_fn_with_state((state.clone(), req), auth::require);
    Router::new()
        .route("/x", get(_stub))
        .route_layer(requirement(Requirement::JwtOnly))
        .with_state(state)
}
