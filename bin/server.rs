// BioTeller - REST API Server
// Binds the ledger engine's operations for an HTTP collaborator

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;
use uuid::Uuid;

use bioteller::{
    AccountLedger, EngineConfig, EngineError, LedgerEntry, Matcher, OperationKind,
    SessionAuthenticator, Storage, TemplateStore, TransactionProcessor,
};

/// Shared application state
#[derive(Clone)]
struct AppState {
    templates: Arc<TemplateStore>,
    ledger: Arc<AccountLedger>,
    authenticator: Arc<SessionAuthenticator>,
    processor: Arc<TransactionProcessor>,
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    fn err(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
        }
    }
}

/// Every engine error maps to one stable status code
fn status_for(error: &EngineError) -> StatusCode {
    match error {
        EngineError::NotFound(_) => StatusCode::NOT_FOUND,
        EngineError::AuthFailed | EngineError::Expired | EngineError::Invalid => {
            StatusCode::UNAUTHORIZED
        }
        EngineError::InsufficientFunds { .. } => StatusCode::CONFLICT,
        EngineError::InvalidAmount(_)
        | EngineError::TemplateMismatch { .. }
        | EngineError::InvalidTemplate(_) => StatusCode::BAD_REQUEST,
        EngineError::LimitExceeded { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        EngineError::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
    }
}

fn reply<T: Serialize>(result: Result<T, EngineError>) -> axum::response::Response {
    match result {
        Ok(data) => (StatusCode::OK, Json(ApiResponse::ok(data))).into_response(),
        Err(e) => (
            status_for(&e),
            Json(ApiResponse::<T>::err(e.to_string())),
        )
            .into_response(),
    }
}

fn parse_token(raw: &str) -> Result<Uuid, EngineError> {
    raw.parse::<Uuid>().map_err(|_| EngineError::Invalid)
}

// ============================================================================
// Request / Response types
// ============================================================================

#[derive(Deserialize)]
struct AuthenticateRequest {
    template: Vec<f32>,
}

#[derive(Serialize)]
struct AuthenticateResponse {
    session_token: Uuid,
    expires_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct TransactRequest {
    session_token: String,
    kind: OperationKind,
    amount: Decimal,
}

#[derive(Deserialize)]
struct EnrollRequest {
    account_id: String,
    display_name: String,
    initial_balance: Decimal,
    template: Vec<f32>,
}

#[derive(Serialize)]
struct EnrollResponse {
    account_id: String,
    fingerprint: String,
}

#[derive(Deserialize)]
struct LogoutRequest {
    session_token: String,
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok("OK"))
}

/// POST /api/authenticate - Template in, session out
async fn authenticate(
    State(state): State<AppState>,
    Json(request): Json<AuthenticateRequest>,
) -> impl IntoResponse {
    let result = state
        .authenticator
        .authenticate(&request.template)
        .map(|session| AuthenticateResponse {
            session_token: session.token,
            expires_at: session.expires_at,
        });
    reply(result)
}

/// GET /api/balance/:token - Balance for an authenticated session
async fn balance(State(state): State<AppState>, Path(token): Path<String>) -> impl IntoResponse {
    let result = parse_token(&token).and_then(|token| state.processor.balance(&token));
    reply(result)
}

/// POST /api/transact - Deposit, withdraw or inquiry
async fn transact(
    State(state): State<AppState>,
    Json(request): Json<TransactRequest>,
) -> impl IntoResponse {
    let result = parse_token(&request.session_token)
        .and_then(|token| state.processor.execute(&token, request.kind, request.amount));
    reply(result)
}

/// POST /api/logout - Destroy a session
async fn logout(
    State(state): State<AppState>,
    Json(request): Json<LogoutRequest>,
) -> impl IntoResponse {
    let result = parse_token(&request.session_token)
        .and_then(|token| state.authenticator.logout(&token).map(|_| "logged out"));
    reply(result)
}

/// POST /api/enroll - Admin enrollment (not customer-facing; deploy behind
/// the admin boundary, not the public listener)
async fn enroll(
    State(state): State<AppState>,
    Json(request): Json<EnrollRequest>,
) -> impl IntoResponse {
    let result = state
        .ledger
        .open_account(
            &request.account_id,
            &request.display_name,
            request.initial_balance,
        )
        .and_then(|account| state.templates.enroll(&account.id, request.template))
        .map(|template| EnrollResponse {
            account_id: request.account_id.clone(),
            fingerprint: template.fingerprint,
        });
    reply(result)
}

/// GET /api/accounts/:id/entries - Admin ledger audit listing
async fn account_entries(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
) -> impl IntoResponse {
    let result: Result<Vec<LedgerEntry>, EngineError> = state
        .ledger
        .account(&account_id)
        .and_then(|account| state.ledger.entries(&account.id));
    reply(result)
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    println!("🏦 BioTeller - API Server");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━");

    let db_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "bioteller.db".to_string());
    let config_path = std::path::Path::new("bioteller.json");
    let config = if config_path.exists() {
        EngineConfig::load(config_path).expect("Failed to load config")
    } else {
        EngineConfig::default()
    };

    let storage = Storage::open(std::path::Path::new(&db_path)).expect("Failed to open database");
    println!("✓ Database opened: {}", db_path);

    let templates = Arc::new(TemplateStore::new(storage.clone(), config.template_len));
    let matcher = Matcher::new(
        Arc::clone(&templates),
        config.match_threshold,
        config.ambiguity_margin,
    );
    let authenticator = Arc::new(SessionAuthenticator::new(matcher, &config));
    let ledger = Arc::new(AccountLedger::new(storage, &config));
    let processor = Arc::new(TransactionProcessor::new(
        Arc::clone(&authenticator),
        Arc::clone(&ledger),
    ));

    let state = AppState {
        templates,
        ledger,
        authenticator,
        processor,
    };

    // Build API routes
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/authenticate", post(authenticate))
        .route("/balance/:token", get(balance))
        .route("/transact", post(transact))
        .route("/logout", post(logout))
        .route("/enroll", post(enroll))
        .route("/accounts/:id/entries", get(account_entries))
        .with_state(state);

    let app = Router::new()
        .nest("/api", api_routes)
        .layer(CorsLayer::permissive());

    let addr = "0.0.0.0:3000";
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");

    info!(addr, "server listening");
    println!("\n🚀 Server running on http://localhost:3000");
    println!("   Try: curl http://localhost:3000/api/health");
    println!("\n   Press Ctrl+C to stop\n");

    axum::serve(listener, app)
        .await
        .expect("Failed to start server");
}
