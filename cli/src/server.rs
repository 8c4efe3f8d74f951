use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Context;
use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, Request, State},
    http::{HeaderValue, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use chrono::{Local, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::llm::{PlanError, PlanProvider};
use mealplan_core::backup::{BackupOptions, backup_file_name, decode_snapshot, encode_snapshot};
use mealplan_core::db::{Database, SnapshotError, is_constraint_violation};
use mealplan_core::models::{
    HistoryEntry, Meal, MealType, NewHistoryEntry, NewMeal, NewSideDish, SideDish, TableCounts,
    UpdateMeal, UpdateSideDish, validate_name, validate_new_meal, validate_new_side_dish,
    validate_update_meal,
};
use mealplan_core::planner::{PlanContext, PlanReport};
use mealplan_core::rules::PlanRules;

const BODY_LIMIT: usize = 10 * 1024 * 1024; // 10 MB

#[derive(Clone)]
struct AppState {
    db: Arc<Mutex<Database>>,
    planner: Arc<dyn PlanProvider>,
    api_key: Option<String>,
    rules: PlanRules,
}

impl AppState {
    fn db(&self) -> MutexGuard<'_, Database> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// --- Request / Response types ---

fn deserialize_some<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Deserialize::deserialize(deserializer).map(Some)
}

#[derive(Deserialize)]
#[allow(clippy::option_option)]
struct UpdateMealRequest {
    name: Option<String>,
    meal_types: Option<Vec<MealType>>,
    #[serde(default, deserialize_with = "deserialize_some")]
    notes: Option<Option<String>>,
    frequency_factor: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_some")]
    active_time: Option<Option<i64>>,
    #[serde(default, deserialize_with = "deserialize_some")]
    passive_time: Option<Option<i64>>,
    has_side_dish: Option<bool>,
}

#[derive(Deserialize)]
#[allow(clippy::option_option)]
struct UpdateSideDishRequest {
    name: Option<String>,
    #[serde(default, deserialize_with = "deserialize_some")]
    notes: Option<Option<String>>,
}

#[derive(Deserialize)]
struct CreateHistoryRequest {
    /// Defaults to today.
    date_eaten: Option<String>,
    meal: String,
    side_dish: Option<String>,
}

#[derive(Deserialize)]
struct HistoryQuery {
    since: Option<String>,
}

#[derive(Deserialize)]
struct PlanQuery {
    days: Option<usize>,
    recent_days: Option<i64>,
    /// Ban every meal in the history, not just recent ones.
    #[serde(default)]
    all_history: bool,
    /// Reject plans that break a rule with 422.
    #[serde(default)]
    strict: bool,
}

#[derive(Serialize)]
struct PlanResponse {
    model: String,
    #[serde(flatten)]
    report: PlanReport,
}

#[derive(Serialize)]
struct ImportResponse {
    restored: TableCounts,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

// --- Error handling ---

enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Unprocessable(String),
    Upstream(PlanError),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Conflict(msg) => (StatusCode::CONFLICT, msg),
            Self::Unprocessable(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            Self::Upstream(err) => {
                warn!(error = %err, "Plan provider failed");
                (err.status(), err.to_string())
            }
            Self::Internal(err) => {
                error!("Internal server error: {err:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

impl From<PlanError> for ApiError {
    fn from(err: PlanError) -> Self {
        Self::Upstream(err)
    }
}

fn bad_request(err: &anyhow::Error) -> ApiError {
    ApiError::BadRequest(format!("{err:#}"))
}

/// Duplicate names surface as 409; anything else is internal.
fn write_error(err: anyhow::Error, what: &str) -> ApiError {
    if is_constraint_violation(&err) {
        ApiError::Conflict(format!("{what} with that name already exists"))
    } else {
        ApiError::Internal(err)
    }
}

/// Bad content in an uploaded snapshot is the caller's problem; anything
/// else went wrong on our side.
fn restore_error(err: anyhow::Error) -> ApiError {
    if err.downcast_ref::<SnapshotError>().is_some() || is_constraint_violation(&err) {
        bad_request(&err)
    } else {
        ApiError::Internal(err)
    }
}

fn parse_date(value: &str) -> Result<NaiveDate, ApiError> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|_| ApiError::BadRequest(format!("Invalid date '{value}'. Use YYYY-MM-DD")))
}

// --- Middleware ---

async fn require_auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if let Some(ref expected_key) = state.api_key {
        let authorized = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .is_some_and(|token| token == expected_key);

        if !authorized {
            return (
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse {
                    error: "Invalid or missing API key".to_string(),
                }),
            )
                .into_response();
        }
    }
    next.run(request).await
}

async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "content-security-policy",
        HeaderValue::from_static("default-src 'none'"),
    );
    response
}

// --- Handlers: meals ---

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn list_meals(State(state): State<AppState>) -> Result<Json<Vec<Meal>>, ApiError> {
    let meals = state.db().list_meals().context("database error")?;
    Ok(Json(meals))
}

async fn create_meal(
    State(state): State<AppState>,
    Json(req): Json<NewMeal>,
) -> Result<(StatusCode, Json<Meal>), ApiError> {
    let meal = validate_new_meal(&req).map_err(|e| bad_request(&e))?;
    let db = state.db();
    if db.get_meal_by_name(&meal.name)?.is_some() {
        return Err(ApiError::Conflict(format!(
            "Meal '{}' already exists",
            meal.name
        )));
    }
    let meal = db.insert_meal(&meal).map_err(|e| write_error(e, "A meal"))?;
    Ok((StatusCode::CREATED, Json(meal)))
}

async fn get_meal(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Meal>, ApiError> {
    let meal = state
        .db()
        .get_meal_by_id(id)
        .map_err(|_| ApiError::NotFound(format!("Meal {id} not found")))?;
    Ok(Json(meal))
}

async fn update_meal(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateMealRequest>,
) -> Result<Json<Meal>, ApiError> {
    let update = validate_update_meal(&UpdateMeal {
        name: req.name,
        meal_types: req.meal_types,
        notes: req.notes,
        frequency_factor: req.frequency_factor,
        active_time: req.active_time,
        passive_time: req.passive_time,
        has_side_dish: req.has_side_dish,
    })
    .map_err(|e| bad_request(&e))?;

    let db = state.db();
    db.get_meal_by_id(id)
        .map_err(|_| ApiError::NotFound(format!("Meal {id} not found")))?;
    let meal = db
        .update_meal(id, &update)
        .map_err(|e| write_error(e, "A meal"))?;
    Ok(Json(meal))
}

async fn delete_meal(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    if state.db().delete_meal(id).context("database error")? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("Meal {id} not found")))
    }
}

// --- Handlers: side dishes ---

async fn list_side_dishes(State(state): State<AppState>) -> Result<Json<Vec<SideDish>>, ApiError> {
    let side_dishes = state.db().list_side_dishes().context("database error")?;
    Ok(Json(side_dishes))
}

async fn create_side_dish(
    State(state): State<AppState>,
    Json(req): Json<NewSideDish>,
) -> Result<(StatusCode, Json<SideDish>), ApiError> {
    let side_dish = validate_new_side_dish(&req).map_err(|e| bad_request(&e))?;
    let db = state.db();
    if db.get_side_dish_by_name(&side_dish.name)?.is_some() {
        return Err(ApiError::Conflict(format!(
            "Side dish '{}' already exists",
            side_dish.name
        )));
    }
    let side_dish = db
        .insert_side_dish(&side_dish)
        .map_err(|e| write_error(e, "A side dish"))?;
    Ok((StatusCode::CREATED, Json(side_dish)))
}

async fn get_side_dish(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<SideDish>, ApiError> {
    let side_dish = state
        .db()
        .get_side_dish_by_id(id)
        .map_err(|_| ApiError::NotFound(format!("Side dish {id} not found")))?;
    Ok(Json(side_dish))
}

async fn update_side_dish(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateSideDishRequest>,
) -> Result<Json<SideDish>, ApiError> {
    let name = req
        .name
        .as_deref()
        .map(|n| validate_name(n, "Side dish"))
        .transpose()
        .map_err(|e| bad_request(&e))?;

    let db = state.db();
    db.get_side_dish_by_id(id)
        .map_err(|_| ApiError::NotFound(format!("Side dish {id} not found")))?;
    let side_dish = db
        .update_side_dish(
            id,
            &UpdateSideDish {
                name,
                notes: req.notes,
            },
        )
        .map_err(|e| write_error(e, "A side dish"))?;
    Ok(Json(side_dish))
}

async fn delete_side_dish(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    if state.db().delete_side_dish(id).context("database error")? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("Side dish {id} not found")))
    }
}

// --- Handlers: history ---

async fn list_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<HistoryEntry>>, ApiError> {
    let since = query.since.as_deref().map(parse_date).transpose()?;
    let history = state.db().list_history(since).context("database error")?;
    Ok(Json(history))
}

async fn create_history(
    State(state): State<AppState>,
    Json(req): Json<CreateHistoryRequest>,
) -> Result<(StatusCode, Json<HistoryEntry>), ApiError> {
    let date_eaten = match req.date_eaten.as_deref() {
        Some(d) => parse_date(d)?,
        None => Local::now().date_naive(),
    };
    let meal = req.meal.trim().to_string();
    let side_dish = req
        .side_dish
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let db = state.db();
    if db.get_meal_by_name(&meal)?.is_none() {
        return Err(ApiError::NotFound(format!("Meal '{meal}' not found")));
    }
    if let Some(name) = side_dish.as_deref() {
        if db.get_side_dish_by_name(name)?.is_none() {
            return Err(ApiError::NotFound(format!("Side dish '{name}' not found")));
        }
    }
    let entry = db
        .add_history(&NewHistoryEntry {
            date_eaten,
            meal,
            side_dish,
        })
        .context("failed to insert history entry")?;
    Ok((StatusCode::CREATED, Json(entry)))
}

async fn delete_history(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    if state.db().delete_history(id).context("database error")? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("History entry {id} not found")))
    }
}

// --- Handlers: planning ---

fn plan_context(state: &AppState, query: &PlanQuery) -> Result<PlanContext, ApiError> {
    let mut rules = state.rules.clone();
    if let Some(days) = query.days {
        rules.days = days;
    }
    if let Some(recent) = query.recent_days {
        rules.recent_days = Some(recent);
    }
    if query.all_history {
        rules.recent_days = None;
    }
    rules.validate().map_err(|e| bad_request(&e))?;
    let ctx = PlanContext::load(&state.db(), Local::now().date_naive(), rules)?;
    Ok(ctx)
}

async fn get_plan(
    State(state): State<AppState>,
    Query(query): Query<PlanQuery>,
) -> Result<Json<PlanResponse>, ApiError> {
    let ctx = plan_context(&state, &query)?;

    let shortfalls = ctx.shortfalls();
    if !shortfalls.is_empty() {
        let reasons: Vec<String> = shortfalls.iter().map(ToString::to_string).collect();
        if query.strict {
            return Err(ApiError::Unprocessable(format!(
                "The meal list cannot satisfy the plan rules: {}",
                reasons.join("; ")
            )));
        }
        warn!(reasons = %reasons.join("; "), "Plan rules cannot all be met");
    }

    let plan = state.planner.generate(&ctx.prompt()).await?;
    let report = ctx.review(plan);
    if query.strict && !report.valid {
        let reasons: Vec<String> = report.violations.iter().map(ToString::to_string).collect();
        return Err(ApiError::Unprocessable(format!(
            "Generated plan breaks the rules: {}",
            reasons.join("; ")
        )));
    }

    Ok(Json(PlanResponse {
        model: state.planner.model().to_string(),
        report,
    }))
}

async fn get_plan_prompt(
    State(state): State<AppState>,
    Query(query): Query<PlanQuery>,
) -> Result<Response, ApiError> {
    let ctx = plan_context(&state, &query)?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        ctx.prompt(),
    )
        .into_response())
}

// --- Handlers: backup ---

async fn export_backup(State(state): State<AppState>) -> Result<Response, ApiError> {
    let snapshot = state.db().export_snapshot()?;
    let body = encode_snapshot(
        &snapshot,
        BackupOptions {
            minimize: true,
            gzip: true,
        },
    )?;
    let disposition = format!(
        "attachment; filename=\"{}\"",
        backup_file_name(Utc::now(), true)
    );
    Ok((
        [
            (header::CONTENT_TYPE, "application/gzip".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        body,
    )
        .into_response())
}

async fn import_backup(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<ImportResponse>, ApiError> {
    let snapshot = decode_snapshot(&body).map_err(|e| bad_request(&e))?;
    let restored = state
        .db()
        .restore_snapshot(&snapshot)
        .map_err(restore_error)?;
    info!(
        meals = restored.meals,
        side_dishes = restored.side_dishes,
        history = restored.meal_history,
        "Imported backup"
    );
    Ok(Json(ImportResponse { restored }))
}

// --- Router ---

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/meals", get(list_meals).post(create_meal))
        .route(
            "/api/meals/{id}",
            get(get_meal).put(update_meal).delete(delete_meal),
        )
        .route(
            "/api/side-dishes",
            get(list_side_dishes).post(create_side_dish),
        )
        .route(
            "/api/side-dishes/{id}",
            get(get_side_dish)
                .put(update_side_dish)
                .delete(delete_side_dish),
        )
        .route("/api/history", get(list_history).post(create_history))
        .route("/api/history/{id}", delete(delete_history))
        .route("/api/plan", get(get_plan))
        .route("/api/plan/prompt", get(get_plan_prompt))
        .route("/api/backup/export", get(export_backup))
        .route("/api/backup/import", post(import_backup))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .route("/api/health", get(health))
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT))
        .layer(middleware::from_fn(security_headers))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// --- Server startup ---

pub async fn start_server(
    db: Database,
    planner: Arc<dyn PlanProvider>,
    rules: PlanRules,
    port: u16,
    bind: &str,
    api_key: Option<String>,
    new_api_key: bool,
) -> anyhow::Result<()> {
    let state = AppState {
        db: Arc::new(Mutex::new(db)),
        planner,
        api_key: api_key.clone(),
        rules,
    };

    let app = build_router(state);

    if let Some(ref key) = api_key {
        if new_api_key {
            eprintln!("Generated new API key: {key}");
            eprintln!("Include in requests: Authorization: Bearer {key}");
        } else if key.is_ascii() && key.len() >= 8 {
            eprintln!(
                "API key: {}...{} (see api_key file in data directory)",
                &key[..4],
                &key[key.len() - 4..],
            );
        } else {
            eprintln!("API key loaded from api_key file in data directory");
        }
    } else {
        warn!("Authentication disabled (--no-auth). API is open to anyone.");
    }

    if bind != "127.0.0.1" && bind != "localhost" && api_key.is_none() {
        warn!(
            "Listening on {bind} with no authentication. Any device on your network can access this API."
        );
    }

    let listener = tokio::net::TcpListener::bind(format!("{bind}:{port}"))
        .await
        .with_context(|| format!("Failed to bind {bind}:{port}"))?;
    info!("Listening on http://{bind}:{port}");
    axum::serve(listener, app).await?;

    Ok(())
}
