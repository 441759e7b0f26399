use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ab_testing_api::{
    AbTestingApi, ApiError, Assignment, ExperimentList, RecordedEvent, StartRequest,
    StartResult, StopRequest, StopResult, API_CONTRACT_VERSION,
};
use ab_testing_core::{
    AbConfig, AssignmentMode, ConfigUpdate, NewExperiment, RecordEventRequest, StatsReport,
    Visitor, WinnerEvaluation,
};
use anyhow::Result;
use axum::body::Bytes;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");
const DATABASE_ERROR_MESSAGE: &str = "internal database error";

#[derive(Debug, Clone)]
struct ServiceState {
    api: AbTestingApi,
    operation_timeout: Duration,
    telemetry: Arc<ServiceTelemetry>,
}

#[derive(Debug, Clone, Serialize)]
struct ErrorBody {
    error: String,
    code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
struct ServiceFailure {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    api_contract_version: &'static str,
    assignment_mode: &'static str,
    timeout_ms: u64,
    telemetry: ServiceTelemetrySnapshot,
}

#[derive(Debug, Clone, Serialize)]
struct ReadinessResponse {
    status: &'static str,
    schema_version: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct StatsQuery {
    experiment_id: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ExperimentsQuery {
    status: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct WinnerQuery {
    experiment_id: i64,
}

#[derive(Debug, Default)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetry {
    requests_total: AtomicU64,
    requests_success_total: AtomicU64,
    requests_failure_total: AtomicU64,
    timeout_total: AtomicU64,
    invalid_json_total: AtomicU64,
    invalid_query_total: AtomicU64,
    validation_error_total: AtomicU64,
    not_found_total: AtomicU64,
    database_error_total: AtomicU64,
    internal_error_total: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetrySnapshot {
    requests_total: u64,
    requests_success_total: u64,
    requests_failure_total: u64,
    timeout_total: u64,
    invalid_json_total: u64,
    invalid_query_total: u64,
    validation_error_total: u64,
    not_found_total: u64,
    database_error_total: u64,
    internal_error_total: u64,
}

#[derive(Debug, Parser)]
#[command(name = "ab-testing-service")]
#[command(about = "HTTP service for A/B variant assignment, events and admin control")]
struct Args {
    #[arg(long, env = "ABX_DB", default_value = "./ab_testing.sqlite3")]
    db: PathBuf,
    #[arg(long, env = "ABX_BIND", default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    #[arg(long, env = "ABX_OPERATION_TIMEOUT_MS", default_value_t = 2500)]
    operation_timeout_ms: u64,
    #[arg(
        long,
        env = "ABX_ASSIGNMENT_MODE",
        default_value = "random",
        value_parser = parse_assignment_mode
    )]
    assignment_mode: AssignmentMode,
    /// Emit logs as JSON lines.
    #[arg(long, env = "ABX_LOG_JSON")]
    log_json: bool,
}

fn parse_assignment_mode(raw: &str) -> Result<AssignmentMode, String> {
    AssignmentMode::parse(raw)
        .ok_or_else(|| format!("invalid assignment mode '{raw}'; allowed: random, fingerprint"))
}

impl IntoResponse for ServiceFailure {
    fn into_response(self) -> Response {
        let payload = ErrorBody {
            error: self.message,
            code: self.code,
            details: self.details,
        };
        (self.status, Json(payload)).into_response()
    }
}

impl ServiceState {
    fn failure(
        status: StatusCode,
        code: &'static str,
        message: impl Into<String>,
        details: Option<serde_json::Value>,
    ) -> ServiceFailure {
        ServiceFailure {
            status,
            code,
            message: message.into(),
            details,
        }
    }

    fn invalid_json_with_telemetry(&self, rejection: &JsonRejection) -> ServiceFailure {
        self.telemetry.record_failure("invalid_json", false);
        Self::failure(
            StatusCode::BAD_REQUEST,
            "invalid_json",
            rejection.body_text(),
            Some(json!({ "rejection": rejection.to_string() })),
        )
    }

    fn invalid_query_with_telemetry(&self, rejection: &QueryRejection) -> ServiceFailure {
        self.telemetry.record_failure("invalid_query", false);
        Self::failure(
            StatusCode::BAD_REQUEST,
            "invalid_query",
            rejection.body_text(),
            None,
        )
    }

    /// Bodies on start/stop are optional; an empty body means "all".
    fn optional_json<T>(&self, body: &Bytes) -> Result<T, ServiceFailure>
    where
        T: DeserializeOwned + Default,
    {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(T::default());
        }
        serde_json::from_slice(body).map_err(|err| {
            self.telemetry.record_failure("invalid_json", false);
            Self::failure(
                StatusCode::BAD_REQUEST,
                "invalid_json",
                format!("failed to parse request body: {err}"),
                None,
            )
        })
    }

    fn classify_api_error(operation_label: &'static str, err: &ApiError) -> ServiceFailure {
        match err {
            ApiError::Validation(message) => Self::failure(
                StatusCode::BAD_REQUEST,
                "validation_error",
                message.clone(),
                None,
            ),
            ApiError::NotFound(message) => {
                Self::failure(StatusCode::NOT_FOUND, "not_found", message.clone(), None)
            }
            ApiError::Database(source) => {
                let detail = format!("{source:#}");
                tracing::error!(
                    operation = operation_label,
                    error = %detail,
                    "database operation failed"
                );
                Self::failure(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "database_error",
                    DATABASE_ERROR_MESSAGE,
                    None,
                )
            }
        }
    }

    async fn run_blocking<T, F>(
        &self,
        operation_label: &'static str,
        op: F,
    ) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce(AbTestingApi) -> Result<T, ApiError> + Send + 'static,
    {
        self.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
        let api = self.api.clone();
        let handle = tokio::task::spawn_blocking(move || op(api));
        let join_result =
            tokio::time::timeout(self.operation_timeout, handle)
                .await
                .map_err(|_| {
                    self.telemetry.record_failure("timeout", true);
                    tracing::warn!(
                        operation = operation_label,
                        timeout_ms = self.timeout_ms(),
                        "operation timed out"
                    );
                    Self::failure(
                        StatusCode::SERVICE_UNAVAILABLE,
                        "timeout",
                        format!(
                            "{operation_label} timed out after {} ms",
                            self.operation_timeout.as_millis()
                        ),
                        Some(json!({ "timeout_ms": self.timeout_ms() })),
                    )
                })?;

        let op_result = join_result.map_err(|err| {
            self.telemetry.record_failure("internal_error", false);
            tracing::error!(operation = operation_label, error = %err, "blocking task failed");
            Self::failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                format!("{operation_label} failed to complete"),
                None,
            )
        })?;

        match op_result {
            Ok(value) => {
                self.telemetry
                    .requests_success_total
                    .fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Err(err) => {
                let failure = Self::classify_api_error(operation_label, &err);
                self.telemetry.record_failure(failure.code, false);
                Err(failure)
            }
        }
    }

    fn timeout_ms(&self) -> u64 {
        u64::try_from(self.operation_timeout.as_millis()).unwrap_or(u64::MAX)
    }
}

impl ServiceTelemetry {
    fn record_failure(&self, code: &str, timeout: bool) {
        self.requests_failure_total.fetch_add(1, Ordering::Relaxed);
        if timeout {
            self.timeout_total.fetch_add(1, Ordering::Relaxed);
        }
        let counter = match code {
            "invalid_json" => &self.invalid_json_total,
            "invalid_query" => &self.invalid_query_total,
            "validation_error" => &self.validation_error_total,
            "not_found" => &self.not_found_total,
            "database_error" => &self.database_error_total,
            "internal_error" => &self.internal_error_total,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ServiceTelemetrySnapshot {
        ServiceTelemetrySnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_success_total: self.requests_success_total.load(Ordering::Relaxed),
            requests_failure_total: self.requests_failure_total.load(Ordering::Relaxed),
            timeout_total: self.timeout_total.load(Ordering::Relaxed),
            invalid_json_total: self.invalid_json_total.load(Ordering::Relaxed),
            invalid_query_total: self.invalid_query_total.load(Ordering::Relaxed),
            validation_error_total: self.validation_error_total.load(Ordering::Relaxed),
            not_found_total: self.not_found_total.load(Ordering::Relaxed),
            database_error_total: self.database_error_total.load(Ordering::Relaxed),
            internal_error_total: self.internal_error_total.load(Ordering::Relaxed),
        }
    }
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn visitor_from_headers(headers: &HeaderMap) -> Visitor {
    Visitor::from_headers(
        header_value(headers, "user-agent"),
        header_value(headers, "x-forwarded-for"),
        header_value(headers, "x-real-ip"),
    )
}

fn ab_routes() -> Router<ServiceState> {
    Router::new()
        .route("/config", get(config_show).put(config_update))
        .route("/variant", get(variant_assign))
        .route("/event", post(event_record))
        .route("/start", post(experiments_start))
        .route("/stop", post(experiments_stop))
        .route("/stats", get(stats_show))
        .route(
            "/experiments",
            get(experiments_list).post(experiment_create),
        )
        .route("/winner", get(winner_show).post(winner_apply))
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/openapi", get(openapi))
        .nest("/api/ab", ab_routes())
        .nest("/api/ab-test", ab_routes())
        .with_state(state)
}

fn init_tracing(log_json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
    tracing::info!("shutdown requested");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let api = AbTestingApi::new(args.db.clone()).with_assignment_mode(args.assignment_mode);
    let migrate_api = api.clone();
    let schema = tokio::task::spawn_blocking(move || migrate_api.migrate()).await??;
    tracing::info!(
        db = %args.db.display(),
        schema_version = schema.schema_version,
        experiments = schema.experiments,
        "database ready"
    );

    let state = ServiceState {
        api,
        operation_timeout: Duration::from_millis(args.operation_timeout_ms),
        telemetry: Arc::new(ServiceTelemetry::default()),
    };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(
        bind = %args.bind,
        assignment_mode = args.assignment_mode.as_str(),
        "listening"
    );
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        api_contract_version: API_CONTRACT_VERSION,
        assignment_mode: state.api.assignment_mode().as_str(),
        timeout_ms: state.timeout_ms(),
        telemetry: state.telemetry.snapshot(),
    })
}

async fn ready(
    State(state): State<ServiceState>,
) -> Result<Json<ReadinessResponse>, ServiceFailure> {
    match state
        .run_blocking("schema_status", |api| api.schema_status())
        .await
    {
        Ok(status) if status.schema_version >= 1 => Ok(Json(ReadinessResponse {
            status: "ready",
            schema_version: status.schema_version,
        })),
        Ok(status) => Err(ServiceState::failure(
            StatusCode::SERVICE_UNAVAILABLE,
            "not_ready",
            "database schema is not migrated",
            Some(json!({ "schema_version": status.schema_version })),
        )),
        Err(failure) => Err(ServiceState::failure(
            StatusCode::SERVICE_UNAVAILABLE,
            "not_ready",
            "database is unavailable",
            Some(json!({ "cause": failure.code })),
        )),
    }
}

async fn openapi() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "application/yaml; charset=utf-8")],
        OPENAPI_YAML,
    )
}

async fn config_show(State(state): State<ServiceState>) -> Result<Json<AbConfig>, ServiceFailure> {
    let config = state.run_blocking("config_show", |api| api.config()).await?;
    Ok(Json(config))
}

async fn config_update(
    State(state): State<ServiceState>,
    payload: Result<Json<ConfigUpdate>, JsonRejection>,
) -> Result<Json<AbConfig>, ServiceFailure> {
    let Json(update) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let config = state
        .run_blocking("config_update", move |api| api.update_config(&update))
        .await?;
    Ok(Json(config))
}

async fn variant_assign(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<Assignment>, ServiceFailure> {
    let visitor = visitor_from_headers(&headers);
    let assignment = state
        .run_blocking("assign", move |api| api.assign(&visitor))
        .await?;
    Ok(Json(assignment))
}

async fn event_record(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    payload: Result<Json<RecordEventRequest>, JsonRejection>,
) -> Result<Json<RecordedEvent>, ServiceFailure> {
    let Json(request) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let visitor = visitor_from_headers(&headers);
    let recorded = state
        .run_blocking("record_event", move |api| {
            api.record_event(&request, &visitor)
        })
        .await?;
    Ok(Json(recorded))
}

async fn experiments_start(
    State(state): State<ServiceState>,
    body: Bytes,
) -> Result<Json<StartResult>, ServiceFailure> {
    let request: StartRequest = state.optional_json(&body)?;
    let result = state
        .run_blocking("start", move |api| api.start(&request))
        .await?;
    Ok(Json(result))
}

async fn experiments_stop(
    State(state): State<ServiceState>,
    body: Bytes,
) -> Result<Json<StopResult>, ServiceFailure> {
    let request: StopRequest = state.optional_json(&body)?;
    let result = state
        .run_blocking("stop", move |api| api.stop(&request))
        .await?;
    Ok(Json(result))
}

async fn stats_show(
    State(state): State<ServiceState>,
    query: Result<Query<StatsQuery>, QueryRejection>,
) -> Result<Json<StatsReport>, ServiceFailure> {
    let Query(query) = query.map_err(|rejection| state.invalid_query_with_telemetry(&rejection))?;
    let report = state
        .run_blocking("stats", move |api| api.stats(query.experiment_id))
        .await?;
    Ok(Json(report))
}

async fn experiments_list(
    State(state): State<ServiceState>,
    query: Result<Query<ExperimentsQuery>, QueryRejection>,
) -> Result<Json<ExperimentList>, ServiceFailure> {
    let Query(query) = query.map_err(|rejection| state.invalid_query_with_telemetry(&rejection))?;
    let list = state
        .run_blocking("list_experiments", move |api| {
            api.list_experiments(query.status.as_deref())
        })
        .await?;
    Ok(Json(list))
}

async fn experiment_create(
    State(state): State<ServiceState>,
    payload: Result<Json<NewExperiment>, JsonRejection>,
) -> Result<Json<ab_testing_api::CreatedExperiment>, ServiceFailure> {
    let Json(input) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let created = state
        .run_blocking("create_experiment", move |api| api.create_experiment(&input))
        .await?;
    Ok(Json(created))
}

async fn winner_show(
    State(state): State<ServiceState>,
    query: Result<Query<WinnerQuery>, QueryRejection>,
) -> Result<Json<WinnerEvaluation>, ServiceFailure> {
    let Query(query) = query.map_err(|rejection| state.invalid_query_with_telemetry(&rejection))?;
    let evaluation = state
        .run_blocking("evaluate_winner", move |api| {
            api.evaluate_winner(query.experiment_id)
        })
        .await?;
    Ok(Json(evaluation))
}

async fn winner_apply(
    State(state): State<ServiceState>,
    payload: Result<Json<WinnerQuery>, JsonRejection>,
) -> Result<Json<WinnerEvaluation>, ServiceFailure> {
    let Json(request) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let evaluation = state
        .run_blocking("apply_winner", move |api| {
            api.apply_winner(request.experiment_id)
        })
        .await?;
    Ok(Json(evaluation))
}
