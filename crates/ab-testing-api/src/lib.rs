use std::path::PathBuf;

use ab_testing_core::{
    fingerprint_bucket, now_utc, AbConfig, AbError, AssignmentMode, ConfigUpdate, Event,
    EventType, Experiment, ExperimentRepository, ExperimentStatus, NewExperiment,
    RecordEventRequest, StatsReport, Variant, Visitor, WinnerEvaluation,
};
use ab_testing_store_sqlite::{SchemaStatus, SqliteExperimentStore};
use rand::Rng;
use serde::{Deserialize, Serialize};

pub mod flows;

pub use ab_testing_core::Assignment;

pub const API_CONTRACT_VERSION: &str = "ab.v1";
pub const DEFAULT_EVENT_LIMIT: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error("database error: {0:#}")]
    Database(#[from] anyhow::Error),
}

impl ApiError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::NotFound(_) => "not_found",
            Self::Database(_) => "database_error",
        }
    }
}

impl From<AbError> for ApiError {
    fn from(err: AbError) -> Self {
        let AbError::Validation(message) = err;
        Self::Validation(message)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StartRequest {
    pub experiment_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StartResult {
    pub success: bool,
    pub experiment_id: Option<i64>,
    pub started: Vec<i64>,
    pub ab_active: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StopRequest {
    pub experiment_id: Option<i64>,
    pub status: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StopResult {
    pub success: bool,
    pub experiment_id: Option<i64>,
    pub status: ExperimentStatus,
    pub stopped: Vec<i64>,
    pub ab_active: bool,
    pub active_experiments: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordedEvent {
    pub success: bool,
    pub message: String,
    pub experiment_id: i64,
    pub variant_key: String,
    pub event_type: EventType,
    pub device_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreatedExperiment {
    pub success: bool,
    pub message: String,
    pub experiment_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExperimentWithVariants {
    #[serde(flatten)]
    pub experiment: Experiment,
    pub variants: Vec<Variant>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExperimentList {
    pub experiments: Vec<ExperimentWithVariants>,
    pub count: usize,
}

/// Operations façade. Every call opens its own short-lived connection to the
/// database at `db_path`, so the value is cheap to clone across threads.
#[derive(Debug, Clone)]
pub struct AbTestingApi {
    db_path: PathBuf,
    assignment_mode: AssignmentMode,
}

impl AbTestingApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self {
            db_path,
            assignment_mode: AssignmentMode::default(),
        }
    }

    #[must_use]
    pub fn with_assignment_mode(mut self, assignment_mode: AssignmentMode) -> Self {
        self.assignment_mode = assignment_mode;
        self
    }

    #[must_use]
    pub fn assignment_mode(&self) -> AssignmentMode {
        self.assignment_mode
    }

    fn open_store(&self) -> Result<SqliteExperimentStore, ApiError> {
        Ok(SqliteExperimentStore::open(&self.db_path)?)
    }

    /// # Errors
    /// Returns [`ApiError::Database`] when the schema cannot be applied.
    pub fn migrate(&self) -> Result<SchemaStatus, ApiError> {
        let store = self.open_store()?;
        store.migrate()?;
        tracing::info!(db = %self.db_path.display(), "database migrated");
        Ok(store.schema_status()?)
    }

    /// # Errors
    /// Returns [`ApiError::Database`] when the database is unreachable or not
    /// migrated.
    pub fn schema_status(&self) -> Result<SchemaStatus, ApiError> {
        Ok(self.open_store()?.schema_status()?)
    }

    /// # Errors
    /// Returns [`ApiError::Database`] on storage failure.
    pub fn config(&self) -> Result<AbConfig, ApiError> {
        flows::load_config(&self.open_store()?)
    }

    /// # Errors
    /// Returns [`ApiError::Validation`] for out-of-range fields.
    pub fn update_config(&self, update: &ConfigUpdate) -> Result<AbConfig, ApiError> {
        let config = flows::update_config(&self.open_store()?, update, now_utc())?;
        tracing::info!(
            ab_active = config.ab_active,
            default_split = config.default_split,
            auto_winner_enabled = config.auto_winner_enabled,
            "config updated"
        );
        Ok(config)
    }

    /// # Errors
    /// Returns [`ApiError::NotFound`] when the running experiment has no
    /// variants.
    pub fn assign(&self, visitor: &Visitor) -> Result<Assignment, ApiError> {
        let mode = self.assignment_mode;
        let mut store = self.open_store()?;
        let assignment = flows::assign(&mut store, visitor, now_utc(), |visitor| match mode {
            AssignmentMode::Random => rand::rng().random_range(0..100),
            AssignmentMode::Fingerprint => fingerprint_bucket(&visitor.user_hash),
        })?;
        if let (Some(experiment_id), Some(variant)) =
            (assignment.experiment_id, assignment.variant.as_ref())
        {
            tracing::debug!(
                experiment_id,
                variant_key = %variant.key,
                mode = mode.as_str(),
                "variant assigned"
            );
        }
        Ok(assignment)
    }

    /// # Errors
    /// Returns [`ApiError::Validation`] for incomplete requests and
    /// [`ApiError::NotFound`] when the variant does not exist.
    pub fn record_event(
        &self,
        request: &RecordEventRequest,
        visitor: &Visitor,
    ) -> Result<RecordedEvent, ApiError> {
        let mut store = self.open_store()?;
        let recorded = flows::record_event(&mut store, request, visitor, now_utc())?;
        tracing::info!(
            experiment_id = recorded.experiment_id,
            variant_key = %recorded.variant_key,
            event_type = %recorded.event_type,
            "event recorded"
        );
        Ok(recorded)
    }

    /// # Errors
    /// Returns [`ApiError::NotFound`] for an unknown experiment id.
    pub fn start(&self, request: &StartRequest) -> Result<StartResult, ApiError> {
        let result = flows::start(&self.open_store()?, request, now_utc())?;
        tracing::info!(started = ?result.started, "experiments started");
        Ok(result)
    }

    /// # Errors
    /// Returns [`ApiError::Validation`] for an unsupported target status and
    /// [`ApiError::NotFound`] for an unknown experiment id.
    pub fn stop(&self, request: &StopRequest) -> Result<StopResult, ApiError> {
        let result = flows::stop(&self.open_store()?, request, now_utc())?;
        tracing::info!(
            stopped = ?result.stopped,
            status = %result.status,
            ab_active = result.ab_active,
            "experiments stopped"
        );
        Ok(result)
    }

    /// # Errors
    /// Returns [`ApiError::NotFound`] when `experiment_id` does not exist.
    pub fn stats(&self, experiment_id: Option<i64>) -> Result<StatsReport, ApiError> {
        flows::stats(&self.open_store()?, experiment_id)
    }

    /// # Errors
    /// Returns [`ApiError::Validation`] for an invalid experiment definition.
    pub fn create_experiment(&self, input: &NewExperiment) -> Result<CreatedExperiment, ApiError> {
        let mut store = self.open_store()?;
        let created = flows::create_experiment(&mut store, input, now_utc())?;
        tracing::info!(
            experiment_id = created.experiment_id,
            variants = input.variants.len(),
            "experiment created"
        );
        Ok(created)
    }

    /// # Errors
    /// Returns [`ApiError::Validation`] for an unknown status filter.
    pub fn list_experiments(&self, status: Option<&str>) -> Result<ExperimentList, ApiError> {
        flows::list_experiments(&self.open_store()?, status)
    }

    /// Most recent events first.
    ///
    /// # Errors
    /// Returns [`ApiError::Database`] on storage failure.
    pub fn list_events(
        &self,
        experiment_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Event>, ApiError> {
        Ok(self.open_store()?.list_events(experiment_id, limit)?)
    }

    /// # Errors
    /// Returns [`ApiError::NotFound`] when the experiment does not exist.
    pub fn evaluate_winner(&self, experiment_id: i64) -> Result<WinnerEvaluation, ApiError> {
        flows::evaluate(&self.open_store()?, experiment_id, now_utc())
    }

    /// # Errors
    /// Returns [`ApiError::NotFound`] when the experiment does not exist.
    pub fn apply_winner(&self, experiment_id: i64) -> Result<WinnerEvaluation, ApiError> {
        let evaluation = flows::apply_winner(&self.open_store()?, experiment_id, now_utc())?;
        tracing::info!(
            experiment_id,
            applied = evaluation.applied,
            winner = evaluation.winner.as_deref().unwrap_or("-"),
            reasons = ?evaluation.reason_codes,
            "winner evaluated"
        );
        Ok(evaluation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must<T>(result: Result<T, ApiError>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("ab-testing-api-{}.sqlite3", ulid::Ulid::new()))
    }

    #[test]
    fn unmigrated_database_surfaces_as_database_error() {
        let db_path = unique_temp_db_path();
        let api = AbTestingApi::new(db_path.clone());
        let err = match api.config() {
            Ok(_) => panic!("expected database error before migration"),
            Err(err) => err,
        };
        assert_eq!(err.code(), "database_error");
        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn fingerprint_mode_is_sticky_per_visitor() {
        let db_path = unique_temp_db_path();
        let api =
            AbTestingApi::new(db_path.clone()).with_assignment_mode(AssignmentMode::Fingerprint);
        let _ = must(api.migrate());

        let created = must(api.create_experiment(&NewExperiment {
            name: "Sticky".to_string(),
            variants: vec![
                ab_testing_core::NewVariant::default(),
                ab_testing_core::NewVariant::default(),
            ],
            ..NewExperiment::default()
        }));
        let _ = must(api.start(&StartRequest {
            experiment_id: Some(created.experiment_id),
        }));

        let visitor = Visitor::from_headers(Some("Mozilla/5.0"), None, Some("192.0.2.10"));
        let first = must(api.assign(&visitor));
        for _ in 0..5 {
            let again = must(api.assign(&visitor));
            assert_eq!(
                again.variant.as_ref().map(|variant| variant.key.clone()),
                first.variant.as_ref().map(|variant| variant.key.clone())
            );
        }

        let report = must(api.stats(Some(created.experiment_id)));
        assert_eq!(report.totals.impressions, 6);
        assert_eq!(must(api.list_events(Some(created.experiment_id), 3)).len(), 3);
        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(
            ApiError::from(AbError::Validation("x".to_string())).code(),
            "validation_error"
        );
        assert_eq!(
            ApiError::NotFound("experiment 9 not found".to_string()).code(),
            "not_found"
        );
        assert_eq!(
            ApiError::from(anyhow::anyhow!("disk full")).code(),
            "database_error"
        );
    }
}
