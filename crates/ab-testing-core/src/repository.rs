use anyhow::Result;
use time::OffsetDateTime;

use crate::{
    AbConfig, Event, EventInput, EventType, Experiment, ExperimentStatus, NewExperiment, Variant,
};

/// Persistence seam for configuration, experiments, variants and events.
///
/// Implementations keep the variant counters and the event log consistent:
/// `record_event` either appends the event and bumps the matching counter, or
/// does neither.
pub trait ExperimentRepository {
    #[allow(clippy::missing_errors_doc)]
    fn migrate(&self) -> Result<()>;

    /// `None` when the singleton row has not been seeded.
    #[allow(clippy::missing_errors_doc)]
    fn get_config(&self) -> Result<Option<AbConfig>>;

    #[allow(clippy::missing_errors_doc)]
    fn put_config(&self, config: &AbConfig) -> Result<()>;

    /// Returns `false` when the config row is missing.
    #[allow(clippy::missing_errors_doc)]
    fn set_ab_active(&self, active: bool, at: OffsetDateTime) -> Result<bool>;

    /// Inserts a draft experiment and its variants keyed `A`, `B`, ...
    #[allow(clippy::missing_errors_doc)]
    fn insert_experiment(&mut self, input: &NewExperiment, at: OffsetDateTime) -> Result<i64>;

    #[allow(clippy::missing_errors_doc)]
    fn get_experiment(&self, experiment_id: i64) -> Result<Option<Experiment>>;

    /// Newest first.
    #[allow(clippy::missing_errors_doc)]
    fn list_experiments(&self, status: Option<ExperimentStatus>) -> Result<Vec<Experiment>>;

    /// Moves an experiment to `status`. Entering `running` stamps
    /// `start_date` and entering `completed` stamps `end_date`, each only when
    /// unset. Returns `false` when the experiment does not exist.
    #[allow(clippy::missing_errors_doc)]
    fn set_experiment_status(
        &self,
        experiment_id: i64,
        status: ExperimentStatus,
        at: OffsetDateTime,
    ) -> Result<bool>;

    #[allow(clippy::missing_errors_doc)]
    fn count_experiments_with_status(&self, status: ExperimentStatus) -> Result<u64>;

    /// Variants ordered by experiment then key.
    #[allow(clippy::missing_errors_doc)]
    fn list_variants(&self, experiment_id: Option<i64>) -> Result<Vec<Variant>>;

    /// Appends the event and increments the counter for its type in one
    /// transaction. Returns `None` and writes nothing when the variant does
    /// not exist.
    #[allow(clippy::missing_errors_doc)]
    fn record_event(&mut self, input: &EventInput) -> Result<Option<Event>>;

    /// Bumps a single counter without logging an event.
    #[allow(clippy::missing_errors_doc)]
    fn increment_variant_counter(
        &self,
        experiment_id: i64,
        variant_key: &str,
        event_type: EventType,
    ) -> Result<bool>;

    #[allow(clippy::missing_errors_doc)]
    fn list_events(&self, experiment_id: Option<i64>, limit: usize) -> Result<Vec<Event>>;
}
