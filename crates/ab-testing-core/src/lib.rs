use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

mod repository;

pub use repository::ExperimentRepository;

pub const DEFAULT_SPLIT: u8 = 50;
pub const DEFAULT_AUTO_WINNER_THRESHOLD: u64 = 1_000;
pub const DEFAULT_AUTO_WINNER_DAYS: u32 = 7;
pub const MAX_VARIANTS: usize = 26;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum AbError {
    #[error("validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    Draft,
    Running,
    Paused,
    Completed,
}

impl ExperimentStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "draft" => Some(Self::Draft),
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }

    /// Resolves the target status of a stop request. Missing means `paused`.
    ///
    /// # Errors
    /// Returns [`AbError::Validation`] for anything other than `paused` or
    /// `completed`.
    pub fn parse_stop_target(value: Option<&str>) -> Result<Self, AbError> {
        match value.map(str::trim) {
            None | Some("") => Ok(Self::Paused),
            Some(raw) => match Self::parse(raw) {
                Some(status @ (Self::Paused | Self::Completed)) => Ok(status),
                _ => Err(AbError::Validation(format!(
                    "invalid stop status '{raw}'; allowed: paused, completed"
                ))),
            },
        }
    }
}

impl Display for ExperimentStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    #[serde(alias = "view")]
    Impression,
    Click,
    Conversion,
}

impl EventType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Impression => "impression",
            Self::Click => "click",
            Self::Conversion => "conversion",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "impression" | "view" => Some(Self::Impression),
            "click" => Some(Self::Click),
            "conversion" => Some(Self::Conversion),
            _ => None,
        }
    }

    /// Only clicks and conversions may be posted by clients; impressions are
    /// recorded by the assignment flow itself.
    #[must_use]
    pub fn is_client_recordable(self) -> bool {
        matches!(self, Self::Click | Self::Conversion)
    }
}

impl Display for EventType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentMode {
    /// Fresh uniform draw on every request.
    #[default]
    Random,
    /// Bucket derived from the visitor fingerprint.
    Fingerprint,
}

impl AssignmentMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Random => "random",
            Self::Fingerprint => "fingerprint",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "random" => Some(Self::Random),
            "fingerprint" => Some(Self::Fingerprint),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AbConfig {
    pub ab_active: bool,
    pub default_split: u8,
    pub auto_winner_enabled: bool,
    pub auto_winner_threshold: u64,
    pub auto_winner_days: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl AbConfig {
    #[must_use]
    pub fn seeded(updated_at: OffsetDateTime) -> Self {
        Self {
            ab_active: false,
            default_split: DEFAULT_SPLIT,
            auto_winner_enabled: false,
            auto_winner_threshold: DEFAULT_AUTO_WINNER_THRESHOLD,
            auto_winner_days: DEFAULT_AUTO_WINNER_DAYS,
            updated_at,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConfigUpdate {
    pub ab_active: Option<bool>,
    pub default_split: Option<i64>,
    pub auto_winner_enabled: Option<bool>,
    pub auto_winner_threshold: Option<i64>,
    pub auto_winner_days: Option<i64>,
}

impl ConfigUpdate {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ab_active.is_none()
            && self.default_split.is_none()
            && self.auto_winner_enabled.is_none()
            && self.auto_winner_threshold.is_none()
            && self.auto_winner_days.is_none()
    }

    /// Merges the provided fields over `current`.
    ///
    /// # Errors
    /// Returns [`AbError::Validation`] when a field is outside its allowed
    /// range.
    pub fn apply_to(
        &self,
        current: &AbConfig,
        updated_at: OffsetDateTime,
    ) -> Result<AbConfig, AbError> {
        let mut next = current.clone();
        if let Some(active) = self.ab_active {
            next.ab_active = active;
        }
        if let Some(split) = self.default_split {
            next.default_split = split_percentage(split, "default_split")?;
        }
        if let Some(enabled) = self.auto_winner_enabled {
            next.auto_winner_enabled = enabled;
        }
        if let Some(threshold) = self.auto_winner_threshold {
            next.auto_winner_threshold = u64::try_from(threshold).map_err(|_| {
                AbError::Validation("auto_winner_threshold MUST be >= 0".to_string())
            })?;
        }
        if let Some(days) = self.auto_winner_days {
            next.auto_winner_days = u32::try_from(days).map_err(|_| {
                AbError::Validation("auto_winner_days MUST be in [0, 4294967295]".to_string())
            })?;
        }
        next.updated_at = updated_at;
        Ok(next)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Experiment {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub goal: Option<String>,
    pub status: ExperimentStatus,
    pub split_a: u8,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub start_date: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub end_date: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Experiment {
    /// An experiment is live when `now` falls inside its optional window.
    #[must_use]
    pub fn is_live_at(&self, now: OffsetDateTime) -> bool {
        !matches!(self.start_date, Some(start) if start > now)
            && !matches!(self.end_date, Some(end) if end < now)
    }

    /// A zero `split_a` falls back to the configured default split.
    #[must_use]
    pub fn effective_split(&self, config: &AbConfig) -> u8 {
        if self.split_a == 0 {
            config.default_split
        } else {
            self.split_a
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Variant {
    pub id: i64,
    pub experiment_id: i64,
    pub variant_key: String,
    pub title: Option<String>,
    pub subtitle: Option<String>,
    pub description: Option<String>,
    pub button_text: Option<String>,
    pub button_link: Option<String>,
    pub impressions: u64,
    pub clicks: u64,
    pub conversions: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NewVariant {
    pub title: Option<String>,
    pub subtitle: Option<String>,
    pub description: Option<String>,
    pub button_text: Option<String>,
    pub button_link: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NewExperiment {
    pub name: String,
    pub description: Option<String>,
    pub goal: Option<String>,
    pub split_a: Option<i64>,
    pub variants: Vec<NewVariant>,
}

impl NewExperiment {
    /// Validates an experiment definition before insert.
    ///
    /// # Errors
    /// Returns [`AbError::Validation`] when the name is blank, fewer than two
    /// variants are given, or the split is outside `0..=100`.
    pub fn validate(&self) -> Result<(), AbError> {
        if self.name.trim().is_empty() {
            return Err(AbError::Validation(
                "name MUST be provided for every experiment".to_string(),
            ));
        }

        if self.variants.len() < 2 {
            return Err(AbError::Validation(
                "an experiment requires at least 2 variants".to_string(),
            ));
        }

        if self.variants.len() > MAX_VARIANTS {
            return Err(AbError::Validation(format!(
                "an experiment supports at most {MAX_VARIANTS} variants"
            )));
        }

        self.effective_split().map(|_| ())
    }

    /// # Errors
    /// Returns [`AbError::Validation`] when `split_a` is outside `0..=100`.
    pub fn effective_split(&self) -> Result<u8, AbError> {
        match self.split_a {
            Some(split) => split_percentage(split, "split_a"),
            None => Ok(DEFAULT_SPLIT),
        }
    }
}

/// Key assigned to the variant at `index`: `A`, `B`, `C`, ...
#[must_use]
pub fn variant_key_for_index(index: usize) -> Option<String> {
    let offset = u8::try_from(index).ok().filter(|value| *value < 26)?;
    Some(char::from(b'A' + offset).to_string())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    pub event_seq: i64,
    pub event_id: Ulid,
    pub experiment_id: i64,
    pub variant_key: String,
    pub event_type: EventType,
    pub user_hash: String,
    pub device_type: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventInput {
    pub experiment_id: i64,
    pub variant_key: String,
    pub event_type: EventType,
    pub user_hash: String,
    pub device_type: String,
    #[serde(with = "time::serde::rfc3339")]
    pub occurred_at: OffsetDateTime,
}

/// Raw client payload for `POST /event`; every field is optional so that
/// missing fields surface as validation errors.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RecordEventRequest {
    pub experiment_id: Option<i64>,
    pub variant_key: Option<String>,
    pub event_type: Option<String>,
    pub device_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedEvent {
    pub experiment_id: i64,
    pub variant_key: String,
    pub event_type: EventType,
    pub device_type: Option<String>,
}

impl RecordEventRequest {
    /// # Errors
    /// Returns [`AbError::Validation`] when `experiment_id`, `variant_key` or
    /// `event_type` is missing, or `event_type` is not `click`/`conversion`.
    pub fn validate(&self) -> Result<ValidatedEvent, AbError> {
        let experiment_id = self.experiment_id.filter(|id| *id > 0);
        let variant_key = self
            .variant_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty());
        let event_type_raw = self
            .event_type
            .as_deref()
            .map(str::trim)
            .filter(|raw| !raw.is_empty());

        let (Some(experiment_id), Some(variant_key), Some(event_type_raw)) =
            (experiment_id, variant_key, event_type_raw)
        else {
            return Err(AbError::Validation(
                "missing parameters: experiment_id, variant_key, event_type are required"
                    .to_string(),
            ));
        };

        let event_type = EventType::parse(event_type_raw)
            .filter(|event_type| event_type.is_client_recordable())
            .ok_or_else(|| {
                AbError::Validation(format!(
                    "invalid event_type '{event_type_raw}'; allowed: click, conversion"
                ))
            })?;

        Ok(ValidatedEvent {
            experiment_id,
            variant_key: variant_key.to_string(),
            event_type,
            device_type: self
                .device_type
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string),
        })
    }
}

/// Anonymized visitor identity derived from request headers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Visitor {
    pub user_hash: String,
    pub device_type: String,
}

impl Visitor {
    #[must_use]
    pub fn from_headers(
        user_agent: Option<&str>,
        forwarded_for: Option<&str>,
        real_ip: Option<&str>,
    ) -> Self {
        let user_agent = user_agent.unwrap_or_default();
        let ip = forwarded_for
            .filter(|value| !value.is_empty())
            .or(real_ip.filter(|value| !value.is_empty()))
            .unwrap_or("unknown");

        Self {
            user_hash: fingerprint_hash(user_agent, ip),
            device_type: detect_device_type(user_agent).to_string(),
        }
    }
}

/// `hex(sha256("{user_agent}-{ip}"))`.
#[must_use]
pub fn fingerprint_hash(user_agent: &str, ip: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(user_agent.as_bytes());
    hasher.update(b"-");
    hasher.update(ip.as_bytes());
    hex::encode(hasher.finalize())
}

#[must_use]
pub fn detect_device_type(user_agent: &str) -> &'static str {
    if user_agent.contains("Mobile") {
        "mobile"
    } else if user_agent.contains("Tablet") {
        "tablet"
    } else {
        "desktop"
    }
}

/// Bucket in `0..100` from the first eight hex digits of a fingerprint.
#[must_use]
pub fn fingerprint_bucket(user_hash: &str) -> u8 {
    let prefix = user_hash.get(..8).unwrap_or(user_hash);
    let value = u32::from_str_radix(prefix, 16).unwrap_or(0);
    u8::try_from(value % 100).unwrap_or(0)
}

/// Bucket below `split` selects the first variant, otherwise the second.
/// Falls back to the first variant when the second does not exist.
#[must_use]
pub fn choose_variant(variants: &[Variant], split: u8, bucket: u8) -> Option<&Variant> {
    let index = usize::from(bucket >= split);
    variants.get(index).or_else(|| variants.first())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VariantPayload {
    pub key: String,
    pub title: Option<String>,
    pub subtitle: Option<String>,
    pub description: Option<String>,
    pub button_text: Option<String>,
    pub button_link: Option<String>,
}

impl From<&Variant> for VariantPayload {
    fn from(variant: &Variant) -> Self {
        Self {
            key: variant.variant_key.clone(),
            title: variant.title.clone(),
            subtitle: variant.subtitle.clone(),
            description: variant.description.clone(),
            button_text: variant.button_text.clone(),
            button_link: variant.button_link.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Assignment {
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experiment_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experiment_name: Option<String>,
    pub variant: Option<VariantPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub split_a: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Assignment {
    #[must_use]
    pub fn inactive(message: &str) -> Self {
        Self {
            active: false,
            experiment_id: None,
            experiment_name: None,
            variant: None,
            split_a: None,
            device_type: None,
            message: Some(message.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VariantStats {
    #[serde(flatten)]
    pub variant: Variant,
    pub ctr: f64,
    pub conversion_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatsTotals {
    pub impressions: u64,
    pub clicks: u64,
    pub conversions: u64,
    pub ctr: f64,
    pub conversion_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatsReport {
    pub stats: Vec<VariantStats>,
    pub totals: StatsTotals,
    pub count: usize,
}

/// `numerator / denominator * 100`, or zero for an empty denominator.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn percentage(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        return 0.0;
    }
    numerator as f64 / denominator as f64 * 100.0
}

#[must_use]
pub fn aggregate_stats(variants: Vec<Variant>) -> StatsReport {
    let mut impressions = 0_u64;
    let mut clicks = 0_u64;
    let mut conversions = 0_u64;

    let stats = variants
        .into_iter()
        .map(|variant| {
            impressions = impressions.saturating_add(variant.impressions);
            clicks = clicks.saturating_add(variant.clicks);
            conversions = conversions.saturating_add(variant.conversions);
            VariantStats {
                ctr: percentage(variant.clicks, variant.impressions),
                conversion_rate: percentage(variant.conversions, variant.clicks),
                variant,
            }
        })
        .collect::<Vec<_>>();

    StatsReport {
        count: stats.len(),
        stats,
        totals: StatsTotals {
            impressions,
            clicks,
            conversions,
            ctr: percentage(clicks, impressions),
            conversion_rate: percentage(conversions, clicks),
        },
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WinnerEvaluation {
    pub experiment_id: i64,
    pub eligible: bool,
    pub applied: bool,
    pub leader: Option<String>,
    pub winner: Option<String>,
    pub total_impressions: u64,
    pub days_running: i64,
    pub reason_codes: Vec<String>,
}

#[must_use]
pub fn evaluate_winner(
    config: &AbConfig,
    experiment: &Experiment,
    report: &StatsReport,
    now: OffsetDateTime,
) -> WinnerEvaluation {
    let total_impressions = report.totals.impressions;
    let days_running = experiment
        .start_date
        .filter(|start| *start < now)
        .map_or(0, |start| (now - start).whole_days());
    let leader = leading_variant(&report.stats).map(|item| item.variant.variant_key.clone());

    let mut reason_codes = Vec::new();
    if experiment.status == ExperimentStatus::Completed {
        reason_codes.push("excluded.already_completed".to_string());
    }
    if !config.auto_winner_enabled {
        reason_codes.push("excluded.auto_winner_disabled".to_string());
    }
    if total_impressions < config.auto_winner_threshold {
        reason_codes.push("excluded.below_impression_threshold".to_string());
    }
    if days_running < i64::from(config.auto_winner_days) {
        reason_codes.push("excluded.min_days_not_reached".to_string());
    }
    if leader.is_none() {
        reason_codes.push("excluded.no_variants".to_string());
    }

    let eligible = reason_codes.is_empty();
    if eligible {
        reason_codes.push("included.winner_selected".to_string());
    }

    WinnerEvaluation {
        experiment_id: experiment.id,
        eligible,
        applied: false,
        winner: if eligible { leader.clone() } else { None },
        leader,
        total_impressions,
        days_running,
        reason_codes,
    }
}

/// Highest conversion rate, then highest CTR, then lowest key.
fn leading_variant(stats: &[VariantStats]) -> Option<&VariantStats> {
    stats.iter().fold(None, |best, item| match best {
        Some(current) if !outranks(item, current) => Some(current),
        _ => Some(item),
    })
}

fn outranks(candidate: &VariantStats, current: &VariantStats) -> bool {
    match candidate
        .conversion_rate
        .total_cmp(&current.conversion_rate)
        .then_with(|| candidate.ctr.total_cmp(&current.ctr))
    {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => candidate.variant.variant_key < current.variant.variant_key,
    }
}

fn split_percentage(value: i64, field: &str) -> Result<u8, AbError> {
    u8::try_from(value)
        .ok()
        .filter(|split| *split <= 100)
        .ok_or_else(|| AbError::Validation(format!("{field} MUST be in [0, 100]")))
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`AbError::Validation`] when parsing fails or an input timestamp
/// is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, AbError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| AbError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(AbError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`AbError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, AbError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| AbError::Validation(format!("failed to format RFC3339 timestamp: {err}")))
}

/// Current time in UTC, truncated to whole seconds so stored values compare
/// the same way they were written.
#[must_use]
pub fn now_utc() -> OffsetDateTime {
    let now = OffsetDateTime::now_utc();
    now.replace_nanosecond(0).unwrap_or(now)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp)]

    use super::*;
    use proptest::prelude::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn must_some<T>(value: Option<T>) -> T {
        match value {
            Some(inner) => inner,
            None => panic!("expected Some(..), got None"),
        }
    }

    fn must_utc(value: &str) -> OffsetDateTime {
        must_ok(parse_rfc3339_utc(value))
    }

    fn fixture_variant(key: &str, impressions: u64, clicks: u64, conversions: u64) -> Variant {
        Variant {
            id: 1,
            experiment_id: 1,
            variant_key: key.to_string(),
            title: Some(format!("Hero {key}")),
            subtitle: None,
            description: None,
            button_text: Some("Jetzt anfragen".to_string()),
            button_link: Some("/kontakt".to_string()),
            impressions,
            clicks,
            conversions,
            updated_at: must_utc("2026-02-07T12:00:00Z"),
        }
    }

    fn fixture_experiment(status: ExperimentStatus) -> Experiment {
        Experiment {
            id: 7,
            name: "Hero-Section A/B-Test".to_string(),
            description: None,
            goal: None,
            status,
            split_a: 50,
            start_date: Some(must_utc("2026-02-01T00:00:00Z")),
            end_date: None,
            created_at: must_utc("2026-02-01T00:00:00Z"),
            updated_at: must_utc("2026-02-01T00:00:00Z"),
        }
    }

    fn enabled_config() -> AbConfig {
        let mut config = AbConfig::seeded(must_utc("2026-02-01T00:00:00Z"));
        config.auto_winner_enabled = true;
        config.auto_winner_threshold = 100;
        config.auto_winner_days = 3;
        config
    }

    #[test]
    fn rates_are_zero_for_empty_denominators() {
        let report = aggregate_stats(vec![fixture_variant("A", 0, 0, 0)]);
        assert_eq!(report.stats[0].ctr, 0.0);
        assert_eq!(report.stats[0].conversion_rate, 0.0);
        assert_eq!(report.totals.ctr, 0.0);
        assert_eq!(report.count, 1);
    }

    #[test]
    fn totals_sum_all_variants() {
        let report = aggregate_stats(vec![
            fixture_variant("A", 200, 20, 5),
            fixture_variant("B", 100, 30, 3),
        ]);
        assert_eq!(report.totals.impressions, 300);
        assert_eq!(report.totals.clicks, 50);
        assert_eq!(report.totals.conversions, 8);
        assert!((report.totals.ctr - 50.0 / 300.0 * 100.0).abs() < f64::EPSILON);
        assert!((report.stats[0].conversion_rate - 25.0).abs() < f64::EPSILON);
        assert!((report.stats[1].conversion_rate - 10.0).abs() < f64::EPSILON);
    }

    proptest! {
        #[test]
        fn ctr_matches_formula(impressions in 0_u64..1_000_000, clicks in 0_u64..1_000_000) {
            let report = aggregate_stats(vec![fixture_variant("A", impressions, clicks, 0)]);
            #[allow(clippy::cast_precision_loss)]
            let expected = if impressions == 0 {
                0.0
            } else {
                clicks as f64 / impressions as f64 * 100.0
            };
            prop_assert_eq!(report.stats[0].ctr, expected);
        }
    }

    #[test]
    fn split_routes_low_buckets_to_first_variant() {
        let variants = vec![fixture_variant("A", 0, 0, 0), fixture_variant("B", 0, 0, 0)];
        assert_eq!(must_some(choose_variant(&variants, 30, 29)).variant_key, "A");
        assert_eq!(must_some(choose_variant(&variants, 30, 30)).variant_key, "B");
        assert_eq!(must_some(choose_variant(&variants, 100, 99)).variant_key, "A");
    }

    #[test]
    fn single_variant_is_used_as_fallback() {
        let variants = vec![fixture_variant("A", 0, 0, 0)];
        assert_eq!(must_some(choose_variant(&variants, 0, 80)).variant_key, "A");
        assert!(choose_variant(&[], 50, 10).is_none());
    }

    #[test]
    fn zero_split_uses_config_default() {
        let mut experiment = fixture_experiment(ExperimentStatus::Running);
        let mut config = AbConfig::seeded(now_utc());
        config.default_split = 70;
        experiment.split_a = 0;
        assert_eq!(experiment.effective_split(&config), 70);
        experiment.split_a = 20;
        assert_eq!(experiment.effective_split(&config), 20);
    }

    #[test]
    fn experiment_window_bounds_are_inclusive_and_open_when_missing() {
        let mut experiment = fixture_experiment(ExperimentStatus::Running);
        experiment.end_date = Some(must_utc("2026-02-10T00:00:00Z"));
        assert!(experiment.is_live_at(must_utc("2026-02-01T00:00:00Z")));
        assert!(experiment.is_live_at(must_utc("2026-02-10T00:00:00Z")));
        assert!(!experiment.is_live_at(must_utc("2026-02-10T00:00:01Z")));
        assert!(!experiment.is_live_at(must_utc("2026-01-31T23:59:59Z")));

        experiment.start_date = None;
        experiment.end_date = None;
        assert!(experiment.is_live_at(must_utc("1999-01-01T00:00:00Z")));
    }

    #[test]
    fn fingerprint_bucket_uses_hash_prefix() {
        assert_eq!(fingerprint_bucket("00000064ffff"), 0);
        assert_eq!(fingerprint_bucket("0000006bffff"), 7);
        assert_eq!(fingerprint_bucket("zz"), 0);
    }

    #[test]
    fn visitor_fingerprint_is_stable_and_anonymized() {
        let first = Visitor::from_headers(Some("Mozilla/5.0 Mobile"), Some("203.0.113.9"), None);
        let second = Visitor::from_headers(Some("Mozilla/5.0 Mobile"), Some("203.0.113.9"), None);
        assert_eq!(first, second);
        assert_eq!(first.user_hash.len(), 64);
        assert!(!first.user_hash.contains("203.0.113.9"));
        assert_eq!(first.device_type, "mobile");

        let fallback = Visitor::from_headers(None, Some(""), None);
        assert_eq!(fallback.user_hash, fingerprint_hash("", "unknown"));
        assert_eq!(fallback.device_type, "desktop");
    }

    #[test]
    fn device_detection_prefers_mobile_over_tablet() {
        assert_eq!(detect_device_type("Tablet Mobile"), "mobile");
        assert_eq!(detect_device_type("Tablet"), "tablet");
        assert_eq!(detect_device_type("curl/8.0"), "desktop");
    }

    #[test]
    fn event_request_requires_all_identifiers() {
        let request = RecordEventRequest {
            experiment_id: Some(1),
            variant_key: None,
            event_type: Some("click".to_string()),
            device_type: None,
        };
        assert!(matches!(request.validate(), Err(AbError::Validation(_))));

        let zero_id = RecordEventRequest {
            experiment_id: Some(0),
            variant_key: Some("A".to_string()),
            event_type: Some("click".to_string()),
            device_type: None,
        };
        assert!(matches!(zero_id.validate(), Err(AbError::Validation(_))));
    }

    #[test]
    fn event_request_rejects_impressions_and_unknown_types() {
        for raw in ["bogus", "impression", "view"] {
            let request = RecordEventRequest {
                experiment_id: Some(1),
                variant_key: Some("A".to_string()),
                event_type: Some(raw.to_string()),
                device_type: None,
            };
            assert!(
                matches!(request.validate(), Err(AbError::Validation(_))),
                "{raw} must be rejected"
            );
        }
    }

    #[test]
    fn event_request_normalizes_optional_device() {
        let request = RecordEventRequest {
            experiment_id: Some(3),
            variant_key: Some(" B ".to_string()),
            event_type: Some("conversion".to_string()),
            device_type: Some("  ".to_string()),
        };
        let validated = must_ok(request.validate());
        assert_eq!(validated.variant_key, "B");
        assert_eq!(validated.event_type, EventType::Conversion);
        assert_eq!(validated.device_type, None);
    }

    #[test]
    fn stop_target_defaults_to_paused() {
        assert_eq!(
            must_ok(ExperimentStatus::parse_stop_target(None)),
            ExperimentStatus::Paused
        );
        assert_eq!(
            must_ok(ExperimentStatus::parse_stop_target(Some("completed"))),
            ExperimentStatus::Completed
        );
        assert!(ExperimentStatus::parse_stop_target(Some("running")).is_err());
        assert!(ExperimentStatus::parse_stop_target(Some("archived")).is_err());
    }

    #[test]
    fn new_experiment_validation() {
        let mut input = NewExperiment {
            name: "Hero".to_string(),
            variants: vec![NewVariant::default(), NewVariant::default()],
            ..NewExperiment::default()
        };
        assert!(input.validate().is_ok());
        assert_eq!(must_ok(input.effective_split()), DEFAULT_SPLIT);

        input.split_a = Some(101);
        assert!(input.validate().is_err());

        input.split_a = Some(30);
        input.variants.pop();
        assert!(input.validate().is_err());

        input.variants.push(NewVariant::default());
        input.name = "   ".to_string();
        assert!(input.validate().is_err());
    }

    #[test]
    fn variant_keys_are_letters() {
        assert_eq!(variant_key_for_index(0).as_deref(), Some("A"));
        assert_eq!(variant_key_for_index(25).as_deref(), Some("Z"));
        assert_eq!(variant_key_for_index(26), None);
    }

    #[test]
    fn config_update_validates_ranges() {
        let current = AbConfig::seeded(must_utc("2026-02-01T00:00:00Z"));
        let later = must_utc("2026-02-02T00:00:00Z");

        let update = ConfigUpdate {
            ab_active: Some(true),
            default_split: Some(65),
            ..ConfigUpdate::default()
        };
        let next = must_ok(update.apply_to(&current, later));
        assert!(next.ab_active);
        assert_eq!(next.default_split, 65);
        assert_eq!(next.auto_winner_threshold, DEFAULT_AUTO_WINNER_THRESHOLD);
        assert_eq!(next.updated_at, later);

        let bad_split = ConfigUpdate {
            default_split: Some(-1),
            ..ConfigUpdate::default()
        };
        assert!(bad_split.apply_to(&current, later).is_err());

        let bad_threshold = ConfigUpdate {
            auto_winner_threshold: Some(-5),
            ..ConfigUpdate::default()
        };
        assert!(bad_threshold.apply_to(&current, later).is_err());
        assert!(ConfigUpdate::default().is_empty());
    }

    #[test]
    fn winner_requires_threshold_and_days() {
        let experiment = fixture_experiment(ExperimentStatus::Running);
        let report = aggregate_stats(vec![
            fixture_variant("A", 60, 10, 1),
            fixture_variant("B", 60, 10, 4),
        ]);

        let early = evaluate_winner(
            &enabled_config(),
            &experiment,
            &report,
            must_utc("2026-02-02T00:00:00Z"),
        );
        assert!(!early.eligible);
        assert_eq!(early.winner, None);
        assert_eq!(early.leader.as_deref(), Some("B"));
        assert_eq!(early.reason_codes, vec!["excluded.min_days_not_reached"]);

        let ready = evaluate_winner(
            &enabled_config(),
            &experiment,
            &report,
            must_utc("2026-02-07T00:00:00Z"),
        );
        assert!(ready.eligible);
        assert_eq!(ready.winner.as_deref(), Some("B"));
        assert_eq!(ready.days_running, 6);
        assert_eq!(ready.reason_codes, vec!["included.winner_selected"]);
    }

    #[test]
    fn winner_disabled_reports_every_blocker() {
        let experiment = fixture_experiment(ExperimentStatus::Completed);
        let report = aggregate_stats(Vec::new());
        let evaluation = evaluate_winner(
            &AbConfig::seeded(must_utc("2026-02-01T00:00:00Z")),
            &experiment,
            &report,
            must_utc("2026-02-02T00:00:00Z"),
        );
        assert!(!evaluation.eligible);
        assert_eq!(
            evaluation.reason_codes,
            vec![
                "excluded.already_completed",
                "excluded.auto_winner_disabled",
                "excluded.below_impression_threshold",
                "excluded.min_days_not_reached",
                "excluded.no_variants",
            ]
        );
    }

    #[test]
    fn leader_ties_fall_back_to_ctr_then_key() {
        let report = aggregate_stats(vec![
            fixture_variant("A", 100, 10, 5),
            fixture_variant("B", 50, 10, 5),
            fixture_variant("C", 50, 10, 5),
        ]);
        assert_eq!(
            leading_variant(&report.stats).map(|item| item.variant.variant_key.as_str()),
            Some("B")
        );
    }

    #[test]
    fn event_type_accepts_legacy_view_alias() {
        assert_eq!(EventType::parse("view"), Some(EventType::Impression));
        let parsed: EventType = must_ok(serde_json::from_str("\"view\""));
        assert_eq!(parsed, EventType::Impression);
        assert_eq!(must_ok(serde_json::to_string(&parsed)), "\"impression\"");
    }
}
