#![allow(clippy::missing_errors_doc)]

use std::path::Path;

use ab_testing_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, variant_key_for_index, AbConfig, Event,
    EventInput, EventType, Experiment, ExperimentRepository, ExperimentStatus, NewExperiment,
    Variant,
};
use anyhow::{anyhow, Context, Result};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use time::OffsetDateTime;
use ulid::Ulid;

const AB_MIGRATION_VERSION: i64 = 1;

const SCHEMA_AB_V1: &str = r"
CREATE TABLE IF NOT EXISTS ab_config (
  id INTEGER PRIMARY KEY CHECK (id = 1),
  ab_active INTEGER NOT NULL DEFAULT 0 CHECK (ab_active IN (0, 1)),
  default_split INTEGER NOT NULL DEFAULT 50 CHECK (default_split BETWEEN 0 AND 100),
  auto_winner_enabled INTEGER NOT NULL DEFAULT 0 CHECK (auto_winner_enabled IN (0, 1)),
  auto_winner_threshold INTEGER NOT NULL DEFAULT 1000 CHECK (auto_winner_threshold >= 0),
  auto_winner_days INTEGER NOT NULL DEFAULT 7 CHECK (auto_winner_days >= 0),
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS ab_experiments (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL,
  description TEXT,
  goal TEXT,
  status TEXT NOT NULL DEFAULT 'draft' CHECK (
    status IN ('draft', 'running', 'paused', 'completed')
  ),
  split_a INTEGER NOT NULL DEFAULT 50 CHECK (split_a BETWEEN 0 AND 100),
  start_date TEXT,
  end_date TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_ab_experiments_status_id
  ON ab_experiments(status, id);

CREATE TABLE IF NOT EXISTS ab_variants (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  experiment_id INTEGER NOT NULL,
  variant_key TEXT NOT NULL,
  title TEXT,
  subtitle TEXT,
  description TEXT,
  button_text TEXT,
  button_link TEXT,
  impressions INTEGER NOT NULL DEFAULT 0 CHECK (impressions >= 0),
  clicks INTEGER NOT NULL DEFAULT 0 CHECK (clicks >= 0),
  conversions INTEGER NOT NULL DEFAULT 0 CHECK (conversions >= 0),
  updated_at TEXT NOT NULL,
  UNIQUE (experiment_id, variant_key),
  FOREIGN KEY (experiment_id) REFERENCES ab_experiments(id)
);

CREATE TABLE IF NOT EXISTS ab_events (
  event_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  event_id TEXT NOT NULL UNIQUE,
  experiment_id INTEGER NOT NULL,
  variant_key TEXT NOT NULL,
  event_type TEXT NOT NULL CHECK (event_type IN ('impression', 'click', 'conversion')),
  user_hash TEXT NOT NULL,
  device_type TEXT NOT NULL,
  timestamp TEXT NOT NULL,
  FOREIGN KEY (experiment_id, variant_key) REFERENCES ab_variants(experiment_id, variant_key)
);

CREATE TRIGGER IF NOT EXISTS trg_ab_events_no_update
BEFORE UPDATE ON ab_events
BEGIN
  SELECT RAISE(FAIL, 'ab_events is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_ab_events_no_delete
BEFORE DELETE ON ab_events
BEGIN
  SELECT RAISE(FAIL, 'ab_events is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_ab_events_experiment_seq
  ON ab_events(experiment_id, event_seq);
";

const EXPERIMENT_COLUMNS: &str = "id, name, description, goal, status, split_a, start_date, end_date, created_at, updated_at";

const VARIANT_COLUMNS: &str = "id, experiment_id, variant_key, title, subtitle, description, button_text, button_link, impressions, clicks, conversions, updated_at";

const EVENT_COLUMNS: &str =
    "event_seq, event_id, experiment_id, variant_key, event_type, user_hash, device_type, timestamp";

pub struct SqliteExperimentStore {
    conn: Connection,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub schema_version: i64,
    pub experiments: u64,
    pub variants: u64,
    pub events: u64,
}

impl SqliteExperimentStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let schema_version: Option<i64> = self
            .conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
                row.get(0)
            })
            .context("failed to read schema_migrations; run `abx db migrate` first")?;

        Ok(SchemaStatus {
            schema_version: schema_version.unwrap_or(0),
            experiments: self.count_rows("ab_experiments")?,
            variants: self.count_rows("ab_variants")?,
            events: self.count_rows("ab_events")?,
        })
    }

    fn count_rows(&self, table: &str) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                row.get(0)
            })
            .with_context(|| format!("failed to count rows in {table}"))?;
        u64::try_from(count).with_context(|| format!("invalid row count for {table}: {count}"))
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl ExperimentRepository for SqliteExperimentStore {
    fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_AB_V1)
            .context("failed to apply ab testing schema")?;

        let now = timestamp_text(now_utc())?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![AB_MIGRATION_VERSION, now],
            )
            .context("failed to register ab testing schema migration")?;

        let seeded = AbConfig::seeded(now_utc());
        self.conn
            .execute(
                "INSERT OR IGNORE INTO ab_config(
                    id, ab_active, default_split, auto_winner_enabled,
                    auto_winner_threshold, auto_winner_days, updated_at
                 ) VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    seeded.ab_active,
                    i64::from(seeded.default_split),
                    seeded.auto_winner_enabled,
                    counter_to_sql(seeded.auto_winner_threshold)?,
                    i64::from(seeded.auto_winner_days),
                    timestamp_text(seeded.updated_at)?,
                ],
            )
            .context("failed to seed ab_config singleton")?;

        Ok(())
    }

    fn get_config(&self) -> Result<Option<AbConfig>> {
        self.conn
            .query_row(
                "SELECT ab_active, default_split, auto_winner_enabled,
                        auto_winner_threshold, auto_winner_days, updated_at
                 FROM ab_config WHERE id = 1",
                [],
                parse_config_row,
            )
            .optional()
            .context("failed to read ab_config")
    }

    fn put_config(&self, config: &AbConfig) -> Result<()> {
        let updated = self
            .conn
            .execute(
                "UPDATE ab_config SET
                    ab_active = ?1,
                    default_split = ?2,
                    auto_winner_enabled = ?3,
                    auto_winner_threshold = ?4,
                    auto_winner_days = ?5,
                    updated_at = ?6
                 WHERE id = 1",
                params![
                    config.ab_active,
                    i64::from(config.default_split),
                    config.auto_winner_enabled,
                    counter_to_sql(config.auto_winner_threshold)?,
                    i64::from(config.auto_winner_days),
                    timestamp_text(config.updated_at)?,
                ],
            )
            .context("failed to update ab_config")?;

        if updated == 0 {
            return Err(anyhow!("ab_config singleton row is missing"));
        }
        Ok(())
    }

    fn set_ab_active(&self, active: bool, at: OffsetDateTime) -> Result<bool> {
        let updated = self
            .conn
            .execute(
                "UPDATE ab_config SET ab_active = ?1, updated_at = ?2 WHERE id = 1",
                params![active, timestamp_text(at)?],
            )
            .context("failed to toggle ab_active")?;
        Ok(updated > 0)
    }

    fn insert_experiment(&mut self, input: &NewExperiment, at: OffsetDateTime) -> Result<i64> {
        input
            .validate()
            .map_err(|err| anyhow!("experiment validation failed: {err}"))?;
        let split_a = input
            .effective_split()
            .map_err(|err| anyhow!("experiment validation failed: {err}"))?;
        let now = timestamp_text(at)?;

        let tx = self
            .conn
            .transaction()
            .context("failed to start experiment transaction")?;

        tx.execute(
            "INSERT INTO ab_experiments(name, description, goal, status, split_a, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![
                input.name.trim(),
                input.description,
                input.goal,
                ExperimentStatus::Draft.as_str(),
                i64::from(split_a),
                now,
            ],
        )
        .context("failed to insert experiment")?;
        let experiment_id = tx.last_insert_rowid();

        insert_variants(&tx, experiment_id, input, &now)?;

        tx.commit()
            .context("failed to commit experiment transaction")?;
        Ok(experiment_id)
    }

    fn get_experiment(&self, experiment_id: i64) -> Result<Option<Experiment>> {
        self.conn
            .query_row(
                &format!("SELECT {EXPERIMENT_COLUMNS} FROM ab_experiments WHERE id = ?1"),
                params![experiment_id],
                parse_experiment_row,
            )
            .optional()
            .with_context(|| format!("failed to read experiment {experiment_id}"))
    }

    fn list_experiments(&self, status: Option<ExperimentStatus>) -> Result<Vec<Experiment>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {EXPERIMENT_COLUMNS} FROM ab_experiments
             WHERE (?1 IS NULL OR status = ?1)
             ORDER BY id DESC"
        ))?;
        let rows = stmt.query_map(
            params![status.map(ExperimentStatus::as_str)],
            parse_experiment_row,
        )?;
        collect_rows(rows)
    }

    fn set_experiment_status(
        &self,
        experiment_id: i64,
        status: ExperimentStatus,
        at: OffsetDateTime,
    ) -> Result<bool> {
        let updated = self
            .conn
            .execute(
                "UPDATE ab_experiments SET
                    status = ?2,
                    updated_at = ?3,
                    start_date = CASE WHEN ?2 = 'running' THEN COALESCE(start_date, ?3) ELSE start_date END,
                    end_date = CASE WHEN ?2 = 'completed' THEN COALESCE(end_date, ?3) ELSE end_date END
                 WHERE id = ?1",
                params![experiment_id, status.as_str(), timestamp_text(at)?],
            )
            .with_context(|| format!("failed to set status of experiment {experiment_id}"))?;
        Ok(updated > 0)
    }

    fn count_experiments_with_status(&self, status: ExperimentStatus) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM ab_experiments WHERE status = ?1",
                params![status.as_str()],
                |row| row.get(0),
            )
            .context("failed to count experiments by status")?;
        u64::try_from(count).with_context(|| format!("invalid experiment count: {count}"))
    }

    fn list_variants(&self, experiment_id: Option<i64>) -> Result<Vec<Variant>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {VARIANT_COLUMNS} FROM ab_variants
             WHERE (?1 IS NULL OR experiment_id = ?1)
             ORDER BY experiment_id ASC, variant_key ASC"
        ))?;
        let rows = stmt.query_map(params![experiment_id], parse_variant_row)?;
        collect_rows(rows)
    }

    fn record_event(&mut self, input: &EventInput) -> Result<Option<Event>> {
        let occurred_at = timestamp_text(input.occurred_at)?;

        let tx = self
            .conn
            .transaction()
            .context("failed to start event transaction")?;

        let updated = bump_counter(
            &tx,
            input.experiment_id,
            &input.variant_key,
            input.event_type,
            &occurred_at,
        )?;

        if !updated {
            tx.rollback()
                .context("failed to roll back event transaction")?;
            return Ok(None);
        }

        let event_id = Ulid::new();
        tx.execute(
            "INSERT INTO ab_events(
                event_id, experiment_id, variant_key, event_type,
                user_hash, device_type, timestamp
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                event_id.to_string(),
                input.experiment_id,
                input.variant_key,
                input.event_type.as_str(),
                input.user_hash,
                input.device_type,
                occurred_at,
            ],
        )
        .context("failed to append ab event")?;

        let event_seq = tx.last_insert_rowid();
        tx.commit().context("failed to commit event transaction")?;

        Ok(Some(Event {
            event_seq,
            event_id,
            experiment_id: input.experiment_id,
            variant_key: input.variant_key.clone(),
            event_type: input.event_type,
            user_hash: input.user_hash.clone(),
            device_type: input.device_type.clone(),
            timestamp: input.occurred_at,
        }))
    }

    fn increment_variant_counter(
        &self,
        experiment_id: i64,
        variant_key: &str,
        event_type: EventType,
    ) -> Result<bool> {
        bump_counter(
            &self.conn,
            experiment_id,
            variant_key,
            event_type,
            &timestamp_text(now_utc())?,
        )
    }

    fn list_events(&self, experiment_id: Option<i64>, limit: usize) -> Result<Vec<Event>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM ab_events
             WHERE (?1 IS NULL OR experiment_id = ?1)
             ORDER BY event_seq DESC
             LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![experiment_id, limit], parse_event_row)?;
        collect_rows(rows)
    }
}

fn insert_variants(
    tx: &Transaction<'_>,
    experiment_id: i64,
    input: &NewExperiment,
    now: &str,
) -> Result<()> {
    for (index, variant) in input.variants.iter().enumerate() {
        let key = variant_key_for_index(index)
            .ok_or_else(|| anyhow!("no variant key available for position {index}"))?;
        tx.execute(
            "INSERT INTO ab_variants(
                experiment_id, variant_key, title, subtitle, description,
                button_text, button_link, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                experiment_id,
                key,
                variant.title,
                variant.subtitle,
                variant.description,
                variant.button_text,
                variant.button_link,
                now,
            ],
        )
        .with_context(|| format!("failed to insert variant {key}"))?;
    }
    Ok(())
}

/// Single-statement increment of the counter matching `event_type`. Returns
/// `false` when no variant row matches.
fn bump_counter(
    conn: &Connection,
    experiment_id: i64,
    variant_key: &str,
    event_type: EventType,
    updated_at: &str,
) -> Result<bool> {
    let column = counter_column(event_type);
    let updated = conn
        .execute(
            &format!(
                "UPDATE ab_variants SET {column} = {column} + 1, updated_at = ?3
                 WHERE experiment_id = ?1 AND variant_key = ?2"
            ),
            params![experiment_id, variant_key, updated_at],
        )
        .with_context(|| {
            format!("failed to increment {column} of variant {variant_key} ({experiment_id})")
        })?;
    Ok(updated > 0)
}

fn counter_column(event_type: EventType) -> &'static str {
    match event_type {
        EventType::Impression => "impressions",
        EventType::Click => "clicks",
        EventType::Conversion => "conversions",
    }
}

fn timestamp_text(value: OffsetDateTime) -> Result<String> {
    format_rfc3339(value).map_err(|err| anyhow!(err.to_string()))
}

fn counter_to_sql(value: u64) -> Result<i64> {
    i64::try_from(value).with_context(|| format!("value out of range for sqlite: {value}"))
}

fn invalid_column(index: usize, column_type: Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        column_type,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            message,
        )),
    )
}

fn timestamp_column(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<OffsetDateTime> {
    let raw: String = row.get(index)?;
    parse_rfc3339_utc(&raw).map_err(|err| invalid_column(index, Type::Text, err.to_string()))
}

fn optional_timestamp_column(
    row: &rusqlite::Row<'_>,
    index: usize,
) -> rusqlite::Result<Option<OffsetDateTime>> {
    let raw: Option<String> = row.get(index)?;
    raw.as_deref()
        .map(|value| {
            parse_rfc3339_utc(value)
                .map_err(|err| invalid_column(index, Type::Text, err.to_string()))
        })
        .transpose()
}

fn percentage_column(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<u8> {
    let raw: i64 = row.get(index)?;
    u8::try_from(raw)
        .ok()
        .filter(|value| *value <= 100)
        .ok_or_else(|| invalid_column(index, Type::Integer, format!("invalid percentage: {raw}")))
}

fn counter_column_value(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<u64> {
    let raw: i64 = row.get(index)?;
    u64::try_from(raw)
        .map_err(|_| invalid_column(index, Type::Integer, format!("invalid counter: {raw}")))
}

fn parse_config_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AbConfig> {
    let days_raw: i64 = row.get(4)?;
    let auto_winner_days = u32::try_from(days_raw).map_err(|_| {
        invalid_column(
            4,
            Type::Integer,
            format!("invalid auto_winner_days: {days_raw}"),
        )
    })?;

    Ok(AbConfig {
        ab_active: row.get(0)?,
        default_split: percentage_column(row, 1)?,
        auto_winner_enabled: row.get(2)?,
        auto_winner_threshold: counter_column_value(row, 3)?,
        auto_winner_days,
        updated_at: timestamp_column(row, 5)?,
    })
}

fn parse_experiment_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Experiment> {
    let status_raw: String = row.get(4)?;
    let status = ExperimentStatus::parse(&status_raw).ok_or_else(|| {
        invalid_column(4, Type::Text, format!("invalid status: {status_raw}"))
    })?;

    Ok(Experiment {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        goal: row.get(3)?,
        status,
        split_a: percentage_column(row, 5)?,
        start_date: optional_timestamp_column(row, 6)?,
        end_date: optional_timestamp_column(row, 7)?,
        created_at: timestamp_column(row, 8)?,
        updated_at: timestamp_column(row, 9)?,
    })
}

fn parse_variant_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Variant> {
    Ok(Variant {
        id: row.get(0)?,
        experiment_id: row.get(1)?,
        variant_key: row.get(2)?,
        title: row.get(3)?,
        subtitle: row.get(4)?,
        description: row.get(5)?,
        button_text: row.get(6)?,
        button_link: row.get(7)?,
        impressions: counter_column_value(row, 8)?,
        clicks: counter_column_value(row, 9)?,
        conversions: counter_column_value(row, 10)?,
        updated_at: timestamp_column(row, 11)?,
    })
}

fn parse_event_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Event> {
    let event_id_raw: String = row.get(1)?;
    let event_type_raw: String = row.get(4)?;

    let event_id = Ulid::from_string(&event_id_raw).map_err(|_| {
        invalid_column(
            1,
            Type::Text,
            format!("invalid event_id ULID: {event_id_raw}"),
        )
    })?;
    let event_type = EventType::parse(&event_type_raw).ok_or_else(|| {
        invalid_column(
            4,
            Type::Text,
            format!("invalid event_type: {event_type_raw}"),
        )
    })?;

    Ok(Event {
        event_seq: row.get(0)?,
        event_id,
        experiment_id: row.get(2)?,
        variant_key: row.get(3)?,
        event_type,
        user_hash: row.get(5)?,
        device_type: row.get(6)?,
        timestamp: timestamp_column(row, 7)?,
    })
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
