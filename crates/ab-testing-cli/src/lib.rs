//! Operator command surface for the A/B testing store.
//!
//! Every command prints JSON on stdout (or a table where noted) and exits
//! non-zero on error. [`run_cli`] is the embeddable entrypoint.

use std::path::PathBuf;

use ab_testing_api::{AbTestingApi, StartRequest, StopRequest, DEFAULT_EVENT_LIMIT};
use ab_testing_core::{
    AssignmentMode, ConfigUpdate, NewExperiment, NewVariant, RecordEventRequest, StatsReport,
    Visitor,
};
use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Debug, Parser)]
#[command(name = "abx")]
#[command(about = "A/B testing administration CLI")]
pub struct Cli {
    #[arg(long, env = "ABX_DB", default_value = "./ab_testing.sqlite3")]
    db: PathBuf,

    #[arg(
        long,
        env = "ABX_ASSIGNMENT_MODE",
        value_enum,
        default_value_t = AssignmentModeArg::Random
    )]
    assignment_mode: AssignmentModeArg,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Config {
        #[command(subcommand)]
        command: Box<ConfigCommand>,
    },
    Experiment {
        #[command(subcommand)]
        command: Box<ExperimentCommand>,
    },
    /// Start one experiment, or resume every paused one.
    Start(StartArgs),
    /// Pause or complete one experiment, or every running one.
    Stop(StopArgs),
    /// Assign a variant the way `GET /api/ab/variant` does.
    Assign(VisitorArgs),
    Event {
        #[command(subcommand)]
        command: Box<EventCommand>,
    },
    Events {
        #[command(subcommand)]
        command: EventsCommand,
    },
    Stats(StatsArgs),
    Winner {
        #[command(subcommand)]
        command: WinnerCommand,
    },
}

impl Command {
    fn label(&self) -> &'static str {
        match self {
            Self::Db { .. } => "db",
            Self::Config { .. } => "config",
            Self::Experiment { .. } => "experiment",
            Self::Start(_) => "start",
            Self::Stop(_) => "stop",
            Self::Assign(_) => "assign",
            Self::Event { .. } => "event",
            Self::Events { .. } => "events",
            Self::Stats(_) => "stats",
            Self::Winner { .. } => "winner",
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum DbCommand {
    Migrate,
    Status,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    Show,
    Set(ConfigSetArgs),
}

#[derive(Debug, Args)]
pub struct ConfigSetArgs {
    #[arg(long)]
    ab_active: Option<bool>,
    #[arg(long)]
    default_split: Option<i64>,
    #[arg(long)]
    auto_winner_enabled: Option<bool>,
    #[arg(long)]
    auto_winner_threshold: Option<i64>,
    #[arg(long)]
    auto_winner_days: Option<i64>,
}

#[derive(Debug, Subcommand)]
pub enum ExperimentCommand {
    Create(ExperimentCreateArgs),
    List(ExperimentListArgs),
}

#[derive(Debug, Args)]
pub struct ExperimentCreateArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    description: Option<String>,
    #[arg(long)]
    goal: Option<String>,
    #[arg(long)]
    split_a: Option<i64>,
    /// Variant as JSON, e.g. `{"title":"...","button_text":"..."}`. Repeat
    /// once per variant; keys are assigned A, B, C, ... in order.
    #[arg(long = "variant", required = true)]
    variants: Vec<String>,
}

#[derive(Debug, Args)]
pub struct ExperimentListArgs {
    #[arg(long)]
    status: Option<String>,
}

#[derive(Debug, Args)]
pub struct StartArgs {
    #[arg(long)]
    experiment_id: Option<i64>,
}

#[derive(Debug, Args)]
pub struct StopArgs {
    #[arg(long)]
    experiment_id: Option<i64>,
    #[arg(long, value_enum)]
    status: Option<StopStatusArg>,
}

#[derive(Debug, Args)]
pub struct VisitorArgs {
    #[arg(long)]
    user_agent: Option<String>,
    #[arg(long)]
    ip: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum EventCommand {
    Record(EventRecordArgs),
}

#[derive(Debug, Args)]
pub struct EventRecordArgs {
    #[arg(long)]
    experiment_id: i64,
    #[arg(long)]
    variant_key: String,
    #[arg(long, value_enum)]
    event_type: EventTypeArg,
    #[arg(long)]
    device_type: Option<String>,
    #[command(flatten)]
    visitor: VisitorArgs,
}

#[derive(Debug, Subcommand)]
pub enum EventsCommand {
    List(EventsListArgs),
}

#[derive(Debug, Args)]
pub struct EventsListArgs {
    #[arg(long)]
    experiment_id: Option<i64>,
    #[arg(long, default_value_t = DEFAULT_EVENT_LIMIT)]
    limit: usize,
}

#[derive(Debug, Args)]
pub struct StatsArgs {
    #[arg(long)]
    experiment_id: Option<i64>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum WinnerCommand {
    Show(WinnerArgs),
    Apply(WinnerArgs),
}

#[derive(Debug, Args)]
pub struct WinnerArgs {
    #[arg(long)]
    experiment_id: i64,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum AssignmentModeArg {
    Random,
    Fingerprint,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum StopStatusArg {
    Paused,
    Completed,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum EventTypeArg {
    Click,
    Conversion,
}

/// Executes a fully parsed CLI invocation.
///
/// # Errors
/// Returns an error when the database cannot be opened or migrated, or the
/// requested operation fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    tracing::debug!(
        command = cli.command.label(),
        db = %cli.db.display(),
        "dispatching command"
    );
    let api = AbTestingApi::new(cli.db).with_assignment_mode(map_mode(cli.assignment_mode));

    match cli.command {
        Command::Db { command } => run_db(command, &api),
        command => {
            api.migrate()?;
            run_command(command, &api)
        }
    }
}

fn run_db(command: DbCommand, api: &AbTestingApi) -> Result<()> {
    let status = match command {
        DbCommand::Migrate => api.migrate()?,
        DbCommand::Status => api.schema_status()?,
    };
    print_json(&status)
}

fn run_command(command: Command, api: &AbTestingApi) -> Result<()> {
    match command {
        Command::Db { command } => run_db(command, api),
        Command::Config { command } => match *command {
            ConfigCommand::Show => print_json(&api.config()?),
            ConfigCommand::Set(args) => {
                let update = ConfigUpdate {
                    ab_active: args.ab_active,
                    default_split: args.default_split,
                    auto_winner_enabled: args.auto_winner_enabled,
                    auto_winner_threshold: args.auto_winner_threshold,
                    auto_winner_days: args.auto_winner_days,
                };
                if update.is_empty() {
                    return Err(anyhow!("config set requires at least one field"));
                }
                print_json(&api.update_config(&update)?)
            }
        },
        Command::Experiment { command } => match *command {
            ExperimentCommand::Create(args) => {
                let input = NewExperiment {
                    name: args.name,
                    description: args.description,
                    goal: args.goal,
                    split_a: args.split_a,
                    variants: args
                        .variants
                        .iter()
                        .map(|raw| parse_variant_json(raw))
                        .collect::<Result<Vec<_>>>()?,
                };
                print_json(&api.create_experiment(&input)?)
            }
            ExperimentCommand::List(args) => {
                print_json(&api.list_experiments(args.status.as_deref())?)
            }
        },
        Command::Start(args) => print_json(&api.start(&StartRequest {
            experiment_id: args.experiment_id,
        })?),
        Command::Stop(args) => print_json(&api.stop(&StopRequest {
            experiment_id: args.experiment_id,
            status: args.status.map(|status| stop_status_str(status).to_string()),
        })?),
        Command::Assign(args) => print_json(&api.assign(&visitor_from_args(&args))?),
        Command::Event { command } => match *command {
            EventCommand::Record(args) => {
                let request = RecordEventRequest {
                    experiment_id: Some(args.experiment_id),
                    variant_key: Some(args.variant_key),
                    event_type: Some(event_type_str(args.event_type).to_string()),
                    device_type: args.device_type,
                };
                print_json(&api.record_event(&request, &visitor_from_args(&args.visitor))?)
            }
        },
        Command::Events { command } => match command {
            EventsCommand::List(args) => {
                print_json(&api.list_events(args.experiment_id, args.limit)?)
            }
        },
        Command::Stats(args) => {
            let report = api.stats(args.experiment_id)?;
            if args.json {
                print_json(&report)
            } else {
                print_stats_table(&report);
                Ok(())
            }
        }
        Command::Winner { command } => match command {
            WinnerCommand::Show(args) => print_json(&api.evaluate_winner(args.experiment_id)?),
            WinnerCommand::Apply(args) => print_json(&api.apply_winner(args.experiment_id)?),
        },
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_variant_json(raw: &str) -> Result<NewVariant> {
    serde_json::from_str(raw).with_context(|| format!("invalid --variant JSON: {raw}"))
}

fn visitor_from_args(args: &VisitorArgs) -> Visitor {
    Visitor::from_headers(args.user_agent.as_deref(), args.ip.as_deref(), None)
}

fn map_mode(value: AssignmentModeArg) -> AssignmentMode {
    match value {
        AssignmentModeArg::Random => AssignmentMode::Random,
        AssignmentModeArg::Fingerprint => AssignmentMode::Fingerprint,
    }
}

fn stop_status_str(value: StopStatusArg) -> &'static str {
    match value {
        StopStatusArg::Paused => "paused",
        StopStatusArg::Completed => "completed",
    }
}

fn event_type_str(value: EventTypeArg) -> &'static str {
    match value {
        EventTypeArg::Click => "click",
        EventTypeArg::Conversion => "conversion",
    }
}

fn print_stats_table(report: &StatsReport) {
    println!(
        "{:<13} {:<7} {:>11} {:>8} {:>11} {:>8} {:>10}",
        "experiment_id", "variant", "impressions", "clicks", "conversions", "ctr", "conv_rate"
    );
    println!("{}", "-".repeat(84));

    for item in &report.stats {
        println!(
            "{:<13} {:<7} {:>11} {:>8} {:>11} {:>7.2}% {:>9.2}%",
            item.variant.experiment_id,
            item.variant.variant_key,
            item.variant.impressions,
            item.variant.clicks,
            item.variant.conversions,
            item.ctr,
            item.conversion_rate
        );
    }

    println!("{}", "-".repeat(84));
    println!(
        "{:<13} {:<7} {:>11} {:>8} {:>11} {:>7.2}% {:>9.2}%",
        "total",
        report.count,
        report.totals.impressions,
        report.totals.clicks,
        report.totals.conversions,
        report.totals.ctr,
        report.totals.conversion_rate
    );
}

#[cfg(test)]
mod tests {
    #![allow(clippy::manual_let_else)]

    use super::*;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn execute_cli(args: Vec<String>) -> Result<()> {
        let cli = Cli::try_parse_from(args)?;
        run_cli(cli)
    }

    fn temp_db() -> (PathBuf, String) {
        let db_path =
            std::env::temp_dir().join(format!("abx-cli-{}.sqlite3", ulid::Ulid::new()));
        let db_path_str = match db_path.to_str() {
            Some(value) => value.to_string(),
            None => panic!("temp db path must be valid UTF-8"),
        };
        (db_path, db_path_str)
    }

    fn args(db: &str, rest: &[&str]) -> Vec<String> {
        let mut all = vec!["abx".to_string(), "--db".to_string(), db.to_string()];
        all.extend(rest.iter().map(|value| (*value).to_string()));
        all
    }

    #[test]
    fn command_labels_match_subcommand_names() {
        let cli = match Cli::try_parse_from(["abx", "winner", "show", "--experiment-id", "3"]) {
            Ok(cli) => cli,
            Err(err) => panic!("failed to parse: {err}"),
        };
        assert_eq!(cli.command.label(), "winner");

        let cli = match Cli::try_parse_from(["abx", "events", "list"]) {
            Ok(cli) => cli,
            Err(err) => panic!("failed to parse: {err}"),
        };
        assert_eq!(cli.command.label(), "events");
    }

    #[test]
    fn variant_json_accepts_partial_fields() {
        let variant = must(parse_variant_json(r#"{"title":"Hero A"}"#));
        assert_eq!(variant.title.as_deref(), Some("Hero A"));
        assert_eq!(variant.button_link, None);
        assert!(parse_variant_json("{").is_err());
    }

    #[test]
    fn full_lifecycle_runs_against_fresh_database() {
        let (db_path, db) = temp_db();

        must(execute_cli(args(&db, &["db", "migrate"])));
        must(execute_cli(args(
            &db,
            &[
                "experiment",
                "create",
                "--name",
                "Hero",
                "--variant",
                r#"{"title":"A"}"#,
                "--variant",
                r#"{"title":"B"}"#,
            ],
        )));
        must(execute_cli(args(&db, &["start", "--experiment-id", "1"])));
        must(execute_cli(args(&db, &["assign", "--user-agent", "Mozilla/5.0"])));
        must(execute_cli(args(
            &db,
            &[
                "event",
                "record",
                "--experiment-id",
                "1",
                "--variant-key",
                "A",
                "--event-type",
                "click",
            ],
        )));
        must(execute_cli(args(&db, &["stats"])));
        must(execute_cli(args(&db, &["winner", "show", "--experiment-id", "1"])));
        must(execute_cli(args(&db, &["stop", "--status", "completed"])));

        let api = AbTestingApi::new(db_path.clone());
        let config = match api.config() {
            Ok(value) => value,
            Err(err) => panic!("failed to read config: {err}"),
        };
        assert!(!config.ab_active);
        let report = match api.stats(Some(1)) {
            Ok(value) => value,
            Err(err) => panic!("failed to read stats: {err}"),
        };
        assert_eq!(report.totals.clicks, 1);
        assert_eq!(report.totals.impressions, 1);

        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn invalid_inputs_fail_without_side_effects() {
        let (db_path, db) = temp_db();

        assert!(execute_cli(args(&db, &["config", "set", "--default-split", "101"])).is_err());
        assert!(execute_cli(args(&db, &["config", "set"])).is_err());
        assert!(execute_cli(args(&db, &["start", "--experiment-id", "42"])).is_err());
        assert!(execute_cli(args(
            &db,
            &[
                "event",
                "record",
                "--experiment-id",
                "1",
                "--variant-key",
                "A",
                "--event-type",
                "impression",
            ],
        ))
        .is_err());

        let api = AbTestingApi::new(db_path.clone());
        let config = match api.config() {
            Ok(value) => value,
            Err(err) => panic!("failed to read config: {err}"),
        };
        assert_eq!(config.default_split, 50);
        assert!(!config.ab_active);

        let _ = std::fs::remove_file(&db_path);
    }
}
