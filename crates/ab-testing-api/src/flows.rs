//! Request flows expressed against [`ExperimentRepository`], independent of
//! how the repository is opened or where time and randomness come from.

use ab_testing_core::{
    aggregate_stats, choose_variant, evaluate_winner, AbConfig, Assignment, ConfigUpdate,
    EventInput, EventType, ExperimentRepository, ExperimentStatus, NewExperiment,
    RecordEventRequest, StatsReport, VariantPayload, Visitor, WinnerEvaluation,
};
use time::OffsetDateTime;

use crate::{
    ApiError, CreatedExperiment, ExperimentList, ExperimentWithVariants, RecordedEvent,
    StartRequest, StartResult, StopRequest, StopResult,
};

pub const INACTIVE_MESSAGE: &str = "A/B testing is not active";
pub const NO_RUNNING_EXPERIMENT_MESSAGE: &str = "no running experiment";

/// Reads the config singleton; a missing row is reported as not found.
pub fn load_config<R: ExperimentRepository>(repo: &R) -> Result<AbConfig, ApiError> {
    repo.get_config()?.ok_or_else(config_not_initialized)
}

pub fn update_config<R: ExperimentRepository>(
    repo: &R,
    update: &ConfigUpdate,
    now: OffsetDateTime,
) -> Result<AbConfig, ApiError> {
    let current = load_config(repo)?;
    if update.is_empty() {
        return Ok(current);
    }
    let next = update.apply_to(&current, now)?;
    repo.put_config(&next)?;
    Ok(next)
}

pub fn assign<R, B>(
    repo: &mut R,
    visitor: &Visitor,
    now: OffsetDateTime,
    bucket: B,
) -> Result<Assignment, ApiError>
where
    R: ExperimentRepository,
    B: FnOnce(&Visitor) -> u8,
{
    let config = load_config(repo)?;
    if !config.ab_active {
        return Ok(Assignment::inactive(INACTIVE_MESSAGE));
    }

    let Some(experiment) = repo
        .list_experiments(Some(ExperimentStatus::Running))?
        .into_iter()
        .find(|experiment| experiment.is_live_at(now))
    else {
        return Ok(Assignment::inactive(NO_RUNNING_EXPERIMENT_MESSAGE));
    };

    let variants = repo.list_variants(Some(experiment.id))?;
    let split = experiment.effective_split(&config);
    let variant = choose_variant(&variants, split, bucket(visitor))
        .ok_or_else(|| {
            ApiError::NotFound(format!("experiment {} has no variants", experiment.id))
        })?
        .clone();

    let impression = EventInput {
        experiment_id: experiment.id,
        variant_key: variant.variant_key.clone(),
        event_type: EventType::Impression,
        user_hash: visitor.user_hash.clone(),
        device_type: visitor.device_type.clone(),
        occurred_at: now,
    };
    if repo.record_event(&impression)?.is_none() {
        return Err(ApiError::NotFound(format!(
            "variant {} of experiment {} not found",
            variant.variant_key, experiment.id
        )));
    }

    Ok(Assignment {
        active: true,
        experiment_id: Some(experiment.id),
        experiment_name: Some(experiment.name),
        variant: Some(VariantPayload::from(&variant)),
        split_a: Some(split),
        device_type: Some(visitor.device_type.clone()),
        message: None,
    })
}

pub fn record_event<R: ExperimentRepository>(
    repo: &mut R,
    request: &RecordEventRequest,
    visitor: &Visitor,
    now: OffsetDateTime,
) -> Result<RecordedEvent, ApiError> {
    let validated = request.validate()?;
    let device_type = validated
        .device_type
        .unwrap_or_else(|| visitor.device_type.clone());

    let input = EventInput {
        experiment_id: validated.experiment_id,
        variant_key: validated.variant_key,
        event_type: validated.event_type,
        user_hash: visitor.user_hash.clone(),
        device_type,
        occurred_at: now,
    };

    let event = repo.record_event(&input)?.ok_or_else(|| {
        ApiError::NotFound(format!(
            "variant {} of experiment {} not found",
            input.variant_key, input.experiment_id
        ))
    })?;

    Ok(RecordedEvent {
        success: true,
        message: "event recorded".to_string(),
        experiment_id: event.experiment_id,
        variant_key: event.variant_key,
        event_type: event.event_type,
        device_type: event.device_type,
    })
}

pub fn start<R: ExperimentRepository>(
    repo: &R,
    request: &StartRequest,
    now: OffsetDateTime,
) -> Result<StartResult, ApiError> {
    load_config(repo)?;

    let started = match request.experiment_id {
        Some(experiment_id) => {
            if !repo.set_experiment_status(experiment_id, ExperimentStatus::Running, now)? {
                return Err(experiment_not_found(experiment_id));
            }
            vec![experiment_id]
        }
        None => {
            let mut resumed = Vec::new();
            for experiment in repo.list_experiments(Some(ExperimentStatus::Paused))? {
                repo.set_experiment_status(experiment.id, ExperimentStatus::Running, now)?;
                resumed.push(experiment.id);
            }
            resumed
        }
    };

    if !repo.set_ab_active(true, now)? {
        return Err(config_not_initialized());
    }

    Ok(StartResult {
        success: true,
        experiment_id: request.experiment_id,
        started,
        ab_active: true,
    })
}

pub fn stop<R: ExperimentRepository>(
    repo: &R,
    request: &StopRequest,
    now: OffsetDateTime,
) -> Result<StopResult, ApiError> {
    let target = ExperimentStatus::parse_stop_target(request.status.as_deref())?;
    let config = load_config(repo)?;

    let stopped = match request.experiment_id {
        Some(experiment_id) => {
            if !repo.set_experiment_status(experiment_id, target, now)? {
                return Err(experiment_not_found(experiment_id));
            }
            vec![experiment_id]
        }
        None => {
            let mut stopped = Vec::new();
            for experiment in repo.list_experiments(Some(ExperimentStatus::Running))? {
                repo.set_experiment_status(experiment.id, target, now)?;
                stopped.push(experiment.id);
            }
            stopped
        }
    };

    let active_experiments = repo.count_experiments_with_status(ExperimentStatus::Running)?;
    let ab_active = if active_experiments == 0 {
        if !repo.set_ab_active(false, now)? {
            return Err(config_not_initialized());
        }
        false
    } else {
        config.ab_active
    };

    Ok(StopResult {
        success: true,
        experiment_id: request.experiment_id,
        status: target,
        stopped,
        ab_active,
        active_experiments,
    })
}

pub fn stats<R: ExperimentRepository>(
    repo: &R,
    experiment_id: Option<i64>,
) -> Result<StatsReport, ApiError> {
    if let Some(id) = experiment_id {
        if repo.get_experiment(id)?.is_none() {
            return Err(experiment_not_found(id));
        }
    }
    Ok(aggregate_stats(repo.list_variants(experiment_id)?))
}

pub fn create_experiment<R: ExperimentRepository>(
    repo: &mut R,
    input: &NewExperiment,
    now: OffsetDateTime,
) -> Result<CreatedExperiment, ApiError> {
    input.validate()?;
    let experiment_id = repo.insert_experiment(input, now)?;
    Ok(CreatedExperiment {
        success: true,
        message: "experiment created".to_string(),
        experiment_id,
    })
}

pub fn list_experiments<R: ExperimentRepository>(
    repo: &R,
    status: Option<&str>,
) -> Result<ExperimentList, ApiError> {
    let status = match status.map(str::trim).filter(|raw| !raw.is_empty()) {
        Some(raw) => Some(ExperimentStatus::parse(raw).ok_or_else(|| {
            ApiError::Validation(format!(
                "invalid status '{raw}'; allowed: draft, running, paused, completed"
            ))
        })?),
        None => None,
    };

    let mut experiments = Vec::new();
    for experiment in repo.list_experiments(status)? {
        let variants = repo.list_variants(Some(experiment.id))?;
        experiments.push(ExperimentWithVariants {
            experiment,
            variants,
        });
    }

    Ok(ExperimentList {
        count: experiments.len(),
        experiments,
    })
}

pub fn evaluate<R: ExperimentRepository>(
    repo: &R,
    experiment_id: i64,
    now: OffsetDateTime,
) -> Result<WinnerEvaluation, ApiError> {
    let config = load_config(repo)?;
    let experiment = repo
        .get_experiment(experiment_id)?
        .ok_or_else(|| experiment_not_found(experiment_id))?;
    let report = aggregate_stats(repo.list_variants(Some(experiment_id))?);
    Ok(evaluate_winner(&config, &experiment, &report, now))
}

/// Completes the experiment when the evaluation is eligible.
pub fn apply_winner<R: ExperimentRepository>(
    repo: &R,
    experiment_id: i64,
    now: OffsetDateTime,
) -> Result<WinnerEvaluation, ApiError> {
    let mut evaluation = evaluate(repo, experiment_id, now)?;
    if evaluation.eligible {
        stop(
            repo,
            &StopRequest {
                experiment_id: Some(experiment_id),
                status: Some(ExperimentStatus::Completed.as_str().to_string()),
            },
            now,
        )?;
        evaluation.applied = true;
    }
    Ok(evaluation)
}

fn config_not_initialized() -> ApiError {
    ApiError::NotFound("ab config is not initialized".to_string())
}

fn experiment_not_found(experiment_id: i64) -> ApiError {
    ApiError::NotFound(format!("experiment {experiment_id} not found"))
}
