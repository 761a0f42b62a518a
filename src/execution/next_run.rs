//! Next-run-time calculation for cron schedules.
//!
//! Schedules carry standard 5-field Unix cron expressions (minute, hour,
//! day-of-month, month, day-of-week). The `cron` crate wants 6 fields with
//! seconds first and numbers days of the week 1-7 from Sunday, so
//! expressions are normalised before parsing.

use crate::core::{Schedule, TriggerType};
use chrono::{DateTime, Utc};
use cron::Schedule as CronSchedule;
use std::str::FromStr;
use tracing::warn;

const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

fn day_name(token: &str) -> String {
    match token.parse::<usize>() {
        Ok(7) => "SUN".to_string(),
        Ok(n) if n < 7 => DAY_NAMES[n].to_string(),
        _ => token.to_string(),
    }
}

/// Rewrite numeric Unix day-of-week values as names, which both dialects
/// agree on.
fn normalize_day_of_week(field: &str) -> String {
    field
        .split(',')
        .map(|item| {
            let (range, step) = match item.split_once('/') {
                Some((range, step)) => (range, Some(step)),
                None => (item, None),
            };
            let rewritten = match range.split_once('-') {
                Some(("0", "7")) => "*".to_string(),
                // A range ending on 7 wraps back to Sunday, which the names cannot express
                Some((start, "7")) if step.is_none() && start != "0" && start != "7" => {
                    format!("{}-SAT,SUN", day_name(start))
                }
                Some((start, end)) => format!("{}-{}", day_name(start), day_name(end)),
                None if range == "*" || range == "?" => range.to_string(),
                None => day_name(range),
            };
            match step {
                Some(step) => format!("{}/{}", rewritten, step),
                None => rewritten,
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Convert a 5-field Unix cron expression to the crate's 6-field format
fn normalize_cron_expr(cron_expr: &str) -> String {
    let fields: Vec<&str> = cron_expr.split_whitespace().collect();
    if fields.len() == 5 {
        format!(
            "0 {} {} {} {} {}",
            fields[0],
            fields[1],
            fields[2],
            fields[3],
            normalize_day_of_week(fields[4])
        )
    } else {
        cron_expr.to_string()
    }
}

fn parse(cron_expr: &str) -> Result<CronSchedule, String> {
    if cron_expr.split_whitespace().count() != 5 {
        return Err(format!(
            "Invalid cron expression '{}': expected 5 fields",
            cron_expr
        ));
    }
    CronSchedule::from_str(&normalize_cron_expr(cron_expr))
        .map_err(|e| format!("Invalid cron expression '{}': {}", cron_expr, e))
}

/// Validate a cron expression without computing the next run
pub fn validate_cron(cron_expr: &str) -> Result<(), String> {
    parse(cron_expr).map(|_| ())
}

/// Next occurrence strictly after `after`
pub fn next_occurrence(cron_expr: &str, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, String> {
    Ok(parse(cron_expr)?.after(&after).next())
}

/// Next time the schedule should run, relative to `now`.
///
/// Manual schedules never run on their own. A missing or malformed cron
/// expression is logged and yields `None` rather than an error.
pub fn next_run_after(schedule: &Schedule, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match schedule.trigger_type {
        TriggerType::Manual => None,
        TriggerType::Cron => {
            let Some(expression) = schedule.cron_expression.as_deref() else {
                warn!(schedule_id = %schedule.id, "Cron schedule '{}' has no cron expression", schedule.name);
                return None;
            };
            match next_occurrence(expression, now) {
                Ok(next) => next,
                Err(e) => {
                    warn!(schedule_id = %schedule.id, "Schedule '{}': {}", schedule.name, e);
                    None
                }
            }
        }
    }
}

/// Next time the schedule should run from the current time
pub fn calculate_next_run_time(schedule: &Schedule) -> Option<DateTime<Utc>> {
    next_run_after(schedule, Utc::now())
}
