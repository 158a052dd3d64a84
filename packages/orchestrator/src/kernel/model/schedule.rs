//! Schedule model: a recurring job source driven by a cron expression.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::common::{db_id, CoreError, Result};

/// Whether a fire is suppressed while a previous run of the same schedule
/// is still non-terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "execution_mode", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Fire regardless of outstanding runs.
    #[default]
    Allow,
    /// Skip the fire if a previous run is still pending/running.
    Skip,
}

#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Schedule {
    #[builder(default = db_id())]
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub name: String,

    pub cron_expr: String,
    #[builder(default = "UTC".to_string())]
    pub timezone: String,
    #[builder(default = true)]
    pub enabled: bool,

    /// Workflow payload submitted on every fire.
    pub payload: serde_json::Value,
    #[builder(default = super::job::PRIORITY_DEFAULT)]
    pub priority: i16,
    #[builder(default = "default".to_string())]
    pub environment: String,
    #[builder(default)]
    pub required_capabilities: Vec<String>,
    #[builder(default)]
    pub execution_mode: ExecutionMode,

    #[builder(default, setter(strip_option))]
    pub next_fire_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub last_fire_at: Option<DateTime<Utc>>,
    #[builder(default = 0)]
    pub run_count: i64,
    #[builder(default = 0)]
    pub failure_count: i64,

    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

impl Schedule {
    /// The first fire time strictly after `after`, in the schedule's
    /// timezone, expressed in UTC. `None` when the expression has no
    /// further occurrences.
    pub fn next_occurrence(&self, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        next_occurrence(&self.cron_expr, &self.timezone, after)
    }

    /// How many fire times fall in `(from, to]`, used to audit missed
    /// fires after downtime.
    pub fn occurrences_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<usize> {
        let tz = parse_timezone(&self.timezone)?;
        let schedule = parse_cron(&self.cron_expr)?;
        Ok(schedule
            .after(&from.with_timezone(&tz))
            .take_while(|t| t.with_timezone(&Utc) <= to)
            .count())
    }

    /// Validate expression and timezone without computing anything.
    pub fn validate(&self) -> Result<()> {
        parse_cron(&self.cron_expr)?;
        parse_timezone(&self.timezone)?;
        Ok(())
    }
}

/// Compute the next fire time for a cron expression in a timezone.
pub fn next_occurrence(
    cron_expr: &str,
    timezone: &str,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    let tz = parse_timezone(timezone)?;
    let schedule = parse_cron(cron_expr)?;
    Ok(schedule
        .after(&after.with_timezone(&tz))
        .next()
        .map(|t| t.with_timezone(&Utc)))
}

fn parse_timezone(timezone: &str) -> Result<Tz> {
    Tz::from_str(timezone).map_err(|_| CoreError::invalid(format!("unknown timezone: {timezone}")))
}

/// Parse a cron expression, accepting both the 5-field crontab form and the
/// 6/7-field form with seconds. Five fields get a `0` seconds column
/// prepended so `*/5 * * * *` means "every five minutes at :00".
fn parse_cron(expr: &str) -> Result<cron::Schedule> {
    let normalized = match expr.split_whitespace().count() {
        5 => format!("0 {expr}"),
        _ => expr.to_string(),
    };
    cron::Schedule::from_str(&normalized)
        .map_err(|e| CoreError::invalid(format!("bad cron expression {expr:?}: {e}")))
}
