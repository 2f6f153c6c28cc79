use crate::db::models::UpCondition;

/// What a probe observed from a target that answered.
#[derive(Debug, Clone, Copy)]
pub struct ObservedResponse<'a> {
    pub status_code: u16,
    pub latency_ms: u64,
    /// Only read when some condition inspects the body.
    pub body: Option<&'a str>,
}

const DEFAULT_UP_RANGE: UpCondition = UpCondition::StatusCodeRange { min: 200, max: 299 };

pub fn needs_body(conditions: &[UpCondition]) -> bool {
    conditions
        .iter()
        .any(|c| matches!(c, UpCondition::BodyContains { .. }))
}

/// Checks every condition in order; `Err` carries the first violation.
/// An empty list means "status in 200..=299".
pub fn check(conditions: &[UpCondition], observed: &ObservedResponse<'_>) -> Result<(), String> {
    let defaults = [DEFAULT_UP_RANGE];
    let effective = if conditions.is_empty() {
        &defaults[..]
    } else {
        conditions
    };
    effective
        .iter()
        .try_for_each(|condition| check_one(condition, observed))
}

fn check_one(condition: &UpCondition, observed: &ObservedResponse<'_>) -> Result<(), String> {
    match condition {
        UpCondition::StatusCodeRange { min, max } => {
            if (*min..=*max).contains(&observed.status_code) {
                Ok(())
            } else {
                Err(format!(
                    "status {} outside {min}..={max}",
                    observed.status_code
                ))
            }
        }
        UpCondition::BodyContains { text } => match observed.body {
            Some(body) if body.contains(text.as_str()) => Ok(()),
            Some(_) => Err(format!("body does not contain '{text}'")),
            None => Err("response body unavailable".to_string()),
        },
        UpCondition::LatencyBelow { max_ms } => {
            if observed.latency_ms < *max_ms {
                Ok(())
            } else {
                Err(format!(
                    "latency {}ms not below {max_ms}ms",
                    observed.latency_ms
                ))
            }
        }
    }
}
