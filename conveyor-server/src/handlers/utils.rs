use conveyor_job_queue::{JobId, JobState};

use crate::error::ApiError;

pub fn parse_positive_usize(
    raw: Option<&String>,
    fallback: usize,
    field: &str,
) -> Result<usize, ApiError> {
    match raw {
        Some(value) => {
            let parsed = value.parse::<usize>().map_err(|_| {
                ApiError::bad_request(format!("{field} must be a positive integer"))
            })?;
            if parsed == 0 {
                return Err(ApiError::bad_request(format!("{field} must be at least 1")));
            }
            Ok(parsed)
        }
        None => Ok(fallback),
    }
}

/// Comma separated query values, blanks dropped.
pub fn split_csv(raw: Option<&String>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(ToOwned::to_owned)
            .collect()
    })
    .unwrap_or_default()
}

pub fn parse_job_id(raw: &str) -> Result<JobId, ApiError> {
    raw.parse::<JobId>()
        .map_err(|_| ApiError::bad_request(format!("invalid job id: {raw}")))
}

pub fn parse_states(raw: Option<&String>) -> Result<Vec<JobState>, ApiError> {
    split_csv(raw)
        .iter()
        .map(|s| {
            s.parse::<JobState>()
                .map_err(|_| ApiError::bad_request(format!("unknown job state: {s}")))
        })
        .collect()
}

pub fn parse_bool(raw: Option<&String>, field: &str) -> Result<Option<bool>, ApiError> {
    match raw.map(|s| s.to_ascii_lowercase()) {
        None => Ok(None),
        Some(v) if v == "true" || v == "1" => Ok(Some(true)),
        Some(v) if v == "false" || v == "0" => Ok(Some(false)),
        Some(_) => Err(ApiError::bad_request(format!("{field} must be true or false"))),
    }
}
