use std::fmt::Write;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;

use crate::error::QueryError;
use crate::models::{QueryRequest, ResolvedQuery, TimeRange};

/// Body of a query as stored by the query editor.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryModel {
    query_text: String,
}

/// Parse the query body and substitute the `$from`, `$to` and `$interval`
/// macros. Substitution is plain text replacement, values are not bound
/// as parameters.
pub fn resolve(
    ref_id: &str,
    query_json: &[u8],
    time_range: &TimeRange,
    interval: Duration,
) -> Result<ResolvedQuery, QueryError> {
    let model: QueryModel = serde_json::from_slice(query_json)
        .map_err(|e| QueryError::MalformedQuery(e.to_string()))?;

    let text = model
        .query_text
        .replace("$from", &render_time(&time_range.from))
        .replace("$to", &render_time(&time_range.to))
        .replace("$interval", &render_interval(interval));

    if text.is_empty() {
        return Err(QueryError::EmptyQuery);
    }

    Ok(ResolvedQuery {
        ref_id: ref_id.to_string(),
        text,
    })
}

pub fn resolve_request(request: &QueryRequest) -> Result<ResolvedQuery, QueryError> {
    resolve(
        &request.ref_id,
        &request.json,
        &request.time_range,
        request.interval,
    )
}

pub fn render_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Render a duration as `<h>h<m>m<s>s`, e.g. `5m0s`, `1h0m0s` or `1.5s`.
/// Durations under a second use `ms`, `µs` or `ns`.
pub fn render_interval(interval: Duration) -> String {
    let nanos = interval.as_nanos();
    if nanos == 0 {
        return "0s".to_string();
    }

    if nanos < 1_000_000_000 {
        let (scale, unit) = if nanos < 1_000 {
            (1, "ns")
        } else if nanos < 1_000_000 {
            (1_000, "µs")
        } else {
            (1_000_000, "ms")
        };
        return format!("{}{}", fraction(nanos, scale), unit);
    }

    let total_secs = interval.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs / 60) % 60;
    let second_nanos = u128::from(total_secs % 60) * 1_000_000_000
        + u128::from(interval.subsec_nanos());

    let mut out = String::new();
    if hours > 0 {
        let _ = write!(out, "{}h", hours);
    }
    if hours > 0 || minutes > 0 {
        let _ = write!(out, "{}m", minutes);
    }
    let _ = write!(out, "{}s", fraction(second_nanos, 1_000_000_000));
    out
}

fn fraction(value: u128, scale: u128) -> String {
    let whole = value / scale;
    let rest = value % scale;
    if rest == 0 {
        return whole.to_string();
    }

    let width = scale.to_string().len() - 1;
    let digits = format!("{:0width$}", rest, width = width);
    format!("{}.{}", whole, digits.trim_end_matches('0'))
}
