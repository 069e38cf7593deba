//! Metric points and their validity rules.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::datasource::Labels;

/// Points more than this many seconds ahead of the server clock are rejected
pub const MAX_FUTURE_SECS: i64 = 300;
/// Points more than this many seconds behind the server clock are rejected
pub const MAX_PAST_SECS: i64 = 1800;

const MAX_METRIC_LEN: usize = 128;
const MAX_TAGS: usize = 20;
const MAX_SORTED_TAGS_LEN: usize = 512;

/// Value substituted for empty tag values
pub const EMPTY_TAG_VALUE: &str = "nil";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PointError {
    #[error("{0} should not be empty")]
    Empty(&'static str),

    #[error("{field} {value:?} contains reserved characters (tab, CR, LF, comma, space or '=')")]
    ReservedChar { field: &'static str, value: String },

    #[error("{field} is too long")]
    TooLong { field: &'static str },

    #[error("too many tags: {0} > {MAX_TAGS}")]
    TooManyTags(usize),

    #[error("point timestamp {timestamp} is ahead of now {now}")]
    InFuture { timestamp: i64, now: i64 },

    #[error("point timestamp {timestamp} is too old, now {now}")]
    TooOld { timestamp: i64, now: i64 },
}

impl PointError {
    /// Short label used for the rejection counter
    pub fn reason(&self) -> &'static str {
        match self {
            PointError::Empty(_) => "empty",
            PointError::ReservedChar { .. } => "reserved_char",
            PointError::TooLong { .. } | PointError::TooManyTags(_) => "too_large",
            PointError::InFuture { .. } | PointError::TooOld { .. } => "time_window",
        }
    }
}

/// Whether `s` contains one of the separator runes `\t \r \n , space =`
pub fn has_reserved_chars(s: &str) -> bool {
    s.chars()
        .any(|c| matches!(c, '\t' | '\r' | '\n' | ',' | ' ' | '='))
}

/// Map empty tag values to [`EMPTY_TAG_VALUE`]
pub fn sanitize_tags(tags: &Labels) -> Labels {
    tags.iter()
        .map(|(k, v)| {
            let v = if v.is_empty() { EMPTY_TAG_VALUE } else { v.as_str() };
            (k.clone(), v.to_string())
        })
        .collect()
}

/// `k1=v1,k2=v2` with keys in ascending order, whatever the source map type
pub fn sorted_tags<'a, I>(tags: I) -> String
where
    I: IntoIterator<Item = (&'a String, &'a String)>,
{
    let mut pairs: Vec<(&String, &String)> = tags.into_iter().collect();
    pairs.sort();
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Whether a timestamp lies inside the acceptance window around `now`
pub fn within_window(timestamp: i64, now: i64) -> bool {
    let delta = timestamp - now;
    (-MAX_PAST_SECS..=MAX_FUTURE_SECS).contains(&delta)
}

/// A single measurement: `{ident, metric, tags, time, value}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub ident: String,
    pub metric: String,
    #[serde(default)]
    pub tags: Labels,
    /// Unix seconds; non-positive means "now"
    #[serde(default)]
    pub time: i64,
    pub value: f64,
}

impl MetricPoint {
    /// Validate and normalise the point against the server clock `now`
    pub fn check_validity(&mut self, now: i64) -> Result<(), PointError> {
        if self.metric.is_empty() {
            return Err(PointError::Empty("metric"));
        }
        if self.ident.is_empty() {
            return Err(PointError::Empty("ident"));
        }
        if has_reserved_chars(&self.metric) {
            return Err(PointError::ReservedChar {
                field: "metric",
                value: self.metric.clone(),
            });
        }
        if has_reserved_chars(&self.ident) {
            return Err(PointError::ReservedChar {
                field: "ident",
                value: self.ident.clone(),
            });
        }
        if self.metric.len() > MAX_METRIC_LEN {
            return Err(PointError::TooLong { field: "metric" });
        }
        if self.tags.len() > MAX_TAGS {
            return Err(PointError::TooManyTags(self.tags.len()));
        }
        for (k, v) in &self.tags {
            if k.is_empty() {
                return Err(PointError::Empty("tag key"));
            }
            if has_reserved_chars(k) {
                return Err(PointError::ReservedChar {
                    field: "tag key",
                    value: k.clone(),
                });
            }
            if has_reserved_chars(v) {
                return Err(PointError::ReservedChar {
                    field: "tag value",
                    value: v.clone(),
                });
            }
        }

        self.tags = sanitize_tags(&self.tags);
        if sorted_tags(&self.tags).len() > MAX_SORTED_TAGS_LEN {
            return Err(PointError::TooLong { field: "tags" });
        }

        if self.time <= 0 {
            self.time = now;
        }
        if self.time - now > MAX_FUTURE_SECS {
            return Err(PointError::InFuture {
                timestamp: self.time,
                now,
            });
        }
        if now - self.time > MAX_PAST_SECS {
            return Err(PointError::TooOld {
                timestamp: self.time,
                now,
            });
        }
        Ok(())
    }

    /// Primary key: hash of ident, metric and the sorted tags
    pub fn pk(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.ident.as_bytes());
        hasher.update(b"/");
        hasher.update(self.metric.as_bytes());
        hasher.update(b"/");
        hasher.update(sorted_tags(&self.tags).as_bytes());
        hex::encode(hasher.finalize())
    }
}
