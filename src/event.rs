//! The log event flowing through every stage.
//!
//! A [`LogEvent`] is built once at the emission site and then only moved or
//! cloned downstream. Nothing in the pipeline mutates an event after it was
//! handed to a sink.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Maximum nesting of inner exceptions kept on an event.
pub const MAX_EXCEPTION_DEPTH: usize = 2;

/// Event severity, ordered from most to least verbose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub enum Level {
    Trace,
    Debug,
    #[default]
    Information,
    Warning,
    Error,
    Critical,
    /// Filter-only level: disables a category entirely.
    None,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "Trace",
            Self::Debug => "Debug",
            Self::Information => "Information",
            Self::Warning => "Warning",
            Self::Error => "Error",
            Self::Critical => "Critical",
            Self::None => "None",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Level {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "information" | "info" => Ok(Self::Information),
            "warning" | "warn" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            "critical" | "fatal" => Ok(Self::Critical),
            "none" => Ok(Self::None),
            other => Err(format!("unknown level '{}'", other)),
        }
    }
}

/// Structured exception attached to an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionDetail {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hresult: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub help_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inner: Option<Box<ExceptionDetail>>,
}

impl ExceptionDetail {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_stack_trace(mut self, stack_trace: impl Into<String>) -> Self {
        self.stack_trace = Some(stack_trace.into());
        self
    }

    pub fn with_inner(mut self, inner: ExceptionDetail) -> Self {
        self.inner = Some(Box::new(inner));
        self
    }

    /// Returns a copy with the inner chain cut below `max_depth` levels.
    ///
    /// Depth 0 is `self`; `capped(2)` keeps self, inner, and inner's inner.
    pub fn capped(&self, max_depth: usize) -> Self {
        let mut copy = self.clone();
        copy.inner = match (&self.inner, max_depth) {
            (Some(inner), d) if d > 0 => Some(Box::new(inner.capped(d - 1))),
            _ => None,
        };
        copy
    }

    /// Number of nested levels below this one.
    pub fn depth(&self) -> usize {
        self.inner.as_ref().map(|i| 1 + i.depth()).unwrap_or(0)
    }

    /// Iterate the inner chain, outermost first, excluding `self`.
    pub fn inner_chain(&self) -> impl Iterator<Item = &ExceptionDetail> {
        std::iter::successors(self.inner.as_deref(), |e| e.inner.as_deref())
    }
}

/// One structured log event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEvent {
    /// Logical stream key (application or log family).
    pub log_key: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub level: Level,
    /// Category / logger name.
    #[serde(default)]
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_name: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<ExceptionDetail>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub enrichers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, serde_json::Value>,
}

impl LogEvent {
    /// New event stamped with the current UTC time.
    pub fn new(
        log_key: impl Into<String>,
        level: Level,
        source: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            log_key: log_key.into(),
            timestamp: Utc::now(),
            level,
            source: source.into(),
            event_id: None,
            event_name: None,
            message: message.into(),
            exception: None,
            enrichers: BTreeMap::new(),
            properties: BTreeMap::new(),
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_event(mut self, id: i32, name: impl Into<String>) -> Self {
        self.event_id = Some(id);
        self.event_name = Some(name.into());
        self
    }

    /// Attach an exception, truncated to [`MAX_EXCEPTION_DEPTH`].
    pub fn with_exception(mut self, exception: ExceptionDetail) -> Self {
        self.exception = Some(exception.capped(MAX_EXCEPTION_DEPTH));
        self
    }

    pub fn with_enricher(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.enrichers.insert(key.into(), value.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(depth: usize) -> ExceptionDetail {
        let mut e = ExceptionDetail::new(format!("E{}", depth), "leaf");
        for d in (0..depth).rev() {
            e = ExceptionDetail::new(format!("E{}", d), "wrap").with_inner(e);
        }
        e
    }

    #[test]
    fn test_level_ordering() {
        assert!(Level::Trace < Level::Debug);
        assert!(Level::Warning < Level::Error);
        assert!(Level::Critical < Level::None);
        assert_eq!(Level::default(), Level::Information);
    }

    #[test]
    fn test_level_parse() {
        assert_eq!("warn".parse::<Level>().unwrap(), Level::Warning);
        assert_eq!("Information".parse::<Level>().unwrap(), Level::Information);
        assert!("loud".parse::<Level>().is_err());
    }

    #[test]
    fn test_exception_capped_at_two_levels() {
        let deep = chain(5);
        assert_eq!(deep.depth(), 5);

        let capped = deep.capped(MAX_EXCEPTION_DEPTH);
        assert_eq!(capped.depth(), 2);
        let names: Vec<_> = capped.inner_chain().map(|e| e.kind.as_str()).collect();
        assert_eq!(names, vec!["E1", "E2"]);
    }

    #[test]
    fn test_with_exception_applies_cap() {
        let event = LogEvent::new("billing", Level::Error, "Billing.Api", "boom").with_exception(chain(4));
        assert_eq!(event.exception.unwrap().depth(), MAX_EXCEPTION_DEPTH);
    }

    #[test]
    fn test_event_json_shape() {
        let event = LogEvent::new("billing", Level::Warning, "Billing.Api", "slow request")
            .with_event(7, "Slow")
            .with_enricher("env", "prod")
            .with_property("elapsedMs", 1250);

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["logKey"], "billing");
        assert_eq!(json["level"], "Warning");
        assert_eq!(json["eventId"], 7);
        assert_eq!(json["enrichers"]["env"], "prod");
        assert_eq!(json["properties"]["elapsedMs"], 1250);
        assert!(json.get("exception").is_none());
    }

    #[test]
    fn test_event_defaults_on_sparse_json() {
        let json = r#"{"logKey":"a","timestamp":"2026-01-02T03:04:05Z"}"#;
        let event: LogEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.level, Level::Information);
        assert!(event.message.is_empty());
        assert!(event.properties.is_empty());
    }
}
