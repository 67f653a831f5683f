//! Job payload as seen by the deduplication layer.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::id::Jid;

/// Queue used when a payload does not name one.
pub const DEFAULT_QUEUE: &str = "default";

fn default_queue() -> String {
    DEFAULT_QUEUE.to_string()
}

/// A job payload travelling through the queue.
///
/// Field names follow the wire format shared with the queue transport, so a
/// payload can be round-tripped through JSON without loss.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    /// Worker type
    pub class: String,
    /// Ordered argument list
    pub args: Vec<JsonValue>,
    /// This instance's unique id
    pub jid: Jid,
    /// Queue the job is routed to
    #[serde(default = "default_queue")]
    pub queue: String,
    /// Future run-at marker for scheduled jobs (epoch seconds on the wire)
    #[serde(
        default,
        with = "chrono::serde::ts_seconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub at: Option<DateTime<Utc>>,
    /// Producer-observed WAL position per database config
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub wal_locations: BTreeMap<String, String>,
    /// Cached idempotency key, filled in on first computation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// Winner jid, stamped when this instance was found to be a duplicate
    #[serde(
        rename = "duplicate-of",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub duplicate_of: Option<Jid>,
    /// Latest WAL locations tracked across all instances of this logical job
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dedup_wal_locations: BTreeMap<String, String>,
}

impl JobPayload {
    /// Create a payload with a freshly generated jid on the default queue.
    pub fn new(class: impl Into<String>, args: Vec<JsonValue>) -> Self {
        Self {
            class: class.into(),
            args,
            jid: Jid::generate(),
            queue: default_queue(),
            at: None,
            wal_locations: BTreeMap::new(),
            idempotency_key: None,
            duplicate_of: None,
            dedup_wal_locations: BTreeMap::new(),
        }
    }

    pub fn with_jid(mut self, jid: impl Into<Jid>) -> Self {
        self.jid = jid.into();
        self
    }

    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    /// Attach the WAL position the producer observed for a database config.
    pub fn with_wal_location(
        mut self,
        config: impl Into<String>,
        location: impl Into<String>,
    ) -> Self {
        self.wal_locations.insert(config.into(), location.into());
        self
    }

    /// Schedule the job for later execution.
    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.at = Some(at);
        self
    }

    /// Schedule the job with a delay from now.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.at = Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default());
        self
    }

    /// A fresh instance of the same logical job: new jid, no per-instance state.
    pub fn respawn(&self) -> Self {
        Self {
            class: self.class.clone(),
            args: self.args.clone(),
            jid: Jid::generate(),
            queue: self.queue.clone(),
            at: None,
            wal_locations: self.wal_locations.clone(),
            idempotency_key: self.idempotency_key.clone(),
            duplicate_of: None,
            dedup_wal_locations: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_format_uses_queue_field_names() {
        let at = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let mut job = JobPayload::new("ReportWorker", vec![json!(1), json!("a")])
            .with_jid("abc")
            .on_queue("reports")
            .with_wal_location("main", "0/D525E3A8")
            .scheduled_at(at);
        job.duplicate_of = Some(Jid::from("winner"));

        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["class"], "ReportWorker");
        assert_eq!(value["jid"], "abc");
        assert_eq!(value["at"], 1_700_000_000);
        assert_eq!(value["wal_locations"]["main"], "0/D525E3A8");
        assert_eq!(value["duplicate-of"], "winner");
        assert!(value.get("idempotency_key").is_none());

        let back: JobPayload = serde_json::from_value(value).unwrap();
        assert_eq!(back, job);
    }

    #[test]
    fn missing_optional_fields_default() {
        let job: JobPayload =
            serde_json::from_value(json!({"class": "W", "args": [], "jid": "1"})).unwrap();
        assert_eq!(job.queue, DEFAULT_QUEUE);
        assert!(job.at.is_none());
        assert!(job.wal_locations.is_empty());
    }

    #[test]
    fn respawn_keeps_identity_but_not_instance_state() {
        let mut job = JobPayload::new("W", vec![json!(1)]).delayed(Duration::from_secs(60));
        job.duplicate_of = Some(Jid::from("other"));

        let fresh = job.respawn();
        assert_eq!(fresh.class, job.class);
        assert_eq!(fresh.args, job.args);
        assert_ne!(fresh.jid, job.jid);
        assert!(fresh.at.is_none());
        assert!(fresh.duplicate_of.is_none());
    }
}
