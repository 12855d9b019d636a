//! Stream combiners: turn a dequeued group into one wire payload.
//!
//! Each stream in the closed set has a combiner that decodes queued
//! payload bytes into items and merges a whole group into the single
//! JSON body the transport posts. Combiners are looked up by stream
//! name in a [`CombinerRegistry`] the coordinator owns.

use std::collections::BTreeMap;

use chrono::{SecondsFormat, Utc};
use serde_json::{Value, json};
use thiserror::Error;

/// Combiner failure. A group that fails to combine is treated as a
/// retryable upload failure by the coordinator.
#[derive(Debug, Error)]
pub enum CombineError {
    #[error("payload is not valid JSON: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    #[error("no combiner registered for stream {0:?}")]
    UnknownStream(String),

    #[error("cannot combine an empty group")]
    EmptyGroup,
}

/// Decodes queued payloads and merges one stream group into a wire body.
pub trait StreamCombiner: Send + Sync {
    /// Decode one queued payload into its constituent items.
    fn decode(&self, payload: &[u8]) -> Result<Vec<Value>, CombineError>;

    /// Merge the decoded items of a whole group into one wire payload.
    fn combine(&self, items: Vec<Value>, device_id: &str) -> Result<Value, CombineError>;
}

/// Combiner for streams whose payloads are newline-delimited JSON
/// objects. The wire body wraps all records of the group under the
/// stream key with an ISO-8601 capture timestamp.
#[derive(Debug, Clone)]
pub struct JsonLinesCombiner {
    stream_key: String,
}

impl JsonLinesCombiner {
    #[must_use]
    pub fn new(stream_key: impl Into<String>) -> Self {
        Self {
            stream_key: stream_key.into(),
        }
    }
}

impl StreamCombiner for JsonLinesCombiner {
    fn decode(&self, payload: &[u8]) -> Result<Vec<Value>, CombineError> {
        let text = String::from_utf8_lossy(payload);
        let mut items = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            items.push(serde_json::from_str(line)?);
        }
        Ok(items)
    }

    fn combine(&self, items: Vec<Value>, device_id: &str) -> Result<Value, CombineError> {
        if items.is_empty() {
            return Err(CombineError::EmptyGroup);
        }
        Ok(json!({
            "deviceId": device_id,
            "streamKey": self.stream_key,
            "recordedAt": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            "records": items,
        }))
    }
}

/// Stream-name to combiner lookup.
#[derive(Default)]
pub struct CombinerRegistry {
    combiners: BTreeMap<String, Box<dyn StreamCombiner>>,
}

impl CombinerRegistry {
    /// Registry with a [`JsonLinesCombiner`] per stream.
    #[must_use]
    pub fn json_lines<I, S>(streams: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut registry = Self::default();
        for stream in streams {
            let stream = stream.into();
            let combiner = JsonLinesCombiner::new(stream.clone());
            registry.register(stream, Box::new(combiner));
        }
        registry
    }

    pub fn register(&mut self, stream: impl Into<String>, combiner: Box<dyn StreamCombiner>) {
        self.combiners.insert(stream.into(), combiner);
    }

    /// Combiner for a stream, or `UnknownStream`.
    pub fn get(&self, stream: &str) -> Result<&dyn StreamCombiner, CombineError> {
        self.combiners
            .get(stream)
            .map(Box::as_ref)
            .ok_or_else(|| CombineError::UnknownStream(stream.to_string()))
    }
}

impl std::fmt::Debug for CombinerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CombinerRegistry")
            .field("streams", &self.combiners.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_splits_json_lines() {
        let combiner = JsonLinesCombiner::new("location");
        let payload = b"{\"lat\": 1.0}\n\n{\"lat\": 2.0}\n";
        let items = combiner.decode(payload).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1]["lat"], 2.0);
    }

    #[test]
    fn decode_rejects_invalid_json() {
        let combiner = JsonLinesCombiner::new("location");
        assert!(matches!(
            combiner.decode(b"not json"),
            Err(CombineError::InvalidPayload(_))
        ));
    }

    #[test]
    fn combine_wraps_group_under_stream_key() {
        let combiner = JsonLinesCombiner::new("health");
        let items = vec![json!({"bpm": 62}), json!({"bpm": 64})];
        let body = combiner.combine(items, "device-9").unwrap();

        assert_eq!(body["deviceId"], "device-9");
        assert_eq!(body["streamKey"], "health");
        assert_eq!(body["records"].as_array().unwrap().len(), 2);
        // recordedAt is ISO-8601 UTC.
        let ts = body["recordedAt"].as_str().unwrap();
        assert!(ts.ends_with('Z'), "timestamp {ts:?} should be UTC");
    }

    #[test]
    fn combine_rejects_empty_group() {
        let combiner = JsonLinesCombiner::new("health");
        assert!(matches!(
            combiner.combine(Vec::new(), "d"),
            Err(CombineError::EmptyGroup)
        ));
    }

    #[test]
    fn registry_resolves_registered_streams_only() {
        let registry = CombinerRegistry::json_lines(["health", "audio"]);
        assert!(registry.get("health").is_ok());
        assert!(matches!(
            registry.get("seismic"),
            Err(CombineError::UnknownStream(_))
        ));
    }
}
