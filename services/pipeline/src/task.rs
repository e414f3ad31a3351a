//! Task and result types that flow through the pipeline, plus the flat
//! key-value wire codec every broker backend carries them in.
//!
//! On the wire a task is a [`TaskRecord`]: an ordered map of string fields.
//! Numeric fields such as `frame_index` travel as text and are parsed back
//! on receipt, so `from_record(to_record(x)) == x` for every task.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::btree_map;
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use thiserror::Error;

/// Errors raised while decoding a task from its wire form
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TaskError {
    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid value for {field}: {value:?}")]
    InvalidField { field: &'static str, value: String },

    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

/// Flat record of string fields, the unit every broker moves
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskRecord {
    fields: BTreeMap<String, String>,
}

impl TaskRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a field, replacing any previous value
    pub fn insert(&mut self, name: impl Into<String>, value: impl ToString) {
        self.fields.insert(name.into(), value.to_string());
    }

    /// Builder-style variant of [`TaskRecord::insert`]
    pub fn with(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    /// Fetch a required text field
    pub fn require(&self, name: &'static str) -> Result<String, TaskError> {
        self.get(name)
            .map(str::to_string)
            .ok_or(TaskError::MissingField(name))
    }

    /// Fetch a required field and parse it
    pub fn parse<T: FromStr>(&self, name: &'static str) -> Result<T, TaskError> {
        let raw = self.get(name).ok_or(TaskError::MissingField(name))?;
        raw.trim().parse().map_err(|_| TaskError::InvalidField {
            field: name,
            value: raw.to_string(),
        })
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, String> {
        self.fields.iter()
    }

    /// Render as a JSON object of strings
    pub fn to_json(&self) -> String {
        // A map of strings always serializes.
        serde_json::to_string(&self.fields).unwrap_or_else(|_| "{}".to_string())
    }

    /// Parse a JSON object. Scalar numbers and booleans are accepted and kept
    /// as their textual form; nested values are rejected.
    pub fn from_json(payload: &[u8]) -> Result<Self, TaskError> {
        let object: serde_json::Map<String, serde_json::Value> = serde_json::from_slice(payload)
            .map_err(|e| TaskError::InvalidPayload(e.to_string()))?;

        let mut record = Self::new();
        for (name, value) in object {
            let text = match value {
                serde_json::Value::String(s) => s,
                serde_json::Value::Number(n) => n.to_string(),
                serde_json::Value::Bool(b) => b.to_string(),
                other => {
                    return Err(TaskError::InvalidPayload(format!(
                        "field {name} is not a scalar: {other}"
                    )))
                }
            };
            record.fields.insert(name, text);
        }
        Ok(record)
    }
}

impl FromIterator<(String, String)> for TaskRecord {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

impl From<HashMap<String, String>> for TaskRecord {
    fn from(map: HashMap<String, String>) -> Self {
        map.into_iter().collect()
    }
}

/// A task type that can travel through a broker
pub trait WireTask: Sized + Send + Sync + 'static {
    /// Short name used in logs and metrics
    const KIND: &'static str;

    fn to_record(&self) -> TaskRecord;

    fn from_record(record: &TaskRecord) -> Result<Self, TaskError>;

    /// Key used by partitioned backends; tasks sharing it keep their order
    fn partition_key(&self) -> &str;
}

/// One uploaded video awaiting frame extraction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoTask {
    pub video_id: String,
    pub video_path: String,
}

impl VideoTask {
    pub fn new(video_id: impl Into<String>, video_path: impl Into<String>) -> Self {
        Self {
            video_id: video_id.into(),
            video_path: video_path.into(),
        }
    }
}

impl WireTask for VideoTask {
    const KIND: &'static str = "video_task";

    fn to_record(&self) -> TaskRecord {
        TaskRecord::new()
            .with("video_id", &self.video_id)
            .with("video_path", &self.video_path)
    }

    fn from_record(record: &TaskRecord) -> Result<Self, TaskError> {
        Ok(Self {
            video_id: non_empty(record, "video_id")?,
            video_path: non_empty(record, "video_path")?,
        })
    }

    fn partition_key(&self) -> &str {
        &self.video_id
    }
}

/// One sampled frame awaiting detection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameTask {
    pub video_id: String,
    pub frame_path: String,
    pub frame_index: u64,
    /// Digest of the encoded frame bytes at write time
    pub frame_hash: String,
    /// Digest of the source video
    pub video_hash: String,
}

impl WireTask for FrameTask {
    const KIND: &'static str = "frame_task";

    fn to_record(&self) -> TaskRecord {
        TaskRecord::new()
            .with("video_id", &self.video_id)
            .with("frame_path", &self.frame_path)
            .with("frame_index", self.frame_index)
            .with("frame_hash", &self.frame_hash)
            .with("video_hash", &self.video_hash)
    }

    fn from_record(record: &TaskRecord) -> Result<Self, TaskError> {
        Ok(Self {
            video_id: non_empty(record, "video_id")?,
            frame_path: non_empty(record, "frame_path")?,
            frame_index: record.parse("frame_index")?,
            frame_hash: non_empty(record, "frame_hash")?,
            video_hash: record.require("video_hash")?,
        })
    }

    fn partition_key(&self) -> &str {
        &self.video_id
    }
}

fn non_empty(record: &TaskRecord, name: &'static str) -> Result<String, TaskError> {
    let value = record.require(name)?;
    if value.is_empty() {
        return Err(TaskError::InvalidField {
            field: name,
            value,
        });
    }
    Ok(value)
}

/// A single object found in a frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    #[serde(alias = "class")]
    pub class_name: String,
    /// Confidence score (0.0 - 1.0)
    #[serde(alias = "conf")]
    pub confidence: f32,
    /// Bounding box [x1, y1, x2, y2] normalized 0-1
    pub bbox: [f32; 4],
}

impl Detection {
    pub fn new(class_name: impl Into<String>, confidence: f32, bbox: [f32; 4]) -> Self {
        Self {
            class_name: class_name.into(),
            confidence,
            bbox,
        }
    }

    /// Clamp confidence and coordinates into [0, 1]; NaN becomes 0
    pub fn normalized(mut self) -> Self {
        self.confidence = unit(self.confidence);
        for coord in self.bbox.iter_mut() {
            *coord = unit(*coord);
        }
        self
    }
}

fn unit(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Persisted outcome of running detection on one frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub video_id: String,
    pub frame_path: String,
    pub frame_index: u64,
    pub detections: Vec<Detection>,
    pub timestamp: DateTime<Utc>,
}

impl DetectionResult {
    /// Build the result for a frame task, stamped now
    pub fn for_frame(task: &FrameTask, detections: Vec<Detection>) -> Self {
        Self {
            video_id: task.video_id.clone(),
            frame_path: task.frame_path.clone(),
            frame_index: task.frame_index,
            detections: detections.into_iter().map(Detection::normalized).collect(),
            timestamp: Utc::now(),
        }
    }

    /// Collapse redelivery duplicates, keeping the newest result per
    /// `(video_id, frame_index)`. Output is ordered by that key.
    pub fn dedupe_latest<I>(results: I) -> Vec<DetectionResult>
    where
        I: IntoIterator<Item = DetectionResult>,
    {
        let mut latest: BTreeMap<(String, u64), DetectionResult> = BTreeMap::new();
        for result in results {
            let key = (result.video_id.clone(), result.frame_index);
            match latest.get(&key) {
                Some(existing) if existing.timestamp > result.timestamp => {}
                _ => {
                    latest.insert(key, result);
                }
            }
        }
        latest.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn frame_task() -> FrameTask {
        FrameTask {
            video_id: "vid-1".to_string(),
            frame_path: "/data/frames/vid-1/30.jpg".to_string(),
            frame_index: 30,
            frame_hash: "ab".repeat(32),
            video_hash: "cd".repeat(32),
        }
    }

    #[test]
    fn test_frame_task_fields_are_strings() {
        let record = frame_task().to_record();
        assert_eq!(record.get("frame_index"), Some("30"));
        assert_eq!(record.len(), 5);
        assert_eq!(FrameTask::from_record(&record).unwrap(), frame_task());
    }

    #[test]
    fn test_frame_task_survives_json() {
        let task = frame_task();
        let json = task.to_record().to_json();
        let decoded = FrameTask::from_record(&TaskRecord::from_json(json.as_bytes()).unwrap());
        assert_eq!(decoded.unwrap(), task);
    }

    #[test]
    fn test_whitespace_identifiers_round_trip() {
        let task = FrameTask {
            video_id: "  ".to_string(),
            ..frame_task()
        };
        assert_eq!(FrameTask::from_record(&task.to_record()).unwrap(), task);

        let empty = frame_task().to_record().with("video_id", "");
        assert!(matches!(
            FrameTask::from_record(&empty),
            Err(TaskError::InvalidField { field: "video_id", .. })
        ));
    }

    #[test]
    fn test_numeric_frame_index_is_accepted() {
        let payload = br#"{"video_id":"v","frame_path":"p","frame_index":120,"frame_hash":"h","video_hash":"x"}"#;
        let record = TaskRecord::from_json(payload).unwrap();
        assert_eq!(FrameTask::from_record(&record).unwrap().frame_index, 120);
    }

    #[test]
    fn test_negative_frame_index_is_rejected() {
        let record = frame_task().to_record().with("frame_index", "-3");
        assert_eq!(
            FrameTask::from_record(&record),
            Err(TaskError::InvalidField {
                field: "frame_index",
                value: "-3".to_string()
            })
        );
    }

    #[test]
    fn test_missing_field_is_reported() {
        let record = TaskRecord::new().with("video_id", "v");
        assert_eq!(
            VideoTask::from_record(&record),
            Err(TaskError::MissingField("video_path"))
        );
    }

    #[test]
    fn test_nested_json_is_malformed() {
        let err = TaskRecord::from_json(br#"{"video_id":{"nested":true}}"#).unwrap_err();
        assert!(matches!(err, TaskError::InvalidPayload(_)));
        assert!(TaskRecord::from_json(b"not json").is_err());
    }

    #[test]
    fn test_detection_aliases() {
        let json = r#"{"class":"person","conf":0.9,"bbox":[0.1,0.1,0.5,0.5]}"#;
        let detection: Detection = serde_json::from_str(json).unwrap();
        assert_eq!(detection.class_name, "person");
        assert_eq!(detection.confidence, 0.9);
    }

    #[test]
    fn test_detection_normalized() {
        let detection = Detection::new("car", 1.4, [-0.2, 0.5, 1.2, f32::NAN]).normalized();
        assert_eq!(detection.confidence, 1.0);
        assert_eq!(detection.bbox, [0.0, 0.5, 1.0, 0.0]);
    }

    #[test]
    fn test_dedupe_latest_keeps_newest() {
        let task = frame_task();
        let mut older = DetectionResult::for_frame(&task, vec![]);
        older.timestamp = older.timestamp - Duration::seconds(10);
        let newer = DetectionResult::for_frame(&task, vec![Detection::new("person", 0.9, [0.1, 0.1, 0.5, 0.5])]);
        let mut other = DetectionResult::for_frame(&task, vec![]);
        other.frame_index = 0;

        let deduped = DetectionResult::dedupe_latest(vec![newer.clone(), older, other]);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].frame_index, 0);
        assert_eq!(deduped[1], newer);
    }
}
