//! SliceLoop data model
//!
//! Types exchanged between the coordinator, the worker binary and the slice
//! pipeline. Everything here is plain serde data; JSON is the only encoding.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

// Slice input

/// One batch of input items assigned to a single worker invocation.
///
/// Item payloads are base64 encoded file contents keyed by item identifier.
/// Items are visited in key order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slice {
    #[serde(rename = "b64Data", alias = "items")]
    pub items: BTreeMap<String, String>,
}

impl Slice {
    /// Create an empty slice
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an already base64-encoded item
    pub fn insert(&mut self, item_id: impl Into<String>, encoded: impl Into<String>) {
        self.items.insert(item_id.into(), encoded.into());
    }

    /// Number of items in the slice
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Check if the slice has no items
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Item identifiers in iteration order
    pub fn item_ids(&self) -> impl Iterator<Item = &str> {
        self.items.keys().map(String::as_str)
    }
}

// Labels

/// Job-wide labels handed to every slice.
///
/// Unknown keys are preserved and forwarded to user postprocess code.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Labels {
    /// Model name
    #[serde(rename = "modelName", default)]
    pub model_name: String,

    /// Job/project identifier
    #[serde(rename = "projectID", default)]
    pub project_id: String,

    /// Debug flag forwarded to user code
    #[serde(default)]
    pub debug: bool,

    /// Prefer an accelerated execution provider over the CPU fallback
    #[serde(rename = "webgpu", alias = "accelerated", default)]
    pub accelerated: bool,

    /// Any other caller-defined labels
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Labels {
    /// Create labels for a model
    pub fn new(model_name: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            project_id: project_id.into(),
            ..Self::default()
        }
    }
}

/// Per-item view of the labels.
///
/// Built fresh for every item so the `fileID` seen by user code and by error
/// records always names the item being processed, even when the job labels
/// carry a `fileID` of their own.
#[derive(Debug, Clone, Copy)]
pub struct ItemContext<'a> {
    pub file_id: &'a str,
    pub labels: &'a Labels,
}

impl<'a> ItemContext<'a> {
    /// Create the context for one item
    pub fn new(file_id: &'a str, labels: &'a Labels) -> Self {
        Self { file_id, labels }
    }

    /// Render as the JSON object passed to postprocess code
    pub fn to_json(&self) -> Value {
        let mut map = match serde_json::to_value(self.labels) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        // Inserted last so it replaces any `fileID` kept in the extra labels.
        map.insert("fileID".to_string(), Value::String(self.file_id.to_string()));
        Value::Object(map)
    }
}

impl Serialize for ItemContext<'_> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

// Errors and results

/// Pipeline stage that produced an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageCode {
    /// Interpreter bootstrap or processor loading; aborts the slice
    Pyodide,
    Preprocess,
    Inference,
    Postprocess,
}

impl StageCode {
    /// All stage codes
    pub const ALL: [StageCode; 4] = [
        StageCode::Pyodide,
        StageCode::Preprocess,
        StageCode::Inference,
        StageCode::Postprocess,
    ];

    /// Wire name of the code
    pub fn as_str(&self) -> &'static str {
        match self {
            StageCode::Pyodide => "pyodide",
            StageCode::Preprocess => "preprocess",
            StageCode::Inference => "inference",
            StageCode::Postprocess => "postprocess",
        }
    }
}

impl fmt::Display for StageCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Return the last non-empty line of a multi-line message, trimmed.
///
/// Interpreter tracebacks end with the exception summary, so this is the line
/// surfaced to callers.
pub fn last_meaningful_line(text: &str) -> &str {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
        .unwrap_or("")
}

/// Structured, single-line error attributed to a stage and (usually) an item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub code: StageCode,

    pub message: String,

    /// Offending item; absent for slice-fatal errors
    #[serde(rename = "itemID", default, skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
}

impl ErrorRecord {
    /// Error attributed to one item
    pub fn item(code: StageCode, item_id: impl Into<String>, message: impl AsRef<str>) -> Self {
        Self {
            code,
            message: last_meaningful_line(message.as_ref()).to_string(),
            item_id: Some(item_id.into()),
        }
    }

    /// Error that aborted the whole slice
    pub fn slice(code: StageCode, message: impl AsRef<str>) -> Self {
        Self {
            code,
            message: last_meaningful_line(message.as_ref()).to_string(),
            item_id: None,
        }
    }
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.item_id {
            Some(item) => write!(f, "[{}] {}: {}", self.code, item, self.message),
            None => write!(f, "[{}] {}", self.code, self.message),
        }
    }
}

/// Outcome of one item: the postprocess payload or an error record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ItemResult {
    Error(ErrorRecord),
    Output(Value),
}

impl ItemResult {
    /// Check if this item failed
    pub fn is_error(&self) -> bool {
        matches!(self, ItemResult::Error(_))
    }

    /// The error record, if the item failed
    pub fn error(&self) -> Option<&ErrorRecord> {
        match self {
            ItemResult::Error(record) => Some(record),
            ItemResult::Output(_) => None,
        }
    }

    /// The payload, if the item succeeded
    pub fn output(&self) -> Option<&Value> {
        match self {
            ItemResult::Output(value) => Some(value),
            ItemResult::Error(_) => None,
        }
    }
}

/// Top-level result of one slice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FinalResult {
    /// The slice never reached the item loop
    Aborted(ErrorRecord),

    /// One entry per input item
    Completed(BTreeMap<String, ItemResult>),
}

impl FinalResult {
    /// Check if the slice was aborted before any item ran
    pub fn is_aborted(&self) -> bool {
        matches!(self, FinalResult::Aborted(_))
    }

    /// Slice-fatal error, if any
    pub fn abort_reason(&self) -> Option<&ErrorRecord> {
        match self {
            FinalResult::Aborted(record) => Some(record),
            FinalResult::Completed(_) => None,
        }
    }

    /// Per-item results; `None` when aborted
    pub fn items(&self) -> Option<&BTreeMap<String, ItemResult>> {
        match self {
            FinalResult::Completed(items) => Some(items),
            FinalResult::Aborted(_) => None,
        }
    }

    /// Result for a single item
    pub fn get(&self, item_id: &str) -> Option<&ItemResult> {
        self.items().and_then(|items| items.get(item_id))
    }

    /// Number of item-level errors
    pub fn error_count(&self) -> usize {
        self.items()
            .map(|items| items.values().filter(|r| r.is_error()).count())
            .unwrap_or(0)
    }
}

// Model packaging

/// Pre-published module carrying a whole model package.
///
/// `model`, `preprocess` and `postprocess` are base64 encoded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachedModule {
    pub model: String,
    pub preprocess: String,
    pub postprocess: String,
    #[serde(default)]
    pub packages: Vec<String>,
}

/// Direct (bundled) arguments of a work function invocation.
///
/// `model` is base64 encoded; the sources are plain text. When `model` is
/// absent the attached module supplies the whole package.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkArgs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preprocess: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postprocess: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packages: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl WorkArgs {
    /// Arguments for bundled mode
    pub fn bundled(
        model_b64: impl Into<String>,
        preprocess: impl Into<String>,
        postprocess: impl Into<String>,
        packages: Vec<String>,
    ) -> Self {
        Self {
            preprocess: Some(preprocess.into()),
            postprocess: Some(postprocess.into()),
            packages: Some(packages),
            model: Some(model_b64.into()),
        }
    }
}

/// Everything one worker invocation needs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkRequest {
    pub slice: Slice,

    #[serde(default)]
    pub labels: Labels,

    #[serde(default)]
    pub args: WorkArgs,

    /// Attached module, consulted when `args.model` is absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<AttachedModule>,
}

/// Model descriptor file (`model.json`) pointing at the package's artifacts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub name: String,

    #[serde(default = "default_version")]
    pub version: String,

    /// Model weights file name
    pub model: String,

    /// Preprocess source file name
    pub preprocess: String,

    /// Postprocess source file name
    pub postprocess: String,

    /// Interpreter packages the processing code needs
    #[serde(default)]
    pub packages: Vec<String>,

    /// Where workers fetch artifacts from; absent means attached-module mode
    #[serde(rename = "modelDownload", default, skip_serializing_if = "Option::is_none")]
    pub model_download: Option<String>,
}

fn default_version() -> String {
    "0.0.1".to_string()
}

impl ModelDescriptor {
    /// Artifact names workers are allowed to fetch
    pub fn artifact_names(&self) -> [&str; 3] {
        [&self.model, &self.preprocess, &self.postprocess]
    }
}

/// Publishable package: name, version and file manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageDescriptor {
    pub name: String,
    pub version: String,
    pub files: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_slice_wire_format() {
        let slice: Slice = serde_json::from_value(json!({
            "b64Data": { "b.png": "Ag==", "a.png": "AQ==" }
        }))
        .unwrap();

        assert_eq!(slice.len(), 2);
        assert_eq!(slice.item_ids().collect::<Vec<_>>(), vec!["a.png", "b.png"]);
    }

    #[test]
    fn test_item_context_sets_file_id() {
        let mut labels = Labels::new("mnist", "42");
        labels.extra.insert("team".to_string(), json!("vision"));

        let ctx = ItemContext::new("a.png", &labels);
        let value = ctx.to_json();

        assert_eq!(value["fileID"], "a.png");
        assert_eq!(value["modelName"], "mnist");
        assert_eq!(value["team"], "vision");
    }

    #[test]
    fn test_item_context_replaces_stale_file_id() {
        let labels: Labels =
            serde_json::from_value(json!({"modelName": "m", "projectID": "p", "fileID": "stale.png"})).unwrap();
        assert_eq!(labels.extra["fileID"], "stale.png");

        let ctx = ItemContext::new("a.png", &labels);

        assert_eq!(ctx.to_json()["fileID"], "a.png");
        assert_eq!(serde_json::to_value(ctx).unwrap()["fileID"], "a.png");
    }

    #[test]
    fn test_error_record_is_single_line() {
        let record = ErrorRecord::item(
            StageCode::Preprocess,
            "a.png",
            "Traceback (most recent call last):\n  File \"preprocess.py\", line 3\nValueError: bad image\n",
        );

        assert_eq!(record.message, "ValueError: bad image");
        assert_eq!(record.item_id.as_deref(), Some("a.png"));
    }

    #[test]
    fn test_final_result_serialization() {
        let mut items = BTreeMap::new();
        items.insert("a.png".to_string(), ItemResult::Output(json!({"output": [1.0]})));
        items.insert(
            "b.png".to_string(),
            ItemResult::Error(ErrorRecord::item(StageCode::Inference, "b.png", "shape mismatch")),
        );
        let result = FinalResult::Completed(items);

        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["a.png"]["output"][0], 1.0);
        assert_eq!(value["b.png"]["code"], "inference");
        assert_eq!(value["b.png"]["itemID"], "b.png");
        assert_eq!(result.error_count(), 1);

        let aborted = FinalResult::Aborted(ErrorRecord::slice(StageCode::Pyodide, "no entry point"));
        let value = serde_json::to_value(&aborted).unwrap();
        assert_eq!(value, json!({"code": "pyodide", "message": "no entry point"}));
    }

    #[test]
    fn test_work_request_attached_mode() {
        let request: WorkRequest = serde_json::from_value(json!({
            "slice": { "b64Data": { "a.png": "AQ==" } },
            "labels": { "modelName": "mnist", "projectID": "1", "webgpu": true },
            "module": {
                "model": "AAEC",
                "preprocess": "ZGVmIHByZXByb2Nlc3MoKTogcGFzcw==",
                "postprocess": "ZGVmIHBvc3Rwcm9jZXNzKCk6IHBhc3M=",
                "packages": ["numpy"]
            }
        }))
        .unwrap();

        assert!(request.args.model.is_none());
        assert!(request.labels.accelerated);
        assert_eq!(request.module.unwrap().packages, vec!["numpy".to_string()]);
    }

    #[test]
    fn test_model_descriptor_defaults() {
        let descriptor: ModelDescriptor = serde_json::from_value(json!({
            "name": "mnist",
            "model": "mnist.onnx",
            "preprocess": "preprocess.py",
            "postprocess": "postprocess.py"
        }))
        .unwrap();

        assert_eq!(descriptor.version, "0.0.1");
        assert!(descriptor.packages.is_empty());
        assert!(descriptor.model_download.is_none());
        assert_eq!(
            descriptor.artifact_names(),
            ["mnist.onnx", "preprocess.py", "postprocess.py"]
        );
    }
}
