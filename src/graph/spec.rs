//! Job submission shape.
//!
//! A job is a map of task name to task definition:
//!
//! ```json
//! { "tasks": {
//!     "myImport1":  { "operation": "import/url", "url": "https://example.com/logo.svg" },
//!     "myConvert1": { "operation": "convert", "input": "myImport1", "output_format": "jpg" },
//!     "myExport1":  { "operation": "export/url", "input": "myConvert1" }
//! } }
//! ```
//!
//! Submission order of the tasks is kept for display.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::errors::{JobGraphError, Result};

/// One input reference or an ordered list of them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputSpec {
    One(String),
    Many(Vec<String>),
}

impl InputSpec {
    pub fn names(&self) -> Vec<&str> {
        match self {
            InputSpec::One(name) => vec![name.as_str()],
            InputSpec::Many(names) => names.iter().map(String::as_str).collect(),
        }
    }
}

/// Definition of a single task inside a job submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub operation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<InputSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_format: Option<String>,
    /// Operation-specific options, opaque to the engine
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub options: Map<String, Value>,
    /// Remaining top-level fields (`url`, `filename`, `input_format`, ...)
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl TaskSpec {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            input: None,
            output_format: None,
            options: Map::new(),
            params: Map::new(),
        }
    }

    pub fn input(mut self, name: impl Into<String>) -> Self {
        self.input = Some(InputSpec::One(name.into()));
        self
    }

    pub fn inputs<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.input = Some(InputSpec::Many(names.into_iter().map(Into::into).collect()));
        self
    }

    pub fn output_format(mut self, format: impl Into<String>) -> Self {
        self.output_format = Some(format.into());
        self
    }

    pub fn option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Input references in declared order (empty when the task has no input)
    pub fn input_names(&self) -> Vec<&str> {
        self.input.as_ref().map(InputSpec::names).unwrap_or_default()
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }

    pub fn param_bool(&self, key: &str) -> Option<bool> {
        self.params.get(key).and_then(Value::as_bool)
    }
}

/// A job submission
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    #[serde(with = "ordered_tasks")]
    pub tasks: Vec<(String, TaskSpec)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

impl JobSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a task (builder style)
    pub fn task(mut self, name: impl Into<String>, spec: TaskSpec) -> Self {
        self.tasks.push((name.into(), spec));
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&TaskSpec> {
        self.tasks
            .iter()
            .find(|(task_name, _)| task_name == name)
            .map(|(_, spec)| spec)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| JobGraphError::io(format!("read job spec {}", path.display()), e))?;
        Self::from_yaml_str(&content)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

// Serialization helpers keeping the task map in submission order
mod ordered_tasks {
    use std::fmt;

    use serde::de::{Error as DeError, MapAccess, Visitor};
    use serde::ser::SerializeMap;
    use serde::{Deserializer, Serializer};

    use super::TaskSpec;

    pub fn serialize<S>(tasks: &[(String, TaskSpec)], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(tasks.len()))?;
        for (name, spec) in tasks {
            map.serialize_entry(name, spec)?;
        }
        map.end()
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<(String, TaskSpec)>, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct TasksVisitor;

        impl<'de> Visitor<'de> for TasksVisitor {
            type Value = Vec<(String, TaskSpec)>;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of task name to task definition")
            }

            fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut tasks: Vec<(String, TaskSpec)> =
                    Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((name, spec)) = access.next_entry::<String, TaskSpec>()? {
                    if tasks.iter().any(|(existing, _)| *existing == name) {
                        return Err(A::Error::custom(format!("duplicate task name '{name}'")));
                    }
                    tasks.push((name, spec));
                }
                Ok(tasks)
            }
        }

        deserializer.deserialize_map(TasksVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const COMPLEX_JOB: &str = r#"{
        "tasks": {
            "diceImage": { "operation": "import/url", "url": "https://example.com/dice.png" },
            "treeImage": { "operation": "import/url", "url": "https://example.com/tree.jpg" },
            "mergedPdf": {
                "operation": "merge",
                "input": ["diceImage", "treeImage"],
                "output_format": "pdf",
                "options": { "pdf_orientation": "portrait" }
            },
            "finalExport": {
                "operation": "export/url",
                "input": "mergedPdf",
                "filename": "FinalPackage.pdf"
            }
        }
    }"#;

    #[test]
    fn test_parse_keeps_submission_order() {
        let spec = JobSpec::from_json_str(COMPLEX_JOB).unwrap();
        let names: Vec<&str> = spec.tasks.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["diceImage", "treeImage", "mergedPdf", "finalExport"]);
    }

    #[test]
    fn test_parse_splits_params_and_options() {
        let spec = JobSpec::from_json_str(COMPLEX_JOB).unwrap();
        let merge = spec.get("mergedPdf").unwrap();
        assert_eq!(merge.input_names(), vec!["diceImage", "treeImage"]);
        assert_eq!(merge.output_format.as_deref(), Some("pdf"));
        assert_eq!(merge.options.get("pdf_orientation"), Some(&json!("portrait")));
        assert!(merge.params.is_empty());

        let export = spec.get("finalExport").unwrap();
        assert_eq!(export.param_str("filename"), Some("FinalPackage.pdf"));
    }

    #[test]
    fn test_duplicate_task_name_is_rejected() {
        let json = r#"{"tasks": {"a": {"operation": "import/url"}, "a": {"operation": "convert"}}}"#;
        assert!(JobSpec::from_json_str(json).is_err());
    }

    #[test]
    fn test_yaml_and_builder_agree() {
        let yaml = r#"
tasks:
  myImport1:
    operation: import/url
    url: https://example.com/logo.svg
  myConvert1:
    operation: convert
    input: myImport1
    output_format: jpg
"#;
        let parsed = JobSpec::from_yaml_str(yaml).unwrap();
        let built = JobSpec::new()
            .task(
                "myImport1",
                TaskSpec::new("import/url").param("url", "https://example.com/logo.svg"),
            )
            .task("myConvert1", TaskSpec::new("convert").input("myImport1").output_format("jpg"));
        assert_eq!(parsed, built);
    }

    #[test]
    fn test_serialize_round_trips_order() {
        let spec = JobSpec::from_json_str(COMPLEX_JOB).unwrap();
        let again = JobSpec::from_json_str(&spec.to_json().unwrap()).unwrap();
        assert_eq!(spec, again);
    }
}
