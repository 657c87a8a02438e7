//! Built-in operations.
//!
//! These model the contract of each operation (required parameters, input
//! arity, result shape) and produce result locations under the configured
//! storage base url. They do not move or transcode any bytes.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{json, Value};
use tracing::debug;

use crate::core::config::EngineConfig;
use crate::executor::handler::{validate_with_schema, OperationContext, OperationHandler};
use crate::executor::registry::OperationRegistry;
use crate::graph::model::{TaskFailure, TaskOutput, UploadForm};
use crate::graph::spec::TaskSpec;

pub const IMPORT_URL: &str = "import/url";
pub const IMPORT_WEBPAGE: &str = "import/webpage";
pub const IMPORT_UPLOAD: &str = "import/upload";
pub const CONVERT: &str = "convert";
pub const MERGE: &str = "merge";
pub const EXPORT_URL: &str = "export/url";

pub const CODE_INVALID_INPUT_FORMAT: &str = "invalid_input_format";

/// Register every built-in operation
pub fn register_builtin_operations(registry: &OperationRegistry, config: &EngineConfig) {
    let storage = config.storage_base_url.trim_end_matches('/').to_string();
    let upload = config.upload_base_url.trim_end_matches('/').to_string();

    registry.register(Arc::new(UrlImport::new(IMPORT_URL, None)));
    registry.register(Arc::new(UrlImport::new(IMPORT_WEBPAGE, Some("html"))));
    registry.register(Arc::new(UploadImport {
        upload_base_url: upload,
        storage_base_url: storage.clone(),
        wait_limit: config.upload_timeout(),
    }));
    registry.register(Arc::new(Convert {
        storage_base_url: storage.clone(),
    }));
    registry.register(Arc::new(Merge {
        storage_base_url: storage.clone(),
    }));
    registry.register(Arc::new(ExportUrl {
        storage_base_url: storage,
    }));
}

/// Last path segment of a url, without query or fragment
pub fn filename_from_url(url: &str) -> Option<String> {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    let path = without_query
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(without_query);
    let (_, path) = path.split_once('/')?;
    path.rsplit('/')
        .next()
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
}

/// Lowercased extension of a file name
pub fn extension(filename: &str) -> Option<String> {
    filename
        .rsplit_once('.')
        .map(|(_, ext)| ext)
        .filter(|ext| !ext.is_empty() && !ext.contains('/'))
        .map(str::to_lowercase)
}

fn stem(filename: &str) -> &str {
    match filename.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => filename,
    }
}

fn is_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

fn require_output_format(spec: &TaskSpec) -> Result<(), String> {
    match spec.output_format.as_deref() {
        Some(format) if !format.trim().is_empty() => Ok(()),
        _ => Err(format!("'{}' requires an output_format", spec.operation)),
    }
}

// Intermediate results live under the task id, exports under the job
fn task_location(base: &str, ctx: &OperationContext, filename: &str) -> String {
    format!("{base}/{}/{}/{filename}", ctx.job_id, ctx.task_id)
}

fn output_format(ctx: &OperationContext) -> Result<String, TaskFailure> {
    ctx.output_format
        .as_deref()
        .map(str::to_lowercase)
        .ok_or_else(|| TaskFailure::new("invalid_options", "output_format is missing"))
}

/// `import/url` and `import/webpage`
pub struct UrlImport {
    operation: &'static str,
    default_format: Option<&'static str>,
}

impl UrlImport {
    pub fn new(operation: &'static str, default_format: Option<&'static str>) -> Self {
        Self {
            operation,
            default_format,
        }
    }
}

#[async_trait]
impl OperationHandler for UrlImport {
    fn operation(&self) -> &str {
        self.operation
    }

    fn validate_options(&self, spec: &TaskSpec) -> Result<(), String> {
        match spec.param_str("url") {
            Some(url) if is_http_url(url) => Ok(()),
            Some(url) => Err(format!("url '{url}' is not an http(s) url")),
            None => Err("missing 'url'".to_string()),
        }
    }

    async fn execute(&self, ctx: &OperationContext) -> Result<TaskOutput, TaskFailure> {
        let url = ctx
            .param_str("url")
            .ok_or_else(|| TaskFailure::new("invalid_options", "missing 'url'"))?;
        let filename = ctx
            .param_str("filename")
            .map(str::to_string)
            .or_else(|| filename_from_url(url))
            .unwrap_or_else(|| match self.default_format {
                Some(format) => format!("{}.{format}", ctx.task_name),
                None => ctx.task_name.clone(),
            });

        let mut output = TaskOutput::with_url(url).meta("filename", filename.clone());
        if let Some(format) = extension(&filename).or(self.default_format.map(str::to_string)) {
            output = output.meta("format", format);
        }
        debug!(task = %ctx.task_name, url, "imported");
        Ok(output)
    }
}

/// `import/upload`: completes once the caller posted the file
pub struct UploadImport {
    upload_base_url: String,
    storage_base_url: String,
    /// Also the lifetime of the form
    wait_limit: Option<Duration>,
}

#[async_trait]
impl OperationHandler for UploadImport {
    fn operation(&self) -> &str {
        IMPORT_UPLOAD
    }

    fn upload_form(&self, _job_id: &str, task_id: &str) -> Option<UploadForm> {
        let lifetime = self
            .wait_limit
            .and_then(|limit| ChronoDuration::from_std(limit).ok())
            .unwrap_or_else(|| ChronoDuration::hours(4));
        let expires = (Utc::now() + lifetime).timestamp();
        Some(UploadForm {
            url: format!("{}/{task_id}", self.upload_base_url),
            parameters: BTreeMap::from([
                ("expires".to_string(), expires.to_string()),
                ("signature".to_string(), cuid2::create_id()),
            ]),
        })
    }

    // Waiting on a caller is not work
    fn uses_slot(&self) -> bool {
        false
    }

    fn honors_task_timeout(&self) -> bool {
        false
    }

    async fn execute(&self, ctx: &OperationContext) -> Result<TaskOutput, TaskFailure> {
        let received = ctx.uploads.wait(&ctx.task_id, self.wait_limit).await;
        ctx.uploads.remove(&ctx.task_id);
        let file = received?;

        let mut output = TaskOutput::with_url(task_location(
            &self.storage_base_url,
            ctx,
            &file.filename,
        ))
        .meta("filename", file.filename.clone())
        .meta("size", file.size());
        if let Some(format) = extension(&file.filename) {
            output = output.meta("format", format);
        }
        Ok(output)
    }
}

/// `convert`: one input into `output_format`
pub struct Convert {
    storage_base_url: String,
}

#[async_trait]
impl OperationHandler for Convert {
    fn operation(&self) -> &str {
        CONVERT
    }

    fn options_schema(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "properties": {
                "quality": { "type": "integer", "minimum": 1, "maximum": 100 },
                "width": { "type": "integer", "minimum": 1 },
                "height": { "type": "integer", "minimum": 1 }
            }
        }))
    }

    fn validate_options(&self, spec: &TaskSpec) -> Result<(), String> {
        require_output_format(spec)?;
        let inputs = spec.input_names().len();
        if inputs != 1 {
            return Err(format!("'convert' takes exactly one input, got {inputs}"));
        }
        let schema = self.options_schema().unwrap_or(Value::Null);
        validate_with_schema(&schema, &Value::Object(spec.options.clone()))
    }

    async fn execute(&self, ctx: &OperationContext) -> Result<TaskOutput, TaskFailure> {
        let input = ctx.single_input()?;
        let target = output_format(ctx)?;
        let source = input.output.format().map(str::to_lowercase);

        if let Some(expected) = ctx.param_str("input_format") {
            if let Some(actual) = source.as_deref() {
                if !actual.eq_ignore_ascii_case(expected) {
                    return Err(TaskFailure::new(
                        CODE_INVALID_INPUT_FORMAT,
                        format!("input '{}' is {actual}, expected {expected}", input.reference),
                    ));
                }
            }
        }

        let base = input
            .output
            .filename()
            .map(|f| stem(f).to_string())
            .unwrap_or_else(|| ctx.task_name.clone());
        let filename = format!("{base}.{target}");
        let mut output = TaskOutput::with_url(task_location(&self.storage_base_url, ctx, &filename))
            .meta("filename", filename)
            .meta("format", target);
        if let Some(source) = source {
            output = output.meta("source_format", source);
        }
        Ok(output)
    }
}

/// `merge`: two or more inputs into one document
pub struct Merge {
    storage_base_url: String,
}

#[async_trait]
impl OperationHandler for Merge {
    fn operation(&self) -> &str {
        MERGE
    }

    fn options_schema(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "properties": {
                "pdf_orientation": { "enum": ["portrait", "landscape"] }
            }
        }))
    }

    fn validate_options(&self, spec: &TaskSpec) -> Result<(), String> {
        require_output_format(spec)?;
        let inputs = spec.input_names().len();
        if inputs < 2 {
            return Err(format!("'merge' needs at least two inputs, got {inputs}"));
        }
        let schema = self.options_schema().unwrap_or(Value::Null);
        validate_with_schema(&schema, &Value::Object(spec.options.clone()))
    }

    async fn execute(&self, ctx: &OperationContext) -> Result<TaskOutput, TaskFailure> {
        if ctx.inputs.len() < 2 {
            return Err(TaskFailure::new(
                "invalid_input",
                format!("'merge' needs at least two inputs, got {}", ctx.inputs.len()),
            ));
        }
        let target = output_format(ctx)?;
        let filename = ctx
            .param_str("filename")
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}.{target}", ctx.task_name));
        Ok(
            TaskOutput::with_url(task_location(&self.storage_base_url, ctx, &filename))
                .meta("filename", filename)
                .meta("format", target)
                .meta("merged_files", ctx.inputs.len()),
        )
    }
}

/// `export/url`: publish results under a stable url
pub struct ExportUrl {
    storage_base_url: String,
}

#[async_trait]
impl OperationHandler for ExportUrl {
    fn operation(&self) -> &str {
        EXPORT_URL
    }

    fn validate_options(&self, spec: &TaskSpec) -> Result<(), String> {
        let inputs = spec.input_names().len();
        if inputs == 0 {
            return Err("'export/url' needs at least one input".to_string());
        }
        if inputs > 1 && spec.param_bool("archive_multiple_files") != Some(true) {
            return Err(format!(
                "'export/url' got {inputs} inputs; set archive_multiple_files to export them as one zip"
            ));
        }
        Ok(())
    }

    async fn execute(&self, ctx: &OperationContext) -> Result<TaskOutput, TaskFailure> {
        let (filename, format) = match ctx.inputs.as_slice() {
            [] => {
                return Err(TaskFailure::new(
                    "invalid_input",
                    "'export/url' needs at least one input",
                ))
            }
            [input] => {
                let filename = ctx
                    .param_str("filename")
                    .or_else(|| input.output.filename())
                    .map(str::to_string)
                    .unwrap_or_else(|| ctx.task_name.clone());
                let format = extension(&filename).or_else(|| input.output.format().map(str::to_string));
                (filename, format)
            }
            many => {
                if ctx.param_bool("archive_multiple_files") != Some(true) {
                    return Err(TaskFailure::new(
                        "invalid_input",
                        format!("{} inputs require archive_multiple_files", many.len()),
                    ));
                }
                let base = ctx
                    .param_str("filename")
                    .map(|f| stem(f).to_string())
                    .unwrap_or_else(|| ctx.task_name.clone());
                (format!("{base}.zip"), Some("zip".to_string()))
            }
        };

        let url = format!("{}/{}/{filename}", self.storage_base_url, ctx.job_id);
        let mut output = TaskOutput::with_url(url)
            .meta("filename", filename)
            .meta("files", ctx.inputs.len());
        if let Some(format) = format {
            output = output.meta("format", format);
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::handler::ResolvedInput;
    use crate::executor::uploads::{UploadRegistry, UploadedFile};
    use pretty_assertions::assert_eq;
    use serde_json::Map;

    fn ctx(operation: &str, inputs: Vec<TaskOutput>) -> OperationContext {
        OperationContext {
            job_id: "job1".to_string(),
            task_id: "task1".to_string(),
            task_name: "step".to_string(),
            operation: operation.to_string(),
            inputs: inputs
                .into_iter()
                .enumerate()
                .map(|(i, output)| ResolvedInput {
                    reference: format!("in{i}"),
                    task_id: format!("id{i}"),
                    output,
                })
                .collect(),
            output_format: None,
            options: Map::new(),
            params: Map::new(),
            attempt: 1,
            uploads: UploadRegistry::new(),
        }
    }

    fn png() -> TaskOutput {
        TaskOutput::with_url("https://example.com/dice.png")
            .meta("filename", "dice.png")
            .meta("format", "png")
    }

    #[test]
    fn test_filename_helpers() {
        assert_eq!(
            filename_from_url("https://example.com/a/logo.svg?x=1").as_deref(),
            Some("logo.svg")
        );
        assert_eq!(filename_from_url("https://example.com"), None);
        assert_eq!(filename_from_url("https://example.com/"), None);
        assert_eq!(extension("Report.PDF").as_deref(), Some("pdf"));
        assert_eq!(extension("README"), None);
    }

    #[tokio::test]
    async fn test_import_url_derives_metadata() {
        let mut c = ctx(IMPORT_URL, vec![]);
        c.params.insert("url".into(), json!("https://example.com/img/logo.svg"));
        let out = UrlImport::new(IMPORT_URL, None).execute(&c).await.unwrap();
        assert_eq!(out.url.as_deref(), Some("https://example.com/img/logo.svg"));
        assert_eq!(out.filename(), Some("logo.svg"));
        assert_eq!(out.format(), Some("svg"));
    }

    #[tokio::test]
    async fn test_convert_checks_input_format() {
        let handler = Convert {
            storage_base_url: "https://s".to_string(),
        };
        let mut c = ctx(CONVERT, vec![png()]);
        c.output_format = Some("jpg".to_string());

        let out = handler.execute(&c).await.unwrap();
        assert_eq!(out.url.as_deref(), Some("https://s/job1/task1/dice.jpg"));
        assert_eq!(out.format(), Some("jpg"));

        c.params.insert("input_format".into(), json!("svg"));
        let err = handler.execute(&c).await.unwrap_err();
        assert_eq!(err.error_code, CODE_INVALID_INPUT_FORMAT);
    }

    #[test]
    fn test_static_validation_of_arity() {
        let convert = Convert {
            storage_base_url: String::new(),
        };
        assert!(convert
            .validate_options(&TaskSpec::new(CONVERT).input("a"))
            .is_err());
        assert!(convert
            .validate_options(&TaskSpec::new(CONVERT).input("a").output_format("png").option("quality", 150))
            .is_err());

        let export = ExportUrl {
            storage_base_url: String::new(),
        };
        let two = TaskSpec::new(EXPORT_URL).inputs(["a", "b"]);
        assert!(export.validate_options(&two).is_err());
        assert!(export
            .validate_options(&two.param("archive_multiple_files", true))
            .is_ok());
    }

    #[tokio::test]
    async fn test_export_multiple_files_as_zip() {
        let handler = ExportUrl {
            storage_base_url: "https://s".to_string(),
        };
        let mut c = ctx(EXPORT_URL, vec![png(), png()]);
        c.params.insert("archive_multiple_files".into(), json!(true));
        c.params.insert("filename".into(), json!("bundle.pdf"));
        let out = handler.execute(&c).await.unwrap();
        assert_eq!(out.url.as_deref(), Some("https://s/job1/bundle.zip"));
        assert_eq!(out.format(), Some("zip"));
    }

    #[tokio::test]
    async fn test_upload_import_waits_for_file() {
        let handler = UploadImport {
            upload_base_url: "https://u".to_string(),
            storage_base_url: "https://s".to_string(),
            wait_limit: None,
        };
        let form = handler.upload_form("job1", "task1").unwrap();
        assert_eq!(form.url, "https://u/task1");

        let c = ctx(IMPORT_UPLOAD, vec![]);
        c.uploads.register("task1", form.clone());
        c.uploads
            .complete("task1", UploadedFile::new("tree.jpg", vec![0u8; 4]).with_form(&form))
            .unwrap();

        let out = handler.execute(&c).await.unwrap();
        assert_eq!(out.url.as_deref(), Some("https://s/job1/task1/tree.jpg"));
        assert_eq!(out.metadata.get("size"), Some(&json!(4)));
        assert_eq!(out.format(), Some("jpg"));
    }
}
