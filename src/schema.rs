use std::path::{Path, PathBuf};

use serde_json::Value;
use tempfile::TempDir;
use tracing::debug;

use crate::error::CodexError;

/// An output schema written to `schema.json` inside a private temp directory.
///
/// The directory is removed on [`close`](OutputSchemaFile::close) or drop.
#[derive(Debug)]
pub(crate) struct OutputSchemaFile {
    dir: TempDir,
    path: PathBuf,
}

impl OutputSchemaFile {
    pub(crate) fn create(schema: &Value) -> Result<Self, CodexError> {
        if !schema.is_object() {
            return Err(CodexError::Schema(
                "output schema must be a JSON object".into(),
            ));
        }
        let data = serde_json::to_vec(schema)
            .map_err(|e| CodexError::Schema(format!("serialize output schema: {e}")))?;

        let dir = tempfile::Builder::new()
            .prefix("codex-output-schema-")
            .tempdir()
            .map_err(|e| CodexError::Schema(format!("create schema temp dir: {e}")))?;
        let path = dir.path().join("schema.json");
        std::fs::write(&path, data)
            .map_err(|e| CodexError::Schema(format!("write schema file: {e}")))?;

        debug!(path = %path.display(), "output schema written");
        Ok(Self { dir, path })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn close(self) {
        if let Err(err) = self.dir.close() {
            debug!(error = %err, "removing output schema dir");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn writes_schema_and_removes_it_on_close() {
        let schema = json!({"type": "object", "properties": {"headline": {"type": "string"}}});
        let file = OutputSchemaFile::create(&schema).unwrap();
        let path = file.path().to_path_buf();
        assert_eq!(path.file_name().unwrap(), "schema.json");

        let written: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(written, schema);

        let dir = path.parent().unwrap().to_path_buf();
        file.close();
        assert!(!dir.exists());
    }

    #[test]
    fn rejects_non_object_schemas() {
        for schema in [json!(["type"]), json!("object"), json!(null)] {
            assert!(matches!(
                OutputSchemaFile::create(&schema),
                Err(CodexError::Schema(_))
            ));
        }
    }
}
