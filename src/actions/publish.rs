//! Publish Action
//!
//! Uploads a local file to `<bucket>/<object_key>` through an
//! [`ObjectStore`]. Uploads overwrite, so repeating one is harmless.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::info;

use super::command::{commit_part, discard_part, ensure_parent_dir, part_path, run_program};
use super::{require, TaskAction};
use crate::error::ActionError;

/// Destination for published objects.
pub trait ObjectStore: Send + Sync {
    /// Human-readable URI of an object.
    fn uri(&self, bucket: &str, key: &str) -> String;

    fn put(&self, bucket: &str, key: &str, source: &Path) -> Result<(), ActionError>;
}

/// Stores objects as files under `<root>/<bucket>/<key>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
        self.root.join(bucket).join(key)
    }
}

impl ObjectStore for LocalObjectStore {
    fn uri(&self, bucket: &str, key: &str) -> String {
        format!("file://{}", self.object_path(bucket, key).display())
    }

    fn put(&self, bucket: &str, key: &str, source: &Path) -> Result<(), ActionError> {
        let dest = self.object_path(bucket, key);
        ensure_parent_dir(&dest)?;
        let part = part_path(&dest);
        if let Err(e) = fs::copy(source, &part) {
            discard_part(&part);
            return Err(ActionError::transient(format!(
                "cannot copy {} to {}: {}",
                source.display(),
                dest.display(),
                e
            )));
        }
        commit_part(&part, &dest)
    }
}

/// Uploads with `gsutil cp` to Google Cloud Storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GsutilObjectStore {
    program: String,
}

impl Default for GsutilObjectStore {
    fn default() -> Self {
        Self::new("gsutil")
    }
}

impl GsutilObjectStore {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl ObjectStore for GsutilObjectStore {
    fn uri(&self, bucket: &str, key: &str) -> String {
        format!("gs://{}/{}", bucket, key)
    }

    fn put(&self, bucket: &str, key: &str, source: &Path) -> Result<(), ActionError> {
        let source_arg = source.to_string_lossy().into_owned();
        let target = self.uri(bucket, key);
        run_program(&self.program, ["-q", "cp", source_arg.as_str(), target.as_str()])
    }
}

/// Rejects keys that would escape the bucket or are not relative.
fn check_object_key(key: &str) -> Result<(), ActionError> {
    let invalid = |reason: &str| ActionError::UnsupportedInput {
        path: key.to_string(),
        reason: reason.to_string(),
    };
    if key.starts_with('/') {
        return Err(invalid("object key must be relative"));
    }
    if key.split('/').any(|segment| segment == ".." || segment == ".") {
        return Err(invalid("object key must not contain '.' or '..' segments"));
    }
    if key.ends_with('/') {
        return Err(invalid("object key must name an object, not a prefix"));
    }
    Ok(())
}

/// Uploads `source` to `bucket`/`object_key`.
#[derive(Clone)]
pub struct PublishAction {
    store: Arc<dyn ObjectStore>,
}

impl PublishAction {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }
}

impl TaskAction for PublishAction {
    fn name(&self) -> &str {
        "publish"
    }

    fn required_params(&self) -> &[&'static str] {
        &["source", "bucket", "object_key"]
    }

    fn execute(&self, params: &BTreeMap<String, String>) -> Result<(), ActionError> {
        let source = Path::new(require(params, "source")?);
        let bucket = require(params, "bucket")?;
        let key = require(params, "object_key")?;

        check_object_key(key)?;
        if !source.is_file() {
            return Err(ActionError::transient(format!(
                "file to publish {} does not exist",
                source.display()
            )));
        }

        self.store.put(bucket, key, source)?;
        info!("Published {} -> {}", source.display(), self.store.uri(bucket, key));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn params(source: &Path, key: &str) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert("source".to_string(), source.to_string_lossy().into_owned());
        map.insert("bucket".to_string(), "lake".to_string());
        map.insert("object_key".to_string(), key.to_string());
        map
    }

    #[test]
    fn test_publish_to_local_store() {
        let temp_dir = tempdir().unwrap();
        let src = temp_dir.path().join("yellow_tripdata_2019-01.parquet");
        fs::write(&src, "rows").unwrap();
        let store = LocalObjectStore::new(temp_dir.path().join("store"));
        let action = PublishAction::new(Arc::new(store.clone()));

        let key = "raw/yellow_tripdata/2019/yellow_tripdata_2019-01.parquet";
        action.execute(&params(&src, key)).unwrap();
        // overwriting is idempotent
        action.execute(&params(&src, key)).unwrap();

        let object = store.object_path("lake", key);
        assert_eq!(fs::read_to_string(object).unwrap(), "rows");
    }

    #[test]
    fn test_publish_missing_source_is_transient() {
        let temp_dir = tempdir().unwrap();
        let action = PublishAction::new(Arc::new(LocalObjectStore::new(temp_dir.path())));
        let err = action
            .execute(&params(&temp_dir.path().join("nope.csv"), "raw/a.csv"))
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_object_key_validation() {
        assert!(check_object_key("raw/zone_data/2021/zone_data_2021-05.parquet").is_ok());
        assert!(check_object_key("/raw/a").is_err());
        assert!(check_object_key("raw/../../etc/passwd").is_err());
        assert!(check_object_key("raw/").is_err());
    }

    #[test]
    fn test_gsutil_uri() {
        let store = GsutilObjectStore::default();
        assert_eq!(store.uri("lake", "raw/a.parquet"), "gs://lake/raw/a.parquet");
    }

    #[test]
    fn test_gsutil_missing_binary_is_transient() {
        let temp_dir = tempdir().unwrap();
        let src = temp_dir.path().join("a.csv");
        fs::write(&src, "a").unwrap();
        let store = GsutilObjectStore::new("definitely-not-gsutil");
        let err = store.put("lake", "raw/a.csv", &src).unwrap_err();
        assert!(err.is_retryable());
    }
}
