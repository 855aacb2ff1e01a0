//! Fetch action: brings a remote or local source file into the working
//! directory. HTTP(S) sources go through `curl`; everything else is copied.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use log::info;

use super::command::{commit_part, discard_part, ensure_parent_dir, part_path, run_program};
use super::{require, TaskAction};
use crate::error::ActionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceKind<'a> {
    Http(&'a str),
    Local(&'a str),
}

fn classify(source: &str) -> SourceKind<'_> {
    let lower = source.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        SourceKind::Http(source)
    } else {
        SourceKind::Local(source.strip_prefix("file://").unwrap_or(source))
    }
}

/// Downloads `source` to `destination` via a `.part` staging file.
#[derive(Debug, Clone, Copy, Default)]
pub struct FetchAction;

impl TaskAction for FetchAction {
    fn name(&self) -> &str {
        "fetch"
    }

    fn required_params(&self) -> &[&'static str] {
        &["source", "destination"]
    }

    fn execute(&self, params: &BTreeMap<String, String>) -> Result<(), ActionError> {
        let source = require(params, "source")?;
        let destination = Path::new(require(params, "destination")?);

        ensure_parent_dir(destination)?;
        let part = part_path(destination);
        discard_part(&part);

        let result = match classify(source) {
            SourceKind::Http(url) => {
                let part_arg = part.to_string_lossy().into_owned();
                run_program("curl", ["-sSLf", "-o", part_arg.as_str(), url])
            }
            SourceKind::Local(path) => fs::copy(path, &part)
                .map(|_| ())
                .map_err(|e| ActionError::transient(format!("cannot copy {}: {}", path, e))),
        };

        if let Err(e) = result {
            discard_part(&part);
            return Err(e);
        }
        commit_part(&part, destination)?;

        info!("Fetched {} -> {}", source, destination.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn params(source: &str, destination: &Path) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert("source".to_string(), source.to_string());
        map.insert(
            "destination".to_string(),
            destination.to_string_lossy().into_owned(),
        );
        map
    }

    #[test]
    fn test_classify() {
        assert_eq!(
            classify("https://host/a.csv"),
            SourceKind::Http("https://host/a.csv")
        );
        assert_eq!(classify("HTTP://host/a"), SourceKind::Http("HTTP://host/a"));
        assert_eq!(classify("file:///data/a.csv"), SourceKind::Local("/data/a.csv"));
        assert_eq!(classify("/data/a.csv"), SourceKind::Local("/data/a.csv"));
    }

    #[test]
    fn test_fetch_local_copy() {
        let temp_dir = tempdir().unwrap();
        let source = temp_dir.path().join("zones.csv");
        fs::write(&source, "LocationID,Borough\n1,EWR\n").unwrap();
        let dest = temp_dir.path().join("work/zones_2019-01.csv");

        let uri = format!("file://{}", source.display());
        FetchAction.execute(&params(&uri, &dest)).unwrap();

        assert_eq!(fs::read_to_string(&dest).unwrap(), "LocationID,Borough\n1,EWR\n");
        assert!(!part_path(&dest).exists());
    }

    #[test]
    fn test_fetch_is_idempotent() {
        let temp_dir = tempdir().unwrap();
        let source = temp_dir.path().join("a.csv");
        fs::write(&source, "x\n1\n").unwrap();
        let dest = temp_dir.path().join("b.csv");
        let p = params(&source.to_string_lossy(), &dest);

        FetchAction.execute(&p).unwrap();
        FetchAction.execute(&p).unwrap();
        assert_eq!(fs::read_to_string(&dest).unwrap(), "x\n1\n");
    }

    #[test]
    fn test_fetch_missing_source_leaves_nothing() {
        let temp_dir = tempdir().unwrap();
        let dest = temp_dir.path().join("out.csv");
        let missing = temp_dir.path().join("missing.csv");

        let err = FetchAction
            .execute(&params(&missing.to_string_lossy(), &dest))
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(!dest.exists());
        assert!(!part_path(&dest).exists());
    }

    #[test]
    fn test_fetch_missing_parameter() {
        let err = FetchAction.execute(&BTreeMap::new()).unwrap_err();
        assert_eq!(err, ActionError::MissingParameter("source".to_string()));
        assert!(!err.is_retryable());
    }
}
