//! Cleanup action: removes local artifacts once a run no longer needs them.
//! `paths` holds one path per line. Paths that are already gone count as
//! removed.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use log::{debug, info};

use super::command::parse_path_list;
use super::{require, TaskAction};
use crate::error::ActionError;

#[derive(Debug, Clone, Copy, Default)]
pub struct CleanupAction;

fn remove_path(path: &Path) -> Result<bool, ActionError> {
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(ActionError::transient(format!(
            "cannot remove {}: {}",
            path.display(),
            e
        ))),
    }
}

impl TaskAction for CleanupAction {
    fn name(&self) -> &str {
        "cleanup"
    }

    fn required_params(&self) -> &[&'static str] {
        &["paths"]
    }

    fn execute(&self, params: &BTreeMap<String, String>) -> Result<(), ActionError> {
        let paths = parse_path_list(require(params, "paths")?);

        let mut removed = 0;
        for path in &paths {
            if remove_path(Path::new(path))? {
                removed += 1;
            } else {
                debug!("Already absent: {}", path);
            }
        }

        info!("Cleanup removed {} of {} paths", removed, paths.len());
        Ok(())
    }
}
