//! External Process and File Helpers
//!
//! Shared plumbing for task actions:
//! - Running external programs (`curl`, `gsutil`, converter commands)
//! - Shell quoting for command templates
//! - Parent directory creation and `.part` staging paths
//! - Line-separated path lists

use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use log::{debug, error};

use crate::error::ActionError;

/// Splits a path list with one path per line. Spaces and commas are part of
/// the path.
pub fn parse_path_list(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Inverse of [`parse_path_list`].
pub fn join_path_list<I, S>(paths: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    paths
        .into_iter()
        .map(|p| p.as_ref().to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Creates the parent directory of `path` if it does not exist.
pub fn ensure_parent_dir(path: &Path) -> Result<(), ActionError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| {
                ActionError::transient(format!("cannot create {}: {}", parent.display(), e))
            })?;
            debug!("Created directory: {}", parent.display());
        }
    }
    Ok(())
}

/// Sibling staging path used while `path` is being written.
pub fn part_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    path.with_file_name(name)
}

/// Moves a fully written staging file into place.
pub fn commit_part(part: &Path, dest: &Path) -> Result<(), ActionError> {
    fs::rename(part, dest).map_err(|e| {
        discard_part(part);
        ActionError::transient(format!(
            "cannot move {} to {}: {}",
            part.display(),
            dest.display(),
            e
        ))
    })
}

/// Removes a staging file, ignoring errors.
pub fn discard_part(part: &Path) {
    if part.exists() {
        if let Err(e) = fs::remove_file(part) {
            debug!("Failed to remove {}: {}", part.display(), e);
        }
    }
}

/// Quotes a value for safe interpolation into a bash command line.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Runs a program directly and maps failures to transient action errors.
pub fn run_program<I, S>(program: &str, args: I) -> Result<(), ActionError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = Command::new(program);
    cmd.args(args);
    let output = cmd
        .output()
        .map_err(|e| ActionError::transient(format!("failed to launch {}: {}", program, e)))?;
    check_output(program, output)
}

/// Runs a command line with `bash -c`, exiting on the first failure.
pub fn run_shell(command_text: &str) -> Result<(), ActionError> {
    debug!("Executing: {}", command_text);
    let output = Command::new("bash")
        .arg("-c")
        .arg(format!("set -e\n{}", command_text))
        .output()
        .map_err(|e| ActionError::transient(format!("failed to launch bash: {}", e)))?;
    check_output("bash", output)
}

fn check_output(program: &str, output: Output) -> Result<(), ActionError> {
    if output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.trim().is_empty() {
            debug!("{} output:\n{}", program, stdout);
        }
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    error!("{} failed with exit code: {:?}", program, output.status.code());
    if !stderr.trim().is_empty() {
        error!("stderr:\n{}", stderr);
    }

    let detail = stderr
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .map(|line| format!(": {}", line.trim()))
        .unwrap_or_default();
    Err(ActionError::Transient(format!(
        "{} exited with status {}{}",
        program,
        output
            .status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string()),
        detail
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_path_list() {
        assert_eq!(parse_path_list("a.csv\nb.parquet"), vec!["a.csv", "b.parquet"]);
        assert_eq!(parse_path_list(" a\n\n\tb \r\n"), vec!["a", "b"]);
        assert_eq!(
            parse_path_list("/data/my work/a.csv\n/data/x,y.parquet"),
            vec!["/data/my work/a.csv", "/data/x,y.parquet"]
        );
        assert!(parse_path_list("  \n ").is_empty());
        assert_eq!(
            parse_path_list(&join_path_list(["/a b/c.csv", "d.csv"])),
            vec!["/a b/c.csv", "d.csv"]
        );
    }

    #[test]
    fn test_part_path() {
        assert_eq!(
            part_path(Path::new("/tmp/zones_2019-01.csv")),
            PathBuf::from("/tmp/zones_2019-01.csv.part")
        );
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_ensure_parent_dir() {
        let temp_dir = tempdir().unwrap();
        let nested = temp_dir.path().join("a/b/out.csv");
        ensure_parent_dir(&nested).unwrap();
        assert!(temp_dir.path().join("a/b").is_dir());
        assert!(ensure_parent_dir(Path::new("relative.csv")).is_ok());
    }

    #[test]
    fn test_commit_part() {
        let temp_dir = tempdir().unwrap();
        let dest = temp_dir.path().join("out.csv");
        let part = part_path(&dest);
        fs::write(&part, "x").unwrap();

        commit_part(&part, &dest).unwrap();
        assert!(dest.exists());
        assert!(!part.exists());
    }

    #[test]
    fn test_run_shell_success_and_failure() {
        let temp_dir = tempdir().unwrap();
        let out = temp_dir.path().join("out.txt");

        run_shell(&format!("echo hello > {}", shell_quote(&out.to_string_lossy()))).unwrap();
        assert_eq!(fs::read_to_string(&out).unwrap().trim(), "hello");

        let err = run_shell("echo boom >&2; exit 3").unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("status 3"));
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_run_program_missing_binary() {
        let err = run_program("definitely-not-a-real-binary", ["--help"]).unwrap_err();
        assert!(err.to_string().contains("failed to launch"));
    }
}
