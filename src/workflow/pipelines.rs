//! Pipeline Shorthands
//!
//! Builders for the two fixed ingestion shapes:
//!
//! - `download_upload`: fetch → publish → cleanup
//! - `download_convert_upload`: fetch → transform → publish → cleanup
//!
//! Local paths are window-scoped so concurrent runs never share files.

use serde::Deserialize;

use super::model::{TaskEntry, TaskTemplate};
use crate::actions::command::join_path_list;

/// Object key layout used by every shorthand unless overridden.
pub const DEFAULT_OBJECT_KEY: &str = "raw/{dataset}/{year}/{dataset}_{year-month}.{format}";

/// Local download target for pipelines that upload the fetched file.
pub const DEFAULT_LOCAL_FILE: &str = "{work_dir}/{dataset}_{year-month}.{format}";

/// Local download target for pipelines that convert before uploading.
pub const DEFAULT_LOCAL_CSV: &str = "{work_dir}/{dataset}_{year-month}.csv";

fn default_object_key() -> String {
    DEFAULT_OBJECT_KEY.to_string()
}

fn default_local_file() -> String {
    DEFAULT_LOCAL_FILE.to_string()
}

fn default_local_csv() -> String {
    DEFAULT_LOCAL_CSV.to_string()
}

/// A pipeline shorthand as written in a workflow file.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Pipeline {
    DownloadUpload {
        url: String,
        #[serde(default = "default_local_file")]
        local_file: String,
        #[serde(default = "default_object_key")]
        object_key: String,
    },
    DownloadConvertUpload {
        url: String,
        #[serde(default = "default_local_csv")]
        local_csv: String,
        #[serde(default = "default_local_file")]
        local_file: String,
        #[serde(default = "default_object_key")]
        object_key: String,
    },
}

impl Pipeline {
    pub fn kind(&self) -> &'static str {
        match self {
            Pipeline::DownloadUpload { .. } => "download_upload",
            Pipeline::DownloadConvertUpload { .. } => "download_convert_upload",
        }
    }

    /// Expands the shorthand into its task template.
    pub fn template(&self) -> TaskTemplate {
        match self {
            Pipeline::DownloadUpload {
                url,
                local_file,
                object_key,
            } => download_upload(url, local_file, object_key),
            Pipeline::DownloadConvertUpload {
                url,
                local_csv,
                local_file,
                object_key,
            } => download_convert_upload(url, local_csv, local_file, object_key),
        }
    }
}

/// fetch → publish → cleanup
pub fn download_upload(url: &str, local_file: &str, object_key: &str) -> TaskTemplate {
    TaskTemplate::new()
        .with_entry(
            TaskEntry::new("fetch", "fetch")
                .with_param("source", url)
                .with_param("destination", local_file),
        )
        .with_entry(publish_entry(local_file, object_key))
        .with_entry(TaskEntry::new("cleanup", "cleanup").with_param("paths", local_file))
}

/// fetch → transform → publish → cleanup
pub fn download_convert_upload(
    url: &str,
    local_csv: &str,
    local_file: &str,
    object_key: &str,
) -> TaskTemplate {
    TaskTemplate::new()
        .with_entry(
            TaskEntry::new("fetch", "fetch")
                .with_param("source", url)
                .with_param("destination", local_csv),
        )
        .with_entry(
            TaskEntry::new("transform", "transform")
                .with_param("source", local_csv)
                .with_param("destination", local_file),
        )
        .with_entry(publish_entry(local_file, object_key))
        .with_entry(
            TaskEntry::new("cleanup", "cleanup")
                .with_param("paths", join_path_list([local_file, local_csv])),
        )
}

fn publish_entry(local_file: &str, object_key: &str) -> TaskEntry {
    TaskEntry::new("publish", "publish")
        .with_param("source", local_file)
        .with_param("bucket", "{bucket}")
        .with_param("object_key", object_key)
}
