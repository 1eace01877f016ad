//! Filesystem stage
//!
//! Walks the repository checkout and upserts its containment skeleton:
//! `Repository -CONTAINS-> Directory -CONTAINS-> File`. Ids are derived from the
//! repository reference and the path relative to the checkout root, so a second walk of
//! an unchanged tree writes exactly the same keys.

use crate::error::{OrchestratorError, Result};
use crate::pipeline::{Stage, StageContext, StageOptions, StageOutcome};
use async_trait::async_trait;
use repograph_store::{labels, relationships, GraphStore, Properties};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use walkdir::{DirEntry, WalkDir};

pub const FILESYSTEM_STAGE: &str = "filesystem";

/// Directory names never descended into
const IGNORED_DIRS: &[&str] = &[
    "target",
    "node_modules",
    "__pycache__",
    "dist",
    "build",
    "venv",
];

/// Progress is written every this many entries
const PROGRESS_EVERY: usize = 64;

pub fn repository_id(repository_ref: &str) -> String {
    format!("repo:{}", repository_ref)
}

pub fn directory_id(repository_ref: &str, relative: &str) -> String {
    format!("dir:{}/{}", repository_ref, relative)
}

pub fn file_id(repository_ref: &str, relative: &str) -> String {
    format!("file:{}/{}", repository_ref, relative)
}

#[derive(Debug, Clone)]
struct WalkedEntry {
    /// `/`-separated, relative to the checkout root
    relative: String,
    absolute: PathBuf,
    is_dir: bool,
    size: u64,
}

impl WalkedEntry {
    fn parent_relative(&self) -> Option<&str> {
        self.relative.rsplit_once('/').map(|(parent, _)| parent)
    }

    fn name(&self) -> &str {
        self.relative
            .rsplit_once('/')
            .map_or(self.relative.as_str(), |(_, name)| name)
    }
}

/// Repository walk → containment nodes
pub struct FilesystemStage {
    store: Arc<dyn GraphStore>,
    /// Repository references are resolved against this directory when set
    base_dir: Option<PathBuf>,
}

impl FilesystemStage {
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self {
            store,
            base_dir: None,
        }
    }

    pub fn with_base_dir(mut self, base_dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(base_dir.into());
        self
    }

    fn checkout_root(&self, repository_ref: &str) -> PathBuf {
        match &self.base_dir {
            Some(base) => base.join(repository_ref),
            None => PathBuf::from(repository_ref),
        }
    }

    async fn ingest(&self, ctx: &StageContext) -> Result<StageOutcome> {
        let start = Instant::now();
        let repository_ref = ctx.repository_ref.as_str();
        let root = self.checkout_root(repository_ref);
        if !root.is_dir() {
            return Err(OrchestratorError::fatal(format!(
                "repository checkout {} is not a directory",
                root.display()
            )));
        }

        let include_hidden = ctx.options.get_bool("include_hidden").unwrap_or(false);
        let max_depth = ctx
            .options
            .get_u64("max_depth")
            .map_or(usize::MAX, |d| d as usize);
        let walk_root = root.clone();
        let entries = tokio::task::spawn_blocking(move || walk(&walk_root, include_hidden, max_depth))
            .await
            .map_err(|e| OrchestratorError::fatal(format!("filesystem walk failed: {}", e)))?;
        info!(
            repository_ref,
            entries = entries.len(),
            "FilesystemStage: walked {}",
            root.display()
        );

        let repo_id = repository_id(repository_ref);
        let mut repo_props = Properties::new();
        repo_props.insert("name".into(), json!(repository_name(repository_ref, &root)));
        repo_props.insert("path".into(), json!(root.display().to_string()));
        self.store
            .upsert_node(&repo_id, &[labels::REPOSITORY], repo_props)
            .await?;

        let total = entries.len();
        let mut files = 0usize;
        for (i, entry) in entries.iter().enumerate() {
            if ctx.handle.is_cancelled() {
                return Err(OrchestratorError::Cancelled(format!(
                    "filesystem walk interrupted after {} of {} entries",
                    i, total
                )));
            }

            let parent_id = match entry.parent_relative() {
                Some(parent) => directory_id(repository_ref, parent),
                None => repo_id.clone(),
            };
            let mut props = Properties::new();
            props.insert("path".into(), json!(entry.relative));
            props.insert("name".into(), json!(entry.name()));

            let node_id = if entry.is_dir {
                let id = directory_id(repository_ref, &entry.relative);
                self.store
                    .upsert_node(&id, &[labels::DIRECTORY], props)
                    .await?;
                id
            } else {
                props.insert("abs_path".into(), json!(entry.absolute.display().to_string()));
                props.insert("size".into(), json!(entry.size));
                if let Some(ext) = entry.absolute.extension().and_then(|e| e.to_str()) {
                    props.insert("extension".into(), json!(ext));
                }
                let id = file_id(repository_ref, &entry.relative);
                self.store.upsert_node(&id, &[labels::FILE], props).await?;
                files += 1;
                id
            };
            self.store
                .upsert_relationship(&parent_id, &node_id, relationships::CONTAINS, Properties::new())
                .await?;

            if (i + 1) % PROGRESS_EVERY == 0 {
                let percent = ((i + 1) * 100 / total.max(1)) as u8;
                ctx.handle
                    .report_progress(percent, Some(format!("{}/{} entries", i + 1, total)));
            }
        }

        let message = format!(
            "{} files, {} directories in {}ms",
            files,
            total - files,
            start.elapsed().as_millis()
        );
        info!(repository_ref, "FilesystemStage: {}", message);
        Ok(StageOutcome::new(total).with_message(message))
    }
}

#[async_trait]
impl Stage for FilesystemStage {
    fn name(&self) -> &str {
        FILESYSTEM_STAGE
    }

    fn validate_options(&self, options: &StageOptions) -> Result<()> {
        if let Some(value) = options.get("max_depth") {
            if value.as_u64().map_or(true, |d| d == 0) {
                return Err(OrchestratorError::invalid_options(
                    "filesystem.max_depth must be a positive integer",
                ));
            }
        }
        if let Some(value) = options.get("include_hidden") {
            if !value.is_boolean() {
                return Err(OrchestratorError::invalid_options(
                    "filesystem.include_hidden must be a boolean",
                ));
            }
        }
        Ok(())
    }

    async fn run(&self, ctx: StageContext) -> Result<StageOutcome> {
        self.ingest(&ctx).await
    }
}

fn repository_name(repository_ref: &str, root: &Path) -> String {
    root.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .unwrap_or_else(|| repository_ref.to_string())
}

fn is_ignored(entry: &DirEntry, include_hidden: bool) -> bool {
    if entry.depth() == 0 {
        return false;
    }
    let name = entry.file_name().to_string_lossy();
    (!include_hidden && name.starts_with('.'))
        || (entry.file_type().is_dir() && IGNORED_DIRS.contains(&name.as_ref()))
}

/// Sorted walk; parents are always yielded before their contents
fn walk(root: &Path, include_hidden: bool, max_depth: usize) -> Vec<WalkedEntry> {
    let mut entries = Vec::new();
    let walker = WalkDir::new(root)
        .min_depth(1)
        .max_depth(max_depth)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_ignored(e, include_hidden));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("FilesystemStage: skipping unreadable entry: {}", e);
                continue;
            }
        };
        let file_type = entry.file_type();
        if !file_type.is_dir() && !file_type.is_file() {
            debug!("FilesystemStage: skipping {}", entry.path().display());
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let relative = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let size = if file_type.is_file() {
            entry.metadata().map(|m| m.len()).unwrap_or(0)
        } else {
            0
        };
        entries.push(WalkedEntry {
            relative,
            absolute: entry.path().to_path_buf(),
            is_dir: file_type.is_dir(),
            size,
        });
    }
    entries
}
