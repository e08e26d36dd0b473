//! Schema migrations for the persisted data directory
//!
//! A `.version` file tracks the current schema. Migration runs a linear
//! sequence of `up` steps at startup: back up every JSON file to
//! `backups/<timestamp>/`, transform, then bump `.version`. Rollback applies
//! `down` steps in reverse; rolling back to a future version rejects.

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::info;

use crate::error::{RouterError, RouterResult};

/// JSON files owned by the data directory
pub const DATA_FILES: [&str; 3] = ["users.json", "byok.json", "indexes.json"];
const VERSION_FILE: &str = ".version";
/// Schema version written by a fresh install
pub const BASE_VERSION: u32 = 1;

/// All JSON objects in the data directory, keyed by file name
pub type DataFiles = HashMap<String, Map<String, Value>>;

/// One reversible schema step
pub struct MigrationStep {
    /// Version this step migrates *to*
    pub to_version: u32,
    pub description: &'static str,
    pub up: fn(&mut DataFiles),
    pub down: fn(&mut DataFiles),
}

/// Built-in schema history
pub fn builtin_steps() -> Vec<MigrationStep> {
    vec![
        MigrationStep {
            to_version: 2,
            description: "add disabled flag to API key records",
            up: |files| {
                if let Some(users) = files.get_mut("users.json") {
                    for record in users.values_mut() {
                        if let Some(obj) = record.as_object_mut() {
                            obj.entry("disabled").or_insert(Value::Bool(false));
                        }
                    }
                }
            },
            down: |files| {
                if let Some(users) = files.get_mut("users.json") {
                    for record in users.values_mut() {
                        if let Some(obj) = record.as_object_mut() {
                            obj.remove("disabled");
                        }
                    }
                }
            },
        },
        MigrationStep {
            to_version: 3,
            description: "add name and description to BYOK records",
            up: |files| {
                if let Some(byok) = files.get_mut("byok.json") {
                    for record in byok.values_mut() {
                        if let Some(obj) = record.as_object_mut() {
                            obj.entry("name").or_insert(Value::String(String::new()));
                            obj.entry("description")
                                .or_insert(Value::String(String::new()));
                        }
                    }
                }
            },
            down: |files| {
                if let Some(byok) = files.get_mut("byok.json") {
                    for record in byok.values_mut() {
                        if let Some(obj) = record.as_object_mut() {
                            obj.remove("name");
                            obj.remove("description");
                        }
                    }
                }
            },
        },
    ]
}

/// Applies and reverses schema steps over a data directory
pub struct Migrator {
    data_dir: PathBuf,
    steps: Vec<MigrationStep>,
}

impl Migrator {
    pub fn new(data_dir: impl Into<PathBuf>, steps: Vec<MigrationStep>) -> Self {
        Self {
            data_dir: data_dir.into(),
            steps,
        }
    }

    pub fn with_builtin_steps(data_dir: impl Into<PathBuf>) -> Self {
        Self::new(data_dir, builtin_steps())
    }

    pub fn latest_version(&self) -> u32 {
        self.steps
            .iter()
            .map(|s| s.to_version)
            .max()
            .unwrap_or(BASE_VERSION)
    }

    pub async fn current_version(&self) -> u32 {
        match tokio::fs::read_to_string(self.data_dir.join(VERSION_FILE)).await {
            Ok(raw) => raw.trim().parse().unwrap_or(BASE_VERSION),
            Err(_) => BASE_VERSION,
        }
    }

    /// Apply every pending `up` step, backing files up before each one
    pub async fn migrate_to_latest(&self) -> RouterResult<u32> {
        tokio::fs::create_dir_all(&self.data_dir)
            .await
            .map_err(|e| RouterError::Internal(format!("create data dir: {}", e)))?;
        let mut current = self.current_version().await;

        for step in &self.steps {
            if step.to_version <= current {
                continue;
            }
            info!(
                "Migrating schema v{} -> v{}: {}",
                current, step.to_version, step.description
            );
            self.backup_all().await?;
            let mut files = self.read_files().await?;
            (step.up)(&mut files);
            self.write_files(&files).await?;
            current = step.to_version;
            self.write_version(current).await?;
        }
        Ok(current)
    }

    /// Apply `down` steps in reverse until `target`. Rolling forward through
    /// this entry point is rejected.
    pub async fn rollback(&self, target: u32) -> RouterResult<u32> {
        let mut current = self.current_version().await;
        if target > current {
            return Err(RouterError::Validation(format!(
                "cannot roll back from v{} to future version v{}",
                current, target
            )));
        }

        let mut steps: Vec<&MigrationStep> = self
            .steps
            .iter()
            .filter(|s| s.to_version > target && s.to_version <= current)
            .collect();
        steps.sort_by(|a, b| b.to_version.cmp(&a.to_version));

        for step in steps {
            info!(
                "Rolling back schema v{} (undo: {})",
                step.to_version, step.description
            );
            let mut files = self.read_files().await?;
            (step.down)(&mut files);
            self.write_files(&files).await?;
            current = step.to_version - 1;
            self.write_version(current).await?;
        }
        if current != target {
            self.write_version(target).await?;
            current = target;
        }
        Ok(current)
    }

    /// Snapshot every JSON file into `backups/<timestamp>/`
    async fn backup_all(&self) -> RouterResult<PathBuf> {
        let stamp = chrono::Utc::now().format("%Y%m%d-%H%M%S%.9f").to_string();
        let backup_dir = self.data_dir.join("backups").join(stamp);
        tokio::fs::create_dir_all(&backup_dir)
            .await
            .map_err(|e| RouterError::Internal(format!("create backup dir: {}", e)))?;
        for name in DATA_FILES {
            let src = self.data_dir.join(name);
            if src.exists() {
                tokio::fs::copy(&src, backup_dir.join(name))
                    .await
                    .map_err(|e| RouterError::Internal(format!("backup {}: {}", name, e)))?;
            }
        }
        Ok(backup_dir)
    }

    async fn read_files(&self) -> RouterResult<DataFiles> {
        let mut files = DataFiles::new();
        for name in DATA_FILES {
            let path = self.data_dir.join(name);
            let object = match tokio::fs::read(&path).await {
                Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
                Err(_) => Map::new(),
            };
            files.insert(name.to_string(), object);
        }
        Ok(files)
    }

    async fn write_files(&self, files: &DataFiles) -> RouterResult<()> {
        for (name, object) in files {
            let path = self.data_dir.join(name);
            let tmp = path.with_extension("json.tmp");
            let bytes = serde_json::to_vec_pretty(object)
                .map_err(|e| RouterError::Internal(format!("serialize {}: {}", name, e)))?;
            tokio::fs::write(&tmp, bytes)
                .await
                .map_err(|e| RouterError::Internal(format!("write {}: {}", name, e)))?;
            tokio::fs::rename(&tmp, &path)
                .await
                .map_err(|e| RouterError::Internal(format!("rename {}: {}", name, e)))?;
        }
        Ok(())
    }

    async fn write_version(&self, version: u32) -> RouterResult<()> {
        tokio::fs::write(
            self.data_dir.join(VERSION_FILE),
            format!("{}\n", version),
        )
        .await
        .map_err(|e| RouterError::Internal(format!("write version file: {}", e)))
    }
}
