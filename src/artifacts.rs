use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::schema::Snapshot;

/// Run-scoped artifact directory: per-step UI dumps and screenshots, plus
/// the final report. Write failures degrade to empty paths rather than
/// failing the step that produced them.
pub struct RunArtifacts {
    dir: PathBuf,
}

impl RunArtifacts {
    pub fn create(base: &Path, run_id: &str) -> std::io::Result<Self> {
        let dir = base.join(run_id);
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist the step's UI dump and screenshot; returns the paths to
    /// reference from the Snapshot.
    pub fn record_step(&self, step_index: u32, ui_dump: &str, screenshot: &[u8]) -> (String, String) {
        let ui_path = self.dir.join(format!("step_{:03}.ui.json", step_index));
        let shot_path = self.dir.join(format!("step_{:03}.png", step_index));

        let ui = match fs::write(&ui_path, ui_dump) {
            Ok(_) => ui_path.display().to_string(),
            Err(e) => {
                warn!("⚠️ [Artifacts] ui dump write failed: {}", e);
                String::new()
            }
        };
        let shot = match fs::write(&shot_path, screenshot) {
            Ok(_) => shot_path.display().to_string(),
            Err(e) => {
                warn!("⚠️ [Artifacts] screenshot write failed: {}", e);
                String::new()
            }
        };
        (ui, shot)
    }

    pub fn write_report<R: Serialize>(&self, report: &R) {
        let path = self.dir.join("report.json");
        match serde_json::to_string_pretty(report) {
            Ok(json) => {
                if let Err(e) = fs::write(&path, json) {
                    warn!("⚠️ [Artifacts] report write failed: {}", e);
                }
            }
            Err(e) => warn!("⚠️ [Artifacts] report serialize failed: {}", e),
        }
    }
}

/// End-of-run summary: the full Snapshot trail plus aggregate counts,
/// sufficient to reconstruct the run without re-execution.
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub plan_title: String,
    pub app: String,
    pub ok: bool,
    pub stopped_by_user: bool,
    pub steps_total: usize,
    pub steps_ok: usize,
    pub snapshots: Vec<Snapshot>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_record_step_writes_both_artifacts() {
        let dir = tempdir().unwrap();
        let artifacts = RunArtifacts::create(dir.path(), "run-1").unwrap();
        let (ui, shot) = artifacts.record_step(3, "{\"class\":\"FrameLayout\"}", &[1, 2, 3]);
        assert!(ui.ends_with("step_003.ui.json"));
        assert!(shot.ends_with("step_003.png"));
        assert!(std::path::Path::new(&ui).exists());
        assert!(std::path::Path::new(&shot).exists());
    }
}
