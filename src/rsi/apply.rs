//! Sandbox staging and file-change application/rollback (§4.11), grounded in
//! `original_source/core/rsi/loop.py`'s `_implement_hypothesis` /
//! `_apply_changes` / `_rollback_changes`.

use std::path::Path;

use tracing::{info, warn};

use super::types::{ChangeAction, FileChange, ImprovementHypothesis};

/// Copies every file a hypothesis touches into `sandbox_dir` before any mutation,
/// and fills in `FileChange.old` for modify/delete changes from the file's current
/// contents so rollback has something to restore. Fails if there are no changes at
/// all (mirrors the source's "no file changes in hypothesis" early return).
pub fn stage_sandbox(hypothesis: &mut ImprovementHypothesis, sandbox_dir: &Path) -> anyhow::Result<()> {
    if hypothesis.file_changes.is_empty() {
        anyhow::bail!("no file changes in hypothesis");
    }
    std::fs::create_dir_all(sandbox_dir)?;

    for change in &mut hypothesis.file_changes {
        let path = Path::new(&change.file_path);
        if !matches!(change.action, ChangeAction::Create) && path.exists() {
            let content = std::fs::read_to_string(path)?;
            if let Some(name) = path.file_name() {
                std::fs::write(sandbox_dir.join(name), &content)?;
            }
            if change.action == ChangeAction::Delete {
                change.old = content;
            }
        }
    }

    hypothesis.implemented = true;
    Ok(())
}

/// Applies every staged change to the real filesystem, in order. Modify replaces
/// the first occurrence of `old` with `new`; create writes `new` verbatim; delete
/// unlinks the file. Stops at the first hard I/O error; changes already applied
/// are left in place (the caller is expected to have accepted the hypothesis).
pub fn apply_changes(hypothesis: &ImprovementHypothesis) -> anyhow::Result<()> {
    if hypothesis.file_changes.is_empty() {
        warn!(hypothesis = %hypothesis.hypothesis_id, "no file changes in hypothesis");
        return Ok(());
    }

    for change in &hypothesis.file_changes {
        let path = Path::new(&change.file_path);
        match change.action {
            ChangeAction::Modify => {
                if !path.exists() {
                    warn!(file = %change.file_path, "file not found, skipping modify");
                    continue;
                }
                let content = std::fs::read_to_string(path)?;
                if let Some(pos) = content.find(&change.old) {
                    let mut updated = String::with_capacity(content.len());
                    updated.push_str(&content[..pos]);
                    updated.push_str(&change.new);
                    updated.push_str(&content[pos + change.old.len()..]);
                    std::fs::write(path, updated)?;
                    info!(file = %change.file_path, "applied change");
                }
            }
            ChangeAction::Create => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(path, &change.new)?;
                info!(file = %change.file_path, "created file");
            }
            ChangeAction::Delete => {
                if path.exists() {
                    std::fs::remove_file(path)?;
                    info!(file = %change.file_path, "deleted file");
                }
            }
        }
    }

    info!(hypothesis = %hypothesis.hypothesis_id, "applied all changes from hypothesis");
    Ok(())
}

/// Reverses `apply_changes`, walking changes in reverse order: modify replaces
/// `new` back with `old`; create deletes the file it made; delete restores the
/// backed-up content captured during staging.
pub fn rollback_changes(hypothesis: &ImprovementHypothesis) -> anyhow::Result<()> {
    if hypothesis.file_changes.is_empty() {
        return Ok(());
    }

    for change in hypothesis.file_changes.iter().rev() {
        let path = Path::new(&change.file_path);
        match change.action {
            ChangeAction::Modify => {
                if path.exists() {
                    let content = std::fs::read_to_string(path)?;
                    if let Some(pos) = content.find(&change.new) {
                        let mut restored = String::with_capacity(content.len());
                        restored.push_str(&content[..pos]);
                        restored.push_str(&change.old);
                        restored.push_str(&content[pos + change.new.len()..]);
                        std::fs::write(path, restored)?;
                        info!(file = %change.file_path, "rolled back change");
                    }
                }
            }
            ChangeAction::Create => {
                if path.exists() {
                    std::fs::remove_file(path)?;
                    info!(file = %change.file_path, "removed created file");
                }
            }
            ChangeAction::Delete => {
                if !change.old.is_empty() {
                    std::fs::write(path, &change.old)?;
                    info!(file = %change.file_path, "restored file");
                }
            }
        }
    }

    info!(hypothesis = %hypothesis.hypothesis_id, "rolled back changes from hypothesis");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rsi::types::ImprovementHypothesis;
    use chrono::Utc;

    fn hypothesis(changes: Vec<FileChange>) -> ImprovementHypothesis {
        ImprovementHypothesis {
            hypothesis_id: "h1".to_string(),
            created_at: Utc::now(),
            target_benchmark: "coding_tasks".to_string(),
            target_problems: Vec::new(),
            current_score: 0.5,
            expected_improvement: 0.1,
            description: "test".to_string(),
            file_changes: changes,
            implemented: false,
            tested: false,
            accepted: false,
            actual_improvement: None,
            reasoning: String::new(),
            rejection_reason: None,
        }
    }

    #[test]
    fn apply_then_rollback_modify_restores_original_content() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.rs");
        std::fs::write(&file, "fn a() { 1 }\n").unwrap();

        let change = FileChange {
            file_path: file.to_string_lossy().to_string(),
            action: ChangeAction::Modify,
            old: "1".to_string(),
            new: "2".to_string(),
        };
        let mut hyp = hypothesis(vec![change]);
        let sandbox = dir.path().join("sandbox");
        stage_sandbox(&mut hyp, &sandbox).unwrap();
        assert!(hyp.implemented);

        apply_changes(&hyp).unwrap();
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "fn a() { 2 }\n");

        rollback_changes(&hyp).unwrap();
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "fn a() { 1 }\n");
    }

    #[test]
    fn create_then_rollback_removes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("new.rs");
        let change =
            FileChange { file_path: file.to_string_lossy().to_string(), action: ChangeAction::Create, old: String::new(), new: "fn b() {}".to_string() };
        let hyp = hypothesis(vec![change]);
        apply_changes(&hyp).unwrap();
        assert!(file.exists());
        rollback_changes(&hyp).unwrap();
        assert!(!file.exists());
    }

    #[test]
    fn staging_without_file_changes_errors() {
        let dir = tempfile::tempdir().unwrap();
        let mut hyp = hypothesis(Vec::new());
        assert!(stage_sandbox(&mut hyp, dir.path()).is_err());
    }

    #[test]
    fn delete_then_rollback_restores_backed_up_content() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("gone.rs");
        std::fs::write(&file, "original content").unwrap();

        let change = FileChange {
            file_path: file.to_string_lossy().to_string(),
            action: ChangeAction::Delete,
            old: String::new(),
            new: String::new(),
        };
        let mut hyp = hypothesis(vec![change]);
        let sandbox = dir.path().join("sandbox");
        stage_sandbox(&mut hyp, &sandbox).unwrap();
        assert_eq!(hyp.file_changes[0].old, "original content");

        apply_changes(&hyp).unwrap();
        assert!(!file.exists());

        rollback_changes(&hyp).unwrap();
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "original content");
    }
}
