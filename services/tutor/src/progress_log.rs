use anyhow::{Context, Result};
use async_trait::async_trait;
use lingo_core::progress::{DialogueOutcome, ProgressSink};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;

/// Logs quiz outcomes and, when a path is configured, appends them to a file
/// as JSON lines.
#[derive(Debug, Clone, Default)]
pub struct ProgressLog {
    path: Option<PathBuf>,
}

impl ProgressLog {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }
}

#[async_trait]
impl ProgressSink for ProgressLog {
    async fn report_dialogue_outcome(
        &self,
        dialogue_id: u32,
        character_id: &str,
        passed: bool,
        score: u8,
    ) -> Result<()> {
        tracing::info!(
            "Dialogue {} with {}: passed={}, score={}.",
            dialogue_id,
            character_id,
            passed,
            score
        );
        let Some(path) = &self.path else {
            return Ok(());
        };

        let outcome = DialogueOutcome {
            dialogue_id,
            character_id: character_id.to_string(),
            passed,
            score,
        };
        let mut line = serde_json::to_string(&outcome)?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .with_context(|| format!("Failed to open progress log: {}", path.display()))?;
        file.write_all(line.as_bytes())
            .await
            .with_context(|| format!("Failed to write progress log: {}", path.display()))?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn outcomes_are_appended_as_json_lines() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("progress.jsonl");
        let log = ProgressLog::new(Some(path.clone()));

        log.report_dialogue_outcome(1, "anna", true, 80).await?;
        log.report_dialogue_outcome(4, "driver", false, 40).await?;

        let raw = std::fs::read_to_string(&path)?;
        let outcomes: Vec<DialogueOutcome> = raw
            .lines()
            .map(serde_json::from_str)
            .collect::<Result<_, _>>()?;
        assert_eq!(
            outcomes,
            vec![
                DialogueOutcome {
                    dialogue_id: 1,
                    character_id: "anna".to_string(),
                    passed: true,
                    score: 80,
                },
                DialogueOutcome {
                    dialogue_id: 4,
                    character_id: "driver".to_string(),
                    passed: false,
                    score: 40,
                },
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn without_a_path_nothing_is_written() -> Result<()> {
        let log = ProgressLog::default();
        log.report_dialogue_outcome(1, "anna", true, 100).await
    }

    #[tokio::test]
    async fn unwritable_path_is_an_error() -> Result<()> {
        let dir = tempdir()?;
        // A directory cannot be opened for appending.
        let log = ProgressLog::new(Some(dir.path().to_path_buf()));
        assert!(log.report_dialogue_outcome(1, "anna", true, 100).await.is_err());
        Ok(())
    }
}
