use anyhow::Result;
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};

/// Outcome of a finished dialogue + quiz.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DialogueOutcome {
    pub dialogue_id: u32,
    pub character_id: String,
    pub passed: bool,
    pub score: u8,
}

/// Where quiz results go. The engines do not care whether they are persisted.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn report_dialogue_outcome(
        &self,
        dialogue_id: u32,
        character_id: &str,
        passed: bool,
        score: u8,
    ) -> Result<()>;
}
