/// Failures the engines surface to the runtime.
///
/// Transient recognizer/synthesizer errors never appear here: the sessions
/// swallow and retry them. Low match scores are ordinary control flow.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TutorError {
    #[error("No dialogue steps found for character {character_id}, dialogue {dialogue_id}")]
    NoStepsFound {
        character_id: String,
        dialogue_id: u32,
    },
    #[error("No quiz words found for dialogue {dialogue_id}")]
    NoWordsFound { dialogue_id: u32 },
    #[error("Failed to load content: {0}")]
    ContentLoadFailure(String),
    #[error("Speech recognition is unavailable: {0}")]
    RecognitionUnavailable(String),
    #[error("Speech synthesis is unavailable: {0}")]
    SynthesisUnavailable(String),
}

impl TutorError {
    /// Content failures can be retried or closed by the learner. A missing
    /// speech capability cannot be fixed from inside a dialogue.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            TutorError::NoStepsFound { .. }
                | TutorError::NoWordsFound { .. }
                | TutorError::ContentLoadFailure(_)
        )
    }
}
