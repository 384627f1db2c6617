use crate::matcher::ACCEPT_THRESHOLD;
use std::time::Duration;

/// Tuning shared by the dialogue and quiz engines.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Minimum match score for an utterance to count as correct.
    pub accept_threshold: u8,
    /// Failed attempts before the manual "continue anyway" is offered.
    pub manual_continue_after: u32,
    /// Failed attempts between full recognizer rebuilds.
    pub rebuild_after_attempts: u32,
    /// Consecutive failed restarts before the recognizer is recreated.
    pub max_soft_restarts: u32,
    pub error_restart_delay: Duration,
    /// The dialogue closes once the learner walks further away than this.
    pub close_distance: f32,
    pub quiz_pass_ratio: f64,
    /// Wrong utterances before a quiz word is counted incorrect.
    pub quiz_max_attempts: u32,
    /// Dialogue whose words are used when a dialogue has none of its own.
    pub fallback_quiz_dialogue: u32,
    pub guest: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            accept_threshold: ACCEPT_THRESHOLD,
            manual_continue_after: 3,
            rebuild_after_attempts: 2,
            max_soft_restarts: 2,
            error_restart_delay: Duration::from_millis(300),
            close_distance: 5.0,
            quiz_pass_ratio: 0.6,
            quiz_max_attempts: 3,
            fallback_quiz_dialogue: 1,
            guest: false,
        }
    }
}
