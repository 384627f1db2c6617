pub mod config;
pub mod content;
pub mod dialogue;
pub mod error;
pub mod matcher;
pub mod progress;
pub mod quiz;
pub mod recognition;
pub mod synthesis;

use crate::dialogue::ConversationEntry;
use crate::error::TutorError;
use crate::recognition::RecognitionSignal;
use crate::synthesis::SynthesisSignal;

/// Represents commands that the engines issue to the runtime / UI layer.
///
/// The engines decide; the runtime renders and reports. Nothing in here
/// mutates engine state.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// A dialogue step became visible to the learner.
    EntryRevealed(ConversationEntry),
    /// The learner's line at `step` was accepted.
    EntryCompleted { step: u32 },
    /// History was cut back after a rewind.
    HistoryTruncated { through_step: u32 },
    NpcSpeaking { step: u32 },
    NpcFinished { step: u32 },
    /// Recognition is open for the learner's line.
    ListeningFor { step: u32, phrase: String },
    InterimTranscript { transcript: String },
    RecognitionFeedback {
        step: u32,
        transcript: String,
        score: u8,
        matched_words: Vec<String>,
        accepted: bool,
    },
    /// Enough failed attempts: the learner may continue without a match.
    OfferManualContinue { step: u32 },
    SuggestSignup,
    /// The dialogue is over and the vocabulary quiz should start.
    StartQuiz {
        character_id: String,
        dialogue_id: u32,
    },
    DialogueClosed,
    ShowError(TutorError),
    PresentWord {
        index: usize,
        total: usize,
        prompt: String,
        is_core_word: bool,
    },
    QuizAnswer {
        index: usize,
        heard: String,
        correct: bool,
    },
    SkipRejected { index: usize },
    QuizFinished {
        passed: bool,
        score: u8,
        correct: usize,
        total: usize,
    },
    /// The quiz was closed before its last word.
    QuizClosed,
}

/// What the learner (through the UI) asks an engine to do.
#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    ManualContinue,
    Rewind { step: u32 },
    ReplayAudio { step: u32 },
    /// Distance between the learner and the character, fed every tick.
    UpdateDistance(f32),
    Close,
    /// Debug entry point: jump straight to the quiz handoff.
    ForceComplete,
    SkipWord,
}

/// Everything that can wake an engine's run loop.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Recognition(RecognitionSignal),
    RecognitionRetry { epoch: u64 },
    Synthesis(SynthesisSignal),
    BeatElapsed { generation: u64 },
    Intent(Intent),
}

pub type EventSender = tokio::sync::mpsc::UnboundedSender<EngineEvent>;
pub type EventReceiver = tokio::sync::mpsc::UnboundedReceiver<EngineEvent>;
