use crate::config::EngineConfig;
use crate::content::{ContentSource, DialogueStep, Lesson, Speaker};
use crate::error::TutorError;
use crate::matcher;
use crate::recognition::{
    RecognitionResult, RecognizerFactory, SessionOutcome, SpeechRecognitionSession,
};
use crate::synthesis::{
    CueNotice, SpeechSynthesisCue, SpeechSynthesizer, estimate_speaking_delay,
};
use crate::{Command, EngineEvent, EventReceiver, EventSender, Intent};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A dialogue step once it has been revealed to the learner.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationEntry {
    /// Id of the source step.
    pub id: u32,
    pub step: u32,
    pub speaker: Speaker,
    /// Text in the target language.
    pub phrase: String,
    pub transcription: String,
    /// Text in the mother language.
    pub translation: String,
    pub is_completed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DialogueState {
    Loading,
    Initializing,
    AwaitingUserSpeech,
    AdvancingToNpc,
    /// The quiz handoff has been issued.
    Completed,
    /// Closed before the end. Not an error.
    Aborted,
    Failed(TutorError),
}

impl DialogueState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DialogueState::Completed | DialogueState::Aborted | DialogueState::Failed(_)
        )
    }
}

/// What the learner should be doing right now.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    Listen,
    Speak { phrase: String },
    TryAgain { phrase: String, attempts: u32 },
    ContinueAvailable,
    Finished,
}

/// Read-only view handed to the UI.
#[derive(Debug, Clone, PartialEq)]
pub struct DialogueSnapshot {
    pub state: DialogueState,
    pub current_step: Option<u32>,
    pub attempts: u32,
    pub history: Vec<ConversationEntry>,
    pub instruction: Instruction,
}

struct PendingBeat {
    generation: u64,
    after_step: u32,
    handle: JoinHandle<()>,
}

/// Drives one dialogue from the first NPC line to the quiz handoff.
///
/// The engine is the only writer of the step pointer and the history. The
/// UI sends [`Intent`]s through the event stream and renders [`Command`]s.
pub struct DialogueEngine {
    lesson: Lesson,
    config: EngineConfig,
    steps: Vec<DialogueStep>,
    history: Vec<ConversationEntry>,
    current_step: Option<u32>,
    attempts: u32,
    state: DialogueState,
    instruction: Instruction,
    recognition: SpeechRecognitionSession,
    synthesis: SpeechSynthesisCue,
    commands: mpsc::Sender<Command>,
    events: EventSender,
    beat: Option<PendingBeat>,
    beat_generation: u64,
    speaking_step: Option<u32>,
    // Wraps accept-and-advance so overlapping accepts cannot both advance.
    advancing: bool,
    quiz_handed_off: bool,
}

impl DialogueEngine {
    pub fn new(
        lesson: Lesson,
        config: EngineConfig,
        recognizers: Arc<dyn RecognizerFactory>,
        synthesizer: Box<dyn SpeechSynthesizer>,
        commands: mpsc::Sender<Command>,
        events: EventSender,
    ) -> Self {
        let recognition = SpeechRecognitionSession::new(recognizers, events.clone(), &config);
        let synthesis = SpeechSynthesisCue::new(synthesizer, events.clone());
        Self {
            lesson,
            config,
            steps: vec![],
            history: vec![],
            current_step: None,
            attempts: 0,
            state: DialogueState::Loading,
            instruction: Instruction::Listen,
            recognition,
            synthesis,
            commands,
            events,
            beat: None,
            beat_generation: 0,
            speaking_step: None,
            advancing: false,
            quiz_handed_off: false,
        }
    }

    pub fn state(&self) -> &DialogueState {
        &self.state
    }

    pub fn current_step(&self) -> Option<u32> {
        self.current_step
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn history(&self) -> &[ConversationEntry] {
        &self.history
    }

    pub fn lesson(&self) -> &Lesson {
        &self.lesson
    }

    pub fn snapshot(&self) -> DialogueSnapshot {
        DialogueSnapshot {
            state: self.state.clone(),
            current_step: self.current_step,
            attempts: self.attempts,
            history: self.history.clone(),
            instruction: self.instruction.clone(),
        }
    }

    /// Fetches the script. An empty or failed fetch leaves the engine in a
    /// terminal `Failed` state and tells the UI.
    pub async fn load(&mut self, content: &dyn ContentSource) -> Result<()> {
        self.state = DialogueState::Loading;
        let fetched = content
            .dialogue_steps(&self.lesson.character_id, self.lesson.dialogue_id)
            .await;
        let mut steps = match fetched {
            Ok(steps) => steps,
            Err(e) => {
                return self
                    .fail(TutorError::ContentLoadFailure(format!("{e:#}")))
                    .await;
            }
        };
        if steps.is_empty() {
            let error = self.no_steps();
            return self.fail(error).await;
        }
        steps.sort_by_key(|s| s.step_index);
        steps.dedup_by_key(|s| s.step_index);
        tracing::info!(
            "Loaded {} steps for character {}, dialogue {}.",
            steps.len(),
            self.lesson.character_id,
            self.lesson.dialogue_id
        );
        self.steps = steps;
        Ok(())
    }

    /// Checks the speech capability once, then plays the opening line.
    pub async fn start(&mut self) -> Result<()> {
        let Some(first) = self.steps.first().map(|s| s.step_index) else {
            let error = self.no_steps();
            return self.fail(error).await;
        };
        let target = self.lesson.target;
        self.recognition.configure(target);
        if let Err(e) = self.recognition.probe(target) {
            return self
                .fail(TutorError::RecognitionUnavailable(format!("{e:#}")))
                .await;
        }
        self.state = DialogueState::Initializing;
        tracing::info!("Dialogue {} initializing.", self.lesson.dialogue_id);
        self.enter_step(first).await
    }

    /// Processes events until the dialogue reaches a terminal state.
    pub async fn run(&mut self, events: &mut EventReceiver) -> DialogueState {
        while !self.state.is_terminal() {
            let Some(event) = events.recv().await else {
                tracing::warn!("Event stream closed; aborting dialogue.");
                self.shutdown_speech();
                self.state = DialogueState::Aborted;
                break;
            };
            if let Err(e) = self.handle_event(event).await {
                tracing::error!("Error while handling dialogue event: {:?}", e);
            }
        }
        self.state.clone()
    }

    pub async fn handle_event(&mut self, event: EngineEvent) -> Result<()> {
        match event {
            EngineEvent::Recognition(signal) => {
                let outcome = self.recognition.handle(signal);
                self.on_recognition(outcome).await
            }
            EngineEvent::RecognitionRetry { epoch } => {
                let outcome = self.recognition.retry(epoch);
                self.on_recognition(outcome).await
            }
            EngineEvent::Synthesis(signal) => {
                let step = self.speaking_step;
                match (self.synthesis.handle(signal), step) {
                    (Some(CueNotice::Started), Some(step)) => {
                        self.send(Command::NpcSpeaking { step }).await
                    }
                    (Some(CueNotice::Ended), Some(step)) => {
                        self.speaking_step = None;
                        self.send(Command::NpcFinished { step }).await
                    }
                    _ => Ok(()),
                }
            }
            EngineEvent::BeatElapsed { generation } => self.on_beat(generation).await,
            EngineEvent::Intent(intent) => self.on_intent(intent).await,
        }
    }

    async fn on_intent(&mut self, intent: Intent) -> Result<()> {
        match intent {
            Intent::ManualContinue => self.manual_continue().await,
            Intent::Rewind { step } => self.rewind(step).await,
            Intent::ReplayAudio { step } => self.replay_audio(step).await,
            Intent::UpdateDistance(distance) => self.update_distance(distance).await,
            Intent::Close => self.close().await,
            Intent::ForceComplete => self.force_complete_dialogue().await,
            Intent::SkipWord => Ok(()),
        }
    }

    async fn on_recognition(&mut self, outcome: SessionOutcome) -> Result<()> {
        match outcome {
            SessionOutcome::Final(result) => self.on_final_result(result).await,
            SessionOutcome::Interim(result) => {
                self.send(Command::InterimTranscript {
                    transcript: result.transcript,
                })
                .await
            }
            SessionOutcome::Stalled => self.recognition_stalled().await,
            SessionOutcome::Ignored => Ok(()),
        }
    }

    async fn on_final_result(&mut self, result: RecognitionResult) -> Result<()> {
        if self.state != DialogueState::AwaitingUserSpeech {
            return Ok(());
        }
        let Some(step) = self.current_step else {
            return Ok(());
        };
        let expected = self
            .entry(step)
            .map(|e| e.phrase.clone())
            .context("No conversation entry for the current step")?;

        let score = matcher::score(&result.transcript, &expected);
        let accepted = score >= self.config.accept_threshold;
        tracing::info!(
            "Step {}: heard \"{}\" (confidence {:.2}), score {} -> {}",
            step,
            result.transcript,
            result.confidence,
            score,
            if accepted { "accepted" } else { "retry" }
        );
        self.send(Command::RecognitionFeedback {
            step,
            transcript: result.transcript.clone(),
            score,
            matched_words: matcher::matched_words(&result.transcript, &expected)
                .into_iter()
                .collect(),
            accepted,
        })
        .await?;

        if accepted {
            return self.accept(step).await;
        }

        self.attempts += 1;
        self.instruction = Instruction::TryAgain {
            phrase: expected,
            attempts: self.attempts,
        };
        if self.config.rebuild_after_attempts > 0
            && self.attempts % self.config.rebuild_after_attempts == 0
        {
            if let Err(e) = self.recognition.hard_reset() {
                tracing::warn!("Recognizer rebuild after failed attempts failed: {:?}", e);
            }
        }
        if self.attempts >= self.config.manual_continue_after {
            self.offer_manual_continue().await?;
        }
        Ok(())
    }

    /// No recognizer can be brought up for the current line, so the learner
    /// may continue by hand right away.
    async fn recognition_stalled(&mut self) -> Result<()> {
        if self.state != DialogueState::AwaitingUserSpeech {
            return Ok(());
        }
        tracing::warn!("Recognition stalled; offering manual continue.");
        self.attempts = self.attempts.max(self.config.manual_continue_after);
        self.offer_manual_continue().await
    }

    async fn offer_manual_continue(&mut self) -> Result<()> {
        let Some(step) = self.current_step else {
            return Ok(());
        };
        self.instruction = Instruction::ContinueAvailable;
        self.send(Command::OfferManualContinue { step }).await
    }

    /// The "continue anyway" affordance: a forced accept once enough attempts
    /// have failed.
    pub async fn manual_continue(&mut self) -> Result<()> {
        if self.state != DialogueState::AwaitingUserSpeech
            || self.attempts < self.config.manual_continue_after
        {
            tracing::debug!("Manual continue ignored: not offered.");
            return Ok(());
        }
        let Some(step) = self.current_step else {
            return Ok(());
        };
        tracing::info!("Step {}: learner continued manually.", step);
        self.accept(step).await
    }

    async fn accept(&mut self, step: u32) -> Result<()> {
        if self.advancing {
            return Ok(());
        }
        self.advancing = true;
        self.recognition.stop();
        self.attempts = 0;
        if let Some(entry) = self.entry_mut(step) {
            entry.is_completed = true;
        }
        let result = match self.send(Command::EntryCompleted { step }).await {
            Ok(()) => self.advance_from(step).await,
            Err(e) => Err(e),
        };
        self.advancing = false;
        result
    }

    /// Moves past `step`: the following line, or the quiz if there is none.
    ///
    /// An NPC line followed by another NPC line speaks that one next rather
    /// than ending the dialogue, so scripts need not alternate speakers. Only
    /// running out of lines completes it.
    async fn advance_from(&mut self, step: u32) -> Result<()> {
        match self.next_step_after(step) {
            Some(next) => self.enter_step(next).await,
            None => self.complete().await,
        }
    }

    /// Reveals `index` and acts on it: NPC lines are spoken and paced, user
    /// lines open recognition.
    async fn enter_step(&mut self, index: u32) -> Result<()> {
        let step = self
            .step(index)
            .cloned()
            .with_context(|| format!("Step {index} is not in the loaded script"))?;
        self.current_step = Some(index);
        let entry = self.reveal(&step);
        self.send(Command::EntryRevealed(entry.clone())).await?;

        match step.speaker {
            Speaker::Npc => {
                if self.state != DialogueState::Initializing {
                    self.state = DialogueState::AdvancingToNpc;
                }
                self.play_npc(&entry);
                Ok(())
            }
            Speaker::User => self.await_user(&entry).await,
        }
    }

    fn play_npc(&mut self, entry: &ConversationEntry) {
        self.instruction = Instruction::Listen;
        self.speaking_step = Some(entry.step);
        if let Err(e) = self.synthesis.speak(&entry.phrase, self.lesson.target) {
            tracing::warn!("Could not speak step {}: {:?}", entry.step, e);
        }
        self.schedule_beat(entry.step, estimate_speaking_delay(&entry.phrase));
    }

    async fn await_user(&mut self, entry: &ConversationEntry) -> Result<()> {
        self.state = DialogueState::AwaitingUserSpeech;
        self.attempts = 0;
        self.instruction = Instruction::Speak {
            phrase: entry.phrase.clone(),
        };
        let listening = self.recognition.listen_for(&entry.phrase);
        self.send(Command::ListeningFor {
            step: entry.step,
            phrase: entry.phrase.clone(),
        })
        .await?;
        if let Err(e) = listening {
            tracing::warn!("Could not open recognition for step {}: {:?}", entry.step, e);
            return self.recognition_stalled().await;
        }
        Ok(())
    }

    async fn on_beat(&mut self, generation: u64) -> Result<()> {
        match self.beat.take() {
            Some(beat) if beat.generation == generation => {
                tracing::debug!("Beat after step {} elapsed.", beat.after_step);
                self.advance_from(beat.after_step).await
            }
            other => {
                self.beat = other;
                tracing::debug!("Ignoring stale beat {}.", generation);
                Ok(())
            }
        }
    }

    /// Cuts history back to `step` and replays from there.
    pub async fn rewind(&mut self, step: u32) -> Result<()> {
        if self.state.is_terminal() || self.state == DialogueState::Loading {
            return Ok(());
        }
        let Some(entry) = self.entry(step).cloned() else {
            tracing::warn!("Cannot rewind to step {}: not revealed.", step);
            return Ok(());
        };
        tracing::info!("Rewinding to step {}.", step);
        self.cancel_beat();
        self.synthesis.cancel();
        self.recognition.stop();
        self.attempts = 0;
        self.history.retain(|e| e.step <= step);
        self.send(Command::HistoryTruncated { through_step: step })
            .await?;
        self.current_step = Some(step);

        match entry.speaker {
            Speaker::Npc => {
                self.state = DialogueState::AdvancingToNpc;
                self.play_npc(&entry);
                Ok(())
            }
            Speaker::User => {
                if let Some(e) = self.entry_mut(step) {
                    e.is_completed = false;
                }
                self.await_user(&entry).await
            }
        }
    }

    /// Speaks a revealed line again without touching dialogue state.
    pub async fn replay_audio(&mut self, step: u32) -> Result<()> {
        if self.state.is_terminal() {
            return Ok(());
        }
        let Some(phrase) = self.entry(step).map(|e| e.phrase.clone()) else {
            return Ok(());
        };
        self.speaking_step = Some(step);
        if let Err(e) = self.synthesis.speak(&phrase, self.lesson.target) {
            tracing::warn!("Could not replay step {}: {:?}", step, e);
        }
        Ok(())
    }

    pub async fn update_distance(&mut self, distance: f32) -> Result<()> {
        if distance > self.config.close_distance && !self.state.is_terminal() {
            tracing::info!("Learner walked away ({:.1} units); closing.", distance);
            return self.close().await;
        }
        Ok(())
    }

    /// Closes the dialogue early. Speech I/O is stopped before anything else
    /// so no stray callback can revive the conversation.
    pub async fn close(&mut self) -> Result<()> {
        if matches!(self.state, DialogueState::Completed | DialogueState::Aborted) {
            return Ok(());
        }
        self.shutdown_speech();
        self.state = DialogueState::Aborted;
        tracing::info!("Dialogue {} closed.", self.lesson.dialogue_id);
        self.send(Command::DialogueClosed).await
    }

    /// Debug entry point that jumps straight to the quiz handoff.
    pub async fn force_complete_dialogue(&mut self) -> Result<()> {
        if self.steps.is_empty() || self.state.is_terminal() {
            return Ok(());
        }
        tracing::info!("Forcing completion of dialogue {}.", self.lesson.dialogue_id);
        self.complete().await
    }

    async fn complete(&mut self) -> Result<()> {
        if self.quiz_handed_off {
            return Ok(());
        }
        self.quiz_handed_off = true;
        self.shutdown_speech();
        self.state = DialogueState::Completed;
        self.instruction = Instruction::Finished;
        tracing::info!(
            "Dialogue {} completed; handing off to the quiz.",
            self.lesson.dialogue_id
        );
        if self.config.guest {
            self.send(Command::SuggestSignup).await?;
        }
        self.send(Command::StartQuiz {
            character_id: self.lesson.character_id.clone(),
            dialogue_id: self.lesson.dialogue_id,
        })
        .await
    }

    fn shutdown_speech(&mut self) {
        self.cancel_beat();
        self.synthesis.cancel();
        self.recognition.teardown();
        self.speaking_step = None;
    }

    fn schedule_beat(&mut self, after_step: u32, delay: Duration) {
        self.cancel_beat();
        let generation = self.beat_generation;
        let tx = self.events.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(EngineEvent::BeatElapsed { generation });
        });
        self.beat = Some(PendingBeat {
            generation,
            after_step,
            handle,
        });
    }

    fn cancel_beat(&mut self) {
        self.beat_generation += 1;
        if let Some(beat) = self.beat.take() {
            beat.handle.abort();
        }
    }

    fn reveal(&mut self, step: &DialogueStep) -> ConversationEntry {
        let entry = ConversationEntry {
            id: step.id,
            step: step.step_index,
            speaker: step.speaker,
            phrase: step.text.get(self.lesson.target).to_string(),
            transcription: step.transcription.get(self.lesson.mother).to_string(),
            translation: step.text.get(self.lesson.mother).to_string(),
            is_completed: step.speaker == Speaker::Npc,
        };
        self.history.retain(|e| e.step != entry.step);
        self.history.push(entry.clone());
        entry
    }

    fn step(&self, index: u32) -> Option<&DialogueStep> {
        self.steps.iter().find(|s| s.step_index == index)
    }

    /// The next loaded step, tolerating gaps in the numbering.
    fn next_step_after(&self, index: u32) -> Option<u32> {
        self.steps
            .iter()
            .map(|s| s.step_index)
            .filter(|&i| i > index)
            .min()
    }

    fn entry(&self, step: u32) -> Option<&ConversationEntry> {
        self.history.iter().find(|e| e.step == step)
    }

    fn entry_mut(&mut self, step: u32) -> Option<&mut ConversationEntry> {
        self.history.iter_mut().find(|e| e.step == step)
    }

    fn no_steps(&self) -> TutorError {
        TutorError::NoStepsFound {
            character_id: self.lesson.character_id.clone(),
            dialogue_id: self.lesson.dialogue_id,
        }
    }

    async fn fail(&mut self, error: TutorError) -> Result<()> {
        tracing::error!("Dialogue failed: {}", error);
        self.shutdown_speech();
        self.state = DialogueState::Failed(error.clone());
        self.send(Command::ShowError(error.clone())).await?;
        Err(error.into())
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .context("Failed to send command to the runtime")
    }
}
