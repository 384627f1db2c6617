use crate::config::EngineConfig;
use crate::content::{ContentSource, Lesson, QuizWord};
use crate::error::TutorError;
use crate::matcher;
use crate::progress::{DialogueOutcome, ProgressSink};
use crate::recognition::{
    RecognitionResult, RecognizerFactory, SessionOutcome, SpeechRecognitionSession,
};
use crate::{Command, EngineEvent, EventReceiver, EventSender, Intent};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq)]
pub enum QuizState {
    Loading,
    Presenting(usize),
    Correct(usize),
    Incorrect(usize),
    Finished,
    /// Closed before the last word.
    Closed,
    Failed(TutorError),
}

impl QuizState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, QuizState::Finished | QuizState::Closed | QuizState::Failed(_))
    }
}

/// Vocabulary quiz run after a dialogue. Presents one word at a time in the
/// mother language and listens for it in the target language.
pub struct QuizEngine {
    lesson: Lesson,
    config: EngineConfig,
    words: Vec<QuizWord>,
    state: QuizState,
    correct: usize,
    attempts: u32,
    recognition: SpeechRecognitionSession,
    commands: mpsc::Sender<Command>,
    progress: Arc<dyn ProgressSink>,
    outcome: Option<DialogueOutcome>,
}

impl QuizEngine {
    pub fn new(
        lesson: Lesson,
        config: EngineConfig,
        recognizers: Arc<dyn RecognizerFactory>,
        progress: Arc<dyn ProgressSink>,
        commands: mpsc::Sender<Command>,
        events: EventSender,
    ) -> Self {
        let recognition = SpeechRecognitionSession::new(recognizers, events, &config);
        Self {
            lesson,
            config,
            words: vec![],
            state: QuizState::Loading,
            correct: 0,
            attempts: 0,
            recognition,
            commands,
            progress,
            outcome: None,
        }
    }

    pub fn state(&self) -> &QuizState {
        &self.state
    }

    pub fn words(&self) -> &[QuizWord] {
        &self.words
    }

    pub fn correct(&self) -> usize {
        self.correct
    }

    pub fn outcome(&self) -> Option<&DialogueOutcome> {
        self.outcome.as_ref()
    }

    /// Loads the dialogue's words, falling back to the default dialogue's list
    /// when it has none of its own.
    pub async fn load(&mut self, content: &dyn ContentSource) -> Result<()> {
        self.state = QuizState::Loading;
        let dialogue_id = self.lesson.dialogue_id;
        let mut words = match content.quiz_words(dialogue_id).await {
            Ok(words) => words,
            Err(e) => {
                return self
                    .fail(TutorError::ContentLoadFailure(format!("{e:#}")))
                    .await;
            }
        };
        let fallback = self.config.fallback_quiz_dialogue;
        if words.is_empty() && fallback != dialogue_id {
            tracing::warn!(
                "No quiz words for dialogue {}; using dialogue {} instead.",
                dialogue_id,
                fallback
            );
            words = match content.quiz_words(fallback).await {
                Ok(words) => words,
                Err(e) => {
                    return self
                        .fail(TutorError::ContentLoadFailure(format!("{e:#}")))
                        .await;
                }
            };
        }
        if words.is_empty() {
            return self.fail(TutorError::NoWordsFound { dialogue_id }).await;
        }
        tracing::info!("Loaded {} quiz words for dialogue {}.", words.len(), dialogue_id);
        self.words = words;
        Ok(())
    }

    pub async fn start(&mut self) -> Result<()> {
        if self.words.is_empty() {
            let error = TutorError::NoWordsFound {
                dialogue_id: self.lesson.dialogue_id,
            };
            return self.fail(error).await;
        }
        let target = self.lesson.target;
        self.recognition.configure(target);
        if let Err(e) = self.recognition.probe(target) {
            return self
                .fail(TutorError::RecognitionUnavailable(format!("{e:#}")))
                .await;
        }
        if !self.present(0).await? {
            return self.next(0).await;
        }
        Ok(())
    }

    /// Processes events until the quiz finishes or is closed.
    pub async fn run(&mut self, events: &mut EventReceiver) -> Option<DialogueOutcome> {
        while !self.state.is_terminal() {
            let Some(event) = events.recv().await else {
                tracing::warn!("Event stream closed; abandoning quiz.");
                self.recognition.teardown();
                self.state = QuizState::Closed;
                break;
            };
            if let Err(e) = self.handle_event(event).await {
                tracing::error!("Error while handling quiz event: {:?}", e);
            }
        }
        self.outcome.clone()
    }

    pub async fn handle_event(&mut self, event: EngineEvent) -> Result<()> {
        let outcome = match event {
            EngineEvent::Recognition(signal) => self.recognition.handle(signal),
            EngineEvent::RecognitionRetry { epoch } => self.recognition.retry(epoch),
            EngineEvent::Intent(Intent::SkipWord) => return self.skip().await,
            EngineEvent::Intent(Intent::Close) => return self.close().await,
            EngineEvent::Intent(Intent::UpdateDistance(distance)) => {
                if distance > self.config.close_distance {
                    return self.close().await;
                }
                return Ok(());
            }
            // Dialogue-only events.
            _ => return Ok(()),
        };
        match outcome {
            SessionOutcome::Final(result) => self.on_answer(result).await,
            SessionOutcome::Interim(result) => {
                self.send(Command::InterimTranscript {
                    transcript: result.transcript,
                })
                .await
            }
            SessionOutcome::Stalled => {
                let QuizState::Presenting(index) = self.state else {
                    return Ok(());
                };
                tracing::warn!("Quiz recognition stalled on word {}; counted as missed.", index);
                self.count_as_missed(index).await?;
                self.next(index).await
            }
            SessionOutcome::Ignored => Ok(()),
        }
    }

    async fn on_answer(&mut self, result: RecognitionResult) -> Result<()> {
        let QuizState::Presenting(index) = self.state else {
            return Ok(());
        };
        let word = self.words.get(index).context("Quiz index out of range")?;
        let expected = word.term.get(self.lesson.target).to_string();
        let correct = matcher::is_vocabulary_match(&result.transcript, &expected);
        tracing::debug!(
            "Quiz word {}: heard \"{}\" for \"{}\" ({}).",
            index,
            result.transcript,
            expected,
            if correct { "correct" } else { "wrong" }
        );
        self.send(Command::QuizAnswer {
            index,
            heard: result.transcript,
            correct,
        })
        .await?;

        if correct {
            self.correct += 1;
            self.state = QuizState::Correct(index);
            return self.next(index).await;
        }
        self.attempts += 1;
        if self.attempts >= self.config.quiz_max_attempts {
            tracing::info!("Quiz word {} missed {} times; moving on.", index, self.attempts);
            self.state = QuizState::Incorrect(index);
            return self.next(index).await;
        }
        Ok(())
    }

    /// Skips the current word. Counts as incorrect; core words cannot be
    /// skipped.
    pub async fn skip(&mut self) -> Result<()> {
        let QuizState::Presenting(index) = self.state else {
            return Ok(());
        };
        let is_core = self.words.get(index).is_some_and(|w| w.is_core_word);
        if is_core {
            return self.send(Command::SkipRejected { index }).await;
        }
        tracing::debug!("Quiz word {} skipped.", index);
        self.state = QuizState::Incorrect(index);
        self.next(index).await
    }

    pub async fn close(&mut self) -> Result<()> {
        if self.state.is_terminal() {
            return Ok(());
        }
        self.recognition.teardown();
        self.state = QuizState::Closed;
        tracing::info!("Quiz for dialogue {} closed.", self.lesson.dialogue_id);
        self.send(Command::QuizClosed).await
    }

    /// A word that could not be heard at all is scored as a miss, core or not.
    async fn count_as_missed(&mut self, index: usize) -> Result<()> {
        self.state = QuizState::Incorrect(index);
        self.send(Command::QuizAnswer {
            index,
            heard: String::new(),
            correct: false,
        })
        .await
    }

    /// Presents the word after `index`, passing over any whose recognition
    /// cannot be opened, or finishes the quiz.
    async fn next(&mut self, index: usize) -> Result<()> {
        self.recognition.stop();
        let mut index = index + 1;
        while index < self.words.len() {
            if self.present(index).await? {
                return Ok(());
            }
            index += 1;
        }
        self.finish().await
    }

    /// Returns whether the word is now being listened for.
    async fn present(&mut self, index: usize) -> Result<bool> {
        let word = self.words.get(index).context("Quiz index out of range")?;
        let prompt = word.term.get(self.lesson.mother).to_string();
        let expected = word.term.get(self.lesson.target).to_string();
        let is_core_word = word.is_core_word;
        self.state = QuizState::Presenting(index);
        self.attempts = 0;
        self.send(Command::PresentWord {
            index,
            total: self.words.len(),
            prompt,
            is_core_word,
        })
        .await?;
        if let Err(e) = self.recognition.listen_for(&expected) {
            tracing::warn!("Could not open recognition for quiz word {}: {:?}", index, e);
            self.count_as_missed(index).await?;
            return Ok(false);
        }
        Ok(true)
    }

    async fn finish(&mut self) -> Result<()> {
        self.recognition.teardown();
        let total = self.words.len();
        let passed = self.correct as f64 / total as f64 >= self.config.quiz_pass_ratio;
        let score = (100.0 * self.correct as f64 / total as f64).round() as u8;
        self.state = QuizState::Finished;
        tracing::info!(
            "Quiz for dialogue {} finished: {}/{} correct, passed: {}.",
            self.lesson.dialogue_id,
            self.correct,
            total,
            passed
        );
        self.outcome = Some(DialogueOutcome {
            dialogue_id: self.lesson.dialogue_id,
            character_id: self.lesson.character_id.clone(),
            passed,
            score,
        });
        self.send(Command::QuizFinished {
            passed,
            score,
            correct: self.correct,
            total,
        })
        .await?;
        if let Err(e) = self
            .progress
            .report_dialogue_outcome(
                self.lesson.dialogue_id,
                &self.lesson.character_id,
                passed,
                score,
            )
            .await
        {
            tracing::warn!("Failed to report quiz outcome: {:?}", e);
        }
        Ok(())
    }

    async fn fail(&mut self, error: TutorError) -> Result<()> {
        tracing::error!("Quiz failed: {}", error);
        self.recognition.teardown();
        self.state = QuizState::Failed(error.clone());
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::fixtures::word;
    use crate::content::{ContentLibrary, Language, MockContentSource};
    use crate::progress::MockProgressSink;
    use crate::recognition::testing::FakeRecognizerFactory;
    use std::time::Duration;

    struct Harness {
        engine: QuizEngine,
        events: EventReceiver,
        intents: EventSender,
        commands: mpsc::Receiver<Command>,
        recognizers: FakeRecognizerFactory,
        seen: Vec<Command>,
    }

    fn lesson(dialogue_id: u32) -> Lesson {
        Lesson {
            character_id: "anna".to_string(),
            dialogue_id,
            target: Language::En,
            mother: Language::Ru,
        }
    }

    fn quiet_progress() -> MockProgressSink {
        let mut progress = MockProgressSink::new();
        progress
            .expect_report_dialogue_outcome()
            .returning(|_, _, _, _| Ok(()));
        progress
    }

    impl Harness {
        fn build(dialogue_id: u32, progress: MockProgressSink) -> Self {
            let (tx, events) = mpsc::unbounded_channel();
            let (command_tx, commands) = mpsc::channel(512);
            let recognizers = FakeRecognizerFactory::default();
            let engine = QuizEngine::new(
                lesson(dialogue_id),
                EngineConfig::default(),
                Arc::new(recognizers.clone()),
                Arc::new(progress),
                command_tx,
                tx.clone(),
            );
            Self {
                engine,
                events,
                intents: tx,
                commands,
                recognizers,
                seen: vec![],
            }
        }

        async fn started(words: Vec<QuizWord>, progress: MockProgressSink) -> Self {
            let mut harness = Self::build(1, progress);
            let mut library = ContentLibrary::new();
            library.add_words(words);
            harness.engine.load(&library).await.unwrap();
            harness.engine.start().await.unwrap();
            harness.settle().await;
            harness
        }

        async fn settle(&mut self) {
            while !self.engine.state().is_terminal() {
                match tokio::time::timeout(Duration::from_secs(60), self.events.recv()).await {
                    Ok(Some(event)) => self.engine.handle_event(event).await.unwrap(),
                    _ => break,
                }
            }
            while let Ok(command) = self.commands.try_recv() {
                self.seen.push(command);
            }
        }

        async fn say(&mut self, transcript: &str) {
            self.recognizers.say(transcript);
            self.settle().await;
        }

        async fn skip(&mut self) {
            self.intents.send(EngineEvent::Intent(Intent::SkipWord)).unwrap();
            self.settle().await;
        }

        fn finished(&self) -> Option<&Command> {
            self.seen
                .iter()
                .find(|c| matches!(c, Command::QuizFinished { .. }))
        }
    }

    fn five_words() -> Vec<QuizWord> {
        vec![
            word(1, "hello", true),
            word(2, "friend", false),
            word(3, "meet", true),
            word(4, "nice", false),
            word(5, "there", true),
        ]
    }

    #[tokio::test(start_paused = true)]
    async fn first_word_is_prompted_in_the_mother_language() {
        let h = Harness::started(five_words(), quiet_progress()).await;

        assert_eq!(h.engine.state(), &QuizState::Presenting(0));
        assert!(h.seen.contains(&Command::PresentWord {
            index: 0,
            total: 5,
            prompt: "ru:hello".to_string(),
            is_core_word: true,
        }));
        assert_eq!(h.recognizers.log.lock().unwrap().created[0].0, Language::En);
    }

    #[tokio::test(start_paused = true)]
    async fn three_correct_and_two_skipped_passes() {
        let mut progress = MockProgressSink::new();
        progress
            .expect_report_dialogue_outcome()
            .withf(|dialogue_id, character_id, passed, score| {
                *dialogue_id == 1 && character_id == "anna" && *passed && *score == 60
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        let mut h = Harness::started(five_words(), progress).await;

        h.say("hello").await;
        h.skip().await;
        h.say("meet").await;
        h.skip().await;
        h.say("there").await;

        assert_eq!(h.engine.state(), &QuizState::Finished);
        assert_eq!(
            h.finished(),
            Some(&Command::QuizFinished {
                passed: true,
                score: 60,
                correct: 3,
                total: 5
            })
        );
        assert_eq!(
            h.engine.outcome(),
            Some(&DialogueOutcome {
                dialogue_id: 1,
                character_id: "anna".to_string(),
                passed: true,
                score: 60,
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn core_words_cannot_be_skipped() {
        let mut h = Harness::started(five_words(), quiet_progress()).await;

        h.skip().await;
        assert_eq!(h.engine.state(), &QuizState::Presenting(0));
        assert!(h.seen.contains(&Command::SkipRejected { index: 0 }));
    }

    #[tokio::test(start_paused = true)]
    async fn close_pronunciations_count_as_correct() {
        let mut h = Harness::started(five_words(), quiet_progress()).await;

        h.say("Hello!").await;
        assert_eq!(h.engine.state(), &QuizState::Presenting(1));
        h.say("friends").await;
        assert_eq!(h.engine.state(), &QuizState::Presenting(2));
        assert_eq!(h.engine.correct(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_wrong_answers_move_on_as_incorrect() {
        let mut h = Harness::started(five_words(), quiet_progress()).await;

        h.say("goodbye").await;
        h.say("goodbye").await;
        assert_eq!(h.engine.state(), &QuizState::Presenting(0));
        h.say("goodbye").await;
        assert_eq!(h.engine.state(), &QuizState::Presenting(1));
        assert_eq!(h.engine.correct(), 0);
        let wrong = h
            .seen
            .iter()
            .filter(|c| matches!(c, Command::QuizAnswer { correct: false, .. }))
            .count();
        assert_eq!(wrong, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_below_the_ratio_is_reported() {
        let mut progress = MockProgressSink::new();
        progress
            .expect_report_dialogue_outcome()
            .withf(|_, _, passed, score| !*passed && *score == 50)
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        let words = vec![word(1, "hello", false), word(2, "friend", false)];
        let mut h = Harness::started(words, progress).await;

        h.say("hello").await;
        h.skip().await;

        assert_eq!(h.engine.state(), &QuizState::Finished);
        assert!(matches!(
            h.finished(),
            Some(Command::QuizFinished { passed: false, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_words_fall_back_to_the_default_dialogue() {
        let mut h = Harness::build(7, quiet_progress());
        let mut library = ContentLibrary::new();
        library.add_words(five_words());

        h.engine.load(&library).await.unwrap();
        assert_eq!(h.engine.words().len(), 5);
        assert_eq!(h.engine.words()[0].dialogue_id, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn no_words_anywhere_is_a_recoverable_failure() {
        let mut content = MockContentSource::new();
        content.expect_quiz_words().times(2).returning(|_| Ok(vec![]));
        let mut h = Harness::build(7, quiet_progress());

        let result = h.engine.load(&content).await;
        h.settle().await;

        assert!(result.is_err());
        let error = TutorError::NoWordsFound { dialogue_id: 7 };
        assert_eq!(h.engine.state(), &QuizState::Failed(error.clone()));
        assert!(error.is_recoverable());
        assert!(h.seen.contains(&Command::ShowError(error)));
    }

    #[tokio::test(start_paused = true)]
    async fn closing_stops_recognition_and_ignores_late_answers() {
        let mut progress = MockProgressSink::new();
        progress.expect_report_dialogue_outcome().never();
        let mut h = Harness::started(five_words(), progress).await;
        let stale = h.recognizers.sink();

        h.intents.send(EngineEvent::Intent(Intent::Close)).unwrap();
        h.settle().await;
        stale.result("hello", 0.9, true);
        if let Ok(event) = h.events.try_recv() {
            h.engine.handle_event(event).await.unwrap();
        }

        assert_eq!(h.engine.state(), &QuizState::Closed);
        assert_eq!(h.engine.correct(), 0);
        assert!(h.engine.outcome().is_none());
        assert_eq!(h.seen.last(), Some(&Command::QuizClosed));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_core_word_is_counted_as_missed() {
        let mut progress = MockProgressSink::new();
        progress
            .expect_report_dialogue_outcome()
            .withf(|_, _, passed, score| !*passed && *score == 50)
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        let words = vec![word(1, "hello", true), word(2, "friend", false)];
        let mut h = Harness::started(words, progress).await;
        // Two failed restarts, then the recreated recognizer fails as well.
        h.recognizers.log.lock().unwrap().failing_starts = 3;

        h.recognizers.sink().end();
        h.settle().await;

        assert_eq!(h.engine.state(), &QuizState::Presenting(1));
        assert!(h.seen.contains(&Command::QuizAnswer {
            index: 0,
            heard: String::new(),
            correct: false,
        }));

        h.say("friend").await;
        assert_eq!(h.engine.state(), &QuizState::Finished);
        assert_eq!(
            h.finished(),
            Some(&Command::QuizFinished {
                passed: false,
                score: 50,
                correct: 1,
                total: 2
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn word_whose_recognition_cannot_open_is_passed_over() {
        let mut h = Harness::build(1, quiet_progress());
        let mut library = ContentLibrary::new();
        library.add_words(vec![word(1, "hello", true), word(2, "friend", false)]);
        h.engine.load(&library).await.unwrap();
        // The first recognizer and its rebuild both fail to start.
        h.recognizers.log.lock().unwrap().failing_starts = 2;

        h.engine.start().await.unwrap();
        h.settle().await;

        assert_eq!(h.engine.state(), &QuizState::Presenting(1));
        assert!(h.seen.contains(&Command::QuizAnswer {
            index: 0,
            heard: String::new(),
            correct: false,
        }));
        h.say("friend").await;
        assert_eq!(h.engine.correct(), 1);
        assert_eq!(h.engine.state(), &QuizState::Finished);
    }

    #[tokio::test(start_paused = true)]
    async fn quiz_finishes_when_no_word_can_be_heard() {
        let mut h = Harness::build(1, quiet_progress());
        let mut library = ContentLibrary::new();
        library.add_words(vec![word(1, "hello", true), word(2, "friend", true)]);
        h.engine.load(&library).await.unwrap();
        h.recognizers.log.lock().unwrap().failing_starts = 4;

        h.engine.start().await.unwrap();
        h.settle().await;

        assert_eq!(h.engine.state(), &QuizState::Finished);
        assert!(matches!(
            h.finished(),
            Some(Command::QuizFinished { correct: 0, total: 2, .. })
        ));
    }
}
