//! A restartable speech-recognition session.
//!
//! Platform recognizers stop after every utterance and occasionally wedge
//! after errors. The session hides that: while it is listening for a phrase
//! it restarts the recognizer after each natural end, retries after errors,
//! and rebuilds the recognizer outright when restarting keeps failing.
//!
//! Every recognizer instance is bound to an epoch. Tearing an instance down
//! bumps the epoch, so late events from a dead recognizer are dropped instead
//! of being scored.

use crate::config::EngineConfig;
use crate::content::Language;
use crate::{EngineEvent, EventSender};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;

// Shared by every session so epochs never repeat within a process.
static NEXT_EPOCH: AtomicU64 = AtomicU64::new(1);

fn next_epoch() -> u64 {
    NEXT_EPOCH.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecognitionResult {
    pub transcript: String,
    pub confidence: f32,
    pub is_final: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecognitionEvent {
    Result(RecognitionResult),
    /// The recognizer stopped on its own.
    End,
    Error(String),
}

/// A recognizer event tagged with the epoch of the instance that fired it.
#[derive(Debug, Clone, PartialEq)]
pub struct RecognitionSignal {
    pub epoch: u64,
    pub event: RecognitionEvent,
}

/// Handle a recognizer uses to report back into the engine's event stream.
#[derive(Debug, Clone)]
pub struct RecognitionSink {
    epoch: u64,
    tx: EventSender,
}

impl RecognitionSink {
    pub fn new(epoch: u64, tx: EventSender) -> Self {
        Self { epoch, tx }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn result(&self, transcript: impl Into<String>, confidence: f32, is_final: bool) {
        self.emit(RecognitionEvent::Result(RecognitionResult {
            transcript: transcript.into(),
            confidence,
            is_final,
        }));
    }

    pub fn end(&self) {
        self.emit(RecognitionEvent::End);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.emit(RecognitionEvent::Error(message.into()));
    }

    fn emit(&self, event: RecognitionEvent) {
        let signal = RecognitionSignal {
            epoch: self.epoch,
            event,
        };
        if self.tx.send(EngineEvent::Recognition(signal)).is_err() {
            tracing::debug!("Recognition event dropped: engine is gone.");
        }
    }
}

/// The platform speech-recognition primitive.
pub trait SpeechRecognizer: Send + Sync {
    fn start(&mut self) -> Result<()>;
    fn stop(&mut self);
    fn abort(&mut self);
}

/// Builds recognizers for a language. A failure here means the capability is
/// missing from the environment.
pub trait RecognizerFactory: Send + Sync {
    fn create(&self, language: Language, sink: RecognitionSink)
    -> Result<Box<dyn SpeechRecognizer>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Listening,
}

/// What the owner should do with a recognizer event.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    Final(RecognitionResult),
    Interim(RecognitionResult),
    /// The recognizer could not be brought back; only manual input is left.
    Stalled,
    Ignored,
}

pub struct SpeechRecognitionSession {
    factory: Arc<dyn RecognizerFactory>,
    events: EventSender,
    recognizer: Option<Box<dyn SpeechRecognizer>>,
    language: Option<Language>,
    expected: Option<String>,
    state: SessionState,
    // Set when a final result is handed out, cleared when listening restarts.
    processing: bool,
    epoch: u64,
    failed_restarts: u32,
    max_soft_restarts: u32,
    error_restart_delay: Duration,
    retry_task: Option<JoinHandle<()>>,
}

impl SpeechRecognitionSession {
    pub fn new(
        factory: Arc<dyn RecognizerFactory>,
        events: EventSender,
        config: &EngineConfig,
    ) -> Self {
        Self {
            factory,
            events,
            recognizer: None,
            language: None,
            expected: None,
            state: SessionState::Idle,
            processing: false,
            epoch: next_epoch(),
            failed_restarts: 0,
            max_soft_restarts: config.max_soft_restarts,
            error_restart_delay: config.error_restart_delay,
            retry_task: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn language(&self) -> Option<Language> {
        self.language
    }

    pub fn expected_phrase(&self) -> Option<&str> {
        self.expected.as_deref()
    }

    /// Sets the target language. A change tears the current recognizer down.
    pub fn configure(&mut self, language: Language) {
        if self.language != Some(language) {
            if self.language.is_some() {
                tracing::info!("Recognition language changed to {}; tearing down.", language);
            }
            self.teardown();
            self.language = Some(language);
        }
    }

    /// Verifies a recognizer can be built at all, without starting it.
    pub fn probe(&self, language: Language) -> Result<()> {
        let sink = RecognitionSink::new(next_epoch(), self.events.clone());
        let mut recognizer = self.factory.create(language, sink)?;
        recognizer.abort();
        Ok(())
    }

    /// Opens recognition for `phrase` on a fresh recognizer instance.
    pub fn listen_for(&mut self, phrase: &str) -> Result<()> {
        let language = self
            .language
            .context("Recognition session used before configure()")?;
        self.teardown();
        self.language = Some(language);
        self.expected = Some(phrase.to_string());
        self.state = SessionState::Listening;
        if let Err(e) = self.open(language) {
            self.state = SessionState::Idle;
            return Err(e);
        }
        tracing::debug!("Listening for \"{}\" (epoch {}).", phrase, self.epoch);
        Ok(())
    }

    fn open(&mut self, language: Language) -> Result<()> {
        self.recognizer = Some(self.build(language)?);
        if let Err(e) = self.start_recognizer() {
            tracing::warn!("Recognizer failed to start ({e:?}); rebuilding.");
            self.hard_reset()?;
        }
        Ok(())
    }

    /// Deliberate stop: no auto-restart until `listen_for` is called again.
    pub fn stop(&mut self) {
        self.cancel_retry();
        self.state = SessionState::Idle;
        if let Some(recognizer) = self.recognizer.as_mut() {
            recognizer.stop();
        }
    }

    /// Aborts and drops the recognizer. Pending events from it become stale.
    pub fn teardown(&mut self) {
        self.cancel_retry();
        if let Some(mut recognizer) = self.recognizer.take() {
            recognizer.abort();
        }
        self.epoch = next_epoch();
        self.state = SessionState::Idle;
        self.expected = None;
        self.processing = false;
        self.failed_restarts = 0;
    }

    /// Replaces the recognizer with a brand-new instance bound to the same
    /// event stream, restarting it if the session is listening.
    pub fn hard_reset(&mut self) -> Result<()> {
        let language = self
            .language
            .context("Recognition session reset before configure()")?;
        self.cancel_retry();
        if let Some(mut recognizer) = self.recognizer.take() {
            recognizer.abort();
        }
        self.epoch = next_epoch();
        self.failed_restarts = 0;
        self.processing = false;
        tracing::info!("Recreating recognizer (epoch {}).", self.epoch);
        self.recognizer = Some(self.build(language)?);
        if self.state == SessionState::Listening {
            self.start_recognizer()
                .context("Recreated recognizer failed to start")?;
        }
        Ok(())
    }

    pub fn handle(&mut self, signal: RecognitionSignal) -> SessionOutcome {
        if signal.epoch != self.epoch {
            tracing::debug!(
                "Dropping event from stale recognizer (epoch {} != {}).",
                signal.epoch,
                self.epoch
            );
            return SessionOutcome::Ignored;
        }
        match signal.event {
            RecognitionEvent::Result(result) if !result.is_final => {
                if self.state == SessionState::Listening {
                    SessionOutcome::Interim(result)
                } else {
                    SessionOutcome::Ignored
                }
            }
            RecognitionEvent::Result(result) => {
                if self.state != SessionState::Listening || self.processing {
                    tracing::debug!("Ignoring duplicate final result: \"{}\"", result.transcript);
                    return SessionOutcome::Ignored;
                }
                self.processing = true;
                SessionOutcome::Final(result)
            }
            RecognitionEvent::End => {
                if self.state == SessionState::Listening && self.expected.is_some() {
                    tracing::debug!("Recognizer ended while listening; restarting.");
                    self.restart()
                } else {
                    self.state = SessionState::Idle;
                    SessionOutcome::Ignored
                }
            }
            RecognitionEvent::Error(message) => {
                tracing::warn!("Recognizer error: {}", message);
                if self.state == SessionState::Listening {
                    self.schedule_retry();
                }
                SessionOutcome::Ignored
            }
        }
    }

    /// Runs a retry scheduled after an error.
    pub fn retry(&mut self, epoch: u64) -> SessionOutcome {
        self.retry_task = None;
        if epoch != self.epoch || self.state != SessionState::Listening {
            return SessionOutcome::Ignored;
        }
        self.restart()
    }

    fn restart(&mut self) -> SessionOutcome {
        match self.start_recognizer() {
            Ok(()) => {
                self.failed_restarts = 0;
                SessionOutcome::Ignored
            }
            Err(e) => {
                self.failed_restarts += 1;
                tracing::warn!(
                    "Recognizer restart failed ({} in a row): {:?}",
                    self.failed_restarts,
                    e
                );
                if self.failed_restarts < self.max_soft_restarts {
                    self.schedule_retry();
                    return SessionOutcome::Ignored;
                }
                match self.hard_reset() {
                    Ok(()) => SessionOutcome::Ignored,
                    Err(e) => {
                        tracing::error!("Recognizer could not be recreated: {:?}", e);
                        self.state = SessionState::Idle;
                        SessionOutcome::Stalled
                    }
                }
            }
        }
    }

    fn start_recognizer(&mut self) -> Result<()> {
        let recognizer = self
            .recognizer
            .as_mut()
            .context("No recognizer to start")?;
        recognizer.start()?;
        self.processing = false;
        Ok(())
    }

    fn build(&self, language: Language) -> Result<Box<dyn SpeechRecognizer>> {
        let sink = RecognitionSink::new(self.epoch, self.events.clone());
        self.factory
            .create(language, sink)
            .with_context(|| format!("Failed to create recognizer for {}", language.tag()))
    }

    fn schedule_retry(&mut self) {
        self.cancel_retry();
        let tx = self.events.clone();
        let epoch = self.epoch;
        let delay = self.error_restart_delay;
        self.retry_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(EngineEvent::RecognitionRetry { epoch });
        }));
    }

    fn cancel_retry(&mut self) {
        if let Some(handle) = self.retry_task.take() {
            handle.abort();
        }
    }
}

impl Drop for SpeechRecognitionSession {
    fn drop(&mut self) {
        self.teardown();
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeRecognizerFactory;
    use super::*;
    use crate::EventReceiver;
    use tokio::sync::mpsc;

    fn session(factory: &FakeRecognizerFactory) -> (SpeechRecognitionSession, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut session =
            SpeechRecognitionSession::new(Arc::new(factory.clone()), tx, &EngineConfig::default());
        session.configure(Language::En);
        (session, rx)
    }

    fn next_signal(rx: &mut EventReceiver) -> RecognitionSignal {
        match rx.try_recv().expect("an event should be queued") {
            EngineEvent::Recognition(signal) => signal,
            other => panic!("Expected a recognition event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn final_result_is_delivered_once_per_utterance() {
        let factory = FakeRecognizerFactory::default();
        let (mut session, mut rx) = session(&factory);
        session.listen_for("hi there").unwrap();

        let sink = factory.sink();
        sink.result("hi there", 0.9, true);
        sink.result("hi there", 0.9, true);

        let first = session.handle(next_signal(&mut rx));
        assert!(matches!(first, SessionOutcome::Final(r) if r.transcript == "hi there"));
        assert_eq!(session.handle(next_signal(&mut rx)), SessionOutcome::Ignored);
    }

    #[tokio::test]
    async fn natural_end_restarts_while_listening() {
        let factory = FakeRecognizerFactory::default();
        let (mut session, mut rx) = session(&factory);
        session.listen_for("hi there").unwrap();
        assert_eq!(factory.starts(), 1);

        factory.sink().end();
        session.handle(next_signal(&mut rx));
        assert_eq!(factory.starts(), 2);
        assert_eq!(session.state(), SessionState::Listening);
    }

    #[tokio::test]
    async fn natural_end_after_stop_does_not_restart() {
        let factory = FakeRecognizerFactory::default();
        let (mut session, mut rx) = session(&factory);
        session.listen_for("hi there").unwrap();
        session.stop();

        factory.sink().end();
        session.handle(next_signal(&mut rx));
        assert_eq!(factory.starts(), 1);
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn events_from_torn_down_recognizer_are_dropped() {
        let factory = FakeRecognizerFactory::default();
        let (mut session, mut rx) = session(&factory);
        session.listen_for("hi there").unwrap();
        let stale = factory.sink();

        session.listen_for("nice to meet you").unwrap();
        stale.result("hi there", 1.0, true);
        assert_eq!(session.handle(next_signal(&mut rx)), SessionOutcome::Ignored);
        assert_eq!(factory.created(), 2);
        assert!(factory.aborts() >= 1);
    }

    #[tokio::test]
    async fn language_change_tears_down() {
        let factory = FakeRecognizerFactory::default();
        let (mut session, _rx) = session(&factory);
        session.listen_for("hi there").unwrap();
        let epoch = session.epoch();

        session.configure(Language::Ru);
        assert!(session.epoch() > epoch);
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.expected_phrase(), None);
        assert_eq!(factory.aborts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn error_schedules_a_delayed_restart() {
        let factory = FakeRecognizerFactory::default();
        let (mut session, mut rx) = session(&factory);
        session.listen_for("hi there").unwrap();

        factory.sink().error("network");
        session.handle(next_signal(&mut rx));
        assert_eq!(factory.starts(), 1);

        match rx.recv().await {
            Some(EngineEvent::RecognitionRetry { epoch }) => {
                session.retry(epoch);
            }
            other => panic!("Expected a retry, got {other:?}"),
        }
        assert_eq!(factory.starts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_restart_failures_recreate_the_recognizer() {
        let factory = FakeRecognizerFactory::default();
        let (mut session, mut rx) = session(&factory);
        session.listen_for("hi there").unwrap();
        factory.log.lock().unwrap().failing_starts = 2;

        factory.sink().end();
        session.handle(next_signal(&mut rx));
        // First failure schedules a retry, the second forces a rebuild.
        match rx.recv().await {
            Some(EngineEvent::RecognitionRetry { epoch }) => {
                assert_eq!(session.retry(epoch), SessionOutcome::Ignored);
            }
            other => panic!("Expected a retry, got {other:?}"),
        }
        assert_eq!(factory.created(), 2);
        assert_eq!(factory.starts(), 2);
        assert_eq!(session.state(), SessionState::Listening);
    }

    #[tokio::test]
    async fn listen_for_gives_up_when_the_rebuild_cannot_start() {
        let factory = FakeRecognizerFactory::default();
        let (mut session, _rx) = session(&factory);
        factory.log.lock().unwrap().failing_starts = 2;

        assert!(session.listen_for("hi there").is_err());
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(factory.created(), 2);
        assert_eq!(factory.starts(), 0);
    }

    #[tokio::test]
    async fn unavailable_capability_fails_probe() {
        let factory = FakeRecognizerFactory::unavailable();
        let (session, _rx) = session(&factory);
        assert!(session.probe(Language::En).is_err());
    }
}
