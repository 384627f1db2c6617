use crate::content::Language;
use crate::{EngineEvent, EventSender};
use anyhow::Result;
use std::time::Duration;

const BASE_SPEAKING_MS: u64 = 1500;
const PER_CHARACTER_MS: u64 = 80;
const MAX_SPEAKING_MS: u64 = 10_000;

/// How long to let an avatar talk before the next conversational beat.
///
/// End-of-utterance callbacks are unreliable across platforms, so pacing uses
/// this estimate instead of waiting on them.
pub fn estimate_speaking_delay(text: &str) -> Duration {
    let ms = BASE_SPEAKING_MS + PER_CHARACTER_MS * text.chars().count() as u64;
    Duration::from_millis(ms.min(MAX_SPEAKING_MS))
}

#[derive(Debug, Clone, PartialEq)]
pub enum SynthesisEvent {
    Started,
    Ended,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisSignal {
    pub utterance: u64,
    pub event: SynthesisEvent,
}

#[derive(Debug, Clone)]
pub struct SynthesisSink {
    utterance: u64,
    tx: EventSender,
}

impl SynthesisSink {
    pub fn started(&self) {
        self.emit(SynthesisEvent::Started);
    }

    pub fn ended(&self) {
        self.emit(SynthesisEvent::Ended);
    }

    pub fn failed(&self, message: impl Into<String>) {
        self.emit(SynthesisEvent::Failed(message.into()));
    }

    fn emit(&self, event: SynthesisEvent) {
        let signal = SynthesisSignal {
            utterance: self.utterance,
            event,
        };
        if self.tx.send(EngineEvent::Synthesis(signal)).is_err() {
            tracing::debug!("Synthesis event dropped: engine is gone.");
        }
    }
}

/// The platform text-to-speech primitive.
pub trait SpeechSynthesizer: Send + Sync {
    fn speak(&mut self, text: &str, language: Language, sink: SynthesisSink) -> Result<()>;
    /// Cancels everything queued or playing.
    fn cancel(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CueNotice {
    Started,
    Ended,
}

/// Fire-and-forget playback with at most one utterance in flight.
pub struct SpeechSynthesisCue {
    synthesizer: Box<dyn SpeechSynthesizer>,
    events: EventSender,
    next_utterance: u64,
    in_flight: Option<u64>,
}

impl SpeechSynthesisCue {
    pub fn new(synthesizer: Box<dyn SpeechSynthesizer>, events: EventSender) -> Self {
        Self {
            synthesizer,
            events,
            next_utterance: 0,
            in_flight: None,
        }
    }

    pub fn is_speaking(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Speaks `text`, cancelling whatever was still playing.
    pub fn speak(&mut self, text: &str, language: Language) -> Result<u64> {
        self.cancel();
        self.next_utterance += 1;
        let utterance = self.next_utterance;
        let sink = SynthesisSink {
            utterance,
            tx: self.events.clone(),
        };
        self.synthesizer.speak(text, language, sink)?;
        self.in_flight = Some(utterance);
        Ok(utterance)
    }

    pub fn cancel(&mut self) {
        if self.in_flight.take().is_some() {
            self.synthesizer.cancel();
        }
    }

    /// Filters playback events down to the utterance currently in flight.
    pub fn handle(&mut self, signal: SynthesisSignal) -> Option<CueNotice> {
        if self.in_flight != Some(signal.utterance) {
            return None;
        }
        match signal.event {
            SynthesisEvent::Started => Some(CueNotice::Started),
            SynthesisEvent::Ended => {
                self.in_flight = None;
                Some(CueNotice::Ended)
            }
            SynthesisEvent::Failed(message) => {
                tracing::warn!("Speech synthesis failed: {}", message);
                self.in_flight = None;
                Some(CueNotice::Ended)
            }
        }
    }
}
