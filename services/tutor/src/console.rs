//! Text console standing in for the speech platform.
//!
//! Typed lines are "heard" by whichever recognizer is listening, and NPC lines
//! are printed instead of spoken. Lines starting with `/` are learner intents.

use anyhow::{Context, Result};
use lingo_core::content::{Language, Speaker};
use lingo_core::recognition::{RecognitionSink, RecognizerFactory, SpeechRecognizer};
use lingo_core::synthesis::{SpeechSynthesizer, SynthesisSink, estimate_speaking_delay};
use lingo_core::{Command, EngineEvent, EventSender, Intent};
use std::io::{self, BufRead};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;

pub const HELP: &str = "Type the phrase to say it. Commands: /continue, /back <step>, \
/replay <step>, /skip, /distance <units>, /force, /close, /help";

/// The recognizer currently listening to the console, if any.
#[derive(Clone, Default)]
pub struct Microphone {
    active: Arc<Mutex<Option<RecognitionSink>>>,
}

impl Microphone {
    /// Delivers a typed line as one utterance. Like a platform recognizer,
    /// the listener stops after it and has to be started again.
    pub fn hear(&self, line: &str) -> bool {
        let Some(sink) = self.lock().take() else {
            return false;
        };
        sink.result(line, 1.0, true);
        sink.end();
        true
    }

    pub fn is_listening(&self) -> bool {
        self.lock().is_some()
    }

    fn attach(&self, sink: RecognitionSink) {
        *self.lock() = Some(sink);
    }

    fn detach(&self, epoch: u64) {
        let mut active = self.lock();
        if active.as_ref().is_some_and(|s| s.epoch() == epoch) {
            *active = None;
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<RecognitionSink>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct ConsoleRecognizerFactory {
    microphone: Microphone,
}

impl ConsoleRecognizerFactory {
    pub fn new(microphone: Microphone) -> Self {
        Self { microphone }
    }
}

impl RecognizerFactory for ConsoleRecognizerFactory {
    fn create(
        &self,
        language: Language,
        sink: RecognitionSink,
    ) -> Result<Box<dyn SpeechRecognizer>> {
        Ok(Box::new(ConsoleRecognizer {
            language,
            sink,
            microphone: self.microphone.clone(),
        }))
    }
}

struct ConsoleRecognizer {
    language: Language,
    sink: RecognitionSink,
    microphone: Microphone,
}

impl SpeechRecognizer for ConsoleRecognizer {
    fn start(&mut self) -> Result<()> {
        tracing::debug!(
            "Console listening in {} (epoch {}).",
            self.language.tag(),
            self.sink.epoch()
        );
        self.microphone.attach(self.sink.clone());
        Ok(())
    }

    fn stop(&mut self) {
        self.microphone.detach(self.sink.epoch());
    }

    fn abort(&mut self) {
        self.microphone.detach(self.sink.epoch());
    }
}

/// Prints lines instead of speaking them, reporting playback as if it took
/// as long as the spoken line would.
#[derive(Default)]
pub struct ConsoleSynthesizer {
    playback: Option<JoinHandle<()>>,
}

impl SpeechSynthesizer for ConsoleSynthesizer {
    fn speak(&mut self, text: &str, language: Language, sink: SynthesisSink) -> Result<()> {
        self.cancel();
        println!("  NPC [{}]: {}", language.code(), text);
        let delay = estimate_speaking_delay(text);
        self.playback = Some(tokio::spawn(async move {
            sink.started();
            tokio::time::sleep(delay).await;
            sink.ended();
        }));
        Ok(())
    }

    fn cancel(&mut self) {
        if let Some(handle) = self.playback.take() {
            handle.abort();
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleInput {
    Speech(String),
    Intent(Intent),
    Help,
    Empty,
}

/// Parses one console line.
pub fn parse_line(line: &str) -> Result<ConsoleInput, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(ConsoleInput::Empty);
    }
    let Some(command) = line.strip_prefix('/') else {
        return Ok(ConsoleInput::Speech(line.to_string()));
    };

    let mut parts = command.split_whitespace();
    let name = parts.next().unwrap_or_default().to_lowercase();
    let argument = parts.next();
    let intent = match name.as_str() {
        "continue" | "c" => Intent::ManualContinue,
        "back" => Intent::Rewind {
            step: parse_argument(&name, argument)?,
        },
        "replay" => Intent::ReplayAudio {
            step: parse_argument(&name, argument)?,
        },
        "skip" => Intent::SkipWord,
        "distance" => Intent::UpdateDistance(parse_argument(&name, argument)?),
        "force" => Intent::ForceComplete,
        "close" | "quit" => Intent::Close,
        "help" => return Ok(ConsoleInput::Help),
        other => return Err(format!("Unknown command '/{other}'. {HELP}")),
    };
    Ok(ConsoleInput::Intent(intent))
}

fn parse_argument<T: std::str::FromStr>(name: &str, argument: Option<&str>) -> Result<T, String> {
    argument
        .and_then(|a| a.parse().ok())
        .ok_or_else(|| format!("'/{name}' needs a numeric argument"))
}

/// Reads stdin until it closes, routing speech to the microphone and intents
/// into the engines' event stream. Blocking; run it on its own thread.
pub fn read_console(microphone: Microphone, events: EventSender) -> Result<()> {
    for line in io::stdin().lock().lines() {
        let line = line.context("Failed to read from the console")?;
        match parse_line(&line) {
            Ok(ConsoleInput::Speech(text)) => {
                if !microphone.hear(&text) {
                    println!("  (not listening right now)");
                }
            }
            Ok(ConsoleInput::Intent(intent)) => {
                tracing::debug!("Console intent: {:?}", intent);
                if events.send(EngineEvent::Intent(intent)).is_err() {
                    tracing::info!("Engines are gone; stopping console input.");
                    break;
                }
            }
            Ok(ConsoleInput::Help) => println!("{HELP}"),
            Ok(ConsoleInput::Empty) => {}
            Err(message) => println!("  {message}"),
        }
    }
    Ok(())
}

/// A printable line for a command, or `None` for commands the console does
/// not show.
pub fn render(command: &Command) -> Option<String> {
    let line = match command {
        Command::EntryRevealed(entry) => {
            let who = match entry.speaker {
                Speaker::Npc => "NPC",
                Speaker::User => "YOU",
            };
            let mut line = format!(
                "#{} {}: {} ({})",
                entry.step, who, entry.phrase, entry.translation
            );
            if !entry.transcription.is_empty() {
                line.push_str(&format!(" [{}]", entry.transcription));
            }
            line
        }
        Command::ListeningFor { phrase, .. } => format!("  Say: \"{phrase}\""),
        Command::RecognitionFeedback {
            transcript,
            score,
            accepted,
            ..
        } => {
            let verdict = if *accepted { "accepted" } else { "try again" };
            format!("  Heard \"{transcript}\" ({score}%): {verdict}")
        }
        Command::InterimTranscript { transcript } => format!("  ...{transcript}"),
        Command::OfferManualContinue { .. } => {
            "  Having trouble? Type /continue to move on.".to_string()
        }
        Command::HistoryTruncated { through_step } => {
            format!("-- back to step {through_step} --")
        }
        Command::SuggestSignup => "Sign up to keep your progress!".to_string(),
        Command::StartQuiz { dialogue_id, .. } => {
            format!("== Quiz for dialogue {dialogue_id} ==")
        }
        Command::DialogueClosed => "Dialogue closed.".to_string(),
        Command::ShowError(error) => format!("Error: {error}"),
        Command::PresentWord {
            index,
            total,
            prompt,
            is_core_word,
        } => {
            let core = if *is_core_word { " (core)" } else { "" };
            format!("Word {}/{}{}: {}", index + 1, total, core, prompt)
        }
        Command::QuizAnswer { heard, correct, .. } => {
            let verdict = if *correct { "correct" } else { "not quite" };
            format!("  \"{heard}\": {verdict}")
        }
        Command::SkipRejected { .. } => "  Core words cannot be skipped.".to_string(),
        Command::QuizFinished {
            passed,
            score,
            correct,
            total,
        } => {
            let verdict = if *passed { "passed" } else { "not passed" };
            format!("Quiz {verdict}: {correct}/{total} ({score}%)")
        }
        Command::QuizClosed => "Quiz closed.".to_string(),
        Command::EntryCompleted { .. }
        | Command::NpcSpeaking { .. }
        | Command::NpcFinished { .. } => return None,
    };
    Some(line)
}
