use anyhow::{Context, Result};
use clap::Parser;
use lingo_core::config::EngineConfig;
use lingo_core::content::{ContentLibrary, Lesson};
use lingo_core::dialogue::{DialogueEngine, DialogueState};
use lingo_core::progress::ProgressSink;
use lingo_core::quiz::QuizEngine;
use lingo_core::recognition::RecognizerFactory;
use lingo_core::{Command, EventReceiver, EventSender};
use lingo_tutor::config::Config;
use lingo_tutor::console::{self, ConsoleRecognizerFactory, ConsoleSynthesizer, Microphone};
use lingo_tutor::content_loader;
use lingo_tutor::progress_log::ProgressLog;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::fmt::time::ChronoLocal;

#[derive(Parser)]
struct Cli {
    /// The character to talk to
    character: String,
    /// The dialogue to play
    dialogue: u32,
    /// Play without an account; signup is suggested before the quiz
    #[arg(long)]
    guest: bool,
}

/// Everything one dialogue-then-quiz session needs.
struct Session {
    library: ContentLibrary,
    lesson: Lesson,
    engine_config: EngineConfig,
    recognizers: Arc<dyn RecognizerFactory>,
    progress: Arc<dyn ProgressSink>,
    commands: mpsc::Sender<Command>,
    events: EventSender,
}

impl Session {
    /// Plays the dialogue and, if it was completed, its quiz. Both engines
    /// read the same event stream, one after the other.
    async fn run(self, mut event_rx: EventReceiver) -> Result<()> {
        let mut dialogue = DialogueEngine::new(
            self.lesson.clone(),
            self.engine_config.clone(),
            self.recognizers.clone(),
            Box::new(ConsoleSynthesizer::default()),
            self.commands.clone(),
            self.events.clone(),
        );
        dialogue
            .load(&self.library)
            .await
            .context("Failed to load the dialogue")?;
        dialogue.start().await.context("Failed to start the dialogue")?;

        let state = dialogue.run(&mut event_rx).await;
        // Releases the dialogue's recognizer before the quiz opens its own.
        drop(dialogue);
        if state != DialogueState::Completed {
            tracing::info!("Dialogue ended without completion ({:?}).", state);
            return Ok(());
        }

        let mut quiz = QuizEngine::new(
            self.lesson,
            self.engine_config,
            self.recognizers,
            self.progress,
            self.commands,
            self.events,
        );
        quiz.load(&self.library)
            .await
            .context("Failed to load the quiz")?;
        quiz.start().await.context("Failed to start the quiz")?;

        match quiz.run(&mut event_rx).await {
            Some(outcome) => tracing::info!("Session finished: {:?}", outcome),
            None => tracing::info!("Quiz closed before the end."),
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load application configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(ChronoLocal::rfc_3339())
        .init();

    tracing::info!("Configuration loaded successfully. Starting tutor...");

    // --- 3. Parse Command-Line Arguments ---
    let args = Cli::parse();

    // --- 4. Load Content ---
    let library = content_loader::load_content(&config.content_dir)
        .context("Failed to load dialogue content")?;
    tracing::info!(
        "Loaded {} dialogues and {} quiz words.",
        library.dialogue_count(),
        library.word_count()
    );

    // --- 5. Application Setup ---
    let lesson = Lesson {
        character_id: args.character,
        dialogue_id: args.dialogue,
        target: config.target_language,
        mother: config.mother_language,
    };
    let engine_config = EngineConfig {
        guest: args.guest,
        ..EngineConfig::default()
    };

    // Inputs for the engines: recognizer and synthesizer callbacks, timers,
    // and learner intents typed at the console.
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    // Create the command channel to decouple core logic from the runtime.
    let (command_tx, mut command_rx) = mpsc::channel::<Command>(32);

    let microphone = Microphone::default();
    let session = Session {
        library,
        lesson,
        engine_config,
        recognizers: Arc::new(ConsoleRecognizerFactory::new(microphone.clone())),
        progress: Arc::new(ProgressLog::new(config.progress_log.clone())),
        commands: command_tx,
        events: event_tx.clone(),
    };

    // This task renders commands from the engines.
    let command_handler = tokio::spawn(async move {
        while let Some(command) = command_rx.recv().await {
            tracing::debug!("COMMAND RECEIVED: {:?}", command);
            if let Some(line) = console::render(&command) {
                println!("{line}");
            }
        }
    });

    // Stdin blocks, so it gets a plain thread that does not hold up shutdown.
    println!("{}", console::HELP);
    std::thread::spawn(move || {
        if let Err(e) = console::read_console(microphone, event_tx) {
            tracing::error!("Console input failed: {:?}", e);
        }
    });

    let mut session_handle = tokio::spawn(async move {
        if let Err(e) = session.run(event_rx).await {
            tracing::error!("Session failed: {:?}", e);
        }
    });

    let finished = tokio::select! {
        _ = &mut session_handle => true,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received Ctrl-C, shutting down...");
            false
        }
    };
    if finished {
        // The session dropped its command sender; let the last lines print.
        let _ = command_handler.await;
    }
    tracing::info!("Shutting down...");
    Ok(())
}
