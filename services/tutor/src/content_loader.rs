use anyhow::{Context, Result};
use lingo_core::content::{ContentLibrary, DialogueStep, QuizWord};
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// One content file. Either section may be absent.
#[derive(Debug, Deserialize)]
struct ContentFile {
    #[serde(default)]
    dialogues: Vec<DialogueScript>,
    #[serde(default)]
    words: Vec<QuizWord>,
}

#[derive(Debug, Deserialize)]
struct DialogueScript {
    character_id: String,
    steps: Vec<DialogueStep>,
}

/// Reads every `*.json` file in `dir_path` into one in-memory library.
pub fn load_content(dir_path: &Path) -> Result<ContentLibrary> {
    let mut library = ContentLibrary::new();

    for entry in fs::read_dir(dir_path)
        .with_context(|| format!("Failed to read content directory: {}", dir_path.display()))?
    {
        let entry = entry?;
        let path = entry.path();

        if path.is_file() && path.extension().and_then(|s| s.to_str()) == Some("json") {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read content file: {}", path.display()))?;
            let file: ContentFile = serde_json::from_str(&raw)
                .with_context(|| format!("Failed to parse content file: {}", path.display()))?;

            tracing::debug!(
                "Read {} dialogues and {} words from {}.",
                file.dialogues.len(),
                file.words.len(),
                path.display()
            );
            for script in file.dialogues {
                library.add_dialogue(&script.character_id, script.steps);
            }
            library.add_words(file.words);
        }
    }

    Ok(library)
}
