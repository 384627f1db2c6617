use anyhow::Result;
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// The two languages the content is authored in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    En,
    Ru,
}

impl Language {
    /// BCP-47 tag handed to the speech capabilities.
    pub fn tag(&self) -> &'static str {
        match self {
            Language::En => "en-US",
            Language::Ru => "ru-RU",
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Language::En => "en",
            Language::Ru => "ru",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "en" | "en-us" | "english" => Ok(Language::En),
            "ru" | "ru-ru" | "russian" => Ok(Language::Ru),
            other => Err(format!("unsupported language '{other}'")),
        }
    }
}

/// A string authored once per language.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LocalizedText {
    pub en: String,
    pub ru: String,
}

impl LocalizedText {
    pub fn new(en: impl Into<String>, ru: impl Into<String>) -> Self {
        Self {
            en: en.into(),
            ru: ru.into(),
        }
    }

    pub fn get(&self, language: Language) -> &str {
        match language {
            Language::En => &self.en,
            Language::Ru => &self.ru,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    Npc,
    User,
}

/// One line of a dialogue script. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DialogueStep {
    pub id: u32,
    pub dialogue_id: u32,
    /// 1-based position in the script.
    pub step_index: u32,
    pub speaker: Speaker,
    pub text: LocalizedText,
    #[serde(default)]
    pub transcription: LocalizedText,
}

/// A vocabulary item quizzed after a dialogue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuizWord {
    pub id: u32,
    pub term: LocalizedText,
    pub dialogue_id: u32,
    /// Core words cannot be skipped.
    #[serde(default)]
    pub is_core_word: bool,
}

/// Who the learner is talking to, and in which languages.
#[derive(Debug, Clone, PartialEq)]
pub struct Lesson {
    pub character_id: String,
    pub dialogue_id: u32,
    /// The language the learner practices speaking.
    pub target: Language,
    /// The language translations are shown in.
    pub mother: Language,
}

/// Read-only access to dialogue scripts and quiz vocabulary.
///
/// An empty `Vec` means "not found"; `Err` means the fetch itself failed.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ContentSource: Send + Sync {
    async fn dialogue_steps(&self, character_id: &str, dialogue_id: u32)
    -> Result<Vec<DialogueStep>>;

    async fn quiz_words(&self, dialogue_id: u32) -> Result<Vec<QuizWord>>;
}

/// An in-memory content store.
#[derive(Debug, Default, Clone)]
pub struct ContentLibrary {
    dialogues: HashMap<(String, u32), Vec<DialogueStep>>,
    words: HashMap<u32, Vec<QuizWord>>,
}

impl ContentLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_dialogue(&mut self, character_id: &str, steps: Vec<DialogueStep>) {
        for step in steps {
            self.dialogues
                .entry((character_id.to_string(), step.dialogue_id))
                .or_default()
                .push(step);
        }
    }

    pub fn add_words(&mut self, words: Vec<QuizWord>) {
        for word in words {
            self.words.entry(word.dialogue_id).or_default().push(word);
        }
    }

    pub fn dialogue_count(&self) -> usize {
        self.dialogues.len()
    }

    pub fn word_count(&self) -> usize {
        self.words.values().map(Vec::len).sum()
    }
}

#[async_trait]
impl ContentSource for ContentLibrary {
    async fn dialogue_steps(
        &self,
        character_id: &str,
        dialogue_id: u32,
    ) -> Result<Vec<DialogueStep>> {
        let mut steps = self
            .dialogues
            .get(&(character_id.to_string(), dialogue_id))
            .cloned()
            .unwrap_or_default();
        steps.sort_by_key(|s| s.step_index);
        Ok(steps)
    }

    async fn quiz_words(&self, dialogue_id: u32) -> Result<Vec<QuizWord>> {
        let mut words = self.words.get(&dialogue_id).cloned().unwrap_or_default();
        words.sort_by_key(|w| w.id);
        Ok(words)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn language_parses_codes_and_tags() {
        assert_eq!("EN".parse::<Language>(), Ok(Language::En));
        assert_eq!("ru-RU".parse::<Language>(), Ok(Language::Ru));
        assert!("de".parse::<Language>().is_err());
        assert_eq!(Language::Ru.tag(), "ru-RU");
    }

    #[tokio::test]
    async fn library_returns_steps_in_script_order() {
        let mut steps = fixtures::greeting();
        steps.reverse();
        let mut library = ContentLibrary::new();
        library.add_dialogue("anna", steps);

        let loaded = library.dialogue_steps("anna", 1).await.unwrap();
        let order: Vec<u32> = loaded.iter().map(|s| s.step_index).collect();
        assert_eq!(order, vec![1, 2, 3, 4]);

        assert!(library.dialogue_steps("anna", 2).await.unwrap().is_empty());
        assert!(library.dialogue_steps("boris", 1).await.unwrap().is_empty());
    }

    #[test]
    fn step_deserializes_without_transcription() {
        let json = r#"{
            "id": 7,
            "dialogue_id": 2,
            "step_index": 1,
            "speaker": "npc",
            "text": { "en": "Where to?", "ru": "Куда едем?" }
        }"#;
        let step: DialogueStep = serde_json::from_str(json).unwrap();
        assert_eq!(step.speaker, Speaker::Npc);
        assert_eq!(step.text.get(Language::Ru), "Куда едем?");
        assert!(step.transcription.en.is_empty());
    }
}
