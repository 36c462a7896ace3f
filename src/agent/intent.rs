/// Decides whether a task message asks for changes to project files.
///
/// The loop uses this to judge whether an answer without edits is a failure worth
/// rescuing. Implementations only need to be approximately right.
pub trait ChangeIntent: Send + Sync {
    fn requires_file_changes(&self, message: &str) -> bool;
}

/// Substring markers that suggest an editing task, in English and Russian.
pub const DEFAULT_CHANGE_MARKERS: &[&str] = &[
    "add test",
    "write test",
    "update test",
    "refactor",
    "fix",
    "implement",
    "change",
    "edit",
    "rewrite",
    "добав",
    "тест",
    "обнов",
    "исправ",
    "рефактор",
    "измени",
    "реализ",
    "доработ",
];

/// Case-insensitive substring matching against a marker list.
#[derive(Debug, Clone)]
pub struct KeywordIntent {
    markers: Vec<String>,
}

impl KeywordIntent {
    pub fn new<I, S>(markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            markers: markers
                .into_iter()
                .map(|m| m.into().to_lowercase())
                .collect(),
        }
    }
}

impl Default for KeywordIntent {
    fn default() -> Self {
        Self::new(DEFAULT_CHANGE_MARKERS.iter().copied())
    }
}

impl ChangeIntent for KeywordIntent {
    fn requires_file_changes(&self, message: &str) -> bool {
        let text = message.to_lowercase();
        self.markers.iter().any(|marker| text.contains(marker.as_str()))
    }
}
