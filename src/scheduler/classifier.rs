use std::collections::BTreeSet;

/// Maps a free-text task description to a task type
pub trait TaskClassifier: Send + Sync {
    fn classify(&self, description: &str) -> String;
}

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "with", "that", "this", "from", "into", "onto", "are", "was", "were",
    "will", "should", "must", "can", "all", "any", "each", "its", "our", "your", "their", "then",
    "than", "when", "where", "which", "while", "use", "using", "make", "add", "new", "via", "per",
];

/// Lowercased words of at least three characters, minus common stopwords
pub fn extract_keywords(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| word.chars().count() >= 3)
        .map(str::to_lowercase)
        .filter(|word| !STOPWORDS.contains(&word.as_str()))
        .collect()
}

/// Classifier picking the type whose keyword list matches the most words
pub struct KeywordClassifier {
    rules: Vec<(String, Vec<String>)>,
    fallback: String,
}

impl KeywordClassifier {
    pub fn new(fallback: impl Into<String>) -> Self {
        Self {
            rules: Vec::new(),
            fallback: fallback.into(),
        }
    }

    /// Add a rule; earlier rules win ties
    pub fn rule<I, S>(mut self, task_type: impl Into<String>, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rules.push((
            task_type.into(),
            keywords.into_iter().map(Into::into).collect(),
        ));
        self
    }
}

impl Default for KeywordClassifier {
    fn default() -> Self {
        Self::new("implementation")
            .rule("testing", ["test", "tests", "testing", "verify", "coverage", "assert"])
            .rule("bugfix", ["fix", "bug", "crash", "regression", "error", "broken"])
            .rule("refactoring", ["refactor", "cleanup", "restructure", "simplify", "rename"])
            .rule("documentation", ["doc", "docs", "document", "readme", "guide", "comment"])
            .rule("analysis", ["analyze", "analyse", "investigate", "research", "review", "audit"])
            .rule("deployment", ["deploy", "release", "publish", "rollout", "ship"])
    }
}

impl TaskClassifier for KeywordClassifier {
    fn classify(&self, description: &str) -> String {
        let words = extract_keywords(description);

        let mut best: Option<(&str, usize)> = None;
        for (task_type, keywords) in &self.rules {
            let hits = keywords.iter().filter(|k| words.contains(*k)).count();
            if hits > 0 && best.map_or(true, |(_, top)| hits > top) {
                best = Some((task_type.as_str(), hits));
            }
        }

        best.map(|(task_type, _)| task_type.to_string())
            .unwrap_or_else(|| self.fallback.clone())
    }
}
