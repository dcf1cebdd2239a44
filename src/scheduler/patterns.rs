use crate::config::SchedulerConfig;
use crate::error::{AgentvisorError, Result};
use crate::scheduler::classifier::{extract_keywords, KeywordClassifier, TaskClassifier};
use crate::scheduler::executor::ExecutionReport;
use crate::scheduler::graph::{TaskNode, TaskStatus};
use crate::store::StateStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

const LIBRARY_KEY: &str = "patterns/library";

const EXACT_TYPE_SCORE: f64 = 0.8;
const KEYWORD_ONLY_SCORE: f64 = 0.6;
const UNRELATED_SCORE: f64 = 0.1;
const TYPE_WEIGHT: f64 = 0.7;
const KEYWORD_WEIGHT: f64 = 0.3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtaskTemplate {
    pub description: String,
    pub task_type: String,
    pub estimated_duration: Duration,
}

/// Learned decomposition of a kind of task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub pattern_id: Uuid,
    pub task_type: String,
    pub keywords: BTreeSet<String>,
    pub canonical_subtasks: Vec<SubtaskTemplate>,
    /// `(prerequisite, dependent)` indexes into `canonical_subtasks`
    pub dependency_template: Vec<(usize, usize)>,
    pub success_rate: f64,
    pub avg_duration: Duration,
    pub usage_count: u64,
    pub last_used: DateTime<Utc>,
}

impl Pattern {
    /// Build task nodes from the template, ids are `<prefix>-<index>`
    pub fn instantiate(&self, prefix: &str) -> Vec<TaskNode> {
        let mut nodes: Vec<TaskNode> = self
            .canonical_subtasks
            .iter()
            .enumerate()
            .map(|(index, subtask)| {
                TaskNode::new(
                    format!("{}-{}", prefix, index),
                    subtask.description.clone(),
                    subtask.task_type.clone(),
                    subtask.estimated_duration,
                )
                .predicted_success_rate(self.success_rate)
            })
            .collect();

        for &(prerequisite, dependent) in &self.dependency_template {
            if prerequisite < nodes.len() && dependent < nodes.len() {
                let id = nodes[prerequisite].id.clone();
                nodes[dependent].dependency_ids.insert(id);
            }
        }
        nodes
    }

    fn blend(&mut self, success_rate: f64, duration: Duration, weight: f64) {
        self.success_rate = weight * self.success_rate + (1.0 - weight) * success_rate;
        self.avg_duration = Duration::from_secs_f64(
            weight * self.avg_duration.as_secs_f64() + (1.0 - weight) * duration.as_secs_f64(),
        );
        self.usage_count += 1;
        self.last_used = Utc::now();
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PatternMatch {
    pub pattern: Pattern,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LearningOutcome {
    Created(Uuid),
    /// A pattern with the same type and keywords absorbed the run
    Reinforced(Uuid),
    /// Moving averages of the used patterns were updated
    Adjusted(usize),
}

/// Mean over executed tasks of min(actual, estimated) / max(actual, estimated)
pub fn prediction_accuracy(nodes: &[TaskNode], report: &ExecutionReport) -> f64 {
    let ratios: Vec<f64> = nodes
        .iter()
        .filter_map(|node| {
            let result = report.results.get(&node.id)?;
            if result.attempts == 0 {
                return None;
            }
            let actual = result.duration.as_secs_f64();
            let estimated = node.estimated_duration.as_secs_f64();
            let high = actual.max(estimated);
            if high == 0.0 {
                Some(1.0)
            } else {
                Some(actual.min(estimated) / high)
            }
        })
        .collect();

    if ratios.is_empty() {
        0.0
    } else {
        ratios.iter().sum::<f64>() / ratios.len() as f64
    }
}

pub struct PatternLibrary {
    patterns: Vec<Pattern>,
    config: SchedulerConfig,
    classifier: Arc<dyn TaskClassifier>,
}

impl PatternLibrary {
    pub fn new(config: SchedulerConfig) -> Self {
        Self::with_classifier(config, Arc::new(KeywordClassifier::default()))
    }

    pub fn with_classifier(config: SchedulerConfig, classifier: Arc<dyn TaskClassifier>) -> Self {
        Self {
            patterns: Vec::new(),
            config,
            classifier,
        }
    }

    pub fn patterns(&self) -> &[Pattern] {
        &self.patterns
    }

    pub fn get(&self, pattern_id: &Uuid) -> Option<&Pattern> {
        self.patterns.iter().find(|p| p.pattern_id == *pattern_id)
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn classify(&self, description: &str) -> String {
        self.classifier.classify(description)
    }

    /// Best patterns for `description`, highest score first
    pub fn find_matching_patterns(&self, description: &str) -> Vec<PatternMatch> {
        let task_type = self.classifier.classify(description);
        let keywords = extract_keywords(description);

        let mut matches: Vec<PatternMatch> = self
            .patterns
            .iter()
            .filter_map(|pattern| {
                let score = match_score(pattern, &task_type, &keywords);
                (score > self.config.pattern_match_threshold).then(|| PatternMatch {
                    pattern: pattern.clone(),
                    score,
                })
            })
            .collect();

        matches.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| b.pattern.last_used.cmp(&a.pattern.last_used))
                .then_with(|| b.pattern.usage_count.cmp(&a.pattern.usage_count))
        });
        matches.truncate(self.config.max_matching_patterns);

        debug!(
            task_type = %task_type,
            matches = matches.len(),
            "Pattern lookup finished"
        );
        matches
    }

    /// Fold a finished execution back into the library
    ///
    /// A run clearing both learning thresholds becomes a pattern (or
    /// reinforces the identical one); any other run only moves the averages
    /// of the patterns in `used`.
    pub fn learn_from_execution(
        &mut self,
        description: &str,
        nodes: &[TaskNode],
        report: &ExecutionReport,
        used: &[Uuid],
    ) -> LearningOutcome {
        let success_rate = report.success_rate();
        let accuracy = prediction_accuracy(nodes, report);

        if success_rate > self.config.learning_success_threshold
            && accuracy > self.config.learning_accuracy_threshold
        {
            return self.synthesize(description, nodes, report);
        }

        let weight = self.config.ema_weight;
        let mut adjusted = 0;
        for pattern in self
            .patterns
            .iter_mut()
            .filter(|p| used.contains(&p.pattern_id))
        {
            pattern.blend(success_rate, report.total_duration, weight);
            adjusted += 1;
        }
        debug!(success_rate, accuracy, adjusted, "Adjusted used patterns");
        LearningOutcome::Adjusted(adjusted)
    }

    fn synthesize(
        &mut self,
        description: &str,
        nodes: &[TaskNode],
        report: &ExecutionReport,
    ) -> LearningOutcome {
        let task_type = self.classifier.classify(description);
        let mut keywords = frequent_keywords(nodes, self.config.keyword_frequency_threshold);
        if keywords.is_empty() {
            keywords = extract_keywords(description);
        }
        let success_rate = report.success_rate();

        if let Some(existing) = self
            .patterns
            .iter_mut()
            .find(|p| p.task_type == task_type && p.keywords == keywords)
        {
            existing.blend(success_rate, report.total_duration, self.config.ema_weight);
            info!(pattern_id = %existing.pattern_id, task_type = %task_type, "Reinforced pattern");
            return LearningOutcome::Reinforced(existing.pattern_id);
        }

        let index: HashMap<&str, usize> = nodes
            .iter()
            .enumerate()
            .map(|(position, node)| (node.id.as_str(), position))
            .collect();
        let mut dependency_template: Vec<(usize, usize)> = nodes
            .iter()
            .enumerate()
            .flat_map(|(dependent, node)| {
                node.dependency_ids
                    .iter()
                    .filter_map(|id| index.get(id.as_str()))
                    .map(move |prerequisite| (*prerequisite, dependent))
                    .collect::<Vec<_>>()
            })
            .collect();
        dependency_template.sort_unstable();

        let canonical_subtasks = nodes
            .iter()
            .map(|node| SubtaskTemplate {
                description: node.description.clone(),
                task_type: node.task_type.clone(),
                estimated_duration: report
                    .results
                    .get(&node.id)
                    .filter(|r| r.status == TaskStatus::Succeeded)
                    .map(|r| r.duration)
                    .unwrap_or(node.estimated_duration),
            })
            .collect();

        let pattern = Pattern {
            pattern_id: Uuid::new_v4(),
            task_type,
            keywords,
            canonical_subtasks,
            dependency_template,
            success_rate,
            avg_duration: report.total_duration,
            usage_count: 1,
            last_used: Utc::now(),
        };
        let pattern_id = pattern.pattern_id;
        info!(
            pattern_id = %pattern_id,
            task_type = %pattern.task_type,
            subtasks = pattern.canonical_subtasks.len(),
            "Learned new pattern"
        );
        self.patterns.push(pattern);
        self.evict();
        LearningOutcome::Created(pattern_id)
    }

    fn evict(&mut self) {
        let Some(cap) = self.config.max_patterns else {
            return;
        };
        while self.patterns.len() > cap {
            let Some(oldest) = self
                .patterns
                .iter()
                .enumerate()
                .min_by_key(|(_, p)| p.last_used)
                .map(|(position, _)| position)
            else {
                return;
            };
            let evicted = self.patterns.remove(oldest);
            debug!(pattern_id = %evicted.pattern_id, "Evicted least recently used pattern");
        }
    }

    pub fn save(&self, store: &dyn StateStore) -> Result<()> {
        let bytes = serde_json::to_vec(&self.patterns)
            .map_err(|e| AgentvisorError::SerializationError(e.to_string()))?;
        store.put(LIBRARY_KEY, &bytes)?;
        debug!(patterns = self.patterns.len(), "Saved pattern library");
        Ok(())
    }

    /// Load a saved library; an empty one when nothing was saved
    pub fn load(
        store: &dyn StateStore,
        config: SchedulerConfig,
        classifier: Arc<dyn TaskClassifier>,
    ) -> Result<Self> {
        let mut library = Self::with_classifier(config, classifier);
        if let Some(bytes) = store.get(LIBRARY_KEY)? {
            library.patterns = serde_json::from_slice(&bytes)
                .map_err(|e| AgentvisorError::DeserializationError(e.to_string()))?;
            library.evict();
        }
        Ok(library)
    }
}

fn match_score(pattern: &Pattern, task_type: &str, keywords: &BTreeSet<String>) -> f64 {
    let overlap = if pattern.keywords.is_empty() {
        0.0
    } else {
        pattern.keywords.intersection(keywords).count() as f64 / pattern.keywords.len() as f64
    };
    let type_score = if pattern.task_type == task_type {
        EXACT_TYPE_SCORE
    } else if overlap > 0.0 {
        KEYWORD_ONLY_SCORE
    } else {
        UNRELATED_SCORE
    };
    TYPE_WEIGHT * type_score + KEYWORD_WEIGHT * overlap
}

/// Keywords present in at least `threshold` of the subtask descriptions
fn frequent_keywords(nodes: &[TaskNode], threshold: f64) -> BTreeSet<String> {
    if nodes.is_empty() {
        return BTreeSet::new();
    }
    let mut counts: HashMap<String, usize> = HashMap::new();
    for node in nodes {
        for keyword in extract_keywords(&node.description) {
            *counts.entry(keyword).or_default() += 1;
        }
    }
    let required = threshold * nodes.len() as f64;
    counts
        .into_iter()
        .filter(|(_, count)| *count as f64 >= required)
        .map(|(keyword, _)| keyword)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::executor::TaskResult;
    use crate::store::MemoryStateStore;
    use std::collections::BTreeMap;

    fn node(id: &str, description: &str, secs: u64) -> TaskNode {
        TaskNode::new(id, description, "implementation", Duration::from_secs(secs))
    }

    fn report(results: &[(&str, TaskStatus, u64)]) -> ExecutionReport {
        let results: BTreeMap<String, TaskResult> = results
            .iter()
            .map(|(id, status, secs)| {
                (
                    id.to_string(),
                    TaskResult {
                        task_id: id.to_string(),
                        status: *status,
                        attempts: 1,
                        duration: Duration::from_secs(*secs),
                        error: None,
                    },
                )
            })
            .collect();
        ExecutionReport {
            results,
            batches: Vec::new(),
            total_duration: Duration::from_secs(20),
            final_parallelism: 4,
            aborted: false,
            cancelled: false,
        }
    }

    fn login_nodes() -> Vec<TaskNode> {
        vec![
            node("1", "design login endpoint schema", 10),
            node("2", "implement login endpoint handler", 10).depends_on("1"),
            node("3", "write login endpoint tests", 5).depends_on("2"),
        ]
    }

    fn pattern(task_type: &str, keywords: &[&str], last_used: DateTime<Utc>) -> Pattern {
        Pattern {
            pattern_id: Uuid::new_v4(),
            task_type: task_type.to_string(),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            canonical_subtasks: Vec::new(),
            dependency_template: Vec::new(),
            success_rate: 0.9,
            avg_duration: Duration::from_secs(60),
            usage_count: 1,
            last_used,
        }
    }

    #[test]
    fn test_learns_pattern_from_confident_run() {
        let mut library = PatternLibrary::new(SchedulerConfig::default());
        let nodes = login_nodes();
        let report = report(&[
            ("1", TaskStatus::Succeeded, 9),
            ("2", TaskStatus::Succeeded, 10),
            ("3", TaskStatus::Succeeded, 5),
        ]);

        let outcome = library.learn_from_execution("Build the login endpoint", &nodes, &report, &[]);

        let LearningOutcome::Created(id) = outcome else {
            panic!("Expected new pattern, got {:?}", outcome);
        };
        let pattern = library.get(&id).unwrap();
        assert_eq!(pattern.task_type, "implementation");
        assert!(pattern.keywords.contains("login"));
        assert!(pattern.keywords.contains("endpoint"));
        assert_eq!(pattern.dependency_template, vec![(0, 1), (1, 2)]);

        let instantiated = pattern.instantiate("job");
        assert_eq!(instantiated.len(), 3);
        assert!(instantiated[2].dependency_ids.contains("job-1"));
    }

    #[test]
    fn test_identical_run_reinforces_instead_of_duplicating() {
        let mut library = PatternLibrary::new(SchedulerConfig::default());
        let nodes = login_nodes();
        let report = report(&[
            ("1", TaskStatus::Succeeded, 10),
            ("2", TaskStatus::Succeeded, 10),
            ("3", TaskStatus::Succeeded, 5),
        ]);

        library.learn_from_execution("Build the login endpoint", &nodes, &report, &[]);
        let outcome = library.learn_from_execution("Build the login endpoint", &nodes, &report, &[]);

        assert!(matches!(outcome, LearningOutcome::Reinforced(_)));
        assert_eq!(library.len(), 1);
        assert_eq!(library.patterns()[0].usage_count, 2);
    }

    #[test]
    fn test_weak_run_updates_moving_averages() {
        let mut library = PatternLibrary::new(SchedulerConfig::default());
        let existing = pattern("implementation", &["login"], Utc::now());
        let id = existing.pattern_id;
        library.patterns.push(existing);

        let nodes = login_nodes();
        let report = report(&[
            ("1", TaskStatus::Succeeded, 10),
            ("2", TaskStatus::Failed, 10),
            ("3", TaskStatus::Skipped, 0),
        ]);

        let outcome = library.learn_from_execution("Build the login endpoint", &nodes, &report, &[id]);

        assert_eq!(outcome, LearningOutcome::Adjusted(1));
        let updated = library.get(&id).unwrap();
        let expected = 0.8 * 0.9 + 0.2 * (1.0 / 3.0);
        assert!((updated.success_rate - expected).abs() < 1e-9);
        assert!((updated.avg_duration.as_secs_f64() - 52.0).abs() < 1e-6);
        assert_eq!(updated.usage_count, 2);
    }

    #[test]
    fn test_matching_scores_and_order() {
        let mut library = PatternLibrary::new(SchedulerConfig::default());
        let now = Utc::now();
        let exact = pattern("implementation", &["login", "endpoint"], now);
        let keyword_only = pattern("testing", &["login", "session"], now);
        let unrelated = pattern("deployment", &["kubernetes"], now);
        library.patterns = vec![unrelated, keyword_only.clone(), exact.clone()];

        let matches = library.find_matching_patterns("Build the login endpoint");

        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].pattern.pattern_id, exact.pattern_id);
        assert!((matches[0].score - (0.7 * 0.8 + 0.3)).abs() < 1e-9);
        assert_eq!(matches[1].pattern.pattern_id, keyword_only.pattern_id);
        assert!((matches[1].score - (0.7 * 0.6 + 0.3 * 0.5)).abs() < 1e-9);
    }

    #[test]
    fn test_ties_prefer_recent_then_used() {
        let mut library = PatternLibrary::new(SchedulerConfig::default());
        let now = Utc::now();
        let older = pattern("implementation", &["login"], now - chrono::Duration::hours(1));
        let newer = pattern("implementation", &["login"], now);
        let mut popular = pattern("implementation", &["login"], now);
        popular.usage_count = 10;
        let popular_id = popular.pattern_id;
        let older_id = older.pattern_id;
        library.patterns = vec![older, newer, popular, pattern("implementation", &["login"], now)];

        let matches = library.find_matching_patterns("Build the login endpoint");

        assert_eq!(matches.len(), 3);
        assert_eq!(matches[0].pattern.pattern_id, popular_id);
        assert!(matches.iter().all(|m| m.pattern.pattern_id != older_id));
    }

    #[test]
    fn test_cap_evicts_least_recently_used() {
        let config = SchedulerConfig {
            max_patterns: Some(1),
            ..Default::default()
        };
        let mut library = PatternLibrary::new(config);
        let stale = pattern("analysis", &["audit"], Utc::now() - chrono::Duration::days(1));
        library.patterns.push(stale.clone());

        let nodes = login_nodes();
        let report = report(&[
            ("1", TaskStatus::Succeeded, 10),
            ("2", TaskStatus::Succeeded, 10),
            ("3", TaskStatus::Succeeded, 5),
        ]);
        library.learn_from_execution("Build the login endpoint", &nodes, &report, &[]);

        assert_eq!(library.len(), 1);
        assert!(library.get(&stale.pattern_id).is_none());
    }

    #[test]
    fn test_save_and_load() {
        let store = MemoryStateStore::new();
        let mut library = PatternLibrary::new(SchedulerConfig::default());
        library.patterns.push(pattern("testing", &["parser"], Utc::now()));
        library.save(&store).unwrap();

        let loaded = PatternLibrary::load(
            &store,
            SchedulerConfig::default(),
            Arc::new(KeywordClassifier::default()),
        )
        .unwrap();
        assert_eq!(loaded.patterns(), library.patterns());

        let empty = PatternLibrary::load(
            &MemoryStateStore::new(),
            SchedulerConfig::default(),
            Arc::new(KeywordClassifier::default()),
        )
        .unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn test_prediction_accuracy() {
        let nodes = vec![node("a", "first", 10), node("b", "second", 10)];
        let report = report(&[("a", TaskStatus::Succeeded, 5), ("b", TaskStatus::Succeeded, 10)]);
        assert!((prediction_accuracy(&nodes, &report) - 0.75).abs() < 1e-9);
    }
}
