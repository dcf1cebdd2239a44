// Integration tests running scheduled task graphs as real processes

use agentvisor::config::{SchedulerConfig, SupervisorConfig};
use agentvisor::process::{
    LimitAction, ProcessSupervisor, ResourceLimits, ResourceSampler, ResourceUsage,
};
use agentvisor::scheduler::{
    DependencyScheduler, LearningOutcome, PatternLibrary, ProcessTaskRunner, TaskNode, TaskStatus,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn supervisor() -> Arc<ProcessSupervisor> {
    Arc::new(
        ProcessSupervisor::new(SupervisorConfig {
            poll_interval_ms: 20,
            restart_delay_ms: 0,
            stop_timeout_secs: 2,
            ..Default::default()
        })
        .unwrap(),
    )
}

fn shell_task(id: &str, description: &str) -> TaskNode {
    TaskNode::new(id, description, "implementation", Duration::from_millis(50))
}

/// Each task appends its id to `order.log`; a task described as "fail" exits 1
fn runner(supervisor: Arc<ProcessSupervisor>, dir: &TempDir) -> Arc<ProcessTaskRunner> {
    let order = dir.path().join("order.log");
    Arc::new(
        ProcessTaskRunner::new(supervisor, move |task: &TaskNode| {
            let script = if task.description.contains("fail") {
                "exit 1".to_string()
            } else {
                format!("echo \"$TASK_ID\" >> {}", order.display())
            };
            vec!["/bin/sh".to_string(), "-c".to_string(), script]
        })
        .log_dir(dir.path().join("logs")),
    )
}

#[tokio::test]
async fn test_process_tasks_run_in_dependency_order() {
    let dir = TempDir::new().unwrap();
    let supervisor = supervisor();
    supervisor.start().await;

    let scheduler = DependencyScheduler::new(
        SchedulerConfig::default(),
        runner(supervisor.clone(), &dir),
    );
    let mut nodes = vec![
        shell_task("schema", "design login schema"),
        shell_task("handler", "implement login handler").depends_on("schema"),
        shell_task("tests", "write login tests").depends_on("handler"),
        shell_task("docs", "document login flow"),
    ];

    let report = scheduler.execute(&mut nodes).await.unwrap();

    assert!(report.is_success());
    let order = std::fs::read_to_string(dir.path().join("order.log")).unwrap();
    let lines: Vec<&str> = order.lines().collect();
    let position = |id: &str| lines.iter().position(|line| *line == id).unwrap();
    assert_eq!(lines.len(), 4);
    assert!(position("schema") < position("handler"));
    assert!(position("handler") < position("tests"));

    // Attempt processes are removed once they finish
    assert!(supervisor.list_processes().await.is_empty());
    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_failing_process_task_is_retried_then_aborts() {
    let dir = TempDir::new().unwrap();
    let supervisor = supervisor();
    supervisor.start().await;

    let scheduler = DependencyScheduler::new(
        SchedulerConfig::default(),
        runner(supervisor.clone(), &dir),
    );
    let mut nodes = vec![
        shell_task("setup", "prepare workspace"),
        shell_task("broken", "this step will fail")
            .depends_on("setup")
            .max_retries(1),
        shell_task("after", "publish results").depends_on("broken"),
    ];

    let report = scheduler.execute(&mut nodes).await.unwrap();

    assert!(report.aborted);
    assert_eq!(report.results["broken"].status, TaskStatus::Failed);
    assert_eq!(report.results["broken"].attempts, 2);
    assert_eq!(report.results["after"].status, TaskStatus::Skipped);
    assert!(report.results["broken"]
        .error
        .as_deref()
        .unwrap()
        .contains("broken-attempt-2"));
    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_learned_pattern_matches_similar_request() {
    let dir = TempDir::new().unwrap();
    let supervisor = supervisor();
    supervisor.start().await;

    let scheduler = DependencyScheduler::new(
        SchedulerConfig::default(),
        runner(supervisor.clone(), &dir),
    );
    let mut nodes = vec![
        shell_task("a", "design login endpoint"),
        shell_task("b", "implement login endpoint").depends_on("a"),
    ];
    let report = scheduler.execute(&mut nodes).await.unwrap();
    assert!(report.is_success());

    let mut library = PatternLibrary::new(SchedulerConfig {
        learning_accuracy_threshold: 0.0,
        ..Default::default()
    });
    let outcome = library.learn_from_execution("Build the login endpoint", &nodes, &report, &[]);
    assert!(matches!(outcome, LearningOutcome::Created(_)));

    let matches = library.find_matching_patterns("Build a login endpoint for admins");
    assert_eq!(matches.len(), 1);
    let instantiated = matches[0].pattern.instantiate("next");
    assert_eq!(instantiated.len(), 2);
    assert!(instantiated[1].dependency_ids.contains("next-0"));
    supervisor.shutdown().await;
}

/// Reports every process at 600 MB
struct HeavySampler;

impl ResourceSampler for HeavySampler {
    fn refresh(&mut self, _pids: &[u32]) {}

    fn sample(&self, _pid: u32) -> Option<ResourceUsage> {
        Some(ResourceUsage::new(1.0, 600.0))
    }
}

#[tokio::test]
async fn test_task_over_memory_limit_fails_with_resource_error() {
    let supervisor = Arc::new(
        ProcessSupervisor::with_components(
            SupervisorConfig {
                poll_interval_ms: 20,
                stop_timeout_secs: 2,
                ..Default::default()
            },
            Box::new(HeavySampler),
            vec![],
        )
        .unwrap(),
    );
    supervisor.start().await;

    let runner = ProcessTaskRunner::new(supervisor.clone(), |_task: &TaskNode| {
        vec!["/bin/sleep".to_string(), "30".to_string()]
    })
    .resource_limits(ResourceLimits::new(Some(512.0), None).with_action(LimitAction::Stop));
    let scheduler = DependencyScheduler::new(SchedulerConfig::default(), Arc::new(runner));
    let mut nodes = vec![shell_task("hog", "load the whole dataset")];

    let report = tokio::time::timeout(Duration::from_secs(20), scheduler.execute(&mut nodes))
        .await
        .unwrap()
        .unwrap();

    let result = &report.results["hog"];
    assert_eq!(result.status, TaskStatus::Failed);
    let error = result.error.as_deref().unwrap();
    assert!(error.contains("Resource limit exceeded"));
    assert!(error.contains("memory"));
    supervisor.shutdown().await;
}
