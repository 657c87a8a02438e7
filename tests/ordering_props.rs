//! Property checks of execution order over random acyclic job graphs

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;

use common::{service_with, test_config, Mark, Recording, Timeline};
use jobgraph::{FailureCause, JobSpec, JobStatus, TaskSpec, TaskStatus};

#[derive(Debug, Clone)]
struct Dag {
    /// deps[i] only holds indices below i
    deps: Vec<BTreeSet<usize>>,
    failing: BTreeSet<usize>,
}

impl Dag {
    fn name(i: usize) -> String {
        format!("task_{i}")
    }

    fn to_spec(&self) -> JobSpec {
        let mut spec = JobSpec::new();
        for (i, deps) in self.deps.iter().enumerate() {
            let mut task = TaskSpec::new("work").inputs(deps.iter().map(|d| Self::name(*d)));
            if self.failing.contains(&i) {
                task = task.param("fail", true);
            }
            spec = spec.task(Self::name(i), task);
        }
        spec
    }

    /// Final status of each task: a task runs only if all of its inputs completed
    fn expected(&self) -> Vec<TaskStatus> {
        let mut statuses: Vec<TaskStatus> = Vec::with_capacity(self.deps.len());
        for (i, deps) in self.deps.iter().enumerate() {
            let blocked = deps.iter().any(|d| statuses[*d] != TaskStatus::Completed);
            statuses.push(if blocked || self.failing.contains(&i) {
                TaskStatus::Failed
            } else {
                TaskStatus::Completed
            });
        }
        statuses
    }

    fn runs(&self, i: usize) -> bool {
        let statuses = self.expected();
        self.deps[i].iter().all(|d| statuses[*d] == TaskStatus::Completed)
    }
}

fn dag_strategy(max_tasks: usize) -> impl Strategy<Value = Dag> {
    (1..=max_tasks).prop_flat_map(|n| {
        (
            proptest::collection::vec(proptest::collection::vec(any::<usize>(), 0..3), n),
            proptest::collection::btree_set(0..n, 0..3),
        )
            .prop_map(|(raw, failing)| Dag {
                deps: raw
                    .into_iter()
                    .enumerate()
                    .map(|(i, picks)| {
                        if i == 0 {
                            BTreeSet::new()
                        } else {
                            picks.into_iter().map(|p| p % i).collect()
                        }
                    })
                    .collect(),
                failing,
            })
    })
}

fn run(dag: &Dag) -> (jobgraph::JobSnapshot, Timeline) {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();
    runtime.block_on(async {
        let timeline = Timeline::default();
        let service = service_with(
            test_config(),
            vec![Arc::new(
                Recording::new("work", &timeline).with_delay(Duration::from_millis(1)),
            )],
        );
        let submitted = service.submit_job(dag.to_spec()).await.unwrap();
        let job = tokio::time::timeout(Duration::from_secs(10), service.wait_for_job(&submitted.id))
            .await
            .unwrap()
            .unwrap();
        (job, timeline)
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn test_no_task_starts_before_its_inputs_finish(dag in dag_strategy(8)) {
        let (job, timeline) = run(&dag);

        for (i, deps) in dag.deps.iter().enumerate() {
            let Some(started) = timeline.position(&Mark::Started(Dag::name(i))) else {
                continue;
            };
            for d in deps {
                let finished = timeline.position(&Mark::Finished(Dag::name(*d)));
                prop_assert!(
                    matches!(finished, Some(f) if f < started),
                    "task_{} started before task_{} finished", i, d
                );
            }
        }

        let statuses: Vec<TaskStatus> = job.tasks.iter().map(|t| t.status).collect();
        prop_assert_eq!(statuses, dag.expected());
    }

    #[test]
    fn test_blocked_tasks_never_run(dag in dag_strategy(8)) {
        let (job, timeline) = run(&dag);

        for (i, task) in job.tasks.iter().enumerate() {
            prop_assert_eq!(timeline.started(&task.name), dag.runs(i));
            if !dag.runs(i) {
                prop_assert!(
                    matches!(task.cause, Some(FailureCause::Propagated { .. })),
                    "{} should have failed by propagation", task.name
                );
                prop_assert_eq!(task.started_at, None);
            }
        }

        let expected = if dag.expected().iter().all(|s| *s == TaskStatus::Completed) {
            JobStatus::Completed
        } else {
            JobStatus::Failed
        };
        prop_assert_eq!(job.status, expected);
    }
}
