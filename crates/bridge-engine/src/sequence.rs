//! Multi-step macros bound to one input.
//!
//! Each run is a tokio task tracked by id. Starting an id that is still running
//! aborts the old task; the abort lands at the next step delay.

use crate::conditions::{conditions_pass, Condition, ConditionLogic};
use crate::resolver::ValueResolver;
use crate::target::Target;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Command,
    #[default]
    Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SequenceStep {
    #[serde(default)]
    pub kind: StepKind,
    pub target: Target,
    #[serde(default)]
    pub value: f32,
    /// Pause after this step.
    #[serde(default)]
    pub delay_ms: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequenceConfig {
    pub steps: Vec<SequenceStep>,
    /// Re-check the mapping's conditions before every step and stop on the first failure.
    pub stop_on_error: bool,
    pub repeat_while_held: bool,
    pub reverse_on_release: bool,
}

impl SequenceConfig {
    /// Steps in reverse order with 0/1 values swapped.
    pub fn reversed_steps(&self) -> Vec<SequenceStep> {
        self.steps
            .iter()
            .rev()
            .map(|step| {
                let mut step = step.clone();
                if step.kind == StepKind::Value {
                    if step.value == 0.0 {
                        step.value = 1.0;
                    } else if step.value == 1.0 {
                        step.value = 0.0;
                    }
                }
                step
            })
            .collect()
    }
}

/// One scheduled run.
pub(crate) struct SequenceRun {
    pub steps: Vec<SequenceStep>,
    pub guard: Option<(Vec<Condition>, ConditionLogic)>,
    pub repeat_while_held: bool,
    pub pause: Duration,
}

impl SequenceRun {
    async fn execute(self, resolver: Arc<ValueResolver>, held: Arc<AtomicBool>) {
        loop {
            for step in &self.steps {
                if let Some((conditions, logic)) = &self.guard {
                    if !conditions_pass(conditions, *logic, |n| resolver.value(n)) {
                        info!(target = %step.target, "sequence stopped: conditions no longer hold");
                        return;
                    }
                }
                let result = match step.kind {
                    StepKind::Command => resolver.fire_command(&step.target),
                    StepKind::Value => resolver.apply(&step.target, step.value),
                };
                if let Err(e) = result {
                    warn!(target = %step.target, error = %e, "sequence step failed");
                    if self.guard.is_some() {
                        return;
                    }
                }
                if step.delay_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(step.delay_ms)).await;
                }
            }
            if !self.repeat_while_held || !held.load(Ordering::Relaxed) {
                break;
            }
            tokio::time::sleep(self.pause).await;
            if !held.load(Ordering::Relaxed) {
                break;
            }
        }
    }
}

struct Running {
    handle: JoinHandle<()>,
    held: Arc<AtomicBool>,
}

/// Owns every in-flight sequence task.
#[derive(Default)]
pub struct SequenceRunner {
    running: Mutex<HashMap<String, Running>>,
    next_burst: AtomicU64,
}

impl SequenceRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start `run` under `id`, aborting a previous run with the same id.
    pub(crate) fn start(&self, id: &str, run: SequenceRun, resolver: Arc<ValueResolver>) -> bool {
        let Ok(handle) = Handle::try_current() else {
            warn!(id, "no async runtime, sequence not started");
            return false;
        };
        let held = Arc::new(AtomicBool::new(true));
        let task = handle.spawn(run.execute(resolver, Arc::clone(&held)));
        let mut running = self.running.lock();
        running.retain(|_, r| !r.handle.is_finished());
        if let Some(old) = running.insert(id.to_string(), Running { handle: task, held }) {
            debug!(id, "replacing running sequence");
            old.handle.abort();
        }
        true
    }

    /// Start a run that never replaces another, such as a command burst.
    pub(crate) fn start_detached(&self, run: SequenceRun, resolver: Arc<ValueResolver>) -> bool {
        let n = self.next_burst.fetch_add(1, Ordering::Relaxed);
        self.start(&format!("burst#{n}"), run, resolver)
    }

    /// The input behind `id` was let go.
    pub fn release(&self, id: &str) {
        if let Some(r) = self.running.lock().get(id) {
            r.held.store(false, Ordering::Relaxed);
        }
    }

    pub fn cancel(&self, id: &str) -> bool {
        match self.running.lock().remove(id) {
            Some(r) => {
                r.handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        for (_, r) in self.running.lock().drain() {
            r.handle.abort();
        }
    }

    /// Runs that have not finished yet.
    pub fn active(&self) -> usize {
        let mut running = self.running.lock();
        running.retain(|_, r| !r.handle.is_finished());
        running.len()
    }
}

impl Drop for SequenceRunner {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::rig;
    use std::time::Instant;

    fn step(target: &str, value: f32, delay_ms: u64) -> SequenceStep {
        SequenceStep {
            kind: StepKind::Value,
            target: Target::parse(target).unwrap(),
            value,
            delay_ms,
        }
    }

    async fn settle(runner: &SequenceRunner) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while runner.active() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[test]
    fn reversal_swaps_binary_values_only() {
        let cfg = SequenceConfig {
            steps: vec![step("a", 1.0, 0), step("b", 0.0, 10), step("c", 5.0, 0)],
            ..SequenceConfig::default()
        };
        let rev = cfg.reversed_steps();
        let got: Vec<(String, f32)> = rev
            .iter()
            .map(|s| (s.target.name().to_string(), s.value))
            .collect();
        assert_eq!(
            got,
            vec![("c".into(), 5.0), ("b".into(), 1.0), ("a".into(), 0.0)]
        );
    }

    #[tokio::test]
    async fn two_steps_run_once_in_order() {
        let r = rig();
        let runner = SequenceRunner::new();
        let run = SequenceRun {
            steps: vec![step("sim/a", 1.0, 0), step("sim/b", 1.0, 0)],
            guard: None,
            repeat_while_held: false,
            pause: Duration::from_millis(50),
        };
        assert!(runner.start("COM1:BTN", run, r.resolver.clone()));
        settle(&runner).await;
        assert_eq!(
            r.sim.writes(),
            vec![("sim/a".to_string(), 1.0), ("sim/b".to_string(), 1.0)]
        );
    }

    #[tokio::test]
    async fn restarting_an_id_aborts_the_old_run() {
        let r = rig();
        let runner = SequenceRunner::new();
        let slow = SequenceRun {
            steps: vec![step("sim/a", 1.0, 500), step("sim/late", 1.0, 0)],
            guard: None,
            repeat_while_held: false,
            pause: Duration::from_millis(50),
        };
        runner.start("id", slow, r.resolver.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        let quick = SequenceRun {
            steps: vec![step("sim/b", 1.0, 0)],
            guard: None,
            repeat_while_held: false,
            pause: Duration::from_millis(50),
        };
        runner.start("id", quick, r.resolver.clone());
        settle(&runner).await;
        tokio::time::sleep(Duration::from_millis(600)).await;
        let names: Vec<String> = r.sim.writes().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["sim/a".to_string(), "sim/b".to_string()]);
    }

    #[tokio::test]
    async fn repeat_stops_on_release() {
        let r = rig();
        let runner = SequenceRunner::new();
        let run = SequenceRun {
            steps: vec![step("sim/a", 1.0, 0)],
            guard: None,
            repeat_while_held: true,
            pause: Duration::from_millis(20),
        };
        runner.start("held", run, r.resolver.clone());
        tokio::time::sleep(Duration::from_millis(90)).await;
        runner.release("held");
        settle(&runner).await;
        let count = r.sim.writes().len();
        assert!(count >= 2, "ran {count} times");
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(r.sim.writes().len(), count);
    }

    #[tokio::test]
    async fn guard_failure_stops_the_run() {
        let r = rig();
        let runner = SequenceRunner::new();
        let run = SequenceRun {
            steps: vec![step("sim/a", 1.0, 0)],
            guard: Some((
                vec![Condition::new(
                    "sim/battery",
                    crate::conditions::Operator::Equal,
                    1.0,
                )],
                ConditionLogic::And,
            )),
            repeat_while_held: false,
            pause: Duration::from_millis(20),
        };
        runner.start("guarded", run, r.resolver.clone());
        settle(&runner).await;
        assert!(r.sim.writes().is_empty());
    }
}
