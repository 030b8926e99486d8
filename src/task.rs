//! Task orchestration: the run state machine, history and interruption.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::action::Action;
use crate::annotate::{Annotator, PageSnapshot};
use crate::bridge::{Bridge, Transport, DEFAULT_BACKOFF, DEFAULT_MAX_TRIES};
use crate::executor::{pause, Executor, InputDriver, Timing};
use crate::model::Usage;
use crate::parse::{parse_response, ParsedResponse};
use crate::planner::{Notify, PlanOutcome, Planner};
use crate::report::{NoopReporter, ReportArtifact, Reporter};
use crate::{Error, Result};

/// Default hard cap on recorded steps per run.
pub const DEFAULT_MAX_STEPS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Idle,
    Running,
    Success,
    Error,
    Interrupted,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Idle => "idle",
            TaskStatus::Running => "running",
            TaskStatus::Success => "success",
            TaskStatus::Error => "error",
            TaskStatus::Interrupted => "interrupted",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Finer-grained phase of a running task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionStatus {
    Idle,
    Attaching,
    PullingDom,
    TransformingDom,
    PerformingQuery,
    PerformingAction,
    Waiting,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Idle => "idle",
            ActionStatus::Attaching => "attaching",
            ActionStatus::PullingDom => "pulling-dom",
            ActionStatus::TransformingDom => "transforming-dom",
            ActionStatus::PerformingQuery => "performing-query",
            ActionStatus::PerformingAction => "performing-action",
            ActionStatus::Waiting => "waiting",
        }
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Start,
    Interrupt,
    Complete,
    Fail,
}

/// Transition table. `None` means the event is ignored in that state.
pub fn transition(status: TaskStatus, event: Event) -> Option<TaskStatus> {
    use Event::*;
    use TaskStatus::*;
    match (status, event) {
        (Idle | Success | Error | Interrupted, Start) => Some(Running),
        (Running, Start) => None,
        (Running, Interrupt) => Some(Interrupted),
        (Running, Complete) => Some(Success),
        (Running, Fail) => Some(Error),
        (Idle | Success | Error | Interrupted, Interrupt | Complete | Fail) => None,
    }
}

/// Record of one step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub prompt: String,
    pub response: String,
    pub action: ParsedResponse,
    pub usage: Usage,
}

/// The page a run acts on. Released exactly once per run; release must
/// tolerate being called on an unacquired target.
#[async_trait]
pub trait ExecutionTarget: Send + Sync {
    fn id(&self) -> String;

    async fn acquire(&self) -> Result<()>;

    async fn release(&self) -> Result<()>;
}

#[derive(Debug)]
struct TaskState {
    status: TaskStatus,
    action_status: ActionStatus,
    instructions: Vec<String>,
    history: Vec<HistoryEntry>,
    last_error: Option<String>,
    report: Option<ReportArtifact>,
}

impl Default for TaskState {
    fn default() -> Self {
        Self {
            status: TaskStatus::Idle,
            action_status: ActionStatus::Idle,
            instructions: Vec::new(),
            history: Vec::new(),
            last_error: None,
            report: None,
        }
    }
}

impl TaskState {
    fn apply(&mut self, event: Event) -> bool {
        match transition(self.status, event) {
            Some(next) => {
                debug!("task: {} -> {} on {:?}", self.status, next, event);
                self.status = next;
                true
            }
            None => false,
        }
    }
}

fn lock(state: &Mutex<TaskState>) -> MutexGuard<'_, TaskState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

/// Cloneable handle for observing or interrupting a run from elsewhere.
#[derive(Clone)]
pub struct TaskHandle {
    state: Arc<Mutex<TaskState>>,
}

impl TaskHandle {
    /// Stop scheduling further steps. Takes effect at the next step boundary.
    pub fn interrupt(&self) {
        if lock(&self.state).apply(Event::Interrupt) {
            info!("task: interrupt requested");
        }
    }

    pub fn status(&self) -> TaskStatus {
        lock(&self.state).status
    }

    pub fn action_status(&self) -> ActionStatus {
        lock(&self.state).action_status
    }
}

pub struct TaskControllerBuilder {
    planner: Planner,
    transport: Option<Arc<dyn Transport>>,
    driver: Option<Arc<dyn InputDriver>>,
    target: Option<Arc<dyn ExecutionTarget>>,
    reporter: Arc<dyn Reporter>,
    timing: Timing,
    max_steps: usize,
    bridge_tries: u32,
    bridge_backoff: Duration,
}

impl TaskControllerBuilder {
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn driver(mut self, driver: Arc<dyn InputDriver>) -> Self {
        self.driver = Some(driver);
        self
    }

    pub fn target(mut self, target: Arc<dyn ExecutionTarget>) -> Self {
        self.target = Some(target);
        self
    }

    pub fn reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    pub fn max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps.max(1);
        self
    }

    pub fn bridge_retry(mut self, max_tries: u32, backoff: Duration) -> Self {
        self.bridge_tries = max_tries;
        self.bridge_backoff = backoff;
        self
    }

    pub fn build(self) -> Result<TaskController> {
        let transport = self
            .transport
            .ok_or_else(|| Error::Config("task controller needs a transport".into()))?;
        let driver = self
            .driver
            .ok_or_else(|| Error::Config("task controller needs an input driver".into()))?;
        let target = self
            .target
            .ok_or_else(|| Error::Config("task controller needs an execution target".into()))?;

        let bridge = Bridge::new(transport).with_retry(self.bridge_tries, self.bridge_backoff);
        Ok(TaskController {
            planner: self.planner,
            annotator: Annotator::new(bridge),
            executor: Executor::new(driver, self.timing),
            target,
            reporter: self.reporter,
            max_steps: self.max_steps,
            state: Arc::new(Mutex::new(TaskState::default())),
        })
    }
}

/// Runs one task at a time against a single execution target.
pub struct TaskController {
    planner: Planner,
    annotator: Annotator<Arc<dyn Transport>>,
    executor: Executor<Arc<dyn InputDriver>>,
    target: Arc<dyn ExecutionTarget>,
    reporter: Arc<dyn Reporter>,
    max_steps: usize,
    state: Arc<Mutex<TaskState>>,
}

impl TaskController {
    pub fn builder(planner: Planner) -> TaskControllerBuilder {
        TaskControllerBuilder {
            planner,
            transport: None,
            driver: None,
            target: None,
            reporter: Arc::new(NoopReporter),
            timing: Timing::default(),
            max_steps: DEFAULT_MAX_STEPS,
            bridge_tries: DEFAULT_MAX_TRIES,
            bridge_backoff: DEFAULT_BACKOFF,
        }
    }

    pub fn handle(&self) -> TaskHandle {
        TaskHandle {
            state: Arc::clone(&self.state),
        }
    }

    pub fn status(&self) -> TaskStatus {
        self.lock().status
    }

    pub fn action_status(&self) -> ActionStatus {
        self.lock().action_status
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        self.lock().history.clone()
    }

    /// Instructions of the current or last run, blank lines removed.
    pub fn instructions(&self) -> Vec<String> {
        self.lock().instructions.clone()
    }

    /// Message of the failure that ended the last run.
    pub fn last_error(&self) -> Option<String> {
        self.lock().last_error.clone()
    }

    /// Report generated by the last successful run.
    pub fn report(&self) -> Option<ReportArtifact> {
        self.lock().report.clone()
    }

    /// Run every instruction line in order and return the final status.
    ///
    /// Does nothing while another run is active or when there is no
    /// non-blank instruction. Errors are sent to `notify` and end the run
    /// in [`TaskStatus::Error`].
    pub async fn run_task(&self, instructions: &str, notify: &Notify<'_>) -> TaskStatus {
        let lines: Vec<String> = instructions
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect();

        {
            let mut state = self.lock();
            if lines.is_empty() {
                debug!("task: no instructions, not starting");
                return state.status;
            }
            if !state.apply(Event::Start) {
                warn!("task: a run is already active");
                return state.status;
            }
            state.action_status = ActionStatus::Attaching;
            state.instructions = lines.clone();
            state.history.clear();
            state.last_error = None;
            state.report = None;
        }
        info!(
            "task: starting {} instruction(s) on {}",
            lines.len(),
            self.target.id()
        );

        let project = format!("autoflow_{}", chrono::Utc::now().timestamp_millis());
        let outcome = self.drive(&lines, &project, notify).await;

        let succeeded = match outcome {
            Ok(()) => self.lock().apply(Event::Complete),
            Err(e) => {
                warn!("task: {}", e);
                // The planner already reported a missing credential.
                if !matches!(e, Error::Configuration(_)) {
                    notify(&e.to_string());
                }
                let mut state = self.lock();
                state.last_error = Some(e.to_string());
                state.apply(Event::Fail);
                false
            }
        };

        if succeeded {
            self.finalize_report(&project).await;
        }

        if let Err(e) = self.target.release().await {
            warn!("task: releasing {} failed: {}", self.target.id(), e);
        }

        let mut state = self.lock();
        state.action_status = ActionStatus::Idle;
        info!(
            "task: finished with {} after {} step(s)",
            state.status,
            state.history.len()
        );
        state.status
    }

    async fn drive(&self, lines: &[String], project: &str, notify: &Notify<'_>) -> Result<()> {
        self.target.acquire().await?;

        for instruction in lines {
            if self.stopped() {
                return Ok(());
            }
            let steps = self.lock().history.len();
            if steps >= self.max_steps {
                return Err(Error::StepLimit(self.max_steps));
            }

            self.set_phase(ActionStatus::PullingDom);
            let snapshot = self.annotator.observe().await?;
            if self.stopped() {
                return Ok(());
            }
            self.set_phase(ActionStatus::TransformingDom);
            let prior: Vec<ParsedResponse> =
                self.lock().history.iter().map(|h| h.action.clone()).collect();

            self.set_phase(ActionStatus::PerformingQuery);
            let Some(plan) = self
                .planner
                .plan(instruction, &prior, &snapshot, notify)
                .await?
            else {
                return Err(Error::Configuration(crate::planner::NO_CREDENTIAL.into()));
            };
            if self.stopped() {
                return Ok(());
            }

            self.set_phase(ActionStatus::PerformingAction);
            let parsed = match plan.outcome {
                PlanOutcome::Completed => ParsedResponse::Success {
                    thought: String::new(),
                    action: Action::Finish,
                },
                PlanOutcome::Proposed => parse_response(&plan.response),
            };
            self.lock().history.push(HistoryEntry {
                prompt: plan.prompt,
                response: plan.response,
                action: parsed.clone(),
                usage: plan.usage,
            });
            self.export_step(&parsed, &snapshot).await;

            let action = match parsed {
                ParsedResponse::Error { raw, reason } => return Err(Error::Parse { raw, reason }),
                ParsedResponse::Success { action, .. } => action,
            };
            info!("task: step {}: {}", self.lock().history.len(), action);
            match action {
                Action::Finish => return Ok(()),
                Action::Fail => {
                    return Err(Error::TaskFailed(
                        "model reported the task cannot be completed".into(),
                    ))
                }
                _ => self.executor.execute(&action, &self.annotator).await?,
            }

            if !self.stopped() {
                self.report_step(project, instruction).await;
            }
            if self.stopped() {
                return Ok(());
            }

            self.set_phase(ActionStatus::Waiting);
            pause(self.executor.timing().step_wait).await;
        }
        Ok(())
    }

    async fn export_step(&self, parsed: &ParsedResponse, snapshot: &PageSnapshot) {
        if let ParsedResponse::Success { thought, action } = parsed {
            if let Err(e) = self
                .reporter
                .export_step(thought, &action.to_string(), &snapshot.markup)
                .await
            {
                warn!("task: step export failed: {}", e);
            }
        }
    }

    async fn report_step(&self, project: &str, instruction: &str) {
        let png = match self.executor.driver().screenshot().await {
            Ok(png) => png,
            Err(e) => {
                warn!("task: screenshot failed: {}", e);
                return;
            }
        };
        let encoded = base64::engine::general_purpose::STANDARD.encode(png);
        if let Err(e) = self.reporter.add_step(project, instruction, &encoded).await {
            warn!("task: reporting step failed: {}", e);
        }
    }

    async fn finalize_report(&self, project: &str) {
        match self.reporter.finalize(project).await {
            Ok(Some(artifact)) => {
                info!("task: report generated: {}", artifact.file_url);
                self.lock().report = Some(artifact);
            }
            Ok(None) => {}
            Err(e) => warn!("task: report generation failed: {}", e),
        }
    }

    fn stopped(&self) -> bool {
        self.lock().status != TaskStatus::Running
    }

    fn set_phase(&self, phase: ActionStatus) {
        self.lock().action_status = phase;
    }

    fn lock(&self) -> MutexGuard<'_, TaskState> {
        lock(&self.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STATUSES: [TaskStatus; 5] = [
        TaskStatus::Idle,
        TaskStatus::Running,
        TaskStatus::Success,
        TaskStatus::Error,
        TaskStatus::Interrupted,
    ];

    #[test]
    fn test_start_only_when_not_running() {
        for status in ALL_STATUSES {
            let next = transition(status, Event::Start);
            if status == TaskStatus::Running {
                assert_eq!(next, None);
            } else {
                assert_eq!(next, Some(TaskStatus::Running));
            }
        }
    }

    #[test]
    fn test_running_exits() {
        assert_eq!(
            transition(TaskStatus::Running, Event::Complete),
            Some(TaskStatus::Success)
        );
        assert_eq!(
            transition(TaskStatus::Running, Event::Fail),
            Some(TaskStatus::Error)
        );
        assert_eq!(
            transition(TaskStatus::Running, Event::Interrupt),
            Some(TaskStatus::Interrupted)
        );
    }

    #[test]
    fn test_interrupted_is_never_overwritten() {
        for event in [Event::Complete, Event::Fail, Event::Interrupt] {
            assert_eq!(transition(TaskStatus::Interrupted, event), None);
        }
    }

    #[test]
    fn test_status_names() {
        assert_eq!(TaskStatus::Interrupted.to_string(), "interrupted");
        assert_eq!(ActionStatus::PullingDom.to_string(), "pulling-dom");
        assert_eq!(
            serde_json::to_value(ActionStatus::PerformingQuery).unwrap(),
            "performing-query"
        );
    }

    #[test]
    fn test_handle_interrupt_only_affects_running() {
        let state = Arc::new(Mutex::new(TaskState::default()));
        let handle = TaskHandle {
            state: state.clone(),
        };
        handle.interrupt();
        assert_eq!(handle.status(), TaskStatus::Idle);

        lock(&state).status = TaskStatus::Running;
        handle.interrupt();
        assert_eq!(handle.status(), TaskStatus::Interrupted);
    }
}
