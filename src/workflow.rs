//! Workflow composition: chains, groups and chords over jobs.
//!
//! The composer never runs anything itself. It creates the jobs a workflow
//! needs right now and, each time one of them reaches a terminal state, hands
//! back the jobs that become runnable next. Downstream steps of a chain and
//! the reducer of a chord therefore do not exist until their dependencies
//! have finished.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{TaskError, TaskResult};
use crate::job::{Job, JobId, JobSpec, JobState};
use crate::results::JobOutcome;
use crate::retry::RetryPolicy;

/// Unique identifier for workflows
pub type WorkflowId = Uuid;

/// How a group reports failures of its members
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupMode {
    /// The group fails as soon as any member fails
    #[default]
    FailFast,
    /// Wait for every member and succeed with whatever results exist
    CollectPartial,
}

/// What a chord does with its reducer when a member failed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChordFailureMode {
    /// The reducer is never created
    #[default]
    Abort,
    /// The reducer is created directly in the failed state, without running
    FailReducer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowKind {
    Chain,
    Group,
    Chord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowState {
    Running,
    Succeeded,
    Failed,
}

/// Where a workflow failed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowFailure {
    /// Position of the failed job (chain step, group/chord member, or member count for a reducer)
    pub step: usize,
    pub job_id: JobId,
    pub error: String,
}

/// Status of a workflow as seen by producers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStatus {
    pub id: WorkflowId,
    pub kind: WorkflowKind,
    pub state: WorkflowState,
    /// Jobs created so far, in submission order
    pub jobs: Vec<JobId>,
    pub result: Option<Value>,
    pub failure: Option<WorkflowFailure>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkflowStatus {
    pub fn is_finished(&self) -> bool {
        self.state != WorkflowState::Running
    }
}

#[derive(Debug)]
enum Plan {
    Chain {
        steps: Vec<JobSpec>,
    },
    Group {
        mode: GroupMode,
        outcomes: Vec<Option<JobOutcome>>,
    },
    Chord {
        mode: ChordFailureMode,
        outcomes: Vec<Option<JobOutcome>>,
        reducer: JobSpec,
        reducer_job: Option<JobId>,
    },
}

#[derive(Debug)]
struct Workflow {
    status: WorkflowStatus,
    plan: Plan,
}

impl Workflow {
    fn new(kind: WorkflowKind, plan: Plan) -> Self {
        Self {
            status: WorkflowStatus {
                id: WorkflowId::new_v4(),
                kind,
                state: WorkflowState::Running,
                jobs: Vec::new(),
                result: None,
                failure: None,
                created_at: Utc::now(),
                finished_at: None,
            },
            plan,
        }
    }

    fn finish(
        &mut self,
        state: WorkflowState,
        result: Option<Value>,
        failure: Option<WorkflowFailure>,
    ) {
        if self.status.is_finished() {
            return;
        }
        self.status.state = state;
        self.status.result = result;
        self.status.failure = failure;
        self.status.finished_at = Some(Utc::now());
        info!("Workflow {} finished as {:?}", self.status.id, state);
    }
}

/// Builds workflow jobs and advances workflows as their jobs finish
#[derive(Debug)]
pub struct Composer {
    default_queue: String,
    default_retry: RetryPolicy,
    workflows: Mutex<HashMap<WorkflowId, Workflow>>,
}

impl Composer {
    pub fn new(default_queue: String, default_retry: RetryPolicy) -> Self {
        Self {
            default_queue,
            default_retry,
            workflows: Mutex::new(HashMap::new()),
        }
    }

    fn build(&self, spec: JobSpec, workflow: WorkflowId) -> Job {
        Job::from_spec(spec, &self.default_queue, &self.default_retry, Utc::now())
            .in_workflow(workflow)
    }

    /// Start a chain; returns the first step's job
    pub async fn create_chain(&self, steps: Vec<JobSpec>) -> TaskResult<(WorkflowId, Job)> {
        if steps.is_empty() {
            return Err(TaskError::workflow("a chain needs at least one step"));
        }
        let mut workflow = Workflow::new(WorkflowKind::Chain, Plan::Chain { steps: steps.clone() });
        let id = workflow.status.id;
        let first = self.build(steps[0].clone(), id);
        workflow.status.jobs.push(first.id);

        self.workflows.lock().await.insert(id, workflow);
        debug!("Created chain {} with {} steps", id, steps.len());
        Ok((id, first))
    }

    /// Start a group; returns every member's job in submission order
    pub async fn create_group(
        &self,
        members: Vec<JobSpec>,
        mode: GroupMode,
    ) -> TaskResult<(WorkflowId, Vec<Job>)> {
        if members.is_empty() {
            return Err(TaskError::workflow("a group needs at least one member"));
        }
        let mut workflow = Workflow::new(
            WorkflowKind::Group,
            Plan::Group {
                mode,
                outcomes: vec![None; members.len()],
            },
        );
        let id = workflow.status.id;
        let jobs: Vec<Job> = members.into_iter().map(|spec| self.build(spec, id)).collect();
        workflow.status.jobs = jobs.iter().map(|job| job.id).collect();

        self.workflows.lock().await.insert(id, workflow);
        debug!("Created group {} with {} members", id, jobs.len());
        Ok((id, jobs))
    }

    /// Start a chord; returns the member jobs, or the reducer alone when there are no members
    pub async fn create_chord(
        &self,
        members: Vec<JobSpec>,
        reducer: JobSpec,
        mode: ChordFailureMode,
    ) -> TaskResult<(WorkflowId, Vec<Job>)> {
        let mut workflow = Workflow::new(
            WorkflowKind::Chord,
            Plan::Chord {
                mode,
                outcomes: vec![None; members.len()],
                reducer: reducer.clone(),
                reducer_job: None,
            },
        );
        let id = workflow.status.id;

        let jobs: Vec<Job> = if members.is_empty() {
            let payload = reducer.linked_payload(Value::Array(Vec::new()));
            let reducer_job = self.build(JobSpec { payload, ..reducer }, id);
            if let Plan::Chord { reducer_job: slot, .. } = &mut workflow.plan {
                *slot = Some(reducer_job.id);
            }
            vec![reducer_job]
        } else {
            members.into_iter().map(|spec| self.build(spec, id)).collect()
        };
        workflow.status.jobs = jobs.iter().map(|job| job.id).collect();

        self.workflows.lock().await.insert(id, workflow);
        debug!("Created chord {}", id);
        Ok((id, jobs))
    }

    /// React to a workflow job reaching a terminal state.
    ///
    /// Returns the jobs that become runnable (or, for a failing chord reducer,
    /// already terminal) as a consequence.
    pub async fn on_job_finished(&self, job: &Job) -> TaskResult<Vec<Job>> {
        let Some(workflow_id) = job.workflow else {
            return Ok(Vec::new());
        };
        let Some(outcome) = job.outcome() else {
            return Ok(Vec::new());
        };

        let mut workflows = self.workflows.lock().await;
        let Some(workflow) = workflows.get_mut(&workflow_id) else {
            warn!("Job {} finished for unknown workflow {}", job.id, workflow_id);
            return Ok(Vec::new());
        };

        let next = match workflow.status.kind {
            WorkflowKind::Chain => self.advance_chain(workflow, &outcome),
            WorkflowKind::Group => {
                self.advance_group(workflow, &outcome);
                Vec::new()
            }
            WorkflowKind::Chord => self.advance_chord(workflow, &outcome),
        };
        workflow.status.jobs.extend(next.iter().map(|job| job.id));
        Ok(next)
    }

    fn advance_chain(&self, workflow: &mut Workflow, outcome: &JobOutcome) -> Vec<Job> {
        let Some(step) = workflow.status.jobs.iter().position(|id| *id == outcome.job_id) else {
            return Vec::new();
        };
        let Plan::Chain { steps } = &workflow.plan else {
            return Vec::new();
        };

        if !outcome.succeeded() {
            let failure = WorkflowFailure {
                step,
                job_id: outcome.job_id,
                error: outcome.error.clone().unwrap_or_default(),
            };
            warn!(
                "Chain {} stopped at step {}; {} later step(s) will not run",
                workflow.status.id,
                step,
                steps.len() - step - 1
            );
            workflow.finish(WorkflowState::Failed, None, Some(failure));
            return Vec::new();
        }

        let upstream = outcome.result.clone().unwrap_or(Value::Null);
        match steps.get(step + 1) {
            Some(spec) => {
                let payload = spec.linked_payload(upstream);
                let job = self
                    .build(JobSpec { payload, ..spec.clone() }, workflow.status.id)
                    .with_dependencies(vec![outcome.job_id]);
                debug!("Chain {} advancing to step {}", workflow.status.id, step + 1);
                vec![job]
            }
            None => {
                workflow.finish(WorkflowState::Succeeded, Some(upstream), None);
                Vec::new()
            }
        }
    }

    fn advance_group(&self, workflow: &mut Workflow, outcome: &JobOutcome) {
        let Some(index) = workflow.status.jobs.iter().position(|id| *id == outcome.job_id) else {
            return;
        };
        let Plan::Group { mode, outcomes } = &mut workflow.plan else {
            return;
        };
        outcomes[index] = Some(outcome.clone());
        let mode = *mode;

        if !outcome.succeeded() && mode == GroupMode::FailFast {
            let failure = WorkflowFailure {
                step: index,
                job_id: outcome.job_id,
                error: outcome.error.clone().unwrap_or_default(),
            };
            workflow.finish(WorkflowState::Failed, None, Some(failure));
            return;
        }

        if outcomes.iter().all(Option::is_some) {
            let results = Value::Array(outcomes.iter().flatten().map(member_value).collect());
            workflow.finish(WorkflowState::Succeeded, Some(results), None);
        }
    }

    fn advance_chord(&self, workflow: &mut Workflow, outcome: &JobOutcome) -> Vec<Job> {
        let workflow_id = workflow.status.id;
        let Plan::Chord {
            mode,
            outcomes,
            reducer,
            reducer_job,
        } = &mut workflow.plan
        else {
            return Vec::new();
        };

        if *reducer_job == Some(outcome.job_id) {
            if outcome.succeeded() {
                workflow.finish(WorkflowState::Succeeded, outcome.result.clone(), None);
            } else {
                let failure = WorkflowFailure {
                    step: outcomes.len(),
                    job_id: outcome.job_id,
                    error: outcome.error.clone().unwrap_or_default(),
                };
                workflow.finish(WorkflowState::Failed, None, Some(failure));
            }
            return Vec::new();
        }

        let Some(index) = workflow.status.jobs.iter().position(|id| *id == outcome.job_id) else {
            return Vec::new();
        };
        outcomes[index] = Some(outcome.clone());
        if outcomes.iter().any(Option::is_none) || reducer_job.is_some() {
            return Vec::new();
        }

        let members: Vec<&JobOutcome> = outcomes.iter().flatten().collect();
        let dependencies: Vec<JobId> = members.iter().map(|o| o.job_id).collect();
        let failed = members
            .iter()
            .enumerate()
            .find(|(_, o)| !o.succeeded())
            .map(|(i, o)| (i, o.job_id, o.error.clone().unwrap_or_default()));

        match (failed, *mode) {
            (None, _) => {
                let results = Value::Array(members.iter().map(|o| member_value(o)).collect());
                let payload = reducer.linked_payload(results);
                let job = self
                    .build(JobSpec { payload, ..reducer.clone() }, workflow_id)
                    .with_dependencies(dependencies);
                *reducer_job = Some(job.id);
                debug!("Chord {} header complete; enqueueing reducer {}", workflow_id, job.id);
                vec![job]
            }
            (Some((step, job_id, error)), ChordFailureMode::Abort) => {
                let failure = WorkflowFailure { step, job_id, error };
                workflow.finish(WorkflowState::Failed, None, Some(failure));
                Vec::new()
            }
            (Some((step, job_id, error)), ChordFailureMode::FailReducer) => {
                let mut job = self
                    .build(reducer.clone(), workflow_id)
                    .with_dependencies(dependencies);
                let reason = format!("chord member {} ({}) failed: {}", step, job_id, error);
                if let Err(e) = job.mark_failed(&reason, Utc::now()) {
                    warn!("Could not fail reducer for chord {}: {}", workflow_id, e);
                    return Vec::new();
                }
                *reducer_job = Some(job.id);
                vec![job]
            }
        }
    }

    pub async fn status(&self, workflow_id: WorkflowId) -> Option<WorkflowStatus> {
        let workflows = self.workflows.lock().await;
        workflows.get(&workflow_id).map(|w| w.status.clone())
    }

    /// Drop finished workflows that ended before `cutoff`
    pub async fn purge_finished(&self, cutoff: DateTime<Utc>) -> u64 {
        let mut workflows = self.workflows.lock().await;
        let before = workflows.len();
        workflows.retain(|_, w| w.status.finished_at.map_or(true, |t| t > cutoff));
        (before - workflows.len()) as u64
    }
}

/// Value a member contributes to a group/chord result list
fn member_value(outcome: &JobOutcome) -> Value {
    match outcome.state {
        JobState::Succeeded => outcome.result.clone().unwrap_or(Value::Null),
        _ => json!({ "error": outcome.error.clone().unwrap_or_default() }),
    }
}
