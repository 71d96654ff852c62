//! OutputManager: the prediction lifecycle for one canvas session.
//!
//! This manager owns:
//! - Session state (credential + output registry), saved after every mutation
//! - Creation of outputs from new remote jobs
//! - Poll cycles: cleanup, dedup, one batched status call, reconciliation
//! - Placement edits and removal coming from the canvas
//!
//! State sits behind a std mutex that is never held across an await. Network
//! calls run outside the lock and their results are applied in one critical
//! section, so callers never observe a half-applied update.

use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use crate::client::{PredictionApi, RemoteServiceError};
use crate::inline::{AssetInliner, ConversionError};
use crate::output::{AspectRatio, InvalidAspectRatio, Output, PlacementUpdate};
use crate::poller::SingleFlight;
use crate::prediction::{PredictionStatus, RemoteJob};
use crate::session::SessionState;
use crate::store::{SessionStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error(transparent)]
    Remote(#[from] RemoteServiceError),

    #[error("invalid generation input: {0}")]
    InvalidInput(#[from] InvalidAspectRatio),
}

/// What a call to `poll_incomplete` did.
#[derive(Debug)]
pub enum PollOutcome {
    /// Another cycle was in flight; nothing was done.
    AlreadyRunning,
    /// No incomplete outputs; no request was made.
    Idle,
    Reconciled(PollReport),
}

#[derive(Debug, Default)]
pub struct PollReport {
    /// Distinct remote job ids sent in the batch request.
    pub requested: Vec<String>,
    /// Outputs rewritten from the response.
    pub updated: usize,
    /// Remote job id and the asset that could not be inlined for it.
    pub conversion_failures: Vec<(String, ConversionError)>,
}

pub struct OutputManager {
    api: Arc<dyn PredictionApi>,
    inliner: AssetInliner,
    store: Arc<dyn SessionStore>,
    state: StdMutex<SessionState>,
    polling: SingleFlight,
}

impl OutputManager {
    /// Load persisted session state and build a manager around it.
    pub fn open(
        api: Arc<dyn PredictionApi>,
        inliner: AssetInliner,
        store: Arc<dyn SessionStore>,
    ) -> Result<Self, StoreError> {
        let state = SessionState::load(store.as_ref())?;
        Ok(Self {
            api,
            inliner,
            store,
            state: StdMutex::new(state),
            polling: SingleFlight::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Session state mutex poisoned - continuing with inner state");
            poisoned.into_inner()
        })
    }

    fn persist(&self, state: &SessionState) {
        if let Err(e) = state.save(self.store.as_ref()) {
            tracing::error!(error = %e, "Failed to persist session state");
        }
    }

    /// Apply a mutation and save the result.
    fn mutate<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> R {
        let mut state = self.lock();
        let result = f(&mut state);
        self.persist(&state);
        result
    }

    /// Save the current state explicitly.
    pub fn save(&self) -> Result<(), StoreError> {
        self.lock().save(self.store.as_ref())
    }

    pub fn credential(&self) -> Option<String> {
        self.lock().credential.clone()
    }

    pub fn set_credential(&self, credential: Option<String>) {
        let credential = credential.filter(|c| !c.is_empty());
        self.mutate(|state| state.credential = credential);
    }

    pub fn outputs(&self) -> Vec<Output> {
        self.lock().outputs.snapshot()
    }

    pub fn output(&self, id: &str) -> Option<Output> {
        self.lock().outputs.get(id).cloned()
    }

    /// Outputs still waiting on the remote service, recomputed on each call.
    pub fn incomplete_outputs(&self) -> Vec<Output> {
        self.lock()
            .outputs
            .incomplete()
            .into_iter()
            .cloned()
            .collect()
    }

    /// Start a remote job and track it as a new output.
    ///
    /// Nothing is added to the registry when the remote call fails.
    pub async fn create_output(&self, input: serde_json::Value) -> Result<Output, ManagerError> {
        let ratio = AspectRatio::from_input(&input)?;
        let credential = self.credential();

        let job = match self.api.create(credential.as_deref(), &input).await {
            Ok(job) => job,
            Err(e) => {
                tracing::error!(error = %e, "Failed to create prediction");
                return Err(e.into());
            }
        };

        let output = Output::from_created(&job, ratio);
        self.mutate(|state| {
            if state.outputs.insert(output.clone()).is_some() {
                tracing::warn!(id = %output.id, "Replaced existing output with the same id");
            }
        });

        tracing::info!(
            id = %output.id,
            remote_job_id = %job.id,
            status = %job.status,
            "Output created"
        );
        Ok(output)
    }

    /// Overwrite position and rotation, and size when given. False if `id` is unknown.
    pub fn update_placement(&self, id: &str, update: PlacementUpdate) -> bool {
        let mut state = self.lock();
        let found = state.outputs.update_placement(id, update);
        if found {
            self.persist(&state);
        }
        found
    }

    /// Remove one or many outputs. Unknown ids are ignored.
    pub fn remove_output<I, S>(&self, ids: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let removed = self.mutate(|state| state.outputs.remove(ids));
        tracing::debug!(removed, "Removed outputs");
        removed
    }

    /// Discard outputs without a usable remote job id.
    pub fn cleanup(&self) -> usize {
        let mut state = self.lock();
        let dropped = state.outputs.cleanup();
        if dropped > 0 {
            tracing::info!(dropped, "Discarded outputs without a remote job id");
            self.persist(&state);
        }
        dropped
    }

    /// Run one poll cycle over every incomplete output.
    ///
    /// At most one status request is made, carrying each distinct remote job
    /// id once. A failed request leaves the registry untouched.
    pub async fn poll_incomplete(&self) -> Result<PollOutcome, ManagerError> {
        let Some(_flight) = self.polling.try_acquire() else {
            tracing::debug!("Poll cycle already in flight, skipping");
            return Ok(PollOutcome::AlreadyRunning);
        };

        self.cleanup();

        let (requested, credential) = {
            let state = self.lock();
            (state.outputs.incomplete_remote_ids(), state.credential.clone())
        };

        if requested.is_empty() {
            return Ok(PollOutcome::Idle);
        }

        let jobs = match self.api.poll_batch(credential.as_deref(), &requested).await {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::error!(error = %e, ids = requested.len(), "Failed to poll predictions");
                return Err(e.into());
            }
        };

        let mut report = PollReport {
            requested,
            ..Default::default()
        };

        let mut resolved = Vec::with_capacity(jobs.len());
        for job in jobs {
            let asset = self.materialize(&job, &mut report).await;
            resolved.push((job, asset));
        }

        let updated = self.mutate(|state| {
            let mut updated = 0;
            for (job, asset) in &resolved {
                for output in state.outputs.for_remote_job_mut(&job.id) {
                    output.status = job.status;
                    output.input = job.input.clone();
                    if output.result.is_none()
                        && let Some(asset) = asset
                    {
                        output.result = Some(asset.clone());
                    }
                    updated += 1;
                }
            }
            updated
        });
        report.updated = updated;

        Ok(PollOutcome::Reconciled(report))
    }

    /// Inline a job's result if it succeeded and some matching output still lacks one.
    ///
    /// Returns `None` when there is nothing to store: the job has not succeeded,
    /// it has no result, every matching output already has one, or a scalar
    /// reference failed. Partial results reported while a job is still running
    /// are ignored.
    async fn materialize(
        &self,
        job: &RemoteJob,
        report: &mut PollReport,
    ) -> Option<serde_json::Value> {
        if let Some(message) = job.error_message() {
            tracing::warn!(
                remote_job_id = %job.id,
                status = %job.status,
                error = %message,
                "Prediction reported an error"
            );
        }

        if job.status != PredictionStatus::Succeeded {
            return None;
        }
        let reference = job.result.as_ref().filter(|r| !r.is_null())?;

        let wanted = self
            .lock()
            .outputs
            .iter()
            .any(|o| o.remote_job_id() == Some(job.id.as_str()) && o.result.is_none());
        if !wanted {
            return None;
        }

        let inlined = self.inliner.inline(reference).await;
        let failed = inlined.is_failed_scalar();
        for failure in inlined.failures {
            tracing::warn!(
                remote_job_id = %job.id,
                error = %failure,
                "Result asset kept as reference"
            );
            report.conversion_failures.push((job.id.clone(), failure));
        }

        if failed { None } else { Some(inlined.asset) }
    }
}
