//! In-memory control plane and notebook store for tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use tokio::sync::Semaphore;

use atmo_core::{Identifier, NotebookRef, ObservedState};

use crate::control_plane::{ClusterStatus, ClusterStream, ClusterSummary, ControlPlane, LaunchRequest};
use crate::error::{ControlPlaneError, NotebookStoreError};
use crate::notebook::{notebook_key, validate_notebook_name, NotebookStore};
use crate::status::raw_state_for;

#[derive(Debug, Clone)]
struct FakeCluster {
    state: ObservedState,
    reason: Option<String>,
    master_address: Option<String>,
    created_at: DateTime<Utc>,
}

#[derive(Default)]
struct FakeState {
    clusters: BTreeMap<String, FakeCluster>,
    launches: Vec<LaunchRequest>,
    terminate_calls: Vec<String>,
    launch_errors: VecDeque<ControlPlaneError>,
    describe_errors: VecDeque<ControlPlaneError>,
    terminate_errors: VecDeque<ControlPlaneError>,
    list_errors: VecDeque<ControlPlaneError>,
    next_id: u32,
}

/// Control plane that keeps clusters in memory.
///
/// Launched clusters start out `Bootstrapping`; terminate moves them straight
/// to `Terminated`. Failures can be queued per operation, and launches can be
/// held open to exercise calls that overlap an in-flight launch.
#[derive(Default)]
pub struct FakeControlPlane {
    state: Mutex<FakeState>,
    launch_gate: Mutex<Option<Arc<Semaphore>>>,
    parked: AtomicUsize,
}

impl FakeControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park every launch until [`FakeControlPlane::release_launches`].
    pub fn hold_launches(&self) {
        *self.launch_gate.lock().unwrap() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release_launches(&self) {
        if let Some(gate) = self.launch_gate.lock().unwrap().take() {
            gate.close();
        }
    }

    /// Launches currently waiting on the gate.
    pub fn parked_launches(&self) -> usize {
        self.parked.load(Ordering::SeqCst)
    }

    pub fn fail_next_launch(&self, err: ControlPlaneError) {
        self.state.lock().unwrap().launch_errors.push_back(err);
    }

    pub fn fail_next_describe(&self, err: ControlPlaneError) {
        self.state.lock().unwrap().describe_errors.push_back(err);
    }

    pub fn fail_next_terminate(&self, err: ControlPlaneError) {
        self.state.lock().unwrap().terminate_errors.push_back(err);
    }

    pub fn fail_next_list(&self, err: ControlPlaneError) {
        self.state.lock().unwrap().list_errors.push_back(err);
    }

    pub fn set_state(&self, jobflow_id: &str, state: ObservedState) {
        if let Some(c) = self.state.lock().unwrap().clusters.get_mut(jobflow_id) {
            c.state = state;
        }
    }

    pub fn set_master_address(&self, jobflow_id: &str, address: &str) {
        if let Some(c) = self.state.lock().unwrap().clusters.get_mut(jobflow_id) {
            c.master_address = Some(address.to_string());
        }
    }

    pub fn set_reason(&self, jobflow_id: &str, reason: &str) {
        if let Some(c) = self.state.lock().unwrap().clusters.get_mut(jobflow_id) {
            c.reason = Some(reason.to_string());
        }
    }

    pub fn set_created_at(&self, jobflow_id: &str, created_at: DateTime<Utc>) {
        if let Some(c) = self.state.lock().unwrap().clusters.get_mut(jobflow_id) {
            c.created_at = created_at;
        }
    }

    /// Drop a cluster as if the control plane had reaped it.
    pub fn forget(&self, jobflow_id: &str) {
        self.state.lock().unwrap().clusters.remove(jobflow_id);
    }

    /// Add a cluster nobody launched through this adapter.
    pub fn insert_untracked(&self, state: ObservedState, created_at: DateTime<Utc>) -> String {
        let mut s = self.state.lock().unwrap();
        let id = next_jobflow_id(&mut s);
        s.clusters.insert(
            id.clone(),
            FakeCluster {
                state,
                reason: None,
                master_address: None,
                created_at,
            },
        );
        id
    }

    pub fn launches(&self) -> Vec<LaunchRequest> {
        self.state.lock().unwrap().launches.clone()
    }

    pub fn terminate_calls(&self) -> Vec<String> {
        self.state.lock().unwrap().terminate_calls.clone()
    }

    pub fn state_of(&self, jobflow_id: &str) -> Option<ObservedState> {
        self.state
            .lock()
            .unwrap()
            .clusters
            .get(jobflow_id)
            .map(|c| c.state)
    }
}

fn next_jobflow_id(state: &mut FakeState) -> String {
    state.next_id += 1;
    format!("j-FAKE{:08}", state.next_id)
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    async fn launch(&self, request: &LaunchRequest) -> Result<String, ControlPlaneError> {
        let gate = self.launch_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            self.parked.fetch_add(1, Ordering::SeqCst);
            // Closing the gate wakes every waiter with an error.
            let _ = gate.acquire().await;
            self.parked.fetch_sub(1, Ordering::SeqCst);
        }

        let mut s = self.state.lock().unwrap();
        if let Some(err) = s.launch_errors.pop_front() {
            return Err(err);
        }
        s.launches.push(request.clone());
        let id = next_jobflow_id(&mut s);
        s.clusters.insert(
            id.clone(),
            FakeCluster {
                state: ObservedState::Bootstrapping,
                reason: None,
                master_address: None,
                created_at: Utc::now(),
            },
        );
        Ok(id)
    }

    async fn describe(&self, jobflow_id: &str) -> Result<ClusterStatus, ControlPlaneError> {
        let mut s = self.state.lock().unwrap();
        if let Some(err) = s.describe_errors.pop_front() {
            return Err(err);
        }
        let c = s
            .clusters
            .get(jobflow_id)
            .ok_or_else(|| ControlPlaneError::NotFound(jobflow_id.to_string()))?;
        Ok(ClusterStatus {
            state: c.state,
            raw_state: raw_state_for(c.state).to_string(),
            state_change_reason: c.reason.clone(),
            start_time: Some(c.created_at),
            master_address: c.master_address.clone(),
        })
    }

    fn list(
        &self,
        created_after: DateTime<Utc>,
        created_before: Option<DateTime<Utc>>,
    ) -> ClusterStream {
        let mut s = self.state.lock().unwrap();
        if let Some(err) = s.list_errors.pop_front() {
            return stream::iter(vec![Err(err)]).boxed();
        }
        let listed: Vec<_> = s
            .clusters
            .iter()
            .filter(|(_, c)| {
                c.created_at >= created_after && created_before.map_or(true, |b| c.created_at <= b)
            })
            .map(|(id, c)| {
                Ok(ClusterSummary {
                    jobflow_id: id.clone(),
                    state: c.state,
                    start_time: Some(c.created_at),
                })
            })
            .collect();
        stream::iter(listed).boxed()
    }

    async fn terminate(&self, jobflow_id: &str) -> Result<(), ControlPlaneError> {
        let mut s = self.state.lock().unwrap();
        if let Some(err) = s.terminate_errors.pop_front() {
            return Err(err);
        }
        s.terminate_calls.push(jobflow_id.to_string());
        if let Some(c) = s.clusters.get_mut(jobflow_id) {
            if !c.state.is_terminal() {
                c.state = ObservedState::Terminated;
                c.reason = Some("Terminated by user request".into());
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "fake"
    }
}

/// Notebook store backed by a map.
pub struct MemoryNotebookStore {
    bucket: String,
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryNotebookStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            objects: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, notebook: &NotebookRef) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(&notebook.key).cloned()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl NotebookStore for MemoryNotebookStore {
    async fn put(
        &self,
        job: &Identifier,
        file_name: &str,
        body: Vec<u8>,
    ) -> Result<NotebookRef, NotebookStoreError> {
        validate_notebook_name(file_name)?;
        let key = notebook_key(job, file_name);
        self.objects.lock().unwrap().insert(key.clone(), body);
        Ok(NotebookRef::new(key))
    }

    async fn delete(&self, notebook: &NotebookRef) -> Result<(), NotebookStoreError> {
        self.objects.lock().unwrap().remove(&notebook.key);
        Ok(())
    }

    fn uri(&self, notebook: &NotebookRef) -> String {
        format!("s3://{}/{}", self.bucket, notebook.key)
    }
}
