#![allow(dead_code)]

use async_trait::async_trait;
use lifecycle_jobs::{
    CreateInstancePayload, InstanceProvider, InstanceSpec, InstanceType, Job, JobEngine, JobId,
    JobPayload, JobStatus, Limits, NewJob, PortMappingPayload, RetrySettings, SnapshotPayload,
    StateAction, StateChangePayload, WorkerPoolConfig, error::ProviderError,
};

use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
    time::Duration,
};

pub async fn init_pool() -> anyhow::Result<sqlx::PgPool> {
    let pg_host = std::env::var("PG_HOST").unwrap_or("localhost".to_string());
    let pg_con = std::env::var("PG_CON")
        .unwrap_or(format!("postgres://user:password@{pg_host}:5432/pg"));
    let pool = sqlx::PgPool::connect(&pg_con).await?;
    Ok(pool)
}

/// Small delays everywhere so retries play out in milliseconds.
pub fn fast_config() -> WorkerPoolConfig {
    WorkerPoolConfig {
        workers: 4,
        busy_retry_delay: Duration::from_millis(10),
        shutdown_timeout: Duration::from_secs(1),
        retry: RetrySettings {
            max_retries: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn stop(target: &str) -> NewJob {
    NewJob::new(
        target,
        JobPayload::StateChange(StateChangePayload {
            action: StateAction::Stop,
            force: false,
        }),
    )
    .expect("valid stop payload")
}

pub fn create(name: &str, image: &str) -> NewJob {
    NewJob::new(
        name,
        JobPayload::CreateInstance(CreateInstancePayload {
            name: name.to_string(),
            image: image.to_string(),
            instance_type: InstanceType::Container,
            limits: Limits::default(),
            user_data: None,
            attach_network: true,
        }),
    )
    .expect("valid create payload")
}

pub fn job(target: &str, payload: JobPayload) -> NewJob {
    NewJob::new(target, payload).expect("valid payload")
}

pub fn port(host_port: u16, container_port: u16) -> PortMappingPayload {
    PortMappingPayload {
        host_port,
        container_port,
        protocol: Default::default(),
    }
}

pub fn snapshot(snapshot_name: &str) -> SnapshotPayload {
    SnapshotPayload {
        snapshot_name: snapshot_name.to_string(),
        stateful: false,
    }
}

/// Poll until the job reaches `status` or five seconds pass.
pub async fn wait_for_status(
    engine: &JobEngine,
    id: JobId,
    status: JobStatus,
) -> anyhow::Result<Job> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let job = engine.find(id).await?;
        if job.status == status {
            return Ok(job);
        }
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!("job {id} stuck in {} waiting for {status}", job.status);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[derive(Default)]
struct ProviderState {
    calls: Vec<(String, String)>,
    scripted: HashMap<String, VecDeque<ProviderError>>,
    always: HashMap<String, ProviderError>,
    running: HashMap<String, usize>,
    max_overlap: HashMap<String, usize>,
    created: Vec<InstanceSpec>,
}

/// Records every call and fails on demand, per instance name.
#[derive(Default)]
pub struct FakeProvider {
    state: Mutex<ProviderState>,
    delay: Duration,
}

impl FakeProvider {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    /// The next calls against `name` fail with `errors`, in order.
    pub fn fail_next(&self, name: &str, errors: Vec<ProviderError>) {
        self.state
            .lock()
            .unwrap()
            .scripted
            .entry(name.to_string())
            .or_default()
            .extend(errors);
    }

    /// Every call against `name` fails with `error`.
    pub fn fail_always(&self, name: &str, error: ProviderError) {
        self.state
            .lock()
            .unwrap()
            .always
            .insert(name.to_string(), error);
    }

    pub fn calls_for(&self, name: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|(n, _)| n == name)
            .count()
    }

    /// Operations called against `name`, in call order.
    pub fn ops_for(&self, name: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, op)| op.clone())
            .collect()
    }

    pub fn max_overlap(&self, name: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .max_overlap
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    pub fn created(&self) -> Vec<InstanceSpec> {
        self.state.lock().unwrap().created.clone()
    }

    async fn call(&self, name: &str, op: &str) -> Result<(), ProviderError> {
        {
            let mut state = self.state.lock().unwrap();
            state.calls.push((name.to_string(), op.to_string()));
            let running = state.running.entry(name.to_string()).or_default();
            *running += 1;
            let now_running = *running;
            let max = state.max_overlap.entry(name.to_string()).or_default();
            *max = (*max).max(now_running);
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let mut state = self.state.lock().unwrap();
        if let Some(running) = state.running.get_mut(name) {
            *running -= 1;
        }
        if let Some(error) = state.scripted.get_mut(name).and_then(|q| q.pop_front()) {
            return Err(error);
        }
        if let Some(error) = state.always.get(name) {
            return Err(error.clone());
        }
        Ok(())
    }
}

#[async_trait]
impl InstanceProvider for FakeProvider {
    async fn create_instance(&self, spec: &InstanceSpec) -> Result<(), ProviderError> {
        self.call(&spec.name, "create").await?;
        self.state.lock().unwrap().created.push(spec.clone());
        Ok(())
    }

    async fn delete_instance(&self, name: &str) -> Result<(), ProviderError> {
        self.call(name, "delete").await
    }

    async fn change_state(
        &self,
        name: &str,
        action: StateAction,
        _force: bool,
    ) -> Result<(), ProviderError> {
        self.call(name, &action.to_string()).await
    }

    async fn update_limits(&self, name: &str, _limits: &Limits) -> Result<(), ProviderError> {
        self.call(name, "limits").await
    }

    async fn create_snapshot(
        &self,
        name: &str,
        _snapshot: &str,
        _stateful: bool,
    ) -> Result<(), ProviderError> {
        self.call(name, "snapshot").await
    }

    async fn restore_snapshot(
        &self,
        name: &str,
        _snapshot: &str,
        _stateful: bool,
    ) -> Result<(), ProviderError> {
        self.call(name, "restore").await
    }

    async fn delete_snapshot(&self, name: &str, _snapshot: &str) -> Result<(), ProviderError> {
        self.call(name, "delete_snapshot").await
    }

    async fn add_port_mapping(
        &self,
        name: &str,
        _mapping: &PortMappingPayload,
    ) -> Result<(), ProviderError> {
        self.call(name, "add_port").await
    }

    async fn remove_port_mapping(
        &self,
        name: &str,
        _mapping: &PortMappingPayload,
    ) -> Result<(), ProviderError> {
        self.call(name, "remove_port").await
    }
}
