//! Submission & result API.
//!
//! The narrow, role-checked interface the dashboard calls. Served over the
//! dashboard listener as one framed JSON `ApiRequest` per request with an
//! `ApiResponse` reply; every operation is synchronous over the store.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use gridex_db::{JobRow, NewJob, Store, StoreError, StoredArtifact, WorkerRow};
use gridex_protocol::config::CoordinatorConfig;
use gridex_protocol::types::{JobDemands, JobStatus, Role, WorkerSpecs, WorkerStatus};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::registry::Registry;

pub const DEFAULT_JOB_PRIORITY: i64 = 5;

/// Dashboard request envelope. Unknown operations and stray fields are
/// rejected at decode, same as on the worker wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", deny_unknown_fields)]
pub enum ApiRequest {
    /// Create an account (with the configured signup grant).
    RegisterUser {
        username: String,
        password: String,
        role: Role,
    },
    /// Check credentials; returns the user view.
    Login { username: String, password: String },
    SubmitJob {
        submitter_id: String,
        title: String,
        code: String,
        requirements: String,
        demands: JobDemands,
        priority: Option<i64>,
    },
    CancelJob {
        requester_id: String,
        job_id: String,
    },
    GetJob {
        requester_id: String,
        job_id: String,
    },
    ListMyJobs { user_id: String },
    ListWorkers { requester_id: String },
    Balance { user_id: String },
    /// Admin adjustment, coordinator role only.
    Grant {
        requester_id: String,
        user_id: String,
        delta: i64,
        reason: String,
    },
    Ping,
}

/// Dashboard response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", deny_unknown_fields)]
pub enum ApiResponse {
    User(UserView),
    JobCreated { job_id: String },
    Job(JobView),
    Jobs(Vec<JobView>),
    Workers(Vec<WorkerView>),
    Balance { balance: i64 },
    Ok,
    Pong,
    Error { code: String, message: String },
}

impl ApiResponse {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserView {
    pub id: String,
    pub username: String,
    pub role: Role,
    pub balance: i64,
    pub created_at: DateTime<Utc>,
}

impl From<gridex_db::UserRow> for UserView {
    fn from(row: gridex_db::UserRow) -> Self {
        Self {
            id: row.id,
            username: row.username,
            role: row.role.into(),
            balance: row.balance,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobView {
    pub id: String,
    pub title: String,
    pub submitter_id: String,
    pub status: JobStatus,
    pub priority: i64,
    pub credit_cost: i64,
    pub credit_reward: i64,
    pub assigned_worker_id: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub files: Vec<StoredArtifact>,
    pub error_log: Option<String>,
    pub sandboxed: Option<bool>,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobView {
    fn from_row(row: JobRow) -> Result<Self, serde_json::Error> {
        let files = row.artifacts()?;
        Ok(Self {
            id: row.id,
            title: row.title,
            submitter_id: row.submitter_id,
            status: row.status.into(),
            priority: row.priority,
            credit_cost: row.credit_cost,
            credit_reward: row.credit_reward,
            assigned_worker_id: row.assigned_worker_id,
            stdout: row.stdout,
            stderr: row.stderr,
            files,
            error_log: row.error_log,
            sandboxed: row.sandboxed,
            submitted_at: row.submitted_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerView {
    pub id: String,
    pub name: String,
    pub owner_id: Option<String>,
    pub status: WorkerStatus,
    pub specs: Option<WorkerSpecs>,
    pub connected: bool,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub jobs_completed: i64,
    pub credits_earned: i64,
}

impl WorkerView {
    fn from_row(row: WorkerRow, connected: bool) -> Self {
        let specs = row.specs().ok();
        Self {
            id: row.id,
            name: row.name,
            owner_id: row.owner_id,
            status: row.status.into(),
            specs,
            connected,
            last_heartbeat: row.last_heartbeat,
            jobs_completed: row.jobs_completed,
            credits_earned: row.credits_earned,
        }
    }

    /// What a plain submitter gets to see: live capacity, no ownership or
    /// lifetime accounting.
    fn minimal(mut self) -> Self {
        self.owner_id = None;
        self.jobs_completed = 0;
        self.credits_earned = 0;
        self
    }
}

pub struct ApiService {
    store: Store,
    registry: Arc<Registry>,
    config: Arc<CoordinatorConfig>,
}

impl ApiService {
    pub fn new(store: Store, registry: Arc<Registry>, config: Arc<CoordinatorConfig>) -> Self {
        Self {
            store,
            registry,
            config,
        }
    }

    /// Dispatch one request. Never panics and never closes the dashboard
    /// connection; failures come back as `ApiResponse::Error`.
    pub async fn handle(&self, request: ApiRequest) -> ApiResponse {
        match request {
            ApiRequest::RegisterUser {
                username,
                password,
                role,
            } => self.register_user(&username, &password, role).await,
            ApiRequest::Login { username, password } => self.login(&username, &password).await,
            ApiRequest::SubmitJob {
                submitter_id,
                title,
                code,
                requirements,
                demands,
                priority,
            } => {
                self.submit_job(&submitter_id, &title, code, requirements, demands, priority)
                    .await
            }
            ApiRequest::CancelJob {
                requester_id,
                job_id,
            } => self.cancel_job(&requester_id, &job_id).await,
            ApiRequest::GetJob {
                requester_id,
                job_id,
            } => self.get_job(&requester_id, &job_id).await,
            ApiRequest::ListMyJobs { user_id } => self.list_my_jobs(&user_id).await,
            ApiRequest::ListWorkers { requester_id } => self.list_workers(&requester_id).await,
            ApiRequest::Balance { user_id } => self.balance(&user_id).await,
            ApiRequest::Grant {
                requester_id,
                user_id,
                delta,
                reason,
            } => self.grant(&requester_id, &user_id, delta, &reason).await,
            ApiRequest::Ping => ApiResponse::Pong,
        }
    }

    async fn register_user(&self, username: &str, password: &str, role: Role) -> ApiResponse {
        if username.trim().is_empty() || password.is_empty() {
            return ApiResponse::error("invalid", "username and password are required");
        }
        match self
            .store
            .create_user(username, password, role, self.config.starting_credits)
            .await
        {
            Ok(user) => ApiResponse::User(user.into()),
            Err(e) => store_error(e),
        }
    }

    async fn login(&self, username: &str, password: &str) -> ApiResponse {
        match self.store.verify_login(username, password).await {
            Ok(Some(user)) => ApiResponse::User(user.into()),
            Ok(None) => ApiResponse::error("forbidden", "bad username or password"),
            Err(e) => store_error(e),
        }
    }

    async fn submit_job(
        &self,
        submitter_id: &str,
        title: &str,
        code: String,
        requirements: String,
        demands: JobDemands,
        priority: Option<i64>,
    ) -> ApiResponse {
        if title.trim().is_empty() {
            return ApiResponse::error("invalid", "job title is required");
        }
        if code.is_empty() {
            return ApiResponse::error("invalid", "job code is required");
        }
        if let Err(e) = demands.validate(self.config.max_timeout_seconds) {
            return ApiResponse::error("invalid", e.to_string());
        }
        if let Err(e) = self.store.user(submitter_id).await {
            return store_error(e);
        }

        let new = NewJob {
            title: title.to_string(),
            submitter_id: submitter_id.to_string(),
            code,
            requirements,
            demands,
            priority: priority.unwrap_or(DEFAULT_JOB_PRIORITY),
        };
        match self.store.enqueue_job(&new, Utc::now()).await {
            Ok(job) => {
                info!("User {} submitted job {}", submitter_id, job.id);
                ApiResponse::JobCreated { job_id: job.id }
            }
            Err(e) => store_error(e),
        }
    }

    async fn cancel_job(&self, requester_id: &str, job_id: &str) -> ApiResponse {
        match self.store.cancel_pending(job_id, requester_id, Utc::now()).await {
            Ok(_) => ApiResponse::Ok,
            Err(e) => store_error(e),
        }
    }

    async fn get_job(&self, requester_id: &str, job_id: &str) -> ApiResponse {
        let requester = match self.store.user(requester_id).await {
            Ok(user) => user,
            Err(e) => return store_error(e),
        };
        let job = match self.store.job(job_id).await {
            Ok(job) => job,
            Err(e) => return store_error(e),
        };
        let role: Role = requester.role.into();
        if job.submitter_id != requester_id && role != Role::Coordinator {
            return ApiResponse::error("forbidden", "job belongs to another user");
        }
        match JobView::from_row(job) {
            Ok(view) => ApiResponse::Job(view),
            Err(_) => ApiResponse::error("unavailable", "stored job is unreadable"),
        }
    }

    async fn list_my_jobs(&self, user_id: &str) -> ApiResponse {
        let rows = match self.store.jobs_for_user(user_id).await {
            Ok(rows) => rows,
            Err(e) => return store_error(e),
        };
        let views: Vec<JobView> = rows
            .into_iter()
            .filter_map(|row| JobView::from_row(row).ok())
            .collect();
        ApiResponse::Jobs(views)
    }

    /// Coordinator sees everything, a worker-owner their own fleet, and a
    /// plain submitter only the live capacity.
    async fn list_workers(&self, requester_id: &str) -> ApiResponse {
        let requester = match self.store.user(requester_id).await {
            Ok(user) => user,
            Err(e) => return store_error(e),
        };
        let connected: std::collections::HashSet<String> = self
            .registry
            .snapshot()
            .into_iter()
            .map(|w| w.worker_id)
            .collect();

        let role: Role = requester.role.into();
        let rows = match role {
            Role::Coordinator => self.store.list_workers().await,
            Role::WorkerOwner => self.store.workers_for_owner(requester_id).await,
            Role::Submitter => self.store.list_workers().await,
        };
        let rows = match rows {
            Ok(rows) => rows,
            Err(e) => return store_error(e),
        };

        let views: Vec<WorkerView> = rows
            .into_iter()
            .map(|row| {
                let is_connected = connected.contains(&row.id);
                WorkerView::from_row(row, is_connected)
            })
            // Submitters only see live capacity: connected and idle.
            .filter(|view| {
                role != Role::Submitter
                    || (view.connected && view.status == WorkerStatus::Idle)
            })
            .map(|view| {
                if role == Role::Submitter {
                    view.minimal()
                } else {
                    view
                }
            })
            .collect();
        ApiResponse::Workers(views)
    }

    async fn balance(&self, user_id: &str) -> ApiResponse {
        match self.store.balance(user_id).await {
            Ok(balance) => ApiResponse::Balance { balance },
            Err(e) => store_error(e),
        }
    }

    async fn grant(
        &self,
        requester_id: &str,
        user_id: &str,
        delta: i64,
        reason: &str,
    ) -> ApiResponse {
        let requester = match self.store.user(requester_id).await {
            Ok(user) => user,
            Err(e) => return store_error(e),
        };
        if Role::from(requester.role) != Role::Coordinator {
            return ApiResponse::error("forbidden", "grant requires the coordinator role");
        }
        match self.store.grant(user_id, delta, None).await {
            Ok(balance) => {
                info!(
                    "Coordinator {} adjusted {} by {} ({}): balance now {}",
                    requester_id, user_id, delta, reason, balance
                );
                ApiResponse::Balance { balance }
            }
            Err(e) => store_error(e),
        }
    }
}

fn store_error(e: StoreError) -> ApiResponse {
    match &e {
        StoreError::InsufficientCredits { .. } => {
            ApiResponse::error("insufficient_credits", e.to_string())
        }
        StoreError::UsernameTaken(_) => ApiResponse::error("invalid", e.to_string()),
        StoreError::UserNotFound(_)
        | StoreError::WorkerNotFound(_)
        | StoreError::JobNotFound(_) => ApiResponse::error("not_found", e.to_string()),
        StoreError::NotPending(_) => ApiResponse::error("not_pending", e.to_string()),
        StoreError::NotRunning(_) => ApiResponse::error("not_pending", e.to_string()),
        StoreError::NotOwner { .. } => ApiResponse::error("not_owner", e.to_string()),
        StoreError::Payload(_) | StoreError::Sqlx(_) | StoreError::Io(_) => {
            ApiResponse::error("unavailable", "service unavailable")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    async fn service() -> ApiService {
        let store = Store::open_memory().await.unwrap();
        store.init().await.unwrap();
        let config = Arc::new(CoordinatorConfig {
            db_url: "sqlite::memory:".to_string(),
            ..CoordinatorConfig::default()
        });
        ApiService::new(store, Arc::new(Registry::new()), config)
    }

    fn demands(cpu: u32, ram: f64, timeout: u64) -> JobDemands {
        JobDemands {
            cpu_cores: cpu,
            ram_gb: ram,
            gpu_required: false,
            docker_required: false,
            timeout_seconds: timeout,
            tags: BTreeMap::new(),
        }
    }

    async fn register(api: &ApiService, username: &str, role: Role) -> UserView {
        match api
            .handle(ApiRequest::RegisterUser {
                username: username.to_string(),
                password: "pw".to_string(),
                role,
            })
            .await
        {
            ApiResponse::User(user) => user,
            other => panic!("register failed: {other:?}"),
        }
    }

    #[test]
    fn envelope_rejects_unknown_operations_and_fields() {
        let raw = r#"{"type": "LaunchMissiles", "payload": {}}"#;
        assert!(serde_json::from_str::<ApiRequest>(raw).is_err());

        let raw = r#"{"type": "Balance", "payload": {"user_id": "u-1", "extra": 1}}"#;
        assert!(serde_json::from_str::<ApiRequest>(raw).is_err());
    }

    #[tokio::test]
    async fn register_grants_starting_credits() {
        let api = service().await;
        let user = register(&api, "alice", Role::Submitter).await;
        assert_eq!(user.balance, 100);
    }

    #[tokio::test]
    async fn submit_rejects_insufficient_credits_without_side_effects() {
        let api = service().await;
        let bob = register(&api, "bob", Role::Submitter).await;
        // Drain bob to 5 credits.
        let coord = register(&api, "admin", Role::Coordinator).await;
        api.handle(ApiRequest::Grant {
            requester_id: coord.id.clone(),
            user_id: bob.id.clone(),
            delta: -95,
            reason: "test".to_string(),
        })
        .await;

        let resp = api
            .handle(ApiRequest::SubmitJob {
                submitter_id: bob.id.clone(),
                title: "big".to_string(),
                code: "print(1)".to_string(),
                requirements: String::new(),
                demands: demands(1, 1.0, 60),
                priority: None,
            })
            .await;
        match resp {
            ApiResponse::Error { code, .. } => assert_eq!(code, "insufficient_credits"),
            other => panic!("expected error, got {other:?}"),
        }

        match api.handle(ApiRequest::Balance { user_id: bob.id.clone() }).await {
            ApiResponse::Balance { balance } => assert_eq!(balance, 5),
            other => panic!("unexpected {other:?}"),
        }
        match api.handle(ApiRequest::ListMyJobs { user_id: bob.id }).await {
            ApiResponse::Jobs(jobs) => assert!(jobs.is_empty()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn submit_validates_demands() {
        let api = service().await;
        let alice = register(&api, "alice", Role::Submitter).await;

        let resp = api
            .handle(ApiRequest::SubmitJob {
                submitter_id: alice.id,
                title: "bad".to_string(),
                code: "x".to_string(),
                requirements: String::new(),
                demands: demands(1, 1.0, 7 * 24 * 3600),
                priority: None,
            })
            .await;
        match resp {
            ApiResponse::Error { code, .. } => assert_eq!(code, "invalid"),
            other => panic!("expected invalid, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancel_refunds_and_is_owner_gated() {
        let api = service().await;
        let alice = register(&api, "alice", Role::Submitter).await;
        let mallory = register(&api, "mallory", Role::Submitter).await;

        let job_id = match api
            .handle(ApiRequest::SubmitJob {
                submitter_id: alice.id.clone(),
                title: "j".to_string(),
                code: "x".to_string(),
                requirements: String::new(),
                demands: demands(1, 1.0, 60),
                priority: None,
            })
            .await
        {
            ApiResponse::JobCreated { job_id } => job_id,
            other => panic!("submit failed: {other:?}"),
        };

        match api
            .handle(ApiRequest::CancelJob {
                requester_id: mallory.id,
                job_id: job_id.clone(),
            })
            .await
        {
            ApiResponse::Error { code, .. } => assert_eq!(code, "not_owner"),
            other => panic!("unexpected {other:?}"),
        }

        match api
            .handle(ApiRequest::CancelJob {
                requester_id: alice.id.clone(),
                job_id,
            })
            .await
        {
            ApiResponse::Ok => {}
            other => panic!("cancel failed: {other:?}"),
        }
        match api.handle(ApiRequest::Balance { user_id: alice.id }).await {
            ApiResponse::Balance { balance } => assert_eq!(balance, 100),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn get_job_is_submitter_or_coordinator_only() {
        let api = service().await;
        let alice = register(&api, "alice", Role::Submitter).await;
        let eve = register(&api, "eve", Role::Submitter).await;
        let admin = register(&api, "admin", Role::Coordinator).await;

        let job_id = match api
            .handle(ApiRequest::SubmitJob {
                submitter_id: alice.id.clone(),
                title: "j".to_string(),
                code: "x".to_string(),
                requirements: String::new(),
                demands: demands(1, 1.0, 60),
                priority: None,
            })
            .await
        {
            ApiResponse::JobCreated { job_id } => job_id,
            other => panic!("submit failed: {other:?}"),
        };

        match api
            .handle(ApiRequest::GetJob {
                requester_id: eve.id,
                job_id: job_id.clone(),
            })
            .await
        {
            ApiResponse::Error { code, .. } => assert_eq!(code, "forbidden"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            api.handle(ApiRequest::GetJob {
                requester_id: alice.id,
                job_id: job_id.clone(),
            })
            .await,
            ApiResponse::Job(_)
        ));
        assert!(matches!(
            api.handle(ApiRequest::GetJob {
                requester_id: admin.id,
                job_id,
            })
            .await,
            ApiResponse::Job(_)
        ));
    }

    #[tokio::test]
    async fn grant_requires_coordinator_role() {
        let api = service().await;
        let alice = register(&api, "alice", Role::Submitter).await;
        let bob = register(&api, "bob", Role::Submitter).await;

        match api
            .handle(ApiRequest::Grant {
                requester_id: alice.id.clone(),
                user_id: bob.id,
                delta: 50,
                reason: "nice try".to_string(),
            })
            .await
        {
            ApiResponse::Error { code, .. } => assert_eq!(code, "forbidden"),
            other => panic!("unexpected {other:?}"),
        }
        // No state change.
        match api.handle(ApiRequest::Balance { user_id: alice.id }).await {
            ApiResponse::Balance { balance } => assert_eq!(balance, 100),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn submitter_sees_only_connected_idle_workers() {
        use crate::registry::ConnectedWorker;
        use tokio::sync::mpsc;

        let store = Store::open_memory().await.unwrap();
        store.init().await.unwrap();
        let registry = Arc::new(Registry::new());
        let config = Arc::new(CoordinatorConfig {
            db_url: "sqlite::memory:".to_string(),
            ..CoordinatorConfig::default()
        });
        let api = ApiService::new(store.clone(), Arc::clone(&registry), config);

        let alice = register(&api, "alice", Role::Submitter).await;
        let owner = register(&api, "owner", Role::WorkerOwner).await;

        let specs = WorkerSpecs {
            cpu_cores: 2,
            ram_gb: 2.0,
            gpu_name: None,
            docker_available: true,
            tags: std::collections::BTreeMap::new(),
        };
        let idle = store
            .register_worker(Some(&owner.id), "idle-w", &specs, Utc::now())
            .await
            .unwrap();
        let busy = store
            .register_worker(Some(&owner.id), "busy-w", &specs, Utc::now())
            .await
            .unwrap();
        // Third worker exists in the store but is not connected.
        store
            .register_worker(Some(&owner.id), "gone-w", &specs, Utc::now())
            .await
            .unwrap();
        store
            .worker_heartbeat(&busy.id, WorkerStatus::Busy, Utc::now())
            .await
            .unwrap();

        for (row_id, status) in [(&idle.id, WorkerStatus::Idle), (&busy.id, WorkerStatus::Busy)] {
            let (tx, _rx) = mpsc::channel(4);
            registry.attach(ConnectedWorker {
                worker_id: row_id.clone(),
                owner_id: Some(owner.id.clone()),
                specs: specs.clone(),
                status,
                assigned_job_id: None,
                last_heartbeat: Utc::now(),
                sender: tx,
            });
        }

        match api
            .handle(ApiRequest::ListWorkers {
                requester_id: alice.id.clone(),
            })
            .await
        {
            ApiResponse::Workers(views) => {
                assert_eq!(views.len(), 1);
                assert_eq!(views[0].name, "idle-w");
                assert!(views[0].connected);
                assert_eq!(views[0].status, WorkerStatus::Idle);
                // Minimal view: no ownership or lifetime accounting.
                assert_eq!(views[0].owner_id, None);
                assert_eq!(views[0].jobs_completed, 0);
            }
            other => panic!("list_workers failed: {other:?}"),
        }

        match api
            .handle(ApiRequest::ListWorkers {
                requester_id: owner.id.clone(),
            })
            .await
        {
            ApiResponse::Workers(views) => {
                assert_eq!(views.len(), 3);
                assert!(views.iter().all(|v| v.owner_id.as_deref() == Some(owner.id.as_str())));
            }
            other => panic!("list_workers failed: {other:?}"),
        }
    }

    #[tokio::test]
    async fn login_round_trip() {
        let api = service().await;
        register(&api, "alice", Role::Submitter).await;

        assert!(matches!(
            api.handle(ApiRequest::Login {
                username: "alice".to_string(),
                password: "pw".to_string(),
            })
            .await,
            ApiResponse::User(_)
        ));
        match api
            .handle(ApiRequest::Login {
                username: "alice".to_string(),
                password: "wrong".to_string(),
            })
            .await
        {
            ApiResponse::Error { code, .. } => assert_eq!(code, "forbidden"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
