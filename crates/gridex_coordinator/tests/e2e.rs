//! End-to-end exchange flows over real sockets: dashboard submissions on
//! one listener, a scripted worker on the other, an in-memory store behind
//! both.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use gridex_coordinator::{ApiRequest, ApiResponse, Coordinator};
use gridex_db::Store;
use gridex_protocol::codec::{FrameReader, FrameWriter};
use gridex_protocol::config::CoordinatorConfig;
use gridex_protocol::defaults::DEFAULT_MAX_FRAME_BYTES;
use gridex_protocol::error::CodecError;
use gridex_protocol::types::{
    CoordinatorMessage, JobDemands, JobOutcome, JobStatus, Role, WorkerMessage, WorkerSpecs,
    WorkerStatus,
};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

struct Exchange {
    worker_addr: SocketAddr,
    dashboard_addr: SocketAddr,
}

async fn start_exchange() -> Exchange {
    let store = Store::open_memory().await.unwrap();
    store.init().await.unwrap();

    let config = CoordinatorConfig {
        worker_bind: "127.0.0.1:0".to_string(),
        dashboard_bind: "127.0.0.1:0".to_string(),
        db_url: "sqlite::memory:".to_string(),
        ..CoordinatorConfig::default()
    };
    let coordinator = Coordinator::bind(config, store).await.unwrap();
    let worker_addr = coordinator.worker_addr().unwrap();
    let dashboard_addr = coordinator.dashboard_addr().unwrap();
    tokio::spawn(coordinator.run());

    Exchange {
        worker_addr,
        dashboard_addr,
    }
}

struct Dashboard {
    reader: FrameReader<OwnedReadHalf>,
    writer: FrameWriter<OwnedWriteHalf>,
}

impl Dashboard {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: FrameReader::new(read_half, DEFAULT_MAX_FRAME_BYTES),
            writer: FrameWriter::new(write_half, DEFAULT_MAX_FRAME_BYTES),
        }
    }

    async fn call(&mut self, request: ApiRequest) -> ApiResponse {
        self.writer.write(&request).await.unwrap();
        self.reader.read().await.unwrap()
    }

    async fn register(&mut self, username: &str, role: Role) -> String {
        match self
            .call(ApiRequest::RegisterUser {
                username: username.to_string(),
                password: "pw".to_string(),
                role,
            })
            .await
        {
            ApiResponse::User(user) => user.id,
            other => panic!("register failed: {other:?}"),
        }
    }

    async fn balance(&mut self, user_id: &str) -> i64 {
        match self
            .call(ApiRequest::Balance {
                user_id: user_id.to_string(),
            })
            .await
        {
            ApiResponse::Balance { balance } => balance,
            other => panic!("balance failed: {other:?}"),
        }
    }

    async fn submit(&mut self, submitter_id: &str, title: &str, demands: JobDemands) -> String {
        match self
            .call(ApiRequest::SubmitJob {
                submitter_id: submitter_id.to_string(),
                title: title.to_string(),
                code: "print('ok')".to_string(),
                requirements: String::new(),
                demands,
                priority: None,
            })
            .await
        {
            ApiResponse::JobCreated { job_id } => job_id,
            other => panic!("submit failed: {other:?}"),
        }
    }
}

struct WorkerClient {
    reader: FrameReader<OwnedReadHalf>,
    writer: FrameWriter<OwnedWriteHalf>,
    worker_id: String,
}

impl WorkerClient {
    async fn register(
        addr: SocketAddr,
        name: &str,
        owner_token: Option<&str>,
        specs: WorkerSpecs,
    ) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, write_half) = stream.into_split();
        let mut reader = FrameReader::new(read_half, DEFAULT_MAX_FRAME_BYTES);
        let mut writer = FrameWriter::new(write_half, DEFAULT_MAX_FRAME_BYTES);

        writer
            .write(&WorkerMessage::Register {
                name: name.to_string(),
                owner_token: owner_token.map(str::to_string),
                specs,
            })
            .await
            .unwrap();
        let worker_id = match reader.read::<CoordinatorMessage>().await.unwrap() {
            CoordinatorMessage::Registered { worker_id } => worker_id.as_str().to_string(),
            other => panic!("expected registered, got {other:?}"),
        };
        Self {
            reader,
            writer,
            worker_id,
        }
    }

    async fn request_job(&mut self) -> CoordinatorMessage {
        self.writer
            .write(&WorkerMessage::RequestJob {
                worker_id: self.worker_id.clone().into(),
            })
            .await
            .unwrap();
        self.reader.read().await.unwrap()
    }

    async fn send_result(&mut self, job_id: &str, outcome: JobOutcome, stdout: &str) {
        self.writer
            .write(&WorkerMessage::JobResult {
                job_id: job_id.into(),
                outcome,
                stdout: stdout.to_string(),
                stderr: String::new(),
                files: Vec::new(),
                reason: None,
                sandboxed: true,
            })
            .await
            .unwrap();
        match self.reader.read::<CoordinatorMessage>().await.unwrap() {
            CoordinatorMessage::JobReceived { job_id: acked } => {
                assert_eq!(acked.as_str(), job_id);
            }
            other => panic!("expected job_received, got {other:?}"),
        }
    }
}

fn specs(cpu: u32, ram: f64, gpu: Option<&str>) -> WorkerSpecs {
    WorkerSpecs {
        cpu_cores: cpu,
        ram_gb: ram,
        gpu_name: gpu.map(str::to_string),
        docker_available: true,
        tags: BTreeMap::new(),
    }
}

fn demands(cpu: u32, ram: f64, gpu: bool, timeout: u64) -> JobDemands {
    JobDemands {
        cpu_cores: cpu,
        ram_gb: ram,
        gpu_required: gpu,
        docker_required: false,
        timeout_seconds: timeout,
        tags: BTreeMap::new(),
    }
}

#[tokio::test]
async fn happy_path_settles_credits_end_to_end() {
    let exchange = start_exchange().await;
    let mut dash = Dashboard::connect(exchange.dashboard_addr).await;

    let alice = dash.register("alice", Role::Submitter).await;
    let owner = dash.register("owner", Role::WorkerOwner).await;
    assert_eq!(dash.balance(&alice).await, 100);

    // cost = 5 + 2 + 1 + 0 + 1 = 9
    let job_id = dash.submit(&alice, "hello", demands(1, 1.0, false, 60)).await;
    assert_eq!(dash.balance(&alice).await, 91);

    let mut worker =
        WorkerClient::register(exchange.worker_addr, "w1", Some(&owner), specs(2, 2.0, None))
            .await;
    let job = worker.request_job().await;
    let CoordinatorMessage::Job {
        job_id: assigned,
        credit_reward,
        timeout_seconds,
        ..
    } = job
    else {
        panic!("expected a job, got {job:?}");
    };
    assert_eq!(assigned.as_str(), job_id);
    assert_eq!(credit_reward, 9);
    assert_eq!(timeout_seconds, 60);

    worker
        .send_result(&job_id, JobOutcome::Completed, "ok")
        .await;

    match dash
        .call(ApiRequest::GetJob {
            requester_id: alice.clone(),
            job_id: job_id.clone(),
        })
        .await
    {
        ApiResponse::Job(view) => {
            assert_eq!(view.status, JobStatus::Completed);
            assert_eq!(view.stdout.as_deref(), Some("ok"));
        }
        other => panic!("get_job failed: {other:?}"),
    }
    assert_eq!(dash.balance(&alice).await, 91);
    assert_eq!(dash.balance(&owner).await, 109);
}

#[tokio::test]
async fn gpu_job_skips_non_gpu_worker() {
    let exchange = start_exchange().await;
    let mut dash = Dashboard::connect(exchange.dashboard_addr).await;

    let alice = dash.register("alice", Role::Submitter).await;
    let job_id = dash
        .submit(&alice, "needs-gpu", demands(1, 1.0, true, 60))
        .await;

    let mut plain =
        WorkerClient::register(exchange.worker_addr, "plain", None, specs(8, 16.0, None)).await;
    assert!(matches!(
        plain.request_job().await,
        CoordinatorMessage::NoJob
    ));

    let mut gpu = WorkerClient::register(
        exchange.worker_addr,
        "gpu",
        None,
        specs(8, 16.0, Some("A100")),
    )
    .await;
    match gpu.request_job().await {
        CoordinatorMessage::Job { job_id: assigned, .. } => {
            assert_eq!(assigned.as_str(), job_id);
        }
        other => panic!("expected the gpu job, got {other:?}"),
    }
}

#[tokio::test]
async fn higher_priority_job_is_assigned_first() {
    let exchange = start_exchange().await;
    let mut dash = Dashboard::connect(exchange.dashboard_addr).await;
    let alice = dash.register("alice", Role::Submitter).await;

    let low = dash.submit(&alice, "low", demands(1, 1.0, false, 60)).await;
    let high = match dash
        .call(ApiRequest::SubmitJob {
            submitter_id: alice.clone(),
            title: "high".to_string(),
            code: "print('ok')".to_string(),
            requirements: String::new(),
            demands: demands(1, 1.0, false, 60),
            priority: Some(7),
        })
        .await
    {
        ApiResponse::JobCreated { job_id } => job_id,
        other => panic!("submit failed: {other:?}"),
    };

    let mut worker =
        WorkerClient::register(exchange.worker_addr, "w", None, specs(2, 2.0, None)).await;

    match worker.request_job().await {
        CoordinatorMessage::Job { job_id, .. } => assert_eq!(job_id.as_str(), high),
        other => panic!("expected high-priority job, got {other:?}"),
    }
    worker.send_result(&high, JobOutcome::Completed, "").await;
    match worker.request_job().await {
        CoordinatorMessage::Job { job_id, .. } => assert_eq!(job_id.as_str(), low),
        other => panic!("expected low-priority job, got {other:?}"),
    }
}

#[tokio::test]
async fn first_message_must_be_register() {
    let exchange = start_exchange().await;
    let stream = TcpStream::connect(exchange.worker_addr).await.unwrap();
    let (read_half, write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half, DEFAULT_MAX_FRAME_BYTES);
    let mut writer = FrameWriter::new(write_half, DEFAULT_MAX_FRAME_BYTES);

    writer
        .write(&WorkerMessage::Heartbeat {
            worker_id: "nobody".into(),
            status: WorkerStatus::Idle,
        })
        .await
        .unwrap();

    // The session replies with an error (best effort) and closes.
    match reader.read::<CoordinatorMessage>().await {
        Ok(CoordinatorMessage::Error { .. }) => {
            assert!(matches!(
                reader.read::<CoordinatorMessage>().await,
                Err(CodecError::Closed)
            ));
        }
        Err(CodecError::Closed) => {}
        other => panic!("expected error or close, got {other:?}"),
    }
}

#[tokio::test]
async fn mismatched_worker_id_closes_the_session() {
    let exchange = start_exchange().await;
    let mut worker =
        WorkerClient::register(exchange.worker_addr, "honest", None, specs(2, 2.0, None)).await;

    worker
        .writer
        .write(&WorkerMessage::RequestJob {
            worker_id: "somebody-else".into(),
        })
        .await
        .unwrap();

    match worker.reader.read::<CoordinatorMessage>().await {
        Ok(CoordinatorMessage::Error { .. }) => {
            assert!(matches!(
                worker.reader.read::<CoordinatorMessage>().await,
                Err(CodecError::Closed)
            ));
        }
        Err(CodecError::Closed) => {}
        other => panic!("expected error or close, got {other:?}"),
    }
}

#[tokio::test]
async fn unknown_owner_token_is_rejected() {
    let exchange = start_exchange().await;
    let stream = TcpStream::connect(exchange.worker_addr).await.unwrap();
    let (read_half, write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half, DEFAULT_MAX_FRAME_BYTES);
    let mut writer = FrameWriter::new(write_half, DEFAULT_MAX_FRAME_BYTES);

    writer
        .write(&WorkerMessage::Register {
            name: "imposter".to_string(),
            owner_token: Some("not-a-user".to_string()),
            specs: specs(2, 2.0, None),
        })
        .await
        .unwrap();

    match reader.read::<CoordinatorMessage>().await {
        Ok(CoordinatorMessage::Error { message }) => {
            assert!(message.contains("owner token"));
        }
        other => panic!("expected rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn anonymous_completion_earns_no_credits() {
    let exchange = start_exchange().await;
    let mut dash = Dashboard::connect(exchange.dashboard_addr).await;
    let alice = dash.register("alice", Role::Submitter).await;

    let job_id = dash.submit(&alice, "free", demands(1, 1.0, false, 60)).await;
    let mut worker =
        WorkerClient::register(exchange.worker_addr, "anon", None, specs(2, 2.0, None)).await;

    match worker.request_job().await {
        CoordinatorMessage::Job { job_id: assigned, .. } => {
            assert_eq!(assigned.as_str(), job_id)
        }
        other => panic!("expected job, got {other:?}"),
    }
    worker.send_result(&job_id, JobOutcome::Completed, "done").await;

    match dash
        .call(ApiRequest::GetJob {
            requester_id: alice.clone(),
            job_id,
        })
        .await
    {
        ApiResponse::Job(view) => assert_eq!(view.status, JobStatus::Completed),
        other => panic!("get_job failed: {other:?}"),
    }
    assert_eq!(dash.balance(&alice).await, 91);
}
