use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use fanout_core::*;
use fanout_exec::{
    CommandOutput, Credential, CredentialResolver, CredentialSource, HostSpec, Secret,
    SecretVault, Session, Transport, TransportError,
};

// Mock implementations

#[derive(Debug, Clone, Copy)]
enum Behavior {
    /// Run the job after `delay`, exiting with `exit_code`
    Succeed { delay: Duration, exit_code: i32 },
    /// Connect, then never finish the job
    Hang,
    Refuse,
    RejectAuth,
    HostKeyChanged,
    Panic,
    /// Refuse the first `n` connections, then succeed
    RefuseFirst(u32),
}

const OK: Behavior = Behavior::Succeed {
    delay: Duration::from_millis(10),
    exit_code: 0,
};

/// Counts in-flight sessions; decremented when the session is dropped
struct InFlight(Arc<MockState>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct MockState {
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    per_host: Mutex<HashMap<String, u32>>,
}

struct MockTransport {
    behaviors: HashMap<String, Behavior>,
    state: Arc<MockState>,
}

impl MockTransport {
    fn new(behaviors: &[(&str, Behavior)]) -> Arc<Self> {
        Arc::new(Self {
            behaviors: behaviors
                .iter()
                .map(|(host, b)| ((*host).to_string(), *b))
                .collect(),
            state: Arc::new(MockState::default()),
        })
    }

    fn calls(&self) -> usize {
        self.state.calls.load(Ordering::SeqCst)
    }

    fn calls_for(&self, host: &str) -> u32 {
        self.state
            .per_host
            .lock()
            .unwrap()
            .get(host)
            .copied()
            .unwrap_or(0)
    }

    fn max_in_flight(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open_session(
        &self,
        host: &HostSpec,
        _credential: &Credential,
        _deadline: Duration,
    ) -> Result<Box<dyn Session>, TransportError> {
        self.state.calls.fetch_add(1, Ordering::SeqCst);
        let call = {
            let mut per_host = self.state.per_host.lock().unwrap();
            let count = per_host.entry(host.address.clone()).or_insert(0);
            *count += 1;
            *count
        };

        let behavior = self.behaviors.get(&host.address).copied().unwrap_or(OK);
        match behavior {
            Behavior::Refuse => {
                return Err(TransportError::ConnectFailed("connection refused".into()));
            }
            Behavior::RefuseFirst(n) if call <= n => {
                return Err(TransportError::ConnectFailed("connection refused".into()));
            }
            Behavior::RejectAuth => {
                return Err(TransportError::AuthRejected("permission denied".into()));
            }
            Behavior::HostKeyChanged => {
                return Err(TransportError::HostKeyMismatch(host.address.clone()));
            }
            Behavior::Panic => panic!("transport bug for {}", host.address),
            _ => {}
        }

        let now = self.state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_in_flight.fetch_max(now, Ordering::SeqCst);

        Ok(Box::new(MockSession {
            behavior,
            _guard: InFlight(self.state.clone()),
        }))
    }

    fn transport_type(&self) -> &'static str {
        "mock"
    }
}

struct MockSession {
    behavior: Behavior,
    _guard: InFlight,
}

#[async_trait]
impl Session for MockSession {
    async fn run(&mut self, command: &str) -> Result<CommandOutput, TransportError> {
        let (delay, exit_code) = match self.behavior {
            Behavior::Succeed { delay, exit_code } => (delay, exit_code),
            Behavior::Hang => {
                std::future::pending::<()>().await;
                unreachable!()
            }
            _ => (Duration::from_millis(10), 0),
        };

        tokio::time::sleep(delay).await;
        Ok(CommandOutput {
            exit_code,
            stdout: format!("{command}\n").into_bytes(),
            stderr: Vec::new(),
            duration: delay,
        })
    }

    async fn upload(
        &mut self,
        data: &[u8],
        _remote_path: &str,
        _mode: Option<u32>,
    ) -> Result<CommandOutput, TransportError> {
        Ok(CommandOutput {
            exit_code: 0,
            stdout: Vec::new(),
            stderr: Vec::new(),
            duration: Duration::from_millis(u64::try_from(data.len()).unwrap()),
        })
    }

    async fn close(self: Box<Self>) {}
}

/// Keeps every event for later inspection
#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<ExecEvent>>,
}

impl RecordingSink {
    fn events(&self) -> Vec<ExecEvent> {
        self.events.lock().unwrap().clone()
    }

    fn max_active(&self) -> usize {
        self.events()
            .iter()
            .filter_map(|e| match e {
                ExecEvent::HostStarted { active, .. } => Some(*active),
                _ => None,
            })
            .max()
            .unwrap_or(0)
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: ExecEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Vault whose lookups never answer
struct StuckVault;

#[async_trait]
impl SecretVault for StuckVault {
    async fn lookup(&self, _key: &str) -> Option<Secret> {
        std::future::pending().await
    }
}

fn stuck_vault_host(name: &str) -> HostSpec {
    HostSpec::new(name, "deploy").with_credential(CredentialSource::VaultLookup {
        key: "deploy".to_string(),
    })
}

fn password_resolver() -> CredentialResolver {
    CredentialResolver::new().with_defaults(vec![CredentialSource::InlineSecret {
        secret: Secret::Password {
            password: "hunter2".into(),
        },
    }])
}

fn executor(transport: Arc<MockTransport>) -> Executor {
    Executor::new(transport)
        .with_resolver(password_resolver())
        .with_sink(Arc::new(NullSink))
}

fn hosts(names: &[&str]) -> Vec<HostSpec> {
    names
        .iter()
        .map(|name| HostSpec::new(*name, "deploy").with_name(*name))
        .collect()
}

fn policy() -> ExecutionPolicy {
    ExecutionPolicy::default()
        .with_timeout(Duration::from_secs(5))
        .with_retries(2)
        .with_backoff(Backoff::none())
        .with_concurrency(4)
}

#[tokio::test(start_paused = true)]
async fn test_one_host_timing_out_gives_partial_failure() {
    let transport = MockTransport::new(&[("b", Behavior::Hang)]);
    let executor = executor(transport.clone());

    let batch = executor
        .execute(hosts(&["a", "b", "c"]), "uptime", &policy().with_retries(1))
        .await
        .unwrap();

    assert_eq!(batch.status, BatchStatus::PartialFailure);
    assert_eq!(batch.len(), 3);

    let names: Vec<_> = batch.results.iter().map(|r| r.host.as_str()).collect();
    assert_eq!(names, vec!["a", "b", "c"]);

    assert!(batch.results[0].outcome.is_success());
    assert_eq!(batch.results[1].outcome, HostOutcome::TimedOut);
    assert_eq!(batch.results[1].attempts, 2);
    assert!(batch.results[2].outcome.is_success());
    assert_eq!(batch.results[0].outcome.output().unwrap().stdout_lossy(), "uptime\n");

    // b finished last
    assert_eq!(batch.completion_order.last(), Some(&1));
    assert_eq!(batch.failures().count(), 1);
}

#[tokio::test]
async fn test_empty_host_list() {
    let transport = MockTransport::new(&[]);
    let batch = executor(transport.clone())
        .execute(Vec::new(), "true", &policy())
        .await
        .unwrap();

    assert!(batch.is_empty());
    assert_eq!(batch.status, BatchStatus::AllSucceeded);
    assert_eq!(transport.calls(), 0);
}

#[tokio::test]
async fn test_zero_concurrency_rejected_before_any_call() {
    let transport = MockTransport::new(&[]);
    let executor = executor(transport.clone());
    let policy = policy().with_concurrency(0);

    let err = executor
        .execute(hosts(&["a", "b"]), "true", &policy)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidPolicy(_)));

    let err = executor
        .start(hosts(&["a"]), Job::command("true"), &policy)
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidPolicy(_)));

    assert_eq!(transport.calls(), 0);
}

#[tokio::test]
async fn test_zero_timeout_rejected() {
    let transport = MockTransport::new(&[]);
    let err = executor(transport.clone())
        .execute(hosts(&["a"]), "true", &policy().with_timeout(Duration::ZERO))
        .await
        .unwrap_err();

    assert!(matches!(err, CoreError::InvalidPolicy(_)));
    assert_eq!(transport.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_every_attempt_timing_out() {
    let transport = MockTransport::new(&[("slow", Behavior::Hang)]);
    let batch = executor(transport.clone())
        .execute(hosts(&["slow"]), "sleep 999", &policy().with_retries(3))
        .await
        .unwrap();

    let result = &batch.results[0];
    assert_eq!(result.outcome, HostOutcome::TimedOut);
    assert_eq!(result.attempts, 4);
    assert_eq!(transport.calls_for("slow"), 4);
    assert!(result.elapsed >= Duration::from_secs(20));
}

#[tokio::test]
async fn test_missing_credential_is_one_attempt() {
    let transport = MockTransport::new(&[]);
    let executor = executor(transport.clone());
    let host = HostSpec::new("vaulted", "deploy").with_credential(CredentialSource::VaultLookup {
        key: "no-such-entry".to_string(),
    });

    let batch = executor
        .execute(vec![host], "true", &policy())
        .await
        .unwrap();

    let result = &batch.results[0];
    assert!(matches!(result.outcome, HostOutcome::AuthFailed(_)));
    assert_eq!(result.attempts, 1);
    assert_eq!(transport.calls(), 0);
    assert_eq!(batch.status, BatchStatus::PartialFailure);
}

#[tokio::test]
async fn test_rejected_credential_is_not_retried() {
    let transport = MockTransport::new(&[("locked", Behavior::RejectAuth)]);
    let batch = executor(transport.clone())
        .execute(hosts(&["locked"]), "true", &policy())
        .await
        .unwrap();

    assert!(matches!(batch.results[0].outcome, HostOutcome::AuthFailed(_)));
    assert_eq!(batch.results[0].attempts, 1);
    assert_eq!(transport.calls_for("locked"), 1);
}

#[tokio::test]
async fn test_host_key_mismatch_is_not_retried() {
    let transport = MockTransport::new(&[("mitm", Behavior::HostKeyChanged)]);
    let batch = executor(transport.clone())
        .execute(hosts(&["mitm"]), "true", &policy())
        .await
        .unwrap();

    assert_eq!(
        batch.results[0].outcome,
        HostOutcome::TransportError(TransportError::HostKeyMismatch("mitm".to_string()))
    );
    assert_eq!(transport.calls_for("mitm"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_refused_connections_exhaust_retries() {
    let transport = MockTransport::new(&[("down", Behavior::Refuse)]);
    let policy = policy().with_backoff(Backoff::constant(Duration::from_secs(2)));

    let batch = executor(transport.clone())
        .execute(hosts(&["down", "up"]), "true", &policy)
        .await
        .unwrap();

    let down = batch.by_host("down").unwrap();
    assert!(matches!(
        down.outcome,
        HostOutcome::RetriesExhausted(TransportError::ConnectFailed(_))
    ));
    assert_eq!(down.attempts, 3);
    assert!(down.elapsed >= Duration::from_secs(4));
    assert!(batch.by_host("up").unwrap().outcome.is_success());
}

#[tokio::test(start_paused = true)]
async fn test_transient_failure_recovers() {
    let transport = MockTransport::new(&[("flaky", Behavior::RefuseFirst(2))]);
    let batch = executor(transport.clone())
        .execute(hosts(&["flaky"]), "true", &policy())
        .await
        .unwrap();

    assert!(batch.results[0].outcome.is_success());
    assert_eq!(batch.results[0].attempts, 3);
    assert_eq!(batch.status, BatchStatus::AllSucceeded);
}

#[tokio::test]
async fn test_panicking_transport_is_contained() {
    let transport = MockTransport::new(&[("bad", Behavior::Panic)]);
    let batch = executor(transport.clone())
        .execute(hosts(&["ok1", "bad", "ok2"]), "true", &policy())
        .await
        .unwrap();

    let bad = batch.by_host("bad").unwrap();
    match &bad.outcome {
        HostOutcome::TransportError(TransportError::Panicked(msg)) => {
            assert!(msg.contains("transport bug for bad"));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(bad.attempts, 1);
    assert!(batch.by_host("ok1").unwrap().outcome.is_success());
    assert!(batch.by_host("ok2").unwrap().outcome.is_success());
    assert_eq!(batch.status, BatchStatus::PartialFailure);
}

#[tokio::test]
async fn test_non_zero_exit_is_still_success() {
    let transport = MockTransport::new(&[(
        "grumpy",
        Behavior::Succeed {
            delay: Duration::from_millis(1),
            exit_code: 3,
        },
    )]);
    let batch = executor(transport.clone())
        .execute(hosts(&["grumpy"]), "false", &policy())
        .await
        .unwrap();

    let result = &batch.results[0];
    assert!(result.outcome.is_success());
    assert_eq!(result.exit_code(), Some(3));
    assert!(!result.succeeded());
    assert_eq!(result.attempts, 1);
    assert_eq!(batch.status, BatchStatus::AllSucceeded);
}

#[tokio::test(start_paused = true)]
async fn test_concurrency_never_exceeds_limit() {
    let names: Vec<String> = (0..12).map(|i| format!("node{i}")).collect();
    let behaviors: Vec<(&str, Behavior)> = names
        .iter()
        .map(|n| {
            (
                n.as_str(),
                Behavior::Succeed {
                    delay: Duration::from_secs(1),
                    exit_code: 0,
                },
            )
        })
        .collect();
    let transport = MockTransport::new(&behaviors);
    let sink = Arc::new(RecordingSink::default());
    let executor = executor(transport.clone()).with_sink(sink.clone());

    let host_names: Vec<&str> = names.iter().map(String::as_str).collect();
    let batch = executor
        .execute(hosts(&host_names), "true", &policy().with_concurrency(3))
        .await
        .unwrap();

    assert_eq!(batch.status, BatchStatus::AllSucceeded);
    assert_eq!(transport.max_in_flight(), 3);
    assert_eq!(sink.max_active(), 3);

    let events = sink.events();
    let started = events
        .iter()
        .filter(|e| matches!(e, ExecEvent::HostStarted { .. }))
        .count();
    let finished = events
        .iter()
        .filter(|e| matches!(e, ExecEvent::HostFinished { .. }))
        .count();
    assert_eq!(started, 12);
    assert_eq!(finished, 12);
    assert!(matches!(
        events.last(),
        Some(ExecEvent::HostFinished { active: 0, .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_after_some_hosts_completed() {
    // Sequential hosts that each take a second
    let slow = Behavior::Succeed {
        delay: Duration::from_secs(1),
        exit_code: 0,
    };
    let transport = MockTransport::new(&[
        ("h0", slow),
        ("h1", slow),
        ("h2", slow),
        ("h3", slow),
        ("h4", slow),
    ]);
    let sink = Arc::new(BroadcastSink::new(256));
    let mut events = sink.subscribe();
    let executor = executor(transport.clone()).with_sink(sink.clone());

    let running = executor
        .start(
            hosts(&["h0", "h1", "h2", "h3", "h4"]),
            Job::command("deploy"),
            &policy().with_concurrency(1),
        )
        .unwrap();
    let handle = running.cancel_handle();

    let mut finished = 0;
    while finished < 2 {
        if let ExecEvent::HostFinished { .. } = events.recv().await.unwrap() {
            finished += 1;
        }
    }
    handle.cancel();
    assert!(handle.is_cancelled());

    let batch = running.wait().await.unwrap();
    assert_eq!(batch.status, BatchStatus::Cancelled);
    assert_eq!(batch.len(), 5);

    let done: Vec<_> = batch
        .results
        .iter()
        .filter(|r| !r.outcome.is_cancelled())
        .map(|r| r.host.as_str())
        .collect();
    assert_eq!(done, vec!["h0", "h1"]);

    // queued hosts never reached the transport
    assert_eq!(batch.by_host("h4").unwrap().attempts, 0);
    assert_eq!(transport.calls_for("h4"), 0);
    assert!(transport.calls() <= 3);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_stops_retries() {
    let transport = MockTransport::new(&[("slow", Behavior::Hang)]);
    let policy = ExecutionPolicy::default()
        .with_timeout(Duration::from_secs(10))
        .with_retries(5)
        .with_backoff(Backoff::constant(Duration::from_secs(5)))
        .with_deadline(Duration::from_secs(25));

    let batch = executor(transport.clone())
        .execute(hosts(&["slow"]), "true", &policy)
        .await
        .unwrap();

    let result = &batch.results[0];
    assert_eq!(result.outcome, HostOutcome::TimedOut);
    assert_eq!(result.attempts, 2);
    assert!(result.elapsed <= Duration::from_secs(26));
}

#[tokio::test]
async fn test_running_batch_completes_without_cancel() {
    let transport = MockTransport::new(&[]);
    let running = executor(transport.clone())
        .start(hosts(&["a", "b"]), Job::command("true"), &policy())
        .unwrap();

    let batch = running.wait().await.unwrap();
    assert_eq!(batch.status, BatchStatus::AllSucceeded);
    assert_eq!(batch.completion_order.len(), 2);
}

#[tokio::test]
async fn test_upload_job_runs_through_pool() {
    let transport = MockTransport::new(&[]);
    let job = Job::Upload {
        data: vec![0_u8; 42],
        remote_path: "/tmp/payload".to_string(),
        mode: Some(0o644),
    };
    let running = executor(transport.clone())
        .start(hosts(&["a"]), job, &policy())
        .unwrap();

    let batch = running.wait().await.unwrap();
    let output = batch.results[0].outcome.output().unwrap();
    assert_eq!(output.duration, Duration::from_millis(42));
}

#[tokio::test(start_paused = true)]
async fn test_stuck_vault_times_out_as_auth_failure() {
    let transport = MockTransport::new(&[]);
    let executor = Executor::new(transport.clone())
        .with_resolver(password_resolver().with_vault(Arc::new(StuckVault)))
        .with_sink(Arc::new(NullSink));

    let mut hosts = hosts(&["plain"]);
    hosts.push(stuck_vault_host("vaulted"));

    let batch = executor
        .execute(hosts, "true", &policy().with_retries(2))
        .await
        .unwrap();

    let vaulted = batch.by_host("vaulted").unwrap();
    match &vaulted.outcome {
        HostOutcome::AuthFailed(reason) => assert!(reason.contains("timed out")),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(vaulted.attempts, 1);
    assert!(vaulted.elapsed >= Duration::from_secs(5));
    assert_eq!(transport.calls_for("vaulted"), 0);
    assert!(batch.by_host("plain").unwrap().outcome.is_success());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_interrupts_credential_lookup() {
    let transport = MockTransport::new(&[]);
    let executor = Executor::new(transport.clone())
        .with_resolver(password_resolver().with_vault(Arc::new(StuckVault)))
        .with_sink(Arc::new(NullSink));
    let policy = policy().with_timeout(Duration::from_secs(3600));

    let running = executor
        .start(vec![stuck_vault_host("vaulted")], Job::command("true"), &policy)
        .unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;
    running.cancel();

    let batch = tokio::time::timeout(Duration::from_secs(10), running.wait())
        .await
        .expect("batch should finish after cancel")
        .unwrap();
    assert_eq!(batch.status, BatchStatus::Cancelled);
    assert_eq!(batch.results[0].outcome, HostOutcome::Cancelled);
    assert_eq!(batch.results[0].attempts, 1);
    assert_eq!(transport.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_backoff() {
    let transport = MockTransport::new(&[("down", Behavior::Refuse)]);
    let policy = policy().with_backoff(Backoff::constant(Duration::from_secs(60)));

    let running = executor(transport.clone())
        .start(hosts(&["down"]), Job::command("true"), &policy)
        .unwrap();
    // first attempt fails at once, then the task sleeps for a minute
    tokio::time::sleep(Duration::from_secs(10)).await;
    running.cancel();

    let batch = running.wait().await.unwrap();
    let result = &batch.results[0];
    assert_eq!(result.outcome, HostOutcome::Cancelled);
    assert_eq!(result.attempts, 1);
    assert!(result.elapsed < Duration::from_secs(60));
    assert_eq!(transport.calls_for("down"), 1);
    assert_eq!(batch.status, BatchStatus::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn test_last_attempt_is_cut_to_the_deadline() {
    let transport = MockTransport::new(&[("slow", Behavior::Hang)]);
    let sink = Arc::new(RecordingSink::default());
    let policy = ExecutionPolicy::default()
        .with_timeout(Duration::from_secs(10))
        .with_retries(5)
        .with_backoff(Backoff::constant(Duration::from_secs(3)))
        .with_deadline(Duration::from_secs(15));

    let batch = executor(transport.clone())
        .with_sink(sink.clone())
        .execute(hosts(&["slow"]), "true", &policy)
        .await
        .unwrap();

    // 10s attempt, 3s backoff, then only 2s left for the second attempt
    let result = &batch.results[0];
    assert_eq!(result.outcome, HostOutcome::TimedOut);
    assert_eq!(result.attempts, 2);
    assert!(result.elapsed >= Duration::from_secs(15));
    assert!(result.elapsed < Duration::from_millis(15_100));

    let second = sink
        .events()
        .into_iter()
        .find_map(|e| match e {
            ExecEvent::AttemptFinished {
                attempt: 2,
                elapsed,
                ..
            } => Some(elapsed),
            _ => None,
        })
        .unwrap();
    assert!(second < Duration::from_secs(3));
}
