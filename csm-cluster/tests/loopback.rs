use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use csm_cluster::{
    ClusterCore, ClusterCoreFactory, Completion, ConnectionTarget, Credentials, Delivery,
    ForkComponent, LoopbackCluster, MutationKind, MutationOptions, Outcome, Request, Response,
    ServiceType, TransactionOptions, TransactionsConfig,
};
use csm_common::{
    CommonErrc, DocumentId, ErrorCode, ForkEvent, KeyValueErrc, ServiceFailure, TransactionErrc,
};

const WAIT: Duration = Duration::from_secs(5);

struct Running {
    core: Arc<dyn ClusterCore>,
    driver: Option<thread::JoinHandle<()>>,
}

impl Running {
    fn start(cluster: &LoopbackCluster) -> Self {
        let core = cluster.create().expect("create core");
        let io = core.io();
        let driver = thread::spawn(move || io.run());
        Running {
            core,
            driver: Some(driver),
        }
    }

    fn open(cluster: &LoopbackCluster) -> Self {
        let running = Self::start(cluster);
        let result = call(|done| running.core.open(&target(), done).expect("submit open"));
        assert_eq!(result, Delivery::Resolved(Ok(())));
        running
    }

    fn execute(&self, request: Request) -> Outcome<Response> {
        match call(|done| self.core.execute(request, done).expect("submit request")) {
            Delivery::Resolved(outcome) => outcome,
            Delivery::Abandoned => panic!("completion abandoned"),
        }
    }
}

impl Drop for Running {
    fn drop(&mut self) {
        self.core.io().stop();
        if let Some(driver) = self.driver.take() {
            let _ = driver.join();
        }
    }
}

fn target() -> ConnectionTarget {
    ConnectionTarget::new(
        "couchbase://127.0.0.1",
        Credentials {
            username: "Administrator".into(),
            password: "password".into(),
        },
    )
}

fn call<T: Send + 'static>(submit: impl FnOnce(Completion<T>)) -> Delivery<T> {
    let (tx, rx) = mpsc::channel();
    submit(Completion::new(move |delivery| {
        let _ = tx.send(delivery);
    }));
    rx.recv_timeout(WAIT).expect("completion delivered")
}

fn upsert(id: &DocumentId, body: &'static str) -> Request {
    Request::Mutate {
        kind: MutationKind::Upsert,
        id: id.clone(),
        value: Bytes::from_static(body.as_bytes()),
        options: MutationOptions::default(),
    }
}

#[test]
fn open_rejects_wrong_password() {
    let cluster = LoopbackCluster::new().with_bucket("travel");
    cluster.set_credentials("Administrator", "other");
    let running = Running::start(&cluster);

    let result = call(|done| running.core.open(&target(), done).unwrap());
    match result {
        Delivery::Resolved(Err(failure)) => {
            assert_eq!(failure.code, ErrorCode::Common(CommonErrc::AuthenticationFailure))
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(cluster.open_cores(), 0);
}

#[test]
fn documents_round_trip_after_bucket_open() {
    let cluster = LoopbackCluster::new().with_bucket("travel");
    let running = Running::open(&cluster);
    let id = DocumentId::in_default_collection("travel", "airline_10");

    let failure = running.execute(upsert(&id, "{}")).unwrap_err();
    assert_eq!(failure.code, ErrorCode::Common(CommonErrc::BucketNotFound));

    running
        .execute(Request::OpenBucket {
            bucket: "travel".into(),
        })
        .unwrap();
    let cas = match running.execute(upsert(&id, r#"{"name":"40-Mile Air"}"#)).unwrap() {
        Response::Mutation(result) => {
            assert_eq!(result.token.as_ref().unwrap().bucket, "travel");
            result.cas
        }
        other => panic!("unexpected {:?}", other),
    };

    match running
        .execute(Request::Get {
            id: id.clone(),
            timeout: None,
        })
        .unwrap()
    {
        Response::Get(got) => {
            assert_eq!(got.cas, cas);
            assert_eq!(&got.value[..], br#"{"name":"40-Mile Air"}"#);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn missing_document_reports_key_value_details() {
    let cluster = LoopbackCluster::new().with_bucket("travel");
    let running = Running::open(&cluster);
    running
        .execute(Request::OpenBucket {
            bucket: "travel".into(),
        })
        .unwrap();

    let failure = running
        .execute(Request::Get {
            id: DocumentId::in_default_collection("travel", "missing"),
            timeout: None,
        })
        .unwrap_err();
    assert_eq!(failure.code, ErrorCode::KeyValue(KeyValueErrc::DocumentNotFound));
    assert_eq!(failure.status_code, Some(0x01));
    assert!(failure.opaque.is_some());
    assert_eq!(failure.retry.last_dispatched_to.as_deref(), Some("127.0.0.1:11210"));
}

#[test]
fn latency_beyond_timeout_yields_ambiguous_timeout_for_mutations() {
    let cluster = LoopbackCluster::new().with_bucket("travel");
    let running = Running::open(&cluster);
    running
        .execute(Request::OpenBucket {
            bucket: "travel".into(),
        })
        .unwrap();
    cluster.set_latency(ServiceType::KeyValue, Duration::from_millis(200));

    let id = DocumentId::in_default_collection("travel", "slow");
    let mut options = MutationOptions::default();
    options.timeout = Some(Duration::from_millis(20));
    let failure = running
        .execute(Request::Mutate {
            kind: MutationKind::Upsert,
            id: id.clone(),
            value: Bytes::from_static(b"{}"),
            options,
        })
        .unwrap_err();
    assert_eq!(failure.code, ErrorCode::Common(CommonErrc::AmbiguousTimeout));

    let failure = running
        .execute(Request::Get {
            id,
            timeout: Some(Duration::from_millis(20)),
        })
        .unwrap_err();
    assert_eq!(failure.code, ErrorCode::Common(CommonErrc::UnambiguousTimeout));
}

#[test]
fn injected_failure_and_abandonment_apply_once() {
    let cluster = LoopbackCluster::new();
    let running = Running::open(&cluster);
    cluster.fail_next(
        ServiceType::Query,
        ServiceFailure::new(csm_common::QueryErrc::PlanningFailure).with_first_error(4000, "no index"),
    );

    let failure = running
        .execute(Request::Query(csm_cluster::QueryRequest::new("SELECT 1")))
        .unwrap_err();
    assert_eq!(failure.http.as_ref().unwrap().port, 8093);
    assert!(running
        .execute(Request::Query(csm_cluster::QueryRequest::new("SELECT 1")))
        .is_ok());

    cluster.abandon_next(ServiceType::Query);
    let delivery = call(|done| {
        running
            .core
            .execute(Request::Query(csm_cluster::QueryRequest::new("SELECT 1")), done)
            .unwrap()
    });
    assert_eq!(delivery, Delivery::Abandoned);
}

#[test]
fn empty_statement_fails_synchronously() {
    let cluster = LoopbackCluster::new();
    let running = Running::open(&cluster);
    let err = running
        .core
        .execute(
            Request::Query(csm_cluster::QueryRequest::new("  ")),
            Completion::new(|_| {}),
        )
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::Common(CommonErrc::InvalidArgument));
}

#[test]
fn transaction_commits_staged_writes() {
    let cluster = LoopbackCluster::new().with_bucket("travel");
    let running = Running::open(&cluster);
    let transactions = match call(|done| {
        running
            .core
            .transactions(TransactionsConfig::default(), done)
            .unwrap()
    }) {
        Delivery::Resolved(Ok(transactions)) => transactions,
        other => panic!("unexpected {:?}", other.map_err_debug()),
    };

    let ctx = transactions.begin(TransactionOptions::default()).unwrap();
    assert!(matches!(call(|done| ctx.new_attempt(done)), Delivery::Resolved(Ok(()))));

    let id = DocumentId::in_default_collection("travel", "txn-doc");
    let inserted = call(|done| ctx.insert(id.clone(), Bytes::from_static(b"{\"n\":1}"), done));
    assert!(matches!(inserted, Delivery::Resolved(Ok(_))));
    assert_eq!(cluster.document_count(), 0);

    match call(|done| ctx.finalize(done)) {
        Delivery::Resolved(Ok(result)) => {
            assert!(result.unstaging_complete);
            assert_eq!(result.transaction_id, ctx.transaction_id());
        }
        other => panic!("unexpected {:?}", other.map_err_debug()),
    }
    assert_eq!(cluster.document_count(), 1);
}

#[test]
fn commit_conflict_before_any_write_fails_the_transaction() {
    let cluster = LoopbackCluster::new().with_bucket("travel");
    let running = Running::open(&cluster);
    let transactions = match call(|done| {
        running
            .core
            .transactions(TransactionsConfig::default(), done)
            .unwrap()
    }) {
        Delivery::Resolved(Ok(transactions)) => transactions,
        _ => panic!("transactions unavailable"),
    };

    let ctx = transactions.begin(TransactionOptions::default()).unwrap();
    assert!(matches!(call(|done| ctx.new_attempt(done)), Delivery::Resolved(Ok(()))));
    let first = DocumentId::in_default_collection("travel", "seat-1");
    let second = DocumentId::in_default_collection("travel", "seat-2");
    for id in [&first, &second] {
        let staged = call(|done| ctx.insert(id.clone(), Bytes::from_static(b"{}"), done));
        assert!(matches!(staged, Delivery::Resolved(Ok(_))));
    }

    // Another writer takes the first document before the commit.
    assert!(running.execute(upsert(&first, "{\"taken\":true}")).is_ok());

    match call(|done| ctx.finalize(done)) {
        Delivery::Resolved(Err(failure)) => {
            assert_eq!(failure.code, TransactionErrc::Failed);
            assert_eq!(failure.cause, Some(ErrorCode::KeyValue(KeyValueErrc::DocumentExists)));
            assert!(failure.result.is_none());
        }
        other => panic!("unexpected {:?}", other.map_err_debug()),
    }
    assert_eq!(cluster.document_count(), 1);
}

#[test]
fn fork_notifications_are_logged_per_component() {
    let cluster = LoopbackCluster::new();
    let running = Running::open(&cluster);
    let transactions = match call(|done| {
        running
            .core
            .transactions(TransactionsConfig::default(), done)
            .unwrap()
    }) {
        Delivery::Resolved(Ok(transactions)) => transactions,
        _ => panic!("transactions unavailable"),
    };

    transactions.notify_fork(ForkEvent::Prepare);
    running.core.io().notify_fork(ForkEvent::Prepare);

    let log = cluster.fork_log();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].component, ForkComponent::Transactions);
    assert_eq!(log[1].component, ForkComponent::Io);
    assert!(log.iter().all(|record| record.event == ForkEvent::Prepare));
}

trait DebugDelivery {
    fn map_err_debug(self) -> String;
}

impl<T, E: std::fmt::Debug> DebugDelivery for Delivery<Result<T, E>> {
    fn map_err_debug(self) -> String {
        match self {
            Delivery::Resolved(Ok(_)) => "ok".to_string(),
            Delivery::Resolved(Err(err)) => format!("{:?}", err),
            Delivery::Abandoned => "abandoned".to_string(),
        }
    }
}
