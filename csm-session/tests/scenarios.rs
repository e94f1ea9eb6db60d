use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use csm_cluster::{
    ConnectionTarget, Credentials, ForkComponent, LoopbackCluster, MutationOptions, QueryRequest,
    ServiceType, TransactionOptions, TransactionsConfig,
};
use csm_common::{
    map_error_to_exception, CommonErrc, DocumentId, ErrorCode, ErrorContext, ExceptionKind,
    ForkEvent, HostException, KeyValueErrc, QueryErrc, ServiceFailure, TransactionErrc,
};
use csm_session::{CacheConfig, CacheService, Fingerprint, ForkTarget};

fn target() -> ConnectionTarget {
    ConnectionTarget::new(
        "couchbase://127.0.0.1",
        Credentials {
            username: "Administrator".into(),
            password: "password".into(),
        },
    )
}

fn service(cluster: &LoopbackCluster, config: CacheConfig) -> CacheService {
    CacheService::startup(config, Arc::new(cluster.clone())).expect("startup")
}

#[test]
fn repeated_lookup_returns_the_same_session() {
    let cluster = LoopbackCluster::new();
    let mut service = service(&cluster, CacheConfig::default());
    let now = Instant::now();

    let first = service
        .connect_at(Fingerprint::new("A"), &target(), now)
        .unwrap();
    let after_first = first.refcount();
    let second = service
        .connect_at(Fingerprint::new("A"), &target(), now)
        .unwrap();

    assert!(!first.is_cache_hit());
    assert!(second.is_cache_hit());
    assert!(Arc::ptr_eq(first.session(), second.session()));
    assert_eq!(second.refcount(), after_first + 1);
    assert_eq!(cluster.cores().len(), 1);
}

#[test]
fn full_cache_evicts_released_expired_entry() {
    let cluster = LoopbackCluster::new();
    let config = CacheConfig {
        max_connections: Some(1),
        ..CacheConfig::default()
    };
    let mut service = service(&cluster, config);
    let start = Instant::now();

    let a = service
        .connect_at(Fingerprint::new("A"), &target(), start)
        .unwrap();
    drop(a);

    let b = service
        .connect_at(Fingerprint::new("B"), &target(), start + Duration::from_millis(5))
        .unwrap();
    assert!(b.is_open());
    assert!(service.cache().session(&Fingerprint::new("A")).is_none());
    assert_eq!(service.cache().live_connections(), 1);
    assert_eq!(cluster.open_cores(), 1);
}

#[test]
fn missing_document_maps_to_key_value_context() {
    let cluster = LoopbackCluster::new().with_bucket("travel");
    let mut service = service(&cluster, CacheConfig::default());
    let lease = service.connect(&target()).unwrap();
    lease.open_bucket("travel").unwrap();

    let id = DocumentId::new("travel", "_default", "_default", "airline_404");
    let err = lease.get(&id, None).unwrap_err();

    assert_eq!(err.code, ErrorCode::KeyValue(KeyValueErrc::DocumentNotFound));
    assert_eq!(err.message, "unable to execute get \"airline_404\"");
    match &err.context {
        ErrorContext::KeyValue(context) => {
            assert_eq!(context.bucket, "travel");
            assert_eq!(context.scope, "_default");
            assert_eq!(context.collection, "_default");
            assert_eq!(context.id, "airline_404");
        }
        other => panic!("unexpected context {:?}", other),
    }
    assert_eq!(map_error_to_exception(err.code), ExceptionKind::DocumentNotFound);

    let exception = HostException::from(&err);
    assert_eq!(exception.kind, ExceptionKind::DocumentNotFound);
    assert!(exception.message.contains("airline_404"));
}

#[test]
fn prepare_then_child_restarts_the_connection_once() {
    let cluster = LoopbackCluster::new();
    let mut service = service(&cluster, CacheConfig::default());
    let lease = service.connect(&target()).unwrap();
    assert_eq!(lease.thread_starts(), 1);

    let prepared = service.notify_fork(ForkEvent::Prepare);
    assert!(!lease.is_running());
    let resumed = service.notify_fork(ForkEvent::Child);

    assert_eq!(lease.thread_starts(), 2);
    assert!(lease.is_running());
    assert_eq!(prepared.visits.len(), 1);
    assert_eq!(prepared.visits[0].target, ForkTarget::Connection);
    assert_eq!(resumed.visits.len(), 1);
    assert_eq!(resumed.visits[0].event, ForkEvent::Child);
    assert!(resumed.failures.is_empty());

    let log = cluster.fork_log();
    assert!(log.iter().all(|record| record.component == ForkComponent::Io));
    let events: Vec<_> = log.iter().map(|record| record.event).collect();
    assert_eq!(events, vec![ForkEvent::Prepare, ForkEvent::Child]);

    // The restarted loop serves requests again.
    lease.ping(Default::default()).unwrap();
}

#[test]
fn fork_orders_transactions_around_connections() {
    let cluster = LoopbackCluster::new().with_bucket("travel");
    let mut service = service(&cluster, CacheConfig::default());
    let lease = service.connect(&target()).unwrap();
    let _transactions = service
        .begin_transactions(lease.clone(), TransactionsConfig::default())
        .unwrap();

    service.notify_fork(ForkEvent::Prepare);
    service.notify_fork(ForkEvent::Parent);

    let components: Vec<_> = cluster
        .fork_log()
        .iter()
        .map(|record| (record.component, record.event))
        .collect();
    assert_eq!(
        components,
        vec![
            (ForkComponent::Transactions, ForkEvent::Prepare),
            (ForkComponent::Io, ForkEvent::Prepare),
            (ForkComponent::Io, ForkEvent::Parent),
            (ForkComponent::Transactions, ForkEvent::Parent),
        ]
    );
}

#[test]
fn documents_and_queries_through_a_lease() {
    let cluster = LoopbackCluster::new().with_bucket("travel");
    cluster.on_query(|request| {
        Ok(csm_cluster::QueryResult {
            rows: vec![serde_json::json!({ "statement": request.statement.clone() })],
            ..Default::default()
        })
    });
    let mut service = service(&cluster, CacheConfig::default());
    let lease = service.connect(&target()).unwrap();
    lease.open_bucket("travel").unwrap();

    let id = DocumentId::in_default_collection("travel", "hotel_1");
    let stored = lease
        .upsert(&id, Bytes::from_static(br#"{"name":"Medway"}"#), MutationOptions::default())
        .unwrap();
    let fetched = lease.get(&id, None).unwrap();
    assert_eq!(fetched.cas, stored.cas);

    let err = lease
        .insert(&id, Bytes::from_static(b"{}"), MutationOptions::default())
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::KeyValue(KeyValueErrc::DocumentExists));

    let result = lease.query(QueryRequest::new("SELECT 1")).unwrap();
    assert_eq!(result.rows.len(), 1);

    cluster.fail_next(
        ServiceType::Query,
        ServiceFailure::new(QueryErrc::PlanningFailure).with_first_error(4000, "no index"),
    );
    let err = lease.query(QueryRequest::new("SELECT * FROM travel")).unwrap_err();
    match &err.context {
        ErrorContext::Query(context) => {
            assert_eq!(context.first_error_code, 4000);
            assert_eq!(context.statement, "SELECT * FROM travel");
        }
        other => panic!("unexpected context {:?}", other),
    }
    assert!(err.render_message().contains("serverError=4000"));

    lease.remove(&id, MutationOptions::default()).unwrap();
    let metrics = service.metrics();
    assert!(metrics.calls_total >= 7);
    assert!(metrics.failures_total >= 2);
}

#[test]
fn transaction_commit_and_operation_failure() {
    let cluster = LoopbackCluster::new().with_bucket("travel");
    let mut service = service(&cluster, CacheConfig::default());
    let lease = service.connect(&target()).unwrap();
    lease.open_bucket("travel").unwrap();
    let transactions = service
        .begin_transactions(lease.clone(), TransactionsConfig::default())
        .unwrap();

    let attempt = transactions.begin(TransactionOptions::default()).unwrap();
    let id = DocumentId::in_default_collection("travel", "txn_1");
    attempt.insert(&id, Bytes::from_static(b"{\"n\":1}")).unwrap();
    let err = attempt.insert(&id, Bytes::from_static(b"{}")).unwrap_err();
    assert_eq!(err.code, ErrorCode::Transaction(TransactionErrc::OperationFailed));
    assert_eq!(
        map_error_to_exception(err.code),
        ExceptionKind::TransactionOperationFailed
    );

    let result = attempt.commit().unwrap();
    assert_eq!(result.transaction_id, attempt.transaction_id());
    assert!(lease.get(&id, None).is_ok());

    transactions.close();
    let err = transactions.begin(TransactionOptions::default()).err().unwrap();
    assert_eq!(err.code, ErrorCode::Common(CommonErrc::RequestCanceled));
}
