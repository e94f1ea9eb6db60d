use std::sync::Arc;

use serde_json::{json, Value};

use csm_cluster::{LoopbackCluster, QueryResult, ServiceType};
use csm_common::{ExceptionKind, QueryErrc, ServiceFailure};
use csm_host::{HostRuntime, HostSettings};

fn runtime(cluster: &LoopbackCluster, settings: &str) -> HostRuntime {
    let settings = HostSettings::parse(settings).expect("settings");
    HostRuntime::startup(settings, Arc::new(cluster.clone())).expect("startup")
}

fn connect(runtime: &mut HostRuntime, username: &str) -> Value {
    runtime
        .call(
            "connect",
            &[json!("couchbase://127.0.0.1"), json!(username), json!("password")],
        )
        .expect("connect")
}

fn key(connection: &Value, id: &str) -> Vec<Value> {
    vec![
        connection.clone(),
        json!("travel"),
        json!("_default"),
        json!("_default"),
        json!(id),
    ]
}

#[test]
fn documents_round_trip_through_host_values() {
    let cluster = LoopbackCluster::new().with_bucket("travel");
    let mut runtime = runtime(&cluster, "");
    let connection = connect(&mut runtime, "Administrator");
    runtime
        .call("openBucket", &[connection.clone(), json!("travel")])
        .unwrap();

    let mut upsert = key(&connection, "airline_10");
    upsert.push(json!({ "name": "40-Mile Air" }));
    let stored = runtime.call("documentUpsert", &upsert).unwrap();

    let fetched = runtime.call("documentGet", &key(&connection, "airline_10")).unwrap();
    assert_eq!(fetched["cas"], stored["cas"]);
    let body: Value = serde_json::from_str(fetched["value"].as_str().unwrap()).unwrap();
    assert_eq!(body["name"], "40-Mile Air");

    let mut remove = key(&connection, "airline_10");
    remove.push(json!({ "cas": 987_654_321u64 }));
    let err = runtime.call("documentRemove", &remove).unwrap_err();
    assert_eq!(err.kind, ExceptionKind::CasMismatch);
}

#[test]
fn missing_document_raises_typed_exception() {
    let cluster = LoopbackCluster::new().with_bucket("travel");
    let mut runtime = runtime(&cluster, "");
    let connection = connect(&mut runtime, "Administrator");
    runtime
        .call("openBucket", &[connection.clone(), json!("travel")])
        .unwrap();

    let err = runtime
        .call("documentGet", &key(&connection, "airline_404"))
        .unwrap_err();
    assert_eq!(err.kind, ExceptionKind::DocumentNotFound);
    assert_eq!(err.class_name(), "DocumentNotFoundException");
    assert_eq!(err.context["type"], "key_value");
    assert_eq!(err.context["id"], "airline_404");
    assert_eq!(err.context["bucketName"], "travel");
}

#[test]
fn malformed_options_are_rejected_before_dispatch() {
    let cluster = LoopbackCluster::new().with_bucket("travel");
    let mut runtime = runtime(&cluster, "");
    let connection = connect(&mut runtime, "Administrator");

    let mut get = key(&connection, "airline_10");
    get.push(json!({ "timeout": "soon" }));
    let err = runtime.call("documentGet", &get).unwrap_err();
    assert_eq!(err.kind, ExceptionKind::InvalidArgument);
    assert!(err.message.contains("expected integer for timeout"));

    let mut upsert = key(&connection, "airline_10");
    upsert.push(json!("{}"));
    upsert.push(json!({ "durabilityLevel": "quorum" }));
    let err = runtime.call("documentUpsert", &upsert).unwrap_err();
    assert!(err.message.contains("unknown durability level: quorum"));

    let err = runtime
        .call("ping", &[connection.clone(), json!({ "serviceTypes": ["telepathy"] })])
        .unwrap_err();
    assert!(err.message.contains("unknown service type: telepathy"));

    let err = runtime.call("documentGet", &[json!(999)]).unwrap_err();
    assert_eq!(err.kind, ExceptionKind::InvalidArgument);

    let err = runtime.call("teleport", &[]).unwrap_err();
    assert_eq!(err.kind, ExceptionKind::UnsupportedOperation);
}

#[test]
fn query_failure_carries_first_error() {
    let cluster = LoopbackCluster::new().with_bucket("travel");
    cluster.on_query(|request| {
        Ok(QueryResult {
            rows: vec![json!({ "statement": request.statement.clone() })],
            ..Default::default()
        })
    });
    let mut runtime = runtime(&cluster, "");
    let connection = connect(&mut runtime, "Administrator");

    let result = runtime
        .call(
            "query",
            &[
                connection.clone(),
                json!("SELECT $1"),
                json!({ "positionalParameters": [1], "readonly": true }),
            ],
        )
        .unwrap();
    assert_eq!(result["rows"][0]["statement"], "SELECT $1");

    cluster.fail_next(
        ServiceType::Query,
        ServiceFailure::new(QueryErrc::PlanningFailure).with_first_error(4000, "no index"),
    );
    let err = runtime
        .call("query", &[connection, json!("SELECT * FROM travel")])
        .unwrap_err();
    assert_eq!(err.kind, ExceptionKind::PlanningFailure);
    assert_eq!(err.context["type"], "query");
    assert_eq!(err.context["firstErrorCode"], 4000);
    assert!(err.message.contains("serverError=4000"));
}

#[test]
fn management_calls_map_host_objects() {
    let cluster = LoopbackCluster::new().with_bucket("travel");
    let mut runtime = runtime(&cluster, "");
    let connection = connect(&mut runtime, "Administrator");

    runtime
        .call(
            "bucketCreate",
            &[connection.clone(), json!({ "name": "beer", "ramQuotaMB": 256 })],
        )
        .unwrap();
    let buckets = runtime.call("bucketGetAll", &[connection.clone()]).unwrap();
    let names: Vec<_> = buckets
        .as_array()
        .unwrap()
        .iter()
        .map(|bucket| bucket["name"].as_str().unwrap().to_string())
        .collect();
    assert!(names.contains(&"beer".to_string()));

    runtime
        .call(
            "userUpsert",
            &[
                connection.clone(),
                json!({
                    "username": "reader",
                    "password": "secret",
                    "roles": [{ "name": "data_reader", "bucket": "travel" }],
                }),
            ],
        )
        .unwrap();
    let users = runtime.call("userGetAll", &[connection.clone()]).unwrap();
    assert_eq!(users[0]["username"], "reader");
    assert!(users[0].get("password").is_none());

    let err = runtime
        .call(
            "userUpsert",
            &[connection, json!({ "username": "nobody", "roles": [{ "bucket": "x" }] })],
        )
        .unwrap_err();
    assert!(err.message.contains("missing argument name"));
}

#[test]
fn transactions_through_handles() {
    let cluster = LoopbackCluster::new().with_bucket("travel");
    let mut runtime = runtime(&cluster, "");
    let connection = connect(&mut runtime, "Administrator");
    runtime
        .call("openBucket", &[connection.clone(), json!("travel")])
        .unwrap();

    let transactions = runtime
        .call(
            "transactionsNew",
            &[connection.clone(), json!({ "durabilityLevel": "none" })],
        )
        .unwrap();
    let attempt = runtime
        .call("transactionBegin", &[transactions.clone()])
        .unwrap();

    let mut insert = key(&attempt, "booking_1");
    insert.push(json!({ "seat": "12A" }));
    let document = runtime.call("transactionInsert", &insert).unwrap();
    assert_eq!(document["id"]["key"], "booking_1");

    let replaced = runtime
        .call(
            "transactionReplace",
            &[attempt.clone(), document, json!({ "seat": "14C" })],
        )
        .unwrap();
    assert_eq!(replaced["id"]["key"], "booking_1");

    let result = runtime.call("transactionCommit", &[attempt.clone()]).unwrap();
    assert_eq!(result["unstaging_complete"], true);

    let stored = runtime
        .call("documentGet", &key(&connection, "booking_1"))
        .unwrap();
    assert!(stored["value"].as_str().unwrap().contains("14C"));

    // A committed attempt is finished.
    let err = runtime.call("transactionRollback", &[attempt]).unwrap_err();
    assert!(err.kind.is_a(ExceptionKind::Transaction));

    // Handles are typed.
    let err = runtime
        .call("transactionCommit", &[transactions])
        .unwrap_err();
    assert_eq!(err.kind, ExceptionKind::InvalidArgument);
}

#[test]
fn persistent_connections_survive_requests() {
    let cluster = LoopbackCluster::new();
    let mut runtime = runtime(&cluster, "csm.persistent_timeout = 60\n");

    connect(&mut runtime, "Administrator");
    let report = runtime.end_request();
    assert!(report.evicted.is_empty());

    connect(&mut runtime, "Administrator");
    assert_eq!(cluster.cores().len(), 1);
    assert_eq!(runtime.service().cache().live_connections(), 1);

    let metrics = runtime.call("metrics", &[]).unwrap();
    assert_eq!(metrics["inflight"], 0);
}

#[test]
fn strict_admission_rejects_beyond_the_limit() {
    let cluster = LoopbackCluster::new();
    let mut runtime = runtime(
        &cluster,
        "csm.max_persistent = 1\ncsm.admission = strict\n",
    );
    connect(&mut runtime, "Administrator");

    let err = runtime
        .call(
            "connect",
            &[json!("couchbase://127.0.0.1"), json!("other"), json!("password")],
        )
        .unwrap_err();
    assert_eq!(err.kind, ExceptionKind::QuotaLimited);
    assert!(err
        .message
        .contains("persistent connection limit reached (max_connections=1)"));
}

#[test]
fn fork_hooks_restart_connections() {
    let cluster = LoopbackCluster::new();
    let mut runtime = runtime(&cluster, "csm.persistent_timeout = 60\n");
    let connection = connect(&mut runtime, "Administrator");

    let prepared = runtime.fork("prepare").unwrap();
    assert_eq!(prepared.visits.len(), 1);
    let resumed = runtime.fork("child").unwrap();
    assert!(resumed.failures.is_empty());

    runtime.call("ping", &[connection.clone()]).unwrap();
    assert!(runtime.call("release", &[connection.clone()]).unwrap().as_bool().unwrap());
    assert!(!runtime.call("release", &[connection]).unwrap().as_bool().unwrap());
}

#[test]
fn zero_persistent_limit_is_accepted() {
    let cluster = LoopbackCluster::new();
    let mut soft = runtime(&cluster, "csm.max_persistent = 0\n");
    assert_eq!(soft.settings().max_persistent, Some(0));
    connect(&mut soft, "Administrator");
    soft.end_request();

    let mut strict = runtime(&cluster, "csm.max_persistent = 0\ncsm.admission = strict\n");
    let err = strict
        .call(
            "connect",
            &[json!("couchbase://127.0.0.1"), json!("Administrator"), json!("password")],
        )
        .unwrap_err();
    assert_eq!(err.kind, ExceptionKind::QuotaLimited);
}
