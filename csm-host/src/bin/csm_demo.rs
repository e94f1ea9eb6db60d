//! # Session Manager Demo
//!
//! Purpose: Drive the host surface end to end against the in-process
//! loopback cluster, the way an embedding host would over two requests
//! and a fork.
//!
//! Usage: `csm-demo [max_persistent] [persistent_timeout_secs]`

use std::env;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};

use csm_cluster::{LoopbackCluster, QueryResult};
use csm_host::{logging, HostRuntime, HostSettings};

const DEFAULT_MAX_PERSISTENT: &str = "-1";
const DEFAULT_TIMEOUT_SECS: &str = "0";
const BUCKET: &str = "travel";

fn main() -> Result<()> {
    let mut args = env::args().skip(1);
    let max_persistent = args.next().unwrap_or_else(|| DEFAULT_MAX_PERSISTENT.into());
    let timeout = args.next().unwrap_or_else(|| DEFAULT_TIMEOUT_SECS.into());
    let settings = HostSettings::from_pairs([
        ("csm.max_persistent", max_persistent.as_str()),
        ("csm.persistent_timeout", timeout.as_str()),
        ("csm.log_level", "info"),
    ])
    .context("invalid settings")?;
    logging::init(&settings.log_level);

    let cluster = LoopbackCluster::new().with_bucket(BUCKET);
    cluster.on_query(|request| {
        Ok(QueryResult {
            rows: vec![json!({ "statement": request.statement.clone() })],
            ..Default::default()
        })
    });
    let mut runtime = HostRuntime::startup(settings, Arc::new(cluster.clone()))
        .context("module startup failed")?;

    for request in 1..=2 {
        println!("== request {}", request);
        run_request(&mut runtime)?;
        let report = runtime.end_request();
        println!(
            "end of request: evicted={} deferred={}",
            report.evicted.len(),
            report.deferred.len()
        );
    }

    let prepared = runtime.fork("prepare")?;
    let resumed = runtime.fork("child")?;
    println!(
        "fork: prepared {} resources, resumed {} ({} failures)",
        prepared.visits.len(),
        resumed.visits.len(),
        resumed.failures.len()
    );

    let metrics = runtime.call("metrics", &[])?;
    println!("metrics: {}", serde_json::to_string_pretty(&metrics)?);
    runtime.shutdown();
    Ok(())
}

fn run_request(runtime: &mut HostRuntime) -> Result<()> {
    let connection = runtime.call(
        "connect",
        &[json!("couchbase://127.0.0.1"), json!("Administrator"), json!("password")],
    )?;
    runtime.call("openBucket", &[connection.clone(), json!(BUCKET)])?;

    let id = [json!(BUCKET), json!("_default"), json!("_default")];
    let key = |name: &str| -> Vec<Value> {
        let mut args = vec![connection.clone()];
        args.extend(id.iter().cloned());
        args.push(json!(name));
        args
    };

    let mut upsert = key("airline_10");
    upsert.push(json!({ "name": "40-Mile Air", "country": "United States" }));
    let stored = runtime.call("documentUpsert", &upsert)?;
    println!("upsert cas={}", stored["cas"]);

    let fetched = runtime.call("documentGet", &key("airline_10"))?;
    println!("get value={}", fetched["value"]);

    match runtime.call("documentGet", &key("airline_404")) {
        Ok(_) => bail!("expected airline_404 to be missing"),
        Err(exception) => println!("{}: {}", exception.class_name(), exception.message),
    }

    let rows = runtime.call(
        "query",
        &[connection.clone(), json!("SELECT name FROM travel LIMIT 1")],
    )?;
    println!("query rows={}", rows["rows"]);

    let transactions = runtime.call("transactionsNew", &[connection.clone()])?;
    let attempt = runtime.call("transactionBegin", &[transactions])?;
    let mut insert = vec![attempt.clone()];
    insert.extend(key("booking").into_iter().skip(1));
    insert.push(json!({ "seat": "12A" }));
    if let Err(exception) = runtime.call("transactionInsert", &insert) {
        // The document survives from the first request.
        println!("{}: {}", exception.class_name(), exception.message);
        runtime.call("transactionRollback", &[attempt])?;
    } else {
        let result = runtime.call("transactionCommit", &[attempt])?;
        println!("transaction {} committed", result["transaction_id"]);
    }
    Ok(())
}
