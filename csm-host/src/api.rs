//! # Host API
//!
//! Purpose: Map host function calls onto session operations.
//!
//! ## Design Principles
//! 1. **One Handler per Function**: `dispatch` only routes; every handler
//!    validates its own arguments and builds one request.
//! 2. **Host-Native Results**: Results are JSON values, documents travel as
//!    strings, handles as integers.
//! 3. **Positional Layout**: Resource handle first, required arguments next,
//!    the option bag last.

use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use csm_cluster::{
    AnalyticsRequest, BucketSettings, ConnectionTarget, Credentials, GroupSettings,
    MutationOptions, PingRequest, QueryRequest, Role, SearchRequest, ServiceType,
    TransactionDocument, TransactionOptions, TransactionsConfig, UserSettings, ViewRequest,
};
use csm_common::{CommonErrc, CoreErrorInfo, CoreResult, DocumentId};
use csm_session::{ConnectionLease, TransactionAttempt};

use crate::options::{Args, OptionBag, OptionError};
use crate::runtime::{Handle, HostRuntime, Resource};

/// Routes a host function call to its handler.
pub fn dispatch(runtime: &mut HostRuntime, function: &str, args: &[Value]) -> CoreResult<Value> {
    let args = Args::new(args);
    match function {
        "connect" => handle_connect(runtime, args),
        "release" => handle_release(runtime, args),
        "metrics" => to_value(&runtime.service().metrics()),

        "openBucket" => handle_open_bucket(runtime, args),
        "closeBucket" => handle_close_bucket(runtime, args),
        "documentGet" => handle_document_get(runtime, args),
        "documentUpsert" | "documentInsert" | "documentReplace" => {
            handle_document_mutation(runtime, function, args)
        }
        "documentRemove" => handle_document_remove(runtime, args),

        "query" => handle_query(runtime, args),
        "analyticsQuery" => handle_analytics_query(runtime, args),
        "searchQuery" => handle_search_query(runtime, args),
        "viewQuery" => handle_view_query(runtime, args),
        "ping" => handle_ping(runtime, args),
        "diagnostics" => handle_diagnostics(runtime, args),

        "bucketCreate" => handle_bucket_create(runtime, args),
        "bucketDrop" => connection(runtime, args)?
            .drop_bucket(args.string(1, "name")?)
            .map(unit),
        "bucketFlush" => connection(runtime, args)?
            .flush_bucket(args.string(1, "name")?)
            .map(unit),
        "bucketGetAll" => to_value(&connection(runtime, args)?.get_all_buckets()?),
        "scopeCreate" => connection(runtime, args)?
            .create_scope(args.string(1, "bucket")?, args.string(2, "scope")?)
            .map(unit),
        "scopeDrop" => connection(runtime, args)?
            .drop_scope(args.string(1, "bucket")?, args.string(2, "scope")?)
            .map(unit),
        "scopeGetAll" => {
            to_value(&connection(runtime, args)?.get_all_scopes(args.string(1, "bucket")?)?)
        }
        "collectionCreate" => handle_collection_create(runtime, args),
        "collectionDrop" => connection(runtime, args)?
            .drop_collection(
                args.string(1, "bucket")?,
                args.string(2, "scope")?,
                args.string(3, "collection")?,
            )
            .map(unit),
        "userUpsert" => handle_user_upsert(runtime, args),
        "userDrop" => connection(runtime, args)?
            .drop_user(args.string(1, "username")?)
            .map(unit),
        "userGetAll" => to_value(&connection(runtime, args)?.get_all_users()?),
        "groupUpsert" => handle_group_upsert(runtime, args),
        "groupDrop" => connection(runtime, args)?
            .drop_group(args.string(1, "name")?)
            .map(unit),
        "groupGetAll" => to_value(&connection(runtime, args)?.get_all_groups()?),
        "roleGetAll" => to_value(&connection(runtime, args)?.get_all_roles()?),
        "queryIndexCreate" => handle_query_index_create(runtime, args),
        "queryIndexCreatePrimary" => handle_query_index_create_primary(runtime, args),
        "queryIndexDrop" => handle_query_index_drop(runtime, args),
        "queryIndexGetAll" => to_value(
            &connection(runtime, args)?.get_all_query_indexes(args.string(1, "bucket")?)?,
        ),

        "transactionsNew" => handle_transactions_new(runtime, args),
        "transactionBegin" => handle_transaction_begin(runtime, args),
        "transactionGet" => handle_transaction_get(runtime, args),
        "transactionInsert" => handle_transaction_insert(runtime, args),
        "transactionReplace" => handle_transaction_replace(runtime, args),
        "transactionRemove" => handle_transaction_remove(runtime, args),
        "transactionQuery" => handle_transaction_query(runtime, args),
        "transactionCommit" => to_value(&attempt(runtime, args)?.commit()?),
        "transactionRollback" => attempt(runtime, args)?.rollback().map(unit),

        other => Err(CoreErrorInfo::new(
            CommonErrc::UnsupportedOperation,
            format!("unknown function: {}", other),
        )),
    }
}

fn handle_connect(runtime: &mut HostRuntime, args: Args<'_>) -> CoreResult<Value> {
    let credentials = Credentials {
        username: args.string(1, "username")?.to_string(),
        password: args.string(2, "password")?.to_string(),
    };
    let mut target = ConnectionTarget::new(args.string(0, "connectionString")?, credentials);
    let options = args.options(3)?;
    let timeouts = &mut target.timeouts;
    for (name, slot) in [
        ("connectTimeout", &mut timeouts.connect),
        ("keyValueTimeout", &mut timeouts.key_value),
        ("queryTimeout", &mut timeouts.query),
        ("analyticsTimeout", &mut timeouts.analytics),
        ("searchTimeout", &mut timeouts.search),
        ("viewTimeout", &mut timeouts.view),
        ("managementTimeout", &mut timeouts.management),
    ] {
        if let Some(timeout) = options.duration(name)? {
            *slot = timeout;
        }
    }

    let lease = runtime.service_mut().connect(&target)?;
    debug!(
        fingerprint = %lease.fingerprint(),
        cache_hit = lease.is_cache_hit(),
        "connected"
    );
    let handle = runtime.resources_mut().insert(Resource::Connection(lease));
    Ok(Value::from(handle))
}

fn handle_release(runtime: &mut HostRuntime, args: Args<'_>) -> CoreResult<Value> {
    let handle = args.integer(0, "handle")?;
    Ok(Value::Bool(runtime.release(handle)))
}

fn handle_open_bucket(runtime: &mut HostRuntime, args: Args<'_>) -> CoreResult<Value> {
    let lease = connection(runtime, args)?;
    lease.open_bucket(args.string(1, "bucket")?).map(unit)
}

fn handle_close_bucket(runtime: &mut HostRuntime, args: Args<'_>) -> CoreResult<Value> {
    let lease = connection(runtime, args)?;
    lease.close_bucket(args.string(1, "bucket")?).map(unit)
}

fn handle_document_get(runtime: &mut HostRuntime, args: Args<'_>) -> CoreResult<Value> {
    let id = args.document_id(1)?;
    let options = args.options(5)?;
    let timeout = options.duration("timeout")?;
    to_value(&connection(runtime, args)?.get(&id, timeout)?)
}

fn handle_document_mutation(
    runtime: &mut HostRuntime,
    function: &str,
    args: Args<'_>,
) -> CoreResult<Value> {
    let id = args.document_id(1)?;
    let value = document_value(args.value(5, "value")?);
    let options = mutation_options(&args.options(6)?)?;
    let lease = connection(runtime, args)?;
    let result = match function {
        "documentInsert" => lease.insert(&id, value, options)?,
        "documentReplace" => lease.replace(&id, value, options)?,
        _ => lease.upsert(&id, value, options)?,
    };
    to_value(&result)
}

fn handle_document_remove(runtime: &mut HostRuntime, args: Args<'_>) -> CoreResult<Value> {
    let id = args.document_id(1)?;
    let options = mutation_options(&args.options(5)?)?;
    to_value(&connection(runtime, args)?.remove(&id, options)?)
}

fn handle_query(runtime: &mut HostRuntime, args: Args<'_>) -> CoreResult<Value> {
    let request = query_request(args.string(1, "statement")?, &args.options(2)?)?;
    to_value(&connection(runtime, args)?.query(request)?)
}

fn handle_analytics_query(runtime: &mut HostRuntime, args: Args<'_>) -> CoreResult<Value> {
    let options = args.options(2)?;
    let request = AnalyticsRequest {
        positional_parameters: options.array("positionalParameters")?,
        named_parameters: options.object("namedParameters")?,
        priority: options.boolean("priority")?.unwrap_or(false),
        client_context_id: options.string("clientContextId")?,
        timeout: options.duration("timeout")?,
        ..AnalyticsRequest::new(args.string(1, "statement")?)
    };
    to_value(&connection(runtime, args)?.analytics(request)?)
}

fn handle_search_query(runtime: &mut HostRuntime, args: Args<'_>) -> CoreResult<Value> {
    let options = args.options(3)?;
    let request = SearchRequest {
        index_name: args.string(1, "indexName")?.to_string(),
        query: args.value(2, "query")?.clone(),
        limit: options.integer("limit")?.map(saturating_u32),
        skip: options.integer("skip")?.map(saturating_u32),
        client_context_id: options.string("clientContextId")?,
        timeout: options.duration("timeout")?,
    };
    to_value(&connection(runtime, args)?.search(request)?)
}

fn handle_view_query(runtime: &mut HostRuntime, args: Args<'_>) -> CoreResult<Value> {
    let options = args.options(4)?;
    let request = ViewRequest {
        bucket: args.string(1, "bucket")?.to_string(),
        design_document: args.string(2, "designDocument")?.to_string(),
        view: args.string(3, "view")?.to_string(),
        query_string: options.strings("queryString")?,
        client_context_id: options.string("clientContextId")?,
        timeout: options.duration("timeout")?,
    };
    to_value(&connection(runtime, args)?.view(request)?)
}

fn handle_ping(runtime: &mut HostRuntime, args: Args<'_>) -> CoreResult<Value> {
    let options = args.options(1)?;
    let services = options
        .strings("serviceTypes")?
        .iter()
        .map(|name| {
            ServiceType::parse(name).ok_or_else(|| {
                CoreErrorInfo::invalid_argument(format!("unknown service type: {}", name))
            })
        })
        .collect::<CoreResult<Vec<_>>>()?;
    let request = PingRequest {
        services,
        report_id: options.string("reportId")?,
        timeout: options.duration("timeout")?,
    };
    to_value(&connection(runtime, args)?.ping(request)?)
}

fn handle_diagnostics(runtime: &mut HostRuntime, args: Args<'_>) -> CoreResult<Value> {
    let report_id = args.options(1)?.string("reportId")?;
    to_value(&connection(runtime, args)?.diagnostics(report_id)?)
}

fn handle_bucket_create(runtime: &mut HostRuntime, args: Args<'_>) -> CoreResult<Value> {
    let bag = OptionBag::new(Some(args.value(1, "settings")?))?;
    let defaults = BucketSettings::new(bag.required_string("name")?);
    let settings = BucketSettings {
        ram_quota_mb: bag.integer("ramQuotaMB")?.unwrap_or(defaults.ram_quota_mb),
        num_replicas: bag
            .integer("numReplicas")?
            .map(saturating_u32)
            .unwrap_or(defaults.num_replicas),
        flush_enabled: bag.boolean("flushEnabled")?.unwrap_or(defaults.flush_enabled),
        max_expiry: bag.integer("maxExpiry")?.unwrap_or(defaults.max_expiry),
        ..defaults
    };
    connection(runtime, args)?.create_bucket(settings).map(unit)
}

fn handle_collection_create(runtime: &mut HostRuntime, args: Args<'_>) -> CoreResult<Value> {
    let max_expiry = args.options(4)?.integer("maxExpiry")?.unwrap_or(0);
    connection(runtime, args)?
        .create_collection(
            args.string(1, "bucket")?,
            args.string(2, "scope")?,
            args.string(3, "collection")?,
            max_expiry,
        )
        .map(unit)
}

fn handle_user_upsert(runtime: &mut HostRuntime, args: Args<'_>) -> CoreResult<Value> {
    let bag = OptionBag::new(Some(args.value(1, "user")?))?;
    let user = UserSettings {
        username: bag.required_string("username")?,
        display_name: bag.string("displayName")?.unwrap_or_default(),
        password: bag.string("password")?,
        groups: bag.strings("groups")?,
        roles: roles(&bag)?,
    };
    connection(runtime, args)?.upsert_user(user).map(unit)
}

fn handle_group_upsert(runtime: &mut HostRuntime, args: Args<'_>) -> CoreResult<Value> {
    let bag = OptionBag::new(Some(args.value(1, "group")?))?;
    let group = GroupSettings {
        name: bag.required_string("name")?,
        description: bag.string("description")?.unwrap_or_default(),
        roles: roles(&bag)?,
    };
    connection(runtime, args)?.upsert_group(group).map(unit)
}

fn handle_query_index_create(runtime: &mut HostRuntime, args: Args<'_>) -> CoreResult<Value> {
    let fields = args.strings(3, "fields")?;
    let ignore = args.options(4)?.boolean("ignoreIfExists")?.unwrap_or(false);
    connection(runtime, args)?
        .create_query_index(args.string(1, "bucket")?, args.string(2, "indexName")?, fields, ignore)
        .map(unit)
}

fn handle_query_index_create_primary(
    runtime: &mut HostRuntime,
    args: Args<'_>,
) -> CoreResult<Value> {
    let ignore = args.options(2)?.boolean("ignoreIfExists")?.unwrap_or(false);
    connection(runtime, args)?
        .create_primary_query_index(args.string(1, "bucket")?, ignore)
        .map(unit)
}

fn handle_query_index_drop(runtime: &mut HostRuntime, args: Args<'_>) -> CoreResult<Value> {
    let ignore = args.options(3)?.boolean("ignoreIfNotExists")?.unwrap_or(false);
    connection(runtime, args)?
        .drop_query_index(args.string(1, "bucket")?, args.string(2, "indexName")?, ignore)
        .map(unit)
}

fn handle_transactions_new(runtime: &mut HostRuntime, args: Args<'_>) -> CoreResult<Value> {
    let options = args.options(1)?;
    let defaults = TransactionsConfig::default();
    let config = TransactionsConfig {
        durability: options
            .durability("durabilityLevel")?
            .unwrap_or(defaults.durability),
        timeout: options.duration("timeout")?.unwrap_or(defaults.timeout),
        cleanup_window: options
            .duration("cleanupWindow")?
            .unwrap_or(defaults.cleanup_window),
    };
    let lease = connection(runtime, args)?.clone();
    let session = runtime.service_mut().begin_transactions(lease, config)?;
    let handle = runtime
        .resources_mut()
        .insert(Resource::Transactions(session));
    Ok(Value::from(handle))
}

fn handle_transaction_begin(runtime: &mut HostRuntime, args: Args<'_>) -> CoreResult<Value> {
    let options = args.options(1)?;
    let options = TransactionOptions {
        durability: options.durability("durabilityLevel")?,
        timeout: options.duration("timeout")?,
    };
    let handle = args.integer(0, "transactions")?;
    let attempt = runtime.resources().transactions(handle)?.begin(options)?;
    let handle = runtime.resources_mut().insert(Resource::Attempt(attempt));
    Ok(Value::from(handle))
}

fn handle_transaction_get(runtime: &mut HostRuntime, args: Args<'_>) -> CoreResult<Value> {
    let id = args.document_id(1)?;
    to_value(&attempt(runtime, args)?.get(&id)?)
}

fn handle_transaction_insert(runtime: &mut HostRuntime, args: Args<'_>) -> CoreResult<Value> {
    let id = args.document_id(1)?;
    let value = document_value(args.value(5, "value")?);
    to_value(&attempt(runtime, args)?.insert(&id, value)?)
}

fn handle_transaction_replace(runtime: &mut HostRuntime, args: Args<'_>) -> CoreResult<Value> {
    let document = transaction_document(args.value(1, "document")?)?;
    let value = document_value(args.value(2, "value")?);
    to_value(&attempt(runtime, args)?.replace(&document, value)?)
}

fn handle_transaction_remove(runtime: &mut HostRuntime, args: Args<'_>) -> CoreResult<Value> {
    let document = transaction_document(args.value(1, "document")?)?;
    attempt(runtime, args)?.remove(&document).map(unit)
}

fn handle_transaction_query(runtime: &mut HostRuntime, args: Args<'_>) -> CoreResult<Value> {
    let request = query_request(args.string(1, "statement")?, &args.options(2)?)?;
    to_value(&attempt(runtime, args)?.query(request)?)
}

fn connection<'r>(
    runtime: &'r HostRuntime,
    args: Args<'_>,
) -> CoreResult<&'r ConnectionLease> {
    let handle: Handle = args.integer(0, "connection")?;
    runtime.resources().connection(handle)
}

fn attempt<'r>(
    runtime: &'r HostRuntime,
    args: Args<'_>,
) -> CoreResult<&'r TransactionAttempt> {
    let handle: Handle = args.integer(0, "attempt")?;
    runtime.resources().attempt(handle)
}

fn mutation_options(options: &OptionBag<'_>) -> CoreResult<MutationOptions> {
    Ok(MutationOptions {
        timeout: options.duration("timeout")?,
        durability: options.durability("durabilityLevel")?.unwrap_or_default(),
        expiry: options.integer("expiry")?.map(Duration::from_secs),
        cas: options.integer("cas")?,
        flags: options.integer("flags")?.map(saturating_u32).unwrap_or(0),
    })
}

fn query_request(statement: &str, options: &OptionBag<'_>) -> CoreResult<QueryRequest> {
    Ok(QueryRequest {
        positional_parameters: options.array("positionalParameters")?,
        named_parameters: options.object("namedParameters")?,
        read_only: options.boolean("readonly")?.unwrap_or(false),
        client_context_id: options.string("clientContextId")?,
        query_context: options.string("queryContext")?,
        timeout: options.duration("timeout")?,
        ..QueryRequest::new(statement)
    })
}

fn roles(bag: &OptionBag<'_>) -> CoreResult<Vec<Role>> {
    bag.array("roles")?
        .iter()
        .map(|item| -> CoreResult<Role> {
            let role = OptionBag::new(Some(item))?;
            Ok(Role {
                name: role.required_string("name")?,
                bucket: role.string("bucket")?,
            })
        })
        .collect()
}

/// Strings are stored verbatim, anything else is JSON-encoded.
fn document_value(value: &Value) -> Bytes {
    match value {
        Value::String(text) => Bytes::from(text.clone()),
        other => Bytes::from(other.to_string()),
    }
}

/// Rebuilds a document previously returned by a transaction step.
fn transaction_document(value: &Value) -> CoreResult<TransactionDocument> {
    let bag = OptionBag::new(Some(value))?;
    let id: DocumentId = value
        .get("id")
        .cloned()
        .and_then(|id| serde_json::from_value(id).ok())
        .ok_or_else(|| OptionError::WrongType {
            expected: "array",
            name: "document.id".to_string(),
        })?;
    Ok(TransactionDocument {
        id,
        content: Bytes::from(bag.string("content")?.unwrap_or_default()),
        cas: bag
            .integer("cas")?
            .ok_or_else(|| OptionError::Missing("document.cas".to_string()))?,
    })
}

fn saturating_u32(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

fn unit(_: ()) -> Value {
    Value::Null
}

#[track_caller]
fn to_value<T: Serialize>(value: &T) -> CoreResult<Value> {
    serde_json::to_value(value).map_err(|err| {
        CoreErrorInfo::new(
            CommonErrc::EncodingFailure,
            format!("unable to encode result: {}", err),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn transaction_document_round_trips_through_json() {
        let document = TransactionDocument {
            id: DocumentId::in_default_collection("travel", "t1"),
            content: Bytes::from_static(b"{\"n\":1}"),
            cas: 42,
        };
        let value = serde_json::to_value(&document).unwrap();
        assert_eq!(transaction_document(&value).unwrap(), document);
    }

    #[test]
    fn transaction_document_requires_an_id() {
        let err = transaction_document(&json!({ "content": "{}", "cas": 1 })).unwrap_err();
        assert_eq!(err.message, "expected array for document.id");
    }

    #[test]
    fn mutation_options_are_validated() {
        let value = json!({ "durabilityLevel": "majority", "expiry": 30, "cas": 7 });
        let options = mutation_options(&OptionBag::new(Some(&value)).unwrap()).unwrap();
        assert_eq!(options.expiry, Some(Duration::from_secs(30)));
        assert_eq!(options.cas, Some(7));

        let value = json!({ "timeout": -1 });
        let err = mutation_options(&OptionBag::new(Some(&value)).unwrap()).unwrap_err();
        assert_eq!(err.message, "expected integer for timeout");
    }
}
