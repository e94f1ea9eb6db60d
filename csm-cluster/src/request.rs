//! # Requests and Responses
//!
//! Purpose: Value types exchanged with the cluster core. Every request is
//! executed through `ClusterCore::execute` and answered with exactly one
//! `Outcome<Response>`.
//!
//! ## Notes
//! - Timeouts are optional per request; the core applies its own defaults
//!   from `Timeouts` when a request does not carry one.
//! - Result types derive `Serialize` so the host surface can hand them over
//!   as host-native structures without a second copy of the field list.

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use csm_common::{DocumentId, DurabilityLevel, ServiceFailure};

/// What every asynchronous request resolves with.
pub type Outcome<T> = Result<T, ServiceFailure>;

/// Login for a cluster connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Default timeouts applied by the core per service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    pub key_value: Duration,
    pub query: Duration,
    pub analytics: Duration,
    pub search: Duration,
    pub view: Duration,
    pub management: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            connect: Duration::from_secs(10),
            key_value: Duration::from_millis(2_500),
            query: Duration::from_secs(75),
            analytics: Duration::from_secs(75),
            search: Duration::from_secs(75),
            view: Duration::from_secs(75),
            management: Duration::from_secs(75),
        }
    }
}

/// Where and as whom to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionTarget {
    pub connection_string: String,
    pub credentials: Credentials,
    pub timeouts: Timeouts,
}

impl ConnectionTarget {
    pub fn new(connection_string: impl Into<String>, credentials: Credentials) -> Self {
        ConnectionTarget {
            connection_string: connection_string.into(),
            credentials,
            timeouts: Timeouts::default(),
        }
    }
}

/// Cluster services a request can address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
    KeyValue,
    Query,
    Analytics,
    Search,
    View,
    Management,
}

impl ServiceType {
    pub const ALL: [ServiceType; 6] = [
        ServiceType::KeyValue,
        ServiceType::Query,
        ServiceType::Analytics,
        ServiceType::Search,
        ServiceType::View,
        ServiceType::Management,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            ServiceType::KeyValue => "kv",
            ServiceType::Query => "query",
            ServiceType::Analytics => "analytics",
            ServiceType::Search => "search",
            ServiceType::View => "views",
            ServiceType::Management => "mgmt",
        }
    }

    /// Parses the host spelling (`kv`, `query`, ...).
    pub fn parse(value: &str) -> Option<Self> {
        ServiceType::ALL.into_iter().find(|s| s.as_str() == value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationKind {
    Upsert,
    Insert,
    Replace,
}

impl MutationKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            MutationKind::Upsert => "upsert",
            MutationKind::Insert => "insert",
            MutationKind::Replace => "replace",
        }
    }
}

/// Options shared by document mutations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MutationOptions {
    pub timeout: Option<Duration>,
    pub durability: DurabilityLevel,
    pub expiry: Option<Duration>,
    pub cas: Option<u64>,
    pub flags: u32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryRequest {
    pub statement: String,
    pub positional_parameters: Vec<Value>,
    pub named_parameters: Map<String, Value>,
    pub read_only: bool,
    pub client_context_id: Option<String>,
    /// `bucket.scope` the statement is scoped to, if any.
    pub query_context: Option<String>,
    pub timeout: Option<Duration>,
}

impl QueryRequest {
    pub fn new(statement: impl Into<String>) -> Self {
        QueryRequest {
            statement: statement.into(),
            ..QueryRequest::default()
        }
    }

    /// Encoded parameters for diagnostics, `None` when there are none.
    pub fn encoded_parameters(&self) -> Option<String> {
        encode_parameters(&self.positional_parameters, &self.named_parameters)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnalyticsRequest {
    pub statement: String,
    pub positional_parameters: Vec<Value>,
    pub named_parameters: Map<String, Value>,
    pub priority: bool,
    pub client_context_id: Option<String>,
    pub timeout: Option<Duration>,
}

impl AnalyticsRequest {
    pub fn new(statement: impl Into<String>) -> Self {
        AnalyticsRequest {
            statement: statement.into(),
            ..AnalyticsRequest::default()
        }
    }

    pub fn encoded_parameters(&self) -> Option<String> {
        encode_parameters(&self.positional_parameters, &self.named_parameters)
    }
}

fn encode_parameters(positional: &[Value], named: &Map<String, Value>) -> Option<String> {
    if positional.is_empty() && named.is_empty() {
        return None;
    }
    let mut encoded = Map::new();
    if !positional.is_empty() {
        encoded.insert("args".into(), Value::Array(positional.to_vec()));
    }
    for (name, value) in named {
        encoded.insert(format!("${}", name), value.clone());
    }
    Some(Value::Object(encoded).to_string())
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchRequest {
    pub index_name: String,
    pub query: Value,
    pub limit: Option<u32>,
    pub skip: Option<u32>,
    pub client_context_id: Option<String>,
    pub timeout: Option<Duration>,
}

impl SearchRequest {
    pub fn encoded_parameters(&self) -> Option<String> {
        if self.limit.is_none() && self.skip.is_none() {
            return None;
        }
        let mut encoded = Map::new();
        if let Some(limit) = self.limit {
            encoded.insert("size".into(), Value::from(limit));
        }
        if let Some(skip) = self.skip {
            encoded.insert("from".into(), Value::from(skip));
        }
        Some(Value::Object(encoded).to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewRequest {
    pub bucket: String,
    pub design_document: String,
    pub view: String,
    pub query_string: Vec<String>,
    pub client_context_id: Option<String>,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PingRequest {
    /// Services to ping; empty pings every service.
    pub services: Vec<ServiceType>,
    pub report_id: Option<String>,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketSettings {
    pub name: String,
    pub ram_quota_mb: u64,
    pub num_replicas: u32,
    pub flush_enabled: bool,
    /// Maximum document expiry in seconds, zero for none.
    pub max_expiry: u64,
}

impl BucketSettings {
    pub fn new(name: impl Into<String>) -> Self {
        BucketSettings {
            name: name.into(),
            ram_quota_mb: 100,
            num_replicas: 1,
            flush_enabled: false,
            max_expiry: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSpec {
    pub name: String,
    pub scope_name: String,
    pub max_expiry: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeSpec {
    pub name: String,
    pub collections: Vec<CollectionSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSettings {
    pub username: String,
    pub display_name: String,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub groups: Vec<String>,
    pub roles: Vec<Role>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSettings {
    pub name: String,
    pub description: String,
    pub roles: Vec<Role>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryIndex {
    pub bucket: String,
    pub name: String,
    pub fields: Vec<String>,
    pub is_primary: bool,
    pub state: String,
}

/// Management (REST) requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagementRequest {
    BucketCreate(BucketSettings),
    BucketDrop { name: String },
    BucketFlush { name: String },
    BucketGetAll,
    ScopeCreate { bucket: String, scope: String },
    ScopeDrop { bucket: String, scope: String },
    ScopeGetAll { bucket: String },
    CollectionCreate { bucket: String, scope: String, collection: String, max_expiry: u64 },
    CollectionDrop { bucket: String, scope: String, collection: String },
    UserUpsert(UserSettings),
    UserDrop { username: String },
    UserGetAll,
    GroupUpsert(GroupSettings),
    GroupDrop { name: String },
    GroupGetAll,
    RoleGetAll,
    QueryIndexCreate {
        bucket: String,
        name: String,
        fields: Vec<String>,
        primary: bool,
        ignore_if_exists: bool,
    },
    QueryIndexDrop {
        bucket: String,
        name: String,
        primary: bool,
        ignore_if_not_exists: bool,
    },
    QueryIndexGetAll { bucket: String },
}

impl ManagementRequest {
    /// Operation name used in error messages.
    pub fn operation(&self) -> &'static str {
        match self {
            ManagementRequest::BucketCreate(_) => "create bucket",
            ManagementRequest::BucketDrop { .. } => "drop bucket",
            ManagementRequest::BucketFlush { .. } => "flush bucket",
            ManagementRequest::BucketGetAll => "get all buckets",
            ManagementRequest::ScopeCreate { .. } => "create scope",
            ManagementRequest::ScopeDrop { .. } => "drop scope",
            ManagementRequest::ScopeGetAll { .. } => "get all scopes",
            ManagementRequest::CollectionCreate { .. } => "create collection",
            ManagementRequest::CollectionDrop { .. } => "drop collection",
            ManagementRequest::UserUpsert(_) => "upsert user",
            ManagementRequest::UserDrop { .. } => "drop user",
            ManagementRequest::UserGetAll => "get all users",
            ManagementRequest::GroupUpsert(_) => "upsert group",
            ManagementRequest::GroupDrop { .. } => "drop group",
            ManagementRequest::GroupGetAll => "get all groups",
            ManagementRequest::RoleGetAll => "get all roles",
            ManagementRequest::QueryIndexCreate { .. } => "create query index",
            ManagementRequest::QueryIndexDrop { .. } => "drop query index",
            ManagementRequest::QueryIndexGetAll { .. } => "get all query indexes",
        }
    }

    /// True for the read-only `get all` requests.
    pub fn is_listing(&self) -> bool {
        matches!(
            self,
            ManagementRequest::BucketGetAll
                | ManagementRequest::ScopeGetAll { .. }
                | ManagementRequest::UserGetAll
                | ManagementRequest::GroupGetAll
                | ManagementRequest::RoleGetAll
                | ManagementRequest::QueryIndexGetAll { .. }
        )
    }

    /// Name of the entity the request acts on, empty for listings.
    pub fn subject(&self) -> String {
        match self {
            ManagementRequest::BucketCreate(settings) => settings.name.clone(),
            ManagementRequest::BucketDrop { name } | ManagementRequest::BucketFlush { name } => {
                name.clone()
            }
            ManagementRequest::ScopeCreate { bucket, scope }
            | ManagementRequest::ScopeDrop { bucket, scope } => format!("{}.{}", bucket, scope),
            ManagementRequest::ScopeGetAll { bucket }
            | ManagementRequest::QueryIndexGetAll { bucket } => bucket.clone(),
            ManagementRequest::CollectionCreate {
                bucket,
                scope,
                collection,
                ..
            }
            | ManagementRequest::CollectionDrop {
                bucket,
                scope,
                collection,
            } => format!("{}.{}.{}", bucket, scope, collection),
            ManagementRequest::UserUpsert(user) => user.username.clone(),
            ManagementRequest::UserDrop { username } => username.clone(),
            ManagementRequest::GroupUpsert(group) => group.name.clone(),
            ManagementRequest::GroupDrop { name } => name.clone(),
            ManagementRequest::QueryIndexCreate { bucket, name, .. }
            | ManagementRequest::QueryIndexDrop { bucket, name, .. } => {
                format!("{}.{}", bucket, name)
            }
            ManagementRequest::BucketGetAll
            | ManagementRequest::UserGetAll
            | ManagementRequest::GroupGetAll
            | ManagementRequest::RoleGetAll => String::new(),
        }
    }
}

/// Everything the core can execute.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    OpenBucket { bucket: String },
    CloseBucket { bucket: String },
    Get { id: DocumentId, timeout: Option<Duration> },
    Mutate { kind: MutationKind, id: DocumentId, value: Bytes, options: MutationOptions },
    Remove { id: DocumentId, options: MutationOptions },
    Query(QueryRequest),
    Analytics(AnalyticsRequest),
    Search(SearchRequest),
    View(ViewRequest),
    Ping(PingRequest),
    Diagnostics { report_id: Option<String> },
    Management(ManagementRequest),
}

impl Request {
    pub fn service(&self) -> ServiceType {
        match self {
            Request::OpenBucket { .. }
            | Request::CloseBucket { .. }
            | Request::Get { .. }
            | Request::Mutate { .. }
            | Request::Remove { .. }
            | Request::Ping(_)
            | Request::Diagnostics { .. } => ServiceType::KeyValue,
            Request::Query(_) => ServiceType::Query,
            Request::Analytics(_) => ServiceType::Analytics,
            Request::Search(_) => ServiceType::Search,
            Request::View(_) => ServiceType::View,
            Request::Management(ManagementRequest::QueryIndexCreate { .. })
            | Request::Management(ManagementRequest::QueryIndexDrop { .. })
            | Request::Management(ManagementRequest::QueryIndexGetAll { .. }) => {
                ServiceType::Query
            }
            Request::Management(_) => ServiceType::Management,
        }
    }

    /// Per-request timeout, if the caller set one.
    pub fn timeout(&self) -> Option<Duration> {
        match self {
            Request::Get { timeout, .. } => *timeout,
            Request::Mutate { options, .. } | Request::Remove { options, .. } => options.timeout,
            Request::Query(req) => req.timeout,
            Request::Analytics(req) => req.timeout,
            Request::Search(req) => req.timeout,
            Request::View(req) => req.timeout,
            Request::Ping(req) => req.timeout,
            _ => None,
        }
    }

    /// True when a timeout may leave the server-side state unknown.
    pub fn is_mutation(&self) -> bool {
        match self {
            Request::Mutate { .. } | Request::Remove { .. } => true,
            Request::Management(request) => !request.is_listing(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GetResult {
    #[serde(serialize_with = "serialize_bytes")]
    pub value: Bytes,
    pub cas: u64,
    pub flags: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MutationToken {
    pub bucket: String,
    pub partition_id: u16,
    pub partition_uuid: u64,
    pub sequence_number: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MutationResult {
    pub cas: u64,
    pub token: Option<MutationToken>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryMeta {
    pub request_id: String,
    pub client_context_id: String,
    pub status: String,
    pub result_count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryResult {
    pub rows: Vec<Value>,
    pub meta: QueryMeta,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub index: String,
    pub id: String,
    pub score: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SearchResult {
    pub hits: Vec<SearchHit>,
    pub total_hits: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ViewRow {
    pub id: Option<String>,
    pub key: Value,
    pub value: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ViewResult {
    pub total_rows: u64,
    pub rows: Vec<ViewRow>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointReport {
    pub remote: String,
    pub local: String,
    pub state: String,
    /// Round-trip latency in microseconds (ping only).
    pub latency_us: Option<u64>,
    pub namespace: Option<String>,
}

/// Result of a ping or diagnostics request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceReport {
    pub id: String,
    pub version: u32,
    pub sdk: String,
    pub services: BTreeMap<ServiceType, Vec<EndpointReport>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ManagementResponse {
    Done,
    Buckets(Vec<BucketSettings>),
    Scopes(Vec<ScopeSpec>),
    Users(Vec<UserSettings>),
    Groups(Vec<GroupSettings>),
    Roles(Vec<Role>),
    QueryIndexes(Vec<QueryIndex>),
}

/// Successful answer to a `Request`.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Empty,
    Get(GetResult),
    Mutation(MutationResult),
    Query(QueryResult),
    Analytics(QueryResult),
    Search(SearchResult),
    View(ViewResult),
    Ping(ServiceReport),
    Diagnostics(ServiceReport),
    Management(ManagementResponse),
}

fn serialize_bytes<S>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&String::from_utf8_lossy(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameters_are_encoded_only_when_present() {
        let mut request = QueryRequest::new("SELECT 1");
        assert_eq!(request.encoded_parameters(), None);

        request.positional_parameters.push(Value::from(10));
        request.named_parameters.insert("city".into(), Value::from("Paris"));
        let encoded = request.encoded_parameters().unwrap();
        let parsed: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(parsed["args"], serde_json::json!([10]));
        assert_eq!(parsed["$city"], "Paris");
    }

    #[test]
    fn service_types_parse_host_spelling() {
        assert_eq!(ServiceType::parse("kv"), Some(ServiceType::KeyValue));
        assert_eq!(ServiceType::parse("views"), Some(ServiceType::View));
        assert_eq!(ServiceType::parse("eventing"), None);
    }

    #[test]
    fn index_management_goes_to_query_service() {
        let request = Request::Management(ManagementRequest::QueryIndexGetAll {
            bucket: "travel".into(),
        });
        assert_eq!(request.service(), ServiceType::Query);
        assert!(!request.is_mutation());
    }
}
