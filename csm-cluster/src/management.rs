//! # Management Service
//!
//! Purpose: Cluster metadata (buckets, scopes, collections, RBAC users and
//! groups, query indexes) and the REST-style handlers the loopback core runs
//! for `ManagementRequest`s.
//!
//! ## Notes
//! - Every failure carries the HTTP exchange (method, path, status, body) the
//!   real management endpoint would have produced, so the session layer can
//!   build `http` error contexts from it.
//! - Dropping a bucket, scope or collection also drops its documents.

use std::collections::BTreeMap;

use csm_common::{
    CommonErrc, DocumentId, ErrorCode, HttpExchange, ManagementErrc, ServiceFailure,
};

use crate::request::{
    BucketSettings, CollectionSpec, GroupSettings, ManagementRequest, ManagementResponse,
    QueryIndex, Role, ScopeSpec, ServiceType, UserSettings,
};
use crate::store::DocumentStore;

/// Roles the loopback cluster knows; `bucket` roles accept `*` or a bucket name.
const KNOWN_ROLES: &[(&str, bool)] = &[
    ("admin", false),
    ("ro_admin", false),
    ("cluster_admin", false),
    ("security_admin", false),
    ("bucket_admin", true),
    ("bucket_full_access", true),
    ("data_reader", true),
    ("data_writer", true),
    ("query_select", true),
    ("query_insert", true),
    ("query_update", true),
    ("query_delete", true),
    ("query_manage_index", true),
];

const PRIMARY_INDEX_NAME: &str = "#primary";

#[derive(Debug, Clone)]
pub(crate) struct BucketMeta {
    pub(crate) settings: BucketSettings,
    pub(crate) uuid: u64,
    /// scope -> collection -> spec
    pub(crate) scopes: BTreeMap<String, BTreeMap<String, CollectionSpec>>,
}

impl BucketMeta {
    fn new(settings: BucketSettings, uuid: u64) -> Self {
        let mut collections = BTreeMap::new();
        collections.insert(
            DocumentId::DEFAULT_COLLECTION.to_string(),
            CollectionSpec {
                name: DocumentId::DEFAULT_COLLECTION.to_string(),
                scope_name: DocumentId::DEFAULT_SCOPE.to_string(),
                max_expiry: 0,
            },
        );
        let mut scopes = BTreeMap::new();
        scopes.insert(DocumentId::DEFAULT_SCOPE.to_string(), collections);
        BucketMeta {
            settings,
            uuid,
            scopes,
        }
    }

    pub(crate) fn collection(&self, scope: &str, collection: &str) -> Result<&CollectionSpec, ErrorCode> {
        let collections = self
            .scopes
            .get(scope)
            .ok_or(ErrorCode::Common(CommonErrc::ScopeNotFound))?;
        collections
            .get(collection)
            .ok_or(ErrorCode::Common(CommonErrc::CollectionNotFound))
    }
}

/// Everything the management service stores.
#[derive(Debug, Default)]
pub(crate) struct Metadata {
    pub(crate) buckets: BTreeMap<String, BucketMeta>,
    users: BTreeMap<String, UserSettings>,
    groups: BTreeMap<String, GroupSettings>,
    /// (bucket, index name) -> index
    indexes: BTreeMap<(String, String), QueryIndex>,
    next_uuid: u64,
}

impl Metadata {
    /// Adds a bucket with its default scope and collection, replacing any
    /// bucket of the same name.
    pub(crate) fn add_bucket(&mut self, settings: BucketSettings) {
        self.next_uuid += 1;
        let uuid = 0x5eed_0000_0000 + self.next_uuid;
        self.buckets
            .insert(settings.name.clone(), BucketMeta::new(settings, uuid));
    }

    pub(crate) fn bucket(&self, name: &str) -> Option<&BucketMeta> {
        self.buckets.get(name)
    }
}

/// Method and path the request is sent to.
fn route(request: &ManagementRequest) -> (&'static str, String) {
    use ManagementRequest as M;
    const BUCKETS: &str = "/pools/default/buckets";
    match request {
        M::BucketCreate(_) => ("POST", BUCKETS.to_string()),
        M::BucketDrop { name } => ("DELETE", format!("{}/{}", BUCKETS, name)),
        M::BucketFlush { name } => ("POST", format!("{}/{}/controller/doFlush", BUCKETS, name)),
        M::BucketGetAll => ("GET", BUCKETS.to_string()),
        M::ScopeCreate { bucket, .. } => ("POST", format!("{}/{}/scopes", BUCKETS, bucket)),
        M::ScopeDrop { bucket, scope } => ("DELETE", format!("{}/{}/scopes/{}", BUCKETS, bucket, scope)),
        M::ScopeGetAll { bucket } => ("GET", format!("{}/{}/scopes", BUCKETS, bucket)),
        M::CollectionCreate { bucket, scope, .. } => (
            "POST",
            format!("{}/{}/scopes/{}/collections", BUCKETS, bucket, scope),
        ),
        M::CollectionDrop {
            bucket,
            scope,
            collection,
        } => (
            "DELETE",
            format!("{}/{}/scopes/{}/collections/{}", BUCKETS, bucket, scope, collection),
        ),
        M::UserUpsert(user) => ("PUT", format!("/settings/rbac/users/local/{}", user.username)),
        M::UserDrop { username } => ("DELETE", format!("/settings/rbac/users/local/{}", username)),
        M::UserGetAll => ("GET", "/settings/rbac/users/local".to_string()),
        M::GroupUpsert(group) => ("PUT", format!("/settings/rbac/groups/{}", group.name)),
        M::GroupDrop { name } => ("DELETE", format!("/settings/rbac/groups/{}", name)),
        M::GroupGetAll => ("GET", "/settings/rbac/groups".to_string()),
        M::RoleGetAll => ("GET", "/settings/rbac/roles".to_string()),
        M::QueryIndexCreate { .. } | M::QueryIndexDrop { .. } | M::QueryIndexGetAll { .. } => {
            ("POST", "/query/service".to_string())
        }
    }
}

/// Runs one management request against the metadata.
///
/// **Output**: the listing or `Done`; failures carry the HTTP exchange.
pub(crate) fn apply(
    meta: &mut Metadata,
    store: &DocumentStore,
    request: &ManagementRequest,
) -> Result<ManagementResponse, ServiceFailure> {
    let (method, path) = route(request);
    let service = request_service(request);
    handle(meta, store, request).map_err(|(code, body)| {
        ServiceFailure::new(code).with_http(HttpExchange {
            method: method.to_string(),
            path,
            status: status_for(code),
            body,
            hostname: "127.0.0.1".to_string(),
            port: crate::loopback::service_port(service),
        })
    })
}

fn request_service(request: &ManagementRequest) -> ServiceType {
    match request {
        ManagementRequest::QueryIndexCreate { .. }
        | ManagementRequest::QueryIndexDrop { .. }
        | ManagementRequest::QueryIndexGetAll { .. } => ServiceType::Query,
        _ => ServiceType::Management,
    }
}

type Handled = Result<ManagementResponse, (ErrorCode, String)>;

fn handle(meta: &mut Metadata, store: &DocumentStore, request: &ManagementRequest) -> Handled {
    use ManagementRequest as M;
    match request {
        M::BucketCreate(settings) => {
            if meta.buckets.contains_key(&settings.name) {
                return Err(fail(
                    ManagementErrc::BucketExists,
                    r#"{"errors":{"name":"Bucket with given name already exists"}}"#,
                ));
            }
            if settings.ram_quota_mb < 100 {
                return Err(fail(
                    CommonErrc::InvalidArgument,
                    r#"{"errors":{"ramQuota":"RAM quota cannot be less than 100 MB"}}"#,
                ));
            }
            meta.add_bucket(settings.clone());
            Ok(ManagementResponse::Done)
        }
        M::BucketDrop { name } => {
            if meta.buckets.remove(name).is_none() {
                return Err(bucket_not_found(name));
            }
            meta.indexes.retain(|(bucket, _), _| bucket != name);
            store.flush_bucket(name);
            Ok(ManagementResponse::Done)
        }
        M::BucketFlush { name } => {
            let bucket = meta.bucket(name).ok_or_else(|| bucket_not_found(name))?;
            if !bucket.settings.flush_enabled {
                return Err(fail(
                    ManagementErrc::BucketNotFlushable,
                    r#"{"_":"Flush is disabled for the bucket"}"#,
                ));
            }
            store.flush_bucket(name);
            Ok(ManagementResponse::Done)
        }
        M::BucketGetAll => Ok(ManagementResponse::Buckets(
            meta.buckets.values().map(|b| b.settings.clone()).collect(),
        )),
        M::ScopeCreate { bucket, scope } => {
            let entry = meta.buckets.get_mut(bucket).ok_or_else(|| bucket_not_found(bucket))?;
            if entry.scopes.contains_key(scope) {
                return Err(fail(
                    ManagementErrc::ScopeExists,
                    format!(r#"{{"errors":{{"name":"Scope with name \"{}\" already exists"}}}}"#, scope),
                ));
            }
            entry.scopes.insert(scope.clone(), BTreeMap::new());
            Ok(ManagementResponse::Done)
        }
        M::ScopeDrop { bucket, scope } => {
            let entry = meta.buckets.get_mut(bucket).ok_or_else(|| bucket_not_found(bucket))?;
            if entry.scopes.remove(scope).is_none() {
                return Err(scope_not_found(scope));
            }
            store.drop_scope(bucket, scope);
            Ok(ManagementResponse::Done)
        }
        M::ScopeGetAll { bucket } => {
            let entry = meta.bucket(bucket).ok_or_else(|| bucket_not_found(bucket))?;
            let scopes = entry
                .scopes
                .iter()
                .map(|(name, collections)| ScopeSpec {
                    name: name.clone(),
                    collections: collections.values().cloned().collect(),
                })
                .collect();
            Ok(ManagementResponse::Scopes(scopes))
        }
        M::CollectionCreate {
            bucket,
            scope,
            collection,
            max_expiry,
        } => {
            let entry = meta.buckets.get_mut(bucket).ok_or_else(|| bucket_not_found(bucket))?;
            let collections = entry.scopes.get_mut(scope).ok_or_else(|| scope_not_found(scope))?;
            if collections.contains_key(collection) {
                return Err(fail(
                    ManagementErrc::CollectionExists,
                    format!(
                        r#"{{"errors":{{"name":"Collection with name \"{}\" in scope \"{}\" already exists"}}}}"#,
                        collection, scope
                    ),
                ));
            }
            collections.insert(
                collection.clone(),
                CollectionSpec {
                    name: collection.clone(),
                    scope_name: scope.clone(),
                    max_expiry: *max_expiry,
                },
            );
            Ok(ManagementResponse::Done)
        }
        M::CollectionDrop {
            bucket,
            scope,
            collection,
        } => {
            let entry = meta.buckets.get_mut(bucket).ok_or_else(|| bucket_not_found(bucket))?;
            let collections = entry.scopes.get_mut(scope).ok_or_else(|| scope_not_found(scope))?;
            if collections.remove(collection).is_none() {
                return Err(fail(
                    CommonErrc::CollectionNotFound,
                    format!(r#"{{"errors":{{"_":"Collection with name \"{}\" is not found"}}}}"#, collection),
                ));
            }
            store.drop_collection(bucket, scope, collection);
            Ok(ManagementResponse::Done)
        }
        M::UserUpsert(user) => {
            validate_roles(&user.roles)?;
            if let Some(group) = user.groups.iter().find(|g| !meta.groups.contains_key(*g)) {
                return Err(fail(
                    ManagementErrc::GroupNotFound,
                    format!(r#"{{"errors":{{"groups":"Group {} does not exist"}}}}"#, group),
                ));
            }
            meta.users.insert(user.username.clone(), user.clone());
            Ok(ManagementResponse::Done)
        }
        M::UserDrop { username } => {
            if meta.users.remove(username).is_none() {
                return Err(fail(ManagementErrc::UserNotFound, "\"User was not found.\""));
            }
            Ok(ManagementResponse::Done)
        }
        M::UserGetAll => Ok(ManagementResponse::Users(meta.users.values().cloned().collect())),
        M::GroupUpsert(group) => {
            validate_roles(&group.roles)?;
            meta.groups.insert(group.name.clone(), group.clone());
            Ok(ManagementResponse::Done)
        }
        M::GroupDrop { name } => {
            if meta.groups.remove(name).is_none() {
                return Err(fail(ManagementErrc::GroupNotFound, "\"Group was not found.\""));
            }
            for user in meta.users.values_mut() {
                user.groups.retain(|g| g != name);
            }
            Ok(ManagementResponse::Done)
        }
        M::GroupGetAll => Ok(ManagementResponse::Groups(meta.groups.values().cloned().collect())),
        M::RoleGetAll => Ok(ManagementResponse::Roles(
            KNOWN_ROLES
                .iter()
                .map(|(name, per_bucket)| Role {
                    name: name.to_string(),
                    bucket: per_bucket.then(|| "*".to_string()),
                })
                .collect(),
        )),
        M::QueryIndexCreate {
            bucket,
            name,
            fields,
            primary,
            ignore_if_exists,
        } => {
            if meta.bucket(bucket).is_none() {
                return Err(keyspace_not_found(bucket));
            }
            let name = if *primary && name.is_empty() {
                PRIMARY_INDEX_NAME.to_string()
            } else {
                name.clone()
            };
            if !*primary && fields.is_empty() {
                return Err(fail(
                    CommonErrc::InvalidArgument,
                    r#"{"errors":[{"code":3000,"msg":"syntax error - at )"}]}"#,
                ));
            }
            let key = (bucket.clone(), name.clone());
            if meta.indexes.contains_key(&key) {
                if *ignore_if_exists {
                    return Ok(ManagementResponse::Done);
                }
                return Err(fail(
                    CommonErrc::IndexExists,
                    format!(r#"{{"errors":[{{"code":4300,"msg":"The index {} already exists."}}]}}"#, name),
                ));
            }
            meta.indexes.insert(
                key,
                QueryIndex {
                    bucket: bucket.clone(),
                    name,
                    fields: fields.clone(),
                    is_primary: *primary,
                    state: "online".to_string(),
                },
            );
            Ok(ManagementResponse::Done)
        }
        M::QueryIndexDrop {
            bucket,
            name,
            primary,
            ignore_if_not_exists,
        } => {
            if meta.bucket(bucket).is_none() {
                return Err(keyspace_not_found(bucket));
            }
            let name = if *primary && name.is_empty() {
                PRIMARY_INDEX_NAME.to_string()
            } else {
                name.clone()
            };
            if meta.indexes.remove(&(bucket.clone(), name.clone())).is_none() && !*ignore_if_not_exists {
                return Err(fail(
                    CommonErrc::IndexNotFound,
                    format!(r#"{{"errors":[{{"code":12004,"msg":"Index {} not found."}}]}}"#, name),
                ));
            }
            Ok(ManagementResponse::Done)
        }
        M::QueryIndexGetAll { bucket } => Ok(ManagementResponse::QueryIndexes(
            meta.indexes
                .values()
                .filter(|index| &index.bucket == bucket)
                .cloned()
                .collect(),
        )),
    }
}

fn validate_roles(roles: &[Role]) -> Result<(), (ErrorCode, String)> {
    for role in roles {
        let known = KNOWN_ROLES
            .iter()
            .find(|(name, _)| *name == role.name)
            .map(|(_, per_bucket)| *per_bucket);
        let valid = match known {
            None => false,
            Some(per_bucket) => per_bucket == role.bucket.is_some(),
        };
        if !valid {
            return Err(fail(
                CommonErrc::InvalidArgument,
                format!(r#"{{"errors":{{"roles":"Cannot assign roles to user because the following roles are unknown, malformed or role parameters are undefined: [{}]"}}}}"#, role.name),
            ));
        }
    }
    Ok(())
}

fn fail(code: impl Into<ErrorCode>, body: impl Into<String>) -> (ErrorCode, String) {
    (code.into(), body.into())
}

fn bucket_not_found(name: &str) -> (ErrorCode, String) {
    fail(CommonErrc::BucketNotFound, format!("Requested resource not found. ({})", name))
}

fn scope_not_found(name: &str) -> (ErrorCode, String) {
    fail(
        CommonErrc::ScopeNotFound,
        format!(r#"{{"errors":{{"_":"Scope with name \"{}\" is not found"}}}}"#, name),
    )
}

fn keyspace_not_found(bucket: &str) -> (ErrorCode, String) {
    fail(
        CommonErrc::BucketNotFound,
        format!(r#"{{"errors":[{{"code":12003,"msg":"Keyspace not found in CB datastore: default:{}"}}]}}"#, bucket),
    )
}

/// HTTP status a management failure is reported with.
pub(crate) fn status_for(code: ErrorCode) -> u16 {
    match code {
        ErrorCode::Common(CommonErrc::BucketNotFound)
        | ErrorCode::Common(CommonErrc::ScopeNotFound)
        | ErrorCode::Common(CommonErrc::CollectionNotFound)
        | ErrorCode::Common(CommonErrc::IndexNotFound)
        | ErrorCode::Management(ManagementErrc::UserNotFound)
        | ErrorCode::Management(ManagementErrc::GroupNotFound) => 404,
        ErrorCode::Common(CommonErrc::AuthenticationFailure) => 401,
        ErrorCode::Common(CommonErrc::ServiceNotAvailable) => 503,
        ErrorCode::Common(CommonErrc::InternalServerFailure) => 500,
        ErrorCode::Common(CommonErrc::RateLimited) | ErrorCode::Common(CommonErrc::QuotaLimited) => 429,
        _ => 400,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta_with_bucket(name: &str) -> Metadata {
        let mut meta = Metadata::default();
        meta.add_bucket(BucketSettings::new(name));
        meta
    }

    #[test]
    fn duplicate_bucket_reports_http_context() {
        let mut meta = meta_with_bucket("travel");
        let store = DocumentStore::with_shard_count(1);
        let failure = apply(
            &mut meta,
            &store,
            &ManagementRequest::BucketCreate(BucketSettings::new("travel")),
        )
        .unwrap_err();

        assert_eq!(failure.code, ErrorCode::Management(ManagementErrc::BucketExists));
        let http = failure.http.unwrap();
        assert_eq!(http.method, "POST");
        assert_eq!(http.path, "/pools/default/buckets");
        assert_eq!(http.status, 400);
        assert_eq!(http.port, 8091);
    }

    #[test]
    fn scopes_and_collections_round_out_listing() {
        let mut meta = meta_with_bucket("travel");
        let store = DocumentStore::with_shard_count(1);
        apply(
            &mut meta,
            &store,
            &ManagementRequest::ScopeCreate {
                bucket: "travel".into(),
                scope: "inventory".into(),
            },
        )
        .unwrap();
        apply(
            &mut meta,
            &store,
            &ManagementRequest::CollectionCreate {
                bucket: "travel".into(),
                scope: "inventory".into(),
                collection: "hotel".into(),
                max_expiry: 0,
            },
        )
        .unwrap();

        let listed = apply(
            &mut meta,
            &store,
            &ManagementRequest::ScopeGetAll {
                bucket: "travel".into(),
            },
        )
        .unwrap();
        match listed {
            ManagementResponse::Scopes(scopes) => {
                let names: Vec<_> = scopes.iter().map(|s| s.name.as_str()).collect();
                assert_eq!(names, vec!["_default", "inventory"]);
                assert_eq!(scopes[1].collections[0].name, "hotel");
            }
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[test]
    fn flush_requires_flush_enabled() {
        let mut meta = meta_with_bucket("travel");
        let store = DocumentStore::with_shard_count(1);
        let failure = apply(
            &mut meta,
            &store,
            &ManagementRequest::BucketFlush {
                name: "travel".into(),
            },
        )
        .unwrap_err();
        assert_eq!(failure.code, ErrorCode::Management(ManagementErrc::BucketNotFlushable));
    }

    #[test]
    fn user_roles_are_validated() {
        let mut meta = Metadata::default();
        let store = DocumentStore::with_shard_count(1);
        let user = UserSettings {
            username: "alice".into(),
            display_name: "Alice".into(),
            password: Some("secret".into()),
            groups: vec![],
            roles: vec![Role {
                name: "wizard".into(),
                bucket: None,
            }],
        };
        let failure = apply(&mut meta, &store, &ManagementRequest::UserUpsert(user)).unwrap_err();
        assert_eq!(failure.code, ErrorCode::Common(CommonErrc::InvalidArgument));

        let failure = apply(
            &mut meta,
            &store,
            &ManagementRequest::UserDrop {
                username: "alice".into(),
            },
        )
        .unwrap_err();
        assert_eq!(failure.code, ErrorCode::Management(ManagementErrc::UserNotFound));
        assert_eq!(failure.http.unwrap().status, 404);
    }

    #[test]
    fn primary_index_lifecycle() {
        let mut meta = meta_with_bucket("travel");
        let store = DocumentStore::with_shard_count(1);
        let create = ManagementRequest::QueryIndexCreate {
            bucket: "travel".into(),
            name: String::new(),
            fields: vec![],
            primary: true,
            ignore_if_exists: false,
        };
        apply(&mut meta, &store, &create).unwrap();
        let failure = apply(&mut meta, &store, &create).unwrap_err();
        assert_eq!(failure.code, ErrorCode::Common(CommonErrc::IndexExists));
        assert_eq!(failure.http.as_ref().unwrap().port, 8093);

        let listed = apply(
            &mut meta,
            &store,
            &ManagementRequest::QueryIndexGetAll {
                bucket: "travel".into(),
            },
        )
        .unwrap();
        match listed {
            ManagementResponse::QueryIndexes(indexes) => {
                assert_eq!(indexes.len(), 1);
                assert_eq!(indexes[0].name, "#primary");
                assert!(indexes[0].is_primary);
            }
            other => panic!("unexpected response {:?}", other),
        }
    }
}
