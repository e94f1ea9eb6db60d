//! # Session Operations
//!
//! Blocking cluster operations on a `ConnectionSession`. Each one builds a
//! request, runs it through the bridge and maps the response or failure.

use std::time::Duration;

use bytes::Bytes;

use csm_cluster::{
    AnalyticsRequest, BucketSettings, GetResult, GroupSettings, ManagementRequest,
    ManagementResponse, MutationKind, MutationOptions, MutationResult, PingRequest, QueryIndex,
    QueryRequest, QueryResult, Request, Response, Role, ScopeSpec, SearchRequest, SearchResult,
    ServiceReport, UserSettings, ViewRequest, ViewResult,
};
use csm_common::{CoreResult, DocumentId, ErrorContext};

use crate::session::ConnectionSession;

impl ConnectionSession {
    pub fn open_bucket(&self, bucket: &str) -> CoreResult<()> {
        let id = bucket_id(bucket);
        self.execute(
            Request::OpenBucket {
                bucket: bucket.to_string(),
            },
            "open bucket",
            bucket,
            |failure| ErrorContext::key_value(&id, failure),
            |response| matches!(response, Response::Empty).then_some(()),
        )
    }

    pub fn close_bucket(&self, bucket: &str) -> CoreResult<()> {
        let id = bucket_id(bucket);
        self.execute(
            Request::CloseBucket {
                bucket: bucket.to_string(),
            },
            "close bucket",
            bucket,
            |failure| ErrorContext::key_value(&id, failure),
            |response| matches!(response, Response::Empty).then_some(()),
        )
    }

    pub fn get(&self, id: &DocumentId, timeout: Option<Duration>) -> CoreResult<GetResult> {
        self.execute(
            Request::Get {
                id: id.clone(),
                timeout,
            },
            "get",
            &id.key,
            |failure| ErrorContext::key_value(id, failure),
            |response| match response {
                Response::Get(result) => Some(result),
                _ => None,
            },
        )
    }

    pub fn upsert(
        &self,
        id: &DocumentId,
        value: Bytes,
        options: MutationOptions,
    ) -> CoreResult<MutationResult> {
        self.mutate(MutationKind::Upsert, id, value, options)
    }

    pub fn insert(
        &self,
        id: &DocumentId,
        value: Bytes,
        options: MutationOptions,
    ) -> CoreResult<MutationResult> {
        self.mutate(MutationKind::Insert, id, value, options)
    }

    pub fn replace(
        &self,
        id: &DocumentId,
        value: Bytes,
        options: MutationOptions,
    ) -> CoreResult<MutationResult> {
        self.mutate(MutationKind::Replace, id, value, options)
    }

    #[track_caller]
    fn mutate(
        &self,
        kind: MutationKind,
        id: &DocumentId,
        value: Bytes,
        options: MutationOptions,
    ) -> CoreResult<MutationResult> {
        self.execute(
            Request::Mutate {
                kind,
                id: id.clone(),
                value,
                options,
            },
            kind.as_str(),
            &id.key,
            |failure| ErrorContext::key_value(id, failure),
            mutation_result,
        )
    }

    pub fn remove(&self, id: &DocumentId, options: MutationOptions) -> CoreResult<MutationResult> {
        self.execute(
            Request::Remove {
                id: id.clone(),
                options,
            },
            "remove",
            &id.key,
            |failure| ErrorContext::key_value(id, failure),
            mutation_result,
        )
    }

    pub fn query(&self, request: QueryRequest) -> CoreResult<QueryResult> {
        let statement = request.statement.clone();
        let parameters = request.encoded_parameters();
        self.execute(
            Request::Query(request),
            "query",
            &statement,
            |failure| ErrorContext::query(&statement, parameters, failure),
            |response| match response {
                Response::Query(result) => Some(result),
                _ => None,
            },
        )
    }

    pub fn analytics(&self, request: AnalyticsRequest) -> CoreResult<QueryResult> {
        let statement = request.statement.clone();
        let parameters = request.encoded_parameters();
        self.execute(
            Request::Analytics(request),
            "analytics query",
            &statement,
            |failure| ErrorContext::analytics(&statement, parameters, failure),
            |response| match response {
                Response::Analytics(result) => Some(result),
                _ => None,
            },
        )
    }

    pub fn search(&self, request: SearchRequest) -> CoreResult<SearchResult> {
        let index = request.index_name.clone();
        let query = request.query.to_string();
        let parameters = request.encoded_parameters();
        self.execute(
            Request::Search(request),
            "search query",
            &index,
            |failure| ErrorContext::search(&index, &query, parameters, failure),
            |response| match response {
                Response::Search(result) => Some(result),
                _ => None,
            },
        )
    }

    pub fn view(&self, request: ViewRequest) -> CoreResult<ViewResult> {
        let design_document = request.design_document.clone();
        let view = request.view.clone();
        let query_string = request.query_string.clone();
        let name = format!("{}/{}", design_document, view);
        self.execute(
            Request::View(request),
            "view query",
            &name,
            |failure| ErrorContext::view(&design_document, &view, query_string, failure),
            |response| match response {
                Response::View(result) => Some(result),
                _ => None,
            },
        )
    }

    pub fn ping(&self, request: PingRequest) -> CoreResult<ServiceReport> {
        let name = request.report_id.clone().unwrap_or_default();
        self.execute(
            Request::Ping(request),
            "ping",
            &name,
            ErrorContext::http,
            |response| match response {
                Response::Ping(report) => Some(report),
                _ => None,
            },
        )
    }

    pub fn diagnostics(&self, report_id: Option<String>) -> CoreResult<ServiceReport> {
        let name = report_id.clone().unwrap_or_default();
        self.execute(
            Request::Diagnostics { report_id },
            "diagnostics",
            &name,
            ErrorContext::http,
            |response| match response {
                Response::Diagnostics(report) => Some(report),
                _ => None,
            },
        )
    }

    /// Runs any management request.
    pub fn manage(&self, request: ManagementRequest) -> CoreResult<ManagementResponse> {
        let operation = request.operation();
        let subject = request.subject();
        self.execute(
            Request::Management(request),
            operation,
            &subject,
            ErrorContext::http,
            |response| match response {
                Response::Management(result) => Some(result),
                _ => None,
            },
        )
    }

    pub fn create_bucket(&self, settings: BucketSettings) -> CoreResult<()> {
        self.manage(ManagementRequest::BucketCreate(settings)).map(drop)
    }

    pub fn drop_bucket(&self, name: &str) -> CoreResult<()> {
        self.manage(ManagementRequest::BucketDrop { name: name.into() })
            .map(drop)
    }

    pub fn flush_bucket(&self, name: &str) -> CoreResult<()> {
        self.manage(ManagementRequest::BucketFlush { name: name.into() })
            .map(drop)
    }

    pub fn get_all_buckets(&self) -> CoreResult<Vec<BucketSettings>> {
        match self.manage(ManagementRequest::BucketGetAll)? {
            ManagementResponse::Buckets(buckets) => Ok(buckets),
            _ => Ok(Vec::new()),
        }
    }

    pub fn create_scope(&self, bucket: &str, scope: &str) -> CoreResult<()> {
        self.manage(ManagementRequest::ScopeCreate {
            bucket: bucket.into(),
            scope: scope.into(),
        })
        .map(drop)
    }

    pub fn drop_scope(&self, bucket: &str, scope: &str) -> CoreResult<()> {
        self.manage(ManagementRequest::ScopeDrop {
            bucket: bucket.into(),
            scope: scope.into(),
        })
        .map(drop)
    }

    pub fn get_all_scopes(&self, bucket: &str) -> CoreResult<Vec<ScopeSpec>> {
        match self.manage(ManagementRequest::ScopeGetAll {
            bucket: bucket.into(),
        })? {
            ManagementResponse::Scopes(scopes) => Ok(scopes),
            _ => Ok(Vec::new()),
        }
    }

    pub fn create_collection(
        &self,
        bucket: &str,
        scope: &str,
        collection: &str,
        max_expiry: u64,
    ) -> CoreResult<()> {
        self.manage(ManagementRequest::CollectionCreate {
            bucket: bucket.into(),
            scope: scope.into(),
            collection: collection.into(),
            max_expiry,
        })
        .map(drop)
    }

    pub fn drop_collection(&self, bucket: &str, scope: &str, collection: &str) -> CoreResult<()> {
        self.manage(ManagementRequest::CollectionDrop {
            bucket: bucket.into(),
            scope: scope.into(),
            collection: collection.into(),
        })
        .map(drop)
    }

    pub fn upsert_user(&self, user: UserSettings) -> CoreResult<()> {
        self.manage(ManagementRequest::UserUpsert(user)).map(drop)
    }

    pub fn drop_user(&self, username: &str) -> CoreResult<()> {
        self.manage(ManagementRequest::UserDrop {
            username: username.into(),
        })
        .map(drop)
    }

    pub fn get_all_users(&self) -> CoreResult<Vec<UserSettings>> {
        match self.manage(ManagementRequest::UserGetAll)? {
            ManagementResponse::Users(users) => Ok(users),
            _ => Ok(Vec::new()),
        }
    }

    pub fn upsert_group(&self, group: GroupSettings) -> CoreResult<()> {
        self.manage(ManagementRequest::GroupUpsert(group)).map(drop)
    }

    pub fn drop_group(&self, name: &str) -> CoreResult<()> {
        self.manage(ManagementRequest::GroupDrop { name: name.into() })
            .map(drop)
    }

    pub fn get_all_groups(&self) -> CoreResult<Vec<GroupSettings>> {
        match self.manage(ManagementRequest::GroupGetAll)? {
            ManagementResponse::Groups(groups) => Ok(groups),
            _ => Ok(Vec::new()),
        }
    }

    pub fn get_all_roles(&self) -> CoreResult<Vec<Role>> {
        match self.manage(ManagementRequest::RoleGetAll)? {
            ManagementResponse::Roles(roles) => Ok(roles),
            _ => Ok(Vec::new()),
        }
    }

    pub fn create_query_index(
        &self,
        bucket: &str,
        name: &str,
        fields: Vec<String>,
        ignore_if_exists: bool,
    ) -> CoreResult<()> {
        self.manage(ManagementRequest::QueryIndexCreate {
            bucket: bucket.into(),
            name: name.into(),
            fields,
            primary: false,
            ignore_if_exists,
        })
        .map(drop)
    }

    pub fn create_primary_query_index(&self, bucket: &str, ignore_if_exists: bool) -> CoreResult<()> {
        self.manage(ManagementRequest::QueryIndexCreate {
            bucket: bucket.into(),
            name: String::new(),
            fields: Vec::new(),
            primary: true,
            ignore_if_exists,
        })
        .map(drop)
    }

    pub fn drop_query_index(
        &self,
        bucket: &str,
        name: &str,
        ignore_if_not_exists: bool,
    ) -> CoreResult<()> {
        self.manage(ManagementRequest::QueryIndexDrop {
            bucket: bucket.into(),
            name: name.into(),
            primary: false,
            ignore_if_not_exists,
        })
        .map(drop)
    }

    pub fn get_all_query_indexes(&self, bucket: &str) -> CoreResult<Vec<QueryIndex>> {
        match self.manage(ManagementRequest::QueryIndexGetAll {
            bucket: bucket.into(),
        })? {
            ManagementResponse::QueryIndexes(indexes) => Ok(indexes),
            _ => Ok(Vec::new()),
        }
    }
}

fn bucket_id(bucket: &str) -> DocumentId {
    DocumentId::new(bucket, "", "", "")
}

fn mutation_result(response: Response) -> Option<MutationResult> {
    match response {
        Response::Mutation(result) => Some(result),
        _ => None,
    }
}
