//! # Exception Taxonomy
//!
//! Purpose: Map every (category, code) pair onto a named host exception
//! kind and render a `CoreErrorInfo` into the exception the host raises.
//!
//! ## Design Principles
//! 1. **Total Mapping**: `map_error_to_exception` is an exhaustive `match`;
//!    codes without a dedicated kind fall back to the base kind.
//! 2. **Explicit Hierarchy**: `ExceptionKind::parent` mirrors the host class
//!    tree, so subtype checks do not depend on the host runtime.

use std::fmt;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::error::{
    AnalyticsErrc, CommonErrc, CoreErrorInfo, ErrorCode, KeyValueErrc, ManagementErrc, QueryErrc,
    SearchErrc, SourceLocation, TransactionErrc, ViewErrc,
};

/// Host-visible exception classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionKind {
    // base classes
    Couchbase,
    Timeout,
    Transaction,
    // common
    AmbiguousTimeout,
    UnambiguousTimeout,
    AuthenticationFailure,
    BucketNotFound,
    CasMismatch,
    CollectionNotFound,
    DecodingFailure,
    EncodingFailure,
    FeatureNotAvailable,
    IndexExists,
    IndexNotFound,
    InternalServerFailure,
    InvalidArgument,
    ParsingFailure,
    QuotaLimited,
    RateLimited,
    RequestCanceled,
    ScopeNotFound,
    ServiceNotAvailable,
    TemporaryFailure,
    UnsupportedOperation,
    // key-value
    DocumentNotFound,
    DocumentIrretrievable,
    DocumentLocked,
    DocumentNotLocked,
    ValueTooLarge,
    DocumentExists,
    DurabilityLevelNotAvailable,
    DurabilityImpossible,
    DurabilityAmbiguous,
    DurableWriteInProgress,
    DurableWriteReCommitInProgress,
    PathNotFound,
    PathMismatch,
    PathInvalid,
    PathTooBig,
    PathTooDeep,
    ValueTooDeep,
    ValueInvalid,
    DocumentNotJson,
    NumberTooBig,
    DeltaInvalid,
    PathExists,
    XattrUnknownMacro,
    XattrInvalidKeyCombo,
    XattrUnknownVirtualAttribute,
    XattrCannotModifyVirtualAttribute,
    XattrNoAccess,
    // query
    PlanningFailure,
    IndexFailure,
    PreparedStatement,
    DmlFailure,
    // analytics
    CompilationFailure,
    JobQueueFull,
    DatasetNotFound,
    DataverseNotFound,
    DatasetExists,
    DataverseExists,
    LinkNotFound,
    LinkExists,
    // search
    IndexNotReady,
    ConsistencyMismatch,
    // view
    ViewNotFound,
    DesignDocumentNotFound,
    // management
    CollectionExists,
    ScopeExists,
    UserNotFound,
    GroupNotFound,
    BucketExists,
    UserExists,
    BucketNotFlushable,
    // transactions
    TransactionFailed,
    TransactionExpired,
    TransactionCommitAmbiguous,
    TransactionOperationFailed,
}

impl ExceptionKind {
    /// Host class name.
    pub const fn class_name(self) -> &'static str {
        use ExceptionKind::*;
        match self {
            Couchbase => "CouchbaseException",
            Timeout => "TimeoutException",
            Transaction => "TransactionException",
            AmbiguousTimeout => "AmbiguousTimeoutException",
            UnambiguousTimeout => "UnambiguousTimeoutException",
            AuthenticationFailure => "AuthenticationFailureException",
            BucketNotFound => "BucketNotFoundException",
            CasMismatch => "CasMismatchException",
            CollectionNotFound => "CollectionNotFoundException",
            DecodingFailure => "DecodingFailureException",
            EncodingFailure => "EncodingFailureException",
            FeatureNotAvailable => "FeatureNotAvailableException",
            IndexExists => "IndexExistsException",
            IndexNotFound => "IndexNotFoundException",
            InternalServerFailure => "InternalServerFailureException",
            InvalidArgument => "InvalidArgumentException",
            ParsingFailure => "ParsingFailureException",
            QuotaLimited => "QuotaLimitedException",
            RateLimited => "RateLimitedException",
            RequestCanceled => "RequestCanceledException",
            ScopeNotFound => "ScopeNotFoundException",
            ServiceNotAvailable => "ServiceNotAvailableException",
            TemporaryFailure => "TemporaryFailureException",
            UnsupportedOperation => "UnsupportedOperationException",
            DocumentNotFound => "DocumentNotFoundException",
            DocumentIrretrievable => "DocumentIrretrievableException",
            DocumentLocked => "DocumentLockedException",
            DocumentNotLocked => "DocumentNotLockedException",
            ValueTooLarge => "ValueTooLargeException",
            DocumentExists => "DocumentExistsException",
            DurabilityLevelNotAvailable => "DurabilityLevelNotAvailableException",
            DurabilityImpossible => "DurabilityImpossibleException",
            DurabilityAmbiguous => "DurabilityAmbiguousException",
            DurableWriteInProgress => "DurableWriteInProgressException",
            DurableWriteReCommitInProgress => "DurableWriteReCommitInProgressException",
            PathNotFound => "PathNotFoundException",
            PathMismatch => "PathMismatchException",
            PathInvalid => "PathInvalidException",
            PathTooBig => "PathTooBigException",
            PathTooDeep => "PathTooDeepException",
            ValueTooDeep => "ValueTooDeepException",
            ValueInvalid => "ValueInvalidException",
            DocumentNotJson => "DocumentNotJsonException",
            NumberTooBig => "NumberTooBigException",
            DeltaInvalid => "DeltaInvalidException",
            PathExists => "PathExistsException",
            XattrUnknownMacro => "XattrUnknownMacroException",
            XattrInvalidKeyCombo => "XattrInvalidKeyComboException",
            XattrUnknownVirtualAttribute => "XattrUnknownVirtualAttributeException",
            XattrCannotModifyVirtualAttribute => "XattrCannotModifyVirtualAttributeException",
            XattrNoAccess => "XattrNoAccessException",
            PlanningFailure => "PlanningFailureException",
            IndexFailure => "IndexFailureException",
            PreparedStatement => "PreparedStatementException",
            DmlFailure => "DmlFailureException",
            CompilationFailure => "CompilationFailureException",
            JobQueueFull => "JobQueueFullException",
            DatasetNotFound => "DatasetNotFoundException",
            DataverseNotFound => "DataverseNotFoundException",
            DatasetExists => "DatasetExistsException",
            DataverseExists => "DataverseExistsException",
            LinkNotFound => "LinkNotFoundException",
            LinkExists => "LinkExistsException",
            IndexNotReady => "IndexNotReadyException",
            ConsistencyMismatch => "ConsistencyMismatchException",
            ViewNotFound => "ViewNotFoundException",
            DesignDocumentNotFound => "DesignDocumentNotFoundException",
            CollectionExists => "CollectionExistsException",
            ScopeExists => "ScopeExistsException",
            UserNotFound => "UserNotFoundException",
            GroupNotFound => "GroupNotFoundException",
            BucketExists => "BucketExistsException",
            UserExists => "UserExistsException",
            BucketNotFlushable => "BucketNotFlushableException",
            TransactionFailed => "TransactionFailedException",
            TransactionExpired => "TransactionExpiredException",
            TransactionCommitAmbiguous => "TransactionCommitAmbiguousException",
            TransactionOperationFailed => "TransactionOperationFailedException",
        }
    }

    /// Direct base class; `None` only for the root.
    pub const fn parent(self) -> Option<ExceptionKind> {
        use ExceptionKind::*;
        match self {
            Couchbase => None,
            AmbiguousTimeout | UnambiguousTimeout => Some(Timeout),
            TransactionFailed
            | TransactionExpired
            | TransactionCommitAmbiguous
            | TransactionOperationFailed => Some(Transaction),
            _ => Some(Couchbase),
        }
    }

    /// True when `self` is `ancestor` or derives from it.
    pub fn is_a(self, ancestor: ExceptionKind) -> bool {
        let mut current = Some(self);
        while let Some(kind) = current {
            if kind == ancestor {
                return true;
            }
            current = kind.parent();
        }
        false
    }
}

impl fmt::Display for ExceptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.class_name())
    }
}

/// Maps a code onto the exception class the host raises for it.
pub fn map_error_to_exception(code: ErrorCode) -> ExceptionKind {
    use ExceptionKind as K;
    match code {
        ErrorCode::Common(c) => match c {
            CommonErrc::RequestCanceled => K::RequestCanceled,
            CommonErrc::InvalidArgument => K::InvalidArgument,
            CommonErrc::ServiceNotAvailable => K::ServiceNotAvailable,
            CommonErrc::InternalServerFailure => K::InternalServerFailure,
            CommonErrc::AuthenticationFailure => K::AuthenticationFailure,
            CommonErrc::TemporaryFailure => K::TemporaryFailure,
            CommonErrc::ParsingFailure => K::ParsingFailure,
            CommonErrc::CasMismatch => K::CasMismatch,
            CommonErrc::BucketNotFound => K::BucketNotFound,
            CommonErrc::CollectionNotFound => K::CollectionNotFound,
            CommonErrc::UnsupportedOperation => K::UnsupportedOperation,
            CommonErrc::AmbiguousTimeout => K::AmbiguousTimeout,
            CommonErrc::UnambiguousTimeout => K::UnambiguousTimeout,
            CommonErrc::FeatureNotAvailable => K::FeatureNotAvailable,
            CommonErrc::ScopeNotFound => K::ScopeNotFound,
            CommonErrc::IndexNotFound => K::IndexNotFound,
            CommonErrc::IndexExists => K::IndexExists,
            CommonErrc::EncodingFailure => K::EncodingFailure,
            CommonErrc::DecodingFailure => K::DecodingFailure,
            CommonErrc::RateLimited => K::RateLimited,
            CommonErrc::QuotaLimited => K::QuotaLimited,
        },
        ErrorCode::KeyValue(c) => match c {
            KeyValueErrc::DocumentNotFound => K::DocumentNotFound,
            KeyValueErrc::DocumentIrretrievable => K::DocumentIrretrievable,
            KeyValueErrc::DocumentLocked => K::DocumentLocked,
            KeyValueErrc::ValueTooLarge => K::ValueTooLarge,
            KeyValueErrc::DocumentExists => K::DocumentExists,
            KeyValueErrc::DurabilityLevelNotAvailable => K::DurabilityLevelNotAvailable,
            KeyValueErrc::DurabilityImpossible => K::DurabilityImpossible,
            KeyValueErrc::DurabilityAmbiguous => K::DurabilityAmbiguous,
            KeyValueErrc::DurableWriteInProgress => K::DurableWriteInProgress,
            KeyValueErrc::DurableWriteReCommitInProgress => K::DurableWriteReCommitInProgress,
            KeyValueErrc::PathNotFound => K::PathNotFound,
            KeyValueErrc::PathMismatch => K::PathMismatch,
            KeyValueErrc::PathInvalid => K::PathInvalid,
            KeyValueErrc::PathTooBig => K::PathTooBig,
            KeyValueErrc::PathTooDeep => K::PathTooDeep,
            KeyValueErrc::ValueTooDeep => K::ValueTooDeep,
            KeyValueErrc::ValueInvalid => K::ValueInvalid,
            KeyValueErrc::DocumentNotJson => K::DocumentNotJson,
            KeyValueErrc::NumberTooBig => K::NumberTooBig,
            KeyValueErrc::DeltaInvalid => K::DeltaInvalid,
            KeyValueErrc::PathExists => K::PathExists,
            KeyValueErrc::XattrUnknownMacro => K::XattrUnknownMacro,
            KeyValueErrc::XattrInvalidKeyCombo => K::XattrInvalidKeyCombo,
            KeyValueErrc::XattrUnknownVirtualAttribute => K::XattrUnknownVirtualAttribute,
            KeyValueErrc::XattrCannotModifyVirtualAttribute => {
                K::XattrCannotModifyVirtualAttribute
            }
            KeyValueErrc::XattrNoAccess => K::XattrNoAccess,
            KeyValueErrc::DocumentNotLocked => K::DocumentNotLocked,
        },
        ErrorCode::Query(c) => match c {
            QueryErrc::PlanningFailure => K::PlanningFailure,
            QueryErrc::IndexFailure => K::IndexFailure,
            QueryErrc::PreparedStatementFailure => K::PreparedStatement,
            QueryErrc::DmlFailure => K::DmlFailure,
        },
        ErrorCode::Analytics(c) => match c {
            AnalyticsErrc::CompilationFailure => K::CompilationFailure,
            AnalyticsErrc::JobQueueFull => K::JobQueueFull,
            AnalyticsErrc::DatasetNotFound => K::DatasetNotFound,
            AnalyticsErrc::DataverseNotFound => K::DataverseNotFound,
            AnalyticsErrc::DatasetExists => K::DatasetExists,
            AnalyticsErrc::DataverseExists => K::DataverseExists,
            AnalyticsErrc::LinkNotFound => K::LinkNotFound,
            AnalyticsErrc::LinkExists => K::LinkExists,
        },
        ErrorCode::Search(c) => match c {
            SearchErrc::IndexNotReady => K::IndexNotReady,
            SearchErrc::ConsistencyMismatch => K::ConsistencyMismatch,
        },
        ErrorCode::View(c) => match c {
            ViewErrc::ViewNotFound => K::ViewNotFound,
            ViewErrc::DesignDocumentNotFound => K::DesignDocumentNotFound,
        },
        ErrorCode::Management(c) => match c {
            ManagementErrc::CollectionExists => K::CollectionExists,
            ManagementErrc::ScopeExists => K::ScopeExists,
            ManagementErrc::UserNotFound => K::UserNotFound,
            ManagementErrc::GroupNotFound => K::GroupNotFound,
            ManagementErrc::BucketExists => K::BucketExists,
            ManagementErrc::UserExists => K::UserExists,
            ManagementErrc::BucketNotFlushable => K::BucketNotFlushable,
        },
        ErrorCode::Transaction(c) => match c {
            TransactionErrc::Failed => K::TransactionFailed,
            TransactionErrc::Expired => K::TransactionExpired,
            TransactionErrc::CommitAmbiguous => K::TransactionCommitAmbiguous,
            TransactionErrc::OperationFailed => K::TransactionOperationFailed,
            // Unstaging failures after a successful commit surface as the
            // generic transaction class.
            TransactionErrc::FailedPostCommit => K::Transaction,
        },
    }
}

/// The typed exception handed to the host.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind}: {message}")]
pub struct HostException {
    pub kind: ExceptionKind,
    pub code: i32,
    pub message: String,
    pub location: SourceLocation,
    pub context: Map<String, Value>,
}

impl HostException {
    /// Host class name of the exception.
    pub fn class_name(&self) -> &'static str {
        self.kind.class_name()
    }
}

impl From<CoreErrorInfo> for HostException {
    fn from(err: CoreErrorInfo) -> Self {
        HostException::from(&err)
    }
}

impl From<&CoreErrorInfo> for HostException {
    fn from(err: &CoreErrorInfo) -> Self {
        HostException {
            kind: map_error_to_exception(err.code),
            code: err.code.value(),
            message: err.render_message(),
            location: err.location,
            context: err.context.render(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ErrorContext, ServiceFailure};
    use crate::types::DocumentId;

    #[test]
    fn every_code_maps_to_a_kind_with_a_class_name() {
        for code in ErrorCode::all() {
            let kind = map_error_to_exception(code);
            assert!(kind.class_name().ends_with("Exception"));
            assert!(kind.is_a(ExceptionKind::Couchbase), "{:?}", code);
        }
    }

    #[test]
    fn only_post_commit_failure_falls_back() {
        let generic: Vec<_> = ErrorCode::all()
            .filter(|code| {
                matches!(
                    map_error_to_exception(*code),
                    ExceptionKind::Couchbase | ExceptionKind::Transaction | ExceptionKind::Timeout
                )
            })
            .collect();
        assert_eq!(
            generic,
            vec![ErrorCode::Transaction(TransactionErrc::FailedPostCommit)]
        );
    }

    #[test]
    fn timeouts_derive_from_timeout() {
        let kind = map_error_to_exception(ErrorCode::Common(CommonErrc::AmbiguousTimeout));
        assert_eq!(kind, ExceptionKind::AmbiguousTimeout);
        assert!(kind.is_a(ExceptionKind::Timeout));
        assert!(!ExceptionKind::DocumentNotFound.is_a(ExceptionKind::Timeout));
    }

    #[test]
    fn transaction_kinds_derive_from_transaction() {
        let kind = map_error_to_exception(ErrorCode::Transaction(TransactionErrc::Expired));
        assert!(kind.is_a(ExceptionKind::Transaction));
        assert_eq!(kind.parent(), Some(ExceptionKind::Transaction));
        assert_eq!(ExceptionKind::Couchbase.parent(), None);
    }

    #[test]
    fn host_exception_renders_message_and_context() {
        let id = DocumentId::in_default_collection("travel", "airline_10");
        let failure = ServiceFailure::new(KeyValueErrc::DocumentNotFound);
        let err = CoreErrorInfo::new(
            KeyValueErrc::DocumentNotFound,
            "unable to execute get \"airline_10\"",
        )
        .with_context(ErrorContext::key_value(&id, &failure));

        let exception = HostException::from(&err);
        assert_eq!(exception.kind, ExceptionKind::DocumentNotFound);
        assert_eq!(exception.class_name(), "DocumentNotFoundException");
        assert_eq!(exception.code, 101);
        assert_eq!(
            exception.message,
            "document_not_found (101): \"unable to execute get \"airline_10\"\""
        );
        assert_eq!(exception.context["id"], "airline_10");
    }
}
