//! # Error Codes
//!
//! Purpose: Define the closed set of cluster error categories and their
//! numeric codes, plus `CoreErrorInfo`, the value every failed operation is
//! reduced to before it reaches the host.
//!
//! ## Design Principles
//! 1. **Independent Scopes**: Each category has its own enumeration; a code is
//!    only meaningful together with its category.
//! 2. **Stable Numbers**: Numeric values never change once published so host
//!    code can compare them across releases.
//! 3. **Deterministic Text**: `ErrorCode::message()` is the fixed prefix of
//!    every rendered exception message.
//!
//! ## Layout
//!
//! ```text
//! ErrorCode
//!   ├── Common(CommonErrc)           2..=22
//!   ├── KeyValue(KeyValueErrc)       101..=131
//!   ├── Query(QueryErrc)             201..=204
//!   ├── Analytics(AnalyticsErrc)     301..=308
//!   ├── Search(SearchErrc)           401..=402
//!   ├── View(ViewErrc)               501..=502
//!   ├── Management(ManagementErrc)   601..=607
//!   └── Transaction(TransactionErrc) 1200..=1203, 1300
//! ```

use std::fmt;
use std::panic::Location;

use serde::Serialize;

use crate::context::ErrorContext;

/// Declares one category enumeration together with its numeric and textual
/// tables.
macro_rules! error_category {
    (
        $(#[$meta:meta])*
        $name:ident {
            $($(#[$vmeta:meta])* $variant:ident = $value:literal => $text:literal,)+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum $name {
            $($(#[$vmeta])* $variant,)+
        }

        impl $name {
            /// Every code of this category, in declaration order.
            pub const ALL: &'static [$name] = &[$($name::$variant,)+];

            /// Numeric value of the code.
            pub const fn value(self) -> i32 {
                match self {
                    $($name::$variant => $value,)+
                }
            }

            /// Snake-case name of the code.
            pub const fn name(self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }

            /// Looks a code up by its numeric value.
            pub fn from_value(value: i32) -> Option<Self> {
                match value {
                    $($value => Some($name::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

error_category! {
    /// Failures shared by every service.
    CommonErrc {
        RequestCanceled = 2 => "request_canceled",
        InvalidArgument = 3 => "invalid_argument",
        ServiceNotAvailable = 4 => "service_not_available",
        InternalServerFailure = 5 => "internal_server_failure",
        AuthenticationFailure = 6 => "authentication_failure",
        TemporaryFailure = 7 => "temporary_failure",
        ParsingFailure = 8 => "parsing_failure",
        CasMismatch = 9 => "cas_mismatch",
        BucketNotFound = 10 => "bucket_not_found",
        CollectionNotFound = 11 => "collection_not_found",
        UnsupportedOperation = 12 => "unsupported_operation",
        AmbiguousTimeout = 13 => "ambiguous_timeout",
        UnambiguousTimeout = 14 => "unambiguous_timeout",
        FeatureNotAvailable = 15 => "feature_not_available",
        ScopeNotFound = 16 => "scope_not_found",
        IndexNotFound = 17 => "index_not_found",
        IndexExists = 18 => "index_exists",
        EncodingFailure = 19 => "encoding_failure",
        DecodingFailure = 20 => "decoding_failure",
        RateLimited = 21 => "rate_limited",
        QuotaLimited = 22 => "quota_limited",
    }
}

error_category! {
    /// Document state, sub-document path and durability failures.
    KeyValueErrc {
        DocumentNotFound = 101 => "document_not_found",
        DocumentIrretrievable = 102 => "document_irretrievable",
        DocumentLocked = 103 => "document_locked",
        ValueTooLarge = 104 => "value_too_large",
        DocumentExists = 105 => "document_exists",
        DurabilityLevelNotAvailable = 107 => "durability_level_not_available",
        DurabilityImpossible = 108 => "durability_impossible",
        DurabilityAmbiguous = 109 => "durability_ambiguous",
        DurableWriteInProgress = 110 => "durable_write_in_progress",
        DurableWriteReCommitInProgress = 111 => "durable_write_re_commit_in_progress",
        PathNotFound = 113 => "path_not_found",
        PathMismatch = 114 => "path_mismatch",
        PathInvalid = 115 => "path_invalid",
        PathTooBig = 116 => "path_too_big",
        PathTooDeep = 117 => "path_too_deep",
        ValueTooDeep = 118 => "value_too_deep",
        ValueInvalid = 119 => "value_invalid",
        DocumentNotJson = 120 => "document_not_json",
        NumberTooBig = 121 => "number_too_big",
        DeltaInvalid = 122 => "delta_invalid",
        PathExists = 123 => "path_exists",
        XattrUnknownMacro = 124 => "xattr_unknown_macro",
        XattrInvalidKeyCombo = 126 => "xattr_invalid_key_combo",
        XattrUnknownVirtualAttribute = 127 => "xattr_unknown_virtual_attribute",
        XattrCannotModifyVirtualAttribute = 128 => "xattr_cannot_modify_virtual_attribute",
        XattrNoAccess = 130 => "xattr_no_access",
        DocumentNotLocked = 131 => "document_not_locked",
    }
}

error_category! {
    /// SQL++ query failures.
    QueryErrc {
        PlanningFailure = 201 => "planning_failure",
        IndexFailure = 202 => "index_failure",
        PreparedStatementFailure = 203 => "prepared_statement_failure",
        DmlFailure = 204 => "dml_failure",
    }
}

error_category! {
    /// Analytics service failures.
    AnalyticsErrc {
        CompilationFailure = 301 => "compilation_failure",
        JobQueueFull = 302 => "job_queue_full",
        DatasetNotFound = 303 => "dataset_not_found",
        DataverseNotFound = 304 => "dataverse_not_found",
        DatasetExists = 305 => "dataset_exists",
        DataverseExists = 306 => "dataverse_exists",
        LinkNotFound = 307 => "link_not_found",
        LinkExists = 308 => "link_exists",
    }
}

error_category! {
    /// Full-text search failures.
    SearchErrc {
        IndexNotReady = 401 => "index_not_ready",
        ConsistencyMismatch = 402 => "consistency_mismatch",
    }
}

error_category! {
    /// Map/reduce view failures.
    ViewErrc {
        ViewNotFound = 501 => "view_not_found",
        DesignDocumentNotFound = 502 => "design_document_not_found",
    }
}

error_category! {
    /// Existence conflicts reported by the management services.
    ManagementErrc {
        CollectionExists = 601 => "collection_exists",
        ScopeExists = 602 => "scope_exists",
        UserNotFound = 603 => "user_not_found",
        GroupNotFound = 604 => "group_not_found",
        BucketExists = 605 => "bucket_exists",
        UserExists = 606 => "user_exists",
        BucketNotFlushable = 607 => "bucket_not_flushable",
    }
}

error_category! {
    /// Outcomes of the distributed transaction protocol.
    TransactionErrc {
        Failed = 1200 => "transaction_failed",
        Expired = 1201 => "transaction_expired",
        FailedPostCommit = 1202 => "transaction_failed_post_commit",
        CommitAmbiguous = 1203 => "transaction_commit_ambiguous",
        OperationFailed = 1300 => "transaction_operation_failed",
    }
}

/// Category a code belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Common,
    KeyValue,
    Query,
    Analytics,
    Search,
    View,
    Management,
    Transaction,
}

impl ErrorCategory {
    /// Every category, in the order codes are numbered.
    pub const ALL: [ErrorCategory; 8] = [
        ErrorCategory::Common,
        ErrorCategory::KeyValue,
        ErrorCategory::Query,
        ErrorCategory::Analytics,
        ErrorCategory::Search,
        ErrorCategory::View,
        ErrorCategory::Management,
        ErrorCategory::Transaction,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            ErrorCategory::Common => "common",
            ErrorCategory::KeyValue => "key_value",
            ErrorCategory::Query => "query",
            ErrorCategory::Analytics => "analytics",
            ErrorCategory::Search => "search",
            ErrorCategory::View => "view",
            ErrorCategory::Management => "management",
            ErrorCategory::Transaction => "transaction",
        }
    }
}

/// A (category, code) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Common(CommonErrc),
    KeyValue(KeyValueErrc),
    Query(QueryErrc),
    Analytics(AnalyticsErrc),
    Search(SearchErrc),
    View(ViewErrc),
    Management(ManagementErrc),
    Transaction(TransactionErrc),
}

impl ErrorCode {
    pub const fn category(self) -> ErrorCategory {
        match self {
            ErrorCode::Common(_) => ErrorCategory::Common,
            ErrorCode::KeyValue(_) => ErrorCategory::KeyValue,
            ErrorCode::Query(_) => ErrorCategory::Query,
            ErrorCode::Analytics(_) => ErrorCategory::Analytics,
            ErrorCode::Search(_) => ErrorCategory::Search,
            ErrorCode::View(_) => ErrorCategory::View,
            ErrorCode::Management(_) => ErrorCategory::Management,
            ErrorCode::Transaction(_) => ErrorCategory::Transaction,
        }
    }

    pub const fn value(self) -> i32 {
        match self {
            ErrorCode::Common(c) => c.value(),
            ErrorCode::KeyValue(c) => c.value(),
            ErrorCode::Query(c) => c.value(),
            ErrorCode::Analytics(c) => c.value(),
            ErrorCode::Search(c) => c.value(),
            ErrorCode::View(c) => c.value(),
            ErrorCode::Management(c) => c.value(),
            ErrorCode::Transaction(c) => c.value(),
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            ErrorCode::Common(c) => c.name(),
            ErrorCode::KeyValue(c) => c.name(),
            ErrorCode::Query(c) => c.name(),
            ErrorCode::Analytics(c) => c.name(),
            ErrorCode::Search(c) => c.name(),
            ErrorCode::View(c) => c.name(),
            ErrorCode::Management(c) => c.name(),
            ErrorCode::Transaction(c) => c.name(),
        }
    }

    /// Fixed message prefix, e.g. `document_not_found (101)`.
    pub fn message(self) -> String {
        format!("{} ({})", self.name(), self.value())
    }

    /// Rebuilds a code from its category and numeric value.
    pub fn from_parts(category: ErrorCategory, value: i32) -> Option<ErrorCode> {
        match category {
            ErrorCategory::Common => CommonErrc::from_value(value).map(ErrorCode::Common),
            ErrorCategory::KeyValue => KeyValueErrc::from_value(value).map(ErrorCode::KeyValue),
            ErrorCategory::Query => QueryErrc::from_value(value).map(ErrorCode::Query),
            ErrorCategory::Analytics => AnalyticsErrc::from_value(value).map(ErrorCode::Analytics),
            ErrorCategory::Search => SearchErrc::from_value(value).map(ErrorCode::Search),
            ErrorCategory::View => ViewErrc::from_value(value).map(ErrorCode::View),
            ErrorCategory::Management => {
                ManagementErrc::from_value(value).map(ErrorCode::Management)
            }
            ErrorCategory::Transaction => {
                TransactionErrc::from_value(value).map(ErrorCode::Transaction)
            }
        }
    }

    /// Iterates every defined (category, code) pair.
    pub fn all() -> impl Iterator<Item = ErrorCode> {
        let common = CommonErrc::ALL.iter().copied().map(ErrorCode::Common);
        let kv = KeyValueErrc::ALL.iter().copied().map(ErrorCode::KeyValue);
        let query = QueryErrc::ALL.iter().copied().map(ErrorCode::Query);
        let analytics = AnalyticsErrc::ALL.iter().copied().map(ErrorCode::Analytics);
        let search = SearchErrc::ALL.iter().copied().map(ErrorCode::Search);
        let view = ViewErrc::ALL.iter().copied().map(ErrorCode::View);
        let management = ManagementErrc::ALL.iter().copied().map(ErrorCode::Management);
        let transaction = TransactionErrc::ALL.iter().copied().map(ErrorCode::Transaction);
        common
            .chain(kv)
            .chain(query)
            .chain(analytics)
            .chain(search)
            .chain(view)
            .chain(management)
            .chain(transaction)
    }

    /// Returns true for both timeout flavours.
    pub fn is_timeout(self) -> bool {
        matches!(
            self,
            ErrorCode::Common(CommonErrc::AmbiguousTimeout)
                | ErrorCode::Common(CommonErrc::UnambiguousTimeout)
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.value())
    }
}

macro_rules! impl_from_category {
    ($($errc:ident => $variant:ident,)+) => {
        $(
            impl From<$errc> for ErrorCode {
                fn from(code: $errc) -> Self {
                    ErrorCode::$variant(code)
                }
            }
        )+
    };
}

impl_from_category! {
    CommonErrc => Common,
    KeyValueErrc => KeyValue,
    QueryErrc => Query,
    AnalyticsErrc => Analytics,
    SearchErrc => Search,
    ViewErrc => View,
    ManagementErrc => Management,
    TransactionErrc => Transaction,
}

/// Place in the source where a failure was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceLocation {
    pub file: &'static str,
    pub line: u32,
}

impl SourceLocation {
    /// Captures the location of the caller.
    #[track_caller]
    pub fn caller() -> Self {
        let location = Location::caller();
        SourceLocation {
            file: location.file(),
            line: location.line(),
        }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// Result type for operations that fail with a `CoreErrorInfo`.
pub type CoreResult<T> = Result<T, CoreErrorInfo>;

/// A failure as seen by the session layer.
///
/// Created at the point of failure and carried unchanged until it is
/// rendered into a host exception.
#[derive(Debug, Clone, PartialEq)]
pub struct CoreErrorInfo {
    pub code: ErrorCode,
    pub location: SourceLocation,
    pub message: String,
    pub context: ErrorContext,
}

impl CoreErrorInfo {
    /// Creates an error with an empty context at the caller's location.
    #[track_caller]
    pub fn new(code: impl Into<ErrorCode>, message: impl Into<String>) -> Self {
        CoreErrorInfo {
            code: code.into(),
            location: SourceLocation::caller(),
            message: message.into(),
            context: ErrorContext::Empty,
        }
    }

    /// Shorthand for an `invalid_argument` failure.
    #[track_caller]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        CoreErrorInfo::new(CommonErrc::InvalidArgument, message)
    }

    /// Attaches a structured context.
    pub fn with_context(mut self, context: ErrorContext) -> Self {
        self.context = context;
        self
    }

    /// Renders the host-visible message:
    /// `<code-message>: "<submessage>", <enhanced-context>`.
    pub fn render_message(&self) -> String {
        let mut out = self.code.message();
        if !self.message.is_empty() {
            out.push_str(": \"");
            out.push_str(&self.message);
            out.push('"');
        }
        if let Some(enhanced) = self.context.enhanced_message() {
            out.push_str(", ");
            out.push_str(&enhanced);
        }
        out
    }
}

impl fmt::Display for CoreErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render_message())
    }
}

impl std::error::Error for CoreErrorInfo {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_round_trip_through_categories() {
        for code in ErrorCode::all() {
            let rebuilt = ErrorCode::from_parts(code.category(), code.value());
            assert_eq!(rebuilt, Some(code));
        }
    }

    #[test]
    fn numeric_values_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for code in ErrorCode::all() {
            assert!(seen.insert(code.value()), "duplicate value {}", code.value());
        }
    }

    #[test]
    fn unknown_value_has_no_code() {
        assert_eq!(ErrorCode::from_parts(ErrorCategory::Query, 999), None);
        assert_eq!(ErrorCode::from_parts(ErrorCategory::Common, 101), None);
    }

    #[test]
    fn message_includes_name_and_value() {
        let code = ErrorCode::from(KeyValueErrc::DocumentNotFound);
        assert_eq!(code.message(), "document_not_found (101)");
        assert_eq!(code.to_string(), "document_not_found (101)");
    }

    #[test]
    fn render_message_without_submessage() {
        let err = CoreErrorInfo::new(CommonErrc::RequestCanceled, "");
        assert_eq!(err.render_message(), "request_canceled (2)");
    }

    #[test]
    fn render_message_quotes_submessage() {
        let err = CoreErrorInfo::invalid_argument("expected string for bucket");
        assert_eq!(
            err.render_message(),
            "invalid_argument (3): \"expected string for bucket\""
        );
    }

    #[test]
    fn location_points_at_caller() {
        let err = CoreErrorInfo::new(CommonErrc::InternalServerFailure, "boom");
        assert!(err.location.file.ends_with("error.rs"));
        assert!(err.location.line > 0);
    }
}
