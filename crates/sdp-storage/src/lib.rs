//! Submissions feed fetching and snapshot persistence for the survey pipeline.

pub mod codec;
pub mod fetch;
pub mod snapshot;

pub use codec::{table_schema, ColumnSpec};
pub use fetch::{
    classify_status, fetch_all, BackoffPolicy, Credentials, FeedEndpoint, FetchAllError,
    FetchError, HttpClientConfig, HttpPageSource, PageSource, PaginationStyle, RetryDisposition,
    DEFAULT_PAGE_SIZE,
};
pub use snapshot::{SnapshotMetadata, SnapshotStore, TableKind};

pub const CRATE_NAME: &str = "sdp-storage";
