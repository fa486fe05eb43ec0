pub mod derive;
pub mod filter;
pub mod normalize;
pub mod species;
pub mod summary;

use sdp_core::{RawRecord, Table};
use tracing::info;

pub use derive::{derive, DeriveReport, DerivedFields};
pub use filter::{filter_completed, filter_date_range, is_consented};
pub use normalize::{normalize, Denylist, DEFAULT_DENYLIST, MISSING_SENTINEL};
pub use species::{aggregate_species, SpeciesColumns, SpeciesSchema};
pub use summary::{summarize, SummaryColumns};

pub const CRATE_NAME: &str = "sdp-transform";

/// Output of one pass over a fetched feed.
#[derive(Debug, Clone)]
pub struct Prepared {
    pub raw: Table,
    pub processed: Table,
    pub report: DeriveReport,
}

/// Normalize then derive. `raw` keeps the normalized columns only.
pub fn prepare(records: &[RawRecord], denylist: &Denylist) -> Prepared {
    let raw = normalize(records, denylist);
    let (processed, report) = derive(raw.clone());
    info!(
        records = records.len(),
        columns = raw.width(),
        processed_columns = processed.width(),
        malformed = report.malformed_total(),
        "feed prepared"
    );
    Prepared {
        raw,
        processed,
        report,
    }
}
