//! Paginated delta pull from the remote store.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

use fieldsync_common::{EntityType, Result, ServerRecord};
use fieldsync_storage::{RangeFilter, RemoteClient, RemoteError};

/// Outcome of pulling one table slice.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PullReport {
    /// Rows handed to the sink.
    pub rows: usize,
    /// Pages fetched.
    pub pages: usize,
    /// Rows that could not be decoded and were skipped.
    pub malformed: usize,
    /// Query failure that stopped paging early.
    pub interrupted: Option<RemoteError>,
}

impl PullReport {
    /// Whether every page was fetched.
    pub fn is_complete(&self) -> bool {
        self.interrupted.is_none()
    }
}

/// Fetches server changes page by page in ascending `updated_at` order.
pub struct DeltaPuller {
    remote: Arc<dyn RemoteClient>,
    page_size: usize,
}

impl DeltaPuller {
    pub fn new(remote: Arc<dyn RemoteClient>, page_size: usize) -> Self {
        Self {
            remote,
            page_size: page_size.max(1),
        }
    }

    /// Filter for one layer's features.
    ///
    /// A layer without cached records is bootstrapped with a full pull;
    /// otherwise only rows changed at or after the checkpoint are requested.
    pub fn layer_filter(
        layer_id: &str,
        cached_records: u64,
        checkpoint: Option<DateTime<Utc>>,
    ) -> RangeFilter {
        let filter = RangeFilter::all().for_layer(layer_id);
        if cached_records == 0 {
            filter
        } else {
            filter.updated_since(checkpoint)
        }
    }

    /// Pull every page matching `filter`, passing each decoded record to `sink`.
    ///
    /// A remote failure stops paging and is reported in the returned
    /// [`PullReport`]; errors from `sink` are propagated unchanged.
    pub async fn pull<F>(&self, table: EntityType, filter: &RangeFilter, mut sink: F) -> Result<PullReport>
    where
        F: FnMut(ServerRecord) -> Result<()>,
    {
        let mut report = PullReport::default();
        let mut offset = 0;

        loop {
            let page = match self
                .remote
                .query_range(table, filter, offset, self.page_size)
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    warn!("Pull of {} stopped at offset {}: {}", table.table(), offset, e);
                    report.interrupted = Some(e);
                    break;
                }
            };
            report.pages += 1;
            let fetched = page.len();

            for row in page {
                match ServerRecord::from_row(row) {
                    Ok(record) => {
                        sink(record)?;
                        report.rows += 1;
                    }
                    Err(e) => {
                        warn!("Skipping malformed {} row: {}", table.as_str(), e);
                        report.malformed += 1;
                    }
                }
            }

            if fetched < self.page_size {
                break;
            }
            offset += fetched;
        }

        debug!(
            "Pulled {} {} rows in {} pages",
            report.rows,
            table.as_str(),
            report.pages
        );
        Ok(report)
    }
}
