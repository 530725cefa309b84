//! Persistence
//!
//! Transactional writes to PostgreSQL: session lifecycle, page results with
//! their word frequencies and links, the metrics timeseries, and error
//! events. A page and everything derived from it commit in one transaction;
//! when the durable queue backend is active, the queue row's DONE transition
//! rides in the same transaction, making page persistence and queue
//! completion atomic.

mod schema;
mod store;

pub use store::{CrawlStore, PageRecord, SessionRow, SessionTotals};
