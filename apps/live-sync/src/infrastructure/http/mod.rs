//! Pull Channel
//!
//! REST endpoints polled on a fixed cadence by the
//! [`PollingScheduler`](crate::application::services::PollingScheduler).

pub mod endpoint;
pub mod extract;
mod fetcher;

pub use endpoint::{DEFAULT_HISTORY_DAYS, DEFAULT_MESSAGE_LIMIT, Endpoint};
pub use extract::{Extractor, TimestampSource};
pub use fetcher::{HttpFetcher, http_client};
