//! Client side of the board: typed HTTP access, a query cache with stale
//! response suppression, chat polling and task filter view state.

pub mod cache;
pub mod filters;
pub mod http;
pub mod poller;

pub use cache::{FetchTicket, QueryCache, QueryKey};
pub use filters::FilterUpdate;
pub use http::ApiClient;
pub use poller::{ChatPoller, ChatSnapshot, ChatSource, PollIntervals};
