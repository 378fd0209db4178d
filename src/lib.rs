//! Commission split engine for the affiliate program.
//!
//! Orders are split across up to three affiliate levels and two fixed
//! managers; the split is sent with the payment creation request and the
//! result is reconciled through idempotent webhooks or a polling fallback.

pub mod api;
pub mod config;
pub mod error;
pub mod gateway;
pub mod network;
pub mod persist;
pub mod polling;
pub mod rate_limit;
pub mod referral;
pub mod responses;
pub mod service;
pub mod split;
pub mod store;
pub mod types;
pub mod webhook;

pub use api::{AppState, init_router};
pub use config::Config;
pub use error::ServiceError;
pub use service::CommissionService;
pub use split::{SplitCalculator, SplitResult, share_of};
pub use store::init_pool;
