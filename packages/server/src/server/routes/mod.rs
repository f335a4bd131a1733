// HTTP routes
pub mod approvals;
pub mod audit;
pub mod health;
pub mod jobs;
pub mod stream;
pub mod webhooks;

pub use health::*;
