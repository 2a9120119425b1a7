pub mod quota_sync;
pub mod token_sweep;

pub use quota_sync::run_quota_sync_worker;
pub use token_sweep::run_token_sweep_worker;
