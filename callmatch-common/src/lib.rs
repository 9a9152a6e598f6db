pub mod metrics;
pub mod retry;
pub mod ringqueue;
