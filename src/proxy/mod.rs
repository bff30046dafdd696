pub mod backend;
pub mod health_check;
pub mod lb;
pub mod metrics;
pub mod policy;
pub mod router;
