pub mod blob;
pub mod error;
pub mod metrics;
pub mod models;
pub mod store;
pub mod table;
pub mod wearable;
