pub mod cache;
pub mod classifier;
pub mod collections;
pub mod context;
pub mod correlator;
pub mod metrics;
pub mod models;
pub mod notify;
pub mod offers;
pub mod output;
pub mod stats;
pub mod stream;
pub mod utils;
pub mod watcher;
