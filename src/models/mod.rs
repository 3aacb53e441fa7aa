pub mod abi;
pub mod collection;
pub mod common;
pub mod errors;
pub mod event;
pub mod log;
pub mod offer;
