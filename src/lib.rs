pub mod allocation;
pub mod api;
pub mod blobber;
pub mod cache;
pub mod chain;
pub mod codec;
pub mod commit;
pub mod config;
pub mod consensus;
pub mod context;
pub mod crypto;
pub mod download;
pub mod error;
pub mod events;
pub mod fs;
pub mod logging;
pub mod marker;
pub mod paths;
pub mod progress;
pub mod retry;
pub mod stopper;
pub mod test_utils;
pub mod upload;
