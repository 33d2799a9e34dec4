pub mod app;
pub mod archive_db;
pub mod archiver;
pub mod catalog;
pub mod clock;
pub mod completeness;
pub mod config;
pub mod domain;
pub mod error;
pub mod extraction;
pub mod finalizer;
pub mod fs_util;
pub mod lifecycle;
pub mod output;
pub mod registration;
pub mod scan;
pub mod services;
pub mod storage;
pub mod store;
