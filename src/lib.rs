pub mod app;
pub mod catalog;
pub mod chart;
pub mod cloud;
pub mod config;
pub mod credentials;
pub mod dashboard;
pub mod domain;
pub mod error;
pub mod fs_util;
pub mod notify;
pub mod object_store;
pub mod output;
pub mod query;
pub mod refine;
pub mod report;
pub mod table;
pub mod tui;
