pub mod aggregator;
pub mod api;
pub mod classifier;
pub mod config;
pub mod db;
pub mod disburse;
pub mod error;
pub mod ledger;
pub mod listener;
pub mod models;
pub mod notify;
pub mod rpc;
pub mod units;
