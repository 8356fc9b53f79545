pub mod adapters;
pub mod config;
pub mod errors;
pub mod ledger;
pub mod logging;
pub mod pipeline;
pub mod report;
pub mod testgen;
pub mod util;
