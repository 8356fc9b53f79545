//! CLI command implementations.
//!
//! Each submodule owns one `Commands` variant:
//!
//! | Module   | Commands handled                                            |
//! |----------|-------------------------------------------------------------|
//! | `phase`  | `Phase` (start, complete, fail, skip, rerun, reset, status, report) |
//! | `deploy` | `Deploy`                                                    |
//! | `config` | `Config`                                                    |

pub mod config;
pub mod deploy;
pub mod phase;

pub use config::cmd_config;
pub use deploy::cmd_deploy;
pub use phase::cmd_phase;
