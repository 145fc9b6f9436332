//! CLI command implementations.
//!
//! | Module   | Commands handled |
//! |----------|------------------|
//! | `run`    | `Run`            |
//! | `status` | `Status`         |
//! | `config` | `Config`         |

pub mod config;
pub mod run;
pub mod status;

pub use config::cmd_config;
pub use run::cmd_run;
pub use status::cmd_status;

/// A step failed.
pub const EXIT_FAILED: u8 = 1;
/// Configuration or internal error.
pub const EXIT_ERROR: u8 = 2;
/// Stopped by Ctrl-C.
pub const EXIT_INTERRUPTED: u8 = 130;
