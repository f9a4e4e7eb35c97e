//! CLI command implementations.
//!
//! | Module   | Commands handled |
//! |----------|------------------|
//! | `run`    | `Run`            |
//! | `serve`  | `Serve`          |
//! | `bridge` | `Bridge`         |
//! | `config` | `Config`         |

pub mod bridge;
pub mod config;
pub mod run;
pub mod serve;

pub use bridge::cmd_bridge;
pub use config::cmd_config;
pub use run::cmd_run;
pub use serve::cmd_serve;
