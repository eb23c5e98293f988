//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module   | Commands handled                 |
//! |----------|----------------------------------|
//! | `init`   | `Init`                           |
//! | `serve`  | `Serve`                          |
//! | `admin`  | `Status`, `Jobs`, `Dispatch`     |

pub mod admin;
pub mod init;
pub mod serve;

pub use admin::{DispatchArgs, cmd_dispatch, cmd_jobs, cmd_status};
pub use init::cmd_init;
pub use serve::cmd_serve;
