//! Background job orchestration for repository processing.
//!
//! ## Overview
//!
//! Each operation (analyze, screenshot, short-description, readme, sync) has
//! its own durable channel in SQLite. Dispatch records a `pending` status for
//! the repository and enqueues a job; workers claim jobs under a lease, call
//! the GitHub source and the analyzer, write the artifact to the result cache
//! and move the status to `completed` or `failed`. Failed attempts are retried
//! with exponential backoff until the channel's attempt budget runs out.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐  HTTP  ┌─────────────────────────────────────────────────┐
//! │ Operator │ ─────> │  server.rs  (Router, ServerConfig, WorkerPool)  │
//! │  / CLI   │ <───── │    └─ api.rs  (route handlers, AppState)        │
//! └──────────┘        │         │                                       │
//!                     │         │ BatchDispatcher::dispatch_batch()     │
//!                     │         v                                       │
//!                     │  dispatcher.rs ──> queue.rs  (JobQueue, claim)  │
//!                     │                      │                          │
//!                     │                      │ Worker::run_once()       │
//!                     │                      v                          │
//!                     │  worker.rs  (Worker, Reaper, WorkerPool)        │
//!                     │         │                                       │
//!                     │         │ JobExecutor::execute()                │
//!                     │         v                                       │
//!                     │  executor.rs ──> github.rs + analyzer.rs        │
//!                     └─────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module     | Responsibility                                           |
//! |------------|----------------------------------------------------------|
//! | `models`   | Shared types: `EntityKey`, `Job`, `JobPayload`, states   |
//! | `db`       | SQLite access via `DbHandle` (thin `Arc<Mutex<_>>`)      |
//! | `context`  | `JobsContext`: stores and queues opened once at startup  |
//! | `status`   | `StatusTracker`: per-repository processing status        |
//! | `results`  | `ResultCache`: latest artifact per repository/operation  |
//! | `admin`    | Pause/resume/retry/remove and queue overviews            |

pub mod admin;
pub mod analyzer;
pub mod api;
pub mod context;
pub mod db;
pub mod dispatcher;
pub mod executor;
pub mod github;
pub mod models;
pub mod queue;
pub mod results;
pub mod server;
pub mod status;
pub mod worker;
