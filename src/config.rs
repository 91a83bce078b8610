//! Server configuration (ambient stack, spec.md §9's scope note: ambient
//! concerns are carried even where a Non-goal excludes the outer surface).
//!
//! Environment variables with `clap`-parsed CLI overrides for the
//! `first-server` binary, generalizing the teacher's manual
//! `std::env::args()` walk in `rfdb_server.rs` into `clap::Parser`, in the
//! style `packages/gui-server` and `grafema-orchestrator` already use
//! `clap` for their own binaries.

use clap::Parser;

/// Runtime configuration for `first-server`. Every field can come from an
/// environment variable or be overridden on the command line; CLI flags
/// win when both are present (clap's default precedence).
#[derive(Parser, Debug, Clone)]
#[command(name = "first-server", about = "FIRST-core similarity-matching and annotation service")]
pub struct ServerConfig {
    /// Address the HTTP facade binds to.
    #[arg(long, env = "FIRST_BIND_ADDR", default_value = "127.0.0.1:4433")]
    pub bind_addr: String,

    /// `tracing-subscriber` env-filter directive (e.g. "info",
    /// "first_core=debug,tower_http=info").
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_filter: String,

    /// Maximum functions accepted in one `metadata_add`/`metadata_scan`
    /// batch (spec.md §4.10 request limits).
    #[arg(long, env = "FIRST_MAX_FUNCTIONS_PER_BATCH", default_value_t = 20)]
    pub max_functions_per_batch: usize,

    /// Maximum ids accepted in one `metadata_get`/`metadata_history` batch.
    #[arg(long, env = "FIRST_MAX_IDS_PER_BATCH", default_value_t = 20)]
    pub max_ids_per_batch: usize,

    /// Page size for `metadata_created`.
    #[arg(long, env = "FIRST_PAGE_SIZE", default_value_t = 20)]
    pub page_size: usize,
}

impl Default for ServerConfig {
    /// Parses from environment only (no CLI args) — used by tests and by
    /// anything constructing a `Facade` outside of `first-server`'s `main`.
    fn default() -> Self {
        Self::parse_from(["first-server"])
    }
}
