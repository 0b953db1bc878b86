// src/core/mod.rs

// The `core` module holds the scanning engine. Everything here is usable
// without the CLI: `runner` wires it together for the binary.

/// Targets, probe outcomes, proxy records and scan snapshots.
pub mod models;

/// The fingerprint prober: HTTP capability, header rules and the probe chain.
pub mod scanner;

/// Egress proxy rotation with permanent eviction.
pub mod proxy_pool;

/// Bounded-concurrency dispatch, sharding and proxy policy.
pub mod scheduler;

/// The shared scan aggregate.
pub mod state;

/// Periodic persistence of results and statistics.
pub mod checkpoint;

/// Target and proxy list sources.
pub mod sources;

/// External archiving of checkpoint files.
pub mod archive;

/// Target discovery through an external dork-search tool.
pub mod dork;
