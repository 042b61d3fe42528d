//! # libstorage — pluggable storage pools for the daemon
//!
//! `libstorage` is the storage subsystem behind instance and custom volumes:
//! a pool/volume lifecycle engine programmed against the [`Driver`] trait,
//! with backends selected by name at pool-creation time.  The reference
//! backend maps pools and volumes onto a remote [LINSTOR][linstor] controller
//! that replicates them over DRBD.  It follows the project conventions
//! (Tokio async runtime, `tracing` for observability, `thiserror` for
//! structured errors).
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Core data model: `Volume`, volume/content types, size parsing. |
//! | [`error`] | [`StorageError`] enum covering all failure modes. |
//! | [`driver`] | [`Driver`] trait — the pool/volume operation contract. |
//! | [`revert`] | [`Reverter`] — compensating rollback for multi-step operations. |
//! | [`mount`] | Per-volume mount locks/refcounts and the mount syscall seam. |
//! | [`client`] | REST client for the remote LINSTOR controller. |
//! | [`backend`] | Driver implementations (LINSTOR). |
//!
//! [linstor]: https://linbit.com/linstor/

pub mod backend;
pub mod client;
pub mod driver;
pub mod error;
pub mod mount;
pub mod revert;
pub mod types;

// Re-export the most commonly used items at crate root for convenience.
pub use driver::{Driver, DriverSetup, VolumeFiller, new_driver, supported_drivers};
pub use error::StorageError;
pub use revert::Reverter;
pub use types::*;
