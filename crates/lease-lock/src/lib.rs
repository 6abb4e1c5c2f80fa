//! Lease Lock
//!
//! The distributed-lock collaborator used for leader election. A lock is a
//! single `coordination.k8s.io/v1` Lease whose spec carries a
//! [`LeaderElectionRecord`].
//!
//! # Example
//!
//! ```no_run
//! use lease_lock::{KubeLeaseLock, LeaseLockTrait};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = kube::Client::try_default().await?;
//! let lock = KubeLeaseLock::new(client, "default", "my-operator-leader", "pod-a_1f2e", "my-operator");
//!
//! match lock.get().await {
//!     Ok(record) => println!("{lock} held by {}", record.holder_identity),
//!     Err(e) if e.is_not_found() => println!("{lock} not created yet"),
//!     Err(e) => return Err(e.into()),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - **Optimistic updates**: `update` replaces the object last read, so stale
//!   writes surface as conflicts
//! - **Advisory events**: `record_event` never fails the caller
//! - **Mocking**: `MockLeaseLock` (feature `test-util`) for unit tests

pub mod client;
pub mod error;
#[path = "trait.rs"]
pub mod lock_trait;
#[cfg(feature = "test-util")]
pub mod mock;
pub mod record;

pub use client::KubeLeaseLock;
pub use error::LeaseLockError;
pub use lock_trait::LeaseLockTrait;
#[cfg(feature = "test-util")]
pub use mock::MockLeaseLock;
pub use record::LeaderElectionRecord;
