//! Process-level concerns of a run: signals and the run lock.

pub mod run_lock;
pub mod shutdown;

pub use run_lock::RunLock;
pub use shutdown::ShutdownCoordinator;
