//! Coordination for background tasks: one shutdown signal out, one
//! completion report back per task.

pub mod shutdown;

pub use shutdown::{
    wait_for_os_signal, GracefulShutdown, ShutdownError, ShutdownSignal, ShutdownToken,
};
