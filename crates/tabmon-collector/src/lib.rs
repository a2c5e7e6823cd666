//! Query dispatch, result sharing and metric derivation.
//!
//! Tasks are routed through an [`registry::ExecutorRegistry`] to the
//! [`executor`] of their backend, which bounds parallelism, reuses
//! connections and serves every task asking the same query on the same
//! connection from one physical execution. Each task's share of the rows
//! is narrowed by [`reconcile::reconcile`] and turned into metrics by
//! [`derive`]. [`cycle::Collector`] ties these together for one collection
//! cycle and feeds the [`sink`] traits.

pub mod cycle;
pub mod derive;
pub mod error;
pub mod executor;
pub mod reconcile;
pub mod registry;
pub mod sink;
pub mod task;


pub use error::{TaskError, TaskErrorKind};
pub use executor::{ExecutorHandle, TaskResult};
pub use registry::ExecutorRegistry;
pub use task::{DataPoint, Expected, Task};
