//! The task system: owned schedulers, registries and the pump entry points.
mod builder;
pub use builder::{Builder, Phase};
pub(crate) use builder::{RuntimeConfig, ThreadNameFn};
#[cfg(test)]
pub(crate) use builder::default_thread_name_fn;

mod registry;
pub use registry::{ActiveTasks, TaskSnapshot};
pub(crate) use registry::TaskEntry;

mod spawn;
pub use spawn::TaskBuilder;

mod system;
pub use system::{DrainReport, TaskSystem};
