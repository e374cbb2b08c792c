//! syscall mediation layer for a dynamic instrumentation engine
//!
//! The engine traps every syscall an application thread issues;
//! this crate decides what happens next. Calls that affect the
//! engine's own correctness (memory layout, thread lifecycle,
//! contexts, child processes) are inspected, rewritten or vetoed
//! before the kernel sees them, and their results fixed up after.
//! Everything OS- and engine-specific sits behind traits so the
//! whole layer runs against simulated collaborators in tests.

pub mod args;
pub mod context;
pub mod inject;
pub mod mediator;
pub mod os;
pub mod postsys;
pub mod presys;
pub mod remote;
pub mod synch;
pub mod task;
pub mod tracker;
pub mod trampoline;
pub mod translate;

#[cfg(test)]
pub(crate) mod testutil;

pub use crate::args::{Abi, ParamView, SyscallArgs};
pub use crate::context::{Flavor, MachineContext};
pub use crate::mediator::{Decision, Mediator, ResultAction, TrapAction};
pub use crate::os::{CodeCacheMap, OsThreadOps};
pub use crate::remote::{GuestMemory, GuestMemoryExt, LocalMemory, RemotePtr};
pub use crate::synch::{SynchCtl, SynchOutcome};
pub use crate::task::{ThreadList, ThreadRecord};
pub use crate::tracker::{MemoryTracker, Prot, RegionInfo};
pub use crate::trampoline::{NativeDisposition, TrampolineManager};
