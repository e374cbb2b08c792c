//! following into child processes
//!
//! A followed child gets the engine's options written into its address
//! space before its first thread ever runs, carried through an
//! environment variable the child-side loader picks up. The sequence is
//! allocate, write, protect, publish; any failure unwinds the remote
//! allocations so the child is either fully set up or untouched.

use std::io::Result;

use log::{debug, info, warn};
use nix::unistd::Pid;

use sysgate_common::config::{EngineConfig, FollowPolicy};

use crate::tracker::Prot;

/// operations on another process's address space. Production backs this
/// with process-handle memory syscalls; tests simulate it.
pub trait RemoteProcess: Send + Sync {
    fn allocate(&self, pid: Pid, size: u64, prot: Prot) -> Result<u64>;
    fn write(&self, pid: Pid, addr: u64, bytes: &[u8]) -> Result<()>;
    fn protect(&self, pid: Pid, addr: u64, size: u64, prot: Prot) -> Result<()>;
    fn free(&self, pid: Pid, addr: u64) -> Result<()>;
    /// swap the child's environment-block pointer; returns the old one.
    /// The old block is deliberately left allocated (the child may
    /// still hold references into it).
    fn swap_env_block(&self, pid: Pid, new_block: u64) -> Result<u64>;
    fn image_name(&self, pid: Pid) -> Option<String>;
}

/// should this child be instrumented at all.
pub fn should_follow(config: &EngineConfig, image: Option<&str>) -> bool {
    match config.follow_children {
        FollowPolicy::All => true,
        FollowPolicy::None => false,
        FollowPolicy::Configured => match image {
            Some(name) => config
                .follow_list
                .iter()
                .any(|entry| entry.eq_ignore_ascii_case(name)),
            None => false,
        },
    }
}

/// serialized environment entry the child-side loader reads.
fn child_env_entry(config: &EngineConfig) -> Vec<u8> {
    let mut entry = format!(
        "{}={}",
        config.child_options_var,
        config.serialize_for_child()
    )
    .into_bytes();
    entry.push(0);
    entry
}

/// push the engine's options into `pid` before its first thread runs.
///
/// All-or-nothing: a failure after the remote allocation frees it
/// again and reports the error; the caller leaves the child alone.
pub fn inject_child(remote: &dyn RemoteProcess, pid: Pid, config: &EngineConfig) -> Result<()> {
    let entry = child_env_entry(config);
    let size = entry.len() as u64;
    let block = remote.allocate(pid, size, Prot::READ | Prot::WRITE)?;
    debug!("child {}: options block at {:#x}+{:#x}", pid, block, size);

    let setup = remote
        .write(pid, block, &entry)
        .and_then(|_| remote.protect(pid, block, size, Prot::READ))
        .and_then(|_| remote.swap_env_block(pid, block));
    match setup {
        Ok(old_block) => {
            // the displaced block stays allocated in the child
            debug!("child {}: displaced env block {:#x} kept", pid, old_block);
            info!("following child process {}", pid);
            Ok(())
        }
        Err(e) => {
            if let Err(fe) = remote.free(pid, block) {
                warn!("child {}: rollback free of {:#x} failed: {}", pid, block, fe);
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct SimRemoteInner {
        next_addr: u64,
        allocs: HashMap<u64, Vec<u8>>,
        env_block: u64,
        fail_write: bool,
        fail_protect: bool,
    }

    struct SimRemote {
        inner: Mutex<SimRemoteInner>,
        image: &'static str,
    }

    impl SimRemote {
        fn new(image: &'static str) -> SimRemote {
            SimRemote {
                inner: Mutex::new(SimRemoteInner {
                    next_addr: 0x10_0000,
                    env_block: 0x5000,
                    ..Default::default()
                }),
                image,
            }
        }

        fn live_allocs(&self) -> usize {
            self.inner.lock().unwrap().allocs.len()
        }

        fn env_block(&self) -> u64 {
            self.inner.lock().unwrap().env_block
        }
    }

    impl RemoteProcess for SimRemote {
        fn allocate(&self, _pid: Pid, size: u64, _prot: Prot) -> Result<u64> {
            let mut g = self.inner.lock().unwrap();
            let addr = g.next_addr;
            g.next_addr += 0x1000;
            g.allocs.insert(addr, vec![0; size as usize]);
            Ok(addr)
        }
        fn write(&self, _pid: Pid, addr: u64, bytes: &[u8]) -> Result<()> {
            let mut g = self.inner.lock().unwrap();
            if g.fail_write {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    "write refused",
                ));
            }
            g.allocs.get_mut(&addr).unwrap().copy_from_slice(bytes);
            Ok(())
        }
        fn protect(&self, _pid: Pid, _addr: u64, _size: u64, _prot: Prot) -> Result<()> {
            if self.inner.lock().unwrap().fail_protect {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    "protect refused",
                ));
            }
            Ok(())
        }
        fn free(&self, _pid: Pid, addr: u64) -> Result<()> {
            self.inner.lock().unwrap().allocs.remove(&addr);
            Ok(())
        }
        fn swap_env_block(&self, _pid: Pid, new_block: u64) -> Result<u64> {
            let mut g = self.inner.lock().unwrap();
            let old = g.env_block;
            g.env_block = new_block;
            Ok(old)
        }
        fn image_name(&self, _pid: Pid) -> Option<String> {
            Some(self.image.to_string())
        }
    }

    #[test]
    fn follow_policy_decisions() {
        let mut cfg = EngineConfig::default();
        assert!(!should_follow(&cfg, Some("child.exe")));
        cfg.follow_children = FollowPolicy::All;
        assert!(should_follow(&cfg, None));
        cfg.follow_children = FollowPolicy::Configured;
        cfg.follow_list = vec!["Worker.exe".to_string()];
        assert!(should_follow(&cfg, Some("worker.exe")));
        assert!(!should_follow(&cfg, Some("other.exe")));
        assert!(!should_follow(&cfg, None));
    }

    #[test]
    fn successful_injection_swaps_env_block() {
        let remote = SimRemote::new("child.exe");
        let cfg = EngineConfig::default();
        inject_child(&remote, Pid::from_raw(99), &cfg).unwrap();
        assert_eq!(remote.live_allocs(), 1);
        assert_ne!(remote.env_block(), 0x5000);
        let g = remote.inner.lock().unwrap();
        let block = g.allocs.values().next().unwrap();
        let s = String::from_utf8_lossy(block);
        assert!(s.starts_with("SYSGATE_OPTIONS="));
    }

    #[test]
    fn failed_injection_rolls_back_allocation() {
        let remote = SimRemote::new("child.exe");
        remote.inner.lock().unwrap().fail_protect = true;
        let cfg = EngineConfig::default();
        assert!(inject_child(&remote, Pid::from_raw(99), &cfg).is_err());
        assert_eq!(remote.live_allocs(), 0);
        // the original env block is untouched
        assert_eq!(remote.env_block(), 0x5000);
    }

    #[test]
    fn failed_write_rolls_back_too() {
        let remote = SimRemote::new("child.exe");
        remote.inner.lock().unwrap().fail_write = true;
        let cfg = EngineConfig::default();
        assert!(inject_child(&remote, Pid::from_raw(99), &cfg).is_err());
        assert_eq!(remote.live_allocs(), 0);
    }
}
