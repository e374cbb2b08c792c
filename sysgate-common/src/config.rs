//! engine configuration
//!
//! One `EngineConfig` is built at startup from a read-only option source
//! and passed by reference to each top-level component; nothing here is
//! mutated after init.

use log::warn;

use crate::consts;

/// read-only key/value provider, owned by the configuration subsystem.
pub trait OptionSource {
    fn get_bool(&self, name: &str) -> Option<bool>;
    fn get_uint(&self, name: &str) -> Option<u64>;
    fn get_string(&self, name: &str) -> Option<String>;
}

/// whether to inject into child processes created by the application.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FollowPolicy {
    All,
    None,
    Configured,
}

impl FollowPolicy {
    fn parse(s: &str) -> Option<FollowPolicy> {
        match s {
            "all" => Some(FollowPolicy::All),
            "none" => Some(FollowPolicy::None),
            "configured" => Some(FollowPolicy::Configured),
            _ => None,
        }
    }
}

/// what to do when a target thread cannot be suspended.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SynchFailure {
    /// continue without that thread; the default, since callers
    /// mirroring an application-issued suspend must not stall the
    /// whole process on one uncooperative thread.
    Ignore,
    Fatal,
}

/// policy when installing a trampoline over an already-hooked wrapper.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HookConflict {
    /// overwrite the third-party hook
    Squash,
    /// jump to the displaced hook after our handler
    Chain,
    /// fail the install
    Refuse,
}

impl HookConflict {
    fn parse(s: &str) -> Option<HookConflict> {
        match s {
            "squash" => Some(HookConflict::Squash),
            "chain" => Some(HookConflict::Chain),
            "refuse" => Some(HookConflict::Refuse),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// detected OS build number, fed to the syscall catalog.
    pub os_build: u32,
    /// iteration bound of the suspend-and-wait loop.
    pub synch_max_loops: u64,
    /// exhausting the loop bound: soft (continue untranslated) when
    /// false, process-fatal when true.
    pub synch_loop_fatal: bool,
    /// suspend failure policy.
    pub synch_failure: SynchFailure,
    pub follow_children: FollowPolicy,
    /// image names to follow under `FollowPolicy::Configured`.
    pub follow_list: Vec<String>,
    pub hook_conflict: HookConflict,
    /// allow application code to run natively outside the code cache.
    pub native_exec: bool,
    /// veto application attempts to close handles the engine tracks.
    pub protect_tracked_handles: bool,
    /// environment variable used to hand options to followed children.
    pub child_options_var: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            os_build: 501,
            synch_max_loops: consts::SYNCH_MAX_LOOPS_DEFAULT,
            synch_loop_fatal: false,
            synch_failure: SynchFailure::Ignore,
            follow_children: FollowPolicy::None,
            follow_list: Vec::new(),
            hook_conflict: HookConflict::Chain,
            native_exec: false,
            protect_tracked_handles: false,
            child_options_var: consts::CHILD_OPTIONS_VAR.to_string(),
        }
    }
}

impl EngineConfig {
    pub fn from_options(opts: &dyn OptionSource) -> EngineConfig {
        let mut cfg = EngineConfig::default();
        if let Some(n) = opts.get_uint("os_build") {
            cfg.os_build = n as u32;
        }
        if let Some(n) = opts.get_uint("synch_max_loops") {
            cfg.synch_max_loops = n;
        }
        if let Some(b) = opts.get_bool("synch_loop_fatal") {
            cfg.synch_loop_fatal = b;
        }
        if let Some(b) = opts.get_bool("synch_failure_fatal") {
            cfg.synch_failure = if b {
                SynchFailure::Fatal
            } else {
                SynchFailure::Ignore
            };
        }
        if let Some(s) = opts.get_string("follow_children") {
            match FollowPolicy::parse(&s) {
                Some(p) => cfg.follow_children = p,
                None => warn!("unknown follow_children value {:?}, keeping default", s),
            }
        }
        if let Some(s) = opts.get_string("follow_list") {
            cfg.follow_list = s
                .split(';')
                .filter(|x| !x.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(s) = opts.get_string("hook_conflict") {
            match HookConflict::parse(&s) {
                Some(p) => cfg.hook_conflict = p,
                None => warn!("unknown hook_conflict value {:?}, keeping default", s),
            }
        }
        if let Some(b) = opts.get_bool("native_exec") {
            cfg.native_exec = b;
        }
        if let Some(b) = opts.get_bool("protect_tracked_handles") {
            cfg.protect_tracked_handles = b;
        }
        if let Some(s) = opts.get_string("child_options_var") {
            cfg.child_options_var = s;
        }
        cfg
    }

    /// serialize the options a followed child needs, for its
    /// environment block.
    pub fn serialize_for_child(&self) -> String {
        let follow = match self.follow_children {
            FollowPolicy::All => "all",
            FollowPolicy::None => "none",
            FollowPolicy::Configured => "configured",
        };
        format!(
            "os_build={};synch_max_loops={};follow_children={};native_exec={}",
            self.os_build, self.synch_max_loops, follow, self.native_exec
        )
    }

    pub fn small_loop_bound(&self) -> u64 {
        std::cmp::max(1, self.synch_max_loops / consts::SYNCH_SMALL_LOOP_DIVISOR)
    }
}
