#![no_std]

use log::LevelFilter;
use phf;

use esxboot_core::policy::Policy;

include!(concat!(env!("OUT_DIR"), "/config.rs"));

// Wrap in a struct for documentation and autocomplete. Also makes it easier to eventually support
// a kernel command line.

/// Build-time configuration for the loader and kernel, baked in from
/// `esxboot.toml` at workspace root.
pub struct Config;

impl Config {
    pub fn max_processors() -> usize {
        MAX_PROCESSORS
    }

    pub fn log_settings() -> &'static phf::Map<&'static str, LevelFilter> {
        &MAX_LOG_LEVELS
    }

    /// The order in which [`esxboot_core::policy::select_policy`]'s
    /// preference list should be tried, most-preferred first. Exists so a
    /// platform can reorder or disable a policy without touching the
    /// relocator itself.
    pub fn rts_policy_preference() -> &'static [Policy] {
        RTS_POLICY_PREFERENCE
    }

    /// Size in bytes of the virtual address window the loader reserves for
    /// relocated runtime services on the given architecture (e.g.
    /// `"x86_64"`), if the architecture has a configured default.
    pub fn default_virtual_window_size(arch: &str) -> Option<u64> {
        VIRTUAL_WINDOW_SIZES.get(arch).copied()
    }
}
