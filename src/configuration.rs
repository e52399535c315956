//! Config for the arena behaviors
//!
//! This module provides configuration options for controlling the behavior of the arena
//! itself. Resource limits given to agents live in [`constraints`](crate::constraints).
//!
//! Configuration can be created programmatically using [`Configuration::new()`] or by reading
//! environment variables using [`Configuration::from_env()`].
//!
//! # Environment Variables
//!
//! The following environment variables can be used to override configuration values. All
//! values are optional. Flags are case-insensitive: set the value to `"true"` to enable one.
//!
//! - `ARENA_VERBOSE`: print match progress and results (default: `true`)
//! - `ARENA_LOG`: enable logging to a file (default: `false`)
//! - `ARENA_ALLOW_UNCONTAINED`: run agent commands without cgroup when cgroups are not
//!   available; only the deadline is then enforced (default: `false`)
//! - `ARENA_DEBUG_AGENT_STDERR`: print agent stderr for debugging (default: `false`)
//! - `ARENA_RUNTIME`: container runtime binary (default: `apptainer`)

/// Configuration for arena behaviors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Configuration {
    pub(crate) verbose: bool,
    pub(crate) log: bool,
    pub(crate) allow_uncontained: bool,
    pub(crate) debug_agent_stderr: bool,
    pub(crate) runtime: String,
}

impl Configuration {
    /// Create a new configuration with default parameters.
    ///
    /// By default:
    /// - The arena will print match progress to stdout.
    /// - Logging to file is disabled.
    /// - Agent commands must run in a cgroup.
    /// - Agent stderr output is disabled
    /// - `apptainer` is the container runtime
    pub fn new() -> Self {
        Self {
            verbose: true,
            log: false,
            allow_uncontained: false,
            debug_agent_stderr: false,
            runtime: "apptainer".to_string(),
        }
    }

    /// Create configuration from environment variables.
    ///
    /// Any unrecognized flag value (including unset) will result in using the default value.
    pub fn from_env() -> Self {
        fn get_env_flag(var: &str, default: bool) -> bool {
            match std::env::var(var) {
                Ok(val) => val.eq_ignore_ascii_case("true"),
                Err(_) => default,
            }
        }

        let defaults = Self::new();
        Self {
            verbose: get_env_flag("ARENA_VERBOSE", defaults.verbose),
            log: get_env_flag("ARENA_LOG", defaults.log),
            allow_uncontained: get_env_flag("ARENA_ALLOW_UNCONTAINED", defaults.allow_uncontained),
            debug_agent_stderr: get_env_flag(
                "ARENA_DEBUG_AGENT_STDERR",
                defaults.debug_agent_stderr,
            ),
            runtime: std::env::var("ARENA_RUNTIME")
                .ok()
                .filter(|r| !r.trim().is_empty())
                .unwrap_or(defaults.runtime),
        }
    }

    /// Enable or disable silent mode.
    pub fn with_verbose(mut self, value: bool) -> Self {
        self.verbose = value;
        self
    }

    /// Enable or disable logging to file.
    pub fn with_log(mut self, value: bool) -> Self {
        self.log = value;
        self
    }

    /// Enable or disable running agent commands without cgroup.
    pub fn with_allow_uncontained(mut self, value: bool) -> Self {
        self.allow_uncontained = value;
        self
    }

    /// Enable or disable agent stderr output (debug purposes only).
    pub fn with_debug_agent_stderr(mut self, value: bool) -> Self {
        self.debug_agent_stderr = value;
        self
    }

    /// Use another container runtime binary (path or name in `PATH`).
    pub fn with_runtime(mut self, runtime: impl Into<String>) -> Self {
        self.runtime = runtime.into();
        self
    }

    /// Whether progress is printed.
    pub fn verbose(&self) -> bool {
        self.verbose
    }

    /// Container runtime binary.
    pub fn runtime(&self) -> &str {
        &self.runtime
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self::new()
    }
}
