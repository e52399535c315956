//! Resource constraints given to agents.
//!
//! This module provides the per-agent limits applied to every sandbox (memory, CPU share,
//! network, filesystem, user, process count) and the timing limits applied to every request
//! (move timeout, validation timeout, latency ceiling), plus how many matches the arena may
//! run at once.
//!
//! # Overview
//!
//! The main entry point is the [`ConstraintsBuilder`] struct, which uses a builder pattern
//! to configure limits. Once built, a [`Constraints`] object is handed to the
//! [`Arena`](crate::arena::Arena).
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use c4_arena::constraints::ConstraintsBuilder;
//!
//! let constraints = ConstraintsBuilder::new()
//!     .with_ram_per_agent(1_024)
//!     .with_cpus_per_agent(1.0)
//!     .with_action_timeout(Duration::from_secs(2))
//!     .with_max_concurrent_matches(4)
//!     .build()
//!     .unwrap();
//! ```
//!
//! You may also construct constraints from environment variables using
//! [`ConstraintsBuilder::from_env()`] for runtime configurability.

use std::{env, time::Duration};

use anyhow::{bail, Context};
use tracing::warn;

use crate::sandbox::{FilesystemMode, NetworkAccess, SandboxOptions};

const MB: u64 = 1024 * 1024;

/// A builder for the resource constraints of agents.
///
/// Every limit left unset takes the production default: 512MB and half a CPU per agent, no
/// network, read-only image, user 100, 100 processes, 5s per move, 1s per validation probe,
/// no latency ceiling, and one match per two physical CPUs.
///
/// # Examples
///
/// ```
/// # use std::time::Duration;
/// # use c4_arena::constraints::ConstraintsBuilder;
///
/// let constraints = ConstraintsBuilder::new()
///     .with_ram_per_agent(256)
///     .with_max_total_ram(4_096)
///     .with_validation_timeout(Duration::from_millis(500))
///     .build();
/// ```
#[derive(Debug, Default, Clone)]
pub struct ConstraintsBuilder {
    total_ram: Option<u64>,
    agent_ram: Option<u64>,
    cpus_per_agent: Option<f64>,
    network: Option<bool>,
    writable: Option<bool>,
    user_id: Option<u32>,
    max_pids: Option<i64>,
    action_time: Option<Duration>,
    validation_time: Option<Duration>,
    max_latency: Option<Duration>,
    max_concurrent_matches: Option<usize>,
}

impl ConstraintsBuilder {
    /// Creates a new `ConstraintsBuilder` with every limit at its default.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new `ConstraintsBuilder` configured from environment variables.
    ///
    /// Read environment variables are:
    /// - `MAX_TOTAL_RAM` (u64): RAM available to all agents, in MB
    /// - `RAM_PER_AGENT` (u64): RAM per agent, in MB
    /// - `CPUS_PER_AGENT` (f64): CPU share per agent, e.g. `0.5`
    /// - `AGENT_NETWORK` (bool): give agents network access
    /// - `AGENT_WRITABLE` (bool): development sandboxes (writable, fully contained)
    /// - `AGENT_USER_ID` (u32): user agent commands run as
    /// - `AGENT_MAX_PIDS` (i64): processes per agent command
    /// - `ACTION_TIMEOUT_MS` (u64): timeout per move in milliseconds
    /// - `VALIDATION_TIMEOUT_MS` (u64): timeout per validation probe in milliseconds
    /// - `MAX_MOVE_LATENCY_MS` (u64): latency ceiling checked by `check_latency`
    /// - `MAX_CONCURRENT_MATCHES` (usize): matches run at once by `play_all`
    ///
    /// Unset or unparsable variables leave the default.
    #[must_use]
    pub fn from_env() -> Self {
        fn parse<T: std::str::FromStr>(var: &str) -> Option<T> {
            env::var(var).ok()?.trim().parse().ok()
        }

        fn parse_flag(var: &str) -> Option<bool> {
            env::var(var)
                .ok()
                .map(|val| val.trim().eq_ignore_ascii_case("true"))
        }

        fn parse_duration_millis(var: &str) -> Option<Duration> {
            parse::<u64>(var).map(Duration::from_millis)
        }

        ConstraintsBuilder {
            total_ram: parse("MAX_TOTAL_RAM"),
            agent_ram: parse("RAM_PER_AGENT"),
            cpus_per_agent: parse("CPUS_PER_AGENT"),
            network: parse_flag("AGENT_NETWORK"),
            writable: parse_flag("AGENT_WRITABLE"),
            user_id: parse("AGENT_USER_ID"),
            max_pids: parse("AGENT_MAX_PIDS"),
            action_time: parse_duration_millis("ACTION_TIMEOUT_MS"),
            validation_time: parse_duration_millis("VALIDATION_TIMEOUT_MS"),
            max_latency: parse_duration_millis("MAX_MOVE_LATENCY_MS"),
            max_concurrent_matches: parse("MAX_CONCURRENT_MATCHES"),
        }
    }

    /// Sets the RAM available across all agents (in MB). Defaults to the host's available
    /// memory.
    #[must_use]
    pub fn with_max_total_ram(self, max: u64) -> Self {
        Self {
            total_ram: Some(max),
            ..self
        }
    }

    /// Sets the maximum RAM available per agent (in MB).
    #[must_use]
    pub fn with_ram_per_agent(self, max: u64) -> Self {
        Self {
            agent_ram: Some(max),
            ..self
        }
    }

    /// Sets the CPU share of each agent, in CPUs.
    #[must_use]
    pub fn with_cpus_per_agent(self, cpus: f64) -> Self {
        Self {
            cpus_per_agent: Some(cpus),
            ..self
        }
    }

    /// Gives agents network access (disabled by default).
    #[must_use]
    pub fn with_network(self, enabled: bool) -> Self {
        Self {
            network: Some(enabled),
            ..self
        }
    }

    /// Runs agents in development sandboxes: writable and fully contained.
    #[must_use]
    pub fn with_writable(self, writable: bool) -> Self {
        Self {
            writable: Some(writable),
            ..self
        }
    }

    /// Sets the user agent commands run as. Root is refused by [`build`](Self::build).
    #[must_use]
    pub fn with_user_id(self, user_id: u32) -> Self {
        Self {
            user_id: Some(user_id),
            ..self
        }
    }

    /// Sets the maximum number of processes per agent command.
    #[must_use]
    pub fn with_max_pids(self, max: i64) -> Self {
        Self {
            max_pids: Some(max),
            ..self
        }
    }

    /// Sets the maximum duration allowed for a single move.
    #[must_use]
    pub fn with_action_timeout(self, duration: Duration) -> Self {
        Self {
            action_time: Some(duration),
            ..self
        }
    }

    /// Sets the budget of each validation probe.
    #[must_use]
    pub fn with_validation_timeout(self, duration: Duration) -> Self {
        Self {
            validation_time: Some(duration),
            ..self
        }
    }

    /// Sets the latency ceiling used by [`Arena::check_latency`](crate::arena::Arena::check_latency).
    #[must_use]
    pub fn with_max_latency(self, duration: Duration) -> Self {
        Self {
            max_latency: Some(duration),
            ..self
        }
    }

    /// Sets how many matches may run at once.
    #[must_use]
    pub fn with_max_concurrent_matches(self, max: usize) -> Self {
        Self {
            max_concurrent_matches: Some(max),
            ..self
        }
    }

    /// Consumes the builder and returns the constructed `Constraints`.
    ///
    /// # Errors
    ///
    /// Returns Error when Constraints are impossible, e.g. total RAM < agent RAM, a zero
    /// timeout, or agents running as root.
    pub fn build(self) -> anyhow::Result<Constraints> {
        let to_bytes = |mb: u64| {
            mb.checked_mul(MB)
                .with_context(|| format!("RAM size of {mb}MB does not fit in bytes"))
        };
        let total_ram = match self.total_ram {
            Some(mb) => to_bytes(mb)?,
            None => {
                let mut sys = sysinfo::System::new();
                sys.refresh_memory();
                sys.available_memory()
            }
        };
        let agent_ram = to_bytes(self.agent_ram.unwrap_or(512))?;

        if agent_ram == 0 {
            bail!("Agent RAM size must be positive");
        }
        if total_ram < agent_ram {
            bail!(
                "Agent RAM size ({}MB) is greater than total RAM ({}MB)",
                agent_ram / MB,
                total_ram / MB
            );
        }

        let logical_cpus = num_cpus::get();
        let cpus_per_agent = self.cpus_per_agent.unwrap_or(0.5);
        if cpus_per_agent.is_nan() || cpus_per_agent <= 0.0 || cpus_per_agent > logical_cpus as f64 {
            bail!("CPUs per agent ({cpus_per_agent}) must be in (0, {logical_cpus}]");
        }

        let user_id = self.user_id.unwrap_or(100);
        if user_id == 0 {
            bail!("Agents must not run as root");
        }

        let max_pids = self.max_pids.unwrap_or(100);
        if max_pids <= 0 {
            bail!("Max pids per agent must be positive, got {max_pids}");
        }

        let action_time = self.action_time.unwrap_or(Duration::from_secs(5));
        let validation_time = self.validation_time.unwrap_or(Duration::from_secs(1));
        if action_time.is_zero() || validation_time.is_zero() {
            bail!("Timeouts must be positive");
        }

        // Two agents per match. By default, use half the physical CPUs since each agent
        // usually gets at least half a CPU.
        let requested = self
            .max_concurrent_matches
            .unwrap_or_else(|| num_cpus::get_physical() / 2)
            .max(1);
        let fitting = usize::try_from(total_ram / agent_ram.saturating_mul(2))
            .unwrap_or(usize::MAX)
            .max(1);
        if fitting < requested {
            warn!(
                "only {fitting} concurrent matches fit in {}MB of RAM, {requested} requested",
                total_ram / MB
            );
        }

        Ok(Constraints {
            total_ram,
            agent_ram,
            cpus_per_agent,
            network: self.network.unwrap_or(false),
            writable: self.writable.unwrap_or(false),
            user_id,
            max_pids,
            action_time,
            validation_time,
            max_latency: self.max_latency,
            max_concurrent_matches: requested.min(fitting),
        })
    }
}

/// Obtained using `ConstraintsBuilder`
#[derive(Clone, Debug, PartialEq)]
pub struct Constraints {
    pub(crate) total_ram: u64,
    pub(crate) agent_ram: u64,
    pub(crate) cpus_per_agent: f64,
    pub(crate) network: bool,
    pub(crate) writable: bool,
    pub(crate) user_id: u32,
    pub(crate) max_pids: i64,
    pub(crate) action_time: Duration,
    pub(crate) validation_time: Duration,
    pub(crate) max_latency: Option<Duration>,
    pub(crate) max_concurrent_matches: usize,
}

impl Constraints {
    /// create a ConstraintsBuilder
    pub fn builder() -> ConstraintsBuilder {
        ConstraintsBuilder::new()
    }

    /// Sandbox settings for one agent.
    pub fn sandbox_options(&self) -> SandboxOptions {
        SandboxOptions {
            memory_limit: self.agent_ram,
            cpu_quota: self.cpus_per_agent,
            network: if self.network {
                NetworkAccess::Enabled
            } else {
                NetworkAccess::Disabled
            },
            filesystem: if self.writable {
                FilesystemMode::Writable
            } else {
                FilesystemMode::ReadOnly
            },
            user_id: self.user_id,
            max_pids: self.max_pids,
        }
    }

    /// Budget of one move.
    pub fn action_timeout(&self) -> Duration {
        self.action_time
    }

    /// Budget of one validation probe.
    pub fn validation_timeout(&self) -> Duration {
        self.validation_time
    }

    /// Latency ceiling, if any.
    pub fn max_latency(&self) -> Option<Duration> {
        self.max_latency
    }

    /// Matches run at once.
    pub fn max_concurrent_matches(&self) -> usize {
        self.max_concurrent_matches
    }

    /// RAM available to all agents, in bytes.
    pub fn total_ram(&self) -> u64 {
        self.total_ram
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> ConstraintsBuilder {
        ConstraintsBuilder::new().with_max_total_ram(8_192)
    }

    #[test]
    fn defaults_are_locked_down() {
        let constraints = builder().build().unwrap();
        let options = constraints.sandbox_options();
        assert_eq!(options, SandboxOptions::default());
        assert_eq!(constraints.action_timeout(), Duration::from_secs(5));
        assert_eq!(constraints.validation_timeout(), Duration::from_secs(1));
        assert_eq!(constraints.max_latency(), None);
        assert!(constraints.max_concurrent_matches() >= 1);
    }

    #[test]
    fn overrides_reach_sandbox_options() {
        let options = builder()
            .with_ram_per_agent(256)
            .with_cpus_per_agent(1.0)
            .with_network(true)
            .with_writable(true)
            .with_user_id(1000)
            .build()
            .unwrap()
            .sandbox_options();
        assert_eq!(options.memory_limit, 256 * MB);
        assert_eq!(options.cpu_quota, 1.0);
        assert_eq!(options.network, NetworkAccess::Enabled);
        assert_eq!(options.filesystem, FilesystemMode::Writable);
        assert_eq!(options.user_id, 1000);
    }

    #[test]
    fn impossible_constraints_are_refused() {
        assert!(builder().with_ram_per_agent(100_000).build().is_err());
        assert!(builder().with_user_id(0).build().is_err());
        assert!(builder().with_cpus_per_agent(0.0).build().is_err());
        assert!(builder().with_cpus_per_agent(f64::NAN).build().is_err());
        assert!(builder().with_action_timeout(Duration::ZERO).build().is_err());
        assert!(builder().with_max_pids(0).build().is_err());
    }

    #[test]
    fn oversized_ram_is_refused() {
        assert!(ConstraintsBuilder::new()
            .with_max_total_ram(u64::MAX)
            .build()
            .is_err());
        assert!(builder().with_ram_per_agent(u64::MAX).build().is_err());
    }

    #[test]
    fn concurrency_is_bounded_by_ram() {
        let constraints = ConstraintsBuilder::new()
            .with_max_total_ram(2_048)
            .with_ram_per_agent(512)
            .with_max_concurrent_matches(16)
            .build()
            .unwrap();
        assert_eq!(constraints.max_concurrent_matches(), 2);

        let constraints = builder().with_max_concurrent_matches(0).build().unwrap();
        assert_eq!(constraints.max_concurrent_matches(), 1);
    }
}
