use std::time::Duration;

/// Default idle timeout: 2000ms, matching the pool's historical default.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(2000);

/// Pool-wide tuning knobs.
///
/// `capacity` is advisory only (see the crate's design notes): it is
/// tracked but never enforced. `max_idle_per_target` supplements the
/// original design with the same safety valve most keep-alive pools carry;
/// leave it at `usize::MAX` to reproduce "no cap" behavior exactly.
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Config {
    /// How long an idle connection may sit before the reaper evicts it.
    /// Setting this to `Duration::ZERO` disables keep-alive entirely:
    /// `Pool::can_keepalive` becomes `false` and `return_connection` simply
    /// closes connections instead of pooling them.
    pub idle_timeout: Duration,
    /// Advisory upper bound on `Pool::stats().outstanding`. Never enforced.
    pub capacity: usize,
    /// Per-target cap on idle (not in-flight) connections. `usize::MAX`
    /// disables the cap.
    pub max_idle_per_target: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            capacity: usize::MAX,
            max_idle_per_target: usize::MAX,
        }
    }
}

impl Config {
    pub fn can_keepalive(&self) -> bool {
        self.idle_timeout > Duration::ZERO
    }
}
