use std::time::{Duration, Instant};

use super::balancer::LoadBalancer;

/// Tuning for a single upstream server, fixed at registration time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerOptions {
    /// Round-robin weight. A weight of `n` means the server is handed out
    /// `n` consecutive times before the cursor moves on. Zero is coerced to 1.
    pub weight: u32,

    /// Number of failed attempts within `fail_timeout` that take the server
    /// offline. Zero means the server never goes offline automatically.
    pub max_fails: u32,

    /// Window in which `max_fails` failures must accumulate, and, once the
    /// server is offline, the quarantine before it is re-admitted.
    pub fail_timeout: Duration,

    /// Backup servers are only selected while every primary is offline and
    /// never go offline themselves.
    pub is_backup: bool,
}

/// Event emitted when a server changes availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerEvent {
    Up,
    Down,
}

/// Which group a server belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Tier {
    Primary,
    Backup,
}

/// Internal per-server record. Mutated only under the balancer lock.
pub(crate) struct Server<T> {
    pub(crate) opts: ServerOptions,
    pub(crate) index: usize,
    pub(crate) is_down: bool,
    pub(crate) fail_counter: u32,
    // Dual purpose: while failures accumulate it marks the end of the
    // sliding window; once the server is down it marks the earliest
    // re-admit instant.
    pub(crate) fail_deadline: Option<Instant>,
    pub(crate) user_data: T,
}

impl<T> Server<T> {
    pub(crate) fn deadline_passed(&self, now: Instant) -> bool {
        self.fail_deadline.map_or(true, |deadline| now > deadline)
    }
}

/// Handle to a server selected by [`LoadBalancer::next`].
///
/// The handle stays valid for the lifetime of the balancer; availability
/// changes route back through the owning balancer, so handles can be used
/// from any thread.
pub struct ServerHandle<T> {
    pub(crate) lb: LoadBalancer<T>,
    pub(crate) tier: Tier,
    pub(crate) index: usize,
    pub(crate) user_data: T,
}

impl<T> Clone for ServerHandle<T>
where
    T: Clone,
{
    fn clone(&self) -> Self {
        Self {
            lb: self.lb.clone(),
            tier: self.tier,
            index: self.index,
            user_data: self.user_data.clone(),
        }
    }
}

impl<T> ServerHandle<T>
where
    T: Clone,
{
    /// The opaque payload attached at [`LoadBalancer::add`] time.
    pub fn user_data(&self) -> &T {
        &self.user_data
    }

    /// Whether this server belongs to the backup group.
    pub fn is_backup(&self) -> bool {
        matches!(self.tier, Tier::Backup)
    }

    /// Records a successful attempt: the failure counter is cleared and a
    /// down server is put back online. No-op for backup servers and servers
    /// with `max_fails == 0`.
    pub fn set_online(&self) {
        self.lb.mark_online(self.tier, self.index);
    }

    /// Records a failed attempt against the failure window. Reaching
    /// `max_fails` inside the window takes the server offline until
    /// `fail_timeout` elapses. No-op for backup servers and servers with
    /// `max_fails == 0`.
    pub fn set_offline(&self) {
        self.lb.mark_offline(self.tier, self.index);
    }
}
