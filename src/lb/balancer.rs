use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::server::{Server, ServerEvent, ServerHandle, ServerOptions, Tier};

/// Errors returned by [`LoadBalancer::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BalancerError {
    #[error("fail timeout must be non-zero when max fails is set")]
    MissingFailTimeout,
}

/// Callback invoked whenever a server transitions between up and down.
///
/// Handlers run on the thread that caused the transition, after the balancer
/// lock has been released. They must not call back into the balancer
/// synchronously and should return quickly.
pub type EventHandler<T> = Box<dyn Fn(ServerEvent, &ServerHandle<T>) + Send + Sync>;

/// Weighted round-robin selector over a primary and a backup server group.
///
/// Weights are realised as bursts: a server with weight 3 is returned by
/// three consecutive [`next`](Self::next) calls before the cursor advances.
/// Primary servers accumulate failures through
/// [`ServerHandle::set_offline`] and are quarantined for their fail timeout
/// once `max_fails` is reached; backup servers are only handed out while no
/// primary is available and carry no failure state at all.
///
/// Cloning is cheap and clones share all state, so a balancer can be handed
/// to any number of tasks or threads.
pub struct LoadBalancer<T> {
    inner: Arc<Mutex<Inner<T>>>,
    event_handler: Arc<RwLock<Option<EventHandler<T>>>>,
}

struct Inner<T> {
    primary: ServerGroup<T>,
    backup: ServerGroup<T>,
    primary_online: usize,
}

/// One tier of servers plus the round-robin cursor walking it.
struct ServerGroup<T> {
    servers: Vec<Server<T>>,
    curr_idx: usize,
    curr_weight: u32,
}

impl<T> ServerGroup<T> {
    fn new() -> Self {
        Self {
            servers: Vec::new(),
            curr_idx: 0,
            curr_weight: 0,
        }
    }

    fn advance(&mut self) {
        self.curr_idx += 1;
        if self.curr_idx >= self.servers.len() {
            self.curr_idx = 0;
        }
        self.curr_weight = 0;
    }
}

impl<T> Clone for LoadBalancer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            event_handler: Arc::clone(&self.event_handler),
        }
    }
}

impl<T> Default for LoadBalancer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LoadBalancer<T> {
    /// Creates an empty balancer.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                primary: ServerGroup::new(),
                backup: ServerGroup::new(),
                primary_online: 0,
            })),
            event_handler: Arc::new(RwLock::new(None)),
        }
    }

    /// Installs the availability event sink, replacing any previous one.
    pub fn set_event_handler<F>(&self, handler: F)
    where
        F: Fn(ServerEvent, &ServerHandle<T>) + Send + Sync + 'static,
    {
        let mut guard = self
            .event_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *guard = Some(Box::new(handler));
    }

    /// Registers a new server carrying the given payload.
    ///
    /// A weight of zero is coerced to 1. Backup servers and servers with
    /// `max_fails == 0` have both fail fields cleared, since they never go
    /// offline. Newly added primary servers count as online immediately.
    pub fn add(&self, mut opts: ServerOptions, user_data: T) -> Result<(), BalancerError> {
        if !opts.is_backup && opts.max_fails > 0 && opts.fail_timeout.is_zero() {
            return Err(BalancerError::MissingFailTimeout);
        }

        if opts.weight == 0 {
            opts.weight = 1;
        }
        if opts.is_backup || opts.max_fails == 0 {
            opts.max_fails = 0;
            opts.fail_timeout = Duration::ZERO;
        }

        let mut inner = self.lock();
        let group = if opts.is_backup {
            &mut inner.backup
        } else {
            &mut inner.primary
        };
        let index = group.servers.len();
        group.servers.push(Server {
            opts,
            index,
            is_down: false,
            fail_counter: 0,
            fail_deadline: None,
            user_data,
        });
        if !opts.is_backup {
            inner.primary_online += 1;
        }

        debug!(
            index,
            weight = opts.weight,
            max_fails = opts.max_fails,
            backup = opts.is_backup,
            "server registered"
        );
        Ok(())
    }

    /// Number of online servers. Backup servers count as always online and
    /// are included only when `include_backup` is set.
    pub fn online_count(&self, include_backup: bool) -> usize {
        let inner = self.lock();
        let mut count = inner.primary_online;
        if include_backup {
            count += inner.backup.servers.len();
        }
        count
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> LoadBalancer<T>
where
    T: Clone,
{
    /// Returns the next available server, or `None` when both groups are
    /// empty or every primary is still inside its fail timeout and no backup
    /// exists.
    ///
    /// Servers whose fail timeout has elapsed are re-admitted on the way:
    /// either in a full sweep when no primary is online, or in place when the
    /// cursor reaches them. Re-admission does not restart the cursor.
    pub fn next(&self) -> Option<ServerHandle<T>> {
        let now = Instant::now();
        let mut notify_up: Vec<(usize, T)> = Vec::new();
        let mut selected: Option<(Tier, usize, T)> = None;

        {
            let mut inner = self.lock();
            let inner = &mut *inner;

            // With every primary offline, sweep for servers whose quarantine
            // has expired before giving up on the tier.
            if inner.primary_online == 0 {
                for srv in inner.primary.servers.iter_mut() {
                    if srv.is_down && srv.deadline_passed(now) {
                        srv.is_down = false;
                        srv.fail_counter = 0;
                        inner.primary_online += 1;
                        notify_up.push((srv.index, srv.user_data.clone()));
                    }
                }
            }

            if inner.primary_online > 0 {
                // Terminates because at least one primary is up.
                loop {
                    let idx = inner.primary.curr_idx;
                    let srv = &mut inner.primary.servers[idx];

                    if srv.is_down && srv.deadline_passed(now) {
                        srv.is_down = false;
                        notify_up.push((idx, srv.user_data.clone()));
                        inner.primary_online += 1;
                    }

                    let srv = &inner.primary.servers[idx];
                    if !srv.is_down && inner.primary.curr_weight < srv.opts.weight {
                        selected = Some((Tier::Primary, idx, srv.user_data.clone()));
                        inner.primary.curr_weight += 1;
                        break;
                    }

                    inner.primary.advance();
                }
            }

            if selected.is_none() && !inner.backup.servers.is_empty() {
                loop {
                    let idx = inner.backup.curr_idx;
                    let srv = &inner.backup.servers[idx];

                    if inner.backup.curr_weight < srv.opts.weight {
                        selected = Some((Tier::Backup, idx, srv.user_data.clone()));
                        inner.backup.curr_weight += 1;
                        break;
                    }

                    inner.backup.advance();
                }
            }
        }

        for (index, user_data) in notify_up {
            info!(index, "server re-admitted after fail timeout");
            self.raise_event(ServerEvent::Up, &self.handle(Tier::Primary, index, user_data));
        }

        selected.map(|(tier, index, user_data)| self.handle(tier, index, user_data))
    }

    /// Clears the failure counter and re-admits the server if it was down.
    pub(crate) fn mark_online(&self, tier: Tier, index: usize) {
        if tier == Tier::Backup {
            return;
        }

        let mut notify_up: Option<T> = None;
        {
            let mut inner = self.lock();
            let inner = &mut *inner;
            let Some(srv) = inner.primary.servers.get_mut(index) else {
                return;
            };
            if srv.opts.max_fails == 0 {
                return;
            }

            srv.fail_counter = 0;
            if srv.is_down {
                srv.is_down = false;
                inner.primary_online += 1;
                notify_up = Some(srv.user_data.clone());
            }
        }

        if let Some(user_data) = notify_up {
            info!(index, "server back online");
            self.raise_event(ServerEvent::Up, &self.handle(Tier::Primary, index, user_data));
        }
    }

    /// Counts one failure against the server's window, taking it offline
    /// once `max_fails` is reached.
    pub(crate) fn mark_offline(&self, tier: Tier, index: usize) {
        if tier == Tier::Backup {
            return;
        }

        let mut notify_down: Option<T> = None;
        {
            let mut inner = self.lock();
            let inner = &mut *inner;
            let Some(srv) = inner.primary.servers.get_mut(index) else {
                return;
            };
            if srv.opts.max_fails == 0 || srv.is_down || srv.fail_counter >= srv.opts.max_fails {
                return;
            }

            let now = Instant::now();
            srv.fail_counter += 1;

            if srv.fail_counter == 1 {
                srv.fail_deadline = Some(now + srv.opts.fail_timeout);
            } else if srv.deadline_passed(now) {
                // The window expired before this failure landed: it becomes
                // the first failure of a fresh window.
                srv.fail_counter = 1;
                srv.fail_deadline = Some(now + srv.opts.fail_timeout);
            }

            if srv.fail_counter == srv.opts.max_fails {
                srv.is_down = true;
                srv.fail_deadline = Some(now + srv.opts.fail_timeout);
                inner.primary_online -= 1;
                notify_down = Some(srv.user_data.clone());
            } else {
                debug!(index, fails = srv.fail_counter, "server failure recorded");
            }
        }

        if let Some(user_data) = notify_down {
            warn!(index, "server taken offline");
            self.raise_event(ServerEvent::Down, &self.handle(Tier::Primary, index, user_data));
        }
    }

    fn handle(&self, tier: Tier, index: usize, user_data: T) -> ServerHandle<T> {
        ServerHandle {
            lb: self.clone(),
            tier,
            index,
            user_data,
        }
    }

    fn raise_event(&self, event: ServerEvent, handle: &ServerHandle<T>) {
        let guard = self
            .event_handler
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(handler) = guard.as_ref() {
            handler(event, handle);
        }
    }
}

impl<T> LoadBalancer<T>
where
    T: Clone + Send + 'static,
{
    /// Returns a single-use channel fulfilled with the next available server.
    ///
    /// A background task polls [`next`](Self::next), sleeping until the
    /// earliest fail deadline whenever nothing is available. If the primary
    /// group is empty the task gives up and drops the sender, so
    /// `Err(RecvError)` on the receiver means no server will ever be produced
    /// for this call.
    pub fn wait_next(&self) -> oneshot::Receiver<ServerHandle<T>> {
        let (tx, rx) = oneshot::channel();
        let lb = self.clone();

        tokio::spawn(async move {
            loop {
                if let Some(handle) = lb.next() {
                    let _ = tx.send(handle);
                    return;
                }

                let to_wait = {
                    let inner = lb.lock();
                    if inner.primary.servers.is_empty() {
                        // Dropping the sender closes the channel empty.
                        return;
                    }

                    let now = Instant::now();
                    let mut to_wait: Option<Duration> = None;
                    for srv in &inner.primary.servers {
                        if !srv.is_down {
                            continue;
                        }
                        match srv.fail_deadline {
                            Some(deadline) if deadline > now => {
                                let diff = deadline - now;
                                if to_wait.map_or(true, |wait| diff < wait) {
                                    to_wait = Some(diff);
                                }
                            }
                            // This server can come back immediately.
                            _ => {
                                to_wait = None;
                                break;
                            }
                        }
                    }
                    to_wait
                };

                if let Some(wait) = to_wait {
                    debug!(wait_ms = wait.as_millis() as u64, "waiting for a server to recover");
                    tokio::time::sleep(wait).await;
                }
            }
        });

        rx
    }
}
