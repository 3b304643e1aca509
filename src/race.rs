//! The race controller and its staggered dispatch loop.

use std::fmt;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};

use crate::candidate::{self, Candidate, WorkerArgs};
use crate::error::{Error, OsError, NO_OS_CODE};
use crate::event::Event;
use crate::resolver::{interleave, DefaultResolver, Family, IpFamily, Resolver};

/// Delay between staggered connection attempts. Same default as libcurl.
const STAGGER_DELAY: Duration = Duration::from_millis(200);

/// Upper bound on connection attempts per race.
const MAX_ATTEMPTS: usize = 6;

/// Default budget for [`HappyEyeballs::wait`]: total time to wait for an
/// attempt to finish, whichever way.
const DEFAULT_TIMEOUT: Duration = Duration::from_millis(25_000);

/// Non-terminal outcome of starting, polling or waiting on a race.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// The race ended with a connected socket. Collect it with
    /// [`HappyEyeballs::take_stream`].
    Connected,
    /// Attempts are still in flight; poll or wait again.
    Pending,
}

/// The winner slot. Populated at most once, under the winner mutex.
///
/// `index` outlives `socket`: it is kept after the stream is taken so
/// teardown can still tell the winning candidate from the losers.
pub(crate) struct WinnerSlot {
    socket: Option<Socket>,
    addr: Option<SocketAddr>,
    index: Option<usize>,
}

impl WinnerSlot {
    pub(crate) fn claim(&mut self, socket: Socket, addr: SocketAddr, index: usize) {
        self.socket = Some(socket);
        self.addr = Some(addr);
        self.index = Some(index);
    }
}

/// State shared between the dispatcher, the workers and teardown.
pub(crate) struct RaceShared {
    /// Serializes claiming the winner slot and the completion decision.
    pub(crate) winner: Mutex<WinnerSlot>,
    /// Serializes mutation of and iteration over the candidate list.
    pub(crate) candidates: Mutex<Vec<Candidate>>,
    /// Fires once: a winner was chosen or the race terminally failed.
    pub(crate) race_done: Event,
    /// True while the dispatcher is still launching candidates. Gates
    /// premature "everyone failed" verdicts.
    pub(crate) is_starting: AtomicBool,
    failure: Mutex<Option<Error>>,
    completed_at: Mutex<Option<Instant>>,
}

impl RaceShared {
    fn new() -> Self {
        RaceShared {
            winner: Mutex::new(WinnerSlot {
                socket: None,
                addr: None,
                index: None,
            }),
            candidates: Mutex::new(Vec::with_capacity(MAX_ATTEMPTS)),
            race_done: Event::new(),
            is_starting: AtomicBool::new(false),
            failure: Mutex::new(None),
            completed_at: Mutex::new(None),
        }
    }

    pub(crate) fn has_failure(&self) -> bool {
        self.failure.lock().unwrap().is_some()
    }

    fn failure(&self) -> Option<Error> {
        self.failure.lock().unwrap().clone()
    }

    fn record_failure(&self, error: Error) {
        let mut failure = self.failure.lock().unwrap();
        if failure.is_none() {
            *failure = Some(error);
        }
    }

    fn completed_at(&self) -> Option<Instant> {
        *self.completed_at.lock().unwrap()
    }

    /// Mark the race terminal: stamp the completion time and fire the
    /// completion signal. Idempotent.
    pub(crate) fn signal_end(&self) {
        if self.race_done.has_fired() {
            return;
        }

        let mut at = self.completed_at.lock().unwrap();
        if at.is_none() {
            *at = Some(Instant::now());
        }
        drop(at);

        self.race_done.signal();
    }

    /// Choose one representative error once every candidate has failed:
    /// the most common nonzero code, ties broken by scan order. Returns
    /// whether a verdict was recorded.
    ///
    /// Refuses while candidates are still being dispatched, after the race
    /// completed, and when an earlier failure (typically from the
    /// resolver) is already recorded.
    pub(crate) fn coalesce_errors(&self) -> bool {
        if self.is_starting.load(Ordering::SeqCst) {
            return false;
        }
        if self.race_done.has_fired() {
            return false;
        }
        if self.has_failure() {
            return false;
        }

        let candidates = self.candidates.lock().unwrap();
        let mut counts: Vec<(i32, u32)> = Vec::new();
        for candidate in candidates.iter() {
            let code = candidate.error.load(Ordering::SeqCst);
            if code == 0 {
                continue;
            }
            match counts.iter_mut().find(|(c, _)| *c == code) {
                Some((_, n)) => *n += 1,
                None => counts.push((code, 1)),
            }
        }
        drop(candidates);

        let mut mode = (0, 0);
        for (code, n) in counts {
            if mode.1 < n {
                mode = (code, n);
            }
        }

        let error = if mode.1 == 0 {
            Error::ConnectFailed(OsError::new_static(NO_OS_CODE, "all connection attempts failed"))
        } else {
            Error::ConnectFailed(OsError::from_raw(mode.0))
        };
        debug!("race lost: {}", error);
        self.record_failure(error);

        true
    }
}

/// A Happy Eyeballs connection race.
///
/// One instance runs one race: [`connect`][HappyEyeballs::connect] resolves
/// the hostname, interleaves the address families and launches staggered
/// attempts; the first attempt whose `connect(2)` succeeds wins and the
/// rest are torn down. Poll with [`poll`][HappyEyeballs::poll] or block
/// with [`wait`][HappyEyeballs::wait], then collect the winning stream
/// with [`take_stream`][HappyEyeballs::take_stream].
///
/// Dropping the race releases everything else asynchronously: attempts
/// still blocked in `connect(2)` are shut down and their threads joined on
/// a detached teardown thread, so the drop itself never blocks.
pub struct HappyEyeballs {
    shared: Arc<RaceShared>,
    resolver: Box<dyn Resolver>,
    bind_addr: Option<SocketAddr>,
    started: bool,
    name_resolution: Option<Duration>,
    connect_start: Option<Instant>,
}

impl HappyEyeballs {
    /// New race using the system resolver.
    pub fn new() -> HappyEyeballs {
        HappyEyeballs::with_resolver(DefaultResolver::default())
    }

    /// New race using a custom [`Resolver`].
    pub fn with_resolver(resolver: impl Resolver) -> HappyEyeballs {
        HappyEyeballs {
            shared: Arc::new(RaceShared::new()),
            resolver: Box::new(resolver),
            bind_addr: None,
            started: false,
            name_resolution: None,
            connect_start: None,
        }
    }

    /// Set or clear the local address every attempt binds to.
    ///
    /// Must be called before [`connect`][HappyEyeballs::connect]. Setting
    /// a source address also restricts resolution to its family: an
    /// attempt bound to IPv4 cannot connect over IPv6, and vice versa.
    pub fn set_bind_addr(&mut self, addr: Option<SocketAddr>) {
        self.bind_addr = addr;
    }

    /// Start the race against `hostname:port`.
    ///
    /// Blocks while resolving and then for up to 200 ms per launched
    /// attempt (at most 6). Returns `Progress::Connected` when a winner
    /// emerged within that window, `Progress::Pending` when attempts are
    /// still in flight (poll or wait to follow up), or the terminal error.
    ///
    /// One race per instance: calling this twice returns
    /// [`Error::InvalidArgument`].
    pub fn connect(&mut self, hostname: &str, port: u16) -> Result<Progress, Error> {
        if hostname.is_empty() || port == 0 || self.started {
            return Err(Error::InvalidArgument);
        }
        self.started = true;

        if let Err(e) = check_resolver_sandbox() {
            self.shared.record_failure(e.clone());
            return Err(e);
        }

        let family = match self.bind_addr {
            Some(addr) if addr.is_ipv4() => IpFamily::Ipv4Only,
            Some(_) => IpFamily::Ipv6Only,
            None => IpFamily::Any,
        };

        let resolve_start = Instant::now();
        let resolved = self.resolver.resolve(hostname, port, family);
        self.name_resolution = Some(resolve_start.elapsed());

        let mut addrs = match resolved {
            Ok(v) => v,
            Err(e) => {
                return Err(self.record(Error::Resolve(OsError::from_io(&e))));
            }
        };
        if addrs.is_empty() {
            return Err(self.record(Error::Resolve(OsError::new_static(
                NO_OS_CODE,
                "name resolution returned no usable address",
            ))));
        }

        interleave(&mut addrs);
        debug!("racing {} addresses: {:?}", addrs.len(), addrs);

        self.connect_start = Some(Instant::now());
        self.shared.is_starting.store(true, Ordering::SeqCst);

        // Dispatch stops when the attempt cap is reached, the list runs
        // out, or two addresses of the same family come up in a row. In
        // the last case the previous attempt goes it alone: staggering
        // exists to cover the *other* family quickly, not to spray
        // attempts at one family.
        let mut prev_family = None;
        for (attempt, addr) in addrs.iter().take(MAX_ATTEMPTS).enumerate() {
            let family = Family::of(addr);
            if prev_family == Some(family) {
                trace!("attempt {} would repeat {:?}, stopping dispatch", attempt, family);
                break;
            }

            self.launch(*addr, attempt)?;

            if self.shared.race_done.wait_timeout(STAGGER_DELAY) {
                break;
            }
            prev_family = Some(family);
        }

        self.shared.is_starting.store(false, Ordering::SeqCst);

        // The last failing worker may have declined the verdict because we
        // were still dispatching. Check for that window.
        if let Ok(Progress::Pending) = self.poll() {
            let still_running = {
                let candidates = self.shared.candidates.lock().unwrap();
                candidates.iter().any(|c| !c.done.has_fired())
            };
            if !still_running && self.shared.coalesce_errors() {
                self.shared.signal_end();
            }
        }

        self.poll()
    }

    /// Launch one candidate attempt for `addr`.
    fn launch(&self, addr: SocketAddr, index: usize) -> Result<(), Error> {
        debug!("attempt {}: racing {}", index, addr);

        let socket = match Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        {
            Ok(v) => v,
            Err(e) => return Err(self.record(Error::Resource(OsError::from_io(&e)))),
        };
        // Dup held by the candidate slot so teardown can shut the attempt
        // down while the worker owns the primary handle.
        let teardown_handle = match socket.try_clone() {
            Ok(v) => v,
            Err(e) => return Err(self.record(Error::Resource(OsError::from_io(&e)))),
        };

        let done = Arc::new(Event::new());
        let error = Arc::new(AtomicI32::new(0));

        // The candidate is fully formed before it becomes visible: peers
        // scanning the list must find its completion event in place.
        {
            let mut candidates = self.shared.candidates.lock().unwrap();
            candidates.push(Candidate {
                socket: teardown_handle,
                done: Arc::clone(&done),
                error: Arc::clone(&error),
                worker: None,
            });
        }

        let args = WorkerArgs {
            shared: Arc::clone(&self.shared),
            socket,
            addr,
            index,
            bind_addr: self.bind_addr,
            done,
            error,
        };

        let spawned = thread::Builder::new()
            .name(format!("happy-eyeballs-{}", index))
            .spawn(move || candidate::run(args));

        let mut candidates = self.shared.candidates.lock().unwrap();
        match spawned {
            Ok(handle) => {
                candidates[index].worker = Some(handle);
                Ok(())
            }
            Err(e) => {
                candidates.remove(index);
                drop(candidates);
                Err(self.record(Error::Resource(OsError::from_io(&e))))
            }
        }
    }

    /// Non-blocking check of the race outcome.
    ///
    /// A recorded failure takes precedence over the completion signal.
    pub fn poll(&self) -> Result<Progress, Error> {
        if let Some(error) = self.shared.failure() {
            return Err(error);
        }
        if self.shared.race_done.has_fired() {
            Ok(Progress::Connected)
        } else {
            Ok(Progress::Pending)
        }
    }

    /// Block until the race completes or `timeout` elapses.
    ///
    /// `Progress::Pending` means the budget ran out; the race keeps
    /// running and waiting again is fine.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<Progress, Error> {
        let fired = self.shared.race_done.wait_timeout(timeout);
        if let Some(error) = self.shared.failure() {
            return Err(error);
        }
        Ok(if fired {
            Progress::Connected
        } else {
            Progress::Pending
        })
    }

    /// [`wait_timeout`][HappyEyeballs::wait_timeout] with the default
    /// 25 second budget.
    pub fn wait(&self) -> Result<Progress, Error> {
        self.wait_timeout(DEFAULT_TIMEOUT)
    }

    /// Take ownership of the winning stream.
    ///
    /// Returns a value at most once, and only after the race completed
    /// successfully. The stream survives dropping the race.
    pub fn take_stream(&mut self) -> Option<TcpStream> {
        let mut winner = self.shared.winner.lock().unwrap();
        winner.socket.take().map(TcpStream::from)
    }

    /// The address of the winning attempt, once there is one.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.shared.winner.lock().unwrap().addr
    }

    /// The recorded OS error code, or 0 when the race has none.
    pub fn error_code(&self) -> i32 {
        self.shared.failure().map(|e| e.os_code()).unwrap_or(0)
    }

    /// The recorded error description, when there is one.
    pub fn error_message(&self) -> Option<String> {
        self.shared
            .failure()
            .and_then(|e| e.os_message().map(String::from))
    }

    /// Wall time the name resolution took. Zero before resolution ran.
    pub fn name_resolution_time(&self) -> Duration {
        self.name_resolution.unwrap_or_default()
    }

    /// Wall time from first launch to race completion (either way). Zero
    /// while the race is still running.
    pub fn connection_time(&self) -> Duration {
        match (self.connect_start, self.shared.completed_at()) {
            (Some(start), Some(end)) => end.saturating_duration_since(start),
            _ => Duration::ZERO,
        }
    }

    fn record(&self, error: Error) -> Error {
        self.shared.record_failure(error.clone());
        error
    }
}

impl Default for HappyEyeballs {
    fn default() -> Self {
        HappyEyeballs::new()
    }
}

impl fmt::Debug for HappyEyeballs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HappyEyeballs")
            .field("resolver", &self.resolver)
            .field("bind_addr", &self.bind_addr)
            .field("started", &self.started)
            .finish()
    }
}

impl Drop for HappyEyeballs {
    fn drop(&mut self) {
        // Teardown happens on a detached thread: on some platforms a
        // worker sits in a non-interruptible connect(2), and the caller
        // must not absorb the join latency.
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("happy-eyeballs-teardown".into())
            .spawn(move || teardown(&shared));

        if spawned.is_err() {
            teardown(&self.shared);
        }
    }
}

/// Shut down losing attempts, join every worker, release the rest.
fn teardown(shared: &RaceShared) {
    let winner_index = shared.winner.lock().unwrap().index;

    // Shut down losing sockets so workers blocked in connect(2) or bind(2)
    // error out. The descriptors stay open; each worker still owns and
    // closes its own handle.
    {
        let candidates = shared.candidates.lock().unwrap();
        for (index, candidate) in candidates.iter().enumerate() {
            if winner_index != Some(index) {
                let _ = candidate.socket.shutdown(Shutdown::Both);
            }
        }
    }

    // Join workers exactly once. Handles are taken under the lock but
    // joined outside it: a failing worker takes the candidate lock on its
    // way out, and joining while holding it would deadlock.
    let workers: Vec<_> = {
        let mut candidates = shared.candidates.lock().unwrap();
        candidates
            .iter_mut()
            .filter_map(|c| c.worker.take())
            .collect()
    };
    for worker in workers {
        let _ = worker.join();
    }

    trace!("teardown complete");
    // Loser dups and an untaken winner socket close when the last Arc
    // clone of the shared state drops.
}

/// Some security products sandbox a process by making every DNS lookup
/// fail with "host not found", including loopback. Probe for that before
/// the real resolution produces the same failure with no explanation.
#[cfg(windows)]
fn check_resolver_sandbox() -> Result<(), Error> {
    use std::net::ToSocketAddrs;

    const WSAHOST_NOT_FOUND: i32 = 11001;
    const SANDBOX_MSG: &str = "connection test failed. The resolver cannot look up \
        localhost, which is likely caused by security software running this \
        application in a sandbox that blocks DNS. Add the application to the \
        sandbox exclusion list, restart it and try again (11001).";

    match ("localhost", 80u16).to_socket_addrs() {
        Ok(_) => Ok(()),
        Err(e) if e.raw_os_error() == Some(WSAHOST_NOT_FOUND) => Err(Error::Resolve(
            OsError::new_static(WSAHOST_NOT_FOUND, SANDBOX_MSG),
        )),
        // Any other failure is the real lookup's to report.
        Err(_) => Ok(()),
    }
}

#[cfg(not(windows))]
fn check_resolver_sandbox() -> Result<(), Error> {
    Ok(())
}
