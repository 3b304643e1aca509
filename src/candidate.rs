//! One in-flight connection attempt and its worker.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use socket2::Socket;

use crate::error::NO_OS_CODE;
use crate::event::Event;
use crate::race::RaceShared;

/// One connection attempt, as seen from the controller.
///
/// The worker thread owns the primary socket handle. `socket` here is a
/// `try_clone` dup of it, held so teardown can `shutdown(2)` the attempt
/// from another thread while the worker is blocked in `connect(2)`.
pub(crate) struct Candidate {
    pub(crate) socket: Socket,
    /// Set exactly once, when the worker finished (either way).
    pub(crate) done: Arc<Event>,
    /// Last OS error produced by this attempt. 0 when none.
    pub(crate) error: Arc<AtomicI32>,
    /// Joined exactly once, by teardown.
    pub(crate) worker: Option<JoinHandle<()>>,
}

/// Everything one worker needs. Moved into the worker thread at spawn.
pub(crate) struct WorkerArgs {
    pub(crate) shared: Arc<RaceShared>,
    pub(crate) socket: Socket,
    pub(crate) addr: SocketAddr,
    pub(crate) index: usize,
    pub(crate) bind_addr: Option<SocketAddr>,
    pub(crate) done: Arc<Event>,
    pub(crate) error: Arc<AtomicI32>,
}

/// Body of one candidate worker: a single blocking connect attempt that
/// either claims the winner slot or records its own error.
pub(crate) fn run(args: WorkerArgs) {
    let WorkerArgs {
        shared,
        socket,
        addr,
        index,
        bind_addr,
        done,
        error,
    } = args;

    if shared.race_done.has_fired() {
        // Already lost, don't bother.
        return;
    }

    #[cfg(target_vendor = "apple")]
    let _ = socket.set_nosigpipe(true);

    if let Some(bind_addr) = bind_addr {
        if let Err(e) = socket.bind(&bind_addr.into()) {
            debug!("attempt {}: bind to {} failed: {}", index, bind_addr, e);
            fail(&shared, &done, &error, &e);
            return;
        }
    }

    match socket.connect(&addr.into()) {
        Ok(()) => {
            let mut winner = shared.winner.lock().unwrap();
            done.signal();

            if !shared.race_done.has_fired() {
                debug!("attempt {}: connected to {}, we win", index, addr);
                winner.claim(socket, addr, index);
                shared.signal_end();
            } else {
                // Another attempt beat us; our socket drops as a loser.
                trace!("attempt {}: connected to {} after the race ended", index, addr);
            }
        }
        Err(e) => {
            trace!("attempt {}: connect to {} failed: {}", index, addr, e);
            fail(&shared, &done, &error, &e);
        }
    }
}

/// Failure path: note the error, mark this attempt finished and, when no
/// peer is still outstanding, surface the race verdict.
fn fail(shared: &RaceShared, done: &Event, error: &AtomicI32, cause: &io::Error) {
    error.store(cause.raw_os_error().unwrap_or(NO_OS_CODE), Ordering::SeqCst);

    let winner = shared.winner.lock().unwrap();
    done.signal();

    // Candidates may still be getting dispatched; treat that as an
    // outstanding peer.
    let mut active = shared.is_starting.load(Ordering::SeqCst);
    if !active {
        let candidates = shared.candidates.lock().unwrap();
        active = candidates.iter().any(|c| !c.done.has_fired());
    }
    drop(winner);

    if active || shared.has_failure() {
        return;
    }

    // We are the last one out.
    if shared.coalesce_errors() {
        shared.signal_end();
    }
}
