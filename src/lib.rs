#![forbid(unsafe_code)]
#![warn(clippy::all)]
#![deny(missing_docs)]
//! An implementation of RFC 6555 (Happy Eyeballs) to connect to dual-stack
//! hosts with fast fallback between IPv4 and IPv6.
//!
//! A hostname often resolves to addresses of both families, and one of the
//! two can be broken, blocked or slow without the other being affected.
//! Connecting to the resolved addresses one at a time means eating the full
//! connect timeout of every dead address before trying a live one, which is
//! a multi-second stall for an interactive client. This crate instead races
//! the addresses: attempts launch 200 ms apart, families alternating, and
//! the first `connect(2)` to succeed wins while the rest are cancelled.
//!
//! There's no way around spawning a thread per attempt here, since
//! `connect()` is a blocking syscall with no portable non-blocking
//! alternative, and spawning a few threads is a cheap operation compared to
//! everything else going on (DNS resolution, handshaking across the
//! Internet).
//!
//! # Usage
//!
//! In its simplest form:
//!
//! ```no_run
//! let (stream, addr) = happy_eyeballs::connect("example.com", 443)?;
//! println!("connected to {}", addr);
//! # Ok::<(), happy_eyeballs::Error>(())
//! ```
//!
//! For polling, timing data or a bound source address, drive a race
//! directly:
//!
//! ```no_run
//! use happy_eyeballs::{HappyEyeballs, Progress};
//! use std::time::Duration;
//!
//! let mut race = HappyEyeballs::new();
//! match race.connect("example.com", 443)? {
//!     Progress::Connected => {}
//!     Progress::Pending => {
//!         // Attempts are still in flight; wait a while longer.
//!         race.wait_timeout(Duration::from_secs(5))?;
//!     }
//! }
//!
//! if let Some(stream) = race.take_stream() {
//!     println!(
//!         "connected to {:?} in {:?}",
//!         race.remote_addr(),
//!         race.connection_time()
//!     );
//! }
//! # Ok::<(), happy_eyeballs::Error>(())
//! ```

#[macro_use]
extern crate log;

mod candidate;
mod error;
mod event;
mod race;
mod resolver;

pub use error::{Error, OsError};
pub use race::{HappyEyeballs, Progress};
pub use resolver::{DefaultResolver, IpFamily, Resolver};

use std::net::{SocketAddr, TcpStream};

const UNREACHABLE_MSG: &str = "Unreachable: race completed without winner or error";

/// Connect to `hostname:port`, racing both address families.
///
/// Runs a use-once [`HappyEyeballs`] race and blocks up to the default
/// 25 second budget. Returns the connected stream together with the
/// address that won.
pub fn connect(hostname: &str, port: u16) -> Result<(TcpStream, SocketAddr), Error> {
    let mut race = HappyEyeballs::new();

    if race.connect(hostname, port)? == Progress::Pending && race.wait()? == Progress::Pending {
        return Err(Error::Timeout);
    }

    let stream = race.take_stream().expect(UNREACHABLE_MSG);
    let addr = race.remote_addr().expect(UNREACHABLE_MSG);
    Ok((stream, addr))
}
