//! Name resolvers and address ordering.
//!
//! Name resolving is pluggable. The resolver's duty is to translate a
//! hostname and port to an ordered list of socket addresses, which the race
//! then reorders so address families alternate before dispatching attempts.
//!
//! In some situations it might be desirable to not do a DNS lookup, or to
//! use another system than DNS for it.

use std::fmt::{self, Debug};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};

/// Trait for name resolvers.
pub trait Resolver: Debug + Send + 'static {
    /// Resolve `hostname` to the candidate addresses for `port`.
    ///
    /// This is a blocking call. `family` restricts which address families
    /// are wanted; a resolver must not return addresses of a family that
    /// was filtered out.
    fn resolve(&self, hostname: &str, port: u16, family: IpFamily) -> io::Result<Vec<SocketAddr>>;
}

/// Configuration of IP family to use.
///
/// Used to limit the lookup to either IPv4, IPv6 or any. Derived from the
/// bind address: an attempt bound to an IPv4 source can only ever connect
/// over IPv4, so resolving the other family would be wasted work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpFamily {
    /// Both IPv4 and IPv6 addresses are wanted.
    Any,
    /// Limit to IPv4 addresses.
    Ipv4Only,
    /// Limit to IPv6 addresses.
    Ipv6Only,
}

impl IpFamily {
    pub(crate) fn keep_wanted<'a>(
        &'a self,
        iter: impl Iterator<Item = SocketAddr> + 'a,
    ) -> impl Iterator<Item = SocketAddr> + 'a {
        iter.filter(move |a| self.is_wanted(a))
    }

    fn is_wanted(&self, addr: &SocketAddr) -> bool {
        match self {
            IpFamily::Any => true,
            IpFamily::Ipv4Only => addr.is_ipv4(),
            IpFamily::Ipv6Only => addr.is_ipv6(),
        }
    }
}

/// Default resolver implementation.
///
/// Uses std::net [`ToSocketAddrs`](https://doc.rust-lang.org/std/net/trait.ToSocketAddrs.html)
/// to do the lookup, which is the blocking system resolver.
#[derive(Default)]
pub struct DefaultResolver {
    _private: (),
}

impl Resolver for DefaultResolver {
    fn resolve(&self, hostname: &str, port: u16, family: IpFamily) -> io::Result<Vec<SocketAddr>> {
        trace!("resolve: {}:{}", hostname, port);

        let iter = (hostname, port).to_socket_addrs()?;
        let addrs: Vec<SocketAddr> = family.keep_wanted(iter).collect();

        debug!("resolved {}:{} to {:?}", hostname, port, addrs);

        Ok(addrs)
    }
}

impl fmt::Debug for DefaultResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefaultResolver").finish()
    }
}

/// Address family of a resolved address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Family {
    V4,
    V6,
}

impl Family {
    pub(crate) fn of(addr: &SocketAddr) -> Family {
        if addr.is_ipv6() {
            Family::V6
        } else {
            Family::V4
        }
    }
}

/// Reorder `addrs` in place so address families alternate.
///
/// Walk the list with a previous/current cursor pair. Whenever both sides
/// of the pair share a family, the first later entry of the other family is
/// unlinked and spliced in between them. When no entry of the other family
/// remains, the rest of the list is left as-is.
///
/// The result is that the first two entries (when available) are of
/// different families and subsequent pairs alternate where possible, so a
/// staggered dispatch covers both families quickly even if the resolver
/// returned them clumped.
pub(crate) fn interleave(addrs: &mut Vec<SocketAddr>) {
    let mut cur = 1;
    while cur < addrs.len() {
        let prev_family = Family::of(&addrs[cur - 1]);
        if prev_family == Family::of(&addrs[cur]) {
            let other = addrs[cur..]
                .iter()
                .position(|a| Family::of(a) != prev_family);
            match other {
                Some(offset) => {
                    let found = addrs.remove(cur + offset);
                    addrs.insert(cur, found);
                }
                // We're at the end and haven't found the other kind.
                None => break,
            }
        }
        cur += 1;
    }
}
