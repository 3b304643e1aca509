use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;

use happy_eyeballs::{Error, HappyEyeballs, IpFamily, Progress, Resolver};

fn init_test_log() {
    static INIT_LOG: Lazy<()> = Lazy::new(env_logger::init);
    *INIT_LOG
}

/// Resolver handing out a fixed address list, family-filtered the way the
/// system resolver would be.
#[derive(Debug)]
struct Fixed(Vec<SocketAddr>);

impl Resolver for Fixed {
    fn resolve(&self, _: &str, _: u16, family: IpFamily) -> io::Result<Vec<SocketAddr>> {
        let keep = |a: &SocketAddr| match family {
            IpFamily::Any => true,
            IpFamily::Ipv4Only => a.is_ipv4(),
            IpFamily::Ipv6Only => a.is_ipv6(),
        };
        Ok(self.0.iter().copied().filter(keep).collect())
    }
}

/// Like [`Fixed`], but records the family hint it was asked for.
#[derive(Debug)]
struct Recording {
    addrs: Vec<SocketAddr>,
    seen: Arc<Mutex<Option<IpFamily>>>,
}

impl Resolver for Recording {
    fn resolve(&self, _: &str, _: u16, family: IpFamily) -> io::Result<Vec<SocketAddr>> {
        *self.seen.lock().unwrap() = Some(family);
        Fixed(self.addrs.clone()).resolve("", 0, family)
    }
}

/// An address nothing listens on: bind an ephemeral port, free it again.
fn refused_v4() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// Same on the IPv6 loopback, or None when this host has no IPv6.
fn refused_v6() -> Option<SocketAddr> {
    let listener = TcpListener::bind("[::1]:0").ok()?;
    let addr = listener.local_addr().unwrap();
    drop(listener);
    Some(addr)
}

#[test]
fn happy_path_against_local_listener() {
    init_test_log();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = thread::spawn(move || {
        let (mut peer, _) = listener.accept().unwrap();
        let mut buf = [0u8; 5];
        peer.read_exact(&mut buf).unwrap();
        buf
    });

    let mut race = HappyEyeballs::with_resolver(Fixed(vec![addr]));
    let start = Instant::now();
    assert_eq!(race.connect("local.test", addr.port()).unwrap(), Progress::Connected);
    assert!(start.elapsed() < Duration::from_secs(5));

    assert_eq!(race.poll().unwrap(), Progress::Connected);
    assert_eq!(race.error_code(), 0);
    assert!(race.error_message().is_none());
    assert_eq!(race.remote_addr(), Some(addr));
    assert!(race.connection_time() > Duration::ZERO);

    let mut stream = race.take_stream().unwrap();
    stream.write_all(b"hello").unwrap();
    assert_eq!(&server.join().unwrap(), b"hello");
}

#[test]
fn refused_v6_falls_back_to_v4() {
    init_test_log();
    let Some(dead_v6) = refused_v6() else {
        // No IPv6 loopback on this host; nothing to fall back from.
        return;
    };
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let live_v4 = listener.local_addr().unwrap();

    let mut race = HappyEyeballs::with_resolver(Fixed(vec![dead_v6, live_v4]));
    let progress = race.connect("fallback.test", live_v4.port()).unwrap();

    // The refused v6 attempt fails fast, the dispatcher still waits out
    // its stagger slot, then the v4 attempt wins.
    assert_eq!(progress, Progress::Connected);
    let winner = race.remote_addr().unwrap();
    assert!(winner.is_ipv4());
    assert_eq!(winner, live_v4);
    assert!(race.take_stream().is_some());
}

#[test]
fn all_attempts_refused_reports_os_code() {
    init_test_log();
    let dead = refused_v4();
    let expected = TcpStream::connect(dead)
        .unwrap_err()
        .raw_os_error()
        .unwrap_or(-1);

    let mut race = HappyEyeballs::with_resolver(Fixed(vec![dead]));
    let err = race.connect("refused.test", dead.port()).unwrap_err();

    assert!(matches!(err, Error::ConnectFailed(_)));
    assert_eq!(race.error_code(), expected);
    let message = race.error_message().unwrap();
    assert!(!message.is_empty());
    assert!(race.take_stream().is_none());
}

#[test]
fn winner_survives_dropping_the_race() {
    init_test_log();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = thread::spawn(move || {
        let (mut peer, _) = listener.accept().unwrap();
        // Answer one byte, then echo whatever arrives after teardown.
        peer.write_all(b"x").unwrap();
        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).unwrap();
        buf
    });

    let mut race = HappyEyeballs::with_resolver(Fixed(vec![addr]));
    assert_eq!(race.connect("keep.test", addr.port()).unwrap(), Progress::Connected);
    let mut stream = race.take_stream().unwrap();

    drop(race);
    // Give the detached teardown thread time to do its (skipping) pass.
    thread::sleep(Duration::from_millis(50));

    let mut one = [0u8; 1];
    stream.read_exact(&mut one).unwrap();
    assert_eq!(&one, b"x");
    stream.write_all(b"ping").unwrap();
    assert_eq!(&server.join().unwrap(), b"ping");
}

#[test]
fn create_then_drop_without_connect() {
    let race = HappyEyeballs::new();
    drop(race);
}

#[test]
fn wait_times_out_while_pending() {
    let race = HappyEyeballs::new();
    assert_eq!(race.poll().unwrap(), Progress::Pending);

    let start = Instant::now();
    assert_eq!(
        race.wait_timeout(Duration::from_millis(50)).unwrap(),
        Progress::Pending
    );
    assert!(start.elapsed() >= Duration::from_millis(50));
    // Waiting again after a timeout is fine.
    assert_eq!(
        race.wait_timeout(Duration::from_millis(10)).unwrap(),
        Progress::Pending
    );
}

#[test]
fn bind_addr_steers_resolution_family() {
    init_test_log();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let live_v4 = listener.local_addr().unwrap();
    let seen = Arc::new(Mutex::new(None));

    let mut addrs = vec![live_v4];
    if let Some(v6) = refused_v6() {
        addrs.insert(0, v6);
    }

    let mut race = HappyEyeballs::with_resolver(Recording {
        addrs,
        seen: Arc::clone(&seen),
    });
    race.set_bind_addr(Some("127.0.0.1:0".parse().unwrap()));

    assert_eq!(race.connect("steer.test", live_v4.port()).unwrap(), Progress::Connected);
    assert_eq!(*seen.lock().unwrap(), Some(IpFamily::Ipv4Only));

    // Only v4 candidates existed, and the winner bound to the hint.
    let winner = race.remote_addr().unwrap();
    assert!(winner.is_ipv4());
    let stream = race.take_stream().unwrap();
    assert_eq!(stream.local_addr().unwrap().ip(), "127.0.0.1".parse::<std::net::IpAddr>().unwrap());
}

#[test]
fn clearing_bind_addr_is_idempotent() {
    let mut race = HappyEyeballs::new();
    race.set_bind_addr(None);
    race.set_bind_addr(None);
}

#[test]
fn dropping_mid_race_is_safe() {
    init_test_log();

    // A listener with a saturated accept queue makes further connects hang
    // in SYN retransmission, keeping a worker blocked in connect(2).
    let listener = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )
    .unwrap();
    listener
        .bind(&"127.0.0.1:0".parse::<SocketAddr>().unwrap().into())
        .unwrap();
    listener.listen(0).unwrap();
    let addr = listener.local_addr().unwrap().as_socket().unwrap();

    let mut fillers = Vec::new();
    for _ in 0..4 {
        match TcpStream::connect_timeout(&addr, Duration::from_millis(100)) {
            Ok(s) => fillers.push(s),
            Err(_) => break,
        }
    }

    let mut race = HappyEyeballs::with_resolver(Fixed(vec![addr]));
    // Depending on queue state this is Pending (worker still blocked),
    // Connected, or a fast failure. All must tear down cleanly.
    let _ = race.connect("stuck.test", addr.port());
    drop(race);
    // Drop returns immediately; the detached teardown interrupts the
    // blocked worker via shutdown and joins it in the background.
}
