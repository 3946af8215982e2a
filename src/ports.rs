//! Port readiness monitoring.
//!
//! [`SystemPortProbe`] asks the OS which TCP ports are listening, falling back to
//! parsing `netstat` output where the network stack cannot be queried directly.
//! [`PortMonitor`] turns a probe into a bounded, cancellable readiness barrier.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{RegiError, Result};
use crate::platform::{netstat_command, Platform};

/// Default interval between two listener queries.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

const NETSTAT_TIMEOUT: Duration = Duration::from_secs(5);

/// `st` column value for sockets in the LISTEN state in `/proc/net/tcp*`.
const PROC_TCP_LISTEN: &str = "0A";

pub type ProbeFuture<'a> =
    Pin<Box<dyn Future<Output = std::io::Result<BTreeSet<u16>>> + Send + 'a>>;

/// Source of truth for which ports are accepting connections.
pub trait PortProbe: Send + Sync {
    /// Returns the subset of `ports` that is currently listening.
    fn listening<'a>(&'a self, ports: &'a BTreeSet<u16>) -> ProbeFuture<'a>;
}

/// Probe backed by the host's network stack.
#[derive(Debug, Clone, Copy)]
pub struct SystemPortProbe {
    platform: Platform,
}

impl SystemPortProbe {
    pub fn new(platform: Platform) -> Self {
        Self { platform }
    }

    /// Lists every TCP socket in the LISTEN state.
    ///
    /// Only available where the kernel exposes its socket tables (`/proc/net/tcp*` on
    /// native Linux); returns `Unsupported` elsewhere.
    pub fn list_listening_ports(&self) -> std::io::Result<Vec<SocketAddr>> {
        if self.platform != Platform::Linux {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "listener table not available on this platform",
            ));
        }
        let mut listeners = parse_proc_net_tcp(&std::fs::read_to_string("/proc/net/tcp")?);
        match std::fs::read_to_string("/proc/net/tcp6") {
            Ok(raw) => listeners.extend(parse_proc_net_tcp(&raw)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
        Ok(listeners)
    }

    async fn listening_from_netstat(&self, ports: &BTreeSet<u16>) -> std::io::Result<BTreeSet<u16>> {
        let output = netstat_command(self.platform).capture(NETSTAT_TIMEOUT).await?;
        let text = String::from_utf8_lossy(&output.stdout);
        Ok(ports
            .iter()
            .copied()
            .filter(|port| contains_netstat_port(self.platform, &text, *port))
            .collect())
    }
}

impl PortProbe for SystemPortProbe {
    fn listening<'a>(&'a self, ports: &'a BTreeSet<u16>) -> ProbeFuture<'a> {
        Box::pin(async move {
            match self.list_listening_ports() {
                Ok(listeners) => Ok(listeners
                    .iter()
                    .map(SocketAddr::port)
                    .filter(|port| ports.contains(port))
                    .collect()),
                Err(err) => {
                    debug!(error = %err, "listener table unavailable, falling back to netstat");
                    self.listening_from_netstat(ports).await
                }
            }
        })
    }
}

/// Parses the kernel's `/proc/net/tcp` or `/proc/net/tcp6` table, keeping listeners.
pub fn parse_proc_net_tcp(raw: &str) -> Vec<SocketAddr> {
    raw.lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.get(3) != Some(&PROC_TCP_LISTEN) {
                return None;
            }
            let (addr, port) = fields.get(1)?.split_once(':')?;
            let port = u16::from_str_radix(port, 16).ok()?;
            Some(SocketAddr::new(parse_proc_address(addr)?, port))
        })
        .collect()
}

// The kernel prints each 32-bit word of the address in host byte order.
fn parse_proc_address(hex: &str) -> Option<IpAddr> {
    match hex.len() {
        8 => {
            let word = u32::from_str_radix(hex, 16).ok()?;
            Some(IpAddr::V4(Ipv4Addr::from(word.to_ne_bytes())))
        }
        32 => {
            let mut octets = [0u8; 16];
            for (i, chunk) in octets.chunks_mut(4).enumerate() {
                let word = u32::from_str_radix(hex.get(i * 8..i * 8 + 8)?, 16).ok()?;
                chunk.copy_from_slice(&word.to_ne_bytes());
            }
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}

/// Whether `netstat -tna` output shows `port` in the LISTEN state.
///
/// macOS prints `host.port`, every other platform `host:port`.
pub fn contains_netstat_port(platform: Platform, netstat: &str, port: u16) -> bool {
    let pattern = if platform == Platform::Mac {
        format!(r"[.:]{}\b", port)
    } else {
        format!(r":{}\b", port)
    };
    let Ok(port_regex) = Regex::new(&pattern) else {
        return false;
    };
    netstat.lines().any(|line| {
        line.to_lowercase().contains("listen") && port_regex.is_match(line)
    })
}

/// Readiness barrier over a [`PortProbe`].
#[derive(Clone)]
pub struct PortMonitor {
    probe: Arc<dyn PortProbe>,
    poll_interval: Duration,
}

impl PortMonitor {
    pub fn new(probe: Arc<dyn PortProbe>) -> Self {
        Self {
            probe,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn system(platform: Platform) -> Self {
        Self::new(Arc::new(SystemPortProbe::new(platform)))
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// One-shot check; probe errors count as "not listening".
    pub async fn is_listening(&self, port: u16) -> bool {
        let ports = BTreeSet::from([port]);
        match self.probe.listening(&ports).await {
            Ok(found) => found.contains(&port),
            Err(err) => {
                warn!(port, error = %err, "failed to query listening ports");
                false
            }
        }
    }

    /// Blocks until every port in `pending` (port to project name) is listening.
    ///
    /// Ports leave the pending set as soon as they are observed and never re-enter it.
    pub async fn wait_until_listening(
        &self,
        mut pending: BTreeMap<u16, String>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if pending.is_empty() {
            return Ok(());
        }
        let waiting_on = pending
            .iter()
            .map(|(port, name)| format!("{} ({})", name, port))
            .collect::<Vec<_>>()
            .join(", ");
        info!(projects = %waiting_on, "waiting for projects to start");

        let deadline = Instant::now() + timeout;
        loop {
            let ports: BTreeSet<u16> = pending.keys().copied().collect();
            match self.probe.listening(&ports).await {
                Ok(found) => {
                    for port in found {
                        if let Some(name) = pending.remove(&port) {
                            info!(project = %name, port, "now listening");
                        }
                    }
                }
                Err(err) => warn!(error = %err, "failed to query listening ports"),
            }
            if pending.is_empty() {
                info!("all projects started");
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(RegiError::ReadinessTimeout {
                    pending: pending.into_keys().collect(),
                });
            }
            let nap = self.poll_interval.min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => return Err(RegiError::Cancelled),
                _ = tokio::time::sleep(nap) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    /// Reports each port as listening once it has been asked about `after` times.
    struct ScriptedProbe {
        after: BTreeMap<u16, usize>,
        asked: Mutex<Vec<BTreeSet<u16>>>,
    }

    impl ScriptedProbe {
        fn new(after: impl IntoIterator<Item = (u16, usize)>) -> Arc<Self> {
            Arc::new(Self {
                after: after.into_iter().collect(),
                asked: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<BTreeSet<u16>> {
            self.asked.lock().unwrap().clone()
        }
    }

    impl PortProbe for ScriptedProbe {
        fn listening<'a>(&'a self, ports: &'a BTreeSet<u16>) -> ProbeFuture<'a> {
            Box::pin(async move {
                let mut asked = self.asked.lock().unwrap();
                asked.push(ports.clone());
                let call = asked.len();
                Ok(ports
                    .iter()
                    .copied()
                    .filter(|port| self.after.get(port).is_some_and(|after| call >= *after))
                    .collect())
            })
        }
    }

    fn pending(ports: &[u16]) -> BTreeMap<u16, String> {
        ports.iter().map(|port| (*port, format!("app{}", port))).collect()
    }

    #[tokio::test]
    async fn pending_set_only_shrinks_until_empty() {
        let probe = ScriptedProbe::new([(9080, 1), (9081, 3), (9082, 2)]);
        let monitor = PortMonitor::new(probe.clone()).with_poll_interval(Duration::from_millis(5));

        monitor
            .wait_until_listening(
                pending(&[9080, 9081, 9082]),
                Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let calls = probe.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0], BTreeSet::from([9080, 9081, 9082]));
        assert_eq!(calls[1], BTreeSet::from([9081, 9082]));
        assert_eq!(calls[2], BTreeSet::from([9081]));
        for pair in calls.windows(2) {
            assert!(pair[1].is_subset(&pair[0]));
        }
    }

    #[tokio::test]
    async fn times_out_no_earlier_than_the_deadline() {
        let probe = ScriptedProbe::new([(9080, 1)]);
        let monitor = PortMonitor::new(probe).with_poll_interval(Duration::from_millis(10));
        let timeout = Duration::from_millis(120);

        let started = std::time::Instant::now();
        let result = monitor
            .wait_until_listening(pending(&[9080, 9999]), timeout, &CancellationToken::new())
            .await;

        assert!(started.elapsed() >= timeout);
        match result {
            Err(RegiError::ReadinessTimeout { pending }) => assert_eq!(pending, vec![9999]),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancellation_interrupts_the_wait() {
        let probe = ScriptedProbe::new([]);
        let monitor = PortMonitor::new(probe).with_poll_interval(Duration::from_millis(10));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let result = monitor
            .wait_until_listening(pending(&[9080]), Duration::from_secs(30), &cancel)
            .await;

        assert!(matches!(result, Err(RegiError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn empty_wait_returns_immediately() {
        let probe = ScriptedProbe::new([]);
        let monitor = PortMonitor::new(probe.clone());
        monitor
            .wait_until_listening(BTreeMap::new(), Duration::ZERO, &CancellationToken::new())
            .await
            .unwrap();
        assert!(probe.calls().is_empty());
    }

    #[test]
    fn parses_listeners_from_proc_tables() {
        let tcp = "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode\n\
   0: 0100007F:1F90 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 1 1 0 100 0 0 10 0\n\
   1: 0100007F:C350 0100007F:1F90 01 00000000:00000000 00:00000000 00000000  1000        0 2 1 0 20 4 30 10 -1\n";
        let listeners = parse_proc_net_tcp(tcp);
        assert_eq!(listeners.len(), 1);
        assert_eq!(listeners[0].port(), 8080);
        #[cfg(target_endian = "little")]
        assert_eq!(listeners[0].ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));

        let tcp6 = "  sl  local_address                         remote_address                        st\n\
   0: 00000000000000000000000000000000:0BB8 00000000000000000000000000000000:0000 0A 00000000:00000000\n";
        let listeners = parse_proc_net_tcp(tcp6);
        assert_eq!(listeners, vec!["[::]:3000".parse::<SocketAddr>().unwrap()]);
    }

    #[test]
    fn netstat_matching_on_mac_uses_dotted_ports() {
        let netstat = "Active Internet connections (including servers)\n\
Proto Recv-Q Send-Q  Local Address          Foreign Address        (state)\n\
tcp4       0      0  127.0.0.1.8080         *.*                    LISTEN\n\
tcp4       0      0  192.168.1.5.53483      17.57.144.10.443       ESTABLISHED\n\
tcp46      0      0  *.5000                 *.*                    listen\n";
        assert!(contains_netstat_port(Platform::Mac, netstat, 8080));
        assert!(contains_netstat_port(Platform::Mac, netstat, 5000));
        assert!(!contains_netstat_port(Platform::Mac, netstat, 8888));
        assert!(!contains_netstat_port(Platform::Mac, netstat, 53483));
        assert!(!contains_netstat_port(Platform::Mac, netstat, 80));
    }

    #[test]
    fn netstat_matching_elsewhere_uses_colon_ports() {
        let netstat = "Active Internet connections (servers and established)\r\n\
Proto Recv-Q Send-Q Local Address           Foreign Address         State\r\n\
tcp        0      0 0.0.0.0:5000            0.0.0.0:*               LISTEN\r\n\
tcp        0      0 127.0.0.1:50000         127.0.0.1:5000          ESTABLISHED\r\n\
tcp6       0      0 :::3000                 :::*                    LISTEN\r\n";
        for platform in [Platform::Linux, Platform::WindowsLinux, Platform::Windows] {
            assert!(contains_netstat_port(platform, netstat, 5000));
            assert!(contains_netstat_port(platform, netstat, 3000));
            assert!(!contains_netstat_port(platform, netstat, 50000));
            assert!(!contains_netstat_port(platform, netstat, 500));
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn system_probe_sees_a_bound_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let monitor = PortMonitor::system(Platform::Linux);

        assert!(monitor.is_listening(port).await);
        drop(listener);
    }
}
