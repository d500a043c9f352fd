//! The active prober: partitions a shrinking `[lowest, highest]` window
//! into candidate packet sizes, sends a pass, listens for echoes, and
//! narrows the window until the observed high-water mark has held for
//! three consecutive rounds with its next-larger neighbour having been
//! tried and lost.
//!
//! Polls at a fixed interval, growing a backoff on empty rounds and
//! resetting it on any reply.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::address::Address;
use crate::error::{NetError, NetResult};
use crate::poller::{Poller, Polled};
use crate::socket::{MtuDiscover, Socket};

use super::{family_min, overhead, DEFAULT_MTU_MAX, HARD_CEILING};

type BeforeSend = dyn FnMut(u32, &mut [u8]) + Send;
type AfterRecv = dyn FnMut(&[u8]) + Send;

/// Latency/throughput bookkeeping the default hooks populate.
#[derive(Debug, Clone, Copy, Default)]
pub struct Telemetry {
    pub sent: u64,
    pub received: u64,
    pub min_latency: Option<Duration>,
    pub max_latency: Option<Duration>,
    avg_accum: Duration,
}

impl Telemetry {
    pub fn avg_latency(&self) -> Option<Duration> {
        if self.received == 0 {
            None
        } else {
            Some(self.avg_accum / self.received as u32)
        }
    }

    fn observe(&mut self, latency: Duration) {
        self.received += 1;
        self.avg_accum += latency;
        self.min_latency = Some(self.min_latency.map_or(latency, |m| m.min(latency)));
        self.max_latency = Some(self.max_latency.map_or(latency, |m| m.max(latency)));
    }
}

/// Builds and runs a single MTU probe session against one destination.
pub struct MtuProber {
    socket: Socket,
    far: Address,
    mtu_min: u32,
    mtu_max: u32,
    interval: Duration,
    before_send: Box<BeforeSend>,
    after_recv: Box<AfterRecv>,
    telemetry: Arc<Mutex<Telemetry>>,
}

impl MtuProber {
    /// `near` is the local bind address, `far` the destination. Both must
    /// be set (not the zero address) before `run`.
    pub fn new(near: Address, far: Address) -> Self {
        let is_v4 = far.is_ipv4();
        let telemetry = Arc::new(Mutex::new(Telemetry::default()));

        let t1 = telemetry.clone();
        let before_send: Box<BeforeSend> = Box::new(move |_size, buf| {
            if buf.len() >= 8 {
                let micros = now_micros();
                buf[0..8].copy_from_slice(&micros.to_le_bytes());
            }
            t1.lock().unwrap().sent += 1;
        });

        let t2 = telemetry.clone();
        let after_recv: Box<AfterRecv> = Box::new(move |buf| {
            if buf.len() >= 8 {
                let sent_micros = u64::from_le_bytes(buf[0..8].try_into().unwrap());
                let now = now_micros();
                let latency = Duration::from_micros(now.saturating_sub(sent_micros));
                t2.lock().unwrap().observe(latency);
            }
        });

        let mut socket = Socket::new();
        socket.set_near(near);
        socket.set_far(far);
        socket.construct_udp();
        socket.set_opt_mtu_discover(MtuDiscover::Probe);
        socket.bind();
        socket.connect();

        Self {
            socket,
            far,
            mtu_min: family_min(is_v4),
            mtu_max: DEFAULT_MTU_MAX,
            interval: Duration::from_millis(500),
            before_send,
            after_recv,
            telemetry,
        }
    }

    pub fn with_mtu_min(mut self, v: u32) -> Self {
        self.mtu_min = v;
        self
    }

    pub fn with_mtu_max(mut self, v: u32) -> Self {
        self.mtu_max = v;
        self
    }

    pub fn with_interval(mut self, v: Duration) -> Self {
        self.interval = v;
        self
    }

    /// Applies a DSCP/TOS byte (see [`crate::dscp`]) to the probe socket.
    /// Safe to call after the socket has already been bound/connected —
    /// `IP_TOS`/`IPV6_TCLASS` affects packets sent from this point on, not
    /// the bind itself.
    pub fn with_dscp(mut self, tos: u8) -> Self {
        self.socket.set_opt_dscp(tos);
        self
    }

    pub fn with_before_send(mut self, f: impl FnMut(u32, &mut [u8]) + Send + 'static) -> Self {
        self.before_send = Box::new(f);
        self
    }

    pub fn with_after_recv(mut self, f: impl FnMut(&[u8]) + Send + 'static) -> Self {
        self.after_recv = Box::new(f);
        self
    }

    pub fn telemetry(&self) -> Telemetry {
        *self.telemetry.lock().unwrap()
    }

    fn validate(&mut self) -> NetResult<()> {
        self.socket.done()?;
        let is_v4 = self.far.is_ipv4();
        if self.mtu_min < family_min(is_v4) {
            return Err(NetError::argument(format!(
                "mtu_min {} is below the family minimum {}",
                self.mtu_min,
                family_min(is_v4)
            )));
        }
        if self.mtu_max > HARD_CEILING {
            return Err(NetError::argument(format!("mtu_max {} exceeds the hard ceiling {HARD_CEILING}", self.mtu_max)));
        }
        if self.mtu_min > self.mtu_max {
            return Err(NetError::argument(format!("mtu_min {} > mtu_max {}", self.mtu_min, self.mtu_max)));
        }
        if self.far.is_either_zero() {
            return Err(NetError::argument("far address must have both IP and port set"));
        }
        Ok(())
    }

    /// Reads the kernel-cached PMTU for the connected destination
    /// (`IP_MTU`/`IPV6_MTU`). Only meaningful on a connected socket.
    fn read_ip_mtu(&self) -> NetResult<u32> {
        let fd = self
            .socket
            .as_raw_fd_checked()
            .ok_or_else(|| NetError::lifecycle("read_ip_mtu: socket not constructed"))?;
        let mut mtu: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        let (level, opt) = if self.far.is_ipv4() {
            (libc::IPPROTO_IP, libc::IP_MTU)
        } else {
            (libc::IPPROTO_IPV6, libc::IPV6_MTU)
        };
        let ret = unsafe {
            libc::getsockopt(fd, level, opt, &mut mtu as *mut _ as *mut libc::c_void, &mut len)
        };
        if ret < 0 {
            return Err(NetError::kernel("getsockopt(IP_MTU)", std::io::Error::last_os_error()));
        }
        Ok(mtu as u32)
    }

    /// Partitions `[lowest, highest]` into up to 9 sorted, deduplicated
    /// candidate sizes (8 equal parts plus the endpoint). If the previous
    /// round succeeded exactly at `lowest`, `lowest + 1` is folded in too.
    fn partition(lowest: u32, highest: u32, succeeded_at_lowest: bool) -> Vec<u32> {
        let mut out = Vec::with_capacity(10);
        let span = highest.saturating_sub(lowest);
        for k in 0..=8u32 {
            out.push(lowest + span * k / 8);
        }
        if succeeded_at_lowest && lowest + 1 < highest {
            out.push(lowest + 1);
        }
        out.sort_unstable();
        out.dedup();
        out
    }

    /// Folds one round's received payload lengths into the convergence
    /// state, returning the updated `(hi_received, stable_rounds, lowest,
    /// succeeded_at_lowest)`. `hi_received` tracks a running maximum across
    /// rounds, the same way `lowest` does — a round whose replies arrive
    /// smaller-size-first must not regress it.
    #[allow(clippy::too_many_arguments)]
    fn fold_round(
        mut hi_received: Option<u32>,
        mut stable_rounds: u32,
        mut lowest: u32,
        mut succeeded_at_lowest: bool,
        highest: u32,
        oh: u32,
        payload_lens: &[u32],
    ) -> (Option<u32>, u32, u32, bool) {
        for &payload_len in payload_lens {
            let got = (payload_len + oh).min(highest);
            let new_hi = hi_received.map_or(got, |h| h.max(got));
            if Some(new_hi) == hi_received {
                stable_rounds += 1;
            } else {
                hi_received = Some(new_hi);
                stable_rounds = 1;
            }
            if got == lowest {
                succeeded_at_lowest = true;
            }
            lowest = lowest.max(got);
        }
        (hi_received, stable_rounds, lowest, succeeded_at_lowest)
    }

    /// Runs the convergence loop until a PMTU is decided or `overall`
    /// elapses.
    pub fn run(&mut self, overall: Duration) -> NetResult<u32> {
        self.validate()?;

        let is_v4 = self.far.is_ipv4();
        let oh = overhead(is_v4);
        let hint = self.read_ip_mtu().ok().filter(|h| *h > self.mtu_min && *h <= self.mtu_max);

        let mut lowest = self.mtu_min;
        let mut highest = self.mtu_max;
        let mut extra_candidate = hint;
        let mut hi_received: Option<u32> = None;
        let mut stable_rounds = 0u32;
        let mut probe_backoff = self.interval;
        let mut succeeded_at_lowest = false;

        let deadline = Instant::now() + overall;
        let fd = self
            .socket
            .as_raw_fd_checked()
            .ok_or_else(|| NetError::lifecycle("run: socket not constructed"))?;

        let mut poller = Poller::open()?;
        let replies: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        let replies_clone = replies.clone();
        let far = self.far;
        poller.add(Polled::new(fd).with_input(move || {
            let mut buf = vec![0u8; HARD_CEILING as usize];
            let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
            let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            let n = unsafe {
                libc::recvfrom(
                    fd,
                    buf.as_mut_ptr() as *mut _,
                    buf.len(),
                    0,
                    &mut storage as *mut _ as *mut libc::sockaddr,
                    &mut len,
                )
            };
            if n < 0 {
                return Ok(true);
            }
            let addr_buf =
                unsafe { std::slice::from_raw_parts(&storage as *const _ as *const u8, len as usize) };
            let from = Address::from_name_bytes(addr_buf).unwrap_or_default();
            if from != far {
                trace!(%from, "stray packet during MTU probe, ignored");
                return Ok(true);
            }
            buf.truncate(n as usize);
            replies_clone.lock().unwrap().push(buf);
            Ok(true)
        }))?;

        loop {
            if Instant::now() >= deadline {
                return Err(NetError::Timeout);
            }

            let mut candidates = Self::partition(lowest, highest, succeeded_at_lowest);
            if let Some(extra) = extra_candidate.take() {
                if extra > lowest && extra < highest {
                    candidates.push(extra);
                    candidates.sort_unstable();
                    candidates.dedup();
                }
            }

            let mut restart_window = false;
            for &size in &candidates {
                let payload_len = size.saturating_sub(oh).max(8) as usize;
                let mut buf = vec![0u8; payload_len];
                (self.before_send)(size, &mut buf);
                match self.socket.send(&buf) {
                    Ok(_) => {}
                    Err(e) if e.is_msg_size() => {
                        if let Ok(mtu) = self.read_ip_mtu() {
                            highest = mtu.saturating_sub(1).max(lowest);
                            debug!(new_highest = highest, "EMSGSIZE, kernel learned smaller PMTU");
                        }
                        restart_window = true;
                        break;
                    }
                    Err(e) if e.is_conn_refused() => {
                        warn!("ECONNREFUSED during probe, peer not listening yet");
                        std::thread::yield_now();
                        restart_window = true;
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }
            if restart_window {
                continue;
            }

            replies.lock().unwrap().clear();
            poller.poll_for(self.interval + probe_backoff)?;
            let collected: Vec<_> = replies.lock().unwrap().drain(..).collect();

            if collected.is_empty() {
                probe_backoff = (probe_backoff + self.interval).min(Duration::from_secs(60));
            } else {
                probe_backoff = self.interval;
                for payload in &collected {
                    (self.after_recv)(payload);
                }
                let payload_lens: Vec<u32> = collected.iter().map(|p| p.len() as u32).collect();
                let (new_hi, new_stable, new_lowest, new_succ) =
                    Self::fold_round(hi_received, stable_rounds, lowest, succeeded_at_lowest, highest, oh, &payload_lens);
                hi_received = new_hi;
                stable_rounds = new_stable;
                lowest = new_lowest;
                succeeded_at_lowest = new_succ;
            }

            if lowest >= highest {
                hi_received = Some(lowest);
                break;
            }

            if let Some(hr) = hi_received {
                if stable_rounds >= 3 && candidates.contains(&(hr + 1)) {
                    break;
                }
            }
        }

        let pmtu = hi_received.unwrap_or(lowest);
        // The kernel's own route-cache readback is only trustworthy as a
        // refinement within the window we actually probed: on loopback (and
        // some tunnels) IP_MTU reports the raw interface MTU, which can sit
        // above mtu_max or even HARD_CEILING and would silently overrule a
        // correctly converged, smaller PMTU.
        let pmtu = match self.read_ip_mtu() {
            Ok(final_mtu) if final_mtu >= lowest && final_mtu <= self.mtu_max => final_mtu,
            _ => pmtu,
        };
        Ok(pmtu)
    }
}

fn now_micros() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_micros() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_produces_nine_sorted_candidates_by_default() {
        let c = MtuProber::partition(576, 9216, false);
        assert_eq!(c.first(), Some(&576));
        assert_eq!(c.last(), Some(&9216));
        assert!(c.windows(2).all(|w| w[0] < w[1]));
        assert!(c.len() <= 9);
    }

    #[test]
    fn partition_adds_lowest_plus_one_on_success_at_lowest() {
        let c = MtuProber::partition(576, 9216, true);
        assert!(c.contains(&577));
    }

    #[test]
    fn telemetry_tracks_min_avg_max() {
        let mut t = Telemetry::default();
        t.observe(Duration::from_millis(10));
        t.observe(Duration::from_millis(30));
        assert_eq!(t.min_latency, Some(Duration::from_millis(10)));
        assert_eq!(t.max_latency, Some(Duration::from_millis(30)));
        assert_eq!(t.avg_latency(), Some(Duration::from_millis(20)));
    }

    #[test]
    fn fold_round_tracks_a_running_maximum_regardless_of_arrival_order() {
        // Round 1: a reply with payload 1200 arrives (size 1228 with oh=28).
        let (hi, stable, lowest, succ) = MtuProber::fold_round(None, 0, 1000, false, 9216, 28, &[1200]);
        assert_eq!(hi, Some(1228));
        assert_eq!(stable, 1);

        // Round 2: the same size arrives again, followed by a *smaller*
        // reply (payload 1100, size 1128) — hi_received must not regress
        // to the smaller value just because it was processed last.
        let (hi2, stable2, lowest2, _succ2) = MtuProber::fold_round(hi, stable, lowest, succ, 9216, 28, &[1200, 1100]);
        assert_eq!(hi2, Some(1228), "hi_received regressed below a previously confirmed maximum");
        assert_eq!(stable2, 3, "both replies in a round with no new maximum should extend stability");
        assert_eq!(lowest2, 1228);
    }

    #[test]
    fn fold_round_resets_stability_when_a_new_maximum_appears() {
        let (hi, stable, ..) = MtuProber::fold_round(Some(1228), 2, 1228, true, 9216, 28, &[1300]);
        assert_eq!(hi, Some(1328));
        assert_eq!(stable, 1, "a strictly larger reply must reset the stable-round counter");
    }

    #[test]
    fn with_dscp_applies_tos_without_erroring() {
        let near = Address::from_ip_port(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST), 0);
        let far = Address::from_ip_port(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST), 19333);
        let mut prober = MtuProber::new(near, far).with_dscp(crate::dscp::lookup("EF").unwrap());
        prober.validate().unwrap();
    }
}
