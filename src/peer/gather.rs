//! Server-reflexive candidate gathering state
//!
//! Sans-IO: the driver resolves STUN servers, sends the requests produced here
//! from the media socket and feeds every inbound datagram back in.

use std::{net::SocketAddr, time::Instant};

use bytes::Bytes;
use tracing::{debug, warn};

use crate::util::stun::{self, TransactionId};

#[derive(Debug)]
struct InFlight {
    tid: TransactionId,
    server: SocketAddr,
    url: String,
}

#[derive(Debug)]
pub(super) struct Gatherer {
    in_flight: Vec<InFlight>,
    deadline: Instant,
    complete: bool,
    reported: bool,
}

impl Gatherer {
    pub fn new(deadline: Instant) -> Gatherer {
        Gatherer {
            in_flight: vec![],
            deadline,
            complete: false,
            reported: false,
        }
    }

    /// Registers a Binding request towards `server`, returning the datagram.
    pub fn request(&mut self, url: &str, server: SocketAddr) -> Bytes {
        let (tid, datagram) = stun::binding_request();
        self.in_flight.push(InFlight {
            tid,
            server,
            url: url.to_string(),
        });
        datagram
    }

    /// All requests are registered; with none in flight gathering is done.
    pub fn start(&mut self) {
        if self.in_flight.is_empty() {
            self.complete = true;
        }
    }

    /// Consumes `datagram` if it answers one of our requests and returns the
    /// reflexive address it carried.
    ///
    /// Returns `None` for traffic that belongs to the ICE agent.
    pub fn handle(&mut self, datagram: &[u8], source: SocketAddr) -> Option<Option<SocketAddr>> {
        let tid = stun::transaction_id(datagram)?;
        let idx = self
            .in_flight
            .iter()
            .position(|r| r.tid == tid && r.server == source)?;
        let request = self.in_flight.swap_remove(idx);

        let mapped = match stun::decode_binding_response(datagram) {
            Ok((_, addr)) => {
                debug!("{} maps us to {}", request.url, addr);
                Some(addr)
            }
            Err(e) => {
                warn!("STUN server {} answered badly: {}", request.url, e);
                None
            }
        };

        if self.in_flight.is_empty() {
            self.complete = true;
        }

        Some(mapped)
    }

    /// Drives the deadline forward.
    pub fn handle_timeout(&mut self, now: Instant) {
        if self.complete || now < self.deadline {
            return;
        }
        for r in self.in_flight.drain(..) {
            warn!("STUN server {} ({}) did not answer", r.url, r.server);
        }
        self.complete = true;
    }

    /// Next instant the gatherer needs a timeout, if still running.
    pub fn poll_timeout(&self) -> Option<Instant> {
        (!self.complete).then_some(self.deadline)
    }

    /// True exactly once, when gathering has finished.
    pub fn poll_complete(&mut self) -> bool {
        if self.complete && !self.reported {
            self.reported = true;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};
    use std::time::Duration;

    fn success(tid: &[u8], mapped: SocketAddr) -> Vec<u8> {
        let SocketAddr::V4(v4) = mapped else {
            panic!("v4 only")
        };
        let mut msg = BytesMut::new();
        msg.put_u16(0x0101);
        msg.put_u16(12);
        msg.put_u32(stun::MAGIC_COOKIE);
        msg.put_slice(tid);
        msg.put_u16(0x0020);
        msg.put_u16(8);
        msg.put_u8(0);
        msg.put_u8(1);
        msg.put_u16(v4.port() ^ (stun::MAGIC_COOKIE >> 16) as u16);
        msg.put_u32(u32::from(*v4.ip()) ^ stun::MAGIC_COOKIE);
        msg.to_vec()
    }

    #[test]
    fn completes_when_every_server_answered() {
        let server: SocketAddr = "203.0.113.1:3478".parse().unwrap();
        let mapped: SocketAddr = "198.51.100.20:40000".parse().unwrap();

        let mut g = Gatherer::new(Instant::now() + Duration::from_secs(2));
        let req = g.request("stun:stun.example.test", server);
        g.start();
        assert!(!g.poll_complete());

        // ICE agent traffic and answers from elsewhere are left alone.
        assert_eq!(g.handle(b"not stun at all, definitely", server), None);
        let reply = success(&req[8..20], mapped);
        assert_eq!(g.handle(&reply, "203.0.113.9:3478".parse().unwrap()), None);

        assert_eq!(g.handle(&reply, server), Some(Some(mapped)));
        assert!(g.poll_complete());
        assert!(!g.poll_complete());
        assert_eq!(g.poll_timeout(), None);
    }

    #[test]
    fn deadline_ends_gathering() {
        let start = Instant::now();
        let mut g = Gatherer::new(start + Duration::from_millis(100));
        g.request("stun:a", "203.0.113.1:3478".parse().unwrap());
        g.start();

        g.handle_timeout(start);
        assert!(!g.poll_complete());
        g.handle_timeout(start + Duration::from_millis(100));
        assert!(g.poll_complete());
    }

    #[test]
    fn nothing_to_gather() {
        let mut g = Gatherer::new(Instant::now());
        g.start();
        assert!(g.poll_complete());
    }
}
