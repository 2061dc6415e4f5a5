//! Trickle ICE bookkeeping
//!
//! Candidates gathered before the WHIP server handed out a resource URL are
//! parked in a [`CandidateQueue`]. Once the URL is known each one is wrapped
//! in an [`IceFragment`] body and PATCHed in discovery order.

use std::collections::VecDeque;

/// FIFO of candidate lines waiting for the resource URL.
#[derive(Debug, Default)]
pub struct CandidateQueue {
    pending: VecDeque<String>,
    discovered: usize,
}

impl CandidateQueue {
    pub fn new() -> CandidateQueue {
        CandidateQueue::default()
    }

    pub fn push(&mut self, candidate: String) {
        self.discovered += 1;
        self.pending.push_back(candidate);
    }

    /// Removes all queued candidates, oldest first.
    pub fn drain(&mut self) -> impl Iterator<Item = String> + '_ {
        self.pending.drain(..)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Number of candidates ever pushed.
    pub fn discovered(&self) -> usize {
        self.discovered
    }
}

/// ICE credentials and media identification needed for
/// `application/trickle-ice-sdpfrag` bodies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceFragment {
    ufrag: String,
    pwd: String,
    media: String,
    mid: String,
}

impl IceFragment {
    /// Pulls the ICE credentials and the first media section out of an offer.
    ///
    /// Session level `ice-ufrag`/`ice-pwd` win over media level ones. With
    /// BUNDLE every candidate belongs to the first media section.
    pub fn from_offer(sdp: &str) -> Option<IceFragment> {
        let mut ufrag = None;
        let mut pwd = None;
        let mut media = None;
        let mut mid = None;

        for line in sdp.lines().map(str::trim_end) {
            if let Some(m) = line.strip_prefix("m=") {
                if media.is_some() {
                    // Only the first m-section is relevant, but its
                    // credentials may still follow in a later section.
                    if ufrag.is_some() && pwd.is_some() {
                        break;
                    }
                    continue;
                }
                media = Some(m.to_string());
            } else if let Some(v) = line.strip_prefix("a=ice-ufrag:") {
                ufrag.get_or_insert_with(|| v.to_string());
            } else if let Some(v) = line.strip_prefix("a=ice-pwd:") {
                pwd.get_or_insert_with(|| v.to_string());
            } else if let Some(v) = line.strip_prefix("a=mid:") {
                if mid.is_none() && media.is_some() {
                    mid = Some(v.to_string());
                }
            }
        }

        let media = media?;
        // The port and protocol of an sdpfrag m-line are placeholders.
        let kind = media.split_whitespace().next()?;
        let formats: Vec<&str> = media.split_whitespace().skip(3).collect();
        let format = formats.first().copied().unwrap_or("0");

        Some(IceFragment {
            ufrag: ufrag?,
            pwd: pwd?,
            media: format!("{kind} 9 RTP/AVP {format}"),
            mid: mid?,
        })
    }

    /// Body carrying a single candidate.
    pub fn body(&self, candidate: &str) -> String {
        let candidate = normalize_candidate(candidate);
        format!(
            "a=ice-ufrag:{}\r\na=ice-pwd:{}\r\nm={}\r\na=mid:{}\r\na={}\r\n",
            self.ufrag, self.pwd, self.media, self.mid, candidate
        )
    }

    pub fn ufrag(&self) -> &str {
        &self.ufrag
    }

    pub fn mid(&self) -> &str {
        &self.mid
    }
}

/// Strips framing so both `a=candidate:...\r\n` and `candidate:...` end up
/// as `candidate:...`.
pub fn normalize_candidate(candidate: &str) -> &str {
    let c = candidate.trim();
    c.strip_prefix("a=").unwrap_or(c)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const OFFER: &str = "v=0\r\n\
        o=- 1 1 IN IP4 0.0.0.0\r\n\
        s=-\r\n\
        t=0 0\r\n\
        a=group:BUNDLE 0 1\r\n\
        m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
        c=IN IP4 0.0.0.0\r\n\
        a=mid:0\r\n\
        a=ice-ufrag:EsAw\r\n\
        a=ice-pwd:P2uYro0UCOQ4zxjKXaWCBui1\r\n\
        a=sendonly\r\n\
        m=video 9 UDP/TLS/RTP/SAVPF 96 97\r\n\
        a=mid:1\r\n\
        a=ice-ufrag:EsAw\r\n\
        a=ice-pwd:P2uYro0UCOQ4zxjKXaWCBui1\r\n";

    #[test]
    fn fragment_uses_first_media_section() {
        let frag = IceFragment::from_offer(OFFER).expect("fragment");
        assert_eq!(frag.ufrag(), "EsAw");
        assert_eq!(frag.mid(), "0");

        let body = frag.body("candidate:1 1 udp 2122260223 192.0.2.1 61764 typ host");
        assert_eq!(
            body,
            "a=ice-ufrag:EsAw\r\n\
             a=ice-pwd:P2uYro0UCOQ4zxjKXaWCBui1\r\n\
             m=audio 9 RTP/AVP 111\r\n\
             a=mid:0\r\n\
             a=candidate:1 1 udp 2122260223 192.0.2.1 61764 typ host\r\n"
        );
    }

    #[test]
    fn fragment_accepts_framed_candidate_lines() {
        let frag = IceFragment::from_offer(OFFER).unwrap();
        let framed = frag.body("a=candidate:2 1 udp 1 198.51.100.7 5000 typ srflx\r\n");
        assert!(framed.contains("\r\na=candidate:2 1 udp 1 198.51.100.7 5000 typ srflx\r\n"));
        assert!(!framed.contains("a=a="));
    }

    #[test]
    fn fragment_requires_credentials() {
        let sdp = "v=0\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\na=mid:0\r\n";
        assert!(IceFragment::from_offer(sdp).is_none());
    }

    #[test]
    fn queue_counts_discovered_candidates() {
        let mut q = CandidateQueue::new();
        q.push("a".into());
        q.push("b".into());
        assert_eq!(q.len(), 2);
        let drained: Vec<_> = q.drain().collect();
        assert_eq!(drained, vec!["a", "b"]);
        assert!(q.is_empty());
        assert_eq!(q.discovered(), 2);
    }

    proptest! {
        #[test]
        fn queue_flushes_in_discovery_order(
            batches in prop::collection::vec(prop::collection::vec("[a-z0-9]{1,8}", 0..5), 1..5)
        ) {
            let mut q = CandidateQueue::new();
            let mut flushed = vec![];
            for batch in &batches {
                for c in batch {
                    q.push(c.clone());
                }
                flushed.extend(q.drain());
            }
            let expected: Vec<String> = batches.into_iter().flatten().collect();
            prop_assert_eq!(flushed, expected);
        }
    }
}
