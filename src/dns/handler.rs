//! DNS Query Handler
//!
//! Turns one inbound query into exactly one reply:
//!
//! 1. No question: empty non-authoritative reply, nothing recorded.
//! 2. A/AAAA for a listed domain (or a parent) without a live bypass for
//!    this client: sinkhole answer, recorded as blocked.
//! 3. Everything else: recorded as forwarded and relayed from the first
//!    upstream that answers, or SERVFAIL when none does.
//!
//! Until a blocklist has loaded nothing matches, so every query is forwarded.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use tracing::{debug, error, info};

use super::upstream::Forwarder;
use super::wire::{self, Header, Question, RCODE_FORMERR, RCODE_SERVFAIL, TYPE_A, TYPE_AAAA};
use crate::blocklist::BlocklistClient;
use crate::session::SessionStore;
use crate::stats::StatsCollector;
use crate::types::{canonical_ip, normalize_domain, BlockedDomainInfo};

/// How a query was answered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Empty,
    Blocked,
    Forwarded,
    ServerFailure,
    FormatError,
}

#[derive(Debug, Clone)]
pub struct HandledQuery {
    pub response: Vec<u8>,
    pub disposition: Disposition,
}

/// Addresses and TTL used for sinkhole answers
#[derive(Debug, Clone, Copy)]
pub struct Sinkhole {
    pub ipv4: Ipv4Addr,
    pub ipv6: Ipv6Addr,
    pub ttl: u32,
}

impl Default for Sinkhole {
    fn default() -> Self {
        Self {
            ipv4: Ipv4Addr::UNSPECIFIED,
            ipv6: Ipv6Addr::UNSPECIFIED,
            ttl: 60,
        }
    }
}

pub struct QueryHandler {
    blocklist: Arc<BlocklistClient>,

    /// `None` when bypass is disabled: every match is sinkholed
    sessions: Option<Arc<SessionStore>>,

    stats: Arc<StatsCollector>,
    forwarder: Forwarder,
    sinkhole: Sinkhole,
}

impl QueryHandler {
    pub fn new(
        blocklist: Arc<BlocklistClient>,
        sessions: Option<Arc<SessionStore>>,
        stats: Arc<StatsCollector>,
        forwarder: Forwarder,
        sinkhole: Sinkhole,
    ) -> Self {
        Self {
            blocklist,
            sessions,
            stats,
            forwarder,
            sinkhole,
        }
    }

    /// Handle one raw query from `client`
    ///
    /// Returns `None` only when the packet has no readable header; such
    /// packets are dropped without a reply.
    pub async fn handle(&self, packet: &[u8], client: IpAddr) -> Option<HandledQuery> {
        let header = match Header::parse(packet) {
            Ok(header) => header,
            Err(e) => {
                debug!("Dropping packet from {}: {}", client, e);
                return None;
            }
        };

        if header.qdcount == 0 {
            return Some(HandledQuery {
                response: wire::empty_reply(&header),
                disposition: Disposition::Empty,
            });
        }

        let question = match wire::parse_question(packet) {
            Ok(question) => question,
            Err(e) => {
                debug!("Malformed question from {}: {}", client, e);
                return Some(HandledQuery {
                    response: wire::error_reply(&header, None, RCODE_FORMERR),
                    disposition: Disposition::FormatError,
                });
            }
        };

        let domain = normalize_domain(&question.name);
        let client = canonical_ip(client);
        debug!("DNS query: {} type {} from {}", domain, question.qtype, client);

        if question.qtype == TYPE_A || question.qtype == TYPE_AAAA {
            if let Some(response) = self.try_block(&header, &question, &domain, client).await {
                return Some(HandledQuery {
                    response,
                    disposition: Disposition::Blocked,
                });
            }
        }

        self.stats.record_query();

        match self.forwarder.forward(packet).await {
            Ok(response) => Some(HandledQuery {
                response,
                disposition: Disposition::Forwarded,
            }),
            Err(e) => {
                error!("Forwarding {} for {} failed: {}", domain, client, e);
                Some(HandledQuery {
                    response: wire::error_reply(&header, Some(&question), RCODE_SERVFAIL),
                    disposition: Disposition::ServerFailure,
                })
            }
        }
    }

    /// Sinkhole reply if the domain is listed and the client holds no bypass
    async fn try_block(
        &self,
        header: &Header,
        question: &Question,
        domain: &str,
        client: IpAddr,
    ) -> Option<Vec<u8>> {
        let entry = self.blocklist.lookup(domain).await?;

        if let Some(sessions) = &self.sessions {
            if sessions.has_bypass(&client.to_string(), domain).await {
                debug!("Bypass active for {} -> {}, forwarding", client, domain);
                return None;
            }
        }

        // Tallied under the listed domain, not the queried name
        self.stats.record_block(&normalize_domain(&entry.domain));
        info!(
            "🚫 Blocked {} for {} ({}: {})",
            domain, client, entry.employer, entry.action_details.action_type
        );

        let addr = if question.qtype == TYPE_AAAA {
            IpAddr::V6(self.sinkhole.ipv6)
        } else {
            IpAddr::V4(self.sinkhole.ipv4)
        };

        Some(wire::sinkhole_reply(header, question, addr, self.sinkhole.ttl))
    }

    /// Dispute record for a domain, if it is blocked
    pub async fn blocked_domain_info(&self, domain: &str) -> Option<BlockedDomainInfo> {
        let domain = normalize_domain(domain);
        let entry = self.blocklist.lookup(&domain).await?;
        Some(BlockedDomainInfo::from_entry(&domain, &entry))
    }
}
