//! Record and message builders, and a recorded-response transport.
//!
//! This module is compiled unconditionally so that integration tests (and
//! downstream consumers writing their own) can drive the traverser against
//! fixtures instead of the network.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA, CNAME, NS, SOA};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use hickory_proto::ProtoError;

use crate::util::net::{ExchangeError, Exchanger};
use crate::util::types::fqdn;

const TTL: u32 = 300;

/// Parse a domain name, panicking on bad input.
pub fn name(s: &str) -> Name {
    fqdn(s).unwrap_or_else(|err| panic!("invalid domain name '{s}': {err}"))
}

pub fn query(qname: &str, qtype: RecordType) -> Query {
    let mut q = Query::new();
    q.set_name(name(qname));
    q.set_query_type(qtype);
    q
}

pub fn a_record(owner: &str, address: Ipv4Addr) -> Record {
    Record::from_rdata(name(owner), TTL, RData::A(A(address)))
}

pub fn aaaa_record(owner: &str, address: Ipv6Addr) -> Record {
    Record::from_rdata(name(owner), TTL, RData::AAAA(AAAA(address)))
}

pub fn cname_record(owner: &str, target: &str) -> Record {
    Record::from_rdata(name(owner), TTL, RData::CNAME(CNAME(name(target))))
}

pub fn ns_record(zone: &str, target: &str) -> Record {
    Record::from_rdata(name(zone), TTL, RData::NS(NS(name(target))))
}

pub fn soa_record(zone: &str) -> Record {
    let soa = SOA::new(
        name(&format!("ns1.{}", zone.trim_start_matches('.'))),
        name(&format!("hostmaster.{}", zone.trim_start_matches('.'))),
        1,
        3600,
        600,
        604_800,
        TTL,
    );
    Record::from_rdata(name(zone), TTL, RData::SOA(soa))
}

/// A NOERROR response to `q` with the given sections.
pub fn response(
    q: &Query,
    answers: &[Record],
    authority: &[Record],
    additionals: &[Record],
) -> Message {
    let mut message = Message::new();
    message.set_id(0);
    message.set_message_type(MessageType::Response);
    message.set_op_code(OpCode::Query);
    message.add_query(q.clone());
    for rr in answers {
        message.add_answer(rr.clone());
    }
    for rr in authority {
        message.add_name_server(rr.clone());
    }
    for rr in additionals {
        message.add_additional(rr.clone());
    }
    message
}

/// An empty response to `q` with the given rcode.
pub fn rcode_response(q: &Query, rcode: ResponseCode) -> Message {
    let mut message = response(q, &[], &[], &[]);
    message.set_response_code(rcode);
    message
}

#[derive(Debug, Clone)]
enum CannedReply {
    Reply(Message),
    Timeout,
    Malformed,
}

/// A transport that replays recorded responses.
///
/// Replies are keyed by `(server ip, query)`; the port is ignored.  Queries
/// with no recorded reply time out, which keeps a missing fixture from
/// looking like an answer.
#[derive(Debug, Clone, Default)]
pub struct FixtureExchanger {
    replies: HashMap<(IpAddr, Query), CannedReply>,
}

impl FixtureExchanger {
    pub fn new() -> Self {
        FixtureExchanger::default()
    }

    /// Record a response for queries to `server` matching `q`.
    pub fn reply(&mut self, server: IpAddr, q: Query, message: Message) {
        self.replies.insert((server, q), CannedReply::Reply(message));
    }

    /// Make queries to `server` matching `q` time out.
    pub fn timeout(&mut self, server: IpAddr, q: Query) {
        self.replies.insert((server, q), CannedReply::Timeout);
    }

    /// Make queries to `server` matching `q` return an undecodable packet.
    pub fn malformed(&mut self, server: IpAddr, q: Query) {
        self.replies.insert((server, q), CannedReply::Malformed);
    }
}

#[async_trait]
impl Exchanger for FixtureExchanger {
    async fn exchange(
        &self,
        server: SocketAddr,
        request: &Message,
    ) -> Result<Message, ExchangeError> {
        let Some(q) = request.queries().first() else {
            return Err(ExchangeError::Timeout);
        };

        match self.replies.get(&(server.ip(), q.clone())) {
            Some(CannedReply::Reply(message)) => {
                let mut message = message.clone();
                message.set_id(request.id());
                Ok(message)
            }
            Some(CannedReply::Timeout) => Err(ExchangeError::Timeout),
            Some(CannedReply::Malformed) => Err(ExchangeError::Decode(ProtoError::from(
                "malformed fixture reply",
            ))),
            None => {
                tracing::warn!(server = %server, query = %q.name(), "no fixture for query");
                Err(ExchangeError::Timeout)
            }
        }
    }
}
