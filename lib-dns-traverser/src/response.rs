//! One query against one server IP, classified.

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use hickory_proto::op::{Edns, Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, Record};
use rand::Rng;

use crate::dist::Outcome;
use crate::msg;
use crate::msg::Warning;
use crate::util::net::{ExchangeError, Exchanger};
use crate::util::types::Bailiwick;

/// DNS servers listen here; the traverser has no business with other ports.
pub const DNS_PORT: u16 = 53;

/// A UDP payload size of 512 means classic DNS: no OPT record is attached.
pub const EDNS0_DISABLED_SIZE: u16 = 512;

/// The classified result of a single send/receive attempt against a single
/// server IP.
#[derive(Debug, Clone)]
pub struct DecodedResponse {
    pub server_ip: IpAddr,
    pub query: Query,
    pub bailiwick: Bailiwick,
    pub outcome: Outcome,
    /// The decoded message, absent on transport failure.
    pub message: Option<Message>,
    /// The in-bailiwick subset of the message's RRs: the only records the
    /// traversal may use from this response.
    pub records: Vec<Record>,
    pub warnings: Vec<Warning>,
    pub rtt: Duration,
}

impl DecodedResponse {
    /// Issue the query to `server_ip` and classify whatever comes back.
    /// Transport and server failures classify; they never escape.
    pub async fn fetch(
        exchanger: &dyn Exchanger,
        server_ip: IpAddr,
        query: &Query,
        bailiwick: &Bailiwick,
        udp_size: u16,
    ) -> DecodedResponse {
        let request = build_request(query, false, udp_size);
        let started = Instant::now();
        let result = exchanger
            .exchange(SocketAddr::new(server_ip, DNS_PORT), &request)
            .await;
        let rtt = started.elapsed();

        let mut response = classify(server_ip, query, bailiwick, result);
        response.rtt = rtt;
        response
    }

    /// The end of the answer's CNAME chain, when there is a message to chase
    /// it in.
    pub fn final_name(&self) -> Option<Name> {
        let message = self.message.as_ref()?;
        msg::follow_cnames(
            message,
            self.query.name(),
            self.query.query_type(),
            &self.bailiwick,
        )
    }
}

/// Build a request for `query`.
///
/// The RD bit is clear when talking to authoritative servers; root discovery
/// against the local resolver is the one place that sets it.  EDNS0
/// advertises `udp_size` unless that is 512, which disables EDNS0 entirely.
pub fn build_request(query: &Query, recursion_desired: bool, udp_size: u16) -> Message {
    let mut message = Message::new();
    message.set_id(rand::thread_rng().gen());
    message.set_message_type(MessageType::Query);
    message.set_op_code(OpCode::Query);
    message.set_recursion_desired(recursion_desired);
    message.add_query(query.clone());

    if udp_size > EDNS0_DISABLED_SIZE {
        let mut edns = Edns::new();
        edns.set_max_payload(udp_size);
        edns.set_version(0);
        message.set_edns(edns);
    }

    message
}

/// Classification rules, evaluated in order:
///
/// 1. transport failure;
/// 2. SERVFAIL rcode;
/// 3. NXDOMAIN rcode;
/// 4. failed validation;
/// 5. CNAME chase: a loop, or a moved/settled answer;
/// 6. NS delegation (lame when some owners leave the bailiwick, an error
///    when all do);
/// 7. NODATA;
/// 8. anything else.
fn classify(
    server_ip: IpAddr,
    query: &Query,
    bailiwick: &Bailiwick,
    result: Result<Message, ExchangeError>,
) -> DecodedResponse {
    let mut response = DecodedResponse {
        server_ip,
        query: query.clone(),
        bailiwick: bailiwick.clone(),
        outcome: Outcome::OtherError,
        message: None,
        records: Vec::new(),
        warnings: Vec::new(),
        rtt: Duration::ZERO,
    };

    let message = match result {
        Ok(message) => message,
        Err(ExchangeError::Timeout) => {
            response.outcome = Outcome::Timeout;
            return response;
        }
        Err(ExchangeError::Decode(err)) => {
            response.outcome = Outcome::FormErr;
            response.warnings.push(Warning::Malformed(err.to_string()));
            return response;
        }
        Err(ExchangeError::IdMismatch { expected, got }) => {
            response.outcome = Outcome::OtherError;
            response.warnings.push(Warning::IdMismatch { expected, got });
            return response;
        }
        Err(err) => {
            tracing::debug!(%server_ip, error = %err, "query failed");
            response.outcome = Outcome::OtherError;
            return response;
        }
    };

    response.warnings = msg::message_warnings(&message, false);

    match message.response_code() {
        ResponseCode::ServFail => {
            response.outcome = Outcome::ServFail;
            response.message = Some(message);
            return response;
        }
        ResponseCode::NXDomain => {
            response.outcome = Outcome::NxDomain;
            response.message = Some(message);
            return response;
        }
        _ => (),
    }

    if let Err(warning) = msg::validate(&message, query) {
        response.warnings.push(warning);
        response.outcome = Outcome::OtherError;
        response.message = Some(message);
        return response;
    }

    let filtered = msg::bailiwick_filter(&message, bailiwick);
    if !filtered.bad.is_empty() {
        tracing::debug!(
            %server_ip,
            dropped = filtered.bad.len(),
            "dropped out-of-bailiwick records"
        );
    }
    response.records = filtered.good;

    response.outcome = classify_message(&message, query, bailiwick, &mut response.warnings);
    response.message = Some(message);
    response
}

fn classify_message(
    message: &Message,
    query: &Query,
    bailiwick: &Bailiwick,
    warnings: &mut Vec<Warning>,
) -> Outcome {
    let qname = query.name();
    let qtype = query.query_type();
    let qclass = query.query_class();

    match msg::follow_cnames(message, qname, qtype, bailiwick) {
        None => return Outcome::CnameLoop,
        Some(final_name) => {
            let moved = &final_name != qname;
            let settled = !msg::answers(message, &final_name, qtype, qclass).is_empty();
            if moved || settled {
                return Outcome::Answer;
            }
        }
    }

    let (ns, _, _) = msg::authority_partition(message);
    if !ns.is_empty() {
        let lame: Vec<&Record> = ns
            .iter()
            .filter(|rr| !bailiwick.contains(rr.name()))
            .collect();
        for rr in &lame {
            warnings.push(Warning::LameNs(rr.name().clone()));
        }
        if lame.len() == ns.len() {
            return Outcome::OtherError;
        }
        if lame.is_empty() {
            return Outcome::Referral;
        }
        return Outcome::ReferralLame;
    }

    if msg::is_nodata(message) {
        return Outcome::NoData;
    }

    Outcome::OtherError
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::str::FromStr;
    use std::sync::Arc;

    use hickory_proto::rr::RecordType;

    use super::*;
    use crate::test_util::*;

    const IP: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 53));

    async fn classify_fixture(fixture: FixtureExchanger, q: &Query, bailiwick: &str) -> DecodedResponse {
        let exchanger: Arc<dyn Exchanger> = Arc::new(fixture);
        DecodedResponse::fetch(
            &*exchanger,
            IP,
            q,
            &Bailiwick::from_str(bailiwick).unwrap(),
            4096,
        )
        .await
    }

    #[tokio::test]
    async fn classifies_answer() {
        let q = query("www.example.com.", RecordType::A);
        let mut fixture = FixtureExchanger::new();
        fixture.reply(
            IP,
            q.clone(),
            response(
                &q,
                &[a_record("www.example.com.", Ipv4Addr::new(192, 0, 2, 1))],
                &[],
                &[],
            ),
        );

        let decoded = classify_fixture(fixture, &q, "example.com.").await;
        assert_eq!(Outcome::Answer, decoded.outcome);
        assert_eq!(Some(name("www.example.com.")), decoded.final_name());
    }

    #[tokio::test]
    async fn classifies_cname_redirection_as_answer() {
        let q = query("www.example.com.", RecordType::A);
        let mut fixture = FixtureExchanger::new();
        fixture.reply(
            IP,
            q.clone(),
            response(
                &q,
                &[cname_record("www.example.com.", "w.example.net.")],
                &[],
                &[],
            ),
        );

        let decoded = classify_fixture(fixture, &q, "example.com.").await;
        assert_eq!(Outcome::Answer, decoded.outcome);
        assert_eq!(Some(name("w.example.net.")), decoded.final_name());
    }

    #[tokio::test]
    async fn classifies_cname_loop() {
        let q = query("www.example.com.", RecordType::A);
        let mut fixture = FixtureExchanger::new();
        fixture.reply(
            IP,
            q.clone(),
            response(
                &q,
                &[
                    cname_record("www.example.com.", "bad.example.com."),
                    cname_record("bad.example.com.", "www.example.com."),
                ],
                &[],
                &[],
            ),
        );

        let decoded = classify_fixture(fixture, &q, "example.com.").await;
        assert_eq!(Outcome::CnameLoop, decoded.outcome);
    }

    #[tokio::test]
    async fn classifies_referral() {
        let q = query("www.example.com.", RecordType::A);
        let mut fixture = FixtureExchanger::new();
        fixture.reply(
            IP,
            q.clone(),
            response(
                &q,
                &[],
                &[ns_record("example.com.", "ns1.example.com.")],
                &[a_record("ns1.example.com.", Ipv4Addr::new(192, 0, 2, 10))],
            ),
        );

        let decoded = classify_fixture(fixture, &q, "com.").await;
        assert_eq!(Outcome::Referral, decoded.outcome);
        assert_eq!(2, decoded.records.len());
    }

    #[tokio::test]
    async fn classifies_partially_lame_referral() {
        let q = query("www.example.com.", RecordType::A);
        let mut fixture = FixtureExchanger::new();
        fixture.reply(
            IP,
            q.clone(),
            response(
                &q,
                &[],
                &[
                    ns_record("example.com.", "ns1.example.com."),
                    ns_record("example.net.", "ns1.example.net."),
                ],
                &[],
            ),
        );

        let decoded = classify_fixture(fixture, &q, "com.").await;
        assert_eq!(Outcome::ReferralLame, decoded.outcome);
        assert!(decoded
            .warnings
            .contains(&Warning::LameNs(name("example.net."))));
    }

    #[tokio::test]
    async fn classifies_fully_lame_referral_as_error() {
        let q = query("www.example.com.", RecordType::A);
        let mut fixture = FixtureExchanger::new();
        fixture.reply(
            IP,
            q.clone(),
            response(&q, &[], &[ns_record("example.net.", "ns1.example.net.")], &[]),
        );

        let decoded = classify_fixture(fixture, &q, "com.").await;
        assert_eq!(Outcome::OtherError, decoded.outcome);
    }

    #[tokio::test]
    async fn classifies_nodata() {
        let q = query("www.example.com.", RecordType::AAAA);
        let mut fixture = FixtureExchanger::new();
        fixture.reply(
            IP,
            q.clone(),
            response(&q, &[], &[soa_record("example.com.")], &[]),
        );

        let decoded = classify_fixture(fixture, &q, "example.com.").await;
        assert_eq!(Outcome::NoData, decoded.outcome);
    }

    #[tokio::test]
    async fn classifies_rcodes() {
        let q = query("www.example.com.", RecordType::A);
        let mut fixture = FixtureExchanger::new();
        fixture.reply(IP, q.clone(), rcode_response(&q, ResponseCode::NXDomain));
        let decoded = classify_fixture(fixture, &q, "example.com.").await;
        assert_eq!(Outcome::NxDomain, decoded.outcome);

        let mut fixture = FixtureExchanger::new();
        fixture.reply(IP, q.clone(), rcode_response(&q, ResponseCode::ServFail));
        let decoded = classify_fixture(fixture, &q, "example.com.").await;
        assert_eq!(Outcome::ServFail, decoded.outcome);
    }

    #[tokio::test]
    async fn classifies_timeout_and_malformed() {
        let q = query("www.example.com.", RecordType::A);
        let mut fixture = FixtureExchanger::new();
        fixture.timeout(IP, q.clone());
        let decoded = classify_fixture(fixture, &q, "example.com.").await;
        assert_eq!(Outcome::Timeout, decoded.outcome);

        let mut fixture = FixtureExchanger::new();
        fixture.malformed(IP, q.clone());
        let decoded = classify_fixture(fixture, &q, "example.com.").await;
        assert_eq!(Outcome::FormErr, decoded.outcome);
    }

    #[tokio::test]
    async fn mismatched_question_is_an_error_not_an_answer() {
        let q = query("www.example.com.", RecordType::A);
        let wrong = query("www.example.net.", RecordType::A);
        let mut fixture = FixtureExchanger::new();
        fixture.reply(
            IP,
            q.clone(),
            response(
                &wrong,
                &[a_record("www.example.net.", Ipv4Addr::new(203, 0, 113, 1))],
                &[],
                &[],
            ),
        );

        let decoded = classify_fixture(fixture, &q, "example.com.").await;
        assert_eq!(Outcome::OtherError, decoded.outcome);
        assert!(decoded.warnings.contains(&Warning::QuestionMismatch));
    }

    /// The additional-record count from the encoded header; an OPT record is
    /// the only additional a request can carry.
    fn wire_arcount(message: &Message) -> u16 {
        use hickory_proto::serialize::binary::{BinEncodable, BinEncoder};

        let mut buf = Vec::new();
        let mut encoder = BinEncoder::new(&mut buf);
        message.emit(&mut encoder).unwrap();
        u16::from_be_bytes([buf[10], buf[11]])
    }

    #[test]
    fn udp_size_512_disables_edns0() {
        let q = query("www.example.com.", RecordType::A);
        assert_eq!(0, wire_arcount(&build_request(&q, false, EDNS0_DISABLED_SIZE)));
        assert_eq!(1, wire_arcount(&build_request(&q, false, 4096)));
    }

    #[test]
    fn requests_to_authoritative_servers_clear_rd() {
        let q = query("www.example.com.", RecordType::A);
        assert!(!build_request(&q, false, 4096).recursion_desired());
        assert!(build_request(&q, true, 4096).recursion_desired());
    }
}
