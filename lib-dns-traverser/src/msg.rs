//! Pure operations over a decoded DNS message.
//!
//! Everything in here is side-effect free: the traversal engine decides what
//! to do, these functions only say what a message contains.  Name comparisons
//! are case-insensitive (a property of `Name` itself); class comparisons
//! default to `IN`.

use std::collections::{HashMap, HashSet};
use std::fmt;

use hickory_proto::op::{Message, Query, ResponseCode};
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};

use crate::util::types::Bailiwick;

/// A non-fatal observation about a response.  Warnings ride along with the
/// decoded response and never change the traversal's course on their own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Warning {
    /// The recursion-available bit disagrees with what we asked for.
    RecursionMismatch { desired: bool, available: bool },
    /// The response was truncated and could not be retried over TCP.
    Truncated,
    /// An rcode other than NOERROR, NXDOMAIN, or SERVFAIL.
    UnexpectedRcode(ResponseCode),
    /// The question section does not echo our question.
    QuestionMismatch,
    /// More than one question in the response.
    MultipleQuestions(usize),
    /// The response id does not match the request id.
    IdMismatch { expected: u16, got: u16 },
    /// The packet could not be decoded.
    Malformed(String),
    /// An NS record whose owner lies outside the delegating bailiwick.
    LameNs(Name),
    /// A referral target with no glue; it needed a side-traversal.
    NoGlue(Name),
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Warning::RecursionMismatch { desired, available } => write!(
                f,
                "recursion-available bit is {available} but recursion-desired was {desired}"
            ),
            Warning::Truncated => write!(f, "response truncated"),
            Warning::UnexpectedRcode(rcode) => write!(f, "unexpected rcode {rcode}"),
            Warning::QuestionMismatch => write!(f, "question section does not match the query"),
            Warning::MultipleQuestions(n) => write!(f, "expected one question, got {n}"),
            Warning::IdMismatch { expected, got } => {
                write!(f, "response id {got} does not match request id {expected}")
            }
            Warning::Malformed(err) => write!(f, "malformed packet: {err}"),
            Warning::LameNs(name) => write!(f, "out-of-bailiwick NS '{name}'"),
            Warning::NoGlue(name) => write!(f, "no glue for NS target '{name}'"),
        }
    }
}

/// Whether a record type satisfies a query type (`ANY` matches all).
fn rtype_matches(rtype: RecordType, qtype: RecordType) -> bool {
    qtype == RecordType::ANY || rtype == qtype
}

/// Validate a response against the question we asked.
///
/// Succeeds iff the rcode is an error (those are classified by rcode alone)
/// or the message has exactly one question matching `(qname, qclass, qtype)`.
/// A response failing this must not be trusted as an answer for our query: a
/// mismatched question section indicates a buggy or hostile server.
pub fn validate(msg: &Message, expected: &Query) -> Result<(), Warning> {
    if msg.response_code() != ResponseCode::NoError {
        return Ok(());
    }

    let questions = msg.queries();
    if questions.len() != 1 {
        return Err(Warning::MultipleQuestions(questions.len()));
    }

    let q = &questions[0];
    if q.name() == expected.name()
        && q.query_type() == expected.query_type()
        && q.query_class() == expected.query_class()
    {
        Ok(())
    } else {
        Err(Warning::QuestionMismatch)
    }
}

/// Answer-section RRs matching `(name, class, type)`.
pub fn answers(msg: &Message, name: &Name, qtype: RecordType, qclass: DNSClass) -> Vec<Record> {
    section_matches(msg.answers(), name, qtype, qclass)
}

/// Additional-section RRs matching `(name, class, type)`.  This is where
/// glue for referral NS targets lives.
pub fn additional(msg: &Message, name: &Name, qtype: RecordType, qclass: DNSClass) -> Vec<Record> {
    section_matches(msg.additionals(), name, qtype, qclass)
}

fn section_matches(
    section: &[Record],
    name: &Name,
    qtype: RecordType,
    qclass: DNSClass,
) -> Vec<Record> {
    section
        .iter()
        .filter(|rr| {
            rr.name() == name && rr.dns_class() == qclass && rtype_matches(rr.record_type(), qtype)
        })
        .cloned()
        .collect()
}

/// Partition the authority section into `(ns, soa, other)`, where `ns` are
/// `IN NS` records and `soa` are `IN SOA` records.
pub fn authority_partition(msg: &Message) -> (Vec<Record>, Vec<Record>, Vec<Record>) {
    let mut ns = Vec::new();
    let mut soa = Vec::new();
    let mut other = Vec::new();

    for rr in msg.name_servers() {
        if rr.dns_class() != DNSClass::IN {
            other.push(rr.clone());
            continue;
        }
        match rr.record_type() {
            RecordType::NS => ns.push(rr.clone()),
            RecordType::SOA => soa.push(rr.clone()),
            _ => other.push(rr.clone()),
        }
    }

    (ns, soa, other)
}

/// Follow answer-section CNAMEs from `qname` and return the final name.
///
/// The rewrite stops when an RR of `qtype` exists at the current name, when
/// the current name has no CNAME, or when the chain steps outside the
/// bailiwick (the out-of-bailiwick target is returned, unchased).  Returns
/// `None` if a previously-visited name reappears: the chain loops and there
/// is no final name.  The visited set is per-invocation.
pub fn follow_cnames(
    msg: &Message,
    qname: &Name,
    qtype: RecordType,
    bailiwick: &Bailiwick,
) -> Option<Name> {
    let mut cnames = HashMap::new();
    for rr in msg.answers() {
        if let RData::CNAME(target) = rr.data() {
            cnames.insert(rr.name().clone(), target.0.clone());
        }
    }

    let mut seen = HashSet::new();
    let mut current = qname.clone();
    seen.insert(current.clone());

    loop {
        let has_final = msg
            .answers()
            .iter()
            .any(|rr| rr.name() == &current && rtype_matches(rr.record_type(), qtype));
        if has_final {
            return Some(current);
        }

        match cnames.get(&current) {
            None => return Some(current),
            Some(target) => {
                if seen.contains(target) {
                    return None;
                }
                if !bailiwick.contains(target) {
                    return Some(target.clone());
                }
                seen.insert(target.clone());
                current = target.clone();
            }
        }
    }
}

/// The conventional NODATA signal: an SOA in the authority section, or an
/// authority section with no NS delegation at all.
pub fn is_nodata(msg: &Message) -> bool {
    let (ns, soa, _) = authority_partition(msg);
    !soa.is_empty() || ns.is_empty()
}

/// RRs from a message, partitioned by bailiwick.
#[derive(Debug, Clone, Default)]
pub struct FilteredRecords {
    /// In-bailiwick records: the only ones the traversal may use.
    pub good: Vec<Record>,
    /// Out-of-bailiwick records, discarded: a delegating server gets no say
    /// over names it has no authority for.
    pub bad: Vec<Record>,
    /// Pseudo-records (OPT and the like), neither trusted nor distrusted.
    pub other: Vec<Record>,
}

/// Walk answer + authority + additional and keep only what the bailiwick
/// permits.
pub fn bailiwick_filter(msg: &Message, bailiwick: &Bailiwick) -> FilteredRecords {
    let mut filtered = FilteredRecords::default();

    let sections = msg
        .answers()
        .iter()
        .chain(msg.name_servers())
        .chain(msg.additionals());

    for rr in sections {
        if rr.record_type() == RecordType::OPT {
            filtered.other.push(rr.clone());
        } else if bailiwick.contains(rr.name()) {
            filtered.good.push(rr.clone());
        } else {
            filtered.bad.push(rr.clone());
        }
    }

    filtered
}

/// Message-level warnings: bits and rcodes that are suspicious but not
/// disqualifying.
pub fn message_warnings(msg: &Message, recursion_desired: bool) -> Vec<Warning> {
    let mut warnings = Vec::new();

    if msg.recursion_available() != recursion_desired {
        warnings.push(Warning::RecursionMismatch {
            desired: recursion_desired,
            available: msg.recursion_available(),
        });
    }

    if msg.truncated() {
        warnings.push(Warning::Truncated);
    }

    match msg.response_code() {
        ResponseCode::NoError | ResponseCode::NXDomain | ResponseCode::ServFail => (),
        rcode => warnings.push(Warning::UnexpectedRcode(rcode)),
    }

    warnings
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::str::FromStr;

    use super::*;
    use crate::test_util::*;

    #[test]
    fn validate_accepts_matching_question() {
        let q = query("www.example.com.", RecordType::A);
        let msg = response(
            &q,
            &[a_record("www.example.com.", Ipv4Addr::new(192, 0, 2, 1))],
            &[],
            &[],
        );

        assert_eq!(Ok(()), validate(&msg, &q));
    }

    #[test]
    fn validate_is_case_insensitive() {
        let q = query("WWW.EXAMPLE.COM.", RecordType::A);
        let msg = response(&query("www.example.com.", RecordType::A), &[], &[], &[]);

        assert_eq!(Ok(()), validate(&msg, &q));
    }

    #[test]
    fn validate_rejects_mismatched_question() {
        let q = query("www.example.com.", RecordType::A);
        let msg = response(&query("www.example.net.", RecordType::A), &[], &[], &[]);

        assert_eq!(Err(Warning::QuestionMismatch), validate(&msg, &q));
    }

    #[test]
    fn validate_rejects_missing_question() {
        use hickory_proto::op::{MessageType, OpCode};

        let q = query("www.example.com.", RecordType::A);
        let mut msg = Message::new();
        msg.set_id(0);
        msg.set_message_type(MessageType::Response);
        msg.set_op_code(OpCode::Query);

        assert_eq!(Err(Warning::MultipleQuestions(0)), validate(&msg, &q));
    }

    #[test]
    fn validate_skips_question_check_on_error_rcode() {
        let q = query("www.example.com.", RecordType::A);
        let mut msg = response(&query("www.example.net.", RecordType::A), &[], &[], &[]);
        msg.set_response_code(ResponseCode::NXDomain);

        assert_eq!(Ok(()), validate(&msg, &q));
    }

    #[test]
    fn answers_filters_by_name_and_type() {
        let q = query("www.example.com.", RecordType::A);
        let msg = response(
            &q,
            &[
                a_record("www.example.com.", Ipv4Addr::new(192, 0, 2, 1)),
                a_record("other.example.com.", Ipv4Addr::new(192, 0, 2, 2)),
                cname_record("www.example.com.", "w.example.com."),
            ],
            &[],
            &[],
        );

        let matched = answers(&msg, &name("www.example.com."), RecordType::A, DNSClass::IN);
        assert_eq!(
            vec![a_record("www.example.com.", Ipv4Addr::new(192, 0, 2, 1))],
            matched
        );
    }

    #[test]
    fn answers_any_matches_all_types() {
        let q = query("www.example.com.", RecordType::ANY);
        let msg = response(
            &q,
            &[
                a_record("www.example.com.", Ipv4Addr::new(192, 0, 2, 1)),
                cname_record("www.example.com.", "w.example.com."),
            ],
            &[],
            &[],
        );

        let matched = answers(
            &msg,
            &name("www.example.com."),
            RecordType::ANY,
            DNSClass::IN,
        );
        assert_eq!(2, matched.len());
    }

    #[test]
    fn authority_partition_splits_ns_and_soa() {
        let q = query("www.example.com.", RecordType::A);
        let msg = response(
            &q,
            &[],
            &[
                ns_record("example.com.", "ns1.example.com."),
                soa_record("example.com."),
                ns_record("example.com.", "ns2.example.com."),
            ],
            &[],
        );

        let (ns, soa, other) = authority_partition(&msg);
        assert_eq!(2, ns.len());
        assert_eq!(1, soa.len());
        assert!(other.is_empty());
    }

    #[test]
    fn follow_cnames_no_cname_is_identity() {
        let q = query("www.example.com.", RecordType::A);
        let msg = response(
            &q,
            &[a_record("www.example.com.", Ipv4Addr::new(192, 0, 2, 1))],
            &[],
            &[],
        );

        assert_eq!(
            Some(name("www.example.com.")),
            follow_cnames(&msg, &name("www.example.com."), RecordType::A, &Bailiwick::root())
        );
    }

    #[test]
    fn follow_cnames_walks_a_chain() {
        let q = query("www.example.com.", RecordType::A);
        let msg = response(
            &q,
            &[
                a_record("w3.example.com.", Ipv4Addr::new(192, 0, 2, 1)),
                cname_record("w2.example.com.", "w3.example.com."),
                cname_record("www.example.com.", "w2.example.com."),
            ],
            &[],
            &[],
        );

        assert_eq!(
            Some(name("w3.example.com.")),
            follow_cnames(&msg, &name("www.example.com."), RecordType::A, &Bailiwick::root())
        );
    }

    #[test]
    fn follow_cnames_detects_loops() {
        let q = query("www.example.com.", RecordType::A);
        let msg = response(
            &q,
            &[
                cname_record("www.example.com.", "bad.example.com."),
                cname_record("bad.example.com.", "www.example.com."),
            ],
            &[],
            &[],
        );

        assert_eq!(
            None,
            follow_cnames(&msg, &name("www.example.com."), RecordType::A, &Bailiwick::root())
        );
    }

    #[test]
    fn follow_cnames_stops_at_bailiwick_edge() {
        let q = query("www.example.com.", RecordType::A);
        let msg = response(
            &q,
            &[
                cname_record("www.example.com.", "w.example.net."),
                cname_record("w.example.net.", "w2.example.net."),
            ],
            &[],
            &[],
        );
        let bailiwick = Bailiwick::from_str("example.com.").unwrap();

        // the chase returns the out-of-bailiwick target without following the
        // second rewrite
        assert_eq!(
            Some(name("w.example.net.")),
            follow_cnames(&msg, &name("www.example.com."), RecordType::A, &bailiwick)
        );
    }

    #[test]
    fn follow_cnames_is_idempotent() {
        let q = query("www.example.com.", RecordType::A);
        let msg = response(
            &q,
            &[
                cname_record("www.example.com.", "w2.example.com."),
                a_record("w2.example.com.", Ipv4Addr::new(192, 0, 2, 1)),
            ],
            &[],
            &[],
        );

        let first =
            follow_cnames(&msg, &name("www.example.com."), RecordType::A, &Bailiwick::root())
                .unwrap();
        let second = follow_cnames(&msg, &first, RecordType::A, &Bailiwick::root()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn nodata_on_soa_in_authority() {
        let q = query("www.example.com.", RecordType::AAAA);
        let msg = response(&q, &[], &[soa_record("example.com.")], &[]);
        assert!(is_nodata(&msg));
    }

    #[test]
    fn nodata_on_empty_authority() {
        let q = query("www.example.com.", RecordType::AAAA);
        let msg = response(&q, &[], &[], &[]);
        assert!(is_nodata(&msg));
    }

    #[test]
    fn not_nodata_when_delegation_present() {
        let q = query("www.example.com.", RecordType::AAAA);
        let msg = response(&q, &[], &[ns_record("example.com.", "ns1.example.com.")], &[]);
        assert!(!is_nodata(&msg));
    }

    #[test]
    fn bailiwick_filter_drops_out_of_zone_records() {
        let q = query("www.example.com.", RecordType::A);
        let msg = response(
            &q,
            &[a_record("www.example.com.", Ipv4Addr::new(192, 0, 2, 1))],
            &[ns_record("example.com.", "ns1.example.com.")],
            &[
                a_record("ns1.example.com.", Ipv4Addr::new(192, 0, 2, 53)),
                // poisoning attempt: the server has no authority over .net
                a_record("victim.example.net.", Ipv4Addr::new(203, 0, 113, 66)),
            ],
        );
        let bailiwick = Bailiwick::from_str("example.com.").unwrap();

        let filtered = bailiwick_filter(&msg, &bailiwick);
        assert_eq!(3, filtered.good.len());
        assert_eq!(
            vec![a_record("victim.example.net.", Ipv4Addr::new(203, 0, 113, 66))],
            filtered.bad
        );
    }

    #[test]
    fn message_warnings_flags_ra_and_tc() {
        let q = query("www.example.com.", RecordType::A);
        let mut msg = response(&q, &[], &[], &[]);
        msg.set_recursion_available(true);
        msg.set_truncated(true);

        let warnings = message_warnings(&msg, false);
        assert!(warnings.contains(&Warning::RecursionMismatch {
            desired: false,
            available: true
        }));
        assert!(warnings.contains(&Warning::Truncated));
    }

    #[test]
    fn message_warnings_flags_odd_rcodes() {
        let q = query("www.example.com.", RecordType::A);
        let mut msg = response(&q, &[], &[], &[]);
        msg.set_response_code(ResponseCode::Refused);

        assert!(message_warnings(&msg, false)
            .contains(&Warning::UnexpectedRcode(ResponseCode::Refused)));
    }
}
