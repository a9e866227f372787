//! The referral tree.
//!
//! One `Referral` per zone-cut-and-server the traversal visits, stored in an
//! arena indexed by `NodeId`: children are index lists and `replaced_by` is a
//! reference relation, never ownership, so the depth-first lifetime of the
//! traversal maps directly onto the arena with no cycles to manage.

use std::collections::HashSet;
use std::net::IpAddr;

use hickory_proto::op::Query;
use hickory_proto::rr::{Name, RData, RecordType};

use crate::dist::{Outcome, OutcomeDist};
use crate::msg;
use crate::msg::Warning;
use crate::response::DecodedResponse;
use crate::util::types::Bailiwick;

/// Index of a `Referral` in its `Tree`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub usize);

/// Why a referral died before it could be expanded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// `depth > max_depth`.
    DepthExceeded,
    /// The same `(server, query, bailiwick)` already sits on this path.
    Loop,
    /// The server name resolved to no addresses.
    ServerResolution,
}

impl FailureKind {
    pub fn outcome(self) -> Outcome {
        match self {
            FailureKind::DepthExceeded => Outcome::DepthExceeded,
            FailureKind::Loop => Outcome::Loop,
            FailureKind::ServerResolution => Outcome::Unresolvable,
        }
    }
}

/// Referral lifecycle.  Terminal states are never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Unresolved,
    ResolvingServer,
    Querying,
    Expanded,
    Answered,
    FastSkipped,
    Failed(FailureKind),
}

/// The identity of a referral for dedup and loop detection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub server_name: Name,
    pub query: Query,
    pub bailiwick: Bailiwick,
}

/// One node in the traversal tree: a query aimed at one named server for one
/// zone cut.
#[derive(Debug, Clone)]
pub struct Referral {
    /// Dotted hierarchical identifier; the prefix is the parent's refid and
    /// the last label enumerates siblings.
    pub refid: String,
    pub query: Query,
    pub bailiwick: Bailiwick,
    pub parent: Option<NodeId>,
    /// The parent server IP whose response delegated to this referral.
    pub parent_ip: Option<IpAddr>,
    pub server_name: Name,
    pub server_ips: Vec<IpAddr>,
    pub depth: usize,
    pub state: State,
    /// One response per server IP, in `server_ips` order.
    pub responses: Vec<(IpAddr, DecodedResponse)>,
    pub children: Vec<NodeId>,
    pub warnings: Vec<Warning>,
    /// In fast mode, the earlier equivalent referral this one defers to.
    pub replaced_by: Option<NodeId>,
}

impl Referral {
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint {
            server_name: self.server_name.clone(),
            query: self.query.clone(),
            bailiwick: self.bailiwick.clone(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            State::Answered | State::FastSkipped | State::Failed(_)
        )
    }
}

/// What a child referral will be, before it is allocated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildSpec {
    pub query: Query,
    pub bailiwick: Bailiwick,
    pub server_name: Name,
    pub server_ips: Vec<IpAddr>,
}

/// Extract child referrals from a delegation response: one per distinct NS
/// target at the zone cut, in authority-section order, with glue addresses
/// pulled from the same response's additionals.
///
/// Only NS records inside the *delegating* bailiwick count, and only glue
/// inside it is trusted; the zone cut is the owner name of those records and
/// becomes the children's bailiwick.
pub fn delegation_children(response: &DecodedResponse, follow_aaaa: bool) -> Vec<ChildSpec> {
    let Some(message) = &response.message else {
        return Vec::new();
    };

    let (ns, _, _) = msg::authority_partition(message);
    let in_bailiwick: Vec<_> = ns
        .iter()
        .filter(|rr| response.bailiwick.contains(rr.name()))
        .collect();

    let Some(zone_cut) = in_bailiwick.first().map(|rr| rr.name().clone()) else {
        return Vec::new();
    };
    let child_bailiwick = Bailiwick::new(zone_cut.clone());

    let mut seen = HashSet::new();
    let mut children = Vec::new();
    for rr in in_bailiwick {
        if rr.name() != &zone_cut {
            continue;
        }
        let RData::NS(target) = rr.data() else {
            continue;
        };
        let server_name = target.0.clone();
        if !seen.insert(server_name.clone()) {
            continue;
        }

        children.push(ChildSpec {
            query: response.query.clone(),
            bailiwick: child_bailiwick.clone(),
            server_name: server_name.clone(),
            server_ips: glue_for(response, &server_name, follow_aaaa),
        });
    }

    children
}

/// Glue addresses for an NS target, from the additional section, restricted
/// to the delegating bailiwick.
fn glue_for(response: &DecodedResponse, target: &Name, follow_aaaa: bool) -> Vec<IpAddr> {
    let Some(message) = &response.message else {
        return Vec::new();
    };
    if !response.bailiwick.contains(target) {
        return Vec::new();
    }

    let mut seen = HashSet::new();
    let mut ips = Vec::new();
    for rr in msg::additional(message, target, RecordType::A, response.query.query_class()) {
        if let RData::A(addr) = rr.data() {
            if seen.insert(IpAddr::V4(addr.0)) {
                ips.push(IpAddr::V4(addr.0));
            }
        }
    }
    if follow_aaaa {
        for rr in msg::additional(message, target, RecordType::AAAA, response.query.query_class()) {
            if let RData::AAAA(addr) = rr.data() {
                if seen.insert(IpAddr::V6(addr.0)) {
                    ips.push(IpAddr::V6(addr.0));
                }
            }
        }
    }
    ips
}

/// The target of a CNAME redirection, when this answer needs a restart from
/// the root: the chase moved off the query name and the query was not for
/// the CNAME itself.
pub fn cname_restart(response: &DecodedResponse) -> Option<Name> {
    if response.outcome != Outcome::Answer {
        return None;
    }
    if response.query.query_type() == RecordType::CNAME {
        return None;
    }
    let final_name = response.final_name()?;
    if &final_name == response.query.name() {
        None
    } else {
        Some(final_name)
    }
}

/// The arena of referrals.
#[derive(Debug, Clone, Default)]
pub struct Tree {
    nodes: Vec<Referral>,
}

impl Tree {
    pub fn new() -> Self {
        Tree::default()
    }

    pub fn push(&mut self, referral: Referral) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(referral);
        id
    }

    pub fn node(&self, id: NodeId) -> &Referral {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Referral {
        &mut self.nodes[id.0]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Referral)> {
        self.nodes.iter().enumerate().map(|(i, r)| (NodeId(i), r))
    }

    /// Whether `fingerprint` already occurs at `id` or any of its ancestors.
    pub fn path_contains(&self, id: NodeId, fingerprint: &Fingerprint) -> bool {
        let mut current = Some(id);
        while let Some(cursor) = current {
            let node = self.node(cursor);
            if &node.fingerprint() == fingerprint {
                return true;
            }
            current = node.parent;
        }
        false
    }

    /// The outcome distribution of the subtree rooted at `id`, computed
    /// post-order.
    ///
    /// A replaced referral copies its replacement's distribution verbatim; a
    /// failed one is a point mass of its failure outcome.  Otherwise each
    /// per-IP response contributes either the mean of the children it
    /// produced or its own classification, and the node is the uniform mean
    /// of the per-IP contributions.
    pub fn distribution(&self, id: NodeId) -> OutcomeDist {
        let node = self.node(id);

        match node.state {
            State::Failed(kind) => return OutcomeDist::point(kind.outcome()),
            State::FastSkipped => {
                return match node.replaced_by {
                    Some(replacement) => self.distribution(replacement),
                    // a skipped referral always has a replacement; be safe
                    None => OutcomeDist::point(Outcome::OtherError),
                };
            }
            _ => (),
        }

        if node.responses.is_empty() {
            return OutcomeDist::point(Outcome::Unresolvable);
        }

        let mut per_ip = Vec::with_capacity(node.responses.len());
        for (ip, response) in &node.responses {
            let produced: Vec<OutcomeDist> = node
                .children
                .iter()
                .filter(|child| self.node(**child).parent_ip == Some(*ip))
                .map(|child| self.distribution(*child))
                .collect();

            if produced.is_empty() {
                per_ip.push(OutcomeDist::point(response.outcome));
            } else {
                per_ip.push(OutcomeDist::mean(&produced));
            }
        }

        OutcomeDist::mean(&per_ip)
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::str::FromStr;
    use std::time::Duration;

    use super::*;
    use crate::dist::PROBABILITY_TOLERANCE;
    use crate::test_util::*;

    fn decoded(ip: IpAddr, outcome: Outcome, bailiwick: &str) -> DecodedResponse {
        DecodedResponse {
            server_ip: ip,
            query: query("www.example.com.", RecordType::A),
            bailiwick: Bailiwick::from_str(bailiwick).unwrap(),
            outcome,
            message: None,
            records: Vec::new(),
            warnings: Vec::new(),
            rtt: Duration::ZERO,
        }
    }

    fn referral(refid: &str, server: &str, bailiwick: &str) -> Referral {
        Referral {
            refid: refid.to_string(),
            query: query("www.example.com.", RecordType::A),
            bailiwick: Bailiwick::from_str(bailiwick).unwrap(),
            parent: None,
            parent_ip: None,
            server_name: name(server),
            server_ips: Vec::new(),
            depth: 0,
            state: State::Unresolved,
            responses: Vec::new(),
            children: Vec::new(),
            warnings: Vec::new(),
            replaced_by: None,
        }
    }

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 0, 2, last))
    }

    #[test]
    fn leaf_distribution_averages_per_ip_outcomes() {
        let mut tree = Tree::new();
        let mut node = referral("1", "a.root-servers.net.", ".");
        node.server_ips = vec![ip(1), ip(2)];
        node.responses = vec![
            (ip(1), decoded(ip(1), Outcome::Answer, ".")),
            (ip(2), decoded(ip(2), Outcome::Timeout, ".")),
        ];
        node.state = State::Answered;
        let id = tree.push(node);

        let dist = tree.distribution(id);
        assert!(dist.is_probability());
        assert!((dist.probability(Outcome::Answer) - 0.5).abs() < PROBABILITY_TOLERANCE);
        assert!((dist.probability(Outcome::Timeout) - 0.5).abs() < PROBABILITY_TOLERANCE);
    }

    #[test]
    fn internal_distribution_substitutes_children() {
        let mut tree = Tree::new();

        let mut root = referral("1", "a.root-servers.net.", ".");
        root.server_ips = vec![ip(1)];
        root.responses = vec![(ip(1), decoded(ip(1), Outcome::Referral, "."))];
        root.state = State::Expanded;
        let root_id = tree.push(root);

        let mut child = referral("1.1", "ns1.example.com.", "example.com.");
        child.parent = Some(root_id);
        child.parent_ip = Some(ip(1));
        child.server_ips = vec![ip(53)];
        child.responses = vec![(ip(53), decoded(ip(53), Outcome::Answer, "example.com."))];
        child.state = State::Answered;
        let child_id = tree.push(child);
        tree.node_mut(root_id).children.push(child_id);

        let dist = tree.distribution(root_id);
        assert!(dist.is_probability());
        // the referral outcome itself carries no mass once a child exists
        assert_eq!(0.0, dist.probability(Outcome::Referral));
        assert!((dist.probability(Outcome::Answer) - 1.0).abs() < PROBABILITY_TOLERANCE);
    }

    #[test]
    fn failed_referral_is_a_point_mass() {
        let mut tree = Tree::new();
        let mut node = referral("1", "a.root-servers.net.", ".");
        node.state = State::Failed(FailureKind::DepthExceeded);
        let id = tree.push(node);

        assert_eq!(
            OutcomeDist::point(Outcome::DepthExceeded),
            tree.distribution(id)
        );
    }

    #[test]
    fn replaced_referral_copies_replacement_distribution() {
        let mut tree = Tree::new();

        let mut original = referral("1.1", "ns1.example.com.", "example.com.");
        original.server_ips = vec![ip(53)];
        original.responses = vec![(ip(53), decoded(ip(53), Outcome::NxDomain, "example.com."))];
        original.state = State::Answered;
        let original_id = tree.push(original);

        let mut skipped = referral("1.2", "ns1.example.com.", "example.com.");
        skipped.state = State::FastSkipped;
        skipped.replaced_by = Some(original_id);
        let skipped_id = tree.push(skipped);

        assert_eq!(tree.distribution(original_id), tree.distribution(skipped_id));
    }

    #[test]
    fn path_contains_finds_ancestor_fingerprints() {
        let mut tree = Tree::new();
        let top = tree.push(referral("1", "ns1.example.com.", "example.com."));
        let mut mid = referral("1.1", "ns2.example.com.", "example.com.");
        mid.parent = Some(top);
        let mid_id = tree.push(mid);

        let same_as_top = referral("1.1.1", "ns1.example.com.", "example.com.").fingerprint();
        let unrelated = referral("x", "ns3.example.com.", "example.com.").fingerprint();

        assert!(tree.path_contains(mid_id, &same_as_top));
        assert!(!tree.path_contains(mid_id, &unrelated));
    }

    #[test]
    fn delegation_children_extracts_targets_and_glue_in_order() {
        let q = query("www.example.com.", RecordType::A);
        let message = response(
            &q,
            &[],
            &[
                ns_record("example.com.", "ns1.example.com."),
                ns_record("example.com.", "ns2.example.com."),
                ns_record("example.com.", "ns1.example.com."),
            ],
            &[
                a_record("ns1.example.com.", Ipv4Addr::new(192, 0, 2, 10)),
                a_record("ns1.example.com.", Ipv4Addr::new(192, 0, 2, 11)),
            ],
        );
        let mut resp = decoded(ip(1), Outcome::Referral, "com.");
        resp.message = Some(message);

        let children = delegation_children(&resp, false);
        assert_eq!(2, children.len());

        assert_eq!(name("ns1.example.com."), children[0].server_name);
        assert_eq!(vec![ip(10), ip(11)], children[0].server_ips);
        assert_eq!(Bailiwick::from_str("example.com.").unwrap(), children[0].bailiwick);

        assert_eq!(name("ns2.example.com."), children[1].server_name);
        assert!(children[1].server_ips.is_empty());
    }

    #[test]
    fn delegation_children_ignores_out_of_bailiwick_glue() {
        let q = query("www.example.com.", RecordType::A);
        let message = response(
            &q,
            &[],
            &[ns_record("example.com.", "ns1.example.net.")],
            &[a_record("ns1.example.net.", Ipv4Addr::new(203, 0, 113, 1))],
        );
        let mut resp = decoded(ip(1), Outcome::Referral, "com.");
        resp.message = Some(message);

        let children = delegation_children(&resp, false);
        assert_eq!(1, children.len());
        // the target lives outside com., so its glue cannot be trusted
        assert!(children[0].server_ips.is_empty());
    }

    #[test]
    fn cname_restart_fires_only_when_the_chase_moved() {
        let q = query("www.example.com.", RecordType::A);

        let mut stay = decoded(ip(1), Outcome::Answer, "example.com.");
        stay.message = Some(response(
            &q,
            &[a_record("www.example.com.", Ipv4Addr::new(192, 0, 2, 1))],
            &[],
            &[],
        ));
        assert_eq!(None, cname_restart(&stay));

        let mut moved = decoded(ip(1), Outcome::Answer, "example.com.");
        moved.message = Some(response(
            &q,
            &[cname_record("www.example.com.", "w.example.net.")],
            &[],
            &[],
        ));
        assert_eq!(Some(name("w.example.net.")), cname_restart(&moved));
    }

    #[test]
    fn cname_restart_never_fires_for_cname_queries() {
        let q = query("www.example.com.", RecordType::CNAME);
        let mut resp = decoded(ip(1), Outcome::Answer, "example.com.");
        resp.query = q.clone();
        resp.message = Some(response(
            &q,
            &[cname_record("www.example.com.", "w.example.net.")],
            &[],
            &[],
        ));

        assert_eq!(None, cname_restart(&resp));
    }
}
