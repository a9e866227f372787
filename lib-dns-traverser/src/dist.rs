//! Outcome distributions: probability mass over response classifications,
//! rolled up the referral tree with a uniform choice among server IPs at
//! every branch.

use std::collections::BTreeMap;
use std::fmt;

/// Tolerance for the sums-to-one invariant.
pub const PROBABILITY_TOLERANCE: f64 = 1e-9;

/// How a traversal branch ends up.
///
/// The first ten variants classify a single response from a single server
/// IP; the last three are referral-level failures, synthesised when a branch
/// dies before any response could settle it.  Statistics treat them all
/// alike, which is why they share an enum: every per-outcome policy lives in
/// one exhaustive match, and a new variant is a compile-time reminder to
/// update the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Outcome {
    /// The server answered the query (possibly via a CNAME chain).
    Answer,
    /// NOERROR with no matching answer and no delegation.
    NoData,
    /// The name does not exist.
    NxDomain,
    /// A delegation to another server set.
    Referral,
    /// A delegation where some NS owners lie outside the bailiwick.
    ReferralLame,
    /// The answer's CNAME chain loops.
    CnameLoop,
    /// No response within the retry budget.
    Timeout,
    /// The packet could not be decoded.
    FormErr,
    /// The server reported SERVFAIL.
    ServFail,
    /// Anything else: refused, mismatched question, all-lame referral, ...
    OtherError,
    /// The branch exceeded the depth limit.
    DepthExceeded,
    /// The branch revisited a (server, query, bailiwick) already on its path.
    Loop,
    /// The server name could not be resolved to any address.
    Unresolvable,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let label = match self {
            Outcome::Answer => "ANSWER",
            Outcome::NoData => "NODATA",
            Outcome::NxDomain => "NXDOMAIN",
            Outcome::Referral => "REFERRAL",
            Outcome::ReferralLame => "REFERRAL_LAME",
            Outcome::CnameLoop => "CNAME_LOOP",
            Outcome::Timeout => "TIMEOUT",
            Outcome::FormErr => "FORMERR",
            Outcome::ServFail => "SERVFAIL",
            Outcome::OtherError => "OTHER_ERROR",
            Outcome::DepthExceeded => "DEPTH_EXCEEDED",
            Outcome::Loop => "LOOP",
            Outcome::Unresolvable => "UNRESOLVABLE",
        };
        write!(f, "{label}")
    }
}

/// Probability mass over outcomes.
///
/// A well-formed distribution sums to 1 within `PROBABILITY_TOLERANCE`;
/// intermediate values built with `add_weighted` may hold partial mass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutcomeDist {
    probs: BTreeMap<Outcome, f64>,
}

impl OutcomeDist {
    pub fn new() -> Self {
        OutcomeDist::default()
    }

    /// All mass on a single outcome.
    pub fn point(outcome: Outcome) -> Self {
        let mut probs = BTreeMap::new();
        probs.insert(outcome, 1.0);
        OutcomeDist { probs }
    }

    /// Fold in another distribution scaled by `weight`.
    pub fn add_weighted(&mut self, other: &OutcomeDist, weight: f64) {
        for (outcome, p) in &other.probs {
            *self.probs.entry(*outcome).or_insert(0.0) += p * weight;
        }
    }

    /// The uniform mean of a set of distributions.  An empty set yields the
    /// empty distribution.
    pub fn mean(parts: &[OutcomeDist]) -> Self {
        let mut acc = OutcomeDist::new();
        if parts.is_empty() {
            return acc;
        }
        let weight = 1.0 / parts.len() as f64;
        for part in parts {
            acc.add_weighted(part, weight);
        }
        acc
    }

    pub fn probability(&self, outcome: Outcome) -> f64 {
        self.probs.get(&outcome).copied().unwrap_or(0.0)
    }

    pub fn total(&self) -> f64 {
        self.probs.values().sum()
    }

    /// Whether this is a full probability distribution.
    pub fn is_probability(&self) -> bool {
        (self.total() - 1.0).abs() <= PROBABILITY_TOLERANCE
    }

    pub fn is_empty(&self) -> bool {
        self.probs.is_empty()
    }

    /// Outcomes and their probabilities, in `Outcome` order.
    pub fn iter(&self) -> impl Iterator<Item = (Outcome, f64)> + '_ {
        self.probs.iter().map(|(o, p)| (*o, *p))
    }

    /// Equality up to `tolerance` on every outcome.
    pub fn approx_eq(&self, other: &OutcomeDist, tolerance: f64) -> bool {
        let outcomes: std::collections::BTreeSet<Outcome> = self
            .probs
            .keys()
            .chain(other.probs.keys())
            .copied()
            .collect();
        outcomes
            .into_iter()
            .all(|o| (self.probability(o) - other.probability(o)).abs() <= tolerance)
    }
}
