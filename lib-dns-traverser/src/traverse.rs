//! The top-level driver: root discovery, seeding, depth-first expansion, and
//! statistics aggregation.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_recursion::async_recursion;
use hickory_proto::op::{Message, Query};
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
use rand::Rng;

use crate::cache::{CacheKey, ResponseCache};
use crate::dist::{Outcome, OutcomeDist};
use crate::msg::Warning;
use crate::response::{build_request, DecodedResponse, DNS_PORT};
use crate::tree::{
    cname_restart, delegation_children, ChildSpec, FailureKind, Fingerprint, NodeId, Referral,
    State, Tree,
};
use crate::util::net::Exchanger;
use crate::util::types::{Bailiwick, TraceError};
use crate::{DEFAULT_MAX_DEPTH, DEFAULT_RETRIES, DEFAULT_TIMEOUT, DEFAULT_UDP_SIZE};

/// Where the traversal starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Roots {
    /// Ask the local resolver for the root NS set.
    Discover,
    /// Use exactly these addresses.
    Explicit(Vec<IpAddr>),
}

/// Lifecycle points reported for referrals of the main traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MainStage {
    Start,
    NewReferralSet,
    Answer,
    AnswerFast,
}

/// Lifecycle points reported for server-name sub-traversals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveStage {
    Start,
    AnswerFast,
}

pub type MainHook = Box<dyn Fn(MainStage, &Referral) + Send + Sync>;
pub type ResolveHook = Box<dyn Fn(ResolveStage, &Referral) + Send + Sync>;

/// Traversal configuration.
pub struct TraverseConfig {
    pub qclass: DNSClass,
    pub roots: Roots,
    /// Traverse from every root server rather than one picked at random.
    pub all_roots: bool,
    /// Resolve AAAA as well as A for nameserver targets.
    pub follow_aaaa: bool,
    /// Resolve AAAA as well as A for root servers.
    pub root_aaaa: bool,
    pub always_tcp: bool,
    pub allow_tcp: bool,
    /// EDNS0 payload size; 512 disables EDNS0.
    pub udp_size: u16,
    pub max_depth: usize,
    pub retries: usize,
    pub timeout: Duration,
    /// Collapse referrals sharing a `(server, query, bailiwick)` fingerprint.
    pub fast: bool,
    /// The resolver queried during root discovery.
    pub local_resolver: SocketAddr,
    pub on_referral: Option<MainHook>,
    pub on_resolve: Option<ResolveHook>,
}

impl TraverseConfig {
    /// Resolve contradictions: forced TCP implies allowed TCP, and the EDNS0
    /// floor is 512.
    pub fn normalise(mut self) -> Self {
        if self.always_tcp {
            self.allow_tcp = true;
        }
        if self.udp_size < 512 {
            self.udp_size = 512;
        }
        self
    }
}

impl Default for TraverseConfig {
    fn default() -> Self {
        TraverseConfig {
            qclass: DNSClass::IN,
            roots: Roots::Discover,
            all_roots: false,
            follow_aaaa: false,
            root_aaaa: false,
            always_tcp: false,
            allow_tcp: false,
            udp_size: DEFAULT_UDP_SIZE,
            max_depth: DEFAULT_MAX_DEPTH,
            retries: DEFAULT_RETRIES,
            timeout: DEFAULT_TIMEOUT,
            fast: true,
            local_resolver: SocketAddr::from(([127, 0, 0, 1], 53)),
            on_referral: None,
            on_resolve: None,
        }
    }
}

impl fmt::Debug for TraverseConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TraverseConfig")
            .field("qclass", &self.qclass)
            .field("roots", &self.roots)
            .field("all_roots", &self.all_roots)
            .field("follow_aaaa", &self.follow_aaaa)
            .field("root_aaaa", &self.root_aaaa)
            .field("always_tcp", &self.always_tcp)
            .field("allow_tcp", &self.allow_tcp)
            .field("udp_size", &self.udp_size)
            .field("max_depth", &self.max_depth)
            .field("retries", &self.retries)
            .field("timeout", &self.timeout)
            .field("fast", &self.fast)
            .field("local_resolver", &self.local_resolver)
            .finish_non_exhaustive()
    }
}

/// Everything a finished traversal produced.
#[derive(Debug, Clone)]
pub struct TraceReport {
    pub tree: Tree,
    /// The top-level referrals, one per root traversed.
    pub roots: Vec<NodeId>,
    /// The tree-wide outcome distribution: the uniform mean over the roots.
    pub distribution: OutcomeDist,
    /// Every server name seen during the run and the addresses it went by.
    pub servers: HashMap<Name, BTreeSet<IpAddr>>,
    /// Raw classification counts over every query actually sent.
    pub response_tally: BTreeMap<Outcome, usize>,
}

impl TraceReport {
    /// The answer RRs reachable in the tree: records of the queried type at
    /// the end of each terminal answer's CNAME chain.
    pub fn answers(&self) -> Vec<Record> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        let mut visited = HashSet::new();
        let mut stack: Vec<NodeId> = self.roots.iter().rev().copied().collect();

        while let Some(id) = stack.pop() {
            if !visited.insert(id) {
                continue;
            }
            let node = self.tree.node(id);
            if let Some(replacement) = node.replaced_by {
                stack.push(replacement);
            }
            for child in node.children.iter().rev() {
                stack.push(*child);
            }

            for (_, response) in &node.responses {
                if response.outcome != Outcome::Answer || cname_restart(response).is_some() {
                    continue;
                }
                let Some(final_name) = response.final_name() else {
                    continue;
                };
                let qtype = response.query.query_type();
                for rr in &response.records {
                    if rr.name() == &final_name
                        && (qtype == RecordType::ANY || rr.record_type() == qtype)
                        && seen.insert(rr.to_string())
                    {
                        out.push(rr.clone());
                    }
                }
            }
        }

        out
    }
}

/// The traversal driver.
///
/// A `Traverser` can run more than one query; the response cache persists
/// across runs while the tree and the fast-mode fingerprint index reset.
pub struct Traverser {
    config: TraverseConfig,
    exchanger: Arc<dyn Exchanger>,
    cache: ResponseCache,
    tree: Tree,
    fingerprints: HashMap<Fingerprint, NodeId>,
    /// Server names currently being resolved, to catch circular glue-less
    /// delegation.
    resolving: HashSet<Name>,
    servers: HashMap<Name, BTreeSet<IpAddr>>,
    tally: BTreeMap<Outcome, usize>,
    roots: Vec<(Name, Vec<IpAddr>)>,
    next_root_ordinal: usize,
}

impl Traverser {
    pub fn new(config: TraverseConfig, exchanger: Arc<dyn Exchanger>) -> Self {
        Traverser {
            config: config.normalise(),
            exchanger,
            cache: ResponseCache::new(),
            tree: Tree::new(),
            fingerprints: HashMap::new(),
            resolving: HashSet::new(),
            servers: HashMap::new(),
            tally: BTreeMap::new(),
            roots: Vec::new(),
            next_root_ordinal: 1,
        }
    }

    /// Explore every delegation path for `(qname, qtype)` and aggregate the
    /// outcome distribution.
    pub async fn run(&mut self, qname: Name, qtype: RecordType) -> Result<TraceReport, TraceError> {
        self.tree = Tree::new();
        self.fingerprints.clear();
        self.resolving.clear();
        self.tally.clear();
        self.next_root_ordinal = 1;

        self.roots = self.find_roots().await?;
        if self.roots.is_empty() {
            return Err(TraceError::NoRoots);
        }

        let mut query = Query::new();
        query.set_name(qname);
        query.set_query_type(qtype);
        query.set_query_class(self.config.qclass);

        let mut root_ids = Vec::new();
        for (server_name, server_ips) in self.roots.clone() {
            let id = self.seed(query.clone(), server_name, server_ips);
            self.hook_main(MainStage::Start, id);
            self.expand(id).await;
            root_ids.push(id);
        }

        let parts: Vec<OutcomeDist> = root_ids
            .iter()
            .map(|id| self.tree.distribution(*id))
            .collect();
        let distribution = OutcomeDist::mean(&parts);

        Ok(TraceReport {
            tree: std::mem::take(&mut self.tree),
            roots: root_ids,
            distribution,
            servers: self.servers.clone(),
            response_tally: std::mem::take(&mut self.tally),
        })
    }

    fn seed(&mut self, query: Query, server_name: Name, server_ips: Vec<IpAddr>) -> NodeId {
        let refid = self.next_root_ordinal.to_string();
        self.next_root_ordinal += 1;
        self.tree.push(Referral {
            refid,
            query,
            bailiwick: Bailiwick::root(),
            parent: None,
            parent_ip: None,
            server_name,
            server_ips,
            depth: 0,
            state: State::Unresolved,
            responses: Vec::new(),
            children: Vec::new(),
            warnings: Vec::new(),
            replaced_by: None,
        })
    }

    #[async_recursion]
    async fn expand(&mut self, id: NodeId) {
        let fingerprint = self.tree.node(id).fingerprint();
        let depth = self.tree.node(id).depth;

        if depth > self.config.max_depth {
            tracing::debug!(refid = %self.tree.node(id).refid, depth, "depth exceeded");
            self.tree.node_mut(id).state = State::Failed(FailureKind::DepthExceeded);
            return;
        }

        if let Some(parent) = self.tree.node(id).parent {
            if self.tree.path_contains(parent, &fingerprint) {
                tracing::debug!(
                    refid = %self.tree.node(id).refid,
                    server = %fingerprint.server_name,
                    "referral loop"
                );
                self.tree.node_mut(id).state = State::Failed(FailureKind::Loop);
                return;
            }
        }

        if self.config.fast {
            if let Some(&previous) = self.fingerprints.get(&fingerprint) {
                let node = self.tree.node_mut(id);
                node.state = State::FastSkipped;
                node.replaced_by = Some(previous);
                self.hook_main(MainStage::AnswerFast, id);
                return;
            }
        }

        if self.tree.node(id).server_ips.is_empty() {
            let server_name = self.tree.node(id).server_name.clone();
            self.tree.node_mut(id).state = State::ResolvingServer;

            if self.resolving.contains(&server_name) {
                // circular glue-less delegation: resolving this server is
                // what led us back here
                self.tree.node_mut(id).state = State::Failed(FailureKind::Loop);
                return;
            }

            self.hook_resolve(ResolveStage::Start, id);
            let ips = self.resolve_server_ips(&server_name).await;
            if ips.is_empty() {
                let node = self.tree.node_mut(id);
                node.warnings.push(Warning::NoGlue(server_name));
                node.state = State::Failed(FailureKind::ServerResolution);
                return;
            }
            self.tree.node_mut(id).server_ips = ips;
        }

        let node = self.tree.node(id);
        let query = node.query.clone();
        let bailiwick = node.bailiwick.clone();
        let server_name = node.server_name.clone();
        let server_ips = node.server_ips.clone();

        self.servers
            .entry(server_name)
            .or_default()
            .extend(server_ips.iter().copied());

        self.tree.node_mut(id).state = State::Querying;

        let mut child_specs: Vec<(IpAddr, Vec<ChildSpec>)> = Vec::new();
        for server_ip in server_ips {
            let response = self.fetch(server_ip, &query, &bailiwick).await;

            let specs = match response.outcome {
                Outcome::Referral | Outcome::ReferralLame => {
                    delegation_children(&response, self.config.follow_aaaa)
                }
                Outcome::Answer => match cname_restart(&response) {
                    Some(target) => self.restart_specs(&query, &target),
                    None => Vec::new(),
                },
                _ => Vec::new(),
            };

            if !specs.is_empty() {
                child_specs.push((server_ip, specs));
            }
            self.tree.node_mut(id).responses.push((server_ip, response));
        }

        let refid = self.tree.node(id).refid.clone();
        let mut ordinal = 1;
        let mut child_ids = Vec::new();
        for (server_ip, specs) in child_specs {
            for spec in specs {
                let child_id = self.tree.push(Referral {
                    refid: format!("{refid}.{ordinal}"),
                    query: spec.query,
                    bailiwick: spec.bailiwick,
                    parent: Some(id),
                    parent_ip: Some(server_ip),
                    server_name: spec.server_name,
                    server_ips: spec.server_ips,
                    depth: depth + 1,
                    state: State::Unresolved,
                    responses: Vec::new(),
                    children: Vec::new(),
                    warnings: Vec::new(),
                    replaced_by: None,
                });
                ordinal += 1;
                self.tree.node_mut(id).children.push(child_id);
                child_ids.push(child_id);
            }
        }

        if !child_ids.is_empty() {
            self.tree.node_mut(id).state = State::Expanded;
            self.hook_main(MainStage::NewReferralSet, id);
        } else {
            let answered = self.tree.node(id).responses.iter().any(|(_, r)| {
                matches!(
                    r.outcome,
                    Outcome::Answer | Outcome::NoData | Outcome::NxDomain
                )
            });
            if answered {
                self.tree.node_mut(id).state = State::Answered;
                self.hook_main(MainStage::Answer, id);
            } else {
                self.tree.node_mut(id).state = State::Expanded;
            }
        }

        for child_id in child_ids {
            self.expand(child_id).await;
        }

        self.fingerprints.entry(fingerprint).or_insert(id);
    }

    /// One query against one IP, via the cache.
    async fn fetch(
        &mut self,
        server_ip: IpAddr,
        query: &Query,
        bailiwick: &Bailiwick,
    ) -> DecodedResponse {
        let key = CacheKey {
            server_ip,
            query: query.clone(),
            bailiwick: bailiwick.clone(),
        };
        if let Some(hit) = self.cache.get(&key) {
            tracing::trace!(%server_ip, qname = %query.name(), "response cache hit");
            return hit;
        }

        let response = DecodedResponse::fetch(
            &*self.exchanger,
            server_ip,
            query,
            bailiwick,
            self.config.udp_size,
        )
        .await;
        tracing::debug!(
            %server_ip,
            qname = %query.name(),
            outcome = %response.outcome,
            rtt = ?response.rtt,
            "classified response"
        );

        *self.tally.entry(response.outcome).or_insert(0) += 1;
        self.cache.insert(key, response.clone());
        response
    }

    /// Children for a CNAME restart: the redirected query, re-seeded at
    /// every root.
    fn restart_specs(&self, query: &Query, target: &Name) -> Vec<ChildSpec> {
        let mut redirected = Query::new();
        redirected.set_name(target.clone());
        redirected.set_query_type(query.query_type());
        redirected.set_query_class(query.query_class());

        self.roots
            .iter()
            .map(|(server_name, server_ips)| ChildSpec {
                query: redirected.clone(),
                bailiwick: Bailiwick::root(),
                server_name: server_name.clone(),
                server_ips: server_ips.clone(),
            })
            .collect()
    }

    /// Resolve a glue-less server name by traversing for its address records
    /// from the roots.
    #[async_recursion]
    async fn resolve_server_ips(&mut self, server_name: &Name) -> Vec<IpAddr> {
        self.resolving.insert(server_name.clone());

        let mut qtypes = vec![RecordType::A];
        if self.config.follow_aaaa {
            qtypes.push(RecordType::AAAA);
        }

        let mut seen = HashSet::new();
        let mut ips = Vec::new();
        for qtype in qtypes {
            let mut query = Query::new();
            query.set_name(server_name.clone());
            query.set_query_type(qtype);
            query.set_query_class(self.config.qclass);

            for (root_name, root_ips) in self.roots.clone() {
                let id = self.seed(query.clone(), root_name, root_ips);
                self.expand(id).await;
                if self.tree.node(id).state == State::FastSkipped {
                    self.hook_resolve(ResolveStage::AnswerFast, id);
                }
                self.harvest_addresses(id, &mut seen, &mut ips);
            }
        }

        self.resolving.remove(server_name);
        tracing::debug!(server = %server_name, count = ips.len(), "resolved server name");
        ips
    }

    /// Collect answer addresses from a sub-traversal's tree, following
    /// fast-mode replacements.
    fn harvest_addresses(&self, id: NodeId, seen: &mut HashSet<IpAddr>, out: &mut Vec<IpAddr>) {
        let mut visited = HashSet::new();
        let mut stack = vec![id];
        while let Some(cursor) = stack.pop() {
            if !visited.insert(cursor) {
                continue;
            }
            let node = self.tree.node(cursor);
            if let Some(replacement) = node.replaced_by {
                stack.push(replacement);
            }
            for child in node.children.iter().rev() {
                stack.push(*child);
            }

            for (_, response) in &node.responses {
                if response.outcome != Outcome::Answer {
                    continue;
                }
                let Some(final_name) = response.final_name() else {
                    continue;
                };
                for rr in &response.records {
                    if rr.name() != &final_name {
                        continue;
                    }
                    let ip = match rr.data() {
                        RData::A(a) => IpAddr::V4(a.0),
                        RData::AAAA(aaaa) => IpAddr::V6(aaaa.0),
                        _ => continue,
                    };
                    if seen.insert(ip) {
                        out.push(ip);
                    }
                }
            }
        }
    }

    async fn find_roots(&mut self) -> Result<Vec<(Name, Vec<IpAddr>)>, TraceError> {
        match self.config.roots.clone() {
            Roots::Explicit(ips) => ips
                .into_iter()
                .map(|ip| Ok((ip_name(ip)?, vec![ip])))
                .collect(),
            Roots::Discover => {
                let (name, ips) = self.get_a_root().await?;
                if self.config.all_roots {
                    self.find_all_roots(ips[0]).await
                } else {
                    Ok(vec![(name, ips)])
                }
            }
        }
    }

    /// Ask the local resolver for the root NS set, pick one at random, and
    /// resolve its addresses.  Falls through the other roots if the pick
    /// does not resolve.
    async fn get_a_root(&mut self) -> Result<(Name, Vec<IpAddr>), TraceError> {
        let targets = self.resolver_ns_targets(Name::root()).await?;
        if targets.is_empty() {
            return Err(TraceError::RootDiscovery(
                "local resolver returned no root NS records".to_string(),
            ));
        }

        let start = rand::thread_rng().gen_range(0..targets.len());
        for offset in 0..targets.len() {
            let target = &targets[(start + offset) % targets.len()];
            let ips = self
                .resolver_addresses(target, self.config.root_aaaa)
                .await;
            if !ips.is_empty() {
                return Ok((target.clone(), ips));
            }
            tracing::debug!(root = %target, "no address for root server, trying next");
        }

        Err(TraceError::RootDiscovery(
            "could not resolve any root server address".to_string(),
        ))
    }

    /// Ask the chosen root directly for `. NS` and resolve every target.
    async fn find_all_roots(
        &mut self,
        seed_ip: IpAddr,
    ) -> Result<Vec<(Name, Vec<IpAddr>)>, TraceError> {
        let mut query = Query::new();
        query.set_name(Name::root());
        query.set_query_type(RecordType::NS);
        query.set_query_class(DNSClass::IN);
        let request = build_request(&query, false, self.config.udp_size);

        let message = self
            .exchanger
            .exchange(SocketAddr::new(seed_ip, DNS_PORT), &request)
            .await
            .map_err(|err| TraceError::RootDiscovery(format!("root NS query failed: {err}")))?;

        let mut roots = Vec::new();
        for target in ns_targets(&message) {
            let mut ips = glue_addresses(&message, &target, self.config.root_aaaa);
            if ips.is_empty() {
                ips = self
                    .resolver_addresses(&target, self.config.root_aaaa)
                    .await;
            }
            if ips.is_empty() {
                tracing::warn!(root = %target, "no address for root server, skipping");
                continue;
            }
            roots.push((target, ips));
        }

        if roots.is_empty() {
            return Err(TraceError::RootDiscovery(
                "no root server resolved to an address".to_string(),
            ));
        }
        roots.sort_by_key(|(name, _)| name.to_string());
        Ok(roots)
    }

    /// A recursive query to the local resolver (the one place the RD bit is
    /// set).
    async fn resolver_query(
        &self,
        qname: Name,
        qtype: RecordType,
    ) -> Result<Message, TraceError> {
        let mut query = Query::new();
        query.set_name(qname);
        query.set_query_type(qtype);
        query.set_query_class(DNSClass::IN);
        let request = build_request(&query, true, self.config.udp_size);

        self.exchanger
            .exchange(self.config.local_resolver, &request)
            .await
            .map_err(|err| TraceError::RootDiscovery(err.to_string()))
    }

    async fn resolver_ns_targets(&self, zone: Name) -> Result<Vec<Name>, TraceError> {
        let message = self.resolver_query(zone, RecordType::NS).await?;
        Ok(ns_targets(&message))
    }

    async fn resolver_addresses(&self, target: &Name, want_aaaa: bool) -> Vec<IpAddr> {
        let mut ips = Vec::new();

        match self.resolver_query(target.clone(), RecordType::A).await {
            Ok(message) => collect_addresses(&message, target, &mut ips),
            Err(err) => tracing::debug!(%target, error = %err, "A lookup failed"),
        }
        if want_aaaa {
            match self.resolver_query(target.clone(), RecordType::AAAA).await {
                Ok(message) => collect_addresses(&message, target, &mut ips),
                Err(err) => tracing::debug!(%target, error = %err, "AAAA lookup failed"),
            }
        }

        ips
    }

    fn hook_main(&self, stage: MainStage, id: NodeId) {
        if let Some(hook) = &self.config.on_referral {
            hook(stage, self.tree.node(id));
        }
    }

    fn hook_resolve(&self, stage: ResolveStage, id: NodeId) {
        if let Some(hook) = &self.config.on_resolve {
            hook(stage, self.tree.node(id));
        }
    }
}

/// NS targets from the answer and authority sections, first occurrence
/// order.
fn ns_targets(message: &Message) -> Vec<Name> {
    let mut targets = Vec::new();
    for rr in message.answers().iter().chain(message.name_servers()) {
        if let RData::NS(ns) = rr.data() {
            if !targets.contains(&ns.0) {
                targets.push(ns.0.clone());
            }
        }
    }
    targets
}

/// Glue addresses for `target` from the additional section.
fn glue_addresses(message: &Message, target: &Name, want_aaaa: bool) -> Vec<IpAddr> {
    let mut ips = Vec::new();
    for rr in message.additionals() {
        if rr.name() != target {
            continue;
        }
        match rr.data() {
            RData::A(a) => ips.push(IpAddr::V4(a.0)),
            RData::AAAA(aaaa) if want_aaaa => ips.push(IpAddr::V6(aaaa.0)),
            _ => (),
        }
    }
    ips
}

/// A/AAAA addresses for `target` from the answer section.
fn collect_addresses(message: &Message, target: &Name, ips: &mut Vec<IpAddr>) {
    for rr in message.answers() {
        if rr.name() != target {
            continue;
        }
        match rr.data() {
            RData::A(a) => ips.push(IpAddr::V4(a.0)),
            RData::AAAA(aaaa) => ips.push(IpAddr::V6(aaaa.0)),
            _ => (),
        }
    }
}

/// A `Name` for an explicitly-given root address, so the referral output and
/// fingerprints have something to call the server.
fn ip_name(ip: IpAddr) -> Result<Name, TraceError> {
    Ok(Name::from_labels([ip.to_string().as_bytes()])?)
}
