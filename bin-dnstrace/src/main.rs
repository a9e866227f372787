use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::process;
use std::str::FromStr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use dns_traverser::traverse::{MainStage, ResolveStage, Roots, TraverseConfig};
use dns_traverser::tree::{FailureKind, NodeId, State, Tree};
use dns_traverser::util::net::WireExchanger;
use dns_traverser::util::types::fqdn;
use dns_traverser::{TraceError, Traverser, DEFAULT_MAX_DEPTH, DEFAULT_RETRIES, DEFAULT_UDP_SIZE};
use hickory_proto::rr::{Name, RecordType};
use hickory_proto::ProtoError;

fn parse_domain(s: &str) -> Result<Name, ProtoError> {
    fqdn(s)
}

fn parse_qtype(s: &str) -> Result<RecordType, ProtoError> {
    RecordType::from_str(&s.to_uppercase())
}

// the doc comments for this struct turn into the CLI help text
#[derive(Parser)]
/// DNS delegation tracer
///
/// Explores every path a recursive resolver could take from the root
/// servers to an answer for the given query, and reports the referral tree
/// together with the probability of each outcome under a uniform choice of
/// server IP at every step.
struct Args {
    /// Domain name to trace
    #[clap(value_parser = parse_domain)]
    domain: Name,

    /// Query type to trace
    #[clap(short = 't', long = "type", default_value = "A", value_parser = parse_qtype)]
    qtype: RecordType,

    /// Root server IP to start from instead of discovering one, can be
    /// specified more than once
    #[clap(long, value_parser)]
    root_server: Vec<IpAddr>,

    /// Traverse from every root server rather than one picked at random
    #[clap(long, action(clap::ArgAction::SetTrue))]
    all_root_servers: bool,

    /// EDNS0 UDP payload size; 512 disables EDNS0
    #[clap(long, default_value_t = DEFAULT_UDP_SIZE, value_parser)]
    udp_size: u16,

    /// Retry over TCP when a response comes back truncated
    #[clap(long, action(clap::ArgAction::SetTrue))]
    allow_tcp: bool,

    /// Use TCP for every query (implies --allow-tcp)
    #[clap(long, action(clap::ArgAction::SetTrue))]
    always_tcp: bool,

    /// Maximum referral depth before a branch is abandoned
    #[clap(long, default_value_t = DEFAULT_MAX_DEPTH, value_parser)]
    max_depth: usize,

    /// Send attempts per query
    #[clap(long, default_value_t = DEFAULT_RETRIES, value_parser)]
    retries: usize,

    /// Resolve AAAA as well as A for nameserver targets
    #[clap(long, action(clap::ArgAction::SetTrue))]
    follow_aaaa: bool,

    /// Resolve AAAA as well as A for root servers
    #[clap(long, action(clap::ArgAction::SetTrue))]
    root_aaaa: bool,

    /// Collapse referrals that share a (server, query, bailiwick)
    /// fingerprint (the default)
    #[clap(long, overrides_with = "no_fast", action(clap::ArgAction::SetTrue))]
    fast: bool,

    /// Explore every sub-tree independently, even when fingerprints repeat
    #[clap(long, action(clap::ArgAction::SetTrue))]
    no_fast: bool,

    /// Print referral lifecycle events as they happen
    #[clap(long, action(clap::ArgAction::SetTrue))]
    show_progress: bool,

    /// Print server-name resolution events as they happen
    #[clap(long, action(clap::ArgAction::SetTrue))]
    show_resolves: bool,

    /// Print every server encountered and the addresses it went by
    #[clap(long, action(clap::ArgAction::SetTrue))]
    show_servers: bool,

    /// Print the outcome distribution of every referral, not just the tree
    #[clap(long, action(clap::ArgAction::SetTrue))]
    show_all_stats: bool,

    /// Log at info level
    #[clap(short, long, action(clap::ArgAction::SetTrue))]
    verbose: bool,

    /// Log at debug level
    #[clap(long, action(clap::ArgAction::SetTrue))]
    debug: bool,

    /// Local resolver used for root discovery
    #[clap(long, default_value = "127.0.0.1:53", value_parser)]
    resolver: SocketAddr,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let default_level = if args.debug {
        "debug"
    } else if args.verbose {
        "info"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let roots = if args.root_server.is_empty() {
        Roots::Discover
    } else {
        Roots::Explicit(args.root_server.clone())
    };

    let mut config = TraverseConfig {
        roots,
        all_roots: args.all_root_servers,
        follow_aaaa: args.follow_aaaa,
        root_aaaa: args.root_aaaa,
        always_tcp: args.always_tcp,
        allow_tcp: args.allow_tcp,
        udp_size: args.udp_size,
        max_depth: args.max_depth,
        retries: args.retries,
        fast: !args.no_fast,
        local_resolver: args.resolver,
        ..TraverseConfig::default()
    }
    .normalise();

    if args.show_progress {
        config.on_referral = Some(Box::new(|stage, referral| {
            let tag = match stage {
                MainStage::Start => "start",
                MainStage::NewReferralSet => "referrals",
                MainStage::Answer => "answer",
                MainStage::AnswerFast => "answer (fast)",
            };
            println!(
                "; [{tag}] {} {} via {}",
                referral.refid,
                referral.query.name(),
                referral.server_name
            );
        }));
    }
    if args.show_resolves {
        config.on_resolve = Some(Box::new(|stage, referral| {
            let tag = match stage {
                ResolveStage::Start => "resolve",
                ResolveStage::AnswerFast => "resolve (fast)",
            };
            println!("; [{tag}] {} {}", referral.refid, referral.server_name);
        }));
    }

    let exchanger = Arc::new(WireExchanger::from_config(&config));
    let mut traverser = Traverser::new(config, exchanger);

    let report = tokio::select! {
        result = traverser.run(args.domain.clone(), args.qtype) => match result {
            Ok(report) => report,
            Err(err @ (TraceError::RootDiscovery(_) | TraceError::NoRoots)) => {
                eprintln!("dnstrace: {err}");
                process::exit(2);
            }
            Err(err) => {
                eprintln!("dnstrace: {err}");
                process::exit(1);
            }
        },
        _ = tokio::signal::ctrl_c() => {
            eprintln!("dnstrace: interrupted");
            process::exit(130);
        }
    };

    println!(";; QUESTION");
    println!("{}\tIN\t{}", args.domain, args.qtype);

    println!("\n;; REFERRALS");
    for root in &report.roots {
        print_referral(&report.tree, *root, args.show_all_stats);
    }

    let answers = report.answers();
    if !answers.is_empty() {
        println!("\n;; ANSWER");
        for rr in &answers {
            println!("{rr}");
        }
    }

    println!("\n;; OUTCOME DISTRIBUTION");
    let mut outcomes: Vec<_> = report.distribution.iter().collect();
    outcomes.sort_by(|(_, pa), (_, pb)| pb.partial_cmp(pa).unwrap_or(std::cmp::Ordering::Equal));
    for (outcome, probability) in outcomes {
        println!("{probability:>8.4}\t{outcome}");
    }

    if args.show_servers {
        println!("\n;; SERVERS");
        let mut names: Vec<_> = report.servers.keys().collect();
        names.sort_by_key(|name| name.to_string());
        for name in names {
            let ips: Vec<String> = report.servers[name].iter().map(ToString::to_string).collect();
            println!("{name}\t{}", ips.join(", "));
        }
    }
}

fn print_referral(tree: &Tree, id: NodeId, show_all_stats: bool) {
    let node = tree.node(id);
    let ips: Vec<String> = node.server_ips.iter().map(ToString::to_string).collect();

    let status = match node.state {
        State::FastSkipped => node
            .replaced_by
            .map(|replacement| format!("  -> same as {}", tree.node(replacement).refid))
            .unwrap_or_default(),
        State::Failed(FailureKind::DepthExceeded) => "  !! depth exceeded".to_string(),
        State::Failed(FailureKind::Loop) => "  !! loop".to_string(),
        State::Failed(FailureKind::ServerResolution) => "  !! server unresolvable".to_string(),
        _ => String::new(),
    };

    println!(
        "{:<12} {} [{}]  bailiwick {}{status}",
        node.refid,
        node.server_name,
        ips.join(", "),
        node.bailiwick
    );

    if show_all_stats {
        let parts: Vec<String> = tree
            .distribution(id)
            .iter()
            .map(|(outcome, probability)| format!("{outcome}={probability:.4}"))
            .collect();
        println!("{:<12} ({})", "", parts.join(" "));
    }

    for child in &node.children {
        print_referral(tree, *child, show_all_stats);
    }
}
