#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::similar_names)]
#![allow(clippy::struct_excessive_bools)]
#![allow(clippy::too_many_lines)]

pub mod cache;
pub mod dist;
pub mod msg;
pub mod response;
pub mod test_util;
pub mod traverse;
pub mod tree;
pub mod util;

use std::sync::Arc;
use std::time::Duration;

use hickory_proto::rr::{Name, RecordType};

pub use self::dist::{Outcome, OutcomeDist};
pub use self::traverse::{TraceReport, TraverseConfig, Traverser};
pub use self::util::net::Exchanger;
pub use self::util::types::TraceError;

/// Default depth bound for the referral tree.  CNAME restarts and
/// delegations both deepen the tree, so a chain longer than this cannot be
/// traced; this protects against maliciously-deep delegations.
pub const DEFAULT_MAX_DEPTH: usize = 20;

/// Default number of send attempts per query.
pub const DEFAULT_RETRIES: usize = 2;

/// Default per-attempt timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Default advertised EDNS0 payload size.
pub const DEFAULT_UDP_SIZE: u16 = 4096;

/// Trace every delegation path for `(qname, qtype)`.
///
/// This builds a one-shot `Traverser`; callers wanting a warm cache across
/// queries should hold on to a `Traverser` instead.
pub async fn trace(
    config: TraverseConfig,
    exchanger: Arc<dyn Exchanger>,
    qname: Name,
    qtype: RecordType,
) -> Result<TraceReport, TraceError> {
    Traverser::new(config, exchanger).run(qname, qtype).await
}
