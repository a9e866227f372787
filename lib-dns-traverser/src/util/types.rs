use std::fmt;
use std::str::FromStr;

use hickory_proto::rr::Name;
use hickory_proto::ProtoError;
use thiserror::Error;

/// The zone cut under which a referral is valid.
///
/// A resource record with owner name `N` is in-bailiwick iff `N` equals the
/// bailiwick name or is a subdomain of it, compared case-insensitively.
/// Records outside the bailiwick come from a server with no authority over
/// them and must never be used.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Bailiwick(Name);

impl Bailiwick {
    pub fn new(name: Name) -> Self {
        Bailiwick(name)
    }

    /// The root bailiwick, under which every name falls.
    pub fn root() -> Self {
        Bailiwick(Name::root())
    }

    pub fn name(&self) -> &Name {
        &self.0
    }

    /// Whether `name` is in-bailiwick.
    pub fn contains(&self, name: &Name) -> bool {
        self.0.zone_of(name)
    }
}

impl fmt::Display for Bailiwick {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Bailiwick {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Bailiwick(fqdn(s)?))
    }
}

/// Parse a domain name and normalise it to fully-qualified form.
///
/// All names inside the traverser are FQDNs: `Name` equality and hashing are
/// case-insensitive but they are not relative/absolute-insensitive, so
/// normalising once on ingestion keeps every comparison honest.
pub fn fqdn(s: &str) -> Result<Name, ProtoError> {
    let mut name = Name::from_utf8(s)?;
    name.set_fqdn(true);
    Ok(name)
}

/// An error which aborts a whole traversal.
///
/// Per-response problems (timeouts, bad servers, lame referrals) are never
/// errors: they fold into the outcome distribution and the traversal carries
/// on at sibling branches.
#[derive(Debug, Error)]
pub enum TraceError {
    /// Root discovery failed: the local resolver did not give us a usable
    /// root server set.
    #[error("root discovery failed: {0}")]
    RootDiscovery(String),

    /// The configured or discovered root set is empty.
    #[error("no usable root servers")]
    NoRoots,

    /// DNS protocol error while preparing the traversal.
    #[error(transparent)]
    Proto(#[from] ProtoError),
}
