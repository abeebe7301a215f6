//! Addresses and actor references.
//!
//! Address syntax: `scheme://host[:port][/subpool/<index>]` with
//! scheme ∈ `{inproc, unix, tcp, ucx}`. The optional `/subpool/<index>`
//! suffix names a worker process behind a pool's main endpoint; routing
//! always connects to the endpoint and the receiving main process forwards
//! by index.

use crate::error::AddressError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Maximum length of an actor uid in bytes.
pub const MAX_UID_LEN: usize = 64;

/// Transport scheme of an [`Address`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scheme {
    /// Same-process paired queues, no serialization.
    Inproc,
    /// Unix domain socket (same host, different process).
    Unix,
    /// TCP with `TCP_NODELAY`.
    Tcp,
    /// RDMA/UCX datapath. The scheme parses but no driver ships in the
    /// core; one may be registered externally.
    Ucx,
}

impl Scheme {
    fn as_str(self) -> &'static str {
        match self {
            Scheme::Inproc => "inproc",
            Scheme::Unix => "unix",
            Scheme::Tcp => "tcp",
            Scheme::Ucx => "ucx",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pool endpoint, optionally narrowed to one sub-pool.
///
/// Equality is structural over all fields, so `tcp://h:1/subpool/0` and
/// `tcp://h:1` are distinct addresses sharing one endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub scheme: Scheme,
    /// Hostname or IP for `tcp`/`ucx`, filesystem path for `unix`,
    /// arbitrary label for `inproc`.
    pub host: String,
    pub port: Option<u16>,
    /// Sub-pool index behind the endpoint, if narrowed.
    pub subpool: Option<u32>,
}

impl Address {
    /// Parse from the `scheme://host[:port][/subpool/<index>]` syntax.
    pub fn parse(s: &str) -> Result<Self, AddressError> {
        let (scheme_str, rest) = s
            .split_once("://")
            .ok_or_else(|| AddressError::InvalidFormat(s.to_string()))?;

        let scheme = match scheme_str {
            "inproc" => Scheme::Inproc,
            "unix" => Scheme::Unix,
            "tcp" => Scheme::Tcp,
            "ucx" => Scheme::Ucx,
            other => return Err(AddressError::UnknownScheme(other.to_string())),
        };

        // Peel a trailing `/subpool/<index>` segment if present. Unix paths
        // contain slashes, so only the exact suffix form is recognized.
        let (body, subpool) = match rest.rfind("/subpool/") {
            Some(pos) if pos + "/subpool/".len() < rest.len() => {
                let idx_str = &rest[pos + "/subpool/".len()..];
                let idx: u32 = idx_str
                    .parse()
                    .map_err(|_| AddressError::InvalidSubPool(idx_str.to_string()))?;
                (&rest[..pos], Some(idx))
            }
            _ => (rest, None),
        };

        if body.is_empty() {
            return Err(AddressError::InvalidFormat(s.to_string()));
        }

        let (host, port) = match scheme {
            Scheme::Unix | Scheme::Inproc => (body.to_string(), None),
            Scheme::Tcp | Scheme::Ucx => {
                let (host, port_str) = body.rsplit_once(':').ok_or(AddressError::Missing {
                    scheme: scheme.as_str(),
                    what: "a port",
                })?;
                let port: u16 = port_str
                    .parse()
                    .map_err(|_| AddressError::InvalidFormat(s.to_string()))?;
                if host.is_empty() {
                    return Err(AddressError::InvalidFormat(s.to_string()));
                }
                (host.to_string(), Some(port))
            }
        };

        Ok(Self {
            scheme,
            host,
            port,
            subpool,
        })
    }

    /// This address with the sub-pool suffix stripped: the thing a driver
    /// actually connects to.
    pub fn endpoint(&self) -> Address {
        Address {
            subpool: None,
            ..self.clone()
        }
    }

    /// Narrow this endpoint to one sub-pool index.
    pub fn with_subpool(&self, index: u32) -> Address {
        Address {
            subpool: Some(index),
            ..self.clone()
        }
    }

    /// Stable key for the router's channel table.
    pub fn endpoint_key(&self) -> String {
        self.endpoint().to_string()
    }

    /// Whether two addresses point at the same endpoint, ignoring the
    /// sub-pool narrowing.
    pub fn same_endpoint(&self, other: &Address) -> bool {
        self.scheme == other.scheme && self.host == other.host && self.port == other.port
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        if let Some(idx) = self.subpool {
            write!(f, "/subpool/{idx}")?;
        }
        Ok(())
    }
}

impl std::str::FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Actor identifier, unique within its owning pool.
///
/// A uid is an opaque byte sequence of at most [`MAX_UID_LEN`] bytes,
/// typically a user-chosen name or an allocated decimal integer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActorUid(Vec<u8>);

impl ActorUid {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self, AddressError> {
        let bytes = bytes.into();
        if bytes.len() > MAX_UID_LEN {
            return Err(AddressError::UidTooLong(bytes.len()));
        }
        Ok(Self(bytes))
    }

    /// Uid for an allocated integer identity (decimal rendering, as the
    /// allocator hands them out).
    pub fn allocated(seq: u64) -> Self {
        Self(seq.to_string().into_bytes())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ActorUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl From<&str> for ActorUid {
    fn from(s: &str) -> Self {
        // Callers constructing uids from short literals; oversized names are
        // truncated to the wire limit.
        let mut bytes = s.as_bytes().to_vec();
        bytes.truncate(MAX_UID_LEN);
        Self(bytes)
    }
}

/// Handle identifying a live actor: `(uid, address)` plus a cached proxy
/// version used to invalidate routing caches after a restart.
///
/// ActorRefs are cheap values with no lifetime tie to the referent.
/// Equality and hashing are structural over `(uid, address)` only; the
/// proxy version is a local cache detail and never travels on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActorRef {
    pub uid: ActorUid,
    pub address: Address,
    #[serde(skip)]
    pub proxy_version: u32,
}

impl ActorRef {
    pub fn new(uid: ActorUid, address: Address) -> Self {
        Self {
            uid,
            address,
            proxy_version: 0,
        }
    }

    /// The well-known control endpoint of a process (heartbeats, handshake,
    /// pool control). Not a user-visible actor.
    pub fn control(address: Address) -> Self {
        Self::new(ActorUid::from(".control"), address)
    }

    /// Bump the proxy version after the referent's pool restarted.
    pub fn bump_proxy_version(&mut self) {
        self.proxy_version = self.proxy_version.wrapping_add(1);
    }
}

impl PartialEq for ActorRef {
    fn eq(&self, other: &Self) -> bool {
        self.uid == other.uid && self.address == other.address
    }
}

impl Eq for ActorRef {}

impl Hash for ActorRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.uid.hash(state);
        self.address.hash(state);
    }
}

impl fmt::Display for ActorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.uid, self.address)
    }
}
