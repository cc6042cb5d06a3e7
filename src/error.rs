use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{kind} {name:?} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} {name:?} already exists")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("conflict writing {kind} {name:?}: stored revision {stored}, expected {expected}")]
    Conflict {
        kind: &'static str,
        name: String,
        stored: u64,
        expected: u64,
    },

    #[error("registry unavailable: {0}")]
    Unavailable(String),

    #[error("{0} pool exhausted")]
    Exhausted(&'static str),

    #[error("invalid vnid: {0}")]
    InvalidVnid(String),

    #[error("invalid subnet: {0}")]
    InvalidSubnet(String),

    #[error("invalid node ip: {0}")]
    InvalidNodeIp(String),

    #[error("invalid network config: {0}")]
    InvalidNetworkConfig(String),

    #[error("invalid project selection: {0}")]
    InvalidSelection(String),

    #[error("dataplane error: {0}")]
    Dataplane(String),

    #[error("reconcile error: {0}")]
    Reconcile(String),

    #[error("invalid ip network construction: {0}")]
    InvalidIpNetwork(#[from] ipnetwork::IpNetworkError),

    #[error(transparent)]
    AddrParse(#[from] std::net::AddrParseError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Error::NotFound { kind: k1, name: n1 }, Error::NotFound { kind: k2, name: n2 }) => {
                k1 == k2 && n1 == n2
            }
            (
                Error::AlreadyExists { kind: k1, name: n1 },
                Error::AlreadyExists { kind: k2, name: n2 },
            ) => k1 == k2 && n1 == n2,
            (
                Error::Conflict {
                    kind: k1,
                    name: n1,
                    stored: s1,
                    expected: e1,
                },
                Error::Conflict {
                    kind: k2,
                    name: n2,
                    stored: s2,
                    expected: e2,
                },
            ) => k1 == k2 && n1 == n2 && s1 == s2 && e1 == e2,
            (Error::Unavailable(a), Error::Unavailable(b)) => a == b,
            (Error::Exhausted(a), Error::Exhausted(b)) => a == b,
            (Error::InvalidVnid(a), Error::InvalidVnid(b)) => a == b,
            (Error::InvalidSubnet(a), Error::InvalidSubnet(b)) => a == b,
            (Error::InvalidNodeIp(a), Error::InvalidNodeIp(b)) => a == b,
            (Error::InvalidNetworkConfig(a), Error::InvalidNetworkConfig(b)) => a == b,
            (Error::InvalidSelection(a), Error::InvalidSelection(b)) => a == b,
            (Error::Dataplane(a), Error::Dataplane(b)) => a == b,
            (Error::Reconcile(a), Error::Reconcile(b)) => a == b,
            (Error::InvalidIpNetwork(a), Error::InvalidIpNetwork(b)) => a == b,
            (Error::AddrParse(a), Error::AddrParse(b)) => a == b,
            (Error::Io(a), Error::Io(b)) => a.kind() == b.kind(),
            _ => false,
        }
    }
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists { .. })
    }

    pub(crate) fn metric_label(&self) -> &'static str {
        match self {
            Error::NotFound { .. } => "not_found",
            Error::AlreadyExists { .. } => "already_exists",
            Error::Conflict { .. } => "conflict",
            Error::Unavailable(_) => "unavailable",
            Error::Exhausted(_) => "exhausted",
            Error::InvalidVnid(_) => "invalid_vnid",
            Error::InvalidSubnet(_) => "invalid_subnet",
            Error::InvalidNodeIp(_) => "invalid_node_ip",
            Error::InvalidNetworkConfig(_) => "invalid_network_config",
            Error::InvalidSelection(_) => "invalid_selection",
            Error::Dataplane(_) => "dataplane",
            Error::Reconcile(_) => "reconcile",
            Error::InvalidIpNetwork(_) => "invalid_ip_network",
            Error::AddrParse(_) => "addr_parse",
            Error::Io(_) => "io",
        }
    }
}
