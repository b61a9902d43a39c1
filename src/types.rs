#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// How the catalog query is split to get past the upstream result cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum PartitionMode {
    /// One query.
    Single,
    /// One query per leading identifier character (a-z, 0-9).
    Prefix,
    /// Single first; prefix partitions too if the single query hits the cap.
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum RemoteKind {
    /// One GitHub repository per pack, created on demand.
    #[value(name = "github")]
    GitHub,
    /// Bare repositories in a local directory.
    Local,
    /// Commit only.
    None,
}
