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
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum BackoffKind {
    None,
    Fixed,
    Exponential,
}

/// Storage format of the per-tag "already downloaded" ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum LedgerBackend {
    /// `downloaded_images.txt`, one key per line.
    Text,
    /// `ledger.db` with size and SHA-256 per entry.
    Sqlite,
}

impl LedgerBackend {
    pub fn as_str(&self) -> &str {
        match self {
            LedgerBackend::Text => "text",
            LedgerBackend::Sqlite => "sqlite",
        }
    }
}
