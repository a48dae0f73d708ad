/// Why a header could not be read. Absorbed by the engine, never surfaced
/// from the data plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("truncated header: need {needed} bytes, {remaining} remain")]
    Truncated { needed: usize, remaining: usize },

    #[error("invalid IPv4 header length {header_len} ({remaining} bytes remain)")]
    InvalidHeaderLength { header_len: usize, remaining: usize },
}

/// Control-plane failures. A rejected call leaves the table untouched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("invalid prefix length {0}, expected 0..=32")]
    InvalidPrefixLength(u32),

    #[error("prefix table full ({capacity} entries)")]
    TableFull { capacity: usize },
}

pub type Result<T> = std::result::Result<T, Error>;
