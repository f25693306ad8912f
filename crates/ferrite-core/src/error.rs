use std::fmt;

use crate::config::RefreshMethod;

#[derive(Debug)]
pub enum Error {
    /// Topology counts must all be powers of two so address fields pack
    /// into contiguous bit ranges.
    NotPowerOfTwo { field: &'static str, value: usize },
    /// A topology count of zero leaves nothing to address.
    ZeroCount { field: &'static str },
    /// MOP interleaving needs at least one column bit above the interleaved
    /// low bits.
    MopWiderThanColumn { mop: u32, column_bits: u32 },
    /// Refresh fan-outs we recognize but do not implement.
    UnsupportedRefreshMethod(RefreshMethod),
    /// MIRZA group count must divide the row count evenly.
    MirzaGroupMismatch { groups: usize, rows: usize },
    /// A probability knob of zero would mean "never sample".
    ZeroSamplingWindow,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotPowerOfTwo { field, value } => {
                write!(f, "{field} must be a power of two, got {value}")
            }
            Self::ZeroCount { field } => write!(f, "{field} must be nonzero"),
            Self::MopWiderThanColumn { mop, column_bits } => write!(
                f,
                "MOP-{mop} interleave does not fit in {column_bits} column bits"
            ),
            Self::UnsupportedRefreshMethod(method) => {
                write!(f, "refresh method {method:?} is not implemented")
            }
            Self::MirzaGroupMismatch { groups, rows } => {
                write!(f, "{groups} MIRZA groups do not evenly divide {rows} rows")
            }
            Self::ZeroSamplingWindow => write!(f, "mirza_mintw must be nonzero"),
        }
    }
}

impl std::error::Error for Error {}
