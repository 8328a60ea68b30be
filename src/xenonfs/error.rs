//! Fatal errors and the soft diagnostics collected while decoding.

use std::fmt;

use log::{info, warn};
use thiserror::Error;

/// Errors that stop an operation.
///
/// Geometry and FSRoot failures end the whole session; [`Error::CorruptChain`] only affects the
/// file being extracted.
#[derive(Debug, Error)]
pub enum Error {
    #[error("unsupported geometry: {0}")]
    UnsupportedGeometry(String),

    #[error("no FSRoot block found on this image")]
    NoFsRootFound,

    #[error("I/O error reading block {block:#x}")]
    Io {
        block: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error("corrupt cluster chain at cluster {cluster:#x}: {fault}")]
    CorruptChain { cluster: u16, fault: ChainFault },

    #[error("{what} too short: {len:#x} bytes, need {need:#x}")]
    Truncated {
        what: &'static str,
        len: usize,
        need: usize,
    },

    #[error("malformed spare metadata")]
    Decode(#[from] deku::DekuError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Why a cluster chain was rejected
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum ChainFault {
    /// The chain came back to a cluster it already visited
    Cycle,

    /// The cluster index does not fit in the chain table
    OutOfTable,
}

impl fmt::Display for ChainFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cycle => write!(f, "chain loops back on itself"),
            Self::OutOfTable => write!(f, "index outside the chain table"),
        }
    }
}

/// A non-fatal condition found while decoding. Each one names the block, page or file involved so
/// that it can be looked at by hand.
#[derive(Debug, Eq, PartialEq, Clone)]
pub enum Issue {
    /// The stored EDC does not match the page contents; the page is still used.
    EccMismatch { block: u32, page: u32 },

    /// The block carries a bad-block mark and is left out of the LBA map.
    BadBlock { block: u32 },

    /// The chain ended (sentinel cluster) before the file size was reached.
    TruncatedChain {
        file: String,
        cluster: u16,
        missing: u32,
    },

    /// No physical block carries the logical address of this cluster.
    UnmappedCluster { file: String, cluster: u16 },

    /// The image holds no copy of this Mobile. This is not an error.
    MissingMobile { id: u8 },
}

impl Issue {
    /// Purely informational issues do not indicate damage.
    pub fn is_informational(&self) -> bool {
        matches!(self, Self::MissingMobile { .. })
    }
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EccMismatch { block, page } => {
                write!(f, "EDC mismatch in block {block:#x}, page {page}")
            }
            Self::BadBlock { block } => write!(f, "block {block:#x} is marked bad"),
            Self::TruncatedChain {
                file,
                cluster,
                missing,
            } => write!(
                f,
                "{file}: chain ends at cluster {cluster:#x} with {missing} bytes unread"
            ),
            Self::UnmappedCluster { file, cluster } => {
                write!(f, "{file}: cluster {cluster:#x} is not mapped to any block")
            }
            Self::MissingMobile { id } => write!(f, "mobile {id:#04x} not present"),
        }
    }
}

/// Every [`Issue`] raised during a session, in the order they were found
#[derive(Debug, Default, Clone)]
pub struct Report {
    issues: Vec<Issue>,
}

impl Report {
    /// Record an issue, logging it as it comes in
    pub fn push(&mut self, issue: Issue) {
        if issue.is_informational() {
            info!("{issue}");
        } else {
            warn!("{issue}");
        }
        self.issues.push(issue);
    }

    pub fn extend<I: IntoIterator<Item = Issue>>(&mut self, issues: I) {
        for issue in issues {
            self.push(issue);
        }
    }

    pub fn issues(&self) -> &[Issue] {
        &self.issues
    }

    /// Issues that point at actual damage on the image
    pub fn warnings(&self) -> impl Iterator<Item = &Issue> {
        self.issues.iter().filter(|x| !x.is_informational())
    }

    pub fn is_clean(&self) -> bool {
        self.warnings().next().is_none()
    }
}

#[test]
fn test_report_filters_informational() {
    let mut report = Report::default();
    report.push(Issue::MissingMobile { id: 0x35 });
    assert!(report.is_clean());

    report.push(Issue::BadBlock { block: 0x12 });
    assert!(!report.is_clean());
    assert_eq!(report.issues().len(), 2);
    assert_eq!(report.warnings().count(), 1);
}
