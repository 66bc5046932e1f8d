//! CDN vendors and the canonical cache-hit taxonomy.
//!
//! Every vendor reports cache state in its own header dialect; all of them
//! collapse into [`CacheTrace`]. Which traces survive processing depends on
//! the vendor (CloudFront has no two-tier distinction).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The four CDN vendors whose header dialects we understand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cdn {
    Akamai,
    CloudFront,
    Edgio,
    Fastly,
}

impl Cdn {
    /// Partition order used when concatenating processed vendor tables.
    pub const ALL: [Cdn; 4] = [Cdn::Akamai, Cdn::CloudFront, Cdn::Edgio, Cdn::Fastly];

    pub fn as_str(self) -> &'static str {
        match self {
            Cdn::Akamai => "akamai",
            Cdn::CloudFront => "cloudfront",
            Cdn::Edgio => "edgio",
            Cdn::Fastly => "fastly",
        }
    }

    /// Cache traces that survive the post-classification filter.
    pub fn accepted_traces(self) -> &'static [CacheTrace] {
        match self {
            Cdn::CloudFront => &[CacheTrace::Hit, CacheTrace::Miss],
            Cdn::Akamai | Cdn::Edgio | Cdn::Fastly => {
                &[CacheTrace::L1, CacheTrace::L2, CacheTrace::Miss]
            }
        }
    }

    pub fn accepts(self, trace: CacheTrace) -> bool {
        self.accepted_traces().contains(&trace)
    }

    /// Infer the vendor from a result file name (`..._akamai_...`).
    pub fn from_file_name(name: &str) -> Option<Cdn> {
        let lower = name.to_lowercase();
        Cdn::ALL
            .into_iter()
            .find(|cdn| lower.contains(&format!("_{}_", cdn.as_str())))
    }
}

impl fmt::Display for Cdn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Cdn {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "akamai" => Ok(Cdn::Akamai),
            "cloudfront" | "amazon" => Ok(Cdn::CloudFront),
            "edgio" => Ok(Cdn::Edgio),
            "fastly" => Ok(Cdn::Fastly),
            _ => anyhow::bail!(
                "Unknown CDN: {}. Use akamai, cloudfront, edgio or fastly",
                s
            ),
        }
    }
}

/// Where a response was served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheTrace {
    /// First-tier edge cache.
    L1,
    /// Second-tier edge cache (first tier missed).
    L2,
    /// Undifferentiated hit (CloudFront only).
    Hit,
    Miss,
    /// No recognised diagnostic header matched.
    #[serde(rename = "NaN")]
    Unknown,
}

impl CacheTrace {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheTrace::L1 => "l1",
            CacheTrace::L2 => "l2",
            CacheTrace::Hit => "hit",
            CacheTrace::Miss => "miss",
            CacheTrace::Unknown => "NaN",
        }
    }

    pub fn is_hit(self) -> bool {
        matches!(self, CacheTrace::L1 | CacheTrace::L2 | CacheTrace::Hit)
    }
}

impl fmt::Display for CacheTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheTrace {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "l1" => Ok(CacheTrace::L1),
            "l2" => Ok(CacheTrace::L2),
            "hit" => Ok(CacheTrace::Hit),
            "miss" => Ok(CacheTrace::Miss),
            "NaN" => Ok(CacheTrace::Unknown),
            _ => anyhow::bail!("Unknown cache trace: {}", s),
        }
    }
}
