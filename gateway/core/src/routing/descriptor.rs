//! Backend Descriptors
//!
//! Static, read-only description of each backend, loaded once at startup.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Routing tier; candidates are tried in ascending tier order
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendTier {
    /// Local, low-latency, zero-cost
    Local,
    /// Preferred metered remote backend
    CloudPrimary,
    /// Last-resort metered remote backend
    CloudFallback,
}

impl fmt::Display for BackendTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Local => "local",
            Self::CloudPrimary => "cloud_primary",
            Self::CloudFallback => "cloud_fallback",
        };
        f.write_str(s)
    }
}

/// Static configuration of one backend
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackendDescriptor {
    /// Unique name
    pub name: String,
    /// Routing tier
    pub tier: BackendTier,
    /// Hard ceiling on in-flight calls
    pub max_concurrent: u32,
    /// Sliding 60 s admission cap (`None` = uncapped)
    #[serde(default)]
    pub requests_per_minute: Option<u32>,
    /// Per-UTC-day admission cap (`None` = uncapped)
    #[serde(default)]
    pub requests_per_day: Option<u32>,
    /// Expected cost of one call; zero means unmetered
    #[serde(default)]
    pub cost_per_request_usd: f64,
    /// Largest content (bytes) the backend accepts
    pub max_content_size: usize,
}

impl BackendDescriptor {
    /// Create a descriptor with no quotas and no cost
    pub fn new(
        name: impl Into<String>,
        tier: BackendTier,
        max_concurrent: u32,
        max_content_size: usize,
    ) -> Self {
        Self {
            name: name.into(),
            tier,
            max_concurrent,
            requests_per_minute: None,
            requests_per_day: None,
            cost_per_request_usd: 0.0,
            max_content_size,
        }
    }

    /// Set the per-minute quota
    #[must_use]
    pub fn with_requests_per_minute(mut self, rpm: u32) -> Self {
        self.requests_per_minute = Some(rpm);
        self
    }

    /// Set the per-day quota
    #[must_use]
    pub fn with_requests_per_day(mut self, rpd: u32) -> Self {
        self.requests_per_day = Some(rpd);
        self
    }

    /// Set the per-request cost
    #[must_use]
    pub fn with_cost(mut self, cost_usd: f64) -> Self {
        self.cost_per_request_usd = cost_usd;
        self
    }

    /// Whether calls to this backend are charged against the budget
    #[must_use]
    pub fn is_metered(&self) -> bool {
        self.cost_per_request_usd > 0.0
    }

    /// Whether the backend can take content of `size` bytes
    #[must_use]
    pub fn accepts(&self, size: usize) -> bool {
        size <= self.max_content_size
    }
}

/// Sort descriptors into routing order (tier, then configuration order)
pub fn routing_order(descriptors: &mut [BackendDescriptor]) {
    // stable sort keeps config order within a tier
    descriptors.sort_by_key(|d| d.tier);
}
