//! Per-vendor cache-header decision tables.
//!
//! Each CDN reports cache state in an undocumented dialect:
//! - Akamai: `x-cache` / `x-cache-remote` (debug Pragma) or `akamai-cache-status`,
//!   edge names in the `akamai-request-bc` breadcrumbs.
//! - CloudFront: `x-cache: <Hit|Miss|RefreshHit> from cloudfront`, POP in `x-amz-cf-pop`.
//! - Edgio: `x-ec-cache` / `x-ec-cache-remote`, e.g. `TCP_HIT from ECS (lha/8D21)`.
//! - Fastly: `x-cache: HIT, MISS` aligned with the hop chain in `x-served-by`.
//!
//! Classification is total: missing or unexpected headers produce
//! [`CacheTrace::Unknown`] and `"NaN"` edge/origin fields, never an error.

use serde::Serialize;

use super::headers::HeaderMap;
use crate::cdn::{Cdn, CacheTrace};

/// Placeholder for absent edge/origin identifiers.
pub const NAN: &str = "NaN";

/// Canonical cache fields extracted from one response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheFields {
    pub cache_trace: CacheTrace,
    pub edge_l1: String,
    pub edge_l2: String,
    pub origin: String,
}

/// Run the decision table for `cdn` over one header map.
pub fn classify(cdn: Cdn, headers: &HeaderMap) -> CacheFields {
    let (cache_trace, (edge_l1, edge_l2), origin) = match cdn {
        Cdn::Akamai => (
            akamai_trace(headers),
            akamai_edges(headers),
            generic_origin(headers),
        ),
        Cdn::CloudFront => (
            cloudfront_trace(headers),
            cloudfront_edges(headers),
            generic_origin(headers),
        ),
        Cdn::Edgio => (
            edgio_trace(headers),
            edgio_edges(headers),
            edgio_origin(headers),
        ),
        Cdn::Fastly => (
            fastly_trace(headers),
            fastly_edges(headers),
            generic_origin(headers),
        ),
    };

    CacheFields {
        cache_trace,
        edge_l1,
        edge_l2,
        origin,
    }
}

fn generic_origin(headers: &HeaderMap) -> String {
    headers.get("server").unwrap_or(NAN).to_string()
}

fn first_token_lower(value: &str) -> Option<String> {
    value.split_whitespace().next().map(str::to_lowercase)
}

fn first_two(mut edges: impl Iterator<Item = String>) -> (String, String) {
    let l1 = edges.next().unwrap_or_else(|| NAN.to_string());
    let l2 = edges.next().unwrap_or_else(|| NAN.to_string());
    (l1, l2)
}

/// Hit/miss rule shared by the two-tier vendors: a primary hit is L1, a
/// primary miss with a secondary hit is L2.
fn two_tier(primary: Option<&str>, secondary: Option<&str>) -> CacheTrace {
    let Some(primary) = primary.filter(|p| !p.is_empty()) else {
        return CacheTrace::Unknown;
    };
    if primary.contains("hit") {
        CacheTrace::L1
    } else if primary.contains("miss") {
        if secondary.is_some_and(|s| s.contains("hit")) {
            CacheTrace::L2
        } else {
            CacheTrace::Miss
        }
    } else {
        CacheTrace::Unknown
    }
}

// ---------------------------------------------------------------------------
// Akamai
// ---------------------------------------------------------------------------

fn akamai_trace(headers: &HeaderMap) -> CacheTrace {
    let mut primary = None;
    let mut secondary = None;

    // Debug-pragma headers first: `x-cache: TCP_MISS from a23-...akamaitechnologies.com`
    if let Some(x_cache) = headers.get("x-cache") {
        if x_cache.to_lowercase().contains("akamai") {
            primary = first_token_lower(x_cache);
            if let Some(remote) = headers.get("x-cache-remote") {
                if remote.to_lowercase().contains("akamai") {
                    secondary = first_token_lower(remote);
                }
            }
        }
    }

    // Fallback: `akamai-cache-status: Miss from child, Hit from parent`
    if primary.as_deref().map_or(true, str::is_empty) {
        if let Some(status) = headers.get("akamai-cache-status") {
            let mut parts = status.split(", ");
            primary = parts.next().map(str::to_lowercase);
            secondary = parts.next().map(str::to_lowercase);
        }
    }

    two_tier(primary.as_deref(), secondary.as_deref())
}

/// `akamai-request-bc: [a=1.2.3.4,b=5,n=US_CA_SANJOSE,o=123],[a=..,n=US_CA_LOSANGELES]`
fn akamai_edges(headers: &HeaderMap) -> (String, String) {
    let Some(breadcrumbs) = headers.get("akamai-request-bc") else {
        return (NAN.to_string(), NAN.to_string());
    };

    let edges = breadcrumbs
        .trim_matches(|c| c == '[' || c == ']')
        .split("],[")
        .flat_map(|block| block.split(','))
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (key.trim() == "n").then(|| value.to_string())
        });

    first_two(edges)
}

// ---------------------------------------------------------------------------
// CloudFront
// ---------------------------------------------------------------------------

fn cloudfront_trace(headers: &HeaderMap) -> CacheTrace {
    let Some(x_cache) = headers.get("x-cache") else {
        return CacheTrace::Unknown;
    };
    let x_cache = x_cache.to_lowercase();
    if !x_cache.contains("from cloudfront") {
        return CacheTrace::Unknown;
    }
    // RefreshHit means CloudFront had to revalidate with the origin.
    if x_cache.contains("miss") || x_cache.contains("refresh") {
        CacheTrace::Miss
    } else if x_cache.contains("hit") {
        CacheTrace::Hit
    } else {
        CacheTrace::Unknown
    }
}

fn cloudfront_edges(headers: &HeaderMap) -> (String, String) {
    let pop = headers.get("x-amz-cf-pop").unwrap_or(NAN);
    (pop.to_string(), NAN.to_string())
}

// ---------------------------------------------------------------------------
// Edgio
// ---------------------------------------------------------------------------

fn edgio_trace(headers: &HeaderMap) -> CacheTrace {
    let Some(x_cache) = headers.get("x-ec-cache").filter(|v| !v.is_empty()) else {
        return CacheTrace::Unknown;
    };
    let x_cache = x_cache.to_lowercase();
    if x_cache.contains("expire") {
        return CacheTrace::Miss;
    }
    let remote = headers.get("x-ec-cache-remote").map(str::to_lowercase);
    two_tier(Some(x_cache.as_str()), remote.as_deref())
}

/// Node id from the trailing `(pop/node)` group: `TCP_HIT from ECS (lha/8D21)` → `lha`.
fn edgio_node(value: &str) -> Option<String> {
    let last = value.split_whitespace().last()?;
    let cleaned: String = last
        .to_lowercase()
        .chars()
        .filter(|c| *c != '(' && *c != ')')
        .collect();
    cleaned.split('/').next().map(str::to_string)
}

fn edgio_edges(headers: &HeaderMap) -> (String, String) {
    let Some(l1) = headers.get("x-ec-cache").and_then(edgio_node) else {
        return (NAN.to_string(), NAN.to_string());
    };
    let l2 = headers
        .get("x-ec-cache-remote")
        .and_then(edgio_node)
        .unwrap_or_else(|| NAN.to_string());
    (l1, l2)
}

/// `server: ECAcc (lhc/7891)` → `ECAcc lhc`.
fn edgio_origin(headers: &HeaderMap) -> String {
    match headers.get("server") {
        Some(server) => {
            let cleaned: String = server.chars().filter(|c| *c != '(' && *c != ')').collect();
            cleaned.split('/').next().unwrap_or_default().to_string()
        }
        None => NAN.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Fastly
// ---------------------------------------------------------------------------

fn fastly_trace(headers: &HeaderMap) -> CacheTrace {
    let Some(x_cache) = headers.get("x-cache") else {
        return CacheTrace::Unknown;
    };
    // One entry per hop, origin-side first: "HIT, MISS" = shield hit, edge miss.
    let x_cache = x_cache.to_lowercase();
    if x_cache == "hit, miss" {
        CacheTrace::L2
    } else if x_cache.contains("hit") {
        CacheTrace::L1
    } else {
        CacheTrace::Miss
    }
}

/// `x-served-by: cache-iad-kiad7000025-IAD, cache-lhr7341-LHR` is ordered
/// origin-side first, so the last hop is the L1 edge.
fn fastly_edges(headers: &HeaderMap) -> (String, String) {
    let Some(path) = headers.get("x-served-by") else {
        return (NAN.to_string(), NAN.to_string());
    };

    let edges = path
        .rsplit(", ")
        .map(|hop| hop.rsplit('-').next().unwrap_or(hop).to_string());

    first_two(edges)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        HeaderMap::from_pairs(pairs.iter().map(|(k, v)| (*k, *v)))
    }

    #[test]
    fn test_akamai_xcache_hit_with_breadcrumbs() {
        let h = headers(&[
            ("x-cache", "TCP_HIT akamai"),
            ("akamai-request-bc", "[n=edge1,x=1],[n=edge2,x=2]"),
        ]);
        let f = classify(Cdn::Akamai, &h);
        assert_eq!(f.cache_trace, CacheTrace::L1);
        assert_eq!(f.edge_l1, "edge1");
        assert_eq!(f.edge_l2, "edge2");
        assert_eq!(f.origin, NAN);
    }

    #[test]
    fn test_akamai_remote_hit_is_l2() {
        let h = headers(&[
            ("X-Cache", "TCP_MISS from a23-1-2-3.deploy.akamaitechnologies.com"),
            ("X-Cache-Remote", "TCP_HIT from a2-3-4-5.deploy.akamaitechnologies.com"),
            ("Server", "AkamaiNetStorage"),
        ]);
        let f = classify(Cdn::Akamai, &h);
        assert_eq!(f.cache_trace, CacheTrace::L2);
        assert_eq!(f.origin, "AkamaiNetStorage");
    }

    #[test]
    fn test_akamai_cache_status_fallback() {
        let miss = headers(&[("akamai-cache-status", "Miss from child, Miss from parent")]);
        assert_eq!(classify(Cdn::Akamai, &miss).cache_trace, CacheTrace::Miss);

        let l2 = headers(&[("akamai-cache-status", "Miss from child, Hit from parent")]);
        assert_eq!(classify(Cdn::Akamai, &l2).cache_trace, CacheTrace::L2);

        // x-cache without an akamai marker is ignored in favour of the status header
        let l1 = headers(&[
            ("x-cache", "MISS"),
            ("akamai-cache-status", "Hit from child"),
        ]);
        assert_eq!(classify(Cdn::Akamai, &l1).cache_trace, CacheTrace::L1);
    }

    #[test]
    fn test_akamai_single_breadcrumb() {
        let h = headers(&[
            ("akamai-cache-status", "Hit from child"),
            ("akamai-request-bc", "[a=1.2.3.4,b=99,n=US_CA_SANJOSE,o=20940]"),
        ]);
        let f = classify(Cdn::Akamai, &h);
        assert_eq!(f.edge_l1, "US_CA_SANJOSE");
        assert_eq!(f.edge_l2, NAN);
    }

    #[test]
    fn test_cloudfront() {
        let miss = headers(&[("x-cache", "Miss from cloudfront"), ("x-amz-cf-pop", "LHR61-P1")]);
        let f = classify(Cdn::CloudFront, &miss);
        assert_eq!(f.cache_trace, CacheTrace::Miss);
        assert_eq!(f.edge_l1, "LHR61-P1");
        assert_eq!(f.edge_l2, NAN);

        let hit = headers(&[("x-cache", "Hit from cloudfront")]);
        assert_eq!(classify(Cdn::CloudFront, &hit).cache_trace, CacheTrace::Hit);

        let refresh = headers(&[("x-cache", "RefreshHit from cloudfront")]);
        assert_eq!(classify(Cdn::CloudFront, &refresh).cache_trace, CacheTrace::Miss);

        let error = headers(&[("x-cache", "Error from cloudfront")]);
        assert_eq!(classify(Cdn::CloudFront, &error).cache_trace, CacheTrace::Unknown);

        let foreign = headers(&[("x-cache", "HIT")]);
        assert_eq!(classify(Cdn::CloudFront, &foreign).cache_trace, CacheTrace::Unknown);
    }

    #[test]
    fn test_edgio() {
        let h = headers(&[
            ("x-ec-cache", "MISS from ECS (lha/8D21)"),
            ("x-ec-cache-remote", "TCP_HIT from ECS (lhd/D2C5)"),
            ("server", "ECAcc (lhc/7891)"),
        ]);
        let f = classify(Cdn::Edgio, &h);
        assert_eq!(f.cache_trace, CacheTrace::L2);
        assert_eq!(f.edge_l1, "lha");
        assert_eq!(f.edge_l2, "lhd");
        assert_eq!(f.origin, "ECAcc lhc");

        let expired = headers(&[("x-ec-cache", "TCP_EXPIRED_HIT from ECS (lha/8D21)")]);
        let f = classify(Cdn::Edgio, &expired);
        assert_eq!(f.cache_trace, CacheTrace::Miss, "expire wins over hit");
        assert_eq!(f.edge_l2, NAN);

        let hit = headers(&[("x-ec-cache", "TCP_HIT from ECS (lha/8D21)")]);
        assert_eq!(classify(Cdn::Edgio, &hit).cache_trace, CacheTrace::L1);

        let miss = headers(&[("x-ec-cache", "TCP_MISS from ECS (lha/8D21)")]);
        assert_eq!(classify(Cdn::Edgio, &miss).cache_trace, CacheTrace::Miss);
    }

    #[test]
    fn test_edgio_empty_header_is_unknown() {
        let h = headers(&[("x-ec-cache", "")]);
        let f = classify(Cdn::Edgio, &h);
        assert_eq!(f.cache_trace, CacheTrace::Unknown);
        assert_eq!(f.edge_l1, NAN);
        assert_eq!(f.origin, NAN);
    }

    #[test]
    fn test_fastly_hop_chain() {
        let h = headers(&[("x-cache", "HIT, MISS"), ("x-served-by", "cache-a-1, cache-b-2")]);
        let f = classify(Cdn::Fastly, &h);
        assert_eq!(f.cache_trace, CacheTrace::L2);
        assert_eq!(f.edge_l1, "2");
        assert_eq!(f.edge_l2, "1");

        let real = headers(&[
            ("x-cache", "MISS, HIT"),
            ("x-served-by", "cache-iad-kiad7000025-IAD, cache-lhr7341-LHR"),
        ]);
        let f = classify(Cdn::Fastly, &real);
        assert_eq!(f.cache_trace, CacheTrace::L1);
        assert_eq!(f.edge_l1, "LHR");
        assert_eq!(f.edge_l2, "IAD");

        let miss = headers(&[("x-cache", "MISS, MISS"), ("x-served-by", "cache-lhr7341-LHR")]);
        let f = classify(Cdn::Fastly, &miss);
        assert_eq!(f.cache_trace, CacheTrace::Miss);
        assert_eq!(f.edge_l1, "LHR");
        assert_eq!(f.edge_l2, NAN);
    }

    #[test]
    fn test_fastly_last_pop_is_l1() {
        let h = headers(&[
            ("x-cache", "MISS, MISS, HIT"),
            ("x-served-by", "cache-iad-1-IAD, cache-fra-2-FRA, cache-cdg-3-CDG"),
        ]);
        let f = classify(Cdn::Fastly, &h);
        assert_eq!(f.edge_l1, "CDG");
        assert_eq!(f.edge_l2, "FRA");
    }

    #[test]
    fn test_no_diagnostic_headers() {
        let h = headers(&[("content-type", "video/mp4")]);
        for cdn in Cdn::ALL {
            let f = classify(cdn, &h);
            assert_eq!(f.cache_trace, CacheTrace::Unknown, "{cdn}");
            assert_eq!(f.edge_l1, NAN);
            assert_eq!(f.edge_l2, NAN);
            assert_eq!(f.origin, NAN);
        }
    }

    #[test]
    fn test_traces_stay_in_vendor_vocabulary() {
        let values = [
            "", " ", "hit", "HIT, MISS", "miss", "MISS from ECS (x/y)", "expired",
            "Hit from cloudfront", "Miss from cloudfront", "weird akamai", "(", "a/b",
            "TCP_REFRESH_MISS akamai", "hit, hit, miss",
        ];
        let names = [
            "x-cache", "x-cache-remote", "akamai-cache-status", "x-ec-cache",
            "x-ec-cache-remote", "x-served-by", "akamai-request-bc", "server",
        ];
        for cdn in Cdn::ALL {
            for name in names {
                for value in values {
                    for other in values {
                        let h = headers(&[(name, value), ("x-cache-remote", other)]);
                        let trace = classify(cdn, &h).cache_trace;
                        assert!(
                            cdn.accepts(trace) || trace == CacheTrace::Unknown,
                            "{cdn}: {name}={value:?} produced {trace}"
                        );
                    }
                }
            }
        }
    }
}
