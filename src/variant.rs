use crate::probe::Resolution;

/// One playable-variant observation for an episode page: where it came
/// from (sub-item ordinal), what it claims to be, and its manifest URL.
/// An empty `manifest_url` marks a sub-item whose player never surfaced
/// a manifest; it ranks last and fails fast at download time.
#[derive(Debug, Clone)]
pub struct CandidateStream {
    pub title: String,
    pub ordinal: usize,
    pub resolution: Resolution,
    pub manifest_url: String,
}

impl CandidateStream {
    pub fn area(&self) -> u64 {
        self.resolution.area()
    }
}

/// Orders candidates for download attempts.
///
/// Baseline is descending resolution area with discovery order preserved
/// between equal areas. Candidates whose URL contains a priority host are
/// then pulled to the front, grouped by the configured host order; the
/// host list encodes "known good sources beat raw resolution", since
/// resolution metadata is sometimes missing or wrong for the best source.
/// The result is a permutation of the input.
pub fn rank(mut candidates: Vec<CandidateStream>, priority_hosts: &[String]) -> Vec<CandidateStream> {
    candidates.sort_by(|a, b| b.area().cmp(&a.area()));

    let mut ranked = Vec::with_capacity(candidates.len());
    for host in priority_hosts {
        let mut rest = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            if candidate.manifest_url.contains(host.as_str()) {
                ranked.push(candidate);
            } else {
                rest.push(candidate);
            }
        }
        candidates = rest;
    }
    ranked.extend(candidates);
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(ordinal: usize, url: &str, label: &str) -> CandidateStream {
        CandidateStream {
            title: format!("ep#{ordinal}"),
            ordinal,
            resolution: Resolution::parse(label).unwrap_or(Resolution::UNKNOWN),
            manifest_url: url.to_string(),
        }
    }

    fn urls(ranked: &[CandidateStream]) -> Vec<&str> {
        ranked.iter().map(|c| c.manifest_url.as_str()).collect()
    }

    #[test]
    fn priority_host_beats_resolution() {
        let input = vec![
            candidate(0, "https://bad.cdn.com/a.m3u8", "1920x1080"),
            candidate(1, "https://good.cdn.com/b.m3u8", "640x360"),
        ];
        let ranked = rank(input, &["good.cdn.com".to_string()]);
        assert_eq!(
            urls(&ranked),
            vec!["https://good.cdn.com/b.m3u8", "https://bad.cdn.com/a.m3u8"]
        );
    }

    #[test]
    fn host_order_outranks_area_within_priority_section() {
        let input = vec![
            candidate(0, "https://second.cdn/a.m3u8", "1920x1080"),
            candidate(1, "https://first.cdn/b.m3u8", "640x360"),
            candidate(2, "https://other.cdn/c.m3u8", "1280x720"),
        ];
        let hosts = vec!["first.cdn".to_string(), "second.cdn".to_string()];
        let ranked = rank(input, &hosts);
        assert_eq!(
            urls(&ranked),
            vec![
                "https://first.cdn/b.m3u8",
                "https://second.cdn/a.m3u8",
                "https://other.cdn/c.m3u8"
            ]
        );
    }

    #[test]
    fn all_matches_of_one_host_precede_later_hosts() {
        let input = vec![
            candidate(0, "https://b.cdn/x.m3u8", "1280x720"),
            candidate(1, "https://a.cdn/low.m3u8", "640x360"),
            candidate(2, "https://a.cdn/high.m3u8", "1920x1080"),
        ];
        let hosts = vec!["a.cdn".to_string(), "b.cdn".to_string()];
        let ranked = rank(input, &hosts);
        assert_eq!(
            urls(&ranked),
            vec![
                "https://a.cdn/high.m3u8",
                "https://a.cdn/low.m3u8",
                "https://b.cdn/x.m3u8"
            ]
        );
    }

    #[test]
    fn non_matching_candidates_sort_by_descending_area() {
        let input = vec![
            candidate(0, "https://x.cdn/a.m3u8", "640x360"),
            candidate(1, "https://y.cdn/b.m3u8", "1920x1080"),
            candidate(2, "https://z.cdn/c.m3u8", "1280x720"),
        ];
        let ranked = rank(input, &[]);
        assert_eq!(
            urls(&ranked),
            vec![
                "https://y.cdn/b.m3u8",
                "https://z.cdn/c.m3u8",
                "https://x.cdn/a.m3u8"
            ]
        );
    }

    #[test]
    fn equal_area_keeps_discovery_order() {
        let input = vec![
            candidate(0, "https://x.cdn/a.m3u8", "1280x720"),
            candidate(1, "https://y.cdn/b.m3u8", "720x1280"),
        ];
        let ranked = rank(input, &[]);
        assert_eq!(
            urls(&ranked),
            vec!["https://x.cdn/a.m3u8", "https://y.cdn/b.m3u8"]
        );
    }

    #[test]
    fn output_is_a_permutation_of_the_input() {
        let input = vec![
            candidate(0, "https://a.cdn/1.m3u8", "640x360"),
            candidate(1, "", "0x0"),
            candidate(2, "https://a.cdn/2.m3u8", "1280x720"),
        ];
        let ranked = rank(input, &["a.cdn".to_string()]);
        assert_eq!(ranked.len(), 3);
        let mut ordinals: Vec<usize> = ranked.iter().map(|c| c.ordinal).collect();
        ordinals.sort_unstable();
        assert_eq!(ordinals, vec![0, 1, 2]);
    }
}
