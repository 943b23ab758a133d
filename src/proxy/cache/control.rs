use std::time::Duration;

use super::super::http::codec::ResponseHead;

#[derive(Debug, Clone, Default)]
pub struct CacheControl {
    pub public: bool,
    pub private: bool,
    pub no_cache: bool,
    pub no_store: bool,
    pub max_age: Option<Duration>,
    pub s_maxage: Option<Duration>,
    pub must_revalidate: bool,
}

pub fn parse_cache_control(head: &ResponseHead) -> CacheControl {
    let mut cc = CacheControl::default();

    for value in head.get_all("cache-control") {
        for part in value.split(',') {
            let part = part.trim();
            if part.eq_ignore_ascii_case("public") {
                cc.public = true;
            } else if part.eq_ignore_ascii_case("private") {
                cc.private = true;
            } else if part.eq_ignore_ascii_case("no-cache") {
                cc.no_cache = true;
            } else if part.eq_ignore_ascii_case("no-store") {
                cc.no_store = true;
            } else if part.eq_ignore_ascii_case("must-revalidate") {
                cc.must_revalidate = true;
            } else if let Some(stripped) = part.strip_prefix("max-age=") {
                if let Ok(secs) = stripped.parse::<u64>() {
                    cc.max_age = Some(Duration::from_secs(secs));
                }
            } else if let Some(stripped) = part.strip_prefix("s-maxage=")
                && let Ok(secs) = stripped.parse::<u64>()
            {
                cc.s_maxage = Some(Duration::from_secs(secs));
            }
        }
    }
    cc
}

/// Shared-cache storability analysis for a 200 response. Returns the
/// directives that forbid caching; an empty list means the response may be
/// stored.
pub fn uncacheable_reasons(head: &ResponseHead) -> Vec<&'static str> {
    let cc = parse_cache_control(head);
    let mut reasons = Vec::new();
    if cc.no_store {
        reasons.push("no-store");
    }
    if cc.no_cache {
        reasons.push("no-cache");
    }
    if cc.private {
        reasons.push("private");
    }
    if cc.max_age == Some(Duration::ZERO) {
        reasons.push("max-age=0");
    }
    if cc.s_maxage == Some(Duration::ZERO) {
        reasons.push("s-maxage=0");
    }
    reasons
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;

    use super::super::super::http::codec::HeaderLine;

    fn head_with_cache_control(value: &str) -> ResponseHead {
        ResponseHead::new(
            StatusCode::OK,
            vec![HeaderLine::new("Cache-Control", value)],
            Some(0),
        )
    }

    #[test]
    fn parses_directives() {
        let cc = parse_cache_control(&head_with_cache_control("public, max-age=3600"));
        assert!(cc.public);
        assert!(!cc.private);
        assert_eq!(cc.max_age, Some(Duration::from_secs(3600)));
    }

    #[test]
    fn parses_s_maxage_and_must_revalidate() {
        let cc = parse_cache_control(&head_with_cache_control("s-maxage=60, must-revalidate"));
        assert_eq!(cc.s_maxage, Some(Duration::from_secs(60)));
        assert!(cc.must_revalidate);
    }

    #[test]
    fn plain_success_is_storable() {
        let head = ResponseHead::new(StatusCode::OK, Vec::new(), Some(0));
        assert!(uncacheable_reasons(&head).is_empty());
        assert!(
            uncacheable_reasons(&head_with_cache_control("public, max-age=60")).is_empty()
        );
    }

    #[test]
    fn rejecting_directives_are_reported() {
        assert_eq!(
            uncacheable_reasons(&head_with_cache_control("no-store")),
            vec!["no-store"]
        );
        assert_eq!(
            uncacheable_reasons(&head_with_cache_control("private, max-age=60")),
            vec!["private"]
        );
        assert_eq!(
            uncacheable_reasons(&head_with_cache_control("no-cache")),
            vec!["no-cache"]
        );
        assert_eq!(
            uncacheable_reasons(&head_with_cache_control("max-age=0")),
            vec!["max-age=0"]
        );
    }

    #[test]
    fn multiple_reasons_accumulate() {
        let reasons = uncacheable_reasons(&head_with_cache_control("no-store, private"));
        assert_eq!(reasons, vec!["no-store", "private"]);
    }
}
