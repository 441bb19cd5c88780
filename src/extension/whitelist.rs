//! Stealth-mode URL whitelist matching.
//!
//! Matching is deliberately fail-open: the whitelist gates an optional
//! hardening feature, and a parsing surprise must never break the host
//! page.

use url::Url;

/// Schemes that are always allowed regardless of the whitelist.
const ALWAYS_ALLOWED_SCHEMES: [&str; 4] = ["about", "chrome", "chrome-extension", "data"];

/// Whether a URL is allowed by the whitelist.
///
/// Exact host matches and subdomains match (`api.github.com` is inside
/// `github.com`); partial string overlaps do not (`evil-google.com` is
/// not inside `google.com`). Special browser schemes and malformed
/// URLs are always allowed.
#[must_use]
pub fn url_allowed(url: &str, whitelist: &[String]) -> bool {
    let Ok(parsed) = Url::parse(url) else {
        // Fail open: a URL we cannot parse is not ours to block.
        return true;
    };
    if ALWAYS_ALLOWED_SCHEMES.contains(&parsed.scheme()) {
        return true;
    }
    let Some(host) = parsed.host_str() else {
        return true;
    };
    whitelist.iter().any(|entry| host_matches(host, entry))
}

/// Exact or subdomain match against one whitelist entry.
fn host_matches(host: &str, entry: &str) -> bool {
    let entry = entry.trim().trim_start_matches("www.");
    if entry.is_empty() {
        return false;
    }
    host == entry || host.ends_with(&format!(".{entry}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(entries: &[&str]) -> Vec<String> {
        entries.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn exact_host_matches() {
        assert!(url_allowed("https://github.com/explore", &list(&["github.com"])));
    }

    #[test]
    fn subdomain_matches() {
        assert!(url_allowed("https://api.github.com/repos", &list(&["github.com"])));
        assert!(url_allowed(
            "https://deep.api.github.com/x",
            &list(&["github.com"])
        ));
    }

    #[test]
    fn partial_string_does_not_match() {
        assert!(!url_allowed("https://evil-google.com/", &list(&["google.com"])));
        assert!(!url_allowed("https://googlecom.net/", &list(&["google.com"])));
    }

    #[test]
    fn unlisted_host_rejected() {
        assert!(!url_allowed("https://example.com/", &list(&["github.com"])));
    }

    #[test]
    fn special_schemes_always_allowed() {
        assert!(url_allowed("about:blank", &[]));
        assert!(url_allowed("chrome://settings", &[]));
        assert!(url_allowed("chrome-extension://abcdef/popup.html", &[]));
        assert!(url_allowed("data:text/html,hi", &[]));
    }

    #[test]
    fn malformed_urls_fail_open() {
        assert!(url_allowed("not a url at all", &list(&["github.com"])));
        assert!(url_allowed("", &[]));
    }

    #[test]
    fn www_prefix_in_entry_is_ignored() {
        assert!(url_allowed("https://github.com/", &list(&["www.github.com"])));
    }
}
