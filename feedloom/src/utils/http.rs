//! HTTP constants and URL helpers used by fetchers and the rate limiter.

/// Browser user agent sent with every fetch.
// https://www.whatismybrowser.com/guides/the-latest-user-agent/firefox
pub const DEFAULT_UA: &str =
    "Mozilla/5.0 (X11; Linux x86_64; rv:132.0) Gecko/20100101 Firefox/132.0";

/// Extracts the host component of `url`, if it parses.
pub fn domain_from_url(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    parsed.host_str().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_host() {
        assert_eq!(
            domain_from_url("https://blog.rust-lang.org/feed.xml"),
            Some("blog.rust-lang.org".to_string())
        );
    }

    #[test]
    fn invalid_url_yields_none() {
        assert_eq!(domain_from_url("not a url"), None);
    }
}
