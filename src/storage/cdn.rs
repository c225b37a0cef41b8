//! CDN origin rewriting for download URLs.

use crate::{Error, Result};
use url::Url;

/// Rewrites URLs so they are served through a CDN origin.
///
/// Only the scheme, userinfo, host and port are replaced. Path and query are kept
/// byte-for-byte, so signature parameters survive the rewrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CdnRewriter {
    origin: Url,
}

impl CdnRewriter {
    /// Parses a CDN origin such as `https://cdn.example.com`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the origin is not an absolute
    /// http(s) URL with a host.
    pub fn new(origin: &str) -> Result<Self> {
        let origin = Url::parse(origin)
            .map_err(|e| Error::InvalidInput(format!("invalid CDN origin '{origin}': {e}")))?;
        if !matches!(origin.scheme(), "http" | "https") || origin.host_str().is_none() {
            return Err(Error::InvalidInput(format!(
                "CDN origin must be an http(s) URL with a host: {origin}"
            )));
        }
        Ok(Self { origin })
    }

    /// Returns the configured origin.
    #[must_use]
    pub fn origin(&self) -> &Url {
        &self.origin
    }

    /// Rewrites an absolute URL onto the CDN origin.
    ///
    /// Relative or unparsable URLs (such as local-tier paths) are returned
    /// unchanged.
    #[must_use]
    pub fn rewrite(&self, url: &str) -> String {
        let Ok(parsed) = Url::parse(url) else {
            return url.to_string();
        };
        if parsed.cannot_be_a_base() {
            return url.to_string();
        }
        // The tail is copied from the input; re-serializing it through `Url`
        // would normalize dot segments and percent-encoding.
        let Some(tail) = tail_after_authority(url) else {
            return url.to_string();
        };
        let mut rewritten = self.origin[..url::Position::BeforePath].to_string();
        rewritten.push_str(tail);
        rewritten
    }
}

/// Returns everything after the authority of an absolute URL.
fn tail_after_authority(url: &str) -> Option<&str> {
    let authority_start = url.find("://")? + 3;
    let rest = &url[authority_start..];
    let tail_start = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    Some(&rest[tail_start..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rewrite_preserves_path_and_signature() {
        let cdn = CdnRewriter::new("https://cdn.example.com").unwrap();
        let signed = "http://project.example.co/storage/v1/object/sign/files/u/a.pdf?token=ab%2Bc%3D&x=1";
        assert_eq!(
            cdn.rewrite(signed),
            "https://cdn.example.com/storage/v1/object/sign/files/u/a.pdf?token=ab%2Bc%3D&x=1"
        );
    }

    #[test]
    fn test_rewrite_keeps_cdn_port() {
        let cdn = CdnRewriter::new("http://localhost:8443/ignored/path").unwrap();
        assert_eq!(
            cdn.rewrite("https://origin.example/a/b?c=d#frag"),
            "http://localhost:8443/a/b?c=d#frag"
        );
    }

    #[test]
    fn test_host_substring_in_query_is_untouched() {
        let cdn = CdnRewriter::new("https://cdn.example.com").unwrap();
        let url = "https://origin.example/x?redirect=https://origin.example/y";
        assert_eq!(
            cdn.rewrite(url),
            "https://cdn.example.com/x?redirect=https://origin.example/y"
        );
    }

    #[test]
    fn test_tail_is_copied_verbatim() {
        let cdn = CdnRewriter::new("https://cdn.example.com").unwrap();
        let url = "https://origin.example/files/./u/../u/a%7e.pdf?token=a b&sig=%2f";
        assert_eq!(
            cdn.rewrite(url),
            "https://cdn.example.com/files/./u/../u/a%7e.pdf?token=a b&sig=%2f"
        );
    }

    #[test]
    fn test_userinfo_and_port_are_replaced() {
        let cdn = CdnRewriter::new("https://cdn.example.com").unwrap();
        assert_eq!(
            cdn.rewrite("https://user:pw@origin.example:9000/a?b=c"),
            "https://cdn.example.com/a?b=c"
        );
    }

    #[test]
    fn test_relative_urls_pass_through() {
        let cdn = CdnRewriter::new("https://cdn.example.com").unwrap();
        assert_eq!(cdn.rewrite("/api/storage/files/u/a.pdf"), "/api/storage/files/u/a.pdf");
    }

    #[test]
    fn test_invalid_origin() {
        assert!(CdnRewriter::new("cdn.example.com").is_err());
        assert!(CdnRewriter::new("ftp://cdn.example.com").is_err());
    }
}
