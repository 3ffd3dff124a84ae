//! Privacy filter for URL admission and sanitization.
//!
//! Decides whether a visited URL may be tracked at all, strips tracking
//! query parameters and fragments, and derives the domain used for
//! aggregation. Nothing downstream ever sees an unsanitized URL.

use url::Url;

use crate::config::PrivacyConfig;

/// Decision made by the privacy filter about a visited URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrivacyDecision {
    /// The URL may be tracked in its sanitized form.
    Track { url: String, domain: String },
    /// The URL must not be tracked.
    Skip { reason: String },
}

/// Filter applying the configured blocklist and tracking-parameter rules.
#[derive(Debug, Clone)]
pub struct PrivacyFilter {
    config: PrivacyConfig,
}

impl PrivacyFilter {
    pub fn new(config: PrivacyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PrivacyConfig {
        &self.config
    }

    /// Check a URL and return the admission decision.
    pub fn check(&self, raw: &str) -> PrivacyDecision {
        let parsed = match Url::parse(raw.trim()) {
            Ok(u) => u,
            Err(e) => {
                return PrivacyDecision::Skip {
                    reason: format!("unparseable url: {}", e),
                }
            }
        };

        if !self
            .config
            .allowed_schemes
            .iter()
            .any(|s| s.eq_ignore_ascii_case(parsed.scheme()))
        {
            return PrivacyDecision::Skip {
                reason: format!("scheme '{}' not tracked", parsed.scheme()),
            };
        }

        let domain = domain_of(&parsed);
        if domain.is_empty() {
            return PrivacyDecision::Skip {
                reason: "url has no host".to_string(),
            };
        }

        if let Some(blocked) = self
            .config
            .blocked_domains
            .iter()
            .find(|b| domain_matches(&domain, b))
        {
            return PrivacyDecision::Skip {
                reason: format!("domain blocked by rule '{}'", blocked),
            };
        }

        PrivacyDecision::Track {
            url: self.strip(parsed),
            domain,
        }
    }

    pub fn should_track(&self, url: &str) -> bool {
        matches!(self.check(url), PrivacyDecision::Track { .. })
    }

    /// Sanitize a URL. Unparseable input sanitizes to the empty string.
    pub fn sanitize_url(&self, url: &str) -> String {
        match Url::parse(url.trim()) {
            Ok(parsed) => self.strip(parsed),
            Err(_) => String::new(),
        }
    }

    /// Domain of a URL, without a leading `www.`. Empty when unparseable.
    pub fn domain(&self, url: &str) -> String {
        Url::parse(url.trim())
            .map(|u| domain_of(&u))
            .unwrap_or_default()
    }

    fn strip(&self, mut url: Url) -> String {
        url.set_fragment(None);
        let _ = url.set_username("");
        let _ = url.set_password(None);

        if url.query().is_some() {
            let kept: Vec<(String, String)> = url
                .query_pairs()
                .filter(|(k, _)| !self.is_tracking_param(k))
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect();
            if kept.is_empty() {
                url.set_query(None);
            } else {
                url.query_pairs_mut().clear().extend_pairs(kept);
            }
        }
        url.to_string()
    }

    fn is_tracking_param(&self, key: &str) -> bool {
        let key = key.to_ascii_lowercase();
        self.config.tracking_params.iter().any(|p| match p.strip_suffix('*') {
            Some(prefix) => key.starts_with(&prefix.to_ascii_lowercase()),
            None => key == p.to_ascii_lowercase(),
        })
    }
}

fn domain_of(url: &Url) -> String {
    url.host_str()
        .map(|h| h.trim_start_matches("www.").to_ascii_lowercase())
        .unwrap_or_default()
}

fn domain_matches(domain: &str, rule: &str) -> bool {
    let rule = rule.trim().trim_start_matches("www.").to_ascii_lowercase();
    !rule.is_empty()
        && (domain == rule
            || domain
                .strip_suffix(rule.as_str())
                .is_some_and(|prefix| prefix.ends_with('.')))
}
