//! Static domain → category lookup.

use serde::{Deserialize, Serialize};

/// Coarse category a visited domain belongs to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Development,
    Ai,
    Social,
    News,
    Video,
    Shopping,
    Email,
    Productivity,
    Reference,
    Finance,
    Entertainment,
    #[default]
    Other,
}

/// Domain patterns, checked in order. A pattern matches the domain itself,
/// any subdomain of it, or (for entries ending in `.`) any domain starting
/// with it.
const TABLE: &[(&str, Category)] = &[
    ("github.com", Category::Development),
    ("gitlab.com", Category::Development),
    ("bitbucket.org", Category::Development),
    ("stackoverflow.com", Category::Development),
    ("stackexchange.com", Category::Development),
    ("docs.rs", Category::Development),
    ("crates.io", Category::Development),
    ("rust-lang.org", Category::Development),
    ("npmjs.com", Category::Development),
    ("pypi.org", Category::Development),
    ("developer.mozilla.org", Category::Development),
    ("vercel.app", Category::Development),
    ("chatgpt.com", Category::Ai),
    ("openai.com", Category::Ai),
    ("claude.ai", Category::Ai),
    ("anthropic.com", Category::Ai),
    ("gemini.google.com", Category::Ai),
    ("perplexity.ai", Category::Ai),
    ("huggingface.co", Category::Ai),
    ("mail.google.com", Category::Email),
    ("outlook.live.com", Category::Email),
    ("outlook.office.com", Category::Email),
    ("mail.yahoo.com", Category::Email),
    ("proton.me", Category::Email),
    ("twitter.com", Category::Social),
    ("x.com", Category::Social),
    ("facebook.com", Category::Social),
    ("instagram.com", Category::Social),
    ("linkedin.com", Category::Social),
    ("reddit.com", Category::Social),
    ("mastodon.", Category::Social),
    ("bsky.app", Category::Social),
    ("threads.net", Category::Social),
    ("news.ycombinator.com", Category::News),
    ("nytimes.com", Category::News),
    ("bbc.co.uk", Category::News),
    ("bbc.com", Category::News),
    ("theguardian.com", Category::News),
    ("reuters.com", Category::News),
    ("bloomberg.com", Category::News),
    ("theverge.com", Category::News),
    ("arstechnica.com", Category::News),
    ("news.", Category::News),
    ("youtube.com", Category::Video),
    ("youtu.be", Category::Video),
    ("vimeo.com", Category::Video),
    ("twitch.tv", Category::Video),
    ("netflix.com", Category::Entertainment),
    ("spotify.com", Category::Entertainment),
    ("imdb.com", Category::Entertainment),
    ("amazon.", Category::Shopping),
    ("ebay.", Category::Shopping),
    ("etsy.com", Category::Shopping),
    ("aliexpress.com", Category::Shopping),
    ("docs.google.com", Category::Productivity),
    ("drive.google.com", Category::Productivity),
    ("calendar.google.com", Category::Productivity),
    ("notion.so", Category::Productivity),
    ("figma.com", Category::Productivity),
    ("slack.com", Category::Productivity),
    ("trello.com", Category::Productivity),
    ("atlassian.net", Category::Productivity),
    ("linear.app", Category::Productivity),
    ("wikipedia.org", Category::Reference),
    ("wiktionary.org", Category::Reference),
    ("arxiv.org", Category::Reference),
    ("medium.com", Category::Reference),
    ("substack.com", Category::Reference),
    ("paypal.com", Category::Finance),
    ("coinbase.com", Category::Finance),
    ("revolut.com", Category::Finance),
];

/// Map a domain to its category. Unknown domains are `Other`.
pub fn categorize(domain: &str) -> Category {
    let domain = domain.trim().trim_start_matches("www.").to_ascii_lowercase();
    if domain.is_empty() {
        return Category::Other;
    }
    TABLE
        .iter()
        .find(|(pattern, _)| matches_pattern(&domain, pattern))
        .map(|(_, category)| *category)
        .unwrap_or(Category::Other)
}

fn matches_pattern(domain: &str, pattern: &str) -> bool {
    if pattern.ends_with('.') {
        return domain.starts_with(pattern) || domain.contains(&format!(".{}", pattern));
    }
    domain == pattern
        || domain
            .strip_suffix(pattern)
            .is_some_and(|prefix| prefix.ends_with('.'))
}

impl Category {
    /// Display label used in rendered reports.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Development => "Development",
            Self::Ai => "AI Tools",
            Self::Social => "Social",
            Self::News => "News",
            Self::Video => "Video",
            Self::Shopping => "Shopping",
            Self::Email => "Email",
            Self::Productivity => "Productivity",
            Self::Reference => "Reading & Reference",
            Self::Finance => "Finance",
            Self::Entertainment => "Entertainment",
            Self::Other => "Other",
        }
    }

    /// Catch-all buckets that the digest does not break out.
    pub fn is_generic(&self) -> bool {
        matches!(self, Self::Other | Self::Email)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_and_subdomain_match() {
        assert_eq!(categorize("github.com"), Category::Development);
        assert_eq!(categorize("gist.github.com"), Category::Development);
        assert_eq!(categorize("www.youtube.com"), Category::Video);
        assert_eq!(categorize("en.wikipedia.org"), Category::Reference);
    }

    #[test]
    fn test_suffix_does_not_match_without_dot() {
        assert_eq!(categorize("notgithub.com"), Category::Other);
        assert_eq!(categorize("fax.com"), Category::Other);
    }

    #[test]
    fn test_prefix_patterns() {
        assert_eq!(categorize("amazon.de"), Category::Shopping);
        assert_eq!(categorize("smile.amazon.co.uk"), Category::Shopping);
        assert_eq!(categorize("mastodon.social"), Category::Social);
    }

    #[test]
    fn test_specific_entries_win_over_general() {
        assert_eq!(categorize("mail.google.com"), Category::Email);
        assert_eq!(categorize("docs.google.com"), Category::Productivity);
        assert_eq!(categorize("news.ycombinator.com"), Category::News);
    }

    #[test]
    fn test_empty_and_unknown() {
        assert_eq!(categorize(""), Category::Other);
        assert_eq!(categorize("example.com"), Category::Other);
    }

    #[test]
    fn test_generic_buckets() {
        assert!(Category::Other.is_generic());
        assert!(Category::Email.is_generic());
        assert!(!Category::Development.is_generic());
        assert_eq!(Category::Ai.label(), "AI Tools");
    }
}
