/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Heuristic classification of push-delivered reactions.
//!
//! Rules are evaluated in table order and the first match wins, so a relay
//! bridge URL always beats a social-app domain that also appears in it.

use backfeed_protocol::{Classification, Confidence, InteractionType, SourceTag};
use regex::Regex;
use std::sync::OnceLock;

/// What the classifier gets to look at for one inbound reaction.
#[derive(Debug, Clone, Default)]
pub struct Reaction {
    pub source_url: String,
    pub author_url: Option<String>,
    /// Explicitly declared property, e.g. from `in-reply-to`.
    pub property: Option<InteractionType>,
}

pub struct Rule {
    pub name: &'static str,
    pub apply: fn(&Reaction) -> Option<Classification>,
}

pub const RULES: &[Rule] = &[
    Rule {
        name: "relay-bridge",
        apply: relay_bridge_rule,
    },
    Rule {
        name: "federated-bridge",
        apply: federated_bridge_rule,
    },
    Rule {
        name: "social-app-domain",
        apply: social_app_rule,
    },
    Rule {
        name: "fediverse-instance",
        apply: fediverse_instance_rule,
    },
    Rule {
        name: "webmention",
        apply: webmention_rule,
    },
];

pub fn classify(reaction: &Reaction) -> Classification {
    RULES
        .iter()
        .find_map(|rule| (rule.apply)(reaction))
        .unwrap_or_else(|| webmention_default(reaction))
}

/// Name of the rule that produced the classification, for logging.
pub fn matching_rule(reaction: &Reaction) -> &'static str {
    RULES
        .iter()
        .find(|rule| (rule.apply)(reaction).is_some())
        .map(|rule| rule.name)
        .unwrap_or("webmention")
}

/// Stable per-platform identifier used as the second half of the dedup key.
///
/// Platform-specific forms are only derived once the classifier has settled
/// on that platform; anything else keys on the whole source URL.
pub fn generate_platform_id(reaction: &Reaction) -> String {
    let source = reaction.source_url.trim();
    let bridged = relay_bridge_re().captures(source).map(|caps| {
        let end = caps.get(0).map(|m| m.end()).unwrap_or(0);
        (caps[1].to_ascii_lowercase(), &source[end..])
    });
    let embedded = match &bridged {
        Some((_, rest)) if rest.starts_with("http://") || rest.starts_with("https://") => Some(*rest),
        Some(_) => None,
        None => Some(source),
    };
    match classify(reaction).source {
        SourceTag::Bluesky => {
            if let Some(caps) = embedded.and_then(|u| bsky_post_re().captures(u)) {
                return format!("bluesky:at://{}/app.bsky.feed.post/{}", &caps[1], &caps[2]);
            }
        }
        SourceTag::Mastodon => {
            if let Some(caps) = embedded.and_then(|u| status_id_re().captures(u)) {
                return format!("mastodon:{}", &caps[1]);
            }
            if let Some((kind, rest)) = &bridged {
                if let Some(id) = bridged_mastodon_id(kind, rest) {
                    return id;
                }
            }
        }
        _ => {}
    }
    format!("webmention:{source}")
}

/// Relay-native response paths look like `<user>/<post-id>/<response-id>`.
/// The ids line up with what the Mastodon poll adapter produces.
fn bridged_mastodon_id(kind: &str, rest: &str) -> Option<String> {
    let path = rest.split(['?', '#']).next().unwrap_or_default().trim_end_matches('/');
    let segments: Vec<&str> = path.split('/').collect();
    let [user, post, response] = segments.as_slice() else {
        return None;
    };
    let numeric = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    if user.is_empty() || !numeric(*post) || !numeric(*response) {
        return None;
    }
    match kind {
        "comment" | "reply" => Some(format!("mastodon:{response}")),
        "like" | "favorite" | "favourite" => Some(format!("mastodon:favourite:{response}:{post}")),
        "repost" | "share" | "boost" => Some(format!("mastodon:reblog:{response}:{post}")),
        _ => None,
    }
}

/// URL keyword inference shared by rules 2-5.
pub fn infer_type_from_url(url: &str) -> InteractionType {
    let url = url.to_ascii_lowercase();
    if url.contains("reply") || url.contains("comment") {
        InteractionType::Reply
    } else if url.contains("like") || url.contains("favourite") {
        InteractionType::Like
    } else if url.contains("repost") || url.contains("reblog") {
        InteractionType::Repost
    } else {
        InteractionType::Mention
    }
}

fn declared_or_inferred(reaction: &Reaction) -> InteractionType {
    reaction
        .property
        .unwrap_or_else(|| infer_type_from_url(&reaction.source_url))
}

fn relay_bridge_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^https?://(?:www\.)?brid\.gy/([a-z]+)/([a-z]+)/").expect("static regex")
    })
}

fn bsky_post_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^https?://bsky\.app/profile/([^/?#]+)/post/([a-z0-9]+)").expect("static regex")
    })
}

fn status_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^https?://[^/]+/(?:@[^/@?#]+(?:@[^/?#]+)?|users/[^/?#]+/statuses|notice)/([0-9]+)/?(?:[?#].*)?$")
            .expect("static regex")
    })
}

fn relay_bridge_rule(reaction: &Reaction) -> Option<Classification> {
    let caps = relay_bridge_re().captures(reaction.source_url.trim())?;
    let kind = match caps[1].to_ascii_lowercase().as_str() {
        "comment" | "reply" => InteractionType::Reply,
        "like" | "favorite" | "favourite" | "reaction" => InteractionType::Like,
        "repost" | "share" | "boost" => InteractionType::Repost,
        _ => InteractionType::Mention,
    };
    let source = match caps[2].to_ascii_lowercase().as_str() {
        "mastodon" | "fed" => SourceTag::Mastodon,
        "bluesky" | "bsky" => SourceTag::Bluesky,
        "twitter" => SourceTag::Twitter,
        "flickr" => SourceTag::Flickr,
        "github" => SourceTag::Github,
        _ => SourceTag::Webmention,
    };
    Some(Classification {
        source,
        kind,
        relay_url: Some(reaction.source_url.trim().to_string()),
        confidence: Confidence::High,
    })
}

fn federated_bridge_rule(reaction: &Reaction) -> Option<Classification> {
    let host = host_of(&reaction.source_url)?;
    if host != "fed.brid.gy" && !host.ends_with(".fed.brid.gy") {
        return None;
    }
    Some(Classification {
        source: SourceTag::Mastodon,
        kind: declared_or_inferred(reaction),
        relay_url: Some(reaction.source_url.trim().to_string()),
        confidence: Confidence::High,
    })
}

const SOCIAL_APP_DOMAINS: &[&str] = &["bsky.app", "bsky.social"];

fn social_app_rule(reaction: &Reaction) -> Option<Classification> {
    let hit = urls_of(reaction).any(|url| {
        host_of(url)
            .map(|h| SOCIAL_APP_DOMAINS.iter().any(|d| h == *d || h.ends_with(&format!(".{d}"))))
            .unwrap_or(false)
    });
    if !hit {
        return None;
    }
    Some(Classification {
        source: SourceTag::Bluesky,
        kind: declared_or_inferred(reaction),
        relay_url: None,
        confidence: Confidence::Medium,
    })
}

const FEDIVERSE_FRAGMENTS: &[&str] = &[
    "mastodon",
    "mstdn",
    "masto",
    "fosstodon",
    "hachyderm",
    "infosec.exchange",
    "toot",
    "pleroma",
    "akkoma",
    "misskey",
    "fediverse",
    "social",
];

fn fediverse_instance_rule(reaction: &Reaction) -> Option<Classification> {
    let hit = urls_of(reaction).any(|url| {
        host_of(url)
            .map(|h| FEDIVERSE_FRAGMENTS.iter().any(|f| h.contains(f)))
            .unwrap_or(false)
    });
    if !hit {
        return None;
    }
    Some(Classification {
        source: SourceTag::Mastodon,
        kind: declared_or_inferred(reaction),
        relay_url: None,
        confidence: Confidence::Medium,
    })
}

fn webmention_rule(reaction: &Reaction) -> Option<Classification> {
    Some(webmention_default(reaction))
}

fn webmention_default(reaction: &Reaction) -> Classification {
    Classification {
        source: SourceTag::Webmention,
        kind: declared_or_inferred(reaction),
        relay_url: None,
        confidence: Confidence::Low,
    }
}

fn urls_of(reaction: &Reaction) -> impl Iterator<Item = &str> {
    std::iter::once(reaction.source_url.as_str()).chain(reaction.author_url.as_deref())
}

fn host_of(url: &str) -> Option<String> {
    url::Url::parse(url.trim())
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
}
