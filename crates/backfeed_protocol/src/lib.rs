/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use serde::{Deserialize, Serialize};

/// Kind of reaction a third party made to one of the owner's posts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InteractionType {
    Reply,
    Like,
    Repost,
    Bookmark,
    Mention,
}

impl InteractionType {
    pub fn as_str(self) -> &'static str {
        match self {
            InteractionType::Reply => "reply",
            InteractionType::Like => "like",
            InteractionType::Repost => "repost",
            InteractionType::Bookmark => "bookmark",
            InteractionType::Mention => "mention",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "reply" => Some(Self::Reply),
            "like" => Some(Self::Like),
            "repost" => Some(Self::Repost),
            "bookmark" => Some(Self::Bookmark),
            "mention" => Some(Self::Mention),
            _ => None,
        }
    }

    /// Webmention property name used by JF2 feeds (`in-reply-to`, `like-of`, ...).
    pub fn wm_property(self) -> &'static str {
        match self {
            InteractionType::Reply => "in-reply-to",
            InteractionType::Like => "like-of",
            InteractionType::Repost => "repost-of",
            InteractionType::Bookmark => "bookmark-of",
            InteractionType::Mention => "mention-of",
        }
    }

    pub fn from_wm_property(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "in-reply-to" => Some(Self::Reply),
            "like-of" => Some(Self::Like),
            "repost-of" => Some(Self::Repost),
            "bookmark-of" => Some(Self::Bookmark),
            "mention-of" => Some(Self::Mention),
            _ => None,
        }
    }
}

/// Closed set of platform tags an interaction can originate from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceTag {
    Mastodon,
    Bluesky,
    Activitypub,
    Webmention,
    Twitter,
    Flickr,
    Github,
}

impl SourceTag {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceTag::Mastodon => "mastodon",
            SourceTag::Bluesky => "bluesky",
            SourceTag::Activitypub => "activitypub",
            SourceTag::Webmention => "webmention",
            SourceTag::Twitter => "twitter",
            SourceTag::Flickr => "flickr",
            SourceTag::Github => "github",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "mastodon" => Some(Self::Mastodon),
            "bluesky" => Some(Self::Bluesky),
            "activitypub" => Some(Self::Activitypub),
            "webmention" => Some(Self::Webmention),
            "twitter" => Some(Self::Twitter),
            "flickr" => Some(Self::Flickr),
            "github" => Some(Self::Github),
            _ => None,
        }
    }
}

impl std::fmt::Display for SourceTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub url: String,
    /// May be empty; the avatar backfill sweep fills it in later.
    #[serde(default)]
    pub photo: String,
}

/// One reaction as produced by a source adapter, before canonical resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub source: SourceTag,
    pub platform_id: String,
    #[serde(rename = "type")]
    pub kind: InteractionType,
    pub author: Author,
    pub content: Option<String>,
    /// Public URL of the reaction itself.
    pub url: String,
    /// Candidate URLs of the post the reaction concerns, tried in order.
    pub subject_urls: Vec<String>,
    /// RFC 3339 timestamp reported by the platform, when known.
    #[serde(default)]
    pub published: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub source: SourceTag,
    #[serde(rename = "type")]
    pub kind: InteractionType,
    pub relay_url: Option<String>,
    pub confidence: Confidence,
}

/// Push-delivered reaction, as accepted by the ingest endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestRequest {
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub author: Option<Author>,
    #[serde(default)]
    pub content: Option<String>,
    /// Explicit webmention property (`in-reply-to`, `like-of`, ...), when declared.
    #[serde(default)]
    pub property: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestAck {
    pub status: String,
    pub source: String,
    pub target: String,
    pub canonical_url: String,
    pub platform_id: String,
    pub classification: Classification,
}

/// JF2 feed, field-compatible with webmention.io's `mentions.jf2` output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Jf2Feed {
    #[serde(rename = "type")]
    pub ty: String,
    pub name: String,
    pub children: Vec<Jf2Entry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Jf2Card {
    #[serde(rename = "type")]
    pub ty: String,
    pub name: String,
    pub photo: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Jf2Content {
    pub html: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Jf2Entry {
    #[serde(rename = "type")]
    pub ty: String,
    pub author: Jf2Card,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published: Option<String>,
    #[serde(rename = "wm-received")]
    pub wm_received: String,
    #[serde(rename = "wm-id")]
    pub wm_id: i64,
    #[serde(rename = "wm-source")]
    pub wm_source: String,
    #[serde(rename = "wm-target")]
    pub wm_target: String,
    #[serde(rename = "wm-property")]
    pub wm_property: String,
    #[serde(rename = "wm-private")]
    pub wm_private: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Jf2Content>,
    #[serde(rename = "in-reply-to", skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<String>,
    #[serde(rename = "like-of", skip_serializing_if = "Option::is_none")]
    pub like_of: Option<String>,
    #[serde(rename = "repost-of", skip_serializing_if = "Option::is_none")]
    pub repost_of: Option<String>,
    #[serde(rename = "bookmark-of", skip_serializing_if = "Option::is_none")]
    pub bookmark_of: Option<String>,
    #[serde(rename = "mention-of", skip_serializing_if = "Option::is_none")]
    pub mention_of: Option<String>,
    pub platform: String,
    #[serde(rename = "platform-id")]
    pub platform_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeCounts {
    pub reply: u64,
    pub like: u64,
    pub repost: u64,
    pub bookmark: u64,
    pub mention: u64,
}

impl TypeCounts {
    pub fn total(&self) -> u64 {
        self.reply + self.like + self.repost + self.bookmark + self.mention
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostSummary {
    pub canonical_url: String,
    pub counts: TypeCounts,
    pub total: u64,
    pub last_activity: String,
}
