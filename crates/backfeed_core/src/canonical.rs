/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Reverse index from a syndicated copy's URL to the owner's own post.
pub trait SyndicationIndex: Send + Sync {
    fn find_post_by_syndication(&self, url: &str) -> Result<Option<String>>;
}

/// The owner's post collection, as shared with the host site.
#[derive(Clone)]
pub struct PostsDb {
    path: PathBuf,
}

impl PostsDb {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let path = db_path.as_ref().to_path_buf();
        let conn = Connection::open(&path).with_context(|| format!("open posts db: {}", path.display()))?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS posts (
              url TEXT PRIMARY KEY,
              published_at_ms INTEGER NULL
            );
            CREATE TABLE IF NOT EXISTS post_syndication (
              post_url TEXT NOT NULL,
              syndication_url TEXT NOT NULL,
              PRIMARY KEY(post_url, syndication_url)
            );
            CREATE INDEX IF NOT EXISTS idx_post_syndication_url ON post_syndication(syndication_url);
            "#,
        )?;
        Ok(Self { path })
    }

    pub fn add_post(&self, url: &str, syndication: &[&str]) -> Result<()> {
        let mut conn = Connection::open(&self.path)?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO posts(url, published_at_ms) VALUES (?1, ?2)",
            params![url, crate::now_ms()],
        )?;
        for s in syndication {
            tx.execute(
                "INSERT OR IGNORE INTO post_syndication(post_url, syndication_url) VALUES (?1, ?2)",
                params![url, s],
            )?;
        }
        tx.commit()?;
        Ok(())
    }
}

impl SyndicationIndex for PostsDb {
    fn find_post_by_syndication(&self, url: &str) -> Result<Option<String>> {
        let conn = Connection::open(&self.path)?;
        conn.query_row(
            "SELECT post_url FROM post_syndication WHERE syndication_url=?1 ORDER BY post_url LIMIT 1",
            params![url],
            |r| r.get(0),
        )
        .optional()
        .map_err(Into::into)
    }
}

/// Maps foreign post references back to the owner's canonical post URL.
/// Stateless apart from the index handle; nothing is cached between calls.
#[derive(Clone)]
pub struct CanonicalResolver {
    index: Arc<dyn SyndicationIndex>,
}

impl CanonicalResolver {
    pub fn new(index: Arc<dyn SyndicationIndex>) -> Self {
        Self { index }
    }

    pub fn resolve(&self, candidate_url: &str) -> Result<Option<String>> {
        for variant in url_variants(candidate_url) {
            if let Some(post) = self.index.find_post_by_syndication(&variant)? {
                return Ok(Some(post));
            }
        }
        Ok(None)
    }

    /// Same-site targets come back untouched without a lookup; otherwise the
    /// reverse lookup result, or `target_url` itself when nothing matches.
    pub fn resolve_or_fallback(&self, target_url: &str, site_url: &str) -> Result<String> {
        if is_under_site(target_url, site_url) {
            return Ok(target_url.to_string());
        }
        Ok(self.resolve(target_url)?.unwrap_or_else(|| target_url.to_string()))
    }

    /// First candidate that is either on the owner's site or a known syndication link.
    pub fn resolve_candidates(&self, candidates: &[String], site_url: &str) -> Result<Option<String>> {
        for c in candidates {
            if is_under_site(c, site_url) {
                return Ok(Some(c.clone()));
            }
            if let Some(post) = self.resolve(c)? {
                return Ok(Some(post));
            }
        }
        Ok(None)
    }
}

/// True when `url` lives on `site_url` (prefix match on a path boundary).
pub fn is_under_site(url: &str, site_url: &str) -> bool {
    let url = url.trim();
    let site = site_url.trim();
    if site.is_empty() || url.is_empty() {
        return false;
    }
    if site.ends_with('/') {
        return url.starts_with(site);
    }
    match url.strip_prefix(site) {
        Some(rest) => rest.is_empty() || rest.starts_with(['/', '?', '#']),
        None => false,
    }
}

fn url_variants(url: &str) -> Vec<String> {
    let url = url.trim();
    if url.is_empty() {
        return Vec::new();
    }
    let mut out = vec![url.to_string()];
    if let Some(stripped) = url.strip_suffix('/') {
        out.push(stripped.to_string());
    } else {
        out.push(format!("{url}/"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    struct PanickingIndex;

    impl SyndicationIndex for PanickingIndex {
        fn find_post_by_syndication(&self, url: &str) -> Result<Option<String>> {
            panic!("lookup must not run for {url}");
        }
    }

    fn posts() -> (tempfile::TempDir, CanonicalResolver) {
        let dir = tempfile::tempdir().unwrap();
        let db = PostsDb::open(dir.path().join("posts.db")).unwrap();
        db.add_post(
            "https://owner.example/notes/1",
            &[
                "https://mastodon.example/@owner/111",
                "https://bsky.app/profile/owner.example/post/3kabc",
            ],
        )
        .unwrap();
        (dir, CanonicalResolver::new(Arc::new(db)))
    }

    #[test]
    fn resolve_finds_post_by_syndication_link() {
        let (_dir, r) = posts();
        assert_eq!(
            r.resolve("https://mastodon.example/@owner/111").unwrap().as_deref(),
            Some("https://owner.example/notes/1")
        );
        assert_eq!(
            r.resolve("https://mastodon.example/@owner/111/").unwrap().as_deref(),
            Some("https://owner.example/notes/1")
        );
        assert!(r.resolve("https://mastodon.example/@owner/222").unwrap().is_none());
    }

    #[test]
    fn same_site_target_skips_lookup() {
        let r = CanonicalResolver::new(Arc::new(PanickingIndex));
        let out = r
            .resolve_or_fallback("https://owner.example/post", "https://owner.example")
            .unwrap();
        assert_eq!(out, "https://owner.example/post");
        let out = r
            .resolve_or_fallback("https://owner.example/post", "https://owner.example/")
            .unwrap();
        assert_eq!(out, "https://owner.example/post");
    }

    #[test]
    fn fallback_returns_target_when_unmatched() {
        let (_dir, r) = posts();
        let out = r
            .resolve_or_fallback("https://elsewhere.example/x", "https://owner.example")
            .unwrap();
        assert_eq!(out, "https://elsewhere.example/x");
        let out = r
            .resolve_or_fallback("https://mastodon.example/@owner/111", "https://owner.example")
            .unwrap();
        assert_eq!(out, "https://owner.example/notes/1");
    }

    #[test]
    fn candidates_try_each_in_order() {
        let (_dir, r) = posts();
        let candidates = vec![
            "https://bsky.app/profile/did:plc:xyz/post/3kabc".to_string(),
            "https://bsky.app/profile/owner.example/post/3kabc".to_string(),
        ];
        assert_eq!(
            r.resolve_candidates(&candidates, "https://owner.example").unwrap().as_deref(),
            Some("https://owner.example/notes/1")
        );
        let none = vec!["https://bsky.app/profile/x/post/nope".to_string()];
        assert!(r.resolve_candidates(&none, "https://owner.example").unwrap().is_none());
    }

    #[test]
    fn site_prefix_respects_host_boundary() {
        assert!(is_under_site("https://owner.example/a", "https://owner.example"));
        assert!(is_under_site("https://owner.example", "https://owner.example"));
        assert!(!is_under_site("https://owner.example.evil.test/a", "https://owner.example"));
        assert!(!is_under_site("https://other.example/a", "https://owner.example"));
    }
}
