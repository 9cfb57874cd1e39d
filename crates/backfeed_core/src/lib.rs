/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

pub mod adapters;
pub mod api;
pub mod avatar_backfill;
pub mod canonical;
pub mod classifier;
pub mod conversation_db;
pub mod http_retry;
pub mod local_activity;
pub mod poll_metrics;
pub mod poll_state;
pub mod runtime;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod test_support;

pub fn backfeed_core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub(crate) fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

pub(crate) fn ms_to_rfc3339(ms: i64) -> Option<String> {
    let secs = ms.checked_div(1000)?;
    let nanos = (ms.rem_euclid(1000) * 1_000_000) as u32;
    let dt = time::OffsetDateTime::from_unix_timestamp(secs).ok()? + time::Duration::nanoseconds(nanos as i64);
    dt.format(&time::format_description::well_known::Rfc3339).ok()
}

pub(crate) fn rfc3339_to_ms(input: &str) -> Option<i64> {
    let dt = time::OffsetDateTime::parse(input.trim(), &time::format_description::well_known::Rfc3339).ok()?;
    Some((dt.unix_timestamp_nanos() / 1_000_000) as i64)
}
