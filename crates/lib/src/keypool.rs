//! Rotating pool of provider credentials with failure-driven cool-down.
//!
//! One pool per provider family. The pool hands out the first non-blocked key starting at the
//! rotation pointer; a key that is rate limited (or fails too often in a row) is blocked for a
//! fixed window and becomes eligible again once `now >= block_until`.
//! State is process-local; a restart clears every block.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;

pub const DEFAULT_MAX_CONSECUTIVE_ERRORS: u32 = 3;
pub const DEFAULT_BLOCK_SECONDS: u64 = 60;

const KEY_PREVIEW_CHARS: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum KeyPoolError {
    #[error("no API keys configured for {0}")]
    Empty(String),
}

/// A credential handed out by [`KeyPool::next_available`]; `index` identifies it for
/// later `mark_failed` / `mark_success` calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyLease {
    pub index: usize,
    pub credential: String,
}

/// Observability snapshot of one key (served by GET /api/keys/status).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyStatus {
    pub family: String,
    /// 1-based position in the pool.
    pub index: usize,
    pub is_blocked: bool,
    pub consecutive_errors: u32,
    pub is_current: bool,
    pub key_preview: String,
    pub block_until: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct KeyEntry {
    credential: String,
    consecutive_errors: u32,
    is_blocked: bool,
    block_until: Option<DateTime<Utc>>,
}

impl KeyEntry {
    fn unblock(&mut self) {
        self.is_blocked = false;
        self.consecutive_errors = 0;
        self.block_until = None;
    }
}

#[derive(Debug)]
struct PoolState {
    keys: Vec<KeyEntry>,
    current: usize,
}

#[derive(Debug)]
pub struct KeyPool {
    family: String,
    max_consecutive_errors: u32,
    block_duration: Duration,
    state: Mutex<PoolState>,
}

impl KeyPool {
    /// Build a pool with the default policy (3 errors, 60s block).
    pub fn new(family: impl Into<String>, keys: Vec<String>) -> Result<Self, KeyPoolError> {
        Self::with_policy(
            family,
            keys,
            DEFAULT_MAX_CONSECUTIVE_ERRORS,
            Duration::seconds(DEFAULT_BLOCK_SECONDS as i64),
        )
    }

    pub fn with_policy(
        family: impl Into<String>,
        keys: Vec<String>,
        max_consecutive_errors: u32,
        block_duration: Duration,
    ) -> Result<Self, KeyPoolError> {
        let family = family.into();
        let keys: Vec<KeyEntry> = keys
            .into_iter()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .map(|credential| KeyEntry {
                credential,
                consecutive_errors: 0,
                is_blocked: false,
                block_until: None,
            })
            .collect();
        if keys.is_empty() {
            return Err(KeyPoolError::Empty(family));
        }
        log::info!("key pool {}: {} key(s)", family, keys.len());
        Ok(Self {
            family,
            max_consecutive_errors: max_consecutive_errors.max(1),
            block_duration,
            state: Mutex::new(PoolState { keys, current: 0 }),
        })
    }

    pub fn family(&self) -> &str {
        &self.family
    }

    pub fn len(&self) -> usize {
        self.state.lock().keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn current_index(&self) -> usize {
        self.state.lock().current
    }

    /// First non-blocked key at or after the rotation pointer (wrapping). Keys whose cool-down
    /// has elapsed are unblocked first. The pointer moves to the returned key.
    pub fn next_available(&self) -> Option<KeyLease> {
        self.next_available_at(Utc::now())
    }

    pub fn next_available_at(&self, now: DateTime<Utc>) -> Option<KeyLease> {
        let mut state = self.state.lock();
        for (i, key) in state.keys.iter_mut().enumerate() {
            if key.is_blocked && key.block_until.is_some_and(|until| now >= until) {
                log::info!("key pool {}: unblocking key {}", self.family, i + 1);
                key.unblock();
            }
        }
        let n = state.keys.len();
        for offset in 0..n {
            let i = (state.current + offset) % n;
            if !state.keys[i].is_blocked {
                state.current = i;
                return Some(KeyLease {
                    index: i,
                    credential: state.keys[i].credential.clone(),
                });
            }
        }
        log::warn!("key pool {}: all keys are blocked", self.family);
        None
    }

    /// Record a failed call. Rate-limited failures block the key immediately; other failures
    /// block it once the consecutive error count reaches the threshold.
    pub fn mark_failed(&self, index: usize, rate_limited: bool) {
        self.mark_failed_at(index, rate_limited, Utc::now())
    }

    pub fn mark_failed_at(&self, index: usize, rate_limited: bool, now: DateTime<Utc>) {
        let mut state = self.state.lock();
        let Some(key) = state.keys.get_mut(index) else {
            return;
        };
        key.consecutive_errors += 1;
        log::warn!(
            "key pool {}: key {} failed ({}/{} errors{})",
            self.family,
            index + 1,
            key.consecutive_errors,
            self.max_consecutive_errors,
            if rate_limited { ", rate limited" } else { "" }
        );
        if rate_limited || key.consecutive_errors >= self.max_consecutive_errors {
            key.is_blocked = true;
            key.block_until = Some(now + self.block_duration);
            log::warn!(
                "key pool {}: key {} blocked for {}s",
                self.family,
                index + 1,
                self.block_duration.num_seconds()
            );
        }
    }

    pub fn mark_success(&self, index: usize) {
        let mut state = self.state.lock();
        if let Some(key) = state.keys.get_mut(index) {
            key.consecutive_errors = 0;
        }
    }

    /// Advance the rotation pointer by one, regardless of block state.
    pub fn rotate(&self) {
        let mut state = self.state.lock();
        state.current = (state.current + 1) % state.keys.len();
        log::debug!("key pool {}: rotated to key {}", self.family, state.current + 1);
    }

    /// Clear every block and error counter (admin).
    pub fn unblock_all(&self) {
        let mut state = self.state.lock();
        for key in state.keys.iter_mut() {
            key.unblock();
        }
        log::info!("key pool {}: all keys unblocked", self.family);
    }

    pub fn status(&self) -> Vec<KeyStatus> {
        let state = self.state.lock();
        state
            .keys
            .iter()
            .enumerate()
            .map(|(i, key)| KeyStatus {
                family: self.family.clone(),
                index: i + 1,
                is_blocked: key.is_blocked,
                consecutive_errors: key.consecutive_errors,
                is_current: i == state.current,
                key_preview: key_preview(&key.credential),
                block_until: key.block_until,
            })
            .collect()
    }
}

fn key_preview(credential: &str) -> String {
    let head: String = credential.chars().take(KEY_PREVIEW_CHARS).collect();
    format!("{}...", head)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(n: usize) -> KeyPool {
        KeyPool::new("gemini", (1..=n).map(|i| format!("key-{}", i)).collect()).unwrap()
    }

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn empty_pool_is_rejected() {
        assert!(KeyPool::new("openai", vec![" ".into(), "".into()]).is_err());
    }

    #[test]
    fn hands_out_current_key_until_it_fails() {
        let p = pool(3);
        assert_eq!(p.next_available_at(t0()).unwrap().index, 0);
        assert_eq!(p.next_available_at(t0()).unwrap().index, 0);
        p.mark_failed_at(0, true, t0());
        let lease = p.next_available_at(t0()).unwrap();
        assert_eq!(lease.index, 1);
        assert_eq!(lease.credential, "key-2");
        assert_eq!(p.current_index(), 1);
    }

    #[test]
    fn blocked_key_is_skipped_until_exactly_block_until() {
        let p = pool(1);
        p.mark_failed_at(0, true, t0());
        let before = t0() + Duration::seconds(60) - Duration::milliseconds(1);
        assert!(p.next_available_at(t0()).is_none());
        assert!(p.next_available_at(before).is_none());
        let at = t0() + Duration::seconds(60);
        assert_eq!(p.next_available_at(at).unwrap().index, 0);
        assert_eq!(p.status()[0].consecutive_errors, 0);
        assert!(!p.status()[0].is_blocked);
    }

    #[test]
    fn non_rate_limit_errors_block_after_threshold() {
        let p = pool(2);
        p.mark_failed_at(0, false, t0());
        p.mark_failed_at(0, false, t0());
        assert!(!p.status()[0].is_blocked);
        p.mark_failed_at(0, false, t0());
        let s = &p.status()[0];
        assert!(s.is_blocked);
        assert_eq!(s.block_until, Some(t0() + Duration::seconds(60)));
    }

    #[test]
    fn success_resets_error_counter() {
        let p = pool(1);
        p.mark_failed_at(0, false, t0());
        p.mark_failed_at(0, false, t0());
        p.mark_success(0);
        p.mark_failed_at(0, false, t0());
        assert!(!p.status()[0].is_blocked);
        assert_eq!(p.status()[0].consecutive_errors, 1);
    }

    #[test]
    fn rotate_wraps_and_ignores_blocks() {
        let p = pool(3);
        p.mark_failed_at(1, true, t0());
        p.rotate();
        assert_eq!(p.current_index(), 1);
        p.rotate();
        p.rotate();
        assert_eq!(p.current_index(), 0);
    }

    #[test]
    fn unblock_all_restores_every_key() {
        let p = pool(2);
        p.mark_failed_at(0, true, t0());
        p.mark_failed_at(1, true, t0());
        assert!(p.next_available_at(t0()).is_none());
        p.unblock_all();
        assert!(p.next_available_at(t0()).is_some());
    }

    #[test]
    fn status_previews_keys_and_marks_current() {
        let p = KeyPool::new("gemini", vec!["AIzaSyABCDEFGHIJ".into(), "short".into()]).unwrap();
        let s = p.status();
        assert_eq!(s.len(), 2);
        assert_eq!(s[0].key_preview, "AIzaSyABCD...");
        assert_eq!(s[1].key_preview, "short...");
        assert!(s[0].is_current);
        assert_eq!(s[1].index, 2);
    }
}
