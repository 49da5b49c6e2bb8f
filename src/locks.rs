//! Node-scoped lock manager.
//!
//! Locks are keyed by node path. A deep lock covers the whole subtree; a
//! session-scoped lock dies with its session; a timeout hint (seconds,
//! zero means none, clamped to 100 years) expires a lock lazily: expired
//! entries are treated as absent and reclaimed on the next access rather
//! than by a reaper thread. Write access to a locked item requires the
//! lock token, wire form `<32-hex-uuid>-<check-digit>`.

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::error::{RepoError, Result};
use crate::model::{NodeId, Path};

/// Hints beyond a century are clamped and behave as non-expiring.
pub const MAX_TIMEOUT_SECS: u64 = 100 * 365 * 24 * 60 * 60;

const CHECK_ALPHABET: &[u8; 37] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ+";

/// Identifies one session for session-scoped lock cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

/// A lock token: node id plus checksum digit.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken {
    /// The locked node.
    pub id: NodeId,
}

impl LockToken {
    /// The token for a node.
    pub fn new(id: NodeId) -> Self {
        Self { id }
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.id.to_hex();
        write!(f, "{hex}-{}", check_digit(&hex))
    }
}

impl FromStr for LockToken {
    type Err = RepoError;

    fn from_str(s: &str) -> Result<Self> {
        let (hex, digit) = s
            .rsplit_once('-')
            .ok_or_else(|| RepoError::Corruption(format!("malformed lock token: {s}")))?;
        if digit.len() != 1 || hex.len() != 32 {
            return Err(RepoError::Corruption(format!("malformed lock token: {s}")));
        }
        let id = NodeId::from_hex(hex)
            .map_err(|_| RepoError::Corruption(format!("malformed lock token: {s}")))?;
        let expected = check_digit(hex);
        if digit.as_bytes()[0] != expected as u8 {
            return Err(RepoError::Corruption(format!(
                "lock token check digit mismatch: {s}"
            )));
        }
        Ok(Self { id })
    }
}

/// Base-37 weighted checksum over the 32 hex digits, multipliers
/// descending from 36.
fn check_digit(hex: &str) -> char {
    let mut sum: u64 = 0;
    let mut multiplier: u64 = 36;
    for c in hex.bytes() {
        let value = match c {
            b'0'..=b'9' => u64::from(c - b'0'),
            b'a'..=b'f' => u64::from(c - b'a') + 10,
            b'A'..=b'F' => u64::from(c - b'A') + 10,
            _ => 0,
        };
        sum += value * multiplier;
        multiplier -= 1;
    }
    CHECK_ALPHABET[(sum % 37) as usize] as char
}

/// One held lock.
#[derive(Debug, Clone)]
pub struct LockInfo {
    /// Locked node.
    pub node: NodeId,
    /// Path of the locked node at acquisition time.
    pub path: Path,
    /// User that acquired the lock.
    pub owner: String,
    /// Covers the whole subtree when set.
    pub deep: bool,
    /// Released automatically when the owning session closes.
    pub session_scoped: bool,
    /// Clamped timeout hint in seconds; zero means no timeout.
    pub timeout_hint: u64,
    /// Absolute expiry, derived from the clamped hint.
    pub deadline: Option<Instant>,
    /// Session that acquired the lock.
    pub session: SessionId,
}

impl LockInfo {
    /// The wire token for this lock.
    pub fn token(&self) -> LockToken {
        LockToken::new(self.node)
    }

    /// True once the (clamped) deadline has passed.
    pub fn is_expired(&self) -> bool {
        match self.deadline {
            Some(deadline) => Instant::now() > deadline,
            None => false,
        }
    }
}

/// Path-keyed lock table.
pub struct LockManager {
    locks: Mutex<FxHashMap<String, LockInfo>>,
    default_timeout: u64,
}

impl LockManager {
    /// Builds a manager with the configured default timeout hint.
    pub fn new(default_timeout: u64) -> Self {
        Self {
            locks: Mutex::new(FxHashMap::default()),
            default_timeout,
        }
    }

    /// Acquires a lock on `path`. Fails `Locked` when the node, one of its
    /// ancestors (deep), or (for a deep request) one of its descendants
    /// is already locked.
    #[allow(clippy::too_many_arguments)]
    pub fn lock(
        &self,
        node: NodeId,
        path: &Path,
        deep: bool,
        session_scoped: bool,
        timeout_hint: Option<u64>,
        owner: impl Into<String>,
        session: SessionId,
    ) -> Result<LockInfo> {
        let mut locks = self.locks.lock();
        reap_expired(&mut locks);

        if let Some(existing) = effective_lock(&locks, path) {
            return Err(RepoError::Locked(format!(
                "{} is already locked by {}",
                path, existing.owner
            )));
        }
        if deep {
            let prefix = path.to_string();
            for (other, info) in locks.iter() {
                if is_path_prefix(&prefix, other) {
                    return Err(RepoError::Locked(format!(
                        "deep lock on {} collides with the lock on {}",
                        path, info.path
                    )));
                }
            }
        }

        let hint = timeout_hint.unwrap_or(self.default_timeout);
        // Clamped once here; every read path sees only the clamped value.
        let hint = hint.min(MAX_TIMEOUT_SECS);
        let deadline = (hint > 0).then(|| Instant::now() + Duration::from_secs(hint));
        let info = LockInfo {
            node,
            path: path.clone(),
            owner: owner.into(),
            deep,
            session_scoped,
            timeout_hint: hint,
            deadline,
            session,
        };
        debug!(path = %path, deep, session_scoped, hint, "lock.acquired");
        locks.insert(path.to_string(), info.clone());
        Ok(info)
    }

    /// Releases the lock at `path`. The caller must present the token.
    pub fn unlock(&self, path: &Path, tokens: &[LockToken]) -> Result<()> {
        let mut locks = self.locks.lock();
        reap_expired(&mut locks);
        let key = path.to_string();
        let Some(info) = locks.get(&key) else {
            return Err(RepoError::NotFound("lock"));
        };
        if !tokens.contains(&info.token()) {
            return Err(RepoError::Locked(format!(
                "session does not hold the lock token for {path}"
            )));
        }
        locks.remove(&key);
        debug!(path = %path, "lock.released");
        Ok(())
    }

    /// The lock governing `path`: an exact entry or the nearest deep
    /// ancestor. Expired entries are reclaimed on the way.
    pub fn lock_info(&self, path: &Path) -> Option<LockInfo> {
        let mut locks = self.locks.lock();
        reap_expired(&mut locks);
        effective_lock(&locks, path).cloned()
    }

    /// True when a live lock governs `path`.
    pub fn is_locked(&self, path: &Path) -> bool {
        self.lock_info(path).is_some()
    }

    /// Validates a write to `path` for a session holding `tokens`.
    pub fn check_write(&self, path: &Path, tokens: &[LockToken]) -> Result<()> {
        match self.lock_info(path) {
            None => Ok(()),
            Some(info) => {
                if tokens.contains(&info.token()) {
                    Ok(())
                } else {
                    Err(RepoError::Locked(format!(
                        "{} is locked by {}",
                        info.path, info.owner
                    )))
                }
            }
        }
    }

    /// Installs a lock observed through the cluster journal. Collisions
    /// resolve in favor of the record (the journal is totally ordered).
    pub fn apply_external(&self, node: NodeId, path: &Path, deep: bool, owner: &str) {
        let mut locks = self.locks.lock();
        reap_expired(&mut locks);
        locks.insert(
            path.to_string(),
            LockInfo {
                node,
                path: path.clone(),
                owner: owner.to_string(),
                deep,
                session_scoped: false,
                timeout_hint: 0,
                deadline: None,
                session: SessionId(0),
            },
        );
    }

    /// Removes a lock by node id (cluster unlock records carry no path).
    pub fn remove_by_node(&self, node: NodeId) {
        self.locks.lock().retain(|_, info| info.node != node);
    }

    /// Releases the session-scoped locks held by a closing session.
    pub fn session_closed(&self, session: SessionId) {
        let mut locks = self.locks.lock();
        locks.retain(|_, info| !(info.session_scoped && info.session == session));
    }

    /// Number of live locks (test and diagnostics hook).
    pub fn live_count(&self) -> usize {
        let mut locks = self.locks.lock();
        reap_expired(&mut locks);
        locks.len()
    }
}

fn reap_expired(locks: &mut FxHashMap<String, LockInfo>) {
    locks.retain(|_, info| !info.is_expired());
}

fn effective_lock<'a>(
    locks: &'a FxHashMap<String, LockInfo>,
    path: &Path,
) -> Option<&'a LockInfo> {
    if let Some(info) = locks.get(&path.to_string()) {
        return Some(info);
    }
    let mut current = path.parent();
    while let Some(p) = current {
        if let Some(info) = locks.get(&p.to_string()) {
            if info.deep {
                return Some(info);
            }
        }
        current = p.parent();
    }
    None
}

fn is_path_prefix(prefix: &str, other: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    other == prefix || other.starts_with(&format!("{prefix}/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(s: &str) -> Path {
        s.parse().expect("path")
    }

    #[test]
    fn token_round_trip_and_bad_digit() {
        let id = NodeId::fresh();
        let token = LockToken::new(id);
        let text = token.to_string();
        let parsed: LockToken = text.parse().expect("parse");
        assert_eq!(parsed.id, id);

        // Flip the check digit.
        let mut bytes = text.into_bytes();
        let last = *bytes.last().expect("digit");
        *bytes.last_mut().expect("digit") = if last == b'0' { b'1' } else { b'0' };
        let bad = String::from_utf8(bytes).expect("utf8");
        assert!(matches!(
            bad.parse::<LockToken>(),
            Err(RepoError::Corruption(_))
        ));
        assert!("nonsense".parse::<LockToken>().is_err());
    }

    #[test]
    fn deep_lock_covers_descendants() {
        let manager = LockManager::new(0);
        let session = SessionId(1);
        let info = manager
            .lock(NodeId::fresh(), &path("/p"), true, false, None, "u1", session)
            .expect("lock");
        let token = info.token();

        // A descendant write without the token fails.
        let err = manager.check_write(&path("/p/c/x"), &[]).expect_err("locked");
        assert!(matches!(err, RepoError::Locked(_)));
        // With the token it passes.
        manager
            .check_write(&path("/p/c/x"), &[token.clone()])
            .expect("token admits");

        // A second lock anywhere in the subtree is refused.
        let err = manager
            .lock(NodeId::fresh(), &path("/p/c"), false, false, None, "u2", SessionId(2))
            .expect_err("covered");
        assert!(matches!(err, RepoError::Locked(_)));

        manager.unlock(&path("/p"), &[token]).expect("unlock");
        assert!(!manager.is_locked(&path("/p/c")));
    }

    #[test]
    fn shallow_lock_leaves_descendants_free() {
        let manager = LockManager::new(0);
        manager
            .lock(NodeId::fresh(), &path("/p"), false, false, None, "u1", SessionId(1))
            .expect("lock");
        manager.check_write(&path("/p/c"), &[]).expect("free");
        manager
            .lock(NodeId::fresh(), &path("/p/c"), false, false, None, "u2", SessionId(2))
            .expect("sibling scope");
    }

    #[test]
    fn deep_lock_refused_when_descendant_locked() {
        let manager = LockManager::new(0);
        manager
            .lock(NodeId::fresh(), &path("/p/c"), false, false, None, "u1", SessionId(1))
            .expect("inner lock");
        let err = manager
            .lock(NodeId::fresh(), &path("/p"), true, false, None, "u2", SessionId(2))
            .expect_err("descendant already locked");
        assert!(matches!(err, RepoError::Locked(_)));
    }

    #[test]
    fn expired_locks_are_absent_and_reclaimed() {
        let manager = LockManager::new(0);
        let info = manager
            .lock(
                NodeId::fresh(),
                &path("/t"),
                false,
                false,
                Some(1),
                "u1",
                SessionId(1),
            )
            .expect("lock");
        assert!(!info.is_expired());
        std::thread::sleep(Duration::from_millis(1100));
        assert!(info.is_expired());
        assert!(manager.lock_info(&path("/t")).is_none());
        assert_eq!(manager.live_count(), 0);

        // A different session may now lock the node.
        manager
            .lock(NodeId::fresh(), &path("/t"), false, false, None, "u2", SessionId(2))
            .expect("relock");
    }

    #[test]
    fn oversized_hint_is_clamped_and_never_expires() {
        let manager = LockManager::new(0);
        let info = manager
            .lock(
                NodeId::fresh(),
                &path("/c"),
                false,
                false,
                Some(u64::MAX),
                "u1",
                SessionId(1),
            )
            .expect("lock");
        assert_eq!(info.timeout_hint, MAX_TIMEOUT_SECS);
        assert!(!info.is_expired());
        assert!(manager.is_locked(&path("/c")));
    }

    #[test]
    fn session_close_releases_scoped_locks_only() {
        let manager = LockManager::new(0);
        let s1 = SessionId(1);
        manager
            .lock(NodeId::fresh(), &path("/scoped"), false, true, None, "u1", s1)
            .expect("scoped");
        manager
            .lock(NodeId::fresh(), &path("/open"), false, false, None, "u1", s1)
            .expect("open");

        manager.session_closed(s1);
        assert!(!manager.is_locked(&path("/scoped")));
        assert!(manager.is_locked(&path("/open")));
    }

    #[test]
    fn unlock_requires_the_token() {
        let manager = LockManager::new(0);
        let info = manager
            .lock(NodeId::fresh(), &path("/n"), false, false, None, "u1", SessionId(1))
            .expect("lock");
        let err = manager.unlock(&path("/n"), &[]).expect_err("no token");
        assert!(matches!(err, RepoError::Locked(_)));
        manager.unlock(&path("/n"), &[info.token()]).expect("unlock");
    }
}
