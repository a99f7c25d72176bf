//! In-process store running the window algorithm on a local sorted-set
//! emulation.
//!
//! Each evaluation holds the store lock for its whole trim/count/insert
//! sequence, which gives the same atomicity the Lua script gets from Redis.
//! Only suitable when every caller shares the same process.
//!
//! Expired keys are swept at most once per [`SWEEP_INTERVAL`] while the
//! store is in use; [`MemoryStore::spawn_purger`] covers idle periods.

use crate::error::{Result, ThrottlerError};
use crate::script::{ScriptArgs, ScriptReply, WINDOW_SCRIPT};
use crate::store::ScriptExecutor;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Minimum time between two expiry sweeps triggered by evaluations.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Source of the store's notion of "now".
pub trait Clock: Send + Sync {
    fn now_micros(&self) -> u64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_micros(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as u64
    }
}

/// Clock moved by hand. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    micros: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start_micros: u64) -> Self {
        Self {
            micros: Arc::new(AtomicU64::new(start_micros)),
        }
    }

    pub fn set_micros(&self, micros: u64) {
        self.micros.store(micros, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.micros.fetch_add(by.as_micros() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_micros(&self) -> u64 {
        self.micros.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
struct SortedSet {
    // (score, sequence); the sequence keeps same-score members distinct
    entries: BTreeSet<(i64, u64)>,
    expires_at_ms: i64,
}

#[derive(Debug, Default)]
struct State {
    scripts: HashSet<String>,
    keys: HashMap<String, SortedSet>,
    sequence: u64,
    script_loads: u64,
    last_sweep_ms: i64,
}

pub struct MemoryStore<C: Clock = SystemClock> {
    clock: C,
    state: Mutex<State>,
}

impl MemoryStore<SystemClock> {
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }
}

impl Default for MemoryStore<SystemClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> MemoryStore<C> {
    pub fn with_clock(clock: C) -> Self {
        Self {
            clock,
            state: Mutex::new(State::default()),
        }
    }

    /// Forget every registered script, like `SCRIPT FLUSH`.
    pub fn flush_scripts(&self) {
        self.state.lock().scripts.clear();
    }

    /// Drop every key.
    pub fn flush_keys(&self) {
        self.state.lock().keys.clear();
    }

    /// Number of `load_script` calls served so far.
    pub fn script_loads(&self) -> u64 {
        self.state.lock().script_loads
    }

    /// Number of keys held, expired or not.
    pub fn key_count(&self) -> usize {
        self.state.lock().keys.len()
    }

    /// Drop every expired key and return how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now_ms = (self.clock.now_micros() / 1000) as i64;
        self.state.lock().sweep(now_ms)
    }

    /// Live entries recorded under `key`.
    pub fn entry_count(&self, key: &str) -> usize {
        let now_ms = (self.clock.now_micros() / 1000) as i64;
        let state = self.state.lock();
        match state.keys.get(key) {
            Some(set) if set.expires_at_ms > now_ms => set.entries.len(),
            _ => 0,
        }
    }

    /// Remaining time to live of `key`, if it exists.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now_ms = (self.clock.now_micros() / 1000) as i64;
        let state = self.state.lock();
        state
            .keys
            .get(key)
            .filter(|set| set.expires_at_ms > now_ms)
            .map(|set| Duration::from_millis((set.expires_at_ms - now_ms) as u64))
    }
}

impl<C: Clock + 'static> MemoryStore<C> {
    /// Purge expired keys every `every` until the store is dropped.
    pub fn spawn_purger(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                let purged = store.purge_expired();
                if purged > 0 {
                    debug!(purged, "Purged expired rate limit keys");
                }
            }
        })
    }
}

impl State {
    fn sweep(&mut self, now_ms: i64) -> usize {
        let before = self.keys.len();
        self.keys.retain(|_, set| set.expires_at_ms > now_ms);
        self.last_sweep_ms = now_ms;
        before - self.keys.len()
    }

    fn sweep_if_due(&mut self, now_ms: i64) {
        if now_ms - self.last_sweep_ms >= SWEEP_INTERVAL.as_millis() as i64 {
            self.sweep(now_ms);
        }
    }

    fn run_window(&mut self, key: &str, args: &ScriptArgs, now_micros: u64) -> ScriptReply {
        let now_ms = (now_micros / 1000) as i64;
        let tick_micros = args.tick_micros().max(1);
        let member_score = (now_micros / tick_micros) as i64;
        let expire_ms = args.window_expire_ms as i64;
        let window_expire_at = now_ms + expire_ms;

        if self
            .keys
            .get(key)
            .is_some_and(|set| set.expires_at_ms <= now_ms)
        {
            self.keys.remove(key);
        }
        let set = self.keys.entry(key.to_string()).or_default();

        let cutoff = member_score - args.window as i64;
        set.entries = set.entries.split_off(&(cutoff, 0));

        let current_count = set.entries.len() as i64;
        let mut remaining = args.limit as i64 - current_count;
        let allowed = remaining + args.limit_overhead as i64 > 0;

        if allowed {
            self.sequence += 1;
            set.entries.insert((member_score, self.sequence));
            remaining -= 1;
        }

        let first_expire_at = match set.entries.first() {
            Some((score, _)) if current_count > 0 => {
                (*score as u64 * tick_micros / 1000) as i64 + expire_ms
            }
            _ => window_expire_at,
        };

        set.expires_at_ms = now_ms + expire_ms;

        ScriptReply {
            allowed,
            remaining,
            first_expire_at_ms: first_expire_at,
            window_expire_at_ms: window_expire_at,
        }
    }
}

#[async_trait]
impl<C: Clock> ScriptExecutor for MemoryStore<C> {
    async fn load_script(&self, source: &str) -> Result<String> {
        if source != WINDOW_SCRIPT {
            return Err(ThrottlerError::Internal(
                "memory store can only run the window script".to_string(),
            ));
        }

        let sha = redis::Script::new(source).get_hash().to_string();
        let mut state = self.state.lock();
        state.script_loads += 1;
        state.scripts.insert(sha.clone());
        Ok(sha)
    }

    async fn eval_sha(&self, sha: &str, keys: &[&str], args: &[String]) -> Result<Vec<i64>> {
        let key = match keys {
            [key] => *key,
            _ => {
                return Err(ThrottlerError::Internal(format!(
                    "window script takes exactly one key, got {}",
                    keys.len()
                )))
            }
        };
        let args = ScriptArgs::parse(args)?;

        let mut state = self.state.lock();
        if !state.scripts.contains(sha) {
            return Err(ThrottlerError::UnknownScript(sha.to_string()));
        }

        let now_micros = self.clock.now_micros();
        state.sweep_if_due((now_micros / 1000) as i64);
        let reply = state.run_window(key, &args, now_micros);
        trace!(key = %key, ?reply, "Evaluated window in memory");
        Ok(reply.to_values())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::Unit;
    use crate::window::WindowConfig;

    const START: u64 = 1_700_000_000_000_000;

    async fn store_with_script(clock: ManualClock) -> (MemoryStore<ManualClock>, String) {
        let store = MemoryStore::with_clock(clock);
        let sha = store.load_script(WINDOW_SCRIPT).await.unwrap();
        (store, sha)
    }

    async fn eval(store: &MemoryStore<ManualClock>, sha: &str, config: &WindowConfig) -> ScriptReply {
        let values = store
            .eval_sha(sha, &["key"], &config.script_args().to_args())
            .await
            .unwrap();
        ScriptReply::from_values(&values).unwrap()
    }

    #[tokio::test]
    async fn test_load_script_is_idempotent() {
        let store = MemoryStore::new();
        let first = store.load_script(WINDOW_SCRIPT).await.unwrap();
        let second = store.load_script(WINDOW_SCRIPT).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 40);
        assert_eq!(store.script_loads(), 2);
    }

    #[tokio::test]
    async fn test_rejects_other_scripts() {
        let store = MemoryStore::new();
        assert!(store.load_script("return 1").await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_sha_after_flush() {
        let (store, sha) = store_with_script(ManualClock::new(START)).await;
        store.flush_scripts();
        let config = WindowConfig::new(Unit::Second, 1, None, 1, None).unwrap();
        let err = store
            .eval_sha(&sha, &["key"], &config.script_args().to_args())
            .await
            .unwrap_err();
        assert!(matches!(err, ThrottlerError::UnknownScript(s) if s == sha));
    }

    #[tokio::test]
    async fn test_first_call_expiry_matches_window_expiry() {
        let (store, sha) = store_with_script(ManualClock::new(START)).await;
        let config = WindowConfig::new(Unit::Second, 1, None, 5, None).unwrap();

        let reply = eval(&store, &sha, &config).await;
        assert!(reply.allowed);
        assert_eq!(reply.remaining, 4);
        assert_eq!(reply.window_expire_at_ms, (START / 1000) as i64 + 1000);
        assert_eq!(reply.first_expire_at_ms, reply.window_expire_at_ms);
        assert_eq!(store.ttl("key"), Some(Duration::from_millis(1000)));
    }

    #[tokio::test]
    async fn test_entry_exactly_one_window_old_is_kept() {
        let clock = ManualClock::new(START);
        let (store, sha) = store_with_script(clock.clone()).await;
        let config =
            WindowConfig::new(Unit::Minute, 1, Some(Unit::Second), 10, None).unwrap();

        eval(&store, &sha, &config).await;
        clock.advance(Duration::from_secs(60));
        // Key TTL is a full window so it is gone here; re-seed and trim by score only.
        let reply = eval(&store, &sha, &config).await;
        assert_eq!(reply.remaining, 9);

        clock.advance(Duration::from_secs(30));
        eval(&store, &sha, &config).await;
        clock.advance(Duration::from_secs(30));
        // The first entry of this run is now exactly 60 ticks old.
        let reply = eval(&store, &sha, &config).await;
        assert_eq!(reply.remaining, 7);
        clock.advance(Duration::from_secs(1));
        let reply = eval(&store, &sha, &config).await;
        assert_eq!(reply.remaining, 7);
    }

    #[tokio::test]
    async fn test_negative_remaining_inside_overhead() {
        let (store, sha) = store_with_script(ManualClock::new(START)).await;
        let config = WindowConfig::new(Unit::Second, 1, None, 2, Some(0.5)).unwrap();

        let replies: Vec<ScriptReply> = {
            let mut out = Vec::new();
            for _ in 0..4 {
                out.push(eval(&store, &sha, &config).await);
            }
            out
        };
        assert_eq!(
            replies.iter().map(|r| (r.allowed, r.remaining)).collect::<Vec<_>>(),
            vec![(true, 1), (true, 0), (true, -1), (false, -1)]
        );
        assert_eq!(store.entry_count("key"), 3);
    }

    #[tokio::test]
    async fn test_abandoned_keys_are_swept_on_next_evaluation() {
        let clock = ManualClock::new(START);
        let store = MemoryStore::with_clock(clock.clone());
        let sha = store.load_script(WINDOW_SCRIPT).await.unwrap();
        let args = WindowConfig::new(Unit::Second, 1, None, 5, None)
            .unwrap()
            .script_args()
            .to_args();

        for i in 0..1000 {
            let key = format!("client-{i}");
            store.eval_sha(&sha, &[key.as_str()], &args).await.unwrap();
        }
        assert_eq!(store.key_count(), 1000);

        clock.advance(Duration::from_secs(3600));
        store.eval_sha(&sha, &["late"], &args).await.unwrap();
        assert_eq!(store.key_count(), 1);
        assert_eq!(store.entry_count("late"), 1);
    }

    #[tokio::test]
    async fn test_purge_expired_keeps_live_keys() {
        let clock = ManualClock::new(START);
        let (store, sha) = store_with_script(clock.clone()).await;
        let short = WindowConfig::new(Unit::Second, 1, None, 5, None).unwrap();
        let long = WindowConfig::new(Unit::Minute, 1, None, 5, None).unwrap();

        store
            .eval_sha(&sha, &["short"], &short.script_args().to_args())
            .await
            .unwrap();
        store
            .eval_sha(&sha, &["long"], &long.script_args().to_args())
            .await
            .unwrap();

        clock.advance(Duration::from_secs(2));
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.key_count(), 1);
        assert_eq!(store.entry_count("long"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purger_reclaims_idle_keys() {
        let clock = ManualClock::new(START);
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let sha = store.load_script(WINDOW_SCRIPT).await.unwrap();
        let args = WindowConfig::new(Unit::Second, 1, None, 5, None)
            .unwrap()
            .script_args()
            .to_args();
        store.eval_sha(&sha, &["idle"], &args).await.unwrap();

        let purger = store.spawn_purger(Duration::from_secs(1));
        clock.advance(Duration::from_secs(5));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(store.key_count(), 0);

        drop(store);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(purger.is_finished());
    }
}
