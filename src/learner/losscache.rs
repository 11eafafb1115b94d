// ── losscache.rs ────────────────────────────────────────────────────────────

use std::cell::RefCell;
use std::collections::HashMap;
use std::hash::Hash;

use tracing::trace;

/// 以版本號失效的 loss 快取。
///
/// # Cache key 設計：(key, version)
///
/// 每個 learner 持有一個單調遞增的 `version`，任何會改變資料的呼叫
/// （`tell` / `tell_pending` / `forget_pending` / `ask`）都會 `+1`。
/// 快取條目記下計算當時的 version，查詢時 version 不同即視為過期並重算。
///
/// 好處：
/// - 失效是結構性的：不需要在每個 mutating path 手動清快取
/// - 不同 key（例如 `real = true` 與 `real = false`）各自獨立，
///   先查哪一個都不會影響另一個的結果
pub struct LossCache<K> {
    inner: RefCell<HashMap<K, (u64, f64)>>,
}

impl<K> LossCache<K>
where
    K: Copy + Eq + Hash,
{
    pub fn new() -> Self {
        Self {
            inner: RefCell::new(HashMap::new()),
        }
    }

    /// Returns the cached value if it was computed against `version`.
    pub fn peek(&self, key: K, version: u64) -> Option<f64> {
        self.inner
            .borrow()
            .get(&key)
            .filter(|(stamp, _)| *stamp == version)
            .map(|(_, value)| *value)
    }

    pub fn get_or_compute(&self, key: K, version: u64, compute: impl FnOnce() -> f64) -> f64 {
        if let Some(value) = self.peek(key, version) {
            return value;
        }

        // 持借用外計算，compute 內可安全地查詢其他快取
        let value = compute();
        trace!(version, value, "loss cache recomputed");
        self.inner.borrow_mut().insert(key, (version, value));
        value
    }

    pub fn clear(&self) {
        self.inner.borrow_mut().clear();
    }
}

impl<K> Default for LossCache<K>
where
    K: Copy + Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Clone for LossCache<K>
where
    K: Copy + Eq + Hash,
{
    fn clone(&self) -> Self {
        Self {
            inner: RefCell::new(self.inner.borrow().clone()),
        }
    }
}
