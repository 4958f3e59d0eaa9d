//! 工作记忆：固定容量环形缓冲
//!
//! `Vec<Option<MemoryEntry>>` + 写游标 + 长度；写满后覆盖最旧的槽位，写入永远成功。
//! 单个 RwLock：写者独占，读者拿到一致快照。

use std::sync::RwLock;

use crate::memory::{MemoryEntry, MemoryQuery};

struct Ring {
    slots: Vec<Option<MemoryEntry>>,
    /// 下一次写入的位置
    cursor: usize,
    len: usize,
}

impl Ring {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity],
            cursor: 0,
            len: 0,
        }
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn push(&mut self, entry: MemoryEntry) {
        let cap = self.capacity();
        self.slots[self.cursor] = Some(entry);
        self.cursor = (self.cursor + 1) % cap;
        if self.len < cap {
            self.len += 1;
        }
    }

    /// 按插入顺序（最旧在前）迭代
    fn iter(&self) -> impl DoubleEndedIterator<Item = &MemoryEntry> + '_ {
        let cap = self.capacity();
        let start = (self.cursor + cap - self.len) % cap;
        (0..self.len).filter_map(move |i| self.slots[(start + i) % cap].as_ref())
    }
}

pub struct WorkingMemory {
    ring: RwLock<Ring>,
}

impl WorkingMemory {
    /// 容量至少为 1
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: RwLock::new(Ring::with_capacity(capacity.max(1))),
        }
    }

    pub fn capacity(&self) -> usize {
        self.read(|r| r.capacity())
    }

    pub fn len(&self) -> usize {
        self.read(|r| r.len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn add(&self, entry: MemoryEntry) {
        self.write(|r| r.push(entry));
    }

    pub fn get(&self, id: &str) -> Option<MemoryEntry> {
        self.read(|r| r.iter().find(|e| e.id == id).cloned())
    }

    /// 最近 n 条，按时间先后排列（最旧在前）
    pub fn get_recent(&self, n: usize) -> Vec<MemoryEntry> {
        self.read(|r| {
            let skip = r.len.saturating_sub(n);
            r.iter().skip(skip).cloned().collect()
        })
    }

    /// 全部条目，插入顺序
    pub fn snapshot(&self) -> Vec<MemoryEntry> {
        self.read(|r| r.iter().cloned().collect())
    }

    /// 匹配查询的条目，最新在前（不截断，由调用方合并后统一截断）
    pub fn query(&self, query: &MemoryQuery) -> Vec<MemoryEntry> {
        self.read(|r| r.iter().rev().filter(|e| query.matches(e)).cloned().collect())
    }

    pub fn clear(&self) {
        self.write(|r| {
            let cap = r.capacity();
            *r = Ring::with_capacity(cap);
        });
    }

    /// 用快照替换当前内容；超出容量时只保留最新的部分
    pub fn restore(&self, entries: Vec<MemoryEntry>) {
        self.write(|r| {
            let cap = r.capacity();
            let mut ring = Ring::with_capacity(cap);
            let skip = entries.len().saturating_sub(cap);
            for e in entries.into_iter().skip(skip) {
                ring.push(e);
            }
            *r = ring;
        });
    }

    fn read<T>(&self, f: impl FnOnce(&Ring) -> T) -> T {
        let guard = self.ring.read().unwrap_or_else(|e| e.into_inner());
        f(&guard)
    }

    fn write<T>(&self, f: impl FnOnce(&mut Ring) -> T) -> T {
        let mut guard = self.ring.write().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(n: usize) -> MemoryEntry {
        let mut e = MemoryEntry::new("note", json!(n));
        e.id = format!("e{n}");
        e
    }

    fn ids(entries: &[MemoryEntry]) -> Vec<String> {
        entries.iter().map(|e| e.id.clone()).collect()
    }

    #[test]
    fn test_eviction_keeps_latest_capacity_entries() {
        let wm = WorkingMemory::new(3);
        for i in 0..5 {
            wm.add(entry(i));
        }
        assert_eq!(wm.len(), 3);
        assert_eq!(ids(&wm.snapshot()), vec!["e2", "e3", "e4"]);
        assert!(wm.get("e0").is_none());
        assert!(wm.get("e4").is_some());
    }

    #[test]
    fn test_get_recent_is_chronological() {
        let wm = WorkingMemory::new(4);
        for i in 0..6 {
            wm.add(entry(i));
        }
        assert_eq!(ids(&wm.get_recent(2)), vec!["e4", "e5"]);
        assert_eq!(ids(&wm.get_recent(10)), vec!["e2", "e3", "e4", "e5"]);
        assert!(wm.get_recent(0).is_empty());
    }

    #[test]
    fn test_query_newest_first() {
        let wm = WorkingMemory::new(5);
        for i in 0..3 {
            wm.add(entry(i));
        }
        wm.add(MemoryEntry::new("other", json!("x")));
        let hits = wm.query(&MemoryQuery::new().with_kind("note"));
        assert_eq!(ids(&hits), vec!["e2", "e1", "e0"]);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let wm = WorkingMemory::new(0);
        wm.add(entry(1));
        wm.add(entry(2));
        assert_eq!(wm.capacity(), 1);
        assert_eq!(ids(&wm.snapshot()), vec!["e2"]);
    }

    #[test]
    fn test_restore_truncates_to_capacity() {
        let wm = WorkingMemory::new(2);
        wm.add(entry(9));
        wm.restore((0..4).map(entry).collect());
        assert_eq!(ids(&wm.snapshot()), vec!["e2", "e3"]);
        wm.add(entry(4));
        assert_eq!(ids(&wm.snapshot()), vec!["e3", "e4"]);
        wm.clear();
        assert!(wm.is_empty());
    }
}
