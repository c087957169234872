use parking_lot::RwLock;

/// One captured binlog file. `size` counts committed bytes (magic header
/// included); `count` counts complete events written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinlogIndexEntry {
    pub name: String,
    pub size: u64,
    pub count: u64,
}

/// In-memory catalogue of the binlog files one upstream has captured.
///
/// Append-only: entries get a stable index on append; only the tail entry's
/// counters ever move, and only the relay's writer task moves them.
/// Downstream peers take shared access per lookup while tailing.
#[derive(Debug, Default)]
pub struct FileIndex {
    entries: RwLock<Vec<BinlogIndexEntry>>,
}

impl FileIndex {
    pub fn new() -> Self {
        FileIndex::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Writer side: start a new file. No-op if it is already the tail,
    /// which happens when a dump resumes into the file being written.
    pub fn append_file(&self, name: &str, size: u64) {
        let mut entries = self.entries.write();
        if entries.last().map(|e| e.name.as_str()) == Some(name) {
            return;
        }
        entries.push(BinlogIndexEntry {
            name: name.to_string(),
            size,
            count: 0,
        });
    }

    /// Writer side: commit `bytes` more bytes and `events` more complete
    /// events to the tail entry.
    pub fn grow_tail(&self, bytes: u64, events: u64) {
        let mut entries = self.entries.write();
        if let Some(tail) = entries.last_mut() {
            tail.size += bytes;
            tail.count += events;
        }
    }

    /// Where a resumed dump should continue: the tail file and its size.
    pub fn current_position(&self) -> Option<(String, u64)> {
        let entries = self.entries.read();
        entries.last().map(|e| (e.name.clone(), e.size))
    }

    pub fn find_index(&self, name: &str) -> Option<usize> {
        self.entries.read().iter().position(|e| e.name == name)
    }

    pub fn info_by_index(&self, index: usize) -> Option<BinlogIndexEntry> {
        self.entries.read().get(index).cloned()
    }

    pub fn is_tail(&self, index: usize) -> bool {
        let entries = self.entries.read();
        !entries.is_empty() && index == entries.len() - 1
    }

    pub fn entries_snapshot(&self) -> Vec<BinlogIndexEntry> {
        self.entries.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_grow_lookup() {
        let index = FileIndex::new();
        assert!(index.is_empty());
        assert_eq!(index.current_position(), None);

        index.append_file("log.000001", 4);
        index.grow_tail(99, 1);
        index.grow_tail(30, 1);
        assert_eq!(index.current_position(), Some(("log.000001".into(), 133)));

        index.append_file("log.000002", 4);
        assert_eq!(index.len(), 2);
        assert_eq!(index.find_index("log.000001"), Some(0));
        assert_eq!(index.find_index("log.000002"), Some(1));
        assert_eq!(index.find_index("log.000003"), None);
        assert!(index.is_tail(1));
        assert!(!index.is_tail(0));

        // the sealed entry keeps its final size
        let sealed = index.info_by_index(0).unwrap();
        assert_eq!(sealed.size, 133);
        assert_eq!(sealed.count, 2);
    }

    #[test]
    fn reappending_tail_is_a_noop() {
        let index = FileIndex::new();
        index.append_file("log.000001", 4);
        index.grow_tail(10, 1);
        index.append_file("log.000001", 4);
        assert_eq!(index.len(), 1);
        assert_eq!(index.current_position(), Some(("log.000001".into(), 14)));
    }

    #[test]
    fn tail_counters_are_monotonic() {
        let index = FileIndex::new();
        index.append_file("log.000001", 4);
        let mut last = 4;
        for step in [7u64, 1, 120, 33] {
            index.grow_tail(step, 1);
            let tail = index.info_by_index(0).unwrap();
            assert!(tail.size > last);
            last = tail.size;
        }
        assert_eq!(index.info_by_index(0).unwrap().count, 4);
    }
}
