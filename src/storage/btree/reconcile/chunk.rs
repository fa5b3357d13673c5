//! Splitting a page's cells into page-sized chunks.

use crate::types::page::PAGE_HDR_LEN;

/// One chunk: entries with their encoded sizes.
#[derive(Debug)]
pub(crate) struct Chunk<E> {
    pub entries: Vec<(E, usize)>,
    pub size: usize,
}

impl<E> Chunk<E> {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            size: PAGE_HDR_LEN,
        }
    }

    fn has_cells(&self) -> bool {
        self.size > PAGE_HDR_LEN
    }
}

/// Accumulates entries into chunks no larger than the split size.
///
/// Zero-sized entries (keys that only carry saved updates) never open a new
/// chunk; they stay with the cells around them.
#[derive(Debug)]
pub(crate) struct Chunker<E> {
    split: usize,
    min_split: usize,
    page_max: usize,
    done: Vec<Chunk<E>>,
    cur: Chunk<E>,
}

impl<E> Chunker<E> {
    pub(crate) fn new(page_max: usize, split: usize, min_split: usize) -> Self {
        Self {
            split,
            min_split,
            page_max,
            done: Vec::new(),
            cur: Chunk::new(),
        }
    }

    pub(crate) fn push(&mut self, entry: E, size: usize) {
        if size > 0 && self.cur.has_cells() && self.cur.size + size > self.split {
            let full = std::mem::replace(&mut self.cur, Chunk::new());
            self.done.push(full);
        }
        self.cur.size += size;
        self.cur.entries.push((entry, size));
    }

    /// Closes the last chunk and rebalances it against its predecessor.
    ///
    /// A last chunk below the minimum split size is merged into the
    /// previous one when both fit in a page; otherwise entries move from
    /// the tail of the previous chunk until the last one reaches the
    /// minimum or the previous one would drop below it.
    pub(crate) fn finish(mut self) -> Vec<Chunk<E>> {
        if !self.cur.entries.is_empty() {
            self.done.push(std::mem::replace(&mut self.cur, Chunk::new()));
        }
        let mut chunks = self.done;
        if chunks.len() < 2 {
            return chunks;
        }
        let last_idx = chunks.len() - 1;
        if chunks[last_idx].size >= self.min_split {
            return chunks;
        }
        let combined = chunks[last_idx - 1].size + chunks[last_idx].size - PAGE_HDR_LEN;
        if combined <= self.page_max {
            if let Some(last) = chunks.pop() {
                if let Some(prev) = chunks.last_mut() {
                    prev.size = combined;
                    prev.entries.extend(last.entries);
                }
            }
            return chunks;
        }
        let (head, tail) = chunks.split_at_mut(last_idx);
        let prev = &mut head[last_idx - 1];
        let last = &mut tail[0];
        let mut moved = Vec::new();
        while last.size < self.min_split {
            let Some(&(_, size)) = prev.entries.last() else {
                break;
            };
            if prev.entries.len() == 1 || prev.size - size < self.min_split {
                break;
            }
            if let Some(entry) = prev.entries.pop() {
                prev.size -= size;
                last.size += size;
                moved.push(entry);
            }
        }
        if !moved.is_empty() {
            moved.reverse();
            moved.append(&mut last.entries);
            last.entries = moved;
        }
        chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizes<E>(chunks: &[Chunk<E>]) -> Vec<usize> {
        chunks.iter().map(|c| c.size - PAGE_HDR_LEN).collect()
    }

    #[test]
    fn splits_at_split_size() {
        let mut chunker = Chunker::new(1000, 300 + PAGE_HDR_LEN, 0);
        for i in 0..10 {
            chunker.push(i, 100);
        }
        let chunks = chunker.finish();
        assert_eq!(sizes(&chunks), vec![300, 300, 300, 100]);
        assert_eq!(chunks[3].entries[0].0, 9);
    }

    #[test]
    fn small_tail_merges_when_it_fits() {
        let mut chunker = Chunker::new(500, 300 + PAGE_HDR_LEN, 150 + PAGE_HDR_LEN);
        for i in 0..4 {
            chunker.push(i, 100);
        }
        let chunks = chunker.finish();
        assert_eq!(sizes(&chunks), vec![400]);
    }

    #[test]
    fn small_tail_borrows_from_predecessor() {
        let mut chunker = Chunker::new(350, 300 + PAGE_HDR_LEN, 150 + PAGE_HDR_LEN);
        for i in 0..7 {
            chunker.push(i, 50);
        }
        chunker.push(7, 50);
        let chunks = chunker.finish();
        // 300 + 100 would not fit a 350 page; one entry moves over instead.
        assert_eq!(sizes(&chunks), vec![250, 150]);
        let keys: Vec<i32> = chunks[1].entries.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec![5, 6, 7]);
    }

    #[test]
    fn zero_sized_entries_stay_in_current_chunk() {
        let mut chunker = Chunker::new(1000, 100 + PAGE_HDR_LEN, 0);
        chunker.push("a", 100);
        chunker.push("saved", 0);
        chunker.push("b", 100);
        let chunks = chunker.finish();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].entries.len(), 2);
    }
}
