//! Diff planning for in-place edits
//!
//! Old and new contents are compared window by window at the file's chunk
//! size. Only windows that differ are rewritten; chunks past the new end are
//! dropped and bytes past the old chunk range are appended as new chunks.
//! The diff is positional: an insertion in the middle of a file shifts every
//! later window and rewrites all of them.

use std::ops::Range;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditKind {
    /// Same length, same bytes
    Unchanged,
    /// Same length, some windows differ
    Replace,
    /// New content is shorter
    Shrink,
    /// New content is longer
    Grow,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditPlan {
    pub kind: EditKind,
    /// Existing chunk index and the window of new content it now holds
    pub rewrites: Vec<(usize, Range<usize>)>,
    /// Existing chunk indexes that start at or past the new end
    pub deletions: Vec<usize>,
    /// Window of new content to append as fresh chunks
    pub append: Option<Range<usize>>,
}

impl EditPlan {
    /// Plan the edit of a file currently stored as `old_chunks` chunks of
    /// `chunk_size` bytes (the last possibly shorter).
    pub fn compute(old: &[u8], new: &[u8], chunk_size: usize, old_chunks: usize) -> Self {
        let kind = match new.len().cmp(&old.len()) {
            std::cmp::Ordering::Equal if new == old => EditKind::Unchanged,
            std::cmp::Ordering::Equal => EditKind::Replace,
            std::cmp::Ordering::Less => EditKind::Shrink,
            std::cmp::Ordering::Greater => EditKind::Grow,
        };
        if kind == EditKind::Unchanged {
            return Self {
                kind,
                rewrites: Vec::new(),
                deletions: Vec::new(),
                append: None,
            };
        }

        let chunk_size = chunk_size.max(1);
        let new_chunks = new.len().div_ceil(chunk_size);
        let window = |len: usize, index: usize| {
            let start = (index * chunk_size).min(len);
            start..((index + 1) * chunk_size).min(len)
        };

        // A short old tail differs in length from a full new window, so it
        // is topped up here before anything is appended.
        let rewrites = (0..old_chunks.min(new_chunks))
            .map(|i| (i, window(old.len(), i), window(new.len(), i)))
            .filter(|(_, old_win, new_win)| old[old_win.clone()] != new[new_win.clone()])
            .map(|(i, _, new_win)| (i, new_win))
            .collect();

        let deletions = (new_chunks..old_chunks).collect();

        let append = (new_chunks > old_chunks).then(|| (old_chunks * chunk_size)..new.len());

        Self {
            kind,
            rewrites,
            deletions,
            append,
        }
    }

    pub fn is_noop(&self) -> bool {
        self.rewrites.is_empty() && self.deletions.is_empty() && self.append.is_none()
    }
}
