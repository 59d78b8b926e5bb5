// Visualization linking - synchronised hover/zoom across chart instances
use crate::domain::time_span::TimeSpan;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// Opaque identity of a mounted chart engine instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ChartInstanceHandle(u64);

impl ChartInstanceHandle {
    pub fn allocate() -> Self {
        Self(NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Interaction {
    Hover { at: DateTime<Utc> },
    HoverEnd,
    Zoom { span: TimeSpan },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum LinkStatus {
    Pending { live: usize, expected: usize },
    Linked { group: String, members: usize },
}

/// Links chart instances of one dashboard once all of them are mounted.
#[derive(Debug)]
pub struct ChartLinker {
    group: String,
    expected: usize,
    linked: Vec<ChartInstanceHandle>,
}

impl ChartLinker {
    pub fn new(group: impl Into<String>, expected: usize) -> Self {
        Self {
            group: group.into(),
            expected,
            linked: Vec::new(),
        }
    }

    /// Recompute links after a mount or unmount. Cheap and idempotent.
    pub fn relink(&mut self, live: impl IntoIterator<Item = ChartInstanceHandle>) -> LinkStatus {
        let mut live: Vec<ChartInstanceHandle> = live.into_iter().collect();
        live.sort_unstable();
        live.dedup();

        if self.expected == 0 || live.len() != self.expected {
            if !self.linked.is_empty() {
                tracing::debug!(group = %self.group, "Unlinking charts");
                self.linked.clear();
            }
            return LinkStatus::Pending {
                live: live.len(),
                expected: self.expected,
            };
        }

        if self.linked != live {
            tracing::debug!(group = %self.group, members = live.len(), "Linking charts");
            self.linked = live;
        }
        self.status()
    }

    pub fn status(&self) -> LinkStatus {
        if self.linked.is_empty() {
            LinkStatus::Pending {
                live: 0,
                expected: self.expected,
            }
        } else {
            LinkStatus::Linked {
                group: self.group.clone(),
                members: self.linked.len(),
            }
        }
    }

    /// Siblings that should mirror an interaction on `source`; empty until linked.
    pub fn fan_out(&self, source: ChartInstanceHandle) -> Vec<ChartInstanceHandle> {
        if !self.linked.contains(&source) {
            return Vec::new();
        }
        self.linked
            .iter()
            .copied()
            .filter(|handle| *handle != source)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_link_until_all_present() {
        let handles: Vec<_> = (0..3).map(|_| ChartInstanceHandle::allocate()).collect();
        let mut linker = ChartLinker::new("dash", 3);

        assert_eq!(
            linker.relink(handles[..2].iter().copied()),
            LinkStatus::Pending { live: 2, expected: 3 }
        );
        assert!(linker.fan_out(handles[0]).is_empty());

        let status = linker.relink(handles.iter().copied());
        assert_eq!(status, LinkStatus::Linked { group: "dash".to_string(), members: 3 });
        assert_eq!(linker.fan_out(handles[1]), vec![handles[0], handles[2]]);

        // Idempotent.
        assert_eq!(linker.relink(handles.iter().rev().copied()), status);
    }

    #[test]
    fn test_unmount_unlinks() {
        let handles: Vec<_> = (0..2).map(|_| ChartInstanceHandle::allocate()).collect();
        let mut linker = ChartLinker::new("dash", 2);
        linker.relink(handles.iter().copied());
        linker.relink([handles[0]]);
        assert!(linker.fan_out(handles[0]).is_empty());
    }

    #[test]
    fn test_zero_charts_never_link() {
        let mut linker = ChartLinker::new("empty", 0);
        assert_eq!(linker.relink([]), LinkStatus::Pending { live: 0, expected: 0 });
    }
}
