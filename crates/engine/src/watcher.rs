//! Filesystem invalidation source (notify watcher).
//!
//! Translates filesystem events under watched roots into node invalidation:
//! leaf nodes keyed on a changed path are cleared, and their dependents are
//! flagged for lazy re-check. Explicit invalidation (for callers with their
//! own change feed) goes through [`crate::Scheduler::invalidate_path`].

use std::path::Path;
use std::sync::Arc;

use notify::event::{CreateKind, ModifyKind, RemoveKind};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, warn};

use crate::context::EngineCore;
use crate::error::EngineError;
use crate::scheduler::Scheduler;

/// Keeps the underlying watcher alive; dropping it stops invalidation.
pub struct InvalidationWatcher {
    _watcher: RecommendedWatcher,
}

impl Scheduler {
    /// Watch a directory tree and invalidate affected leaf nodes on change.
    pub fn watch(&self, root: &Path) -> Result<InvalidationWatcher, EngineError> {
        let core = self.core.clone();
        let mut watcher = notify::recommended_watcher(move |event: notify::Result<Event>| {
            match event {
                Ok(event) => handle_fs_event(&core, &event),
                Err(e) => warn!(error = %e, "filesystem watch error"),
            }
        })
        .map_err(|e| EngineError::Watch(e.to_string()))?;

        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(|e| EngineError::Watch(e.to_string()))?;
        debug!(root = %root.display(), "watching for invalidation");

        Ok(InvalidationWatcher { _watcher: watcher })
    }
}

/// Handle a single filesystem event from the notify watcher.
fn handle_fs_event(core: &Arc<EngineCore>, event: &Event) {
    let relevant = matches!(
        event.kind,
        EventKind::Create(CreateKind::File)
            | EventKind::Modify(ModifyKind::Data(_))
            | EventKind::Modify(ModifyKind::Name(_))
            | EventKind::Remove(RemoveKind::File)
            | EventKind::Any
    );
    if !relevant {
        return;
    }

    for path in &event.paths {
        // Skip editor droppings and other dotfiles.
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            if name.starts_with('.') {
                continue;
            }
        }
        let result = core.graph.invalidate_from_roots(|node| node.is_keyed_on(path));
        if result.cleared > 0 || result.dirtied > 0 {
            debug!(
                path = %path.display(),
                cleared = result.cleared,
                dirtied = result.dirtied,
                "filesystem change invalidated nodes"
            );
        }
    }
}
