use std::collections::HashSet;
use std::sync::Arc;

use gdrive_core::DriveFile;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::filter::IgnoreFilter;
use crate::ledger::{LedgerError, LedgerStore};
use crate::remote::store::{RemoteStore, StoreClient, StoreError};
use crate::report::{SkipReason, SyncEvent, SyncObserver};

const DEFAULT_MAX_DEPTH: usize = 256;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("source folder not found: {0}")]
    SourceNotFound(String),
    #[error("destination folder not found: {0}")]
    DestinationNotFound(String),
    #[error("{name} ({id}) is not a folder")]
    NotAFolder { id: String, name: String },
    #[error(transparent)]
    Remote(#[from] StoreError),
    #[error("ledger error: {0}")]
    LedgerRead(#[from] LedgerError),
    #[error("copied {file_id} but could not record it in the ledger: {source}")]
    Ledger {
        file_id: String,
        #[source]
        source: LedgerError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
    /// Compare against same-named files already in the destination folder.
    pub detect_duplicates: bool,
    pub max_depth: usize,
    /// Mirror into a folder named after the source instead of directly into
    /// the destination.
    pub nest_under_source_name: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            detect_duplicates: false,
            max_depth: DEFAULT_MAX_DEPTH,
            nest_under_source_name: false,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncStats {
    pub copied: u64,
    pub already_present: u64,
    pub ignored: u64,
    pub duplicates: u64,
    pub partials_replaced: u64,
    pub folders_ready: u64,
    pub folders_visited: u64,
    pub folders_skipped: u64,
}

/// A destination folder that may not exist yet.
struct DestNode {
    name: String,
    parent: Option<usize>,
    id: Option<String>,
    path: String,
}

/// One source folder being walked.
struct Frame {
    source_id: String,
    node: usize,
    path: String,
    depth: usize,
    pending: std::vec::IntoIter<DriveFile>,
}

/// Walk state. `nodes` only holds the destination chain of the frames on
/// `stack`: a frame's node and everything pushed after it go when it pops.
#[derive(Default)]
struct Walk {
    nodes: Vec<DestNode>,
    stack: Vec<Frame>,
    /// Destination folder ids resolved so far; the walk never enters them.
    destination_ids: HashSet<String>,
    stats: SyncStats,
}

impl Walk {
    fn resolve(&mut self, node: usize, id: String) {
        self.destination_ids.insert(id.clone());
        self.nodes[node].id = Some(id);
    }

    fn pop_frame(&mut self) {
        if let Some(frame) = self.stack.pop() {
            self.nodes.truncate(frame.node);
        }
    }
}

/// Mirrors a source folder tree into a destination folder, one remote call at
/// a time, in listing order.
pub struct TreeSynchronizer<S> {
    store: StoreClient<S>,
    ledger: LedgerStore,
    filter: IgnoreFilter,
    options: SyncOptions,
    observer: Arc<dyn SyncObserver>,
}

impl<S: RemoteStore> TreeSynchronizer<S> {
    pub fn new(
        store: StoreClient<S>,
        ledger: LedgerStore,
        filter: IgnoreFilter,
        options: SyncOptions,
        observer: Arc<dyn SyncObserver>,
    ) -> Self {
        Self {
            store,
            ledger,
            filter,
            options,
            observer,
        }
    }

    pub fn store(&self) -> &StoreClient<S> {
        &self.store
    }

    pub fn ledger(&self) -> &LedgerStore {
        &self.ledger
    }

    pub async fn run(&self, source_id: &str, destination_id: &str) -> Result<SyncStats, SyncError> {
        let roots = resolve_roots(&self.store, source_id, destination_id).await?;
        self.run_resolved(roots).await
    }

    /// Mirrors roots that [`resolve_roots`] already checked.
    pub async fn run_resolved(&self, roots: Roots) -> Result<SyncStats, SyncError> {
        let Roots {
            source,
            destination,
        } = roots;
        info!(
            source = %source.name,
            destination = %destination.name,
            "starting copy"
        );

        let mut walk = Walk::default();
        walk.nodes.push(DestNode {
            path: destination.name.clone(),
            name: destination.name,
            parent: None,
            id: None,
        });
        walk.resolve(0, destination.id);
        let mut root = 0;
        if self.options.nest_under_source_name {
            root = push_node(&mut walk.nodes, &source.name, root);
        }

        self.enter(&mut walk, source.id, root, source.name, 0).await?;

        loop {
            let Some(frame) = walk.stack.last_mut() else {
                break;
            };
            let Some(child) = frame.pending.next() else {
                walk.pop_frame();
                continue;
            };
            let (node, depth) = (frame.node, frame.depth);
            let path = format!("{}/{}", frame.path, child.name);

            if child.is_folder() {
                self.visit_folder(&mut walk, child, node, path, depth + 1)
                    .await?;
            } else {
                self.visit_file(&mut walk, &child, node, path).await?;
            }
        }

        info!(
            copied = walk.stats.copied,
            already_present = walk.stats.already_present,
            ignored = walk.stats.ignored,
            "copy finished"
        );
        Ok(walk.stats)
    }

    async fn enter(
        &self,
        walk: &mut Walk,
        source_id: String,
        node: usize,
        path: String,
        depth: usize,
    ) -> Result<(), SyncError> {
        info!(%path, "entering folder");
        self.observer
            .notify(&SyncEvent::FolderEntered { path: path.clone() });
        let children = self.store.list_children(&source_id).await?;
        walk.stats.folders_visited += 1;
        walk.stack.push(Frame {
            source_id,
            node,
            path,
            depth,
            pending: children.into_iter(),
        });
        Ok(())
    }

    async fn visit_folder(
        &self,
        walk: &mut Walk,
        folder: DriveFile,
        parent_node: usize,
        path: String,
        depth: usize,
    ) -> Result<(), SyncError> {
        let on_stack = walk.stack.iter().any(|frame| frame.source_id == folder.id);
        let is_destination = walk.destination_ids.contains(&folder.id);
        let reason = if on_stack || is_destination {
            Some(SkipReason::Cycle)
        } else if depth > self.options.max_depth {
            Some(SkipReason::DepthLimit)
        } else {
            None
        };
        if let Some(reason) = reason {
            warn!(%path, ?reason, "skipping folder");
            walk.stats.folders_skipped += 1;
            self.observer
                .notify(&SyncEvent::FolderSkipped { path, reason });
            return Ok(());
        }

        let node = push_node(&mut walk.nodes, &folder.name, parent_node);
        self.enter(walk, folder.id, node, path, depth).await
    }

    async fn visit_file(
        &self,
        walk: &mut Walk,
        file: &DriveFile,
        node: usize,
        path: String,
    ) -> Result<(), SyncError> {
        if self.ledger.exists(&file.id).await? {
            info!(%path, "already copied");
            walk.stats.already_present += 1;
            self.observer.notify(&SyncEvent::AlreadyPresent { path });
            return Ok(());
        }

        if self.filter.is_ignored(&file.name) {
            info!(%path, "ignored");
            walk.stats.ignored += 1;
            self.observer.notify(&SyncEvent::Ignored { path });
            return Ok(());
        }

        let mut replaced = false;
        if self.options.detect_duplicates
            && let Some(folder_id) = self.lookup_destination(walk, node).await?
            && let Some(existing) = self.store.find_by_name(&file.name, Some(folder_id.as_str())).await?
            && !existing.is_folder()
            && !existing.trashed
        {
            if existing.size == file.size {
                info!(%path, "duplicate at destination");
                walk.stats.duplicates += 1;
                self.observer.notify(&SyncEvent::Duplicate { path });
                return Ok(());
            }
            info!(
                %path,
                source_size = ?file.size,
                destination_size = ?existing.size,
                "trashing partial copy"
            );
            self.store.trash_file(&existing.id).await?;
            replaced = true;
        }

        let folder_id = self.ensure_destination(walk, node).await?;
        self.store.copy_file(file, &folder_id).await?;
        self.ledger
            .record(&file.id)
            .await
            .map_err(|source| SyncError::Ledger {
                file_id: file.id.clone(),
                source,
            })?;

        info!(%path, "copied");
        walk.stats.copied += 1;
        if replaced {
            walk.stats.partials_replaced += 1;
            self.observer.notify(&SyncEvent::PartialReplaced { path });
        } else {
            self.observer.notify(&SyncEvent::Copied { path });
        }
        Ok(())
    }

    /// Resolves `node` and any unresolved ancestors, creating folders top-down.
    async fn ensure_destination(&self, walk: &mut Walk, node: usize) -> Result<String, SyncError> {
        let (mut parent_id, chain) = unresolved_chain(&walk.nodes, node)?;
        for index in chain.into_iter().rev() {
            let folder = self
                .store
                .create_folder(&walk.nodes[index].name, Some(parent_id.as_str()))
                .await?;
            let path = walk.nodes[index].path.clone();
            debug!(%path, id = %folder.id, "destination folder ready");
            walk.stats.folders_ready += 1;
            self.observer.notify(&SyncEvent::FolderReady { path });
            walk.resolve(index, folder.id.clone());
            parent_id = folder.id;
        }
        Ok(parent_id)
    }

    /// Like [`Self::ensure_destination`] but never creates anything.
    async fn lookup_destination(
        &self,
        walk: &mut Walk,
        node: usize,
    ) -> Result<Option<String>, SyncError> {
        let (mut parent_id, chain) = unresolved_chain(&walk.nodes, node)?;
        for index in chain.into_iter().rev() {
            let found = self
                .store
                .find_by_name(&walk.nodes[index].name, Some(parent_id.as_str()))
                .await?;
            match found {
                Some(folder) if folder.is_folder() => {
                    walk.resolve(index, folder.id.clone());
                    parent_id = folder.id;
                }
                _ => return Ok(None),
            }
        }
        Ok(Some(parent_id))
    }
}

/// The source and destination folders of a run.
#[derive(Debug, Clone)]
pub struct Roots {
    pub source: DriveFile,
    pub destination: DriveFile,
}

/// Fetches both roots and checks that they exist and are folders.
pub async fn resolve_roots<S: RemoteStore>(
    store: &StoreClient<S>,
    source_id: &str,
    destination_id: &str,
) -> Result<Roots, SyncError> {
    let source = store
        .get_by_id(source_id)
        .await?
        .ok_or_else(|| SyncError::SourceNotFound(source_id.to_string()))?;
    ensure_folder(&source)?;
    let destination = store
        .get_by_id(destination_id)
        .await?
        .ok_or_else(|| SyncError::DestinationNotFound(destination_id.to_string()))?;
    ensure_folder(&destination)?;
    Ok(Roots {
        source,
        destination,
    })
}

fn ensure_folder(item: &DriveFile) -> Result<(), SyncError> {
    if item.is_folder() {
        Ok(())
    } else {
        Err(SyncError::NotAFolder {
            id: item.id.clone(),
            name: item.name.clone(),
        })
    }
}

fn push_node(nodes: &mut Vec<DestNode>, name: &str, parent: usize) -> usize {
    let path = format!("{}/{}", nodes[parent].path, name);
    nodes.push(DestNode {
        name: name.to_string(),
        parent: Some(parent),
        id: None,
        path,
    });
    nodes.len() - 1
}

/// Returns the nearest resolved ancestor id of `node` and the unresolved
/// nodes between them, nearest first.
fn unresolved_chain(nodes: &[DestNode], node: usize) -> Result<(String, Vec<usize>), SyncError> {
    let mut chain = Vec::new();
    let mut cursor = node;
    loop {
        let current = &nodes[cursor];
        if let Some(id) = &current.id {
            return Ok((id.clone(), chain));
        }
        chain.push(cursor);
        match current.parent {
            Some(parent) => cursor = parent,
            None => return Err(SyncError::DestinationNotFound(current.path.clone())),
        }
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
