// Shared fixtures for the integration and stress tests
#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use delivery_ops::core::model::{FOLDER_MIME_TYPE, RemoteEntry, RemoteFile, RemoteFolder};
use delivery_ops::services::drive::{RemoteStorage, StorageConnector};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Metadata,
    List,
    /// Keyed by the name of the folder being created.
    Create,
    /// Keyed by the id of the file being copied.
    Copy,
}

#[derive(Debug, Clone)]
struct Node {
    name: String,
    mime_type: String,
    parent: Option<String>,
}

#[derive(Default)]
struct State {
    nodes: HashMap<String, Node>,
    /// Insertion order, so listings are stable.
    order: Vec<String>,
    next_id: u64,
    failures: HashMap<(Op, String), String>,
}

/// Folder/file shape of a subtree, names only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shape {
    pub name: String,
    pub files: Vec<String>,
    pub folders: Vec<Shape>,
}

/// In-memory remote storage with failure injection and request accounting.
#[derive(Default)]
pub struct MemoryDrive {
    state: Mutex<State>,
    latency: Option<Duration>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    calls: AtomicUsize,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryDrive {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_latency(latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            latency: Some(latency),
            ..Self::default()
        })
    }

    fn insert(&self, parent: Option<&str>, name: &str, mime_type: &str) -> String {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("node{}", state.next_id);
        state.nodes.insert(
            id.clone(),
            Node {
                name: name.to_string(),
                mime_type: mime_type.to_string(),
                parent: parent.map(str::to_string),
            },
        );
        state.order.push(id.clone());
        id
    }

    pub fn add_folder(&self, parent: Option<&str>, name: &str) -> String {
        self.insert(parent, name, FOLDER_MIME_TYPE)
    }

    pub fn add_file(&self, parent: &str, name: &str) -> String {
        self.insert(Some(parent), name, "text/plain")
    }

    pub fn fail(&self, op: Op, key: &str, message: &str) {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert((op, key.to_string()), message.to_string());
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn parent_of(&self, id: &str) -> Option<String> {
        let state = self.state.lock().unwrap();
        state.nodes.get(id).and_then(|n| n.parent.clone())
    }

    /// `(id, name, is_folder)` for each child, in insertion order.
    pub fn children(&self, parent: &str) -> Vec<(String, String, bool)> {
        let state = self.state.lock().unwrap();
        state
            .order
            .iter()
            .filter_map(|id| {
                let node = &state.nodes[id];
                (node.parent.as_deref() == Some(parent)).then(|| {
                    (
                        id.clone(),
                        node.name.clone(),
                        node.mime_type == FOLDER_MIME_TYPE,
                    )
                })
            })
            .collect()
    }

    pub fn child_named(&self, parent: &str, name: &str) -> Option<String> {
        self.children(parent)
            .into_iter()
            .find(|(_, n, _)| n == name)
            .map(|(id, _, _)| id)
    }

    pub fn shape(&self, id: &str) -> Shape {
        let name = self.state.lock().unwrap().nodes[id].name.clone();
        let mut files = Vec::new();
        let mut folders = Vec::new();
        for (child, child_name, is_folder) in self.children(id) {
            if is_folder {
                folders.push(self.shape(&child));
            } else {
                files.push(child_name);
            }
        }
        files.sort();
        folders.sort_by(|a, b| a.name.cmp(&b.name));
        Shape {
            name,
            files,
            folders,
        }
    }

    async fn enter(&self) -> InFlight<'_> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let guard = InFlight(&self.in_flight);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        } else {
            tokio::task::yield_now().await;
        }
        guard
    }

    fn injected(&self, op: Op, key: &str) -> Result<()> {
        match self.state.lock().unwrap().failures.get(&(op, key.to_string())) {
            Some(message) => anyhow::bail!("{}", message),
            None => Ok(()),
        }
    }

    fn folder(&self, id: &str) -> Result<RemoteFolder> {
        let state = self.state.lock().unwrap();
        let node = state
            .nodes
            .get(id)
            .ok_or_else(|| anyhow::anyhow!("File not found: {}. (HTTP 404)", id))?;
        Ok(RemoteFolder {
            id: id.to_string(),
            name: node.name.clone(),
            mime_type: node.mime_type.clone(),
            parent_ids: node.parent.iter().cloned().collect(),
        })
    }
}

#[async_trait]
impl RemoteStorage for MemoryDrive {
    async fn get_metadata(&self, id: &str) -> Result<RemoteFolder> {
        let _call = self.enter().await;
        self.injected(Op::Metadata, id)?;
        self.folder(id)
    }

    async fn list_children(&self, parent_id: &str) -> Result<Vec<RemoteEntry>> {
        let _call = self.enter().await;
        self.injected(Op::List, parent_id)?;
        let entries = self
            .children(parent_id)
            .into_iter()
            .map(|(id, name, is_folder)| {
                if is_folder {
                    RemoteEntry::Folder(RemoteFolder {
                        id,
                        name,
                        mime_type: FOLDER_MIME_TYPE.to_string(),
                        parent_ids: vec![parent_id.to_string()],
                    })
                } else {
                    RemoteEntry::File(RemoteFile {
                        id,
                        name,
                        mime_type: "text/plain".to_string(),
                        size: Some(1),
                    })
                }
            })
            .collect();
        Ok(entries)
    }

    async fn create_folder(&self, name: &str, parent_id: Option<&str>) -> Result<RemoteFolder> {
        let _call = self.enter().await;
        self.injected(Op::Create, name)?;
        let id = self.add_folder(parent_id, name);
        self.folder(&id)
    }

    async fn copy_file(&self, id: &str, dest_parent_id: &str) -> Result<RemoteFile> {
        let _call = self.enter().await;
        self.injected(Op::Copy, id)?;
        let source = self.folder(id)?;
        let copy = self.insert(Some(dest_parent_id), &source.name, &source.mime_type);
        Ok(RemoteFile {
            id: copy,
            name: source.name,
            mime_type: source.mime_type,
            size: Some(1),
        })
    }
}

pub struct MemoryConnector(pub Arc<MemoryDrive>);

impl StorageConnector for MemoryConnector {
    fn connect(&self, token: &str) -> Result<Arc<dyn RemoteStorage>> {
        if token.is_empty() {
            anyhow::bail!("Drive token is empty");
        }
        Ok(self.0.clone())
    }
}

pub fn folder_url(id: &str) -> String {
    format!("https://drive.google.com/drive/folders/{}", id)
}

/// Adds `name` under `parent` with `files` files and `fanout` subfolders per
/// level, `depth` levels deep.
pub fn build_tree(
    drive: &MemoryDrive,
    parent: Option<&str>,
    name: &str,
    depth: usize,
    fanout: usize,
    files: usize,
) -> String {
    let id = drive.add_folder(parent, name);
    for i in 0..files {
        drive.add_file(&id, &format!("{}-file{}.txt", name, i));
    }
    if depth > 0 {
        for i in 0..fanout {
            build_tree(drive, Some(&id), &format!("{}-{}", name, i), depth - 1, fanout, files);
        }
    }
    id
}
