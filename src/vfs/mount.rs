//! Per-container mount namespaces
//!
//! A mount namespace is a rooted tree of mounts. Mounts live in an arena;
//! cross-references are `(index, generation)` pairs validated on every
//! dereference, so a stale id can never reach a recycled slot. Namespaces
//! are explicitly reference-counted: a handle must be incremented before it
//! becomes visible to an init process and decremented on release.

use crate::{
    errors::VfsError,
    sync::{ClassMutex, CLASS_MOUNT_NS},
};
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

/// Connection parameters for a gofer-style mount source. The gofer itself
/// is an external collaborator; only the descriptor numbers are recorded.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct GoferConf {
    pub rfdno: i32,
    pub wfdno: i32,
}

impl GoferConf {
    pub fn mount_data(&self) -> String {
        format!("trans=fd,rfdno={},wfdno={}", self.rfdno, self.wfdno)
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct MountOptions {
    pub read_only: bool,
    pub data: String,
    pub internal: bool,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum Propagation {
    #[default]
    Private,
    Slave,
    Shared,
}

/// Arena reference to a mount; validated against the slot generation.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct MountId {
    index: usize,
    generation: u64,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MountInfo {
    pub destination: PathBuf,
    pub fstype: String,
    pub source: String,
    pub options: MountOptions,
    pub propagation: Propagation,
    pub parent: Option<MountId>,
}

struct MountNode {
    info: MountInfo,
    children: Vec<MountId>,
}

struct MountSlot {
    generation: u64,
    node: Option<MountNode>,
}

struct Tree {
    slots: Vec<MountSlot>,
    root: Option<MountId>,
}

impl Tree {
    fn node(&self, id: MountId) -> Option<&MountNode> {
        self.slots
            .get(id.index)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_ref())
    }

    fn insert(&mut self, node: MountNode) -> MountId {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.node.is_none() {
                slot.node = Some(node);
                return MountId {
                    index,
                    generation: slot.generation,
                };
            }
        }
        self.slots.push(MountSlot {
            generation: 0,
            node: Some(node),
        });
        MountId {
            index: self.slots.len() - 1,
            generation: 0,
        }
    }
}

struct NsShared {
    owner: String,
    refs: AtomicU64,
    tree: ClassMutex<Tree>,
}

/// A per-container view of the filesystem.
#[derive(Clone)]
pub struct MountNamespace {
    shared: Arc<NsShared>,
}

impl MountNamespace {
    /// An empty namespace with no root mount.
    pub fn new(owner: &str) -> MountNamespace {
        MountNamespace {
            shared: Arc::new(NsShared {
                owner: owner.to_string(),
                refs: AtomicU64::new(1),
                tree: ClassMutex::new(
                    &CLASS_MOUNT_NS,
                    Tree {
                        slots: Vec::new(),
                        root: None,
                    },
                ),
            }),
        }
    }

    /// A namespace whose root mount is readonly over a gofer-style source.
    pub fn new_gofer_root(owner: &str, fstype: &str, gofer: &GoferConf) -> MountNamespace {
        let ns = MountNamespace::new(owner);
        {
            let mut tree = ns.shared.tree.lock();
            let id = tree.insert(MountNode {
                info: MountInfo {
                    destination: PathBuf::from("/"),
                    fstype: fstype.to_string(),
                    source: String::new(),
                    options: MountOptions {
                        read_only: true,
                        data: gofer.mount_data(),
                        internal: true,
                    },
                    propagation: Propagation::Private,
                    parent: None,
                },
                children: Vec::new(),
            });
            tree.root = Some(id);
        }
        log::debug!(
            "created mount namespace for {:?} over {} ({})",
            owner,
            fstype,
            gofer.mount_data()
        );
        ns
    }

    pub fn owner(&self) -> &str {
        &self.shared.owner
    }

    pub fn root(&self) -> Option<MountId> {
        self.shared.tree.lock().root
    }

    /// Attaches a mount beneath the deepest existing mount whose
    /// destination prefixes `destination`. The first mount into an empty
    /// namespace becomes its root.
    pub fn mount(
        &self,
        destination: &Path,
        fstype: &str,
        source: &str,
        options: MountOptions,
        propagation: Propagation,
    ) -> Result<MountId, VfsError> {
        let mut tree = self.shared.tree.lock();
        if tree.root.is_none() {
            let id = tree.insert(MountNode {
                info: MountInfo {
                    destination: destination.to_path_buf(),
                    fstype: fstype.to_string(),
                    source: source.to_string(),
                    options,
                    propagation,
                    parent: None,
                },
                children: Vec::new(),
            });
            tree.root = Some(id);
            return Ok(id);
        }
        let parent = deepest_covering(&tree, destination)
            .ok_or_else(|| VfsError::NoSuchMount(destination.to_path_buf()))?;
        let id = tree.insert(MountNode {
            info: MountInfo {
                destination: destination.to_path_buf(),
                fstype: fstype.to_string(),
                source: source.to_string(),
                options,
                propagation,
                parent: Some(parent),
            },
            children: Vec::new(),
        });
        if let Some(slot) = tree.slots.get_mut(parent.index) {
            if let Some(node) = slot.node.as_mut() {
                node.children.push(id);
            }
        }
        log::debug!("mounted {} at {:?} in {:?}", fstype, destination, self.shared.owner);
        Ok(id)
    }

    /// Detaches a leaf mount. The slot generation advances so stale ids
    /// fail validation.
    pub fn unmount(&self, id: MountId) -> Result<(), VfsError> {
        let mut tree = self.shared.tree.lock();
        let node = tree
            .node(id)
            .ok_or_else(|| VfsError::NoSuchMount(PathBuf::from("<stale>")))?;
        if !node.children.is_empty() {
            return Err(VfsError::NotPermitted);
        }
        let parent = node.info.parent;
        let slot = &mut tree.slots[id.index];
        slot.node = None;
        slot.generation += 1;
        if let Some(parent) = parent {
            if let Some(node) = tree.slots[parent.index].node.as_mut() {
                node.children.retain(|child| *child != id);
            }
        }
        if tree.root == Some(id) {
            tree.root = None;
        }
        Ok(())
    }

    pub fn get(&self, id: MountId) -> Result<MountInfo, VfsError> {
        let tree = self.shared.tree.lock();
        tree.node(id)
            .map(|node| node.info.clone())
            .ok_or_else(|| VfsError::NoSuchMount(PathBuf::from("<stale>")))
    }

    /// The mount whose destination covers `path` most deeply.
    pub fn lookup(&self, path: &Path) -> Option<MountId> {
        let tree = self.shared.tree.lock();
        deepest_covering(&tree, path)
    }

    /// All live mounts, parents before children.
    pub fn mounts(&self) -> Vec<MountInfo> {
        let tree = self.shared.tree.lock();
        let mut out = Vec::new();
        let mut stack: Vec<MountId> = tree.root.into_iter().collect();
        while let Some(id) = stack.pop() {
            if let Some(node) = tree.node(id) {
                out.push(node.info.clone());
                stack.extend(node.children.iter().rev());
            }
        }
        out
    }

    pub fn inc_ref(&self) -> Result<(), VfsError> {
        let prior = self.shared.refs.fetch_add(1, Ordering::SeqCst);
        if prior == 0 || prior >= i64::MAX as u64 {
            self.shared.refs.fetch_sub(1, Ordering::SeqCst);
            return Err(VfsError::RefCountOverflow);
        }
        Ok(())
    }

    /// Drops one reference; the last one tears the tree down.
    pub fn dec_ref(&self) {
        let prior = self.shared.refs.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prior > 0, "mount namespace over-released");
        if prior == 1 {
            let mut tree = self.shared.tree.lock();
            for slot in &mut tree.slots {
                slot.node = None;
                slot.generation += 1;
            }
            tree.root = None;
            log::debug!("mount namespace for {:?} released", self.shared.owner);
        }
    }

    pub fn ref_count(&self) -> u64 {
        self.shared.refs.load(Ordering::SeqCst)
    }

    pub fn save(&self) -> SavedMountNamespace {
        SavedMountNamespace {
            owner: self.shared.owner.clone(),
            mounts: self
                .mounts()
                .into_iter()
                .map(|info| SavedMount {
                    destination: info.destination,
                    fstype: info.fstype,
                    source: info.source,
                    options: info.options,
                    propagation: info.propagation,
                })
                .collect(),
        }
    }

    /// Rebuilds the tree by replaying mounts, parents first.
    pub fn restore(saved: &SavedMountNamespace) -> Result<MountNamespace, VfsError> {
        let mut mounts = saved.mounts.iter();
        let ns = match mounts.next() {
            None => MountNamespace::new(&saved.owner),
            Some(root) => {
                let ns = MountNamespace::new(&saved.owner);
                let mut tree = ns.shared.tree.lock();
                let id = tree.insert(MountNode {
                    info: MountInfo {
                        destination: root.destination.clone(),
                        fstype: root.fstype.clone(),
                        source: root.source.clone(),
                        options: root.options.clone(),
                        propagation: root.propagation,
                        parent: None,
                    },
                    children: Vec::new(),
                });
                tree.root = Some(id);
                drop(tree);
                ns
            }
        };
        for mount in mounts {
            ns.mount(
                &mount.destination,
                &mount.fstype,
                &mount.source,
                mount.options.clone(),
                mount.propagation,
            )?;
        }
        Ok(ns)
    }
}

impl std::fmt::Debug for MountNamespace {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("MountNamespace")
            .field("owner", &self.shared.owner)
            .field("refs", &self.ref_count())
            .field("mounts", &self.mounts().len())
            .finish()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SavedMountNamespace {
    pub owner: String,
    pub mounts: Vec<SavedMount>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SavedMount {
    pub destination: PathBuf,
    pub fstype: String,
    pub source: String,
    pub options: MountOptions,
    pub propagation: Propagation,
}

fn deepest_covering(tree: &Tree, path: &Path) -> Option<MountId> {
    let mut best: Option<(usize, MountId)> = None;
    let mut stack: Vec<MountId> = tree.root.into_iter().collect();
    while let Some(id) = stack.pop() {
        if let Some(node) = tree.node(id) {
            if path.starts_with(&node.info.destination) {
                let depth = node.info.destination.components().count();
                if best.map(|(d, _)| depth >= d).unwrap_or(true) {
                    best = Some((depth, id));
                }
            }
            stack.extend(node.children.iter());
        }
    }
    best.map(|(_, id)| id)
}
