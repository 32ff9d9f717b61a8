//! Name-to-constructor registry of I/O classes.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use super::{DefaultGroupIo, DefaultNodeIo, GroupEnv, GroupIo, NodeEnv, NodeIo, TransportGroupIo};
use crate::error::{ArchiveError, ArchiveResult};
use crate::types::DEFAULT_IO_CLASS;

/// Builds node I/O for a node.
pub type NodeIoFactory = Arc<dyn Fn(NodeEnv) -> ArchiveResult<Arc<dyn NodeIo>> + Send + Sync>;

/// Builds group I/O for a group.
pub type GroupIoFactory = Arc<dyn Fn(GroupEnv) -> ArchiveResult<Arc<dyn GroupIo>> + Send + Sync>;

/// Registered I/O classes.
#[derive(Clone)]
pub struct IoRegistry {
    node_classes: HashMap<String, NodeIoFactory>,
    group_classes: HashMap<String, GroupIoFactory>,
}

impl Default for IoRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl IoRegistry {
    /// A registry with no classes.
    pub fn empty() -> Self {
        Self {
            node_classes: HashMap::new(),
            group_classes: HashMap::new(),
        }
    }

    /// A registry with the built-in classes.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register_node(DEFAULT_IO_CLASS, |env| {
            Ok(Arc::new(DefaultNodeIo::new(env)?) as Arc<dyn NodeIo>)
        });
        registry.register_group(DEFAULT_IO_CLASS, |env| {
            Ok(Arc::new(DefaultGroupIo::new(env)?) as Arc<dyn GroupIo>)
        });
        registry.register_group("Transport", |env| {
            Ok(Arc::new(TransportGroupIo::new(env)?) as Arc<dyn GroupIo>)
        });
        registry
    }

    /// Adds or replaces a node I/O class.
    pub fn register_node<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(NodeEnv) -> ArchiveResult<Arc<dyn NodeIo>> + Send + Sync + 'static,
    {
        let name = name.into();
        debug!("Registered node I/O class {}", name);
        self.node_classes.insert(name, Arc::new(factory));
    }

    /// Adds or replaces a group I/O class.
    pub fn register_group<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(GroupEnv) -> ArchiveResult<Arc<dyn GroupIo>> + Send + Sync + 'static,
    {
        let name = name.into();
        debug!("Registered group I/O class {}", name);
        self.group_classes.insert(name, Arc::new(factory));
    }

    /// Builds node I/O using the node's class.
    pub fn node_io(&self, env: NodeEnv) -> ArchiveResult<Arc<dyn NodeIo>> {
        let name = env.node.io_class().to_string();
        let factory = self
            .node_classes
            .get(&name)
            .ok_or(ArchiveError::UnknownIoClass { name })?;
        factory(env)
    }

    /// Builds group I/O using the group's class.
    pub fn group_io(&self, env: GroupEnv) -> ArchiveResult<Arc<dyn GroupIo>> {
        let name = env.group.io_class().to_string();
        let factory = self
            .group_classes
            .get(&name)
            .ok_or(ArchiveError::UnknownIoClass { name })?;
        factory(env)
    }

    /// Registered node class names, sorted.
    pub fn node_classes(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.node_classes.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Registered group class names, sorted.
    pub fn group_classes(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.group_classes.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
