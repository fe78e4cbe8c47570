use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde::Serialize;

use crate::errors::MachineError;
use crate::ids::ListenerId;
use crate::ops::Op;
use crate::path::{self, Edge, ROOT};

/// Data leaves keep at most this many appended lines.
pub const MAX_DATA_LENGTH: usize = 100;

/// Called once per committed block with the ops that were applied.
pub type BlockListener = Box<dyn Fn(&[Op]) + Send + Sync>;

/// A machine shared between the connection that writes it and the broker
/// that fans its commits out. Holding the lock serializes transactions.
pub type SharedMachine = Arc<parking_lot::Mutex<Machine>>;

/// Value held by a leaf.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Data {
    #[default]
    Empty,
    Scalar(String),
    Lines(VecDeque<String>),
}

impl Data {
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    fn set(value: &str) -> Self {
        if value.is_empty() {
            Self::Empty
        } else {
            Self::Scalar(value.to_string())
        }
    }

    fn append(&mut self, value: &str) {
        match self {
            Self::Empty if value.is_empty() => *self = Self::Lines(VecDeque::from([String::new()])),
            Self::Empty => *self = Self::Scalar(value.to_string()),
            Self::Scalar(first) => {
                let first = std::mem::take(first);
                *self = Self::Lines(VecDeque::from([first, value.to_string()]));
            }
            Self::Lines(lines) => {
                lines.push_back(value.to_string());
                while lines.len() > MAX_DATA_LENGTH {
                    lines.pop_front();
                }
            }
        }
    }
}

#[derive(Clone, Debug)]
enum Node {
    Leaf(Data),
    Concurrent(Vec<String>),
    Variable { children: Vec<String>, curr: usize },
}

impl Node {
    fn children(&self) -> &[String] {
        match self {
            Self::Leaf(_) => &[],
            Self::Concurrent(children) | Self::Variable { children, .. } => children,
        }
    }

    fn edge(&self) -> Option<Edge> {
        match self {
            Self::Leaf(_) => None,
            Self::Concurrent(_) => Some(Edge::Concurrent),
            Self::Variable { .. } => Some(Edge::Variable),
        }
    }
}

/// The path-keyed node arena. Cloning it is the validation copy.
#[derive(Clone, Debug)]
struct Tree {
    nodes: HashMap<String, Node>,
}

impl Default for Tree {
    fn default() -> Self {
        Self {
            nodes: HashMap::from([(ROOT.to_string(), Node::Leaf(Data::Empty))]),
        }
    }
}

impl Tree {
    fn apply(&mut self, op: &Op) -> Result<(), MachineError> {
        match op {
            Op::Path(path) => self.ensure_path(path),
            Op::Current { path, child } => self.set_current(path, child),
            Op::Set { path, value } => {
                *self.leaf_data_mut(path, 'D')? = Data::set(value);
                Ok(())
            }
            Op::Append { path, value } => {
                self.leaf_data_mut(path, 'A')?.append(value);
                Ok(())
            }
            Op::Empty => {
                *self = Self::default();
                Ok(())
            }
            Op::Delete(path) => self.delete_leaf(path),
        }
    }

    /// Create `target` and any missing ancestors. Everything is checked
    /// before the first node is inserted.
    fn ensure_path(&mut self, target: &str) -> Result<(), MachineError> {
        let mut missing = Vec::new();
        let mut cursor = target;
        while !self.nodes.contains_key(cursor) {
            let (parent, edge, name) =
                path::split_last(cursor).ok_or_else(|| MachineError::BadPath(target.to_string()))?;
            missing.push((parent, edge, name));
            cursor = parent;
        }
        let Some(&(anchor, edge, _)) = missing.last() else {
            return Ok(());
        };
        self.check_attach(anchor, edge)?;

        for (parent, edge, name) in missing.into_iter().rev() {
            let node = self
                .nodes
                .get_mut(parent)
                .ok_or_else(|| MachineError::NoSuchPath(parent.to_string()))?;
            match node {
                Node::Leaf(_) => {
                    *node = match edge {
                        Edge::Concurrent => Node::Concurrent(vec![name.to_string()]),
                        Edge::Variable => Node::Variable {
                            children: vec![name.to_string()],
                            curr: 0,
                        },
                    }
                }
                Node::Concurrent(children) | Node::Variable { children, .. } => {
                    children.push(name.to_string())
                }
            }
            self.nodes
                .insert(path::join(parent, edge, name), Node::Leaf(Data::Empty));
        }
        Ok(())
    }

    fn check_attach(&self, parent: &str, edge: Edge) -> Result<(), MachineError> {
        match (self.nodes.get(parent), edge) {
            (None, _) => Err(MachineError::NoSuchPath(parent.to_string())),
            (Some(Node::Leaf(data)), _) if !data.is_empty() => {
                Err(MachineError::ParentHasData(parent.to_string()))
            }
            (Some(Node::Concurrent(_)), Edge::Variable) => {
                Err(MachineError::ConcurrentParentVariableChild(parent.to_string()))
            }
            (Some(Node::Variable { .. }), Edge::Concurrent) => {
                Err(MachineError::VariableParentConcurrentChild(parent.to_string()))
            }
            _ => Ok(()),
        }
    }

    fn set_current(&mut self, path: &str, child: &str) -> Result<(), MachineError> {
        match self.nodes.get_mut(path) {
            None => Err(MachineError::NoSuchPath(path.to_string())),
            Some(Node::Variable { children, curr }) => {
                let idx = children.iter().position(|c| c == child).ok_or_else(|| {
                    MachineError::NoSuchChild {
                        path: path.to_string(),
                        child: child.to_string(),
                    }
                })?;
                *curr = idx;
                Ok(())
            }
            Some(_) => Err(MachineError::NotVariableParent(path.to_string())),
        }
    }

    fn leaf_data_mut(&mut self, path: &str, verb: char) -> Result<&mut Data, MachineError> {
        if path == ROOT {
            return Err(MachineError::RootNotAllowed(verb));
        }
        match self.nodes.get_mut(path) {
            None => Err(MachineError::NoSuchPath(path.to_string())),
            Some(Node::Leaf(data)) => Ok(data),
            Some(_) => Err(MachineError::NotLeaf(path.to_string())),
        }
    }

    fn delete_leaf(&mut self, path: &str) -> Result<(), MachineError> {
        let (parent, _, name) = path::split_last(path).ok_or(MachineError::RootNotAllowed('X'))?;
        match self.nodes.get(path) {
            None => return Err(MachineError::NoSuchPath(path.to_string())),
            Some(Node::Leaf(_)) => {}
            Some(_) => return Err(MachineError::NotLeaf(path.to_string())),
        }
        let node = self
            .nodes
            .get_mut(parent)
            .ok_or_else(|| MachineError::NoSuchPath(parent.to_string()))?;
        let emptied = match node {
            Node::Leaf(_) => false,
            Node::Concurrent(children) => {
                children.retain(|c| c != name);
                children.is_empty()
            }
            Node::Variable { children, curr } => {
                if let Some(idx) = children.iter().position(|c| c == name) {
                    children.remove(idx);
                    if *curr == idx {
                        *curr = 0;
                    } else if *curr > idx {
                        *curr -= 1;
                    }
                }
                children.is_empty()
            }
        };
        if emptied {
            *node = Node::Leaf(Data::Empty);
        }
        self.nodes.remove(path);
        Ok(())
    }

    fn collect(&self, path: &str, current_only: bool, out: &mut Vec<String>) {
        out.push(path.to_string());
        let Some(node) = self.nodes.get(path) else {
            return;
        };
        let Some(edge) = node.edge() else {
            return;
        };
        match node {
            Node::Variable { children, curr } if current_only => {
                if let Some(child) = children.get(*curr) {
                    self.collect(&path::join(path, edge, child), current_only, out);
                }
            }
            _ => {
                for child in node.children() {
                    self.collect(&path::join(path, edge, child), current_only, out);
                }
            }
        }
    }
}

/// A live state tree plus the listeners told about each committed block.
#[derive(Default)]
pub struct Machine {
    tree: Tree,
    listeners: Vec<(ListenerId, BlockListener)>,
}

impl std::fmt::Debug for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine")
            .field("paths", &self.tree.nodes.len())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl Machine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap in the lock used by connections and the broker.
    pub fn into_shared(self) -> SharedMachine {
        Arc::new(parking_lot::Mutex::new(self))
    }

    /// Apply a block atomically.
    ///
    /// The block is parsed and replayed against a copy of the tree. On the
    /// first failure the live tree is untouched and that error is returned.
    /// Otherwise the copy becomes the live tree and every listener is called
    /// once with the applied ops. A block with no ops commits silently.
    pub fn interpret<I, S>(&mut self, lines: I) -> Result<Vec<Op>, MachineError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let ops = Op::parse_block(lines)?;
        let mut scratch = self.tree.clone();
        for op in &ops {
            scratch.apply(op)?;
        }
        self.tree = scratch;
        if !ops.is_empty() {
            for (_, listener) in &self.listeners {
                listener(&ops);
            }
        }
        Ok(ops)
    }

    /// Apply a single op line directly, without notifying listeners.
    pub fn interpret_op(&mut self, line: &str) -> Result<(), MachineError> {
        match Op::parse(line)? {
            Some(op) => self.tree.apply(&op),
            None => Ok(()),
        }
    }

    pub fn add_block_listener(&mut self, listener: BlockListener) -> ListenerId {
        let id = ListenerId::new();
        self.listeners.push((id.clone(), listener));
        id
    }

    pub fn remove_block_listener(&mut self, id: &ListenerId) -> Result<(), MachineError> {
        let pos = self
            .listeners
            .iter()
            .position(|(lid, _)| lid == id)
            .ok_or(MachineError::NoSuchListener)?;
        self.listeners.remove(pos);
        Ok(())
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    fn node(&self, raw: &str) -> Option<&Node> {
        let path = path::normalize(raw).ok()?;
        self.tree.nodes.get(&path)
    }

    pub fn exists(&self, path: &str) -> bool {
        self.node(path).is_some()
    }

    pub fn is_leaf(&self, path: &str) -> bool {
        matches!(self.node(path), Some(Node::Leaf(_)))
    }

    pub fn is_parent(&self, path: &str) -> bool {
        matches!(self.node(path), Some(Node::Concurrent(_) | Node::Variable { .. }))
    }

    pub fn is_concurrent_parent(&self, path: &str) -> bool {
        matches!(self.node(path), Some(Node::Concurrent(_)))
    }

    pub fn is_variable_parent(&self, path: &str) -> bool {
        matches!(self.node(path), Some(Node::Variable { .. }))
    }

    /// A non-root leaf; only these may hold data.
    pub fn is_data_leaf(&self, path: &str) -> bool {
        self.is_leaf(path) && self.parent_path(path).is_some()
    }

    /// A leaf whose parent is a variable parent.
    pub fn is_variable_leaf(&self, path: &str) -> bool {
        self.is_leaf(path)
            && self
                .parent_path(path)
                .is_some_and(|parent| self.is_variable_parent(&parent))
    }

    pub fn parent_path(&self, raw: &str) -> Option<String> {
        let path = path::normalize(raw).ok()?;
        if !self.tree.nodes.contains_key(&path) {
            return None;
        }
        path::split_last(&path).map(|(parent, _, _)| parent.to_string())
    }

    pub fn children(&self, path: &str) -> Vec<String> {
        self.node(path).map(|n| n.children().to_vec()).unwrap_or_default()
    }

    pub fn current_child_name(&self, path: &str) -> Option<&str> {
        match self.node(path)? {
            Node::Variable { children, curr } => children.get(*curr).map(String::as_str),
            _ => None,
        }
    }

    /// Children of a variable parent other than the current one.
    pub fn non_current_children(&self, path: &str) -> Vec<String> {
        match self.node(path) {
            Some(Node::Variable { children, curr }) => children
                .iter()
                .enumerate()
                .filter(|(i, _)| i != curr)
                .map(|(_, c)| c.clone())
                .collect(),
            _ => Vec::new(),
        }
    }

    /// True when every variable edge from the root down to `path` is current.
    pub fn is_current(&self, raw: &str) -> bool {
        let Ok(mut path) = path::normalize(raw) else {
            return false;
        };
        if !self.tree.nodes.contains_key(&path) {
            return false;
        }
        while let Some((parent, edge, name)) = path::split_last(&path) {
            if edge == Edge::Variable && self.current_child_name(parent) != Some(name) {
                return false;
            }
            path = parent.to_string();
        }
        true
    }

    /// Leaf data, or `None` for parents, the root and unknown paths.
    pub fn data(&self, path: &str) -> Option<&Data> {
        if !self.is_data_leaf(path) {
            return None;
        }
        match self.node(path)? {
            Node::Leaf(data) => Some(data),
            _ => None,
        }
    }

    /// Every path, parent first.
    pub fn all_paths(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(self.tree.nodes.len());
        self.tree.collect(ROOT, false, &mut out);
        out
    }

    /// Paths reachable through current children only.
    pub fn current_paths(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.tree.collect(ROOT, true, &mut out);
        out
    }

    /// Canonical op list that rebuilds this tree on an empty machine.
    pub fn serialization(&self) -> Vec<Op> {
        let mut ops = Vec::new();
        for path in self.all_paths() {
            ops.push(Op::Path(path.clone()));
            if let Some((parent, Edge::Variable, name)) = path::split_last(&path) {
                if let Some(Node::Variable { children, curr }) = self.tree.nodes.get(parent) {
                    if *curr != 0 && children.get(*curr).map(String::as_str) == Some(name) {
                        ops.push(Op::Current {
                            path: parent.to_string(),
                            child: name.to_string(),
                        });
                    }
                }
            }
            match self.tree.nodes.get(&path) {
                Some(Node::Leaf(Data::Scalar(value))) => ops.push(Op::Set {
                    path: path.clone(),
                    value: value.clone(),
                }),
                Some(Node::Leaf(Data::Lines(lines))) => {
                    ops.extend(lines.iter().map(|value| Op::Append {
                        path: path.clone(),
                        value: value.clone(),
                    }));
                }
                _ => {}
            }
        }
        ops
    }

    /// Serialization as newline-joined wire text.
    pub fn serialization_text(&self) -> String {
        join_ops(&self.serialization())
    }
}

pub fn join_ops(ops: &[Op]) -> String {
    ops.iter().map(Op::to_string).collect::<Vec<_>>().join("\n")
}
