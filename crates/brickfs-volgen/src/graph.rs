//! Processing-stage graph held in an index arena.
//!
//! `order` mirrors the stage list of a volfile read head first: every newly
//! added stage is pushed to the front and becomes the head. Serialization
//! walks the list tail first so children are always defined before the
//! stages that reference them.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;

use crate::error::{Result, VolgenError};

/// Index of a stage inside its graph
pub type StageId = usize;

/// One named, typed, option-configured processing unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    /// Stage type, e.g. `protocol/client`
    pub stage_type: String,
    /// Unique instance name
    pub name: String,
    /// Options in key order
    pub options: BTreeMap<String, String>,
    /// Child stages in link order
    pub children: Vec<StageId>,
}

/// Order-stable description of a stage used for graph comparison
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageDescription {
    /// Stage type
    pub stage_type: String,
    /// Instance name
    pub name: String,
    /// Options
    pub options: BTreeMap<String, String>,
    /// Names of children in link order
    pub children: Vec<String>,
}

/// Arena-backed processing-stage graph
#[derive(Debug, Clone, Default)]
pub struct VolumeGraph {
    stages: Vec<Stage>,
    order: Vec<StageId>,
}

/// Short type name used in generated instance names, `cluster/replicate` -> `replicate`
pub fn short_type(stage_type: &str) -> &str {
    stage_type.rsplit('/').next().unwrap_or(stage_type)
}

impl VolumeGraph {
    /// Creates an empty graph
    pub fn new() -> Self {
        Self::default()
    }

    fn push_stage(&mut self, stage_type: &str, name: &str) -> StageId {
        let id = self.stages.len();
        self.stages.push(Stage {
            stage_type: stage_type.to_string(),
            name: name.to_string(),
            options: BTreeMap::new(),
            children: Vec::new(),
        });
        self.order.insert(0, id);
        id
    }

    /// Adds a stage as the new head without linking it
    pub fn add_nolink(&mut self, stage_type: &str, name: &str) -> StageId {
        self.push_stage(stage_type, name)
    }

    /// Adds a stage as the new head, wrapping the previous head as its child
    pub fn add_as(&mut self, stage_type: &str, name: &str) -> StageId {
        let prev = self.head();
        let id = self.push_stage(stage_type, name);
        if let Some(prev) = prev {
            self.link(id, prev);
        }
        id
    }

    /// Adds `<volname>-<short type>` as the new head
    pub fn add(&mut self, stage_type: &str, volname: &str) -> StageId {
        let name = format!("{}-{}", volname, short_type(stage_type));
        self.add_as(stage_type, &name)
    }

    /// Appends `child` to `parent`'s children
    pub fn link(&mut self, parent: StageId, child: StageId) {
        self.stages[parent].children.push(child);
    }

    /// Current head stage
    pub fn head(&self) -> Option<StageId> {
        self.order.first().copied()
    }

    /// Stage by id
    pub fn stage(&self, id: StageId) -> &Stage {
        &self.stages[id]
    }

    /// Sets or overwrites an option
    pub fn set_option(&mut self, id: StageId, key: &str, value: &str) {
        self.stages[id].options.insert(key.to_string(), value.to_string());
    }

    /// Stage ids head first
    pub fn iter(&self) -> impl Iterator<Item = StageId> + '_ {
        self.order.iter().copied()
    }

    /// Stage ids head first, restricted to one type
    pub fn stages_of_type<'a>(&'a self, stage_type: &'a str) -> impl Iterator<Item = StageId> + 'a {
        self.iter().filter(move |&id| self.stages[id].stage_type == stage_type)
    }

    /// Finds a stage by instance name
    pub fn find(&self, name: &str) -> Option<StageId> {
        self.iter().find(|&id| self.stages[id].name == name)
    }

    /// Number of stages
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Whether the graph has no stages
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Links this graph's head to `sub`'s head and appends `sub`'s stages
    /// after this graph's tail
    pub fn merge_sub(&mut self, sub: VolumeGraph) -> Result<()> {
        let head = self
            .head()
            .ok_or_else(|| VolgenError::Inconsistent("cannot merge into an empty graph".into()))?;
        let sub_head = sub
            .head()
            .ok_or_else(|| VolgenError::Inconsistent("cannot merge an empty graph".into()))?;

        let offset = self.stages.len();
        for mut stage in sub.stages {
            for child in stage.children.iter_mut() {
                *child += offset;
            }
            self.stages.push(stage);
        }
        self.order.extend(sub.order.into_iter().map(|id| id + offset));
        self.link(head, sub_head + offset);
        Ok(())
    }

    /// Head-first description independent of arena indices
    pub fn describe(&self) -> Vec<StageDescription> {
        self.iter()
            .map(|id| {
                let s = &self.stages[id];
                StageDescription {
                    stage_type: s.stage_type.clone(),
                    name: s.name.clone(),
                    options: s.options.clone(),
                    children: s.children.iter().map(|&c| self.stages[c].name.clone()).collect(),
                }
            })
            .collect()
    }

    /// Renders the graph in volfile text form
    pub fn to_volfile(&self) -> String {
        let mut out = String::new();
        for &id in self.order.iter().rev() {
            let s = &self.stages[id];
            let _ = writeln!(out, "volume {}", s.name);
            let _ = writeln!(out, "    type {}", s.stage_type);
            for (k, v) in &s.options {
                let _ = writeln!(out, "    option {} {}", k, v);
            }
            if !s.children.is_empty() {
                let names: Vec<&str> = s.children.iter().map(|&c| self.stages[c].name.as_str()).collect();
                let _ = writeln!(out, "    subvolumes {}", names.join(" "));
            }
            let _ = writeln!(out, "end-volume");
            out.push('\n');
        }
        out
    }

    /// Parses volfile text produced by [`VolumeGraph::to_volfile`]
    pub fn parse_volfile(text: &str) -> Result<VolumeGraph> {
        let mut graph = VolumeGraph::new();
        let mut by_name: HashMap<String, StageId> = HashMap::new();
        let mut current: Option<StageId> = None;
        let mut typed = false;

        let err = |line: usize, reason: String| VolgenError::Parse { line, reason };

        for (idx, raw) in text.lines().enumerate() {
            let lineno = idx + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (directive, rest) = match line.split_once(char::is_whitespace) {
                Some((d, r)) => (d, r.trim()),
                None => (line, ""),
            };

            match (directive, current) {
                ("volume", None) => {
                    if rest.is_empty() {
                        return Err(err(lineno, "volume without a name".into()));
                    }
                    if by_name.contains_key(rest) {
                        return Err(err(lineno, format!("duplicate volume {}", rest)));
                    }
                    // type is filled in by the following directive
                    let id = graph.push_stage("", rest);
                    by_name.insert(rest.to_string(), id);
                    current = Some(id);
                    typed = false;
                }
                ("volume", Some(_)) => {
                    return Err(err(lineno, "volume started before end-volume".into()));
                }
                ("type", Some(id)) => {
                    if rest.is_empty() {
                        return Err(err(lineno, "type without a value".into()));
                    }
                    graph.stages[id].stage_type = rest.to_string();
                    typed = true;
                }
                ("option", Some(id)) => {
                    let (k, v) = rest
                        .split_once(char::is_whitespace)
                        .ok_or_else(|| err(lineno, format!("option without a value: {}", rest)))?;
                    graph.set_option(id, k, v.trim());
                }
                ("subvolumes", Some(id)) => {
                    for child in rest.split_whitespace() {
                        let cid = *by_name
                            .get(child)
                            .ok_or_else(|| err(lineno, format!("undefined subvolume {}", child)))?;
                        graph.link(id, cid);
                    }
                }
                ("end-volume", Some(_)) => {
                    if !typed {
                        return Err(err(lineno, "volume has no type".into()));
                    }
                    current = None;
                }
                (other, None) => {
                    return Err(err(lineno, format!("unexpected directive {} outside a volume", other)));
                }
                (other, Some(_)) => {
                    return Err(err(lineno, format!("unknown directive {}", other)));
                }
            }
        }

        if current.is_some() {
            return Err(err(text.lines().count(), "missing end-volume".into()));
        }
        Ok(graph)
    }
}
