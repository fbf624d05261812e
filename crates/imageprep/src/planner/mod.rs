use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::error::{Error, Result};

pub type TaskId = String;

pub const CLEANUP_PHASE: &str = "cleanup";

#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub label: String,
    pub module: String,
    pub phase: String,
    pub after: Vec<TaskId>,
    pub provides: Vec<String>,
}

#[derive(Debug, Default)]
pub struct Plan {
    tasks: BTreeMap<TaskId, Task>,
}

impl Plan {
    pub fn add(&mut self, task: Task) -> Result<()> {
        if self.tasks.contains_key(&task.id) {
            return Err(Error::msg(format!("duplicate task id '{}'", task.id)));
        }
        self.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn provides_index(&self) -> Result<BTreeMap<&str, &str>> {
        let mut out: BTreeMap<&str, &str> = BTreeMap::new();
        for (id, task) in &self.tasks {
            for p in &task.provides {
                if let Some(existing) = out.insert(p.as_str(), id.as_str()) {
                    return Err(Error::msg(format!(
                        "provide token '{}' is produced by both '{}' and '{}'",
                        p, existing, id
                    )));
                }
            }
        }
        Ok(out)
    }

    // `dep?` is optional: an unknown optional dependency is dropped.
    fn resolve_dep<'a>(
        &'a self,
        provides: &BTreeMap<&'a str, &'a str>,
        dep: &'a str,
    ) -> Result<Option<&'a str>> {
        let (dep, optional) = dep
            .strip_suffix('?')
            .map(|d| (d, true))
            .unwrap_or((dep, false));
        if let Some((id, _)) = self.tasks.get_key_value(dep) {
            return Ok(Some(id.as_str()));
        }
        if let Some(&provider) = provides.get(dep) {
            return Ok(Some(provider));
        }
        if optional {
            Ok(None)
        } else {
            Err(Error::msg(format!("unknown dependency '{}'", dep)))
        }
    }

    fn edges(&self) -> Result<Vec<(&str, &str)>> {
        let provides = self.provides_index()?;
        let mut out = Vec::new();
        for (id, task) in &self.tasks {
            for dep in &task.after {
                let resolved = self.resolve_dep(&provides, dep).map_err(|e| {
                    Error::msg(format!(
                        "task '{}' has invalid dependency '{}': {}",
                        id, dep, e
                    ))
                })?;
                if let Some(dep_id) = resolved {
                    out.push((dep_id, id.as_str()));
                }
            }
        }
        Ok(out)
    }

    pub fn ordered(&self) -> Result<Vec<&Task>> {
        let mut incoming: BTreeMap<&str, usize> =
            self.tasks.keys().map(|k| (k.as_str(), 0)).collect();
        let mut outgoing: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for (from, to) in self.edges()? {
            if outgoing.entry(from).or_default().insert(to) {
                *incoming.entry(to).or_default() += 1;
            }
        }

        let mut q: VecDeque<&str> = incoming
            .iter()
            .filter_map(|(k, v)| (*v == 0).then_some(*k))
            .collect();
        let mut out: Vec<&str> = Vec::with_capacity(self.tasks.len());

        while let Some(n) = q.pop_front() {
            out.push(n);
            let Some(children) = outgoing.get(n) else {
                continue;
            };
            for &m in children {
                if let Some(slot) = incoming.get_mut(m) {
                    *slot -= 1;
                    if *slot == 0 {
                        q.push_back(m);
                    }
                }
            }
        }

        if out.len() != self.tasks.len() {
            let remaining: Vec<&str> = incoming
                .iter()
                .filter_map(|(k, v)| (*v > 0).then_some(*k))
                .collect();
            return Err(Error::msg(format!(
                "task graph contains a cycle; remaining nodes: {}",
                remaining.join(", ")
            )));
        }

        Ok(out.iter().filter_map(|id| self.tasks.get(*id)).collect())
    }

    pub fn finalize_default(&mut self) -> Result<()> {
        self.add_cleanup_barrier();
        Ok(())
    }

    // Cleanup tasks run last: they wait on every task outside the cleanup phase.
    fn add_cleanup_barrier(&mut self) {
        let work: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|t| t.phase != CLEANUP_PHASE)
            .map(|t| t.id.clone())
            .collect();
        for task in self.tasks.values_mut() {
            if task.phase != CLEANUP_PHASE {
                continue;
            }
            for id in &work {
                if !task.after.contains(id) {
                    task.after.push(id.clone());
                }
            }
        }
    }

    pub fn to_dot(&self) -> Result<String> {
        let mut out = String::from("digraph plan {\n  rankdir=LR;\n");
        for task in self.tasks.values() {
            out.push_str(&format!(
                "  \"{}\" [label=\"{}\\n{}:{}\"];\n",
                task.id, task.label, task.module, task.phase
            ));
        }
        for (from, to) in self.edges()? {
            out.push_str(&format!("  \"{}\" -> \"{}\";\n", from, to));
        }
        out.push_str("}\n");
        Ok(out)
    }
}
