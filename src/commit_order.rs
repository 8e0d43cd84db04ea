//! Class-level insert ordering.
//!
//! A dependency exists only where a new object stores a reference to
//! another new object whose identifier the store assigns during insert. The
//! referenced class must be inserted first. Self-dependencies are ignored;
//! objects of one class keep their registration order and any reference
//! still unresolved at insert time is written by a follow-up update.

use std::collections::{BTreeSet, HashMap};

use crate::{Error, Result};

#[derive(Debug, Default)]
pub struct CommitOrderCalculator {
    classes: Vec<String>,
    depends_on: HashMap<String, BTreeSet<String>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

impl CommitOrderCalculator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_class(&mut self, class: &str) {
        if !self.depends_on.contains_key(class) {
            self.classes.push(class.to_owned());
            self.depends_on.insert(class.to_owned(), BTreeSet::new());
        }
    }

    /// `referencing` stores a reference to `referenced`.
    pub fn add_dependency(&mut self, referencing: &str, referenced: &str) {
        if referencing == referenced {
            return;
        }
        self.add_class(referencing);
        self.add_class(referenced);
        if let Some(deps) = self.depends_on.get_mut(referencing) {
            deps.insert(referenced.to_owned());
        }
    }

    pub fn has_dependencies(&self) -> bool {
        self.depends_on.values().any(|d| !d.is_empty())
    }

    /// Classes ordered so each comes after everything it depends on, ties
    /// broken by registration order.
    pub fn sort(&self) -> Result<Vec<String>> {
        let mut marks: HashMap<&str, Mark> = HashMap::new();
        let mut order = Vec::with_capacity(self.classes.len());
        let mut path = Vec::new();
        for class in &self.classes {
            self.visit(class, &mut marks, &mut path, &mut order)?;
        }
        Ok(order)
    }

    fn visit<'a>(
        &'a self,
        class: &'a str,
        marks: &mut HashMap<&'a str, Mark>,
        path: &mut Vec<&'a str>,
        order: &mut Vec<String>,
    ) -> Result<()> {
        match marks.get(class) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                let start = path.iter().position(|c| *c == class).unwrap_or(0);
                let mut classes: Vec<String> = path[start..].iter().map(|c| (*c).to_owned()).collect();
                classes.push(class.to_owned());
                return Err(Error::CascadeCycle { classes });
            }
            None => {}
        }
        marks.insert(class, Mark::Visiting);
        path.push(class);
        if let Some(deps) = self.depends_on.get(class) {
            for dep in deps {
                self.visit(dep, marks, path, order)?;
            }
        }
        path.pop();
        marks.insert(class, Mark::Done);
        order.push(class.to_owned());
        Ok(())
    }
}
