use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Mutex, MutexGuard};

use tracing::debug;

use crate::{id_selector, Element, RenderError, Renderer};

/// One call received by a [`MemoryRenderer`], keyed by selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderCall {
    Find(String),
    Remove(String, Vec<String>),
    Add(String, String),
}

#[derive(Default)]
struct Tree {
    elements: BTreeMap<String, BTreeSet<String>>,
    journal: Vec<RenderCall>,
    fail_lookup: HashSet<String>,
    fail_mutation: HashSet<String>,
    permissive: bool,
}

/// In-memory element tree: selector -> class list, with a call journal.
///
/// Elements are addressed through [`id_selector`], the same way a DOM lookup would be.
#[derive(Default)]
pub struct MemoryRenderer {
    tree: Mutex<Tree>,
}

impl MemoryRenderer {
    pub fn with_elements<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let r = Self::default();
        for id in ids {
            r.insert_element(id.as_ref());
        }
        r
    }

    /// A renderer where every lookup succeeds, creating the element on first use.
    pub fn permissive() -> Self {
        let r = Self::default();
        r.lock().permissive = true;
        r
    }

    fn lock(&self) -> MutexGuard<'_, Tree> {
        self.tree.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert_element(&self, element_id: &str) {
        self.lock().elements.entry(id_selector(element_id)).or_default();
    }

    pub fn len(&self) -> usize { self.lock().elements.len() }
    pub fn is_empty(&self) -> bool { self.lock().elements.is_empty() }

    /// Sorted classes on the element, `None` if it does not exist.
    pub fn classes(&self, element_id: &str) -> Option<Vec<String>> {
        self.lock().elements.get(&id_selector(element_id)).map(|c| c.iter().cloned().collect())
    }

    /// Every element with its classes, ordered by selector.
    pub fn dump(&self) -> Vec<(String, Vec<String>)> {
        self.lock()
            .elements
            .iter()
            .map(|(sel, c)| (sel.clone(), c.iter().cloned().collect()))
            .collect()
    }

    pub fn journal(&self) -> Vec<RenderCall> { self.lock().journal.clone() }


    pub fn fail_lookups_on(&self, element_id: &str) {
        self.lock().fail_lookup.insert(id_selector(element_id));
    }

    pub fn fail_mutations_on(&self, element_id: &str) {
        self.lock().fail_mutation.insert(id_selector(element_id));
    }
}

impl Renderer for MemoryRenderer {
    fn find(&self, element_id: &str) -> Result<Option<Element>, RenderError> {
        let selector = id_selector(element_id);
        let mut tree = self.lock();
        tree.journal.push(RenderCall::Find(selector.clone()));
        if tree.fail_lookup.contains(&selector) {
            return Err(RenderError::Lookup { selector, reason: "lookup failed".into() });
        }
        if tree.permissive {
            tree.elements.entry(selector.clone()).or_default();
        }
        Ok(tree.elements.contains_key(&selector).then(|| Element::new(selector)))
    }

    fn remove_classes(&self, element: &Element, classes: &[&str]) -> Result<(), RenderError> {
        let selector = element.selector().to_string();
        let mut tree = self.lock();
        tree.journal.push(RenderCall::Remove(selector.clone(), classes.iter().map(|c| c.to_string()).collect()));
        if tree.fail_mutation.contains(&selector) {
            return Err(RenderError::Mutation { selector, reason: "classList.remove failed".into() });
        }
        let Some(set) = tree.elements.get_mut(&selector) else {
            return Err(RenderError::Mutation { selector, reason: "element detached".into() });
        };
        for c in classes {
            set.remove(*c);
        }
        Ok(())
    }

    fn add_class(&self, element: &Element, class: &str) -> Result<(), RenderError> {
        let selector = element.selector().to_string();
        let mut tree = self.lock();
        tree.journal.push(RenderCall::Add(selector.clone(), class.to_string()));
        if tree.fail_mutation.contains(&selector) {
            return Err(RenderError::Mutation { selector, reason: "classList.add failed".into() });
        }
        let Some(set) = tree.elements.get_mut(&selector) else {
            return Err(RenderError::Mutation { selector, reason: "element detached".into() });
        };
        set.insert(class.to_string());
        debug!(element = %selector, class, "class set");
        Ok(())
    }
}
