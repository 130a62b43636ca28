//! Floorplan render boundary: the renderer trait, visual classes and the state applier.

#![forbid(unsafe_code)]

use std::fmt;

use floorplan_core::TriState;

mod applier;
mod memory;
pub mod svg;

pub use applier::{Applier, ApplyOutcome, ApplierStats};
pub use memory::{MemoryRenderer, RenderCall};

/// Located element, as returned by [`Renderer::find`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Element {
    selector: String,
}

impl Element {
    pub fn new(selector: impl Into<String>) -> Self { Self { selector: selector.into() } }
    pub fn selector(&self) -> &str { &self.selector }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RenderError {
    #[error("could not find object {selector}: {reason}")]
    Lookup { selector: String, reason: String },
    #[error("could not update state of {selector}: {reason}")]
    Mutation { selector: String, reason: String },
}

/// The rendering surface: a DOM-like tree addressed by element id.
///
/// Every call may fail; the applier logs failures and moves on.
pub trait Renderer: Send + Sync {
    /// Look up the element for `element_id`. `Ok(None)` means it is not drawn.
    fn find(&self, element_id: &str) -> Result<Option<Element>, RenderError>;

    fn remove_classes(&self, element: &Element, classes: &[&str]) -> Result<(), RenderError>;

    fn add_class(&self, element: &Element, class: &str) -> Result<(), RenderError>;
}

/// The three mutually exclusive classes an element can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VisualClass {
    On,
    Off,
    Unavailable,
}

impl VisualClass {
    pub const ALL: [VisualClass; 3] = [VisualClass::On, VisualClass::Off, VisualClass::Unavailable];

    pub fn as_str(self) -> &'static str {
        match self {
            VisualClass::On => "on",
            VisualClass::Off => "off",
            VisualClass::Unavailable => "unavailable",
        }
    }

    pub fn all_names() -> [&'static str; 3] { Self::ALL.map(VisualClass::as_str) }
}

impl From<TriState> for VisualClass {
    fn from(v: TriState) -> Self {
        match v {
            TriState::On => VisualClass::On,
            TriState::Off => VisualClass::Off,
            TriState::Unknown => VisualClass::Unavailable,
        }
    }
}

impl fmt::Display for VisualClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// CSS id selector for an element id; dots in entity-style ids are escaped
/// (`light.kitchen` -> `#light\.kitchen`).
pub fn id_selector(element_id: &str) -> String {
    let mut out = String::with_capacity(element_id.len() + 4);
    out.push('#');
    for c in element_id.chars() {
        if c == '.' {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
