use std::collections::HashMap;

/// Interns event/action/guard names into small integer ids so dispatch during
/// a transition never touches the heap. Strings stay at the edges (parsing,
/// diagnostics); everything in between is an id.
#[derive(Debug, Default, Clone)]
pub struct Interner {
    names: Vec<String>,
    ids: HashMap<String, u32>,
}

/// An interned name. `Copy` so it can be passed around transition resolution
/// without cloning strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(u32);

impl Interner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&mut self, name: &str) -> Symbol {
        if let Some(&id) = self.ids.get(name) {
            return Symbol(id);
        }
        let id = self.names.len() as u32;
        self.names.push(name.to_string());
        self.ids.insert(name.to_string(), id);
        Symbol(id)
    }

    /// Looks up a name without interning it. Used for event dispatch where an
    /// unknown event name simply means "no handler anywhere".
    pub fn get(&self, name: &str) -> Option<Symbol> {
        self.ids.get(name).map(|&id| Symbol(id))
    }

    pub fn resolve(&self, sym: Symbol) -> &str {
        &self.names[sym.0 as usize]
    }
}
