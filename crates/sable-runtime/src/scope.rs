//! Lexical scope tree
//!
//! Built by the parser, consulted by the compiler to resolve every identifier
//! to a global slot, a local slot, or an upvalue. Anonymous scopes (blocks,
//! function implementations, loop headers) get generated names so that every
//! identifier's fully qualified name is a distinct string.

use crate::error::SableError;
use crate::globals::Globals;
use crate::span::Span;

/// Index of a scope node within the tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(pub u32);

/// One node of the scope tree
#[derive(Debug)]
pub struct Scope {
    parent: Option<ScopeId>,
    /// Declared name; empty for anonymous scopes
    name: String,
    /// Source range of the declaring token
    pub span: Span,
    /// Stable id used to synthesize anonymous names
    id: u64,
    /// Named child scopes (`mod`, `fun`, `obj`)
    subscopes: Vec<(String, ScopeId)>,
    /// Identifiers declared directly in this scope (includes named subscopes)
    idents: Vec<(String, ScopeId)>,
    /// Allocated global-table slot, for scopes that resolve globally
    pub global_index: Option<usize>,
}

impl Scope {
    /// The name of this scope; anonymous scopes synthesize `<anonN>`
    pub fn name(&self) -> String {
        if self.name.is_empty() && self.parent.is_some() {
            format!("<anon{}>", self.id)
        } else {
            self.name.clone()
        }
    }
}

/// The scope hierarchy for one compilation
#[derive(Debug)]
pub struct ScopeTree {
    nodes: Vec<Scope>,
    current: ScopeId,
    next_id: u64,
}

impl Default for ScopeTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ScopeTree {
    /// Create a tree containing only the global scope
    pub fn new() -> Self {
        Self {
            nodes: vec![Scope {
                parent: None,
                name: String::new(),
                span: Span::dummy(),
                id: 0,
                subscopes: Vec::new(),
                idents: Vec::new(),
                global_index: None,
            }],
            current: ScopeId(0),
            next_id: 1,
        }
    }

    /// The root (global) scope
    pub fn root(&self) -> ScopeId {
        ScopeId(0)
    }

    /// The scope the parser is currently inside
    pub fn current(&self) -> ScopeId {
        self.current
    }

    /// Borrow a node
    pub fn get(&self, id: ScopeId) -> &Scope {
        &self.nodes[id.0 as usize]
    }

    fn push_node(&mut self, parent: ScopeId, name: String, span: Span) -> ScopeId {
        let id = ScopeId(self.nodes.len() as u32);
        self.nodes.push(Scope {
            parent: Some(parent),
            name,
            span,
            id: self.next_id,
            subscopes: Vec::new(),
            idents: Vec::new(),
            global_index: None,
        });
        self.next_id += 1;
        id
    }

    fn allocate_global(&mut self, id: ScopeId, globals: &mut Globals) {
        if self.is_global(id) {
            let qualified = self.qualified_name(id);
            let idx = globals
                .index_of(&qualified)
                .unwrap_or_else(|| globals.add(&qualified));
            self.nodes[id.0 as usize].global_index = Some(idx);
        }
    }

    /// Open a named scope under the current one and make it current.
    ///
    /// `exclusive` rejects an already-present name; without it an existing
    /// scope is re-entered (`mod` blocks append).
    pub fn open_named(
        &mut self,
        name: &str,
        span: Span,
        exclusive: bool,
        globals: &mut Globals,
    ) -> Result<ScopeId, SableError> {
        if let Some(&(_, existing)) = self
            .get(self.current)
            .subscopes
            .iter()
            .find(|(n, _)| n == name)
        {
            if exclusive {
                return Err(SableError::compile(
                    format!("redefinition of '{}'", name),
                    span,
                )
                .with_related("first defined here...", self.get(existing).span));
            }
            self.current = existing;
            return Ok(existing);
        }

        let id = self.push_node(self.current, name.to_string(), span);
        let parent = self.current;
        self.nodes[parent.0 as usize]
            .subscopes
            .push((name.to_string(), id));
        self.nodes[parent.0 as usize]
            .idents
            .push((name.to_string(), id));
        self.allocate_global(id, globals);
        self.current = id;
        Ok(id)
    }

    /// Open an anonymous scope under the current one and make it current
    pub fn open_anon(&mut self) -> ScopeId {
        let id = self.push_node(self.current, String::new(), Span::dummy());
        self.current = id;
        id
    }

    /// Return to the parent scope
    pub fn close(&mut self) {
        if let Some(parent) = self.get(self.current).parent {
            self.current = parent;
        }
    }

    /// Declare an identifier in the current scope.
    ///
    /// Redeclaration within the same scope is an error with a note pointing
    /// at the first declaration.
    pub fn add_ident(
        &mut self,
        name: &str,
        span: Span,
        globals: &mut Globals,
    ) -> Result<ScopeId, SableError> {
        if let Some(&(_, existing)) = self
            .get(self.current)
            .idents
            .iter()
            .find(|(n, _)| n == name)
        {
            return Err(
                SableError::compile(format!("redefinition of '{}'", name), span)
                    .with_related("first defined here...", self.get(existing).span),
            );
        }

        let id = self.push_node(self.current, name.to_string(), span);
        let parent = self.current;
        self.nodes[parent.0 as usize]
            .idents
            .push((name.to_string(), id));
        self.allocate_global(id, globals);
        Ok(id)
    }

    /// Whether a scope resolves globally: no anonymous scope sits on the path
    /// from it to the root
    pub fn is_global(&self, id: ScopeId) -> bool {
        let mut cursor = Some(id);
        while let Some(c) = cursor {
            let node = self.get(c);
            if node.name.is_empty() && node.parent.is_some() {
                return false;
            }
            cursor = node.parent;
        }
        true
    }

    /// The `::`-joined path of a scope; the root alone is `::`
    pub fn qualified_name(&self, id: ScopeId) -> String {
        let mut parts = Vec::new();
        let mut cursor = Some(id);
        while let Some(c) = cursor {
            let node = self.get(c);
            if node.parent.is_some() {
                parts.push(node.name());
            }
            cursor = node.parent;
        }
        if parts.is_empty() {
            return "::".to_string();
        }
        parts.reverse();
        let mut qualified = String::new();
        for part in parts {
            qualified.push_str("::");
            qualified.push_str(&part);
        }
        qualified
    }

    fn find_subscope(&self, in_scope: ScopeId, name: &str) -> Option<ScopeId> {
        self.get(in_scope)
            .subscopes
            .iter()
            .find(|(n, _)| n == name)
            .map(|&(_, id)| id)
    }

    fn find_ident(&self, in_scope: ScopeId, name: &str) -> Option<ScopeId> {
        self.get(in_scope)
            .idents
            .iter()
            .find(|(n, _)| n == name)
            .map(|&(_, id)| id)
    }

    fn resolve_path(&self, parts: &[&str], from: ScopeId) -> Option<ScopeId> {
        let mut scope = from;
        for (i, part) in parts.iter().enumerate() {
            let next = if i + 1 < parts.len() {
                self.find_subscope(scope, part)
            } else {
                self.find_ident(scope, part)
            };
            scope = next?;
        }
        Some(scope)
    }

    /// Declare a fully qualified path from the root, creating module scopes
    /// and the final identifier as needed. Used when the host binds
    /// syscalls before any script is parsed.
    pub fn declare_path(&mut self, path: &str, globals: &mut Globals) -> ScopeId {
        let rest = path.strip_prefix("::").unwrap_or(path);
        let parts: Vec<&str> = rest.split("::").filter(|p| !p.is_empty()).collect();
        if parts.is_empty() {
            return self.root();
        }

        let mut scope = self.root();
        for part in &parts[..parts.len() - 1] {
            scope = match self.find_subscope(scope, part) {
                Some(existing) => existing,
                None => {
                    let id = self.push_node(scope, part.to_string(), Span::dummy());
                    self.nodes[scope.0 as usize]
                        .subscopes
                        .push((part.to_string(), id));
                    self.nodes[scope.0 as usize]
                        .idents
                        .push((part.to_string(), id));
                    self.allocate_global(id, globals);
                    id
                }
            };
        }

        let last = parts[parts.len() - 1];
        if let Some(existing) = self.find_ident(scope, last) {
            return existing;
        }
        let id = self.push_node(scope, last.to_string(), Span::dummy());
        self.nodes[scope.0 as usize]
            .idents
            .push((last.to_string(), id));
        self.allocate_global(id, globals);
        id
    }

    /// Resolve an identifier path (`a`, `a::b`, absolute `::a::b`) starting
    /// from a scope and walking outward
    pub fn resolve(&self, ident: &str, from: ScopeId) -> Option<ScopeId> {
        let (parts, mut cursor) = if let Some(rest) = ident.strip_prefix("::") {
            (rest.split("::").collect::<Vec<_>>(), Some(self.root()))
        } else {
            (ident.split("::").collect::<Vec<_>>(), Some(from))
        };

        while let Some(scope) = cursor {
            if let Some(found) = self.resolve_path(&parts, scope) {
                return Some(found);
            }
            cursor = self.get(scope).parent;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qualified_names_are_unique() {
        let mut globals = Globals::new();
        let mut tree = ScopeTree::new();
        tree.open_named("f", Span::dummy(), true, &mut globals).unwrap();
        let impl_scope = tree.open_anon();
        let x = tree.add_ident("x", Span::dummy(), &mut globals).unwrap();
        tree.close();
        tree.close();
        let impl_scope2 = tree.open_anon();
        assert_ne!(
            tree.qualified_name(impl_scope),
            tree.qualified_name(impl_scope2)
        );
        assert!(tree.qualified_name(x).starts_with("::f::<anon"));
    }

    #[test]
    fn test_locals_are_not_global() {
        let mut globals = Globals::new();
        let mut tree = ScopeTree::new();
        let f = tree
            .open_named("f", Span::dummy(), true, &mut globals)
            .unwrap();
        tree.open_anon();
        let x = tree.add_ident("x", Span::dummy(), &mut globals).unwrap();
        assert!(tree.is_global(f));
        assert!(!tree.is_global(x));
        assert!(tree.get(f).global_index.is_some());
        assert!(tree.get(x).global_index.is_none());
    }

    #[test]
    fn test_resolution_walks_outward() {
        let mut globals = Globals::new();
        let mut tree = ScopeTree::new();
        let top = tree.add_ident("v", Span::dummy(), &mut globals).unwrap();
        tree.open_named("f", Span::dummy(), true, &mut globals).unwrap();
        tree.open_anon();
        let inner = tree.current();
        assert_eq!(tree.resolve("v", inner), Some(top));
        assert_eq!(tree.resolve("::v", inner), Some(top));
        assert_eq!(tree.resolve("missing", inner), None);
    }

    #[test]
    fn test_module_path_resolution() {
        let mut globals = Globals::new();
        let mut tree = ScopeTree::new();
        tree.open_named("m", Span::dummy(), true, &mut globals).unwrap();
        let f = tree
            .open_named("f", Span::dummy(), true, &mut globals)
            .unwrap();
        tree.close();
        tree.close();
        assert_eq!(tree.resolve("m::f", tree.root()), Some(f));
        assert_eq!(tree.qualified_name(f), "::m::f");
    }

    #[test]
    fn test_exclusive_redefinition_is_an_error() {
        let mut globals = Globals::new();
        let mut tree = ScopeTree::new();
        tree.add_ident("x", Span::new(0, 1), &mut globals).unwrap();
        assert!(tree.add_ident("x", Span::new(5, 6), &mut globals).is_err());
    }

    #[test]
    fn test_module_scopes_reopen() {
        let mut globals = Globals::new();
        let mut tree = ScopeTree::new();
        let m1 = tree
            .open_named("m", Span::dummy(), false, &mut globals)
            .unwrap();
        tree.close();
        let m2 = tree
            .open_named("m", Span::dummy(), false, &mut globals)
            .unwrap();
        assert_eq!(m1, m2);
    }
}
