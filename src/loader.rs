//! Package loader: resolves imports, filters files by build constraint,
//! and produces a deterministic topological package order. Grounded on
//! `examples/original_source/load.go`.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::LoadError;

/// Capability set a host must provide to resolve package source — an
/// in-memory filesystem for tests/`Eval`, or a real one behind the
/// `real-fs` feature (spec.md §6.3's `WithLoaders`).
pub trait VirtualFs {
    fn glob(&self, package: &str) -> Vec<String>;
    fn read_file(&self, path: &str) -> Option<String>;
}

/// An in-memory filesystem, keyed by `"package/file.goat"`.
#[derive(Default)]
pub struct MemFs {
    files: HashMap<String, String>,
}

impl MemFs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, path: impl Into<String>, contents: impl Into<String>) {
        self.files.insert(path.into(), contents.into());
    }
}

impl VirtualFs for MemFs {
    fn glob(&self, package: &str) -> Vec<String> {
        let prefix = format!("{package}/");
        let mut matches: Vec<String> = self
            .files
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .cloned()
            .collect();
        matches.sort();
        matches
    }

    fn read_file(&self, path: &str) -> Option<String> {
        self.files.get(path).cloned()
    }
}

#[cfg(feature = "real-fs")]
pub struct RealFs {
    pub root: std::path::PathBuf,
}

#[cfg(feature = "real-fs")]
impl VirtualFs for RealFs {
    fn glob(&self, package: &str) -> Vec<String> {
        let dir = self.root.join(package);
        let mut out = Vec::new();
        if let Ok(entries) = std::fs::read_dir(&dir) {
            for entry in entries.flatten() {
                if entry.path().extension().and_then(|e| e.to_str()) == Some("goat") {
                    if let Some(name) = entry.file_name().to_str() {
                        out.push(format!("{package}/{name}"));
                    }
                }
            }
        }
        out.sort();
        out
    }

    fn read_file(&self, path: &str) -> Option<String> {
        std::fs::read_to_string(self.root.join(path)).ok()
    }
}

/// A build-constraint boolean expression: `//go:build <expr>` over a
/// single recognized tag, `!`, `&&`, `||`, and parenthesized groups (the
/// tag name — `"goat"` in this crate — is the only one ever satisfied).
pub fn satisfies_constraint(expr: &str, tag: &str) -> Result<bool, LoadError> {
    let tokens: Vec<String> = tokenize_constraint(expr);
    let mut pos = 0;
    let result = parse_or(&tokens, &mut pos, tag)?;
    if pos != tokens.len() {
        return Err(LoadError::MalformedConstraint(expr.to_string()));
    }
    Ok(result)
}

fn tokenize_constraint(expr: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut chars = expr.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c == '(' || c == ')' {
            out.push(c.to_string());
            chars.next();
        } else if c == '!' {
            chars.next();
            out.push("!".to_string());
        } else if c == '&' && {
            chars.next();
            chars.peek() == Some(&'&')
        } {
            chars.next();
            out.push("&&".to_string());
        } else if c == '|' && {
            chars.next();
            chars.peek() == Some(&'|')
        } {
            chars.next();
            out.push("||".to_string());
        } else {
            let mut name = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_alphanumeric() || c == '_' {
                    name.push(c);
                    chars.next();
                } else {
                    break;
                }
            }
            out.push(name);
        }
    }
    out
}

fn parse_or(tokens: &[String], pos: &mut usize, tag: &str) -> Result<bool, LoadError> {
    let mut left = parse_and(tokens, pos, tag)?;
    while tokens.get(*pos).map(|s| s.as_str()) == Some("||") {
        *pos += 1;
        left = left || parse_and(tokens, pos, tag)?;
    }
    Ok(left)
}

fn parse_and(tokens: &[String], pos: &mut usize, tag: &str) -> Result<bool, LoadError> {
    let mut left = parse_unary(tokens, pos, tag)?;
    while tokens.get(*pos).map(|s| s.as_str()) == Some("&&") {
        *pos += 1;
        left = left && parse_unary(tokens, pos, tag)?;
    }
    Ok(left)
}

fn parse_unary(tokens: &[String], pos: &mut usize, tag: &str) -> Result<bool, LoadError> {
    match tokens.get(*pos).map(|s| s.as_str()) {
        Some("!") => {
            *pos += 1;
            Ok(!parse_unary(tokens, pos, tag)?)
        }
        Some("(") => {
            *pos += 1;
            let v = parse_or(tokens, pos, tag)?;
            if tokens.get(*pos).map(|s| s.as_str()) != Some(")") {
                return Err(LoadError::MalformedConstraint("unbalanced parens".into()));
            }
            *pos += 1;
            Ok(v)
        }
        Some(name) if !name.is_empty() => {
            *pos += 1;
            Ok(name == tag)
        }
        _ => Err(LoadError::MalformedConstraint("empty expression".into())),
    }
}

/// Extracts the `//go:build <expr>` directive from a file's first line, if
/// present.
pub fn extract_build_constraint(source: &str) -> Option<&str> {
    let first_line = source.lines().next()?;
    first_line.trim().strip_prefix("//go:build ")
}

/// Given a package's direct import names, returns a deterministic
/// topological order of all transitively required packages (the package
/// itself last), doing a BFS over a stable, sorted work queue. A package
/// with no source files loads as an empty synthetic package rather than
/// erroring, mirroring the reference's "missing package" fallback.
pub fn topo_order(
    root: &str,
    imports_of: impl Fn(&str) -> Vec<String>,
) -> Vec<String> {
    let mut order = Vec::new();
    let mut visited = HashSet::new();
    let mut stack = vec![root.to_string()];
    let mut visiting = HashSet::new();

    fn visit(
        name: &str,
        imports_of: &impl Fn(&str) -> Vec<String>,
        visited: &mut HashSet<String>,
        visiting: &mut HashSet<String>,
        order: &mut Vec<String>,
    ) {
        if visited.contains(name) || visiting.contains(name) {
            return;
        }
        visiting.insert(name.to_string());
        let mut deps = imports_of(name);
        deps.sort();
        for dep in &deps {
            visit(dep, imports_of, visited, visiting, order);
        }
        visiting.remove(name);
        visited.insert(name.to_string());
        order.push(name.to_string());
    }

    while let Some(next) = stack.pop() {
        visit(&next, &imports_of, &mut visited, &mut visiting, &mut order);
    }
    order
}

/// BFS-based dependency closure, used when the caller only needs the set of
/// packages reachable from root (not a build order).
pub fn reachable_packages(root: &str, imports_of: impl Fn(&str) -> Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut queue = VecDeque::new();
    queue.push_back(root.to_string());
    seen.insert(root.to_string());
    let mut out = Vec::new();
    while let Some(pkg) = queue.pop_front() {
        out.push(pkg.clone());
        let mut deps = imports_of(&pkg);
        deps.sort();
        for dep in deps {
            if seen.insert(dep.clone()) {
                queue.push_back(dep);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constraint_tag_matches() {
        assert!(satisfies_constraint("goat", "goat").unwrap());
        assert!(!satisfies_constraint("goat", "other").unwrap());
    }

    #[test]
    fn constraint_supports_boolean_combinators() {
        assert!(satisfies_constraint("!other", "goat").unwrap());
        assert!(satisfies_constraint("goat || other", "goat").unwrap());
        assert!(!satisfies_constraint("goat && other", "goat").unwrap());
        assert!(satisfies_constraint("(goat)", "goat").unwrap());
    }

    #[test]
    fn extracts_directive_from_first_line() {
        let src = "//go:build goat\npackage main\n";
        assert_eq!(extract_build_constraint(src), Some("goat"));
    }

    #[test]
    fn topo_order_is_deterministic_and_dependencies_first() {
        let mut deps: HashMap<&str, Vec<String>> = HashMap::new();
        deps.insert("main", vec!["b".into(), "a".into()]);
        deps.insert("a", vec![]);
        deps.insert("b", vec!["a".into()]);
        let order = topo_order("main", |p| deps.get(p).cloned().unwrap_or_default());
        assert_eq!(order, vec!["a", "b", "main"]);
    }

    #[test]
    fn missing_package_resolves_to_empty_dependency_list() {
        let order = topo_order("main", |p| {
            if p == "main" {
                vec!["missing".into()]
            } else {
                vec![]
            }
        });
        assert_eq!(order, vec!["missing", "main"]);
    }
}
