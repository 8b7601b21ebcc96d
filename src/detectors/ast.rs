//! detectors/ast.rs
//!
//! Python parsing shared by the smell detector and the production
//! function inventory.

use std::cell::RefCell;

use tree_sitter::{Node, Parser, Tree};

use crate::error::ParseError;

thread_local! {
    static PY_PARSER: RefCell<Option<Parser>> = RefCell::new(make_python_parser());
}

fn make_python_parser() -> Option<Parser> {
    let mut p = Parser::new();
    p.set_language(&tree_sitter_python::language()).ok()?;
    Some(p)
}

pub fn parse_python(source: &str) -> Option<Tree> {
    PY_PARSER.with(|p| p.borrow_mut().as_mut()?.parse(source, None))
}

/// Statements the grammar still accepts but Python 3 rejects.
const PY2_ONLY: [&str; 2] = ["print_statement", "exec_statement"];

/// Parses `source` and rejects any tree containing error or missing nodes,
/// or Python 2 only statements.
pub fn parse_strict(source: &str) -> Result<Tree, ParseError> {
    let Some(tree) = parse_python(source) else {
        return Err(ParseError { line: 1, column: 1 });
    };

    match first_invalid(tree.root_node()) {
        None => Ok(tree),
        Some(node) => {
            let at = node.start_position();
            Err(ParseError {
                line: at.row + 1,
                column: at.column + 1,
            })
        }
    }
}

/// First node in document order that makes the source invalid.
fn first_invalid(root: Node) -> Option<Node> {
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        if node.is_error() || node.is_missing() || PY2_ONLY.contains(&node.kind()) {
            return Some(node);
        }
        let mut cursor = node.walk();
        let children: Vec<Node> = node.children(&mut cursor).collect();
        stack.extend(children.into_iter().rev());
    }
    None
}

pub fn node_text<'a>(node: Node, src: &'a [u8]) -> &'a str {
    node.utf8_text(src).unwrap_or("")
}

/// Name of a `def`, looking through a decorator wrapper.
pub fn function_name<'a>(node: Node, src: &'a [u8]) -> Option<&'a str> {
    let def = match node.kind() {
        "function_definition" => node,
        "decorated_definition" => node
            .child_by_field_name("definition")
            .filter(|d| d.kind() == "function_definition")?,
        _ => return None,
    };

    def.child_by_field_name("name").map(|n| node_text(n, src))
}

/// Free functions declared at module level, in declaration order,
/// without duplicates. Methods and nested functions are not included.
pub fn extract_free_functions(src: &str) -> Vec<String> {
    let Some(tree) = parse_python(src) else {
        return Vec::new();
    };

    let root = tree.root_node();
    let bytes = src.as_bytes();
    let mut functions: Vec<String> = Vec::new();

    let mut w = root.walk();
    for node in root.children(&mut w) {
        if let Some(name) = function_name(node, bytes) {
            if !name.is_empty() && !functions.iter().any(|f| f == name) {
                functions.push(name.to_string());
            }
        }
    }

    functions
}
