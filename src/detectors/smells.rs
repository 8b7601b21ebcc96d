//! detectors/smells.rs
//!
//! Static test smell detection. Every rule sees every node of one
//! tree walk and reports how many occurrences that node contributes.

use tree_sitter::Node;

use crate::detectors::ast::{node_text, parse_strict};
use crate::error::ParseError;
use crate::state::{SmellKind, SmellReport};

pub trait SmellRule: Send + Sync {
    fn kind(&self) -> SmellKind;

    /// Occurrences contributed by `node` itself. Must not inspect
    /// anything outside the node's own subtree.
    fn visit(&self, node: Node, src: &[u8]) -> u32;
}

pub struct SmellDetector {
    rules: Vec<Box<dyn SmellRule>>,
}

impl Default for SmellDetector {
    fn default() -> Self {
        Self {
            rules: vec![
                Box::new(AssertionRoulette),
                Box::new(MagicNumber),
                Box::new(SleepyTest),
                Box::new(PrintStatement),
                Box::new(RedundantAssertion),
                Box::new(EmptyTest),
                Box::new(IgnoredTest),
            ],
        }
    }
}

impl SmellDetector {
    pub fn with_rule(mut self, rule: Box<dyn SmellRule>) -> Self {
        self.rules.push(rule);
        self
    }

    /// Unparsable source yields exactly `{syntax_error: 1}`.
    pub fn detect(&self, source: &str) -> SmellReport {
        self.analyze(source)
            .unwrap_or_else(|_| SmellReport::syntax_error())
    }

    /// Like `detect`, but hands back the parse failure so callers can
    /// report where it happened.
    pub fn analyze(&self, source: &str) -> Result<SmellReport, ParseError> {
        let tree = parse_strict(source)?;

        let src = source.as_bytes();
        let mut report = SmellReport::default();
        let mut stack = vec![tree.root_node()];

        while let Some(node) = stack.pop() {
            for rule in &self.rules {
                report.add(rule.kind(), rule.visit(node, src));
            }

            let mut cursor = node.walk();
            let children: Vec<Node> = node.children(&mut cursor).collect();
            stack.extend(children.into_iter().rev());
        }

        Ok(report)
    }
}

pub fn detect_test_smells(source: &str) -> SmellReport {
    SmellDetector::default().detect(source)
}

/* ============================================================
   Node helpers
   ============================================================ */

/// The operands of an assertion site: `self.assertX(...)` positional
/// arguments, or the tested expression of an `assert` statement.
struct Assertion<'t> {
    args: Vec<Node<'t>>,
    has_message: bool,
}

fn assertion<'t>(node: Node<'t>, src: &[u8]) -> Option<Assertion<'t>> {
    match node.kind() {
        "call" => {
            let func = node.child_by_field_name("function")?;
            if func.kind() != "attribute" {
                return None;
            }
            let attr = func.child_by_field_name("attribute")?;
            if !node_text(attr, src).starts_with("assert") {
                return None;
            }

            let arglist = node.child_by_field_name("arguments")?;
            let mut args = Vec::new();
            let mut has_message = false;

            let mut cursor = arglist.walk();
            for arg in arglist.named_children(&mut cursor) {
                match arg.kind() {
                    "comment" | "dictionary_splat" => {}
                    "keyword_argument" => {
                        let name = arg
                            .child_by_field_name("name")
                            .map(|n| node_text(n, src))
                            .unwrap_or("");
                        if name == "msg" {
                            has_message = true;
                        }
                    }
                    _ => args.push(arg),
                }
            }

            Some(Assertion { args, has_message })
        }
        "assert_statement" => {
            let mut cursor = node.walk();
            let exprs: Vec<Node> = node
                .named_children(&mut cursor)
                .filter(|n| n.kind() != "comment")
                .collect();
            let has_message = exprs.len() > 1;
            let args = exprs.into_iter().take(1).collect();

            Some(Assertion { args, has_message })
        }
        _ => None,
    }
}

fn is_bool_literal(node: Node) -> bool {
    matches!(node.kind(), "true" | "false")
}

fn called_function<'t>(node: Node<'t>) -> Option<Node<'t>> {
    if node.kind() != "call" {
        return None;
    }
    node.child_by_field_name("function")
}

fn is_test_name(name: &str) -> bool {
    name.starts_with("test")
}

/// Last dotted segment of a decorator expression, looking through a call.
fn decorator_name<'a>(decorator: Node, src: &'a [u8]) -> Option<&'a str> {
    let mut cursor = decorator.walk();
    let mut expr = decorator
        .named_children(&mut cursor)
        .find(|n| n.kind() != "comment")?;

    if expr.kind() == "call" {
        expr = expr.child_by_field_name("function")?;
    }

    match expr.kind() {
        "identifier" => Some(node_text(expr, src)),
        "attribute" => expr
            .child_by_field_name("attribute")
            .map(|a| node_text(a, src)),
        _ => None,
    }
}

/// `pass`, `...`, comments and bare string literals (docstrings).
fn is_placeholder(stmt: Node) -> bool {
    match stmt.kind() {
        "pass_statement" | "comment" => true,
        "expression_statement" => {
            stmt.named_child_count() == 1
                && stmt
                    .named_child(0)
                    .map(|c| matches!(c.kind(), "ellipsis" | "string" | "concatenated_string"))
                    .unwrap_or(false)
        }
        _ => false,
    }
}

/* ============================================================
   Rules
   ============================================================ */

/// An assertion without an explanatory message. A lone literal boolean
/// belongs to `RedundantAssertion` instead and is not counted here.
pub struct AssertionRoulette;

impl SmellRule for AssertionRoulette {
    fn kind(&self) -> SmellKind {
        SmellKind::AssertionRoulette
    }

    fn visit(&self, node: Node, src: &[u8]) -> u32 {
        match assertion(node, src) {
            Some(a) if !a.has_message && a.args.len() == 1 && !is_bool_literal(a.args[0]) => 1,
            _ => 0,
        }
    }
}

pub struct MagicNumber;

impl SmellRule for MagicNumber {
    fn kind(&self) -> SmellKind {
        SmellKind::MagicNumber
    }

    fn visit(&self, node: Node, src: &[u8]) -> u32 {
        let text = node_text(node, src);
        let magic = match node.kind() {
            "integer" => is_magic_integer(text),
            "float" => is_magic_float(text),
            _ => false,
        };
        u32::from(magic)
    }
}

fn is_magic_integer(text: &str) -> bool {
    let t = text.replace('_', "").to_ascii_lowercase();
    if t.ends_with('j') {
        return false;
    }

    let parsed = if let Some(hex) = t.strip_prefix("0x") {
        u128::from_str_radix(hex, 16).ok()
    } else if let Some(oct) = t.strip_prefix("0o") {
        u128::from_str_radix(oct, 8).ok()
    } else if let Some(bin) = t.strip_prefix("0b") {
        u128::from_str_radix(bin, 2).ok()
    } else {
        t.parse::<u128>().ok()
    };

    !matches!(parsed, Some(0) | Some(1))
}

fn is_magic_float(text: &str) -> bool {
    let t = text.replace('_', "").to_ascii_lowercase();
    if t.ends_with('j') {
        return false;
    }

    match t.parse::<f64>() {
        Ok(v) => v != 0.0 && v != 1.0,
        Err(_) => true,
    }
}

pub struct SleepyTest;

impl SmellRule for SleepyTest {
    fn kind(&self) -> SmellKind {
        SmellKind::SleepyTest
    }

    fn visit(&self, node: Node, src: &[u8]) -> u32 {
        let sleepy = called_function(node)
            .filter(|f| f.kind() == "attribute")
            .and_then(|f| f.child_by_field_name("attribute"))
            .map(|a| node_text(a, src) == "sleep")
            .unwrap_or(false);
        u32::from(sleepy)
    }
}

pub struct PrintStatement;

impl SmellRule for PrintStatement {
    fn kind(&self) -> SmellKind {
        SmellKind::PrintStatement
    }

    fn visit(&self, node: Node, src: &[u8]) -> u32 {
        let printing = called_function(node)
            .map(|f| f.kind() == "identifier" && node_text(f, src) == "print")
            .unwrap_or(false);
        u32::from(printing)
    }
}

/// One count per literal boolean operand of an assertion.
pub struct RedundantAssertion;

impl SmellRule for RedundantAssertion {
    fn kind(&self) -> SmellKind {
        SmellKind::RedundantAssertion
    }

    fn visit(&self, node: Node, src: &[u8]) -> u32 {
        assertion(node, src)
            .map(|a| a.args.iter().filter(|n| is_bool_literal(**n)).count() as u32)
            .unwrap_or(0)
    }
}

pub struct EmptyTest;

impl SmellRule for EmptyTest {
    fn kind(&self) -> SmellKind {
        SmellKind::EmptyTest
    }

    fn visit(&self, node: Node, src: &[u8]) -> u32 {
        if node.kind() != "function_definition" {
            return 0;
        }
        let named_test = node
            .child_by_field_name("name")
            .map(|n| is_test_name(node_text(n, src)))
            .unwrap_or(false);
        if !named_test {
            return 0;
        }

        let Some(body) = node.child_by_field_name("body") else {
            return 1;
        };
        let mut cursor = body.walk();
        let empty = body.named_children(&mut cursor).all(is_placeholder);
        u32::from(empty)
    }
}

/// Skip-decorated test functions and `Test*` classes, one count per
/// skip decorator.
pub struct IgnoredTest;

impl SmellRule for IgnoredTest {
    fn kind(&self) -> SmellKind {
        SmellKind::IgnoredTest
    }

    fn visit(&self, node: Node, src: &[u8]) -> u32 {
        if node.kind() != "decorated_definition" {
            return 0;
        }
        let Some(def) = node.child_by_field_name("definition") else {
            return 0;
        };
        let name = def
            .child_by_field_name("name")
            .map(|n| node_text(n, src))
            .unwrap_or("");

        let is_test = match def.kind() {
            "function_definition" => is_test_name(name),
            "class_definition" => name.starts_with("Test"),
            _ => false,
        };
        if !is_test {
            return 0;
        }

        let mut cursor = node.walk();
        node.named_children(&mut cursor)
            .filter(|n| n.kind() == "decorator")
            .filter_map(|d| decorator_name(d, src))
            .filter(|name| name.to_ascii_lowercase().contains("skip"))
            .count() as u32
    }
}
