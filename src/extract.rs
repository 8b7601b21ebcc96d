//! Fenced code block extraction from raw generator output.

use std::sync::OnceLock;

use regex::Regex;

fn fence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Opening fence, optional info string on its own line, lazy body, closing fence.
    RE.get_or_init(|| Regex::new(r"(?s)```(?:[\w+.\-]*[ \t]*\r?\n)?(.*?)```").unwrap())
}

/// All fenced regions in order of appearance. Leading whitespace is
/// stripped and blocks with no content are dropped.
pub fn extract_code_blocks(text: &str) -> Vec<String> {
    fence_re()
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().trim_start())
        .filter(|body| !body.trim().is_empty())
        .map(str::to_owned)
        .collect()
}

/// The canonical block: the earliest one.
pub fn first_code_block(text: &str) -> Option<String> {
    extract_code_blocks(text).into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_tagged_and_untagged_blocks_in_order() {
        let text = "Sure!\n```python\nimport unittest\n```\nand\n```\nprint(1)\n```\n";
        let blocks = extract_code_blocks(text);
        assert_eq!(blocks, vec!["import unittest\n", "print(1)\n"]);
    }

    #[test]
    fn other_language_tags_are_not_part_of_the_body() {
        let text = "```py\nassert f() == 0\n```";
        assert_eq!(first_code_block(text).as_deref(), Some("assert f() == 0\n"));
    }

    #[test]
    fn inline_fence_without_newline_keeps_body() {
        assert_eq!(first_code_block("```x = 1```").as_deref(), Some("x = 1"));
    }

    #[test]
    fn no_blocks_or_empty_blocks_yield_nothing() {
        assert!(extract_code_blocks("def test_x(): pass").is_empty());
        assert!(extract_code_blocks("```python\n\n```").is_empty());
        assert_eq!(first_code_block("unclosed ```python\nx = 1"), None);
    }

    #[test]
    fn first_block_wins() {
        let text = "```\nfirst = 1\n```\n```\nsecond = 2\n```";
        assert_eq!(first_code_block(text).as_deref(), Some("first = 1\n"));
    }
}
