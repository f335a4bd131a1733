//! GraphQL query cost estimation and slimming.
//!
//! The estimate gates the call before it leaves the process; the platform's
//! reported actual cost supersedes it for bucket bookkeeping afterwards.
//! Slimming keeps estimated costs honest: dead selection weight is stripped
//! before estimation.

/// Pre-flight cost estimate from the query text:
/// base 1, plus `2 * ceil(n / 100)` per `first:`/`last:` connection
/// argument, plus 2 per `edges` block. Non-literal page sizes (variables)
/// are priced as 100.
pub fn estimate_cost(query: &str) -> f64 {
    let mut cost = 1.0;

    for keyword in ["first", "last"] {
        for n in argument_values(query, keyword) {
            cost += 2.0 * (n as f64 / 100.0).ceil();
        }
    }

    cost += 2.0 * count_field_blocks(query, "edges") as f64;

    cost
}

/// Strip comments, dead weight, and redundant whitespace. `keep_typename`
/// preserves `__typename` selections for callers that asked for them.
pub fn slim_query(query: &str, keep_typename: bool) -> String {
    let mut slimmed = strip_comments(query);

    if !keep_typename {
        slimmed = slimmed
            .split_whitespace()
            .filter(|token| *token != "__typename")
            .collect::<Vec<_>>()
            .join(" ");
    }

    // pageInfo without a cursor argument is never consumed by the caller.
    if !has_cursor_argument(&slimmed) {
        slimmed = strip_field_block(&slimmed, "pageInfo");
    }

    slimmed.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn strip_comments(query: &str) -> String {
    query
        .lines()
        .map(|line| match line.find('#') {
            Some(idx) => &line[..idx],
            None => line,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn has_cursor_argument(query: &str) -> bool {
    ["after", "before"]
        .iter()
        .any(|kw| !argument_positions(query, kw).is_empty())
}

/// Byte offsets of `keyword :` argument occurrences, ignoring field
/// selections of the same name.
fn argument_positions(query: &str, keyword: &str) -> Vec<usize> {
    let bytes = query.as_bytes();
    let mut positions = Vec::new();
    let mut search_from = 0;
    while let Some(found) = query[search_from..].find(keyword) {
        let start = search_from + found;
        let end = start + keyword.len();
        search_from = end;

        // Must be a standalone word followed by a colon.
        let word_start = start == 0 || !is_name_byte(bytes[start - 1]);
        let rest = query[end..].trim_start();
        if word_start && rest.starts_with(':') {
            positions.push(start);
        }
    }
    positions
}

/// Literal integer values of `keyword: n` arguments. Variables price as 100.
fn argument_values(query: &str, keyword: &str) -> Vec<u64> {
    argument_positions(query, keyword)
        .into_iter()
        .map(|pos| {
            let after_colon = query[pos + keyword.len()..]
                .trim_start()
                .trim_start_matches(':')
                .trim_start();
            let digits: String = after_colon
                .chars()
                .take_while(|c| c.is_ascii_digit())
                .collect();
            digits.parse().unwrap_or(100)
        })
        .collect()
}

fn is_name_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Count `name {` field blocks.
fn count_field_blocks(query: &str, name: &str) -> usize {
    let bytes = query.as_bytes();
    let mut count = 0;
    let mut search_from = 0;
    while let Some(found) = query[search_from..].find(name) {
        let start = search_from + found;
        let end = start + name.len();
        search_from = end;

        let word_start = start == 0 || !is_name_byte(bytes[start - 1]);
        let rest = query[end..].trim_start();
        if word_start && rest.starts_with('{') {
            count += 1;
        }
    }
    count
}

/// Remove every `name { ... }` block, brace-balanced.
fn strip_field_block(query: &str, name: &str) -> String {
    let mut result = query.to_string();
    while let Some((start, close)) = find_field_block(&result, name) {
        result.replace_range(start..=close, " ");
    }
    result
}

/// Locate the first `name { ... }` block, returning the span from the field
/// name through its closing brace.
fn find_field_block(source: &str, name: &str) -> Option<(usize, usize)> {
    let mut search_from = 0;
    while let Some(found) = source[search_from..].find(name) {
        let start = search_from + found;
        let end = start + name.len();
        search_from = end;

        let word_start = start == 0 || !is_name_byte(source.as_bytes()[start - 1]);
        let rest = &source[end..];
        let trimmed = rest.trim_start();
        if word_start && trimmed.starts_with('{') {
            let brace_open = end + (rest.len() - trimmed.len());
            if let Some(close) = matching_brace(source, brace_open) {
                return Some((start, close));
            }
        }
    }
    None
}

/// Offset of the brace matching the one at `open`, if balanced.
fn matching_brace(source: &str, open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (offset, ch) in source[open..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(open + offset);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_query_costs_base_one() {
        assert_eq!(estimate_cost("{ shop { name } }"), 1.0);
    }

    #[test]
    fn connection_arguments_add_paged_cost() {
        // first: 50 -> 2 * ceil(50/100) = 2; edges block -> 2; base 1.
        let query = "{ products(first: 50) { edges { node { id } } } }";
        assert_eq!(estimate_cost(query), 5.0);
    }

    #[test]
    fn large_pages_scale_with_page_count() {
        // first: 250 -> 2 * ceil(250/100) = 6; edges -> 2; base 1.
        let query = "{ orders(first: 250) { edges { node { id } } } }";
        assert_eq!(estimate_cost(query), 9.0);
    }

    #[test]
    fn nested_connections_accumulate() {
        let query = r#"{
            products(first: 100) {
                edges {
                    node {
                        variants(first: 10) { edges { node { id } } }
                    }
                }
            }
        }"#;
        // base 1 + first:100 (2) + first:10 (2) + two edges blocks (4).
        assert_eq!(estimate_cost(query), 9.0);
    }

    #[test]
    fn variable_page_size_prices_as_full_page() {
        let query = "{ products(first: $count) { edges { node { id } } } }";
        assert_eq!(estimate_cost(query), 5.0);
    }

    #[test]
    fn field_named_first_is_not_an_argument() {
        assert_eq!(estimate_cost("{ shipment { first last } }"), 1.0);
    }

    #[test]
    fn slim_strips_comments_and_whitespace() {
        let query = "{\n  shop {   # the shop\n    name\n  }\n}";
        assert_eq!(slim_query(query, false), "{ shop { name } }");
    }

    #[test]
    fn slim_drops_typename_unless_requested() {
        let query = "{ shop { __typename name } }";
        assert_eq!(slim_query(query, false), "{ shop { name } }");
        assert_eq!(slim_query(query, true), "{ shop { __typename name } }");
    }

    #[test]
    fn slim_drops_page_info_without_cursor() {
        let query =
            "{ products(first: 10) { edges { node { id } } pageInfo { hasNextPage endCursor } } }";
        let slimmed = slim_query(query, false);
        assert!(!slimmed.contains("pageInfo"));
        assert!(slimmed.contains("edges"));
    }

    #[test]
    fn slim_keeps_page_info_with_cursor() {
        let query = r#"{ products(first: 10, after: "abc") { pageInfo { endCursor } } }"#;
        assert!(slim_query(query, false).contains("pageInfo"));
    }

    #[test]
    fn slimming_reduces_estimated_cost() {
        let wasteful =
            "{ products(first: 10) { edges { node { id } } pageInfo { hasNextPage } } }";
        let slimmed = slim_query(wasteful, false);
        assert!(estimate_cost(&slimmed) <= estimate_cost(wasteful));
    }
}
