// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

// Address-pattern matching, one segment at a time: `?` any char, `*`
// greedy any run, `[a-z]` / `[!a-z]` character sets with ranges, `{a,b}`
// alternatives. A malformed pattern simply fails to match.

/// Does this address need the pattern tree, or can it take the hashed
/// full-path shortcut?
pub fn has_pattern(addr: &str) -> bool {
    addr.bytes().any(|b| b == b'*' || b == b'?' || b == b'[' || b == b'{')
}

/// Match a single address segment against a single pattern segment.
pub fn match_segment(pattern: &str, target: &str) -> bool {
    match_bytes(pattern.as_bytes(), target.as_bytes())
}

fn match_bytes(p: &[u8], s: &[u8]) -> bool {
    if p.is_empty() {
        return s.is_empty();
    }
    match p[0] {
        b'*' => {
            // greedy with backtracking
            (0..s.len() + 1).rev().any(|skip| match_bytes(&p[1..], &s[skip..]))
        }
        b'?' => !s.is_empty() && match_bytes(&p[1..], &s[1..]),
        b'[' => {
            if s.is_empty() {
                return false;
            }
            match match_set(&p[1..], s[0]) {
                Some((rest, hit)) => hit && match_bytes(rest, &s[1..]),
                None => false,
            }
        }
        b'{' => match_alternatives(&p[1..], s),
        c => !s.is_empty() && s[0] == c && match_bytes(&p[1..], &s[1..]),
    }
}

/// Match one char against a `[...]` set; returns the pattern remainder
/// after `]` and whether the char was accepted.
fn match_set(p: &[u8], c: u8) -> Option<(&[u8], bool)> {
    let mut at = 0;
    let negated = p.first() == Some(&b'!');
    if negated {
        at = 1;
    }
    let mut hit = false;
    while at < p.len() && p[at] != b']' {
        if at + 2 < p.len() && p[at + 1] == b'-' && p[at + 2] != b']' {
            if p[at] <= c && c <= p[at + 2] {
                hit = true;
            }
            at += 3;
        } else {
            if p[at] == c {
                hit = true;
            }
            at += 1;
        }
    }
    if at >= p.len() {
        return None; // unterminated set
    }
    Some((&p[at + 1..], hit != negated))
}

/// Match `{alt1,alt2,…}` by trying each alternative as a prefix.
fn match_alternatives(p: &[u8], s: &[u8]) -> bool {
    let close = match p.iter().position(|&b| b == b'}') {
        Some(at) => at,
        None => return false,
    };
    let rest = &p[close + 1..];

    p[..close].split(|&b| b == b',')
        .any(|alt| s.len() >= alt.len() &&
                   &s[..alt.len()] == alt &&
                   match_bytes(rest, &s[alt.len()..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_segments_match_exactly() {
        assert!(match_segment("echo", "echo"));
        assert!(!match_segment("echo", "echo2"));
        assert!(!match_segment("echo2", "echo"));
    }

    #[test]
    fn question_mark_matches_one_char() {
        assert!(match_segment("e?ho", "echo"));
        assert!(!match_segment("e?ho", "eho"));
    }

    #[test]
    fn star_is_greedy_with_backtracking() {
        assert!(match_segment("*", "anything"));
        assert!(match_segment("a*c", "abc"));
        assert!(match_segment("a*c", "ac"));
        assert!(match_segment("a*bc", "axbxbc"));
        assert!(!match_segment("a*d", "abc"));
    }

    #[test]
    fn sets_and_ranges() {
        assert!(match_segment("x[0-9]", "x5"));
        assert!(!match_segment("x[0-9]", "xa"));
        assert!(match_segment("x[!0-9]", "xa"));
        assert!(match_segment("x[abc]y", "xby"));
        assert!(!match_segment("x[abc", "xb")); // unterminated
    }

    #[test]
    fn alternatives() {
        assert!(match_segment("{foo,bar}1", "bar1"));
        assert!(!match_segment("{foo,bar}1", "baz1"));
        assert!(match_segment("pre{a,bb}post", "prebbpost"));
    }

    #[test]
    fn pattern_detection() {
        assert!(has_pattern("/svc/a/*"));
        assert!(has_pattern("/svc/{x,y}"));
        assert!(!has_pattern("/svc/a/1"));
    }
}
