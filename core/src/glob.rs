//! Include/exclude patterns over forward-slash relative paths.
//!
//! `*` stays within one segment, `**` spans zero or more segments, `?` is one
//! non-separator character, `[...]` is a class (`!` or `^` negates), and a
//! trailing `/` means "this directory and everything below it". Patterns
//! always match the whole path.

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(char),
    Any,
    Star,
    Globstar,
    /// A final `/**`: the directory itself or anything below it.
    Subtree,
    Class { negated: bool, items: Vec<ClassItem> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ClassItem {
    Char(char),
    Range(char, char),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    source: String,
    tokens: Vec<Token>,
}

impl Pattern {
    pub fn new(pattern: &str) -> Self {
        let mut source = pattern.replace('\\', "/");
        while let Some(rest) = source.strip_prefix("./") {
            source = rest.to_string();
        }
        if source.ends_with('/') {
            source.push_str("**");
        }
        Self {
            tokens: tokenize(&source),
            source,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, path: &str) -> bool {
        let path: Vec<char> = path.chars().collect();
        match_tokens(&self.tokens, &path)
    }
}

fn tokenize(pattern: &str) -> Vec<Token> {
    let chars: Vec<char> = pattern.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' if chars.get(i + 1) == Some(&'*') => {
                let mut j = i;
                while chars.get(j) == Some(&'*') {
                    j += 1;
                }
                let at_start = i == 0 || chars[i - 1] == '/';
                let at_end = j == chars.len() || chars[j] == '/';
                if at_start && at_end && j == chars.len() && tokens.len() > 1
                    && tokens.last() == Some(&Token::Literal('/'))
                {
                    tokens.pop();
                    tokens.push(Token::Subtree);
                } else if at_start && at_end {
                    tokens.push(Token::Globstar);
                    // `**/` also matches zero directories; the slash belongs to the globstar.
                    if chars.get(j) == Some(&'/') {
                        j += 1;
                    }
                } else {
                    tokens.push(Token::Star);
                }
                i = j;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '?' => {
                tokens.push(Token::Any);
                i += 1;
            }
            '[' => match parse_class(&chars, i) {
                Some((token, next)) => {
                    tokens.push(token);
                    i = next;
                }
                None => {
                    tokens.push(Token::Literal('['));
                    i += 1;
                }
            },
            c => {
                tokens.push(Token::Literal(c));
                i += 1;
            }
        }
    }
    tokens
}

/// Parses `[...]` starting at `start`; `None` when unterminated, in which
/// case the bracket is literal.
fn parse_class(chars: &[char], start: usize) -> Option<(Token, usize)> {
    let mut i = start + 1;
    let negated = matches!(chars.get(i), Some('!') | Some('^'));
    if negated {
        i += 1;
    }

    let mut items = Vec::new();
    let mut first = true;
    while i < chars.len() {
        let c = chars[i];
        if c == ']' && !first {
            return Some((Token::Class { negated, items }, i + 1));
        }
        first = false;
        if chars.get(i + 1) == Some(&'-') && chars.get(i + 2).is_some_and(|&end| end != ']') {
            items.push(ClassItem::Range(c, chars[i + 2]));
            i += 3;
        } else {
            items.push(ClassItem::Char(c));
            i += 1;
        }
    }
    None
}

fn class_matches(negated: bool, items: &[ClassItem], c: char) -> bool {
    if c == '/' {
        return false;
    }
    let hit = items.iter().any(|item| match *item {
        ClassItem::Char(x) => x == c,
        ClassItem::Range(lo, hi) => lo <= c && c <= hi,
    });
    hit != negated
}

fn match_tokens(tokens: &[Token], path: &[char]) -> bool {
    let Some((token, rest)) = tokens.split_first() else {
        return path.is_empty();
    };

    match token {
        Token::Literal(c) => path.first() == Some(c) && match_tokens(rest, &path[1..]),
        Token::Any => path.first().is_some_and(|&c| c != '/') && match_tokens(rest, &path[1..]),
        Token::Class { negated, items } => {
            path.first().is_some_and(|&c| class_matches(*negated, items, c))
                && match_tokens(rest, &path[1..])
        }
        Token::Star => {
            let mut i = 0;
            loop {
                if match_tokens(rest, &path[i..]) {
                    return true;
                }
                if i == path.len() || path[i] == '/' {
                    return false;
                }
                i += 1;
            }
        }
        Token::Subtree => path.is_empty() || path.first() == Some(&'/'),
        Token::Globstar => {
            // Zero or more whole segments: try every segment boundary.
            if match_tokens(rest, path) {
                return true;
            }
            for (i, &c) in path.iter().enumerate() {
                if c == '/' && match_tokens(rest, &path[i + 1..]) {
                    return true;
                }
            }
            rest.is_empty()
        }
    }
}

/// Include/exclude filter. Excludes always win; an empty include list
/// includes everything.
#[derive(Debug, Clone, Default)]
pub struct PathFilter {
    includes: Vec<Pattern>,
    excludes: Vec<Pattern>,
}

impl PathFilter {
    pub fn new<S: AsRef<str>>(includes: &[S], excludes: &[S]) -> Self {
        Self {
            includes: includes.iter().map(|p| Pattern::new(p.as_ref())).collect(),
            excludes: excludes.iter().map(|p| Pattern::new(p.as_ref())).collect(),
        }
    }

    pub fn is_excluded(&self, rel: &str) -> bool {
        self.excludes.iter().any(|p| p.matches(rel))
    }

    /// True when `rel` or one of its ancestor directories matches an include.
    pub fn is_included(&self, rel: &str) -> bool {
        if self.includes.is_empty() {
            return true;
        }
        ancestors_and_self(rel).any(|candidate| self.includes.iter().any(|p| p.matches(candidate)))
    }

    /// Directory pruning: an excluded directory is never descended into.
    pub fn prunes_dir(&self, rel: &str) -> bool {
        self.is_excluded(rel)
    }

    pub fn accepts_file(&self, rel: &str) -> bool {
        !self.is_excluded(rel) && self.is_included(rel)
    }
}

fn ancestors_and_self(rel: &str) -> impl Iterator<Item = &str> {
    rel.match_indices('/')
        .map(move |(i, _)| &rel[..i])
        .chain(std::iter::once(rel))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(pattern: &str, path: &str) -> bool {
        Pattern::new(pattern).matches(path)
    }

    #[test]
    fn test_star_stays_in_segment() {
        assert!(m("*.md", "MEMORY.md"));
        assert!(!m("*.md", "memory/notes.md"));
        assert!(m("memory/*.md", "memory/notes.md"));
        assert!(m("memory/*", "memory/"));
        assert!(!m("memory/*", "memory/a/b"));
    }

    #[test]
    fn test_globstar_spans_segments() {
        assert!(m("**/*.md", "MEMORY.md"));
        assert!(m("**/*.md", "a/b/c/notes.md"));
        assert!(m("workspace/**/index.js", "workspace/index.js"));
        assert!(m("workspace/**/index.js", "workspace/skills/a/index.js"));
        assert!(!m("workspace/**/index.js", "other/skills/index.js"));
        assert!(m("workspace/**", "workspace/a/b"));
        assert!(m("**", "anything/at/all"));
    }

    #[test]
    fn test_question_mark_and_classes() {
        assert!(m("file?.txt", "file1.txt"));
        assert!(!m("file?.txt", "file/.txt"));
        assert!(!m("file?.txt", "file10.txt"));
        assert!(m("log[0-9].txt", "log7.txt"));
        assert!(!m("log[0-9].txt", "logx.txt"));
        assert!(m("log[!0-9].txt", "logx.txt"));
        assert!(m("log[^0-9].txt", "logx.txt"));
        assert!(!m("log[!0-9].txt", "log3.txt"));
        assert!(m("a[]]b", "a]b"));
        assert!(m("a[b", "a[b"));
    }

    #[test]
    fn test_trailing_slash_means_subtree() {
        assert!(m("media/", "media/photo.jpg"));
        assert!(m("media/", "media/2026/photo.jpg"));
        assert!(!m("media/", "mediakit/photo.jpg"));
        assert!(m("media/", "media"));
        assert!(!m("media/", "mediakit"));
        assert!(m("**/node_modules/**", "x/node_modules"));
        assert!(m("**/node_modules/**", "node_modules/pkg/index.js"));
        assert!(!m("**/node_modules/**", "x/node_modules_old"));
        assert!(m("a/**/b/**", "a/b"));
    }

    #[test]
    fn test_subtree_patterns_prune_their_directory() {
        let filter = PathFilter::new::<&str>(&[], &["media/", "**/node_modules/**"]);
        assert!(filter.prunes_dir("media"));
        assert!(filter.prunes_dir("workspace/skills/node_modules"));
        assert!(!filter.prunes_dir("workspace"));
        assert!(!filter.accepts_file("media/photo.jpg"));
    }

    #[test]
    fn test_whole_path_match() {
        assert!(!m("tmp", "workspace/tmp"));
        assert!(m("tmp", "tmp"));
        assert!(!m("tmp", "tmp/file"));
    }

    #[test]
    fn test_filter_excludes_win() {
        let filter = PathFilter::new(&["memory", "*.json"], &["memory/private/", "**/*.tmp"]);
        assert!(filter.accepts_file("memory/2026-01-01.md"));
        assert!(filter.accepts_file("openclaw.json"));
        assert!(!filter.accepts_file("MEMORY.md"));
        assert!(!filter.accepts_file("memory/private/key.md"));
        assert!(!filter.accepts_file("memory/scratch.tmp"));
        assert!(filter.prunes_dir("memory/private"));
        assert!(!filter.prunes_dir("memory"));
    }

    #[test]
    fn test_empty_includes_accept_everything() {
        let filter = PathFilter::new::<&str>(&[], &["tmp"]);
        assert!(filter.accepts_file("a/b/c.txt"));
        assert!(filter.prunes_dir("tmp"));
    }
}
