//! Static extraction of imported modules from first-party source.

use reslock_schema::types::ModuleName;

/// Suppresses inference for the import on the same line.
pub const NO_INFER_PRAGMA: &str = "# reslock: no-infer-dep";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ParsedImport {
    pub module: ModuleName,
    /// 1-based line of the statement.
    pub line: usize,
    /// A weak import never produces an unowned-import diagnostic.
    pub weak: bool,
}

pub trait ImportParser: Send + Sync {
    fn parse(&self, source: &str) -> Vec<ParsedImport>;
}

/// Line-oriented scanner for `import` and `from ... import` statements.
///
/// Relative imports are skipped. Imports inside a `try:` block or its
/// handlers, and imports carrying the pragma, are weak.
#[derive(Debug, Clone, Copy, Default)]
pub struct PythonImportScanner;

impl ImportParser for PythonImportScanner {
    fn parse(&self, source: &str) -> Vec<ParsedImport> {
        let mut out = Vec::new();
        let mut try_stack: Vec<usize> = Vec::new();
        let mut in_string: Option<&str> = None;
        let mut lines = source.lines().enumerate().peekable();

        while let Some((idx, raw)) = lines.next() {
            if let Some(delim) = in_string {
                if raw.matches(delim).count() % 2 == 1 {
                    in_string = None;
                }
                continue;
            }
            let trimmed = raw.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            for delim in ["\"\"\"", "'''"] {
                if raw.matches(delim).count() % 2 == 1 {
                    in_string = Some(delim);
                }
            }

            let indent = raw.len() - raw.trim_start().len();
            while let Some(&frame) = try_stack.last() {
                if indent > frame || (indent == frame && is_try_clause(trimmed)) {
                    break;
                }
                try_stack.pop();
            }
            if trimmed == "try:" {
                try_stack.push(indent);
                continue;
            }

            if !(trimmed.starts_with("import ") || trimmed.starts_with("from ")) {
                continue;
            }

            // Join parenthesized and backslash continuations into one statement.
            let mut statement = strip_comment(trimmed).to_owned();
            let mut pragma = trimmed.contains(NO_INFER_PRAGMA);
            let open_paren = statement.contains('(') && !statement.contains(')');
            let mut continued = statement.ends_with('\\') || open_paren;
            while continued {
                let Some((_, next)) = lines.next() else { break };
                let next = next.trim();
                pragma |= next.contains(NO_INFER_PRAGMA);
                statement = statement.trim_end_matches('\\').to_owned();
                statement.push(' ');
                statement.push_str(strip_comment(next));
                continued = if open_paren {
                    !statement.contains(')')
                } else {
                    statement.ends_with('\\')
                };
            }

            let weak = pragma || !try_stack.is_empty();
            for module in parse_statement(&statement) {
                out.push(ParsedImport {
                    module: ModuleName::new(module),
                    line: idx + 1,
                    weak,
                });
            }
        }
        out
    }
}

fn is_try_clause(trimmed: &str) -> bool {
    trimmed.starts_with("except")
        || trimmed.starts_with("else:")
        || trimmed.starts_with("finally:")
}

fn strip_comment(line: &str) -> &str {
    line.find('#').map_or(line, |idx| &line[..idx]).trim_end()
}

/// Modules named by one (joined) import statement.
fn parse_statement(statement: &str) -> Vec<String> {
    let statement = statement.trim();
    if let Some(rest) = statement.strip_prefix("import ") {
        return rest
            .split(',')
            .filter_map(|part| part.split_whitespace().next())
            .filter(|m| is_dotted_name(m))
            .map(str::to_owned)
            .collect();
    }
    let Some(rest) = statement.strip_prefix("from ") else {
        return Vec::new();
    };
    let Some((base, names)) = rest.split_once(" import ") else {
        return Vec::new();
    };
    let base = base.trim();
    if base.starts_with('.') || !is_dotted_name(base) {
        return Vec::new();
    }
    let names = names.trim().trim_start_matches('(').trim_end_matches(')');
    let mut out = Vec::new();
    for name in names.split(',') {
        let Some(name) = name.split_whitespace().next() else {
            continue;
        };
        if name == "*" || !is_dotted_name(name) {
            out.push(base.to_owned());
        } else {
            // `from a import b` may import submodule `a.b`; lookup falls back to `a`.
            out.push(format!("{base}.{name}"));
        }
    }
    if out.is_empty() {
        out.push(base.to_owned());
    }
    out.dedup();
    out
}

fn is_dotted_name(s: &str) -> bool {
    !s.is_empty()
        && s.split('.').all(|part| {
            let mut chars = part.chars();
            chars
                .next()
                .is_some_and(|c| c.is_alphabetic() || c == '_')
                && chars.all(|c| c.is_alphanumeric() || c == '_')
        })
}
