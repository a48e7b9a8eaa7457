//! Multi-statement SQL script splitting.
//!
//! There is no SQL parser here. Scripts are split with a simple convention:
//!
//! ```text
//! create table audit(id integer primary key, note text);
//! -- begin block --
//! create trigger audit_note after insert on notes begin
//!     insert into audit(note) values (new.body);
//! end;
//! -- end block --
//! create index audit_note_idx on audit(note);
//! ```
//!
//! Text between unindented `-- begin block --` / `-- end block --` lines is executed verbatim as a
//! single statement. Everything else is split on a semicolon that ends a line.
//!
//! Nested or unbalanced delimiters are not supported. A `-- begin block --` without a matching end
//! is plain text, and a nested begin ends at the first `-- end block --` it meets (see the tests).

use regex::Regex;
use std::sync::LazyLock;

static BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?ms)^-- begin block --[ \t]*\r?\n(.*?)\r?\n-- end block --[ \t]*\r?$")
        .expect("invalid regex")
});

static TERMINATOR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r";\r?\n").expect("invalid regex"));

/// One segment of a script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptBlock {
    pub value: String,
    /// True for delimited blocks, which must run as one statement.
    pub is_block: bool,
}

impl ScriptBlock {
    fn plain(value: &str) -> Self {
        Self {
            value: value.trim().to_string(),
            is_block: false,
        }
    }

    fn block(value: &str) -> Self {
        Self {
            value: value.to_string(),
            is_block: true,
        }
    }
}

/// Split a script into plain segments and delimited blocks, in order.
///
/// Plain segments are trimmed; block bodies are kept verbatim. Blank segments are dropped.
pub fn parse_blocks(script: &str) -> Vec<ScriptBlock> {
    let mut blocks = Vec::new();
    let mut index = 0;

    for caps in BLOCK_RE.captures_iter(script) {
        let (Some(whole), Some(body)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        blocks.push(ScriptBlock::plain(&script[index..whole.start()]));
        blocks.push(ScriptBlock::block(body.as_str()));
        index = whole.end();
    }
    if index < script.len() {
        blocks.push(ScriptBlock::plain(&script[index..]));
    }

    blocks.retain(|b| !b.value.trim().is_empty());
    blocks
}

/// Split a script into the statements to execute, in order.
pub fn split_statements(script: &str) -> Vec<String> {
    let mut statements = Vec::new();
    for block in parse_blocks(script) {
        if block.is_block {
            statements.push(block.value);
        } else {
            statements.extend(
                TERMINATOR_RE
                    .split(&block.value)
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from),
            );
        }
    }
    statements
}
