//! Lightweight SQL classification: no grammar, just enough lexing to name
//! the statement, list the tables it touches, and slam the door on
//! piggybacked statements. The heuristic deliberately over-extracts
//! (subquery tables are reported) because every extracted name must pass
//! access control.

use crate::error::ProxyError;

use strum_macros::AsRefStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
pub enum QueryCommand {
    Select,
    Insert,
    Update,
    Delete,
    Drop,
    Truncate,
    Alter,
    Create,
    Call,
    Prepare,
    Execute,
    Unknown,
}

impl QueryCommand {
    fn from_keyword(word: &str) -> QueryCommand {
        match word.to_ascii_uppercase().as_str() {
            "SELECT" => QueryCommand::Select,
            "INSERT" => QueryCommand::Insert,
            "UPDATE" => QueryCommand::Update,
            "DELETE" => QueryCommand::Delete,
            "DROP" => QueryCommand::Drop,
            "TRUNCATE" => QueryCommand::Truncate,
            "ALTER" => QueryCommand::Alter,
            "CREATE" => QueryCommand::Create,
            "CALL" => QueryCommand::Call,
            "PREPARE" => QueryCommand::Prepare,
            "EXECUTE" => QueryCommand::Execute,
            _ => QueryCommand::Unknown,
        }
    }

    /// Case-insensitive match against an operation name from the policy
    /// file ("SELECT", "drop", ...).
    pub fn matches_name(&self, name: &str) -> bool {
        self.as_ref().eq_ignore_ascii_case(name.trim())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedQuery {
    pub command: QueryCommand,
    /// Extracted table names, schema prefix preserved (`db.table`). For
    /// CALL statements the first slot holds the procedure name.
    pub tables: Vec<String>,
    /// The query exactly as received; logging and pattern matching run
    /// against this, never the stripped form.
    pub raw_sql: String,
    pub has_where_clause: bool,
}

/// Replaces block, `-- `, and `#` comments with spaces, leaving string
/// literals and everything else in place. Positions are preserved so later
/// scans stay aligned with the original text.
pub fn strip_comments(sql: &str) -> String {
    #[derive(PartialEq, Clone, Copy)]
    enum State {
        Normal,
        Single,
        Double,
        Backtick,
        Line,
        Block,
    }
    let bytes = sql.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut state = State::Normal;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match state {
            State::Normal => match b {
                b'\'' => {
                    state = State::Single;
                    out.push(b);
                }
                b'"' => {
                    state = State::Double;
                    out.push(b);
                }
                b'`' => {
                    state = State::Backtick;
                    out.push(b);
                }
                b'#' => {
                    state = State::Line;
                    out.push(b' ');
                }
                b'-' if bytes.get(i + 1) == Some(&b'-')
                    && bytes
                        .get(i + 2)
                        .map_or(true, |c| c.is_ascii_whitespace()) =>
                {
                    state = State::Line;
                    out.push(b' ');
                }
                b'/' if bytes.get(i + 1) == Some(&b'*') => {
                    state = State::Block;
                    out.push(b' ');
                    out.push(b' ');
                    i += 1;
                }
                _ => out.push(b),
            },
            State::Single | State::Double => {
                let quote = if state == State::Single { b'\'' } else { b'"' };
                out.push(b);
                if b == b'\\' && i + 1 < bytes.len() {
                    out.push(bytes[i + 1]);
                    i += 1;
                } else if b == quote {
                    if bytes.get(i + 1) == Some(&quote) {
                        out.push(quote);
                        i += 1;
                    } else {
                        state = State::Normal;
                    }
                }
            }
            State::Backtick => {
                out.push(b);
                if b == b'`' {
                    state = State::Normal;
                }
            }
            State::Line => {
                if b == b'\n' {
                    state = State::Normal;
                    out.push(b);
                } else {
                    out.push(b' ');
                }
            }
            State::Block => {
                if b == b'*' && bytes.get(i + 1) == Some(&b'/') {
                    state = State::Normal;
                    out.push(b' ');
                    out.push(b' ');
                    i += 1;
                } else {
                    out.push(b' ');
                }
            }
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Rejects anything after an unquoted `;` other than whitespace. Comments
/// are already spaces by the time this runs, so `; /* x */ DROP` and plain
/// piggybacks land in the same branch.
fn reject_multi_statement(stripped: &str) -> Result<(), ProxyError> {
    let bytes = stripped.as_bytes();
    let mut in_single = false;
    let mut in_double = false;
    let mut in_backtick = false;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match b {
            b'\\' if in_single || in_double => i += 1,
            b'\'' if !in_double && !in_backtick => in_single = !in_single,
            b'"' if !in_single && !in_backtick => in_double = !in_double,
            b'`' if !in_single && !in_double => in_backtick = !in_backtick,
            b';' if !in_single && !in_double && !in_backtick => {
                let rest = &stripped[i + 1..];
                if rest.chars().any(|c| !c.is_whitespace()) {
                    return Err(ProxyError::InvalidSql(
                        "multiple statements are not allowed".to_string(),
                    ));
                }
            }
            _ => {}
        }
        i += 1;
    }
    Ok(())
}

#[derive(Debug, PartialEq)]
enum Token {
    Word(String),
    Punct(char),
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$' || b == b'.'
}

/// Tokenizes the stripped text, folding backtick quoting into plain
/// identifiers (`` `db`.`t` `` becomes `db.t`) and dropping string
/// literal contents entirely.
fn tokenize(stripped: &str) -> Vec<Token> {
    let bytes = stripped.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b == b'\'' || b == b'"' {
            let quote = b;
            i += 1;
            while i < bytes.len() {
                if bytes[i] == b'\\' {
                    i += 1;
                } else if bytes[i] == quote {
                    if bytes.get(i + 1) == Some(&quote) {
                        i += 1;
                    } else {
                        break;
                    }
                }
                i += 1;
            }
        } else if b == b'`' || is_ident_byte(b) {
            let mut word = String::new();
            while i < bytes.len() {
                if bytes[i] == b'`' {
                    i += 1;
                    while i < bytes.len() && bytes[i] != b'`' {
                        word.push(bytes[i] as char);
                        i += 1;
                    }
                } else if is_ident_byte(bytes[i]) {
                    word.push(bytes[i] as char);
                } else {
                    break;
                }
                i += 1;
            }
            tokens.push(Token::Word(word));
            continue;
        } else if !b.is_ascii_whitespace() {
            tokens.push(Token::Punct(b as char));
        }
        i += 1;
    }
    tokens
}

fn is_table_keyword(word: &str) -> bool {
    matches!(
        word.to_ascii_uppercase().as_str(),
        "FROM" | "INTO" | "UPDATE" | "JOIN" | "TABLE" | "CALL"
    )
}

fn looks_like_identifier(word: &str) -> bool {
    !word.is_empty()
        && !word.chars().all(|c| c.is_ascii_digit() || c == '.')
        && QueryCommand::from_keyword(word) == QueryCommand::Unknown
        && !matches!(
            word.to_ascii_uppercase().as_str(),
            "WHERE" | "SET" | "VALUES" | "ORDER" | "GROUP" | "LEFT" | "RIGHT" | "INNER" | "OUTER"
        )
}

fn extract_tables(tokens: &[Token]) -> Vec<String> {
    let mut tables: Vec<String> = Vec::new();
    let mut idx = 0;
    while idx < tokens.len() {
        if let Token::Word(word) = &tokens[idx] {
            if is_table_keyword(word) {
                match tokens.get(idx + 1) {
                    // subquery: the outer slot is skipped, the inner FROM
                    // contributes on its own when the scan reaches it
                    Some(Token::Punct('(')) => {}
                    Some(Token::Word(next)) if looks_like_identifier(next) => {
                        let name = next.trim_matches('.').to_string();
                        if !name.is_empty() && !tables.contains(&name) {
                            tables.push(name);
                        }
                    }
                    _ => {}
                }
            }
        }
        idx += 1;
    }
    tables
}

/// Classifies one query. Unknown first keywords are not an error (policy
/// blocks them later); empty input and piggybacked statements are.
pub fn parse_query(sql: &str) -> Result<ParsedQuery, ProxyError> {
    if sql.trim().is_empty() {
        return Err(ProxyError::InvalidSql("empty query".to_string()));
    }
    let stripped = strip_comments(sql);
    if stripped.trim().is_empty() {
        return Err(ProxyError::InvalidSql("empty query".to_string()));
    }
    reject_multi_statement(&stripped)?;

    let tokens = tokenize(&stripped);
    let command = match tokens.first() {
        Some(Token::Word(first)) => QueryCommand::from_keyword(first),
        _ => QueryCommand::Unknown,
    };
    let tables = extract_tables(&tokens);
    let has_where_clause = tokens
        .iter()
        .any(|t| matches!(t, Token::Word(w) if w.eq_ignore_ascii_case("WHERE")));

    Ok(ParsedQuery {
        command,
        tables,
        raw_sql: sql.to_string(),
        has_where_clause,
    })
}
