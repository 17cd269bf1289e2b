//! Identifier validation, quoting, and on-disk file name mapping.
//!
//! Table names reach us from the live catalog and from handoff records and are
//! spliced into DDL (identifiers cannot be bound as parameters), so every name
//! is validated and backtick-quoted before use.

use crate::error::{BackupError, Result};

/// Maximum identifier length accepted by MariaDB.
const MAX_IDENTIFIER_LENGTH: usize = 64;

/// Validate an identifier for security issues.
///
/// Rejects:
/// - Empty identifiers
/// - Identifiers containing null bytes (injection vector)
/// - Identifiers exceeding maximum length
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(BackupError::Config(
            "Identifier cannot be empty".to_string(),
        ));
    }

    if name.contains('\0') {
        return Err(BackupError::Config(format!(
            "SECURITY: Identifier contains null byte (possible injection attempt): {:?}",
            name
        )));
    }

    if name.chars().count() > MAX_IDENTIFIER_LENGTH {
        return Err(BackupError::Config(format!(
            "SECURITY: Identifier exceeds maximum length of {} characters: {:?}",
            MAX_IDENTIFIER_LENGTH, name
        )));
    }

    Ok(())
}

/// Quote a MariaDB identifier using backticks.
///
/// ```ignore
/// assert_eq!(quote_ident("users")?, "`users`");
/// assert_eq!(quote_ident("table`name")?, "`table``name`");
/// ```
pub fn quote_ident(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("`{}`", name.replace('`', "``")))
}

/// Quote a list of identifiers and join them with `, `.
pub fn quote_list<'a, I>(names: I) -> Result<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let quoted = names
        .into_iter()
        .map(quote_ident)
        .collect::<Result<Vec<_>>>()?;
    Ok(quoted.join(", "))
}

/// Map a table name to the stem the server uses for its files.
///
/// The server keeps `[0-9A-Za-z_]` verbatim and writes any other ASCII
/// character as `@` followed by four lowercase hex digits, so `my-table`
/// lives in `my@002dtable.ibd`. Non-ASCII names use a lookup table on the
/// server side that is not reproduced here and are rejected.
pub fn file_stem(table: &str) -> Result<String> {
    validate_identifier(table)?;
    let mut stem = String::with_capacity(table.len());
    for ch in table.chars() {
        if ch.is_ascii_alphanumeric() || ch == '_' {
            stem.push(ch);
        } else if ch.is_ascii() {
            stem.push_str(&format!("@{:04x}", ch as u32));
        } else {
            return Err(BackupError::Config(format!(
                "table name {:?} contains non-ASCII characters and cannot be mapped to a file name",
                table
            )));
        }
    }
    Ok(stem)
}
