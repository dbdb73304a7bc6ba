use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum NameError {
    #[error("File name is empty")]
    Empty,

    #[error("File name contains null byte")]
    NullByte,
}

//===============
// File names
//===============

/// Reduce a client-supplied file name to its final path component.
///
/// Separators from both Unix and Windows clients are honored, so a name like
/// `C:\docs\a.bin` or `dir/a.bin` stages as `a.bin`. Names that reduce to
/// nothing (or to a dot component) are rejected rather than guessed at.
pub fn sanitize_file_name(name: &str) -> Result<String, NameError> {
    // rust hands paths to C APIs; an embedded \0 would truncate them
    if name.contains('\0') {
        return Err(NameError::NullByte);
    }

    let base = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();

    if base.is_empty() || base == "." || base == ".." {
        return Err(NameError::Empty);
    }

    Ok(base.to_string())
}

/// Keep only characters safe for a staging file name.
///
/// Used for download temp files where the name may come straight from a URL;
/// anything outside `[A-Za-z0-9._- ]` is dropped.
pub fn filtered_file_name(name: &str) -> String {
    let kept: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || "._- ".contains(*c))
        .collect();

    if kept.is_empty() {
        "download".to_string()
    } else {
        kept
    }
}
