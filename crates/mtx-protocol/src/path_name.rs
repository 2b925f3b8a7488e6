//! Path name grammar.
//!
//! A path name is a non-empty string of URL-safe characters:
//! `A-Z a-z 0-9 _ - / . ~ ( )`.  Slashes separate logical segments
//! (`live/cam1`); a name must not begin or end with a slash and must not
//! contain empty segments.  Names beginning with `~` are reserved for regex
//! configuration entries and are never valid as request targets.

const MAX_LEN: usize = 255;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PathNameError {
    #[error("path name is empty")]
    Empty,
    #[error("path name exceeds {MAX_LEN} bytes")]
    TooLong,
    #[error("path name contains invalid character {0:?}")]
    InvalidChar(char),
    #[error("path name must not begin with '~'")]
    ReservedPrefix,
    #[error("path name must not begin or end with '/' or contain empty segments")]
    BadSlash,
}

fn is_path_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '/' | '.' | '~' | '(' | ')')
}

pub fn validate_path_name(name: &str) -> Result<(), PathNameError> {
    if name.is_empty() {
        return Err(PathNameError::Empty);
    }
    if name.len() > MAX_LEN {
        return Err(PathNameError::TooLong);
    }
    if name.starts_with('~') {
        return Err(PathNameError::ReservedPrefix);
    }
    if let Some(c) = name.chars().find(|&c| !is_path_char(c)) {
        return Err(PathNameError::InvalidChar(c));
    }
    if name.starts_with('/') || name.ends_with('/') || name.contains("//") {
        return Err(PathNameError::BadSlash);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_typical_names() {
        for name in ["cam1", "live/cam1", "a-b_c.d~e", "cam(2)", "0"] {
            assert_eq!(validate_path_name(name), Ok(()), "{name}");
        }
    }

    #[test]
    fn rejects_bad_names() {
        assert_eq!(validate_path_name(""), Err(PathNameError::Empty));
        assert_eq!(
            validate_path_name("~^live/.*$"),
            Err(PathNameError::ReservedPrefix)
        );
        assert_eq!(validate_path_name("/cam1"), Err(PathNameError::BadSlash));
        assert_eq!(validate_path_name("cam1/"), Err(PathNameError::BadSlash));
        assert_eq!(validate_path_name("a//b"), Err(PathNameError::BadSlash));
        assert_eq!(
            validate_path_name("cam 1"),
            Err(PathNameError::InvalidChar(' '))
        );
        assert_eq!(
            validate_path_name("cam\u{e9}"),
            Err(PathNameError::InvalidChar('\u{e9}'))
        );
    }

    #[test]
    fn rejects_oversized_names() {
        let long = "a".repeat(256);
        assert_eq!(validate_path_name(&long), Err(PathNameError::TooLong));
        let edge = "a".repeat(255);
        assert_eq!(validate_path_name(&edge), Ok(()));
    }
}
