//! Identifier parsing.
//!
//! Clients send IDs with trailing slug text (`/book/show/27362503-title`);
//! we take the final path segment and extract its first signed integer.
//! IDs above one billion belong to a different identifier space and are
//! rejected along with non-positive values.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::domain::ProxyError;

/// IDs above this belong to a different upstream's identifier space.
const MAX_SUPPORTED_ID: i64 = 1_000_000_000;

static NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new("-?[0-9]+").expect("valid number pattern"));

/// Extract a supported ID from a path, path segment, or slugged string.
pub fn path_to_id(path: &str) -> Result<i64, ProxyError> {
    let base = path.rsplit('/').next().unwrap_or(path);

    let digits = NUMBER
        .find(base)
        .ok_or_else(|| ProxyError::bad_request(format!("no ID found in `{base}`")))?;

    let id: i64 = digits
        .as_str()
        .parse()
        .map_err(|_| ProxyError::bad_request(format!("`{}` is not a valid ID", digits.as_str())))?;

    if id <= 0 {
        return Err(ProxyError::bad_request(format!(
            "expected {id} to be positive"
        )));
    }
    if id > MAX_SUPPORTED_ID {
        return Err(ProxyError::bad_request(
            "IDs above one billion are not supported",
        ));
    }

    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_ids_parse() {
        assert_eq!(path_to_id("42").unwrap(), 42);
        assert_eq!(path_to_id("/work/42").unwrap(), 42);
    }

    #[test]
    fn slugged_ids_parse() {
        assert_eq!(
            path_to_id("/book/show/27362503-it-ends-with-us").unwrap(),
            27362503
        );
    }

    #[test]
    fn negative_and_zero_ids_are_rejected() {
        assert!(matches!(
            path_to_id("/author/-1234"),
            Err(ProxyError::BadRequest(_))
        ));
        assert!(matches!(
            path_to_id("/author/0"),
            Err(ProxyError::BadRequest(_))
        ));
    }

    #[test]
    fn out_of_range_ids_are_rejected() {
        assert!(matches!(
            path_to_id("/author/10000000000"),
            Err(ProxyError::BadRequest(_))
        ));
        assert_eq!(path_to_id("/author/1000000000").unwrap(), 1_000_000_000);
    }

    #[test]
    fn non_numeric_paths_are_rejected() {
        assert!(matches!(
            path_to_id("/author/changed"),
            Err(ProxyError::BadRequest(_))
        ));
    }
}
