//! Confirmation tokens guarding destructive operations.

use super::model::DeleteMode;

pub const DELETE_SAFE: &str = "DELETE_SAFE";
pub const DELETE_SELECTED: &str = "DELETE_SELECTED";
pub const DELETE_ALL: &str = "DELETE_ALL";
pub const DELETE_TERMINATE: &str = "DELETE_TERMINATE";
pub const DELETE_ALL_TERMINATE: &str = "DELETE_ALL_TERMINATE";

/// Token the operator is asked to type for `mode`.
pub fn expected_token(mode: DeleteMode) -> &'static str {
    match mode {
        DeleteMode::Safe => DELETE_SAFE,
        DeleteMode::Selected => DELETE_SELECTED,
        DeleteMode::All => DELETE_ALL,
    }
}

/// `SELECTED` also accepts the safe token.
pub fn is_valid_for_mode(mode: DeleteMode, token: Option<&str>) -> bool {
    let Some(token) = token.map(str::trim) else {
        return false;
    };
    match mode {
        DeleteMode::All => token.eq_ignore_ascii_case(DELETE_ALL),
        DeleteMode::Selected => {
            token.eq_ignore_ascii_case(DELETE_SELECTED) || token.eq_ignore_ascii_case(DELETE_SAFE)
        }
        DeleteMode::Safe => token.eq_ignore_ascii_case(DELETE_SAFE),
    }
}

pub fn is_valid_terminate(token: Option<&str>) -> bool {
    token.is_some_and(|t| t.trim().eq_ignore_ascii_case(DELETE_TERMINATE))
}

pub fn is_valid_terminate_all(token: Option<&str>) -> bool {
    token.is_some_and(|t| t.trim().eq_ignore_ascii_case(DELETE_ALL_TERMINATE))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_tokens() {
        assert!(is_valid_for_mode(DeleteMode::Safe, Some("delete_safe")));
        assert!(!is_valid_for_mode(DeleteMode::Safe, Some("DELETE_ALL")));
        assert!(is_valid_for_mode(DeleteMode::Selected, Some("DELETE_SAFE")));
        assert!(is_valid_for_mode(DeleteMode::Selected, Some("DELETE_SELECTED")));
        assert!(!is_valid_for_mode(DeleteMode::All, Some("DELETE_SAFE")));
        assert!(!is_valid_for_mode(DeleteMode::All, None));
        assert_eq!(expected_token(DeleteMode::All), "DELETE_ALL");
    }

    #[test]
    fn test_service_tokens() {
        assert!(is_valid_terminate(Some("DELETE_TERMINATE")));
        assert!(!is_valid_terminate(Some("DELETE_ALL_TERMINATE")));
        assert!(is_valid_terminate_all(Some("delete_all_terminate")));
        assert!(!is_valid_terminate_all(None));
    }
}
