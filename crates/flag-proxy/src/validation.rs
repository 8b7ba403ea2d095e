//! Input checks applied before a request reaches the dispatcher.

use serde::Deserialize;

/// Longest accepted flag name, in bytes.
pub const MAX_FLAG_NAME_LEN: usize = 100;

/// Whether `name` is usable as an upstream flag name.
///
/// The name must be 1..=100 bytes, must not be `.` or `..`, and must survive
/// being used as a single URL path segment unchanged: any character that
/// would be percent-encoded there (`/`, `?`, `%`, spaces, non-ASCII, ...)
/// makes it invalid.
pub fn is_valid_flag_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_FLAG_NAME_LEN {
        return false;
    }
    if name == "." || name == ".." {
        return false;
    }
    name.bytes().all(is_path_segment_safe)
}

fn is_path_segment_safe(b: u8) -> bool {
    b.is_ascii_alphanumeric()
        || matches!(
            b,
            b'-' | b'_' | b'.' | b'~' | b'$' | b'&' | b'+' | b':' | b'=' | b'@'
        )
}

/// A flag check body after validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureRequest {
    pub user_identifier: String,
    pub caller_app_name: String,
    pub pod_name: String,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct RawFeatureRequest {
    #[serde(default)]
    user_identifier: Option<String>,
    #[serde(default)]
    caller_app_name: Option<String>,
    #[serde(default)]
    pod_name: Option<String>,
}

#[derive(thiserror::Error, Debug)]
pub enum ValidationError {
    #[error("invalid JSON body: {0}")]
    MalformedBody(#[from] serde_json::Error),
    #[error("callerAppName is missing from the request body")]
    MissingCallerIdentity,
}

/// Parse a flag check body. Unknown fields are ignored and a JSON `null`
/// reads as an empty object; a missing or empty `callerAppName` is rejected.
pub fn parse_request_body(body: &[u8]) -> Result<FeatureRequest, ValidationError> {
    let raw = serde_json::from_slice::<Option<RawFeatureRequest>>(body)?.unwrap_or_default();

    let caller_app_name = raw.caller_app_name.unwrap_or_default();
    if caller_app_name.is_empty() {
        return Err(ValidationError::MissingCallerIdentity);
    }

    Ok(FeatureRequest {
        user_identifier: raw.user_identifier.unwrap_or_default(),
        caller_app_name,
        pod_name: raw.pod_name.unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_url_friendly_names() {
        for name in [
            "my-flag",
            "a",
            "kabal.new_ui~v2",
            "flag:with=extra@chars&more+$",
            "...",
            ".hidden",
        ] {
            assert!(is_valid_flag_name(name), "{name:?} should be valid");
        }
        assert!(is_valid_flag_name(&"x".repeat(100)));
    }

    #[test]
    fn test_rejects_bad_lengths_and_dot_segments() {
        assert!(!is_valid_flag_name(""));
        assert!(!is_valid_flag_name(&"x".repeat(101)));
        assert!(!is_valid_flag_name("."));
        assert!(!is_valid_flag_name(".."));
    }

    #[test]
    fn test_rejects_characters_needing_escape() {
        for name in [
            "../etc",
            "a/b",
            "with space",
            "semi;colon",
            "comma,flag",
            "what?",
            "per%20cent",
            "hash#tag",
            "brace{x}",
            "quote\"",
            "bl\u{e5}b\u{e6}r",
            "tab\t",
        ] {
            assert!(!is_valid_flag_name(name), "{name:?} should be invalid");
        }
    }

    #[test]
    fn test_parses_full_body() {
        let body = br#"{"callerAppName":"app1","userIdentifier":"U1","podName":"pod-7","extra":1}"#;
        let request = parse_request_body(body).unwrap();
        assert_eq!(
            request,
            FeatureRequest {
                user_identifier: "U1".to_string(),
                caller_app_name: "app1".to_string(),
                pod_name: "pod-7".to_string(),
            }
        );
    }

    #[test]
    fn test_optional_fields_default_to_empty() {
        let request = parse_request_body(br#"{"callerAppName":"app1"}"#).unwrap();
        assert_eq!(request.user_identifier, "");
        assert_eq!(request.pod_name, "");
    }

    #[test]
    fn test_missing_or_empty_caller() {
        assert!(matches!(
            parse_request_body(br#"{"callerAppName":"","userIdentifier":"U1"}"#),
            Err(ValidationError::MissingCallerIdentity)
        ));
        assert!(matches!(
            parse_request_body(br#"{"userIdentifier":"U1"}"#),
            Err(ValidationError::MissingCallerIdentity)
        ));
    }

    #[test]
    fn test_null_body_is_missing_caller() {
        for body in [&b"null"[..], b" null\n", br#"{"callerAppName":null}"#] {
            assert!(matches!(
                parse_request_body(body),
                Err(ValidationError::MissingCallerIdentity)
            ));
        }
    }

    #[test]
    fn test_malformed_body() {
        for body in [&b""[..], b"not json", b"[1,2]", br#"{"callerAppName":7}"#] {
            assert!(matches!(
                parse_request_body(body),
                Err(ValidationError::MalformedBody(_))
            ));
        }
    }
}
