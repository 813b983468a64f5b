/// Sanitize a user-chosen store key so it is safe to use as a filesystem
/// identifier: keep `[A-Za-z0-9._-]`, replace everything else with `_`
/// (spec.md §4.9).
pub fn sanitize_key(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replaces_traversal_characters() {
        assert_eq!(sanitize_key("../../etc/passwd"), ".._.._etc_passwd");
        assert_eq!(sanitize_key("my key/1"), "my_key_1");
        assert_eq!(sanitize_key("valid-key.2"), "valid-key.2");
    }
}
