use chrono::Utc;
use rand::Rng;
use std::env;

/// Everything `{{expr}}` expansion needs to know about the flow carrying the
/// replacement string (spec.md §4.4 interpolation table).
pub trait InterpolationContext {
    fn method(&self) -> &str;
    fn host(&self) -> &str;
    fn path(&self) -> &str;
    fn url(&self) -> &str;
    /// Case-insensitive request header lookup; empty string if absent.
    fn header(&self, name: &str) -> Option<&str>;
}

/// Expand every `{{expr}}` token in `template` per spec.md §4.4. Unknown
/// expressions are left verbatim, braces included.
pub fn interpolate(template: &str, ctx: &dyn InterpolationContext) -> String {
    let mut out = String::with_capacity(template.len());
    let bytes = template.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' && bytes.get(i + 1) == Some(&b'{') {
            if let Some(end) = template[i..].find("}}") {
                let expr = &template[i + 2..i + end];
                match expand_expr(expr, ctx) {
                    Some(value) => out.push_str(&value),
                    None => out.push_str(&template[i..i + end + 2]),
                }
                i += end + 2;
                continue;
            }
        }
        // Push one char (not necessarily one byte for non-ASCII).
        let ch = template[i..].chars().next().unwrap();
        out.push(ch);
        i += ch.len_utf8();
    }
    out
}

fn expand_expr(expr: &str, ctx: &dyn InterpolationContext) -> Option<String> {
    let expr = expr.trim();
    if expr == "timestamp" {
        return Some(Utc::now().timestamp_millis().to_string());
    }
    if expr == "timestamp_iso" {
        return Some(Utc::now().to_rfc3339());
    }
    if expr == "uuid" {
        return Some(uuid::Uuid::new_v4().to_string());
    }
    if let Some(rest) = expr.strip_prefix("random_int:") {
        let mut parts = rest.splitn(2, ':');
        let lo: i64 = parts.next()?.trim().parse().ok()?;
        let hi: i64 = parts.next()?.trim().parse().ok()?;
        if lo > hi {
            return None;
        }
        let value = rand::thread_rng().gen_range(lo..=hi);
        return Some(value.to_string());
    }
    match expr {
        "request.method" => return Some(ctx.method().to_string()),
        "request.host" => return Some(ctx.host().to_string()),
        "request.path" => return Some(ctx.path().to_string()),
        "request.url" => return Some(ctx.url().to_string()),
        _ => {}
    }
    if let Some(name) = expr.strip_prefix("request.header:") {
        return Some(ctx.header(name).unwrap_or("").to_string());
    }
    if let Some(name) = expr.strip_prefix("env:") {
        return Some(env::var(name).unwrap_or_default());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestCtx {
        method: String,
        host: String,
        path: String,
        url: String,
        headers: Vec<(String, String)>,
    }

    impl InterpolationContext for TestCtx {
        fn method(&self) -> &str {
            &self.method
        }
        fn host(&self) -> &str {
            &self.host
        }
        fn path(&self) -> &str {
            &self.path
        }
        fn url(&self) -> &str {
            &self.url
        }
        fn header(&self, name: &str) -> Option<&str> {
            self.headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
        }
    }

    fn ctx() -> TestCtx {
        TestCtx {
            method: "POST".into(),
            host: "api.example.com".into(),
            path: "/v1/chat".into(),
            url: "https://api.example.com/v1/chat".into(),
            headers: vec![("X-Trace".into(), "abc".into())],
        }
    }

    #[test]
    fn unknown_expression_left_verbatim() {
        assert_eq!(interpolate("{{nonsense}}", &ctx()), "{{nonsense}}");
    }

    #[test]
    fn request_fields_expand() {
        assert_eq!(interpolate("{{request.host}}", &ctx()), "api.example.com");
        assert_eq!(interpolate("{{request.method}}", &ctx()), "POST");
    }

    #[test]
    fn header_lookup_is_case_insensitive_and_empty_if_absent() {
        assert_eq!(interpolate("{{request.header:x-trace}}", &ctx()), "abc");
        assert_eq!(interpolate("{{request.header:missing}}", &ctx()), "");
    }

    #[test]
    fn random_int_is_within_bounds() {
        for _ in 0..50 {
            let value: i64 = interpolate("{{random_int:5:10}}", &ctx()).parse().unwrap();
            assert!((5..=10).contains(&value));
        }
    }

    #[test]
    fn uuid_expands_to_valid_uuid() {
        let value = interpolate("{{uuid}}", &ctx());
        assert!(uuid::Uuid::parse_str(&value).is_ok());
    }

    #[test]
    fn multiple_tokens_in_one_template() {
        let result = interpolate("{{request.method}}-{{request.path}}-end", &ctx());
        assert_eq!(result, "POST-/v1/chat-end");
    }
}
