//! Static modifier (L2) and the flow-backed `InterpolationContext` (L1),
//! spec.md §4.4.

use crate::model::{header_lookup, HeaderList, RawRequest};
use crate::rules::{BodyModification, HeaderOp, HeaderOpType, StaticModification};
use regex::Regex;
use tollbooth_common::interpolate::{interpolate, InterpolationContext};

pub struct FlowInterpolationContext<'a> {
    pub request: &'a RawRequest,
}

impl<'a> InterpolationContext for FlowInterpolationContext<'a> {
    fn method(&self) -> &str {
        &self.request.method
    }
    fn host(&self) -> &str {
        &self.request.host
    }
    fn path(&self) -> &str {
        &self.request.path
    }
    fn url(&self) -> &str {
        &self.request.url
    }
    fn header(&self, name: &str) -> Option<&str> {
        header_lookup(&self.request.headers, name)
    }
}

/// Result of applying a `StaticModification`: `None` for a side means that
/// side did not change, which the intercept manager uses to detect a no-op
/// and fall through (spec.md §8 "fall-through safety").
#[derive(Debug, Default)]
pub struct ModificationResult {
    pub body: Option<String>,
    pub headers: Option<HeaderList>,
}

impl ModificationResult {
    pub fn is_noop(&self) -> bool {
        self.body.is_none() && self.headers.is_none()
    }
}

/// Apply `modification` to `body`/`headers`, interpolating every
/// replacement string against `ctx` first.
pub fn apply_static_modification(modification: &StaticModification, body: &str, headers: &HeaderList, ctx: &dyn InterpolationContext) -> ModificationResult {
    let new_body = modification.body.as_ref().and_then(|b| apply_body_modification(b, body, ctx));
    let new_headers = if modification.headers.is_empty() {
        None
    } else {
        let result = apply_header_ops(&modification.headers, headers, ctx);
        if result == *headers {
            None
        } else {
            Some(result)
        }
    };
    ModificationResult { body: new_body, headers: new_headers }
}

fn apply_body_modification(modification: &BodyModification, body: &str, ctx: &dyn InterpolationContext) -> Option<String> {
    if let Some(replacement) = &modification.replace_body {
        let expanded = interpolate(replacement, ctx);
        return if expanded == body { None } else { Some(expanded) };
    }
    if modification.find_replace.is_empty() {
        return None;
    }
    let mut current = body.to_string();
    for fr in &modification.find_replace {
        let replace = interpolate(&fr.replace, ctx);
        current = if fr.regex {
            match Regex::new(&fr.find) {
                Ok(re) => {
                    if fr.replace_all {
                        re.replace_all(&current, replace.as_str()).into_owned()
                    } else {
                        re.replacen(&current, 1, replace.as_str()).into_owned()
                    }
                }
                Err(_) => current,
            }
        } else if fr.replace_all {
            current.replace(&fr.find, &replace)
        } else {
            replace_first(&current, &fr.find, &replace)
        };
    }
    if current == body {
        None
    } else {
        Some(current)
    }
}

fn replace_first(haystack: &str, find: &str, replace: &str) -> String {
    match haystack.find(find) {
        Some(index) => {
            let mut out = String::with_capacity(haystack.len());
            out.push_str(&haystack[..index]);
            out.push_str(replace);
            out.push_str(&haystack[index + find.len()..]);
            out
        }
        None => haystack.to_string(),
    }
}

fn apply_header_ops(ops: &[HeaderOp], headers: &HeaderList, ctx: &dyn InterpolationContext) -> HeaderList {
    let mut current = headers.clone();
    for op in ops {
        match op.op {
            HeaderOpType::Set => {
                let value = interpolate(op.value.as_deref().unwrap_or(""), ctx);
                if let Some(existing) = current.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(&op.key)) {
                    existing.1 = value;
                } else {
                    current.push((op.key.clone(), value));
                }
            }
            HeaderOpType::Remove => {
                let lower = op.key.to_lowercase();
                current.retain(|(k, _)| k.to_lowercase() != lower);
            }
            HeaderOpType::FindReplace => {
                if let Some(existing) = current.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(&op.key)) {
                    let find = op.find.as_deref().unwrap_or("");
                    let replace = interpolate(op.value.as_deref().unwrap_or(""), ctx);
                    existing.1 = if op.regex {
                        Regex::new(find).map(|re| re.replace_all(&existing.1, replace.as_str()).into_owned()).unwrap_or_else(|_| existing.1.clone())
                    } else {
                        existing.1.replace(find, &replace)
                    };
                }
            }
        }
    }
    current
}

/// `serve_from_store` request-side header merge (spec.md §4.4): `merge`
/// keeps incoming headers but lets stored headers override on key conflict;
/// `replace` uses only the stored headers.
pub fn merge_headers(incoming: &HeaderList, stored: &HeaderList, replace: bool) -> HeaderList {
    if replace {
        return stored.clone();
    }
    let mut merged = incoming.clone();
    for (key, value) in stored {
        if let Some(existing) = merged.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(key)) {
            existing.1 = value.clone();
        } else {
            merged.push((key.clone(), value.clone()));
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopCtx;
    impl InterpolationContext for NoopCtx {
        fn method(&self) -> &str {
            "GET"
        }
        fn host(&self) -> &str {
            "h"
        }
        fn path(&self) -> &str {
            "/"
        }
        fn url(&self) -> &str {
            "http://h/"
        }
        fn header(&self, _: &str) -> Option<&str> {
            None
        }
    }

    #[test]
    fn replace_body_wins_over_find_replace() {
        let modification = BodyModification {
            replace_body: Some("literal".into()),
            find_replace: vec![],
        };
        assert_eq!(apply_body_modification(&modification, "ignored", &NoopCtx), Some("literal".into()));
    }

    #[test]
    fn literal_no_op_find_replace_yields_none() {
        let modification = BodyModification {
            replace_body: None,
            find_replace: vec![crate::rules::FindReplace {
                find: "X".into(),
                replace: "X".into(),
                regex: false,
                replace_all: true,
            }],
        };
        assert!(apply_body_modification(&modification, "Z", &NoopCtx).is_none());
    }

    #[test]
    fn replace_all_false_only_replaces_first_occurrence() {
        let modification = BodyModification {
            replace_body: None,
            find_replace: vec![crate::rules::FindReplace {
                find: "a".into(),
                replace: "b".into(),
                regex: false,
                replace_all: false,
            }],
        };
        assert_eq!(apply_body_modification(&modification, "aaa", &NoopCtx), Some("baa".into()));
    }

    #[test]
    fn header_remove_is_case_insensitive() {
        let ops = vec![HeaderOp {
            op: HeaderOpType::Remove,
            key: "X-Trace".into(),
            value: None,
            find: None,
            regex: false,
        }];
        let headers = vec![("x-trace".to_string(), "abc".to_string())];
        assert!(apply_header_ops(&ops, &headers, &NoopCtx).is_empty());
    }

    #[test]
    fn merge_mode_lets_stored_headers_win_on_conflict() {
        let incoming = vec![("A".to_string(), "1".to_string()), ("B".to_string(), "2".to_string())];
        let stored = vec![("a".to_string(), "override".to_string())];
        let merged = merge_headers(&incoming, &stored, false);
        assert_eq!(header_lookup(&merged, "A"), Some("override"));
        assert_eq!(header_lookup(&merged, "B"), Some("2"));
    }

    #[test]
    fn replace_mode_uses_only_stored_headers() {
        let incoming = vec![("A".to_string(), "1".to_string())];
        let stored = vec![("B".to_string(), "2".to_string())];
        let merged = merge_headers(&incoming, &stored, true);
        assert_eq!(merged, stored);
    }
}
