//! AOT method operations: parsing `[!]class[.method[(sig)]]` specs with
//! `*` wildcards, and matching them against cached compiled methods.
//!
//! The cache map walks `CompiledMethod` items and flips their type tag
//! (invalidate/revalidate) or reports them (find) for every match.

/// What to do with a matched compiled method.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AotAction {
    Invalidate,
    Revalidate,
    Find,
}

/// One parsed method spec. Missing parts match everything.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MethodSpec {
    pub invert: bool,
    pub class: String,
    pub method: String,
    pub signature: String,
}

/// Parse a comma-separated spec list. Empty input or a malformed spec
/// yields None.
pub fn parse_method_specs(input: &str) -> Option<Vec<MethodSpec>> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }
    let mut specs = Vec::new();
    for raw in input.split(',') {
        let mut s = raw.trim();
        if s.is_empty() {
            return None;
        }
        let invert = s.starts_with('!');
        if invert {
            s = &s[1..];
        }
        let (before_sig, signature) = match s.find('(') {
            Some(open) => {
                let close = s.rfind(')')?;
                if close < open {
                    return None;
                }
                (&s[..open], s[open + 1..close].to_owned())
            }
            None => (s, "*".to_owned()),
        };
        let (class, method) = match before_sig.rfind('.') {
            Some(dot) => (before_sig[..dot].to_owned(), before_sig[dot + 1..].to_owned()),
            None => (before_sig.to_owned(), "*".to_owned()),
        };
        if class.is_empty() {
            return None;
        }
        let method = if method.is_empty() { "*".to_owned() } else { method };
        specs.push(MethodSpec { invert, class, method, signature });
    }
    Some(specs)
}

/// `*` matches any run of characters (including empty).
pub fn wildcard_match(pattern: &str, value: &str) -> bool {
    fn rec(p: &[u8], v: &[u8]) -> bool {
        match p.first() {
            None => v.is_empty(),
            Some(b'*') => {
                // Collapse consecutive stars, then try every split.
                let rest = &p[1..];
                (0..=v.len()).any(|i| rec(rest, &v[i..]))
            }
            Some(c) => v.first() == Some(c) && rec(&p[1..], &v[1..]),
        }
    }
    rec(pattern.as_bytes(), value.as_bytes())
}

impl MethodSpec {
    pub fn matches(&self, class: &str, method: &str, signature: &str) -> bool {
        wildcard_match(&self.class, class)
            && wildcard_match(&self.method, method)
            && wildcard_match(&self.signature, signature)
    }
}

/// Full-list semantics: a method matches if some positive spec covers it
/// (a list of only negations covers everything by default) and no negated
/// spec covers it.
pub fn specs_match(specs: &[MethodSpec], class: &str, method: &str, signature: &str) -> bool {
    let has_positive = specs.iter().any(|s| !s.invert);
    let positive = !has_positive
        || specs
            .iter()
            .any(|s| !s.invert && s.matches(class, method, signature));
    let negated = specs
        .iter()
        .any(|s| s.invert && s.matches(class, method, signature));
    positive && !negated
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_spec() {
        let specs = parse_method_specs("pkg/Foo.run(()V)").unwrap();
        assert_eq!(
            specs,
            vec![MethodSpec {
                invert: false,
                class: "pkg/Foo".into(),
                method: "run".into(),
                signature: "()V".into(),
            }]
        );
    }

    #[test]
    fn test_parse_partial_specs() {
        let specs = parse_method_specs("pkg/*,!pkg/Secret.*").unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].method, "*");
        assert_eq!(specs[0].signature, "*");
        assert!(specs[1].invert);
        assert_eq!(specs[1].class, "pkg/Secret");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_method_specs("").is_none());
        assert!(parse_method_specs("a,,b").is_none());
        assert!(parse_method_specs("cls.m(sig").is_none());
    }

    #[test]
    fn test_wildcard_match() {
        assert!(wildcard_match("*", "anything"));
        assert!(wildcard_match("pkg/*", "pkg/Foo"));
        assert!(wildcard_match("*Foo", "pkg/Foo"));
        assert!(wildcard_match("p*g/F*o", "pkg/Foo"));
        assert!(!wildcard_match("pkg/*", "other/Foo"));
        assert!(wildcard_match("", ""));
        assert!(!wildcard_match("", "x"));
    }

    #[test]
    fn test_specs_match_with_negation() {
        let specs = parse_method_specs("pkg/*,!pkg/Secret.*").unwrap();
        assert!(specs_match(&specs, "pkg/Foo", "run", "()V"));
        assert!(!specs_match(&specs, "pkg/Secret", "run", "()V"));
        assert!(!specs_match(&specs, "other/Foo", "run", "()V"));
    }

    #[test]
    fn test_only_negations_match_everything_else() {
        let specs = parse_method_specs("!pkg/Noisy.*").unwrap();
        assert!(specs_match(&specs, "pkg/Foo", "run", "()V"));
        assert!(!specs_match(&specs, "pkg/Noisy", "log", "()V"));
    }

    #[test]
    fn test_signature_narrowing() {
        let specs = parse_method_specs("pkg/Foo.get(*I*)").unwrap();
        assert!(specs_match(&specs, "pkg/Foo", "get", "(I)Ljava/lang/Object;"));
        assert!(!specs_match(&specs, "pkg/Foo", "get", "()V"));
    }
}
