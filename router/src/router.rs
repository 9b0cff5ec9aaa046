use core::fmt;

use http::Method;
use regex::Regex;

use crate::params::Params;

/// A routing rule: path pattern, optional host pattern, optional method
/// set, and the target reached when everything matches.
pub struct Rule<T> {
    pattern: Regex,
    host: Option<Regex>,
    methods: Option<Vec<Method>>,
    target: Target<T>,
}

enum Target<T> {
    Value(T),
    Nested(Router<T>),
}

/// Pattern compilation failed.
#[derive(Debug)]
pub struct InsertError(regex::Error);

impl fmt::Display for InsertError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid route pattern: {}", self.0)
    }
}

impl std::error::Error for InsertError {}

/// Result of a successful lookup.
pub struct Match<'a, T> {
    pub value: &'a T,
    pub params: Params,
}

/// Ordered first-match-wins router.
pub struct Router<T> {
    rules: Vec<Rule<T>>,
}

impl<T> Default for Router<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Router<T> {
    pub fn new() -> Self {
        Self { rules: Vec::new() }
    }

    /// append a rule for `pattern`. the pattern is start-anchored and, for
    /// plain targets, end-anchored as well.
    pub fn route(&mut self, pattern: &str, target: T) -> Result<&mut Self, InsertError> {
        self.rules.push(Rule::new(pattern, target)?);
        Ok(self)
    }

    /// append a rule routing everything below a path prefix to a nested
    /// router. the remainder of the path (after the prefix match) is what
    /// the nested rules see.
    pub fn mount(&mut self, prefix: &str, nested: Router<T>) -> Result<&mut Self, InsertError> {
        self.rules.push(Rule {
            pattern: compile(prefix, false)?,
            host: None,
            methods: None,
            target: Target::Nested(nested),
        });
        Ok(self)
    }

    /// append a fully configured rule.
    pub fn add(&mut self, rule: Rule<T>) -> &mut Self {
        self.rules.push(rule);
        self
    }

    /// find the first rule matching `path` (and `host`/`method` when the
    /// rule constrains them).
    pub fn at(&self, path: &str, host: Option<&str>, method: &Method) -> Option<Match<'_, T>> {
        for rule in &self.rules {
            if let Some(found) = rule.try_match(path, host, method) {
                return Some(found);
            }
        }
        None
    }
}

/// anchor and compile a rule pattern. `anchor_end` makes the pattern match
/// the entire input instead of a prefix.
fn compile(pattern: &str, anchor_end: bool) -> Result<Regex, InsertError> {
    let mut source = String::with_capacity(pattern.len() + 2);
    if !pattern.starts_with('^') {
        source.push('^');
    }
    source.push_str(pattern);
    if anchor_end && !pattern.ends_with('$') {
        source.push('$');
    }
    Regex::new(&source).map_err(InsertError)
}

impl<T> Rule<T> {
    pub fn new(pattern: &str, target: T) -> Result<Self, InsertError> {
        Ok(Self {
            pattern: compile(pattern, true)?,
            host: None,
            methods: None,
            target: Target::Value(target),
        })
    }

    /// restrict the rule to requests whose Host header matches.
    pub fn host(mut self, pattern: &str) -> Result<Self, InsertError> {
        self.host = Some(compile(pattern, true)?);
        Ok(self)
    }

    /// restrict the rule to the given methods.
    pub fn methods(mut self, methods: Vec<Method>) -> Self {
        self.methods = Some(methods);
        self
    }

    fn try_match(&self, path: &str, host: Option<&str>, method: &Method) -> Option<Match<'_, T>> {
        if let Some(methods) = &self.methods {
            if !methods.contains(method) {
                return None;
            }
        }
        if let Some(host_re) = &self.host {
            match host {
                Some(host) => {
                    // the host header may carry a port; the pattern applies
                    // to the name alone.
                    let name = host.rsplit_once(':').map(|(n, _)| n).unwrap_or(host);
                    if !host_re.is_match(name) && !host_re.is_match(host) {
                        return None;
                    }
                }
                None => return None,
            }
        }

        let caps = self.pattern.captures(path)?;

        match &self.target {
            Target::Value(value) => {
                let mut params = Params::default();
                let names: Vec<_> = self.pattern.capture_names().collect();
                for (i, name) in names.iter().enumerate().skip(1) {
                    if let Some(m) = caps.get(i) {
                        params.push(*name, m.as_str());
                    }
                }
                Some(Match { value, params })
            }
            Target::Nested(router) => {
                let rest = &path[caps.get(0).unwrap().end()..];
                let rest = if rest.starts_with('/') { rest } else { return None };
                router.at(rest, host, method)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn first_match_wins_in_insertion_order() {
        let mut router = Router::new();
        router.route("/a/specific", 1).unwrap();
        router.route("/a/.*", 2).unwrap();
        router.route("/a/specific", 3).unwrap();

        assert_eq!(*router.at("/a/specific", None, &Method::GET).unwrap().value, 1);
        assert_eq!(*router.at("/a/else", None, &Method::GET).unwrap().value, 2);
        assert!(router.at("/b", None, &Method::GET).is_none());
    }

    #[test]
    fn named_groups_become_params() {
        let mut router = Router::new();
        router.route(r"/user/(?P<id>\d+)/(?P<action>\w+)", 1).unwrap();

        let found = router.at("/user/42/edit", None, &Method::GET).unwrap();
        assert_eq!(found.params.get("id"), Some("42"));
        assert_eq!(found.params.get("action"), Some("edit"));
    }

    #[test]
    fn unnamed_groups_are_positional() {
        let mut router = Router::new();
        router.route(r"/file/(\w+)\.(\w+)", 1).unwrap();

        let found = router.at("/file/report.txt", None, &Method::GET).unwrap();
        assert_eq!(found.params.positional(0), Some("report"));
        assert_eq!(found.params.positional(1), Some("txt"));
        assert_eq!(found.params.get("nope"), None);
    }

    #[test]
    fn patterns_are_anchored() {
        let mut router = Router::new();
        router.route("/exact", 1).unwrap();
        assert!(router.at("/exact/more", None, &Method::GET).is_none());
        assert!(router.at("/prefix/exact", None, &Method::GET).is_none());
    }

    #[test]
    fn host_restriction() {
        let mut router = Router::new();
        router.add(Rule::new("/", 1).unwrap().host(r"api\..*").unwrap());
        router.route("/", 2).unwrap();

        assert_eq!(*router.at("/", Some("api.example.com"), &Method::GET).unwrap().value, 1);
        assert_eq!(*router.at("/", Some("api.example.com:8080"), &Method::GET).unwrap().value, 1);
        assert_eq!(*router.at("/", Some("www.example.com"), &Method::GET).unwrap().value, 2);
        assert_eq!(*router.at("/", None, &Method::GET).unwrap().value, 2);
    }

    #[test]
    fn method_restriction_falls_through() {
        let mut router = Router::new();
        router.add(Rule::new("/res", 1).unwrap().methods(vec![Method::POST]));
        router.route("/res", 2).unwrap();

        assert_eq!(*router.at("/res", None, &Method::POST).unwrap().value, 1);
        assert_eq!(*router.at("/res", None, &Method::GET).unwrap().value, 2);
    }

    #[test]
    fn nested_router_matches_remainder() {
        let mut api = Router::new();
        api.route(r"/v1/(?P<name>\w+)", 10).unwrap();

        let mut root = Router::new();
        root.mount("/api", api).unwrap();
        root.route("/", 1).unwrap();

        let found = root.at("/api/v1/widget", None, &Method::GET).unwrap();
        assert_eq!(*found.value, 10);
        assert_eq!(found.params.get("name"), Some("widget"));
        assert!(root.at("/api/v2/widget", None, &Method::GET).is_none());
    }

    #[test]
    fn bad_pattern_reports_insert_error() {
        let mut router = Router::new();
        assert!(router.route("/([", 1).is_err());
    }
}
