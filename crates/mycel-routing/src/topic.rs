//! Network-scoped topic addresses.
//!
//! A topic has the canonical form `network:segment/segment/...`. A segment is
//! a literal, a single-segment wildcard `*`, a terminal multi-segment
//! wildcard `>`, or a `{name}` template placeholder that binds the matching
//! segment of a concrete path.

use crate::error::{PathError, PathResult};
use std::collections::HashMap;
use std::fmt;

/// One segment of a topic path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathSegment {
    /// A fixed segment that only matches itself.
    Literal(String),
    /// `{name}`: matches any literal segment and binds it under `name`.
    Template(String),
    /// `*`: matches exactly one segment.
    SingleWildcard,
    /// `>`: matches zero or more trailing segments; must be last.
    MultiWildcard,
}

impl PathSegment {
    /// Classify a raw segment string.
    pub fn parse(raw: &str) -> PathSegment {
        match raw {
            "*" => PathSegment::SingleWildcard,
            ">" => PathSegment::MultiWildcard,
            _ if raw.len() >= 2 && raw.starts_with('{') && raw.ends_with('}') => {
                PathSegment::Template(raw[1..raw.len() - 1].to_string())
            }
            _ => PathSegment::Literal(raw.to_string()),
        }
    }

    pub fn kind(&self) -> SegmentKind {
        match self {
            PathSegment::Literal(_) => SegmentKind::Literal,
            PathSegment::SingleWildcard => SegmentKind::SingleWildcard,
            PathSegment::MultiWildcard => SegmentKind::MultiWildcard,
            PathSegment::Template(_) => SegmentKind::Template,
        }
    }
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Literal(s) => f.write_str(s),
            PathSegment::Template(name) => write!(f, "{{{name}}}"),
            PathSegment::SingleWildcard => f.write_str("*"),
            PathSegment::MultiWildcard => f.write_str(">"),
        }
    }
}

/// Numeric segment kind, 2 bits on the wire of [`SegmentKindMap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SegmentKind {
    Literal = 0,
    SingleWildcard = 1,
    MultiWildcard = 2,
    Template = 3,
}

impl From<SegmentKind> for u8 {
    fn from(k: SegmentKind) -> u8 {
        k as u8
    }
}

impl TryFrom<u8> for SegmentKind {
    type Error = String;
    fn try_from(v: u8) -> Result<Self, String> {
        match v {
            0 => Ok(Self::Literal),
            1 => Ok(Self::SingleWildcard),
            2 => Ok(Self::MultiWildcard),
            3 => Ok(Self::Template),
            _ => Err(format!("invalid segment kind {v}")),
        }
    }
}

/// Packed per-segment kind map: 2 bits per segment, four segments per byte.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct SegmentKindMap {
    bits: Vec<u8>,
    len: usize,
}

impl SegmentKindMap {
    fn from_segments(segments: &[PathSegment]) -> Self {
        let mut bits = vec![0u8; segments.len().div_ceil(4)];
        for (i, seg) in segments.iter().enumerate() {
            bits[i / 4] |= (seg.kind() as u8) << ((i % 4) * 2);
        }
        Self {
            bits,
            len: segments.len(),
        }
    }

    /// Kind of the segment at `index`, or `None` past the end.
    pub fn kind(&self, index: usize) -> Option<SegmentKind> {
        if index >= self.len {
            return None;
        }
        let raw = (self.bits[index / 4] >> ((index % 4) * 2)) & 0b11;
        SegmentKind::try_from(raw).ok()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn contains(&self, kind: SegmentKind) -> bool {
        (0..self.len).any(|i| self.kind(i) == Some(kind))
    }
}

/// An immutable, network-scoped topic address.
///
/// Derived fields (`service_path`, `action_path`, pattern/template flags and
/// the segment kind map) are computed once at construction.
#[derive(Debug, Clone)]
pub struct TopicPath {
    network_id: String,
    segments: Vec<PathSegment>,
    kinds: SegmentKindMap,
    /// Canonical string form `network:seg/seg/...`.
    path: String,
    /// String form of the first segment.
    service_path: String,
    /// All segments joined with `/` when there are at least two, else empty.
    action_path: String,
    is_pattern: bool,
    has_templates: bool,
}

impl TopicPath {
    /// Parse `network:rest` or `rest`, injecting `default_network` when the
    /// input carries no network prefix.
    pub fn parse(input: &str, default_network: &str) -> PathResult<Self> {
        if input.is_empty() {
            return Err(PathError::Parse("empty topic path".into()));
        }
        let (network, rest) = match input.split_once(':') {
            Some((network, rest)) => {
                if network.is_empty() {
                    return Err(PathError::Parse(format!(
                        "empty network in topic path '{input}'"
                    )));
                }
                if rest.contains(':') {
                    return Err(PathError::Parse(format!(
                        "multiple ':' separators in topic path '{input}'"
                    )));
                }
                (network, rest)
            }
            None => (default_network, input),
        };
        if network.is_empty() {
            return Err(PathError::Parse(format!(
                "topic path '{input}' has no network prefix and no default network was given"
            )));
        }
        Self::from_parts(network.to_string(), rest)
    }

    /// Parse a path that must carry an explicit `network:` prefix.
    pub fn parse_full(input: &str) -> PathResult<Self> {
        if !input.contains(':') {
            return Err(PathError::Parse(format!(
                "topic path '{input}' is missing a network prefix"
            )));
        }
        Self::parse(input, "")
    }

    /// A single-segment service address. The name is taken verbatim as one
    /// literal segment.
    pub fn new_service(network_id: &str, service_name: &str) -> Self {
        Self::assemble(
            network_id.to_string(),
            vec![PathSegment::Literal(service_name.to_string())],
        )
    }

    fn from_parts(network_id: String, rest: &str) -> PathResult<Self> {
        let segments: Vec<PathSegment> = rest
            .split('/')
            .filter(|s| !s.is_empty())
            .map(PathSegment::parse)
            .collect();
        if segments.is_empty() {
            return Err(PathError::Parse(format!(
                "topic path '{rest}' has no segments"
            )));
        }
        for (i, seg) in segments.iter().enumerate() {
            if *seg == PathSegment::MultiWildcard && i + 1 != segments.len() {
                return Err(PathError::Parse(format!(
                    "multi-wildcard '>' must be the last segment of '{rest}'"
                )));
            }
        }
        Ok(Self::assemble(network_id, segments))
    }

    fn assemble(network_id: String, segments: Vec<PathSegment>) -> Self {
        let joined = segments
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join("/");
        let kinds = SegmentKindMap::from_segments(&segments);
        let is_pattern = kinds.contains(SegmentKind::SingleWildcard)
            || kinds.contains(SegmentKind::MultiWildcard);
        let has_templates = kinds.contains(SegmentKind::Template);
        let service_path = segments[0].to_string();
        let action_path = if segments.len() >= 2 {
            joined.clone()
        } else {
            String::new()
        };
        let path = format!("{network_id}:{joined}");
        Self {
            network_id,
            segments,
            kinds,
            path,
            service_path,
            action_path,
            is_pattern,
            has_templates,
        }
    }

    // ── Structural edits ─────────────────────────────────────────────

    /// Append one segment. The argument is a single segment and must not
    /// contain `/`.
    pub fn child(&self, segment: &str) -> PathResult<Self> {
        if segment.contains('/') {
            return Err(PathError::Parse(format!(
                "child segment '{segment}' must not contain '/'"
            )));
        }
        if self.segments.last() == Some(&PathSegment::MultiWildcard) {
            return Err(PathError::Parse(format!(
                "cannot extend '{}' beyond a multi-wildcard",
                self.path
            )));
        }
        let mut segments = self.segments.clone();
        segments.push(PathSegment::parse(segment));
        Ok(Self::assemble(self.network_id.clone(), segments))
    }

    /// Drop the last segment.
    pub fn parent(&self) -> PathResult<Self> {
        if self.segments.len() <= 1 {
            return Err(PathError::Parse(format!(
                "cannot take the parent of single-segment path '{}'",
                self.path
            )));
        }
        let segments = self.segments[..self.segments.len() - 1].to_vec();
        Ok(Self::assemble(self.network_id.clone(), segments))
    }

    /// Derive `service/action` from a service-only path.
    pub fn new_action_topic(&self, action_name: &str) -> PathResult<Self> {
        self.sub_topic(action_name)
    }

    /// Derive `service/event` from a service-only path.
    pub fn new_event_topic(&self, event_name: &str) -> PathResult<Self> {
        self.sub_topic(event_name)
    }

    fn sub_topic(&self, name: &str) -> PathResult<Self> {
        if name.contains(':') || name.contains('/') {
            return Err(PathError::Parse(format!(
                "name '{name}' must not contain ':' or '/'"
            )));
        }
        if self.segments.len() > 1 {
            return Err(PathError::Parse(format!(
                "'{}' already addresses an action or event",
                self.path
            )));
        }
        self.child(name)
    }

    // ── Templates ────────────────────────────────────────────────────

    /// Substitute every `{name}` in `template` from `params` and parse the
    /// result under `network_id`.
    pub fn from_template(
        template: &str,
        params: &HashMap<String, String>,
        network_id: &str,
    ) -> PathResult<Self> {
        let mut out: Vec<&str> = Vec::new();
        for raw in template.split('/') {
            if raw.len() >= 2 && raw.starts_with('{') && raw.ends_with('}') {
                let name = &raw[1..raw.len() - 1];
                let value = params.get(name).ok_or_else(|| {
                    PathError::Binding(format!("Missing parameter value for '{name}'"))
                })?;
                out.push(value.as_str());
            } else {
                out.push(raw);
            }
        }
        Self::parse(&out.join("/"), network_id)
    }

    /// Bind `{name}` segments of `template` from this (concrete) path.
    ///
    /// Segment counts must be equal; literal template segments must match
    /// literally. A repeated template name is allowed and the last binding
    /// wins.
    pub fn extract_params(&self, template: &str) -> PathResult<HashMap<String, String>> {
        let rest = match template.split_once(':') {
            Some((_, rest)) => rest,
            None => template,
        };
        let template_segments: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();
        if template_segments.len() != self.segments.len() {
            return Err(PathError::Binding(format!(
                "segment count mismatch: template '{template}' has {}, path '{}' has {}",
                template_segments.len(),
                self.path,
                self.segments.len()
            )));
        }

        let mut params = HashMap::new();
        for (raw, seg) in template_segments.iter().zip(&self.segments) {
            let tmpl = PathSegment::parse(raw);
            match (tmpl, seg) {
                (PathSegment::Template(name), PathSegment::Literal(value)) => {
                    // last-wins on repeated names
                    params.insert(name, value.clone());
                }
                (PathSegment::Template(name), _) => {
                    return Err(PathError::Binding(format!(
                        "cannot bind template parameter '{name}' to non-literal segment '{seg}'"
                    )));
                }
                (tmpl, seg) if tmpl == *seg => {}
                (tmpl, seg) => {
                    return Err(PathError::Binding(format!(
                        "segment '{seg}' does not match template segment '{tmpl}'"
                    )));
                }
            }
        }
        Ok(params)
    }

    /// Whether this (concrete) path fits `template`.
    pub fn matches_template(&self, template: &str) -> bool {
        self.extract_params(template).is_ok()
    }

    // ── Matching ─────────────────────────────────────────────────────

    /// Directional pattern match against `other`.
    ///
    /// Paths on different networks never match. Equal canonical strings
    /// always match. A template-bearing path does not match a concrete path;
    /// the concrete side is instead bound against the template. Wildcard
    /// patterns match segment by segment, with a terminal `>` absorbing any
    /// tail.
    pub fn matches(&self, other: &TopicPath) -> bool {
        if self.network_id != other.network_id {
            return false;
        }
        if self.path == other.path {
            return true;
        }

        if !self.is_pattern && !other.is_pattern {
            if self.has_templates && !other.has_templates {
                return false;
            }
            if other.has_templates && !self.has_templates {
                return self.matches_template(other.rest());
            }
            if !self.has_templates && !other.has_templates {
                return false;
            }
            // both carry templates: fall through to the segment rules
        }

        let (pattern, concrete) = if self.is_pattern {
            (self, other)
        } else {
            (other, self)
        };
        segments_match(&pattern.segments, &concrete.segments)
    }

    /// Cheap service-scoping filter: same network and `other.service_path` is
    /// a string prefix of this path's `service_path`.
    ///
    /// Prefix semantics are byte-wise, not segment-aware: `main:auth` is a
    /// prefix of `main:authorize`.
    pub fn starts_with(&self, other: &TopicPath) -> bool {
        self.network_id == other.network_id && self.service_path.starts_with(&other.service_path)
    }

    // ── Accessors ────────────────────────────────────────────────────

    pub fn network_id(&self) -> &str {
        &self.network_id
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    /// Packed kind map, 2 bits per segment.
    pub fn segment_kinds(&self) -> &SegmentKindMap {
        &self.kinds
    }

    /// Canonical string form `network:rest`.
    pub fn as_str(&self) -> &str {
        &self.path
    }

    /// String form of the first segment.
    pub fn service_path(&self) -> &str {
        &self.service_path
    }

    /// All segments joined with `/` when the path has at least two segments,
    /// else empty.
    pub fn action_path(&self) -> &str {
        &self.action_path
    }

    /// Whether any segment is `*` or `>`.
    pub fn is_pattern(&self) -> bool {
        self.is_pattern
    }

    /// Whether any segment is a `{name}` template.
    pub fn has_templates(&self) -> bool {
        self.has_templates
    }

    /// The path portion after the network prefix.
    fn rest(&self) -> &str {
        &self.path[self.network_id.len() + 1..]
    }
}

impl fmt::Display for TopicPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

impl PartialEq for TopicPath {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
    }
}

impl Eq for TopicPath {}

impl std::hash::Hash for TopicPath {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.path.hash(state);
    }
}

/// Segment-wise pattern match. A terminal `>` on the pattern side absorbs
/// any remaining concrete segments (including none).
fn segments_match(pattern: &[PathSegment], concrete: &[PathSegment]) -> bool {
    if let Some((PathSegment::MultiWildcard, prefix)) = pattern.split_last() {
        if concrete.len() < prefix.len() {
            return false;
        }
        return prefix
            .iter()
            .zip(concrete)
            .all(|(p, c)| segment_match(p, c));
    }
    pattern.len() == concrete.len()
        && pattern
            .iter()
            .zip(concrete)
            .all(|(p, c)| segment_match(p, c))
}

fn segment_match(pattern: &PathSegment, concrete: &PathSegment) -> bool {
    match (pattern, concrete) {
        (PathSegment::Literal(a), PathSegment::Literal(b)) => a == b,
        (PathSegment::Template(_), PathSegment::Literal(_)) => true,
        (PathSegment::SingleWildcard, _) => true,
        (PathSegment::MultiWildcard, _) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> TopicPath {
        TopicPath::parse(s, "default").unwrap()
    }

    #[test]
    fn parse_with_network() {
        let t = p("main:services/math/add");
        assert_eq!(t.network_id(), "main");
        assert_eq!(t.as_str(), "main:services/math/add");
        assert_eq!(t.service_path(), "services");
        assert_eq!(t.action_path(), "services/math/add");
        assert_eq!(t.segments().len(), 3);
        assert!(!t.is_pattern());
        assert!(!t.has_templates());
    }

    #[test]
    fn parse_injects_default_network() {
        let t = p("services/math");
        assert_eq!(t.network_id(), "default");
        assert_eq!(t.as_str(), "default:services/math");
    }

    #[test]
    fn parse_drops_empty_segments() {
        let t = p("main:services//math/");
        assert_eq!(t.as_str(), "main:services/math");
        assert_eq!(t.segments().len(), 2);
    }

    #[test]
    fn parse_rejects_bad_shapes() {
        assert!(TopicPath::parse("", "default").is_err());
        assert!(TopicPath::parse("a:b:c", "default").is_err());
        assert!(TopicPath::parse(":services", "default").is_err());
        assert!(TopicPath::parse("main:", "default").is_err());
        assert!(TopicPath::parse("///", "default").is_err());
        assert!(TopicPath::parse("services", "").is_err());
    }

    #[test]
    fn multi_wildcard_must_be_last() {
        assert!(TopicPath::parse("main:a/>/b", "default").is_err());
        assert!(TopicPath::parse("main:a/b/>", "default").is_ok());
    }

    #[test]
    fn parse_full_requires_network() {
        assert!(TopicPath::parse_full("main:services/math").is_ok());
        assert!(TopicPath::parse_full("services/math").is_err());
    }

    #[test]
    fn single_segment_has_empty_action_path() {
        let t = p("main:auth");
        assert_eq!(t.service_path(), "auth");
        assert_eq!(t.action_path(), "");
    }

    #[test]
    fn segment_kind_map_is_packed() {
        let t = p("main:a/*/{id}/>");
        let kinds = t.segment_kinds();
        assert_eq!(kinds.len(), 4);
        assert_eq!(kinds.kind(0), Some(SegmentKind::Literal));
        assert_eq!(kinds.kind(1), Some(SegmentKind::SingleWildcard));
        assert_eq!(kinds.kind(2), Some(SegmentKind::Template));
        assert_eq!(kinds.kind(3), Some(SegmentKind::MultiWildcard));
        assert_eq!(kinds.kind(4), None);
        assert!(t.is_pattern());
        assert!(t.has_templates());
    }

    #[test]
    fn child_and_parent() {
        let svc = TopicPath::new_service("main", "math");
        let action = svc.child("add").unwrap();
        assert_eq!(action.as_str(), "main:math/add");
        assert_eq!(action.parent().unwrap(), svc);

        assert!(svc.child("a/b").is_err());
        assert!(svc.parent().is_err());
    }

    #[test]
    fn child_rejects_extending_multi_wildcard() {
        let t = p("main:services/>");
        assert!(t.child("more").is_err());
    }

    #[test]
    fn action_and_event_topics() {
        let svc = TopicPath::new_service("main", "math");
        assert_eq!(svc.new_action_topic("add").unwrap().as_str(), "main:math/add");
        assert_eq!(
            svc.new_event_topic("started").unwrap().as_str(),
            "main:math/started"
        );

        assert!(svc.new_action_topic("a/b").is_err());
        assert!(svc.new_action_topic("a:b").is_err());

        let action = svc.new_action_topic("add").unwrap();
        assert!(action.new_action_topic("again").is_err());
    }

    #[test]
    fn from_template_substitutes_params() {
        let mut params = HashMap::new();
        params.insert("svc".to_string(), "math".to_string());
        params.insert("action".to_string(), "add".to_string());
        let t = TopicPath::from_template("services/{svc}/{action}", &params, "main").unwrap();
        assert_eq!(t.as_str(), "main:services/math/add");
    }

    #[test]
    fn from_template_missing_param() {
        let params = HashMap::new();
        let err = TopicPath::from_template("services/{svc}", &params, "main").unwrap_err();
        assert!(err.to_string().contains("Missing parameter value for 'svc'"));
    }

    #[test]
    fn extract_params_binds_templates() {
        let t = p("main:services/math/state");
        let params = t.extract_params("services/{svc}/state").unwrap();
        assert_eq!(params.len(), 1);
        assert_eq!(params["svc"], "math");
    }

    #[test]
    fn extract_params_round_trip() {
        let mut params = HashMap::new();
        params.insert("svc".to_string(), "math".to_string());
        let t = TopicPath::from_template("services/{svc}/run", &params, "main").unwrap();
        assert_eq!(t.extract_params("services/{svc}/run").unwrap(), params);
    }

    #[test]
    fn extract_params_repeated_name_last_wins() {
        let t = p("main:a/b");
        let params = t.extract_params("{x}/{x}").unwrap();
        assert_eq!(params["x"], "b");
    }

    #[test]
    fn extract_params_rejects_mismatches() {
        let t = p("main:services/math/state");
        assert!(t.extract_params("services/{svc}").is_err());
        assert!(t.extract_params("events/{svc}/state").is_err());
    }

    #[test]
    fn matches_requires_same_network() {
        let a = TopicPath::parse("n1:services/math", "default").unwrap();
        let b = TopicPath::parse("n2:services/math", "default").unwrap();
        assert!(!a.matches(&b));
    }

    #[test]
    fn matches_equal_paths() {
        let a = p("main:services/math");
        let b = p("main:services/math");
        assert!(a.matches(&b));
    }

    #[test]
    fn matches_distinct_concrete_paths_is_false() {
        let a = p("main:services/math");
        let b = p("main:services/geo");
        assert!(!a.matches(&b));
    }

    #[test]
    fn wildcard_match_is_symmetric() {
        let concrete = p("main:services/math/add");
        let pattern = p("main:services/*/add");
        assert!(concrete.matches(&pattern));
        assert!(pattern.matches(&concrete));
    }

    #[test]
    fn single_wildcard_matches_exactly_one_segment() {
        let pattern = p("main:services/*");
        assert!(pattern.matches(&p("main:services/math")));
        assert!(!pattern.matches(&p("main:services/math/add")));
        assert!(!pattern.matches(&p("main:services")));
    }

    #[test]
    fn multi_wildcard_matches_any_tail() {
        let pattern = p("main:a/>");
        assert!(pattern.matches(&p("main:a")));
        assert!(pattern.matches(&p("main:a/b")));
        assert!(pattern.matches(&p("main:a/b/c/d")));
        assert!(!pattern.matches(&p("main:b/a")));
    }

    #[test]
    fn template_match_is_directional() {
        let concrete = p("main:services/math/state");
        let template = p("main:services/{svc}/state");
        // concrete side binds against the template
        assert!(concrete.matches(&template));
        // the template-bearing path does not match a concrete path
        assert!(!template.matches(&concrete));
    }

    #[test]
    fn template_pattern_mix_matches_segment_wise() {
        let pattern = p("main:services/{svc}/>");
        let concrete = p("main:services/math/actions/add");
        assert!(pattern.matches(&concrete));
    }

    #[test]
    fn starts_with_is_byte_prefix_on_service_path() {
        let auth = TopicPath::new_service("main", "auth");
        let authorize = TopicPath::new_service("main", "authorize");
        let authz = TopicPath::new_service("main", "authz");
        assert!(authorize.starts_with(&auth));
        assert!(!auth.starts_with(&authz));
        assert!(!authorize.starts_with(&TopicPath::new_service("other", "auth")));
    }

    #[test]
    fn display_and_eq_use_canonical_form() {
        let t = p("main:services/math");
        assert_eq!(t.to_string(), "main:services/math");
        assert_eq!(t, TopicPath::parse("services/math", "main").unwrap());
    }

    #[test]
    fn loose_template_names_parse() {
        let t = p("main:services/{}/state");
        assert!(t.has_templates());
        assert_eq!(t.segments()[1], PathSegment::Template(String::new()));
    }
}
