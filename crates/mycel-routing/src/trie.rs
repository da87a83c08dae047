//! Handler index keyed by topic path.
//!
//! Stores handler payloads under their registration topics, one subtree per
//! network, and retrieves them for concrete or pattern topics at dispatch
//! time. Registration may run concurrently with lookup; the whole structure
//! is guarded by a read/write lock, so reads always observe a consistent
//! snapshot.

use crate::topic::{PathSegment, TopicPath};
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::debug;

/// A single result of [`PathTrie::find_matches`]: the stored payload plus
/// any template parameter bindings collected on the way down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrieMatch<T> {
    pub content: T,
    pub params: HashMap<String, String>,
}

struct TrieNode<T> {
    /// Payloads bound at exactly this path.
    content: Vec<T>,
    /// Payloads bound with a terminal `>` at this depth.
    multi_wildcard_content: Vec<T>,
    children: HashMap<String, TrieNode<T>>,
    wildcard_child: Option<Box<TrieNode<T>>>,
    template_child: Option<Box<TrieNode<T>>>,
    /// Parameter name bound when descending into `template_child`; the most
    /// recent registration wins.
    template_param_name: Option<String>,
    /// Number of payload entries in this subtree, `multi_wildcard_content`
    /// included.
    count: usize,
}

impl<T: Clone> TrieNode<T> {
    fn new() -> Self {
        Self {
            content: Vec::new(),
            multi_wildcard_content: Vec::new(),
            children: HashMap::new(),
            wildcard_child: None,
            template_child: None,
            template_param_name: None,
            count: 0,
        }
    }

    fn set_values(&mut self, segments: &[PathSegment], values: Vec<T>) -> isize {
        let delta = match segments.split_first() {
            None => {
                let delta = values.len() as isize - self.content.len() as isize;
                self.content = values;
                delta
            }
            Some((PathSegment::MultiWildcard, _)) => {
                let delta = values.len() as isize - self.multi_wildcard_content.len() as isize;
                self.multi_wildcard_content = values;
                delta
            }
            Some((seg, rest)) => self.child_slot(seg).set_values(rest, values),
        };
        self.count = (self.count as isize + delta) as usize;
        delta
    }

    fn append_values(&mut self, segments: &[PathSegment], values: Vec<T>) -> isize {
        let delta = match segments.split_first() {
            None => {
                let delta = values.len() as isize;
                self.content.extend(values);
                delta
            }
            Some((PathSegment::MultiWildcard, _)) => {
                let delta = values.len() as isize;
                self.multi_wildcard_content.extend(values);
                delta
            }
            Some((seg, rest)) => self.child_slot(seg).append_values(rest, values),
        };
        self.count = (self.count as isize + delta) as usize;
        delta
    }

    /// Child slot for one registration segment, created on demand.
    fn child_slot(&mut self, seg: &PathSegment) -> &mut TrieNode<T> {
        match seg {
            PathSegment::Literal(s) => self
                .children
                .entry(s.clone())
                .or_insert_with(TrieNode::new),
            PathSegment::Template(name) => {
                self.template_param_name = Some(name.clone());
                self.template_child.get_or_insert_with(|| Box::new(TrieNode::new()))
            }
            PathSegment::SingleWildcard => self
                .wildcard_child
                .get_or_insert_with(|| Box::new(TrieNode::new())),
            // terminal by TopicPath invariant; callers store into
            // multi_wildcard_content before descending here
            PathSegment::MultiWildcard => unreachable!("multi-wildcard is always terminal"),
        }
    }

    /// Clear the exact slot addressed by `segments`. Returns the number of
    /// entries removed.
    fn remove_values(&mut self, segments: &[PathSegment]) -> usize {
        let removed = match segments.split_first() {
            None => {
                let n = self.content.len();
                self.content.clear();
                n
            }
            Some((PathSegment::MultiWildcard, _)) => {
                let n = self.multi_wildcard_content.len();
                self.multi_wildcard_content.clear();
                n
            }
            Some((seg, rest)) => match self.descend_mut(seg) {
                Some(child) => {
                    let n = child.remove_values(rest);
                    if child.count == 0 {
                        self.prune(seg);
                    }
                    n
                }
                None => 0,
            },
        };
        self.count -= removed;
        removed
    }

    /// Drop entries of the exact slot for which `predicate` holds. Returns
    /// the number removed.
    fn remove_matching(&mut self, segments: &[PathSegment], predicate: &dyn Fn(&T) -> bool) -> usize {
        let removed = match segments.split_first() {
            None => {
                let before = self.content.len();
                self.content.retain(|v| !predicate(v));
                before - self.content.len()
            }
            Some((PathSegment::MultiWildcard, _)) => {
                let before = self.multi_wildcard_content.len();
                self.multi_wildcard_content.retain(|v| !predicate(v));
                before - self.multi_wildcard_content.len()
            }
            Some((seg, rest)) => match self.descend_mut(seg) {
                Some(child) => {
                    let n = child.remove_matching(rest, predicate);
                    if child.count == 0 {
                        self.prune(seg);
                    }
                    n
                }
                None => 0,
            },
        };
        self.count -= removed;
        removed
    }

    fn descend_mut(&mut self, seg: &PathSegment) -> Option<&mut TrieNode<T>> {
        match seg {
            PathSegment::Literal(s) => self.children.get_mut(s),
            PathSegment::Template(_) => self.template_child.as_deref_mut(),
            PathSegment::SingleWildcard => self.wildcard_child.as_deref_mut(),
            PathSegment::MultiWildcard => None,
        }
    }

    fn descend(&self, seg: &PathSegment) -> Option<&TrieNode<T>> {
        match seg {
            PathSegment::Literal(s) => self.children.get(s),
            PathSegment::Template(_) => self.template_child.as_deref(),
            PathSegment::SingleWildcard => self.wildcard_child.as_deref(),
            PathSegment::MultiWildcard => None,
        }
    }

    fn prune(&mut self, seg: &PathSegment) {
        match seg {
            PathSegment::Literal(s) => {
                self.children.remove(s);
            }
            PathSegment::Template(_) => {
                self.template_child = None;
                self.template_param_name = None;
            }
            PathSegment::SingleWildcard => self.wildcard_child = None,
            PathSegment::MultiWildcard => {}
        }
    }

    /// Payloads stored at exactly this path's slot, no wildcard expansion.
    fn exact_values(&self, segments: &[PathSegment]) -> Vec<T> {
        match segments.split_first() {
            None => self.content.clone(),
            Some((PathSegment::MultiWildcard, _)) => self.multi_wildcard_content.clone(),
            Some((seg, rest)) => match self.descend(seg) {
                Some(child) => child.exact_values(rest),
                None => Vec::new(),
            },
        }
    }

    /// Walk a concrete (non-pattern) path, collecting matching payloads and
    /// template bindings. Terminal `>` registrations match at every strict
    /// prefix of the path as well as at the terminal node.
    fn find_concrete(
        &self,
        segments: &[PathSegment],
        params: &HashMap<String, String>,
        out: &mut Vec<TrieMatch<T>>,
    ) {
        match segments.split_first() {
            None => {
                for v in &self.content {
                    out.push(TrieMatch {
                        content: v.clone(),
                        params: params.clone(),
                    });
                }
                for v in &self.multi_wildcard_content {
                    out.push(TrieMatch {
                        content: v.clone(),
                        params: params.clone(),
                    });
                }
            }
            Some((seg, rest)) => {
                for v in &self.multi_wildcard_content {
                    out.push(TrieMatch {
                        content: v.clone(),
                        params: params.clone(),
                    });
                }
                let token = seg.to_string();
                if let Some(child) = self.children.get(&token) {
                    child.find_concrete(rest, params, out);
                }
                if let Some(child) = &self.template_child {
                    let mut bound = params.clone();
                    if let Some(name) = &self.template_param_name {
                        bound.insert(name.clone(), token);
                    }
                    child.find_concrete(rest, &bound, out);
                }
                if let Some(child) = &self.wildcard_child {
                    child.find_concrete(rest, params, out);
                }
            }
        }
    }

    /// Walk a pattern path over concrete registrations. The first `*` or `>`
    /// (or running out of segments) collects the entire remaining subtree.
    /// No parameter bindings are produced.
    fn find_pattern(&self, segments: &[PathSegment], out: &mut Vec<TrieMatch<T>>) {
        match segments.split_first() {
            None => self.collect_all(out),
            Some((PathSegment::SingleWildcard | PathSegment::MultiWildcard, _)) => {
                self.collect_all(out)
            }
            Some((seg, rest)) => {
                for v in &self.multi_wildcard_content {
                    out.push(TrieMatch {
                        content: v.clone(),
                        params: HashMap::new(),
                    });
                }
                match seg {
                    PathSegment::Literal(s) => {
                        if let Some(child) = self.children.get(s) {
                            child.find_pattern(rest, out);
                        }
                        if let Some(child) = &self.template_child {
                            child.find_pattern(rest, out);
                        }
                        if let Some(child) = &self.wildcard_child {
                            child.find_pattern(rest, out);
                        }
                    }
                    // a template in a search pattern descends into every child kind
                    _ => {
                        for child in self.children.values() {
                            child.find_pattern(rest, out);
                        }
                        if let Some(child) = &self.template_child {
                            child.find_pattern(rest, out);
                        }
                        if let Some(child) = &self.wildcard_child {
                            child.find_pattern(rest, out);
                        }
                    }
                }
            }
        }
    }

    fn collect_all(&self, out: &mut Vec<TrieMatch<T>>) {
        for v in &self.content {
            out.push(TrieMatch {
                content: v.clone(),
                params: HashMap::new(),
            });
        }
        for v in &self.multi_wildcard_content {
            out.push(TrieMatch {
                content: v.clone(),
                params: HashMap::new(),
            });
        }
        for child in self.children.values() {
            child.collect_all(out);
        }
        if let Some(child) = &self.template_child {
            child.collect_all(out);
        }
        if let Some(child) = &self.wildcard_child {
            child.collect_all(out);
        }
    }

    fn all_values(&self, out: &mut Vec<T>) {
        out.extend(self.content.iter().cloned());
        out.extend(self.multi_wildcard_content.iter().cloned());
        for child in self.children.values() {
            child.all_values(out);
        }
        if let Some(child) = &self.template_child {
            child.all_values(out);
        }
        if let Some(child) = &self.wildcard_child {
            child.all_values(out);
        }
    }
}

/// Handler index: one subtree per network, payloads of type `T` stored at
/// topic leaves. Lookups never cross networks.
pub struct PathTrie<T: Clone> {
    networks: RwLock<HashMap<String, TrieNode<T>>>,
}

impl<T: Clone> Default for PathTrie<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> PathTrie<T> {
    pub fn new() -> Self {
        Self {
            networks: RwLock::new(HashMap::new()),
        }
    }

    /// Replace the payloads stored at `topic`'s exact slot. Returns the
    /// change in total handler count.
    pub fn set_values(&self, topic: &TopicPath, values: Vec<T>) -> isize {
        let n = values.len();
        let mut networks = write_lock(&self.networks);
        let root = networks
            .entry(topic.network_id().to_string())
            .or_insert_with(TrieNode::new);
        let delta = root.set_values(topic.segments(), values);
        debug!(topic = %topic, count = n, delta, "trie slot replaced");
        delta
    }

    /// Replace the slot at `topic` with a single payload.
    pub fn set_value(&self, topic: &TopicPath, value: T) -> isize {
        self.set_values(topic, vec![value])
    }

    /// Append one payload to the slot at `topic`, preserving entries already
    /// registered there. Duplicates are kept.
    pub fn add_value(&self, topic: &TopicPath, value: T) -> isize {
        let mut networks = write_lock(&self.networks);
        let root = networks
            .entry(topic.network_id().to_string())
            .or_insert_with(TrieNode::new);
        let delta = root.append_values(topic.segments(), vec![value]);
        debug!(topic = %topic, delta, "trie slot appended");
        delta
    }

    /// Apply [`set_values`](Self::set_values) to every topic with the same
    /// payload list. Returns the summed count delta.
    pub fn add_batch_values(&self, topics: &[TopicPath], values: Vec<T>) -> isize {
        topics
            .iter()
            .map(|t| self.set_values(t, values.clone()))
            .sum()
    }

    /// Clear the exact slot at `topic`. Returns the number of entries
    /// removed.
    pub fn remove_values(&self, topic: &TopicPath) -> usize {
        let mut networks = write_lock(&self.networks);
        let removed = match networks.get_mut(topic.network_id()) {
            Some(root) => {
                let n = root.remove_values(topic.segments());
                if root.count == 0 {
                    networks.remove(topic.network_id());
                }
                n
            }
            None => 0,
        };
        if removed > 0 {
            debug!(topic = %topic, removed, "trie slot cleared");
        }
        removed
    }

    /// Drop entries of the exact slot at `topic` for which `predicate`
    /// holds. Returns whether any were removed.
    pub fn remove_handler(&self, topic: &TopicPath, predicate: impl Fn(&T) -> bool) -> bool {
        let mut networks = write_lock(&self.networks);
        let removed = match networks.get_mut(topic.network_id()) {
            Some(root) => {
                let n = root.remove_matching(topic.segments(), &predicate);
                if root.count == 0 {
                    networks.remove(topic.network_id());
                }
                n
            }
            None => 0,
        };
        if removed > 0 {
            debug!(topic = %topic, removed, "trie handlers removed");
        }
        removed > 0
    }

    /// Payloads stored at exactly `topic`'s slot, with no wildcard
    /// expansion. For a `>`-terminated topic this is the
    /// `multi_wildcard_content` of the node at the prefix.
    pub fn get_exact_values(&self, topic: &TopicPath) -> Vec<T> {
        let networks = read_lock(&self.networks);
        match networks.get(topic.network_id()) {
            Some(root) => root.exact_values(topic.segments()),
            None => Vec::new(),
        }
    }

    /// All payloads matching `topic`, with template parameter bindings.
    ///
    /// Pattern topics are delegated to
    /// [`find_wildcard_matches`](Self::find_wildcard_matches). Results come
    /// back in descent order; no specificity ranking is applied.
    pub fn find_matches(&self, topic: &TopicPath) -> Vec<TrieMatch<T>> {
        if topic.is_pattern() {
            return self.find_wildcard_matches(topic);
        }
        let networks = read_lock(&self.networks);
        let mut out = Vec::new();
        if let Some(root) = networks.get(topic.network_id()) {
            root.find_concrete(topic.segments(), &HashMap::new(), &mut out);
        }
        out
    }

    /// Search concrete registrations with a pattern topic. Parameter
    /// bindings are not produced for wildcard collection.
    pub fn find_wildcard_matches(&self, pattern: &TopicPath) -> Vec<TrieMatch<T>> {
        let networks = read_lock(&self.networks);
        let mut out = Vec::new();
        if let Some(root) = networks.get(pattern.network_id()) {
            root.find_pattern(pattern.segments(), &mut out);
        }
        out
    }

    /// Matching payloads without their bindings.
    pub fn find(&self, topic: &TopicPath) -> Vec<T> {
        self.find_matches(topic)
            .into_iter()
            .map(|m| m.content)
            .collect()
    }

    /// Every payload registered in the trie, across all networks.
    pub fn get_all_values(&self) -> Vec<T> {
        let networks = read_lock(&self.networks);
        let mut out = Vec::new();
        for root in networks.values() {
            root.all_values(&mut out);
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.handler_count() == 0
    }

    /// Total number of registered payload entries.
    pub fn handler_count(&self) -> usize {
        let networks = read_lock(&self.networks);
        networks.values().map(|root| root.count).sum()
    }
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> TopicPath {
        TopicPath::parse(s, "default").unwrap()
    }

    #[test]
    fn exact_lookup_is_network_isolated() {
        let trie = PathTrie::new();
        trie.set_value(&p("n1:services/math/add"), "H1");

        assert_eq!(trie.find(&p("n1:services/math/add")), vec!["H1"]);
        assert!(trie.find(&p("n2:services/math/add")).is_empty());
    }

    #[test]
    fn template_registration_binds_params() {
        let trie = PathTrie::new();
        trie.set_value(&p("n1:services/{svc}/state"), "H");

        let matches = trie.find_matches(&p("n1:services/math/state"));
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].content, "H");
        assert_eq!(matches[0].params["svc"], "math");
    }

    #[test]
    fn template_param_name_overwrite_last_wins() {
        let trie = PathTrie::new();
        trie.set_value(&p("n1:services/{svc}/state"), "H1");
        trie.add_value(&p("n1:services/{service_name}/state"), "H2");

        let matches = trie.find_matches(&p("n1:services/math/state"));
        assert_eq!(matches.len(), 2);
        for m in matches {
            assert_eq!(m.params.get("service_name"), Some(&"math".to_string()));
        }
    }

    #[test]
    fn multi_wildcard_matches_any_tail() {
        let trie = PathTrie::new();
        trie.set_value(&p("n1:services/>"), "H");

        assert_eq!(trie.find(&p("n1:services/math/actions/add")), vec!["H"]);
        assert_eq!(trie.find(&p("n1:services")), vec!["H"]);
        assert!(trie.find(&p("n1:events/x")).is_empty());
    }

    #[test]
    fn single_wildcard_search_collects_subtree() {
        let trie = PathTrie::new();
        trie.set_value(&p("n1:users_db/execute_query"), "Ha");
        trie.set_value(&p("n1:users_db/replication/get_table_events"), "Hb");

        let mut found = trie.find(&p("n1:users_db/*"));
        found.sort();
        assert_eq!(found, vec!["Ha", "Hb"]);
    }

    #[test]
    fn wildcard_registration_matches_concrete_lookup() {
        let trie = PathTrie::new();
        trie.set_value(&p("n1:services/*/state"), "H");

        assert_eq!(trie.find(&p("n1:services/math/state")), vec!["H"]);
        assert!(trie.find(&p("n1:services/math/other")).is_empty());
    }

    #[test]
    fn handler_count_tracks_all_slots() {
        let trie = PathTrie::new();
        assert!(trie.is_empty());

        trie.set_values(&p("n1:a/b"), vec![1, 2]);
        trie.set_value(&p("n1:a/>"), 3);
        trie.set_value(&p("n2:a"), 4);
        assert_eq!(trie.handler_count(), 4);

        trie.remove_values(&p("n1:a/b"));
        assert_eq!(trie.handler_count(), 2);

        trie.remove_values(&p("n1:a/>"));
        trie.remove_values(&p("n2:a"));
        assert!(trie.is_empty());
    }

    #[test]
    fn set_values_returns_count_delta() {
        let trie = PathTrie::new();
        assert_eq!(trie.set_values(&p("n1:a"), vec![1, 2, 3]), 3);
        assert_eq!(trie.set_values(&p("n1:a"), vec![9]), -2);
        assert_eq!(trie.handler_count(), 1);
    }

    #[test]
    fn add_batch_values_registers_each_topic() {
        let trie = PathTrie::new();
        let topics = vec![p("n1:math/add"), p("n1:math/sub")];
        let delta = trie.add_batch_values(&topics, vec!["H"]);
        assert_eq!(delta, 2);
        assert_eq!(trie.find(&p("n1:math/add")), vec!["H"]);
        assert_eq!(trie.find(&p("n1:math/sub")), vec!["H"]);
    }

    #[test]
    fn duplicates_are_preserved() {
        let trie = PathTrie::new();
        trie.add_value(&p("n1:a"), "H");
        trie.add_value(&p("n1:a"), "H");
        assert_eq!(trie.find(&p("n1:a")), vec!["H", "H"]);
        assert_eq!(trie.handler_count(), 2);
    }

    #[test]
    fn remove_handler_filters_by_predicate() {
        let trie = PathTrie::new();
        trie.set_values(&p("n1:a"), vec![1, 2, 3]);

        assert!(trie.remove_handler(&p("n1:a"), |v| *v == 2));
        assert_eq!(trie.find(&p("n1:a")), vec![1, 3]);
        assert!(!trie.remove_handler(&p("n1:a"), |v| *v == 42));
        assert_eq!(trie.handler_count(), 2);
    }

    #[test]
    fn remove_handler_on_multi_wildcard_slot() {
        let trie = PathTrie::new();
        trie.set_values(&p("n1:events/>"), vec!["keep", "drop"]);

        assert!(trie.remove_handler(&p("n1:events/>"), |v| *v == "drop"));
        assert_eq!(trie.find(&p("n1:events/system/started")), vec!["keep"]);
        assert_eq!(trie.handler_count(), 1);
    }

    #[test]
    fn get_exact_values_skips_wildcard_expansion() {
        let trie = PathTrie::new();
        trie.set_value(&p("n1:a/b"), "exact");
        trie.set_value(&p("n1:a/*"), "wild");
        trie.set_value(&p("n1:a/>"), "multi");

        assert_eq!(trie.get_exact_values(&p("n1:a/b")), vec!["exact"]);
        assert_eq!(trie.get_exact_values(&p("n1:a/*")), vec!["wild"]);
        assert_eq!(trie.get_exact_values(&p("n1:a/>")), vec!["multi"]);
        assert!(trie.get_exact_values(&p("n1:a/c")).is_empty());
    }

    #[test]
    fn find_emits_exact_then_multi_wildcard_at_a_node() {
        let trie = PathTrie::new();
        trie.set_value(&p("n1:a/b"), "exact");
        trie.set_value(&p("n1:a/b/>"), "multi");

        assert_eq!(trie.find(&p("n1:a/b")), vec!["exact", "multi"]);
    }

    #[test]
    fn get_all_values_spans_networks() {
        let trie = PathTrie::new();
        trie.set_value(&p("n1:a"), 1);
        trie.set_value(&p("n2:b"), 2);

        let mut all = trie.get_all_values();
        all.sort();
        assert_eq!(all, vec![1, 2]);
    }

    #[test]
    fn wildcard_search_finds_wildcard_registrations() {
        let trie = PathTrie::new();
        trie.set_value(&p("n1:services/>"), "H");

        assert_eq!(trie.find(&p("n1:services/*")), vec!["H"]);
    }

    #[test]
    fn concurrent_register_and_lookup() {
        use std::sync::Arc;

        let trie = Arc::new(PathTrie::new());
        let writer = {
            let trie = Arc::clone(&trie);
            std::thread::spawn(move || {
                for i in 0..200 {
                    trie.set_value(&p(&format!("n1:svc/a{i}")), i);
                }
            })
        };
        let reader = {
            let trie = Arc::clone(&trie);
            std::thread::spawn(move || {
                for _ in 0..200 {
                    let _ = trie.find(&p("n1:svc/a0"));
                    let _ = trie.handler_count();
                }
            })
        };
        writer.join().unwrap();
        reader.join().unwrap();
        assert_eq!(trie.handler_count(), 200);
    }
}
