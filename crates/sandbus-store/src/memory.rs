//! In-memory store for tests
//!
//! Understands the small SPARQL subset the harness emits: single-subject
//! `SELECT`/`ASK` patterns with an optional `tracker:id` filter, and
//! `INSERT DATA` / `DELETE DATA` updates. Every successful update is
//! delivered as one coalesced batch after the store lock is released.

use std::collections::HashMap;
use std::sync::{LazyLock, Mutex, MutexGuard};

use regex::Regex;

use sandbus_core::prelude::*;
use sandbus_core::{ChangeEvent, NotifierBatch, ResourceId};

use crate::client::{Row, StoreClient};
use crate::notifier::{coalesce_events, NotifierHub};

const RDF_TYPE: &str = "rdf:type";
const RDFS_RESOURCE: &str = "rdfs:Resource";

static TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"<[^>]*>|"(?:[^"\\]|\\.)*"|\?\w+|_:\w+|[A-Za-z][\w-]*(?::[\w-]*)?|-?\d+|[{}().;,=]"#,
    )
    .expect("Invalid token regex")
});

#[derive(Debug, Clone, PartialEq, Eq)]
enum Node {
    Var(String),
    Iri(String),
    Literal(String),
    Blank(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Value {
    Iri(String),
    Literal(String),
}

/// `subject pred obj ; pred obj ...`
#[derive(Debug)]
struct Group {
    subject: Node,
    pairs: Vec<(Node, Node)>,
}

#[derive(Debug, Default)]
struct Block {
    groups: Vec<Group>,
    id_filter: Option<i64>,
}

#[derive(Debug)]
enum Projection {
    IdOf(Node),
    Count,
    Var,
}

#[derive(Debug)]
struct Resource {
    id: ResourceId,
    uri: String,
    statements: Vec<(String, Value)>,
}

#[derive(Debug, Default)]
struct StoreState {
    next_id: i64,
    resources: Vec<Resource>,
    properties: HashMap<String, ResourceId>,
    blank_nodes: u64,
}

impl StoreState {
    fn allocate(&mut self) -> ResourceId {
        self.next_id += 1;
        ResourceId(self.next_id)
    }

    fn property_id(&mut self, property: &str) -> ResourceId {
        if let Some(id) = self.properties.get(property) {
            return *id;
        }
        let id = self.allocate();
        self.properties.insert(property.to_string(), id);
        id
    }

    fn position(&self, uri: &str) -> Option<usize> {
        self.resources.iter().position(|r| r.uri == uri)
    }
}

/// Resource table with a notifier, driven by SPARQL text
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
    hub: NotifierHub,
    service: String,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::default(),
            hub: NotifierHub::new(),
            service: "org.freedesktop.Tracker3.Memory".to_string(),
        }
    }

    /// Hub receiving one batch per successful update
    pub fn notifier(&self) -> NotifierHub {
        self.hub.clone()
    }

    pub fn resource_count(&self) -> usize {
        self.lock().resources.len()
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn apply_update(&self, sparql: &str) -> Result<Vec<ChangeEvent>> {
        let mut parser = Parser::new(sparql)?;
        let insert = match parser.next()?.as_str() {
            "INSERT" => true,
            "DELETE" => false,
            other => return Err(Error::query(format!("unsupported update {:?}", other))),
        };
        parser.expect("DATA")?;
        let block = parser.block()?;
        parser.finish()?;

        let mut state = self.lock();
        let mut events = Vec::new();
        let mut blanks: HashMap<String, String> = HashMap::new();

        for group in block.groups {
            let uri = match group.subject {
                Node::Iri(uri) => uri,
                Node::Blank(label) if insert => blanks
                    .entry(label)
                    .or_insert_with(|| {
                        state.blank_nodes += 1;
                        format!("urn:bnode:{}", state.blank_nodes)
                    })
                    .clone(),
                other => return Err(Error::query(format!("unsupported subject {:?}", other))),
            };

            if insert {
                insert_group(&mut state, &mut events, &mut blanks, uri, group.pairs)?;
            } else {
                delete_group(&mut state, &mut events, &uri, group.pairs)?;
            }
        }

        Ok(events)
    }
}

fn insert_group(
    state: &mut StoreState,
    events: &mut Vec<ChangeEvent>,
    blanks: &mut HashMap<String, String>,
    uri: String,
    pairs: Vec<(Node, Node)>,
) -> Result<()> {
    let index = match state.position(&uri) {
        Some(index) => index,
        None => {
            let id = state.allocate();
            events.push(ChangeEvent::created(id).with_uri(uri.clone()));
            state.resources.push(Resource {
                id,
                uri: uri.clone(),
                statements: Vec::new(),
            });
            state.resources.len() - 1
        }
    };

    for (predicate, object) in pairs {
        let predicate = iri(predicate)?;
        let value = match object {
            Node::Iri(v) => Value::Iri(v),
            Node::Literal(v) => Value::Literal(v),
            Node::Blank(label) => Value::Iri(
                blanks
                    .get(&label)
                    .cloned()
                    .ok_or_else(|| Error::query(format!("undefined blank node _:{}", label)))?,
            ),
            Node::Var(v) => return Err(Error::query(format!("variable {} in DATA", v))),
        };
        let property_id = state.property_id(&predicate);
        let resource = &mut state.resources[index];
        if !resource.statements.contains(&(predicate.clone(), value.clone())) {
            resource.statements.push((predicate, value));
            events.push(
                ChangeEvent::updated(resource.id)
                    .with_uri(uri.clone())
                    .with_property(property_id),
            );
        }
    }
    Ok(())
}

fn delete_group(
    state: &mut StoreState,
    events: &mut Vec<ChangeEvent>,
    uri: &str,
    pairs: Vec<(Node, Node)>,
) -> Result<()> {
    let Some(index) = state.position(uri) else {
        debug!("DELETE of unknown resource {}", uri);
        return Ok(());
    };

    let mut removals = Vec::new();
    for (predicate, object) in pairs {
        let predicate = iri(predicate)?;
        let value = match object {
            Node::Iri(v) => Value::Iri(v),
            Node::Literal(v) => Value::Literal(v),
            other => return Err(Error::query(format!("unsupported object {:?}", other))),
        };
        if predicate == RDF_TYPE && value == Value::Iri(RDFS_RESOURCE.to_string()) {
            let resource = state.resources.remove(index);
            events.push(ChangeEvent::deleted(resource.id).with_uri(resource.uri));
            return Ok(());
        }
        removals.push((predicate, value));
    }

    for (predicate, value) in removals {
        let property_id = state.property_id(&predicate);
        let resource = &mut state.resources[index];
        let before = resource.statements.len();
        resource
            .statements
            .retain(|(p, v)| !(p == &predicate && v == &value));
        if resource.statements.len() != before {
            events.push(
                ChangeEvent::updated(resource.id)
                    .with_uri(resource.uri.clone())
                    .with_property(property_id),
            );
        }
    }
    Ok(())
}

fn iri(node: Node) -> Result<String> {
    match node {
        Node::Iri(iri) => Ok(iri),
        other => Err(Error::query(format!("expected an IRI, got {:?}", other))),
    }
}

fn matches_group(resource: &Resource, group: &Group, id_filter: Option<i64>) -> bool {
    if id_filter.is_some_and(|id| resource.id.get() != id) {
        return false;
    }
    if let Node::Iri(uri) = &group.subject {
        if &resource.uri != uri {
            return false;
        }
    }
    group.pairs.iter().all(|(predicate, object)| {
        let Node::Iri(predicate) = predicate else {
            return false;
        };
        resource.statements.iter().any(|(p, v)| {
            p == predicate
                && match (object, v) {
                    (Node::Var(_), _) => true,
                    (Node::Iri(a), Value::Iri(b)) => a == b,
                    (Node::Literal(a), Value::Literal(b)) => a == b,
                    _ => false,
                }
        })
    })
}

impl MemoryStore {
    fn run_query(&self, sparql: &str) -> Result<Vec<Row>> {
        let mut parser = Parser::new(sparql)?;
        let ask = match parser.next()?.as_str() {
            "SELECT" => false,
            "ASK" => true,
            other => return Err(Error::query(format!("unsupported query {:?}", other))),
        };

        let projection = if ask {
            None
        } else {
            let projection = parser.projection()?;
            if parser.peek() == Some("WHERE") {
                parser.next()?;
            }
            Some(projection)
        };
        let block = parser.block()?;
        parser.finish()?;

        if block.groups.len() > 1 {
            return Err(Error::query("only single-subject patterns are supported"));
        }

        let state = self.lock();
        let candidates: Vec<&Resource> = match block.groups.first() {
            Some(group) => state
                .resources
                .iter()
                .filter(|r| matches_group(r, group, block.id_filter))
                .collect(),
            None => Vec::new(),
        };

        let rows = match projection {
            None => vec![vec![(!candidates.is_empty()).to_string()]],
            Some(Projection::Count) => vec![vec![candidates.len().to_string()]],
            Some(Projection::Var) => candidates.iter().map(|r| vec![r.uri.clone()]).collect(),
            Some(Projection::IdOf(Node::Var(_))) => candidates
                .iter()
                .map(|r| vec![r.id.to_string()])
                .collect(),
            Some(Projection::IdOf(Node::Iri(uri))) => {
                let id = state
                    .resources
                    .iter()
                    .find(|r| r.uri == uri)
                    .map(|r| r.id)
                    .or_else(|| state.properties.get(&uri).copied());
                id.map(|id| vec![vec![id.to_string()]]).unwrap_or_default()
            }
            Some(Projection::IdOf(other)) => {
                return Err(Error::query(format!("cannot take tracker:id of {:?}", other)))
            }
        };
        Ok(rows)
    }
}

impl StoreClient for MemoryStore {
    fn query(&self, sparql: &str) -> Result<Vec<Row>> {
        trace!("query: {}", sparql);
        self.run_query(sparql)
    }

    fn update(&self, sparql: &str) -> Result<()> {
        trace!("update: {}", sparql);
        let events = coalesce_events(self.apply_update(sparql)?);
        if !events.is_empty() {
            let batch = NotifierBatch::from_origin(Some(self.service.clone()), None, events);
            self.hub.dispatch(&batch);
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────
// Parsing
// ─────────────────────────────────────────────────────────────────

struct Parser {
    tokens: Vec<String>,
    pos: usize,
}

impl Parser {
    fn new(text: &str) -> Result<Self> {
        let mut tokens = Vec::new();
        let mut last = 0;
        for m in TOKEN.find_iter(text) {
            if !text[last..m.start()].trim().is_empty() {
                return Err(Error::query(format!(
                    "unexpected input {:?}",
                    text[last..m.start()].trim()
                )));
            }
            tokens.push(m.as_str().to_string());
            last = m.end();
        }
        if !text[last..].trim().is_empty() {
            return Err(Error::query(format!("unexpected input {:?}", text[last..].trim())));
        }
        Ok(Self { tokens, pos: 0 })
    }

    fn peek(&self) -> Option<&str> {
        self.tokens.get(self.pos).map(String::as_str)
    }

    fn next(&mut self) -> Result<String> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| Error::query("unexpected end of input"))?;
        self.pos += 1;
        Ok(token)
    }

    fn expect(&mut self, expected: &str) -> Result<()> {
        let token = self.next()?;
        if token == expected {
            Ok(())
        } else {
            Err(Error::query(format!("expected {:?}, got {:?}", expected, token)))
        }
    }

    fn finish(&self) -> Result<()> {
        match self.peek() {
            None => Ok(()),
            Some(token) => Err(Error::query(format!("trailing input {:?}", token))),
        }
    }

    fn projection(&mut self) -> Result<Projection> {
        let token = self.next()?;
        match token.as_str() {
            "tracker:id" => {
                self.expect("(")?;
                let node = self.node()?;
                self.expect(")")?;
                Ok(Projection::IdOf(node))
            }
            "COUNT" => {
                self.expect("(")?;
                self.node()?;
                self.expect(")")?;
                Ok(Projection::Count)
            }
            t if t.starts_with('?') => Ok(Projection::Var),
            other => Err(Error::query(format!("unsupported projection {:?}", other))),
        }
    }

    fn node(&mut self) -> Result<Node> {
        let token = self.next()?;
        let node = if let Some(var) = token.strip_prefix('?') {
            Node::Var(var.to_string())
        } else if token.starts_with('<') {
            Node::Iri(token[1..token.len() - 1].to_string())
        } else if token.starts_with('"') {
            Node::Literal(unescape(&token[1..token.len() - 1]))
        } else if let Some(label) = token.strip_prefix("_:") {
            Node::Blank(label.to_string())
        } else if token == "a" {
            Node::Iri(RDF_TYPE.to_string())
        } else if token.starts_with(|c: char| c == '-' || c.is_ascii_digit()) {
            Node::Literal(token)
        } else if token.contains(':') {
            Node::Iri(token)
        } else {
            return Err(Error::query(format!("unexpected token {:?}", token)));
        };
        Ok(node)
    }

    /// `{ group (. group)* [FILTER (tracker:id(?v) = N)] }`
    fn block(&mut self) -> Result<Block> {
        self.expect("{")?;
        let mut block = Block::default();

        loop {
            match self.peek() {
                Some("}") => {
                    self.next()?;
                    return Ok(block);
                }
                Some(".") => {
                    self.next()?;
                }
                Some("FILTER") => {
                    self.next()?;
                    self.expect("(")?;
                    self.expect("tracker:id")?;
                    self.expect("(")?;
                    self.node()?;
                    self.expect(")")?;
                    self.expect("=")?;
                    let id = self.next()?;
                    let id = id
                        .parse::<i64>()
                        .map_err(|_| Error::query(format!("bad id {:?}", id)))?;
                    self.expect(")")?;
                    block.id_filter = Some(id);
                }
                Some(_) => {
                    let subject = self.node()?;
                    let mut pairs = vec![(self.node()?, self.node()?)];
                    while self.peek() == Some(";") {
                        self.next()?;
                        pairs.push((self.node()?, self.node()?));
                    }
                    block.groups.push(Group { subject, pairs });
                }
                None => return Err(Error::query("unterminated block")),
            }
        }
    }
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::StoreExt;
    use crate::notifier::Notifier;
    use sandbus_core::ChangeKind;
    use std::sync::Arc;

    fn recording(store: &MemoryStore) -> Arc<Mutex<Vec<NotifierBatch>>> {
        let batches: Arc<Mutex<Vec<NotifierBatch>>> = Arc::default();
        let sink = Arc::clone(&batches);
        store
            .notifier()
            .subscribe(Arc::new(move |batch: &NotifierBatch| sink.lock().unwrap().push(batch.clone())));
        batches
    }

    #[test]
    fn test_insert_emits_created_and_property_updates() {
        let store = MemoryStore::new();
        let batches = recording(&store);

        store
            .update("INSERT DATA { <urn:a> a nfo:Document ; nie:title \"A\" }")
            .unwrap();

        let batches = batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        let kinds: Vec<_> = batches[0].events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![ChangeKind::Created, ChangeKind::Updated, ChangeKind::Updated]
        );
        assert_eq!(batches[0].events[0].subject_uri.as_deref(), Some("urn:a"));
        assert!(batches[0].events[0].property_id.is_none());
    }

    #[test]
    fn test_delete_resource_emits_deleted() {
        let store = MemoryStore::new();
        store.update("INSERT DATA { <urn:a> a nfo:Document }").unwrap();
        let id = store.resource_id_by_uri("<urn:a>").unwrap();
        let batches = recording(&store);

        store.update("DELETE DATA { <urn:a> a rdfs:Resource }").unwrap();

        let batches = batches.lock().unwrap();
        assert_eq!(batches[0].events, vec![ChangeEvent::deleted(id).with_uri("urn:a")]);
        assert_eq!(store.resource_count(), 0);
    }

    #[test]
    fn test_delete_unknown_resource_is_silent() {
        let store = MemoryStore::new();
        let batches = recording(&store);
        store.update("DELETE DATA { <urn:none> a rdfs:Resource }").unwrap();
        assert!(batches.lock().unwrap().is_empty());
    }

    #[test]
    fn test_queries() {
        let store = MemoryStore::new();
        store
            .update(
                "INSERT DATA { <urn:a> a nmm:MusicPiece ; nie:url \"file:///a.mp3\" . \
                 <urn:b> a nmm:MusicPiece ; nie:url \"file:///b.mp3\" }",
            )
            .unwrap();

        assert_eq!(store.count_instances("nmm:MusicPiece").unwrap(), 2);
        assert_eq!(store.count_instances("nfo:Document").unwrap(), 0);

        let b = store.resource_id_by_url("file:///b.mp3").unwrap();
        assert_eq!(store.resource_id_by_uri("<urn:b>").unwrap(), b);

        let rows = store
            .query(&format!(
                "SELECT ?urn WHERE {{ ?urn a nmm:MusicPiece ; nie:url \"file:///b.mp3\" . \
                 FILTER (tracker:id(?urn) = {}) }}",
                b
            ))
            .unwrap();
        assert_eq!(rows, vec![vec!["urn:b".to_string()]]);

        assert!(store.ask("ASK { <urn:a> a nmm:MusicPiece }").unwrap());
        assert!(!store.ask("ASK { ?r nie:url \"file:///c.mp3\" }").unwrap());
    }

    #[test]
    fn test_property_ids_are_stable() {
        let store = MemoryStore::new();
        store.update("INSERT DATA { <urn:a> nie:title \"x\" }").unwrap();
        let first = store.resource_id_by_uri("nie:title").unwrap();
        store.update("INSERT DATA { <urn:b> nie:title \"y\" }").unwrap();
        assert_eq!(store.resource_id_by_uri("nie:title").unwrap(), first);
    }

    #[test]
    fn test_blank_node_subject() {
        let store = MemoryStore::new();
        store
            .update("INSERT DATA { _:x a nfo:Document ; nie:url \"file:///blank\" }")
            .unwrap();
        let id = store.resource_id_by_url("file:///blank").unwrap();
        assert!(id.get() > 0);
    }

    #[test]
    fn test_escaped_literals_round_trip() {
        let store = MemoryStore::new();
        store
            .update(&crate::query::insert_data(
                "urn:q",
                &[("nie:title", crate::query::literal("say \"hi\""))],
            ))
            .unwrap();
        assert!(store.ask("ASK { ?r nie:title \"say \\\"hi\\\"\" }").unwrap());
    }

    #[test]
    fn test_syntax_errors() {
        let store = MemoryStore::new();
        assert!(store.update("LOAD <http://example.org>").is_err());
        assert!(store.query("SELECT ?u WHERE { ?u a").is_err());
        assert!(store.query("SELECT ?u WHERE { } !").is_err());
    }
}
