//! Query/update client of the data store
//!
//! The store is an external collaborator. The harness only needs synchronous
//! request/response: confirmation queries run inside notification callbacks,
//! where there is no executor to await on.

use std::sync::Arc;

use sandbus_core::prelude::*;
use sandbus_core::ResourceId;

use crate::query;

/// One result row, cells rendered as strings (unbound cells are empty)
pub type Row = Vec<String>;

/// Synchronous request/response access to the store
pub trait StoreClient: Send + Sync {
    fn query(&self, sparql: &str) -> Result<Vec<Row>>;

    fn update(&self, sparql: &str) -> Result<()>;
}

impl<T: StoreClient + ?Sized> StoreClient for Arc<T> {
    fn query(&self, sparql: &str) -> Result<Vec<Row>> {
        (**self).query(sparql)
    }

    fn update(&self, sparql: &str) -> Result<()> {
        (**self).update(sparql)
    }
}

/// Convenience queries used by tests
pub trait StoreExt: StoreClient {
    /// Number of instances of `class`
    fn count_instances(&self, class: &str) -> Result<u64> {
        let rows = self.query(&query::count_instances_query(class))?;
        let cell = single_cell(rows, || format!("instances of {}", class))?;
        cell.parse::<u64>()
            .map_err(|_| Error::query(format!("COUNT returned {:?}", cell)))
    }

    /// Internal id of a resource or property given by URI or prefixed name
    fn resource_id_by_uri(&self, uri: &str) -> Result<ResourceId> {
        let rows = self.query(&query::resource_id_by_uri_query(uri))?;
        parse_id(single_cell(rows, || format!("resource {}", uri))?)
    }

    /// Internal id of the resource whose `nie:url` is `url`
    fn resource_id_by_url(&self, url: &str) -> Result<ResourceId> {
        let rows = self.query(&query::resource_id_by_url_query(url))?;
        parse_id(single_cell(rows, || format!("resource with url {}", url))?)
    }

    fn ask(&self, ask_query: &str) -> Result<bool> {
        if !ask_query.trim_start().starts_with("ASK") {
            return Err(Error::query("not an ASK query"));
        }
        let rows = self.query(ask_query)?;
        match single_cell(rows, || "ASK answer".to_string())?.as_str() {
            "true" => Ok(true),
            "false" => Ok(false),
            other => Err(Error::query(format!("unexpected ASK answer {:?}", other))),
        }
    }
}

impl<T: StoreClient + ?Sized> StoreExt for T {}

/// The only cell of the only row; zero or several rows are errors
fn single_cell(rows: Vec<Row>, what: impl FnOnce() -> String) -> Result<String> {
    match rows.len() {
        0 => Err(Error::query(format!("No entry for {}", what()))),
        1 => rows
            .into_iter()
            .next()
            .and_then(|row| row.into_iter().next())
            .filter(|cell| !cell.is_empty())
            .ok_or_else(|| Error::query(format!("Empty result for {}", what()))),
        n => Err(Error::query(format!("{} entries for {}", n, what()))),
    }
}

fn parse_id(cell: String) -> Result<ResourceId> {
    cell.parse::<i64>()
        .map(ResourceId)
        .map_err(|_| Error::query(format!("not a resource id: {:?}", cell)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Replays canned rows and records queries
    #[derive(Default)]
    struct CannedStore {
        rows: Mutex<Vec<Vec<Row>>>,
        seen: Mutex<Vec<String>>,
    }

    impl CannedStore {
        fn answering(rows: Vec<Vec<&str>>) -> Self {
            let rows = rows
                .into_iter()
                .map(|r| r.into_iter().map(String::from).collect())
                .collect();
            Self {
                rows: Mutex::new(vec![rows]),
                seen: Mutex::default(),
            }
        }
    }

    impl StoreClient for CannedStore {
        fn query(&self, sparql: &str) -> Result<Vec<Row>> {
            self.seen.lock().unwrap().push(sparql.to_string());
            Ok(self.rows.lock().unwrap().pop().unwrap_or_default())
        }

        fn update(&self, _sparql: &str) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_resource_id_by_url() {
        let store = CannedStore::answering(vec![vec!["17"]]);
        assert_eq!(store.resource_id_by_url("file:///a").unwrap(), ResourceId(17));
        assert_eq!(
            store.seen.lock().unwrap()[0],
            "SELECT tracker:id(?r) WHERE { ?r nie:url \"file:///a\" }"
        );
    }

    #[test]
    fn test_missing_resource_is_error() {
        let store = CannedStore::answering(vec![]);
        let err = store.resource_id_by_uri("nie:url").unwrap_err();
        assert!(err.to_string().contains("No entry for resource nie:url"));
    }

    #[test]
    fn test_multiple_rows_is_error() {
        let store = CannedStore::answering(vec![vec!["1"], vec!["2"]]);
        let err = store.resource_id_by_url("file:///dup").unwrap_err();
        assert!(err.to_string().contains("2 entries"));
    }

    #[test]
    fn test_ask_answers() {
        assert!(CannedStore::answering(vec![vec!["true"]])
            .ask("ASK { ?r a nfo:Document }")
            .unwrap());
        assert!(!CannedStore::answering(vec![vec!["false"]])
            .ask("ASK { ?r a nfo:Document }")
            .unwrap());
        assert!(CannedStore::answering(vec![vec!["maybe"]])
            .ask("ASK { ?r a nfo:Document }")
            .is_err());
    }

    #[test]
    fn test_ask_rejects_select() {
        let store = CannedStore::answering(vec![vec!["true"]]);
        assert!(store.ask("SELECT ?r WHERE { }").is_err());
        assert!(store.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_count_instances() {
        let store = CannedStore::answering(vec![vec!["3"]]);
        assert_eq!(store.count_instances("nmm:MusicPiece").unwrap(), 3);
    }
}
