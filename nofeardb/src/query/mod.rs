// Query results and the expression language used to narrow them

mod expr;

pub use expr::{CompareOp, Expr};

use crate::document::{DocHandle, DocumentGraph, Model};
use crate::error::{NoFearDbError, Result};

/// An immutable result set of documents in a [`DocumentGraph`].
///
/// Filtering returns a new `QueryFilter` that still remembers the unfiltered result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryFilter {
    original: Vec<DocHandle>,
    modified: Vec<DocHandle>,
}

impl QueryFilter {
    pub fn new(handles: Vec<DocHandle>) -> Self {
        QueryFilter {
            original: handles.clone(),
            modified: handles,
        }
    }

    /// Keep the documents matching `expr`.
    pub fn filter(&self, graph: &DocumentGraph, expr: &Expr) -> Result<QueryFilter> {
        self.filter_by(graph, |doc| expr.evaluate(doc))
    }

    /// Keep the documents matching an arbitrary predicate.
    pub fn filter_by<F>(&self, graph: &DocumentGraph, predicate: F) -> Result<QueryFilter>
    where
        F: Fn(&dyn Model) -> bool,
    {
        let mut modified = Vec::new();
        for handle in &self.modified {
            if predicate(graph.model(*handle)?) {
                modified.push(*handle);
            }
        }
        Ok(QueryFilter {
            original: self.original.clone(),
            modified,
        })
    }

    pub fn all(&self) -> &[DocHandle] {
        &self.modified
    }

    /// The result before any filter was applied.
    pub fn unfiltered(&self) -> &[DocHandle] {
        &self.original
    }

    pub fn len(&self) -> usize {
        self.modified.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modified.is_empty()
    }

    pub fn first(&self) -> Result<DocHandle> {
        self.modified.first().copied().ok_or_else(no_result)
    }

    pub fn last(&self) -> Result<DocHandle> {
        self.modified.last().copied().ok_or_else(no_result)
    }
}

impl IntoIterator for QueryFilter {
    type Item = DocHandle;
    type IntoIter = std::vec::IntoIter<DocHandle>;

    fn into_iter(self) -> Self::IntoIter {
        self.modified.into_iter()
    }
}

fn no_result() -> NoFearDbError {
    NoFearDbError::NotFound("query returned no documents".into())
}
