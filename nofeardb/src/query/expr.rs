use crate::datatypes::Value;
use crate::document::Model;
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
}

/// Predicate over a document's field values.
///
/// Fields are addressed by their persisted name; `"id"` resolves to the document identity.
/// Values of different kinds never compare, except integers against floats.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Compare {
        field: String,
        op: CompareOp,
        value: Value,
    },
    In {
        field: String,
        values: Vec<Value>,
    },
    IsNull(String),
    IsNotNull(String),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

impl Expr {
    fn compare(field: &str, op: CompareOp, value: impl Into<Value>) -> Expr {
        Expr::Compare {
            field: field.to_string(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(field: &str, value: impl Into<Value>) -> Expr {
        Self::compare(field, CompareOp::Eq, value)
    }

    /// Negation of [`eq`](Self::eq): values of different kinds are never equal, so they match.
    pub fn neq(field: &str, value: impl Into<Value>) -> Expr {
        Self::compare(field, CompareOp::Neq, value)
    }

    pub fn lt(field: &str, value: impl Into<Value>) -> Expr {
        Self::compare(field, CompareOp::Lt, value)
    }

    pub fn lte(field: &str, value: impl Into<Value>) -> Expr {
        Self::compare(field, CompareOp::Lte, value)
    }

    pub fn gt(field: &str, value: impl Into<Value>) -> Expr {
        Self::compare(field, CompareOp::Gt, value)
    }

    pub fn gte(field: &str, value: impl Into<Value>) -> Expr {
        Self::compare(field, CompareOp::Gte, value)
    }

    pub fn is_in<V: Into<Value>>(field: &str, values: impl IntoIterator<Item = V>) -> Expr {
        Expr::In {
            field: field.to_string(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_null(field: &str) -> Expr {
        Expr::IsNull(field.to_string())
    }

    pub fn is_not_null(field: &str) -> Expr {
        Expr::IsNotNull(field.to_string())
    }

    pub fn and(self, other: Expr) -> Expr {
        Expr::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: Expr) -> Expr {
        Expr::Or(Box::new(self), Box::new(other))
    }

    /// Evaluate against a document. Unknown field names never match.
    pub fn evaluate(&self, doc: &dyn Model) -> bool {
        match self {
            Expr::Compare { field, op, value } => {
                let Some(actual) = doc.field_value(field) else {
                    return false;
                };
                let ordering = actual.compare(value);
                match op {
                    CompareOp::Eq => ordering == Some(Ordering::Equal),
                    CompareOp::Neq => ordering != Some(Ordering::Equal),
                    CompareOp::Lt => ordering == Some(Ordering::Less),
                    CompareOp::Lte => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
                    CompareOp::Gt => ordering == Some(Ordering::Greater),
                    CompareOp::Gte => {
                        matches!(ordering, Some(Ordering::Greater | Ordering::Equal))
                    }
                }
            }
            Expr::In { field, values } => doc
                .field_value(field)
                .is_some_and(|actual| values.iter().any(|v| actual.loosely_equals(v))),
            Expr::IsNull(field) => doc.field_value(field).is_some_and(|v| v.is_null()),
            Expr::IsNotNull(field) => doc.field_value(field).is_some_and(|v| !v.is_null()),
            Expr::And(a, b) => a.evaluate(doc) && b.evaluate(doc),
            Expr::Or(a, b) => a.evaluate(doc) || b.evaluate(doc),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::testing::TestDoc;
    use crate::document::DocumentStatus;

    fn doc(title: &str, count: Option<i64>) -> TestDoc {
        let mut doc = TestDoc::default();
        doc.set_title(title).unwrap();
        doc.set_count(count).unwrap();
        doc
    }

    #[test]
    fn test_comparisons() {
        let d = doc("alpha", Some(5));
        assert!(Expr::eq("title", "alpha").evaluate(&d));
        assert!(Expr::neq("title", "beta").evaluate(&d));
        assert!(Expr::lt("count", 6).evaluate(&d));
        assert!(Expr::lte("count", 5).evaluate(&d));
        assert!(Expr::gt("count", 4.5).evaluate(&d));
        assert!(Expr::gte("count", 5.0).evaluate(&d));
        assert!(!Expr::gt("count", 5).evaluate(&d));
        assert!(!Expr::lt("title", 3).evaluate(&d));
        assert!(!Expr::eq("title", 3).evaluate(&d));
        assert!(Expr::neq("title", 3).evaluate(&d));
    }

    #[test]
    fn test_null_checks() {
        let d = doc("alpha", None);
        assert!(Expr::is_null("count").evaluate(&d));
        assert!(Expr::is_not_null("title").evaluate(&d));
        assert!(!Expr::eq("count", 0).evaluate(&d));
        assert!(!Expr::is_null("missing").evaluate(&d));
        assert_eq!(d.status(), DocumentStatus::New);
    }

    #[test]
    fn test_membership_and_combinators() {
        let d = doc("alpha", Some(2));
        assert!(Expr::is_in("title", ["alpha", "beta"]).evaluate(&d));
        assert!(!Expr::is_in("count", [1, 3]).evaluate(&d));
        assert!(Expr::eq("title", "alpha").and(Expr::gt("count", 1)).evaluate(&d));
        assert!(!Expr::eq("title", "beta").and(Expr::gt("count", 1)).evaluate(&d));
        assert!(Expr::eq("title", "beta").or(Expr::gt("count", 1)).evaluate(&d));
    }

    #[test]
    fn test_identity() {
        let d = doc("alpha", None);
        assert!(Expr::eq("id", d.meta.id()).evaluate(&d));
    }
}
