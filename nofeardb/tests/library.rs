use chrono::NaiveDate;
use nofeardb::datatypes::{DateTime, Text};
use nofeardb::{
    Document, DocumentGraph, DocumentMeta, DocumentStatus, Expr, Field, ManyToOne,
    NoFearDbError, OneToMany, StorageEngine,
};
use pretty_assertions::assert_eq;
use std::fs;
use tempfile::TempDir;

struct Author {
    meta: DocumentMeta,
    name: Field<Text>,
    books: OneToMany,
}

impl Default for Author {
    fn default() -> Self {
        Author {
            meta: DocumentMeta::new(),
            name: Field::required("name"),
            books: OneToMany::new("books", "Book").back_populates("author"),
        }
    }
}

nofeardb::impl_document!(Author, name = "authors" {
    fields: [name],
    relationships: [books],
});

struct Book {
    meta: DocumentMeta,
    title: Field<Text>,
    published: Field<DateTime>,
    author: ManyToOne,
}

impl Default for Book {
    fn default() -> Self {
        Book {
            meta: DocumentMeta::new(),
            title: Field::required("title"),
            published: Field::new("published"),
            author: ManyToOne::new("author", "Author").back_populates("books"),
        }
    }
}

impl Book {
    fn titled(title: &str) -> Book {
        let mut book = Book::default();
        book.title
            .set(&mut book.meta, Some(title.to_string()))
            .unwrap();
        book
    }
}

nofeardb::impl_document!(Book, name = "books" {
    fields: [title, published],
    relationships: [author],
});

fn open(tmp: &TempDir) -> StorageEngine {
    let mut engine = StorageEngine::open(tmp.path()).unwrap();
    engine
        .register_models(&[Author::descriptor(), Book::descriptor()])
        .unwrap();
    engine
}

/// One author with two books, persisted through the author.
fn seed(tmp: &TempDir) {
    let engine = open(tmp);
    let mut graph = DocumentGraph::new();

    let mut author = Author::default();
    author
        .name
        .set(&mut author.meta, Some("Frank Herbert".into()))
        .unwrap();
    let author = graph.insert(author);

    let mut dune = Book::titled("Dune");
    let published = NaiveDate::from_ymd_opt(1965, 8, 1)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap();
    dune.published.set(&mut dune.meta, Some(published)).unwrap();
    let dune = graph.insert(dune);
    let messiah = graph.insert(Book::titled("Dune Messiah"));

    graph.append(author, "books", dune).unwrap();
    graph.set_related_one(messiah, "author", Some(author)).unwrap();
    assert_eq!(graph.related(author, "books").unwrap(), vec![dune, messiah]);

    engine.create(&mut graph, author).unwrap();
    for handle in [author, dune, messiah] {
        assert_eq!(graph.model(handle).unwrap().status(), DocumentStatus::Sync);
    }
}

#[test]
fn test_documents_survive_a_fresh_engine() {
    let tmp = TempDir::new().unwrap();
    seed(&tmp);

    let engine = open(&tmp);
    let mut graph = DocumentGraph::new();
    let found = engine
        .read::<Book>(&mut graph, Some(&Expr::eq("title", "Dune")))
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found.unfiltered().len(), 2);

    let dune = found.first().unwrap();
    let book = graph.get::<Book>(dune).unwrap();
    assert_eq!(book.title.get().map(String::as_str), Some("Dune"));
    assert!(book.published.get().is_some());

    let author = graph.related_one(dune, "author").unwrap().unwrap();
    assert_eq!(graph.model(author).unwrap().status(), DocumentStatus::Lazy);
    assert!(graph.get::<Author>(author).unwrap().name.get().is_none());

    engine.load(&mut graph, author).unwrap();
    let loaded = graph.get::<Author>(author).unwrap();
    assert_eq!(loaded.meta.status(), DocumentStatus::Sync);
    assert_eq!(loaded.name.get().map(String::as_str), Some("Frank Herbert"));
    assert_eq!(loaded.books.len(), 2);
    assert_eq!(loaded.books.get(0), Some(dune));

    let err = engine.load(&mut graph, author).unwrap_err();
    assert!(matches!(err, NoFearDbError::State(_)));
}

#[test]
fn test_update_rewrites_only_the_changed_document() {
    let tmp = TempDir::new().unwrap();
    seed(&tmp);

    let engine = open(&tmp);
    let mut graph = DocumentGraph::new();
    let messiah = engine
        .query::<Book>(&mut graph)
        .unwrap()
        .filter(&graph, &Expr::eq("title", "Dune Messiah"))
        .unwrap()
        .first()
        .unwrap();

    let authors_before = engine.raw_documents("authors").unwrap();
    {
        let book = graph.get_mut::<Book>(messiah).unwrap();
        book.title
            .set(&mut book.meta, Some("Dune Messiah (1969)".into()))
            .unwrap();
        assert_eq!(book.meta.status(), DocumentStatus::Mod);
    }
    engine.update(&mut graph, messiah).unwrap();
    assert_eq!(graph.model(messiah).unwrap().status(), DocumentStatus::Sync);

    let titles: Vec<String> = engine
        .raw_documents("books")
        .unwrap()
        .into_iter()
        .filter_map(|(_, doc)| doc["title"].as_str().map(str::to_string))
        .collect();
    assert_eq!(titles.len(), 2);
    assert!(titles.contains(&"Dune Messiah (1969)".to_string()));
    assert_eq!(engine.raw_documents("authors").unwrap(), authors_before);
}

#[test]
fn test_engine_settings_come_from_the_data_directory() {
    let tmp = TempDir::new().unwrap();
    fs::write(
        tmp.path().join("nofeardb.yaml"),
        "lock_expiration_secs: 5\npretty_json: false\n",
    )
    .unwrap();
    seed(&tmp);

    let engine = open(&tmp);
    assert_eq!(engine.config().lock_expiration_secs, 5);
    for (path, _) in engine.raw_documents("books").unwrap() {
        let content = fs::read_to_string(path).unwrap();
        assert!(!content.contains('\n'));
    }
    assert!(engine.locks("books").unwrap().is_empty());
}
