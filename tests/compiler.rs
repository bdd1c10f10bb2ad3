//! Compiler properties over the bookshop schema.

use djaq::parser::parse_columns;
use djaq::prelude::*;
use pretty_assertions::assert_eq;

fn bookshop() -> Schema {
    Schema::from_json(include_str!("fixtures/bookshop.json")).unwrap()
}

fn compile(model: &str, statement: SelectStatement) -> DjaqResult<Compiled> {
    djaq::compile(
        &bookshop(),
        &CompileOptions::default(),
        model,
        &statement,
        &Context::new(),
    )
}

#[test]
fn single_table_expressions_have_one_relation() {
    for select in [
        "id",
        "id, name",
        "name, price * 2 as double_price, lower(name)",
        "(id, name, pages, rating)",
        "iif(pages > 100, 'long', 'short') as length, coalesce(rating, 0)",
    ] {
        let compiled = compile("Book", SelectStatement::new(select)).unwrap();
        assert_eq!(compiled.relations, 1, "{}", select);
        assert!(!compiled.sql.contains("JOIN"), "{}", compiled.sql);
        assert!(!compiled.sql.contains("GROUP BY"), "{}", compiled.sql);
        assert_eq!(
            compiled.columns.len(),
            parse_columns(select).unwrap().len(),
            "{}",
            select
        );
    }
}

#[test]
fn aggregates_group_every_other_column() {
    let compiled = compile(
        "Book",
        SelectStatement::new("publisher.name, name, sum(pages), max(price) as top, rating"),
    )
    .unwrap();
    let group_by = compiled.sql.split(" GROUP BY ").nth(1).unwrap();
    assert_eq!(
        group_by,
        r#""books_publisher"."name", "books_book"."name", "books_book"."rating""#
    );
}

#[test]
fn compiling_twice_is_identical() {
    let db = DjaqDB::new(bookshop());
    let mut query = db
        .query("Book", "name, authors.name")
        .unwrap()
        .filter("pages > {min}")
        .context(context([("min", 3)]));
    let first = query.sql().unwrap();
    let second = query.sql().unwrap();
    assert_eq!(first, second);
    query.rewind();
    assert_eq!(query.sql().unwrap(), first);
}

#[test]
fn whitelist_blocks_paths_into_hidden_models() {
    let db = DjaqDB::new(bookshop()).with_options(
        CompileOptions::default().whitelist(Whitelist::new().allow("books", &["Book"])),
    );
    assert!(db.query("Book", "name").unwrap().sql().is_ok());

    let err = db
        .query("Book", "Book.publisher.name")
        .unwrap()
        .sql()
        .unwrap_err();
    assert!(matches!(err, DjaqError::ModelNotFound(_)), "{:?}", err);

    let err = db.query("Author", "name").err().unwrap();
    assert!(matches!(err, DjaqError::ModelNotFound(_)));

    let empty_means_all = DjaqDB::new(bookshop()).with_options(
        CompileOptions::default().whitelist(Whitelist::new().allow("books", &[])),
    );
    assert!(empty_means_all.query("Book", "publisher.owner.name").unwrap().sql().is_ok());
    assert!(empty_means_all.query("User", "id").is_err());
}

#[test]
fn condition_pruning() {
    let condition = B::new("x == '{v}'") & B::new("y == 1");
    assert_eq!(condition.render(&Context::new()), "(y == 1)");
}

#[test]
fn many_to_many_adds_two_joins() {
    let compiled = compile("Book", SelectStatement::new("Book.authors.name")).unwrap();
    assert_eq!(compiled.relations, 3);
    assert_eq!(compiled.sql.matches("LEFT JOIN").count(), 2);

    // and the way back, Author to Book through the generated reverse
    let compiled = compile("Author", SelectStatement::new("name, count(book) as books")).unwrap();
    assert_eq!(
        compiled.sql,
        concat!(
            r#"SELECT "books_author"."name" AS "name", count("books_book"."id") AS "books" "#,
            r#"FROM "books_author" "#,
            r#"LEFT JOIN "books_book_authors" ON ("books_author"."id" = "books_book_authors"."author_id") "#,
            r#"LEFT JOIN "books_book" ON ("books_book_authors"."book_id" = "books_book"."id") "#,
            r#"GROUP BY "books_author"."name""#
        )
    );
}

fn kind(err: &DjaqError) -> &'static str {
    match err {
        DjaqError::ModelNotFound(_) => "model",
        DjaqError::FieldNotFound { .. } => "field",
        DjaqError::UnknownFunction(_) => "function",
        DjaqError::Parse { .. } => "parse",
        DjaqError::InvalidExpression(_) => "invalid",
        DjaqError::SubqueryResolution(_) => "subquery",
        _ => "other",
    }
}

#[test]
fn failures_are_typed() {
    let cases = [
        ("Nope", SelectStatement::new("id"), "model"),
        ("Book", SelectStatement::new("nmae"), "field"),
        ("Book", SelectStatement::new("sleep(1)"), "function"),
        ("Book", SelectStatement::new("id").filter("id =="), "parse"),
        ("Book", SelectStatement::new("(id, name"), "invalid"),
        ("Book", SelectStatement::new("id").order_by("-id asc"), "invalid"),
        ("Book", SelectStatement::new("id").filter("id in '@missing'"), "subquery"),
    ];
    for (model, statement, expected) in cases {
        let err = compile(model, statement.clone()).unwrap_err();
        assert_eq!(kind(&err), expected, "{:?} gave {:?}", statement, err);
        assert!(err.is_compile_error());
    }

    let err = compile("Book", SelectStatement::new("nmae")).unwrap_err();
    assert!(err.to_string().contains("did you mean 'name'?"), "{}", err);
}

#[test]
fn sqlite_dialect_end_to_end_text() {
    let options = CompileOptions::default().dialect(Dialect::Sqlite);
    let compiled = djaq::compile(
        &bookshop(),
        &options,
        "Book",
        &SelectStatement::new("pubdate.month as month, count(id) as n")
            .filter("pubdate.year == {year} and id in {ids}")
            .order_by("pubdate.month"),
        &context([
            ("year", DjaqValue::from(2021)),
            ("ids", DjaqValue::from(vec![1, 2])),
        ]),
    )
    .unwrap();
    assert_eq!(
        compiled.sql,
        concat!(
            r#"SELECT CAST(strftime('%m', "books_book"."pubdate") AS INTEGER) AS "month", "#,
            r#"count("books_book"."id") AS "n" FROM "books_book" "#,
            r#"WHERE (CAST(strftime('%Y', "books_book"."pubdate") AS INTEGER) = ?1 "#,
            r#"AND "books_book"."id" IN (?2, ?3)) "#,
            r#"GROUP BY CAST(strftime('%m', "books_book"."pubdate") AS INTEGER) "#,
            r#"ORDER BY CAST(strftime('%m', "books_book"."pubdate") AS INTEGER) ASC"#
        )
    );
    assert_eq!(
        compiled.parameters,
        vec![DjaqValue::Int(2021), DjaqValue::Int(1), DjaqValue::Int(2)]
    );
}
