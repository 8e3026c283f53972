//! Behaviour every [`Catalog`] implementation must share.

use crate::{
    interface::{Catalog, Error},
    query::{Pageable, PartitionFilter, Sort, SortField, SortOrder, UriLookup},
    types::{Partition, PartitionParams, Table, TableId, TableReference, Timestamp},
};
use assert_matches::assert_matches;
use futures::{stream::FuturesOrdered, StreamExt};
use pretty_assertions::assert_eq;
use std::{future::Future, sync::Arc};

pub(crate) async fn test_catalog<R, F>(clean_state: R)
where
    R: Fn() -> F + Send + Sync,
    F: Future<Output = Arc<dyn Catalog>> + Send,
{
    test_setup(clean_state().await).await;
    test_tables(clean_state().await).await;
    test_partition_create(clean_state().await).await;
    test_filter_by_names(clean_state().await).await;
    test_filter_by_name_parts(clean_state().await).await;
    test_filter_by_date_criteria(clean_state().await).await;
    test_sort_and_page(clean_state().await).await;
    test_text_sort_is_bytewise(clean_state().await).await;
    test_large_lists(clean_state().await).await;
    test_count(clean_state().await).await;
    test_delete_by_names(clean_state().await).await;
    test_get_by_uris(clean_state().await).await;
    test_concurrent_reads(clean_state().await).await;
}

async fn test_setup(catalog: Arc<dyn Catalog>) {
    // setup must be repeatable
    catalog.setup().await.expect("first catalog setup");
    catalog.setup().await.expect("second catalog setup");
}

async fn test_tables(catalog: Arc<dyn Catalog>) {
    let mut repos = catalog.repositories().await;

    let reference = TableReference::new("prodhive", "events", "clicks");
    assert_eq!(
        repos.tables().get_by_reference(&reference).await.unwrap(),
        None
    );

    let table = repos.tables().create_or_get(&reference).await.unwrap();
    assert_eq!(table.reference, reference);

    // idempotent
    let again = repos.tables().create_or_get(&reference).await.unwrap();
    assert_eq!(table, again);
    assert_eq!(
        repos.tables().get_by_reference(&reference).await.unwrap(),
        Some(table.clone())
    );

    // names are case sensitive and qualified
    let upper = repos
        .tables()
        .create_or_get(&TableReference::new("prodhive", "events", "CLICKS"))
        .await
        .unwrap();
    assert_ne!(upper.id, table.id);
    let other_db = repos
        .tables()
        .create_or_get(&TableReference::new("prodhive", "other", "clicks"))
        .await
        .unwrap();
    assert_ne!(other_db.id, table.id);
    assert_ne!(other_db.id, upper.id);
}

async fn test_partition_create(catalog: Arc<dyn Catalog>) {
    let mut repos = catalog.repositories().await;
    let table = create_table(&catalog, "t").await;

    let created = repos
        .partitions()
        .create(
            PartitionParams::new(table.id, "dateint=20240101", "s3://bucket/t/dateint=20240101")
                .with_created_date(Timestamp::new(1_704_067_200_000)),
        )
        .await
        .unwrap();
    assert_eq!(created.table_id, table.id);
    assert_eq!(created.name, "dateint=20240101");
    assert_eq!(created.uri, "s3://bucket/t/dateint=20240101");
    assert_eq!(created.created_date, Timestamp::new(1_704_067_200_000));

    let fetched = repos.partitions().get_by_id(created.id).await.unwrap();
    assert_eq!(fetched, Some(created.clone()));

    let err = repos
        .partitions()
        .create(PartitionParams::new(table.id, "dateint=20240101", "s3://elsewhere"))
        .await
        .unwrap_err();
    assert_matches!(err, Error::PartitionNameExists { table_id, name } => {
        assert_eq!(table_id, table.id);
        assert_eq!(name, "dateint=20240101");
    });

    // the same name in another table is fine
    let other = create_table(&catalog, "other").await;
    repos
        .partitions()
        .create(PartitionParams::new(other.id, "dateint=20240101", "s3://bucket/other"))
        .await
        .unwrap();

    let missing = TableId::new(other.id.get() + 1_000);
    let err = repos
        .partitions()
        .create(PartitionParams::new(missing, "p", "s3://nowhere"))
        .await
        .unwrap_err();
    assert_matches!(err, Error::TableNotFound { id } if id == missing);
}

async fn test_filter_by_names(catalog: Arc<dyn Catalog>) {
    let mut repos = catalog.repositories().await;
    let table = create_table(&catalog, "t").await;
    create_partitions(&catalog, &table, &["a", "b", "c"]).await;

    let got = repos
        .partitions()
        .get_partitions(table.id, &PartitionFilter::new().with_names(["a", "c", "zzz"]))
        .await
        .unwrap();
    assert_eq!(sorted_names(&got), vec!["a", "c"]);

    // null entries are ignored
    let got = repos
        .partitions()
        .get_partitions(
            table.id,
            &PartitionFilter::new().with_nullable_names([Some("b"), None]),
        )
        .await
        .unwrap();
    assert_eq!(sorted_names(&got), vec!["b"]);

    // a list of nulls only does not filter at all
    let got = repos
        .partitions()
        .get_partitions(
            table.id,
            &PartitionFilter::new().with_nullable_names([None::<&str>, None]),
        )
        .await
        .unwrap();
    assert_eq!(sorted_names(&got), vec!["a", "b", "c"]);

    // partitions of other tables never leak into a listing
    let other = create_table(&catalog, "other").await;
    create_partitions(&catalog, &other, &["a"]).await;
    let got = repos
        .partitions()
        .get_partitions(other.id, &PartitionFilter::new())
        .await
        .unwrap();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].table_id, other.id);
}

async fn test_filter_by_name_parts(catalog: Arc<dyn Catalog>) {
    let mut repos = catalog.repositories().await;
    let table = create_table(&catalog, "t").await;
    create_partitions(
        &catalog,
        &table,
        &[
            "dateint=20240101/hour=1",
            "dateint=20240101/hour=2",
            "dateint=20240102/hour=1",
        ],
    )
    .await;

    // every part must be contained
    let got = repos
        .partitions()
        .get_partitions(
            table.id,
            &PartitionFilter::new().with_name_parts(["20240101", "hour=1"]),
        )
        .await
        .unwrap();
    assert_eq!(sorted_names(&got), vec!["dateint=20240101/hour=1"]);

    // combined with an exact names list
    let got = repos
        .partitions()
        .get_partitions(
            table.id,
            &PartitionFilter::new()
                .with_names(["dateint=20240101/hour=2", "dateint=20240102/hour=1"])
                .with_name_parts(["hour=1"]),
        )
        .await
        .unwrap();
    assert_eq!(sorted_names(&got), vec!["dateint=20240102/hour=1"]);

    // quotes are ordinary characters
    let got = repos
        .partitions()
        .get_partitions(
            table.id,
            &PartitionFilter::new().with_name_parts(["' OR '1'='1"]),
        )
        .await
        .unwrap();
    assert!(got.is_empty());
}

async fn test_filter_by_date_criteria(catalog: Arc<dyn Catalog>) {
    let mut repos = catalog.repositories().await;
    let table = create_table(&catalog, "t").await;
    for (name, secs) in [("old", 1_000), ("mid", 2_000), ("new", 3_000)] {
        create_partition_at(&catalog, &table, name, secs).await;
    }

    let got = repos
        .partitions()
        .get_partitions(
            table.id,
            &PartitionFilter::new().with_date_created_criteria("created_date >= 2000"),
        )
        .await
        .unwrap();
    assert_eq!(sorted_names(&got), vec!["mid", "new"]);

    let got = repos
        .partitions()
        .get_partitions(
            table.id,
            &PartitionFilter::new().with_date_created_criteria(
                "created_date BETWEEN 1000 AND 2000 AND NOT created_date = 1000",
            ),
        )
        .await
        .unwrap();
    assert_eq!(sorted_names(&got), vec!["mid"]);

    let got = repos
        .partitions()
        .get_partitions(
            table.id,
            &PartitionFilter::new()
                .with_names(["old", "new"])
                .with_date_created_criteria("created_date < '1970-01-01 00:40:00'"),
        )
        .await
        .unwrap();
    assert_eq!(sorted_names(&got), vec!["old"]);

    for criteria in [
        "created_date >",
        "created_date > 1; DROP TABLE partition_table",
        "name = 'x'",
    ] {
        let err = repos
            .partitions()
            .get_partitions(
                table.id,
                &PartitionFilter::new().with_date_created_criteria(criteria),
            )
            .await
            .unwrap_err();
        assert_matches!(err, Error::InvalidFilterCombination { .. });
    }

    // the store is intact after rejected criteria
    let got = repos
        .partitions()
        .get_partitions(table.id, &PartitionFilter::new())
        .await
        .unwrap();
    assert_eq!(got.len(), 3);
}

async fn test_sort_and_page(catalog: Arc<dyn Catalog>) {
    let mut repos = catalog.repositories().await;
    let table = create_table(&catalog, "t").await;
    for (name, secs) in [("p1", 100), ("p2", 500), ("p3", 300), ("p4", 400), ("p5", 200)] {
        create_partition_at(&catalog, &table, name, secs).await;
    }

    let newest_first = PartitionFilter::new()
        .with_sort(Sort::new(SortField::CreatedDate, SortOrder::Descending));
    let got = repos
        .partitions()
        .get_partitions(table.id, &newest_first)
        .await
        .unwrap();
    assert_eq!(names(&got), vec!["p2", "p4", "p3", "p5", "p1"]);

    // second and third newest
    let got = repos
        .partitions()
        .get_partitions(table.id, &newest_first.with_pageable(Pageable::new(1, 2)))
        .await
        .unwrap();
    assert_eq!(names(&got), vec!["p4", "p3"]);

    let got = repos
        .partitions()
        .get_partitions(
            table.id,
            &PartitionFilter::new()
                .with_sort(Sort::parse("name", "desc").unwrap())
                .with_pageable(Pageable::new(0, 2)),
        )
        .await
        .unwrap();
    assert_eq!(names(&got), vec!["p5", "p4"]);

    // paging past the end
    let got = repos
        .partitions()
        .get_partitions(
            table.id,
            &PartitionFilter::new()
                .with_sort(Sort::new(SortField::Name, SortOrder::Ascending))
                .with_pageable(Pageable::new(10, 2)),
        )
        .await
        .unwrap();
    assert!(got.is_empty());

    // equal creation dates fall back to id order
    let tied = create_table(&catalog, "tied").await;
    for name in ["b", "a", "c"] {
        create_partition_at(&catalog, &tied, name, 42).await;
    }
    let got = repos
        .partitions()
        .get_partitions(
            tied.id,
            &PartitionFilter::new()
                .with_sort(Sort::new(SortField::CreatedDate, SortOrder::Ascending)),
        )
        .await
        .unwrap();
    assert_eq!(names(&got), vec!["b", "a", "c"]);
}

async fn test_text_sort_is_bytewise(catalog: Arc<dyn Catalog>) {
    let mut repos = catalog.repositories().await;
    let table = create_table(&catalog, "t").await;
    create_partitions(&catalog, &table, &["b", "C", "a", "B"]).await;

    // upper case sorts before lower case on every backend, whatever the database locale
    let got = repos
        .partitions()
        .get_partitions(
            table.id,
            &PartitionFilter::new()
                .with_sort(Sort::new(SortField::Name, SortOrder::Ascending))
                .with_pageable(Pageable::new(1, 2)),
        )
        .await
        .unwrap();
    assert_eq!(names(&got), vec!["C", "a"]);
}

/// More values than either SQL store allows as separate bind variables.
const LARGE_LIST_LEN: usize = 70_000;

async fn test_large_lists(catalog: Arc<dyn Catalog>) {
    let mut repos = catalog.repositories().await;
    let table = create_table(&catalog, "t").await;
    create_partitions(&catalog, &table, &["p0", "p1"]).await;

    let names: Vec<_> = (1..LARGE_LIST_LEN).map(|i| format!("p{i}")).collect();
    let got = repos
        .partitions()
        .get_partitions(table.id, &PartitionFilter::new().with_names(names.clone()))
        .await
        .unwrap();
    assert_eq!(sorted_names(&got), vec!["p1"]);

    let prefixes: Vec<_> = (1..LARGE_LIST_LEN)
        .map(|i| format!("s3://bucket/t/p{i}"))
        .collect();
    let got = repos
        .partitions()
        .get_by_uris(&UriLookup::new(prefixes, true))
        .await
        .unwrap();
    assert_eq!(sorted_uris(&got), vec!["s3://bucket/t/p1"]);

    let deleted = repos
        .partitions()
        .delete_by_names(&table.reference, &names)
        .await
        .unwrap();
    assert_eq!(deleted, 1);
    assert_eq!(repos.partitions().count(&table.reference).await.unwrap(), 1);
}

async fn test_count(catalog: Arc<dyn Catalog>) {
    let mut repos = catalog.repositories().await;
    let table = create_table(&catalog, "t").await;
    let other = create_table(&catalog, "other").await;

    assert_eq!(repos.partitions().count(&table.reference).await.unwrap(), 0);

    create_partitions(&catalog, &table, &["a", "b", "c"]).await;
    create_partitions(&catalog, &other, &["a"]).await;

    let count = repos.partitions().count(&table.reference).await.unwrap();
    let listed = repos
        .partitions()
        .get_partitions(table.id, &PartitionFilter::new())
        .await
        .unwrap();
    assert_eq!(count, 3);
    assert_eq!(count, listed.len() as u64);

    let unknown = TableReference::new("nope", "nope", "nope");
    assert_eq!(repos.partitions().count(&unknown).await.unwrap(), 0);
}

async fn test_delete_by_names(catalog: Arc<dyn Catalog>) {
    let mut repos = catalog.repositories().await;
    let table = create_table(&catalog, "t").await;
    let other = create_table(&catalog, "other").await;
    create_partitions(&catalog, &table, &["a", "b", "c", "d"]).await;
    create_partitions(&catalog, &other, &["a", "b"]).await;

    // empty list is a no-op
    assert_eq!(
        repos
            .partitions()
            .delete_by_names(&table.reference, &[])
            .await
            .unwrap(),
        0
    );
    assert_eq!(repos.partitions().count(&table.reference).await.unwrap(), 4);

    // names that do not exist are skipped
    let deleted = repos
        .partitions()
        .delete_by_names(
            &table.reference,
            &["a".to_string(), "c".to_string(), "missing".to_string()],
        )
        .await
        .unwrap();
    assert_eq!(deleted, 2);
    assert_eq!(repos.partitions().count(&table.reference).await.unwrap(), 2);
    let remaining = repos
        .partitions()
        .get_partitions(table.id, &PartitionFilter::new())
        .await
        .unwrap();
    assert_eq!(sorted_names(&remaining), vec!["b", "d"]);

    // other tables are untouched
    assert_eq!(repos.partitions().count(&other.reference).await.unwrap(), 2);

    let unknown = TableReference::new("nope", "nope", "nope");
    assert_eq!(
        repos
            .partitions()
            .delete_by_names(&unknown, &["b".to_string()])
            .await
            .unwrap(),
        0
    );
    assert_eq!(repos.partitions().count(&table.reference).await.unwrap(), 2);
}

async fn test_get_by_uris(catalog: Arc<dyn Catalog>) {
    let mut repos = catalog.repositories().await;
    let table = create_table(&catalog, "t").await;
    for (name, uri) in [
        ("x", "s3://x/"),
        ("y", "s3://x/y"),
        ("z", "s3://x/y/z"),
        ("w", "s3://w/"),
    ] {
        repos
            .partitions()
            .create(PartitionParams::new(table.id, name, uri))
            .await
            .unwrap();
    }

    let got = repos
        .partitions()
        .get_by_uris(&UriLookup::new(["s3://x/y", "s3://missing"], false))
        .await
        .unwrap();
    assert_eq!(sorted_uris(&got), vec!["s3://x/y"]);

    let got = repos
        .partitions()
        .get_by_uris(&UriLookup::new(["s3://x/y"], true))
        .await
        .unwrap();
    assert_eq!(sorted_uris(&got), vec!["s3://x/y", "s3://x/y/z"]);

    let got = repos
        .partitions()
        .get_by_uris(&UriLookup::new(["s3://w", "s3://x/y/"], true))
        .await
        .unwrap();
    assert_eq!(sorted_uris(&got), vec!["s3://w/", "s3://x/y/z"]);

    let got = repos
        .partitions()
        .get_by_uris(&UriLookup::new(Vec::<String>::new(), true))
        .await
        .unwrap();
    assert!(got.is_empty());

    let got = repos
        .partitions()
        .get_by_uris(&UriLookup::new(Vec::<String>::new(), false))
        .await
        .unwrap();
    assert!(got.is_empty());
}

async fn test_concurrent_reads(catalog: Arc<dyn Catalog>) {
    let table = create_table(&catalog, "t").await;
    create_partitions(&catalog, &table, &["a", "b", "c"]).await;

    let mut tasks: FuturesOrdered<_> = (0..4)
        .map(|_| {
            let catalog = Arc::clone(&catalog);
            let reference = table.reference.clone();
            tokio::spawn(async move {
                let mut repos = catalog.repositories().await;
                repos.partitions().count(&reference).await.unwrap()
            })
        })
        .collect();

    while let Some(count) = tasks.next().await {
        assert_eq!(count.expect("task panicked"), 3);
    }
}

async fn create_table(catalog: &Arc<dyn Catalog>, name: &str) -> Table {
    catalog
        .repositories()
        .await
        .tables()
        .create_or_get(&TableReference::new("source", "db", name))
        .await
        .unwrap()
}

async fn create_partitions(catalog: &Arc<dyn Catalog>, table: &Table, names: &[&str]) {
    let mut repos = catalog.repositories().await;
    for name in names {
        repos
            .partitions()
            .create(PartitionParams::new(
                table.id,
                *name,
                format!("s3://bucket/{}/{name}", table.reference.table_name),
            ))
            .await
            .unwrap();
    }
}

async fn create_partition_at(catalog: &Arc<dyn Catalog>, table: &Table, name: &str, secs: i64) {
    catalog
        .repositories()
        .await
        .partitions()
        .create(
            PartitionParams::new(
                table.id,
                name,
                format!("s3://bucket/{}/{name}", table.reference.table_name),
            )
            .with_created_date(Timestamp::from_secs(secs).unwrap()),
        )
        .await
        .unwrap();
}

fn names(partitions: &[Partition]) -> Vec<&str> {
    partitions.iter().map(|p| p.name.as_str()).collect()
}

fn sorted_names(partitions: &[Partition]) -> Vec<&str> {
    let mut names = names(partitions);
    names.sort_unstable();
    names
}

fn sorted_uris(partitions: &[Partition]) -> Vec<&str> {
    let mut uris: Vec<_> = partitions.iter().map(|p| p.uri.as_str()).collect();
    uris.sort_unstable();
    uris
}
