//! Opening, migrating and using stores over their lifetime.

use oxide_store::prelude::*;
use oxide_store::{ErrorKind, StoreError};
use oxide_store_derive::Entity;

mod v1 {
    use super::Entity;

    #[derive(Debug, Clone, Default, PartialEq, Entity)]
    #[entity(table = "account")]
    pub struct Account {
        #[field(primary_key)]
        pub id: i64,
        pub owner: String,
        pub balance: i64,
    }
}

mod v2 {
    use super::Entity;

    #[derive(Debug, Clone, Default, PartialEq, Entity)]
    #[entity(table = "account")]
    pub struct Account {
        #[field(primary_key)]
        pub id: i64,
        pub holder: String,
        pub balance: i64,
        pub note: Option<String>,
    }
}

use v1::Account;

fn database_url(dir: &tempfile::TempDir) -> String {
    format!("sqlite:{}", dir.path().join("store.db").display())
}

async fn open_v1(url: &str) -> SqlStore {
    SqlStore::builder(SqliteBackend::connect(url).await.unwrap())
        .register::<Account>()
        .version("v1")
        .open()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_open_creates_tables_and_reopen_keeps_rows() {
    let dir = tempfile::tempdir().unwrap();
    let url = database_url(&dir);
    {
        let store = open_v1(&url).await;
        assert!(store.check_schema().await.unwrap().is_empty());
        let mut accounts = store.change_set::<Account>().await.unwrap();
        accounts.create(|a| a.owner = "ada".into());
        accounts.create(|a| a.owner = "bob".into());
        store.save(&[&accounts]).await.unwrap();
    }

    let store = open_v1(&url).await;
    assert_eq!(store.find(&Predicate::<Account>::all()).await.unwrap().len(), 2);
    // Keys continue after the largest stored key.
    let mut accounts = store.change_set::<Account>().await.unwrap();
    assert_eq!(accounts.create(|a| a.owner = "cy".into()), 3);
}

#[tokio::test]
async fn test_changed_entity_needs_migration() {
    let dir = tempfile::tempdir().unwrap();
    let url = database_url(&dir);
    {
        let store = open_v1(&url).await;
        store.migrate(&MigrationPolicy::new()).await.unwrap();
        store
            .insert(&Account {
                id: 1,
                owner: "ada".into(),
                balance: 10,
            })
            .await
            .unwrap();
    }

    let err = SqlStore::builder(SqliteBackend::connect(&url).await.unwrap())
        .register::<v2::Account>()
        .open()
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);

    let store = SqlStore::builder(SqliteBackend::connect(&url).await.unwrap())
        .register::<v2::Account>()
        .version("v2")
        .open_unchecked()
        .unwrap();
    assert_eq!(store.check_schema().await.unwrap().len(), 1);
    let policy = MigrationPolicy::new().rename_column("account", "owner", "holder");
    let report = store.migrate(&policy).await.unwrap();
    assert_eq!(report.tables, vec!["account".to_string()]);
    assert!(store.check_schema().await.unwrap().is_empty());
    assert_eq!(store.schema_versions().await.unwrap(), vec!["v1", "v2"]);

    let account = store.get::<v2::Account>(&1).await.unwrap();
    assert_eq!(account.holder, "ada");
    assert_eq!(account.balance, 10);
    assert_eq!(account.note, None);
}

#[tokio::test]
async fn test_get_missing_row() {
    let store = open_v1("sqlite::memory:").await;
    let err = store.get::<Account>(&42).await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound { .. }));
    assert_eq!(err.to_string(), "No account with key 42");
    assert!(store.get_optional::<Account>(&42).await.unwrap().is_none());
}

#[tokio::test]
async fn test_update_missing_and_delete_missing() {
    let store = open_v1("sqlite::memory:").await;
    let ghost = Account {
        id: 7,
        ..Account::default()
    };
    let err = store.update(&ghost).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    store.delete(&ghost).await.unwrap();
}

async fn seed<S: Storage>(store: &S) {
    for id in 1..=7 {
        store
            .insert(&Account {
                id,
                owner: format!("owner {id}"),
                balance: id * 10,
            })
            .await
            .unwrap();
    }
}

async fn paging<S: Storage>(store: &S) {
    seed(store).await;
    let query = Query::new(Account::balance().gt(10))
        .order(Order::desc(Account::balance()))
        .page_size(4);

    let mut pages = Vec::new();
    store
        .fetch(&query, |page| {
            pages.push(page.iter().map(|a| a.id).collect::<Vec<_>>());
            Ok(ControlFlow::Continue(()))
        })
        .await
        .unwrap();
    assert_eq!(pages, vec![vec![7, 6, 5, 4], vec![3, 2]]);

    let mut seen = 0;
    store
        .fetch(&query.clone().page_size(1), |_| {
            seen += 1;
            Ok(if seen == 3 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            })
        })
        .await
        .unwrap();
    assert_eq!(seen, 3);

    let err = store
        .fetch(&query, |_| Err(StoreError::Configuration("page rejected".into())))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Configuration error: page rejected");
}

#[tokio::test]
async fn test_paging_sql() {
    paging(&open_v1("sqlite::memory:").await).await;
}

#[tokio::test]
async fn test_paging_memory() {
    let store = MemoryStore::builder().register::<Account>().open().unwrap();
    paging(&store).await;
}

async fn transactions<S: Storage>(store: &S) {
    seed(store).await;

    let mut tx = store.begin().await.unwrap();
    store.delete_where(&Account::id().gt(3)).await.unwrap();
    tx.rollback().await.unwrap();
    assert!(!tx.is_open());
    // Commit after rollback does nothing.
    tx.commit().await.unwrap();
    assert_eq!(store.find(&Predicate::<Account>::all()).await.unwrap().len(), 7);

    {
        let _tx = store.begin().await.unwrap();
        store.delete_where(&Predicate::<Account>::all()).await.unwrap();
    }
    assert_eq!(store.find(&Predicate::<Account>::all()).await.unwrap().len(), 7);

    let mut tx = store.begin().await.unwrap();
    let mut accounts = store.change_set::<Account>().await.unwrap();
    let key = accounts.create(|a| a.owner = "new".into());
    store.save(&[&accounts]).await.unwrap();
    store.delete(&store.get::<Account>(&1).await.unwrap()).await.unwrap();
    tx.commit().await.unwrap();
    tx.rollback().await.unwrap();

    assert_eq!(key, 8);
    let ids: Vec<i64> = store
        .find(&Predicate::<Account>::all())
        .await
        .unwrap()
        .iter()
        .map(|a| a.id)
        .collect();
    assert_eq!(ids, vec![2, 3, 4, 5, 6, 7, 8]);
}

#[tokio::test]
async fn test_transactions_sql() {
    transactions(&open_v1("sqlite::memory:").await).await;
}

#[tokio::test]
async fn test_transactions_memory() {
    let store = MemoryStore::builder().register::<Account>().open().unwrap();
    transactions(&store).await;
}

async fn account_ids<S: Storage>(store: &S) -> Vec<i64> {
    store
        .find(&Predicate::<Account>::all())
        .await
        .unwrap()
        .iter()
        .map(|a| a.id)
        .collect()
}

async fn failed_save_aborts_transaction<S: Storage>(store: &S) {
    store
        .insert(&Account {
            id: 5,
            owner: "eve".into(),
            balance: 50,
        })
        .await
        .unwrap();

    let mut tx = store.begin().await.unwrap();
    let mut accounts = store.change_set::<Account>().await.unwrap();
    assert_eq!(accounts.create(|a| a.owner = "new".into()), 6);
    accounts.updated(Account {
        id: 99,
        ..Account::default()
    });
    let err = store.save(&[&accounts]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    // Nothing runs until the handle is closed, and commit reports the abort.
    let err = store.find(&Predicate::<Account>::all()).await.unwrap_err();
    assert!(matches!(err, StoreError::TransactionAborted));
    let err = tx.commit().await.unwrap_err();
    assert!(matches!(err, StoreError::TransactionAborted));
    assert_eq!(err.kind(), ErrorKind::Backend);
    tx.rollback().await.unwrap();
    assert_eq!(account_ids(store).await, vec![5]);

    let mut tx = store.begin().await.unwrap();
    store
        .insert(&Account {
            id: 6,
            owner: "new".into(),
            balance: 0,
        })
        .await
        .unwrap();
    tx.commit().await.unwrap();
    assert_eq!(account_ids(store).await, vec![5, 6]);
}

#[tokio::test]
async fn test_failed_save_aborts_transaction_sql() {
    failed_save_aborts_transaction(&open_v1("sqlite::memory:").await).await;
}

#[tokio::test]
async fn test_failed_save_aborts_transaction_memory() {
    let store = MemoryStore::builder().register::<Account>().open().unwrap();
    failed_save_aborts_transaction(&store).await;
}

async fn concurrent_update_where<S: Storage>(store: &S) {
    seed(store).await;
    let first_two = Account::id().lte(2);
    let bumps = (0..20).map(|_| store.update_where(&first_two, |a: &mut Account| a.balance += 1));
    for updated in futures::future::join_all(bumps).await {
        assert_eq!(updated.unwrap(), 2);
    }
    assert_eq!(store.get::<Account>(&1).await.unwrap().balance, 30);
    assert_eq!(store.get::<Account>(&2).await.unwrap().balance, 40);
    assert_eq!(store.get::<Account>(&3).await.unwrap().balance, 30);
}

#[tokio::test]
async fn test_concurrent_update_where_sql() {
    concurrent_update_where(&open_v1("sqlite::memory:").await).await;
}

#[tokio::test]
async fn test_concurrent_update_where_memory() {
    let store = MemoryStore::builder().register::<Account>().open().unwrap();
    concurrent_update_where(&store).await;
}

#[tokio::test]
async fn test_unregistered_entity_is_rejected() {
    let store = MemoryStore::builder().open().unwrap();
    let err = store.find(&Predicate::<Account>::all()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[test]
fn test_memory_store_without_runtime_setup() {
    let store = MemoryStore::builder().register::<Account>().open().unwrap();
    tokio_test::block_on(async {
        store
            .insert(&Account {
                id: 1,
                owner: "ada".into(),
                balance: 5,
            })
            .await
            .unwrap();
        store
            .update_where(&Account::owner().eq("ada"), |a| a.balance += 1)
            .await
            .unwrap();
        assert_eq!(store.get::<Account>(&1).await.unwrap().balance, 6);
    });
}
