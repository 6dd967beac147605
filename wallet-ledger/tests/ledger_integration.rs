//! End-to-end tests through the public `Ledger` API

use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use uuid::Uuid;
use wallet_ledger::{
    Config, Currency, Error, Ledger, PostRequest, TenantId, TransactionKind, TransactionResult,
    WalletStatus,
};

fn test_config(temp_dir: &tempfile::TempDir) -> Config {
    let mut config = Config::default();
    config.data_dir = temp_dir.path().to_path_buf();
    config.rocksdb.sync_writes = false;
    config.partitions.maintenance_enabled = false;
    config
}

fn tenant() -> TenantId {
    TenantId::from_uuid(Uuid::now_v7())
}

fn credit(tenant_id: TenantId, amount: i64, key: &str) -> PostRequest {
    PostRequest::new(tenant_id, "credits", Decimal::from(amount), key, TransactionKind::Credit)
}

fn debit(tenant_id: TenantId, amount: i64, key: &str) -> PostRequest {
    PostRequest::new(tenant_id, "credits", Decimal::from(-amount), key, TransactionKind::Debit)
}

/// Post, retrying with the same key while contention persists
async fn post_until_applied(ledger: &Ledger, request: PostRequest) -> TransactionResult {
    loop {
        match ledger.post(request.clone()).await {
            Ok(result) => return result,
            Err(e) if e.is_retryable() => continue,
            Err(e) => panic!("post failed: {}", e),
        }
    }
}

#[tokio::test]
async fn test_credit_debit_replay_scenario() {
    let temp_dir = tempfile::tempdir().unwrap();
    let ledger = Ledger::open(test_config(&temp_dir)).await.unwrap();
    let tenant_id = tenant();
    ledger.ensure_wallet(tenant_id).await.unwrap();

    let a = ledger.post(credit(tenant_id, 100, "a")).await.unwrap();
    assert_eq!(a.balance_after, Decimal::from(100));

    let b = ledger.post(debit(tenant_id, 30, "b")).await.unwrap();
    assert_eq!(b.balance_before, Decimal::from(100));
    assert_eq!(b.balance_after, Decimal::from(70));

    let replay = ledger.post(credit(tenant_id, 100, "a")).await.unwrap();
    assert_eq!(replay, a);

    let view = ledger.get_balance(tenant_id, "credits").await.unwrap();
    assert_eq!(view.balance, Decimal::from(70));
    assert_eq!(view.version, 3);
    assert_eq!(ledger.metrics().replays_total.get(), 1);
    assert_eq!(ledger.metrics().posts_total.get(), 2);

    ledger.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_posts_apply_exactly_once() {
    const K: usize = 32;

    let temp_dir = tempfile::tempdir().unwrap();
    let ledger = Arc::new(Ledger::open(test_config(&temp_dir)).await.unwrap());
    let tenant_id = tenant();
    ledger.ensure_wallet(tenant_id).await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..K {
        let ledger = ledger.clone();
        tasks.push(tokio::spawn(async move {
            post_until_applied(&ledger, credit(tenant_id, 1, &format!("c-{}", i))).await
        }));
    }

    let mut results = Vec::new();
    for task in tasks {
        results.push(task.await.unwrap());
    }

    let view = ledger.get_balance(tenant_id, "credits").await.unwrap();
    assert_eq!(view.balance, Decimal::from(K as i64));
    assert_eq!(view.version, 1 + K as u64);

    // Every balance_after is distinct: the deltas were serialized
    let mut after: Vec<Decimal> = results.iter().map(|r| r.balance_after).collect();
    after.sort();
    after.dedup();
    assert_eq!(after.len(), K);

    let account_id = results[0].account_id;
    let report = ledger
        .verify_chain(account_id, Utc::now() - Duration::days(1), Utc::now() + Duration::days(1))
        .await
        .unwrap();
    assert!(report.is_clean());
    assert_eq!(report.checked, K);
    assert!(ledger.verify_conservation(account_id).await.unwrap().holds());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_duplicates_apply_once() {
    let temp_dir = tempfile::tempdir().unwrap();
    let ledger = Arc::new(Ledger::open(test_config(&temp_dir)).await.unwrap());
    let tenant_id = tenant();
    ledger.ensure_wallet(tenant_id).await.unwrap();

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let ledger = ledger.clone();
        tasks.push(tokio::spawn(async move {
            post_until_applied(&ledger, credit(tenant_id, 25, "same-key")).await
        }));
    }

    let mut results = Vec::new();
    for task in tasks {
        results.push(task.await.unwrap());
    }

    assert!(results.windows(2).all(|pair| pair[0] == pair[1]));
    let view = ledger.get_balance(tenant_id, "credits").await.unwrap();
    assert_eq!(view.balance, Decimal::from(25));
    assert_eq!(view.version, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_debits_never_overdraw() {
    let temp_dir = tempfile::tempdir().unwrap();
    let ledger = Arc::new(Ledger::open(test_config(&temp_dir)).await.unwrap());
    let tenant_id = tenant();
    ledger.ensure_wallet(tenant_id).await.unwrap();
    ledger.post(credit(tenant_id, 10, "seed")).await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..20 {
        let ledger = ledger.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                match ledger.post(debit(tenant_id, 1, &format!("d-{}", i))).await {
                    Err(e) if e.is_retryable() => continue,
                    other => return other,
                }
            }
        }));
    }

    let mut applied = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => applied += 1,
            Err(Error::InsufficientBalance { .. }) => {}
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    assert_eq!(applied, 10);
    let view = ledger.get_balance(tenant_id, "credits").await.unwrap();
    assert_eq!(view.balance, Decimal::ZERO);
}

#[tokio::test]
async fn test_wallet_lifecycle() {
    let temp_dir = tempfile::tempdir().unwrap();
    let ledger = Ledger::open(test_config(&temp_dir)).await.unwrap();
    let tenant_id = tenant();

    let wallet = ledger
        .create_wallet(tenant_id, Some(Currency::USD), Default::default())
        .await
        .unwrap();
    assert_eq!(wallet.currency, Currency::USD);
    assert_eq!(ledger.get_wallet(tenant_id).await.unwrap().id, wallet.id);

    ledger.post(credit(tenant_id, 5, "before")).await.unwrap();

    ledger.set_wallet_status(tenant_id, WalletStatus::Suspended).await.unwrap();
    let result = ledger.post(credit(tenant_id, 5, "suspended")).await;
    assert!(matches!(result, Err(Error::WalletNotActive { .. })));

    ledger.set_wallet_status(tenant_id, WalletStatus::Active).await.unwrap();
    ledger.post(credit(tenant_id, 5, "suspended")).await.unwrap();

    ledger.set_wallet_status(tenant_id, WalletStatus::Closed).await.unwrap();
    let result = ledger.post(credit(tenant_id, 5, "closed")).await;
    assert!(matches!(result, Err(Error::WalletNotActive { .. })));
    assert!(matches!(
        ledger.set_wallet_status(tenant_id, WalletStatus::Active).await,
        Err(Error::InvalidStatusTransition { .. })
    ));

    // Balance survives closure
    let view = ledger.get_balance(tenant_id, "credits").await.unwrap();
    assert_eq!(view.balance, Decimal::from(10));
}

#[tokio::test]
async fn test_lazy_account_types() {
    let temp_dir = tempfile::tempdir().unwrap();
    let ledger = Ledger::open(test_config(&temp_dir)).await.unwrap();
    let tenant_id = tenant();
    ledger.ensure_wallet(tenant_id).await.unwrap();

    let bonus = PostRequest::new(tenant_id, "bonus", Decimal::new(250, 2), "bonus-1", TransactionKind::Credit)
        .with_reference("campaign", "diwali")
        .with_description("festival bonus")
        .with_metadata("source", "promo-engine");
    let result = ledger.post(bonus).await.unwrap();
    assert_eq!(result.balance_after, Decimal::new(250, 2));

    let record = ledger.get_transaction(tenant_id, result.transaction_id).await.unwrap();
    assert_eq!(record.reference.reference_type.as_deref(), Some("campaign"));
    assert_eq!(record.metadata.get("source").map(String::as_str), Some("promo-engine"));

    // Separate buckets
    assert_eq!(
        ledger.get_balance(tenant_id, "credits").await.unwrap().balance,
        Decimal::ZERO
    );
    assert_eq!(
        ledger.get_balance(tenant_id, "bonus").await.unwrap().balance,
        Decimal::new(250, 2)
    );
}

#[tokio::test]
async fn test_reverse_through_ledger() {
    let temp_dir = tempfile::tempdir().unwrap();
    let ledger = Ledger::open(test_config(&temp_dir)).await.unwrap();
    let tenant_id = tenant();
    ledger.ensure_wallet(tenant_id).await.unwrap();

    ledger.post(credit(tenant_id, 100, "top-up")).await.unwrap();
    let usage = ledger.post(debit(tenant_id, 40, "usage")).await.unwrap();

    let reversal = ledger
        .reverse(tenant_id, usage.transaction_id, Some("failed job".to_string()))
        .await
        .unwrap();
    assert_eq!(reversal.balance_after, Decimal::from(100));

    let again = ledger.reverse(tenant_id, usage.transaction_id, None).await.unwrap();
    assert_eq!(again, reversal);
    assert_eq!(
        ledger.get_balance(tenant_id, "credits").await.unwrap().balance,
        Decimal::from(100)
    );
}

#[tokio::test]
async fn test_list_transactions_pages() {
    let temp_dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&temp_dir);
    config.query.page_size = 3;
    let ledger = Ledger::open(config).await.unwrap();
    let tenant_id = tenant();
    ledger.ensure_wallet(tenant_id).await.unwrap();

    let mut posted = Vec::new();
    for i in 0..8 {
        posted.push(ledger.post(credit(tenant_id, 1, &format!("p-{}", i))).await.unwrap());
    }

    let from = Utc::now() - Duration::hours(1);
    let to = Utc::now() + Duration::hours(1);
    let mut seen = Vec::new();
    let mut token: Option<String> = None;
    let mut pages = 0;
    loop {
        let page = ledger
            .list_transactions(tenant_id, "credits", from, to, token.as_deref())
            .await
            .unwrap();
        pages += 1;
        assert!(page.transactions.len() <= 3);
        seen.extend(page.transactions.into_iter().map(|t| t.id));
        match page.next_page_token {
            Some(next) => token = Some(next),
            None => break,
        }
    }

    assert_eq!(pages, 3);
    let expected: Vec<_> = posted.iter().map(|r| r.transaction_id).collect();
    assert_eq!(seen, expected);

    // `to` is exclusive
    let before_all = ledger
        .list_transactions(tenant_id, "credits", from, posted[0].created_at, None)
        .await
        .unwrap();
    assert!(before_all.transactions.is_empty());
    assert!(before_all.next_page_token.is_none());
}

#[tokio::test]
async fn test_state_survives_reopen() {
    let temp_dir = tempfile::tempdir().unwrap();
    let tenant_id = tenant();

    let original = {
        let ledger = Ledger::open(test_config(&temp_dir)).await.unwrap();
        ledger.ensure_wallet(tenant_id).await.unwrap();
        let result = ledger.post(credit(tenant_id, 42, "durable")).await.unwrap();
        ledger.shutdown().await.unwrap();
        result
    };

    let ledger = Ledger::open(test_config(&temp_dir)).await.unwrap();
    let replay = ledger.post(credit(tenant_id, 42, "durable")).await.unwrap();
    assert_eq!(replay, original);

    let view = ledger.get_balance(tenant_id, "credits").await.unwrap();
    assert_eq!(view.balance, Decimal::from(42));
    assert_eq!(view.version, 2);
    assert!(ledger.ensure_partitions().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_tenant_isolation() {
    let temp_dir = tempfile::tempdir().unwrap();
    let ledger = Ledger::open(test_config(&temp_dir)).await.unwrap();
    let alice = tenant();
    let bob = tenant();
    ledger.ensure_wallet(alice).await.unwrap();
    ledger.ensure_wallet(bob).await.unwrap();

    let paid = ledger.post(credit(alice, 10, "alice-1")).await.unwrap();

    assert!(matches!(
        ledger.post(credit(bob, 10, "alice-1")).await,
        Err(Error::IdempotencyConflict(_))
    ));
    assert!(matches!(
        ledger.reverse(bob, paid.transaction_id, None).await,
        Err(Error::TenantMismatch(_))
    ));
    assert_eq!(ledger.get_balance(bob, "credits").await.unwrap().balance, Decimal::ZERO);
}
