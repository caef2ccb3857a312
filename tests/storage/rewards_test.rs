use chrono::Utc;
use promptgate::content::RewardItemConfig;
use promptgate::storage::{ClaimOutcome, SqliteStorage, Storage};
use promptgate::types::RewardKind;

fn item(item_id: &str, kind: RewardKind, max_claims: Option<i64>) -> RewardItemConfig {
    RewardItemConfig {
        item_id: item_id.to_owned(),
        kind,
        code: format!("CODE-{item_id}"),
        max_claims,
    }
}

#[tokio::test]
async fn claim_reward_prefers_jd_ecard_over_alipay() {
    let storage = SqliteStorage::connect_in_memory().await.expect("connect_in_memory failed");
    storage
        .reload_reward_items(
            "pool1",
            true,
            &[
                item("alipay-a", RewardKind::AlipayCode, Some(10)),
                item("jd-1", RewardKind::JdEcard, Some(1)),
            ],
        )
        .await
        .expect("reload_reward_items failed");

    let outcome = storage
        .claim_reward("pool1", "u1", 1, 1, Utc::now())
        .await
        .expect("claim_reward failed");

    match outcome {
        ClaimOutcome::Claimed { item, .. } => assert_eq!(item.item_id, "jd-1"),
        other => panic!("expected a claim, got {other:?}"),
    }
}

#[tokio::test]
async fn claim_reward_is_idempotent_per_user_level() {
    let storage = SqliteStorage::connect_in_memory().await.expect("connect_in_memory failed");
    storage
        .reload_reward_items("pool1", true, &[item("alipay-a", RewardKind::AlipayCode, Some(10))])
        .await
        .expect("reload_reward_items failed");

    let first = storage.claim_reward("pool1", "u1", 1, 1, Utc::now()).await.expect("claim_reward failed");
    let first_claim = match first {
        ClaimOutcome::Claimed { claim, .. } => claim,
        other => panic!("expected a claim, got {other:?}"),
    };

    let second = storage.claim_reward("pool1", "u1", 1, 1, Utc::now()).await.expect("claim_reward failed");
    match second {
        ClaimOutcome::AlreadyClaimed(claim) => assert_eq!(claim.claim_id, first_claim.claim_id),
        other => panic!("expected AlreadyClaimed, got {other:?}"),
    }
}

#[tokio::test]
async fn claim_reward_reports_pool_exhausted_when_nothing_has_capacity() {
    let storage = SqliteStorage::connect_in_memory().await.expect("connect_in_memory failed");
    storage
        .reload_reward_items("pool1", true, &[item("jd-1", RewardKind::JdEcard, Some(1))])
        .await
        .expect("reload_reward_items failed");

    storage.claim_reward("pool1", "u1", 1, 1, Utc::now()).await.expect("claim_reward failed");
    let outcome = storage.claim_reward("pool1", "u2", 1, 1, Utc::now()).await.expect("claim_reward failed");

    assert!(matches!(outcome, ClaimOutcome::PoolExhausted));
}

#[tokio::test]
async fn reload_reward_items_disables_dropped_items_without_deleting_them() {
    let storage = SqliteStorage::connect_in_memory().await.expect("connect_in_memory failed");
    storage
        .reload_reward_items("pool1", true, &[item("a", RewardKind::AlipayCode, Some(5))])
        .await
        .expect("reload_reward_items failed");
    storage
        .reload_reward_items("pool1", true, &[item("b", RewardKind::AlipayCode, Some(5))])
        .await
        .expect("reload_reward_items failed");

    let items = storage.list_reward_items("pool1").await.expect("list_reward_items failed");
    let a = items.iter().find(|i| i.item_id == "a").expect("find failed");
    let b = items.iter().find(|i| i.item_id == "b").expect("find failed");
    assert!(!a.enabled, "dropped items are disabled, not deleted");
    assert!(b.enabled);
}

#[tokio::test]
async fn reload_reward_items_preserves_claimed_count() {
    let storage = SqliteStorage::connect_in_memory().await.expect("connect_in_memory failed");
    storage
        .reload_reward_items("pool1", true, &[item("a", RewardKind::AlipayCode, Some(5))])
        .await
        .expect("reload_reward_items failed");
    storage.claim_reward("pool1", "u1", 1, 1, Utc::now()).await.expect("claim_reward failed");

    storage
        .reload_reward_items("pool1", true, &[item("a", RewardKind::AlipayCode, Some(5))])
        .await
        .expect("reload_reward_items failed");

    let items = storage.list_reward_items("pool1").await.expect("list_reward_items failed");
    let a = items.iter().find(|i| i.item_id == "a").expect("find failed");
    assert_eq!(a.claimed_count, 1);
}

#[tokio::test]
async fn reload_reward_items_disables_all_items_when_pool_is_disabled() {
    let storage = SqliteStorage::connect_in_memory().await.expect("connect_in_memory failed");
    storage
        .reload_reward_items("pool1", false, &[item("a", RewardKind::AlipayCode, Some(5))])
        .await
        .expect("reload_reward_items failed");

    let items = storage.list_reward_items("pool1").await.expect("list_reward_items failed");
    let a = items.iter().find(|i| i.item_id == "a").expect("find failed");
    assert!(!a.enabled, "items in a disabled pool must not be claimable");

    let outcome = storage.claim_reward("pool1", "u1", 1, 1, Utc::now()).await.expect("claim_reward failed");
    assert!(matches!(outcome, ClaimOutcome::PoolExhausted));
}
