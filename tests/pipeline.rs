mod common;

use alloy_primitives::{Address, B256, U256, b256};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use common::{CONTRACT, ScriptedNode, config, erc721_log, erc1155_single_log, ether};
use nft_event_indexer::context::AppContext;
use nft_event_indexer::models::collection::CollectionSource;
use nft_event_indexer::models::event::{EventKind, EventSource};

const TX: B256 = b256!("0000000000000000000000000000000000000000000000000000000000000abc");

fn buyer() -> Address {
    Address::repeat_byte(0x02)
}

fn seller() -> Address {
    Address::repeat_byte(0x01)
}

#[tokio::test(start_paused = true)]
async fn test_two_mint_logs_are_classified_once() {
    let ctx = AppContext::new(config(json!({})), None, None);
    let pipeline = Arc::new(ctx.pipeline());
    let node = Arc::new(ScriptedNode::default());
    let mut events = ctx.output.subscribe();

    let first = {
        let pipeline = pipeline.clone();
        let node = node.clone();
        tokio::spawn(async move {
            pipeline
                .handle_log(erc721_log(TX, 0, Address::ZERO, buyer(), 1), node.as_ref())
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(10)).await;
    let second = pipeline
        .handle_log(erc721_log(TX, 1, Address::ZERO, buyer(), 2), node.as_ref())
        .await;
    assert!(second.is_none());

    let event = first.await.unwrap().unwrap();
    assert_eq!(event.kind, EventKind::Mint);
    assert_eq!(event.item_count, 2);
    assert_eq!(event.tx_hash, Some(TX));
    assert_eq!(event.source, EventSource::Node(1));
    assert!(!event.printable);
    assert_eq!(event.collection.name, "Unknown Transfer");

    // mints never fetch the transaction value
    assert_eq!(node.value_calls(), 0);

    // suppressed, yet counted
    let received = events.recv().await.unwrap();
    ctx.stats.record(&received);
    let stats = ctx.stats.snapshot();
    assert_eq!(stats.mints, 1);
    assert_eq!(stats.not_shown, 1);
    assert_eq!(ctx.cache.recent_events().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_mint_shown_with_collection_override() {
    let ctx = AppContext::new(
        config(json!({
            "collections": [{
                "address": format!("{:#x}", CONTRACT),
                "name": "Own Collection",
                "show_mints": true
            }]
        })),
        None,
        None,
    );
    let node = ScriptedNode::default();

    let event = ctx
        .pipeline()
        .handle_log(erc721_log(TX, 0, Address::ZERO, buyer(), 7), &node)
        .await
        .unwrap();

    assert_eq!(event.kind, EventKind::Mint);
    assert!(event.printable);
    assert_eq!(event.collection.name, "Own Collection");
    assert_eq!(event.collection.source, CollectionSource::Configuration);
}

#[tokio::test(start_paused = true)]
async fn test_redelivered_log_is_merged_once() {
    let ctx = AppContext::new(config(json!({})), None, None);
    let pipeline = ctx.pipeline();
    let node = ScriptedNode::default().with_value(TX, ether(1000));

    let record = erc721_log(TX, 3, seller(), buyer(), 9);
    let (first, again) = tokio::join!(
        pipeline.handle_log(record.clone(), &node),
        pipeline.handle_log(record, &node),
    );

    assert!(again.is_none());
    let event = first.unwrap();
    assert_eq!(event.item_count, 1);
    assert_eq!(ctx.transactions.get(&TX).unwrap().log_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_sale_and_threshold() {
    let ctx = AppContext::new(config(json!({ "show": { "min_value": 0.5 } })), None, None);
    let pipeline = ctx.pipeline();

    let expensive = B256::with_last_byte(1);
    let cheap = B256::with_last_byte(2);
    let node = ScriptedNode::default()
        .with_value(expensive, ether(1500))
        .with_value(cheap, ether(100));

    let sale = pipeline
        .handle_log(erc721_log(expensive, 0, seller(), buyer(), 1), &node)
        .await
        .unwrap();
    assert_eq!(sale.kind, EventKind::Sale);
    assert_eq!(sale.value, ether(1500));
    assert!(sale.printable);

    let below = pipeline
        .handle_log(erc721_log(cheap, 0, seller(), buyer(), 2), &node)
        .await
        .unwrap();
    assert_eq!(below.kind, EventKind::Sale);
    assert!(!below.printable);
}

#[tokio::test(start_paused = true)]
async fn test_zero_value_is_transfer_with_its_own_flag() {
    let hidden = AppContext::new(config(json!({})), None, None);
    let shown = AppContext::new(config(json!({ "show": { "transfers": true } })), None, None);
    let node = ScriptedNode::default().with_value(TX, U256::ZERO);

    let event = hidden
        .pipeline()
        .handle_log(erc721_log(TX, 0, seller(), buyer(), 1), &node)
        .await
        .unwrap();
    assert_eq!(event.kind, EventKind::Transfer);
    assert!(!event.printable);

    let event = shown
        .pipeline()
        .handle_log(erc721_log(TX, 0, seller(), buyer(), 1), &node)
        .await
        .unwrap();
    assert_eq!(event.kind, EventKind::Transfer);
    assert!(event.printable);
}

#[tokio::test(start_paused = true)]
async fn test_failed_value_fetch_abandons_transaction() {
    let ctx = AppContext::new(config(json!({})), None, None);
    let node = ScriptedNode::default();

    let event = ctx
        .pipeline()
        .handle_log(erc721_log(TX, 0, seller(), buyer(), 1), &node)
        .await;

    assert!(event.is_none());
    assert_eq!(node.value_calls(), 1);
    assert!(ctx.cache.recent_events().is_empty());
    // unknown contracts are only created once classification gets that far
    assert!(ctx.collections.get(&CONTRACT).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_malformed_log_is_dropped() {
    let ctx = AppContext::new(config(json!({})), None, None);
    let node = ScriptedNode::default();

    let mut record = erc721_log(TX, 0, Address::ZERO, buyer(), 1);
    record.topics.truncate(3);

    assert!(ctx.pipeline().handle_log(record, &node).await.is_none());
    assert!(ctx.transactions.is_empty());
    assert!(ctx.cache.recent_events().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_multi_token_name_is_looked_up_once() {
    let ctx = AppContext::new(config(json!({ "show": { "mints": true } })), None, None);
    let pipeline = ctx.pipeline();
    let contract = Address::repeat_byte(0xbb);
    let node = ScriptedNode::default().with_name(contract, "Editions");

    for i in 1..=2u8 {
        let event = pipeline
            .handle_log(
                erc1155_single_log(contract, B256::with_last_byte(i), Address::ZERO, buyer(), 5),
                &node,
            )
            .await
            .unwrap();
        assert_eq!(event.collection.name, "Editions");
        assert_eq!(event.token_id, U256::from(5));
    }

    assert_eq!(node.name_calls(), 1);
    assert_eq!(ctx.cache.collection_name(contract).await.unwrap(), "Editions");
}

#[tokio::test(start_paused = true)]
async fn test_multi_token_without_name_gets_placeholder() {
    let ctx = AppContext::new(config(json!({})), None, None);
    let contract = Address::repeat_byte(0xcc);
    let node = ScriptedNode::default();

    let event = ctx
        .pipeline()
        .handle_log(
            erc1155_single_log(contract, TX, Address::ZERO, buyer(), 5),
            &node,
        )
        .await
        .unwrap();

    assert_eq!(event.collection.name, "Unknown TransferSingle");
    // known to have no name
    assert_eq!(ctx.cache.collection_name(contract).await.unwrap(), "");
}

#[tokio::test(start_paused = true)]
async fn test_late_log_is_merged_without_reclassifying() {
    let ctx = AppContext::new(config(json!({})), None, None);
    let pipeline = ctx.pipeline();
    let node = ScriptedNode::default().with_value(TX, ether(1000));
    let mut events = ctx.output.subscribe();

    let event = pipeline
        .handle_log(erc721_log(TX, 0, seller(), buyer(), 1), &node)
        .await
        .unwrap();
    assert_eq!(event.item_count, 1);

    // one window later
    let late = pipeline
        .handle_log(erc721_log(TX, 1, seller(), buyer(), 2), &node)
        .await;
    assert!(late.is_none());

    let aggregate = ctx.transactions.get(&TX).unwrap();
    assert_eq!(aggregate.log_count(), 2);
    assert_eq!(aggregate.unique_token_ids().len(), 2);

    assert_eq!(events.recv().await.unwrap().item_count, 1);
    assert!(events.try_recv().is_err());
    assert_eq!(node.value_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_log_redelivered_after_sweep_is_dropped() {
    let ctx = AppContext::new(config(json!({})), None, None);
    let pipeline = ctx.pipeline();
    let node = ScriptedNode::default().with_value(TX, ether(1000));
    let retention = ctx.config.correlation.retention();

    let record = erc721_log(TX, 0, seller(), buyer(), 1);
    pipeline.handle_log(record.clone(), &node).await.unwrap();

    tokio::time::advance(retention + Duration::from_secs(1)).await;
    assert_eq!(ctx.transactions.sweep(retention), 1);

    assert!(pipeline.handle_log(record.clone(), &node).await.is_none());
    assert_eq!(ctx.cache.recent_events().len(), 1);
    assert_eq!(node.value_calls(), 1);

    // forgotten one retention period after the sweep
    tokio::time::advance(retention + Duration::from_secs(1)).await;
    ctx.transactions.sweep(retention);
    assert!(pipeline.handle_log(record, &node).await.is_some());
    assert_eq!(ctx.cache.recent_events().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_undecodable_multi_token_log_is_unknown() {
    let ctx = AppContext::new(config(json!({})), None, None);
    let contract = Address::repeat_byte(0xcc);
    let node = ScriptedNode::default();

    let mut record = erc1155_single_log(contract, TX, seller(), buyer(), 5);
    record.data = Default::default();

    let event = ctx.pipeline().handle_log(record, &node).await.unwrap();

    assert_eq!(event.kind, EventKind::Unknown);
    assert_eq!(event.from, Address::ZERO);
    assert!(!event.printable);
    assert_eq!(node.value_calls(), 0);
}
