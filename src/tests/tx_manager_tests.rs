use alloy_primitives::{keccak256, Address, B256, U256};
use std::time::Duration;

use super::test_helpers::tx_stack;
use crate::rpc_manager::FeeData;
use crate::test_utils::MockSigner;
use crate::tx_manager::{
    FeeParams, GasSource, IERC20, IGovernance, INodeRegistry, TransactionConfig, TransactionManagerConfig,
    TransactionSigner, TransactionStatus,
};

fn contract() -> Address {
    Address::repeat_byte(0xC0)
}

fn staking_call() -> INodeRegistry::registerNodeWithStakingCall {
    INodeRegistry::registerNodeWithStakingCall {
        metadata: "agent-7".to_string(),
        stake: U256::from(1_000u64),
    }
}

#[tokio::test(start_paused = true)]
async fn test_successful_transaction_reports_receipt() {
    let (tx, node, telemetry) = tx_stack(TransactionManagerConfig::default());
    node.set_estimate(80_000);
    let signer = MockSigner::default();

    let call = IERC20::transferCall {
        to: Address::repeat_byte(0x22),
        amount: U256::from(5u64),
    };
    let result = tx
        .execute_transaction(&signer, contract(), &call, &TransactionConfig::default())
        .await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.retry_count, 1);
    assert_eq!(result.block_number, Some(101));
    assert_eq!(result.gas_used, Some(21_000));
    assert!(result.transaction_hash.is_some());
    assert!(result.error.is_none());

    let signed = signer.signed();
    assert_eq!(signed.len(), 1);
    assert_eq!(signed[0].gas_limit, 96_000);
    assert_eq!(signed[0].chain_id, 31337);
    assert_eq!(signed[0].nonce, 0);
    assert_eq!(
        signed[0].fees,
        FeeParams::Eip1559 {
            max_fee_per_gas: 44_000_000_000,
            max_priority_fee_per_gas: 2_000_000_000,
        }
    );
    assert_eq!(telemetry.transactions_total.with_label_values(&["confirmed"]).get(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_insufficient_funds_is_not_retried() {
    let (tx, node, _) = tx_stack(TransactionManagerConfig::default());
    node.fail_send("insufficient funds for gas * price + value");
    let signer = MockSigner::default();

    let result = tx
        .execute_transaction(&signer, contract(), &staking_call(), &TransactionConfig::default())
        .await;

    assert!(!result.success);
    assert_eq!(result.retry_count, 1);
    assert!(result.error.unwrap().contains("insufficient funds"));
    assert_eq!(signer.signed().len(), 1);
    assert!(node.sent_transactions().is_empty());
    // The reserved nonce was never used on chain.
    assert_eq!(tx.nonces().peek(signer.address()).await, None);
}

#[tokio::test(start_paused = true)]
async fn test_estimation_failure_uses_static_gas_limit() {
    let (tx, node, telemetry) = tx_stack(TransactionManagerConfig::default());
    node.fail_estimate("gas required exceeds allowance (8000000)");
    let signer = MockSigner::default();

    let result = tx
        .execute_transaction(&signer, contract(), &staking_call(), &TransactionConfig::default())
        .await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(signer.signed()[0].gas_limit, 1_000_000);
    assert_eq!(telemetry.gas_estimate_fallbacks.get(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_estimate_gas_sources() {
    let (tx, node, _) = tx_stack(TransactionManagerConfig::default());
    let from = Address::repeat_byte(1);

    node.set_estimate(50_000);
    let estimate = tx.estimate_gas(from, contract(), &staking_call(), U256::ZERO).await;
    assert_eq!(estimate.gas_limit, 60_000);
    assert_eq!(estimate.source, GasSource::Estimated);

    node.fail_estimate("execution reverted: already registered");
    let call = INodeRegistry::deregisterNodeCall {};
    let estimate = tx.estimate_gas(from, contract(), &call, U256::ZERO).await;
    assert_eq!(estimate.gas_limit, 300_000);
    assert_eq!(estimate.source, GasSource::Fallback);

    let vote = IGovernance::castVoteCall {
        proposalId: U256::from(3u64),
        support: 1,
    };
    let estimate = tx.estimate_gas(from, contract(), &vote, U256::ZERO).await;
    assert_eq!(estimate.gas_limit, 500_000);
}

#[tokio::test(start_paused = true)]
async fn test_legacy_and_default_fees() {
    let (tx, node, _) = tx_stack(TransactionManagerConfig::default());
    let signer = MockSigner::default();

    node.set_fee_data(FeeData {
        gas_price: Some(10_000_000_000),
        ..Default::default()
    });
    let result = tx
        .execute_transaction(&signer, contract(), &staking_call(), &TransactionConfig::default())
        .await;
    assert!(result.success);

    node.fail_fee_data("method eth_feeHistory not supported");
    let result = tx
        .execute_transaction(&signer, contract(), &staking_call(), &TransactionConfig::default())
        .await;
    assert!(result.success);

    let signed = signer.signed();
    assert_eq!(signed[0].fees, FeeParams::Legacy { gas_price: 11_000_000_000 });
    assert_eq!(signed[1].fees, FeeParams::Legacy { gas_price: 20_000_000_000 });
    assert_eq!(signed[1].nonce, 1);
}

#[tokio::test(start_paused = true)]
async fn test_confirmation_timeout_replaces_with_same_nonce() {
    let (tx, node, _) = tx_stack(TransactionManagerConfig::default());
    node.set_nonce(7);
    node.set_auto_mine(false);
    let signer = MockSigner::default();

    let miner = node.clone();
    tokio::spawn(async move {
        // Between the first timeout (10s) and the replacement (after 2s backoff).
        tokio::time::sleep(Duration::from_secs(11)).await;
        miner.set_auto_mine(true);
    });

    let config = TransactionConfig {
        confirmation_timeout_ms: Some(10_000),
        ..Default::default()
    };
    let result = tx
        .execute_transaction(&signer, contract(), &staking_call(), &config)
        .await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.retry_count, 2);

    let signed = signer.signed();
    assert_eq!(signed.len(), 2);
    assert_eq!(signed[0].nonce, 7);
    assert_eq!(signed[1].nonce, 7);
    assert!(signed[1].fees.max_price_per_gas() >= signed[0].fees.max_price_per_gas() * 110 / 100);
    assert_eq!(node.sent_transactions().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_original_mined_after_replacement_is_success() {
    let (tx, node, _) = tx_stack(TransactionManagerConfig::default());
    node.set_auto_mine(false);
    let signer = MockSigner::default();

    let miner = node.clone();
    tokio::spawn(async move {
        while miner.sent_transactions().len() < 2 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        // The first broadcast wins the nonce; later ones are rejected.
        let original = keccak256(&miner.sent_transactions()[0]);
        miner.mine_transaction(original);
        miner.fail_send("nonce too low");
    });

    let config = TransactionConfig {
        confirmation_timeout_ms: Some(10_000),
        ..Default::default()
    };
    let result = tx
        .execute_transaction(&signer, contract(), &staking_call(), &config)
        .await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.retry_count, 2);
    let original = keccak256(&node.sent_transactions()[0]);
    assert_eq!(result.transaction_hash, Some(original));
    assert_eq!(node.sent_transactions().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_replacement_reports_mined_original() {
    let (tx, node, _) = tx_stack(TransactionManagerConfig::default());
    node.set_auto_mine(false);
    let signer = MockSigner::default();

    let miner = node.clone();
    tokio::spawn(async move {
        // After the first timeout (10s), before the replacement (after 2s backoff).
        tokio::time::sleep(Duration::from_secs(11)).await;
        let original = keccak256(&miner.sent_transactions()[0]);
        miner.mine_transaction(original);
        miner.fail_send("nonce too low");
    });

    let config = TransactionConfig {
        confirmation_timeout_ms: Some(10_000),
        ..Default::default()
    };
    let result = tx
        .execute_transaction(&signer, contract(), &staking_call(), &config)
        .await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.retry_count, 2);
    assert_eq!(node.sent_transactions().len(), 1);
    assert_eq!(result.transaction_hash, Some(keccak256(&node.sent_transactions()[0])));
    assert_eq!(signer.signed().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_repeated_timeouts_exhaust_retries() {
    let config = TransactionManagerConfig {
        retries: 2,
        ..Default::default()
    };
    let (tx, node, _) = tx_stack(config);
    node.set_auto_mine(false);
    let signer = MockSigner::default();

    let result = tx
        .execute_transaction(
            &signer,
            contract(),
            &staking_call(),
            &TransactionConfig {
                confirmation_timeout_ms: Some(5_000),
                ..Default::default()
            },
        )
        .await;

    assert!(!result.success);
    assert_eq!(result.retry_count, 2);
    assert!(result.error.unwrap().contains("not confirmed"));
    assert!(result.transaction_hash.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_reverted_transaction_is_final() {
    let (tx, node, telemetry) = tx_stack(TransactionManagerConfig::default());
    node.set_receipt_status(false);
    let signer = MockSigner::default();

    let result = tx
        .execute_transaction(&signer, contract(), &staking_call(), &TransactionConfig::default())
        .await;

    assert!(!result.success);
    assert_eq!(result.retry_count, 1);
    assert!(result.transaction_hash.is_some());
    assert!(result.error.unwrap().contains("reverted"));
    assert_eq!(telemetry.transactions_total.with_label_values(&["reverted"]).get(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_signer_failure_is_reported() {
    let (tx, _, _) = tx_stack(TransactionManagerConfig::default());
    let signer = MockSigner::default();
    signer.fail_with("device locked");

    let result = tx
        .execute_transaction(&signer, contract(), &staking_call(), &TransactionConfig::default())
        .await;
    assert!(!result.success);
    assert_eq!(result.retry_count, 1);
    assert!(result.error.unwrap().contains("device locked"));
}

#[tokio::test(start_paused = true)]
async fn test_batch_continues_after_failure() {
    let (tx, node, _) = tx_stack(TransactionManagerConfig::default());
    let signer = MockSigner::default();

    let mut outcomes = Vec::new();
    for proposal in 0..3u64 {
        if proposal == 1 {
            node.fail_send("nonce too low");
        }
        let vote = IGovernance::castVoteCall {
            proposalId: U256::from(proposal),
            support: 1,
        };
        let result = tx
            .execute_transaction(&signer, contract(), &vote, &TransactionConfig::default())
            .await;
        outcomes.push(result.success);
    }
    assert_eq!(outcomes, vec![true, false, true]);
}

#[tokio::test(start_paused = true)]
async fn test_contract_read_decodes_typed_return() {
    let (tx, node, _) = tx_stack(TransactionManagerConfig::default());
    let mut word = [0u8; 32];
    word[31] = 42;
    node.set_call_result(word.to_vec());

    let balance = tx
        .execute_contract_read(
            contract(),
            &IERC20::balanceOfCall {
                owner: Address::repeat_byte(9),
            },
        )
        .await
        .unwrap();
    assert_eq!(balance._0, U256::from(42u64));

    node.set_call_result(vec![1u8, 2, 3]);
    let err = tx
        .execute_contract_read(
            contract(),
            &IERC20::balanceOfCall {
                owner: Address::repeat_byte(9),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.category(), "decode");
}

#[tokio::test(start_paused = true)]
async fn test_transaction_status_lifecycle() {
    let (tx, node, _) = tx_stack(TransactionManagerConfig::default());
    assert_eq!(
        tx.get_transaction_status(B256::repeat_byte(1)).await.unwrap(),
        TransactionStatus::NotFound
    );

    node.set_auto_mine(false);
    let signer = MockSigner::default();
    let result = tx
        .execute_transaction(
            &signer,
            contract(),
            &staking_call(),
            &TransactionConfig {
                retries: Some(1),
                confirmation_timeout_ms: Some(4_000),
                ..Default::default()
            },
        )
        .await;
    let hash = result.transaction_hash.unwrap();
    assert_eq!(tx.get_transaction_status(hash).await.unwrap(), TransactionStatus::Pending);

    node.mine_pending();
    assert_eq!(tx.get_transaction_status(hash).await.unwrap(), TransactionStatus::Confirmed);

    let receipt = tx
        .wait_for_transaction_confirmation(hash, 1, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(receipt.transaction_hash, hash);
}

#[tokio::test(start_paused = true)]
async fn test_waits_for_requested_confirmations() {
    let (tx, node, _) = tx_stack(TransactionManagerConfig::default());
    let signer = MockSigner::default();
    let result = tx
        .execute_transaction(&signer, contract(), &staking_call(), &TransactionConfig::default())
        .await;
    let hash = result.transaction_hash.unwrap();
    let mined_at = result.block_number.unwrap();

    let err = tx
        .wait_for_transaction_confirmation(hash, 3, Duration::from_secs(10))
        .await
        .unwrap_err();
    assert!(err.is_retryable());

    node.set_block_number(mined_at + 2);
    let receipt = tx
        .wait_for_transaction_confirmation(hash, 3, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(receipt.block_number, Some(mined_at));
}
