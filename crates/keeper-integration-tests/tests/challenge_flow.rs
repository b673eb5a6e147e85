//! Integration test: a user stores data, the keeper challenges the provider,
//! and the provider's proof updates history, credit and block health.

mod common;

use common::{contract, spawn_keeper, Actor, LocalNet, SharedChain};
use keeper_core::CoreConfig;
use keeper_transport::cbor;
use keeper_transport::key::Opcode;
use keeper_transport::messages::{BlockPosUpdate, BucketUpdate, ProofReply};
use keeper_types::block::BlockId;
use keeper_types::challenge::{ChallengeKind, ChallengeRecord};
use keeper_types::layout::BucketLayout;
use keeper_types::DEFAULT_PROVIDER_CREDIT;

const KIB: u64 = 1024;

async fn store_blocks(keeper: &keeper_core::Keeper, user: &Actor, now: u64) {
    let bucket = BucketUpdate {
        layout: BucketLayout::new(2, 1, KIB).expect("layout"),
        stripes: 2,
    };
    keeper
        .handle_request(
            &user.id,
            &user.request(Opcode::Put, "q1/bucket/1", cbor::to_vec(&bucket).expect("encode")),
            now,
        )
        .await
        .expect("bucket declared");
    keeper
        .handle_request(&user.id, &user.request(Opcode::Put, "q1/pubkey", vec![7u8; 32]), now)
        .await
        .expect("key published");

    for (block, offset) in [("q1_1_0_0", 0u64), ("q1_1_1_0", 3)] {
        let pos = BlockPosUpdate {
            provider: "p1".to_string(),
            offset,
        };
        keeper
            .handle_request(
                &user.id,
                &user.request(
                    Opcode::Put,
                    &format!("q1/blockpos/{block}"),
                    cbor::to_vec(&pos).expect("encode"),
                ),
                now,
            )
            .await
            .expect("position recorded");
    }
}

#[tokio::test]
async fn proof_round_trip_credits_provider() {
    let net = LocalNet::new();
    let chain = SharedChain::new();
    let keeper = spawn_keeper(&net, &chain, CoreConfig::default());
    let provider = Actor::provider("p1", &chain);
    let user = Actor::user("u1", &chain);
    net.script("p1", |_| None);
    chain.set_upkeeping(contract("q1", &[keeper.id().to_string()], &["p1"], 60, 1_000_000));
    keeper.refresh_peers().await;

    store_blocks(&keeper, &user, 10).await;

    // Data challenge at t=100.
    let report = keeper.challenge_tick(100).await;
    assert_eq!(report.issued, 1);
    tokio::task::yield_now().await;
    let challenges = net.sent_to("p1", "chal");
    assert_eq!(challenges.len(), 1);
    let record: ChallengeRecord = cbor::from_slice(&challenges[0].value).expect("challenge");
    assert_eq!(record.kind, ChallengeKind::Data);
    assert_eq!(
        record.sampled_blocks(),
        vec![BlockId::new("q1", 1, 0, 0), BlockId::new("q1", 1, 1, 0)]
    );

    let proof = ProofReply {
        issued_at: record.issued_at,
        proof: b"good".to_vec(),
    };
    keeper
        .handle_request(
            "p1",
            &provider.request(
                Opcode::Put,
                "q1/proof/p1/100",
                cbor::to_vec(&proof).expect("encode"),
            ),
            150,
        )
        .await
        .expect("proof accepted");

    let group = keeper.groups().get("q1").expect("group");
    let entry = group.ledger("p1");
    let outcome = entry.history().get(&100).cloned().expect("outcome");
    assert!(outcome.success);
    // (0 + 1) KiB + (3 + 1) KiB
    assert_eq!(outcome.verified_len, 5 * KIB);
    assert_eq!(
        keeper.peers().credit("p1"),
        Some(DEFAULT_PROVIDER_CREDIT + 2)
    );
    let meta = entry.block(&BlockId::new("q1", 1, 1, 0)).expect("block");
    assert_eq!(meta.last_verified, 150);
    assert_eq!(meta.repair, 0);

    // The same proof again has nothing outstanding to answer.
    assert!(keeper
        .handle_request(
            "p1",
            &provider.request(
                Opcode::Put,
                "q1/proof/p1/100",
                cbor::to_vec(&proof).expect("encode"),
            ),
            160,
        )
        .await
        .is_err());
}

#[tokio::test]
async fn bad_proof_is_recorded_as_failure() {
    let net = LocalNet::new();
    let chain = SharedChain::new();
    let keeper = spawn_keeper(&net, &chain, CoreConfig::default());
    let provider = Actor::provider("p1", &chain);
    let user = Actor::user("u1", &chain);
    net.script("p1", |_| None);
    chain.set_upkeeping(contract("q1", &[keeper.id().to_string()], &["p1"], 60, 1_000_000));
    keeper.refresh_peers().await;
    store_blocks(&keeper, &user, 10).await;

    keeper.challenge_tick(100).await;
    let proof = ProofReply {
        issued_at: 100,
        proof: b"forged".to_vec(),
    };
    keeper
        .handle_request(
            "p1",
            &provider.request(
                Opcode::Put,
                "q1/proof/p1/100",
                cbor::to_vec(&proof).expect("encode"),
            ),
            120,
        )
        .await
        .expect("proof processed");

    let entry = keeper.groups().get("q1").expect("group").ledger("p1");
    let outcome = entry.history().get(&100).cloned().expect("outcome");
    assert!(!outcome.success);
    assert_eq!(outcome.verified_len, 0);
    assert_eq!(keeper.peers().credit("p1"), Some(DEFAULT_PROVIDER_CREDIT));
    assert_eq!(entry.block(&BlockId::new("q1", 1, 0, 0)).map(|m| m.last_verified), Some(10));
}

#[tokio::test]
async fn unanswered_challenge_is_abandoned_next_round() {
    let net = LocalNet::new();
    let chain = SharedChain::new();
    let keeper = spawn_keeper(&net, &chain, CoreConfig::default());
    let user = Actor::user("u1", &chain);
    Actor::provider("p1", &chain);
    net.script("p1", |_| None);
    chain.set_upkeeping(contract("q1", &[keeper.id().to_string()], &["p1"], 60, 1_000_000));
    keeper.refresh_peers().await;
    store_blocks(&keeper, &user, 10).await;

    keeper.challenge_tick(100).await;
    let second = keeper.challenge_tick(700).await;
    assert_eq!(second.abandoned, 1);

    let entry = keeper.groups().get("q1").expect("group").ledger("p1");
    assert!(entry.history().get(&100).is_some_and(|o| !o.success));
    // No metadata is stored, so the meta round has nothing to sample.
    assert_eq!(second.issued, 0);
    assert_eq!(second.empty, 1);
}
