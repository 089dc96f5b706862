// Settlement core benchmarks for the CAIRN protocol.
//
// Covers flow reporting, the full close/propose/execute settlement
// cycle, identifier derivation, token ledger transfers, and snapshot
// encoding across growing vault counts.

use chrono::Utc;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use cairn_protocol::config::ProtocolConfig;
use cairn_protocol::ids::{AssetId, BatchId, VaultId};
use cairn_protocol::registry::{Role, StaticAuthorizer, VaultKind};
use cairn_protocol::state::CoreState;
use cairn_protocol::storage::StateSnapshot;

const RELAYER: &str = "cairn:relayer:ops";
const INSTITUTION: &str = "cairn:inst:alpha";
const GATEWAY: &str = "cairn:gateway:prime";

/// Role grants shared by every bench.
fn auth() -> StaticAuthorizer {
    let mut auth = StaticAuthorizer::new();
    auth.grant(RELAYER, Role::Relayer);
    auth.grant(INSTITUTION, Role::Institution);
    auth
}

/// Core state with one gateway-fronted primary vault and an open batch.
fn seed_primary(name: &str) -> (CoreState, AssetId, VaultId, BatchId) {
    let now = Utc::now();
    let mut state = CoreState::new();
    let asset = state
        .registry
        .register_asset("USDY", "cUSDY", 6, now)
        .unwrap();
    let vault = state
        .registry
        .create_vault(name, asset, VaultKind::Primary, now)
        .unwrap();
    state.registry.set_gateway(vault, GATEWAY).unwrap();
    let batch = state.batches.open_batch(vault, asset, now).unwrap();
    (state, asset, vault, batch)
}

fn bench_flow_report(c: &mut Criterion) {
    let auth = auth();
    let (mut state, asset, vault, batch) = seed_primary("treasury-prime");

    c.bench_function("settlement/push_assets", |b| {
        b.iter(|| {
            state
                .router
                .push_assets(
                    &auth,
                    INSTITUTION,
                    &state.registry,
                    &mut state.batches,
                    &vault,
                    &asset,
                    1_000,
                    &batch,
                )
                .unwrap()
        });
    });
}

fn bench_settle_cycle(c: &mut Criterion) {
    let auth = auth();
    let config = ProtocolConfig::local();

    c.bench_function("settlement/close_propose_execute", |b| {
        b.iter_with_setup(
            || {
                let (mut state, asset, vault, batch) = seed_primary("treasury-prime");
                state.tokens.mint(asset, INSTITUTION, 1_000_000).unwrap();
                state
                    .router
                    .push_assets(
                        &auth,
                        INSTITUTION,
                        &state.registry,
                        &mut state.batches,
                        &vault,
                        &asset,
                        1_000_000,
                        &batch,
                    )
                    .unwrap();
                state
                    .router
                    .request_pull(
                        &auth,
                        INSTITUTION,
                        &state.registry,
                        &mut state.batches,
                        &vault,
                        &asset,
                        100_000,
                        &batch,
                    )
                    .unwrap();
                (state, asset, vault, batch)
            },
            |(mut state, asset, vault, batch)| {
                let now = Utc::now();
                state.batches.close_batch(&batch, true, now).unwrap();
                let proposal = state
                    .router
                    .propose_settle_batch(
                        &auth,
                        RELAYER,
                        &config,
                        &state.registry,
                        &state.batches,
                        None,
                        &vault,
                        &asset,
                        &batch,
                        1_000_000,
                        now,
                    )
                    .unwrap();
                state
                    .router
                    .execute_settle_batch(
                        RELAYER,
                        &config,
                        &state.registry,
                        &mut state.batches,
                        &mut state.tokens,
                        &mut state.receivers,
                        &proposal,
                        now,
                    )
                    .unwrap()
            },
        );
    });
}

fn bench_id_derivation(c: &mut Criterion) {
    let vault = VaultId::derive("treasury-prime");
    let asset = AssetId::derive("USDY");

    c.bench_function("settlement/derive_batch_id", |b| {
        b.iter(|| BatchId::derive(&vault, &asset, 42));
    });
}

fn bench_token_transfer(c: &mut Criterion) {
    let (mut state, asset, _, _) = seed_primary("treasury-prime");
    state.tokens.mint(asset, "cairn:user:alice", 1_000_000).unwrap();

    // Shuttle the same unit back and forth so balances stay stable.
    c.bench_function("settlement/token_transfer_pair", |b| {
        b.iter(|| {
            state
                .tokens
                .transfer(asset, "cairn:user:alice", "cairn:user:bob", 1)
                .unwrap();
            state
                .tokens
                .transfer(asset, "cairn:user:bob", "cairn:user:alice", 1)
                .unwrap();
        });
    });
}

fn bench_snapshot_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("settlement/snapshot_encode");
    let auth = auth();

    for vault_count in [1usize, 8, 64] {
        group.throughput(Throughput::Elements(vault_count as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(vault_count),
            &vault_count,
            |b, &n| {
                let now = Utc::now();
                let mut state = CoreState::new();
                let asset = state
                    .registry
                    .register_asset("USDY", "cUSDY", 6, now)
                    .unwrap();
                for i in 0..n {
                    let name = format!("vault-{i}");
                    let vault = state
                        .registry
                        .create_vault(&name, asset, VaultKind::Primary, now)
                        .unwrap();
                    state.registry.set_gateway(vault, GATEWAY).unwrap();
                    let batch = state.batches.open_batch(vault, asset, now).unwrap();
                    state
                        .tokens
                        .mint(asset, &format!("cairn:inst:{i}"), 500_000)
                        .unwrap();
                    state
                        .router
                        .push_assets(
                            &auth,
                            INSTITUTION,
                            &state.registry,
                            &mut state.batches,
                            &vault,
                            &asset,
                            500_000,
                            &batch,
                        )
                        .unwrap();
                }
                let snapshot = StateSnapshot::capture(&state, 1, now);

                b.iter(|| snapshot.encode().unwrap());
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_flow_report,
    bench_settle_cycle,
    bench_id_derivation,
    bench_token_transfer,
    bench_snapshot_encode,
);
criterion_main!(benches);
