// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # CAIRN Keeper
//!
//! Entry point for the `cairn-keeper` binary. Parses CLI arguments,
//! initializes logging and metrics, restores the engine from its journal,
//! drives the batch and settlement loops, and serves the read-only HTTP API.
//!
//! The binary supports four subcommands:
//!
//! - `run`     — start the keeper daemon
//! - `init`    — initialize a data directory and seed genesis state
//! - `status`  — query a running keeper's status endpoint
//! - `version` — print build version information

mod api;
mod cli;
mod logging;
mod metrics;

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use rand::Rng;
use tokio::signal;

use cairn_gateways::{Engine, VaultOverview};
use cairn_protocol::adapter::{Adapter, StaticAdapter};
use cairn_protocol::batch::BatchStatus;
use cairn_protocol::config::{ProtocolConfig, BPS_SCALE};
use cairn_protocol::ids::BatchId;
use cairn_protocol::registry::{Authorizer, Role, StaticAuthorizer, VaultKind};
use cairn_protocol::router::ProposalStatus;
use cairn_protocol::storage::journal::EventJournal;

use cli::{CairnKeeperCli, Commands};
use logging::LogFormat;
use metrics::KeeperMetrics;

/// Account the keeper acts as. Granted `Relayer` in the default role
/// table; batch cycling and settlement proposing run under it.
const KEEPER_ACCOUNT: &str = "cairn:keeper:ops";

/// Account holding `Admin` in the default role table. Genesis bootstrap
/// runs under it; operational loops never do.
const ADMIN_ACCOUNT: &str = "cairn:admin:genesis";

/// Account holding `Guardian` in the default role table. The keeper never
/// acts as it — cancelling a settlement is a human decision.
const GUARDIAN_ACCOUNT: &str = "cairn:guardian:council";

/// Gateway operator account bound to the genesis primary vault.
const GATEWAY_ACCOUNT: &str = "cairn:gateway:prime";

/// Institution account used by simulation traffic. Granted `Institution`
/// in the default role table.
const INSTITUTION_ACCOUNT: &str = "cairn:inst:alpha";

/// Retail wallets exercised by simulation traffic.
const SIM_RETAIL_USERS: [&str; 3] = ["cairn:user:bob", "cairn:user:carol", "cairn:user:dana"];

/// Role table file inside the data directory, editable by the operator.
const ROLES_FILE: &str = "roles.json";

/// Journal directory inside the data directory.
const JOURNAL_DIR: &str = "journal";

/// Upper bound on simulated venue accrual per batch cycle, in basis
/// points. Well inside the default yield tolerance.
const SIM_MAX_ACCRUAL_BPS: u64 = 20;

/// Seconds between simulated traffic ticks.
const SIM_TRAFFIC_INTERVAL_SECS: u64 = 7;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = CairnKeeperCli::parse();

    match cli.command {
        Commands::Run(args) => run_keeper(args).await,
        Commands::Init(args) => init_keeper(args),
        Commands::Status(args) => query_status(args).await,
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Starts the full keeper daemon: engine restore, batch and settlement
/// loops, the HTTP API, and the metrics endpoint.
async fn run_keeper(args: cli::RunArgs) -> Result<()> {
    logging::init_logging(&args.log_level, LogFormat::from_str_lossy(&args.log_format));

    tracing::info!(
        listen = %args.listen,
        network = %args.network,
        data_dir = %args.data_dir.display(),
        simulate = args.simulate,
        "starting cairn-keeper"
    );

    // --- Protocol configuration ---
    let config = network_config(&args.network)?;
    config
        .validate()
        .with_context(|| format!("invalid protocol config for network {}", args.network))?;

    // --- Data directory and role table ---
    std::fs::create_dir_all(&args.data_dir).with_context(|| {
        format!("failed to create data directory: {}", args.data_dir.display())
    })?;
    let auth: Arc<dyn Authorizer> = Arc::new(load_roles(&args.data_dir)?);

    // --- Journal and engine ---
    let journal_path = args.data_dir.join(JOURNAL_DIR);
    let journal = EventJournal::open(&journal_path)
        .with_context(|| format!("failed to open journal at {}", journal_path.display()))?;
    let engine = Arc::new(
        Engine::with_journal(config, auth, journal)
            .context("failed to restore engine from journal")?,
    );
    tracing::info!(path = %journal_path.display(), "journal opened");

    // --- Genesis bootstrap ---
    ensure_genesis(&engine, "USDY", "cUSDY", 6)?;

    // --- Metrics ---
    let keeper_metrics = Arc::new(KeeperMetrics::new());
    keeper_metrics.refresh_from(&engine);

    // --- Simulated custody venue ---
    let venue = if args.simulate {
        Some(attach_simulated_venue(&engine)?)
    } else {
        None
    };

    // --- Application state ---
    let app_state = api::AppState {
        version: format!(
            "{} (protocol {})",
            env!("CARGO_PKG_VERSION"),
            cairn_protocol::config::PROTOCOL_VERSION,
        ),
        started_at: Utc::now(),
        engine: Arc::clone(&engine),
        metrics: Arc::clone(&keeper_metrics),
    };

    // --- API server ---
    let router = api::create_router(app_state);
    let listener = tokio::net::TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("failed to bind API listener on {}", args.listen))?;
    tracing::info!("API server listening on {}", args.listen);

    // --- Batch cycle loop ---
    let batch_engine = Arc::clone(&engine);
    let batch_metrics = Arc::clone(&keeper_metrics);
    let batch_venue = venue.clone();
    let batch_interval = Duration::from_secs(args.batch_interval.max(1));
    let batch_loop = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(batch_interval);
        // The first tick fires immediately; a batch just opened at genesis
        // deserves its full cycle, so skip it.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Some(venue) = &batch_venue {
                accrue_venue_yield(&batch_engine, venue);
            }
            run_batch_cycle(&batch_engine, &batch_metrics);
        }
    });

    // --- Settlement loop ---
    let settle_engine = Arc::clone(&engine);
    let settle_metrics = Arc::clone(&keeper_metrics);
    let settle_interval = Duration::from_secs(args.settle_interval.max(1));
    let simulate = args.simulate;
    let settle_loop = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(settle_interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            run_settlement_sweep(&settle_engine, &settle_metrics, simulate);
        }
    });

    // --- Simulated traffic loop ---
    let sim_loop = args.simulate.then(|| {
        let sim_engine = Arc::clone(&engine);
        let sim_metrics = Arc::clone(&keeper_metrics);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(SIM_TRAFFIC_INTERVAL_SECS));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                run_traffic_tick(&sim_engine, &sim_metrics);
            }
        })
    });

    // --- Serve ---
    tokio::select! {
        res = axum::serve(listener, router) => {
            if let Err(e) = res {
                tracing::error!("API server error: {}", e);
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received, draining connections");
        }
    }

    batch_loop.abort();
    settle_loop.abort();
    if let Some(task) = sim_loop {
        task.abort();
    }

    // Pin a snapshot so the next start replays a short journal tail.
    match engine.snapshot(Utc::now()) {
        Ok(Some(seq)) => tracing::info!(pinned_at = seq, "shutdown snapshot written"),
        Ok(None) => {}
        Err(err) => tracing::warn!(error = %err, "shutdown snapshot failed"),
    }
    tracing::info!("cairn-keeper stopped");
    Ok(())
}

/// Maps a network name to its protocol parameter set.
fn network_config(network: &str) -> Result<ProtocolConfig> {
    match network {
        "mainnet" => Ok(ProtocolConfig::mainnet()),
        "testnet" => Ok(ProtocolConfig::testnet()),
        "local" => Ok(ProtocolConfig::local()),
        other => anyhow::bail!("unknown network {other:?} (expected mainnet, testnet, or local)"),
    }
}

/// Loads the role table from the data directory, writing the default
/// table on first run.
///
/// The defaults wire one account per role so a fresh local deployment
/// works end to end; a real deployment edits `roles.json` and restarts.
fn load_roles(data_dir: &Path) -> Result<StaticAuthorizer> {
    let path = data_dir.join(ROLES_FILE);
    if path.exists() {
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read role table at {}", path.display()))?;
        let auth = serde_json::from_str(&raw)
            .with_context(|| format!("role table at {} is not valid JSON", path.display()))?;
        return Ok(auth);
    }

    let auth = default_roles();
    let raw = serde_json::to_string_pretty(&auth).context("failed to serialize role table")?;
    std::fs::write(&path, raw)
        .with_context(|| format!("failed to write role table to {}", path.display()))?;
    tracing::info!(path = %path.display(), "default role table written");
    Ok(auth)
}

/// The role table a fresh data directory starts with.
fn default_roles() -> StaticAuthorizer {
    let mut auth = StaticAuthorizer::new();
    auth.grant(ADMIN_ACCOUNT, Role::Admin);
    auth.grant(KEEPER_ACCOUNT, Role::Relayer);
    auth.grant(GUARDIAN_ACCOUNT, Role::Guardian);
    auth.grant(INSTITUTION_ACCOUNT, Role::Institution);
    auth
}

/// Seeds an empty registry with the genesis asset and its vault pair:
/// one primary vault fronted by the gateway account, one staking vault
/// whose pool receives the primary vault's settled yield.
///
/// A populated registry is left untouched, so restarts and re-runs of
/// `init` are no-ops.
fn ensure_genesis(engine: &Engine, asset: &str, token: &str, decimals: u8) -> Result<()> {
    if engine.status().assets > 0 {
        tracing::debug!("registry already populated, skipping genesis bootstrap");
        return Ok(());
    }

    let now = Utc::now();
    let asset_id = engine.register_asset(ADMIN_ACCOUNT, asset, token, decimals, now)?;
    let prefix = asset.to_lowercase();
    let primary = engine.create_vault(
        ADMIN_ACCOUNT,
        &format!("{prefix}-prime"),
        asset_id,
        VaultKind::Primary,
        now,
    )?;
    let staking = engine.create_vault(
        ADMIN_ACCOUNT,
        &format!("{prefix}-staking"),
        asset_id,
        VaultKind::Staking,
        now,
    )?;
    engine.bind_gateway(ADMIN_ACCOUNT, &primary, GATEWAY_ACCOUNT, now)?;
    if let Some((_, pool)) = engine.staking_accounts(&staking) {
        engine.set_yield_recipient(ADMIN_ACCOUNT, &primary, &pool, now)?;
    }
    engine.open_batch(KEEPER_ACCOUNT, &primary, now)?;
    engine.open_batch(KEEPER_ACCOUNT, &staking, now)?;

    tracing::info!(
        asset = asset,
        token = token,
        primary = %primary,
        staking = %staking,
        "genesis state seeded"
    );
    Ok(())
}

/// Attaches an in-memory custody venue to every primary vault, seeded at
/// the restored baseline so the cross-check at proposal time lines up.
fn attach_simulated_venue(engine: &Engine) -> Result<Arc<StaticAdapter>> {
    let venue = Arc::new(StaticAdapter::new());
    for overview in engine.vault_overviews() {
        if overview.kind != VaultKind::Primary {
            continue;
        }
        if overview.baseline > 0 {
            venue.set_total_assets(&overview.vault, &overview.asset, overview.baseline);
        }
        engine.attach_adapter(
            ADMIN_ACCOUNT,
            &overview.vault,
            Arc::clone(&venue) as Arc<dyn Adapter>,
        )?;
        tracing::info!(vault = %overview.name, baseline = overview.baseline, "simulated venue attached");
    }
    Ok(venue)
}

/// Simulates venue-side accrual on every primary position, a random
/// 0..=20 bps per cycle.
fn accrue_venue_yield(engine: &Engine, venue: &StaticAdapter) {
    let mut rng = rand::thread_rng();
    for overview in engine.vault_overviews() {
        if overview.kind != VaultKind::Primary {
            continue;
        }
        let held = venue.total_assets(&overview.vault, &overview.asset);
        if held == 0 {
            continue;
        }
        let bps = rng.gen_range(0..=SIM_MAX_ACCRUAL_BPS);
        let accrued =
            u64::try_from(u128::from(held) * u128::from(bps) / u128::from(BPS_SCALE)).unwrap_or(0);
        if accrued > 0 {
            venue.set_total_assets(&overview.vault, &overview.asset, held.saturating_add(accrued));
            tracing::debug!(vault = %overview.name, bps, accrued, "venue accrual simulated");
        }
    }
}

/// One batch cycle: close every open batch (opening its successor in the
/// same breath), then propose settlements for what just closed.
fn run_batch_cycle(engine: &Engine, metrics: &KeeperMetrics) {
    let now = Utc::now();

    for overview in engine.vault_overviews() {
        let Some(batch) = overview.open_batch else {
            // A vault without an open batch accepts no flow; reopen it.
            match engine.open_batch(KEEPER_ACCOUNT, &overview.vault, now) {
                Ok(opened) => {
                    metrics.batches_opened_total.inc();
                    tracing::info!(vault = %overview.name, batch = %opened, "batch reopened");
                }
                Err(err) => {
                    tracing::warn!(vault = %overview.name, error = %err, "batch reopen failed");
                }
            }
            continue;
        };
        match engine.close_batch(KEEPER_ACCOUNT, &batch, true, now) {
            Ok(successor) => {
                metrics.batches_closed_total.inc();
                if successor.is_some() {
                    metrics.batches_opened_total.inc();
                }
                tracing::info!(vault = %overview.name, batch = %batch, "batch cycled");
            }
            Err(err) => {
                tracing::warn!(vault = %overview.name, batch = %batch, error = %err, "batch close failed");
            }
        }
    }

    propose_settlements(engine, metrics, now, true);
    metrics.refresh_from(engine);
}

/// Proposes settlement for closed batches whose custody total the keeper
/// can read.
///
/// Batches settle strictly in sequence per vault, and the derived yield
/// depends on the baseline at proposal time — so only the oldest closed
/// batch of each vault is ever proposed; the next one follows once it
/// settles. A batch with a live proposal is left alone. A batch whose
/// proposal a guardian cancelled is retried only when `retry_cancelled`
/// is set (the daily cycle, not the settlement sweep), with a freshly
/// read custody total, and sits its full cooldown under guardian review
/// again.
fn propose_settlements(
    engine: &Engine,
    metrics: &KeeperMetrics,
    now: DateTime<Utc>,
    retry_cancelled: bool,
) {
    let proposals = engine.proposals();
    let live: HashSet<BatchId> = proposals
        .iter()
        .filter(|p| p.status == ProposalStatus::Proposed)
        .map(|p| p.batch)
        .collect();
    let cancelled: HashSet<BatchId> = proposals
        .iter()
        .filter(|p| p.status == ProposalStatus::Cancelled)
        .map(|p| p.batch)
        .collect();

    let mut seen_vaults = HashSet::new();
    for batch in engine.closed_batches() {
        // Only the oldest closed batch per vault; later ones wait their turn.
        if !seen_vaults.insert(batch.vault) {
            continue;
        }
        if live.contains(&batch.id) {
            continue;
        }
        if cancelled.contains(&batch.id) && !retry_cancelled {
            tracing::debug!(batch = %batch.id, "proposal was cancelled, waiting for the next cycle");
            continue;
        }
        let Some(overview) = engine.vault_overview(&batch.vault) else {
            continue;
        };
        let Some(reported) = reported_total_for(engine, &overview) else {
            tracing::debug!(
                vault = %overview.name,
                batch = %batch.id,
                "no custody total available, leaving the batch to the operator"
            );
            continue;
        };
        match engine.propose_settlement(KEEPER_ACCOUNT, &batch.vault, &batch.id, reported, now) {
            Ok(proposal) => {
                metrics.proposals_submitted_total.inc();
                tracing::info!(
                    vault = %overview.name,
                    batch = %batch.id,
                    proposal = %proposal,
                    reported,
                    "settlement proposed"
                );
            }
            Err(err) => {
                tracing::warn!(
                    vault = %overview.name,
                    batch = %batch.id,
                    error = %err,
                    "settlement proposal failed"
                );
            }
        }
    }
}

/// The custody total the keeper reports for a vault, if it has a source
/// for one.
///
/// Primary vaults report their attached venue's live total; without an
/// adapter the keeper stays out of the way and a human relayer proposes.
/// Staking vaults report the pool account balance, capped at the yield
/// tolerance above the baseline: routed yield that arrived faster than
/// it settles then flows in over the following cycles instead of
/// tripping the tolerance check and stalling the vault.
fn reported_total_for(engine: &Engine, overview: &VaultOverview) -> Option<u64> {
    match overview.kind {
        VaultKind::Primary => engine.adapter_total(&overview.vault),
        VaultKind::Staking => {
            let (_, pool) = engine.staking_accounts(&overview.vault)?;
            let held = engine.token_balance(&overview.asset, &pool);
            let room = tolerance_room(
                overview.baseline,
                engine.config().effective_tolerance_bps(),
            );
            Some(held.min(overview.baseline.saturating_add(room)))
        }
    }
}

/// Largest yield delta `limit_bps` allows on `baseline`, rounded down.
fn tolerance_room(baseline: u64, limit_bps: u32) -> u64 {
    u64::try_from(u128::from(baseline) * u128::from(limit_bps) / u128::from(BPS_SCALE))
        .unwrap_or(u64::MAX)
}

/// One settlement sweep: execute every matured proposal, crank claims
/// for what just settled, then top up proposals for any batch freed by
/// the sequence advancing.
fn run_settlement_sweep(engine: &Engine, metrics: &KeeperMetrics, simulate: bool) {
    let now = Utc::now();

    for proposal in engine.proposals() {
        if proposal.status != ProposalStatus::Proposed || now < proposal.execute_after {
            continue;
        }
        let started = Instant::now();
        match engine.execute_settlement(KEEPER_ACCOUNT, &proposal.id, now) {
            Ok(outcome) => {
                metrics
                    .settlement_duration_seconds
                    .observe(started.elapsed().as_secs_f64());
                metrics.proposals_executed_total.inc();
                metrics.batches_settled_total.inc();
                tracing::info!(
                    proposal = %proposal.id,
                    vault = %outcome.vault,
                    batch = %outcome.batch,
                    yield_amount = outcome.yield_amount,
                    is_profit = outcome.is_profit,
                    new_baseline = outcome.new_baseline,
                    "settlement executed"
                );
            }
            Err(err) => {
                tracing::warn!(proposal = %proposal.id, error = %err, "settlement execution failed");
            }
        }
    }

    crank_claims(engine, metrics, simulate, now);
    propose_settlements(engine, metrics, now, false);
    metrics.refresh_from(engine);
}

/// Cranks every claim whose batch has settled.
///
/// Staking claims are permissionless, so the keeper completes them all;
/// leaving one pending would understate the pool at the next proposal.
/// Completing a redemption is the gateway operator's move — the keeper
/// stands in for it only on a simulated network.
fn crank_claims(engine: &Engine, metrics: &KeeperMetrics, simulate: bool, now: DateTime<Utc>) {
    for overview in engine.vault_overviews() {
        match overview.kind {
            VaultKind::Staking => {
                let (stakes, unstakes) = engine.pending_staking_requests(&overview.vault);
                for request in stakes {
                    if !batch_is_settled(engine, &request.batch) {
                        continue;
                    }
                    match engine.claim_staked_shares(&overview.vault, &request.id, now) {
                        Ok((_, shares)) => {
                            metrics.claims_total.inc();
                            tracing::info!(
                                vault = %overview.name,
                                request = %request.id,
                                shares,
                                "stake claim cranked"
                            );
                        }
                        Err(err) => {
                            tracing::debug!(request = %request.id, error = %err, "stake claim skipped");
                        }
                    }
                }
                for request in unstakes {
                    if !batch_is_settled(engine, &request.batch) {
                        continue;
                    }
                    match engine.claim_unstaked_assets(&overview.vault, &request.id, now) {
                        Ok((_, assets)) => {
                            metrics.claims_total.inc();
                            tracing::info!(
                                vault = %overview.name,
                                request = %request.id,
                                assets,
                                "unstake claim cranked"
                            );
                        }
                        Err(err) => {
                            tracing::debug!(request = %request.id, error = %err, "unstake claim skipped");
                        }
                    }
                }
            }
            VaultKind::Primary => {
                if !simulate {
                    continue;
                }
                for request in engine.pending_redeems(&overview.vault) {
                    if !batch_is_settled(engine, &request.batch) {
                        continue;
                    }
                    match engine.redeem(GATEWAY_ACCOUNT, &overview.vault, &request.id, now) {
                        Ok(done) => {
                            metrics.redeems_total.inc();
                            tracing::info!(
                                vault = %overview.name,
                                request = %done.id,
                                amount = done.amount,
                                "redemption completed"
                            );
                        }
                        Err(err) => {
                            tracing::debug!(request = %request.id, error = %err, "redemption skipped");
                        }
                    }
                }
            }
        }
    }
}

/// Whether a batch has reached `Settled`.
fn batch_is_settled(engine: &Engine, batch: &BatchId) -> bool {
    engine
        .batch(batch)
        .map(|record| record.status == BatchStatus::Settled)
        .unwrap_or(false)
}

/// One simulated traffic tick: institutional mints and redemptions on
/// primary vaults, retail stakes and unstakes on staking vaults. Amounts
/// and timing are randomized; every action flows through the same entry
/// points external callers would use.
fn run_traffic_tick(engine: &Engine, metrics: &KeeperMetrics) {
    let now = Utc::now();
    let mut rng = rand::thread_rng();

    for overview in engine.vault_overviews() {
        if overview.open_batch.is_none() {
            continue;
        }
        match overview.kind {
            VaultKind::Primary => {
                let held = engine.token_balance(&overview.asset, INSTITUTION_ACCOUNT);
                if held > 10_000 && rng.gen_bool(0.25) {
                    let amount = rng.gen_range(1_000..=held / 4);
                    match engine.request_redeem(
                        INSTITUTION_ACCOUNT,
                        &overview.vault,
                        INSTITUTION_ACCOUNT,
                        amount,
                        now,
                    ) {
                        Ok(request) => {
                            tracing::debug!(vault = %overview.name, request = %request.id, amount, "sim redeem requested");
                        }
                        Err(err) => {
                            tracing::debug!(vault = %overview.name, error = %err, "sim redeem rejected");
                        }
                    }
                } else if rng.gen_bool(0.7) {
                    let amount = rng.gen_range(5_000..=50_000);
                    match engine.mint(
                        INSTITUTION_ACCOUNT,
                        &overview.vault,
                        INSTITUTION_ACCOUNT,
                        amount,
                        now,
                    ) {
                        Ok(_) => {
                            metrics.mints_total.inc();
                            tracing::debug!(vault = %overview.name, amount, "sim mint executed");
                        }
                        Err(err) => {
                            tracing::debug!(vault = %overview.name, error = %err, "sim mint rejected");
                        }
                    }
                }
            }
            VaultKind::Staking => {
                for user in SIM_RETAIL_USERS {
                    let wallet = engine.token_balance(&overview.asset, user);
                    if wallet < 1_000 {
                        // Top the wallet up from the institution's float.
                        let float = engine.token_balance(&overview.asset, INSTITUTION_ACCOUNT);
                        if float > 20_000 {
                            if let Err(err) = engine.transfer_tokens(
                                INSTITUTION_ACCOUNT,
                                &overview.asset,
                                user,
                                10_000,
                                now,
                            ) {
                                tracing::debug!(user, error = %err, "sim wallet top-up failed");
                            }
                        }
                        continue;
                    }
                    if rng.gen_bool(0.4) {
                        let amount = rng.gen_range(500..=wallet / 2);
                        match engine.request_stake(user, &overview.vault, user, amount, now) {
                            Ok(request) => {
                                tracing::debug!(user, request = %request.id, amount, "sim stake requested");
                            }
                            Err(err) => {
                                tracing::debug!(user, error = %err, "sim stake rejected");
                            }
                        }
                    }
                    if let Some(share_asset) = overview.share_asset {
                        let shares = engine.token_balance(&share_asset, user);
                        if shares >= 400 && rng.gen_bool(0.15) {
                            let burn = rng.gen_range(100..=shares / 2);
                            match engine.request_unstake(user, &overview.vault, user, burn, now) {
                                Ok(request) => {
                                    tracing::debug!(user, request = %request.id, shares = burn, "sim unstake requested");
                                }
                                Err(err) => {
                                    tracing::debug!(user, error = %err, "sim unstake rejected");
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Initializes a keeper data directory: journal, role table, genesis
/// registry, and a first snapshot. Re-running on a populated directory
/// is a no-op apart from re-pinning the snapshot.
fn init_keeper(args: cli::InitArgs) -> Result<()> {
    logging::init_logging("info", LogFormat::Pretty);

    let data_dir = &args.data_dir;
    tracing::info!(data_dir = %data_dir.display(), network = %args.network, "initializing keeper");

    let config = network_config(&args.network)?;
    config
        .validate()
        .with_context(|| format!("invalid protocol config for network {}", args.network))?;
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;

    let table = load_roles(data_dir)?;
    let accounts = table.account_count();

    let journal_path = data_dir.join(JOURNAL_DIR);
    let journal = EventJournal::open(&journal_path)
        .with_context(|| format!("failed to open journal at {}", journal_path.display()))?;
    let engine = Engine::with_journal(config, Arc::new(table), journal)
        .context("failed to restore engine from journal")?;

    ensure_genesis(&engine, &args.asset, &args.token, args.decimals)?;
    let pinned = engine.snapshot(Utc::now())?;
    let status = engine.status();

    println!("Keeper data directory initialized.");
    println!("  Data directory : {}", data_dir.display());
    println!("  Network        : {}", args.network);
    println!("  Journal        : {}", journal_path.display());
    println!("  Role table     : {} ({} accounts)", data_dir.join(ROLES_FILE).display(), accounts);
    println!("  Assets         : {}", status.assets);
    println!("  Vaults         : {}", status.vaults);
    if let Some(seq) = pinned {
        println!("  Snapshot       : pinned at event {}", seq);
    }

    Ok(())
}

/// Queries a running keeper's status endpoint and prints the result.
async fn query_status(args: cli::StatusArgs) -> Result<()> {
    let body = http_get(&args.addr, "/status").await?;
    println!("{}", body);
    Ok(())
}

/// Minimal HTTP GET over a raw TCP stream, enough for the status
/// subcommand without pulling in an HTTP client.
async fn http_get(addr: &str, path: &str) -> Result<String> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mut stream = tokio::net::TcpStream::connect(addr)
        .await
        .with_context(|| format!("failed to connect to {}", addr))?;

    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path, addr,
    );
    stream.write_all(request.as_bytes()).await?;
    stream.shutdown().await?;

    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await?;
    let response = String::from_utf8_lossy(&buf);

    // Everything after the first blank line is the body.
    let body = response
        .split_once("\r\n\r\n")
        .map(|(_, b)| b.to_string())
        .unwrap_or_else(|| response.to_string());
    Ok(body)
}

/// Prints version information to stdout.
fn print_version() {
    println!("cairn-keeper {}", env!("CARGO_PKG_VERSION"));
    println!("protocol     {}", cairn_protocol::config::PROTOCOL_VERSION);
    println!("rustc        {}", rustc_version());
}

/// Returns the Rust compiler version used to build this binary.
fn rustc_version() -> &'static str {
    option_env!("RUSTC_VERSION").unwrap_or("unknown")
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// On non-Unix platforms, only Ctrl+C is supported.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
