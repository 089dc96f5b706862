//! Interactive CLI demo of the full CAIRN settlement lifecycle.
//!
//! Walks through genesis, institutional minting against custody, retail
//! staking at batch-frozen prices, a settlement cycle on each rail, and
//! journal-backed restart recovery. The output uses ANSI escape codes
//! for colored, storytelling-style terminal rendering.
//!
//! Run with:
//!   cargo run -p cairn-gateways --example demo --release

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tempfile::tempdir;

use cairn_gateways::Engine;
use cairn_protocol::adapter::{Adapter, StaticAdapter};
use cairn_protocol::config::ProtocolConfig;
use cairn_protocol::registry::{Role, StaticAuthorizer, VaultKind};
use cairn_protocol::storage::EventJournal;

// ---------------------------------------------------------------------------
// ANSI color constants
// ---------------------------------------------------------------------------

const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";
const ITALIC: &str = "\x1b[3m";

const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const BLUE: &str = "\x1b[34m";
const MAGENTA: &str = "\x1b[35m";
const CYAN: &str = "\x1b[36m";
const WHITE: &str = "\x1b[37m";

const BG_BLUE: &str = "\x1b[44m";

// ---------------------------------------------------------------------------
// Display helpers
// ---------------------------------------------------------------------------

fn banner() {
    println!();
    println!(
        "{BG_BLUE}{BOLD}{WHITE}                                                                    {RESET}"
    );
    println!(
        "{BG_BLUE}{BOLD}{WHITE}    CAIRN PROTOCOL  --  Dual-Track Settlement Demo                  {RESET}"
    );
    println!(
        "{BG_BLUE}{BOLD}{WHITE}    Version 0.1.0  |  Virtual Balances + Batch Settlement           {RESET}"
    );
    println!(
        "{BG_BLUE}{BOLD}{WHITE}                                                                    {RESET}"
    );
    println!();
}

fn section(num: u32, title: &str) {
    println!();
    println!(
        "{BOLD}{CYAN}===[{YELLOW} Step {num} {CYAN}]=============================================================={RESET}"
    );
    println!("{BOLD}{WHITE}  {title}{RESET}");
    println!(
        "{CYAN}------------------------------------------------------------------------{RESET}"
    );
}

fn subsection(text: &str) {
    println!("{DIM}{CYAN}  >> {text}{RESET}");
}

fn success(text: &str) {
    println!("{GREEN}  [OK] {text}{RESET}");
}

fn info(label: &str, value: &str) {
    println!("{WHITE}  {BOLD}{label}:{RESET} {YELLOW}{value}{RESET}");
}

fn timing(label: &str, elapsed: std::time::Duration) {
    let ms = elapsed.as_secs_f64() * 1000.0;
    println!("{DIM}{MAGENTA}  [{label}: {ms:.2} ms]{RESET}");
}

fn balance_row(name: &str, balance: u64, unit: &str, color: &str) {
    println!("  {color}{BOLD}{name:<14}{RESET}  {WHITE}{balance:>12}{RESET} {DIM}{unit}{RESET}");
}

fn separator() {
    println!(
        "{DIM}{CYAN}  . . . . . . . . . . . . . . . . . . . . . . . . . . . . . . . . . {RESET}"
    );
}

// ---------------------------------------------------------------------------
// Accounts
// ---------------------------------------------------------------------------

const ADMIN: &str = "cairn:admin:genesis";
const GUARDIAN: &str = "cairn:guardian:council";
const RELAYER: &str = "cairn:relayer:ops";
const INSTITUTION: &str = "cairn:inst:alpha";
const GATEWAY: &str = "cairn:gateway:prime";
const ALICE: &str = "cairn:user:alice";
const BOB: &str = "cairn:user:bob";

/// Authorizer with one account per protocol role.
fn auth() -> Arc<StaticAuthorizer> {
    let mut auth = StaticAuthorizer::new();
    auth.grant(ADMIN, Role::Admin);
    auth.grant(GUARDIAN, Role::Guardian);
    auth.grant(RELAYER, Role::Relayer);
    auth.grant(INSTITUTION, Role::Institution);
    Arc::new(auth)
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() {
    let demo_start = Instant::now();
    let now = Utc::now();

    banner();

    // -----------------------------------------------------------------------
    // Step 1: Genesis
    // -----------------------------------------------------------------------

    section(1, "Genesis: Roles, Asset, and Vault Pair");
    subsection("Opening a journaled engine and registering USDY -> cUSDY...");

    let dir = tempdir().expect("temporary journal directory");
    let journal_path = dir.path().join("journal");

    let t = Instant::now();
    let journal = EventJournal::open(&journal_path).expect("journal");
    let engine =
        Engine::with_journal(ProtocolConfig::local(), auth(), journal).expect("journaled engine");

    let asset = engine
        .register_asset(ADMIN, "USDY", "cUSDY", 6, now)
        .unwrap();
    let primary = engine
        .create_vault(ADMIN, "usdy-prime", asset, VaultKind::Primary, now)
        .unwrap();
    let staking = engine
        .create_vault(ADMIN, "usdy-staking", asset, VaultKind::Staking, now)
        .unwrap();
    engine.bind_gateway(ADMIN, &primary, GATEWAY, now).unwrap();

    let share = engine
        .vault_overview(&staking)
        .unwrap()
        .share_asset
        .unwrap();
    let (_, pool) = engine.staking_accounts(&staking).unwrap();
    engine
        .set_yield_recipient(ADMIN, &primary, &pool, now)
        .unwrap();

    engine.open_batch(RELAYER, &primary, now).unwrap();
    engine.open_batch(RELAYER, &staking, now).unwrap();
    timing("genesis", t.elapsed());

    info("Asset", &format!("{asset} (USDY, 6 decimals)"));
    info("Primary vault", &primary.to_string());
    info("Staking vault", &staking.to_string());
    info("Yield route", &format!("usdy-prime -> {pool}"));
    success("Both rails online with open batches");

    // -----------------------------------------------------------------------
    // Step 2: Custody Venue
    // -----------------------------------------------------------------------

    section(2, "Custody Venue Attachment");
    subsection("Attaching an adapter so settlement reports are cross-checked...");

    let venue = Arc::new(StaticAdapter::new());
    engine
        .attach_adapter(ADMIN, &primary, Arc::clone(&venue) as Arc<dyn Adapter>)
        .unwrap();
    info("Venue positions", &venue.position_count().to_string());
    success("Primary vault reports must now match the live venue total");

    // -----------------------------------------------------------------------
    // Step 3: Institutional Minting
    // -----------------------------------------------------------------------

    section(3, "Institutional Mint: 1,000,000 USDY into Custody");
    subsection("Whitelisted institution reports a custody deposit and mints...");

    let t = Instant::now();
    engine
        .mint(INSTITUTION, &primary, INSTITUTION, 1_000_000, now)
        .unwrap();
    timing("mint", t.elapsed());

    info(
        "Venue holding",
        &venue.total_assets(&primary, &asset).to_string(),
    );
    info(
        "Custody baseline",
        &engine.vault_overview(&primary).unwrap().baseline.to_string(),
    );

    println!();
    println!("  {BOLD}{WHITE}--- Balances After Mint ---{RESET}");
    balance_row(
        "Institution",
        engine.token_balance(&asset, INSTITUTION),
        "cUSDY",
        BLUE,
    );
    balance_row("Alice", 0, "cUSDY", GREEN);
    balance_row("Bob", 0, "cUSDY", MAGENTA);
    println!();
    assert!(engine.backing(&asset).holds());
    success("Supply is backed 1:1 by reported custody");

    // -----------------------------------------------------------------------
    // Step 4: Retail Enters
    // -----------------------------------------------------------------------

    section(4, "Retail Staking: Two-Phase Entry");
    subsection("Tokens reach retail wallets; stakes escrow until settlement...");

    engine
        .transfer_tokens(INSTITUTION, &asset, ALICE, 150_000, now)
        .unwrap();
    engine
        .transfer_tokens(INSTITUTION, &asset, BOB, 50_000, now)
        .unwrap();

    let alice_stake = engine
        .request_stake(ALICE, &staking, ALICE, 120_000, now)
        .unwrap();
    let bob_stake = engine
        .request_stake(BOB, &staking, BOB, 40_000, now)
        .unwrap();

    info("Escrowed stakes", "160,000 cUSDY across 2 requests");
    info(
        "Share price",
        "unknown until the batch settles (frozen then)",
    );
    success("Stakes ride the open batch; cancellation stays available");

    // -----------------------------------------------------------------------
    // Step 5: Institutional Exit Intent
    // -----------------------------------------------------------------------

    section(5, "Institutional Redemption: 200,000 cUSDY");
    subsection("Redemption escrows tokens now, pays out after settlement...");

    let redeem = engine
        .request_redeem(INSTITUTION, &primary, INSTITUTION, 200_000, now)
        .unwrap();
    balance_row(
        "Institution",
        engine.token_balance(&asset, INSTITUTION),
        "cUSDY",
        BLUE,
    );
    info("Requested outflow", "200,000 cUSDY (escrowed)");
    success("Exit intent recorded against the open batch");

    // -----------------------------------------------------------------------
    // Step 6: Primary Settlement
    // -----------------------------------------------------------------------

    section(6, "Primary Settlement: Yield Routing + Redemption Set-Aside");
    subsection("The venue accrues 60 bps; the relayer settles the batch...");

    venue.set_total_assets(&primary, &asset, 1_006_000);

    let t = Instant::now();
    let batch = engine.vault_overview(&primary).unwrap().open_batch.unwrap();
    engine.close_batch(RELAYER, &batch, true, now).unwrap();
    let proposal = engine
        .propose_settlement(RELAYER, &primary, &batch, 1_006_000, now)
        .unwrap();
    let outcome = engine.execute_settlement(RELAYER, &proposal, now).unwrap();
    timing("close + propose + execute", t.elapsed());

    info("Reported total", &outcome.reported_total.to_string());
    info(
        "Derived yield",
        &format!("{} (profit: {})", outcome.yield_amount, outcome.is_profit),
    );
    info(
        "Yield recipient",
        outcome.yield_recipient.as_deref().unwrap_or("-"),
    );
    info("Receiver funded", &outcome.receiver_funded.to_string());
    info("New baseline", &outcome.new_baseline.to_string());
    info(
        "Venue after recall",
        &venue.total_assets(&primary, &asset).to_string(),
    );

    assert_eq!(outcome.new_baseline, 806_000);
    assert_eq!(venue.total_assets(&primary, &asset), 806_000);
    assert!(engine.backing(&asset).holds());
    separator();
    success("Baseline landed exactly on the venue's remaining holding");

    subsection("Gateway completes the redemption from the batch receiver...");
    engine.redeem(GATEWAY, &primary, &redeem.id, now).unwrap();
    info(
        "Supply after burn",
        &engine.backing(&asset).supply.to_string(),
    );
    success("200,000 cUSDY burned; institution paid off-platform");

    // -----------------------------------------------------------------------
    // Step 7: Staking Settlement and Claims
    // -----------------------------------------------------------------------

    section(7, "Staking Settlement: Frozen One-to-One Pricing");
    subsection("First staking cycle: the pool is empty, so price is par...");

    let batch = engine.vault_overview(&staking).unwrap().open_batch.unwrap();
    engine.close_batch(RELAYER, &batch, true, now).unwrap();
    let proposal = engine
        .propose_settlement(RELAYER, &staking, &batch, 0, now)
        .unwrap();
    let outcome = engine.execute_settlement(RELAYER, &proposal, now).unwrap();
    info("Stake inflow absorbed", &outcome.new_baseline.to_string());

    let (_, alice_shares) = engine
        .claim_staked_shares(&staking, &alice_stake.id, now)
        .unwrap();
    let (_, bob_shares) = engine
        .claim_staked_shares(&staking, &bob_stake.id, now)
        .unwrap();

    println!();
    println!("  {BOLD}{WHITE}--- Shares After Claims ---{RESET}");
    balance_row("Alice", alice_shares, "sUSDY", GREEN);
    balance_row("Bob", bob_shares, "sUSDY", MAGENTA);
    balance_row(
        "Pool",
        engine.token_balance(&asset, &pool),
        "cUSDY",
        CYAN,
    );
    println!();
    success("Routed primary yield already waits in the pool");

    // -----------------------------------------------------------------------
    // Step 8: Appreciated Exit
    // -----------------------------------------------------------------------

    section(8, "Second Staking Cycle: Yield-Appreciated Share Price");
    subsection("Alice exits 20,000 shares at the new frozen rate...");

    let exit = engine
        .request_unstake(ALICE, &staking, ALICE, 20_000, now)
        .unwrap();

    let pool_balance = engine.token_balance(&asset, &pool);
    let batch = engine.vault_overview(&staking).unwrap().open_batch.unwrap();
    engine.close_batch(RELAYER, &batch, true, now).unwrap();
    let proposal = engine
        .propose_settlement(RELAYER, &staking, &batch, pool_balance, now)
        .unwrap();
    let outcome = engine.execute_settlement(RELAYER, &proposal, now).unwrap();

    let pricing = outcome.pricing.unwrap();
    info(
        "Frozen pricing",
        &format!(
            "{} assets / {} shares",
            pricing.total_assets, pricing.total_shares
        ),
    );

    let (_, paid) = engine
        .claim_unstaked_assets(&staking, &exit.id, now)
        .unwrap();
    info("Unstake payout", &format!("{paid} cUSDY for 20,000 sUSDY"));
    assert_eq!(paid, 20_750);

    println!();
    println!("  {BOLD}{WHITE}--- Balances After Exit ---{RESET}");
    balance_row("Alice", engine.token_balance(&asset, ALICE), "cUSDY", GREEN);
    balance_row("Alice", engine.token_balance(&share, ALICE), "sUSDY", GREEN);
    balance_row("Pool", engine.token_balance(&asset, &pool), "cUSDY", CYAN);
    println!();
    success("Share price appreciated 375 bps between cycles");

    // -----------------------------------------------------------------------
    // Step 9: Restart Recovery
    // -----------------------------------------------------------------------

    section(9, "Restart Recovery: Snapshot + Journal Tail");
    subsection("Pinning a snapshot, dropping the engine, restoring from disk...");

    let t = Instant::now();
    let pinned = engine.snapshot(now).unwrap();
    info(
        "Snapshot pinned at seq",
        &pinned.map(|s| s.to_string()).unwrap_or_default(),
    );

    let seq_before = engine.latest_event_seq();
    let supply_before = engine.backing(&asset).supply;
    drop(engine);

    let journal = EventJournal::open(&journal_path).expect("journal reopen");
    let restored =
        Engine::with_journal(ProtocolConfig::local(), auth(), journal).expect("restore");
    timing("snapshot + restore", t.elapsed());

    assert_eq!(restored.latest_event_seq(), seq_before);
    assert_eq!(restored.backing(&asset).supply, supply_before);
    assert_eq!(restored.token_balance(&share, ALICE), 100_000);
    assert!(restored.backing(&asset).holds());

    info("Restored event seq", &restored.latest_event_seq().to_string());
    info(
        "Restored supply",
        &restored.backing(&asset).supply.to_string(),
    );
    success("Ledger and gateway books identical after restart");

    // -----------------------------------------------------------------------
    // Final Summary
    // -----------------------------------------------------------------------

    let total_elapsed = demo_start.elapsed();

    println!();
    println!(
        "{BG_BLUE}{BOLD}{WHITE}                                                                    {RESET}"
    );
    println!(
        "{BG_BLUE}{BOLD}{WHITE}    DEMO COMPLETE -- Final Summary                                  {RESET}"
    );
    println!(
        "{BG_BLUE}{BOLD}{WHITE}                                                                    {RESET}"
    );
    println!();

    println!("  {BOLD}{WHITE}Protocol Statistics:{RESET}");
    println!("  {DIM}----------------------------------------------{RESET}");
    info("Assets registered", "1 (USDY -> cUSDY + sUSDY shares)");
    info("Vaults", "2 (primary + staking over one ledger)");
    info("Batches settled", "3 (one primary, two staking)");
    info("Yield minted", "6,000 cUSDY (60 bps), routed to the pool");
    info("Settlement model", "propose -> guardian cooldown -> execute");
    info("Share pricing", "frozen per batch, floor division");
    info("Custody check", "adapter-corroborated reported totals");
    info("Persistence", "sled journal + versioned snapshots");
    println!();

    println!("  {BOLD}{WHITE}Final Balances:{RESET}");
    println!("  {DIM}----------------------------------------------{RESET}");
    balance_row(
        "Institution",
        restored.token_balance(&asset, INSTITUTION),
        "cUSDY",
        BLUE,
    );
    balance_row("Alice", restored.token_balance(&asset, ALICE), "cUSDY", GREEN);
    balance_row("Alice", restored.token_balance(&share, ALICE), "sUSDY", GREEN);
    balance_row("Bob", restored.token_balance(&share, BOB), "sUSDY", MAGENTA);
    balance_row("Pool", restored.token_balance(&asset, &pool), "cUSDY", CYAN);

    let report = restored.backing(&asset);
    println!();
    println!(
        "  {ITALIC}{DIM}Backing check: {} cUSDY supply vs {} custody + {} unclaimed receivers{RESET}",
        report.supply, report.custody_baseline, report.unclaimed_receivers
    );

    println!();
    println!(
        "  {BOLD}{GREEN}Total demo time: {:.2}s{RESET}",
        total_elapsed.as_secs_f64()
    );
    println!();
}
