//! Sandbox trading simulation.
//!
//! Walks the engine through its lifecycle against scripted and simulated prices:
//! market and limit orders, partial closes, automatic stops and liquidations,
//! funding accrual and price feed outages.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sandbox_core::oracle::PriceIntent;
use sandbox_core::*;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sandbox_core=info")))
        .init();

    let config = EngineConfig::from_env().context("loading SANDBOX_* configuration")?;

    println!("Sandbox Trading Engine Simulation");
    println!("Virtual balances, live or simulated prices\n");

    scenario_1_basic_trading(&config).await?;
    scenario_2_partial_close(&config).await?;
    scenario_3_limit_orders(&config).await?;
    scenario_4_automatic_closes(&config).await?;
    scenario_5_funding(&config).await?;
    scenario_6_feed_outage(&config).await?;
    scenario_7_simulated_market(&config).await?;

    println!("\nAll simulations completed successfully.");
    Ok(())
}

struct Scripted {
    engine: SandboxEngine,
    feed: Arc<StaticPriceSource>,
    clock: Arc<ManualClock>,
}

// engine on a scripted feed and a manual clock so every number is reproducible
fn scripted(config: &EngineConfig) -> Result<Scripted> {
    let feed = Arc::new(StaticPriceSource::new());
    feed.set_price("BTC", dec!(50000));
    feed.set_price("ETH", dec!(3000));
    feed.set_price("SOL", dec!(150));
    let clock = Arc::new(ManualClock::new(Timestamp::from_millis(1_700_000_000_000)));
    let live: Arc<dyn MarketDataSource> = feed.clone();
    let engine = SandboxEngine::new(config.clone(), Arc::new(InMemoryStore::new()), Some(live), clock.clone())?;
    Ok(Scripted { engine, feed, clock })
}

fn print_balance(engine: &SandboxEngine, user: &UserId) -> Result<()> {
    let snap = engine.get_portfolio_snapshot(user)?;
    println!(
        "  {}: balance ${}, equity ${}, margin used ${}, unrealized ${}",
        user, snap.balance, snap.equity, snap.margin_used, snap.unrealized_pnl
    );
    Ok(())
}

/// Open, move the price, close.
async fn scenario_1_basic_trading(config: &EngineConfig) -> Result<()> {
    println!("Scenario 1: Basic Trading\n");
    let Scripted { engine, feed, .. } = scripted(config)?;
    let alice = UserId::new("alice");
    engine.unlock_portfolio(&alice, PrivilegeTier::Standard)?;

    let pos = engine
        .open_position(&alice, OpenRequest::market("BTC", Side::Long, dec!(0.009), 5))
        .await?;
    println!(
        "  Alice opens {} BTC long {} @ ${}, margin ${}, fee ${}",
        pos.quantity, pos.leverage, pos.entry_price, pos.margin_used, pos.fees.entry
    );
    print_balance(&engine, &alice)?;

    feed.set_price("BTC", dec!(52000));
    let trade = engine.close_position(&alice, &pos.id, None).await?;
    println!(
        "  Price rises to $52,000, Alice closes: realized ${}, balance ${}",
        trade.realized_pnl, trade.portfolio.balance
    );
    print_balance(&engine, &alice)?;
    println!();
    Ok(())
}

/// Close in two steps; the pieces add up to the whole.
async fn scenario_2_partial_close(config: &EngineConfig) -> Result<()> {
    println!("Scenario 2: Partial Close\n");
    let Scripted { engine, feed, .. } = scripted(config)?;
    let bob = UserId::new("bob");
    engine.unlock_portfolio(&bob, PrivilegeTier::Premium)?;

    let pos = engine
        .open_position(&bob, OpenRequest::market("ETH", Side::Short, dec!(0.4), 4))
        .await?;
    println!("  Bob opens {} ETH short 4x @ ${}", pos.quantity, pos.entry_price);

    feed.set_price("ETH", dec!(2900));
    let first = engine.close_position(&bob, &pos.id, Some(dec!(0.4))).await?;
    let residual = first.residual.context("partial close left no residual")?;
    println!(
        "  Closes 40% @ $2,900: {} ETH closed, realized ${}, {} ETH still open",
        first.closed.quantity, first.realized_pnl, residual.quantity
    );

    feed.set_price("ETH", dec!(2850));
    let rest = engine.close_position(&bob, &pos.id, None).await?;
    println!("  Closes the rest @ $2,850: realized ${}", rest.realized_pnl);
    println!(
        "  Trades: {}, win rate {}%",
        rest.portfolio.total_trades,
        rest.portfolio.stats().win_rate
    );
    print_balance(&engine, &bob)?;
    println!();
    Ok(())
}

/// Limit orders rest until the monitor sees the market cross them.
async fn scenario_3_limit_orders(config: &EngineConfig) -> Result<()> {
    println!("Scenario 3: Limit Orders\n");
    let Scripted { engine, feed, .. } = scripted(config)?;
    let carol = UserId::new("carol");
    engine.unlock_portfolio(&carol, PrivilegeTier::Standard)?;

    let buy = engine
        .open_position(&carol, OpenRequest::limit("SOL", Side::Long, dec!(4), 3, dec!(140)))
        .await?;
    let sell = engine
        .open_position(&carol, OpenRequest::limit("SOL", Side::Short, dec!(4), 3, dec!(170)))
        .await?;
    println!("  Carol rests a buy @ $140 and a sell @ $170 on SOL");

    feed.set_price("SOL", dec!(138));
    let report = engine.run_risk_cycle().await;
    println!("  SOL dips to $138: {} order(s) filled", report.filled);

    let cancelled = engine.cancel_order(&carol, &sell.id).await?;
    println!("  Carol cancels the sell: {}", cancelled.status);
    let filled = engine.get_position(&carol, &buy.id)?;
    println!("  Buy is {} @ ${}, fee ${}", filled.status, filled.entry_price, filled.fees.entry);
    print_balance(&engine, &carol)?;
    println!();
    Ok(())
}

/// Stops, targets and liquidations fire without the user.
async fn scenario_4_automatic_closes(config: &EngineConfig) -> Result<()> {
    println!("Scenario 4: Automatic Closes\n");
    let Scripted { engine, feed, .. } = scripted(config)?;
    let traders = [
        ("dave", OpenRequest::market("BTC", Side::Long, dec!(0.009), 5).with_stop_loss(dec!(49000))),
        ("erin", OpenRequest::market("BTC", Side::Short, dec!(0.009), 5).with_take_profit(dec!(47000))),
        ("frank", OpenRequest::market("BTC", Side::Long, dec!(0.009), 5)),
    ];

    let mut users = Vec::new();
    for (name, request) in traders {
        let user = UserId::new(name);
        engine.unlock_portfolio(&user, PrivilegeTier::Standard)?;
        engine.open_position(&user, request).await?;
        users.push(user);
    }
    println!("  Three BTC positions opened @ $50,000");

    for price in [dec!(48500), dec!(46500), dec!(40000)] {
        feed.set_price("BTC", price);
        let report = engine.run_risk_cycle().await;
        println!("  BTC @ ${}: {} closed", price, report.closed);
    }

    for user in &users {
        if let Some(closed) = engine.get_portfolio_snapshot(user)?.recent_closed.first() {
            println!(
                "  {}: {:?} @ ${}, realized ${}",
                user,
                closed.close_reason.unwrap_or(CloseReason::Manual),
                closed.exit_price.map(|p| p.value()).unwrap_or(Decimal::ZERO),
                closed.realized_pnl.unwrap_or_else(Quote::zero)
            );
        }
    }
    println!();
    Ok(())
}

/// Leveraged positions pay per whole 8h period held.
async fn scenario_5_funding(config: &EngineConfig) -> Result<()> {
    println!("Scenario 5: Funding Accrual\n");
    let Scripted { engine, clock, .. } = scripted(config)?;
    let grace = UserId::new("grace");
    engine.unlock_portfolio(&grace, PrivilegeTier::Pro)?;
    engine
        .open_position(&grace, OpenRequest::market("BTC", Side::Long, dec!(0.014), 10))
        .await?;
    print_balance(&engine, &grace)?;

    for hours in [6, 6, 6, 30] {
        clock.advance_hours(hours);
        let report = engine.run_funding_pass().await;
        println!("  +{}h: {} charged, ${} total", hours, report.charged, report.total_fees);
    }
    print_balance(&engine, &grace)?;
    println!();
    Ok(())
}

/// No opens on a dead feed, closes still go through on simulated prices.
async fn scenario_6_feed_outage(config: &EngineConfig) -> Result<()> {
    println!("Scenario 6: Price Feed Outage\n");
    let Scripted { engine, feed, .. } = scripted(config)?;
    let heidi = UserId::new("heidi");
    engine.unlock_portfolio(&heidi, PrivilegeTier::Standard)?;
    let pos = engine
        .open_position(&heidi, OpenRequest::market("ETH", Side::Long, dec!(0.4), 2))
        .await?;

    feed.set_healthy(false);
    match engine
        .open_position(&heidi, OpenRequest::market("ETH", Side::Long, dec!(0.4), 2))
        .await
    {
        Err(e) => println!("  Feed down, second open refused: {}", e),
        Ok(_) => println!("  Feed down, second open unexpectedly went through"),
    }

    let trade = engine.close_position(&heidi, &pos.id, None).await?;
    println!(
        "  Close still succeeds @ ${} (fallback: {}), realized ${}",
        trade.closed.exit_price.map(|p| p.value()).unwrap_or(Decimal::ZERO),
        trade.price_fallback,
        trade.realized_pnl
    );
    println!();
    Ok(())
}

/// Many traders against the random walk, the monitor running on its own.
async fn scenario_7_simulated_market(config: &EngineConfig) -> Result<()> {
    // SANDBOX_PRICE_ENDPOINT switches this scenario to the live feed
    let run_config = match &config.oracle.endpoint {
        Some(endpoint) => {
            println!("Scenario 7: Live Market ({})\n", endpoint);
            config.clone()
        }
        None => {
            println!("Scenario 7: Simulated Market\n");
            let mut sim_config = EngineConfig::simulation();
            sim_config.oracle.simulator_seed = config.oracle.simulator_seed.or(Some(42));
            sim_config
        }
    };
    let clock = Arc::new(ManualClock::new(Timestamp::from_millis(1_700_000_000_000)));
    let engine = SandboxEngine::new(run_config, Arc::new(InMemoryStore::new()), None, clock.clone())?;

    let symbols = ["BTC", "ETH", "SOL", "AAPL", "SPY"];
    let mut users = Vec::new();
    for i in 0..10u32 {
        let user = UserId::new(format!("trader-{i}"));
        engine.unlock_portfolio(&user, PrivilegeTier::Premium)?;
        let symbol = symbols[(i as usize) % symbols.len()];
        let side = if i % 2 == 0 { Side::Long } else { Side::Short };
        let quote = match engine.executor().oracle().get_price(symbol, PriceIntent::Open).await {
            Ok(quote) => quote.price.value(),
            Err(e) => {
                println!("  {} skipped, no price for {}: {}", user, symbol, e);
                continue;
            }
        };
        // about $4,500 of value at 5x, inside the premium cap
        let quantity = (dec!(900) / quote).round_dp(4);
        let offset = quote * dec!(0.01);
        let (stop, target) = match side {
            Side::Long => (quote - offset, quote + offset),
            Side::Short => (quote + offset, quote - offset),
        };
        let request = OpenRequest::market(symbol, side, quantity, 5)
            .with_stop_loss(stop)
            .with_take_profit(target);
        match engine.open_position(&user, request).await {
            Ok(_) => users.push(user),
            Err(e) => println!("  {} skipped: {}", user, e),
        }
    }
    println!("  {} traders opened with 1% stops and targets", users.len());

    for _ in 0..240 {
        clock.advance_secs(60);
        engine.run_risk_cycle().await;
    }
    let status = engine.get_monitor_status();
    println!(
        "  4 simulated hours, {} cycles, last: {:?}",
        status.cycles_completed, status.last_cycle
    );

    let mut total = Quote::zero();
    for user in &users {
        let snap = engine.get_portfolio_snapshot(user)?;
        total = total.add(snap.balance.sub(Quote::new(dec!(10000))));
    }
    println!("  Net across traders: ${}", total);
    println!("  Events recorded: {}", engine.events(usize::MAX).len());

    engine.start_risk_monitor();
    engine.start_funding_accrual();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    engine.shutdown().await;
    println!("  Background loops started and stopped cleanly");
    Ok(())
}
