//! draw-sim: headless load harness for the closer draw core.
//!
//! Applies a probability config, fires draws from simulated actors on a
//! simulated clock, then prints the resulting distribution.
//!
//! Usage:
//!   draw-sim --seed 12345 --draws 1000 --db draws.db
//!   draw-sim --config data/probability_config.json --actors 5 --tier T2 --spacing-secs 15

use anyhow::Result;
use closer_draw_core::{
    clock::ManualClock,
    error::DrawError,
    DrawService, DrawSettings, ProbabilityConfig, SqliteStore,
};
use std::env;
use std::sync::Arc;

#[derive(Default, serde::Serialize)]
struct RunTally {
    succeeded:         u64,
    cooldown_rejected: u64,
    busy:              u64,
    exhausted:         u64,
    resets:            u64,
}

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let seed = parse_arg(&args, "--seed", 42u64);
    let draws = parse_arg(&args, "--draws", 1_000u64);
    let actors = parse_arg(&args, "--actors", 10u64).max(1);
    let spacing_secs = parse_arg(&args, "--spacing-secs", 5i64);
    let json_out = args.iter().any(|a| a == "--json");
    let db = str_arg(&args, "--db").unwrap_or(":memory:");
    let config_path = str_arg(&args, "--config").unwrap_or("./data/probability_config.json");
    let tier = str_arg(&args, "--tier").unwrap_or("T1");

    if !json_out {
        println!("Closer draw: draw-sim");
        println!("  seed:      {seed}");
        println!("  draws:     {draws}");
        println!("  actors:    {actors}");
        println!("  tier:      {tier}");
        println!("  db:        {db}");
        println!("  config:    {config_path}");
        println!();
    }

    let config = ProbabilityConfig::load(config_path)?;
    let store = SqliteStore::open_migrated(db)?;
    let clock = Arc::new(ManualClock::new(chrono::Utc::now()));
    let service = DrawService::with_clock(store, DrawSettings::seeded(seed), clock.clone());

    let version = service.apply_config(config)?;
    log::info!("applied config v{version}");

    let mut tally = RunTally::default();
    for i in 0..draws {
        let actor = format!("actor-{}", i % actors);
        match service.draw(tier, &actor) {
            Ok(result) => {
                tally.succeeded += 1;
                if result.reset_applied {
                    tally.resets += 1;
                }
            }
            Err(DrawError::CooldownActive { .. }) => tally.cooldown_rejected += 1,
            Err(DrawError::DrawBusy { .. }) => tally.busy += 1,
            Err(DrawError::BucketExhausted { .. }) => tally.exhausted += 1,
            Err(e) => return Err(e.into()),
        }
        clock.advance_secs(spacing_secs);
    }

    print_summary(&service, &tally, json_out)
}

fn print_summary(service: &DrawService, tally: &RunTally, json_out: bool) -> Result<()> {
    let stats = service.all_time_distribution()?;
    let view = service.composition()?;

    if json_out {
        let out = serde_json::json!({
            "tally": tally,
            "distribution": stats,
            "composition": view,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("=== RUN SUMMARY ===");
    println!("  succeeded:         {}", tally.succeeded);
    println!("  cooldown rejected: {}", tally.cooldown_rejected);
    println!("  busy:              {}", tally.busy);
    println!("  exhausted:         {}", tally.exhausted);
    println!("  bucket resets:     {}", tally.resets);

    println!();
    println!("=== DISTRIBUTION (all time) ===");
    for (closer, count) in &stats.total_draws_per_closer {
        println!(
            "  {closer:<12} {count:>7}  ({:.1}%)",
            stats.share_of(closer) * 100.0
        );
    }

    println!();
    println!("=== CURRENT BUCKET ===");
    for (closer, weight) in &view.composition {
        println!("  {closer:<12} {weight:>5.1}");
    }
    if let Some(until) = view.draws_until_reset {
        println!("  draws until reset: {until}");
    }
    Ok(())
}

fn parse_arg<T: std::str::FromStr + Copy>(args: &[String], flag: &str, default: T) -> T {
    args.windows(2)
        .find(|w| w[0] == flag)
        .and_then(|w| w[1].parse().ok())
        .unwrap_or(default)
}

fn str_arg<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.windows(2)
        .find(|w| w[0] == flag)
        .map(|w| w[1].as_str())
}
