fn main() {
    if let Err(e) = run() {
        eprintln!("benchmark failed: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    use looper_core::{new_looper, EngineConfig, TransportState};
    use serde::Serialize;
    use std::path::PathBuf;
    use std::time::Instant;

    #[derive(Debug)]
    struct Args {
        sample_rate: u32,
        period: usize,
        periods: usize,
        loops: usize,
        output: Option<PathBuf>,
    }

    #[derive(Debug, Clone, Serialize)]
    struct Summary {
        sample_rate: u32,
        frames_per_period: usize,
        periods: usize,
        loops: usize,
        budget_us: f64,
        p50_us: f64,
        p95_us: f64,
        p99_us: f64,
        max_us: f64,
        avg_us: f64,
        over_budget: usize,
        rollovers: usize,
        loops_committed: usize,
    }

    fn parse_value<T: std::str::FromStr>(
        it: &mut impl Iterator<Item = String>,
        flag: &str,
    ) -> Result<T, String> {
        let Some(v) = it.next() else {
            return Err(format!("missing value for {flag}"));
        };
        v.parse::<T>()
            .map_err(|_| format!("invalid value for {flag}"))
    }

    fn parse_args() -> Result<Args, String> {
        let mut args = Args {
            sample_rate: 48_000,
            period: 256,
            periods: 20_000,
            loops: 9,
            output: None,
        };

        let mut it = std::env::args().skip(1);
        while let Some(arg) = it.next() {
            match arg.as_str() {
                "--sample-rate" => args.sample_rate = parse_value(&mut it, "--sample-rate")?,
                "--period" => args.period = parse_value::<usize>(&mut it, "--period")?.max(1),
                "--periods" => args.periods = parse_value::<usize>(&mut it, "--periods")?.max(1),
                "--loops" => args.loops = parse_value::<usize>(&mut it, "--loops")?.clamp(1, 64),
                "--output" => args.output = Some(parse_value(&mut it, "--output")?),
                "--help" | "-h" => {
                    println!(
                        "Usage: cargo run -p looper-core --release --bin period_benchmark -- \\
  [--sample-rate <hz>] [--period <frames>] [--periods <n>] [--loops <n>] [--output <file.json>]"
                    );
                    std::process::exit(0);
                }
                other => {
                    return Err(format!("unknown argument: {other}"));
                }
            }
        }
        Ok(args)
    }

    fn percentile(sorted: &[f64], p: f64) -> f64 {
        if sorted.is_empty() {
            return 0.0;
        }
        let idx = ((sorted.len() - 1) as f64 * p).round() as usize;
        sorted[idx.min(sorted.len() - 1)]
    }

    let args = parse_args()?;
    let config = EngineConfig {
        max_loops_per_scene: args.loops,
        spare_loop_slots: args.loops + 1,
        min_loop_duration_ms: 100,
        ..EngineConfig::default()
    };
    let (mut engine, mut controller) =
        new_looper(config, args.sample_rate, args.period).map_err(|e| e.to_string())?;

    let tone: Vec<f32> = (0..args.period)
        .map(|i| (i as f32 * 0.05).sin() * 0.5)
        .collect();
    let mut out_left = vec![0.0f32; args.period];
    let mut out_right = vec![0.0f32; args.period];

    // Half-second cycle, armed for overdub on every pass so the scene fills
    // up to `loops` layers during the run.
    let cycle = (args.sample_rate as usize / 2).max(args.period);
    controller.toggle_state().map_err(|e| e.to_string())?;
    controller
        .mark_loop_end(0, Some(cycle))
        .map_err(|e| e.to_string())?;

    let mut latencies_us = Vec::with_capacity(args.periods);
    for _ in 0..args.periods {
        let started = Instant::now();
        engine.process([&tone, &tone], [&mut out_left, &mut out_right]);
        latencies_us.push(started.elapsed().as_secs_f64() * 1_000_000.0);

        controller.poll();
        if controller.transport_state(0).map_err(|e| e.to_string())? == TransportState::Playing {
            controller.set_armed(0, true).map_err(|e| e.to_string())?;
        }
    }

    let budget_us = args.period as f64 / args.sample_rate as f64 * 1_000_000.0;
    let over_budget = latencies_us.iter().filter(|us| **us > budget_us).count();
    let avg_us = latencies_us.iter().sum::<f64>() / latencies_us.len() as f64;
    let mut sorted = latencies_us;
    sorted.sort_by(|a, b| a.total_cmp(b));
    let diagnostics = engine.shared().diagnostics().snapshot();

    let summary = Summary {
        sample_rate: args.sample_rate,
        frames_per_period: args.period,
        periods: args.periods,
        loops: engine.scene(0).map(|s| s.n_loops()).unwrap_or(0),
        budget_us,
        p50_us: percentile(&sorted, 0.50),
        p95_us: percentile(&sorted, 0.95),
        p99_us: percentile(&sorted, 0.99),
        max_us: sorted.last().copied().unwrap_or(0.0),
        avg_us,
        over_budget,
        rollovers: diagnostics.rollovers,
        loops_committed: diagnostics.loops_committed,
    };

    let json = serde_json::to_string_pretty(&summary)
        .map_err(|e| format!("failed to serialize summary: {e}"))?;
    if let Some(path) = args.output {
        std::fs::write(&path, &json)
            .map_err(|e| format!("failed to write {}: {e}", path.display()))?;
    }
    println!("{json}");
    Ok(())
}
