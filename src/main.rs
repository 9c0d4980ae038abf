use std::time::{Duration, Instant};

use anyhow::Context;
use gpulife::{
    config::{self, LifeConfig},
    sim::gpucompute::ComputeContext,
};

fn main() -> anyhow::Result<()> {
    gpulife::init_native_logging(config::log_level_from_env()?)?;

    let config = LifeConfig::from_env()?;

    match std::env::var("GPULIFE_BENCHMARK") {
        Ok(steps) => {
            let steps = steps
                .trim()
                .parse()
                .with_context(|| format!("GPULIFE_BENCHMARK `{steps}` is not a step count"))?;
            pollster::block_on(run_benchmark(&config, steps))
        }
        Err(_) => gpulife::start_with_config(config),
    }
}

/// Step a headless simulation as fast as the GPU allows and report timings
async fn run_benchmark(config: &LifeConfig, steps: u64) -> anyhow::Result<()> {
    let mut context = ComputeContext::create(config).await?;

    let start = Instant::now();
    for _ in 0..steps {
        context.compute_step();
    }
    let submitted = start.elapsed();
    context.wait_idle()?;
    let finished = start.elapsed();

    let grid = context.read_current().await?;

    let per_step = if steps == 0 {
        Duration::ZERO
    } else {
        finished.div_f64(steps as f64)
    };
    let rows = [
        ("grid", format!("{}x{}", config.grid.width, config.grid.height)),
        ("steps", context.steps().to_string()),
        ("submit", format!("{}μs", submitted.as_micros())),
        ("total", format!("{}μs", finished.as_micros())),
        ("per step", format!("{}μs", per_step.as_micros())),
        ("population", grid.population().to_string()),
    ];
    let longest_name = rows.iter().map(|(name, _)| name.len()).max().unwrap_or(0);
    for (name, value) in rows {
        println!("{} {value}", pad(name, longest_name + 2));
    }
    Ok(())
}

fn pad(s: &str, len: usize) -> String {
    if s.len() >= len {
        return s.to_string();
    }
    format!("{s}{}", " ".repeat(len - s.len()))
}
