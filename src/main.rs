use std::fs::File;
use std::io::BufWriter;
use std::process;
use std::str::FromStr;

use drawdown::analysis::PercentileSeries;
use drawdown::config::Inputs;
use drawdown::sensitivity::{self, CancelToken, SensitivityOptions};
use drawdown::simulation::{self, SimulationResult};
use drawdown::swr::{self, SwrOptions};
use drawdown::types::FilingStatus;

fn parse_arg<T: FromStr>(flag: &str, value: Option<&String>) -> T {
    match value.map(|v| v.parse::<T>()) {
        Some(Ok(v)) => v,
        _ => {
            eprintln!("{flag} requires a value of the right type");
            process::exit(2);
        }
    }
}

fn main() {
    env_logger::init();
    let args: Vec<String> = std::env::args().collect();

    let mut inputs = Inputs::canonical();
    let mut quiet = false;
    let mut sensitivity_requested = false;
    let mut swr_target: Option<f64> = None;
    let mut json_path: Option<String> = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--seed" => {
                i += 1;
                inputs.simulation.seed = parse_arg("--seed", args.get(i));
            }
            "--paths" => {
                i += 1;
                inputs.simulation.n_paths = parse_arg("--paths", args.get(i));
            }
            "--spending" => {
                i += 1;
                inputs.plan.monthly_spending = parse_arg("--spending", args.get(i));
            }
            "--antithetic" => inputs.simulation.antithetic = true,
            "--progressive" => inputs = inputs.with_progressive_tax(FilingStatus::MarriedJointly),
            "--sensitivity" => sensitivity_requested = true,
            "--swr" => {
                i += 1;
                swr_target = Some(parse_arg("--swr", args.get(i)));
            }
            "--json" => {
                i += 1;
                json_path = Some(parse_arg("--json", args.get(i)));
            }
            "--quiet" => quiet = true,
            other => eprintln!("ignoring unknown argument {other}"),
        }
        i += 1;
    }

    let result = match simulation::run(&inputs) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("simulation failed: {e}");
            process::exit(1);
        }
    };

    if let Some(path) = &json_path {
        let written = File::create(path)
            .map_err(|e| e.to_string())
            .and_then(|f| serde_json::to_writer_pretty(BufWriter::new(f), &result).map_err(|e| e.to_string()));
        if let Err(e) = written {
            eprintln!("failed to write {path}: {e}");
            process::exit(1);
        }
    }

    if !quiet {
        print_summary(&inputs, &result);
        print_yearly("Wealth (nominal)", &result.wealth);
        print_yearly("Spending (nominal, monthly)", &result.spending);
    }

    if sensitivity_requested {
        match sensitivity::run_sensitivity(&inputs, &SensitivityOptions::default(), &CancelToken::new()) {
            Ok(report) => {
                println!(
                    "\n=== Sensitivity (base success {:.1}%) ===",
                    report.base_success_probability * 100.0
                );
                println!(
                    "{:<28} | {:>12} | {:>12} | {:>8} | {:>8} | {:>8}",
                    "Parameter", "Low", "High", "Low%", "High%", "Impact"
                );
                println!("{}", "-".repeat(90));
                for r in report.ranked() {
                    println!(
                        "{:<28} | {:>12.4} | {:>12.4} | {:>7.1}% | {:>7.1}% | {:>+7.1}%",
                        r.parameter_name,
                        r.low_value,
                        r.high_value,
                        r.low_success * 100.0,
                        r.high_success * 100.0,
                        r.impact * 100.0
                    );
                }
            }
            Err(e) => eprintln!("sensitivity failed: {e}"),
        }
    }

    if let Some(target) = swr_target {
        match swr::find_safe_withdrawal(&inputs, target, &SwrOptions::default()) {
            Ok(found) => {
                println!("\n=== Safe withdrawal at {:.0}% success ===", target * 100.0);
                println!("  Monthly spending:  {:>12.2}", found.max_monthly_spending);
                println!("  Annual withdrawal: {:>12.2}", found.annual_withdrawal);
                println!("  Implied rate:      {:>11.2}%", found.implied_rate * 100.0);
                println!("  Achieved success:  {:>11.1}%", found.achieved_success * 100.0);
                println!("  Iterations:        {:>12}", found.iterations);
            }
            Err(e) => eprintln!("safe withdrawal search failed: {e}"),
        }
    }
}

fn print_summary(inputs: &Inputs, result: &SimulationResult) {
    println!("=== drawdown {} ===", result.engine_version);
    println!("  Config:              {}", result.config_id);
    println!("  Seed:                {}", result.seed);
    println!(
        "  Paths x steps:       {} x {} (retire at step {})",
        result.n_paths, result.n_steps, result.retirement_step
    );
    println!("  Initial portfolio:   {:>14.2}", inputs.plan.initial_balance());
    println!(
        "  Income / spending:   {:>14.2} / {:.2} monthly",
        inputs.plan.monthly_income, inputs.plan.monthly_spending
    );
    println!("  Success probability: {:>13.1}%", result.success_probability * 100.0);
    let m = &result.metrics;
    println!("  Shortfall:           {:>13.1}%", m.shortfall_probability * 100.0);
    println!("  Mean ruin months:    {:>14.1}", m.mean_ruin_months);
    println!("  Mean unmet spending: {:>14.2}", m.mean_unmet_spending);

    println!("\n--- Terminal wealth ---");
    for (name, value) in result.terminal_wealth.named() {
        println!("  {name:>4}: {value:>16.2}");
    }
}

/// One row per plan year, sampled at the year's first entry.
fn print_yearly(title: &str, series: &PercentileSeries) {
    println!("\n--- {title} ---");
    println!(
        "{:>4} | {:>14} | {:>14} | {:>14} | {:>14} | {:>14}",
        "Year", "p5", "p25", "p50", "p75", "p95"
    );
    for (year, step) in (0..series.len()).step_by(12).enumerate() {
        if let Some(s) = series.at(step) {
            println!(
                "{:>4} | {:>14.0} | {:>14.0} | {:>14.0} | {:>14.0} | {:>14.0}",
                year, s.p5, s.p25, s.p50, s.p75, s.p95
            );
        }
    }
}
