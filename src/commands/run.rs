use anyhow::Result;

use roster_sync::config::Config;
use roster_sync::sync::{RunReport, RunStatus};

use super::{build_planner, build_runner, init_metrics, publish_metrics};

pub async fn sync(config: Config, json: bool) -> Result<()> {
    init_metrics(&config);
    let runner = build_runner(&config).await?;

    let outcome = runner.run().await;
    publish_metrics(&config);
    let report = outcome?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

pub async fn plan(config: Config, json: bool) -> Result<()> {
    let planner = build_planner(&config)?;
    let plans = planner.plan().await?;

    if json {
        let out: Vec<_> = plans
            .iter()
            .map(|p| {
                serde_json::json!({
                    "group": p.group,
                    "group_name": p.group_name,
                    "desired": p.desired.len(),
                    "actual": p.actual.len(),
                    "to_add": p.diff.to_add,
                    "to_remove": p.diff.to_remove,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if plans.is_empty() {
        println!("Roster has no usable rows.");
        return Ok(());
    }

    println!("Planned changes");
    println!("===============");
    for plan in &plans {
        println!(
            "\n{} ({}): desired {}, present {}",
            plan.group,
            plan.group_name,
            plan.desired.len(),
            plan.actual.len()
        );
        if plan.diff.is_empty() {
            println!("  up to date");
            continue;
        }
        for member in &plan.diff.to_add {
            println!("  + {member}");
        }
        for member in &plan.diff.to_remove {
            println!("  - {member}");
        }
    }
    Ok(())
}

pub(crate) fn print_report(report: &RunReport) {
    match report.status {
        RunStatus::NoRows => {
            println!("Roster has no usable rows; nothing to do.");
            return;
        }
        RunStatus::Unchanged => println!(
            "All {} groups up to date ({} rows, {:.1}s)",
            report.groups,
            report.rows,
            report.elapsed.as_secs_f64()
        ),
        RunStatus::Changed => println!(
            "Synced {} groups: {} added, {} removed ({} rows, {:.1}s)",
            report.groups,
            report.added_count(),
            report.removed_count(),
            report.rows,
            report.elapsed.as_secs_f64()
        ),
    }

    for result in report.results.iter().filter(|r| r.has_changes()) {
        println!("  {}", result.group);
        for member in &result.added {
            println!("    + {member}");
        }
        for member in &result.removed {
            println!("    - {member}");
        }
    }
}
