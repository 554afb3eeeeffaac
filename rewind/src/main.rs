use clap::Parser as ClapParser;
use std::{path::PathBuf, process};

use rewind::{
    AccessBreakMode, ClassRegistry, EngineCreateInfo, HeapCreateInfo, Scenario, Search,
    SearchReport, SearchSettings, Trace,
};

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Bundled program to explore
    #[arg(
        required_unless_present = "list",
        help = "lock-contention, notify-race, deadlock or racy-counter"
    )]
    scenario: Option<Scenario>,

    #[arg(long, help = "List the bundled scenarios and exit")]
    list: bool,

    #[arg(long, help = "Do not match states, explore every path")]
    stateless: bool,

    #[arg(long, conflicts_with = "stateless", help = "Store full states instead of fingerprints")]
    exact: bool,

    #[arg(long, default_value_t = 0, help = "Depth limit, 0 for none")]
    max_depth: usize,

    #[arg(long, default_value_t = 0, help = "New state limit, 0 for none")]
    max_states: usize,

    #[arg(long, help = "Keep searching after the first violation")]
    keep_going: bool,

    #[arg(long, help = "Break transitions on access to shared objects")]
    shared_access: bool,

    #[arg(long, help = "Only collect when the allocation interval is reached")]
    lazy_gc: bool,

    #[arg(long, help = "Allocations between collections, 0 disables the trigger")]
    gc_interval: Option<usize>,

    #[arg(long, help = "Verify heap change tracking after every transition")]
    check_consistency: bool,

    /// Where to write the path of the first violation
    #[arg(long, help = "Write the first counterexample trace as JSON")]
    trace_out: Option<PathBuf>,

    #[arg(long, conflicts_with = "trace_out", help = "Replay a trace instead of searching")]
    replay: Option<PathBuf>,

    #[arg(long, help = "Print the report as JSON")]
    json: bool,

    #[arg(long, help = "Log filter, e.g. `debug` or `rewind=trace` (overrides RUST_LOG)")]
    log: Option<String>,
}

impl Cli {
    fn create_info(&self) -> EngineCreateInfo {
        EngineCreateInfo {
            heap: HeapCreateInfo {
                gc_interval: self.gc_interval,
                ..Default::default()
            },
            search: SearchSettings {
                stateless: self.stateless,
                exact_matching: self.exact,
                max_depth: self.max_depth,
                max_states: self.max_states,
                gc_after_transition: !self.lazy_gc,
                check_consistency: self.check_consistency || cfg!(debug_assertions),
                stop_on_violation: !self.keep_going,
                access_break: if self.shared_access {
                    AccessBreakMode::SharedObjects
                } else {
                    AccessBreakMode::Never
                },
                ..Default::default()
            },
        }
    }
}

fn init_logging(filter: Option<&str>) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"));
    if let Some(filter) = filter {
        builder.parse_filters(filter);
    }
    builder.format_timestamp(None).init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log.as_deref());

    if cli.list {
        for scenario in Scenario::ALL {
            let outcome = if scenario.is_buggy() { "violation" } else { "clean" };
            println!("{:<16} {outcome}", scenario.name());
        }
        return;
    }
    let Some(scenario) = cli.scenario else {
        eprintln!("No scenario given, see --list");
        process::exit(1);
    };

    let classes = ClassRegistry::new();
    let entry = match scenario.build(&classes) {
        Ok(entry) => entry,
        Err(err) => {
            eprintln!("Error building {scenario}: {err}");
            process::exit(1);
        }
    };
    let mut search = match Search::new(classes, entry, &cli.create_info()) {
        Ok(search) => search,
        Err(err) => {
            eprintln!("Error creating search: {err}");
            process::exit(1);
        }
    };

    let result = match &cli.replay {
        Some(path) => {
            let trace = match Trace::load(path) {
                Ok(trace) => trace,
                Err(err) => {
                    eprintln!("Error loading trace '{}': {err}", path.display());
                    process::exit(1);
                }
            };
            search.replay(&trace)
        }
        None => search.run(),
    };
    let report = match result {
        Ok(report) => report,
        Err(err) => {
            eprintln!("Error exploring {scenario}: {err}");
            process::exit(1);
        }
    };

    if let (Some(path), Some(first)) = (&cli.trace_out, report.violations.first()) {
        if let Err(err) = first.trace.save(path) {
            eprintln!("Error writing trace '{}': {err}", path.display());
            process::exit(1);
        }
    }

    if cli.json {
        match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{json}"),
            Err(err) => {
                eprintln!("Error encoding report: {err}");
                process::exit(1);
            }
        }
    } else {
        print_report(scenario, &report);
    }
}

fn print_report(scenario: Scenario, report: &SearchReport) {
    let stats = &report.stats;
    println!("== {scenario} ==");
    println!(
        "states: {} new, {} visited, {} ignored, {} end",
        stats.new_states, stats.visited_states, stats.ignored_states, stats.end_states
    );
    println!(
        "transitions: {} ({} instructions), backtracks: {}, max depth: {}",
        stats.transitions, stats.instructions, stats.backtracks, stats.max_depth
    );
    println!(
        "gc: {} collections, {} objects released",
        stats.collections, stats.released_objects
    );
    if report.stopped_early {
        println!("search stopped early");
    }
    if report.is_ok() {
        println!("no violations");
        return;
    }
    for counterexample in &report.violations {
        println!(
            "\n{} at {}: {}",
            counterexample.violation.property, counterexample.state, counterexample.violation.message
        );
        print!("{}", counterexample.trace);
    }
}
