use clap::Parser as ClapParser;
use std::process;

use heap::{FinalizerSettings, HeapSettings};

mod barrier;
mod sim;

use sim::{SimConfig, Simulation};

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Mutator threads; each also sweeps
    #[arg(long, default_value_t = 4, help = "Number of mutator threads")]
    threads: usize,

    #[arg(long, default_value_t = 1000, help = "Objects per thread per cycle")]
    objects: usize,

    #[arg(long, default_value_t = 5, help = "Allocating GC cycles to run")]
    cycles: usize,

    #[arg(
        long,
        default_value_t = 20,
        help = "Share of objects whose type declares a finalizer"
    )]
    finalizable_percent: u8,

    #[arg(
        long,
        default_value_t = 5,
        help = "Share of objects living outside the heap"
    )]
    stack_percent: u8,

    /// Keep pages around after they sweep empty
    #[arg(long, help = "Keep empty pages for reuse instead of releasing them")]
    keep_empty_pages: bool,

    #[arg(long, help = "Finalizer thread stack size in bytes")]
    finalizer_stack_size: Option<usize>,

    #[arg(short, long, help = "Log collector phases (RUST_LOG overrides)")]
    verbose: bool,
}

impl Cli {
    fn config(&self) -> SimConfig {
        SimConfig {
            threads: self.threads,
            objects: self.objects,
            cycles: self.cycles,
            finalizable_percent: self.finalizable_percent,
            stack_percent: self.stack_percent,
            heap: HeapSettings {
                release_empty_pages: !self.keep_empty_pages,
                finalizer: FinalizerSettings {
                    stack_size: self.finalizer_stack_size,
                    ..FinalizerSettings::default()
                },
            },
        }
    }
}

fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(default_filter),
    );
    builder.format_timestamp(None);
    builder.init();

    let config = cli.config();
    if let Err(err) = config.validate() {
        eprintln!("Error: {err}");
        process::exit(1);
    }

    log::info!(
        "{} threads x {} objects, {} cycles",
        config.threads,
        config.objects,
        config.cycles
    );
    let report = Simulation::new(config).run();

    println!("cycles:              {}", report.cycles);
    println!("objects allocated:   {}", report.objects_allocated);
    println!("  finalizable:       {}", report.finalizable_allocated);
    println!("  stack:             {}", report.stack_objects);
    println!("objects freed:       {}", report.objects_freed);
    println!("cleaners disposed:   {}", report.cleaners_disposed);
    println!("worker refs disposed: {}", report.worker_refs_disposed);
    println!("pages swept:         {}", report.sweep.pages_swept);
    println!("pages released:      {}", report.sweep.pages_released);
    println!("pages live:          {}", report.pages_live);
}
