//! Main entry point for the parbz CLI app

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::time::Instant;

use clap::Parser;
use parbz::cli::{self, Args};
use parbz::{DecodeOptions, ParallelDecoder};

fn main() -> std::process::ExitCode {
    if let Err(e) = run_app() {
        eprintln!("Error: {}", e);
        return std::process::ExitCode::FAILURE;
    }
    std::process::ExitCode::SUCCESS
}

fn run_app() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let output_path = cli::output_path(&args.file)
        .ok_or("cannot derive output filename: input does not end in .bz2")?;
    let input = File::open(&args.file)
        .map_err(|e| format!("cannot open {}: {}", args.file.display(), e))?;
    let output = if args.force {
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&output_path)
    } else {
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&output_path)
    }
    .map_err(|e| format!("cannot create {}: {}", output_path.display(), e))?;

    let workers = if args.threads == 0 {
        num_cpus::get()
    } else {
        args.threads
    };
    let options = DecodeOptions {
        chunk_size: args.chunk_size,
        max_in_flight: args.max_in_flight,
        threads: args.threads,
    };

    let start = Instant::now();
    let mut decoder = ParallelDecoder::new(input, options);
    let mut writer = BufWriter::new(output);
    let mut total: u64 = 0;
    while let Some(block) = decoder.next_block() {
        let payload = block?;
        writer.write_all(&payload)?;
        total += payload.len() as u64;
    }
    writer.flush()?;

    if args.verbose {
        let stats = decoder.stats();
        let duration = start.elapsed();
        let mib = total as f64 / (1024.0 * 1024.0);
        let throughput = if duration.as_secs_f64() > 0.0 {
            mib / duration.as_secs_f64()
        } else {
            0.0
        };
        println!(
            "[parbz] {} → {} | Blocks: {} | Size: {:.2} MiB | Workers: {} | Time: {:.2}s | ⏩ {:.1} MB/s",
            args.file.display(),
            output_path.display(),
            stats.delivered(),
            mib,
            workers,
            duration.as_secs_f64(),
            throughput,
        );
    }

    Ok(())
}
