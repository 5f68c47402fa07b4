use std::fs::OpenOptions;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use fat_chkdsk::{check_disk, CheckOptions, CheckReport, CheckStatus, ChkdskError, ImageDevice};

const USAGE: &str = "usage: fat-chkdsk [--offset <bytes>] [--json] [--no-sweep] <image>";

struct Args {
    image: String,
    offset: u64,
    json: bool,
    no_sweep: bool,
}

fn parse_args() -> Result<Args> {
    let mut image = None;
    let mut offset = 0;
    let mut json = false;
    let mut no_sweep = false;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--offset" => {
                let value = args.next().context("--offset needs a value")?;
                offset = value
                    .parse()
                    .with_context(|| format!("invalid offset: {value}"))?;
            }
            "--json" => json = true,
            "--no-sweep" => no_sweep = true,
            "-h" | "--help" => {
                println!("{USAGE}");
                std::process::exit(0);
            }
            _ if arg.starts_with('-') => bail!("unknown option: {arg}"),
            _ => {
                if image.replace(arg).is_some() {
                    bail!("only one image can be checked at a time");
                }
            }
        }
    }

    Ok(Args {
        image: image.context("no image given")?,
        offset,
        json,
        no_sweep,
    })
}

fn print_report(report: &CheckReport) {
    println!("Filesystem:               {}", report.fat_type);
    println!("Records deleted:          {}", report.corrupted_files);
    println!("Directories deleted:      {}", report.directories_deleted);
    println!("Stray records cleared:    {}", report.trailing_records_cleared);
    if report.orphan_sweep {
        println!("Orphan clusters freed:    {}", report.orphan_clusters_freed);
    }
    println!("Secondary FAT sectors:    {}", report.fat_sectors_resynced);
    if report.depth_limit_hit {
        println!("Warning: directory tree too deep, some directories were not checked");
    }
    for handle in &report.deleted_handles {
        println!(
            "  deleted record at sector {} offset {} (handle 0x{:016X})",
            handle.sector,
            handle.record_offset,
            handle.pack()
        );
    }
}

fn run(args: &Args) -> Result<()> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&args.image)
        .with_context(|| format!("failed to open {}", args.image))?;
    let mut dev = ImageDevice::new(file, args.offset);

    let options = CheckOptions {
        sweep_orphans: !args.no_sweep,
        ..Default::default()
    };
    let report = check_disk(&mut dev, &options, &mut |msg: &str| eprintln!("{msg}"))
        .with_context(|| format!("failed to check {}", args.image))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn main() -> ExitCode {
    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{e}");
            eprintln!("{USAGE}");
            return ExitCode::from(1);
        }
    };

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            let status = e
                .downcast_ref::<ChkdskError>()
                .map(ChkdskError::status)
                .unwrap_or(CheckStatus::GeneralError);
            match status {
                CheckStatus::UnsupportedFilesystem => ExitCode::from(2),
                _ => ExitCode::from(1),
            }
        }
    }
}
