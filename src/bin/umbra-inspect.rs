//! Prints what an umbra database looks like on disk without touching it.
#![forbid(unsafe_code)]

use std::error::Error;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;
use umbra::admin::{inspect, FileSection, InspectReport};
use umbra::types::PageRange;

#[derive(Parser, Debug)]
#[command(
    name = "umbra-inspect",
    version,
    about = "Read-only inspector for umbra database files"
)]
struct Cli {
    #[arg(value_name = "DB", help = "Path of the data file")]
    db_path: PathBuf,

    #[arg(
        long,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format"
    )]
    format: OutputFormat,

    #[arg(long, help = "Shorthand for --format json")]
    json: bool,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let report = inspect(&cli.db_path)?;
    let format = if cli.json {
        OutputFormat::Json
    } else {
        cli.format
    };
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => print_text(&report),
    }
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

fn print_section(title: &str) {
    println!();
    println!("─── {} {}", title, "─".repeat(55 - title.len()));
}

fn print_field(name: &str, value: impl std::fmt::Display) {
    println!("  {:.<30} {}", name, value);
}

fn print_file(file: &FileSection) {
    print_field("Path", &file.path);
    if file.exists {
        print_field("Size", format_bytes(file.size_bytes));
        print_field("Pages", file.num_pages);
    } else {
        print_field("Exists", "no");
    }
}

fn range_or_none(range: Option<PageRange>) -> String {
    range.map_or_else(|| "None".to_string(), |range| range.to_string())
}

fn print_text(report: &InspectReport) {
    print_section("Data File");
    print_file(&report.data);

    print_section("Header");
    match &report.header {
        Some(header) => {
            print_field("Storage Version", header.storage_version);
            print_field("Database Id", &header.database_id);
            print_field("Catalog Range", range_or_none(header.catalog_range));
            print_field("Metadata Range", range_or_none(header.metadata_range));
        }
        None => print_field("Header", "Not initialized"),
    }

    print_section("Shadow File");
    print_file(&report.shadow.file);
    if let Some(id) = &report.shadow.database_id {
        print_field("Database Id", id);
    }
    if let Some(pages) = report.shadow.num_shadow_pages {
        print_field("Shadow Pages", pages);
    }
    if let Some(matches) = report.shadow.matches_database {
        print_field("Matches Header", if matches { "yes" } else { "NO" });
    }

    print_section("Write-Ahead Log");
    print_file(&report.wal.file);
    print_field("Records", report.wal.num_records);
    print_field(
        "Last Record",
        report
            .wal
            .last_record
            .map_or_else(|| "None".to_string(), |kind| format!("{kind:?}")),
    );

    print_section("Free Space");
    print_field("Entries", report.free_space.entries.len());
    print_field("Free Pages", report.free_space.free_pages);
    for range in &report.free_space.entries {
        println!("    {range}");
    }
    println!();
}
