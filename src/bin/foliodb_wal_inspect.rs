use std::path::PathBuf;
use std::process;

use clap::{Parser, ValueEnum};

use foliodb::wal::reader::{ScanEnd, WalReader};
use foliodb::wal::recovery::{analyze, WalAnalysis};
use foliodb::wal::record::WalRecordType;

const EXIT_OK: i32 = 0;
const EXIT_TRUNCATED: i32 = 10;
const EXIT_FATAL: i32 = 20;

#[derive(Clone, Debug, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Parser)]
#[command(
    name = "foliodb-wal-inspect",
    about = "Inspect a foliodb WAL segment without touching the database file"
)]
struct Cli {
    /// Path to the WAL segment
    wal: PathBuf,

    /// Output format
    #[arg(long, value_enum, default_value = "text")]
    format: OutputFormat,

    /// List every record instead of the per-transaction summary only
    #[arg(long)]
    verbose: bool,
}

fn type_name(t: WalRecordType) -> &'static str {
    match t {
        WalRecordType::Begin => "begin",
        WalRecordType::Commit => "commit",
        WalRecordType::Abort => "abort",
        WalRecordType::Insert => "insert",
        WalRecordType::Update => "update",
        WalRecordType::Delete => "delete",
        WalRecordType::Checkpoint => "checkpoint",
        WalRecordType::PageWrite => "page-write",
        WalRecordType::Compensation => "compensation",
        WalRecordType::EndOfLog => "end-of-log",
    }
}

fn json_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 8);
    for ch in s.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

fn ids_json(ids: &std::collections::BTreeSet<i64>) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn exit_code(analysis: &WalAnalysis) -> i32 {
    if analysis.truncated_at.is_some() {
        EXIT_TRUNCATED
    } else {
        EXIT_OK
    }
}

fn build_json(reader: &WalReader, analysis: &WalAnalysis, wal: &str) -> String {
    let header = reader.header();
    format!(
        "{{\"wal_path\":\"{}\",\"database_id\":\"{}\",\"sequence\":{},\"checkpoint_lsn\":{},\"clean_close\":{},\"records\":{},\"committed_txns\":[{}],\"aborted_txns\":[{}],\"uncommitted_txns\":[{}],\"truncated_at\":{},\"exit_code\":{}}}",
        json_escape(wal),
        header.database_id,
        header.sequence,
        header.checkpoint_lsn,
        header.is_clean_close(),
        analysis.records.len(),
        ids_json(&analysis.committed),
        ids_json(&analysis.aborted),
        ids_json(&analysis.uncommitted),
        analysis
            .truncated_at
            .map(|lsn| lsn.to_string())
            .unwrap_or_else(|| "null".to_string()),
        exit_code(analysis)
    )
}

fn print_text(reader: &WalReader, analysis: &WalAnalysis, verbose: bool) {
    let header = reader.header();
    println!("segment:");
    println!("  database id:    {}", header.database_id);
    println!("  sequence:       {}", header.sequence);
    println!("  checkpoint lsn: {}", header.checkpoint_lsn);
    println!("  clean close:    {}", header.is_clean_close());
    println!("records: {}", analysis.records.len());

    if verbose {
        for record in &analysis.records {
            println!(
                "  lsn {:>8}  txn {:>4}  prev {:>8}  {:<12} {} bytes",
                record.lsn,
                record.txn_id,
                record.prev_lsn,
                type_name(record.record_type),
                record.payload.len()
            );
        }
    }

    println!("transactions:");
    println!("  committed:   {:?}", analysis.committed);
    println!("  aborted:     {:?}", analysis.aborted);
    println!("  uncommitted: {:?}", analysis.uncommitted);
    match analysis.truncated_at {
        Some(lsn) => println!("corrupt suffix truncated at offset {}", lsn),
        None => match reader.end_state() {
            ScanEnd::EndOfLog => println!("scan ended at end-of-log marker"),
            _ => println!("scan ended at end of file"),
        },
    }
}

fn main() {
    let cli = Cli::parse();

    let mut reader = WalReader::open(&cli.wal).unwrap_or_else(|e| {
        eprintln!("ERROR: cannot open {}: {}", cli.wal.display(), e);
        process::exit(EXIT_FATAL);
    });

    let analysis = analyze(&mut reader).unwrap_or_else(|e| {
        eprintln!("ERROR: scan failed: {}", e);
        process::exit(EXIT_FATAL);
    });

    match cli.format {
        OutputFormat::Text => print_text(&reader, &analysis, cli.verbose),
        OutputFormat::Json => {
            println!(
                "{}",
                build_json(&reader, &analysis, &cli.wal.display().to_string())
            );
        }
    }
    process::exit(exit_code(&analysis));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_escape() {
        assert_eq!(json_escape("plain"), "plain");
        assert_eq!(json_escape("a\"b\\c"), "a\\\"b\\\\c");
        assert_eq!(json_escape("line\nbreak"), "line\\nbreak");
    }

    #[test]
    fn test_exit_code_reflects_truncation() {
        let mut analysis = WalAnalysis::default();
        assert_eq!(exit_code(&analysis), EXIT_OK);
        analysis.truncated_at = Some(128);
        assert_eq!(exit_code(&analysis), EXIT_TRUNCATED);
    }

    #[test]
    fn test_type_names_are_stable() {
        assert_eq!(type_name(WalRecordType::Begin), "begin");
        assert_eq!(type_name(WalRecordType::Checkpoint), "checkpoint");
        assert_eq!(type_name(WalRecordType::EndOfLog), "end-of-log");
    }
}
