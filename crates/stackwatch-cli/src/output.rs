//! Text and JSON rendering of records.

use serde::Serialize;
use stackwatch_core::JobRecord;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Render `data` as pretty JSON, or run `text_fn` for text output.
pub fn format_or_json<T: Serialize>(
    format: OutputFormat,
    data: &T,
    text_fn: impl FnOnce(),
) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(data)?);
        }
        OutputFormat::Text => {
            text_fn();
        }
    }
    Ok(())
}

/// Print records as an aligned table, or as a JSON array.
pub fn print_records(format: OutputFormat, records: &[JobRecord], empty: &str) -> anyhow::Result<()> {
    format_or_json(format, &records, || {
        if records.is_empty() {
            println!("{}", empty);
            return;
        }
        for line in record_table(records) {
            println!("{}", line);
        }
    })
}

/// Multi-line description of one record.
pub fn describe(record: &JobRecord) -> String {
    let mut lines = vec![
        format!("name:     {}", record.name),
        format!("status:   {}", record.status),
    ];
    if let Some(pid) = record.pid {
        lines.push(format!("pid:      {}", pid));
    }
    if let Some(run) = &record.run_path {
        lines.push(format!("run:      {}", run.stem()));
    }
    if let Some(log) = &record.log_path {
        lines.push(format!("log:      {}", log.display()));
    }
    lines.join("\n")
}

fn record_table(records: &[JobRecord]) -> Vec<String> {
    let name_width = records
        .iter()
        .map(|r| r.name.as_str().len())
        .max()
        .unwrap_or(0)
        .max("STACK".len());

    let mut lines = vec![format!(
        "{:<name_width$}  {:<15}  {:>7}  RUN",
        "STACK", "STATUS", "PID"
    )];
    for record in records {
        let pid = record.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string());
        let run = record.run_path.as_ref().map(|r| r.stem()).unwrap_or("-");
        lines.push(format!(
            "{:<name_width$}  {:<15}  {:>7}  {}",
            record.name.as_str(),
            record.status.to_string(),
            pid,
            run
        ));
    }
    lines
}
