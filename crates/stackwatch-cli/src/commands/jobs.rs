use anyhow::Result;
use stackwatch_config::SystemConfig;
use stackwatch_core::{JobRecord, StackName};

use super::open_store;
use crate::output::{OutputFormat, print_records};

pub async fn pending(config: &SystemConfig, format: OutputFormat) -> Result<()> {
    let records = open_store(config).list_pending().await?;
    print_records(format, &records, "No pending jobs")
}

pub async fn history(
    config: &SystemConfig,
    stack: Option<&str>,
    limit: usize,
    format: OutputFormat,
) -> Result<()> {
    let stack = stack.map(StackName::new).transpose()?;
    let records = open_store(config).list_archive().await?;
    let records = select(records, stack.as_ref(), limit);
    print_records(format, &records, "No finished runs")
}

/// Newest first, as listed by the store.
fn select(records: Vec<JobRecord>, stack: Option<&StackName>, limit: usize) -> Vec<JobRecord> {
    records
        .into_iter()
        .filter(|r| stack.is_none_or(|s| &r.name == s))
        .take(limit)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str) -> JobRecord {
        JobRecord::new(StackName::new(name).unwrap())
    }

    #[test]
    fn test_select_filters_and_limits() {
        let records = vec![record("web"), record("api"), record("web"), record("web")];

        assert_eq!(select(records.clone(), None, 2).len(), 2);
        let web = StackName::new("web").unwrap();
        let selected = select(records.clone(), Some(&web), 10);
        assert_eq!(selected.len(), 3);
        assert!(selected.iter().all(|r| r.name == web));
        assert!(select(records, Some(&web), 0).is_empty());
    }

    #[tokio::test]
    async fn test_listing_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = super::super::tests::config(dir.path());

        pending(&config, OutputFormat::Text).await.unwrap();
        history(&config, Some("web"), 5, OutputFormat::Json).await.unwrap();
        assert!(history(&config, Some("bad/name"), 5, OutputFormat::Text).await.is_err());
    }
}
