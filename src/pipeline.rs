use crate::definition::{clean_name, MetricColumn, MetricDefinition, MetricKind};
use crate::error::ScrapeError;
use crate::observation::{fq_name, HistogramData, Observation};
use crate::session::{with_deadline, NumericCell, Row, Session};
use std::time::Duration;

/// Column holding the observation count of histogram rows
const HISTOGRAM_COUNT_COLUMN: &str = "count";

/// Run one definition's query and convert the rows into observations.
///
/// The query runs under the definition's own timeout, else `default_timeout`.
/// An empty result is [`ScrapeError::ZeroResult`]; rows without a single
/// parseable value column are [`ScrapeError::NoParseableValues`].
pub async fn scrape_metric(
    session: &dyn Session,
    definition: &MetricDefinition,
    namespace: &str,
    constant_labels: &[(String, String)],
    default_timeout: Duration,
) -> Result<Vec<Observation>, ScrapeError> {
    let timeout = definition.query_timeout.unwrap_or(default_timeout);
    let rows = with_deadline(timeout, session.fetch_all(&definition.request)).await?;

    if rows.is_empty() {
        return Err(ScrapeError::ZeroResult);
    }

    let observations: Vec<Observation> = rows
        .iter()
        .flat_map(|row| convert_row(row, definition, namespace, constant_labels))
        .collect();

    if observations.is_empty() {
        return Err(ScrapeError::NoParseableValues { rows: rows.len() });
    }

    tracing::debug!(
        context = %definition.context,
        rows = rows.len(),
        observations = observations.len(),
        "Converted query result"
    );
    Ok(observations)
}

/// Convert one row; columns that fail to parse are skipped
pub fn convert_row(
    row: &Row,
    definition: &MetricDefinition,
    namespace: &str,
    constant_labels: &[(String, String)],
) -> Vec<Observation> {
    let labels: Vec<(String, String)> = constant_labels
        .iter()
        .cloned()
        .chain(
            definition
                .labels
                .iter()
                .map(|label| (label.clone(), row.text(label).to_string())),
        )
        .collect();

    let mut out = Vec::with_capacity(definition.columns.len());
    for column in &definition.columns {
        let value = match row.numeric(&column.name) {
            NumericCell::Value(v) => v,
            NumericCell::Absent => {
                tracing::warn!(
                    context = %definition.context,
                    metric = %column.name,
                    "Column missing from query result"
                );
                continue;
            }
            NumericCell::Invalid(raw) => {
                tracing::warn!(
                    context = %definition.context,
                    metric = %column.name,
                    value = %raw,
                    "Unable to convert current value to float"
                );
                continue;
            }
        };

        let name = match &definition.field_to_append {
            None => fq_name(namespace, &definition.context, &column.name),
            Some(field) => fq_name(namespace, &definition.context, &clean_name(row.text(field))),
        };

        let histogram = if column.kind == MetricKind::Histogram {
            match histogram_data(row, definition, column) {
                Some(data) => Some(data),
                None => continue,
            }
        } else {
            None
        };

        out.push(Observation {
            name,
            help: column.help.clone(),
            labels: labels.clone(),
            kind: column.kind,
            value,
            histogram,
        });
    }
    out
}

fn histogram_data(row: &Row, definition: &MetricDefinition, column: &MetricColumn) -> Option<HistogramData> {
    let Some(count) = row.count(HISTOGRAM_COUNT_COLUMN) else {
        tracing::warn!(
            context = %definition.context,
            metric = %column.name,
            value = %row.text(HISTOGRAM_COUNT_COLUMN),
            "Unable to convert count value to int"
        );
        return None;
    };

    let buckets = column
        .buckets
        .iter()
        .filter_map(|(bucket_column, bound)| match row.count(bucket_column) {
            Some(counter) => Some((*bound, counter)),
            None => {
                tracing::warn!(
                    context = %definition.context,
                    metric = %column.name,
                    bucket = %bucket_column,
                    value = %row.text(bucket_column),
                    "Unable to convert bucket value to int, dropping bucket"
                );
                None
            }
        })
        .collect();

    Some(HistogramData { count, buckets })
}
