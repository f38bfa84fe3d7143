/*!
 * Measurement data log and snapshot export.
 *
 * Records are kept in capture order and are never reordered or
 * deduplicated; `clear` is the only way to remove them. A log is exported as
 * a [`DataSnapshot`] in one of three [`ExportFormat`]s.
 */
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use labkit_core::types::{ConfigMap, Metadata, Value};

use crate::error::{EquipmentError, Result};

const RESERVED_FIELDS: [&str; 3] = ["timestamp", "value", "units"];

/// One captured measurement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRecord {
    /// When the measurement was taken
    pub timestamp: DateTime<Utc>,
    /// The measured value
    pub value: Value,
    /// Units of `value`
    pub units: String,
    /// Extra fields, flattened into the record when exported
    #[serde(flatten)]
    pub metadata: Metadata,
}

impl MeasurementRecord {
    /// Create a record stamped with the current time.
    ///
    /// Metadata keys that collide with the record's own fields are prefixed
    /// with `meta_`.
    pub fn new(value: Value, units: impl Into<String>, metadata: Metadata) -> Self {
        let metadata = metadata
            .into_iter()
            .map(|(key, value)| {
                if RESERVED_FIELDS.contains(&key.as_str()) {
                    (format!("meta_{}", key), value)
                } else {
                    (key, value)
                }
            })
            .collect();

        Self {
            timestamp: Utc::now(),
            value,
            units: units.into(),
            metadata,
        }
    }

    /// Column names for tabular export, in order
    fn columns(&self) -> Vec<String> {
        RESERVED_FIELDS
            .iter()
            .map(|f| f.to_string())
            .chain(self.metadata.keys().cloned())
            .collect()
    }

    fn cell(&self, column: &str) -> String {
        match column {
            "timestamp" => self.timestamp.to_rfc3339(),
            "value" => self.value.to_string(),
            "units" => self.units.clone(),
            key => self.metadata.get(key).map(Value::to_string).unwrap_or_default(),
        }
    }
}

/// Append-only store of captured measurements
#[derive(Debug, Clone, Default)]
pub struct DataLog {
    records: Vec<MeasurementRecord>,
}

impl DataLog {
    /// Create an empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record, returning a copy of it
    pub fn push(&mut self, value: Value, units: impl Into<String>, metadata: Metadata) -> MeasurementRecord {
        let record = MeasurementRecord::new(value, units, metadata);
        self.records.push(record.clone());
        record
    }

    /// All records, oldest first
    pub fn records(&self) -> &[MeasurementRecord] {
        &self.records
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the log is empty
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Remove every record
    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Capture the log together with its owner's name and configuration
    pub fn snapshot(&self, equipment: &str, config: ConfigMap) -> DataSnapshot {
        DataSnapshot {
            equipment: equipment.to_string(),
            timestamp: Utc::now(),
            config,
            data: self.records.clone(),
        }
    }
}

/// File format for exported data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    /// A structured JSON snapshot
    #[default]
    Json,
    /// One CSV row per record; columns come from the first record
    Csv,
    /// A human-readable dump
    Text,
}

impl FromStr for ExportFormat {
    type Err = EquipmentError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            "txt" | "text" => Ok(ExportFormat::Text),
            other => Err(EquipmentError::export(format!("unknown export format '{}'", other))),
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportFormat::Json => f.write_str("json"),
            ExportFormat::Csv => f.write_str("csv"),
            ExportFormat::Text => f.write_str("txt"),
        }
    }
}

/// An exported view of one equipment's data log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSnapshot {
    /// Equipment name
    pub equipment: String,
    /// Export time
    pub timestamp: DateTime<Utc>,
    /// Active configuration at export time
    pub config: ConfigMap,
    /// Records in capture order
    pub data: Vec<MeasurementRecord>,
}

impl DataSnapshot {
    /// Render the snapshot in `format`
    pub fn render(&self, format: ExportFormat) -> Result<Vec<u8>> {
        match format {
            ExportFormat::Json => Ok(serde_json::to_vec_pretty(self)?),
            ExportFormat::Csv => self.render_csv(),
            ExportFormat::Text => self.render_text(),
        }
    }

    fn render_csv(&self) -> Result<Vec<u8>> {
        let Some(first) = self.data.first() else {
            return Ok(Vec::new());
        };

        let columns = first.columns();
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(&columns)?;
        for record in &self.data {
            writer.write_record(columns.iter().map(|c| record.cell(c)))?;
        }

        writer
            .into_inner()
            .map_err(|e| EquipmentError::export(e.to_string()))
    }

    fn render_text(&self) -> Result<Vec<u8>> {
        let config = serde_json::to_string(&self.config)?;
        let mut out = format!(
            "Equipment: {}\nExport Time: {}\nConfiguration: {}\n\n",
            self.equipment,
            self.timestamp.to_rfc3339(),
            config
        );
        for record in &self.data {
            out.push_str(&serde_json::to_string(record)?);
            out.push('\n');
        }
        Ok(out.into_bytes())
    }

    /// Write the snapshot to `path` in `format`
    pub async fn write_to(&self, path: &Path, format: ExportFormat) -> Result<()> {
        let bytes = self.render(format)?;
        tokio::fs::write(path, bytes).await?;
        debug!(
            "Exported {} records of '{}' to {} as {}",
            self.data.len(),
            self.equipment,
            path.display(),
            format
        );
        Ok(())
    }

    /// Read back a snapshot written in the JSON format
    pub async fn load(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(pairs: &[(&str, Value)]) -> Metadata {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    fn sample_log() -> DataLog {
        let mut log = DataLog::new();
        log.push(Value::from(1.25), "V", metadata(&[("function", "voltage_dc".into())]));
        log.push(Value::from(1.5), "V", metadata(&[("function", "voltage_dc".into())]));
        log
    }

    #[test]
    fn test_records_keep_capture_order() {
        let log = sample_log();
        assert_eq!(log.len(), 2);
        assert_eq!(log.records()[0].value, Value::from(1.25));
        assert_eq!(log.records()[1].value, Value::from(1.5));
        assert!(log.records()[0].timestamp <= log.records()[1].timestamp);
    }

    #[test]
    fn test_identical_records_are_not_deduplicated() {
        let mut log = DataLog::new();
        log.push(Value::from(3), "A", Metadata::new());
        log.push(Value::from(3), "A", Metadata::new());
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_reserved_metadata_keys_are_prefixed() {
        let record = MeasurementRecord::new(Value::from(1), "V", metadata(&[("units", "mV".into())]));
        assert_eq!(record.units, "V");
        assert_eq!(record.metadata.get("meta_units"), Some(&Value::from("mV")));
    }

    #[test]
    fn test_json_record_is_flat() {
        let log = sample_log();
        let json = serde_json::to_value(&log.records()[0]).unwrap();
        assert_eq!(json["units"], "V");
        assert_eq!(json["function"], "voltage_dc");
        assert!(json.get("metadata").is_none());
    }

    #[test]
    fn test_json_snapshot_round_trip() {
        let mut config = ConfigMap::new();
        config.insert("sample_rate".into(), Value::from(2.0));
        let snapshot = sample_log().snapshot("dmm", config.clone());

        let bytes = snapshot.render(ExportFormat::Json).unwrap();
        let parsed: DataSnapshot = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed.equipment, "dmm");
        assert_eq!(parsed.config, config);
        assert_eq!(parsed.data, snapshot.data);
    }

    #[test]
    fn test_csv_columns_from_first_record() {
        let mut log = sample_log();
        log.push(Value::from(vec![1, 2]), "V", metadata(&[("extra", true.into())]));
        let bytes = log.snapshot("dmm", ConfigMap::new()).render(ExportFormat::Csv).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines[0], "timestamp,value,units,function");
        assert_eq!(lines.len(), 4);
        assert!(lines[1].ends_with(",1.25,V,voltage_dc"));
        // nested values are written as JSON; fields missing from the first record are dropped
        assert!(lines[3].ends_with(",\"[1,2]\",V,"));
    }

    #[test]
    fn test_csv_empty_log_has_no_header() {
        let snapshot = DataLog::new().snapshot("relay", ConfigMap::new());
        assert!(snapshot.render(ExportFormat::Csv).unwrap().is_empty());
    }

    #[test]
    fn test_text_dump() {
        let bytes = sample_log().snapshot("dmm", ConfigMap::new()).render(ExportFormat::Text).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("Equipment: dmm\nExport Time: "));
        assert!(text.contains("Configuration: {}\n\n"));
        assert_eq!(text.lines().filter(|l| l.starts_with('{')).count(), 2);
    }

    #[test]
    fn test_export_format_parsing() {
        assert_eq!("JSON".parse::<ExportFormat>().unwrap(), ExportFormat::Json);
        assert_eq!("txt".parse::<ExportFormat>().unwrap(), ExportFormat::Text);
        assert_eq!("csv".parse::<ExportFormat>().unwrap(), ExportFormat::Csv);
        assert!("xlsx".parse::<ExportFormat>().is_err());
    }
}
