use std::io::{BufRead, Write};

use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Error, InvalidInputError, Result};

/// One normalised tender/award record: the unit of extraction and the anchor
/// for traceability. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    #[serde(alias = "chunk_id")]
    pub id: String,
    #[serde(alias = "chunk_text", default)]
    pub text: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub tender_no: String,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "non_empty")]
    pub award_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "string_or_number")]
    pub awarded_amt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "non_empty")]
    pub agency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "non_empty")]
    pub supplier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "non_empty")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "non_empty")]
    pub tender_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "non_empty")]
    pub tender_detail_status: Option<String>,
}

/// A raw award record as delivered by the fetch layer.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TenderRecord {
    #[serde(default)]
    pub tender_no: String,
    #[serde(default)]
    pub agency: String,
    #[serde(default)]
    pub award_date: String,
    #[serde(default, alias = "supplier_name")]
    pub supplier: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub awarded_amt: Option<String>,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub tender_description: String,
    #[serde(default)]
    pub tender_detail_status: String,
}

impl Chunk {
    /// Builds the compact tender card for a record.
    pub fn from_record(record: &TenderRecord, source: &str) -> Result<Self> {
        let tender_no = record.tender_no.trim();
        if tender_no.is_empty() {
            return Err(InvalidInputError::MissingTenderNo.into());
        }
        let award_date = trimmed(&record.award_date);
        let id = match &award_date {
            Some(date) => format!("{tender_no}_{date}"),
            None => tender_no.to_string(),
        };

        let mut chunk = Self {
            id,
            text: String::new(),
            source: source.to_string(),
            tender_no: tender_no.to_string(),
            award_date,
            awarded_amt: record.awarded_amt.as_deref().and_then(trimmed),
            agency: trimmed(&record.agency),
            supplier: trimmed(&record.supplier),
            category: trimmed(&record.category),
            tender_description: trimmed(&record.tender_description),
            tender_detail_status: trimmed(&record.tender_detail_status),
        };
        chunk.text = chunk.card();
        Ok(chunk)
    }

    fn card(&self) -> String {
        let or_na = |v: &Option<String>| v.clone().unwrap_or_else(|| "N/A".into());
        let mut lines = vec![
            format!("Tender: {}", self.tender_no),
            format!("Agency: {}", or_na(&self.agency)),
            format!("Award Date: {}", or_na(&self.award_date)),
            format!("Awarded To: {}", or_na(&self.supplier)),
            format!("Amount: {}", or_na(&self.awarded_amt)),
            format!("Category: {}", or_na(&self.category)),
        ];
        if let Some(description) = &self.tender_description {
            if self.category.as_ref() != Some(description) {
                lines.push(format!("Description: {description}"));
            }
        }
        if let Some(status) = &self.tender_detail_status {
            lines.push(format!("Status: {status}"));
        }
        lines.join("\n")
    }

    pub fn validate(&self) -> std::result::Result<(), InvalidInputError> {
        if self.id.trim().is_empty() {
            return Err(InvalidInputError::MissingChunkId);
        }
        Ok(())
    }

    #[must_use]
    pub fn award_date(&self) -> Option<NaiveDate> {
        self.award_date.as_deref().and_then(|d| parse_date(d).ok())
    }

    #[must_use]
    pub fn awarded_amount(&self) -> Option<f64> {
        self.awarded_amt.as_deref().and_then(parse_money)
    }

    /// Names of the immutable fields whose values differ from `other`.
    #[must_use]
    pub fn conflicting_fields(&self, other: &Self) -> Vec<String> {
        let pairs: [(&str, bool); 10] = [
            ("text", self.text == other.text),
            ("source", self.source == other.source),
            ("tender_no", self.tender_no == other.tender_no),
            ("award_date", self.award_date == other.award_date),
            ("awarded_amt", self.awarded_amt == other.awarded_amt),
            ("agency", self.agency == other.agency),
            ("supplier", self.supplier == other.supplier),
            ("category", self.category == other.category),
            ("tender_description", self.tender_description == other.tender_description),
            ("tender_detail_status", self.tender_detail_status == other.tender_detail_status),
        ];
        pairs
            .into_iter()
            .filter(|(_, same)| !same)
            .map(|(name, _)| name.to_string())
            .collect()
    }
}

/// Parses `YYYY-MM-DD` or day-first `DD/MM/YYYY`.
pub fn parse_date(raw: &str) -> std::result::Result<NaiveDate, InvalidInputError> {
    let raw = raw.trim();
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%d/%m/%Y"))
        .or_else(|_| NaiveDate::parse_from_str(raw, "%d %b %Y"))
        .map_err(|_| InvalidInputError::InvalidDate(raw.to_string()))
}

/// Parses `$1,234.56`-style amounts.
#[must_use]
pub fn parse_money(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !matches!(c, '$' | ',' | ' '))
        .collect();
    cleaned.parse().ok().filter(|v: &f64| v.is_finite())
}

fn trimmed(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

fn non_empty<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.as_deref().and_then(trimmed))
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => trimmed(&s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Reads JSON-lines records, skipping blank lines.
pub fn read_jsonl<T, R>(reader: R) -> Result<Vec<T>>
where
    T: serde::de::DeserializeOwned,
    R: BufRead,
{
    let mut items = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let item = serde_json::from_str(&line).map_err(|source| Error::Record {
            line: idx + 1,
            source,
        })?;
        items.push(item);
    }
    Ok(items)
}

pub fn write_jsonl<W: Write>(writer: &mut W, chunks: &[Chunk]) -> Result<()> {
    for chunk in chunks {
        serde_json::to_writer(&mut *writer, chunk)?;
        writer.write_all(b"\n")?;
    }
    Ok(())
}
