//! Normalisation of raw source rows into [`ResultRecord`]s.
//!
//! The data API and the search page grid name the same columns differently
//! (`propertyId`, `prop_id`, `Property ID`), so keys are folded to lowercase
//! alphanumerics before matching.

use chrono::Datelike;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A normalised property observation.
///
/// `(external_id, assessment_year)` is the persistence key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub external_id: String,
    pub assessment_year: i32,
    pub owner_name: Option<String>,
    pub property_type: Option<String>,
    pub street_address: Option<String>,
    pub city: Option<String>,
    pub postal_code: Option<String>,
    pub appraised_value: Option<f64>,
    pub market_value: Option<f64>,
    pub geo_id: Option<String>,
    pub legal_description: Option<String>,
    /// The term whose search discovered this record.
    pub search_term: String,
}

/// Records produced from a batch of raw rows.
#[derive(Debug, Default)]
pub struct Normalized {
    pub records: Vec<ResultRecord>,
    /// Rows dropped because they carried no external identifier.
    pub skipped: usize,
}

const EXTERNAL_ID_KEYS: &[&str] = &[
    "propertyid",
    "propid",
    "externalid",
    "accountnumber",
    "account",
    "pid",
    "id",
];
const YEAR_KEYS: &[&str] = &["assessmentyear", "taxyear", "propyear", "year"];
const OWNER_KEYS: &[&str] = &["ownername", "owner", "name"];
const TYPE_KEYS: &[&str] = &["propertytype", "proptype", "type"];
const ADDRESS_KEYS: &[&str] = &["streetaddress", "situsaddress", "situs", "address"];
const CITY_KEYS: &[&str] = &["city", "situscity"];
const POSTAL_KEYS: &[&str] = &["postalcode", "zipcode", "situszip", "zip"];
const APPRAISED_KEYS: &[&str] = &["appraisedvalue", "appraisedval", "appraised"];
const MARKET_KEYS: &[&str] = &["marketvalue", "marketval", "market"];
const GEO_KEYS: &[&str] = &["geoid", "geographicid"];
const LEGAL_KEYS: &[&str] = &["legaldescription", "legaldesc", "legal"];

/// Normalises raw rows for `search_term`. Rows that are not objects or have
/// no identifier are skipped. A missing year falls back to `default_year`.
pub fn normalize_rows(rows: &[Value], search_term: &str, default_year: i32) -> Normalized {
    let mut out = Normalized::default();
    for row in rows {
        let record = row
            .as_object()
            .and_then(|obj| normalize_row(obj, search_term, default_year));
        match record {
            Some(record) => out.records.push(record),
            None => out.skipped += 1,
        }
    }
    out
}

/// The year used when a row does not carry one.
pub fn current_assessment_year() -> i32 {
    chrono::Utc::now().year()
}

fn normalize_row(
    obj: &Map<String, Value>,
    search_term: &str,
    default_year: i32,
) -> Option<ResultRecord> {
    let folded: Vec<(String, &Value)> = obj.iter().map(|(k, v)| (fold_key(k), v)).collect();
    let lookup = |keys: &[&str]| {
        keys.iter().find_map(|key| {
            folded
                .iter()
                .find(|(k, v)| k == key && !v.is_null())
                .map(|(_, v)| *v)
        })
    };

    let external_id = lookup(EXTERNAL_ID_KEYS).and_then(text)?;
    let assessment_year = lookup(YEAR_KEYS).and_then(year).unwrap_or(default_year);

    Some(ResultRecord {
        external_id,
        assessment_year,
        owner_name: lookup(OWNER_KEYS).and_then(text),
        property_type: lookup(TYPE_KEYS).and_then(text),
        street_address: lookup(ADDRESS_KEYS).and_then(text),
        city: lookup(CITY_KEYS).and_then(text),
        postal_code: lookup(POSTAL_KEYS).and_then(text),
        appraised_value: lookup(APPRAISED_KEYS).and_then(money),
        market_value: lookup(MARKET_KEYS).and_then(money),
        geo_id: lookup(GEO_KEYS).and_then(text),
        legal_description: lookup(LEGAL_KEYS).and_then(text),
        search_term: search_term.to_string(),
    })
}

fn fold_key(key: &str) -> String {
    key.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

fn text(value: &Value) -> Option<String> {
    let s = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    (!s.is_empty()).then_some(s)
}

fn year(value: &Value) -> Option<i32> {
    match value {
        Value::Number(n) => n.as_i64().and_then(|y| i32::try_from(y).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Parses numbers and currency strings such as `"$1,234,500.00"`.
fn money(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let cleaned: String = s
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
                .collect();
            cleaned.parse().ok()
        }
        _ => None,
    }
}
