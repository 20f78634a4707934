//! Builders for raw source rows and configuration documents.

#![allow(dead_code)]

use serde_json::{json, Value};

/// A data-API style row (camelCase keys).
pub fn api_row(id: u64, owner: &str, year: i32) -> Value {
    json!({
        "propertyId": id,
        "ownerName": owner,
        "propertyType": "R",
        "situsAddress": format!("{} Main St", id),
        "assessmentYear": year,
        "marketValue": 250000.0,
    })
}

/// A search-page grid row keyed by column header.
pub fn grid_row(id: &str, owner: &str) -> Value {
    json!({
        "Property ID": id,
        "Owner Name": owner,
        "Market Value": "$1,234,500.00",
        "Tax Year": "2024",
    })
}

pub fn api_rows(count: u64, owner: &str) -> Vec<Value> {
    (1..=count).map(|id| api_row(id, owner, 2024)).collect()
}

/// Minimal valid YAML configuration pointing at `data_api_url`.
pub fn minimal_config_yaml(data_api_url: &str) -> String {
    format!(
        r#"
version: "1.0"
source:
  data_api_url: "{data_api_url}"
  search_page_url: "https://records.example.com/search"
"#
    )
}
