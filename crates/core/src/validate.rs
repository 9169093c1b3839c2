use chrono::{DateTime, NaiveDate, NaiveDateTime};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::catalog::{Constraint, FieldKind, FieldSpec, ToolName, ToolSpec};
use crate::error::{FieldViolation, ToolError};

static IATA_CODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Z]{3}$").expect("static regex"));
static FLIGHT_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z0-9]{2}[0-9]{1,4}[A-Z]?$").expect("static regex"));
static SEAT_CODE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[1-9][0-9]?[A-F]$").expect("static regex"));

/// Checks raw model-issued arguments against the tool's contract and returns
/// the decoded JSON object. Every violation is collected, not just the first.
pub fn validate_arguments(spec: &ToolSpec, raw: &Value) -> Result<Value, ToolError> {
    let arguments = match raw {
        Value::String(encoded) => serde_json::from_str::<Value>(encoded)
            .map_err(|error| ToolError::invalid("$", format!("arguments are not valid JSON: {error}")))?,
        other => other.clone(),
    };

    let mut violations = Vec::new();
    check_object(&spec.fields, &arguments, "", &mut violations);
    if violations.is_empty() {
        check_semantics(spec.name, &arguments, &mut violations);
    }

    if violations.is_empty() {
        Ok(arguments)
    } else {
        Err(ToolError::Validation(violations))
    }
}

pub fn decode<T: DeserializeOwned>(arguments: Value) -> Result<T, ToolError> {
    serde_json::from_value(arguments)
        .map_err(|error| ToolError::invalid("$", format!("arguments do not match the contract: {error}")))
}

/// Accepts a plain `YYYY-MM-DD` date or a full ISO 8601 timestamp.
pub fn parse_iso_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .or_else(|| parse_iso_datetime(value).map(|moment| moment.date()))
}

pub fn parse_iso_datetime(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    DateTime::parse_from_rfc3339(value)
        .map(|moment| moment.naive_utc())
        .ok()
        .or_else(|| NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S").ok())
        .or_else(|| NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M").ok())
}

fn check_object(fields: &[FieldSpec], value: &Value, path: &str, violations: &mut Vec<FieldViolation>) {
    let Some(object) = value.as_object() else {
        violations.push(FieldViolation::new(
            if path.is_empty() { "$" } else { path },
            "must be an object",
        ));
        return;
    };

    for field in fields {
        let field_path = join_path(path, field.name);
        match object.get(field.name) {
            None | Some(Value::Null) => {
                violations.push(FieldViolation::new(field_path, "is required"));
            }
            Some(value) => check_field(field, value, &field_path, violations),
        }
    }

    for key in object.keys() {
        if !fields.iter().any(|field| field.name == key.as_str()) {
            violations.push(FieldViolation::new(join_path(path, key), "is not a known parameter"));
        }
    }
}

fn check_field(field: &FieldSpec, value: &Value, path: &str, violations: &mut Vec<FieldViolation>) {
    match &field.kind {
        FieldKind::String => match value.as_str() {
            Some(text) => check_constraint(field.constraint, text, path, violations),
            None => violations.push(FieldViolation::new(path, "must be a string")),
        },
        FieldKind::Number => match value.as_f64() {
            Some(number) if field.constraint == Some(Constraint::Positive) && number <= 0.0 => {
                violations.push(FieldViolation::new(path, "must be greater than zero"));
            }
            Some(_) => {}
            None => violations.push(FieldViolation::new(path, "must be a number")),
        },
        FieldKind::StringArray => match value.as_array() {
            Some(items) if items.is_empty() => {
                violations.push(FieldViolation::new(path, "must not be empty"));
            }
            Some(items) => {
                for (idx, item) in items.iter().enumerate() {
                    let item_path = format!("{path}[{idx}]");
                    match item.as_str() {
                        Some(text) => check_constraint(field.constraint, text, &item_path, violations),
                        None => violations.push(FieldViolation::new(item_path, "must be a string")),
                    }
                }
            }
            None => violations.push(FieldViolation::new(path, "must be an array of strings")),
        },
        FieldKind::Object(fields) => check_object(fields, value, path, violations),
    }
}

fn check_constraint(
    constraint: Option<Constraint>,
    text: &str,
    path: &str,
    violations: &mut Vec<FieldViolation>,
) {
    let problem = match constraint {
        None => None,
        Some(_) if text.trim().is_empty() => Some("must not be empty"),
        Some(Constraint::NonEmpty) | Some(Constraint::Positive) => None,
        Some(Constraint::IsoDate) => parse_iso_date(text)
            .is_none()
            .then_some("must be an ISO 8601 date (YYYY-MM-DD)"),
        Some(Constraint::IsoDateTime) => parse_iso_datetime(text)
            .is_none()
            .then_some("must be an ISO 8601 timestamp"),
        Some(Constraint::IataCode) => (!IATA_CODE.is_match(text))
            .then_some("must be a three-letter uppercase IATA airport code"),
        Some(Constraint::FlightNumber) => (!FLIGHT_NUMBER.is_match(text))
            .then_some("must be a flight number such as AF1234"),
        Some(Constraint::SeatCode) => (!SEAT_CODE.is_match(text))
            .then_some("must be a seat such as 12C (rows 1-99, letters A-F)"),
    };

    if let Some(message) = problem {
        violations.push(FieldViolation::new(path, message));
    }
}

fn check_semantics(tool: ToolName, arguments: &Value, violations: &mut Vec<FieldViolation>) {
    match tool {
        ToolName::SearchFlights => {
            if arguments["origin"] == arguments["destination"] {
                violations.push(FieldViolation::new(
                    "destination",
                    "must differ from origin",
                ));
            }
        }
        ToolName::SearchAccommodations => {
            let check_in = arguments["checkInDate"].as_str().and_then(parse_iso_date);
            let check_out = arguments["checkOutDate"].as_str().and_then(parse_iso_date);
            if let (Some(check_in), Some(check_out)) = (check_in, check_out) {
                if check_out <= check_in {
                    violations.push(FieldViolation::new(
                        "checkOutDate",
                        "must be after checkInDate",
                    ));
                }
            }
        }
        ToolName::DisplayReservation => {
            if let Some(seats) = arguments["seats"].as_array() {
                let mut seen = Vec::new();
                for seat in seats.iter().filter_map(Value::as_str) {
                    if seen.contains(&seat) {
                        violations.push(FieldViolation::new("seats", format!("seat {seat} is listed twice")));
                    }
                    seen.push(seat);
                }
            }
        }
        _ => {}
    }
}

fn join_path(parent: &str, field: &str) -> String {
    if parent.is_empty() {
        field.to_string()
    } else {
        format!("{parent}.{field}")
    }
}
