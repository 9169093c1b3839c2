use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::ToolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ToolName {
    #[serde(rename = "searchFlights")]
    SearchFlights,
    #[serde(rename = "selectSeats")]
    SelectSeats,
    #[serde(rename = "displayReservation")]
    DisplayReservation,
    #[serde(rename = "authorizePayment")]
    AuthorizePayment,
    #[serde(rename = "displayBoardingPass")]
    DisplayBoardingPass,
    #[serde(rename = "searchAccommodations")]
    SearchAccommodations,
    #[serde(rename = "selectAccommodation")]
    SelectAccommodation,
    #[serde(rename = "displayAccommodationConfirmation")]
    DisplayAccommodationConfirmation,
}

impl ToolName {
    pub const ALL: [ToolName; 8] = [
        ToolName::SearchFlights,
        ToolName::SelectSeats,
        ToolName::DisplayReservation,
        ToolName::AuthorizePayment,
        ToolName::DisplayBoardingPass,
        ToolName::SearchAccommodations,
        ToolName::SelectAccommodation,
        ToolName::DisplayAccommodationConfirmation,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SearchFlights => "searchFlights",
            Self::SelectSeats => "selectSeats",
            Self::DisplayReservation => "displayReservation",
            Self::AuthorizePayment => "authorizePayment",
            Self::DisplayBoardingPass => "displayBoardingPass",
            Self::SearchAccommodations => "searchAccommodations",
            Self::SelectAccommodation => "selectAccommodation",
            Self::DisplayAccommodationConfirmation => "displayAccommodationConfirmation",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|name| name.as_str() == value.trim())
    }
}

/// Semantic checks applied on top of the JSON type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Constraint {
    NonEmpty,
    IsoDate,
    IsoDateTime,
    IataCode,
    FlightNumber,
    SeatCode,
    Positive,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    String,
    Number,
    StringArray,
    Object(Vec<FieldSpec>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub kind: FieldKind,
    pub constraint: Option<Constraint>,
}

impl FieldSpec {
    fn string(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            description,
            kind: FieldKind::String,
            constraint: Some(Constraint::NonEmpty),
        }
    }

    fn constrained(name: &'static str, description: &'static str, constraint: Constraint) -> Self {
        Self {
            name,
            description,
            kind: FieldKind::String,
            constraint: Some(constraint),
        }
    }

    fn json_schema(&self) -> Value {
        let mut schema = match &self.kind {
            FieldKind::String => json!({ "type": "string" }),
            FieldKind::Number => json!({ "type": "number" }),
            FieldKind::StringArray => json!({ "type": "array", "items": { "type": "string" } }),
            FieldKind::Object(fields) => object_schema(fields),
        };

        if let Some(object) = schema.as_object_mut() {
            object.insert("description".to_string(), json!(self.description));
            match self.constraint {
                Some(Constraint::IsoDate) => {
                    object.insert("format".to_string(), json!("date"));
                }
                Some(Constraint::IsoDateTime) => {
                    object.insert("format".to_string(), json!("date-time"));
                }
                Some(Constraint::IataCode) => {
                    object.insert("pattern".to_string(), json!("^[A-Z]{3}$"));
                }
                Some(Constraint::Positive) => {
                    object.insert("exclusiveMinimum".to_string(), json!(0));
                }
                _ => {}
            }
        }

        schema
    }
}

fn object_schema(fields: &[FieldSpec]) -> Value {
    let mut properties = Map::new();
    for field in fields {
        properties.insert(field.name.to_string(), field.json_schema());
    }

    json!({
        "type": "object",
        "properties": properties,
        "required": fields.iter().map(|field| field.name).collect::<Vec<_>>(),
        "additionalProperties": false
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub name: ToolName,
    pub description: &'static str,
    pub fields: Vec<FieldSpec>,
    pub requires_identity: bool,
}

impl ToolSpec {
    pub fn parameters_schema(&self) -> Value {
        object_schema(&self.fields)
    }

    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.as_str().to_string(),
            description: self.description.to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// What the language model is shown for each tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone)]
pub struct ToolCatalog {
    specs: Vec<ToolSpec>,
}

impl Default for ToolCatalog {
    fn default() -> Self {
        Self::standard()
    }
}

impl ToolCatalog {
    pub fn standard() -> Self {
        Self {
            specs: ToolName::ALL.into_iter().map(standard_spec).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Result<&ToolSpec, ToolError> {
        let tool = ToolName::parse(name).ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;
        self.specs
            .iter()
            .find(|spec| spec.name == tool)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))
    }

    pub fn specs(&self) -> &[ToolSpec] {
        &self.specs
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.specs.iter().map(ToolSpec::definition).collect()
    }
}

fn reservation_endpoint(prefix: &'static str) -> Vec<FieldSpec> {
    let (city, code, timestamp, gate, terminal) = match prefix {
        "departure" => (
            "Name of the departure city",
            "Code of the departure airport",
            "ISO 8601 date of departure",
            "Departure gate",
            "Departure terminal",
        ),
        _ => (
            "Name of the arrival city",
            "Code of the arrival airport",
            "ISO 8601 date of arrival",
            "Arrival gate",
            "Arrival terminal",
        ),
    };

    vec![
        FieldSpec::string("cityName", city),
        FieldSpec::constrained("airportCode", code, Constraint::IataCode),
        FieldSpec::constrained("timestamp", timestamp, Constraint::IsoDateTime),
        FieldSpec::string("gate", gate),
        FieldSpec::string("terminal", terminal),
    ]
}

fn boarding_endpoint(prefix: &'static str) -> Vec<FieldSpec> {
    let airport_name = if prefix == "departure" {
        "Name of the departure airport"
    } else {
        "Name of the arrival airport"
    };
    let mut fields = reservation_endpoint(prefix);
    fields.insert(2, FieldSpec::string("airportName", airport_name));
    fields
}

fn object(name: &'static str, description: &'static str, fields: Vec<FieldSpec>) -> FieldSpec {
    FieldSpec {
        name,
        description,
        kind: FieldKind::Object(fields),
        constraint: None,
    }
}

fn standard_spec(name: ToolName) -> ToolSpec {
    match name {
        ToolName::SearchFlights => ToolSpec {
            name,
            description: "Search for flights based on the given parameters",
            fields: vec![
                FieldSpec::constrained("origin", "Origin airport iata code", Constraint::IataCode),
                FieldSpec::constrained(
                    "destination",
                    "Destination airport iata code",
                    Constraint::IataCode,
                ),
                FieldSpec::constrained(
                    "departureDate",
                    "Departure date in ISO 8601 format",
                    Constraint::IsoDate,
                ),
            ],
            requires_identity: false,
        },
        ToolName::SelectSeats => ToolSpec {
            name,
            description: "Select seats for a flight",
            fields: vec![FieldSpec::constrained(
                "flightNumber",
                "Flight number",
                Constraint::FlightNumber,
            )],
            requires_identity: false,
        },
        ToolName::DisplayReservation => ToolSpec {
            name,
            description: "Display pending reservation details",
            fields: vec![
                FieldSpec::string("offerId", "Offer ID"),
                FieldSpec {
                    name: "seats",
                    description: "Array of selected seat numbers",
                    kind: FieldKind::StringArray,
                    constraint: Some(Constraint::SeatCode),
                },
                FieldSpec::constrained("flightNumber", "Flight number", Constraint::FlightNumber),
                object("departure", "Departure details", reservation_endpoint("departure")),
                object("arrival", "Arrival details", reservation_endpoint("arrival")),
                FieldSpec::string("passengerName", "Name of the passenger"),
                FieldSpec {
                    name: "totalPriceInEuros",
                    description: "Total price in Euros including flight and seat",
                    kind: FieldKind::Number,
                    constraint: Some(Constraint::Positive),
                },
            ],
            requires_identity: true,
        },
        ToolName::AuthorizePayment => ToolSpec {
            name,
            description: "User will enter credentials to authorize payment, wait for user to respond when they are done",
            fields: vec![FieldSpec::string("offerId", "Unique identifier for the offer")],
            requires_identity: false,
        },
        ToolName::DisplayBoardingPass => ToolSpec {
            name,
            description: "Display a boarding pass",
            fields: vec![
                FieldSpec::string("reservationId", "Unique identifier for the reservation"),
                FieldSpec::string("passengerName", "Name of the passenger, in title case"),
                FieldSpec::constrained("flightNumber", "Flight number", Constraint::FlightNumber),
                FieldSpec::constrained("seat", "Seat number", Constraint::SeatCode),
                object("departure", "Departure details", boarding_endpoint("departure")),
                object("arrival", "Arrival details", boarding_endpoint("arrival")),
            ],
            requires_identity: false,
        },
        ToolName::SearchAccommodations => ToolSpec {
            name,
            description: "Search for accommodations based on the given parameters",
            fields: vec![
                FieldSpec::string("destinationCountry", "Country of the destination"),
                FieldSpec::string("destinationCity", "City of the destination"),
                FieldSpec::constrained(
                    "checkInDate",
                    "Check in date in ISO 8601 format",
                    Constraint::IsoDate,
                ),
                FieldSpec::constrained(
                    "checkOutDate",
                    "Check out date in ISO 8601 format",
                    Constraint::IsoDate,
                ),
            ],
            requires_identity: false,
        },
        ToolName::SelectAccommodation => ToolSpec {
            name,
            description: "Choose one accommodation offer and display its details",
            fields: vec![FieldSpec::string("offerId", "Accommodation offer ID")],
            requires_identity: true,
        },
        ToolName::DisplayAccommodationConfirmation => ToolSpec {
            name,
            description: "Display the booking confirmation for a paid accommodation",
            fields: vec![FieldSpec::string("offerId", "Accommodation offer ID")],
            requires_identity: false,
        },
    }
}
