use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ToolFailure;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub call_id: String,
    pub name: String,
    /// Either a JSON object or a string holding encoded JSON, as models emit both.
    pub arguments: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ConversationMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: text.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn assistant(text: impl Into<String>, tool_calls: Vec<ToolCallRequest>) -> Self {
        Self {
            role: Role::Assistant,
            content: text.into(),
            tool_calls,
            tool_call_id: None,
        }
    }

    pub fn tool_result(invocation: &ToolInvocation) -> Self {
        Self {
            role: Role::Tool,
            content: invocation.result_payload().to_string(),
            tool_calls: Vec::new(),
            tool_call_id: Some(invocation.call_id.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSession {
    pub session_id: String,
    pub user_id: Option<String>,
    pub messages: Vec<ConversationMessage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ConversationSession {
    pub fn new(session_id: impl Into<String>, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: None,
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
            expires_at: now + ttl,
        }
    }

    /// Folds the client-held conversation into the stored history.
    ///
    /// When the incoming messages repeat the stored history as a prefix only the
    /// tail is appended; otherwise every incoming message is treated as new.
    /// Returns the number of appended messages.
    pub fn absorb(&mut self, incoming: &[ConversationMessage]) -> usize {
        let stored = self.messages.len();
        let is_replay = incoming.len() >= stored
            && stored > 0
            && incoming[..stored]
                .iter()
                .zip(&self.messages)
                .all(|(lhs, rhs)| lhs.role == rhs.role && lhs.content == rhs.content);

        let fresh = if is_replay {
            &incoming[stored..]
        } else {
            incoming
        };

        self.messages.extend(fresh.iter().cloned());
        fresh.len()
    }

    pub fn touch(&mut self, now: DateTime<Utc>, ttl: Duration) {
        self.updated_at = now;
        self.expires_at = now + ttl;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InvocationOutcome {
    Succeeded { result: Value },
    Failed { failure: ToolFailure },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub call_id: String,
    pub tool_name: String,
    pub arguments: Value,
    pub outcome: InvocationOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ToolInvocation {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, InvocationOutcome::Succeeded { .. })
    }

    pub fn failure(&self) -> Option<&ToolFailure> {
        match &self.outcome {
            InvocationOutcome::Failed { failure } => Some(failure),
            InvocationOutcome::Succeeded { .. } => None,
        }
    }

    /// The shape handed back to the language model as the tool message body.
    pub fn result_payload(&self) -> Value {
        match &self.outcome {
            InvocationOutcome::Succeeded { result } => result.clone(),
            InvocationOutcome::Failed { failure } => serde_json::json!({ "error": failure }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlightEndpoint {
    pub city_name: String,
    pub airport_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub airport_name: Option<String>,
    pub timestamp: String,
    pub gate: String,
    pub terminal: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlightOffer {
    pub offer_id: String,
    pub flight_number: String,
    pub airline: String,
    pub departure: FlightEndpoint,
    pub arrival: FlightEndpoint,
    pub cabin_class: String,
    pub price_in_euros: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeatPosition {
    Window,
    Middle,
    Aisle,
}

impl SeatPosition {
    pub fn from_letter(letter: char) -> Option<Self> {
        match letter {
            'A' | 'F' => Some(Self::Window),
            'B' | 'E' => Some(Self::Middle),
            'C' | 'D' => Some(Self::Aisle),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Seat {
    pub seat_number: String,
    pub position: SeatPosition,
    pub price_in_euros: f64,
    pub available: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeatMap {
    pub flight_number: String,
    pub seats: Vec<Seat>,
}

impl SeatMap {
    pub fn seat(&self, seat_number: &str) -> Option<&Seat> {
        self.seats
            .iter()
            .find(|seat| seat.seat_number.eq_ignore_ascii_case(seat_number))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LodgingOffer {
    pub offer_id: String,
    pub name: String,
    pub address: String,
    pub city: String,
    pub country: String,
    pub star_rating: u8,
    pub check_in_date: NaiveDate,
    pub check_out_date: NaiveDate,
    pub nights: u32,
    pub price_per_night_in_euros: f64,
    pub total_price_in_euros: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlightSearchQuery {
    pub origin: String,
    pub destination: String,
    pub departure_date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LodgingSearchQuery {
    pub destination_country: String,
    pub destination_city: String,
    pub check_in_date: NaiveDate,
    pub check_out_date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationDraft {
    pub offer_id: String,
    pub flight_number: String,
    pub seats: Vec<String>,
    pub departure: FlightEndpoint,
    pub arrival: FlightEndpoint,
    pub passenger_name: String,
    pub total_price_in_euros: f64,
    #[serde(skip)]
    pub owner: Option<Identity>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Approved,
    Declined,
}

impl PaymentStatus {
    pub fn as_code(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Declined => "declined",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "declined" => Some(Self::Declined),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeclineReason {
    Consent,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentAuthorization {
    pub offer_id: String,
    pub status: PaymentStatus,
    pub opened_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
    pub decline_reason: Option<DeclineReason>,
}

impl PaymentAuthorization {
    pub fn pending(offer_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            offer_id: offer_id.into(),
            status: PaymentStatus::Pending,
            opened_at: now,
            decided_at: None,
            decline_reason: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentDecision {
    Approved,
    Declined,
}

impl From<bool> for ConsentDecision {
    fn from(approved: bool) -> Self {
        if approved {
            Self::Approved
        } else {
            Self::Declined
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardingPass {
    pub reservation_id: String,
    pub passenger_name: String,
    pub flight_number: String,
    pub seat: String,
    pub departure: FlightEndpoint,
    pub arrival: FlightEndpoint,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccommodationConfirmation {
    pub offer_id: String,
    pub confirmation_code: String,
    pub name: String,
    pub address: String,
    pub city: String,
    pub country: String,
    pub check_in_date: NaiveDate,
    pub check_out_date: NaiveDate,
    pub total_price_in_euros: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingKind {
    Flight,
    Accommodation,
}

impl BookingKind {
    pub fn as_code(self) -> &'static str {
        match self {
            Self::Flight => "flight",
            Self::Accommodation => "accommodation",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "flight" => Some(Self::Flight),
            "accommodation" | "hotel" => Some(Self::Accommodation),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookingRecord {
    pub booking_id: String,
    pub user_id: String,
    pub kind: BookingKind,
    pub payment_status: PaymentStatus,
    pub total_amount: f64,
    pub currency: String,
    pub starting_date: String,
    pub ending_date: String,
    pub origin: String,
    pub destination: String,
    pub details: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    Timeout,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEventKind {
    TextDelta { text: String },
    ToolCall { call: ToolCallRequest },
    ToolResult { invocation: ToolInvocation },
    Error { message: String },
    Finish { reason: FinishReason },
}

impl StreamEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::TextDelta { .. } => "text_delta",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
            Self::Error { .. } => "error",
            Self::Finish { .. } => "finish",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub seq: u64,
    #[serde(flatten)]
    pub kind: StreamEventKind,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchFlightsArgs {
    pub origin: String,
    pub destination: String,
    pub departure_date: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectSeatsArgs {
    pub flight_number: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayReservationArgs {
    pub offer_id: String,
    pub seats: Vec<String>,
    pub flight_number: String,
    pub departure: FlightEndpoint,
    pub arrival: FlightEndpoint,
    pub passenger_name: String,
    pub total_price_in_euros: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferArgs {
    pub offer_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayBoardingPassArgs {
    pub reservation_id: String,
    pub passenger_name: String,
    pub flight_number: String,
    pub seat: String,
    pub departure: FlightEndpoint,
    pub arrival: FlightEndpoint,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchAccommodationsArgs {
    pub destination_country: String,
    pub destination_city: String,
    pub check_in_date: String,
    pub check_out_date: String,
}
