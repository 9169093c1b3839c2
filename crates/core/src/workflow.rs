//! Per-conversation booking state machines.
//!
//! Every flight leg walks `Searched → SeatSelected → Reserved → PaymentPending →
//! {PaymentApproved | PaymentDeclined} → BoardingPassIssued`, and every lodging
//! offer walks `Requested → Selected → PaymentPending → {Confirmed | Declined}`.
//! The dispatcher asks the sequencer to *admit* a call before running its
//! handler and *commits* the resulting transition afterwards. State is
//! partitioned per session; sessions never share a lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

use crate::error::{FieldViolation, ToolError};
use crate::models::{
    AccommodationConfirmation, BoardingPass, BookingKind, BookingRecord, ConsentDecision,
    DeclineReason, DisplayBoardingPassArgs, DisplayReservationArgs, FlightEndpoint, FlightOffer,
    Identity, LodgingOffer, PaymentAuthorization, PaymentStatus, ReservationDraft, SeatMap,
};

const PRICE_TOLERANCE_EUROS: f64 = 0.01;
pub const DEFAULT_PENDING_TTL_MINUTES: i64 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LegStage {
    Searched,
    SeatSelected,
    Reserved,
    PaymentPending,
    PaymentApproved,
    PaymentDeclined,
    BoardingPassIssued,
}

impl LegStage {
    pub fn as_code(self) -> &'static str {
        match self {
            Self::Searched => "searched",
            Self::SeatSelected => "seat_selected",
            Self::Reserved => "reserved",
            Self::PaymentPending => "payment_pending",
            Self::PaymentApproved => "payment_approved",
            Self::PaymentDeclined => "payment_declined",
            Self::BoardingPassIssued => "boarding_pass_issued",
        }
    }

    fn is_before_reservation(self) -> bool {
        matches!(self, Self::Searched | Self::SeatSelected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StayStage {
    Requested,
    Selected,
    PaymentPending,
    Declined,
    Confirmed,
}

impl StayStage {
    pub fn as_code(self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Selected => "selected",
            Self::PaymentPending => "payment_pending",
            Self::Declined => "declined",
            Self::Confirmed => "confirmed",
        }
    }
}

/// Liveness handle for one conversation turn. Transitions carrying a token
/// whose turn has been finalized are refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnToken {
    session_id: String,
    turn: u64,
}

impl TurnToken {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn turn(&self) -> u64 {
        self.turn
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommitError {
    #[error("turn {turn} of session {session_id} was already finalized")]
    StaleTurn { session_id: String, turn: u64 },
    #[error("{0}")]
    Conflict(String),
}

/// A successful tool execution, expressed as the state change it causes.
#[derive(Debug, Clone)]
pub enum Transition {
    FlightsFound(Vec<FlightOffer>),
    SeatsSelected(SeatMap),
    Reserved(ReservationDraft),
    PaymentRequested { offer_id: String },
    BoardingPassIssued { offer_id: String },
    StaysFound(Vec<LodgingOffer>),
    StaySelected { offer_id: String, owner: Identity },
}

impl Transition {
    pub fn label(&self) -> &'static str {
        match self {
            Self::FlightsFound(_) => "flights_found",
            Self::SeatsSelected(_) => "seats_selected",
            Self::Reserved(_) => "reserved",
            Self::PaymentRequested { .. } => "payment_requested",
            Self::BoardingPassIssued { .. } => "boarding_pass_issued",
            Self::StaysFound(_) => "stays_found",
            Self::StaySelected { .. } => "stay_selected",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentAcknowledgement {
    pub offer_id: String,
    pub kind: BookingKind,
    pub status: PaymentStatus,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LegSnapshot {
    pub flight_number: String,
    pub offer_id: String,
    pub stage: LegStage,
    pub payment: Option<PaymentAuthorization>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StaySnapshot {
    pub offer_id: String,
    pub stage: StayStage,
    pub payment: Option<PaymentAuthorization>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkflowSnapshot {
    pub legs: Vec<LegSnapshot>,
    pub stays: Vec<StaySnapshot>,
}

#[derive(Debug, Clone)]
struct FlightLeg {
    offer: FlightOffer,
    stage: LegStage,
    seat_map: Option<SeatMap>,
    reservation: Option<ReservationDraft>,
    payment: Option<PaymentAuthorization>,
}

#[derive(Debug, Clone)]
struct Stay {
    offer: LodgingOffer,
    stage: StayStage,
    owner: Option<Identity>,
    payment: Option<PaymentAuthorization>,
}

#[derive(Debug, Default)]
struct SessionWorkflow {
    legs: BTreeMap<String, FlightLeg>,
    // offer id -> flight number, bound when a leg is reserved
    reserved_offers: HashMap<String, String>,
    stays: BTreeMap<String, Stay>,
    live_turn: Option<u64>,
    turns_started: u64,
}

impl SessionWorkflow {
    fn expire_pending(&mut self, now: DateTime<Utc>, ttl: Duration) {
        for leg in self.legs.values_mut() {
            if let Some(payment) = leg.payment.as_mut() {
                if expire(payment, now, ttl) {
                    leg.stage = LegStage::PaymentDeclined;
                }
            }
        }

        for stay in self.stays.values_mut() {
            if let Some(payment) = stay.payment.as_mut() {
                if expire(payment, now, ttl) {
                    stay.stage = StayStage::Declined;
                }
            }
        }
    }

    fn reserved_leg(&self, offer_id: &str) -> Option<&FlightLeg> {
        self.reserved_offers
            .get(offer_id)
            .and_then(|flight_number| self.legs.get(flight_number))
    }

    fn reserved_leg_mut(&mut self, offer_id: &str) -> Option<&mut FlightLeg> {
        let flight_number = self.reserved_offers.get(offer_id)?;
        self.legs.get_mut(flight_number)
    }

    fn apply(&mut self, transition: Transition, now: DateTime<Utc>) -> Result<(), CommitError> {
        match transition {
            Transition::FlightsFound(offers) => {
                for offer in offers {
                    match self.legs.get_mut(&offer.flight_number) {
                        Some(leg) if leg.stage.is_before_reservation() => leg.offer = offer,
                        Some(_) => {}
                        None => {
                            self.legs.insert(
                                offer.flight_number.clone(),
                                FlightLeg {
                                    offer,
                                    stage: LegStage::Searched,
                                    seat_map: None,
                                    reservation: None,
                                    payment: None,
                                },
                            );
                        }
                    }
                }
            }
            Transition::SeatsSelected(seat_map) => {
                let leg = self
                    .legs
                    .get_mut(&seat_map.flight_number)
                    .filter(|leg| leg.stage.is_before_reservation())
                    .ok_or_else(|| {
                        CommitError::Conflict(format!(
                            "flight {} can no longer change seats",
                            seat_map.flight_number
                        ))
                    })?;
                leg.seat_map = Some(seat_map);
                leg.stage = LegStage::SeatSelected;
            }
            Transition::Reserved(draft) => {
                if let Some(bound) = self.reserved_offers.get(&draft.offer_id) {
                    if bound != &draft.flight_number {
                        return Err(CommitError::Conflict(format!(
                            "offer {} is already bound to flight {bound}",
                            draft.offer_id
                        )));
                    }
                }
                let leg = self
                    .legs
                    .get_mut(&draft.flight_number)
                    .filter(|leg| leg.stage == LegStage::SeatSelected)
                    .ok_or_else(|| {
                        CommitError::Conflict(format!(
                            "flight {} is no longer awaiting a reservation",
                            draft.flight_number
                        ))
                    })?;
                leg.payment = Some(PaymentAuthorization::pending(draft.offer_id.clone(), now));
                leg.stage = LegStage::Reserved;
                self.reserved_offers
                    .insert(draft.offer_id.clone(), draft.flight_number.clone());
                leg.reservation = Some(draft);
            }
            Transition::PaymentRequested { offer_id } => {
                if let Some(leg) = self.reserved_leg_mut(&offer_id) {
                    if !matches!(leg.stage, LegStage::Reserved | LegStage::PaymentPending) {
                        return Err(CommitError::Conflict(format!(
                            "offer {offer_id} is {} and cannot await payment",
                            leg.stage.as_code()
                        )));
                    }
                    reopen(&mut leg.payment, &offer_id, now);
                    leg.stage = LegStage::PaymentPending;
                } else if let Some(stay) = self.stays.get_mut(&offer_id) {
                    if !matches!(stay.stage, StayStage::Selected | StayStage::PaymentPending) {
                        return Err(CommitError::Conflict(format!(
                            "accommodation {offer_id} is {} and cannot await payment",
                            stay.stage.as_code()
                        )));
                    }
                    reopen(&mut stay.payment, &offer_id, now);
                    stay.stage = StayStage::PaymentPending;
                } else {
                    return Err(CommitError::Conflict(format!("offer {offer_id} is unknown")));
                }
            }
            Transition::BoardingPassIssued { offer_id } => {
                let leg = self
                    .reserved_leg_mut(&offer_id)
                    .filter(|leg| leg.stage == LegStage::PaymentApproved)
                    .ok_or_else(|| {
                        CommitError::Conflict(format!(
                            "offer {offer_id} is no longer approved for a boarding pass"
                        ))
                    })?;
                leg.stage = LegStage::BoardingPassIssued;
            }
            Transition::StaysFound(offers) => {
                for offer in offers {
                    match self.stays.get_mut(&offer.offer_id) {
                        Some(stay) if stay.stage == StayStage::Requested => stay.offer = offer,
                        Some(_) => {}
                        None => {
                            self.stays.insert(
                                offer.offer_id.clone(),
                                Stay {
                                    offer,
                                    stage: StayStage::Requested,
                                    owner: None,
                                    payment: None,
                                },
                            );
                        }
                    }
                }
            }
            Transition::StaySelected { offer_id, owner } => {
                let stay = self
                    .stays
                    .get_mut(&offer_id)
                    .filter(|stay| matches!(stay.stage, StayStage::Requested | StayStage::Selected))
                    .ok_or_else(|| {
                        CommitError::Conflict(format!(
                            "accommodation {offer_id} can no longer be selected"
                        ))
                    })?;
                stay.owner = Some(owner);
                stay.stage = StayStage::Selected;
            }
        }

        Ok(())
    }
}

fn expire(payment: &mut PaymentAuthorization, now: DateTime<Utc>, ttl: Duration) -> bool {
    if payment.status == PaymentStatus::Pending && now - payment.opened_at > ttl {
        payment.status = PaymentStatus::Declined;
        payment.decided_at = Some(now);
        payment.decline_reason = Some(DeclineReason::Expired);
        return true;
    }
    false
}

fn reopen(payment: &mut Option<PaymentAuthorization>, offer_id: &str, now: DateTime<Utc>) {
    match payment {
        Some(existing) if existing.status == PaymentStatus::Pending => existing.opened_at = now,
        _ => *payment = Some(PaymentAuthorization::pending(offer_id, now)),
    }
}

fn declined_phrase(payment: Option<&PaymentAuthorization>) -> &'static str {
    match payment.and_then(|payment| payment.decline_reason) {
        Some(DeclineReason::Expired) => "expired before consent was given",
        _ => "declined",
    }
}

fn round_cents(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}

fn title_case(name: &str) -> String {
    name.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first
                    .to_uppercase()
                    .chain(chars.flat_map(char::to_lowercase))
                    .collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn endpoint_for_pass(canonical: &FlightEndpoint, supplied: &FlightEndpoint) -> FlightEndpoint {
    FlightEndpoint {
        airport_name: canonical
            .airport_name
            .clone()
            .or_else(|| supplied.airport_name.clone()),
        ..canonical.clone()
    }
}

fn check_airports(
    departure: &FlightEndpoint,
    arrival: &FlightEndpoint,
    offer: &FlightOffer,
    violations: &mut Vec<FieldViolation>,
) {
    if departure.airport_code != offer.departure.airport_code {
        violations.push(FieldViolation::new(
            "departure.airportCode",
            format!(
                "does not match flight {} (expected {})",
                offer.flight_number, offer.departure.airport_code
            ),
        ));
    }
    if arrival.airport_code != offer.arrival.airport_code {
        violations.push(FieldViolation::new(
            "arrival.airportCode",
            format!(
                "does not match flight {} (expected {})",
                offer.flight_number, offer.arrival.airport_code
            ),
        ));
    }
}

pub struct WorkflowSequencer {
    sessions: RwLock<HashMap<String, Arc<Mutex<SessionWorkflow>>>>,
    pending_ttl: Duration,
}

impl Default for WorkflowSequencer {
    fn default() -> Self {
        Self::new(Duration::minutes(DEFAULT_PENDING_TTL_MINUTES))
    }
}

impl WorkflowSequencer {
    pub fn new(pending_ttl: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            pending_ttl,
        }
    }

    pub fn pending_ttl(&self) -> Duration {
        self.pending_ttl
    }

    fn session(&self, session_id: &str) -> Arc<Mutex<SessionWorkflow>> {
        if let Some(existing) = self.sessions.read().get(session_id) {
            return existing.clone();
        }
        self.sessions
            .write()
            .entry(session_id.to_string())
            .or_default()
            .clone()
    }

    pub fn begin_turn(&self, session_id: &str) -> TurnToken {
        let workflow = self.session(session_id);
        let mut workflow = workflow.lock();
        workflow.turns_started += 1;
        workflow.live_turn = Some(workflow.turns_started);
        TurnToken {
            session_id: session_id.to_string(),
            turn: workflow.turns_started,
        }
    }

    pub fn finalize_turn(&self, token: &TurnToken) {
        let workflow = self.session(&token.session_id);
        let mut workflow = workflow.lock();
        if workflow.live_turn == Some(token.turn) {
            workflow.live_turn = None;
        }
    }

    pub fn is_live(&self, token: &TurnToken) -> bool {
        self.session(&token.session_id).lock().live_turn == Some(token.turn)
    }

    pub fn commit(
        &self,
        token: &TurnToken,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<(), CommitError> {
        let workflow = self.session(&token.session_id);
        let mut workflow = workflow.lock();
        if workflow.live_turn != Some(token.turn) {
            return Err(CommitError::StaleTurn {
                session_id: token.session_id.clone(),
                turn: token.turn,
            });
        }
        workflow.expire_pending(now, self.pending_ttl);
        workflow.apply(transition, now)
    }

    pub fn admit_seat_selection(&self, session_id: &str, flight_number: &str) -> Result<(), ToolError> {
        let workflow = self.session(session_id);
        let workflow = workflow.lock();
        let leg = workflow.legs.get(flight_number).ok_or_else(|| {
            ToolError::Sequence(format!(
                "flight {flight_number} was not returned by a flight search in this conversation"
            ))
        })?;

        if leg.stage.is_before_reservation() {
            Ok(())
        } else {
            Err(ToolError::Sequence(format!(
                "flight {flight_number} is already {}; seats can no longer change",
                leg.stage.as_code()
            )))
        }
    }

    /// Cross-checks a reservation against the searched offer and seat map and
    /// returns the canonical draft to echo.
    pub fn admit_reservation(
        &self,
        session_id: &str,
        args: &DisplayReservationArgs,
        owner: Identity,
        now: DateTime<Utc>,
    ) -> Result<ReservationDraft, ToolError> {
        let workflow = self.session(session_id);
        let mut workflow = workflow.lock();
        workflow.expire_pending(now, self.pending_ttl);

        if let Some(bound) = workflow.reserved_offers.get(&args.offer_id) {
            if bound != &args.flight_number {
                return Err(ToolError::Sequence(format!(
                    "offer {} is already reserved for flight {bound}; each leg needs its own offer",
                    args.offer_id
                )));
            }
        }

        let leg = workflow.legs.get(&args.flight_number).ok_or_else(|| {
            ToolError::Sequence(format!(
                "flight {} was not returned by a flight search in this conversation",
                args.flight_number
            ))
        })?;

        match leg.stage {
            LegStage::SeatSelected => {}
            LegStage::Searched => {
                return Err(ToolError::Sequence(format!(
                    "select seats for flight {} before displaying a reservation",
                    args.flight_number
                )));
            }
            other => {
                return Err(ToolError::Sequence(format!(
                    "flight {} already has a reservation ({})",
                    args.flight_number,
                    other.as_code()
                )));
            }
        }

        let mut violations = Vec::new();
        if leg.offer.offer_id != args.offer_id {
            violations.push(FieldViolation::new(
                "offerId",
                format!(
                    "does not match the offer returned for flight {} (expected {})",
                    args.flight_number, leg.offer.offer_id
                ),
            ));
        }

        let mut seat_total = 0.0;
        let mut seats = Vec::with_capacity(args.seats.len());
        if let Some(seat_map) = leg.seat_map.as_ref() {
            for (idx, requested) in args.seats.iter().enumerate() {
                match seat_map.seat(requested) {
                    Some(seat) if seat.available => {
                        seat_total += seat.price_in_euros;
                        seats.push(seat.seat_number.clone());
                    }
                    Some(_) => violations.push(FieldViolation::new(
                        format!("seats[{idx}]"),
                        format!("seat {requested} is already taken"),
                    )),
                    None => violations.push(FieldViolation::new(
                        format!("seats[{idx}]"),
                        format!("seat {requested} is not on the seat map for this flight"),
                    )),
                }
            }
        }

        let expected_total = round_cents(leg.offer.price_in_euros + seat_total);
        if violations.is_empty() && (args.total_price_in_euros - expected_total).abs() > PRICE_TOLERANCE_EUROS {
            violations.push(FieldViolation::new(
                "totalPriceInEuros",
                format!("must equal fare plus seat surcharges ({expected_total:.2})"),
            ));
        }
        check_airports(&args.departure, &args.arrival, &leg.offer, &mut violations);

        if !violations.is_empty() {
            return Err(ToolError::Validation(violations));
        }

        Ok(ReservationDraft {
            offer_id: leg.offer.offer_id.clone(),
            flight_number: leg.offer.flight_number.clone(),
            seats,
            departure: leg.offer.departure.clone(),
            arrival: leg.offer.arrival.clone(),
            passenger_name: args.passenger_name.trim().to_string(),
            total_price_in_euros: expected_total,
            owner: Some(owner),
        })
    }

    pub fn admit_payment(
        &self,
        session_id: &str,
        offer_id: &str,
        now: DateTime<Utc>,
    ) -> Result<PaymentAcknowledgement, ToolError> {
        let workflow = self.session(session_id);
        let mut workflow = workflow.lock();
        workflow.expire_pending(now, self.pending_ttl);

        if let Some(leg) = workflow.reserved_leg(offer_id) {
            return match leg.stage {
                LegStage::Reserved | LegStage::PaymentPending => Ok(PaymentAcknowledgement {
                    offer_id: offer_id.to_string(),
                    kind: BookingKind::Flight,
                    status: PaymentStatus::Pending,
                    message: "Waiting for the user to authorize payment.".to_string(),
                }),
                LegStage::PaymentDeclined => Err(ToolError::Sequence(format!(
                    "payment for offer {offer_id} {}; this leg cannot continue",
                    declined_phrase(leg.payment.as_ref())
                ))),
                other => Err(ToolError::Sequence(format!(
                    "payment for offer {offer_id} is already settled ({})",
                    other.as_code()
                ))),
            };
        }

        if let Some(stay) = workflow.stays.get(offer_id) {
            return match stay.stage {
                StayStage::Selected | StayStage::PaymentPending => Ok(PaymentAcknowledgement {
                    offer_id: offer_id.to_string(),
                    kind: BookingKind::Accommodation,
                    status: PaymentStatus::Pending,
                    message: "Waiting for the user to authorize payment.".to_string(),
                }),
                StayStage::Requested => Err(ToolError::Sequence(format!(
                    "select accommodation {offer_id} before authorizing payment"
                ))),
                StayStage::Declined => Err(ToolError::Sequence(format!(
                    "payment for accommodation {offer_id} {}",
                    declined_phrase(stay.payment.as_ref())
                ))),
                StayStage::Confirmed => Err(ToolError::Sequence(format!(
                    "accommodation {offer_id} is already paid"
                ))),
            };
        }

        Err(ToolError::Sequence(format!(
            "offer {offer_id} has no reservation or selected accommodation in this conversation"
        )))
    }

    /// Applies the out-of-band consent signal for a pending authorization.
    pub fn apply_consent(
        &self,
        session_id: &str,
        offer_id: &str,
        decision: ConsentDecision,
        actor: Option<&Identity>,
        now: DateTime<Utc>,
    ) -> Result<PaymentAuthorization, ToolError> {
        let workflow = self.session(session_id);
        let mut workflow = workflow.lock();
        workflow.expire_pending(now, self.pending_ttl);

        if let Some(leg) = workflow.reserved_leg_mut(offer_id) {
            let owner = leg.reservation.as_ref().and_then(|draft| draft.owner.as_ref());
            authorize_consent(owner, actor, offer_id)?;
            if leg.stage != LegStage::PaymentPending {
                return Err(match leg.stage {
                    LegStage::PaymentDeclined => ToolError::Sequence(format!(
                        "authorization for offer {offer_id} {}",
                        declined_phrase(leg.payment.as_ref())
                    )),
                    other => ToolError::Sequence(format!(
                        "offer {offer_id} is not awaiting payment consent ({})",
                        other.as_code()
                    )),
                });
            }
            let payment = decide(&mut leg.payment, offer_id, decision, now);
            leg.stage = match decision {
                ConsentDecision::Approved => LegStage::PaymentApproved,
                ConsentDecision::Declined => LegStage::PaymentDeclined,
            };
            return Ok(payment);
        }

        if let Some(stay) = workflow.stays.get_mut(offer_id) {
            authorize_consent(stay.owner.as_ref(), actor, offer_id)?;
            if stay.stage != StayStage::PaymentPending {
                return Err(ToolError::Sequence(format!(
                    "accommodation {offer_id} is not awaiting payment consent ({})",
                    stay.stage.as_code()
                )));
            }
            let payment = decide(&mut stay.payment, offer_id, decision, now);
            stay.stage = match decision {
                ConsentDecision::Approved => StayStage::Confirmed,
                ConsentDecision::Declined => StayStage::Declined,
            };
            return Ok(payment);
        }

        Err(ToolError::Sequence(format!(
            "offer {offer_id} has no pending payment in this conversation"
        )))
    }

    /// Gates the boarding pass on an exactly-approved authorization and builds
    /// the pass from the canonical reservation.
    pub fn admit_boarding_pass(
        &self,
        session_id: &str,
        args: &DisplayBoardingPassArgs,
        now: DateTime<Utc>,
    ) -> Result<(BoardingPass, BookingRecord), ToolError> {
        let workflow = self.session(session_id);
        let mut workflow = workflow.lock();
        workflow.expire_pending(now, self.pending_ttl);

        let offer_id = args.reservation_id.as_str();
        let leg = workflow.reserved_leg(offer_id).ok_or_else(|| {
            ToolError::Sequence(format!(
                "no reservation was recorded for offer {offer_id}; a boarding pass requires an approved payment"
            ))
        })?;

        let blocked = |reason: String| {
            ToolError::Sequence(format!("boarding pass for offer {offer_id} is blocked: {reason}"))
        };
        match leg.stage {
            LegStage::PaymentApproved => {}
            LegStage::Reserved => return Err(blocked("payment has not been requested".to_string())),
            LegStage::PaymentPending => return Err(blocked("payment is awaiting consent".to_string())),
            LegStage::PaymentDeclined => {
                return Err(blocked(format!("payment {}", declined_phrase(leg.payment.as_ref()))))
            }
            LegStage::BoardingPassIssued => {
                return Err(blocked("a boarding pass was already issued".to_string()))
            }
            other => return Err(blocked(format!("leg is {}", other.as_code()))),
        }

        let reservation = leg
            .reservation
            .as_ref()
            .ok_or_else(|| blocked("reservation details are missing".to_string()))?;
        let owner = reservation
            .owner
            .as_ref()
            .ok_or_else(|| blocked("reservation has no owner".to_string()))?;

        let mut violations = Vec::new();
        if args.flight_number != reservation.flight_number {
            violations.push(FieldViolation::new(
                "flightNumber",
                format!("reservation {offer_id} is for flight {}", reservation.flight_number),
            ));
        }
        if !args
            .passenger_name
            .trim()
            .eq_ignore_ascii_case(&reservation.passenger_name)
        {
            violations.push(FieldViolation::new(
                "passengerName",
                format!("reservation {offer_id} is for {}", reservation.passenger_name),
            ));
        }
        let seat = reservation
            .seats
            .iter()
            .find(|seat| seat.eq_ignore_ascii_case(args.seat.trim()))
            .cloned();
        if seat.is_none() {
            violations.push(FieldViolation::new(
                "seat",
                format!("reserved seats are {}", reservation.seats.join(", ")),
            ));
        }
        check_airports(&args.departure, &args.arrival, &leg.offer, &mut violations);

        let Some(seat) = seat.filter(|_| violations.is_empty()) else {
            return Err(ToolError::Validation(violations));
        };

        let pass = BoardingPass {
            reservation_id: offer_id.to_string(),
            passenger_name: title_case(&reservation.passenger_name),
            flight_number: reservation.flight_number.clone(),
            seat,
            departure: endpoint_for_pass(&reservation.departure, &args.departure),
            arrival: endpoint_for_pass(&reservation.arrival, &args.arrival),
        };

        let booking = BookingRecord {
            booking_id: offer_id.to_string(),
            user_id: owner.user_id.clone(),
            kind: BookingKind::Flight,
            payment_status: PaymentStatus::Approved,
            total_amount: reservation.total_price_in_euros,
            currency: "EUR".to_string(),
            starting_date: reservation.departure.timestamp.clone(),
            ending_date: reservation.arrival.timestamp.clone(),
            origin: reservation.departure.city_name.clone(),
            destination: reservation.arrival.city_name.clone(),
            details: json!({
                "flightNumber": reservation.flight_number,
                "airline": leg.offer.airline,
                "seats": reservation.seats,
                "passengerName": pass.passenger_name,
            }),
            created_at: now,
        };

        Ok((pass, booking))
    }

    pub fn admit_accommodation_selection(
        &self,
        session_id: &str,
        offer_id: &str,
    ) -> Result<LodgingOffer, ToolError> {
        let workflow = self.session(session_id);
        let workflow = workflow.lock();
        let stay = workflow.stays.get(offer_id).ok_or_else(|| {
            ToolError::Sequence(format!(
                "accommodation offer {offer_id} was not returned by an accommodation search"
            ))
        })?;

        match stay.stage {
            StayStage::Requested | StayStage::Selected => Ok(stay.offer.clone()),
            other => Err(ToolError::Sequence(format!(
                "accommodation {offer_id} is already {}",
                other.as_code()
            ))),
        }
    }

    pub fn admit_accommodation_confirmation(
        &self,
        session_id: &str,
        offer_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(AccommodationConfirmation, BookingRecord), ToolError> {
        let workflow = self.session(session_id);
        let mut workflow = workflow.lock();
        workflow.expire_pending(now, self.pending_ttl);

        let stay = workflow.stays.get(offer_id).ok_or_else(|| {
            ToolError::Sequence(format!(
                "accommodation offer {offer_id} was not returned by an accommodation search"
            ))
        })?;
        if stay.stage != StayStage::Confirmed {
            return Err(ToolError::Sequence(format!(
                "confirmation for accommodation {offer_id} is blocked: payment is {}",
                match stay.stage {
                    StayStage::Declined => declined_phrase(stay.payment.as_ref()),
                    StayStage::PaymentPending => "awaiting consent",
                    _ => "not requested",
                }
            )));
        }
        let owner = stay.owner.as_ref().ok_or_else(|| {
            ToolError::Sequence(format!("accommodation {offer_id} has no owner"))
        })?;

        let offer = &stay.offer;
        let confirmation = AccommodationConfirmation {
            offer_id: offer.offer_id.clone(),
            confirmation_code: format!("CNF-{}", offer.offer_id.to_uppercase()),
            name: offer.name.clone(),
            address: offer.address.clone(),
            city: offer.city.clone(),
            country: offer.country.clone(),
            check_in_date: offer.check_in_date,
            check_out_date: offer.check_out_date,
            total_price_in_euros: offer.total_price_in_euros,
        };

        let booking = BookingRecord {
            booking_id: offer.offer_id.clone(),
            user_id: owner.user_id.clone(),
            kind: BookingKind::Accommodation,
            payment_status: PaymentStatus::Approved,
            total_amount: offer.total_price_in_euros,
            currency: "EUR".to_string(),
            starting_date: offer.check_in_date.to_string(),
            ending_date: offer.check_out_date.to_string(),
            origin: offer.city.clone(),
            destination: offer.city.clone(),
            details: json!({
                "name": offer.name,
                "address": offer.address,
                "country": offer.country,
                "starRating": offer.star_rating,
                "nights": offer.nights,
                "confirmationCode": confirmation.confirmation_code,
            }),
            created_at: now,
        };

        Ok((confirmation, booking))
    }

    pub fn leg_stage(&self, session_id: &str, flight_number: &str) -> Option<LegStage> {
        let workflow = self.session(session_id);
        let workflow = workflow.lock();
        workflow.legs.get(flight_number).map(|leg| leg.stage)
    }

    pub fn stay_stage(&self, session_id: &str, offer_id: &str) -> Option<StayStage> {
        let workflow = self.session(session_id);
        let workflow = workflow.lock();
        workflow.stays.get(offer_id).map(|stay| stay.stage)
    }

    pub fn snapshot(&self, session_id: &str, now: DateTime<Utc>) -> WorkflowSnapshot {
        let Some(workflow) = self.sessions.read().get(session_id).cloned() else {
            return WorkflowSnapshot::default();
        };
        let mut workflow = workflow.lock();
        workflow.expire_pending(now, self.pending_ttl);

        WorkflowSnapshot {
            legs: workflow
                .legs
                .iter()
                .map(|(flight_number, leg)| LegSnapshot {
                    flight_number: flight_number.clone(),
                    offer_id: leg.offer.offer_id.clone(),
                    stage: leg.stage,
                    payment: leg.payment.clone(),
                })
                .collect(),
            stays: workflow
                .stays
                .iter()
                .map(|(offer_id, stay)| StaySnapshot {
                    offer_id: offer_id.clone(),
                    stage: stay.stage,
                    payment: stay.payment.clone(),
                })
                .collect(),
        }
    }

    /// Returns an issued leg to `PaymentApproved` when its booking could not
    /// be stored. Applies regardless of turn liveness.
    pub fn withdraw_boarding_pass(&self, session_id: &str, offer_id: &str) -> bool {
        let Some(workflow) = self.sessions.read().get(session_id).cloned() else {
            return false;
        };
        let mut workflow = workflow.lock();
        match workflow.reserved_leg_mut(offer_id) {
            Some(leg) if leg.stage == LegStage::BoardingPassIssued => {
                leg.stage = LegStage::PaymentApproved;
                true
            }
            _ => false,
        }
    }

    /// User ids that own a reservation or a selected stay in the session.
    pub fn owners(&self, session_id: &str) -> Vec<String> {
        let Some(workflow) = self.sessions.read().get(session_id).cloned() else {
            return Vec::new();
        };
        let workflow = workflow.lock();
        let legs = workflow
            .legs
            .values()
            .filter_map(|leg| leg.reservation.as_ref().and_then(|draft| draft.owner.as_ref()));
        let stays = workflow.stays.values().filter_map(|stay| stay.owner.as_ref());

        let mut owners: Vec<String> = legs.chain(stays).map(|owner| owner.user_id.clone()).collect();
        owners.sort();
        owners.dedup();
        owners
    }

    pub fn evict(&self, session_id: &str) -> bool {
        self.sessions.write().remove(session_id).is_some()
    }
}

/// Only the user who reserved an offer may decide its payment.
fn authorize_consent(
    owner: Option<&Identity>,
    actor: Option<&Identity>,
    offer_id: &str,
) -> Result<(), ToolError> {
    let Some(actor) = actor else {
        return Err(ToolError::Authorization(format!(
            "sign in to approve or decline the payment for offer {offer_id}"
        )));
    };
    match owner {
        Some(owner) if owner.user_id == actor.user_id => Ok(()),
        _ => Err(ToolError::Authorization(format!(
            "offer {offer_id} was reserved by another user"
        ))),
    }
}

fn decide(
    payment: &mut Option<PaymentAuthorization>,
    offer_id: &str,
    decision: ConsentDecision,
    now: DateTime<Utc>,
) -> PaymentAuthorization {
    let payment = payment.get_or_insert_with(|| PaymentAuthorization::pending(offer_id, now));
    payment.decided_at = Some(now);
    match decision {
        ConsentDecision::Approved => {
            payment.status = PaymentStatus::Approved;
            payment.decline_reason = None;
        }
        ConsentDecision::Declined => {
            payment.status = PaymentStatus::Declined;
            payment.decline_reason = Some(DeclineReason::Consent);
        }
    }
    payment.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Seat, SeatPosition};
    use chrono::NaiveDate;

    fn endpoint(city: &str, code: &str, timestamp: &str) -> FlightEndpoint {
        FlightEndpoint {
            city_name: city.to_string(),
            airport_code: code.to_string(),
            airport_name: None,
            timestamp: timestamp.to_string(),
            gate: "A1".to_string(),
            terminal: "1".to_string(),
        }
    }

    fn offer(offer_id: &str, flight_number: &str, from: &str, to: &str) -> FlightOffer {
        FlightOffer {
            offer_id: offer_id.to_string(),
            flight_number: flight_number.to_string(),
            airline: "Air France".to_string(),
            departure: endpoint("Origin", from, "2024-06-01T09:00:00Z"),
            arrival: endpoint("Destination", to, "2024-06-01T21:00:00Z"),
            cabin_class: "economy".to_string(),
            price_in_euros: 400.0,
        }
    }

    fn seat_map(flight_number: &str) -> SeatMap {
        SeatMap {
            flight_number: flight_number.to_string(),
            seats: vec![
                Seat {
                    seat_number: "12C".to_string(),
                    position: SeatPosition::Aisle,
                    price_in_euros: 20.0,
                    available: true,
                },
                Seat {
                    seat_number: "14B".to_string(),
                    position: SeatPosition::Middle,
                    price_in_euros: 10.0,
                    available: false,
                },
            ],
        }
    }

    fn ada() -> Identity {
        Identity {
            user_id: "user-ada".to_string(),
            display_name: Some("Ada".to_string()),
        }
    }

    fn reservation_args(offer_id: &str, flight_number: &str, from: &str, to: &str) -> DisplayReservationArgs {
        DisplayReservationArgs {
            offer_id: offer_id.to_string(),
            seats: vec!["12C".to_string()],
            flight_number: flight_number.to_string(),
            departure: endpoint("Origin", from, "2024-06-01T09:00:00Z"),
            arrival: endpoint("Destination", to, "2024-06-01T21:00:00Z"),
            passenger_name: "ada lovelace".to_string(),
            total_price_in_euros: 420.0,
        }
    }

    fn boarding_args(offer_id: &str, flight_number: &str, from: &str, to: &str) -> DisplayBoardingPassArgs {
        DisplayBoardingPassArgs {
            reservation_id: offer_id.to_string(),
            passenger_name: "Ada Lovelace".to_string(),
            flight_number: flight_number.to_string(),
            seat: "12C".to_string(),
            departure: endpoint("Origin", from, "2024-06-01T09:00:00Z"),
            arrival: endpoint("Destination", to, "2024-06-01T21:00:00Z"),
        }
    }

    /// Drives one leg through search, seats, reservation and payment request.
    fn reserve_leg(
        sequencer: &WorkflowSequencer,
        token: &TurnToken,
        offer_id: &str,
        flight_number: &str,
        from: &str,
        to: &str,
    ) {
        let session = token.session_id();
        let now = Utc::now();
        sequencer
            .commit(token, Transition::FlightsFound(vec![offer(offer_id, flight_number, from, to)]), now)
            .expect("search commits");
        sequencer
            .admit_seat_selection(session, flight_number)
            .expect("seats admitted");
        sequencer
            .commit(token, Transition::SeatsSelected(seat_map(flight_number)), now)
            .expect("seats commit");
        let draft = sequencer
            .admit_reservation(session, &reservation_args(offer_id, flight_number, from, to), ada(), now)
            .expect("reservation admitted");
        sequencer
            .commit(token, Transition::Reserved(draft), now)
            .expect("reservation commits");
        sequencer
            .admit_payment(session, offer_id, now)
            .expect("payment admitted");
        sequencer
            .commit(token, Transition::PaymentRequested { offer_id: offer_id.to_string() }, now)
            .expect("payment commits");
    }

    #[test]
    fn approved_payment_unlocks_boarding_pass() {
        let sequencer = WorkflowSequencer::default();
        let token = sequencer.begin_turn("s-1");
        reserve_leg(&sequencer, &token, "OFR1", "AF1234", "JFK", "CDG");

        let approval = sequencer
            .apply_consent("s-1", "OFR1", ConsentDecision::Approved, Some(&ada()), Utc::now())
            .expect("consent applies");
        assert_eq!(approval.status, PaymentStatus::Approved);

        let (pass, booking) = sequencer
            .admit_boarding_pass("s-1", &boarding_args("OFR1", "AF1234", "JFK", "CDG"), Utc::now())
            .expect("boarding pass admitted");
        assert_eq!(pass.passenger_name, "Ada Lovelace");
        assert_eq!(booking.user_id, "user-ada");
        assert_eq!(booking.total_amount, 420.0);

        sequencer
            .commit(&token, Transition::BoardingPassIssued { offer_id: "OFR1".to_string() }, Utc::now())
            .expect("issue commits");
        assert_eq!(
            sequencer.leg_stage("s-1", "AF1234"),
            Some(LegStage::BoardingPassIssued)
        );
    }

    #[test]
    fn declined_payment_blocks_boarding_pass() {
        let sequencer = WorkflowSequencer::default();
        let token = sequencer.begin_turn("s-1");
        reserve_leg(&sequencer, &token, "OFR1", "AF1234", "JFK", "CDG");
        sequencer
            .apply_consent("s-1", "OFR1", ConsentDecision::Declined, Some(&ada()), Utc::now())
            .expect("consent applies");

        let error = sequencer
            .admit_boarding_pass("s-1", &boarding_args("OFR1", "AF1234", "JFK", "CDG"), Utc::now())
            .expect_err("declined leg is blocked");
        assert!(matches!(error, ToolError::Sequence(_)));
    }

    #[test]
    fn boarding_pass_is_rejected_in_every_non_approved_stage() {
        let sequencer = WorkflowSequencer::default();
        let token = sequencer.begin_turn("s-1");
        let now = Utc::now();
        let args = boarding_args("OFR1", "AF1234", "JFK", "CDG");
        let blocked = |sequencer: &WorkflowSequencer| {
            matches!(
                sequencer.admit_boarding_pass("s-1", &args, now),
                Err(ToolError::Sequence(_))
            )
        };

        assert!(blocked(&sequencer));
        sequencer
            .commit(&token, Transition::FlightsFound(vec![offer("OFR1", "AF1234", "JFK", "CDG")]), now)
            .expect("search");
        assert!(blocked(&sequencer));
        sequencer
            .commit(&token, Transition::SeatsSelected(seat_map("AF1234")), now)
            .expect("seats");
        assert!(blocked(&sequencer));
        let draft = sequencer
            .admit_reservation("s-1", &reservation_args("OFR1", "AF1234", "JFK", "CDG"), ada(), now)
            .expect("reservation");
        sequencer
            .commit(&token, Transition::Reserved(draft), now)
            .expect("reserved");
        assert!(blocked(&sequencer));
        sequencer
            .commit(&token, Transition::PaymentRequested { offer_id: "OFR1".to_string() }, now)
            .expect("pending");
        assert!(blocked(&sequencer));
        sequencer
            .apply_consent("s-1", "OFR1", ConsentDecision::Approved, Some(&ada()), now)
            .expect("approved");
        sequencer
            .commit(&token, Transition::BoardingPassIssued { offer_id: "OFR1".to_string() }, now)
            .expect("issued");
        assert!(blocked(&sequencer));

        assert!(sequencer.withdraw_boarding_pass("s-1", "OFR1"));
        assert_eq!(sequencer.leg_stage("s-1", "AF1234"), Some(LegStage::PaymentApproved));
        assert!(sequencer.admit_boarding_pass("s-1", &args, now).is_ok());
        assert!(!sequencer.withdraw_boarding_pass("s-1", "OFR1"));
    }

    #[test]
    fn only_the_reserving_user_can_decide_the_payment() {
        let sequencer = WorkflowSequencer::default();
        let token = sequencer.begin_turn("s-1");
        reserve_leg(&sequencer, &token, "OFR1", "AF1234", "JFK", "CDG");
        let grace = Identity {
            user_id: "user-grace".to_string(),
            display_name: None,
        };

        let anonymous = sequencer
            .apply_consent("s-1", "OFR1", ConsentDecision::Approved, None, Utc::now())
            .expect_err("signed out");
        assert!(matches!(anonymous, ToolError::Authorization(_)));
        let stranger = sequencer
            .apply_consent("s-1", "OFR1", ConsentDecision::Approved, Some(&grace), Utc::now())
            .expect_err("other user");
        assert!(matches!(stranger, ToolError::Authorization(_)));
        assert_eq!(sequencer.leg_stage("s-1", "AF1234"), Some(LegStage::PaymentPending));

        let approval = sequencer
            .apply_consent("s-1", "OFR1", ConsentDecision::Approved, Some(&ada()), Utc::now())
            .expect("owner approves");
        assert_eq!(approval.status, PaymentStatus::Approved);
        assert_eq!(sequencer.owners("s-1"), vec!["user-ada".to_string()]);
        assert!(sequencer.owners("s-2").is_empty());
    }

    #[test]
    fn never_reserved_offer_is_a_sequence_error() {
        let sequencer = WorkflowSequencer::default();
        let error = sequencer
            .admit_boarding_pass("s-1", &boarding_args("GHOST", "AF1234", "JFK", "CDG"), Utc::now())
            .expect_err("unknown offer");
        assert!(error.to_string().contains("no reservation was recorded"));
    }

    #[test]
    fn round_trip_legs_progress_independently() {
        let sequencer = WorkflowSequencer::default();
        let token = sequencer.begin_turn("s-1");
        reserve_leg(&sequencer, &token, "OUT1", "AF1234", "JFK", "CDG");
        reserve_leg(&sequencer, &token, "RET1", "AF4321", "CDG", "JFK");

        sequencer
            .apply_consent("s-1", "OUT1", ConsentDecision::Declined, Some(&ada()), Utc::now())
            .expect("decline outbound");
        sequencer
            .apply_consent("s-1", "RET1", ConsentDecision::Approved, Some(&ada()), Utc::now())
            .expect("approve return");

        assert!(sequencer
            .admit_boarding_pass("s-1", &boarding_args("RET1", "AF4321", "CDG", "JFK"), Utc::now())
            .is_ok());
        assert_eq!(
            sequencer.leg_stage("s-1", "AF1234"),
            Some(LegStage::PaymentDeclined)
        );
    }

    #[test]
    fn two_legs_cannot_share_an_offer() {
        let sequencer = WorkflowSequencer::default();
        let token = sequencer.begin_turn("s-1");
        reserve_leg(&sequencer, &token, "OFR1", "AF1234", "JFK", "CDG");

        let now = Utc::now();
        sequencer
            .commit(&token, Transition::FlightsFound(vec![offer("OFR2", "AF4321", "CDG", "JFK")]), now)
            .expect("search");
        sequencer
            .commit(&token, Transition::SeatsSelected(seat_map("AF4321")), now)
            .expect("seats");
        let error = sequencer
            .admit_reservation("s-1", &reservation_args("OFR1", "AF4321", "CDG", "JFK"), ada(), now)
            .expect_err("offer already bound");
        assert!(matches!(error, ToolError::Sequence(_)));
    }

    #[test]
    fn sessions_do_not_observe_each_other() {
        let sequencer = WorkflowSequencer::default();
        let first = sequencer.begin_turn("s-1");
        reserve_leg(&sequencer, &first, "OFR1", "AF1234", "JFK", "CDG");
        sequencer
            .apply_consent("s-1", "OFR1", ConsentDecision::Approved, Some(&ada()), Utc::now())
            .expect("approve in s-1");

        let second = sequencer.begin_turn("s-2");
        reserve_leg(&sequencer, &second, "OFR1", "AF1234", "JFK", "CDG");

        assert_eq!(sequencer.leg_stage("s-2", "AF1234"), Some(LegStage::PaymentPending));
        assert!(sequencer
            .admit_boarding_pass("s-2", &boarding_args("OFR1", "AF1234", "JFK", "CDG"), Utc::now())
            .is_err());
        assert!(sequencer
            .admit_boarding_pass("s-1", &boarding_args("OFR1", "AF1234", "JFK", "CDG"), Utc::now())
            .is_ok());
    }

    #[test]
    fn reservation_is_cross_checked_against_search_and_seat_map() {
        let sequencer = WorkflowSequencer::default();
        let token = sequencer.begin_turn("s-1");
        let now = Utc::now();
        sequencer
            .commit(&token, Transition::FlightsFound(vec![offer("OFR1", "AF1234", "JFK", "CDG")]), now)
            .expect("search");

        let early = sequencer
            .admit_reservation("s-1", &reservation_args("OFR1", "AF1234", "JFK", "CDG"), ada(), now)
            .expect_err("seats not selected yet");
        assert!(matches!(early, ToolError::Sequence(_)));

        sequencer
            .commit(&token, Transition::SeatsSelected(seat_map("AF1234")), now)
            .expect("seats");

        let mut tampered = reservation_args("OFR9", "AF1234", "JFK", "CDG");
        tampered.seats = vec!["14B".to_string()];
        tampered.total_price_in_euros = 1.0;
        let error = sequencer
            .admit_reservation("s-1", &tampered, ada(), now)
            .expect_err("mismatch");
        let ToolError::Validation(violations) = error else {
            panic!("expected validation error");
        };
        let fields = violations.iter().map(|v| v.field.as_str()).collect::<Vec<_>>();
        assert!(fields.contains(&"offerId"));
        assert!(fields.contains(&"seats[0]"));

        let mut overpriced = reservation_args("OFR1", "AF1234", "JFK", "CDG");
        overpriced.total_price_in_euros = 999.0;
        let error = sequencer
            .admit_reservation("s-1", &overpriced, ada(), now)
            .expect_err("price mismatch");
        assert!(error.to_string().contains("totalPriceInEuros"));
    }

    #[test]
    fn boarding_pass_arguments_must_match_reservation() {
        let sequencer = WorkflowSequencer::default();
        let token = sequencer.begin_turn("s-1");
        reserve_leg(&sequencer, &token, "OFR1", "AF1234", "JFK", "CDG");
        sequencer
            .apply_consent("s-1", "OFR1", ConsentDecision::Approved, Some(&ada()), Utc::now())
            .expect("approve");

        let mut args = boarding_args("OFR1", "AF1234", "JFK", "CDG");
        args.passenger_name = "Grace Hopper".to_string();
        args.seat = "1A".to_string();
        let error = sequencer
            .admit_boarding_pass("s-1", &args, Utc::now())
            .expect_err("mismatch");
        let ToolError::Validation(violations) = error else {
            panic!("expected validation error");
        };
        assert_eq!(violations.len(), 2);
    }

    #[test]
    fn pending_authorization_expires_into_decline() {
        let sequencer = WorkflowSequencer::new(Duration::minutes(15));
        let token = sequencer.begin_turn("s-1");
        reserve_leg(&sequencer, &token, "OFR1", "AF1234", "JFK", "CDG");

        let later = Utc::now() + Duration::minutes(16);
        let error = sequencer
            .apply_consent("s-1", "OFR1", ConsentDecision::Approved, Some(&ada()), later)
            .expect_err("expired");
        assert!(error.to_string().contains("expired"));

        let snapshot = sequencer.snapshot("s-1", later);
        let payment = snapshot.legs[0].payment.as_ref().expect("payment recorded");
        assert_eq!(payment.decline_reason, Some(DeclineReason::Expired));
    }

    #[test]
    fn consent_before_payment_request_is_rejected() {
        let sequencer = WorkflowSequencer::default();
        let token = sequencer.begin_turn("s-1");
        let now = Utc::now();
        sequencer
            .commit(&token, Transition::FlightsFound(vec![offer("OFR1", "AF1234", "JFK", "CDG")]), now)
            .expect("search");
        sequencer
            .commit(&token, Transition::SeatsSelected(seat_map("AF1234")), now)
            .expect("seats");
        let draft = sequencer
            .admit_reservation("s-1", &reservation_args("OFR1", "AF1234", "JFK", "CDG"), ada(), now)
            .expect("reservation");
        sequencer
            .commit(&token, Transition::Reserved(draft), now)
            .expect("reserved");

        assert!(sequencer
            .apply_consent("s-1", "OFR1", ConsentDecision::Approved, Some(&ada()), now)
            .is_err());
    }

    #[test]
    fn finalized_turn_cannot_commit() {
        let sequencer = WorkflowSequencer::default();
        let token = sequencer.begin_turn("s-1");
        sequencer.finalize_turn(&token);

        let error = sequencer
            .commit(&token, Transition::FlightsFound(vec![offer("OFR1", "AF1234", "JFK", "CDG")]), Utc::now())
            .expect_err("stale");
        assert!(matches!(error, CommitError::StaleTurn { .. }));
        assert_eq!(sequencer.leg_stage("s-1", "AF1234"), None);
    }

    #[test]
    fn newer_turn_supersedes_older_one() {
        let sequencer = WorkflowSequencer::default();
        let old = sequencer.begin_turn("s-1");
        let new = sequencer.begin_turn("s-1");
        assert!(!sequencer.is_live(&old));
        assert!(sequencer.is_live(&new));
    }

    #[test]
    fn accommodation_flow_confirms_after_consent() {
        let sequencer = WorkflowSequencer::default();
        let token = sequencer.begin_turn("s-1");
        let now = Utc::now();
        let stay = LodgingOffer {
            offer_id: "HTL1".to_string(),
            name: "Hotel Lumen".to_string(),
            address: "1 Rue de Rivoli".to_string(),
            city: "Paris".to_string(),
            country: "France".to_string(),
            star_rating: 4,
            check_in_date: NaiveDate::from_ymd_opt(2024, 6, 1).expect("date"),
            check_out_date: NaiveDate::from_ymd_opt(2024, 6, 10).expect("date"),
            nights: 9,
            price_per_night_in_euros: 150.0,
            total_price_in_euros: 1350.0,
        };
        sequencer
            .commit(&token, Transition::StaysFound(vec![stay]), now)
            .expect("stays");

        assert!(sequencer.admit_payment("s-1", "HTL1", now).is_err());
        sequencer
            .admit_accommodation_selection("s-1", "HTL1")
            .expect("selectable");
        sequencer
            .commit(&token, Transition::StaySelected { offer_id: "HTL1".to_string(), owner: ada() }, now)
            .expect("selected");
        sequencer.admit_payment("s-1", "HTL1", now).expect("payable");
        sequencer
            .commit(&token, Transition::PaymentRequested { offer_id: "HTL1".to_string() }, now)
            .expect("pending");
        assert!(sequencer
            .admit_accommodation_confirmation("s-1", "HTL1", now)
            .is_err());

        sequencer
            .apply_consent("s-1", "HTL1", ConsentDecision::Approved, Some(&ada()), now)
            .expect("approved");
        let (confirmation, booking) = sequencer
            .admit_accommodation_confirmation("s-1", "HTL1", now)
            .expect("confirmed");
        assert_eq!(confirmation.confirmation_code, "CNF-HTL1");
        assert_eq!(booking.kind, BookingKind::Accommodation);
        assert_eq!(sequencer.stay_stage("s-1", "HTL1"), Some(StayStage::Confirmed));
    }
}
