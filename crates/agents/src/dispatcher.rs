use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, warn};
use wayfarer_core::{
    decode, parse_iso_date, validate_arguments, CommitError, DisplayBoardingPassArgs,
    DisplayReservationArgs, FlightSearchQuery, Identity, InvocationOutcome, LodgingSearchQuery,
    OfferArgs, SearchAccommodationsArgs, SearchFlightsArgs, SelectSeatsArgs, ToolCallRequest,
    ToolCatalog, ToolError, ToolInvocation, ToolName, Transition, TurnToken, WorkflowSequencer,
};
use wayfarer_observability::{AppMetrics, AuditEvent, EventSink};
use wayfarer_storage::BookingRepository;

use crate::adapter::{AdapterError, TravelInventory};
use crate::gate::SessionGate;

pub const SIGNED_OUT_MESSAGE: &str = "User is not signed in to perform this action!";

/// What a single tool call may see of the turn it belongs to.
pub struct DispatchContext<'a> {
    pub turn: &'a TurnToken,
    pub gate: &'a SessionGate,
}

pub struct Dispatcher<A, B> {
    catalog: Arc<ToolCatalog>,
    inventory: Arc<A>,
    bookings: Arc<B>,
    sequencer: Arc<WorkflowSequencer>,
    events: Arc<dyn EventSink>,
    metrics: Arc<AppMetrics>,
}

impl<A, B> Dispatcher<A, B>
where
    A: TravelInventory,
    B: BookingRepository,
{
    pub fn new(
        catalog: Arc<ToolCatalog>,
        inventory: Arc<A>,
        bookings: Arc<B>,
        sequencer: Arc<WorkflowSequencer>,
        events: Arc<dyn EventSink>,
        metrics: Arc<AppMetrics>,
    ) -> Self {
        Self {
            catalog,
            inventory,
            bookings,
            sequencer,
            events,
            metrics,
        }
    }

    /// Runs one tool call to completion. Every failure is folded into the
    /// returned invocation; nothing here aborts the turn.
    pub async fn dispatch(&self, ctx: &DispatchContext<'_>, call: &ToolCallRequest) -> ToolInvocation {
        let started_at = Utc::now();
        self.metrics.inc_tool_call(&call.name);

        let outcome = match self.execute(ctx, call).await {
            Ok(result) => {
                self.audit(ctx, "tool_succeeded", json!({ "tool": call.name, "call_id": call.call_id }));
                InvocationOutcome::Succeeded { result }
            }
            Err(error) => {
                let kind = error.kind().as_code();
                self.metrics.inc_tool_failure(&call.name, kind);
                if matches!(error, ToolError::Upstream(_)) {
                    warn!(session_id = %ctx.turn.session_id(), tool = %call.name, error = %error, "tool handler failed");
                } else {
                    debug!(session_id = %ctx.turn.session_id(), tool = %call.name, kind, "tool call rejected");
                }
                self.audit(
                    ctx,
                    "tool_failed",
                    json!({ "tool": call.name, "call_id": call.call_id, "kind": kind, "message": error.to_string() }),
                );
                InvocationOutcome::Failed {
                    failure: error.to_failure(),
                }
            }
        };

        ToolInvocation {
            call_id: call.call_id.clone(),
            tool_name: call.name.clone(),
            arguments: call.arguments.clone(),
            outcome,
            started_at,
            finished_at: Utc::now(),
        }
    }

    async fn execute(&self, ctx: &DispatchContext<'_>, call: &ToolCallRequest) -> Result<Value, ToolError> {
        let spec = self.catalog.get(&call.name)?;
        let arguments = validate_arguments(spec, &call.arguments)?;
        let identity = if spec.requires_identity {
            Some(
                ctx.gate
                    .resolve()
                    .cloned()
                    .ok_or_else(|| ToolError::Authorization(SIGNED_OUT_MESSAGE.to_string()))?,
            )
        } else {
            None
        };

        let session_id = ctx.turn.session_id();
        let now = Utc::now();

        let (result, transition) = match spec.name {
            ToolName::SearchFlights => {
                let args: SearchFlightsArgs = decode(arguments)?;
                let query = FlightSearchQuery {
                    departure_date: date_field(&args.departure_date, "departureDate")?,
                    origin: args.origin,
                    destination: args.destination,
                };
                let offers = self.inventory.search_flights(&query).await.map_err(upstream)?;
                (payload(&offers)?, Some(Transition::FlightsFound(offers)))
            }
            ToolName::SelectSeats => {
                let args: SelectSeatsArgs = decode(arguments)?;
                self.sequencer
                    .admit_seat_selection(session_id, &args.flight_number)?;
                let seat_map = self
                    .inventory
                    .seat_map(&args.flight_number)
                    .await
                    .map_err(upstream)?;
                if seat_map.flight_number != args.flight_number {
                    return Err(upstream(AdapterError::Malformed(format!(
                        "seat map for {} returned for flight {}",
                        seat_map.flight_number, args.flight_number
                    ))));
                }
                (payload(&seat_map)?, Some(Transition::SeatsSelected(seat_map)))
            }
            ToolName::DisplayReservation => {
                let args: DisplayReservationArgs = decode(arguments)?;
                let draft = self
                    .sequencer
                    .admit_reservation(session_id, &args, owner(identity)?, now)?;
                (payload(&draft)?, Some(Transition::Reserved(draft)))
            }
            ToolName::AuthorizePayment => {
                let args: OfferArgs = decode(arguments)?;
                let acknowledgement = self.sequencer.admit_payment(session_id, &args.offer_id, now)?;
                (
                    payload(&acknowledgement)?,
                    Some(Transition::PaymentRequested {
                        offer_id: args.offer_id,
                    }),
                )
            }
            ToolName::DisplayBoardingPass => {
                let args: DisplayBoardingPassArgs = decode(arguments)?;
                let (pass, booking) = self.sequencer.admit_boarding_pass(session_id, &args, now)?;
                self.commit(
                    ctx,
                    Transition::BoardingPassIssued {
                        offer_id: args.reservation_id.clone(),
                    },
                )?;
                if let Err(error) = self.save_booking(ctx, &booking).await {
                    // unsaved bookings leave the pass unissued so it can be requested again
                    self.sequencer
                        .withdraw_boarding_pass(session_id, &args.reservation_id);
                    self.audit(
                        ctx,
                        "boarding_pass_withdrawn",
                        json!({ "offer_id": args.reservation_id }),
                    );
                    return Err(error);
                }
                (payload(&pass)?, None)
            }
            ToolName::SearchAccommodations => {
                let args: SearchAccommodationsArgs = decode(arguments)?;
                let query = LodgingSearchQuery {
                    destination_country: args.destination_country,
                    destination_city: args.destination_city,
                    check_in_date: date_field(&args.check_in_date, "checkInDate")?,
                    check_out_date: date_field(&args.check_out_date, "checkOutDate")?,
                };
                let offers = self.inventory.search_lodging(&query).await.map_err(upstream)?;
                (payload(&offers)?, Some(Transition::StaysFound(offers)))
            }
            ToolName::SelectAccommodation => {
                let args: OfferArgs = decode(arguments)?;
                let offer = self
                    .sequencer
                    .admit_accommodation_selection(session_id, &args.offer_id)?;
                (
                    payload(&offer)?,
                    Some(Transition::StaySelected {
                        offer_id: args.offer_id,
                        owner: owner(identity)?,
                    }),
                )
            }
            ToolName::DisplayAccommodationConfirmation => {
                let args: OfferArgs = decode(arguments)?;
                let (confirmation, booking) = self
                    .sequencer
                    .admit_accommodation_confirmation(session_id, &args.offer_id, now)?;
                self.ensure_live(ctx)?;
                self.save_booking(ctx, &booking).await?;
                (payload(&confirmation)?, None)
            }
        };

        if let Some(transition) = transition {
            self.commit(ctx, transition)?;
        }

        Ok(result)
    }

    fn commit(&self, ctx: &DispatchContext<'_>, transition: Transition) -> Result<(), ToolError> {
        let label = transition.label();
        match self.sequencer.commit(ctx.turn, transition, Utc::now()) {
            Ok(()) => {
                self.audit(ctx, "transition_applied", json!({ "transition": label }));
                Ok(())
            }
            Err(error @ CommitError::StaleTurn { .. }) => {
                self.audit(
                    ctx,
                    "transition_discarded",
                    json!({ "transition": label, "turn": ctx.turn.turn() }),
                );
                Err(ToolError::Sequence(format!("{error}; result discarded")))
            }
            Err(CommitError::Conflict(message)) => Err(ToolError::Sequence(message)),
        }
    }

    fn ensure_live(&self, ctx: &DispatchContext<'_>) -> Result<(), ToolError> {
        if self.sequencer.is_live(ctx.turn) {
            return Ok(());
        }
        self.audit(ctx, "transition_discarded", json!({ "turn": ctx.turn.turn() }));
        Err(ToolError::Sequence(format!(
            "turn {} of session {} was already finalized; result discarded",
            ctx.turn.turn(),
            ctx.turn.session_id()
        )))
    }

    async fn save_booking(
        &self,
        ctx: &DispatchContext<'_>,
        booking: &wayfarer_core::BookingRecord,
    ) -> Result<(), ToolError> {
        let inserted = self
            .bookings
            .save_booking(booking)
            .await
            .map_err(|error| ToolError::Upstream(format!("could not store booking: {error:#}")))?;
        self.audit(
            ctx,
            "booking_saved",
            json!({ "booking_id": booking.booking_id, "kind": booking.kind, "inserted": inserted }),
        );
        Ok(())
    }

    fn audit(&self, ctx: &DispatchContext<'_>, kind: &str, detail: Value) {
        self.events
            .record(AuditEvent::new(ctx.turn.session_id(), kind, detail));
    }
}

fn payload<T: Serialize>(value: &T) -> Result<Value, ToolError> {
    serde_json::to_value(value)
        .map_err(|error| ToolError::Upstream(format!("could not encode result: {error}")))
}

fn upstream(error: AdapterError) -> ToolError {
    ToolError::Upstream(error.to_string())
}

fn owner(identity: Option<Identity>) -> Result<Identity, ToolError> {
    identity.ok_or_else(|| ToolError::Authorization(SIGNED_OUT_MESSAGE.to_string()))
}

fn date_field(raw: &str, field: &str) -> Result<chrono::NaiveDate, ToolError> {
    parse_iso_date(raw).ok_or_else(|| ToolError::invalid(field, "must be an ISO 8601 date (YYYY-MM-DD)"))
}
