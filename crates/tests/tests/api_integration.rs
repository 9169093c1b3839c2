use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::NaiveDate;
use serde_json::{json, Value};
use tower::ServiceExt;
use wayfarer_agents::adapter::flight_query;
use wayfarer_agents::{tool_call, AgentConfig, ModelResponse, ScriptedModel, SyntheticInventory};
use wayfarer_api::{build_router, ApiState, ModelBackend, SessionDirectory};
use wayfarer_core::{FlightEndpoint, Identity};
use wayfarer_storage::Store;

const API_KEY: &str = "test-key";
const ADA_TOKEN: &str = "tok-ada";
const GRACE_TOKEN: &str = "tok-grace";

fn app_with(replies: Vec<ModelResponse>) -> Router {
    let identities = Arc::new(SessionDirectory::new());
    identities.insert(
        ADA_TOKEN,
        Identity {
            user_id: "user-ada".to_string(),
            display_name: Some("Ada Lovelace".to_string()),
        },
    );
    identities.insert(
        GRACE_TOKEN,
        Identity {
            user_id: "user-grace".to_string(),
            display_name: None,
        },
    );
    let model = ModelBackend::Scripted(Arc::new(ScriptedModel::replies(replies)));
    build_router(ApiState::new(
        model,
        Store::memory(),
        identities,
        AgentConfig::default(),
        API_KEY,
    ))
}

fn chat_request(session_id: &str, text: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/v1/chat")
        .header("content-type", "application/json")
        .header("x-api-key", API_KEY);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder
        .body(Body::from(
            json!({
                "session_id": session_id,
                "messages": [{ "role": "user", "content": text }]
            })
            .to_string(),
        ))
        .unwrap()
}

async fn sse_events(app: &Router, request: Request<Body>) -> Vec<Value> {
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-session-id"));

    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(body.to_vec())
        .unwrap()
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| serde_json::from_str(data.trim_start()).unwrap())
        .collect()
}

async fn json_response(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

fn event_types(events: &[Value]) -> Vec<&str> {
    events
        .iter()
        .filter_map(|event| event["type"].as_str())
        .collect()
}

fn reservation_endpoint(endpoint: &FlightEndpoint) -> Value {
    json!({
        "cityName": endpoint.city_name,
        "airportCode": endpoint.airport_code,
        "timestamp": endpoint.timestamp,
        "gate": endpoint.gate,
        "terminal": endpoint.terminal
    })
}

#[tokio::test]
async fn health_is_public() {
    let app = app_with(Vec::new());

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn v1_routes_require_api_key() {
    let app = app_with(Vec::new());

    let request = Request::builder()
        .uri("/v1/tools")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let request = Request::builder()
        .uri("/v1/tools")
        .header("x-api-key", API_KEY)
        .body(Body::empty())
        .unwrap();
    let (status, tools) = json_response(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(tools.as_array().map(Vec::len), Some(8));
}

#[tokio::test]
async fn round_trip_request_streams_two_searches_and_no_payment() {
    let app = app_with(vec![
        ModelResponse::calls(vec![
            tool_call("c1", "searchFlights", json!({ "origin": "JFK", "destination": "CDG", "departureDate": "2024-06-01" })),
            tool_call("c2", "searchFlights", json!({ "origin": "CDG", "destination": "JFK", "departureDate": "2024-06-10" })),
        ]),
        ModelResponse::text("Pick your outbound flight."),
    ]);

    let events = sse_events(
        &app,
        chat_request("s-round", "round trip JFK to CDG, 2024-06-01 to 2024-06-10", None),
    )
    .await;

    assert_eq!(
        event_types(&events),
        vec!["tool_call", "tool_result", "tool_call", "tool_result", "text_delta", "finish"]
    );
    assert!(events
        .iter()
        .all(|event| event["call"]["name"] != "authorizePayment"));
    assert_eq!(events[1]["invocation"]["outcome"]["status"], "succeeded");
    assert_eq!(events.last().unwrap()["reason"], "stop");

    let seqs = events
        .iter()
        .filter_map(|event| event["seq"].as_u64())
        .collect::<Vec<_>>();
    assert_eq!(seqs, (0..events.len() as u64).collect::<Vec<_>>());
}

#[tokio::test]
async fn signed_out_reservation_fails_and_turn_continues() {
    let app = app_with(vec![
        ModelResponse::calls(vec![tool_call(
            "c1",
            "displayReservation",
            json!({
                "offerId": "OFR-1",
                "seats": ["12A"],
                "flightNumber": "AF1230",
                "departure": { "cityName": "New York", "airportCode": "JFK", "timestamp": "2024-06-01T08:00:00Z", "gate": "A1", "terminal": "1" },
                "arrival": { "cityName": "Paris", "airportCode": "CDG", "timestamp": "2024-06-01T20:00:00Z", "gate": "B2", "terminal": "2" },
                "passengerName": "Ada Lovelace",
                "totalPriceInEuros": 420.0
            }),
        )]),
        ModelResponse::text("Please sign in first."),
    ]);

    let events = sse_events(&app, chat_request("s-anon", "reserve it", None)).await;

    let result = events
        .iter()
        .find(|event| event["type"] == "tool_result")
        .expect("tool result");
    assert_eq!(result["invocation"]["outcome"]["status"], "failed");
    assert_eq!(
        result["invocation"]["outcome"]["failure"]["kind"],
        "authorization"
    );
    assert_eq!(
        result["invocation"]["outcome"]["failure"]["message"],
        "User is not signed in to perform this action!"
    );
    assert_eq!(events.last().unwrap()["reason"], "stop");
}

#[tokio::test]
async fn approved_consent_unlocks_boarding_pass_and_records_booking() {
    let inventory = SyntheticInventory::new();
    let offer = inventory.flights_for(&flight_query(
        "JFK",
        "CDG",
        NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
    ))[0]
        .clone();
    let seat = inventory
        .seats_for(&offer.flight_number)
        .seats
        .into_iter()
        .find(|seat| seat.available)
        .unwrap();

    let app = app_with(vec![
        ModelResponse::calls(vec![tool_call(
            "c1",
            "searchFlights",
            json!({ "origin": "JFK", "destination": "CDG", "departureDate": "2024-06-01" }),
        )]),
        ModelResponse::calls(vec![tool_call(
            "c2",
            "selectSeats",
            json!({ "flightNumber": offer.flight_number }),
        )]),
        ModelResponse::calls(vec![tool_call(
            "c3",
            "displayReservation",
            json!({
                "offerId": offer.offer_id,
                "seats": [seat.seat_number],
                "flightNumber": offer.flight_number,
                "departure": reservation_endpoint(&offer.departure),
                "arrival": reservation_endpoint(&offer.arrival),
                "passengerName": "Ada Lovelace",
                "totalPriceInEuros": offer.price_in_euros + seat.price_in_euros
            }),
        )]),
        ModelResponse::calls(vec![tool_call(
            "c4",
            "authorizePayment",
            json!({ "offerId": offer.offer_id }),
        )]),
        ModelResponse::text("Approve the payment when ready."),
        ModelResponse::calls(vec![tool_call(
            "c5",
            "displayBoardingPass",
            json!({
                "reservationId": offer.offer_id,
                "passengerName": "Ada Lovelace",
                "flightNumber": offer.flight_number,
                "seat": seat.seat_number,
                "departure": offer.departure,
                "arrival": offer.arrival
            }),
        )]),
        ModelResponse::text("Here is your boarding pass."),
    ]);

    let events = sse_events(&app, chat_request("s-book", "book the first one", Some(ADA_TOKEN))).await;
    let results = events
        .iter()
        .filter(|event| event["type"] == "tool_result")
        .collect::<Vec<_>>();
    assert_eq!(results.len(), 4);
    assert!(results
        .iter()
        .all(|event| event["invocation"]["outcome"]["status"] == "succeeded"));

    let consent = |approved: bool, token: &str| {
        Request::builder()
            .method("POST")
            .uri("/v1/payments/consent")
            .header("content-type", "application/json")
            .header("x-api-key", API_KEY)
            .header("authorization", format!("Bearer {token}"))
            .body(Body::from(
                json!({ "session_id": "s-book", "offer_id": offer.offer_id, "approved": approved })
                    .to_string(),
            ))
            .unwrap()
    };
    let (status, body) = json_response(&app, consent(true, GRACE_TOKEN)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["kind"], "authorization");

    let (status, authorization) = json_response(&app, consent(true, ADA_TOKEN)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(authorization["status"], "approved");

    let (status, _) = json_response(&app, consent(false, ADA_TOKEN)).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let events = sse_events(&app, chat_request("s-book", "boarding pass please", Some(ADA_TOKEN))).await;
    let pass = events
        .iter()
        .find(|event| event["type"] == "tool_result")
        .expect("boarding pass result");
    assert_eq!(pass["invocation"]["outcome"]["status"], "succeeded");

    let workflow_request = |token: Option<&str>| {
        let mut builder = Request::builder()
            .uri("/v1/sessions/s-book/workflow")
            .header("x-api-key", API_KEY);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        builder.body(Body::empty()).unwrap()
    };
    let (status, _) = json_response(&app, workflow_request(None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _) = json_response(&app, workflow_request(Some(GRACE_TOKEN))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, workflow) = json_response(&app, workflow_request(Some(ADA_TOKEN))).await;
    assert_eq!(status, StatusCode::OK);
    let booked = workflow["legs"]
        .as_array()
        .unwrap()
        .iter()
        .find(|leg| leg["offer_id"] == offer.offer_id.as_str())
        .expect("booked leg");
    assert_eq!(booked["stage"], "boarding_pass_issued");

    let past_request = |token: Option<&str>| {
        let mut builder = Request::builder()
            .uri("/v1/bookings/past")
            .header("x-api-key", API_KEY);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        builder.body(Body::empty()).unwrap()
    };
    let (status, past) = json_response(&app, past_request(Some(ADA_TOKEN))).await;
    assert_eq!(status, StatusCode::OK);
    let bookings = past["bookings"].as_array().unwrap();
    assert_eq!(bookings.len(), 1);
    assert_eq!(bookings[0]["kind"], "flight");
    assert_eq!(bookings[0]["user_id"], "user-ada");

    let (status, _) = json_response(&app, past_request(None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn consent_for_unknown_offer_is_a_conflict() {
    let app = app_with(Vec::new());

    let request = Request::builder()
        .method("POST")
        .uri("/v1/payments/consent")
        .header("content-type", "application/json")
        .header("x-api-key", API_KEY)
        .body(Body::from(
            json!({ "session_id": "s-none", "offer_id": "OFR-404", "approved": true }).to_string(),
        ))
        .unwrap();

    let (status, body) = json_response(&app, request).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["kind"], "sequence");
}
