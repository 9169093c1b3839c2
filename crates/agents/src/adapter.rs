use std::collections::HashMap;

use chrono::{Duration, NaiveDate, SecondsFormat};
use once_cell::sync::Lazy;
use thiserror::Error;
use wayfarer_core::{
    FlightEndpoint, FlightOffer, FlightSearchQuery, LodgingOffer, LodgingSearchQuery, Seat,
    SeatMap, SeatPosition,
};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AdapterError {
    #[error("inventory unavailable: {0}")]
    Unavailable(String),
    #[error("malformed inventory data: {0}")]
    Malformed(String),
}

/// Flight, seat and lodging inventory as seen by the dispatcher.
pub trait TravelInventory: Send + Sync {
    async fn search_flights(&self, query: &FlightSearchQuery) -> Result<Vec<FlightOffer>, AdapterError>;
    async fn seat_map(&self, flight_number: &str) -> Result<SeatMap, AdapterError>;
    async fn search_lodging(&self, query: &LodgingSearchQuery) -> Result<Vec<LodgingOffer>, AdapterError>;
}

static AIRPORTS: Lazy<HashMap<&'static str, (&'static str, &'static str)>> = Lazy::new(|| {
    HashMap::from([
        ("JFK", ("New York", "John F. Kennedy International Airport")),
        ("LGA", ("New York", "LaGuardia Airport")),
        ("CDG", ("Paris", "Charles de Gaulle Airport")),
        ("ORY", ("Paris", "Paris Orly Airport")),
        ("LHR", ("London", "Heathrow Airport")),
        ("SFO", ("San Francisco", "San Francisco International Airport")),
        ("LAX", ("Los Angeles", "Los Angeles International Airport")),
        ("NRT", ("Tokyo", "Narita International Airport")),
        ("HND", ("Tokyo", "Haneda Airport")),
        ("SIN", ("Singapore", "Singapore Changi Airport")),
        ("DXB", ("Dubai", "Dubai International Airport")),
        ("FRA", ("Frankfurt", "Frankfurt Airport")),
        ("AMS", ("Amsterdam", "Amsterdam Airport Schiphol")),
        ("FCO", ("Rome", "Rome Fiumicino Airport")),
        ("BCN", ("Barcelona", "Josep Tarradellas Barcelona-El Prat Airport")),
    ])
});

const AIRLINES: [(&str, &str); 5] = [
    ("AF", "Air France"),
    ("DL", "Delta Air Lines"),
    ("BA", "British Airways"),
    ("LH", "Lufthansa"),
    ("KL", "KLM Royal Dutch Airlines"),
];

const HOTEL_PREFIXES: [&str; 6] = ["Grand", "Hotel", "Maison", "Residence", "The", "Palais"];
const HOTEL_SUFFIXES: [&str; 6] = ["Lumen", "Meridian", "Aurora", "Harbor", "Belvedere", "Orchid"];
const STREETS: [&str; 5] = ["Market Street", "River Road", "Station Square", "Garden Lane", "Harbour Walk"];

const OFFERS_PER_SEARCH: u64 = 3;
const SEAT_ROWS: std::ops::RangeInclusive<u32> = 10..=15;
const SEAT_LETTERS: [char; 6] = ['A', 'B', 'C', 'D', 'E', 'F'];

/// Deterministic generator standing in for real inventory: the same query
/// always yields the same offers, prices and seat maps.
#[derive(Debug, Default, Clone, Copy)]
pub struct SyntheticInventory;

impl SyntheticInventory {
    pub fn new() -> Self {
        Self
    }

    pub fn flights_for(&self, query: &FlightSearchQuery) -> Vec<FlightOffer> {
        let seed = fnv1a(&[
            query.origin.as_str(),
            query.destination.as_str(),
            query.departure_date.to_string().as_str(),
        ]);
        let mut rng = XorShift::new(seed);

        (0..OFFERS_PER_SEARCH)
            .map(|idx| {
                let (code, airline) = AIRLINES[(rng.next() % AIRLINES.len() as u64) as usize];
                // last digit carries the index so numbers never repeat within a search
                let flight_number = format!("{code}{}", 100 + (rng.next() % 900) * 10 + idx);
                let departs_at = query
                    .departure_date
                    .and_hms_opt((6 + idx * 5 + rng.next() % 3) as u32, ((rng.next() % 4) * 15) as u32, 0)
                    .unwrap_or_default()
                    .and_utc();
                let arrives_at = departs_at + Duration::minutes(90 + (rng.next() % 660) as i64);
                let price = 150.0 + (rng.next() % 70_000) as f64 / 100.0;

                FlightOffer {
                    offer_id: format!("OFR-{:08X}", (seed ^ rng.next()) as u32),
                    flight_number,
                    airline: airline.to_string(),
                    departure: endpoint(&query.origin, &departs_at.to_rfc3339_opts(SecondsFormat::Secs, true), &mut rng),
                    arrival: endpoint(&query.destination, &arrives_at.to_rfc3339_opts(SecondsFormat::Secs, true), &mut rng),
                    cabin_class: "economy".to_string(),
                    price_in_euros: round_cents(price),
                }
            })
            .collect()
    }

    pub fn seats_for(&self, flight_number: &str) -> SeatMap {
        let mut rng = XorShift::new(fnv1a(&[flight_number]));
        let mut seats = Vec::new();

        for row in SEAT_ROWS {
            for letter in SEAT_LETTERS {
                let Some(position) = SeatPosition::from_letter(letter) else {
                    continue;
                };
                let base = match position {
                    SeatPosition::Window => 25.0,
                    SeatPosition::Aisle => 20.0,
                    SeatPosition::Middle => 10.0,
                };
                let legroom = if row == *SEAT_ROWS.start() { 15.0 } else { 0.0 };
                seats.push(Seat {
                    seat_number: format!("{row}{letter}"),
                    position,
                    price_in_euros: base + legroom,
                    available: rng.next() % 4 != 0,
                });
            }
        }

        SeatMap {
            flight_number: flight_number.to_string(),
            seats,
        }
    }

    pub fn lodging_for(&self, query: &LodgingSearchQuery) -> Result<Vec<LodgingOffer>, AdapterError> {
        let nights = (query.check_out_date - query.check_in_date).num_days();
        if nights <= 0 {
            return Err(AdapterError::Malformed(format!(
                "stay from {} to {} has no nights",
                query.check_in_date, query.check_out_date
            )));
        }

        let seed = fnv1a(&[
            query.destination_country.to_lowercase().as_str(),
            query.destination_city.to_lowercase().as_str(),
            query.check_in_date.to_string().as_str(),
            query.check_out_date.to_string().as_str(),
        ]);
        let mut rng = XorShift::new(seed);

        Ok((0..OFFERS_PER_SEARCH)
            .map(|_| {
                let name = format!(
                    "{} {}",
                    HOTEL_PREFIXES[(rng.next() % HOTEL_PREFIXES.len() as u64) as usize],
                    HOTEL_SUFFIXES[(rng.next() % HOTEL_SUFFIXES.len() as u64) as usize]
                );
                let per_night = round_cents(80.0 + (rng.next() % 25_000) as f64 / 100.0);
                LodgingOffer {
                    offer_id: format!("HTL-{:08X}", (seed ^ rng.next()) as u32),
                    name,
                    address: format!(
                        "{} {}",
                        1 + rng.next() % 200,
                        STREETS[(rng.next() % STREETS.len() as u64) as usize]
                    ),
                    city: query.destination_city.clone(),
                    country: query.destination_country.clone(),
                    star_rating: 3 + (rng.next() % 3) as u8,
                    check_in_date: query.check_in_date,
                    check_out_date: query.check_out_date,
                    nights: nights as u32,
                    price_per_night_in_euros: per_night,
                    total_price_in_euros: round_cents(per_night * nights as f64),
                }
            })
            .collect())
    }
}

impl TravelInventory for SyntheticInventory {
    async fn search_flights(&self, query: &FlightSearchQuery) -> Result<Vec<FlightOffer>, AdapterError> {
        Ok(self.flights_for(query))
    }

    async fn seat_map(&self, flight_number: &str) -> Result<SeatMap, AdapterError> {
        Ok(self.seats_for(flight_number))
    }

    async fn search_lodging(&self, query: &LodgingSearchQuery) -> Result<Vec<LodgingOffer>, AdapterError> {
        self.lodging_for(query)
    }
}

fn endpoint(code: &str, timestamp: &str, rng: &mut XorShift) -> FlightEndpoint {
    let (city, airport) = AIRPORTS
        .get(code)
        .map(|(city, airport)| (city.to_string(), Some(airport.to_string())))
        .unwrap_or_else(|| (code.to_string(), None));

    FlightEndpoint {
        city_name: city,
        airport_code: code.to_string(),
        airport_name: airport,
        timestamp: timestamp.to_string(),
        gate: format!("{}{}", (b'A' + (rng.next() % 6) as u8) as char, 1 + rng.next() % 40),
        terminal: (1 + rng.next() % 3).to_string(),
    }
}

fn round_cents(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}

fn fnv1a(parts: &[&str]) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325_u64;
    for part in parts {
        for byte in part.bytes().chain(std::iter::once(0x1f)) {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
    }
    hash
}

struct XorShift(u64);

impl XorShift {
    fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }

    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }
}

pub fn flight_query(origin: &str, destination: &str, departure_date: NaiveDate) -> FlightSearchQuery {
    FlightSearchQuery {
        origin: origin.to_string(),
        destination: destination.to_string(),
        departure_date,
    }
}

#[cfg(test)]
mod tests {
    use wayfarer_core::validate;

    use super::*;

    fn query() -> FlightSearchQuery {
        flight_query("JFK", "CDG", NaiveDate::from_ymd_opt(2024, 6, 1).expect("date"))
    }

    #[test]
    fn flight_search_is_deterministic_and_contract_shaped() {
        let inventory = SyntheticInventory::new();
        let first = inventory.flights_for(&query());
        let second = inventory.flights_for(&query());
        assert_eq!(first, second);
        assert_eq!(first.len(), 3);

        let mut numbers = first.iter().map(|offer| offer.flight_number.clone()).collect::<Vec<_>>();
        numbers.dedup();
        assert_eq!(numbers.len(), 3);

        for offer in &first {
            assert_eq!(offer.departure.city_name, "New York");
            assert_eq!(offer.arrival.city_name, "Paris");
            assert!(validate::parse_iso_datetime(&offer.departure.timestamp).is_some());
            assert!(offer.price_in_euros >= 150.0);
        }
    }

    #[test]
    fn seat_letters_follow_cabin_layout() {
        let map = SyntheticInventory::new().seats_for("AF1234");
        assert_eq!(map.seats.len(), 36);
        assert_eq!(map.seat("12A").map(|seat| seat.position), Some(SeatPosition::Window));
        assert_eq!(map.seat("12C").map(|seat| seat.position), Some(SeatPosition::Aisle));
        assert_eq!(map.seat("12E").map(|seat| seat.position), Some(SeatPosition::Middle));
        assert_eq!(map.seat("10A").map(|seat| seat.price_in_euros), Some(40.0));
    }

    #[test]
    fn lodging_totals_cover_every_night() {
        let offers = SyntheticInventory::new()
            .lodging_for(&LodgingSearchQuery {
                destination_country: "France".to_string(),
                destination_city: "Paris".to_string(),
                check_in_date: NaiveDate::from_ymd_opt(2024, 6, 1).expect("date"),
                check_out_date: NaiveDate::from_ymd_opt(2024, 6, 10).expect("date"),
            })
            .expect("offers");

        for offer in offers {
            assert_eq!(offer.nights, 9);
            assert!((offer.total_price_in_euros - offer.price_per_night_in_euros * 9.0).abs() < 0.01);
            assert!((3..=5).contains(&offer.star_rating));
        }
    }
}
