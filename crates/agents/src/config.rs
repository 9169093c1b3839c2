use std::env;
use std::time::Duration;

use chrono::Utc;

pub const TODAY_PLACEHOLDER: &str = "{today}";

const DEFAULT_SYSTEM_PROMPT: &str = "\
You are a travel agent that books flights and accommodations.
Keep every reply to one short sentence and never output lists.
After a tool call, acknowledge the result in a few words; the user already sees it.
Today's date is {today}.
Ask for anything you do not know, such as the passenger name or travel dates.
Seats C and D are aisle seats, A and F are window seats, B and E are middle seats.
Assume the busiest airport for the origin and destination cities.
Booking flow for each flight, in order: search flights, select seats, display the \
reservation, authorize payment, wait for the user to consent, display the boarding pass.
For a round trip repeat the flow for the return flight with its own offer.
Accommodation flow: search accommodations, select one, authorize payment, wait for \
consent, display the booking confirmation.
Users may book accommodation without booking flights.";

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub system_prompt: String,
    pub max_steps: usize,
    pub turn_timeout: Duration,
    pub payment_pending_ttl: Duration,
    pub session_ttl: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            max_steps: 8,
            turn_timeout: Duration::from_secs(30),
            payment_pending_ttl: Duration::from_secs(15 * 60),
            session_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl AgentConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            system_prompt: env::var("WAYFARER_SYSTEM_PROMPT")
                .ok()
                .filter(|value| !value.trim().is_empty())
                .unwrap_or(defaults.system_prompt),
            max_steps: env::var("WAYFARER_MAX_STEPS")
                .ok()
                .and_then(|value| value.parse::<usize>().ok())
                .filter(|value| *value > 0)
                .unwrap_or(defaults.max_steps),
            turn_timeout: seconds_from_env("WAYFARER_TURN_TIMEOUT_SECONDS")
                .unwrap_or(defaults.turn_timeout),
            payment_pending_ttl: seconds_from_env("WAYFARER_PAYMENT_PENDING_TTL_SECONDS")
                .unwrap_or(defaults.payment_pending_ttl),
            session_ttl: seconds_from_env("WAYFARER_SESSION_TTL_SECONDS")
                .unwrap_or(defaults.session_ttl),
        }
    }

    /// The prompt with today's date substituted in.
    pub fn rendered_prompt(&self) -> String {
        self.system_prompt
            .replace(TODAY_PLACEHOLDER, &Utc::now().date_naive().to_string())
    }
}

fn seconds_from_env(key: &str) -> Option<Duration> {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .map(Duration::from_secs)
}
