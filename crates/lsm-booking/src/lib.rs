//! Booking engine: per-day availability resolution, the single-submission
//! booking coordinator, and the confirmation presenter.

use std::sync::Arc;

use chrono::NaiveDate;
use lsm_api::{ApiError, MarketplaceApi};
use lsm_core::{AvailabilitySlot, BookingRecord, BookingRequest, DayAvailability};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "lsm-booking";

// ---------------------------------------------------------------------------
// Availability.
// ---------------------------------------------------------------------------

/// Fetches the open slots for one (provider, date) pair. Deliberately
/// cache-free: the slot set is invalid the moment the provider or date
/// changes, so every open of the picker re-fetches.
pub struct AvailabilityResolver {
    api: Arc<dyn MarketplaceApi>,
}

impl AvailabilityResolver {
    pub fn new(api: Arc<dyn MarketplaceApi>) -> Self {
        Self { api }
    }

    /// Returns the day's open slots ordered by start time with duplicate
    /// start times collapsed. An empty slot list is a valid result, not an
    /// error.
    pub async fn resolve(
        &self,
        provider_id: &str,
        date: NaiveDate,
    ) -> Result<DayAvailability, ApiError> {
        let mut day = self.api.availability(provider_id, date).await?;
        day.slots.sort_by_key(|slot| slot.starts_at);
        day.slots.dedup_by_key(|slot| slot.starts_at);
        Ok(day)
    }
}

/// Tracks which slot the user has picked. The selection is tied to the
/// (provider, date) it was made for and clears itself when either changes.
#[derive(Debug, Default)]
pub struct SlotSelection {
    provider_id: Option<String>,
    date: Option<NaiveDate>,
    slot: Option<AvailabilitySlot>,
}

impl SlotSelection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_context(&mut self, provider_id: &str, date: NaiveDate) {
        let same = self.provider_id.as_deref() == Some(provider_id) && self.date == Some(date);
        if !same {
            self.slot = None;
        }
        self.provider_id = Some(provider_id.to_string());
        self.date = Some(date);
    }

    pub fn select(&mut self, slot: AvailabilitySlot) {
        self.slot = Some(slot);
    }

    pub fn selected(&self) -> Option<&AvailabilitySlot> {
        self.slot.as_ref()
    }

    pub fn clear(&mut self) {
        self.slot = None;
    }
}

// ---------------------------------------------------------------------------
// Booking transaction.
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum BookingError {
    #[error("select a time slot before booking")]
    SlotNotSelected,
    #[error("a booking submission is already in progress")]
    SubmissionInFlight,
    #[error("this booking has already been confirmed")]
    AlreadyConfirmed,
    #[error("{message}")]
    Submission {
        message: String,
        #[source]
        source: Arc<ApiError>,
    },
}

impl BookingError {
    pub fn user_message(&self) -> String {
        self.to_string()
    }
}

/// Everything the booking form holds before submission. `validate` is the
/// only way to turn it into a request the coordinator will send.
#[derive(Debug, Clone, Default)]
pub struct BookingDraft {
    pub provider_id: String,
    pub location_city: String,
    pub location_state: String,
    pub notes: String,
    pub slot: Option<AvailabilitySlot>,
}

impl BookingDraft {
    pub fn validate(&self) -> Result<BookingRequest, BookingError> {
        let slot = self.slot.as_ref().ok_or(BookingError::SlotNotSelected)?;
        Ok(BookingRequest {
            provider_id: self.provider_id.clone(),
            scheduled_at: slot.starts_at,
            location_city: self.location_city.clone(),
            location_state: self.location_state.clone(),
            notes: self.notes.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookingPhase {
    Idle,
    Submitting,
    Confirmed,
    Failed { message: String },
}

/// Drives one booking attempt. At most one submission is ever in flight: a
/// second submit while pending is refused, not queued. Success is terminal —
/// one attempt produces at most one booking. Failure re-enables submission
/// but never retries on its own.
pub struct BookingTransactionCoordinator {
    api: Arc<dyn MarketplaceApi>,
    phase: Mutex<BookingPhase>,
}

impl BookingTransactionCoordinator {
    pub fn new(api: Arc<dyn MarketplaceApi>) -> Self {
        Self {
            api,
            phase: Mutex::new(BookingPhase::Idle),
        }
    }

    pub async fn phase(&self) -> BookingPhase {
        self.phase.lock().await.clone()
    }

    pub async fn can_submit(&self) -> bool {
        matches!(
            *self.phase.lock().await,
            BookingPhase::Idle | BookingPhase::Failed { .. }
        )
    }

    pub async fn submit(&self, draft: &BookingDraft) -> Result<BookingRecord, BookingError> {
        // Validation is resolved locally, before any network or state change.
        let request = draft.validate()?;

        {
            let mut phase = self.phase.lock().await;
            match &*phase {
                BookingPhase::Submitting => return Err(BookingError::SubmissionInFlight),
                BookingPhase::Confirmed => return Err(BookingError::AlreadyConfirmed),
                BookingPhase::Idle | BookingPhase::Failed { .. } => {}
            }
            *phase = BookingPhase::Submitting;
        }

        let result = self.api.create_booking(&request).await;

        let mut phase = self.phase.lock().await;
        match result {
            Ok(record) => {
                info!(booking_id = %record.id, provider_id = %request.provider_id, "booking confirmed");
                *phase = BookingPhase::Confirmed;
                Ok(record)
            }
            Err(err) => {
                let message = err.user_message();
                warn!(%err, "booking submission failed");
                *phase = BookingPhase::Failed {
                    message: message.clone(),
                };
                Err(BookingError::Submission {
                    message,
                    source: Arc::new(err),
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Confirmation presenter.
// ---------------------------------------------------------------------------

/// One follow-up affordance on the confirmation screen. A missing
/// prerequisite disables the action with a stated reason; it never silently
/// does nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContactAction {
    Enabled { target: String },
    Disabled { reason: String },
}

impl ContactAction {
    pub fn is_enabled(&self) -> bool {
        matches!(self, ContactAction::Enabled { .. })
    }

    pub fn target(&self) -> Option<&str> {
        match self {
            ContactAction::Enabled { target } => Some(target),
            ContactAction::Disabled { .. } => None,
        }
    }
}

/// Pure rendering of a confirmed booking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmationView {
    pub booking_id: String,
    pub headline: String,
    pub scheduled_for: String,
    pub total_amount: String,
    pub service_title: String,
    pub provider_name: String,
    pub message_action: ContactAction,
    pub call_action: ContactAction,
    pub whatsapp_action: ContactAction,
}

impl ConfirmationView {
    pub fn from_record(record: &BookingRecord) -> Self {
        let scheduled_for = record
            .scheduled_at
            .format("%A, %d %B %Y at %H:%M UTC")
            .to_string();

        let message_action = match &record.provider_user_id {
            Some(user_id) => ContactAction::Enabled {
                target: format!("lsm://messages/{user_id}"),
            },
            None => ContactAction::Disabled {
                reason: "In-app messaging is unavailable for this provider".to_string(),
            },
        };

        let call_action = match &record.provider_phone {
            Some(phone) => ContactAction::Enabled {
                target: format!("tel:{}", phone.replace(' ', "")),
            },
            None => ContactAction::Disabled {
                reason: "No phone number on file for this provider".to_string(),
            },
        };

        let whatsapp_action = match &record.provider_phone {
            Some(phone) => {
                let digits: String = phone.chars().filter(|c| c.is_ascii_digit()).collect();
                let text = format!(
                    "Hi {}, I just booked {} for {} (booking {}).",
                    record.provider_name, record.service_title, scheduled_for, record.id
                );
                ContactAction::Enabled {
                    target: format!("https://wa.me/{digits}?text={}", percent_encode(&text)),
                }
            }
            None => ContactAction::Disabled {
                reason: "No phone number on file for this provider".to_string(),
            },
        };

        Self {
            booking_id: record.id.clone(),
            headline: format!("Booking confirmed with {}", record.provider_name),
            scheduled_for,
            total_amount: format!("{:.2}", record.total_amount),
            service_title: record.service_title.clone(),
            provider_name: record.provider_name.clone(),
            message_action,
            call_action,
            whatsapp_action,
        }
    }
}

fn percent_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len() * 3);
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use lsm_core::{ProviderPage, ProviderProfile, SearchIntent};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn slot(hour: u32) -> AvailabilitySlot {
        AvailabilitySlot {
            starts_at: Utc.with_ymd_and_hms(2024, 6, 1, hour, 0, 0).single().expect("ts"),
            display_time: format!("{hour:02}:00"),
        }
    }

    fn record(phone: Option<&str>, user_id: Option<&str>) -> BookingRecord {
        BookingRecord {
            id: "bk-1".to_string(),
            scheduled_at: Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).single().expect("ts"),
            total_amount: 120.0,
            provider_name: "Ada's Plumbing".to_string(),
            provider_phone: phone.map(ToString::to_string),
            provider_user_id: user_id.map(ToString::to_string),
            service_title: "Drain repair".to_string(),
        }
    }

    struct StubApi {
        booking_calls: AtomicUsize,
        availability_slots: Vec<AvailabilitySlot>,
        booked_count: u32,
        booking_delay: Duration,
        fail_first_booking: bool,
        auth_error: bool,
    }

    impl StubApi {
        fn new() -> Self {
            Self {
                booking_calls: AtomicUsize::new(0),
                availability_slots: Vec::new(),
                booked_count: 0,
                booking_delay: Duration::from_millis(0),
                fail_first_booking: false,
                auth_error: false,
            }
        }

        fn calls(&self) -> usize {
            self.booking_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MarketplaceApi for StubApi {
        async fn search_providers(&self, _intent: &SearchIntent) -> Result<ProviderPage, ApiError> {
            unimplemented!("not used by booking tests")
        }

        async fn provider_profile(&self, _provider_id: &str) -> Result<ProviderProfile, ApiError> {
            unimplemented!("not used by booking tests")
        }

        async fn availability(
            &self,
            _provider_id: &str,
            date: NaiveDate,
        ) -> Result<DayAvailability, ApiError> {
            Ok(DayAvailability {
                date,
                slots: self.availability_slots.clone(),
                booked_count: self.booked_count,
            })
        }

        async fn create_booking(&self, request: &BookingRequest) -> Result<BookingRecord, ApiError> {
            let call = self.booking_calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.booking_delay).await;
            if self.auth_error {
                return Err(ApiError::Auth("booking requires a signed-in user"));
            }
            if self.fail_first_booking && call == 0 {
                return Err(ApiError::Http {
                    status: 409,
                    url: "stub://bookings".to_string(),
                    message: "Slot already taken".to_string(),
                });
            }
            Ok(BookingRecord {
                id: format!("bk-{call}"),
                scheduled_at: request.scheduled_at,
                total_amount: 120.0,
                provider_name: "Ada's Plumbing".to_string(),
                provider_phone: Some("+1 512 555 0100".to_string()),
                provider_user_id: Some("u-1".to_string()),
                service_title: "Drain repair".to_string(),
            })
        }
    }

    fn draft_with_slot(hour: u32) -> BookingDraft {
        BookingDraft {
            provider_id: "p1".to_string(),
            location_city: "Austin".to_string(),
            location_state: "TX".to_string(),
            notes: "Leaky sink".to_string(),
            slot: Some(slot(hour)),
        }
    }

    #[tokio::test]
    async fn empty_slot_day_is_a_valid_state() {
        let mut api = StubApi::new();
        api.booked_count = 4;
        let resolver = AvailabilityResolver::new(Arc::new(api));
        let date = NaiveDate::from_ymd_opt(2024, 6, 1).expect("date");
        let day = resolver.resolve("p1", date).await.expect("no error");
        assert!(day.slots.is_empty());
        assert_eq!(day.booked_count, 4);
    }

    #[tokio::test]
    async fn slots_come_back_ordered_and_deduplicated() {
        let mut api = StubApi::new();
        api.availability_slots = vec![slot(14), slot(9), slot(14), slot(11)];
        let resolver = AvailabilityResolver::new(Arc::new(api));
        let date = NaiveDate::from_ymd_opt(2024, 6, 1).expect("date");
        let day = resolver.resolve("p1", date).await.expect("resolve");
        let starts: Vec<DateTime<Utc>> = day.slots.iter().map(|s| s.starts_at).collect();
        assert_eq!(starts, vec![slot(9).starts_at, slot(11).starts_at, slot(14).starts_at]);
    }

    #[test]
    fn slot_selection_clears_when_provider_or_date_changes() {
        let mut selection = SlotSelection::new();
        let date = NaiveDate::from_ymd_opt(2024, 6, 1).expect("date");
        selection.set_context("p1", date);
        selection.select(slot(10));
        assert!(selection.selected().is_some());

        // Same context keeps the pick.
        selection.set_context("p1", date);
        assert!(selection.selected().is_some());

        let next_day = NaiveDate::from_ymd_opt(2024, 6, 2).expect("date");
        selection.set_context("p1", next_day);
        assert!(selection.selected().is_none());

        selection.select(slot(10));
        selection.set_context("p2", next_day);
        assert!(selection.selected().is_none());
    }

    #[tokio::test]
    async fn missing_slot_is_rejected_before_any_network_call() {
        let api = Arc::new(StubApi::new());
        let coordinator = BookingTransactionCoordinator::new(api.clone());
        let draft = BookingDraft {
            slot: None,
            ..draft_with_slot(10)
        };
        let err = coordinator.submit(&draft).await.expect_err("must reject");
        assert!(matches!(err, BookingError::SlotNotSelected));
        assert_eq!(api.calls(), 0);
        assert!(coordinator.can_submit().await);
    }

    #[tokio::test]
    async fn concurrent_submit_is_refused_and_only_one_request_goes_out() {
        let mut stub = StubApi::new();
        stub.booking_delay = Duration::from_millis(60);
        let api = Arc::new(stub);
        let coordinator = Arc::new(BookingTransactionCoordinator::new(api.clone()));

        let first = Arc::clone(&coordinator);
        let pending = tokio::spawn(async move { first.submit(&draft_with_slot(10)).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = coordinator
            .submit(&draft_with_slot(10))
            .await
            .expect_err("second submit while pending must be refused");
        assert!(matches!(err, BookingError::SubmissionInFlight));

        let record = pending.await.expect("join").expect("first submit succeeds");
        assert_eq!(api.calls(), 1, "exactly one network submission");
        assert_eq!(
            record.scheduled_at,
            Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).single().expect("ts")
        );
    }

    #[tokio::test]
    async fn success_is_terminal() {
        let api = Arc::new(StubApi::new());
        let coordinator = BookingTransactionCoordinator::new(api.clone());
        coordinator
            .submit(&draft_with_slot(10))
            .await
            .expect("first submit");
        assert!(!coordinator.can_submit().await);
        let err = coordinator
            .submit(&draft_with_slot(11))
            .await
            .expect_err("terminal after success");
        assert!(matches!(err, BookingError::AlreadyConfirmed));
        assert_eq!(api.calls(), 1);
    }

    #[tokio::test]
    async fn failure_surfaces_server_message_and_reenables_submit() {
        let mut stub = StubApi::new();
        stub.fail_first_booking = true;
        let api = Arc::new(stub);
        let coordinator = BookingTransactionCoordinator::new(api.clone());

        let err = coordinator
            .submit(&draft_with_slot(10))
            .await
            .expect_err("first attempt fails");
        assert_eq!(err.user_message(), "Slot already taken");
        assert_eq!(
            coordinator.phase().await,
            BookingPhase::Failed {
                message: "Slot already taken".to_string()
            }
        );
        assert!(coordinator.can_submit().await);

        // Explicit user re-trigger, not an automatic retry.
        coordinator
            .submit(&draft_with_slot(10))
            .await
            .expect("second attempt succeeds");
        assert_eq!(api.calls(), 2);
    }

    #[tokio::test]
    async fn auth_failure_is_reported_in_auth_terms() {
        let mut stub = StubApi::new();
        stub.auth_error = true;
        let api = Arc::new(stub);
        let coordinator = BookingTransactionCoordinator::new(api);
        let err = coordinator
            .submit(&draft_with_slot(10))
            .await
            .expect_err("auth error");
        assert!(err.user_message().contains("sign in"));
    }

    #[test]
    fn confirmation_formats_record_and_enables_contacts() {
        let view = ConfirmationView::from_record(&record(Some("+1 512 555 0100"), Some("u-9")));
        assert_eq!(view.booking_id, "bk-1");
        assert_eq!(view.scheduled_for, "Saturday, 01 June 2024 at 10:00 UTC");
        assert_eq!(view.total_amount, "120.00");
        assert!(view.message_action.is_enabled());
        assert_eq!(view.message_action.target(), Some("lsm://messages/u-9"));
        assert_eq!(view.call_action.target(), Some("tel:+15125550100"));
        let wa = view.whatsapp_action.target().expect("whatsapp enabled");
        assert!(wa.starts_with("https://wa.me/15125550100?text="));
        assert!(wa.contains("Drain%20repair"));
    }

    #[test]
    fn missing_phone_disables_call_and_whatsapp_with_reasons() {
        let view = ConfirmationView::from_record(&record(None, Some("u-9")));
        assert!(!view.call_action.is_enabled());
        assert!(!view.whatsapp_action.is_enabled());
        match &view.call_action {
            ContactAction::Disabled { reason } => {
                assert!(reason.contains("No phone number"));
            }
            other => panic!("expected disabled call action, got {other:?}"),
        }
        assert!(view.message_action.is_enabled());
    }

    #[test]
    fn missing_user_id_disables_in_app_messaging() {
        let view = ConfirmationView::from_record(&record(Some("+1 512 555 0100"), None));
        assert!(!view.message_action.is_enabled());
        assert!(view.call_action.is_enabled());
    }
}
