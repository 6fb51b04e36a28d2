//! Core domain model for the LSM marketplace client.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "lsm-core";

/// Server-assigned verification state of a provider listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VerificationStatus {
    #[default]
    Unverified,
    Pending,
    Verified,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

/// A service professional listed in the marketplace. All fields are
/// server-owned; the client only ever reads them. `distance_km` is the one
/// exception: it is computed client-side from the search origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provider {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub category: String,
    pub subcategories: Vec<String>,
    pub bio: Option<String>,
    pub city: String,
    pub state: String,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub hourly_rate: Option<f64>,
    pub starting_price: Option<f64>,
    pub rating_average: f64,
    pub rating_count: u32,
    pub verification: VerificationStatus,
    pub available: bool,
    pub estimated_arrival: Option<String>,
    pub experience_years: Option<u32>,
    pub distance_km: Option<f64>,
}

impl Provider {
    /// Rating average is only meaningful when at least one rating exists.
    pub fn rating(&self) -> Option<f64> {
        if self.rating_count > 0 {
            Some(self.rating_average)
        } else {
            None
        }
    }

    pub fn coordinates(&self) -> Option<GeoPoint> {
        match (self.lat, self.lon) {
            (Some(lat), Some(lon)) => Some(GeoPoint { lat, lon }),
            _ => None,
        }
    }

    pub fn is_verified(&self) -> bool {
        self.verification == VerificationStatus::Verified
    }
}

/// Supported result orderings for provider lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    #[default]
    Rating,
    PriceLow,
    PriceHigh,
    Distance,
    Name,
    Experience,
}

impl SortKey {
    /// Wire value used by the backend's `sortBy` query parameter.
    pub fn as_query_value(&self) -> &'static str {
        match self {
            SortKey::Rating => "rating",
            SortKey::PriceLow => "price_low",
            SortKey::PriceHigh => "price_high",
            SortKey::Distance => "distance",
            SortKey::Name => "name",
            SortKey::Experience => "experience",
        }
    }
}

/// Normalized search parameters driving one provider-list request.
///
/// `radius_km` is only meaningful together with `origin`; the normalizer
/// drops it when no coordinates are present. `category`, when set, takes
/// precedence over free-text matching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchIntent {
    pub term: String,
    pub category: Option<String>,
    pub location: Option<String>,
    pub origin: Option<GeoPoint>,
    pub radius_km: Option<f64>,
    pub price_min: Option<f64>,
    pub price_max: Option<f64>,
    pub min_rating: Option<f64>,
    pub available_only: bool,
    pub verified_only: bool,
    pub sort: SortKey,
    pub page: u32,
    pub page_size: u32,
}

impl Default for SearchIntent {
    fn default() -> Self {
        Self {
            term: String::new(),
            category: None,
            location: None,
            origin: None,
            radius_km: None,
            price_min: None,
            price_max: None,
            min_rating: None,
            available_only: false,
            verified_only: false,
            sort: SortKey::default(),
            page: 1,
            page_size: 20,
        }
    }
}

/// One bookable time window for a provider on a specific date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilitySlot {
    pub starts_at: DateTime<Utc>,
    pub display_time: String,
}

/// Open slots for one (provider, date) query. Produced fresh per query and
/// never reused across dates. An empty `slots` list is a valid state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayAvailability {
    pub date: NaiveDate,
    pub slots: Vec<AvailabilitySlot>,
    pub booked_count: u32,
}

/// A booking submission. Only constructed from a draft that passed local
/// validation (a slot must have been selected).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingRequest {
    pub provider_id: String,
    pub scheduled_at: DateTime<Utc>,
    pub location_city: String,
    pub location_state: String,
    pub notes: String,
}

/// The server-confirmed result of a successful booking submission.
/// Immutable from the client's perspective.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookingRecord {
    pub id: String,
    pub scheduled_at: DateTime<Utc>,
    pub total_amount: f64,
    pub provider_name: String,
    pub provider_phone: Option<String>,
    pub provider_user_id: Option<String>,
    pub service_title: String,
}

/// Paging state, always derived from the latest server response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub current_page: u32,
    pub total_pages: u32,
    pub total_items: u64,
    pub per_page: u32,
}

impl Pagination {
    pub fn single_page(items: usize) -> Self {
        Self {
            current_page: 1,
            total_pages: 1,
            total_items: items as u64,
            per_page: items.max(1) as u32,
        }
    }

    pub fn has_next(&self) -> bool {
        self.current_page < self.total_pages
    }
}

/// One page of search results as returned by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderPage {
    pub providers: Vec<Provider>,
    pub pagination: Pagination,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Review {
    pub author_name: String,
    pub rating: f64,
    pub comment: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

/// Extended profile shape returned by `GET /providers/profile/:id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderProfile {
    pub provider: Provider,
    pub reviews: Vec<Review>,
    pub brand_images: Vec<String>,
}
