//! REST boundary for the LSM marketplace backend: typed client, raw-payload
//! normalization, and the geolocation resolver.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use lsm_core::{
    AvailabilitySlot, BookingRecord, BookingRequest, DayAvailability, GeoPoint, Pagination,
    Provider, ProviderPage, ProviderProfile, Review, SearchIntent, VerificationStatus,
};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info_span, warn, Instrument};

pub const CRATE_NAME: &str = "lsm-api";

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub base_url: String,
    pub bearer_token: Option<String>,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5000/api".to_string(),
            bearer_token: None,
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

impl ApiConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: std::env::var("LSM_API_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:5000/api".to_string()),
            bearer_token: std::env::var("LSM_API_TOKEN").ok().filter(|t| !t.is_empty()),
            timeout: Duration::from_secs(
                std::env::var("LSM_HTTP_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(20),
            ),
            user_agent: std::env::var("LSM_USER_AGENT").ok(),
        }
    }
}

/// Failure taxonomy for backend calls. Validation failures never reach this
/// layer; everything here is an auth, transport, status, or decode problem.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not authenticated: {0}")]
    Auth(&'static str),
    #[error("http status {status} for {url}: {message}")]
    Http {
        status: u16,
        url: String,
        message: String,
    },
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid response body from {url}: {message}")]
    Decode { url: String, message: String },
}

impl ApiError {
    /// Message suitable for direct display: the server's own words when it
    /// sent any, otherwise a generic transport message.
    pub fn user_message(&self) -> String {
        match self {
            ApiError::Auth(reason) => format!("Please sign in to continue ({reason})"),
            ApiError::Http { message, .. } if !message.is_empty() => message.clone(),
            ApiError::Http { status, .. } => format!("The server rejected the request ({status})"),
            ApiError::Transport(_) | ApiError::Decode { .. } => {
                "Something went wrong. Check your connection and try again.".to_string()
            }
        }
    }
}

/// Pulls a human-readable message out of a backend error body. The backend
/// is loose about the field name, so both `message` and `error` are tried.
fn extract_error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("message")
                .or_else(|| v.get("error"))
                .and_then(|m| m.as_str())
                .map(ToString::to_string)
        })
        .unwrap_or_default()
}

/// The backend surface the discovery and booking engines consume. Kept as a
/// trait so the engines can run against the HTTP client, the demo fixture
/// client, or an in-test stub interchangeably.
#[async_trait]
pub trait MarketplaceApi: Send + Sync {
    async fn search_providers(&self, intent: &SearchIntent) -> Result<ProviderPage, ApiError>;
    async fn provider_profile(&self, provider_id: &str) -> Result<ProviderProfile, ApiError>;
    async fn availability(
        &self,
        provider_id: &str,
        date: NaiveDate,
    ) -> Result<DayAvailability, ApiError>;
    async fn create_booking(&self, request: &BookingRequest) -> Result<BookingRecord, ApiError>;
}

// ---------------------------------------------------------------------------
// Raw wire shapes. The backend's payloads are loosely typed; every field that
// can be absent is optional here, and nothing outside this module touches
// them directly.
// ---------------------------------------------------------------------------

/// A numeric wire field that sometimes arrives as a string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawNumber {
    Num(f64),
    Text(String),
}

impl RawNumber {
    fn as_f64(&self) -> Option<f64> {
        match self {
            RawNumber::Num(n) => Some(*n),
            RawNumber::Text(s) => s.trim().parse().ok(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawProvider {
    pub id: Option<String>,
    pub user_id: Option<String>,
    pub name: Option<String>,
    pub category: Option<String>,
    #[serde(default)]
    pub subcategories: Vec<String>,
    pub bio: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub hourly_rate: Option<RawNumber>,
    pub starting_price: Option<RawNumber>,
    pub rating_average: Option<RawNumber>,
    pub rating_count: Option<u32>,
    pub verification: Option<String>,
    pub available: Option<bool>,
    pub estimated_arrival: Option<String>,
    pub experience_years: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPagination {
    pub current_page: Option<u32>,
    pub total_pages: Option<u32>,
    pub total_items: Option<u64>,
    pub per_page: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawSearchResponse {
    #[serde(default)]
    pub providers: Vec<RawProvider>,
    pub pagination: Option<RawPagination>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawReview {
    pub author_name: Option<String>,
    pub rating: Option<RawNumber>,
    pub comment: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawProfileResponse {
    #[serde(flatten)]
    pub provider: RawProvider,
    #[serde(default)]
    pub reviews: Vec<RawReview>,
    #[serde(default)]
    pub brand_images: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawSlot {
    pub time: Option<String>,
    pub display_time: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawAvailabilityResponse {
    pub date: Option<NaiveDate>,
    #[serde(default)]
    pub available_slots: Vec<RawSlot>,
    pub booked_slots: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawProviderContact {
    pub name: Option<String>,
    pub phone: Option<String>,
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawService {
    pub title: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawBookingResponse {
    pub id: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub total_amount: Option<RawNumber>,
    pub provider_profile: Option<RawProviderContact>,
    pub service: Option<RawService>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct BookingBody<'a> {
    provider_id: &'a str,
    scheduled_at: String,
    location_city: &'a str,
    location_state: &'a str,
    notes: &'a str,
}

// ---------------------------------------------------------------------------
// Normalization: raw wire shapes -> typed domain structs.
// ---------------------------------------------------------------------------

fn parse_verification(raw: Option<&str>) -> VerificationStatus {
    match raw.map(str::trim) {
        Some(v) if v.eq_ignore_ascii_case("verified") => VerificationStatus::Verified,
        Some(v) if v.eq_ignore_ascii_case("pending") => VerificationStatus::Pending,
        _ => VerificationStatus::Unverified,
    }
}

/// A provider record without an id cannot be acted on (no profile, no
/// booking), so it is dropped rather than surfaced half-formed.
pub fn normalize_provider(raw: RawProvider) -> Option<Provider> {
    let id = raw.id?;
    let rating_count = raw.rating_count.unwrap_or(0);
    Some(Provider {
        user_id: raw.user_id.unwrap_or_default(),
        name: raw.name.unwrap_or_else(|| "Unnamed provider".to_string()),
        category: raw.category.unwrap_or_default(),
        subcategories: raw.subcategories,
        bio: raw.bio,
        city: raw.city.unwrap_or_default(),
        state: raw.state.unwrap_or_default(),
        lat: raw.lat,
        lon: raw.lon,
        hourly_rate: raw.hourly_rate.and_then(|n| n.as_f64()),
        starting_price: raw.starting_price.and_then(|n| n.as_f64()),
        rating_average: if rating_count > 0 {
            raw.rating_average.and_then(|n| n.as_f64()).unwrap_or(0.0)
        } else {
            0.0
        },
        rating_count,
        verification: parse_verification(raw.verification.as_deref()),
        available: raw.available.unwrap_or(false),
        estimated_arrival: raw.estimated_arrival,
        experience_years: raw.experience_years,
        distance_km: None,
        id,
    })
}

pub fn normalize_pagination(raw: Option<RawPagination>, fallback_items: usize) -> Pagination {
    match raw {
        Some(raw) => Pagination {
            current_page: raw.current_page.unwrap_or(1).max(1),
            total_pages: raw.total_pages.unwrap_or(1).max(1),
            total_items: raw.total_items.unwrap_or(fallback_items as u64),
            per_page: raw.per_page.unwrap_or(fallback_items.max(1) as u32),
        },
        None => Pagination::single_page(fallback_items),
    }
}

pub fn normalize_search_response(raw: RawSearchResponse) -> ProviderPage {
    let total = raw.providers.len();
    let providers: Vec<Provider> = raw
        .providers
        .into_iter()
        .filter_map(normalize_provider)
        .collect();
    if providers.len() < total {
        warn!(
            dropped = total - providers.len(),
            "dropped provider records without an id"
        );
    }
    let count = providers.len();
    ProviderPage {
        providers,
        pagination: normalize_pagination(raw.pagination, count),
    }
}

/// Slot times arrive either as RFC 3339 timestamps or as bare `HH:MM`
/// strings that belong to the queried date.
pub fn parse_slot_time(raw: &str, date: NaiveDate) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    let time = NaiveTime::parse_from_str(raw, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
        .ok()?;
    Some(date.and_time(time).and_utc())
}

pub fn normalize_availability(
    raw: RawAvailabilityResponse,
    requested_date: NaiveDate,
    url: &str,
) -> Result<DayAvailability, ApiError> {
    let date = raw.date.unwrap_or(requested_date);
    let mut slots = Vec::with_capacity(raw.available_slots.len());
    for slot in raw.available_slots {
        let Some(time_text) = slot.time else {
            continue;
        };
        let starts_at = parse_slot_time(&time_text, date).ok_or_else(|| ApiError::Decode {
            url: url.to_string(),
            message: format!("unparseable slot time {time_text:?}"),
        })?;
        let display_time = slot
            .display_time
            .unwrap_or_else(|| starts_at.format("%H:%M").to_string());
        slots.push(AvailabilitySlot {
            starts_at,
            display_time,
        });
    }
    Ok(DayAvailability {
        date,
        slots,
        booked_count: raw.booked_slots.unwrap_or(0),
    })
}

pub fn normalize_booking_response(
    raw: RawBookingResponse,
    url: &str,
) -> Result<BookingRecord, ApiError> {
    let missing = |field: &str| ApiError::Decode {
        url: url.to_string(),
        message: format!("booking response missing {field}"),
    };
    let contact = raw.provider_profile.unwrap_or(RawProviderContact {
        name: None,
        phone: None,
        user_id: None,
    });
    Ok(BookingRecord {
        id: raw.id.ok_or_else(|| missing("id"))?,
        scheduled_at: raw.scheduled_at.ok_or_else(|| missing("scheduledAt"))?,
        total_amount: raw
            .total_amount
            .and_then(|n| n.as_f64())
            .ok_or_else(|| missing("totalAmount"))?,
        provider_name: contact.name.unwrap_or_else(|| "your provider".to_string()),
        provider_phone: contact.phone.filter(|p| !p.trim().is_empty()),
        provider_user_id: contact.user_id.filter(|u| !u.trim().is_empty()),
        service_title: raw
            .service
            .and_then(|s| s.title)
            .unwrap_or_else(|| "service booking".to_string()),
    })
}

fn normalize_profile_response(raw: RawProfileResponse, url: &str) -> Result<ProviderProfile, ApiError> {
    let provider = normalize_provider(raw.provider).ok_or_else(|| ApiError::Decode {
        url: url.to_string(),
        message: "profile response missing provider id".to_string(),
    })?;
    let reviews = raw
        .reviews
        .into_iter()
        .map(|r| Review {
            author_name: r.author_name.unwrap_or_else(|| "anonymous".to_string()),
            rating: r.rating.and_then(|n| n.as_f64()).unwrap_or(0.0),
            comment: r.comment,
            created_at: r.created_at,
        })
        .collect();
    Ok(ProviderProfile {
        provider,
        reviews,
        brand_images: raw.brand_images,
    })
}

// ---------------------------------------------------------------------------
// Production HTTP client.
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct HttpMarketplaceApi {
    client: reqwest::Client,
    base_url: String,
    bearer_token: Option<String>,
}

impl HttpMarketplaceApi {
    pub fn new(config: ApiConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            bearer_token: config.bearer_token,
        })
    }

    pub fn is_authenticated(&self) -> bool {
        self.bearer_token.is_some()
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let mut req = self.client.request(method, url);
        if let Some(token) = &self.bearer_token {
            req = req.bearer_auth(token);
        }
        req
    }

    fn search_url(&self, intent: &SearchIntent) -> (String, Vec<(&'static str, String)>) {
        // Category searches use the dedicated route; the category itself is
        // then carried in the path, not the query.
        let url = match &intent.category {
            Some(category) => format!("{}/providers/category/{category}", self.base_url),
            None => format!("{}/providers/search", self.base_url),
        };
        let mut query: Vec<(&'static str, String)> = Vec::new();
        if !intent.term.is_empty() {
            query.push(("search", intent.term.clone()));
        }
        if let Some(location) = &intent.location {
            query.push(("location", location.clone()));
        }
        query.push(("page", intent.page.to_string()));
        query.push(("limit", intent.page_size.to_string()));
        query.push(("sortBy", intent.sort.as_query_value().to_string()));
        if let Some(min) = intent.price_min {
            query.push(("priceMin", min.to_string()));
        }
        if let Some(max) = intent.price_max {
            query.push(("priceMax", max.to_string()));
        }
        if let Some(rating) = intent.min_rating {
            query.push(("rating", rating.to_string()));
        }
        if intent.available_only {
            query.push(("availability", "true".to_string()));
        }
        if intent.verified_only {
            query.push(("verified", "true".to_string()));
        }
        if let (Some(origin), Some(radius)) = (intent.origin, intent.radius_km) {
            query.push(("lat", origin.lat.to_string()));
            query.push(("lon", origin.lon.to_string()));
            query.push(("radius", radius.to_string()));
        }
        (url, query)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: String,
        query: &[(&'static str, String)],
    ) -> Result<T, ApiError> {
        let resp = self.request(reqwest::Method::GET, &url).query(query).send().await?;
        Self::decode_response(resp).await
    }

    async fn decode_response<T: serde::de::DeserializeOwned>(
        resp: reqwest::Response,
    ) -> Result<T, ApiError> {
        let status = resp.status();
        let final_url = resp.url().to_string();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ApiError::Auth("token rejected by the server"));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ApiError::Http {
                status: status.as_u16(),
                url: final_url,
                message: extract_error_message(&body),
            });
        }
        let body = resp.text().await?;
        serde_json::from_str(&body).map_err(|err| ApiError::Decode {
            url: final_url,
            message: err.to_string(),
        })
    }
}

#[async_trait]
impl MarketplaceApi for HttpMarketplaceApi {
    async fn search_providers(&self, intent: &SearchIntent) -> Result<ProviderPage, ApiError> {
        let (url, query) = self.search_url(intent);
        let span = info_span!("search_providers", url = %url, page = intent.page);
        async {
            let raw: RawSearchResponse = self.get_json(url, &query).await?;
            Ok(normalize_search_response(raw))
        }
        .instrument(span)
        .await
    }

    async fn provider_profile(&self, provider_id: &str) -> Result<ProviderProfile, ApiError> {
        let url = format!("{}/providers/profile/{provider_id}", self.base_url);
        let span = info_span!("provider_profile", url = %url);
        async {
            let raw: RawProfileResponse = self.get_json(url.clone(), &[]).await?;
            normalize_profile_response(raw, &url)
        }
        .instrument(span)
        .await
    }

    async fn availability(
        &self,
        provider_id: &str,
        date: NaiveDate,
    ) -> Result<DayAvailability, ApiError> {
        let url = format!("{}/bookings/provider/{provider_id}/availability", self.base_url);
        let query = [("date", date.format("%Y-%m-%d").to_string())];
        let span = info_span!("availability", url = %url, date = %date);
        async {
            let resp = self
                .request(reqwest::Method::GET, &url)
                .query(&query)
                .send()
                .await?;
            let raw: RawAvailabilityResponse = Self::decode_response(resp).await?;
            normalize_availability(raw, date, &url)
        }
        .instrument(span)
        .await
    }

    async fn create_booking(&self, request: &BookingRequest) -> Result<BookingRecord, ApiError> {
        // Fail fast before any network I/O: an unauthenticated booking is an
        // auth error, not a generic network error.
        if self.bearer_token.is_none() {
            return Err(ApiError::Auth("booking requires a signed-in user"));
        }
        let url = format!("{}/bookings", self.base_url);
        let body = BookingBody {
            provider_id: &request.provider_id,
            scheduled_at: request.scheduled_at.to_rfc3339(),
            location_city: &request.location_city,
            location_state: &request.location_state,
            notes: &request.notes,
        };
        let span = info_span!("create_booking", url = %url, provider_id = %request.provider_id);
        async {
            let resp = self
                .request(reqwest::Method::POST, &url)
                .json(&body)
                .send()
                .await?;
            let raw: RawBookingResponse = Self::decode_response(resp).await?;
            normalize_booking_response(raw, &url)
        }
        .instrument(span)
        .await
    }
}

// ---------------------------------------------------------------------------
// Demo mode: fixture-backed api used only when the caller explicitly opts
// into offline/demo operation. Production error handling never falls back to
// this — a failed fetch stays a failed fetch.
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct DemoMarketplaceApi {
    providers: Vec<Provider>,
    slot_times: Vec<String>,
}

impl DemoMarketplaceApi {
    pub fn from_fixture_dir(dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let dir = dir.as_ref();
        let providers_path = dir.join("providers.json");
        let raw: Vec<RawProvider> = read_json_file(&providers_path)?;
        let providers = raw.into_iter().filter_map(normalize_provider).collect();
        let slots_path = dir.join("availability.json");
        let slot_times: Vec<String> = read_json_file(&slots_path)?;
        Ok(Self {
            providers,
            slot_times,
        })
    }

    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }
}

fn read_json_file<T: serde::de::DeserializeOwned>(path: &PathBuf) -> anyhow::Result<T> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[async_trait]
impl MarketplaceApi for DemoMarketplaceApi {
    async fn search_providers(&self, intent: &SearchIntent) -> Result<ProviderPage, ApiError> {
        // The demo backend pages but does not filter; secondary filtering is
        // the client engine's job either way.
        let per_page = intent.page_size.max(1) as usize;
        let total_items = self.providers.len();
        let total_pages = total_items.max(1).div_ceil(per_page);
        let page = (intent.page.max(1) as usize).min(total_pages);
        let start = (page - 1) * per_page;
        let providers = self
            .providers
            .iter()
            .skip(start)
            .take(per_page)
            .cloned()
            .collect::<Vec<_>>();
        Ok(ProviderPage {
            providers,
            pagination: Pagination {
                current_page: page as u32,
                total_pages: total_pages as u32,
                total_items: total_items as u64,
                per_page: per_page as u32,
            },
        })
    }

    async fn provider_profile(&self, provider_id: &str) -> Result<ProviderProfile, ApiError> {
        let provider = self
            .providers
            .iter()
            .find(|p| p.id == provider_id)
            .cloned()
            .ok_or_else(|| ApiError::Http {
                status: 404,
                url: format!("demo://providers/profile/{provider_id}"),
                message: "Provider not found".to_string(),
            })?;
        Ok(ProviderProfile {
            provider,
            reviews: Vec::new(),
            brand_images: Vec::new(),
        })
    }

    async fn availability(
        &self,
        provider_id: &str,
        date: NaiveDate,
    ) -> Result<DayAvailability, ApiError> {
        let url = format!("demo://bookings/provider/{provider_id}/availability");
        let raw = RawAvailabilityResponse {
            date: Some(date),
            available_slots: self
                .slot_times
                .iter()
                .map(|t| RawSlot {
                    time: Some(t.clone()),
                    display_time: None,
                })
                .collect(),
            booked_slots: Some(0),
        };
        normalize_availability(raw, date, &url)
    }

    async fn create_booking(&self, request: &BookingRequest) -> Result<BookingRecord, ApiError> {
        let provider = self
            .providers
            .iter()
            .find(|p| p.id == request.provider_id)
            .ok_or_else(|| ApiError::Http {
                status: 404,
                url: "demo://bookings".to_string(),
                message: "Provider not found".to_string(),
            })?;
        Ok(BookingRecord {
            id: uuid::Uuid::new_v4().to_string(),
            scheduled_at: request.scheduled_at,
            total_amount: provider.starting_price.or(provider.hourly_rate).unwrap_or(0.0),
            provider_name: provider.name.clone(),
            provider_phone: None,
            provider_user_id: Some(provider.user_id.clone()),
            service_title: format!("{} service", provider.category),
        })
    }
}

// ---------------------------------------------------------------------------
// Geolocation: coordinate acquisition with a bounded wait, then reverse
// geocoding with a primary and a fallback backend.
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum GeolocationError {
    #[error("location permission denied")]
    Denied,
    #[error("no position available")]
    Unavailable,
}

/// Where coordinates come from (browser API, OS service, a test stub).
#[async_trait]
pub trait CoordinateSource: Send + Sync {
    async fn current_position(&self) -> Result<GeoPoint, GeolocationError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedAddress {
    pub city: String,
    pub state: String,
    pub country: String,
    pub street_name: Option<String>,
}

#[async_trait]
pub trait ReverseGeocoder: Send + Sync {
    async fn reverse(&self, point: GeoPoint) -> Result<ResolvedAddress, ApiError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocationStatus {
    /// Coordinates and a reverse-geocoded address are both available.
    Detected,
    /// Coordinates were acquired but no geocoding backend answered.
    CoordinatesOnly,
    /// No coordinates; manual location entry is still possible.
    NotDetected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocatedUser {
    pub point: Option<GeoPoint>,
    pub address: Option<ResolvedAddress>,
    pub status: LocationStatus,
}

impl LocatedUser {
    pub fn not_detected() -> Self {
        Self {
            point: None,
            address: None,
            status: LocationStatus::NotDetected,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct OsmReverseResponse {
    address: Option<OsmAddress>,
}

#[derive(Debug, Clone, Deserialize)]
struct OsmAddress {
    city: Option<String>,
    town: Option<String>,
    village: Option<String>,
    state: Option<String>,
    country: Option<String>,
    road: Option<String>,
}

/// Primary backend: an OSM-style `/reverse` JSON endpoint.
#[derive(Debug)]
pub struct OsmReverseGeocoder {
    client: reqwest::Client,
    base_url: String,
}

impl OsmReverseGeocoder {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl ReverseGeocoder for OsmReverseGeocoder {
    async fn reverse(&self, point: GeoPoint) -> Result<ResolvedAddress, ApiError> {
        let url = format!("{}/reverse", self.base_url.trim_end_matches('/'));
        let resp = self
            .client
            .get(&url)
            .query(&[
                ("format", "jsonv2".to_string()),
                ("lat", point.lat.to_string()),
                ("lon", point.lon.to_string()),
            ])
            .send()
            .await?;
        let raw: OsmReverseResponse = HttpMarketplaceApi::decode_response(resp).await?;
        let address = raw.address.ok_or_else(|| ApiError::Decode {
            url: url.clone(),
            message: "reverse response missing address".to_string(),
        })?;
        Ok(ResolvedAddress {
            city: address
                .city
                .or(address.town)
                .or(address.village)
                .unwrap_or_default(),
            state: address.state.unwrap_or_default(),
            country: address.country.unwrap_or_default(),
            street_name: address.road,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClientGeocodeResponse {
    city: Option<String>,
    locality: Option<String>,
    principal_subdivision: Option<String>,
    country_name: Option<String>,
}

/// Fallback backend: a BigDataCloud-style client geocode endpoint.
#[derive(Debug)]
pub struct ClientReverseGeocoder {
    client: reqwest::Client,
    base_url: String,
}

impl ClientReverseGeocoder {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl ReverseGeocoder for ClientReverseGeocoder {
    async fn reverse(&self, point: GeoPoint) -> Result<ResolvedAddress, ApiError> {
        let url = format!(
            "{}/data/reverse-geocode-client",
            self.base_url.trim_end_matches('/')
        );
        let resp = self
            .client
            .get(&url)
            .query(&[
                ("latitude", point.lat.to_string()),
                ("longitude", point.lon.to_string()),
            ])
            .send()
            .await?;
        let raw: ClientGeocodeResponse = HttpMarketplaceApi::decode_response(resp).await?;
        Ok(ResolvedAddress {
            city: raw.city.or(raw.locality).unwrap_or_default(),
            state: raw.principal_subdivision.unwrap_or_default(),
            country: raw.country_name.unwrap_or_default(),
            street_name: None,
        })
    }
}

pub struct GeolocationResolver {
    primary: Box<dyn ReverseGeocoder>,
    fallback: Box<dyn ReverseGeocoder>,
    acquire_timeout: Duration,
}

impl GeolocationResolver {
    pub fn new(primary: Box<dyn ReverseGeocoder>, fallback: Box<dyn ReverseGeocoder>) -> Self {
        Self {
            primary,
            fallback,
            acquire_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Resolve the user's location. Never errors: a denied permission, a
    /// timed-out acquisition, or two failed geocoders all degrade to a state
    /// the search flow can continue from.
    pub async fn resolve(&self, source: &dyn CoordinateSource) -> LocatedUser {
        let point = match tokio::time::timeout(self.acquire_timeout, source.current_position()).await
        {
            Ok(Ok(point)) => point,
            Ok(Err(err)) => {
                warn!(%err, "geolocation unavailable, continuing without coordinates");
                return LocatedUser::not_detected();
            }
            Err(_) => {
                warn!(
                    timeout_secs = self.acquire_timeout.as_secs(),
                    "geolocation acquisition timed out, continuing without coordinates"
                );
                return LocatedUser::not_detected();
            }
        };

        let address = match self.primary.reverse(point).await {
            Ok(address) => Some(address),
            Err(primary_err) => {
                warn!(%primary_err, "primary reverse geocoder failed, trying fallback");
                match self.fallback.reverse(point).await {
                    Ok(address) => Some(address),
                    Err(fallback_err) => {
                        warn!(%fallback_err, "fallback reverse geocoder failed");
                        None
                    }
                }
            }
        };

        let status = if address.is_some() {
            LocationStatus::Detected
        } else {
            LocationStatus::CoordinatesOnly
        };
        LocatedUser {
            point: Some(point),
            address,
            status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn rates_accept_numbers_and_strings() {
        let raw: RawProvider = serde_json::from_str(
            r#"{"id":"p1","name":"Ada","category":"plumbing","hourlyRate":"45.5","ratingAverage":4.5,"ratingCount":12}"#,
        )
        .expect("parse raw provider");
        let provider = normalize_provider(raw).expect("provider with id");
        assert_eq!(provider.hourly_rate, Some(45.5));
        assert_eq!(provider.rating(), Some(4.5));
    }

    #[test]
    fn provider_without_id_is_dropped() {
        let raw: RawSearchResponse =
            serde_json::from_str(r#"{"providers":[{"name":"ghost"}]}"#).expect("parse");
        let page = normalize_search_response(raw);
        assert!(page.providers.is_empty());
        assert_eq!(page.pagination.current_page, 1);
    }

    #[test]
    fn unrated_provider_reports_no_rating() {
        let raw: RawProvider =
            serde_json::from_str(r#"{"id":"p2","ratingAverage":4.9,"ratingCount":0}"#)
                .expect("parse");
        let provider = normalize_provider(raw).expect("provider");
        assert_eq!(provider.rating(), None);
    }

    #[test]
    fn slot_times_accept_rfc3339_and_clock_strings() {
        let date = NaiveDate::from_ymd_opt(2024, 6, 1).expect("date");
        let from_rfc = parse_slot_time("2024-06-01T10:00:00Z", date).expect("rfc slot");
        let from_clock = parse_slot_time("10:00", date).expect("clock slot");
        let expected = Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).single().expect("ts");
        assert_eq!(from_rfc, expected);
        assert_eq!(from_clock, expected);
        assert!(parse_slot_time("half past ten", date).is_none());
    }

    #[test]
    fn empty_slot_day_normalizes_without_error() {
        let date = NaiveDate::from_ymd_opt(2024, 6, 1).expect("date");
        let raw = RawAvailabilityResponse {
            date: Some(date),
            available_slots: vec![],
            booked_slots: Some(7),
        };
        let day = normalize_availability(raw, date, "test://availability").expect("normalize");
        assert!(day.slots.is_empty());
        assert_eq!(day.booked_count, 7);
    }

    #[test]
    fn server_error_message_is_extracted_verbatim() {
        assert_eq!(
            extract_error_message(r#"{"message":"Slot already taken"}"#),
            "Slot already taken"
        );
        assert_eq!(
            extract_error_message(r#"{"error":"Provider unavailable"}"#),
            "Provider unavailable"
        );
        assert_eq!(extract_error_message("<html>oops</html>"), "");
    }

    #[tokio::test]
    async fn booking_without_token_fails_fast_with_auth_error() {
        // Unroutable base URL on purpose: the auth check must reject before
        // any connection attempt.
        let api = HttpMarketplaceApi::new(ApiConfig {
            base_url: "http://192.0.2.1:1/api".to_string(),
            bearer_token: None,
            ..Default::default()
        })
        .expect("client");
        let request = BookingRequest {
            provider_id: "p1".to_string(),
            scheduled_at: Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).single().expect("ts"),
            location_city: "Austin".to_string(),
            location_state: "TX".to_string(),
            notes: String::new(),
        };
        let err = api.create_booking(&request).await.expect_err("must fail fast");
        assert!(matches!(err, ApiError::Auth(_)));
    }

    #[test]
    fn category_search_uses_category_route() {
        let api = HttpMarketplaceApi::new(ApiConfig::default()).expect("client");
        let intent = SearchIntent {
            term: "wiring".to_string(),
            category: Some("electrical".to_string()),
            ..Default::default()
        };
        let (url, query) = api.search_url(&intent);
        assert!(url.ends_with("/providers/category/electrical"));
        assert!(query.iter().any(|(k, v)| *k == "search" && v == "wiring"));

        let free_text = SearchIntent {
            term: "wiring".to_string(),
            ..Default::default()
        };
        let (url, _) = api.search_url(&free_text);
        assert!(url.ends_with("/providers/search"));
    }

    struct StubSource {
        result: Result<GeoPoint, GeolocationError>,
    }

    #[async_trait]
    impl CoordinateSource for StubSource {
        async fn current_position(&self) -> Result<GeoPoint, GeolocationError> {
            match &self.result {
                Ok(p) => Ok(*p),
                Err(GeolocationError::Denied) => Err(GeolocationError::Denied),
                Err(GeolocationError::Unavailable) => Err(GeolocationError::Unavailable),
            }
        }
    }

    struct HangingSource;

    #[async_trait]
    impl CoordinateSource for HangingSource {
        async fn current_position(&self) -> Result<GeoPoint, GeolocationError> {
            std::future::pending().await
        }
    }

    struct StubGeocoder {
        fail: bool,
        calls: AtomicUsize,
        city: &'static str,
    }

    impl StubGeocoder {
        fn new(fail: bool, city: &'static str) -> Self {
            Self {
                fail,
                calls: AtomicUsize::new(0),
                city,
            }
        }
    }

    #[async_trait]
    impl ReverseGeocoder for StubGeocoder {
        async fn reverse(&self, _point: GeoPoint) -> Result<ResolvedAddress, ApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ApiError::Http {
                    status: 503,
                    url: "stub://geocode".to_string(),
                    message: String::new(),
                });
            }
            Ok(ResolvedAddress {
                city: self.city.to_string(),
                state: "TX".to_string(),
                country: "US".to_string(),
                street_name: None,
            })
        }
    }

    #[tokio::test]
    async fn denied_permission_degrades_to_not_detected() {
        let resolver = GeolocationResolver::new(
            Box::new(StubGeocoder::new(false, "Austin")),
            Box::new(StubGeocoder::new(false, "Austin")),
        );
        let located = resolver
            .resolve(&StubSource {
                result: Err(GeolocationError::Denied),
            })
            .await;
        assert_eq!(located.status, LocationStatus::NotDetected);
        assert!(located.point.is_none());
    }

    #[tokio::test]
    async fn acquisition_timeout_degrades_to_not_detected() {
        let resolver = GeolocationResolver::new(
            Box::new(StubGeocoder::new(false, "Austin")),
            Box::new(StubGeocoder::new(false, "Austin")),
        )
        .with_acquire_timeout(Duration::from_millis(20));
        let located = resolver.resolve(&HangingSource).await;
        assert_eq!(located.status, LocationStatus::NotDetected);
    }

    #[tokio::test]
    async fn fallback_geocoder_answers_when_primary_fails() {
        let primary = Box::new(StubGeocoder::new(true, "Primary"));
        let fallback = Box::new(StubGeocoder::new(false, "Fallback City"));
        let resolver = GeolocationResolver::new(primary, fallback);
        let located = resolver
            .resolve(&StubSource {
                result: Ok(GeoPoint { lat: 30.27, lon: -97.74 }),
            })
            .await;
        assert_eq!(located.status, LocationStatus::Detected);
        assert_eq!(located.address.expect("address").city, "Fallback City");
    }

    #[tokio::test]
    async fn both_geocoders_failing_keeps_coordinates() {
        let resolver = GeolocationResolver::new(
            Box::new(StubGeocoder::new(true, "a")),
            Box::new(StubGeocoder::new(true, "b")),
        );
        let located = resolver
            .resolve(&StubSource {
                result: Ok(GeoPoint { lat: 30.27, lon: -97.74 }),
            })
            .await;
        assert_eq!(located.status, LocationStatus::CoordinatesOnly);
        assert!(located.point.is_some());
        assert!(located.address.is_none());
    }
}
