//! Provider discovery engine: query normalization, the request-keyed results
//! cache, client-side filtering/sorting, and radius expansion.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use lsm_api::{ApiError, MarketplaceApi};
use lsm_core::{GeoPoint, Provider, ProviderPage, SearchIntent, SortKey};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::debug;

pub const CRATE_NAME: &str = "lsm-search";

// ---------------------------------------------------------------------------
// Query normalization.
// ---------------------------------------------------------------------------

/// Build the canonical search intent from raw UI input. Trims the free text,
/// carries the selected category, and drops a radius that has no origin to
/// apply to.
pub fn build_intent(raw_text: &str, selected_category: Option<String>, base: SearchIntent) -> SearchIntent {
    let mut intent = base;
    intent.term = raw_text.trim().to_string();
    intent.category = selected_category
        .map(|c| c.trim().to_lowercase())
        .filter(|c| !c.is_empty());
    if intent.origin.is_none() {
        intent.radius_km = None;
    }
    intent
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(needle)
}

/// Light suffix stripping so trade-name variants compare equal:
/// "plumber", "plumbers" and "plumbing" all stem to "plumb".
fn stem(token: &str) -> &str {
    for suffix in ["ing", "ers", "er", "s"] {
        if let Some(base) = token.strip_suffix(suffix) {
            if base.len() >= 4 {
                return base;
            }
        }
    }
    token
}

fn tokens(text: &str) -> impl Iterator<Item = &str> {
    text.split(|c: char| !c.is_alphanumeric()).filter(|t| !t.is_empty())
}

fn term_matches_field(needle: &str, field: &str) -> bool {
    if contains_ci(field, needle) {
        return true;
    }
    let field_lower = field.to_lowercase();
    tokens(needle).any(|nt| {
        let ns = stem(nt);
        tokens(&field_lower).any(|ft| stem(ft) == ns)
    })
}

/// The intent's match target, applied to one provider. A selected category
/// takes precedence and reduces matching to category equality; otherwise the
/// free text is tested against category, subcategories, and bio with OR.
/// Empty text and no category matches everything.
pub fn matches_intent(intent: &SearchIntent, provider: &Provider) -> bool {
    if let Some(category) = &intent.category {
        return provider.category.eq_ignore_ascii_case(category);
    }
    let needle = intent.term.trim().to_lowercase();
    if needle.is_empty() {
        return true;
    }
    if term_matches_field(&needle, &provider.category) {
        return true;
    }
    if provider
        .subcategories
        .iter()
        .any(|sub| term_matches_field(&needle, sub))
    {
        return true;
    }
    provider
        .bio
        .as_deref()
        .is_some_and(|bio| term_matches_field(&needle, bio))
}

// ---------------------------------------------------------------------------
// Client-side filter + sort over an already-fetched page.
// ---------------------------------------------------------------------------

fn location_matches(intent: &SearchIntent, provider: &Provider) -> bool {
    let Some(location) = intent.location.as_deref() else {
        return true;
    };
    let needle = location.trim().to_lowercase();
    if needle.is_empty() {
        return true;
    }
    contains_ci(&provider.city, &needle) || contains_ci(&provider.state, &needle)
}

fn price_matches(intent: &SearchIntent, provider: &Provider) -> bool {
    if intent.price_min.is_none() && intent.price_max.is_none() {
        return true;
    }
    // A bounded price filter excludes providers that do not publish a rate.
    let Some(rate) = provider.hourly_rate else {
        return false;
    };
    intent.price_min.is_none_or(|min| rate >= min)
        && intent.price_max.is_none_or(|max| rate <= max)
}

fn rating_matches(intent: &SearchIntent, provider: &Provider) -> bool {
    intent
        .min_rating
        .is_none_or(|threshold| provider.rating().unwrap_or(0.0) >= threshold)
}

/// Secondary filtering of an already-fetched page. Predicates are ANDed;
/// the output is always a subset of the input, in input order.
pub fn filter(providers: &[Provider], intent: &SearchIntent) -> Vec<Provider> {
    providers
        .iter()
        .filter(|p| matches_intent(intent, p))
        .filter(|p| location_matches(intent, p))
        .filter(|p| price_matches(intent, p))
        .filter(|p| rating_matches(intent, p))
        .filter(|p| !intent.available_only || p.available)
        .filter(|p| !intent.verified_only || p.is_verified())
        .cloned()
        .collect()
}

fn cmp_f64_asc(a: f64, b: f64) -> std::cmp::Ordering {
    a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal)
}

fn cmp_opt_asc(a: Option<f64>, b: Option<f64>) -> std::cmp::Ordering {
    // Missing values sort after valued ones and stay equal among themselves.
    match (a, b) {
        (Some(a), Some(b)) => cmp_f64_asc(a, b),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    }
}

/// Stable sort of a provider list by the given key. Ties keep their original
/// relative order, so sorting an already-sorted list is a no-op.
pub fn sort(mut providers: Vec<Provider>, key: SortKey) -> Vec<Provider> {
    match key {
        SortKey::Rating => providers.sort_by(|a, b| {
            cmp_f64_asc(b.rating().unwrap_or(0.0), a.rating().unwrap_or(0.0))
        }),
        SortKey::PriceLow => providers.sort_by(|a, b| cmp_opt_asc(a.hourly_rate, b.hourly_rate)),
        SortKey::PriceHigh => {
            providers.sort_by(|a, b| cmp_opt_asc(b.hourly_rate, a.hourly_rate));
            // Reversing the ascending comparison would also move missing
            // rates to the front; push them back to the end.
            providers.sort_by_key(|p| p.hourly_rate.is_none());
        }
        SortKey::Distance => providers.sort_by(|a, b| cmp_opt_asc(a.distance_km, b.distance_km)),
        SortKey::Name => providers.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase())),
        SortKey::Experience => {
            providers.sort_by(|a, b| {
                cmp_opt_asc(
                    b.experience_years.map(f64::from),
                    a.experience_years.map(f64::from),
                )
            });
            providers.sort_by_key(|p| p.experience_years.is_none());
        }
    }
    providers
}

const EARTH_RADIUS_KM: f64 = 6371.0;

pub fn haversine_km(a: GeoPoint, b: GeoPoint) -> f64 {
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lon = (b.lon - a.lon).to_radians();
    let lat_a = a.lat.to_radians();
    let lat_b = b.lat.to_radians();
    let h = (d_lat / 2.0).sin().powi(2) + lat_a.cos() * lat_b.cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
}

/// Precompute `distance_km` for every provider with coordinates. Without an
/// origin every distance stays `None` and distance sorting keeps input order.
pub fn annotate_distances(providers: &mut [Provider], origin: Option<GeoPoint>) {
    for provider in providers.iter_mut() {
        provider.distance_km = match (origin, provider.coordinates()) {
            (Some(from), Some(to)) => Some(haversine_km(from, to)),
            _ => None,
        };
    }
}

// ---------------------------------------------------------------------------
// Results cache: request-keyed, in-flight de-duplicating, tag-invalidated,
// sequence-guarded. The one shared mutable resource of the engine; all writes
// go through it and readers observe it via subscription events.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Key over the full parameter tuple. Serializing the intent keeps the
    /// tuple canonical (struct field order is stable).
    pub fn from_intent(intent: &SearchIntent) -> Self {
        let canonical = serde_json::to_string(intent).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0[..12.min(self.0.len())])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheTag {
    ProviderList,
}

#[derive(Debug, Clone)]
pub enum CacheEvent {
    Updated(CacheKey),
    Invalidated(CacheTag),
}

pub type SharedPage = Arc<ProviderPage>;
type SearchOutcome = Result<SharedPage, Arc<ApiError>>;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("search failed: {0}")]
    Fetch(Arc<ApiError>),
    #[error("search request was abandoned before completing")]
    Abandoned,
}

impl CacheError {
    pub fn user_message(&self) -> String {
        match self {
            CacheError::Fetch(err) => err.user_message(),
            CacheError::Abandoned => "The search was cancelled. Try again.".to_string(),
        }
    }
}

struct CacheEntry {
    page: SharedPage,
    seq: u64,
    tag: CacheTag,
}

struct InFlight {
    seq: u64,
    rx: watch::Receiver<Option<SearchOutcome>>,
}

struct CacheState {
    entries: HashMap<CacheKey, CacheEntry>,
    inflight: HashMap<CacheKey, InFlight>,
}

pub struct ResultsCache {
    api: Arc<dyn MarketplaceApi>,
    state: Mutex<CacheState>,
    events: broadcast::Sender<CacheEvent>,
    seq: AtomicU64,
}

impl ResultsCache {
    pub fn new(api: Arc<dyn MarketplaceApi>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            api,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                inflight: HashMap::new(),
            }),
            events,
            seq: AtomicU64::new(0),
        }
    }

    /// Observe cache changes. Independent UI fragments subscribe here instead
    /// of holding their own copies of server state.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    /// Read-through fetch. Returns the cached page when present; otherwise
    /// joins an identical in-flight request or issues a new one. Two callers
    /// with the same parameter tuple never produce two concurrent network
    /// requests.
    pub async fn get_or_fetch(&self, intent: &SearchIntent) -> Result<SharedPage, CacheError> {
        let key = CacheKey::from_intent(intent);
        let joined = {
            let state = self.state.lock().await;
            if let Some(entry) = state.entries.get(&key) {
                return Ok(Arc::clone(&entry.page));
            }
            state.inflight.get(&key).map(|flight| flight.rx.clone())
        };
        if let Some(rx) = joined {
            return wait_for_flight(rx).await;
        }
        self.execute_fetch(key, intent.clone(), false).await
    }

    /// Force a fresh network request for this intent, bypassing both the
    /// cached entry and any in-flight join. A refresh racing an older fetch
    /// is resolved by the sequence guard: the later-issued response wins and
    /// the out-of-order one is discarded.
    pub async fn refresh(&self, intent: &SearchIntent) -> Result<SharedPage, CacheError> {
        let key = CacheKey::from_intent(intent);
        self.execute_fetch(key, intent.clone(), true).await
    }

    /// Drop the entry for one parameter tuple.
    pub async fn invalidate_key(&self, intent: &SearchIntent) {
        let key = CacheKey::from_intent(intent);
        let mut state = self.state.lock().await;
        if state.entries.remove(&key).is_some() {
            let _ = self.events.send(CacheEvent::Updated(key));
        }
    }

    /// Drop every provider-list entry. This is the mutation path: anything
    /// that changes provider data on the server invalidates all list caches.
    pub async fn invalidate_provider_lists(&self) {
        let mut state = self.state.lock().await;
        state
            .entries
            .retain(|_, entry| entry.tag != CacheTag::ProviderList);
        let _ = self.events.send(CacheEvent::Invalidated(CacheTag::ProviderList));
    }

    pub async fn cached_page(&self, intent: &SearchIntent) -> Option<SharedPage> {
        let key = CacheKey::from_intent(intent);
        let state = self.state.lock().await;
        state.entries.get(&key).map(|entry| Arc::clone(&entry.page))
    }

    async fn execute_fetch(
        &self,
        key: CacheKey,
        intent: SearchIntent,
        force: bool,
    ) -> Result<SharedPage, CacheError> {
        let seq = self.seq.fetch_add(1, AtomicOrdering::SeqCst);
        let (tx, own_rx) = watch::channel(None);
        {
            let mut state = self.state.lock().await;
            if !force {
                if let Some(existing) = state.inflight.get(&key) {
                    let rx = existing.rx.clone();
                    drop(state);
                    return wait_for_flight(rx).await;
                }
            }
            state.inflight.insert(key.clone(), InFlight { seq, rx: own_rx });
        }

        let result = self.api.search_providers(&intent).await;

        let outcome: SearchOutcome = {
            let mut state = self.state.lock().await;
            if state.inflight.get(&key).map(|flight| flight.seq) == Some(seq) {
                state.inflight.remove(&key);
            }
            match result {
                Ok(page) => {
                    let page = Arc::new(page);
                    let superseded = state.entries.get(&key).is_some_and(|e| e.seq > seq);
                    if superseded {
                        debug!(%key, seq, "discarding out-of-order search response");
                        let current = state
                            .entries
                            .get(&key)
                            .expect("superseding entry is present")
                            .page
                            .clone();
                        Ok(current)
                    } else {
                        state.entries.insert(
                            key.clone(),
                            CacheEntry {
                                page: Arc::clone(&page),
                                seq,
                                tag: CacheTag::ProviderList,
                            },
                        );
                        let _ = self.events.send(CacheEvent::Updated(key.clone()));
                        Ok(page)
                    }
                }
                Err(err) => Err(Arc::new(err)),
            }
        };

        let _ = tx.send(Some(outcome.clone()));
        outcome.map_err(CacheError::Fetch)
    }
}

async fn wait_for_flight(
    mut rx: watch::Receiver<Option<SearchOutcome>>,
) -> Result<SharedPage, CacheError> {
    loop {
        let current = rx.borrow_and_update().clone();
        if let Some(outcome) = current {
            return outcome.map_err(CacheError::Fetch);
        }
        if rx.changed().await.is_err() {
            return Err(CacheError::Abandoned);
        }
    }
}

// ---------------------------------------------------------------------------
// Radius expansion: the sparse-result state machine.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct RadiusConfig {
    pub increment_km: f64,
    pub ceiling_km: f64,
    /// Result counts at or below this are "sparse".
    pub sparse_threshold: usize,
    /// The sparse offer is only made at small radii.
    pub offer_max_radius_km: f64,
}

impl Default for RadiusConfig {
    fn default() -> Self {
        Self {
            increment_km: 5.0,
            ceiling_km: 25.0,
            sparse_threshold: 1,
            offer_max_radius_km: 10.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadiusPhase {
    Normal,
    Sparse,
    Expanding,
    Exhausted,
}

/// What the UI should show after a result count was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadiusPresentation {
    Results,
    /// Results are shown together with a "widen the search?" offer.
    SparseOffer,
    NoResults { can_widen: bool },
}

#[derive(Debug)]
pub struct RadiusExpansionController {
    config: RadiusConfig,
    radius_km: f64,
    phase: RadiusPhase,
}

impl RadiusExpansionController {
    pub fn new(initial_radius_km: f64, config: RadiusConfig) -> Self {
        Self {
            radius_km: initial_radius_km.min(config.ceiling_km),
            config,
            phase: RadiusPhase::Normal,
        }
    }

    pub fn radius_km(&self) -> f64 {
        self.radius_km
    }

    pub fn phase(&self) -> RadiusPhase {
        self.phase
    }

    fn at_ceiling(&self) -> bool {
        self.radius_km >= self.config.ceiling_km
    }

    /// Feed the result count of the latest fetch into the machine. Zero
    /// results go straight to the no-results presentation (never the sparse
    /// banner); `Exhausted` is only reached with zero results at the ceiling.
    pub fn observe_result_count(&mut self, count: usize) -> RadiusPresentation {
        if count == 0 {
            if self.at_ceiling() {
                self.phase = RadiusPhase::Exhausted;
                return RadiusPresentation::NoResults { can_widen: false };
            }
            self.phase = RadiusPhase::Normal;
            return RadiusPresentation::NoResults { can_widen: true };
        }
        if count <= self.config.sparse_threshold
            && self.radius_km <= self.config.offer_max_radius_km
            && !self.at_ceiling()
        {
            self.phase = RadiusPhase::Sparse;
            return RadiusPresentation::SparseOffer;
        }
        self.phase = RadiusPhase::Normal;
        RadiusPresentation::Results
    }

    /// Widen the radius by one increment, capped at the ceiling. Returns the
    /// new radius to refetch with, or `None` when already at the ceiling —
    /// repeated requests past the ceiling are no-ops.
    pub fn accept_expansion(&mut self) -> Option<f64> {
        if self.at_ceiling() {
            return None;
        }
        self.radius_km = (self.radius_km + self.config.increment_km).min(self.config.ceiling_km);
        self.phase = RadiusPhase::Expanding;
        Some(self.radius_km)
    }

    /// Keep the current (possibly sparse) result set.
    pub fn decline_expansion(&mut self) {
        self.phase = RadiusPhase::Normal;
    }
}
