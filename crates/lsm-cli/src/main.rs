//! Command-line front end for the LSM marketplace client engine.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use lsm_api::{
    ApiConfig, ClientReverseGeocoder, CoordinateSource, DemoMarketplaceApi, GeolocationError,
    GeolocationResolver, HttpMarketplaceApi, MarketplaceApi, OsmReverseGeocoder,
};
use lsm_booking::{
    AvailabilityResolver, BookingDraft, BookingTransactionCoordinator, ConfirmationView,
    ContactAction,
};
use lsm_core::{AvailabilitySlot, GeoPoint, SearchIntent, SortKey};
use lsm_search::{
    annotate_distances, build_intent, filter, sort, RadiusConfig, RadiusExpansionController,
    RadiusPresentation, ResultsCache,
};
use serde::Deserialize;
use tracing::debug;

#[derive(Debug, Parser)]
#[command(name = "lsm-cli")]
#[command(about = "Local service marketplace client")]
struct Cli {
    /// Run against bundled demo fixtures instead of the live backend.
    #[arg(long, global = true)]
    demo: bool,
    /// Print machine-readable JSON instead of human output.
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Search providers by free text and/or category.
    Search {
        #[arg(default_value = "")]
        term: String,
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        location: Option<String>,
        #[arg(long, requires = "lon")]
        lat: Option<f64>,
        #[arg(long, requires = "lat")]
        lon: Option<f64>,
        #[arg(long)]
        radius: Option<f64>,
        #[arg(long)]
        price_min: Option<f64>,
        #[arg(long)]
        price_max: Option<f64>,
        #[arg(long)]
        min_rating: Option<f64>,
        #[arg(long)]
        available: bool,
        #[arg(long)]
        verified: bool,
        #[arg(long, default_value = "rating")]
        sort: String,
        #[arg(long, default_value_t = 1)]
        page: u32,
    },
    /// Show one provider's extended profile.
    Profile { provider_id: String },
    /// List a provider's open slots for a date (YYYY-MM-DD).
    Availability {
        provider_id: String,
        date: NaiveDate,
    },
    /// Book a provider at a chosen slot time (RFC 3339).
    Book {
        provider_id: String,
        slot: DateTime<Utc>,
        #[arg(long, default_value = "")]
        city: String,
        #[arg(long, default_value = "")]
        state: String,
        #[arg(long, default_value = "")]
        notes: String,
    },
    /// Reverse-geocode coordinates through the primary/fallback backends.
    Locate { lat: f64, lon: f64 },
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
    #[serde(default)]
    api: FileApiConfig,
    #[serde(default)]
    search: FileSearchConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileApiConfig {
    base_url: Option<String>,
    token: Option<String>,
    timeout_secs: Option<u64>,
    user_agent: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileSearchConfig {
    radius_increment_km: Option<f64>,
    radius_ceiling_km: Option<f64>,
    sparse_threshold: Option<usize>,
    page_size: Option<u32>,
}

#[derive(Debug, Clone)]
struct LsmConfig {
    api: ApiConfig,
    radius: RadiusConfig,
    page_size: u32,
    geocode_primary_url: String,
    geocode_fallback_url: String,
    geo_acquire_timeout: Duration,
}

impl LsmConfig {
    /// Environment variables win; the optional `lsm.yaml` fills the rest.
    fn load(workspace_root: &Path) -> Result<Self> {
        let file = read_file_config(&workspace_root.join("lsm.yaml"))?;
        let mut api = ApiConfig::from_env();
        if std::env::var("LSM_API_BASE_URL").is_err() {
            if let Some(base_url) = file.api.base_url {
                api.base_url = base_url;
            }
        }
        if api.bearer_token.is_none() {
            api.bearer_token = file.api.token.filter(|t| !t.is_empty());
        }
        if let Some(timeout) = file.api.timeout_secs {
            if std::env::var("LSM_HTTP_TIMEOUT_SECS").is_err() {
                api.timeout = Duration::from_secs(timeout);
            }
        }
        if api.user_agent.is_none() {
            api.user_agent = file.api.user_agent;
        }

        let mut radius = RadiusConfig::default();
        if let Some(increment) = file.search.radius_increment_km {
            radius.increment_km = increment;
        }
        if let Some(ceiling) = file.search.radius_ceiling_km {
            radius.ceiling_km = ceiling;
        }
        if let Some(threshold) = file.search.sparse_threshold {
            radius.sparse_threshold = threshold;
        }

        Ok(Self {
            api,
            radius,
            page_size: file.search.page_size.unwrap_or(20),
            geocode_primary_url: std::env::var("LSM_GEOCODE_PRIMARY_URL")
                .unwrap_or_else(|_| "https://nominatim.openstreetmap.org".to_string()),
            geocode_fallback_url: std::env::var("LSM_GEOCODE_FALLBACK_URL")
                .unwrap_or_else(|_| "https://api.bigdatacloud.net".to_string()),
            geo_acquire_timeout: Duration::from_secs(
                std::env::var("LSM_GEO_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(10),
            ),
        })
    }
}

fn read_file_config(path: &Path) -> Result<FileConfig> {
    if !path.exists() {
        return Ok(FileConfig::default());
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn parse_sort(value: &str) -> Result<SortKey> {
    Ok(match value {
        "rating" => SortKey::Rating,
        "price_low" => SortKey::PriceLow,
        "price_high" => SortKey::PriceHigh,
        "distance" => SortKey::Distance,
        "name" => SortKey::Name,
        "experience" => SortKey::Experience,
        other => bail!(
            "unknown sort key {other:?} (expected rating, price_low, price_high, distance, name, experience)"
        ),
    })
}

fn build_api(cli: &Cli, config: &LsmConfig, workspace_root: &Path) -> Result<Arc<dyn MarketplaceApi>> {
    if cli.demo {
        let demo = DemoMarketplaceApi::from_fixture_dir(workspace_root.join("fixtures/demo"))?;
        debug!(providers = demo.provider_count(), "running in demo mode");
        Ok(Arc::new(demo))
    } else {
        Ok(Arc::new(HttpMarketplaceApi::new(config.api.clone())?))
    }
}

struct FixedCoordinateSource {
    point: GeoPoint,
}

#[async_trait::async_trait]
impl CoordinateSource for FixedCoordinateSource {
    async fn current_position(&self) -> Result<GeoPoint, GeolocationError> {
        Ok(self.point)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let workspace_root = PathBuf::from(".");
    let config = LsmConfig::load(&workspace_root)?;
    let api = build_api(&cli, &config, &workspace_root)?;

    match &cli.command {
        Commands::Search {
            term,
            category,
            location,
            lat,
            lon,
            radius,
            price_min,
            price_max,
            min_rating,
            available,
            verified,
            sort: sort_arg,
            page,
        } => {
            let origin = match (lat, lon) {
                (Some(lat), Some(lon)) => Some(GeoPoint { lat: *lat, lon: *lon }),
                _ => None,
            };
            let base = SearchIntent {
                location: location.clone().filter(|l| !l.is_empty()),
                origin,
                radius_km: *radius,
                price_min: *price_min,
                price_max: *price_max,
                min_rating: *min_rating,
                available_only: *available,
                verified_only: *verified,
                sort: parse_sort(sort_arg)?,
                page: *page,
                page_size: config.page_size,
                ..Default::default()
            };
            let intent = build_intent(term, category.clone(), base);
            run_search(api, &config, intent, cli.json).await?;
        }
        Commands::Profile { provider_id } => {
            let profile = api
                .provider_profile(provider_id)
                .await
                .map_err(|err| anyhow::anyhow!(err.user_message()))?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&profile)?);
            } else {
                let p = &profile.provider;
                println!("{} [{}] ({}, {})", p.name, p.category, p.city, p.state);
                match p.rating() {
                    Some(avg) => println!("  rating {avg:.1} ({} reviews)", p.rating_count),
                    None => println!("  not yet rated"),
                }
                if let Some(rate) = p.hourly_rate {
                    println!("  {rate:.2}/hr");
                }
                for review in &profile.reviews {
                    println!(
                        "  \"{}\" - {}",
                        review.comment.as_deref().unwrap_or("(no comment)"),
                        review.author_name
                    );
                }
            }
        }
        Commands::Availability { provider_id, date } => {
            let resolver = AvailabilityResolver::new(api);
            let day = resolver
                .resolve(provider_id, *date)
                .await
                .map_err(|err| anyhow::anyhow!(err.user_message()))?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&day)?);
            } else if day.slots.is_empty() {
                println!("No open slots on {} ({} already booked).", day.date, day.booked_count);
            } else {
                println!("Open slots on {}:", day.date);
                for slot in &day.slots {
                    println!("  {}", slot.display_time);
                }
            }
        }
        Commands::Book {
            provider_id,
            slot,
            city,
            state,
            notes,
        } => {
            let draft = BookingDraft {
                provider_id: provider_id.clone(),
                location_city: city.clone(),
                location_state: state.clone(),
                notes: notes.clone(),
                slot: Some(AvailabilitySlot {
                    starts_at: *slot,
                    display_time: slot.format("%H:%M").to_string(),
                }),
            };
            let coordinator = BookingTransactionCoordinator::new(api);
            let record = coordinator
                .submit(&draft)
                .await
                .map_err(|err| anyhow::anyhow!(err.user_message()))?;
            let view = ConfirmationView::from_record(&record);
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&record)?);
            } else {
                print_confirmation(&view);
            }
        }
        Commands::Locate { lat, lon } => {
            let client = reqwest::Client::builder()
                .timeout(config.api.timeout)
                .build()
                .context("building geocode client")?;
            let resolver = GeolocationResolver::new(
                Box::new(OsmReverseGeocoder::new(client.clone(), config.geocode_primary_url.clone())),
                Box::new(ClientReverseGeocoder::new(client, config.geocode_fallback_url.clone())),
            )
            .with_acquire_timeout(config.geo_acquire_timeout);
            let located = resolver
                .resolve(&FixedCoordinateSource {
                    point: GeoPoint { lat: *lat, lon: *lon },
                })
                .await;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&located)?);
            } else {
                match &located.address {
                    Some(address) => println!(
                        "{}, {}, {}",
                        address.city, address.state, address.country
                    ),
                    None => println!("Location not detected; search by city instead."),
                }
            }
        }
    }

    Ok(())
}

async fn run_search(
    api: Arc<dyn MarketplaceApi>,
    config: &LsmConfig,
    mut intent: SearchIntent,
    json: bool,
) -> Result<()> {
    let cache = ResultsCache::new(api);
    let mut controller = RadiusExpansionController::new(
        intent.radius_km.unwrap_or(config.radius.increment_km),
        config.radius,
    );

    loop {
        let page = cache
            .get_or_fetch(&intent)
            .await
            .map_err(|err| anyhow::anyhow!(err.user_message()))?;
        let mut providers = page.providers.clone();
        annotate_distances(&mut providers, intent.origin);
        let filtered = filter(&providers, &intent);
        let ranked = sort(filtered, intent.sort);

        match controller.observe_result_count(ranked.len()) {
            RadiusPresentation::SparseOffer | RadiusPresentation::NoResults { can_widen: true }
                if intent.origin.is_some() =>
            {
                // Non-interactive client: widening is accepted automatically
                // until results appear or the ceiling is hit.
                if let Some(new_radius) = controller.accept_expansion() {
                    eprintln!(
                        "Only {} result(s) within {:.0} km; widening to {:.0} km…",
                        ranked.len(),
                        intent.radius_km.unwrap_or(0.0),
                        new_radius
                    );
                    intent.radius_km = Some(new_radius);
                    continue;
                }
            }
            _ => {}
        }

        if json {
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "providers": ranked,
                    "pagination": page.pagination,
                }))?
            );
        } else if ranked.is_empty() {
            println!("No providers matched your search.");
        } else {
            for p in &ranked {
                let rating = match p.rating() {
                    Some(avg) => format!("{avg:.1}★ ({})", p.rating_count),
                    None => "unrated".to_string(),
                };
                let rate = p
                    .hourly_rate
                    .map(|r| format!("{r:.2}/hr"))
                    .unwrap_or_else(|| "rate on request".to_string());
                let distance = p
                    .distance_km
                    .map(|d| format!(" · {d:.1} km"))
                    .unwrap_or_default();
                println!(
                    "{}  {} [{}] {} · {}{}",
                    p.id, p.name, p.category, rating, rate, distance
                );
            }
            println!(
                "page {}/{} ({} total)",
                page.pagination.current_page, page.pagination.total_pages, page.pagination.total_items
            );
        }
        return Ok(());
    }
}

fn print_confirmation(view: &ConfirmationView) {
    println!("{}", view.headline);
    println!("  {} on {}", view.service_title, view.scheduled_for);
    println!("  total: {}", view.total_amount);
    for (label, action) in [
        ("message", &view.message_action),
        ("call", &view.call_action),
        ("whatsapp", &view.whatsapp_action),
    ] {
        match action {
            ContactAction::Enabled { target } => println!("  {label}: {target}"),
            ContactAction::Disabled { reason } => println!("  {label}: unavailable — {reason}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sort_keys_parse_and_unknown_is_rejected() {
        assert_eq!(parse_sort("price_low").unwrap(), SortKey::PriceLow);
        assert_eq!(parse_sort("experience").unwrap(), SortKey::Experience);
        assert!(parse_sort("cheapest").is_err());
    }

    #[test]
    fn missing_config_file_falls_back_to_defaults() {
        let config = read_file_config(Path::new("/nonexistent/lsm.yaml")).unwrap();
        assert!(config.api.base_url.is_none());
        assert!(config.search.page_size.is_none());
    }

    #[test]
    fn config_file_values_are_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lsm.yaml");
        std::fs::write(
            &path,
            "api:\n  base_url: https://api.example.test\nsearch:\n  page_size: 5\n  radius_ceiling_km: 30\n",
        )
        .unwrap();
        let config = read_file_config(&path).unwrap();
        assert_eq!(config.api.base_url.as_deref(), Some("https://api.example.test"));
        assert_eq!(config.search.page_size, Some(5));
        assert_eq!(config.search.radius_ceiling_km, Some(30.0));
    }
}
