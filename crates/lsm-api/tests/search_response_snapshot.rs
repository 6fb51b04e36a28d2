//! Golden snapshot of search-response normalization against a captured
//! backend payload.

use std::fs;
use std::path::{Path, PathBuf};

use lsm_api::{normalize_search_response, RawSearchResponse};
use lsm_core::{Pagination, Provider, VerificationStatus};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct GoldenProvider {
    id: String,
    name: String,
    category: String,
    hourly_rate: Option<f64>,
    rating: Option<f64>,
    rating_count: u32,
    verification: VerificationStatus,
    available: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct GoldenPage {
    providers: Vec<GoldenProvider>,
    pagination: Pagination,
}

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .expect("workspace root")
}

fn provider_to_golden(provider: &Provider) -> GoldenProvider {
    GoldenProvider {
        id: provider.id.clone(),
        name: provider.name.clone(),
        category: provider.category.clone(),
        hourly_rate: provider.hourly_rate,
        rating: provider.rating(),
        rating_count: provider.rating_count,
        verification: provider.verification,
        available: provider.available,
    }
}

#[test]
fn golden_json_snapshot_search_response() {
    let root = workspace_root();
    let raw_text = fs::read_to_string(root.join("fixtures/search/sample_response.json"))
        .expect("read sample response");
    let raw: RawSearchResponse = serde_json::from_str(&raw_text).expect("parse sample response");
    let page = normalize_search_response(raw);

    let actual = GoldenPage {
        providers: page.providers.iter().map(provider_to_golden).collect(),
        pagination: page.pagination,
    };

    let expected_text = fs::read_to_string(root.join("fixtures/search/snapshot.json"))
        .expect("read snapshot");
    let expected: GoldenPage = serde_json::from_str(&expected_text).expect("parse snapshot");

    assert_eq!(actual, expected);
}
