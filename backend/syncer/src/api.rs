//! Axum REST API handlers.
//!
//! Reads come straight from the mirror. The only writes are on-demand resync
//! (through the engine) and edits to locally-owned fields; chain-derived
//! columns are never written from here.

use std::sync::Arc;

use alloy_primitives::Address;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::cache::TtlCache;
use crate::chain::ChainReader;
use crate::db::{self, CampaignFilter, DriftCorrection};
use crate::engine::ReconciliationEngine;
use crate::errors::{ChainReadError, SyncError};
use crate::events::{
    canonical, parse_address, unix_now, CampaignRecord, CampaignStats, ContributionRecord,
    LocalFieldsUpdate,
};

pub struct ApiState<R: ChainReader> {
    pub pool: SqlitePool,
    pub engine: Arc<ReconciliationEngine<R>>,
    pub stats_cache: TtlCache<Address, CampaignStats>,
}

pub fn router<R: ChainReader>(state: Arc<ApiState<R>>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/campaigns", get(list_campaigns::<R>))
        .route(
            "/campaigns/:address",
            get(get_campaign::<R>).patch(update_campaign::<R>),
        )
        .route(
            "/campaigns/:address/contributions",
            get(get_campaign_contributions::<R>),
        )
        .route("/campaigns/:address/drift", get(get_drift_corrections::<R>))
        .route("/campaigns/:address/view", post(record_view::<R>))
        .route("/sync/:address", post(sync_campaign::<R>))
        .route("/stats/:address", get(get_stats::<R>))
        .route("/contribution/:address/:user", get(check_contribution::<R>))
        .route("/users/:address/contributions", get(get_user_contributions::<R>))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ─────────────────────────────────────────────────────────
// Response shapes
// ─────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Serialize)]
pub struct CampaignsResponse {
    pub count: usize,
    pub campaigns: Vec<CampaignRecord>,
}

#[derive(Serialize)]
pub struct ContributionsResponse {
    pub count: usize,
    pub contributions: Vec<ContributionRecord>,
}

#[derive(Serialize)]
pub struct DriftResponse {
    pub campaign_address: String,
    pub count: usize,
    pub corrections: Vec<DriftCorrection>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContributionCheck {
    pub has_contributed: bool,
    pub amount: String,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub active: Option<bool>,
    pub category: Option<String>,
    pub creator: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Maps [`SyncError`] onto HTTP statuses.
pub struct ApiError(SyncError);

impl From<SyncError> for ApiError {
    fn from(e: SyncError) -> Self {
        Self(e)
    }
}

impl From<ChainReadError> for ApiError {
    fn from(e: ChainReadError) -> Self {
        Self(e.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            SyncError::NotFound(_) | SyncError::ChainRead(ChainReadError::ContractNotFound(_)) => {
                StatusCode::NOT_FOUND
            }
            SyncError::InvalidAddress(_) | SyncError::InvalidAmount(_) | SyncError::Decode(_) => {
                StatusCode::BAD_REQUEST
            }
            SyncError::ChainRead(_) | SyncError::Http(_) => StatusCode::BAD_GATEWAY,
            SyncError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        }
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn address_key(raw: &str) -> Result<(Address, String), SyncError> {
    let address = parse_address(raw)?;
    Ok((address, canonical(&address)))
}

async fn existing_campaign(pool: &SqlitePool, key: &str) -> ApiResult<CampaignRecord> {
    db::find_campaign_by_address(pool, key)
        .await?
        .ok_or_else(|| SyncError::NotFound(key.to_string()).into())
}

// ─────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `GET /campaigns?active=&category=&creator=&limit=&offset=`
pub async fn list_campaigns<R: ChainReader>(
    State(state): State<Arc<ApiState<R>>>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<CampaignsResponse>> {
    let creator = match query.creator.as_deref() {
        Some(raw) => Some(address_key(raw)?.1),
        None => None,
    };
    let filter = CampaignFilter {
        active: query.active,
        category: query.category,
        creator,
        limit: query.limit,
        offset: query.offset,
    };
    let campaigns = db::list_campaigns(&state.pool, &filter).await?;
    Ok(Json(CampaignsResponse {
        count: campaigns.len(),
        campaigns,
    }))
}

/// `GET /campaigns/:address`
pub async fn get_campaign<R: ChainReader>(
    State(state): State<Arc<ApiState<R>>>,
    Path(address): Path<String>,
) -> ApiResult<Json<CampaignRecord>> {
    let (_, key) = address_key(&address)?;
    Ok(Json(existing_campaign(&state.pool, &key).await?))
}

/// `PATCH /campaigns/:address`
///
/// Only application-owned fields are accepted; chain-synced ones are not part
/// of the body type.
pub async fn update_campaign<R: ChainReader>(
    State(state): State<Arc<ApiState<R>>>,
    Path(address): Path<String>,
    Json(update): Json<LocalFieldsUpdate>,
) -> ApiResult<Json<CampaignRecord>> {
    let (_, key) = address_key(&address)?;
    if !db::update_local_fields(&state.pool, &key, &update, unix_now()).await? {
        return Err(SyncError::NotFound(key).into());
    }
    info!(campaign = %key, "Local campaign fields updated");
    Ok(Json(existing_campaign(&state.pool, &key).await?))
}

/// `GET /campaigns/:address/contributions`
pub async fn get_campaign_contributions<R: ChainReader>(
    State(state): State<Arc<ApiState<R>>>,
    Path(address): Path<String>,
) -> ApiResult<Json<ContributionsResponse>> {
    let (_, key) = address_key(&address)?;
    existing_campaign(&state.pool, &key).await?;
    let contributions = db::contributions_for_campaign(&state.pool, &key).await?;
    Ok(Json(ContributionsResponse {
        count: contributions.len(),
        contributions,
    }))
}

/// `GET /campaigns/:address/drift`
pub async fn get_drift_corrections<R: ChainReader>(
    State(state): State<Arc<ApiState<R>>>,
    Path(address): Path<String>,
) -> ApiResult<Json<DriftResponse>> {
    let (_, key) = address_key(&address)?;
    let corrections = db::drift_corrections_for(&state.pool, &key).await?;
    Ok(Json(DriftResponse {
        campaign_address: key,
        count: corrections.len(),
        corrections,
    }))
}

/// `POST /campaigns/:address/view`
pub async fn record_view<R: ChainReader>(
    State(state): State<Arc<ApiState<R>>>,
    Path(address): Path<String>,
) -> ApiResult<StatusCode> {
    let (_, key) = address_key(&address)?;
    if db::increment_views(&state.pool, &key).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(SyncError::NotFound(key).into())
    }
}

/// `POST /sync/:address`
///
/// Forces a resync, mirroring the campaign first if it has never been seen.
pub async fn sync_campaign<R: ChainReader>(
    State(state): State<Arc<ApiState<R>>>,
    Path(address): Path<String>,
) -> ApiResult<Json<CampaignRecord>> {
    let (address, _) = address_key(&address)?;
    let record = state.engine.resync(address).await?;
    state.stats_cache.invalidate(&address).await;
    Ok(Json(record))
}

/// `GET /stats/:address`
///
/// `getStats()` pass-through, cached for the configured TTL.
pub async fn get_stats<R: ChainReader>(
    State(state): State<Arc<ApiState<R>>>,
    Path(address): Path<String>,
) -> ApiResult<Json<CampaignStats>> {
    let (address, _) = address_key(&address)?;
    let reader = state.engine.reader().clone();
    let stats = state
        .stats_cache
        .get_or_try_insert_with(address, || async move { reader.stats(address).await })
        .await?;
    Ok(Json(stats))
}

/// `GET /contribution/:address/:user`
pub async fn check_contribution<R: ChainReader>(
    State(state): State<Arc<ApiState<R>>>,
    Path((address, user)): Path<(String, String)>,
) -> ApiResult<Json<ContributionCheck>> {
    let (campaign, _) = address_key(&address)?;
    let (user, _) = address_key(&user)?;
    let amount = state.engine.reader().contribution_of(campaign, user).await?;
    Ok(Json(ContributionCheck {
        has_contributed: !amount.is_zero(),
        amount: amount.to_string(),
    }))
}

/// `GET /users/:address/contributions`
pub async fn get_user_contributions<R: ChainReader>(
    State(state): State<Arc<ApiState<R>>>,
    Path(address): Path<String>,
) -> ApiResult<Json<ContributionsResponse>> {
    let (_, key) = address_key(&address)?;
    let contributions = db::contributions_by_contributor(&state.pool, &key).await?;
    Ok(Json(ContributionsResponse {
        count: contributions.len(),
        contributions,
    }))
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use alloy_primitives::{B256, U256};
    use axum::body::Body;
    use axum::http::{Method, Request};
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::chain::fake::FakeChain;
    use crate::db::tests::test_pool;
    use crate::engine::tests::{campaign_addr, created_event};
    use crate::events::{ContributionReceivedEvent, DomainEvent};

    const ETH: u128 = 1_000_000_000_000_000_000;

    async fn app() -> (Arc<FakeChain>, Arc<ApiState<FakeChain>>, Router) {
        let pool = test_pool().await;
        let chain = Arc::new(FakeChain::default());
        chain.deploy(created_event(10 * ETH, 2_000_000_000), "Solar Roofs");
        let engine = Arc::new(ReconciliationEngine::new(pool.clone(), chain.clone()));
        let state = Arc::new(ApiState {
            pool,
            engine,
            stats_cache: TtlCache::new(Duration::from_secs(60)),
        });
        (chain, state.clone(), router(state))
    }

    async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                req = req.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let res = app.clone().oneshot(req.body(body).unwrap()).await.unwrap();
        let status = res.status();
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    fn addr() -> String {
        canonical(&campaign_addr())
    }

    async fn contribute(state: &ApiState<FakeChain>, contributor: u8, amount: u128, total: u128, tx: u8) {
        state
            .engine
            .apply_event(&DomainEvent::ContributionReceived(ContributionReceivedEvent {
                campaign_address: campaign_addr(),
                contributor: Address::repeat_byte(contributor),
                amount: U256::from(amount),
                total_raised: U256::from(total),
                transaction_hash: B256::repeat_byte(tx),
                block_number: 120 + tx as u64,
                log_index: 0,
                block_timestamp: Some(1_700_000_000),
            }))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let (_, _, app) = app().await;
        let (status, body) = call(&app, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn sync_mirrors_unknown_campaign_and_reads_chain() {
        let (chain, _, app) = app().await;
        chain.set_raised(campaign_addr(), U256::from(7 * ETH));

        let (status, _) = call(&app, Method::GET, &format!("/campaigns/{}", addr()), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        // Mixed-case input resolves to the same mirror row.
        let mixed = format!("0x{}", "AB".repeat(20));
        let (status, body) = call(&app, Method::POST, &format!("/sync/{mixed}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["contract_address"], addr());
        assert_eq!(body["raised_amount"], (7 * ETH).to_string());
        assert_eq!(body["title"], "Solar Roofs");

        let (status, body) = call(&app, Method::GET, &format!("/campaigns/{}", addr()), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["is_active"], true);
    }

    #[tokio::test]
    async fn sync_of_foreign_or_malformed_address() {
        let (_, _, app) = app().await;
        let stranger = canonical(&Address::repeat_byte(0x99));
        let (status, _) = call(&app, Method::POST, &format!("/sync/{stranger}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = call(&app, Method::POST, "/sync/not-an-address", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("not-an-address"));
    }

    #[tokio::test]
    async fn listing_and_ledgers() {
        let (_, state, app) = app().await;
        contribute(&state, 0x02, 3 * ETH, 3 * ETH, 1).await;
        contribute(&state, 0x03, 4 * ETH, 7 * ETH, 2).await;

        let (_, body) = call(&app, Method::GET, "/campaigns?active=true", None).await;
        assert_eq!(body["count"], 1);
        let (_, body) = call(&app, Method::GET, "/campaigns?active=false", None).await;
        assert_eq!(body["count"], 0);
        let creator = canonical(&Address::repeat_byte(0x01));
        let (_, body) = call(&app, Method::GET, &format!("/campaigns?creator={creator}"), None).await;
        assert_eq!(body["count"], 1);

        let (_, body) = call(
            &app,
            Method::GET,
            &format!("/campaigns/{}/contributions", addr()),
            None,
        )
        .await;
        assert_eq!(body["count"], 2);

        let supporter = canonical(&Address::repeat_byte(0x03));
        let (_, body) = call(
            &app,
            Method::GET,
            &format!("/users/{supporter}/contributions"),
            None,
        )
        .await;
        assert_eq!(body["count"], 1);
        assert_eq!(body["contributions"][0]["amount"], (4 * ETH).to_string());
    }

    #[tokio::test]
    async fn local_edits_never_touch_chain_fields() {
        let (_, state, app) = app().await;
        contribute(&state, 0x02, 3 * ETH, 3 * ETH, 1).await;

        let patch = serde_json::json!({
            "title": "Solar Roofs for Schools",
            "tags": ["energy", "education"],
            "raised_amount": "999",
        });
        let (status, body) = call(
            &app,
            Method::PATCH,
            &format!("/campaigns/{}", addr()),
            Some(patch),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["title"], "Solar Roofs for Schools");
        assert_eq!(body["tags"], r#"["energy","education"]"#);
        assert_eq!(body["raised_amount"], (3 * ETH).to_string());

        let (status, _) = call(&app, Method::POST, &format!("/campaigns/{}/view", addr()), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (_, body) = call(&app, Method::GET, &format!("/campaigns/{}", addr()), None).await;
        assert_eq!(body["views"], 1);
    }

    #[tokio::test]
    async fn stats_are_cached_between_calls() {
        let (chain, _, app) = app().await;
        chain.set_raised(campaign_addr(), U256::from(2 * ETH));

        let (status, body) = call(&app, Method::GET, &format!("/stats/{}", addr()), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["raisedAmount"], (2 * ETH).to_string());
        let reads = chain.read_count();

        chain.set_raised(campaign_addr(), U256::from(5 * ETH));
        let (_, body) = call(&app, Method::GET, &format!("/stats/{}", addr()), None).await;
        assert_eq!(body["raisedAmount"], (2 * ETH).to_string());
        assert_eq!(chain.read_count(), reads);

        // A forced sync drops the cached entry.
        call(&app, Method::POST, &format!("/sync/{}", addr()), None).await;
        let (_, body) = call(&app, Method::GET, &format!("/stats/{}", addr()), None).await;
        assert_eq!(body["raisedAmount"], (5 * ETH).to_string());
    }

    #[tokio::test]
    async fn contribution_check_reads_chain() {
        let (chain, _, app) = app().await;
        let supporter = Address::repeat_byte(0x02);
        chain
            .campaigns
            .lock()
            .unwrap()
            .get_mut(&campaign_addr())
            .unwrap()
            .contributions
            .insert(supporter, U256::from(ETH));

        let (status, body) = call(
            &app,
            Method::GET,
            &format!("/contribution/{}/{}", addr(), canonical(&supporter)),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["hasContributed"], true);
        assert_eq!(body["amount"], ETH.to_string());

        let nobody = canonical(&Address::repeat_byte(0x77));
        let (_, body) = call(&app, Method::GET, &format!("/contribution/{}/{nobody}", addr()), None).await;
        assert_eq!(body["hasContributed"], false);
    }

    #[tokio::test]
    async fn chain_outage_maps_to_bad_gateway() {
        let (chain, _, app) = app().await;
        chain.fail_reads.store(true, std::sync::atomic::Ordering::SeqCst);
        let (status, _) = call(&app, Method::GET, &format!("/stats/{}", addr()), None).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
    }
}
