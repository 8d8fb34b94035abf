//! Axum + Askama dashboard over the deduplicated settlement records.

use std::sync::Arc;
use std::time::Duration;

use amis_core::{DisplayRecord, FacetCount, Facets, RecordFilter, Summary, TransactionRecord};
use amis_sync::{CachedRecords, PipelineRecords, RecordProvider, SyncConfig, SyncPipeline};
use askama::Template;
use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "amis-web";

const DEFAULT_PER_PAGE: usize = 50;
const MAX_PER_PAGE: usize = 500;

#[derive(Clone)]
pub struct AppState {
    pub records: Arc<CachedRecords<dyn RecordProvider>>,
}

impl AppState {
    pub fn new(provider: Arc<dyn RecordProvider>, ttl: Duration) -> Self {
        Self {
            records: Arc::new(CachedRecords::new(provider, ttl)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub bind_addr: String,
    pub port: u16,
}

impl WebConfig {
    pub fn from_env() -> Self {
        Self {
            bind_addr: std::env::var("AMIS_WEB_BIND").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: std::env::var("AMIS_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
        }
    }
}

/// Raw query parameters; everything is optional and unparseable values are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecordsQuery {
    pub market: Option<String>,
    pub cooperative: Option<String>,
    pub variety: Option<String>,
    pub sub_lot: Option<String>,
    pub buyer: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub page: Option<String>,
    pub per_page: Option<String>,
}

fn parse_date(value: &Option<String>) -> Option<NaiveDate> {
    value
        .as_deref()
        .and_then(|v| NaiveDate::parse_from_str(v.trim(), "%Y-%m-%d").ok())
}

fn parse_usize(value: &Option<String>) -> Option<usize> {
    value.as_deref().and_then(|v| v.trim().parse().ok())
}

impl RecordsQuery {
    pub fn filter(&self) -> RecordFilter {
        RecordFilter {
            market: self.market.clone(),
            cooperative: self.cooperative.clone(),
            variety: self.variety.clone(),
            sub_lot_contains: self.sub_lot.clone(),
            buyer_contains: self.buyer.clone(),
            date_from: parse_date(&self.from),
            date_to: parse_date(&self.to),
        }
    }

    fn per_page(&self) -> usize {
        parse_usize(&self.per_page)
            .unwrap_or(DEFAULT_PER_PAGE)
            .clamp(1, MAX_PER_PAGE)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PageInfo {
    pub page: usize,
    pub per_page: usize,
    pub total: usize,
    pub total_pages: usize,
}

fn paginate<'a, T>(rows: &'a [T], query: &RecordsQuery) -> (&'a [T], PageInfo) {
    let per_page = query.per_page();
    let total_pages = rows.len().max(1).div_ceil(per_page);
    let page = parse_usize(&query.page).unwrap_or(1).clamp(1, total_pages);
    let start = ((page - 1) * per_page).min(rows.len());
    let end = (start + per_page).min(rows.len());
    (
        &rows[start..end],
        PageInfo {
            page,
            per_page,
            total: rows.len(),
            total_pages,
        },
    )
}

struct RowView {
    date: String,
    minguo_date: String,
    serial_id: String,
    grade: String,
    market: String,
    cooperative: String,
    sub_lot: String,
    variety: String,
    piece_count: u64,
    weight_kg: u64,
    unit_price: u64,
    total_value: u64,
    buyer: String,
}

impl From<&TransactionRecord> for RowView {
    fn from(r: &TransactionRecord) -> Self {
        let display = DisplayRecord::from(r);
        Self {
            date: display.date_text,
            minguo_date: display.minguo_date_text,
            serial_id: r.serial_id.clone(),
            grade: display.grade_label,
            market: r.market.clone(),
            cooperative: display.cooperative_label,
            sub_lot: r.sub_lot_code.clone(),
            variety: display.variety_label,
            piece_count: r.piece_count,
            weight_kg: r.weight_kg,
            unit_price: r.unit_price,
            total_value: r.total_value,
            buyer: r.buyer_code.clone(),
        }
    }
}

struct OptionView {
    value: String,
    label: String,
    count: usize,
    selected: bool,
}

fn option_views(counts: &[FacetCount], selected: &Option<String>) -> Vec<OptionView> {
    let selected = selected.as_deref().map(str::trim).unwrap_or_default();
    counts
        .iter()
        .map(|c| OptionView {
            value: c.value.clone(),
            label: if c.label.is_empty() { "(none)".to_string() } else { c.label.clone() },
            count: c.count,
            selected: !selected.is_empty() && c.value == selected,
        })
        .collect()
}

struct SummaryView {
    records: usize,
    total_pieces: u64,
    total_weight_kg: u64,
    total_value: u64,
    min_price: String,
    max_price: String,
    average_price: String,
}

impl From<&Summary> for SummaryView {
    fn from(s: &Summary) -> Self {
        let price = |p: Option<u64>| p.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string());
        Self {
            records: s.records,
            total_pieces: s.total_pieces,
            total_weight_kg: s.total_weight_kg,
            total_value: s.total_value,
            min_price: price(s.min_unit_price),
            max_price: price(s.max_unit_price),
            average_price: format!("{:.1}", s.average_unit_price),
        }
    }
}

struct FilterView {
    sub_lot: String,
    buyer: String,
    from: String,
    to: String,
}

impl From<&RecordsQuery> for FilterView {
    fn from(q: &RecordsQuery) -> Self {
        let date = |d: Option<NaiveDate>| d.map(|d| d.format("%Y-%m-%d").to_string()).unwrap_or_default();
        Self {
            sub_lot: q.sub_lot.clone().unwrap_or_default(),
            buyer: q.buyer.clone().unwrap_or_default(),
            from: date(parse_date(&q.from)),
            to: date(parse_date(&q.to)),
        }
    }
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    has_data: bool,
    filters: FilterView,
    markets: Vec<OptionView>,
    cooperatives: Vec<OptionView>,
    varieties: Vec<OptionView>,
    summary: SummaryView,
    rows: Vec<RowView>,
    page: usize,
    total_pages: usize,
    total_rows: usize,
}

#[derive(Template)]
#[template(path = "records_table_partial.html")]
struct RecordsTablePartialTemplate {
    has_data: bool,
    rows: Vec<RowView>,
    page: usize,
    total_pages: usize,
    total_rows: usize,
}

#[derive(Template)]
#[template(path = "records_facets_partial.html")]
struct RecordsFacetsPartialTemplate {
    markets: Vec<OptionView>,
    cooperatives: Vec<OptionView>,
    varieties: Vec<OptionView>,
}

#[derive(Serialize)]
struct RecordsResponse {
    #[serde(flatten)]
    page: PageInfo,
    records: Vec<DisplayRecord>,
}

#[derive(Serialize)]
struct SummaryResponse {
    available: usize,
    filter: RecordFilter,
    summary: Summary,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/records/table", get(records_table_handler))
        .route("/records/facets", get(records_facets_handler))
        .route("/api/records", get(api_records_handler))
        .route("/api/summary", get(api_summary_handler))
        .with_state(state)
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let web = WebConfig::from_env();
    let sync = SyncConfig::from_env();
    let ttl = sync.cache_ttl();
    let provider: Arc<dyn RecordProvider> = Arc::new(PipelineRecords::new(SyncPipeline::new(sync)?));
    let listener = TcpListener::bind((web.bind_addr.as_str(), web.port)).await?;
    info!(addr = %listener.local_addr()?, cache_ttl_secs = ttl.as_secs(), "dashboard listening");
    axum::serve(listener, app(AppState::new(provider, ttl))).await?;
    Ok(())
}

async fn index_handler(State(state): State<AppState>, Query(query): Query<RecordsQuery>) -> Response {
    let all = state.records.records().await;
    let filter = query.filter();
    let matched = filter.apply(&all);
    let facets = Facets::from_records(all.iter());
    let summary = Summary::from_records(matched.iter().copied());
    let (page_rows, info) = paginate(&matched, &query);

    render_html(IndexTemplate {
        has_data: !all.is_empty(),
        filters: FilterView::from(&query),
        markets: option_views(&facets.markets, &query.market),
        cooperatives: option_views(&facets.cooperatives, &query.cooperative),
        varieties: option_views(&facets.varieties, &query.variety),
        summary: SummaryView::from(&summary),
        rows: page_rows.iter().map(|r| RowView::from(*r)).collect(),
        page: info.page,
        total_pages: info.total_pages,
        total_rows: info.total,
    })
}

async fn records_table_handler(
    State(state): State<AppState>,
    Query(query): Query<RecordsQuery>,
) -> Response {
    let all = state.records.records().await;
    let matched = query.filter().apply(&all);
    let (page_rows, info) = paginate(&matched, &query);
    let mut resp = render_html(RecordsTablePartialTemplate {
        has_data: !all.is_empty(),
        rows: page_rows.iter().map(|r| RowView::from(*r)).collect(),
        page: info.page,
        total_pages: info.total_pages,
        total_rows: info.total,
    });
    resp.headers_mut().insert(
        header::HeaderName::from_static("hx-trigger"),
        header::HeaderValue::from_static("recordsTableLoaded"),
    );
    resp
}

async fn records_facets_handler(
    State(state): State<AppState>,
    Query(query): Query<RecordsQuery>,
) -> Response {
    let all = state.records.records().await;
    let facets = Facets::from_records(all.iter());
    render_html(RecordsFacetsPartialTemplate {
        markets: option_views(&facets.markets, &query.market),
        cooperatives: option_views(&facets.cooperatives, &query.cooperative),
        varieties: option_views(&facets.varieties, &query.variety),
    })
}

async fn api_records_handler(
    State(state): State<AppState>,
    Query(query): Query<RecordsQuery>,
) -> Response {
    let all = state.records.records().await;
    let matched = query.filter().apply(&all);
    let (page_rows, info) = paginate(&matched, &query);
    Json(RecordsResponse {
        page: info,
        records: page_rows.iter().map(|r| DisplayRecord::from(*r)).collect(),
    })
    .into_response()
}

async fn api_summary_handler(
    State(state): State<AppState>,
    Query(query): Query<RecordsQuery>,
) -> Response {
    let all = state.records.records().await;
    let filter = query.filter();
    let summary = Summary::from_records(all.iter().filter(|r| filter.matches(r)));
    Json(SummaryResponse {
        available: all.len(),
        filter,
        summary,
    })
    .into_response()
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Html(format!("Server error: {err}")),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amis_core::Grade;
    use amis_sync::StaticRecords;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn record(serial: &str, day: u32, market_code: &str, market: &str, coop: &str, price: u64) -> TransactionRecord {
        TransactionRecord {
            serial_id: serial.to_string(),
            trade_date: NaiveDate::from_ymd_opt(2026, 2, day).unwrap(),
            grade: Grade::Premium,
            market_code: market_code.to_string(),
            market: market.to_string(),
            cooperative_code: coop.to_string(),
            sub_lot_code: "001".to_string(),
            variety: "R1".to_string(),
            piece_count: 3,
            weight_kg: 20,
            unit_price: price,
            total_value: price * 20,
            buyer_code: format!("60{day:02}"),
        }
    }

    fn sample_state() -> AppState {
        let records = vec![
            record("A", 10, "S0", "高雄縣", "S00076", 140),
            record("B", 11, "T0", "屏東縣", "T00021", 120),
            record("C", 12, "S0", "高雄縣", "S00076", 90),
        ];
        AppState::new(Arc::new(StaticRecords::new(records)), Duration::from_secs(60))
    }

    fn empty_state() -> AppState {
        AppState::new(Arc::new(StaticRecords::default()), Duration::from_secs(60))
    }

    async fn get(state: AppState, uri: &str) -> (StatusCode, axum::http::HeaderMap, String) {
        let resp = app(state)
            .oneshot(axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, headers, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn index_renders_rows_summary_and_facets() {
        let (status, _, text) = get(sample_state(), "/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(text.contains("AMIS Settlement Dashboard"));
        assert!(text.contains("燕巢區農會"));
        assert!(text.contains("2026-02-12"));
        assert!(text.contains("芒果-愛文"));
    }

    #[tokio::test]
    async fn empty_record_set_renders_no_data_state() {
        let (status, _, text) = get(empty_state(), "/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(text.contains("No data available"));

        let (status, _, text) = get(empty_state(), "/records/table").await;
        assert_eq!(status, StatusCode::OK);
        assert!(text.contains("No data available"));
    }

    #[tokio::test]
    async fn table_partial_filters_by_market() {
        let (status, headers, text) = get(sample_state(), "/records/table?market=%E5%B1%8F%E6%9D%B1%E7%B8%A3").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers["hx-trigger"], "recordsTableLoaded");
        assert!(text.contains("高樹鄉農會"));
        assert!(!text.contains("燕巢區農會"));
    }

    #[tokio::test]
    async fn facets_partial_lists_counts() {
        let (status, _, text) = get(sample_state(), "/records/facets?cooperative=S00076").await;
        assert_eq!(status, StatusCode::OK);
        assert!(text.contains("燕巢區農會 (2)"));
        assert!(text.contains("selected"));
    }

    #[tokio::test]
    async fn api_records_paginates_in_display_order() {
        let (status, headers, text) = get(sample_state(), "/api/records?per_page=2&page=2").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[header::CONTENT_TYPE], "application/json");
        let body: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(body["total"], 3);
        assert_eq!(body["total_pages"], 2);
        assert_eq!(body["page"], 2);
        assert_eq!(body["records"].as_array().unwrap().len(), 1);
        assert_eq!(body["records"][0]["serial_id"], "A");
    }

    #[tokio::test]
    async fn api_summary_applies_date_range_and_ignores_bad_values() {
        let (_, _, text) = get(sample_state(), "/api/summary?from=2026-02-11&to=2026-02-12&page=abc").await;
        let body: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(body["available"], 3);
        assert_eq!(body["summary"]["records"], 2);
        assert_eq!(body["summary"]["min_unit_price"], 90);
        assert_eq!(body["summary"]["max_unit_price"], 120);
        assert_eq!(body["summary"]["average_unit_price"], 105.0);

        let (_, _, text) = get(sample_state(), "/api/summary?from=not-a-date&buyer=6011").await;
        let body: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(body["summary"]["records"], 1);
    }

    #[tokio::test]
    async fn empty_summary_has_zero_average() {
        let (status, _, text) = get(empty_state(), "/api/summary").await;
        assert_eq!(status, StatusCode::OK);
        let body: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(body["summary"]["records"], 0);
        assert_eq!(body["summary"]["average_unit_price"], 0.0);
    }

    #[test]
    fn pagination_clamps_out_of_range_pages() {
        let rows: Vec<usize> = (0..5).collect();
        let query = RecordsQuery {
            page: Some("9".to_string()),
            per_page: Some("2".to_string()),
            ..Default::default()
        };
        let (slice, info) = paginate(&rows, &query);
        assert_eq!(info.page, 3);
        assert_eq!(slice, &[4]);
    }
}
