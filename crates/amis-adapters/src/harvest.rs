//! Form-replay harvester for the settlement portal's cooperative export page.

use amis_core::{format_minguo, format_minguo_compact, tables};
use amis_storage::HttpFetcher;
use chrono::NaiveDate;
use scraper::{Html, Selector};
use tracing::info;

use crate::AdapterError;

pub const DEFAULT_DOWNLOAD_PAGE: &str =
    "https://amis.afa.gov.tw/download/DownloadVegFruitCoopData2.aspx";
pub const DOWNLOAD_EVENT_TARGET: &str = "ctl00$contentPlaceHolder$lbtnDownload";

const FIELD_START_DATE: &str = "ctl00$contentPlaceHolder$txtStartDate";
const FIELD_END_DATE: &str = "ctl00$contentPlaceHolder$txtEndDate";
const FIELD_SUPPLY_TEXT: &str = "ctl00$contentPlaceHolder$txtSupplyNo";
const FIELD_SUPPLY_HIDDEN: &str = "ctl00$contentPlaceHolder$hfldSupplyNo";

/// Hidden ASP.NET state the portal requires to be posted back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HiddenFormState {
    pub view_state: String,
    pub view_state_generator: String,
    pub event_validation: String,
}

fn hidden_input_value(document: &Html, id: &str) -> Result<String, AdapterError> {
    let selector = Selector::parse(&format!("input#{id}"))
        .map_err(|e| AdapterError::Message(e.to_string()))?;
    document
        .select(&selector)
        .next()
        .and_then(|n| n.value().attr("value"))
        .map(ToString::to_string)
        .ok_or_else(|| AdapterError::Message(format!("download page is missing hidden input {id}")))
}

pub fn parse_hidden_form_state(html: &str) -> Result<HiddenFormState, AdapterError> {
    let document = Html::parse_document(html);
    Ok(HiddenFormState {
        view_state: hidden_input_value(&document, "__VIEWSTATE")?,
        view_state_generator: hidden_input_value(&document, "__VIEWSTATEGENERATOR")?,
        event_validation: hidden_input_value(&document, "__EVENTVALIDATION")?,
    })
}

/// `market_<YYYMMDD>.txt`
pub fn harvest_file_name(date: NaiveDate) -> String {
    format!("market_{}.txt", format_minguo_compact(date))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupplyTarget {
    /// Supply number, e.g. `A00013`.
    pub supply_no: String,
    /// Text-box label, e.g. `A00013 台北市農會`.
    pub label: String,
}

impl SupplyTarget {
    pub fn new(supply_no: impl Into<String>) -> Self {
        let supply_no = supply_no.into();
        let label = match tables::cooperative_name(&supply_no) {
            Some(name) => format!("{supply_no} {name}"),
            None => supply_no.clone(),
        };
        Self { supply_no, label }
    }
}

#[derive(Debug, Clone)]
pub struct HarvestedExport {
    pub file_name: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct CoopExportHarvester {
    source_id: String,
    page_url: String,
    supply: SupplyTarget,
}

impl CoopExportHarvester {
    pub fn new(source_id: impl Into<String>, page_url: impl Into<String>, supply: SupplyTarget) -> Self {
        Self {
            source_id: source_id.into(),
            page_url: page_url.into(),
            supply,
        }
    }

    pub fn download_form(
        &self,
        state: &HiddenFormState,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Vec<(String, String)> {
        [
            ("__EVENTTARGET", DOWNLOAD_EVENT_TARGET.to_string()),
            ("__VIEWSTATE", state.view_state.clone()),
            ("__VIEWSTATEGENERATOR", state.view_state_generator.clone()),
            ("__EVENTVALIDATION", state.event_validation.clone()),
            (FIELD_START_DATE, format_minguo(start)),
            (FIELD_END_DATE, format_minguo(end)),
            (FIELD_SUPPLY_TEXT, self.supply.label.clone()),
            (FIELD_SUPPLY_HIDDEN, self.supply.supply_no.clone()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }

    /// Load the page for its hidden state, then post the download form.
    /// The fetcher's cookie session carries the portal session between both requests.
    pub async fn harvest(
        &self,
        http: &HttpFetcher,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<HarvestedExport, AdapterError> {
        let page = http.get_bytes(&self.source_id, &self.page_url).await?;
        let state = parse_hidden_form_state(&page.text_lossy())?;
        let form = self.download_form(&state, start, end);

        info!(
            source_id = %self.source_id,
            supply_no = %self.supply.supply_no,
            start = %format_minguo(start),
            end = %format_minguo(end),
            "requesting cooperative export"
        );
        let resp = http.post_form(&self.source_id, &self.page_url, &form).await?;
        if looks_like_html(&resp.body) {
            return Err(AdapterError::Message(
                "portal answered with an HTML page instead of an export".to_string(),
            ));
        }

        Ok(HarvestedExport {
            file_name: harvest_file_name(start),
            start,
            end,
            body: resp.body,
        })
    }
}

fn looks_like_html(body: &[u8]) -> bool {
    let head = String::from_utf8_lossy(&body[..body.len().min(256)]).to_ascii_lowercase();
    let head = head.trim_start();
    head.starts_with("<!doctype html") || head.starts_with("<html")
}
