//! Export-file adapters: file hosts, the portal harvester, Big5 decoding and record extraction.

use amis_core::TransactionRecord;
use amis_storage::FetchError;
use thiserror::Error;

pub mod decode;
pub mod extract;
pub mod harvest;
pub mod sources;

pub use decode::{decode_export, has_recognized_extension, DecodedExport, RECOGNIZED_EXTENSIONS};
pub use extract::{
    extract_fields, extract_records, segment, AnchorMatch, ExtractError, RawRecordBlock,
    RecordBlocks, Records,
};
pub use harvest::{
    harvest_file_name, parse_hidden_form_state, CoopExportHarvester, HarvestedExport,
    HiddenFormState, SupplyTarget, DEFAULT_DOWNLOAD_PAGE,
};
pub use sources::{
    file_source_for, parse_github_listing, recognized_files, FileSource, FileSourceKind,
    GithubContentsSource, LocalDirSource, SourceFile,
};

pub const CRATE_NAME: &str = "amis-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Records pulled out of one export body, in file order.
#[derive(Debug, Clone, Default)]
pub struct ParsedExport {
    pub records: Vec<TransactionRecord>,
    pub skipped: usize,
    pub had_replacements: bool,
}

/// Decode and extract a raw export body. Never fails; malformed blocks are counted in `skipped`.
pub fn parse_export(bytes: &[u8]) -> ParsedExport {
    let decoded = decode_export(bytes);
    let mut records = extract_records(&decoded.text);
    let collected: Vec<_> = records.by_ref().collect();
    ParsedExport {
        records: collected,
        skipped: records.skipped(),
        had_replacements: decoded.had_replacements,
    }
}
