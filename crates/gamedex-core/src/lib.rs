//! Core domain model, schema specification, and default-filling for Gamedex.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const CRATE_NAME: &str = "gamedex-core";

/// Integer product identifier shared across every source row set.
pub type AppId = i64;

/// Sentinel stored wherever a text/URL field has no usable source data.
pub const NO_DATA: &str = "No Data Available";

/// Per-field fallback values applied by [`normalize`].
pub mod defaults {
    pub const NAME: &str = "Unknown Game";
    pub const RELEASE_DATE: &str = "Unknown Date";
    pub const DEVELOPER: &str = "Unknown Developer";
    pub const DESCRIPTION: &str = "No description available";
}

/// Scalar/array type a schema field must carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    String,
    Int,
    Double,
    StringArray,
}

/// One entry of the enumerable schema specification. The store gateway
/// validates against this table and tests enumerate it, so there is a
/// single source of truth for the required-field contract.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub field_type: FieldType,
    pub required: bool,
    pub minimum: Option<f64>,
}

const fn required(name: &'static str, field_type: FieldType) -> FieldSpec {
    FieldSpec {
        name,
        field_type,
        required: true,
        minimum: None,
    }
}

const fn required_min(name: &'static str, field_type: FieldType, minimum: f64) -> FieldSpec {
    FieldSpec {
        name,
        field_type,
        required: true,
        minimum: Some(minimum),
    }
}

/// Name of the primary-key field on every persisted document.
pub const PRIMARY_KEY: &str = "appid";

const CATALOG_SCHEMA: &[FieldSpec] = &[
    required(PRIMARY_KEY, FieldType::Int),
    required("name", FieldType::String),
    required("release_date", FieldType::String),
    required("developer", FieldType::String),
    required("platforms", FieldType::StringArray),
    required("categories", FieldType::StringArray),
    required("genres", FieldType::StringArray),
    required("tags", FieldType::StringArray),
    required_min("positive_ratings", FieldType::Int, 0.0),
    required_min("negative_ratings", FieldType::Int, 0.0),
    required_min("price", FieldType::Double, 0.0),
    required("detailed_description", FieldType::String),
    required("windows_requirements", FieldType::String),
    required("mac_requirements", FieldType::String),
    required("linux_requirements", FieldType::String),
    required("website", FieldType::String),
    required("support_url", FieldType::String),
    required("header_img", FieldType::String),
    required("background_img", FieldType::String),
];

/// The required-field contract for the games collection.
pub fn catalog_schema() -> &'static [FieldSpec] {
    CATALOG_SCHEMA
}

/// Splits a semicolon-delimited classification field into an ordered
/// sequence. Empty or missing source text yields an empty sequence,
/// never `[""]`. Source order is preserved and entries are not trimmed.
pub fn split_delimited(raw: &str) -> Vec<String> {
    if raw.is_empty() {
        return Vec::new();
    }
    raw.split(';').map(str::to_string).collect()
}

/// Candidate document produced by the assembler before default-filling.
/// Every field except the identifier is optional; `None` is the single
/// explicit missing marker, centralizing the missing-to-default mapping
/// in [`normalize`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProductDraft {
    pub appid: AppId,
    pub name: Option<String>,
    pub release_date: Option<String>,
    pub developer: Option<String>,
    pub platforms: Option<Vec<String>>,
    pub categories: Option<Vec<String>>,
    pub genres: Option<Vec<String>>,
    pub tags: Option<Vec<String>>,
    pub positive_ratings: Option<i64>,
    pub negative_ratings: Option<i64>,
    pub price: Option<f64>,
    pub detailed_description: Option<String>,
    pub windows_requirements: Option<String>,
    pub mac_requirements: Option<String>,
    pub linux_requirements: Option<String>,
    pub website: Option<String>,
    pub support_url: Option<String>,
    pub header_img: Option<String>,
    pub background_img: Option<String>,
}

/// Canonical merged record persisted per product. Field names match the
/// schema specification exactly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductDocument {
    pub appid: AppId,
    pub name: String,
    pub release_date: String,
    pub developer: String,
    pub platforms: Vec<String>,
    pub categories: Vec<String>,
    pub genres: Vec<String>,
    pub tags: Vec<String>,
    pub positive_ratings: i64,
    pub negative_ratings: i64,
    pub price: f64,
    pub detailed_description: String,
    pub windows_requirements: String,
    pub mac_requirements: String,
    pub linux_requirements: String,
    pub website: String,
    pub support_url: String,
    pub header_img: String,
    pub background_img: String,
}

impl ProductDocument {
    /// Lowers the typed document into the JSON object map the store
    /// gateway persists. Non-finite numbers lower to `null` and are
    /// caught by schema validation rather than panicking here.
    pub fn into_document(self) -> Map<String, Value> {
        let mut doc = Map::new();
        doc.insert(PRIMARY_KEY.into(), Value::from(self.appid));
        doc.insert("name".into(), Value::from(self.name));
        doc.insert("release_date".into(), Value::from(self.release_date));
        doc.insert("developer".into(), Value::from(self.developer));
        doc.insert("platforms".into(), Value::from(self.platforms));
        doc.insert("categories".into(), Value::from(self.categories));
        doc.insert("genres".into(), Value::from(self.genres));
        doc.insert("tags".into(), Value::from(self.tags));
        doc.insert("positive_ratings".into(), Value::from(self.positive_ratings));
        doc.insert("negative_ratings".into(), Value::from(self.negative_ratings));
        doc.insert("price".into(), Value::from(self.price));
        doc.insert(
            "detailed_description".into(),
            Value::from(self.detailed_description),
        );
        doc.insert(
            "windows_requirements".into(),
            Value::from(self.windows_requirements),
        );
        doc.insert("mac_requirements".into(), Value::from(self.mac_requirements));
        doc.insert(
            "linux_requirements".into(),
            Value::from(self.linux_requirements),
        );
        doc.insert("website".into(), Value::from(self.website));
        doc.insert("support_url".into(), Value::from(self.support_url));
        doc.insert("header_img".into(), Value::from(self.header_img));
        doc.insert("background_img".into(), Value::from(self.background_img));
        doc
    }
}

impl From<ProductDocument> for ProductDraft {
    fn from(doc: ProductDocument) -> Self {
        Self {
            appid: doc.appid,
            name: Some(doc.name),
            release_date: Some(doc.release_date),
            developer: Some(doc.developer),
            platforms: Some(doc.platforms),
            categories: Some(doc.categories),
            genres: Some(doc.genres),
            tags: Some(doc.tags),
            positive_ratings: Some(doc.positive_ratings),
            negative_ratings: Some(doc.negative_ratings),
            price: Some(doc.price),
            detailed_description: Some(doc.detailed_description),
            windows_requirements: Some(doc.windows_requirements),
            mac_requirements: Some(doc.mac_requirements),
            linux_requirements: Some(doc.linux_requirements),
            website: Some(doc.website),
            support_url: Some(doc.support_url),
            header_img: Some(doc.header_img),
            background_img: Some(doc.background_img),
        }
    }
}

/// The Default-Filler: total over any draft, never rejects. Every
/// missing field is replaced by its declared default so no document can
/// violate the required-field invariant downstream. Lists default to
/// the empty sequence; text and URL fields default to their sentinel.
pub fn normalize(draft: ProductDraft) -> ProductDocument {
    ProductDocument {
        appid: draft.appid,
        name: draft.name.unwrap_or_else(|| defaults::NAME.to_string()),
        release_date: draft
            .release_date
            .unwrap_or_else(|| defaults::RELEASE_DATE.to_string()),
        developer: draft
            .developer
            .unwrap_or_else(|| defaults::DEVELOPER.to_string()),
        platforms: draft.platforms.unwrap_or_default(),
        categories: draft.categories.unwrap_or_default(),
        genres: draft.genres.unwrap_or_default(),
        tags: draft.tags.unwrap_or_default(),
        positive_ratings: draft.positive_ratings.unwrap_or(0),
        negative_ratings: draft.negative_ratings.unwrap_or(0),
        price: draft.price.unwrap_or(0.0),
        detailed_description: draft
            .detailed_description
            .unwrap_or_else(|| defaults::DESCRIPTION.to_string()),
        windows_requirements: draft
            .windows_requirements
            .unwrap_or_else(|| NO_DATA.to_string()),
        mac_requirements: draft
            .mac_requirements
            .unwrap_or_else(|| NO_DATA.to_string()),
        linux_requirements: draft
            .linux_requirements
            .unwrap_or_else(|| NO_DATA.to_string()),
        website: draft.website.unwrap_or_else(|| NO_DATA.to_string()),
        support_url: draft.support_url.unwrap_or_else(|| NO_DATA.to_string()),
        header_img: draft.header_img.unwrap_or_else(|| NO_DATA.to_string()),
        background_img: draft.background_img.unwrap_or_else(|| NO_DATA.to_string()),
    }
}
