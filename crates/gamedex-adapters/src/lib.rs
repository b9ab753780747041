//! Source adapters: markup sanitization, CSV row-set loading, and the
//! per-product document assembler.

use std::collections::HashMap;
use std::path::Path;

use scraper::Html;
use thiserror::Error;
use tracing::warn;

use gamedex_core::{normalize, split_delimited, AppId, ProductDocument, ProductDraft, NO_DATA};

pub const CRATE_NAME: &str = "gamedex-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("source `{source_id}` unavailable at {path}: {cause}")]
    SourceUnavailable {
        source_id: String,
        path: String,
        #[source]
        cause: csv::Error,
    },
    #[error("product {appid} missing from mandatory source `{source_id}`")]
    MissingJoin { appid: AppId, source_id: String },
}

/// Extracts visible text from markup, discarding tags and attributes.
/// Plain text passes through unchanged.
pub fn strip_markup(raw: &str) -> String {
    Html::parse_fragment(raw).root_element().text().collect()
}

const MINIMUM_LABEL: &str = " minimum: ";

/// Full requirements cleanup: tag stripping, removal of literal and
/// escaped newline/tab/return characters, apostrophes and curly braces
/// to spaces (container-literal text leaks into requirement strings),
/// repeated `minimum:` label collapse, and whitespace normalization.
/// Total over arbitrary text; never fails.
pub fn sanitize(raw: &str) -> String {
    let mut cleaned = strip_markup(raw).replace(['\n', '\t', '\r'], "");
    for escape in ["\\n", "\\t", "\\r"] {
        cleaned = cleaned.replace(escape, "");
    }
    let cleaned: String = cleaned
        .chars()
        .map(|c| if matches!(c, '\'' | '{' | '}') { ' ' } else { c })
        .collect();
    let cleaned = collapse_minimum_label(&cleaned);
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// The source data sometimes repeats the ` minimum: ` label verbatim;
/// only the first occurrence is retained.
fn collapse_minimum_label(text: &str) -> String {
    match text.find(MINIMUM_LABEL) {
        Some(pos) => {
            let (head, tail) = text.split_at(pos + MINIMUM_LABEL.len());
            format!("{head}{}", tail.replace(MINIMUM_LABEL, " "))
        }
        None => text.to_string(),
    }
}

/// Loosely-typed scalar cell. `Missing` is the single explicit marker
/// for an empty cell; the missing-to-default mapping happens only in
/// the default-filler.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Text(String),
    Missing,
}

impl RawValue {
    fn from_cell(cell: &str) -> Self {
        if cell.is_empty() {
            RawValue::Missing
        } else {
            RawValue::Text(cell.to_string())
        }
    }
}

/// One loosely-typed source row: column name to scalar cell.
#[derive(Debug, Clone, Default)]
pub struct RawRow {
    columns: HashMap<String, RawValue>,
}

impl RawRow {
    pub fn from_columns(columns: impl IntoIterator<Item = (String, RawValue)>) -> Self {
        Self {
            columns: columns.into_iter().collect(),
        }
    }

    /// Missing columns and missing cells both surface as `None`.
    pub fn text(&self, column: &str) -> Option<&str> {
        match self.columns.get(column) {
            Some(RawValue::Text(s)) => Some(s),
            _ => None,
        }
    }

    pub fn integer(&self, column: &str) -> Option<i64> {
        self.text(column)?.trim().parse().ok()
    }

    pub fn float(&self, column: &str) -> Option<f64> {
        let n: f64 = self.text(column)?.trim().parse().ok()?;
        n.is_finite().then_some(n)
    }
}

/// An in-memory keyed table: product identifier to first-seen row, with
/// source row order preserved for iteration.
#[derive(Debug)]
pub struct KeyedTable {
    source_id: String,
    order: Vec<AppId>,
    rows: HashMap<AppId, RawRow>,
}

impl KeyedTable {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            order: Vec::new(),
            rows: HashMap::new(),
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Keeps the first-seen row per identifier; later duplicates are
    /// ignored. Returns whether the row was kept.
    pub fn insert(&mut self, appid: AppId, row: RawRow) -> bool {
        if self.rows.contains_key(&appid) {
            return false;
        }
        self.order.push(appid);
        self.rows.insert(appid, row);
        true
    }

    pub fn get(&self, appid: AppId) -> Option<&RawRow> {
        self.rows.get(&appid)
    }

    pub fn iter(&self) -> impl Iterator<Item = (AppId, &RawRow)> {
        self.order.iter().map(|appid| (*appid, &self.rows[appid]))
    }
}

/// Reads a tabular source fully into memory. Column presence is not
/// validated here; missing columns surface as missing values downstream.
/// An unreadable source is fatal for the batch run.
pub fn load_keyed_table(
    source_id: &str,
    path: &Path,
    key_column: &str,
) -> Result<KeyedTable, AdapterError> {
    let unavailable = |cause: csv::Error| AdapterError::SourceUnavailable {
        source_id: source_id.to_string(),
        path: path.display().to_string(),
        cause,
    };

    let mut reader = csv::Reader::from_path(path).map_err(unavailable)?;
    let headers = reader.headers().map_err(unavailable)?.clone();

    let mut table = KeyedTable::new(source_id);
    for record in reader.records() {
        let record = record.map_err(unavailable)?;
        let row = RawRow::from_columns(headers.iter().enumerate().map(|(i, header)| {
            (
                header.to_string(),
                RawValue::from_cell(record.get(i).unwrap_or("")),
            )
        }));
        let Some(appid) = row.integer(key_column) else {
            warn!(source_id, key_column, "skipping row without a usable key");
            continue;
        };
        table.insert(appid, row);
    }
    Ok(table)
}

/// Joins auxiliary keyed tables onto each primary row and produces one
/// normalized candidate document per product.
#[derive(Debug)]
pub struct DocumentAssembler {
    descriptions: KeyedTable,
    requirements: KeyedTable,
    media: KeyedTable,
    support: KeyedTable,
}

impl DocumentAssembler {
    pub fn new(
        descriptions: KeyedTable,
        requirements: KeyedTable,
        media: KeyedTable,
        support: KeyedTable,
    ) -> Self {
        Self {
            descriptions,
            requirements,
            media,
            support,
        }
    }

    /// Builds the candidate document for one primary row. The
    /// description join is mandatory: a product absent from the
    /// description source aborts assembly for that product instead of
    /// defaulting, unlike the other auxiliary sources.
    pub fn assemble(&self, appid: AppId, primary: &RawRow) -> Result<ProductDocument, AdapterError> {
        let platforms = primary.text("platforms").map(split_delimited);
        let platform_list = platforms.clone().unwrap_or_default();

        let description_row =
            self.descriptions
                .get(appid)
                .ok_or_else(|| AdapterError::MissingJoin {
                    appid,
                    source_id: self.descriptions.source_id().to_string(),
                })?;

        let requirements_row = self.requirements.get(appid);
        let media_row = self.media.get(appid);
        let support_row = self.support.get(appid);

        Ok(normalize(ProductDraft {
            appid,
            name: primary.text("name").map(str::to_string),
            release_date: primary.text("release_date").map(str::to_string),
            developer: primary.text("developer").map(str::to_string),
            platforms,
            categories: primary.text("categories").map(split_delimited),
            genres: primary.text("genres").map(split_delimited),
            tags: primary.text("steamspy_tags").map(split_delimited),
            positive_ratings: primary.integer("positive_ratings"),
            negative_ratings: primary.integer("negative_ratings"),
            price: primary.float("price"),
            detailed_description: description_row
                .text("detailed_description")
                .map(strip_markup),
            windows_requirements: requirement_field(
                requirements_row,
                "pc_requirements",
                "windows",
                &platform_list,
            ),
            mac_requirements: requirement_field(
                requirements_row,
                "mac_requirements",
                "mac",
                &platform_list,
            ),
            linux_requirements: requirement_field(
                requirements_row,
                "linux_requirements",
                "linux",
                &platform_list,
            ),
            website: support_row.and_then(|r| r.text("website")).map(str::to_string),
            support_url: support_row
                .and_then(|r| r.text("support_url"))
                .map(str::to_string),
            header_img: media_row
                .and_then(|r| r.text("header_image"))
                .map(str::to_string),
            background_img: media_row
                .and_then(|r| r.text("background"))
                .map(str::to_string),
        }))
    }
}

/// A sanitized requirements value is accepted only if the platform
/// appears in the product's platform list and the cleaned text is not
/// the empty container literal `[]`; otherwise the sentinel is forced
/// even when upstream text existed.
fn requirement_field(
    row: Option<&RawRow>,
    column: &str,
    platform: &str,
    platforms: &[String],
) -> Option<String> {
    let raw = row?.text(column)?;
    let cleaned = sanitize(&raw.to_lowercase());
    if platforms.iter().any(|p| p == platform) && cleaned != "[]" {
        Some(cleaned)
    } else {
        Some(NO_DATA.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn row(pairs: &[(&str, &str)]) -> RawRow {
        RawRow::from_columns(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), RawValue::from_cell(v))),
        )
    }

    fn table(source_id: &str, rows: Vec<(AppId, RawRow)>) -> KeyedTable {
        let mut t = KeyedTable::new(source_id);
        for (appid, r) in rows {
            t.insert(appid, r);
        }
        t
    }

    fn assembler_with_description(appid: AppId, description: &str) -> DocumentAssembler {
        DocumentAssembler::new(
            table(
                "descriptions",
                vec![(appid, row(&[("detailed_description", description)]))],
            ),
            table("requirements", vec![]),
            table("media", vec![]),
            table("support", vec![]),
        )
    }

    #[test]
    fn sanitize_strips_tags() {
        assert_eq!(
            sanitize("<p><strong>Minimum:</strong> 8 GB RAM</p>"),
            "Minimum: 8 GB RAM"
        );
    }

    #[test]
    fn sanitize_removes_literal_and_escaped_control_characters() {
        assert_eq!(sanitize("a\nb\tc\rd"), "abcd");
        assert_eq!(sanitize("a\\nb\\tc\\rd"), "abcd");
    }

    #[test]
    fn sanitize_replaces_apostrophes_and_braces() {
        assert_eq!(sanitize("{'minimum': '4 GB'}"), "minimum : 4 GB");
    }

    #[test]
    fn sanitize_keeps_only_first_minimum_label() {
        assert_eq!(
            sanitize("requires minimum: 4 gb ram minimum: directx 9"),
            "requires minimum: 4 gb ram directx 9"
        );
    }

    #[test]
    fn sanitize_output_has_no_residue() {
        let nasty = [
            "<div>a</div>\n\n<span>b</span>",
            "x\\n\\t\\ry",
            "  spaced   out  ",
            "{'pc': 'stuff'}",
            "nan",
            "",
        ];
        for input in nasty {
            let out = sanitize(input);
            assert!(!out.contains('<') && !out.contains('>'), "tags in {out:?}");
            assert!(!out.contains("\\n") && !out.contains("\\t") && !out.contains("\\r"));
            assert!(!out.contains("  "), "whitespace run in {out:?}");
            assert_eq!(out, out.trim());
        }
    }

    #[test]
    fn strip_markup_passes_plain_text_through() {
        assert_eq!(strip_markup("just text"), "just text");
    }

    #[test]
    fn loader_keeps_first_seen_row_per_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("steam.csv");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "appid,name").unwrap();
        writeln!(file, "10,First").unwrap();
        writeln!(file, "10,Second").unwrap();
        writeln!(file, "20,Other").unwrap();
        drop(file);

        let t = load_keyed_table("steam", &path, "appid").unwrap();
        assert_eq!(t.len(), 2);
        assert_eq!(t.get(10).unwrap().text("name"), Some("First"));
        let order: Vec<AppId> = t.iter().map(|(id, _)| id).collect();
        assert_eq!(order, vec![10, 20]);
    }

    #[test]
    fn loader_marks_empty_cells_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("steam.csv");
        std::fs::write(&path, "appid,developer\n10,\n").unwrap();
        let t = load_keyed_table("steam", &path, "appid").unwrap();
        assert_eq!(t.get(10).unwrap().text("developer"), None);
    }

    #[test]
    fn unreadable_source_is_source_unavailable() {
        let err = load_keyed_table("steam", Path::new("/nonexistent/steam.csv"), "appid")
            .unwrap_err();
        assert!(matches!(err, AdapterError::SourceUnavailable { source_id, .. } if source_id == "steam"));
    }

    #[test]
    fn missing_description_join_is_fatal_for_the_product() {
        let assembler = DocumentAssembler::new(
            table("descriptions", vec![]),
            table("requirements", vec![]),
            table("media", vec![]),
            table("support", vec![]),
        );
        let err = assembler
            .assemble(1, &row(&[("name", "Ghost")]))
            .unwrap_err();
        assert!(matches!(err, AdapterError::MissingJoin { appid: 1, .. }));
    }

    #[test]
    fn optional_sources_degrade_to_sentinels() {
        let assembler = assembler_with_description(1, "A game.");
        let doc = assembler
            .assemble(
                1,
                &row(&[
                    ("name", "Solo"),
                    ("platforms", "windows"),
                    ("positive_ratings", "12"),
                    ("price", "4.5"),
                ]),
            )
            .unwrap();
        assert_eq!(doc.name, "Solo");
        assert_eq!(doc.positive_ratings, 12);
        assert_eq!(doc.price, 4.5);
        assert_eq!(doc.windows_requirements, NO_DATA);
        assert_eq!(doc.website, NO_DATA);
        assert_eq!(doc.header_img, NO_DATA);
    }

    #[test]
    fn requirements_respect_platform_membership() {
        let assembler = DocumentAssembler::new(
            table(
                "descriptions",
                vec![(1, row(&[("detailed_description", "desc")]))],
            ),
            table(
                "requirements",
                vec![(
                    1,
                    row(&[
                        ("pc_requirements", "<p>Minimum: Win 7</p>"),
                        ("mac_requirements", "<p>Minimum: 10.9</p>"),
                        ("linux_requirements", "[]"),
                    ]),
                )],
            ),
            table("media", vec![]),
            table("support", vec![]),
        );
        let doc = assembler
            .assemble(1, &row(&[("platforms", "windows;linux")]))
            .unwrap();
        // windows listed: sanitized lowercased content accepted
        assert_eq!(doc.windows_requirements, "minimum: win 7");
        // mac not in the platform list: sentinel despite upstream text
        assert_eq!(doc.mac_requirements, NO_DATA);
        // linux listed but empty-after-parsing: sentinel
        assert_eq!(doc.linux_requirements, NO_DATA);
    }

    #[test]
    fn media_and_support_join_directly() {
        let assembler = DocumentAssembler::new(
            table(
                "descriptions",
                vec![(1, row(&[("detailed_description", "<b>Rich</b> text")]))],
            ),
            table("requirements", vec![]),
            table(
                "media",
                vec![(
                    1,
                    row(&[
                        ("header_image", "http://img/header.jpg"),
                        ("background", "http://img/bg.jpg"),
                    ]),
                )],
            ),
            table(
                "support",
                vec![(1, row(&[("website", "http://example.com")]))],
            ),
        );
        let doc = assembler.assemble(1, &row(&[])).unwrap();
        assert_eq!(doc.detailed_description, "Rich text");
        assert_eq!(doc.header_img, "http://img/header.jpg");
        assert_eq!(doc.background_img, "http://img/bg.jpg");
        assert_eq!(doc.website, "http://example.com");
        assert_eq!(doc.support_url, NO_DATA);
    }

    #[test]
    fn classification_lists_split_in_order() {
        let assembler = assembler_with_description(1, "d");
        let doc = assembler
            .assemble(
                1,
                &row(&[
                    ("platforms", "windows;mac;linux"),
                    ("genres", "Action;Indie"),
                    ("categories", "Single-player"),
                    ("steamspy_tags", "RPG;Open World"),
                ]),
            )
            .unwrap();
        assert_eq!(doc.platforms, vec!["windows", "mac", "linux"]);
        assert_eq!(doc.genres, vec!["Action", "Indie"]);
        assert_eq!(doc.categories, vec!["Single-player"]);
        assert_eq!(doc.tags, vec!["RPG", "Open World"]);
    }
}
