//! Axum JSON API over the games catalog: filtered reads, writes by
//! identifier, aggregation reports, recommendations, bulk discounts,
//! and CSV export. Every endpoint is a thin composition of the store
//! gateway and aggregation engine; no business logic lives here.

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;

use gamedex_core::{catalog_schema, AppId, ProductDocument, PRIMARY_KEY};
use gamedex_ingest::GAMES_COLLECTION;
use gamedex_store::{Document, Expr, Filter, SharedCatalog, Stage, StoreError};

pub const CRATE_NAME: &str = "gamedex-web";

/// Bulk discounts never push a price below this floor (unless the
/// price already was).
pub const MIN_PRICE: f64 = 0.99;

#[derive(Clone)]
pub struct AppState {
    pub catalog: SharedCatalog,
}

impl AppState {
    pub fn new(catalog: SharedCatalog) -> Self {
        Self { catalog }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/games", get(list_games).post(create_game))
        .route(
            "/games/{appid}",
            get(get_game).put(replace_game).delete(delete_game),
        )
        .route("/recommendations/{name}", get(recommendations))
        .route("/reports/top-genres", get(top_genres))
        .route("/reports/price-by-year", get(price_by_year))
        .route("/reports/developer-genres", get(developer_genres))
        .route("/discount", post(discount))
        .route("/export", get(export_csv))
        .with_state(state)
}

pub async fn serve_from_env(state: AppState) -> anyhow::Result<()> {
    let port: u16 = std::env::var("GAMEDEX_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "serving games catalog");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

#[derive(Debug, Deserialize, Default)]
struct GamesQuery {
    name: Option<String>,
    developer: Option<String>,
    genre: Option<String>,
    tag: Option<String>,
    min_price: Option<f64>,
    max_price: Option<f64>,
    /// Comma-separated projection; empty means every field.
    fields: Option<String>,
}

impl GamesQuery {
    fn filter(&self) -> Filter {
        let mut filter = Filter::new();
        if let Some(name) = &self.name {
            filter = filter.eq("name", name.clone());
        }
        if let Some(developer) = &self.developer {
            filter = filter.eq("developer", developer.clone());
        }
        if let Some(genre) = &self.genre {
            filter = filter.contains_any("genres", vec![genre.clone()]);
        }
        if let Some(tag) = &self.tag {
            filter = filter.contains_any("tags", vec![tag.clone()]);
        }
        if let Some(bound) = self.min_price {
            filter = filter.gte("price", bound);
        }
        if let Some(bound) = self.max_price {
            filter = filter.lte("price", bound);
        }
        filter
    }

    fn projection(&self) -> Vec<String> {
        self.fields
            .as_deref()
            .map(|fields| {
                fields
                    .split(',')
                    .map(str::trim)
                    .filter(|f| !f.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Deserialize, Default)]
struct LimitQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct DiscountRequest {
    developer: String,
    percent: f64,
}

fn store_error(err: StoreError) -> Response {
    let status = match &err {
        StoreError::NotFound | StoreError::UnknownCollection(_) => StatusCode::NOT_FOUND,
        StoreError::SchemaViolation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        StoreError::DuplicateKey(_) | StoreError::DuplicateCollection(_) => StatusCode::CONFLICT,
    };
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": err.to_string() })),
    )
        .into_response()
}

async fn list_games(
    State(state): State<AppState>,
    Query(query): Query<GamesQuery>,
) -> Response {
    let guard = state.catalog.read();
    match guard.collection(GAMES_COLLECTION) {
        Ok(games) => Json(games.find(&query.filter(), &query.projection())).into_response(),
        Err(err) => store_error(err),
    }
}

async fn get_game(State(state): State<AppState>, AxumPath(appid): AxumPath<AppId>) -> Response {
    let guard = state.catalog.read();
    match guard.collection(GAMES_COLLECTION) {
        Ok(games) => match games.find_by_id(appid) {
            Some(doc) => Json(doc.clone()).into_response(),
            None => store_error(StoreError::NotFound),
        },
        Err(err) => store_error(err),
    }
}

async fn create_game(
    State(state): State<AppState>,
    Json(document): Json<ProductDocument>,
) -> Response {
    let mut guard = state.catalog.write();
    let games = match guard.collection_mut(GAMES_COLLECTION) {
        Ok(games) => games,
        Err(err) => return store_error(err),
    };
    match games.insert(document.into_document()) {
        Ok(()) => StatusCode::CREATED.into_response(),
        Err(err) => store_error(err),
    }
}

async fn replace_game(
    State(state): State<AppState>,
    AxumPath(appid): AxumPath<AppId>,
    Json(document): Json<ProductDocument>,
) -> Response {
    if document.appid != appid {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "identifier in path and body differ" })),
        )
            .into_response();
    }
    let mut guard = state.catalog.write();
    let games = match guard.collection_mut(GAMES_COLLECTION) {
        Ok(games) => games,
        Err(err) => return store_error(err),
    };
    match games.replace(document.into_document()) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => store_error(err),
    }
}

async fn delete_game(State(state): State<AppState>, AxumPath(appid): AxumPath<AppId>) -> Response {
    let mut guard = state.catalog.write();
    let games = match guard.collection_mut(GAMES_COLLECTION) {
        Ok(games) => games,
        Err(err) => return store_error(err),
    };
    match games.delete(&Filter::new().eq(PRIMARY_KEY, appid)) {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => store_error(err),
    }
}

/// Documents sharing at least one tag or genre with the named product,
/// the product itself excluded by name.
async fn recommendations(
    State(state): State<AppState>,
    AxumPath(name): AxumPath<String>,
) -> Response {
    let guard = state.catalog.read();
    let games = match guard.collection(GAMES_COLLECTION) {
        Ok(games) => games,
        Err(err) => return store_error(err),
    };
    let target = games
        .find(&Filter::new().eq("name", name.clone()), &[])
        .into_iter()
        .next();
    let Some(target) = target else {
        return store_error(StoreError::NotFound);
    };

    let string_list = |doc: &Document, field: &str| -> Vec<String> {
        doc.get(field)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    };
    let tags = string_list(&target, "tags");
    let genres = string_list(&target, "genres");

    let mut matched: Vec<Document> = Vec::new();
    for filter in [
        Filter::new().contains_any("tags", tags).ne("name", name.clone()),
        Filter::new().contains_any("genres", genres).ne("name", name.clone()),
    ] {
        for doc in games.find(&filter, &[]) {
            if !matched
                .iter()
                .any(|seen| seen.get(PRIMARY_KEY) == doc.get(PRIMARY_KEY))
            {
                matched.push(doc);
            }
        }
    }
    Json(matched).into_response()
}

async fn top_genres(State(state): State<AppState>, Query(query): Query<LimitQuery>) -> Response {
    run_report(
        &state,
        vec![
            Stage::Unwind { field: "genres".into() },
            Stage::GroupAvg {
                by: vec!["genres".into()],
                source: "positive_ratings".into(),
                output: "average_rating".into(),
            },
            Stage::Sort { field: "average_rating".into(), descending: true },
            Stage::Limit(query.limit.unwrap_or(5)),
        ],
    )
}

async fn price_by_year(State(state): State<AppState>) -> Response {
    run_report(
        &state,
        vec![
            Stage::AddField {
                name: "release_year".into(),
                expr: Expr::Prefix { field: "release_date".into(), len: 4 },
            },
            Stage::GroupAvg {
                by: vec!["release_year".into()],
                source: "price".into(),
                output: "average_price".into(),
            },
            Stage::Sort { field: "_id".into(), descending: false },
        ],
    )
}

async fn developer_genres(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Response {
    run_report(
        &state,
        vec![
            Stage::Unwind { field: "genres".into() },
            Stage::GroupAvg {
                by: vec!["developer".into(), "genres".into()],
                source: "positive_ratings".into(),
                output: "average_rating".into(),
            },
            Stage::Sort { field: "average_rating".into(), descending: true },
            Stage::Limit(query.limit.unwrap_or(10)),
        ],
    )
}

fn run_report(state: &AppState, pipeline: Vec<Stage>) -> Response {
    let guard = state.catalog.read();
    match guard.collection(GAMES_COLLECTION) {
        Ok(games) => Json(games.aggregate(&pipeline)).into_response(),
        Err(err) => store_error(err),
    }
}

/// Applies a percentage discount to every document of one developer,
/// floored at [`MIN_PRICE`]. The floor never raises a price that
/// already sat below it.
async fn discount(
    State(state): State<AppState>,
    Json(request): Json<DiscountRequest>,
) -> Response {
    let mut guard = state.catalog.write();
    let games = match guard.collection_mut(GAMES_COLLECTION) {
        Ok(games) => games,
        Err(err) => return store_error(err),
    };

    let filter = Filter::new().eq("developer", request.developer.clone());
    let targets: Vec<(AppId, f64)> = games
        .find(&filter, &[])
        .into_iter()
        .filter_map(|doc| {
            let appid = doc.get(PRIMARY_KEY)?.as_i64()?;
            let price = doc.get("price")?.as_f64()?;
            Some((appid, price))
        })
        .collect();
    if targets.is_empty() {
        return store_error(StoreError::NotFound);
    }

    let mut updated = 0usize;
    for (appid, price) in targets {
        let floor = MIN_PRICE.min(price);
        let discounted = (price * (1.0 - request.percent / 100.0)).max(floor);
        let rounded = (discounted * 100.0).round() / 100.0;
        let patch = Document::from_iter([("price".to_string(), Value::from(rounded))]);
        match games.update(&Filter::new().eq(PRIMARY_KEY, appid), &patch) {
            Ok(n) => updated += n,
            Err(err) => return store_error(err),
        }
    }
    Json(json!({ "updated": updated })).into_response()
}

async fn export_csv(State(state): State<AppState>, Query(query): Query<GamesQuery>) -> Response {
    let guard = state.catalog.read();
    let games = match guard.collection(GAMES_COLLECTION) {
        Ok(games) => games,
        Err(err) => return store_error(err),
    };
    let rows = games.find(&query.filter(), &query.projection());

    let columns: Vec<String> = {
        let projection = query.projection();
        if projection.is_empty() {
            catalog_schema().iter().map(|spec| spec.name.to_string()).collect()
        } else {
            projection
        }
    };

    match write_csv(&columns, &rows) {
        Ok(body) => (
            [
                (header::CONTENT_TYPE, "text/csv; charset=utf-8"),
                (
                    header::CONTENT_DISPOSITION,
                    "attachment; filename=\"games_export.csv\"",
                ),
            ],
            body,
        )
            .into_response(),
        Err(err) => server_error(err),
    }
}

fn write_csv(columns: &[String], rows: &[Document]) -> anyhow::Result<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(columns)?;
    for row in rows {
        let record: Vec<String> = columns
            .iter()
            .map(|column| csv_cell(row.get(column)))
            .collect();
        writer.write_record(&record)?;
    }
    let bytes = writer.into_inner()?;
    Ok(String::from_utf8(bytes)?)
}

fn csv_cell(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(";"),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use gamedex_core::{normalize, ProductDraft};
    use gamedex_store::Schema;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn game(appid: AppId, name: &str, developer: &str, genres: &[&str], tags: &[&str], positive: i64, price: f64, release: &str) -> ProductDocument {
        normalize(ProductDraft {
            appid,
            name: Some(name.to_string()),
            developer: Some(developer.to_string()),
            genres: Some(genres.iter().map(|s| s.to_string()).collect()),
            tags: Some(tags.iter().map(|s| s.to_string()).collect()),
            positive_ratings: Some(positive),
            price: Some(price),
            release_date: Some(release.to_string()),
            ..Default::default()
        })
    }

    fn seeded_state() -> AppState {
        let catalog = SharedCatalog::new();
        {
            let mut guard = catalog.write();
            guard
                .create_collection(GAMES_COLLECTION, Schema::new(PRIMARY_KEY, catalog_schema()))
                .unwrap();
            let games = guard.collection_mut(GAMES_COLLECTION).unwrap();
            for doc in [
                game(1, "Counter-Strike", "Valve", &["Action"], &["FPS", "Action"], 100, 10.0, "2000-11-01"),
                game(2, "Half-Life", "Valve", &["Action"], &["FPS"], 50, 20.0, "1998-11-08"),
                game(3, "Stardew Valley", "ConcernedApe", &["Simulation", "RPG"], &["Farming", "RPG"], 200, 1.0, "2016-02-26"),
                game(4, "The Witcher 3", "CD Projekt", &["RPG"], &["Open World"], 180, 30.0, "2015-05-18"),
            ] {
                games.insert(doc.into_document()).unwrap();
            }
        }
        AppState::new(catalog)
    }

    async fn body_json(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn get_request(uri: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn json_request(method: &str, uri: &str, body: &Value) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(body).unwrap()))
            .unwrap()
    }

    #[tokio::test]
    async fn get_game_by_identifier() {
        let app = app(seeded_state());
        let response = app.oneshot(get_request("/games/1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["name"], "Counter-Strike");
    }

    #[tokio::test]
    async fn get_missing_game_is_not_found() {
        let app = app(seeded_state());
        let response = app.oneshot(get_request("/games/999")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn list_games_with_price_range_and_projection() {
        let app = app(seeded_state());
        let response = app
            .oneshot(get_request("/games?min_price=5&max_price=15&fields=name,price"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let rows = body.as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0], json!({"name": "Counter-Strike", "price": 10.0}));
    }

    #[tokio::test]
    async fn create_rejects_schema_violations() {
        let app = app(seeded_state());
        let mut doc = serde_json::to_value(game(5, "Broken", "Dev", &[], &[], 0, 1.0, "2020")).unwrap();
        doc["price"] = json!(-2.0);
        let response = app
            .oneshot(json_request("POST", "/games", &doc))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn create_duplicate_identifier_conflicts() {
        let app = app(seeded_state());
        let doc = serde_json::to_value(game(1, "Clone", "Dev", &[], &[], 0, 1.0, "2020")).unwrap();
        let response = app
            .oneshot(json_request("POST", "/games", &doc))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn replace_and_delete_round_trip() {
        let state = seeded_state();
        let app = app(state.clone());
        let replacement =
            serde_json::to_value(game(2, "Half-Life", "Valve", &["Action"], &["FPS"], 60, 15.0, "1998-11-08")).unwrap();
        let response = app
            .clone()
            .oneshot(json_request("PUT", "/games/2", &replacement))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .method("DELETE")
                    .uri("/games/2")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app.oneshot(get_request("/games/2")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn rejected_replacement_preserves_the_original() {
        let app = app(seeded_state());
        let mut doc =
            serde_json::to_value(game(1, "Counter-Strike", "Valve", &["Action"], &["FPS", "Action"], 100, 10.0, "2000-11-01")).unwrap();
        doc["price"] = json!(-2.0);
        let response = app
            .clone()
            .oneshot(json_request("PUT", "/games/1", &doc))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let response = app.oneshot(get_request("/games/1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["price"].as_f64(), Some(10.0));
    }

    #[tokio::test]
    async fn top_genres_averages_ratings() {
        let app = app(seeded_state());
        let response = app.oneshot(get_request("/reports/top-genres")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let action = body
            .as_array()
            .unwrap()
            .iter()
            .find(|row| row["_id"] == "Action")
            .unwrap();
        assert_eq!(action["average_rating"].as_f64(), Some(75.0));
    }

    #[tokio::test]
    async fn price_by_year_sorts_ascending() {
        let app = app(seeded_state());
        let response = app.oneshot(get_request("/reports/price-by-year")).await.unwrap();
        let body = body_json(response).await;
        let years: Vec<String> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|row| row["_id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(years, vec!["1998", "2000", "2015", "2016"]);
    }

    #[tokio::test]
    async fn developer_genre_breakdown_uses_composite_keys() {
        let app = app(seeded_state());
        let response = app
            .oneshot(get_request("/reports/developer-genres?limit=20"))
            .await
            .unwrap();
        let body = body_json(response).await;
        let valve_action = body
            .as_array()
            .unwrap()
            .iter()
            .find(|row| row["_id"] == json!({"developer": "Valve", "genres": "Action"}))
            .unwrap();
        assert_eq!(valve_action["average_rating"].as_f64(), Some(75.0));
    }

    #[tokio::test]
    async fn recommendations_share_a_tag_or_genre_and_exclude_target() {
        let app = app(seeded_state());
        let response = app
            .oneshot(get_request("/recommendations/Stardew%20Valley"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let names: Vec<&str> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|row| row["name"].as_str().unwrap())
            .collect();
        // The Witcher 3 shares the RPG genre; the target itself is excluded.
        assert_eq!(names, vec!["The Witcher 3"]);
    }

    #[tokio::test]
    async fn discount_applies_percentage_with_floor() {
        let state = seeded_state();
        let app = app(state.clone());
        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/discount",
                &json!({"developer": "Valve", "percent": 50.0}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["updated"], 2);
        let response = app.clone().oneshot(get_request("/games/1")).await.unwrap();
        assert_eq!(body_json(response).await["price"].as_f64(), Some(5.0));

        // 99% off a 1.00 title floors at 0.99
        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/discount",
                &json!({"developer": "ConcernedApe", "percent": 99.0}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let response = app.oneshot(get_request("/games/3")).await.unwrap();
        assert_eq!(body_json(response).await["price"].as_f64(), Some(0.99));
    }

    #[tokio::test]
    async fn discount_for_unknown_developer_is_not_found() {
        let app = app(seeded_state());
        let response = app
            .oneshot(json_request(
                "POST",
                "/discount",
                &json!({"developer": "Nobody", "percent": 10.0}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn export_writes_csv_with_joined_lists() {
        let app = app(seeded_state());
        let response = app
            .oneshot(get_request("/export?developer=Valve&fields=name,tags,price"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/csv"));
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.starts_with("name,tags,price\n"));
        assert!(text.contains("Counter-Strike,FPS;Action,10.0"));
    }
}
