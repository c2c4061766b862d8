use std::path::PathBuf;

use axum::{
    extract::{multipart::MultipartRejection, Multipart, State},
    Json,
};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::{
    app::AppState,
    error::RelayError,
    region::{self, RegionDescriptor, Vertex},
    storage::{TempFiles, UploadStore},
};

const SIMILAR_DESIGNS_MESSAGE: &str = "Similar designs found!";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadImageResponse {
    pub image_url: String,
    pub polygons: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimilarDesignsResponse {
    pub image_url: String,
    pub message: String,
    pub features: Value,
    pub similar_designs: Vec<Value>,
}

/// Fields of an upload form. The image is already on disk by the time this is built.
#[derive(Debug, Default)]
struct UploadForm {
    image: Option<PathBuf>,
    area: Option<String>,
    is_polygon: Option<String>,
}

/// POST /api/upload-image
///
/// Stores the `image` field, optionally shrinks it, and relays it to the detection
/// service. Responds with `{ imageUrl, polygons }`.
pub async fn upload_image(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<UploadImageResponse>, RelayError> {
    let pipeline = tokio::spawn(async move {
        let mut temp = state.janitor.session();
        let result = detect_upload(&state, multipart, &mut temp).await;
        temp.finish();
        result
    });
    run_to_completion(pipeline).await.map(Json)
}

async fn detect_upload(
    state: &AppState,
    multipart: Result<Multipart, MultipartRejection>,
    temp: &mut TempFiles,
) -> Result<UploadImageResponse, RelayError> {
    let form = read_form(&state.store, multipart, temp).await?;
    let image = form.image.ok_or_else(no_image)?;

    let forwarded = if state.config.resize_before_detection {
        let size = state.config.detection_image_size;
        let source = image.clone();
        let resized = run_blocking(move || region::resize_for_detection(&source, size)).await?;
        temp.track(&resized);
        resized
    } else {
        image
    };

    let polygons = state.client.detect(&forwarded).await?;
    info!("Detection complete for {}", forwarded.display());

    Ok(UploadImageResponse {
        image_url: UploadStore::public_url(&forwarded),
        polygons,
    })
}

/// POST /api/generate-jersey
///
/// Crops the `image` field to the requested `area`, embeds the crop and looks up
/// similar catalogue designs.
///
/// # Form fields
/// - `image`: the uploaded photo (required)
/// - `area`: JSON array of `[x, y]` pairs, or `null` for the whole image
/// - `isPolygon`: JSON boolean; `true` masks the crop to the polygon outline
///
/// # Errors
/// - 400 if the image is missing, not an image, or the form fields are malformed
/// - 500 if cropping, feature extraction or a downstream call fails
pub async fn generate_jersey(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<SimilarDesignsResponse>, RelayError> {
    let pipeline = tokio::spawn(async move {
        let mut temp = state.janitor.session();
        let result = match_designs(&state, multipart, &mut temp).await;
        temp.finish();
        result
    });
    run_to_completion(pipeline).await.map(Json)
}

async fn match_designs(
    state: &AppState,
    multipart: Result<Multipart, MultipartRejection>,
    temp: &mut TempFiles,
) -> Result<SimilarDesignsResponse, RelayError> {
    let form = read_form(&state.store, multipart, temp).await?;
    let image = form.image.ok_or_else(no_image)?;

    let area = parse_area(form.area.as_deref())?;
    let is_polygon = parse_flag(form.is_polygon.as_deref(), "isPolygon")?;
    let descriptor = RegionDescriptor::from_request(area, is_polygon)?;
    debug!("Extracting {:?} from {}", descriptor, image.display());

    let roi = run_blocking(move || region::extract_region(&image, &descriptor)).await?;
    temp.track(&roi);

    let features = state.client.embed(&roi).await?;
    let similar_designs = state.client.search(&features).await?;
    info!(
        "Matched {} designs for {}",
        similar_designs.len(),
        roi.display()
    );

    Ok(SimilarDesignsResponse {
        image_url: UploadStore::public_url(&roi),
        message: SIMILAR_DESIGNS_MESSAGE.to_string(),
        features,
        similar_designs,
    })
}

/// GET /api/test
pub async fn test_status() -> Json<Value> {
    Json(json!({
        "message": "Server is working!",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "endpoints": ["/api/upload-image", "/api/generate-jersey", "/api/test"],
    }))
}

pub async fn health_check() -> Json<Value> {
    Json(json!({ "status": "OK" }))
}

fn no_image() -> RelayError {
    RelayError::InvalidInput("No image uploaded".into())
}

/// Drains the multipart body, saving the `image` field to the upload directory.
async fn read_form(
    store: &UploadStore,
    multipart: Result<Multipart, MultipartRejection>,
    temp: &mut TempFiles,
) -> Result<UploadForm, RelayError> {
    let mut multipart = multipart
        .map_err(|e| RelayError::InvalidInput(format!("Expected a multipart form: {}", e)))?;
    let mut form = UploadForm::default();

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some("image") => {
                if form.image.is_some() {
                    return Err(RelayError::InvalidInput(
                        "Only one image per request is accepted".into(),
                    ));
                }
                let content_type = field.content_type().unwrap_or_default().to_owned();
                if !content_type.starts_with("image/") {
                    return Err(RelayError::InvalidInput(
                        "Only image files are allowed!".into(),
                    ));
                }
                let file_name = field.file_name().map(str::to_owned);
                let bytes = field.bytes().await?;

                let path = store.save(file_name.as_deref(), &bytes).await?;
                temp.track(&path);
                debug!("Stored upload {} ({} bytes)", path.display(), bytes.len());
                form.image = Some(path);
            }
            Some("area") => form.area = Some(field.text().await?),
            Some("isPolygon") => form.is_polygon = Some(field.text().await?),
            _ => {}
        }
    }

    Ok(form)
}

/// `area` is JSON: an array of `[x, y]` pairs, or `null`.
fn parse_area(raw: Option<&str>) -> Result<Option<Vec<Vertex>>, RelayError> {
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some(text) => serde_json::from_str(text).map_err(|e| {
            RelayError::InvalidInput(format!("area must be a JSON array of [x, y] pairs: {}", e))
        }),
    }
}

fn parse_flag(raw: Option<&str>, field: &str) -> Result<bool, RelayError> {
    match raw.map(str::trim) {
        None | Some("") => Ok(false),
        Some(text) => serde_json::from_str(text)
            .map_err(|_| RelayError::InvalidInput(format!("{} must be true or false", field))),
    }
}

/// Awaits a request pipeline running on its own task.
///
/// The task keeps going if the client goes away, so its files always reach the janitor.
async fn run_to_completion<T>(
    pipeline: JoinHandle<Result<T, RelayError>>,
) -> Result<T, RelayError> {
    pipeline
        .await
        .map_err(|e| RelayError::Internal(format!("request pipeline failed: {}", e)))?
}

async fn run_blocking<F, T>(task: F) -> Result<T, RelayError>
where
    F: FnOnce() -> Result<T, RelayError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|e| RelayError::Extraction(format!("image task failed: {}", e)))?
}
