use std::path::{Path, PathBuf};

use image::{
    imageops::FilterType, io::Reader as ImageReader, DynamicImage, GenericImageView, GrayImage,
    ImageFormat, Luma,
};
use imageproc::{drawing::draw_polygon_mut, point::Point};
use tracing::{debug, warn};

use crate::error::RelayError;

/// A caller-supplied `[x, y]` pixel coordinate.
pub type Vertex = [f64; 2];

const MIN_POLYGON_VERTICES: usize = 3;

/// Which part of the uploaded image to keep.
#[derive(Debug, Clone, PartialEq)]
pub enum RegionDescriptor {
    /// Whole image, passed through untouched.
    None,
    /// No usable area was given; center-crop to a 4:3 / 3:4 aspect ratio.
    AspectFallback,
    /// Plain crop to the bounding box of the given points.
    Rectangle(Vec<Vertex>),
    /// Bounding-box crop with everything outside the polygon made transparent.
    Polygon(Vec<Vertex>),
}

impl RegionDescriptor {
    /// Interprets the `area` / `isPolygon` pair sent by the frontend.
    pub fn from_request(area: Option<Vec<Vertex>>, is_polygon: bool) -> Result<Self, RelayError> {
        let points = match area {
            None => return Ok(RegionDescriptor::None),
            Some(points) if points.is_empty() => return Ok(RegionDescriptor::AspectFallback),
            Some(points) => points,
        };

        if points.iter().flatten().any(|c| !c.is_finite()) {
            return Err(RelayError::InvalidInput(
                "area coordinates must be finite numbers".into(),
            ));
        }

        if is_polygon {
            if points.len() < MIN_POLYGON_VERTICES {
                return Err(RelayError::InvalidInput(format!(
                    "polygon area needs at least {} points, got {}",
                    MIN_POLYGON_VERTICES,
                    points.len()
                )));
            }
            Ok(RegionDescriptor::Polygon(points))
        } else {
            Ok(RegionDescriptor::Rectangle(points))
        }
    }
}

/// Axis-aligned crop window in source-image pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Bounding box of `points`, clamped to a `width`x`height` image and never smaller than 1x1.
///
/// Fails when the box lies entirely outside the image.
pub fn bounding_box(points: &[Vertex], width: u32, height: u32) -> Result<CropRect, RelayError> {
    if points.is_empty() {
        return Err(RelayError::Extraction("region has no points".into()));
    }

    let (mut min_x, mut min_y) = (f64::INFINITY, f64::INFINITY);
    let (mut max_x, mut max_y) = (f64::NEG_INFINITY, f64::NEG_INFINITY);
    for [x, y] in points {
        min_x = min_x.min(*x);
        min_y = min_y.min(*y);
        max_x = max_x.max(*x);
        max_y = max_y.max(*y);
    }

    let left = min_x.floor().max(0.0) as i64;
    let top = min_y.floor().max(0.0) as i64;
    let right = (max_x.ceil() as i64).min(width as i64);
    let bottom = (max_y.ceil() as i64).min(height as i64);

    if left >= width as i64 || top >= height as i64 || right < 0 || bottom < 0 {
        return Err(RelayError::Extraction(format!(
            "region ({}, {})-({}, {}) lies outside the {}x{} image",
            min_x, min_y, max_x, max_y, width, height
        )));
    }

    Ok(CropRect {
        x: left as u32,
        y: top as u32,
        width: (right - left).max(1) as u32,
        height: (bottom - top).max(1) as u32,
    })
}

/// Ideal 4:3 (landscape) or 3:4 (portrait) size before clamping to the image.
pub fn aspect_target(width: u32, height: u32) -> (u32, u32) {
    if width > height {
        (width, (width as f64 * 3.0 / 4.0).round() as u32)
    } else {
        ((height as f64 * 3.0 / 4.0).round() as u32, height)
    }
}

/// Centered aspect-ratio crop used when the caller gave an empty area.
pub fn fallback_crop(width: u32, height: u32) -> CropRect {
    let (target_width, target_height) = aspect_target(width, height);

    if width > height {
        let top = ((height as f64 - target_height as f64) / 2.0).round().max(0.0) as u32;
        CropRect {
            x: 0,
            y: top,
            width,
            height: target_height.min(height - top).max(1),
        }
    } else {
        let left = ((width as f64 - target_width as f64) / 2.0).round().max(0.0) as u32;
        CropRect {
            x: left,
            y: 0,
            width: target_width.min(width - left).max(1),
            height,
        }
    }
}

/// Produces the region-of-interest image for `source`.
///
/// Returns `source` itself for [`RegionDescriptor::None`]; otherwise writes exactly one
/// new file next to it and returns that path. The source file is never modified.
pub fn extract_region(source: &Path, region: &RegionDescriptor) -> Result<PathBuf, RelayError> {
    if *region == RegionDescriptor::None {
        return Ok(source.to_path_buf());
    }

    let image = load_image(source)?;
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(RelayError::Extraction(format!(
            "{} has no pixels",
            source.display()
        )));
    }

    let (format, ext) = output_format(source);
    match region {
        RegionDescriptor::None => Ok(source.to_path_buf()),
        RegionDescriptor::AspectFallback => {
            let rect = fallback_crop(width, height);
            let output = derived_path(source, "maxrect", ext);
            save_crop(&image, rect, &output, format)?;
            Ok(output)
        }
        RegionDescriptor::Rectangle(points) => {
            let rect = bounding_box(points, width, height)?;
            let output = derived_path(source, "rect", ext);
            save_crop(&image, rect, &output, format)?;
            Ok(output)
        }
        RegionDescriptor::Polygon(points) => {
            let rect = bounding_box(points, width, height)?;
            let mut cropped = image.crop_imm(rect.x, rect.y, rect.width, rect.height).to_rgba8();

            if let Some(mask) = polygon_mask(points, rect) {
                for (x, y, pixel) in cropped.enumerate_pixels_mut() {
                    if mask.get_pixel(x, y)[0] == 0 {
                        pixel[3] = 0;
                    }
                }
            }

            // PNG keeps the alpha channel regardless of the upload's format.
            let output = derived_path(source, "polygon", "png");
            save_image(&DynamicImage::ImageRgba8(cropped), &output, ImageFormat::Png)?;
            debug!("Polygon crop {:?} written to {}", rect, output.display());
            Ok(output)
        }
    }
}

/// Resizes `source` to a `size`x`size` square (cover fit) for the detection service.
pub fn resize_for_detection(source: &Path, size: u32) -> Result<PathBuf, RelayError> {
    let resized = load_image(source)?.resize_to_fill(size, size, FilterType::Lanczos3);

    let (format, ext) = output_format(source);
    let output = derived_path(source, "resized", ext);
    save_image(&resized, &output, format)?;
    Ok(output)
}

fn load_image(path: &Path) -> Result<DynamicImage, RelayError> {
    let reader = ImageReader::open(path)
        .and_then(|r| r.with_guessed_format())
        .map_err(|e| RelayError::Extraction(format!("cannot open {}: {}", path.display(), e)))?;
    Ok(reader.decode()?)
}

/// Rasterises the polygon into crop-local coordinates; `None` for zero-area outlines.
///
/// The outline is first clipped to a one-pixel margin around the crop, so far-away
/// vertices keep their edges' slopes inside the crop and integer coordinates stay small.
fn polygon_mask(points: &[Vertex], rect: CropRect) -> Option<GrayImage> {
    let local: Vec<Vertex> = points
        .iter()
        .map(|[x, y]| [x - rect.x as f64, y - rect.y as f64])
        .collect();
    let max_x = rect.width as f64 + 1.0;
    let max_y = rect.height as f64 + 1.0;
    let clipped = clip_axis(&local, 0, -1.0, false);
    let clipped = clip_axis(&clipped, 0, max_x, true);
    let clipped = clip_axis(&clipped, 1, -1.0, false);
    let clipped = clip_axis(&clipped, 1, max_y, true);

    let mut outline: Vec<Point<i32>> = Vec::with_capacity(clipped.len());
    for [x, y] in &clipped {
        let p = Point::new(x.round() as i32, y.round() as i32);
        if outline.last() != Some(&p) {
            outline.push(p);
        }
    }
    // draw_polygon_mut closes the outline itself and rejects an explicit closing vertex.
    while outline.len() > 1 && outline.first() == outline.last() {
        outline.pop();
    }
    if outline.len() < MIN_POLYGON_VERTICES {
        return None;
    }

    let mut mask = GrayImage::new(rect.width, rect.height);
    draw_polygon_mut(&mut mask, &outline, Luma([255u8]));
    Some(mask)
}

/// One Sutherland-Hodgman pass: keeps the part of a closed outline on one side of
/// `coord[axis] == bound` (`keep_below` selects `<=`, otherwise `>=`).
fn clip_axis(outline: &[Vertex], axis: usize, bound: f64, keep_below: bool) -> Vec<Vertex> {
    let inside = |p: &Vertex| {
        if keep_below {
            p[axis] <= bound
        } else {
            p[axis] >= bound
        }
    };

    let mut clipped = Vec::with_capacity(outline.len() + 2);
    for (i, current) in outline.iter().enumerate() {
        let previous = &outline[(i + outline.len() - 1) % outline.len()];
        if inside(current) != inside(previous) {
            let t = (bound - previous[axis]) / (current[axis] - previous[axis]);
            let other = 1 - axis;
            let mut crossing = [0.0; 2];
            crossing[axis] = bound;
            crossing[other] = previous[other] + t * (current[other] - previous[other]);
            clipped.push(crossing);
        }
        if inside(current) {
            clipped.push(*current);
        }
    }
    clipped
}

fn save_crop(
    image: &DynamicImage,
    rect: CropRect,
    output: &Path,
    format: ImageFormat,
) -> Result<(), RelayError> {
    let cropped = image.crop_imm(rect.x, rect.y, rect.width, rect.height);
    save_image(&cropped, output, format)?;
    debug!("Crop {:?} written to {}", rect, output.display());
    Ok(())
}

/// Encodes `image` to `output`, removing whatever was written if encoding fails.
fn save_image(image: &DynamicImage, output: &Path, format: ImageFormat) -> Result<(), RelayError> {
    let saved = if format == ImageFormat::Jpeg {
        DynamicImage::ImageRgb8(image.to_rgb8()).save_with_format(output, format)
    } else {
        image.save_with_format(output, format)
    };

    if let Err(e) = saved {
        match std::fs::remove_file(output) {
            Ok(()) => warn!("Removed partially written {}", output.display()),
            Err(rm) if rm.kind() == std::io::ErrorKind::NotFound => {}
            Err(rm) => warn!("Failed to remove partial {}: {}", output.display(), rm),
        }
        return Err(e.into());
    }
    Ok(())
}

/// Keeps the upload's format when we can encode it, PNG otherwise.
fn output_format(source: &Path) -> (ImageFormat, &'static str) {
    let ext = source
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    match ext.as_deref() {
        Some("jpg") => (ImageFormat::Jpeg, "jpg"),
        Some("jpeg") => (ImageFormat::Jpeg, "jpeg"),
        Some("gif") => (ImageFormat::Gif, "gif"),
        Some("bmp") => (ImageFormat::Bmp, "bmp"),
        Some("tif") => (ImageFormat::Tiff, "tif"),
        Some("tiff") => (ImageFormat::Tiff, "tiff"),
        _ => (ImageFormat::Png, "png"),
    }
}

fn derived_path(source: &Path, suffix: &str, ext: &str) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    source.with_file_name(format!("{}_{}.{}", stem, suffix, ext))
}
