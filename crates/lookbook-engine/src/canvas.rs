//! Masking and canvas model for manual edits: display-to-image coordinate
//! mapping, point hotspots, brush strokes rasterised into a mask, crop
//! rectangles and padded canvases for expansion.

use anyhow::{bail, Result};
use image::imageops::{self, FilterType};
use image::{DynamicImage, GenericImageView, GrayImage, Luma, Rgba, RgbaImage};
use lookbook_contracts::aspect::{parse_ratio, snap_aspect_ratio};
use serde::{Deserialize, Serialize};

use crate::data_url::DataUrl;

const MASK_ON: u8 = 255;
const MASK_OFF: u8 = 0;
const NEUTRAL_FILL: Rgba<u8> = Rgba([127, 127, 127, 255]);
/// Largest side a locally built or resized canvas may have.
pub const MAX_RESIZE_SIDE: u32 = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Maps between the on-screen rectangle an image is drawn into and the
/// image's natural pixel grid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewTransform {
    pub natural: (u32, u32),
    pub display: (f64, f64),
    pub offset: (f64, f64),
}

impl ViewTransform {
    pub fn new(natural: (u32, u32), display: (f64, f64), offset: (f64, f64)) -> Result<Self> {
        if natural.0 == 0 || natural.1 == 0 {
            bail!("image has no pixels");
        }
        if !(display.0 > 0.0 && display.1 > 0.0) {
            bail!("display size must be positive");
        }
        Ok(Self {
            natural,
            display,
            offset,
        })
    }

    /// Letterboxes the image inside `viewport`, preserving its aspect ratio.
    pub fn fit(natural: (u32, u32), viewport: (f64, f64)) -> Result<Self> {
        if natural.0 == 0 || natural.1 == 0 {
            bail!("image has no pixels");
        }
        let scale = (viewport.0 / natural.0 as f64).min(viewport.1 / natural.1 as f64);
        let display = (natural.0 as f64 * scale, natural.1 as f64 * scale);
        let offset = ((viewport.0 - display.0) / 2.0, (viewport.1 - display.1) / 2.0);
        Self::new(natural, display, offset)
    }

    fn scale(&self) -> (f64, f64) {
        (
            self.natural.0 as f64 / self.display.0,
            self.natural.1 as f64 / self.display.1,
        )
    }

    /// Display coordinates to image pixels, clamped onto the image.
    pub fn to_image(&self, point: Point) -> Point {
        let (sx, sy) = self.scale();
        Point {
            x: ((point.x - self.offset.0) * sx).clamp(0.0, (self.natural.0 - 1) as f64),
            y: ((point.y - self.offset.1) * sy).clamp(0.0, (self.natural.1 - 1) as f64),
        }
    }

    pub fn to_display(&self, point: Point) -> Point {
        let (sx, sy) = self.scale();
        Point {
            x: point.x / sx + self.offset.0,
            y: point.y / sy + self.offset.1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hotspot {
    pub x: u32,
    pub y: u32,
}

impl Hotspot {
    pub fn new(x: f64, y: f64, dims: (u32, u32)) -> Result<Self> {
        if !x.is_finite() || !y.is_finite() || x < 0.0 || y < 0.0 {
            bail!("point ({x}, {y}) is outside the image");
        }
        let (px, py) = (x.floor() as u32, y.floor() as u32);
        if px >= dims.0 || py >= dims.1 {
            bail!(
                "point ({x}, {y}) is outside the {}x{} image",
                dims.0,
                dims.1
            );
        }
        Ok(Self { x: px, y: py })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stroke {
    pub points: Vec<Point>,
    pub radius: f64,
    pub erase: bool,
}

/// Single-channel mask the size of the image. White is editable, black is
/// protected.
#[derive(Debug, Clone, PartialEq)]
pub struct MaskCanvas {
    mask: GrayImage,
}

impl MaskCanvas {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            mask: GrayImage::new(width.max(1), height.max(1)),
        }
    }

    /// Loads an uploaded mask, scaled to `dims` and thresholded at mid grey.
    pub fn from_image(image: &DynamicImage, dims: (u32, u32)) -> Self {
        let mut gray = image.to_luma8();
        if gray.dimensions() != dims {
            gray = imageops::resize(&gray, dims.0.max(1), dims.1.max(1), FilterType::Nearest);
        }
        for pixel in gray.pixels_mut() {
            pixel.0[0] = if pixel.0[0] >= 128 { MASK_ON } else { MASK_OFF };
        }
        Self { mask: gray }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.mask.dimensions()
    }

    /// Stamps discs along each segment every `radius / 2` pixels.
    pub fn apply_stroke(&mut self, stroke: &Stroke) {
        let radius = stroke.radius.max(0.5);
        let value = if stroke.erase { MASK_OFF } else { MASK_ON };
        let Some(first) = stroke.points.first() else {
            return;
        };
        self.stamp(*first, radius, value);
        let spacing = (radius / 2.0).max(0.5);
        for segment in stroke.points.windows(2) {
            let (start, end) = (segment[0], segment[1]);
            let distance = ((end.x - start.x).powi(2) + (end.y - start.y).powi(2)).sqrt();
            let steps = (distance / spacing).ceil().max(1.0) as u32;
            for step in 1..=steps {
                let t = step as f64 / steps as f64;
                let point = Point::new(
                    start.x + (end.x - start.x) * t,
                    start.y + (end.y - start.y) * t,
                );
                self.stamp(point, radius, value);
            }
        }
    }

    fn stamp(&mut self, center: Point, radius: f64, value: u8) {
        let (width, height) = self.mask.dimensions();
        let min_x = (center.x - radius).floor().max(0.0) as u32;
        let min_y = (center.y - radius).floor().max(0.0) as u32;
        let max_x = (center.x + radius).ceil().min((width - 1) as f64);
        let max_y = (center.y + radius).ceil().min((height - 1) as f64);
        if max_x < 0.0 || max_y < 0.0 {
            return;
        }
        let radius_sq = radius * radius;
        for y in min_y..=max_y as u32 {
            for x in min_x..=max_x as u32 {
                let dx = x as f64 - center.x;
                let dy = y as f64 - center.y;
                if dx * dx + dy * dy <= radius_sq {
                    self.mask.put_pixel(x, y, Luma([value]));
                }
            }
        }
    }

    pub fn coverage(&self) -> f64 {
        let total = self.mask.width() as u64 * self.mask.height() as u64;
        if total == 0 {
            return 0.0;
        }
        let on = self
            .mask
            .pixels()
            .filter(|pixel| pixel.0[0] >= 128)
            .count() as u64;
        on as f64 / total as f64
    }

    pub fn is_empty(&self) -> bool {
        self.mask.pixels().all(|pixel| pixel.0[0] < 128)
    }

    pub fn invert(&mut self) {
        for pixel in self.mask.pixels_mut() {
            pixel.0[0] = if pixel.0[0] >= 128 { MASK_OFF } else { MASK_ON };
        }
    }

    pub fn clear(&mut self) {
        for pixel in self.mask.pixels_mut() {
            pixel.0[0] = MASK_OFF;
        }
    }

    pub fn is_editable(&self, x: u32, y: u32) -> bool {
        self.mask
            .get_pixel_checked(x, y)
            .map(|pixel| pixel.0[0] >= 128)
            .unwrap_or(false)
    }

    pub fn to_data_url(&self) -> Result<DataUrl> {
        DataUrl::from_image(&DynamicImage::ImageLuma8(self.mask.clone()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl CropRect {
    /// Intersects the requested rectangle with the image; an empty
    /// intersection is an error.
    pub fn clamped(x: f64, y: f64, width: f64, height: f64, dims: (u32, u32)) -> Result<Self> {
        let values = [x, y, width, height];
        if values.iter().any(|value| !value.is_finite()) {
            bail!("crop rectangle must be finite");
        }
        let left = x.max(0.0).min(dims.0 as f64);
        let top = y.max(0.0).min(dims.1 as f64);
        let right = (x + width).max(0.0).min(dims.0 as f64);
        let bottom = (y + height).max(0.0).min(dims.1 as f64);
        let rect = Self {
            x: left.round() as u32,
            y: top.round() as u32,
            width: (right - left).round().max(0.0) as u32,
            height: (bottom - top).round().max(0.0) as u32,
        };
        if rect.width == 0 || rect.height == 0 {
            bail!("crop rectangle has zero area inside the {}x{} image", dims.0, dims.1);
        }
        Ok(rect)
    }

    pub fn apply(&self, image: &DynamicImage) -> DynamicImage {
        image.crop_imm(self.x, self.y, self.width, self.height)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    Whole,
    Point(Hotspot),
    Mask(MaskCanvas),
}

impl Selection {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Whole => "whole",
            Self::Point(_) => "point",
            Self::Mask(_) => "mask",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Padding {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpandSpec {
    ToRatio(String),
    Padding(Padding),
}

#[derive(Debug, Clone)]
pub struct ExpandedCanvas {
    pub image: DynamicImage,
    /// Where the source image sits inside the padded canvas.
    pub original: CropRect,
    pub aspect_ratio: String,
    pub warnings: Vec<String>,
}

impl ExpandSpec {
    pub fn padding_for(&self, dims: (u32, u32)) -> Result<Padding> {
        match self {
            Self::Padding(padding) => Ok(*padding),
            Self::ToRatio(raw) => {
                let Some(snapped) = snap_aspect_ratio(raw) else {
                    bail!("unrecognised aspect ratio '{raw}'");
                };
                let Some((left, right)) = parse_ratio(&snapped.ratio) else {
                    bail!("unrecognised aspect ratio '{raw}'");
                };
                let target = left as f64 / right as f64;
                let (width, height) = (dims.0 as f64, dims.1 as f64);
                if width / height < target {
                    let extra = ((height * target).round() - width).max(0.0) as u32;
                    Ok(Padding {
                        left: extra / 2,
                        right: extra - extra / 2,
                        ..Padding::default()
                    })
                } else {
                    let extra = ((width / target).round() - height).max(0.0) as u32;
                    Ok(Padding {
                        top: extra / 2,
                        bottom: extra - extra / 2,
                        ..Padding::default()
                    })
                }
            }
        }
    }

    pub fn build(&self, source: &DynamicImage) -> Result<ExpandedCanvas> {
        let dims = source.dimensions();
        let padding = self.padding_for(dims)?;
        if padding == Padding::default() {
            bail!("image is already at the requested shape; nothing to expand");
        }
        let width = dims
            .0
            .checked_add(padding.left)
            .and_then(|value| value.checked_add(padding.right));
        let height = dims
            .1
            .checked_add(padding.top)
            .and_then(|value| value.checked_add(padding.bottom));
        let (Some(width), Some(height)) = (width, height) else {
            bail!("expanded canvas would exceed {MAX_RESIZE_SIDE} pixels per side");
        };
        if width > MAX_RESIZE_SIDE || height > MAX_RESIZE_SIDE {
            bail!(
                "expanded canvas {width}x{height} exceeds {MAX_RESIZE_SIDE} pixels per side"
            );
        }
        let mut canvas = RgbaImage::from_pixel(width, height, NEUTRAL_FILL);
        imageops::overlay(
            &mut canvas,
            &source.to_rgba8(),
            padding.left as i64,
            padding.top as i64,
        );

        let mut warnings = Vec::new();
        let requested = match self {
            Self::ToRatio(raw) => raw.clone(),
            Self::Padding(_) => format!("{width}x{height}"),
        };
        let aspect_ratio = match snap_aspect_ratio(&requested) {
            Some(snapped) => {
                warnings.extend(snapped.warning);
                snapped.ratio
            }
            None => "1:1".to_string(),
        };
        Ok(ExpandedCanvas {
            image: DynamicImage::ImageRgba8(canvas),
            original: CropRect {
                x: padding.left,
                y: padding.top,
                width: dims.0,
                height: dims.1,
            },
            aspect_ratio,
            warnings,
        })
    }
}

#[cfg(test)]
mod tests {
    use image::{DynamicImage, GenericImageView, GrayImage, Luma, Rgb, RgbImage};

    use super::*;

    #[test]
    fn view_transform_maps_both_ways_and_clamps() -> anyhow::Result<()> {
        let view = ViewTransform::fit((2000, 1000), (500.0, 500.0))?;
        assert_eq!(view.display, (500.0, 250.0));
        assert_eq!(view.offset, (0.0, 125.0));

        let image = view.to_image(Point::new(250.0, 250.0));
        assert_eq!(image, Point::new(1000.0, 500.0));
        assert_eq!(view.to_display(image), Point::new(250.0, 250.0));

        let outside = view.to_image(Point::new(-20.0, 900.0));
        assert_eq!(outside, Point::new(0.0, 999.0));
        assert!(ViewTransform::new((10, 10), (0.0, 5.0), (0.0, 0.0)).is_err());
        Ok(())
    }

    #[test]
    fn hotspot_must_be_inside_image() {
        assert_eq!(
            Hotspot::new(9.7, 0.0, (10, 10)).ok(),
            Some(Hotspot { x: 9, y: 0 })
        );
        assert!(Hotspot::new(10.0, 0.0, (10, 10)).is_err());
        assert!(Hotspot::new(-1.0, 3.0, (10, 10)).is_err());
    }

    #[test]
    fn strokes_paint_and_erase_continuous_lines() {
        let mut mask = MaskCanvas::new(100, 20);
        assert!(mask.is_empty());
        mask.apply_stroke(&Stroke {
            points: vec![Point::new(5.0, 10.0), Point::new(95.0, 10.0)],
            radius: 4.0,
            erase: false,
        });
        for x in 5..=95 {
            assert!(mask.is_editable(x, 10), "gap at x={x}");
        }
        assert!(!mask.is_editable(50, 0));
        let painted = mask.coverage();
        assert!(painted > 0.0 && painted < 1.0);

        mask.apply_stroke(&Stroke {
            points: vec![Point::new(50.0, 10.0)],
            radius: 6.0,
            erase: true,
        });
        assert!(!mask.is_editable(50, 10));
        assert!(mask.coverage() < painted);
    }

    #[test]
    fn invert_clear_and_export() -> anyhow::Result<()> {
        let mut mask = MaskCanvas::new(4, 4);
        mask.invert();
        assert_eq!(mask.coverage(), 1.0);
        let url = mask.to_data_url()?;
        assert_eq!(url.mime, "image/png");
        let decoded = url.decode_image()?.to_luma8();
        assert_eq!(decoded.get_pixel(0, 0).0[0], 255);
        mask.clear();
        assert!(mask.is_empty());
        Ok(())
    }

    #[test]
    fn uploaded_masks_are_scaled_and_thresholded() {
        let mut gray = GrayImage::new(2, 2);
        gray.put_pixel(0, 0, Luma([200]));
        gray.put_pixel(1, 1, Luma([90]));
        let mask = MaskCanvas::from_image(&DynamicImage::ImageLuma8(gray), (4, 4));
        assert_eq!(mask.dimensions(), (4, 4));
        assert!(mask.is_editable(0, 0));
        assert!(!mask.is_editable(3, 3));
        assert_eq!(mask.coverage(), 0.25);
    }

    #[test]
    fn crop_rect_is_clamped_to_image() -> anyhow::Result<()> {
        let rect = CropRect::clamped(-10.0, 20.0, 60.0, 500.0, (100, 200))?;
        assert_eq!(
            rect,
            CropRect {
                x: 0,
                y: 20,
                width: 50,
                height: 180
            }
        );
        assert!(CropRect::clamped(100.0, 0.0, 10.0, 10.0, (100, 200)).is_err());

        let image = DynamicImage::ImageRgb8(RgbImage::new(100, 200));
        assert_eq!(rect.apply(&image).dimensions(), (50, 180));
        Ok(())
    }

    #[test]
    fn expand_to_ratio_pads_evenly() -> anyhow::Result<()> {
        let source = DynamicImage::ImageRgb8(RgbImage::from_pixel(300, 400, Rgb([255, 0, 0])));
        let expanded = ExpandSpec::ToRatio("1:1".to_string()).build(&source)?;
        assert_eq!(expanded.image.dimensions(), (400, 400));
        assert_eq!(
            expanded.original,
            CropRect {
                x: 50,
                y: 0,
                width: 300,
                height: 400
            }
        );
        assert_eq!(expanded.aspect_ratio, "1:1");
        assert_eq!(expanded.image.get_pixel(0, 0).0, [127, 127, 127, 255]);
        assert_eq!(expanded.image.get_pixel(200, 200).0, [255, 0, 0, 255]);

        let tall = ExpandSpec::ToRatio("9:16".to_string()).build(&source)?;
        assert_eq!(tall.image.dimensions(), (300, 533));
        assert_eq!(tall.original.y, 66);

        assert!(ExpandSpec::ToRatio("3:4".to_string()).build(&source).is_err());
        assert!(ExpandSpec::ToRatio("huge".to_string()).build(&source).is_err());
        Ok(())
    }

    #[test]
    fn explicit_padding_is_used_as_given() -> anyhow::Result<()> {
        let source = DynamicImage::ImageRgb8(RgbImage::new(100, 100));
        let expanded = ExpandSpec::Padding(Padding {
            left: 0,
            top: 10,
            right: 30,
            bottom: 0,
        })
        .build(&source)?;
        assert_eq!(expanded.image.dimensions(), (130, 110));
        assert_eq!((expanded.original.x, expanded.original.y), (0, 10));
        Ok(())
    }

    #[test]
    fn oversized_padding_is_rejected() {
        let source = DynamicImage::ImageRgb8(RgbImage::new(4, 4));
        let overflow = ExpandSpec::Padding(Padding {
            left: u32::MAX - 1,
            right: 10,
            ..Padding::default()
        });
        assert!(overflow.build(&source).is_err());

        let too_tall = ExpandSpec::Padding(Padding {
            top: MAX_RESIZE_SIDE,
            ..Padding::default()
        });
        assert!(too_tall.build(&source).is_err());

        let at_limit = ExpandSpec::Padding(Padding {
            top: MAX_RESIZE_SIDE - 4,
            ..Padding::default()
        });
        assert!(at_limit
            .build(&source)
            .is_ok_and(|canvas| canvas.image.dimensions() == (4, MAX_RESIZE_SIDE)));
    }
}
